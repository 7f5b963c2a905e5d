//! Actor-based polling engine
//!
//! Each actor runs as an independent async task. Rule sets travel through
//! latest-value mailboxes, samples go straight to the shared sink handle.
//!
//! ## Architecture Overview
//!
//! ```text
//!   StaticSource          RuleWatcher (per kibana)
//!        │                      │ publish_if_changed
//!        ▼                      ▼
//!    [mailbox]              [mailbox]          latest value wins
//!        │                      │
//!        ▼                      ▼
//!  QuerySupervisor        QuerySupervisor      one generation at a time
//!   │    │    │             │    │
//!   ▼    ▼    ▼             ▼    ▼
//!  PollLoop ...            PollLoop ...        one per rule
//!        │                      │
//!        └──────────┬───────────┘
//!                   ▼ SinkHandle::send
//!            SinkSupervisor                    health checks, reconnects
//!                   │
//!                   ▼
//!              graphite (TCP)
//! ```
//!
//! ## Communication Patterns
//!
//! 1. **Mailboxes**: rule set snapshots, never queued
//! 2. **Commands**: mpsc channel into the sink supervisor with oneshot replies
//! 3. **Cancellation**: one root token, a child per supervisor and per generation

pub mod messages;
pub mod poll_loop;
pub mod query_supervisor;
pub mod rule_source;
pub mod rule_watcher;
pub mod sink_supervisor;
