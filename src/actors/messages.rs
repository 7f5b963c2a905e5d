//! Message types for actor communication
//!
//! ## Design Principles
//!
//! 1. **Commands**: request/response messages sent to the sink supervisor via mpsc
//! 2. **Mailboxes**: rule set updates travel through a latest-value-wins slot
//!    ([`crate::mailbox`]), never through a queue
//! 3. **Exits**: every poll loop reports how it finished so its supervisor can
//!    keep the tick schedule or restart it

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::SinkError;

/// One count taken for a rule, handed to the sink supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSample {
    pub rule_name: String,
    pub value: u64,

    /// When the count was taken
    pub timestamp: DateTime<Utc>,
}

impl MetricSample {
    pub fn now(rule_name: impl Into<String>, value: u64) -> Self {
        Self {
            rule_name: rule_name.into(),
            value,
            timestamp: Utc::now(),
        }
    }
}

/// Commands that can be sent to the SinkSupervisor actor
#[derive(Debug)]
pub enum SinkCommand {
    /// Run a health check immediately (bypassing the health ticker)
    ///
    /// Answered once any reconnect in progress has finished.
    CheckNow {
        respond_to: oneshot::Sender<Result<(), SinkError>>,
    },
}

/// Observable state of the sink connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkStatus {
    /// No usable connection; a reconnect is pending or running
    Connecting,

    /// Connection `epoch` is installed and accepting writes
    Ready { epoch: u64 },
}

/// Sink counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    /// Samples written successfully
    pub sent: u64,

    /// Samples dropped (write failed, or no connection was ready)
    pub dropped: u64,

    /// Writes that failed on the transport
    pub write_failures: u64,

    /// Health probes that failed or timed out
    pub probe_failures: u64,

    /// Successful connects, bootstrap included
    pub connects: u64,
}

/// How a poll loop finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopOutcome {
    /// Its generation was cancelled
    Cancelled,

    /// The loop panicked; the payload message is kept for the log
    Panicked(String),
}

/// Reported by every poll loop when it exits
#[derive(Debug, Clone)]
pub struct LoopExit {
    pub rule_name: String,

    /// When the loop would have ticked next, if it got far enough to know
    pub next_tick: Option<Instant>,

    pub outcome: LoopOutcome,
}
