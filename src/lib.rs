pub mod actors;
pub mod backend;
pub mod config;
pub mod elastic;
pub mod error;
pub mod graphite;
pub mod mailbox;
pub mod orchestrator;
pub mod rules;
pub mod util;
