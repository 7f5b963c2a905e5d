//! Rule sources feeding the query supervisors
//!
//! - [`StaticSource`]: rules from the config file, published exactly once
//! - [`RuleWatcher`]: rules discovered in a rule store and refreshed over time

use crate::mailbox::{MailboxReceiver, MailboxSender, mailbox};
use crate::rules::RuleSet;

use super::rule_watcher::RuleWatcher;

/// A fixed rule set known at startup
///
/// The source keeps its sender alive for as long as it exists, so its
/// supervisor never sees the mailbox close.
#[derive(Debug)]
pub struct StaticSource {
    name: String,
    mailbox: MailboxSender,
}

impl StaticSource {
    pub fn new(name: impl Into<String>, rules: RuleSet) -> Self {
        let (mailbox, _) = mailbox();
        mailbox.publish(rules);
        Self {
            name: name.into(),
            mailbox,
        }
    }
}

/// Where a query supervisor takes its rule sets from
pub enum RuleSource {
    Static(StaticSource),
    Watched(RuleWatcher),
}

impl RuleSource {
    pub fn name(&self) -> &str {
        match self {
            RuleSource::Static(source) => &source.name,
            RuleSource::Watched(watcher) => watcher.name(),
        }
    }

    pub fn subscribe(&self) -> MailboxReceiver {
        match self {
            RuleSource::Static(source) => source.mailbox.subscribe(),
            RuleSource::Watched(watcher) => watcher.subscribe(),
        }
    }
}
