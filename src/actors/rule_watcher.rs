//! RuleWatcher - Polls a rule store and publishes rule set changes
//!
//! Fetches once at startup and then every `watch_interval`. Each fetch is
//! bounded by the same interval so it never runs into the next one. A
//! failed fetch is logged and the previous rule set stays in effect.
//!
//! A new set is only published when it differs from the last one, so an
//! unchanged store never causes a generation swap downstream.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{MissedTickBehavior, interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::backend::RuleStore;
use crate::error::StoreError;
use crate::mailbox::{MailboxReceiver, MailboxSender, mailbox};
use crate::rules::{RuleSet, RuleTemplate};

pub struct RuleWatcher {
    name: String,
    store: Arc<dyn RuleStore>,
    template: RuleTemplate,
    title_prefix: String,
    watch_interval: Duration,
    mailbox: MailboxSender,
}

impl RuleWatcher {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn RuleStore>,
        template: RuleTemplate,
        title_prefix: impl Into<String>,
        watch_interval: Duration,
    ) -> Self {
        let (mailbox, _) = mailbox();
        Self {
            name: name.into(),
            store,
            template,
            title_prefix: title_prefix.into(),
            watch_interval,
            mailbox,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscribe(&self) -> MailboxReceiver {
        self.mailbox.subscribe()
    }

    /// Poll the store until cancelled
    #[instrument(skip_all, fields(source = %self.name))]
    pub async fn run(&self, cancel: CancellationToken) {
        debug!(
            "watching saved searches prefixed {:?} every {:?}",
            self.title_prefix, self.watch_interval
        );

        let mut ticker = interval(self.watch_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = self.poll_once() => {
                    if let Err(e) = result {
                        warn!("fetching rules failed, keeping the previous set: {e}");
                    }
                }
            }
        }

        debug!("rule watcher stopped");
    }

    /// Fetch once and publish the result if it changed
    ///
    /// Returns whether a new set was published.
    pub async fn poll_once(&self) -> Result<bool, StoreError> {
        let deadline = self.watch_interval;
        let queries = timeout(
            deadline,
            self.store.fetch_matching(&self.title_prefix, deadline),
        )
        .await
        .map_err(|_| StoreError::Timeout(deadline))??;

        let set = RuleSet::from_queries(&self.template, queries);
        let count = set.len();

        if self.mailbox.publish_if_changed(set) {
            info!("rule set changed, published {count} rules");
            Ok(true)
        } else {
            debug!("rule set unchanged ({count} rules)");
            Ok(false)
        }
    }
}
