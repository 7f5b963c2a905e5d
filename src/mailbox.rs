//! Single-slot, latest-value-wins mailbox for rule set updates
//!
//! Publishing never blocks. A value that has not been received yet is
//! overwritten by the next one, so a slow consumer only ever sees the most
//! recent snapshot.

use tokio::sync::watch;

use crate::rules::RuleSet;

/// Create a connected sender/receiver pair with an empty slot
pub fn mailbox() -> (MailboxSender, MailboxReceiver) {
    let (tx, rx) = watch::channel(None);
    (MailboxSender { tx }, MailboxReceiver { rx })
}

#[derive(Debug)]
pub struct MailboxSender {
    tx: watch::Sender<Option<RuleSet>>,
}

impl MailboxSender {
    /// Put `set` into the slot, replacing anything still pending
    pub fn publish(&self, set: RuleSet) {
        self.tx.send_replace(Some(set));
    }

    /// Publish `set` only if it differs from the last published value
    ///
    /// Returns whether the slot was updated.
    pub fn publish_if_changed(&self, set: RuleSet) -> bool {
        self.tx.send_if_modified(|current| {
            if current.as_ref() == Some(&set) {
                false
            } else {
                *current = Some(set);
                true
            }
        })
    }

    /// The last published value, delivered or not
    pub fn last(&self) -> Option<RuleSet> {
        self.tx.borrow().clone()
    }

    /// A new receiver that still sees the value currently in the slot
    pub fn subscribe(&self) -> MailboxReceiver {
        let mut rx = self.tx.subscribe();
        if rx.borrow().is_some() {
            rx.mark_changed();
        }
        MailboxReceiver { rx }
    }
}

#[derive(Debug)]
pub struct MailboxReceiver {
    rx: watch::Receiver<Option<RuleSet>>,
}

impl MailboxReceiver {
    /// Wait for the next unseen rule set
    ///
    /// Returns `None` once the sender is gone and nothing is pending.
    pub async fn recv(&mut self) -> Option<RuleSet> {
        loop {
            if self.rx.changed().await.is_err() {
                return None;
            }

            if let Some(set) = self.rx.borrow_and_update().clone() {
                return Some(set);
            }
        }
    }
}
