//! QuerySupervisor - Turns rule set snapshots into running poll loops
//!
//! There is one supervisor per rule source. It owns at most one active
//! generation: the rule set it was built from, one poll loop per rule, and
//! the cancellation token shared by those loops.
//!
//! ## Swapping Generations
//!
//! When a snapshot arrives that differs from the active set:
//!
//! 1. the active generation's token is cancelled
//! 2. every loop of that generation is joined
//! 3. only then is the new generation spawned
//!
//! No instant exists where loops of two generations run at the same time.
//! A rule that is identical in both sets resumes on the schedule its old
//! loop reported. New rules start one check interval out, staggered by
//! [`START_STAGGER`] so a large set does not hit the backend all at once.
//!
//! A snapshot equal to the active set is ignored and nothing is restarted.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::backend::QueryBackend;
use crate::mailbox::MailboxReceiver;
use crate::rules::{Rule, RuleSet};
use crate::util::panic_message;

use super::messages::{LoopExit, LoopOutcome};
use super::poll_loop::PollLoop;
use super::sink_supervisor::SinkHandle;

/// Spacing between the first ticks of newly added rules
pub const START_STAGGER: Duration = Duration::from_secs(1);

struct Generation {
    number: u64,
    rules: RuleSet,
    tasks: JoinSet<LoopExit>,
    token: CancellationToken,
}

pub struct QuerySupervisor {
    source: String,
    backend: Arc<dyn QueryBackend>,
    sink: SinkHandle,
    updates: MailboxReceiver,
    cancel: CancellationToken,
    active: Option<Generation>,
    generations: u64,
}

impl QuerySupervisor {
    pub fn new(
        source: impl Into<String>,
        backend: Arc<dyn QueryBackend>,
        sink: SinkHandle,
        updates: MailboxReceiver,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source: source.into(),
            backend,
            sink,
            updates,
            cancel,
            active: None,
            generations: 0,
        }
    }

    /// Run the supervisor's main loop until cancelled
    #[instrument(skip(self), fields(source = %self.source))]
    pub async fn run(mut self) {
        debug!("starting query supervisor");
        let mut source_open = true;

        loop {
            let has_loops = self
                .active
                .as_ref()
                .is_some_and(|generation| !generation.tasks.is_empty());

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    debug!("cancelled");
                    break;
                }

                update = self.updates.recv(), if source_open => {
                    match update {
                        Some(set) => self.apply(set).await,
                        None => {
                            debug!("rule source closed, keeping the active generation");
                            source_open = false;
                        }
                    }
                }

                Some(joined) = join_next(&mut self.active), if has_loops => {
                    self.handle_exit(joined);
                }
            }
        }

        self.retire().await;
        debug!("query supervisor stopped");
    }

    /// Replace the active generation with one built from `set`
    async fn apply(&mut self, set: RuleSet) {
        if let Some(active) = &self.active
            && active.rules == set
        {
            debug!("rule set unchanged, keeping generation {}", active.number);
            return;
        }

        let (previous, schedule) = match self.retire().await {
            Some((rules, schedule)) => (rules, schedule),
            None => (RuleSet::default(), HashMap::new()),
        };

        self.generations += 1;
        let number = self.generations;
        let token = self.cancel.child_token();
        let mut tasks = JoinSet::new();

        let now = Instant::now();
        let mut added: u32 = 0;
        let mut resumed = 0;

        for rule in set.iter() {
            let carried = (previous.get(&rule.name) == Some(rule))
                .then(|| schedule.get(&rule.name).copied())
                .flatten();

            let first_tick = match carried {
                Some(at) => {
                    resumed += 1;
                    at
                }
                None => {
                    let at = now + START_STAGGER * added + rule.check_interval;
                    added += 1;
                    at
                }
            };

            spawn_loop(
                &mut tasks,
                rule.clone(),
                first_tick,
                &self.backend,
                &self.sink,
                &token,
            );
        }

        debug!(rules = ?set.names().collect::<Vec<_>>(), "spawned generation {number}");
        info!(
            "generation {number} started with {} rules ({resumed} resumed, {added} new)",
            set.len()
        );

        self.active = Some(Generation {
            number,
            rules: set,
            tasks,
            token,
        });
    }

    /// Cancel and join the active generation
    ///
    /// Returns its rule set together with the next due tick of every loop
    /// that reported one.
    async fn retire(&mut self) -> Option<(RuleSet, HashMap<String, Instant>)> {
        let mut generation = self.active.take()?;
        generation.token.cancel();

        let mut schedule = HashMap::new();
        while let Some(joined) = generation.tasks.join_next().await {
            match joined {
                Ok(LoopExit {
                    rule_name,
                    next_tick: Some(at),
                    ..
                }) => {
                    schedule.insert(rule_name, at);
                }
                Ok(exit) => trace!(rule = %exit.rule_name, "loop exited without a schedule"),
                Err(e) => warn!("poll loop ended abnormally: {e}"),
            }
        }

        debug!("generation {} retired", generation.number);
        Some((generation.rules, schedule))
    }

    /// A loop of the active generation finished on its own
    fn handle_exit(&mut self, joined: Result<LoopExit, JoinError>) {
        let exit = match joined {
            Ok(exit) => exit,
            Err(e) => {
                error!("poll loop task failed: {e}");
                return;
            }
        };

        let LoopOutcome::Panicked(message) = exit.outcome else {
            trace!(rule = %exit.rule_name, "loop exited after cancellation");
            return;
        };

        let Some(generation) = self.active.as_mut() else {
            return;
        };
        if generation.token.is_cancelled() {
            return;
        }

        let Some(rule) = generation.rules.get(&exit.rule_name).cloned() else {
            return;
        };

        error!(rule = %rule.name, "poll loop panicked: {message}, restarting");
        let first_tick = Instant::now() + rule.check_interval;
        spawn_loop(
            &mut generation.tasks,
            rule,
            first_tick,
            &self.backend,
            &self.sink,
            &generation.token,
        );
    }
}

fn spawn_loop(
    tasks: &mut JoinSet<LoopExit>,
    rule: Rule,
    first_tick: Instant,
    backend: &Arc<dyn QueryBackend>,
    sink: &SinkHandle,
    token: &CancellationToken,
) {
    let rule_name = rule.name.clone();
    let poll = PollLoop::new(rule, backend.clone(), sink.clone(), first_tick);
    let token = token.clone();

    tasks.spawn(async move {
        match AssertUnwindSafe(poll.run(token)).catch_unwind().await {
            Ok(exit) => exit,
            Err(payload) => LoopExit {
                rule_name,
                next_tick: None,
                outcome: LoopOutcome::Panicked(panic_message(&*payload)),
            },
        }
    });
}

async fn join_next(active: &mut Option<Generation>) -> Option<Result<LoopExit, JoinError>> {
    match active {
        Some(generation) => generation.tasks.join_next().await,
        None => None,
    }
}
