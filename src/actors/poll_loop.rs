//! PollLoop - Counts one rule on a fixed period
//!
//! Each tick queries the backend for the window `[now - interval, now]` and
//! hands the count to the sink. A failed or timed-out query skips that tick;
//! there is no retry inside a tick.
//!
//! Cancellation is checked before the query result is emitted, so a loop
//! that has been told to stop never publishes another sample. When a loop
//! is cancelled it reports the instant of its next due tick, which lets a
//! replacement loop for the same rule pick up the schedule.

use std::sync::Arc;

use tokio::time::{Instant, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::backend::{QueryBackend, TimeWindow};
use crate::error::{QueryError, SinkError};
use crate::rules::Rule;

use super::messages::{LoopExit, LoopOutcome, MetricSample};
use super::sink_supervisor::SinkHandle;

enum Tick {
    Completed,

    /// Cancelled before anything was emitted
    Cancelled,
}

pub struct PollLoop {
    rule: Rule,
    backend: Arc<dyn QueryBackend>,
    sink: SinkHandle,
    first_tick: Instant,
}

impl PollLoop {
    pub fn new(
        rule: Rule,
        backend: Arc<dyn QueryBackend>,
        sink: SinkHandle,
        first_tick: Instant,
    ) -> Self {
        Self {
            rule,
            backend,
            sink,
            first_tick,
        }
    }

    #[instrument(skip_all, fields(rule = %self.rule.name))]
    pub async fn run(self, cancel: CancellationToken) -> LoopExit {
        let period = self.rule.check_interval;
        let mut next_tick = self.first_tick;

        debug!(
            "starting poll loop, first tick in {:?}",
            next_tick.saturating_duration_since(Instant::now())
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = sleep_until(next_tick) => {}
            }

            let due = next_tick;
            let started = Instant::now();
            next_tick = due + period;
            if next_tick <= started {
                // fell behind; keep the period from now instead of bursting
                next_tick = started + period;
            }

            if let Tick::Cancelled = self.tick(&cancel).await {
                next_tick = due;
                break;
            }
        }

        debug!("poll loop stopped");
        LoopExit {
            rule_name: self.rule.name.clone(),
            next_tick: Some(next_tick),
            outcome: LoopOutcome::Cancelled,
        }
    }

    async fn tick(&self, cancel: &CancellationToken) -> Tick {
        let period = self.rule.check_interval;
        let window = TimeWindow::trailing(period);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Tick::Cancelled,
            result = timeout(
                period,
                self.backend.search(&self.rule.index, &self.rule.query, window, period),
            ) => result.unwrap_or(Err(QueryError::Timeout(period))),
        };

        let hits = match result {
            Ok(hits) => hits,
            Err(e) => {
                warn!(index = %self.rule.index, "query failed, skipping tick: {e}");
                return Tick::Completed;
            }
        };

        if cancel.is_cancelled() {
            trace!("cancelled with a result in hand, discarding {hits}");
            return Tick::Cancelled;
        }

        // not raced against cancellation; the sink bounds the write itself
        let sample = MetricSample::now(self.rule.name.as_str(), hits);
        match self.sink.send(&sample).await {
            Ok(()) => trace!("sent {hits} hits"),
            Err(SinkError::NotReady) => debug!("sink not ready, dropped {hits} hits"),
            Err(e) => warn!("failed to send {hits} hits: {e}"),
        }

        Tick::Completed
    }
}
