//! SinkSupervisor - Owns the one outbound sink connection
//!
//! ## State Machine
//!
//! ```text
//!              connect() ok
//! Connecting ───────────────▶ Ready { epoch }
//!     ▲                           │
//!     └───────────────────────────┘
//!       failed write / failed probe
//! ```
//!
//! Two independent detectors can notice a dead connection: the health
//! ticker (active probing) and any poll loop whose write fails (passive).
//! Both go through [`SinkCore::fail`], which only acts on a `Ready` state
//! and runs under the state lock. A failure episode therefore produces
//! exactly one `Ready → Connecting` transition and one reconnect request.
//! The actor consumes that request and runs the only reconnect procedure.
//!
//! Writes hold the state lock for the duration of the I/O, so lines from
//! concurrent poll loops never interleave. A probe holds it for its whole
//! round trip, so sends queue behind it for at most `probe_timeout`.
//! Every write is bounded by `write_timeout` and every probe by
//! `probe_timeout`; running into either counts as a dead connection. While
//! `Connecting`, sends fail fast without touching any connection.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Notify, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::backend::{SinkConnection, SinkConnectionFactory};
use crate::config::GraphiteConfig;
use crate::error::SinkError;

use super::messages::{MetricSample, SinkCommand, SinkStats, SinkStatus};

/// Everything the supervisor needs to know about its sink
#[derive(Debug, Clone)]
pub struct SinkSettings {
    pub host: String,
    pub port: u16,
    pub prefix: String,
    pub health_interval: Duration,
    pub probe_timeout: Duration,
    pub write_timeout: Duration,
    pub dial_timeout: Duration,
    pub reconnect_backoff: Duration,
    pub startup_attempts: u32,
}

impl From<&GraphiteConfig> for SinkSettings {
    fn from(config: &GraphiteConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            prefix: config.prefix.clone(),
            health_interval: config.health_interval,
            probe_timeout: config.probe_timeout,
            write_timeout: config.write_timeout,
            dial_timeout: config.dial_timeout,
            reconnect_backoff: config.reconnect_backoff,
            startup_attempts: config.startup_attempts,
        }
    }
}

impl SinkSettings {
    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Render a sample as one plaintext line
///
/// Whitespace inside the rule name would split the line, so it is replaced
/// with `_`.
pub fn format_line(prefix: &str, rule_name: &str, value: u64) -> String {
    let path: String = rule_name
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect();

    if prefix.is_empty() {
        format!("{path}.count {value}\n")
    } else {
        format!("{prefix}.{path}.count {value}\n")
    }
}

enum SinkState {
    Connecting,
    Ready {
        connection: Box<dyn SinkConnection>,
        epoch: u64,
    },
}

impl fmt::Debug for SinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkState::Connecting => write!(f, "Connecting"),
            SinkState::Ready { epoch, .. } => write!(f, "Ready {{ epoch: {epoch} }}"),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    dropped: AtomicU64,
    write_failures: AtomicU64,
    probe_failures: AtomicU64,
    connects: AtomicU64,
}

/// State shared between the actor and every [`SinkHandle`]
#[derive(Debug)]
struct SinkCore {
    state: Mutex<SinkState>,

    /// Reconnect requests; a stored permit coalesces concurrent raises
    reconnect: Notify,

    prefix: String,
    write_timeout: Duration,

    /// Epoch of the most recently installed connection
    epoch: AtomicU64,

    counters: Counters,
}

impl SinkCore {
    fn new(prefix: String, write_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(SinkState::Connecting),
            reconnect: Notify::new(),
            prefix,
            write_timeout,
            epoch: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    /// Retire the connection held in `state` and raise one reconnect request
    ///
    /// Only a `Ready` state is acted on, so every raise after the first one
    /// in the same episode is a no-op.
    async fn fail(&self, state: &mut SinkState, cause: &SinkError) {
        if let SinkState::Ready {
            mut connection,
            epoch,
        } = std::mem::replace(state, SinkState::Connecting)
        {
            warn!("sink connection (epoch {epoch}) is dead: {cause}");
            connection.close().await;
            self.reconnect.notify_one();
        }
    }

    async fn send(&self, sample: &MetricSample) -> Result<(), SinkError> {
        let line = format_line(&self.prefix, &sample.rule_name, sample.value);
        let mut state = self.state.lock().await;

        let result = match &mut *state {
            SinkState::Connecting => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                return Err(SinkError::NotReady);
            }
            SinkState::Ready { connection, epoch } => {
                trace!("writing {:?} on epoch {epoch}", line.trim_end());
                timeout(self.write_timeout, connection.write(&line))
                    .await
                    .unwrap_or(Err(SinkError::WriteTimeout(self.write_timeout)))
            }
        };

        match result {
            Ok(()) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.counters.write_failures.fetch_add(1, Ordering::Relaxed);
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                self.fail(&mut state, &e).await;
                Err(e)
            }
        }
    }

    async fn probe(&self, deadline: Duration) -> Result<(), SinkError> {
        let mut state = self.state.lock().await;

        let result = match &mut *state {
            SinkState::Connecting => return Err(SinkError::NotReady),
            SinkState::Ready { connection, .. } => timeout(deadline, connection.probe(deadline))
                .await
                .unwrap_or(Err(SinkError::ProbeTimeout(deadline))),
        };

        if let Err(e) = &result {
            self.counters.probe_failures.fetch_add(1, Ordering::Relaxed);
            self.fail(&mut state, e).await;
        }

        result
    }

    /// Install a freshly dialed connection, returning its epoch
    async fn install(&self, connection: Box<dyn SinkConnection>) -> u64 {
        let mut state = self.state.lock().await;
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        if let SinkState::Ready {
            connection: mut stale,
            ..
        } = std::mem::replace(&mut *state, SinkState::Ready { connection, epoch })
        {
            stale.close().await;
        }

        self.counters.connects.fetch_add(1, Ordering::Relaxed);
        epoch
    }

    async fn status(&self) -> SinkStatus {
        match &*self.state.lock().await {
            SinkState::Connecting => SinkStatus::Connecting,
            SinkState::Ready { epoch, .. } => SinkStatus::Ready { epoch: *epoch },
        }
    }

    async fn close(&self) {
        let mut state = self.state.lock().await;
        if let SinkState::Ready { mut connection, .. } =
            std::mem::replace(&mut *state, SinkState::Connecting)
        {
            connection.close().await;
        }
    }

    fn stats(&self) -> SinkStats {
        let c = &self.counters;
        SinkStats {
            sent: c.sent.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            write_failures: c.write_failures.load(Ordering::Relaxed),
            probe_failures: c.probe_failures.load(Ordering::Relaxed),
            connects: c.connects.load(Ordering::Relaxed),
        }
    }
}

/// Actor that health-checks the connection and coordinates reconnects
pub struct SinkSupervisor {
    core: Arc<SinkCore>,
    factory: Arc<dyn SinkConnectionFactory>,
    settings: SinkSettings,
    command_rx: mpsc::Receiver<SinkCommand>,
    cancel: CancellationToken,
}

impl fmt::Debug for SinkSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkSupervisor")
            .field("core", &self.core)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl SinkSupervisor {
    /// Connect to the sink and return the (not yet running) actor with its handle
    ///
    /// Makes up to `startup_attempts` attempts spaced by `reconnect_backoff`.
    /// Failing all of them is a bootstrap error.
    #[instrument(skip_all, fields(sink = %settings.endpoint()))]
    pub async fn bootstrap(
        settings: SinkSettings,
        factory: Arc<dyn SinkConnectionFactory>,
        cancel: CancellationToken,
    ) -> Result<(Self, SinkHandle), SinkError> {
        let (command_tx, command_rx) = mpsc::channel(32);
        let core = Arc::new(SinkCore::new(settings.prefix.clone(), settings.write_timeout));

        let actor = Self {
            core: core.clone(),
            factory,
            settings,
            command_rx,
            cancel,
        };

        let attempts = actor.settings.startup_attempts.max(1);
        let mut last = SinkError::NotReady;
        for attempt in 1..=attempts {
            match actor.connect().await {
                Ok(epoch) => {
                    info!("connected to sink (epoch {epoch})");
                    let handle = SinkHandle {
                        core,
                        sender: command_tx,
                    };
                    return Ok((actor, handle));
                }
                Err(e) => {
                    warn!("startup connect attempt {attempt}/{attempts} failed: {e}");
                    last = e;
                }
            }

            if attempt < attempts {
                tokio::select! {
                    _ = actor.cancel.cancelled() => break,
                    _ = tokio::time::sleep(actor.settings.reconnect_backoff) => {}
                }
            }
        }

        Err(SinkError::Bootstrap {
            attempts,
            last: Box::new(last),
        })
    }

    /// Run the actor's main loop until cancelled
    #[instrument(skip(self), fields(sink = %self.settings.endpoint()))]
    pub async fn run(mut self) {
        debug!("starting sink supervisor");

        let period = self.settings.health_interval;
        let mut health = interval_at(Instant::now() + period, period);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    debug!("cancelled");
                    break;
                }

                _ = self.core.reconnect.notified() => {
                    self.reconnect().await;
                }

                _ = health.tick() => {
                    match self.health_check().await {
                        Ok(()) | Err(SinkError::NotReady) => {}
                        Err(e) => warn!("health check failed: {e}"),
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        SinkCommand::CheckNow { respond_to } => {
                            debug!("received CheckNow command");
                            let _ = respond_to.send(self.health_check().await);
                        }
                    }
                }
            }
        }

        self.core.close().await;
        debug!("sink supervisor stopped");
    }

    /// Single connection attempt
    async fn connect(&self) -> Result<u64, SinkError> {
        let connection = self
            .factory
            .dial(
                &self.settings.host,
                self.settings.port,
                self.settings.dial_timeout,
            )
            .await?;

        Ok(self.core.install(connection).await)
    }

    async fn health_check(&self) -> Result<(), SinkError> {
        trace!("probing sink");
        self.core.probe(self.settings.probe_timeout).await
    }

    /// Reconnect until a connection is installed or the supervisor is cancelled
    async fn reconnect(&self) {
        if let SinkStatus::Ready { epoch } = self.core.status().await {
            debug!("ignoring stale reconnect request, epoch {epoch} is live");
            return;
        }

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.connect().await {
                Ok(epoch) => {
                    info!("reconnected to sink after {attempt} attempt(s) (epoch {epoch})");
                    return;
                }
                Err(e) => {
                    error!(
                        "reconnect attempt {attempt} failed: {e}, retrying in {:?}",
                        self.settings.reconnect_backoff
                    );
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.settings.reconnect_backoff) => {}
            }
        }
    }
}

/// Handle for sending samples through the SinkSupervisor
///
/// Cloned into every poll loop. It never exposes the connection itself.
#[derive(Debug, Clone)]
pub struct SinkHandle {
    core: Arc<SinkCore>,
    sender: mpsc::Sender<SinkCommand>,
}

impl SinkHandle {
    /// Write one sample on the current connection
    ///
    /// Fails fast with [`SinkError::NotReady`] while reconnecting. A transport
    /// failure retires the connection and triggers a reconnect; the sample is
    /// dropped either way.
    pub async fn send(&self, sample: &MetricSample) -> Result<(), SinkError> {
        self.core.send(sample).await
    }

    /// Run a health check immediately
    pub async fn check_now(&self) -> Result<(), SinkError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SinkCommand::CheckNow { respond_to: tx })
            .await
            .map_err(|_| SinkError::SupervisorGone)?;

        rx.await.map_err(|_| SinkError::SupervisorGone)?
    }

    /// Current connection state, read without going through the actor
    pub async fn status(&self) -> SinkStatus {
        self.core.status().await
    }

    pub fn stats(&self) -> SinkStats {
        self.core.stats()
    }
}
