use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Pause before a restartable task is started again after a panic
pub const RESTART_DELAY: Duration = Duration::from_secs(5);

/// Resolves on SIGINT, or SIGTERM on unix
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {e}");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("cannot listen for ctrl-c: {e}");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("cannot listen for ctrl-c: {e}");
        }
    }
}

pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "<non-string panic payload>".to_string()
}

/// How a top-level task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEnd {
    pub name: String,

    /// Panic message, if the task panicked
    pub panic: Option<String>,
}

/// Run `task` to completion, turning a panic into a [`TaskEnd`]
pub async fn guarded<F>(name: impl Into<String>, task: F) -> TaskEnd
where
    F: Future<Output = ()>,
{
    let name = name.into();
    let panic = AssertUnwindSafe(task)
        .catch_unwind()
        .await
        .err()
        .map(|payload| panic_message(&*payload));

    TaskEnd { name, panic }
}

/// Run the task built by `make`, building and starting a fresh one after
/// `restart_delay` whenever it panics
///
/// Returns once a run finishes normally or `cancel` fires.
pub async fn supervise<F, Fut>(
    name: &str,
    cancel: CancellationToken,
    restart_delay: Duration,
    mut make: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        let end = guarded(name, make()).await;
        let Some(message) = end.panic else {
            return;
        };

        if cancel.is_cancelled() {
            return;
        }

        error!(task = name, "task panicked: {message}, restarting in {restart_delay:?}");
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(restart_delay) => {}
        }
    }
}
