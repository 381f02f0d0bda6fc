use std::future::Future;

pub use tokio_util::sync::CancellationToken;

/// Raised by a job when it observes that it has been asked to stop.
///
/// Workers treat any error whose cause chain contains `Cancelled` as a normal
/// exit rather than a failure.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Returns `Err(Cancelled)` once the token has been cancelled. Use it as a
/// checkpoint inside long-running job bodies.
pub fn check_cancelled(token: &CancellationToken) -> Result<(), Cancelled> {
    if token.is_cancelled() {
        Err(Cancelled)
    } else {
        Ok(())
    }
}

/// Runs the future until it completes or the token is cancelled, whichever
/// happens first.
pub async fn cancellable<F: Future>(
    token: &CancellationToken,
    fut: F,
) -> Result<F::Output, Cancelled> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Cancelled),
        out = fut => Ok(out),
    }
}

/// True if the error, or anything that caused it, is a cancellation.
pub fn is_cancellation(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| cause.is::<Cancelled>())
}

/// One-shot event that is set once and wakes every current and future waiter.
#[derive(Clone, Debug, Default)]
pub(crate) struct FinishedSignal(CancellationToken);

impl FinishedSignal {
    pub fn new() -> Self {
        Self(CancellationToken::new())
    }

    pub fn set(&self) {
        self.0.cancel()
    }

    pub async fn wait(&self) {
        self.0.cancelled().await
    }
}
