use std::{fmt::Display, sync::Arc};

/// Severity of a log event, ordered from most to least verbose.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Trace,
    Debug,
    Information,
    Warning,
    Error,
    /// Something went wrong that nothing upstream is going to handle.
    Critical,
}

/// Sink for the structured events emitted by workers and the semaphore
/// registry.
///
/// `origin` identifies the component and operation that produced the event,
/// for example `"IndexRefresh::run_loop"`.
pub trait Logger: Send + Sync {
    fn log(&self, level: LogLevel, origin: &str, message: &str, context: Option<&dyn Display>);

    fn trace(&self, origin: &str, message: &str) {
        self.log(LogLevel::Trace, origin, message, None)
    }

    fn debug(&self, origin: &str, message: &str) {
        self.log(LogLevel::Debug, origin, message, None)
    }

    fn information(&self, origin: &str, message: &str) {
        self.log(LogLevel::Information, origin, message, None)
    }

    fn warning(&self, origin: &str, message: &str) {
        self.log(LogLevel::Warning, origin, message, None)
    }

    fn error(&self, origin: &str, message: &str) {
        self.log(LogLevel::Error, origin, message, None)
    }

    fn critical(&self, origin: &str, message: &str) {
        self.log(LogLevel::Critical, origin, message, None)
    }
}

/// Discards everything.
impl Logger for () {
    fn log(&self, _: LogLevel, _: &str, _: &str, _: Option<&dyn Display>) {}
}

/// A missing logger is a silent one.
impl<L: Logger> Logger for Option<L> {
    fn log(&self, level: LogLevel, origin: &str, message: &str, context: Option<&dyn Display>) {
        if let Some(logger) = self {
            logger.log(level, origin, message, context)
        }
    }
}

impl<L: Logger + ?Sized> Logger for Arc<L> {
    fn log(&self, level: LogLevel, origin: &str, message: &str, context: Option<&dyn Display>) {
        (**self).log(level, origin, message, context)
    }
}

/// Forwards events to `tracing`. Critical events are emitted at error level
/// with `critical = true` so subscribers can filter on them.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: LogLevel, origin: &str, message: &str, context: Option<&dyn Display>) {
        match (level, context) {
            (LogLevel::Critical, Some(ctx)) => {
                tracing::error!(critical = true, origin, "{message} - {ctx}")
            }
            (LogLevel::Critical, None) => tracing::error!(critical = true, origin, "{message}"),
            (level, Some(ctx)) => log!(level, origin, "{} - {}", message, ctx),
            (level, None) => log!(level, origin, "{}", message),
        }
    }
}

macro_rules! log {
    ($level:expr, $origin:expr, $($args:tt),*) => {
        match $level {
            LogLevel::Error | LogLevel::Critical => tracing::error!(origin = $origin, $($args),*),
            LogLevel::Warning => tracing::warn!(origin = $origin, $($args),*),
            LogLevel::Information => tracing::info!(origin = $origin, $($args),*),
            LogLevel::Debug => tracing::debug!(origin = $origin, $($args),*),
            LogLevel::Trace => tracing::trace!(origin = $origin, $($args),*),
        }
    };
}
pub(crate) use log;
