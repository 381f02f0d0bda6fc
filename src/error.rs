use std::fmt::Display;

use crate::logger::{LogLevel, Logger};

/// Errors returned to callers driving a [`Worker`](crate::worker::Worker).
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// `start` needs a tokio runtime to spawn the loop on.
    #[error("worker '{0}' cannot start outside of a tokio runtime")]
    NoRuntime(String),

    #[error("invalid worker configuration: {0}")]
    InvalidConfig(String),
}

/// Misuse of a [`SemaphoreRegistry`](crate::semaphore::SemaphoreRegistry),
/// reported synchronously to the caller.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SemaphoreError {
    #[error("no semaphore has been created for key '{0}'")]
    UnknownKey(String),

    #[error("semaphore '{0}' must allow at least one concurrent holder")]
    ZeroCapacity(String),

    #[error("release of semaphore '{0}' without a matching acquire")]
    UnmatchedRelease(String),

    #[error("acquiring semaphore '{0}' was cancelled")]
    Cancelled(String),

    #[error("timed out acquiring semaphore '{0}'")]
    Timeout(String),

    #[error("semaphore '{0}' is closed")]
    Closed(String),
}

/// Enables logging of errors to a [`Logger`], to move forward without
/// returning the error.
pub trait LogError<T>: Sized {
    /// Logs if there was an error and converts the result into an option
    fn log_to<L: Logger + ?Sized>(self, logger: &L, origin: &str) -> Option<T> {
        self.log_to_as(logger, LogLevel::Error, origin)
    }

    /// Lazily logs if there was an error with a message and converts the
    /// result into an option
    fn log_with_context_to<L, Ctx>(self, logger: &L, origin: &str, ctx: Ctx) -> Option<T>
    where
        L: Logger + ?Sized,
        Ctx: Fn() -> String,
    {
        self.log_with_context_to_as(logger, LogLevel::Error, origin, ctx)
    }

    /// Logs if there was an error at the provided log level, and converts the
    /// result into an option
    fn log_to_as<L: Logger + ?Sized>(self, logger: &L, level: LogLevel, origin: &str) -> Option<T>;

    /// Lazily logs if there was an error with a message at the provided log
    /// level, and converts the result into an option
    fn log_with_context_to_as<L, Ctx>(
        self,
        logger: &L,
        level: LogLevel,
        origin: &str,
        ctx: Ctx,
    ) -> Option<T>
    where
        L: Logger + ?Sized,
        Ctx: Fn() -> String;
}

impl<T, E: Display + 'static> LogError<T> for Result<T, E> {
    fn log_to_as<L: Logger + ?Sized>(
        self,
        logger: &L,
        level: LogLevel,
        origin: &str,
    ) -> Option<T> {
        self.map_err(|e| {
            let es = display_error(&e);
            logger.log(level, origin, &es, None);
        })
        .ok()
    }

    fn log_with_context_to_as<L, Ctx>(
        self,
        logger: &L,
        level: LogLevel,
        origin: &str,
        ctx: Ctx,
    ) -> Option<T>
    where
        L: Logger + ?Sized,
        Ctx: Fn() -> String,
    {
        self.map_err(|e| {
            let es = display_error(&e);
            logger.log(level, origin, &ctx(), Some(&es));
        })
        .ok()
    }
}

/// use this to make sure you have a descriptive message including a stack trace
/// for anyhow errors, and otherwise just display the normal string for other
/// errors.
pub fn display_error<E: Display + 'static>(e: &E) -> String {
    match (e as &dyn std::any::Any).downcast_ref::<anyhow::Error>() {
        Some(err) => {
            let mut s = String::new();
            match format_anyhow(err, &mut s) {
                Ok(()) => s,
                Err(_) => format!("{err:#}"),
            }
        }
        None => format!("{e}"),
    }
}

fn format_anyhow<W: std::fmt::Write>(e: &anyhow::Error, f: &mut W) -> std::fmt::Result {
    write!(f, "{}", e)?;
    for i in e.chain().skip(1) {
        write!(f, ", caused by: {}", i)?;
    }
    write!(f, "\nstack backtrace:\n{}", e.backtrace())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::testing::RecordingLogger;

    #[test]
    fn display_error_includes_cause_chain() {
        let err = anyhow::anyhow!("disk full").context("writing snapshot");
        let shown = display_error(&err);
        assert!(shown.starts_with("writing snapshot, caused by: disk full"));
        assert!(shown.contains("stack backtrace:"));
    }

    #[test]
    fn display_error_plain_errors_are_unchanged() {
        let err = SemaphoreError::UnknownKey("db".into());
        assert_eq!(
            "no semaphore has been created for key 'db'",
            display_error(&err)
        );
    }

    #[test]
    fn log_with_context_records_message_and_error() {
        let logger = RecordingLogger::default();
        let out = Err::<u8, _>(SemaphoreError::Closed("k".into())).log_with_context_to_as(
            &logger,
            LogLevel::Critical,
            "tests",
            || "closing".to_string(),
        );
        assert_eq!(None, out);
        let entries = logger.entries();
        assert_eq!(1, entries.len());
        assert_eq!(LogLevel::Critical, entries[0].level);
        assert_eq!("closing", entries[0].message);
        assert_eq!(Some("semaphore 'k' is closed"), entries[0].context.as_deref());
    }

    #[test]
    fn ok_results_log_nothing() {
        let logger = RecordingLogger::default();
        assert_eq!(Some(3), Ok::<_, SemaphoreError>(3).log_to(&logger, "tests"));
        assert!(logger.entries().is_empty());
    }
}
