//! Worker Frame coordinates long-lived background work in tokio applications.
//!
//! A [`Worker`](worker::Worker) guarantees that at most one instance of its job
//! runs at a time, however many threads call `start` and `stop`. Stopping is
//! cooperative: the job receives a cancellation token and is expected to
//! return once it fires, and `stop` waits until it has. A looping worker runs
//! its job again after a fixed interval until stopped, logging and retrying
//! every failed iteration.
//!
//! A [`SemaphoreRegistry`](semaphore::SemaphoreRegistry) hands out named
//! semaphores, created on first use, so unrelated parts of an application can
//! share a limit on concurrent access to the same resource.
//!
//! ```rust
//! use std::{sync::Arc, time::Duration};
//!
//! use async_trait::async_trait;
//!
//! use worker_frame::{
//!     cancel::{check_cancelled, CancellationToken},
//!     semaphore::SemaphoreRegistry,
//!     worker::{Job, SelfConfiguredLoop, Worker},
//!     worker_manager::WorkerManager,
//! };
//!
//! struct PruneSessions {
//!     locks: Arc<SemaphoreRegistry>,
//! }
//!
//! #[async_trait]
//! impl Job for PruneSessions {
//!     async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
//!         // shares the session store with request handlers
//!         let _store = self.locks.lock("session-store", 4).await?;
//!         for _batch in 0..10 {
//!             check_cancelled(&cancel)?;
//!             // delete a batch of expired sessions
//!         }
//!         Ok(())
//!     }
//! }
//!
//! impl SelfConfiguredLoop for PruneSessions {
//!     fn interval(&self) -> Duration {
//!         Duration::from_secs(300)
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> anyhow::Result<()> {
//! let locks = Arc::new(SemaphoreRegistry::new());
//! let mut workers = WorkerManager::default();
//! workers.register(Worker::from_loopable(PruneSessions { locks })?);
//!
//! workers.start_all()?;
//! workers.stop_all().await;
//! # Ok(())
//! # }
//! ```

/// Cooperative cancellation for jobs.
pub mod cancel;
/// Errors and how to log them instead of returning them.
pub mod error;
/// The logging sink used by workers and semaphores.
pub mod logger;
/// Named semaphores shared across an application.
pub mod semaphore;
/// Sleep that is easily swapped out in tests.
pub mod time;
/// Single-instance background workers.
pub mod worker;
/// Runs a set of workers together.
pub mod worker_manager;

/// misc items that are too small to get their own files,
/// kept out of this file to reduce clutter.
mod util;
pub use util::*;
