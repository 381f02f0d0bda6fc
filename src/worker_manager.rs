use std::sync::Arc;

use futures::future::join_all;

use crate::{
    error::WorkerError,
    logger::{Logger, TracingLogger},
    worker::{Worker, WorkerState},
};

/// Starts, stops and reports on a set of workers together, typically for the
/// whole lifetime of an application.
pub struct WorkerManager {
    logger: Arc<dyn Logger>,
    workers: Vec<Arc<Worker>>,
}

impl Default for WorkerManager {
    fn default() -> Self {
        Self::new(Arc::new(TracingLogger))
    }
}

impl WorkerManager {
    pub fn new(logger: Arc<dyn Logger>) -> Self {
        Self {
            logger,
            workers: vec![],
        }
    }

    /// Returns the shared handle so the caller can keep driving the worker
    /// individually.
    pub fn register(&mut self, worker: Worker) -> Arc<Worker> {
        let worker = Arc::new(worker);
        self.workers.push(worker.clone());
        worker
    }

    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    /// Starts every registered worker that is not already running.
    ///
    /// Returns how many were started. Stops at the first worker that cannot
    /// be started, leaving the ones before it running.
    pub fn start_all(&self) -> Result<usize, WorkerError> {
        self.logger.information("WorkerManager::start_all", "Starting workers.");
        let mut started = 0;
        for worker in &self.workers {
            if worker.start()? {
                started += 1;
            }
        }
        Ok(started)
    }

    /// Stops every worker concurrently and waits until all of them have
    /// exited.
    pub async fn stop_all(&self) {
        self.logger.information("WorkerManager::stop_all", "Stopping workers.");
        join_all(self.workers.iter().map(|w| w.stop())).await;
        self.logger.information("WorkerManager::stop_all", "All workers stopped.");
    }

    pub fn check(&self) -> Vec<WorkerReport> {
        self.workers
            .iter()
            .enumerate()
            .map(|(id, w)| WorkerReport {
                id,
                name: w.name().to_string(),
                state: w.state(),
            })
            .collect()
    }

    /// Logs how many workers are running, listing the ones that are not.
    pub fn log_report(&self) {
        let report = self.check();
        let (running, idle): (Vec<_>, Vec<_>) = report
            .into_iter()
            .partition(|r| r.state == WorkerState::Running);
        if idle.is_empty() {
            self.logger.information(
                "WorkerManager::log_report",
                &format!("all {} workers are running", running.len()),
            );
        } else {
            self.logger.warning(
                "WorkerManager::log_report",
                &format!(
                    "{} workers are running. {} are not: {}",
                    running.len(),
                    idle.len(),
                    pretty(&idle)
                ),
            );
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerReport {
    pub id: usize,
    pub name: String,
    pub state: WorkerState,
}

fn pretty(reports: &[WorkerReport]) -> String {
    reports
        .iter()
        .map(|r| format!("{} ({:?})", r.name, r.state))
        .collect::<Vec<_>>()
        .join(", ")
}
