use std::{any::Any, future::Future, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::{
    cancel::{is_cancellation, CancellationToken, FinishedSignal},
    error::{LogError, WorkerError},
    logger::{LogLevel, Logger, TracingLogger},
    short_name,
    time::{Sleeper, TokioSleeper},
};

const LOOP_STARTED: &str = "Worker loop started";
const LOOP_FINISHED: &str = "Worker loop finished";
const TASK_STARTED: &str = "Worker task started";
const TASK_FINISHED: &str = "Worker task finished";

const LOOP_SLEEPER: TokioSleeper = TokioSleeper::default();

/// An operation run in the background by a [`Worker`].
#[async_trait]
pub trait Job: Send + Sync {
    /// Runs the job once.
    ///
    /// The job is never aborted from the outside. It should watch `cancel` and
    /// return promptly once it is cancelled, preferably with
    /// [`Cancelled`](crate::cancel::Cancelled) so the exit is not reported as
    /// a failure.
    async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()>;

    /// The name used to represent the job in the logs
    fn name(&self) -> String {
        short_name::<Self>()
    }
}

#[async_trait]
impl<F, Fut> Job for F
where
    F: Fn(CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        self(cancel).await
    }
}

/// Implement this for jobs that always repeat at the same interval, then build
/// the worker with [`Worker::from_loopable`].
pub trait SelfConfiguredLoop {
    fn interval(&self) -> Duration;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RepeatPolicy {
    /// Run the job a single time per start.
    Once,
    /// Run the job, then pause for the duration, until stopped. A failing
    /// iteration is retried after the same pause, forever.
    Every(Duration),
}

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Name in the logs. Defaults to the name of the job.
    pub name: Option<String>,
    pub repeat: RepeatPolicy,
}

impl WorkerConfig {
    pub fn looping(interval: Duration) -> Self {
        Self {
            name: None,
            repeat: RepeatPolicy::Every(interval),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    fn validate(&self) -> Result<(), WorkerError> {
        if let RepeatPolicy::Every(interval) = self.repeat {
            if interval.is_zero() {
                return Err(WorkerError::InvalidConfig(
                    "loop interval must be greater than zero".into(),
                ));
            }
        }
        if self.name.as_deref().is_some_and(str::is_empty) {
            return Err(WorkerError::InvalidConfig("worker name is empty".into()));
        }
        Ok(())
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: None,
            repeat: RepeatPolicy::Once,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkerState {
    Idle,
    Running,
    StopRequested,
    Stopped,
}

/// Everything that is replaced when the worker is started.
struct Run {
    state: WorkerState,
    /// Incremented on every start so a finishing loop can tell whether it is
    /// still the current one.
    generation: u64,
    cancel: CancellationToken,
    finished: FinishedSignal,
}

/// Runs a [`Job`] in the background, with at most one instance of it running
/// at any time no matter how often or from which threads `start` and `stop`
/// are called.
///
/// Dropping the worker cancels the current run without waiting for it; call
/// [`stop`](Worker::stop) first to wait for a clean exit.
///
/// ```rust
/// use std::time::Duration;
///
/// use worker_frame::{
///     cancel::{cancellable, CancellationToken},
///     worker::{Worker, WorkerState},
/// };
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> anyhow::Result<()> {
/// let worker = Worker::looping(
///     |cancel: CancellationToken| async move {
///         cancellable(&cancel, refresh_index()).await?;
///         anyhow::Ok(())
///     },
///     Duration::from_secs(30),
/// )?;
///
/// worker.start()?;
/// assert!(!worker.start()?, "already running");
/// worker.stop().await;
/// assert_eq!(WorkerState::Stopped, worker.state());
/// # Ok(())
/// # }
/// # async fn refresh_index() {}
/// ```
pub struct Worker {
    name: String,
    job: Arc<dyn Job>,
    repeat: RepeatPolicy,
    logger: Arc<dyn Logger>,
    sleeper: Arc<dyn Sleeper>,
    runtime: Option<Handle>,
    run: Arc<Mutex<Run>>,
}

impl Worker {
    pub fn new<J: Job + 'static>(job: J, config: WorkerConfig) -> Result<Self, WorkerError> {
        Self::from_arc(Arc::new(job), config)
    }

    pub fn from_arc(job: Arc<dyn Job>, config: WorkerConfig) -> Result<Self, WorkerError> {
        config.validate()?;
        Ok(Self::build(job, config))
    }

    /// A worker that runs the job a single time per start.
    pub fn once<J: Job + 'static>(job: J) -> Self {
        Self::build(Arc::new(job), WorkerConfig::default())
    }

    /// A worker that repeats the job, pausing `interval` between iterations.
    pub fn looping<J: Job + 'static>(job: J, interval: Duration) -> Result<Self, WorkerError> {
        Self::new(job, WorkerConfig::looping(interval))
    }

    pub fn from_loopable<J>(job: J) -> Result<Self, WorkerError>
    where
        J: Job + SelfConfiguredLoop + 'static,
    {
        let interval = job.interval();
        Self::looping(job, interval)
    }

    fn build(job: Arc<dyn Job>, config: WorkerConfig) -> Self {
        Self {
            name: config.name.unwrap_or_else(|| job.name()),
            job,
            repeat: config.repeat,
            logger: Arc::new(TracingLogger),
            sleeper: Arc::new(LOOP_SLEEPER),
            runtime: Handle::try_current().ok(),
            run: Arc::new(Mutex::new(Run {
                state: WorkerState::Idle,
                generation: 0,
                cancel: CancellationToken::new(),
                finished: FinishedSignal::new(),
            })),
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Spawn the loop on this runtime instead of the one that was current
    /// when the worker was built.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WorkerState {
        self.run.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == WorkerState::Running
    }

    pub fn repeat(&self) -> RepeatPolicy {
        self.repeat
    }

    /// Schedules the job in the background and returns immediately.
    ///
    /// Returns `Ok(false)` without doing anything if the worker is running or
    /// still stopping. Each start gets a new cancellation token.
    pub fn start(&self) -> Result<bool, WorkerError> {
        let origin = self.origin("start");
        let started = self.spawn_run()?;
        if started {
            self.logger.debug(&origin, "Worker started");
        } else {
            self.logger.debug(&origin, "Worker is already running");
        }
        Ok(started)
    }

    /// The check-and-transition behind `start`. Nothing here may call out to
    /// the logger, which is free to read the worker's state.
    fn spawn_run(&self) -> Result<bool, WorkerError> {
        let mut run = self.run.lock();
        if matches!(run.state, WorkerState::Running | WorkerState::StopRequested) {
            return Ok(false);
        }
        let runtime = self
            .runtime
            .clone()
            .or_else(|| Handle::try_current().ok())
            .ok_or_else(|| WorkerError::NoRuntime(self.name.clone()))?;

        let cancel = CancellationToken::new();
        let finished = FinishedSignal::new();
        run.generation += 1;
        run.state = WorkerState::Running;
        run.cancel = cancel.clone();
        run.finished = finished.clone();

        let task = LoopTask {
            name: self.name.clone(),
            job: self.job.clone(),
            repeat: self.repeat,
            logger: self.logger.clone(),
            sleeper: self.sleeper.clone(),
            cancel,
        };
        let exit = SettleOnDrop {
            run: self.run.clone(),
            generation: run.generation,
            finished,
        };
        runtime.spawn(task.run_loop(exit));
        Ok(true)
    }

    /// Requests cancellation and waits until the loop has fully exited.
    ///
    /// Returns immediately if the worker is not running. Concurrent calls all
    /// wait for the same exit.
    ///
    /// Dropping the future early does not undo the request. The loop still
    /// moves the worker to Stopped when it exits.
    pub async fn stop(&self) {
        let origin = self.origin("stop");
        let (finished, requested) = {
            let mut run = self.run.lock();
            let requested = match run.state {
                WorkerState::Idle | WorkerState::Stopped => return,
                WorkerState::Running => {
                    run.state = WorkerState::StopRequested;
                    run.cancel.cancel();
                    true
                }
                WorkerState::StopRequested => false,
            };
            (run.finished.clone(), requested)
        };
        if requested {
            self.logger.trace(&origin, "Stop requested");
        }
        finished.wait().await;
        if requested {
            self.logger.debug(&origin, "Worker stopped");
        }
    }

    /// Waits for the current run to exit on its own, without requesting
    /// cancellation. Returns immediately if nothing is running.
    pub async fn finished(&self) {
        let finished = {
            let run = self.run.lock();
            if matches!(run.state, WorkerState::Idle | WorkerState::Stopped) {
                return;
            }
            run.finished.clone()
        };
        finished.wait().await
    }

    fn origin(&self, operation: &str) -> String {
        format!("{}::{operation}", self.name)
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.run.lock().cancel.cancel();
    }
}

/// The state moved into the spawned task for one run of a worker.
struct LoopTask {
    name: String,
    job: Arc<dyn Job>,
    repeat: RepeatPolicy,
    logger: Arc<dyn Logger>,
    sleeper: Arc<dyn Sleeper>,
    cancel: CancellationToken,
}

/// Dropped when a run's task ends, however it ends. Moves the worker to
/// Stopped unless a newer run has taken its place, then wakes everyone waiting
/// on the run.
struct SettleOnDrop {
    run: Arc<Mutex<Run>>,
    generation: u64,
    finished: FinishedSignal,
}

impl Drop for SettleOnDrop {
    fn drop(&mut self) {
        {
            let mut run = self.run.lock();
            if run.generation == self.generation
                && matches!(run.state, WorkerState::Running | WorkerState::StopRequested)
            {
                run.state = WorkerState::Stopped;
            }
        }
        self.finished.set();
    }
}

impl LoopTask {
    /// Cancellation is checked before each iteration and again before each
    /// pause.
    async fn run_loop(self, _exit: SettleOnDrop) {
        let origin = format!("{}::run_loop", self.name);
        self.logger.trace(&origin, LOOP_STARTED);
        while !self.cancel.is_cancelled() {
            self.iterate(&origin).await;
            let RepeatPolicy::Every(interval) = self.repeat else {
                break;
            };
            if self.cancel.is_cancelled() {
                break;
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = self.sleeper.sleep(interval) => (),
            }
        }
        self.logger.trace(&origin, LOOP_FINISHED);
    }

    async fn iterate(&self, origin: &str) {
        self.logger.trace(origin, TASK_STARTED);
        let outcome = AssertUnwindSafe(self.job.run(self.cancel.clone()))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => (),
            Ok(Err(e)) if is_cancellation(&e) => self.logger.trace(origin, "Worker task cancelled"),
            Ok(Err(e)) => {
                Err::<(), _>(e).log_with_context_to_as(
                    &*self.logger,
                    LogLevel::Critical,
                    origin,
                    || format!("Unhandled error in worker '{}'", self.name),
                );
            }
            Err(panic) => self.logger.log(
                LogLevel::Critical,
                origin,
                &format!("Worker '{}' panicked", self.name),
                Some(&panic_message(&*panic)),
            ),
        }
        self.logger.trace(origin, TASK_FINISHED);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".into()
    }
}
