use std::{
    collections::{hash_map::Entry, HashMap},
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, LazyLock,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::{
    cancel::CancellationToken,
    error::{LogError, SemaphoreError},
    logger::{Logger, TracingLogger},
};

static GLOBAL: LazyLock<SemaphoreRegistry> = LazyLock::new(SemaphoreRegistry::new);

/// A named counting semaphore, shared by everyone who uses the same key.
pub struct SemaphoreEntry {
    key: String,
    capacity: usize,
    semaphore: Semaphore,
    /// Permits currently taken through `acquire` and not yet released.
    holders: AtomicUsize,
}

impl SemaphoreEntry {
    fn new(key: &str, capacity: usize) -> Self {
        Self {
            key: key.into(),
            capacity,
            semaphore: Semaphore::new(capacity),
            holders: AtomicUsize::new(0),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Maximum number of concurrent holders, fixed at creation.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn holders(&self) -> usize {
        self.holders.load(Ordering::SeqCst)
    }

    /// Waits for a permit and keeps it until [`release`](Self::release).
    pub async fn acquire(&self) -> Result<(), SemaphoreError> {
        self.semaphore
            .acquire()
            .await
            .map_err(|_| SemaphoreError::Closed(self.key.clone()))?
            .forget();
        self.holders.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Gives back a permit taken by [`acquire`](Self::acquire). Fails without
    /// touching the capacity if no permit is outstanding.
    pub fn release(&self) -> Result<(), SemaphoreError> {
        self.holders
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map_err(|_| SemaphoreError::UnmatchedRelease(self.key.clone()))?;
        self.semaphore.add_permits(1);
        Ok(())
    }
}

impl std::fmt::Debug for SemaphoreEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemaphoreEntry")
            .field("key", &self.key)
            .field("capacity", &self.capacity)
            .field("holders", &self.holders())
            .finish()
    }
}

/// Named semaphores created lazily on first use.
///
/// The registry lock is only held to look up or insert an entry. Waiting for
/// a permit happens on the entry itself, so callers of unrelated keys never
/// block each other.
///
/// ```rust
/// use worker_frame::semaphore::SemaphoreRegistry;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> anyhow::Result<()> {
/// let registry = SemaphoreRegistry::new();
/// let total = registry
///     .run_exclusive("ledger", 1, async { 40 + 2 })
///     .await?;
/// assert_eq!(42, total);
/// # Ok(())
/// # }
/// ```
pub struct SemaphoreRegistry {
    entries: Mutex<HashMap<String, Arc<SemaphoreEntry>>>,
    logger: Arc<dyn Logger>,
}

impl Default for SemaphoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SemaphoreRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            logger: Arc::new(TracingLogger),
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    /// One registry for the whole process. Prefer passing an explicitly
    /// constructed registry where that is practical.
    pub fn global() -> &'static SemaphoreRegistry {
        &GLOBAL
    }

    /// Returns the entry for `key`, creating it with `max_concurrency`
    /// permits if it does not exist yet. The first creator decides the
    /// capacity; later calls get the existing entry whatever they ask for.
    pub fn get_or_create(
        &self,
        key: &str,
        max_concurrency: usize,
    ) -> Result<Arc<SemaphoreEntry>, SemaphoreError> {
        if max_concurrency == 0 {
            return Err(SemaphoreError::ZeroCapacity(key.into()));
        }
        let (entry, created) = match self.entries.lock().entry(key.into()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let created = Arc::new(SemaphoreEntry::new(key, max_concurrency));
                (entry.insert(created).clone(), true)
            }
        };
        if created {
            self.logger.trace(
                "SemaphoreRegistry::get_or_create",
                &format!("Created semaphore '{key}' with capacity {max_concurrency}"),
            );
        }
        Ok(entry)
    }

    pub fn get(&self, key: &str) -> Result<Arc<SemaphoreEntry>, SemaphoreError> {
        self.entries
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| SemaphoreError::UnknownKey(key.into()))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Waits for a permit of an existing semaphore.
    pub async fn acquire(&self, key: &str) -> Result<(), SemaphoreError> {
        let entry = self.get(key)?;
        entry.acquire().await?;
        self.logger.trace("SemaphoreRegistry::acquire", key);
        Ok(())
    }

    /// Like [`acquire`](Self::acquire), but gives up once `cancel` is
    /// cancelled.
    pub async fn acquire_cancellable(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<(), SemaphoreError> {
        let entry = self.get(key)?;
        let acquired = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SemaphoreError::Cancelled(key.into())),
            acquired = entry.acquire() => acquired,
        };
        acquired?;
        self.logger.trace("SemaphoreRegistry::acquire", key);
        Ok(())
    }

    /// Like [`acquire`](Self::acquire), but gives up after `timeout`.
    pub async fn acquire_timeout(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<(), SemaphoreError> {
        let entry = self.get(key)?;
        tokio::time::timeout(timeout, entry.acquire())
            .await
            .map_err(|_| SemaphoreError::Timeout(key.into()))??;
        self.logger.trace("SemaphoreRegistry::acquire", key);
        Ok(())
    }

    /// Gives back a permit taken with one of the `acquire` methods.
    pub fn release(&self, key: &str) -> Result<(), SemaphoreError> {
        self.get(key)?.release()?;
        self.logger.trace("SemaphoreRegistry::release", key);
        Ok(())
    }

    /// Takes a permit for `key`, creating the semaphore if needed. The permit
    /// is released when the guard is dropped.
    pub async fn lock(
        &self,
        key: &str,
        max_concurrency: usize,
    ) -> Result<SemaphoreGuard, SemaphoreError> {
        let entry = self.get_or_create(key, max_concurrency)?;
        entry.acquire().await?;
        self.logger.trace("SemaphoreRegistry::lock", key);
        Ok(SemaphoreGuard {
            entry,
            logger: self.logger.clone(),
        })
    }

    /// Runs `task` while holding a permit for `key`.
    pub async fn run_exclusive<F: Future>(
        &self,
        key: &str,
        max_concurrency: usize,
        task: F,
    ) -> Result<F::Output, SemaphoreError> {
        let _guard = self.lock(key, max_concurrency).await?;
        Ok(task.await)
    }
}

/// A permit for one keyed semaphore, released on drop.
#[must_use = "the permit is released as soon as the guard is dropped"]
pub struct SemaphoreGuard {
    entry: Arc<SemaphoreEntry>,
    logger: Arc<dyn Logger>,
}

impl SemaphoreGuard {
    pub fn key(&self) -> &str {
        self.entry.key()
    }
}

impl Drop for SemaphoreGuard {
    fn drop(&mut self) {
        self.entry
            .release()
            .log_to(&*self.logger, "SemaphoreGuard::drop");
    }
}

#[cfg(test)]
mod tests {
    use futures::future::join_all;
    use tokio::time::sleep;

    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creators_share_one_entry() {
        let registry = Arc::new(SemaphoreRegistry::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let most_inside = Arc::new(AtomicUsize::new(0));

        let tasks = (0..50).map(|_| {
            let (registry, inside, most_inside) =
                (registry.clone(), inside.clone(), most_inside.clone());
            tokio::spawn(async move {
                let entry = registry.get_or_create("X", 2).unwrap();
                registry.acquire("X").await.unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                most_inside.fetch_max(now, Ordering::SeqCst);
                sleep(ms(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                registry.release("X").unwrap();
                entry
            })
        });
        let entries = join_all(tasks)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect::<Vec<_>>();

        assert_eq!(1, registry.len());
        assert!(entries.iter().all(|e| Arc::ptr_eq(e, &entries[0])));
        assert_eq!(2, entries[0].capacity());
        assert_eq!(2, entries[0].available());
        assert_eq!(0, entries[0].holders());
        let most = most_inside.load(Ordering::SeqCst);
        assert!((1..=2).contains(&most), "{most} holders at once");
    }

    #[tokio::test]
    async fn unmatched_release_is_reported_and_capacity_is_kept() {
        let registry = SemaphoreRegistry::new();
        registry.get_or_create("X", 2).unwrap();

        assert_eq!(
            Err(SemaphoreError::UnmatchedRelease("X".into())),
            registry.release("X")
        );
        assert_eq!(2, registry.get("X").unwrap().available());

        registry.acquire("X").await.unwrap();
        registry.acquire("X").await.unwrap();
        assert_eq!(
            Err(SemaphoreError::Timeout("X".into())),
            registry.acquire_timeout("X", ms(50)).await
        );
        registry.release("X").unwrap();
        registry.release("X").unwrap();
        assert!(registry.release("X").is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn capacity_one_is_a_mutex() {
        let registry = Arc::new(SemaphoreRegistry::new());
        registry.get_or_create("counter", 1).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        let tasks = (0..10).map(|_| {
            let (registry, counter) = (registry.clone(), counter.clone());
            tokio::spawn(async move {
                for i in 0..1000 {
                    registry.acquire("counter").await.unwrap();
                    // a deliberately non-atomic read-modify-write
                    let seen = counter.load(Ordering::Relaxed);
                    if i % 100 == 0 {
                        tokio::task::yield_now().await;
                    }
                    counter.store(seen + 1, Ordering::Relaxed);
                    registry.release("counter").unwrap();
                }
            })
        });
        for task in join_all(tasks).await {
            task.unwrap();
        }

        assert_eq!(10000, counter.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn unknown_keys_are_rejected() {
        let registry = SemaphoreRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(
            Err(SemaphoreError::UnknownKey("missing".into())),
            registry.acquire("missing").await
        );
        assert_eq!(
            Err(SemaphoreError::UnknownKey("missing".into())),
            registry.release("missing")
        );
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let registry = SemaphoreRegistry::new();
        assert_eq!(
            SemaphoreError::ZeroCapacity("none".into()),
            registry.get_or_create("none", 0).unwrap_err()
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn the_first_creator_sets_the_capacity() {
        let registry = SemaphoreRegistry::new();
        let first = registry.get_or_create("db", 3).unwrap();
        let second = registry.get_or_create("db", 10).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(3, second.capacity());
    }

    #[tokio::test]
    async fn acquire_gives_up_when_cancelled() {
        let registry = Arc::new(SemaphoreRegistry::new());
        registry.get_or_create("X", 1).unwrap();
        registry.acquire("X").await.unwrap();

        let cancel = CancellationToken::new();
        let waiter = {
            let (registry, cancel) = (registry.clone(), cancel.clone());
            tokio::spawn(async move { registry.acquire_cancellable("X", &cancel).await })
        };
        sleep(ms(20)).await;
        cancel.cancel();

        assert_eq!(
            Err(SemaphoreError::Cancelled("X".into())),
            waiter.await.unwrap()
        );
        let entry = registry.get("X").unwrap();
        assert_eq!(1, entry.holders());
        registry.release("X").unwrap();
        assert_eq!(1, entry.available());
    }

    #[tokio::test]
    async fn guards_release_on_every_exit_path() {
        let registry = SemaphoreRegistry::new();

        let guard = registry.lock("report", 1).await.unwrap();
        assert_eq!("report", guard.key());
        assert_eq!(0, registry.get("report").unwrap().available());
        drop(guard);
        assert_eq!(1, registry.get("report").unwrap().available());

        let failed: anyhow::Result<()> = registry
            .run_exclusive("report", 1, async { Err(anyhow::anyhow!("render failed")) })
            .await
            .unwrap();
        assert!(failed.is_err());
        let entry = registry.get("report").unwrap();
        assert_eq!(1, entry.available());
        assert_eq!(0, entry.holders());
    }

    #[tokio::test]
    async fn unrelated_keys_do_not_block_each_other() {
        let registry = SemaphoreRegistry::new();
        let _held = registry.lock("a", 1).await.unwrap();
        let other = tokio::time::timeout(ms(500), registry.lock("b", 1)).await;
        assert!(other.unwrap().is_ok());
    }

    #[test]
    fn the_global_registry_is_shared() {
        let entry = SemaphoreRegistry::global()
            .get_or_create("semaphore-tests-global", 4)
            .unwrap();
        let again = SemaphoreRegistry::global()
            .get("semaphore-tests-global")
            .unwrap();
        assert!(Arc::ptr_eq(&entry, &again));
    }
}
