//! Concurrency controllers for the replication source
//!
//! The source acquires a lease for every decoded message in WAL order; the
//! controller decides how much parallelism that allows. Dropping the lease
//! releases it. `cancel` aborts pending acquisitions so shutdown can drain.
//!
//! A row whose `concurrency` column is `parallel` has declared that it needs
//! no ordering against its neighbours, so the ordering controllers hand it
//! an unrestricted lease. The semaphore controller does not: its permits
//! bound resource usage, not ordering.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use postbox_core::{Concurrency, ListenerError, ListenerResult, StoredMessage};
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Held for the duration of one message; releases on drop
pub struct Lease {
    _inner: Option<LeaseInner>,
}

enum LeaseInner {
    Mutex(OwnedMutexGuard<()>),
    Permit(OwnedSemaphorePermit),
}

impl Lease {
    fn unrestricted() -> Self {
        Self { _inner: None }
    }

    fn from_mutex(guard: OwnedMutexGuard<()>) -> Self {
        Self {
            _inner: Some(LeaseInner::Mutex(guard)),
        }
    }

    fn from_permit(permit: OwnedSemaphorePermit) -> Self {
        Self {
            _inner: Some(LeaseInner::Permit(permit)),
        }
    }
}

#[async_trait]
pub trait ConcurrencyController: Send + Sync {
    /// Waits for a processing slot; fails with `LISTENER_STOPPED` once the
    /// controller has been cancelled.
    async fn acquire(&self, message: &StoredMessage) -> ListenerResult<Lease>;

    /// Aborts pending and future acquisitions
    fn cancel(&self);
}

/// One message at a time, completing in acquisition order, except for rows
/// flagged `parallel`. The default.
pub struct SequentialController {
    lock: Arc<Mutex<()>>,
    stop: CancellationToken,
}

impl SequentialController {
    pub fn new() -> Self {
        Self {
            lock: Arc::new(Mutex::new(())),
            stop: CancellationToken::new(),
        }
    }
}

impl Default for SequentialController {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConcurrencyController for SequentialController {
    async fn acquire(&self, message: &StoredMessage) -> ListenerResult<Lease> {
        if self.stop.is_cancelled() {
            return Err(ListenerError::ListenerStopped);
        }
        if message.concurrency() == Concurrency::Parallel {
            return Ok(Lease::unrestricted());
        }
        tokio::select! {
            () = self.stop.cancelled() => Err(ListenerError::ListenerStopped),
            guard = Arc::clone(&self.lock).lock_owned() => Ok(Lease::from_mutex(guard)),
        }
    }

    fn cancel(&self) {
        self.stop.cancel();
    }
}

/// No limit at all; every message processes concurrently
pub struct ParallelController {
    stop: CancellationToken,
}

impl ParallelController {
    pub fn new() -> Self {
        Self {
            stop: CancellationToken::new(),
        }
    }
}

impl Default for ParallelController {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConcurrencyController for ParallelController {
    async fn acquire(&self, _message: &StoredMessage) -> ListenerResult<Lease> {
        if self.stop.is_cancelled() {
            return Err(ListenerError::ListenerStopped);
        }
        Ok(Lease::unrestricted())
    }

    fn cancel(&self) {
        self.stop.cancel();
    }
}

/// Serialises messages within a `segment`, runs segments in parallel.
/// Messages without a segment share one bucket; rows flagged `parallel`
/// skip their segment's mutex entirely.
pub struct SegmentMutexController {
    segments: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    stop: CancellationToken,
}

impl SegmentMutexController {
    pub fn new() -> Self {
        Self {
            segments: StdMutex::new(HashMap::new()),
            stop: CancellationToken::new(),
        }
    }
}

impl Default for SegmentMutexController {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConcurrencyController for SegmentMutexController {
    async fn acquire(&self, message: &StoredMessage) -> ListenerResult<Lease> {
        if self.stop.is_cancelled() {
            return Err(ListenerError::ListenerStopped);
        }
        if message.concurrency() == Concurrency::Parallel {
            return Ok(Lease::unrestricted());
        }
        let key = message.segment.clone().unwrap_or_default();
        let lock = {
            let mut segments = self
                .segments
                .lock()
                .expect("segment map lock poisoned");
            Arc::clone(segments.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))))
        };

        tokio::select! {
            () = self.stop.cancelled() => Err(ListenerError::ListenerStopped),
            guard = lock.lock_owned() => Ok(Lease::from_mutex(guard)),
        }
    }

    fn cancel(&self) {
        self.stop.cancel();
    }
}

/// At most `permits` messages in flight
pub struct SemaphoreController {
    semaphore: Arc<Semaphore>,
    stop: CancellationToken,
}

impl SemaphoreController {
    pub fn new(permits: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(permits.max(1))),
            stop: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl ConcurrencyController for SemaphoreController {
    async fn acquire(&self, _message: &StoredMessage) -> ListenerResult<Lease> {
        tokio::select! {
            () = self.stop.cancelled() => Err(ListenerError::ListenerStopped),
            permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                Ok(permit) => Ok(Lease::from_permit(permit)),
                Err(_) => Err(ListenerError::ListenerStopped),
            },
        }
    }

    fn cancel(&self) {
        self.stop.cancel();
        self.semaphore.close();
    }
}

/// Routes messages to different controllers by `(aggregate_type,
/// message_type)`, falling back for everything unrouted.
pub struct CompositeController {
    routes: HashMap<(String, String), Arc<dyn ConcurrencyController>>,
    fallback: Arc<dyn ConcurrencyController>,
}

impl CompositeController {
    pub fn new(fallback: Arc<dyn ConcurrencyController>) -> Self {
        Self {
            routes: HashMap::new(),
            fallback,
        }
    }

    pub fn route(
        mut self,
        aggregate_type: impl Into<String>,
        message_type: impl Into<String>,
        controller: Arc<dyn ConcurrencyController>,
    ) -> Self {
        self.routes
            .insert((aggregate_type.into(), message_type.into()), controller);
        self
    }
}

#[async_trait]
impl ConcurrencyController for CompositeController {
    async fn acquire(&self, message: &StoredMessage) -> ListenerResult<Lease> {
        let controller = self
            .routes
            .get(&(
                message.aggregate_type.clone(),
                message.message_type.clone(),
            ))
            .unwrap_or(&self.fallback);
        controller.acquire(message).await
    }

    fn cancel(&self) {
        for controller in self.routes.values() {
            controller.cancel();
        }
        self.fallback.cancel();
    }
}
