//! Generic resource pooling.
//!
//! [`Pool`] keeps at most `max` resources created by a [`Manager`]. Every
//! resource is in exactly one of the sets:
//!
//! - idle, ready to be handed out
//! - busy, checked out by a [`Pooled`] guard
//! - wait, being created
//!
//! When no idle resource is available and the pool is full, acquirers
//! wait in FIFO order. Resources being destroyed are counted separately
//! and do not count against `max`.
use std::{
    collections::VecDeque,
    fmt,
    ops::{Deref, DerefMut},
    pin::pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};
use tokio::{
    runtime::Handle,
    sync::{Notify, oneshot},
    task::{AbortHandle, JoinHandle},
    time::sleep,
};

mod config;
mod pg;

pub use config::{PoolConfig, PoolOptions};
pub use pg::{ConnectionManager, PgPool, PooledLease};

/// Create and destroy pooled resources.
pub trait Manager: Send + Sync + 'static {
    /// The pooled resource.
    type Resource: Send + 'static;

    /// Error returned by [`create`][Manager::create] and [`Pool::acquire`].
    type Error: From<PoolError> + fmt::Display + Send + 'static;

    /// Create new resource.
    fn create(&self) -> impl Future<Output = Result<Self::Resource, Self::Error>> + Send;

    /// Destroy a resource, the resource is never used again.
    fn destroy(&self, resource: Self::Resource) -> impl Future<Output = ()> + Send;

    /// Returns `true` if resource should be destroyed instead of returned to idle.
    ///
    /// Called when the resource is released and before it is handed out from idle.
    fn has_broken(&self, resource: &mut Self::Resource) -> bool {
        let _ = resource;
        false
    }
}

type Reply<M> = Result<Pooled<M>, <M as Manager>::Error>;
type ReplySend<M> = oneshot::Sender<Reply<M>>;

/// Resource pool.
///
/// Cloning the pool is cheap, all clones share the same resources.
pub struct Pool<M: Manager> {
    inner: Arc<Inner<M>>,
}

struct Inner<M: Manager> {
    manager: M,
    options: PoolOptions,
    sets: Mutex<Sets<M>>,
    closed: Notify,
}

struct Sets<M: Manager> {
    state: PoolState,
    /// front is the most recently released
    idle: VecDeque<Idle<M::Resource>>,
    busy: usize,
    wait: usize,
    closing: usize,
    queue: VecDeque<ReplySend<M>>,
    next_id: u64,
}

struct Idle<R> {
    id: u64,
    resource: R,
    timer: Option<AbortHandle>,
}

impl<R> Idle<R> {
    fn into_resource(self) -> R {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        self.resource
    }
}

impl<M: Manager> Sets<M> {
    fn total(&self) -> usize {
        self.idle.len() + self.busy + self.wait
    }

    /// Drop waiters that already gave up, returns the remaining count.
    fn live_waiters(&mut self) -> usize {
        self.queue.retain(|send| !send.is_closed());
        self.queue.len()
    }
}

/// Lifecycle state of a [`Pool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Accepting acquire.
    Ready,
    /// [`Pool::shutdown`] is called, remaining resources are being destroyed.
    ShuttingDown,
    /// All resources are destroyed.
    Closed,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ready => "ready",
            Self::ShuttingDown => "shutting down",
            Self::Closed => "closed",
        })
    }
}

/// Snapshot of the [`Pool`] counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub state: PoolState,
    /// Resources ready to be handed out.
    pub idle: usize,
    /// Resources checked out.
    pub busy: usize,
    /// Resources being created.
    pub wait: usize,
    /// Resources being destroyed.
    pub closing: usize,
    /// Acquirers waiting for a resource.
    pub queue: usize,
}

/// An error from [`Pool`] itself.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Acquire on a pool that is not [`PoolState::Ready`].
    InvalidState(PoolState),
    /// Acquire took longer than [`PoolOptions::acquire_timeout`].
    Timeout(Duration),
}

impl std::error::Error for PoolError { }

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidState(state) => write!(f, "pool is {state}"),
            Self::Timeout(timeout) => write!(f, "timeout of {}ms is exceeded", timeout.as_millis()),
        }
    }
}

impl fmt::Debug for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

enum Acquire<M: Manager> {
    Idle(M::Resource),
    Create(ReplySend<M>),
    Queued,
}

impl<M: Manager> Pool<M> {
    /// Create new pool, no resource is created until the first acquire.
    pub fn new(manager: M, options: PoolOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                manager,
                options,
                sets: Mutex::new(Sets {
                    state: PoolState::Ready,
                    idle: VecDeque::new(),
                    busy: 0,
                    wait: 0,
                    closing: 0,
                    queue: VecDeque::new(),
                    next_id: 0,
                }),
                closed: Notify::new(),
            }),
        }
    }

    /// Returns the resource manager.
    pub fn manager(&self) -> &M {
        &self.inner.manager
    }

    /// Returns the pool options.
    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    /// Returns the current counters.
    pub fn status(&self) -> PoolStatus {
        let mut sets = self.inner.lock();
        PoolStatus {
            state: sets.state,
            idle: sets.idle.len(),
            busy: sets.busy,
            wait: sets.wait,
            closing: sets.closing,
            queue: sets.live_waiters(),
        }
    }

    /// Check out a resource.
    ///
    /// An idle resource is preferred, otherwise a new one is created if the
    /// pool is not full, otherwise wait for a released one.
    ///
    /// If the returned future is dropped while a resource is being created
    /// for it, the resource is destroyed.
    pub async fn acquire(&self) -> Result<Pooled<M>, M::Error> {
        let inner = &self.inner;
        let (send, mut recv) = oneshot::channel();

        let (action, broken) = {
            let mut sets = inner.lock();
            if sets.state != PoolState::Ready {
                return Err(PoolError::InvalidState(sets.state).into());
            }

            let mut broken = vec![];
            let mut found = None;
            while let Some(idle) = sets.idle.pop_front() {
                let mut resource = idle.into_resource();
                if inner.manager.has_broken(&mut resource) {
                    sets.closing += 1;
                    broken.push(resource);
                    continue;
                }
                sets.busy += 1;
                found = Some(resource);
                break;
            }

            let action = match found {
                Some(resource) => Acquire::Idle(resource),
                None if sets.total() < inner.options.max => {
                    sets.wait += 1;
                    Acquire::Create(send)
                },
                None => {
                    sets.queue.push_back(send);
                    Acquire::Queued
                },
            };
            (action, broken)
        };

        for resource in broken {
            #[cfg(feature = "log")]
            log::debug!("idle resource is broken, destroying");
            let _ = inner.destroy_later(resource);
        }

        match action {
            Acquire::Idle(resource) => return Ok(Pooled::new(resource, inner.clone())),
            Acquire::Create(send) => inner.spawn_create(Some(send)),
            Acquire::Queued => { },
        }

        let reply = match inner.options.acquire_timeout {
            Some(timeout) => tokio::select! {
                reply = &mut recv => reply,
                _ = sleep(timeout) => {
                    #[cfg(feature = "log")]
                    log::warn!("acquire timeout of {}ms is exceeded", timeout.as_millis());
                    return Err(PoolError::Timeout(timeout).into());
                },
            },
            None => recv.await,
        };

        match reply {
            Ok(reply) => reply,
            Err(_) => Err(PoolError::InvalidState(inner.lock().state).into()),
        }
    }

    /// Stop accepting acquire and destroy all resources.
    ///
    /// Waiting acquirers are rejected, idle resources are destroyed
    /// immediately, busy resources are destroyed when released. Returns
    /// when all resources are destroyed.
    ///
    /// Every caller waits for the same shutdown. Dropping the returned
    /// future does not stop the shutdown.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        let started = {
            let mut sets = inner.lock();
            if sets.state == PoolState::Ready {
                sets.state = PoolState::ShuttingDown;
                let idle = std::mem::take(&mut sets.idle);
                sets.closing += idle.len();
                Some((idle, std::mem::take(&mut sets.queue)))
            } else {
                None
            }
        };

        if let Some((idle, queue)) = started {
            #[cfg(feature = "log")]
            log::debug!("pool shutting down, destroying {} idle resources", idle.len());

            for send in queue {
                let _ = send.send(Err(PoolError::InvalidState(PoolState::ShuttingDown).into()));
            }

            // not tied to this future
            for idle in idle {
                let _ = inner.destroy_later(idle.into_resource());
            }

            inner.backfill();
        }

        loop {
            let mut notified = pin!(inner.closed.notified());
            notified.as_mut().enable();
            let closed = inner.lock().state == PoolState::Closed;
            if closed {
                break;
            }
            notified.await;
        }
    }
}

impl<M: Manager> Inner<M> {
    fn lock(&self) -> MutexGuard<'_, Sets<M>> {
        self.sets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a resource for `caller`, or for the head of the queue if `None`.
    ///
    /// `wait` must already be incremented.
    fn spawn_create(self: &Arc<Self>, caller: Option<ReplySend<M>>) {
        let inner = self.clone();
        let task = async move {
            let result = inner.manager.create().await;
            match result {
                Ok(resource) => inner.created(resource, caller).await,
                Err(err) => {
                    #[cfg(feature = "log")]
                    log::error!("failed to create resource: {err}");

                    let send = {
                        let mut sets = inner.lock();
                        sets.wait -= 1;
                        caller.or_else(|| sets.queue.pop_front())
                    };
                    if let Some(send) = send {
                        let _ = send.send(Err(err));
                    }
                    inner.backfill();
                },
            }
        };

        if spawn(task).is_none() {
            self.lock().wait -= 1;
        }
    }

    async fn created(self: Arc<Self>, resource: M::Resource, caller: Option<ReplySend<M>>) {
        let accepted = {
            let mut sets = self.lock();
            sets.wait -= 1;
            if sets.state == PoolState::Ready {
                sets.busy += 1;
                true
            } else {
                sets.closing += 1;
                false
            }
        };

        if !accepted {
            if let Some(send) = caller {
                let _ = send.send(Err(PoolError::InvalidState(PoolState::ShuttingDown).into()));
            }
            self.manager.destroy(resource).await;
            self.after_destroy();
            return;
        }

        let pooled = Pooled::new(resource, self.clone());
        match caller {
            Some(send) => {
                if let Err(Ok(pooled)) = send.send(Ok(pooled)) {
                    #[cfg(feature = "log")]
                    log::debug!("acquirer is gone, destroying created resource");
                    pooled.destroy().await;
                }
            },
            // released to the queue or idle
            None => drop(pooled),
        }
    }

    /// Return a busy resource.
    fn release(self: &Arc<Self>, mut resource: M::Resource) {
        if self.manager.has_broken(&mut resource) {
            #[cfg(feature = "log")]
            log::debug!("released resource is broken, destroying");
            self.retire(resource);
            return;
        }

        let mut sets = self.lock();
        if sets.state != PoolState::Ready {
            drop(sets);
            self.retire(resource);
            return;
        }

        while let Some(send) = sets.queue.pop_front() {
            let Err(reply) = send.send(Ok(Pooled::new(resource, self.clone()))) else {
                return;
            };
            resource = match reply {
                Ok(pooled) => pooled.into_inner(),
                Err(_) => unreachable!("only `Ok` is sent"),
            };
        }

        sets.busy -= 1;
        let id = sets.next_id;
        sets.next_id += 1;
        let timer = self.options.idle_timeout.and_then(|timeout| {
            let pool = Arc::downgrade(self);
            spawn(evict(pool, id, timeout)).map(|task| task.abort_handle())
        });
        sets.idle.push_front(Idle { id, resource, timer });
    }

    /// Destroy a busy resource in the background.
    fn retire(self: &Arc<Self>, resource: M::Resource) {
        {
            let mut sets = self.lock();
            sets.busy -= 1;
            sets.closing += 1;
        }
        let _ = self.destroy_later(resource);
    }

    /// Destroy in the background, `closing` must already be incremented.
    fn destroy_later(self: &Arc<Self>, resource: M::Resource) -> Option<JoinHandle<()>> {
        let inner = self.clone();
        let task = async move {
            inner.manager.destroy(resource).await;
            inner.after_destroy();
        };
        let handle = spawn(task);
        if handle.is_none() {
            self.after_destroy();
        }
        handle
    }

    fn after_destroy(self: &Arc<Self>) {
        self.lock().closing -= 1;
        self.backfill();
    }

    /// Start creating a resource for queued acquirers when there is room,
    /// or complete the shutdown when everything is destroyed.
    fn backfill(self: &Arc<Self>) {
        let create = {
            let mut sets = self.lock();
            match sets.state {
                PoolState::Ready => {
                    let room = sets.total() < self.options.max;
                    if room && sets.live_waiters() > 0 {
                        sets.wait += 1;
                        true
                    } else {
                        false
                    }
                },
                PoolState::ShuttingDown => {
                    if sets.total() == 0 && sets.closing == 0 {
                        sets.state = PoolState::Closed;
                        self.closed.notify_waiters();
                        #[cfg(feature = "log")]
                        log::debug!("pool closed");
                    }
                    false
                },
                PoolState::Closed => false,
            }
        };

        if create {
            self.spawn_create(None);
        }
    }
}

async fn evict<M: Manager>(pool: Weak<Inner<M>>, id: u64, timeout: Duration) {
    sleep(timeout).await;

    let Some(inner) = pool.upgrade() else {
        return;
    };

    let resource = {
        let mut sets = inner.lock();
        let Some(idx) = sets.idle.iter().position(|idle| idle.id == id) else {
            return;
        };
        let Some(idle) = sets.idle.remove(idx) else {
            return;
        };
        sets.closing += 1;
        idle.resource
    };

    #[cfg(feature = "log")]
    log::debug!("idle timeout of {}ms is exceeded, destroying", timeout.as_millis());

    inner.manager.destroy(resource).await;
    inner.after_destroy();
}

/// Spawn a task if called inside the runtime.
fn spawn<F>(task: F) -> Option<JoinHandle<()>>
where
    F: Future<Output = ()> + Send + 'static,
{
    let handle = Handle::try_current().ok()?;
    Some(handle.spawn(task))
}

impl<M: Manager> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<M: Manager> fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pool").field(&self.status()).finish()
    }
}

/// A checked out resource.
///
/// Dropping it gives the resource back to the [`Pool`].
pub struct Pooled<M: Manager> {
    resource: Option<M::Resource>,
    pool: Arc<Inner<M>>,
}

impl<M: Manager> Pooled<M> {
    fn new(resource: M::Resource, pool: Arc<Inner<M>>) -> Self {
        Self { resource: Some(resource), pool }
    }

    fn into_inner(mut self) -> M::Resource {
        self.resource.take().expect("resource is only taken on drop")
    }

    /// Destroy the resource instead of giving it back.
    ///
    /// Dropping the returned future does not stop the destruction.
    pub async fn destroy(mut self) {
        let Some(resource) = self.resource.take() else {
            return;
        };
        let pool = self.pool.clone();
        {
            let mut sets = pool.lock();
            sets.busy -= 1;
            sets.closing += 1;
        }
        if let Some(task) = pool.destroy_later(resource) {
            let _ = task.await;
        }
    }
}

impl<M: Manager> Deref for Pooled<M> {
    type Target = M::Resource;

    fn deref(&self) -> &Self::Target {
        self.resource.as_ref().expect("resource is only taken on drop")
    }
}

impl<M: Manager> DerefMut for Pooled<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.resource.as_mut().expect("resource is only taken on drop")
    }
}

impl<M: Manager> Drop for Pooled<M> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.release(resource);
        }
    }
}

impl<M: Manager> fmt::Debug for Pooled<M>
where
    M::Resource: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pooled").field(&self.resource).finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    enum TestError {
        Pool(PoolError),
        Create,
    }

    impl From<PoolError> for TestError {
        fn from(value: PoolError) -> Self {
            Self::Pool(value)
        }
    }

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            fmt::Debug::fmt(self, f)
        }
    }

    #[derive(Default)]
    struct Counter {
        created: AtomicU32,
        /// creations in progress
        creating: AtomicU32,
        delay: Duration,
        destroy_delay: Duration,
        fail: AtomicBool,
        destroyed: Mutex<Vec<u32>>,
    }

    impl Counter {
        fn delayed(delay: Duration) -> Self {
            Self { delay, ..Default::default() }
        }

        fn destroyed(&self) -> Vec<u32> {
            self.destroyed.lock().unwrap().clone()
        }
    }

    impl Manager for Arc<Counter> {
        type Resource = u32;
        type Error = TestError;

        async fn create(&self) -> Result<u32, TestError> {
            self.creating.fetch_add(1, Ordering::SeqCst);
            sleep(self.delay).await;
            self.creating.fetch_sub(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(TestError::Create);
            }
            Ok(self.created.fetch_add(1, Ordering::SeqCst))
        }

        async fn destroy(&self, resource: u32) {
            if !self.destroy_delay.is_zero() {
                sleep(self.destroy_delay).await;
            }
            self.destroyed.lock().unwrap().push(resource);
        }

        fn has_broken(&self, resource: &mut u32) -> bool {
            *resource >= 100
        }
    }

    fn pool(counter: &Arc<Counter>, options: PoolOptions) -> Pool<Arc<Counter>> {
        Pool::new(counter.clone(), options)
    }

    fn status(pool: &Pool<Arc<Counter>>) -> (usize, usize, usize, usize, usize) {
        let s = pool.status();
        (s.idle, s.busy, s.wait, s.closing, s.queue)
    }

    #[tokio::test(start_paused = true)]
    async fn reuse_idle() {
        let counter = Arc::new(Counter::default());
        let pool = pool(&counter, PoolOptions::new().max(2));

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_eq!((*a, *b), (0, 1));
        assert_eq!(status(&pool), (0, 2, 0, 0, 0));

        drop(a);
        assert_eq!(status(&pool), (1, 1, 0, 0, 0));

        let c = pool.acquire().await.unwrap();
        assert_eq!(*c, 0);
        assert_eq!(counter.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_is_fifo() {
        let counter = Arc::new(Counter::default());
        let pool = pool(&counter, PoolOptions::new().max(1));
        let held = pool.acquire().await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        for n in 0..3 {
            let pool = pool.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let res = pool.acquire().await.unwrap();
                tx.send(n).unwrap();
                sleep(Duration::from_millis(10)).await;
                drop(res);
            });
            tokio::task::yield_now().await;
        }
        assert_eq!(status(&pool), (0, 1, 0, 0, 3));

        drop(held);
        let mut order = vec![];
        for _ in 0..3 {
            order.push(rx.recv().await.unwrap());
        }
        assert_eq!(order, [0, 1, 2]);
        assert_eq!(counter.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn late_resource_destroyed() {
        let counter = Arc::new(Counter::delayed(Duration::from_millis(2000)));
        let options = PoolOptions::new().max(1).acquire_timeout(Duration::from_millis(1000));
        let pool = pool(&counter, options);

        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err, TestError::Pool(PoolError::Timeout(Duration::from_millis(1000))));
        assert_eq!(err.to_string(), "Pool(\"timeout of 1000ms is exceeded\")");
        assert_eq!(status(&pool), (0, 0, 1, 0, 0));

        sleep(Duration::from_millis(1500)).await;
        assert_eq!(counter.destroyed(), [0]);
        assert_eq!(status(&pool), (0, 0, 0, 0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_acquire() {
        let counter = Arc::new(Counter::delayed(Duration::from_millis(100)));
        let pool = pool(&counter, PoolOptions::new().max(1));

        let task = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await.map(|_| ()) }
        });
        sleep(Duration::from_millis(10)).await;
        task.abort();

        sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.destroyed(), [0]);
        assert_eq!(status(&pool), (0, 0, 0, 0, 0));

        // slot is available again
        assert_eq!(*pool.acquire().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_backfills_waiter() {
        let counter = Arc::new(Counter::default());
        let pool = pool(&counter, PoolOptions::new().max(1));
        let held = pool.acquire().await.unwrap();

        let waiter = tokio::spawn({
            let pool = pool.clone();
            async move { *pool.acquire().await.unwrap() }
        });
        tokio::task::yield_now().await;

        held.destroy().await;
        assert_eq!(waiter.await.unwrap(), 1);
        assert_eq!(counter.destroyed(), [0]);
    }

    #[tokio::test(start_paused = true)]
    async fn broken_resource_destroyed() {
        let counter = Arc::new(Counter::default());
        let pool = pool(&counter, PoolOptions::new().max(1));

        let mut res = pool.acquire().await.unwrap();
        *res = 100;
        drop(res);
        tokio::task::yield_now().await;

        assert_eq!(counter.destroyed(), [100]);
        assert_eq!(status(&pool), (0, 0, 0, 0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn create_failure() {
        let counter = Arc::new(Counter::default());
        counter.fail.store(true, Ordering::SeqCst);
        let pool = pool(&counter, PoolOptions::new().max(1));

        assert_eq!(pool.acquire().await.unwrap_err(), TestError::Create);
        assert_eq!(status(&pool), (0, 0, 0, 0, 0));

        counter.fail.store(false, Ordering::SeqCst);
        assert_eq!(*pool.acquire().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_evicts() {
        let counter = Arc::new(Counter::default());
        let options = PoolOptions::new().max(2).idle_timeout(Duration::from_secs(30));
        let pool = pool(&counter, options);

        drop(pool.acquire().await.unwrap());
        assert_eq!(status(&pool), (1, 0, 0, 0, 0));

        sleep(Duration::from_secs(10)).await;
        // reacquire resets the timer
        drop(pool.acquire().await.unwrap());

        sleep(Duration::from_secs(25)).await;
        assert_eq!(status(&pool), (1, 0, 0, 0, 0));

        sleep(Duration::from_secs(10)).await;
        assert_eq!(counter.destroyed(), [0]);
        assert_eq!(status(&pool), (0, 0, 0, 0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_destroys_idle() {
        let counter = Arc::new(Counter::default());
        let pool = pool(&counter, PoolOptions::new().max(2));

        drop(pool.acquire().await.unwrap());
        assert_eq!(status(&pool), (1, 0, 0, 0, 0));

        pool.shutdown().await;
        assert_eq!(pool.status().state, PoolState::Closed);
        assert_eq!(counter.destroyed(), [0]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_busy() {
        let counter = Arc::new(Counter::default());
        let pool = pool(&counter, PoolOptions::new().max(2));

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let waiter = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await.map(|_| ()) }
        });
        tokio::task::yield_now().await;
        assert_eq!(status(&pool), (0, 2, 0, 0, 1));

        let shutdown = tokio::spawn({
            let pool = pool.clone();
            async move { pool.shutdown().await }
        });
        tokio::task::yield_now().await;

        let shutting_down = TestError::Pool(PoolError::InvalidState(PoolState::ShuttingDown));
        assert_eq!(pool.status().state, PoolState::ShuttingDown);
        assert_eq!(waiter.await.unwrap().unwrap_err(), shutting_down);
        assert_eq!(pool.acquire().await.unwrap_err(), shutting_down);

        drop(b);
        tokio::task::yield_now().await;
        assert_eq!(counter.destroyed(), [1]);
        assert!(!shutdown.is_finished());

        drop(a);
        shutdown.await.unwrap();
        assert_eq!(pool.status().state, PoolState::Closed);
        assert_eq!(status(&pool), (0, 0, 0, 0, 0));
        assert_eq!(counter.destroyed(), [1, 0]);

        // already closed
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_shutdown_completes() {
        let counter = Arc::new(Counter { destroy_delay: Duration::from_millis(100), ..Default::default() });
        let pool = pool(&counter, PoolOptions::new().max(3));

        let held = [pool.acquire().await.unwrap(), pool.acquire().await.unwrap(), pool.acquire().await.unwrap()];
        drop(held);
        assert_eq!(status(&pool), (3, 0, 0, 0, 0));

        let cancelled = tokio::time::timeout(Duration::from_millis(50), pool.shutdown()).await;
        assert!(cancelled.is_err());
        assert_eq!(pool.status().state, PoolState::ShuttingDown);
        assert_eq!(status(&pool), (0, 0, 0, 3, 0));

        // every caller waits for the same shutdown
        let other = tokio::spawn({
            let pool = pool.clone();
            async move { pool.shutdown().await }
        });
        pool.shutdown().await;
        other.await.unwrap();

        assert_eq!(pool.status().state, PoolState::Closed);
        assert_eq!(status(&pool), (0, 0, 0, 0, 0));
        let mut destroyed = counter.destroyed();
        destroyed.sort();
        assert_eq!(destroyed, [0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_destroy_completes() {
        let counter = Arc::new(Counter { destroy_delay: Duration::from_millis(100), ..Default::default() });
        let pool = pool(&counter, PoolOptions::new().max(1));

        let res = pool.acquire().await.unwrap();
        let cancelled = tokio::time::timeout(Duration::from_millis(50), res.destroy()).await;
        assert!(cancelled.is_err());
        assert_eq!(status(&pool), (0, 0, 0, 1, 0));

        sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.destroyed(), [0]);
        assert_eq!(status(&pool), (0, 0, 0, 0, 0));
    }

    fn assert_counts(counter: &Counter, pool: &Pool<Arc<Counter>>, max: usize) {
        let s = pool.status();
        let created = counter.created.load(Ordering::SeqCst) as usize;
        let destroyed = counter.destroyed().len();
        assert_eq!(created - destroyed, s.idle + s.busy + s.closing, "{s:?}");
        assert!(counter.creating.load(Ordering::SeqCst) as usize <= s.wait, "{s:?}");
        assert!(s.idle + s.busy + s.wait <= max, "{s:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn random_operations_keep_counts() {
        use rand::{Rng, SeedableRng, rngs::StdRng};

        const MAX: usize = 4;
        type Acquiring = JoinHandle<Result<Pooled<Arc<Counter>>, TestError>>;

        for seed in 0..8 {
            let counter = Arc::new(Counter {
                delay: Duration::from_millis(20),
                destroy_delay: Duration::from_millis(5),
                ..Default::default()
            });
            let options = PoolOptions::new()
                .max(MAX)
                .acquire_timeout(Duration::from_millis(50))
                .idle_timeout(Duration::from_millis(200));
            let pool = pool(&counter, options);

            let mut rng = StdRng::seed_from_u64(seed);
            let mut held: Vec<Pooled<Arc<Counter>>> = vec![];
            let mut pending: Vec<Acquiring> = vec![];

            for _ in 0..300 {
                match rng.random_range(0..7) {
                    0 | 1 => pending.push(tokio::spawn({
                        let pool = pool.clone();
                        async move { pool.acquire().await }
                    })),
                    2 if !held.is_empty() => {
                        let mut res = held.swap_remove(rng.random_range(0..held.len()));
                        if rng.random_bool(0.2) {
                            // broken
                            *res += 100;
                        }
                        drop(res);
                    },
                    3 if !held.is_empty() => {
                        held.swap_remove(rng.random_range(0..held.len())).destroy().await;
                    },
                    4 if !pending.is_empty() => pending[rng.random_range(0..pending.len())].abort(),
                    5 => counter.fail.store(rng.random_bool(0.3), Ordering::SeqCst),
                    _ => sleep(Duration::from_millis(rng.random_range(0..30))).await,
                }

                let mut i = 0;
                while i < pending.len() {
                    if !pending[i].is_finished() {
                        i += 1;
                        continue;
                    }
                    match pending.swap_remove(i).await {
                        Ok(Ok(res)) => held.push(res),
                        Ok(Err(TestError::Create | TestError::Pool(PoolError::Timeout(_)))) => { },
                        Ok(Err(err)) => panic!("unexpected acquire error: {err}"),
                        Err(err) => assert!(err.is_cancelled()),
                    }
                }

                assert_counts(&counter, &pool, MAX);
            }

            for acquiring in &pending {
                acquiring.abort();
            }
            for acquiring in pending {
                if let Ok(Ok(res)) = acquiring.await {
                    held.push(res);
                }
            }
            drop(held);
            assert_counts(&counter, &pool, MAX);

            pool.shutdown().await;
            assert_eq!(pool.status().state, PoolState::Closed);
            assert_eq!(status(&pool), (0, 0, 0, 0, 0));
            assert_eq!(counter.created.load(Ordering::SeqCst) as usize, counter.destroyed().len());
        }
    }
}
