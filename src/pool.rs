//! Execution pool for CPU-heavy decode and warp work.
//!
//! Tile reads run on a dedicated rayon thread pool instead of the async
//! runtime's workers. The pool is an explicit state machine:
//!
//! ```text
//! Uninitialized ──first submit──▶ Ready ──task panics──▶ Broken
//!                                   ▲                      │
//!                                   └──────next submit─────┘
//! ```
//!
//! - The thread pool is only built when the first task is submitted.
//! - With parallelism disabled, or when building the parallel pool fails,
//!   a single-worker pool is used instead.
//! - A panicking task marks the pool broken. The pool is rebuilt and the
//!   task retried once; a second failure is returned to the caller.
//!
//! Callers either await a [`PendingTask`] or block with
//! [`ExecutionPool::execute`].

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use rayon::{ThreadPool, ThreadPoolBuilder};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::PoolError;

/// Default number of parallel workers.
pub const DEFAULT_WORKERS: usize = 3;

/// Number of times a task is retried after the pool broke.
const MAX_RETRIES: usize = 1;

// =============================================================================
// State
// =============================================================================

/// Observable lifecycle state of an [`ExecutionPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStatus {
    Uninitialized,
    Ready,
    Broken,
}

enum PoolState {
    Uninitialized,
    Ready(Arc<ThreadPool>),
    Broken,
}

struct PoolInner {
    workers: usize,
    parallel: bool,
    state: Mutex<PoolState>,
}

type TaskResult<T> = Result<T, Box<dyn Any + Send>>;

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

// =============================================================================
// ExecutionPool
// =============================================================================

/// Lazily created, self-healing worker pool. Cloning shares the pool.
#[derive(Clone)]
pub struct ExecutionPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for ExecutionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionPool")
            .field("workers", &self.inner.workers)
            .field("parallel", &self.inner.parallel)
            .field("status", &self.status())
            .finish()
    }
}

impl Default for ExecutionPool {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS, true)
    }
}

impl ExecutionPool {
    /// Create a pool of `workers` threads. Nothing is started until the
    /// first submission. With `parallel` off a single worker is used.
    pub fn new(workers: usize, parallel: bool) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                workers: workers.max(1),
                parallel,
                state: Mutex::new(PoolState::Uninitialized),
            }),
        }
    }

    pub fn status(&self) -> PoolStatus {
        match *self.lock() {
            PoolState::Uninitialized => PoolStatus::Uninitialized,
            PoolState::Ready(_) => PoolStatus::Ready,
            PoolState::Broken => PoolStatus::Broken,
        }
    }

    /// Number of threads the current pool runs, 0 before initialization.
    pub fn current_workers(&self) -> usize {
        match &*self.lock() {
            PoolState::Ready(pool) => pool.current_num_threads(),
            _ => 0,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the live thread pool, building it if needed.
    fn acquire(&self) -> Result<Arc<ThreadPool>, PoolError> {
        let mut state = self.lock();
        match &*state {
            PoolState::Ready(pool) => return Ok(pool.clone()),
            PoolState::Broken => warn!("Recreating broken worker pool"),
            PoolState::Uninitialized => debug!("Creating worker pool"),
        }

        let pool = Arc::new(self.build()?);
        *state = PoolState::Ready(pool.clone());
        Ok(pool)
    }

    fn build(&self) -> Result<ThreadPool, PoolError> {
        let single = || {
            ThreadPoolBuilder::new()
                .num_threads(1)
                .thread_name(|i| format!("rastertile-worker-{}", i))
                .build()
                .map_err(|e| PoolError::Unavailable(e.to_string()))
        };

        if !self.inner.parallel {
            info!("Parallel workers disabled, using a single worker");
            return single();
        }

        match ThreadPoolBuilder::new()
            .num_threads(self.inner.workers)
            .thread_name(|i| format!("rastertile-worker-{}", i))
            .build()
        {
            Ok(pool) => Ok(pool),
            Err(e) => {
                warn!(
                    error = %e,
                    "Could not start parallel workers, falling back to a single worker; \
                     tile reads will be slower"
                );
                single()
            }
        }
    }

    /// Drop the pool after a worker failure. Only the pool that failed is
    /// discarded, so a concurrent rebuild is not thrown away.
    fn mark_broken(&self, failed: &Arc<ThreadPool>) {
        let mut state = self.lock();
        if let PoolState::Ready(current) = &*state {
            if Arc::ptr_eq(current, failed) {
                *state = PoolState::Broken;
            }
        }
    }

    /// Start `task` on the pool.
    fn spawn<T, F>(
        &self,
        task: &Arc<F>,
    ) -> Result<(Arc<ThreadPool>, oneshot::Receiver<TaskResult<T>>), PoolError>
    where
        T: Send + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let pool = self.acquire()?;
        let (tx, rx) = oneshot::channel();
        let task = task.clone();
        pool.spawn(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| task()));
            let _ = tx.send(result);
        });
        Ok((pool, rx))
    }

    /// Turn one attempt's outcome into a result, marking the pool broken on
    /// failure.
    fn settle<T>(
        &self,
        pool: &Arc<ThreadPool>,
        outcome: Result<TaskResult<T>, oneshot::error::RecvError>,
    ) -> Result<T, PoolError> {
        let message = match outcome {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(payload)) => panic_message(payload.as_ref()),
            Err(_) => "worker exited without a result".to_string(),
        };
        warn!(error = %message, "Worker failed, discarding pool");
        self.mark_broken(pool);
        Err(PoolError::Broken(message))
    }

    /// Submit `task` and return a handle resolving to its result.
    ///
    /// The task starts immediately. If the pool breaks while running it, the
    /// pool is rebuilt and the task retried once.
    pub fn submit<T, F>(&self, task: F) -> PendingTask<T>
    where
        T: Send + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let task = Arc::new(task);
        let first = self.spawn(&task);
        let pool = self.clone();

        PendingTask::from_future(async move {
            let (handle, rx) = first?;
            let mut result = pool.settle(&handle, rx.await);
            for _ in 0..MAX_RETRIES {
                if result.is_ok() {
                    break;
                }
                let (handle, rx) = pool.spawn(&task)?;
                result = pool.settle(&handle, rx.await);
            }
            result
        })
    }

    /// Run `task` and block the calling thread until it finishes.
    ///
    /// Must not be called from within an async runtime; use [`submit`]
    /// there.
    ///
    /// [`submit`]: ExecutionPool::submit
    pub fn execute<T, F>(&self, task: F) -> Result<T, PoolError>
    where
        T: Send + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let task = Arc::new(task);
        let mut result = Err(PoolError::Unavailable("task was not run".to_string()));
        for _ in 0..=MAX_RETRIES {
            let (handle, rx) = self.spawn(&task)?;
            result = self.settle(&handle, rx.blocking_recv());
            if result.is_ok() {
                break;
            }
        }
        result
    }
}

// =============================================================================
// PendingTask
// =============================================================================

/// Handle to a submitted task, or an already available value.
pub struct PendingTask<T> {
    inner: PendingInner<T>,
}

enum PendingInner<T> {
    Ready(Option<Result<T, PoolError>>),
    Running(Pin<Box<dyn Future<Output = Result<T, PoolError>> + Send>>),
}

impl<T> PendingTask<T> {
    /// A handle that is already resolved.
    pub fn ready(value: T) -> Self {
        Self {
            inner: PendingInner::Ready(Some(Ok(value))),
        }
    }

    /// A handle that is already resolved with an error.
    pub fn failed(error: PoolError) -> Self {
        Self {
            inner: PendingInner::Ready(Some(Err(error))),
        }
    }

    pub fn from_future(future: impl Future<Output = Result<T, PoolError>> + Send + 'static) -> Self {
        Self {
            inner: PendingInner::Running(Box::pin(future)),
        }
    }

    /// Whether the value was available at creation (e.g. a cache hit).
    pub fn is_ready(&self) -> bool {
        matches!(self.inner, PendingInner::Ready(_))
    }

    /// Transform the eventual value.
    pub fn map<U, G>(self, f: G) -> PendingTask<U>
    where
        T: Send + 'static,
        U: Send + 'static,
        G: FnOnce(T) -> U + Send + 'static,
    {
        match self.inner {
            PendingInner::Ready(Some(result)) => PendingTask {
                inner: PendingInner::Ready(Some(result.map(f))),
            },
            PendingInner::Ready(None) => PendingTask::failed(PoolError::Unavailable(
                "task result already taken".to_string(),
            )),
            PendingInner::Running(future) => {
                PendingTask::from_future(async move { future.await.map(f) })
            }
        }
    }
}

// The value is never pinned in place
impl<T> Unpin for PendingTask<T> {}

impl<T> Future for PendingTask<T> {
    type Output = Result<T, PoolError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            PendingInner::Ready(value) => Poll::Ready(value.take().unwrap_or_else(|| {
                Err(PoolError::Unavailable(
                    "task result already taken".to_string(),
                ))
            })),
            PendingInner::Running(future) => future.as_mut().poll(cx),
        }
    }
}

impl<T> fmt::Debug for PendingTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTask")
            .field("ready", &self.is_ready())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
