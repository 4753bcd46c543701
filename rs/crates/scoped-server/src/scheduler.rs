//! Task-per-unit-of-work scheduler.
//!
//! Every submitted future gets its own task; nothing is pooled or queued. The
//! scheduler only keeps enough bookkeeping (an abort handle per live task and a
//! live-task counter) to support graceful and immediate shutdown.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, warn};

use crate::config::SpawnMode;
use crate::error::{ServerError, TaskError};

tokio::task_local! {
    static TASK: TaskInfo;
}

/// Which kind of execution unit is running a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// A runtime-multiplexed tokio task.
    Lightweight,
    /// A dedicated OS thread.
    OsThread,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Lightweight => "lightweight",
            TaskKind::OsThread => "os-thread",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<SpawnMode> for TaskKind {
    fn from(mode: SpawnMode) -> Self {
        match mode {
            SpawnMode::Task => TaskKind::Lightweight,
            SpawnMode::Thread => TaskKind::OsThread,
        }
    }
}

/// Identity of the running task, readable from anywhere inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    name: String,
    kind: TaskKind,
}

impl TaskInfo {
    pub fn new(name: impl Into<String>, kind: TaskKind) -> Self {
        TaskInfo {
            name: name.into(),
            kind,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }
}

/// Identity of the current task, `None` outside scheduled work.
pub fn current_task() -> Option<TaskInfo> {
    TASK.try_with(|t| t.clone()).ok()
}

/// Run `fut` under the given identity without spawning. Used by transports
/// that already own a per-request task.
pub async fn run_as<F>(info: TaskInfo, fut: F) -> F::Output
where
    F: Future,
{
    TASK.scope(info, fut).await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Wait for every in-flight task to finish.
    Graceful,
    /// Abort outstanding tasks and return without waiting.
    Immediate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownStats {
    /// Tasks still running when shutdown began.
    pub in_flight: usize,
    pub aborted: usize,
}

/// Handle to one submitted task. Dropping it detaches the task.
#[derive(Debug)]
pub struct TaskHandle {
    name: String,
    join: JoinHandle<()>,
}

impl TaskHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request cancellation. Only effective for lightweight tasks, or for
    /// OS-thread tasks that have not started yet.
    pub fn abort(&self) {
        self.join.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn join(self) -> Result<(), TaskError> {
        match self.join.await {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancelled() => Err(TaskError::Cancelled { name: self.name }),
            Err(_) => Err(TaskError::Panicked { name: self.name }),
        }
    }
}

#[derive(Debug)]
struct Inner {
    closed: AtomicBool,
    /// Set once an immediate shutdown has run; tasks registered later are
    /// aborted on registration.
    aborting: AtomicBool,
    next_key: AtomicU64,
    live: Mutex<HashMap<u64, Option<AbortHandle>>>,
    active: watch::Sender<usize>,
}

impl Inner {
    fn live(&self) -> MutexGuard<'_, HashMap<u64, Option<AbortHandle>>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bookkeeping owned by a running task; dropped on completion, panic, or abort.
struct Slot {
    key: u64,
    name: String,
    inner: Arc<Inner>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        if std::thread::panicking() {
            error!(task = %self.name, "task panicked");
        }
        self.inner.live().remove(&self.key);
        self.inner.active.send_modify(|n| *n = n.saturating_sub(1));
    }
}

#[derive(Debug)]
pub struct Scheduler {
    mode: SpawnMode,
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(mode: SpawnMode) -> Self {
        let (active, _) = watch::channel(0);
        Scheduler {
            mode,
            inner: Arc::new(Inner {
                closed: AtomicBool::new(false),
                aborting: AtomicBool::new(false),
                next_key: AtomicU64::new(0),
                live: Mutex::new(HashMap::new()),
                active,
            }),
        }
    }

    pub fn mode(&self) -> SpawnMode {
        self.mode
    }

    pub fn kind(&self) -> TaskKind {
        self.mode.into()
    }

    /// Tasks submitted and not yet finished.
    pub fn active(&self) -> usize {
        *self.inner.active.borrow()
    }

    pub fn total_submitted(&self) -> u64 {
        self.inner.next_key.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Schedule `work` on its own task and return immediately.
    ///
    /// An `Err` returned by `work` is logged and confined to its task, as is
    /// a panic.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn submit<F, E>(&self, name: impl Into<String>, work: F) -> Result<TaskHandle, ServerError>
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let name = name.into();
        let key = self.reserve()?;
        let slot = Slot {
            key,
            name: name.clone(),
            inner: Arc::clone(&self.inner),
        };

        let info = TaskInfo::new(name.clone(), self.kind());
        let task = TASK.scope(info, async move {
            let slot = slot;
            if let Err(e) = work.await {
                warn!(task = %slot.name, error = %e, "task failed");
            }
        });

        let join = match self.mode {
            SpawnMode::Task => tokio::spawn(task),
            SpawnMode::Thread => {
                let handle = Handle::current();
                tokio::task::spawn_blocking(move || handle.block_on(task))
            }
        };
        self.register(key, join.abort_handle());

        debug!(task = %name, kind = %self.kind(), "task submitted");
        Ok(TaskHandle { name, join })
    }

    /// Claim a live slot for a task about to be spawned.
    fn reserve(&self) -> Result<u64, ServerError> {
        let mut live = self.inner.live();
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ServerError::SchedulerClosed);
        }
        let key = self.inner.next_key.fetch_add(1, Ordering::Relaxed);
        live.insert(key, None);
        self.inner.active.send_modify(|n| *n += 1);
        Ok(key)
    }

    /// Attach the abort handle of a spawned task to its slot. A task that
    /// already finished has removed its entry and is not re-registered; one
    /// spawned after `abort_all` ran is aborted here.
    fn register(&self, key: u64, handle: AbortHandle) {
        let mut live = self.inner.live();
        if let Some(entry) = live.get_mut(&key) {
            if self.inner.aborting.load(Ordering::Acquire) {
                handle.abort();
            }
            *entry = Some(handle);
        }
    }

    /// Stop accepting work and either drain or abort what is in flight.
    /// Safe to call more than once.
    pub async fn shutdown(&self, mode: ShutdownMode) -> ShutdownStats {
        let in_flight = self.close();
        let aborted = match mode {
            ShutdownMode::Graceful => {
                self.drained().await;
                0
            }
            ShutdownMode::Immediate => self.abort_all(),
        };
        debug!(in_flight, aborted, ?mode, "scheduler shut down");
        ShutdownStats { in_flight, aborted }
    }

    /// Graceful shutdown bounded by `timeout`; whatever is still running
    /// afterwards is aborted.
    pub async fn shutdown_within(&self, timeout: Duration) -> ShutdownStats {
        let in_flight = self.close();
        if tokio::time::timeout(timeout, self.drained()).await.is_ok() {
            return ShutdownStats {
                in_flight,
                aborted: 0,
            };
        }
        warn!(remaining = self.active(), ?timeout, "drain timed out, aborting");
        ShutdownStats {
            in_flight,
            aborted: self.abort_all(),
        }
    }

    fn close(&self) -> usize {
        let _live = self.inner.live();
        self.inner.closed.store(true, Ordering::Release);
        self.active()
    }

    async fn drained(&self) {
        let mut rx = self.inner.active.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    fn abort_all(&self) -> usize {
        let live = self.inner.live();
        if self.mode == SpawnMode::Thread {
            if !live.is_empty() {
                warn!(detached = live.len(), "os-thread tasks cannot be cancelled");
            }
            return 0;
        }
        self.inner.aborting.store(true, Ordering::Release);
        // Unregistered entries are aborted by `register`.
        for handle in live.values().flatten() {
            handle.abort();
        }
        live.len()
    }
}
