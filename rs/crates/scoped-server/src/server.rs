use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use scoped_context::RequestContext;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{HandlerConfig, ServerConfig};
use crate::error::ServerError;
use crate::handler::handle_connection;
use crate::scheduler::{Scheduler, ShutdownMode, ShutdownStats};

/// Back-off after an accept error that is not caused by shutdown
/// (e.g. the process ran out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

// ── Lifecycle ───────────────────────────────────────────────────────

/// Lifecycle of the listening socket.
///
/// `Created → Bound → Accepting → Stopping → Closed`. A failed bind falls
/// back to `Created`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Created = 0,
    Bound = 1,
    Accepting = 2,
    Stopping = 3,
    Closed = 4,
}

impl Phase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Bound,
            2 => Self::Accepting,
            3 => Self::Stopping,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Bound => write!(f, "Bound"),
            Self::Accepting => write!(f, "Accepting"),
            Self::Stopping => write!(f, "Stopping"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

// ── Shared state ────────────────────────────────────────────────────

/// State shared between the accept loop and whoever calls `stop()`.
#[derive(Debug)]
struct ServerState {
    requested_port: u16,
    /// Set once by a successful bind.
    bound: OnceLock<SocketAddr>,
    running: AtomicBool,
    phase: AtomicU8,
    /// Source of `conn-<n>` task names.
    task_counter: AtomicU64,
}

impl ServerState {
    fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    fn transition(&self, from: Phase, to: Phase) -> Result<(), Phase> {
        self.phase
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(Phase::from_u8)
    }
}

/// Raw TCP server: one scheduled task per accepted connection.
#[derive(Debug)]
pub struct Server {
    config: ServerConfig,
    state: Arc<ServerState>,
    scheduler: Arc<Scheduler>,
    shutdown_tx: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Server on `127.0.0.1:port` with default settings. Port 0 picks an
    /// ephemeral port.
    pub fn new(port: u16) -> Self {
        Self::with_config(ServerConfig::with_port(port))
    }

    pub fn with_config(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Server {
            scheduler: Arc::new(Scheduler::new(config.spawn_mode)),
            state: Arc::new(ServerState {
                requested_port: config.port,
                bound: OnceLock::new(),
                running: AtomicBool::new(false),
                phase: AtomicU8::new(Phase::Created as u8),
                task_counter: AtomicU64::new(0),
            }),
            config,
            shutdown_tx,
            accept_task: Mutex::new(None),
        }
    }

    /// Bind and start accepting. Returns the bound port as soon as the socket
    /// is listening; accepting continues on its own task.
    pub async fn start(&self) -> Result<u16, ServerError> {
        self.state
            .transition(Phase::Created, Phase::Bound)
            .map_err(ServerError::InvalidPhase)?;

        let addr = SocketAddr::new(self.config.host, self.state.requested_port);
        let listener = match TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(source) => {
                self.state.set_phase(Phase::Created);
                return Err(ServerError::Bind { addr, source });
            }
        };
        let local = match listener.local_addr() {
            Ok(a) => a,
            Err(e) => {
                self.state.set_phase(Phase::Created);
                return Err(e.into());
            }
        };

        let _ = self.state.bound.set(local);
        self.state.running.store(true, Ordering::Release);
        self.state.set_phase(Phase::Accepting);

        let task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.state),
            Arc::clone(&self.scheduler),
            self.config.handler.clone(),
            self.shutdown_tx.subscribe(),
        ));
        *self.accept_task.lock().await = Some(task);

        info!(addr = %local, mode = ?self.config.spawn_mode, "server started");
        Ok(local.port())
    }

    /// Stop accepting and release the listening socket. In-flight connections
    /// keep running. Safe to call repeatedly and from any task.
    pub async fn stop(&self) {
        self.state.running.store(false, Ordering::Release);
        if self.state.phase() == Phase::Created {
            return;
        }
        let _ = self.state.transition(Phase::Accepting, Phase::Stopping);
        self.shutdown_tx.send_replace(true);

        // Held across the await so a concurrent caller returns only once the
        // socket is released.
        let mut accept_task = self.accept_task.lock().await;
        if let Some(task) = accept_task.take() {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!("accept loop panicked");
                }
            }
            self.state.set_phase(Phase::Closed);
            info!(port = self.port(), "server stopped");
        }
    }

    /// `stop()` followed by scheduler shutdown in the given mode.
    pub async fn shutdown(&self, mode: ShutdownMode) -> ShutdownStats {
        self.stop().await;
        self.scheduler.shutdown(mode).await
    }

    /// `stop()` followed by a drain bounded by the configured drain timeout.
    pub async fn shutdown_gracefully(&self) -> ShutdownStats {
        self.stop().await;
        self.scheduler.shutdown_within(self.config.drain_timeout).await
    }

    /// Bound port, or 0 before the socket is bound.
    pub fn port(&self) -> u16 {
        self.local_addr().map_or(0, |a| a.port())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.bound.get().copied()
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }

    /// Connections accepted so far.
    pub fn accepted(&self) -> u64 {
        self.state.task_counter.load(Ordering::Relaxed)
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.state.running.store(false, Ordering::Release);
        self.shutdown_tx.send_replace(true);
    }
}

// ── Accept loop ─────────────────────────────────────────────────────

async fn accept_loop(
    listener: TcpListener,
    state: Arc<ServerState>,
    scheduler: Arc<Scheduler>,
    handler: HandlerConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let accepted = tokio::select! {
            res = listener.accept() => res,
            _ = shutdown.changed() => break,
        };

        match accepted {
            Ok((stream, peer)) => {
                let ctx = RequestContext::now();
                let n = state.task_counter.fetch_add(1, Ordering::Relaxed) + 1;
                let name = format!("conn-{}", n);
                debug!(task = %name, %peer, "connection accepted");
                let work = handle_connection(stream, peer, ctx, handler.clone());
                if let Err(e) = scheduler.submit(name, work) {
                    warn!(%peer, error = %e, "connection dropped");
                }
            }
            Err(_) if !state.running.load(Ordering::Acquire) => break,
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    debug!("accept loop exited");
}
