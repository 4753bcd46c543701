//! HTTP transport on axum with the same start/stop/port contract as
//! [`Server`](crate::Server). Each request still gets a fresh context bound
//! for its extent and a `http-<n>` task identity.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use scoped_context::RequestContext;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::{HandlerConfig, ServerConfig};
use crate::error::{ConnectionError, ServerError};
use crate::handler::render_greeting;
use crate::scheduler::{self, TaskInfo, TaskKind};
use crate::server::Phase;

// ── Shared state ────────────────────────────────────────────────────

pub struct HttpState {
    handler: HandlerConfig,
    /// Source of `http-<n>` task names; counts every request that entered.
    accepted: AtomicU64,
    /// Requests that completed with a greeting.
    served: AtomicU64,
    in_flight: AtomicU64,
}

impl HttpState {
    pub fn new(handler: HandlerConfig) -> Self {
        HttpState {
            handler,
            accepted: AtomicU64::new(0),
            served: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
        }
    }
}

struct InFlight<'a>(&'a AtomicU64);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicU64) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        InFlight(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

// ── Router ──────────────────────────────────────────────────────────

pub fn router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/", get(greet))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    accepted: u64,
    served: u64,
    in_flight: u64,
}

async fn greet(State(state): State<Arc<HttpState>>) -> Result<String, ConnectionError> {
    let _in_flight = InFlight::enter(&state.in_flight);
    let n = state.accepted.fetch_add(1, Ordering::Relaxed) + 1;
    let task = TaskInfo::new(format!("http-{}", n), TaskKind::Lightweight);
    let delay = state.handler.io_delay;

    let body = async move {
        tokio::time::sleep(delay).await;
        render_greeting()
    };
    let greeting = scheduler::run_as(task, scoped_context::scope(RequestContext::now(), body)).await?;
    state.served.fetch_add(1, Ordering::Relaxed);
    Ok(greeting)
}

async fn health() -> &'static str {
    "ok"
}

async fn stats(State(state): State<Arc<HttpState>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        accepted: state.accepted.load(Ordering::Relaxed),
        served: state.served.load(Ordering::Relaxed),
        in_flight: state.in_flight.load(Ordering::Relaxed),
    })
}

impl IntoResponse for ConnectionError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.to_string() });
        (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
    }
}

// ── Server ──────────────────────────────────────────────────────────

pub struct HttpServer {
    config: ServerConfig,
    state: Arc<HttpState>,
    started: AtomicBool,
    bound: OnceLock<SocketAddr>,
    shutdown_tx: watch::Sender<bool>,
    serve_task: Mutex<Option<JoinHandle<()>>>,
}

impl HttpServer {
    pub fn new(port: u16) -> Self {
        Self::with_config(ServerConfig::with_port(port))
    }

    pub fn with_config(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        HttpServer {
            state: Arc::new(HttpState::new(config.handler.clone())),
            config,
            started: AtomicBool::new(false),
            bound: OnceLock::new(),
            shutdown_tx,
            serve_task: Mutex::new(None),
        }
    }

    pub async fn start(&self) -> Result<u16, ServerError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ServerError::InvalidPhase(Phase::Accepting));
        }

        let addr = SocketAddr::new(self.config.host, self.config.port);
        let listener = match TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(source) => {
                self.started.store(false, Ordering::Release);
                return Err(ServerError::Bind { addr, source });
            }
        };
        let local = match listener.local_addr() {
            Ok(a) => a,
            Err(e) => {
                self.started.store(false, Ordering::Release);
                return Err(e.into());
            }
        };
        let _ = self.bound.set(local);

        let app = router(Arc::clone(&self.state));
        self.shutdown_tx.send_replace(false);
        let mut rx = self.shutdown_tx.subscribe();
        let signal = async move {
            while !*rx.borrow() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        };
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(signal)
                .await
            {
                error!(error = %e, "http server failed");
            }
        });
        *self.serve_task.lock().await = Some(task);

        info!(addr = %local, "http server started");
        Ok(local.port())
    }

    /// Stop accepting, let open requests finish, release the socket.
    /// Safe to call repeatedly; a no-op before `start()`.
    pub async fn stop(&self) {
        if !self.started.load(Ordering::Acquire) {
            return;
        }
        self.shutdown_tx.send_replace(true);
        let mut serve_task = self.serve_task.lock().await;
        if let Some(task) = serve_task.take() {
            let _ = task.await;
            info!(port = self.port(), "http server stopped");
        }
    }

    pub fn port(&self) -> u16 {
        self.bound.get().map_or(0, |a| a.port())
    }

    pub fn served(&self) -> u64 {
        self.state.served.load(Ordering::Relaxed)
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fast_state() -> Arc<HttpState> {
        Arc::new(HttpState::new(HandlerConfig {
            io_delay: Duration::from_millis(5),
            ..HandlerConfig::default()
        }))
    }

    #[tokio::test]
    async fn test_greet_binds_context_and_identity() {
        let state = fast_state();
        let body = greet(State(Arc::clone(&state))).await.unwrap();
        assert!(body.contains("Hello from lightweight task: http-1"));
        assert!(body.contains("Request started at: "));
        assert_eq!(state.in_flight.load(Ordering::Relaxed), 0);
        assert!(!scoped_context::is_bound());
    }

    #[tokio::test]
    async fn test_stats_counts_requests() {
        let state = fast_state();
        greet(State(Arc::clone(&state))).await.unwrap();
        greet(State(Arc::clone(&state))).await.unwrap();
        let Json(stats) = stats(State(state)).await;
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.served, 2);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_served_counts_only_completed_requests() {
        let state = Arc::new(HttpState::new(HandlerConfig {
            io_delay: Duration::from_millis(200),
            ..HandlerConfig::default()
        }));
        let pending = tokio::spawn(greet(State(Arc::clone(&state))));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let Json(during) = stats(State(Arc::clone(&state))).await;
        assert_eq!(during.accepted, 1);
        assert_eq!(during.served, 0);
        assert_eq!(during.in_flight, 1);

        pending.abort();
        assert!(pending.await.unwrap_err().is_cancelled());
        let Json(after) = stats(State(state)).await;
        assert_eq!(after.accepted, 1);
        assert_eq!(after.served, 0);
        assert_eq!(after.in_flight, 0);
    }

    #[tokio::test]
    async fn test_stop_before_start_leaves_server_startable() {
        let server = HttpServer::new(0);
        server.stop().await;
        let port = server.start().await.unwrap();
        assert!(tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok());
        server.stop().await;
    }

    #[test]
    fn test_port_zero_before_start() {
        assert_eq!(HttpServer::new(0).port(), 0);
    }
}
