use std::net::SocketAddr;
use std::time::Duration;

use scoped_context::ContextError;

use crate::server::Phase;

/// Errors surfaced synchronously to whoever drives the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The listening socket could not be bound (port in use, no permission).
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot start server in {0} phase")]
    InvalidPhase(Phase),
    #[error("scheduler is shut down")]
    SchedulerClosed,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures local to one connection. Logged by the handler task, never
/// propagated past it.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection io: {0}")]
    Io(#[from] std::io::Error),
    #[error("no request received within {0:?}")]
    ReadTimeout(Duration),
    #[error(transparent)]
    Context(#[from] ContextError),
}

/// Outcome of joining a scheduled task that did not finish normally.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("task {name} was cancelled")]
    Cancelled { name: String },
    #[error("task {name} panicked")]
    Panicked { name: String },
}
