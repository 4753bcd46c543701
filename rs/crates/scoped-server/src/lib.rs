//! scoped-server — one lightweight task per TCP connection, with an immutable
//! request context bound to each task's dynamic extent.
//!
//! ```text
//! accept() → RequestContext::now() → Scheduler::submit(handle_connection)
//!          → sleep → read → respond → close
//! ```
//!
//! [`Server`] is the raw TCP transport. [`HttpServer`] serves the same
//! greeting over axum.

pub mod config;
pub mod error;
pub mod handler;
pub mod http;
pub mod scheduler;
pub mod server;

pub use config::{HandlerConfig, ServerConfig, SpawnMode};
pub use error::{ConnectionError, ServerError, TaskError};
pub use http::HttpServer;
pub use scheduler::{Scheduler, ShutdownMode, ShutdownStats, TaskHandle, TaskInfo, TaskKind};
pub use server::{Phase, Server};
