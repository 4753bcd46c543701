use std::net::IpAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use scoped_server::{HandlerConfig, HttpServer, Server, ServerConfig, SpawnMode};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Transport {
    /// Plain TCP, one response per connection.
    Raw,
    /// HTTP via axum.
    Http,
}

#[derive(Parser, Debug)]
#[command(name = "scoped-server", version, about = "Task-per-connection server with scoped request context")]
struct Args {
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    host: IpAddr,

    /// 0 picks an ephemeral port
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    #[arg(long, env = "TRANSPORT", value_enum, default_value_t = Transport::Raw)]
    transport: Transport,

    #[arg(long, env = "SPAWN", value_enum, default_value_t = SpawnMode::Task)]
    spawn: SpawnMode,

    /// Simulated I/O latency per request
    #[arg(long, env = "DELAY_MS", default_value_t = 100)]
    delay_ms: u64,

    #[arg(long, env = "BUFFER_SIZE", default_value_t = 1024)]
    buffer_size: usize,

    #[arg(long, env = "READ_TIMEOUT_MS", default_value_t = 5000)]
    read_timeout_ms: u64,

    #[arg(long, env = "DRAIN_TIMEOUT_MS", default_value_t = 5000)]
    drain_timeout_ms: u64,
}

impl Args {
    fn config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host,
            port: self.port,
            spawn_mode: self.spawn,
            handler: HandlerConfig {
                io_delay: Duration::from_millis(self.delay_ms),
                read_buffer_size: self.buffer_size,
                read_timeout: Duration::from_millis(self.read_timeout_ms),
            },
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = args.config();
    info!(version = env!("CARGO_PKG_VERSION"), transport = ?args.transport, "scoped-server");

    match args.transport {
        Transport::Raw => {
            let server = Server::with_config(config);
            let port = server.start().await.context("failed to start server")?;
            info!("listening on {}:{} (try `echo hi | nc {} {}`)", args.host, port, args.host, port);

            tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
            info!("shutting down");
            let stats = server.shutdown_gracefully().await;
            info!(in_flight = stats.in_flight, aborted = stats.aborted, "drained");
        }
        Transport::Http => {
            let server = HttpServer::with_config(config);
            let port = server.start().await.context("failed to start http server")?;
            info!("listening on http://{}:{}", args.host, port);

            tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
            info!("shutting down");
            server.stop().await;
            info!(served = server.served(), "stopped");
        }
    }

    Ok(())
}
