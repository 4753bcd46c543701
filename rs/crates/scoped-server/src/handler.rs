//! Per-connection unit of work.

use std::net::SocketAddr;

use scoped_context::RequestContext;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::config::HandlerConfig;
use crate::error::ConnectionError;
use crate::scheduler::{self, TaskInfo, TaskKind};

/// Serve one connection with `ctx` bound for the whole exchange.
///
/// The stream is owned here and dropped on every exit path, including when
/// the enclosing task is aborted mid-sleep or mid-read. Errors are returned
/// to the scheduler, which logs them against the task name.
pub async fn handle_connection<S>(
    stream: S,
    peer: SocketAddr,
    ctx: RequestContext,
    config: HandlerConfig,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    scoped_context::scope(ctx, serve(stream, peer, &config)).await
}

async fn serve<S>(mut stream: S, peer: SocketAddr, config: &HandlerConfig) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::sleep(config.io_delay).await;

    let mut buf = vec![0u8; config.read_buffer_size];
    let n = tokio::time::timeout(config.read_timeout, stream.read(&mut buf))
        .await
        .map_err(|_| ConnectionError::ReadTimeout(config.read_timeout))??;
    let request = String::from_utf8_lossy(&buf[..n]);
    debug!(%peer, bytes = n, "request received");

    let body = render_greeting()?;
    let response = if is_http_request(&request) {
        http_response(&body)
    } else {
        body
    };

    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    debug!(%peer, bytes = response.len(), "response written");
    Ok(())
}

/// Greeting for the current request, read from the bound context and the
/// running task's identity.
pub fn render_greeting() -> Result<String, ConnectionError> {
    let started_at = scoped_context::created_at_millis()?;
    let task = scheduler::current_task()
        .unwrap_or_else(|| TaskInfo::new("unscheduled", TaskKind::Lightweight));
    Ok(format!(
        "Hello from {} task: {}\nRequest started at: {}\n",
        task.kind(),
        task.name(),
        started_at
    ))
}

/// True when the first line looks like `METHOD /path HTTP/1.x`.
fn is_http_request(request: &str) -> bool {
    let line = request.lines().next().unwrap_or_default();
    let parts: Vec<&str> = line.split_whitespace().collect();
    parts.len() == 3 && parts[2].starts_with("HTTP/1.")
}

fn http_response(body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\n\
        Content-Type: text/plain; charset=utf-8\r\n\
        Content-Length: {}\r\n\
        Connection: close\r\n\
        \r\n{}",
        body.len(),
        body
    )
}
