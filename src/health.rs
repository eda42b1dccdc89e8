//! Readiness probes for starting instances

use crate::config::ValidationMode;
use crate::port::{connect_local, LOCAL_HOST};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Probe an instance once. Any failure (refused, timeout, garbage) is `false`.
pub async fn check(port: u16, path: &str, mode: ValidationMode, timeout: Duration) -> bool {
    let host_port = format!("{}:{}", LOCAL_HOST, port);

    let stream = match tokio::time::timeout(timeout, connect_local(port)).await {
        Ok(Ok(s)) => s,
        Ok(Err(_)) | Err(_) => return false,
    };

    match mode {
        ValidationMode::Connect => true,
        ValidationMode::Status => check_status(stream, &host_port, path, timeout).await,
    }
}

async fn check_status(mut stream: TcpStream, host_port: &str, path: &str, timeout: Duration) -> bool {
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, host_port
    );

    if stream.write_all(request.as_bytes()).await.is_err() {
        return false;
    }

    let read_result = tokio::time::timeout(timeout, async {
        let mut reader = BufReader::new(stream);
        let mut status_line = String::new();
        reader.read_line(&mut status_line).await?;
        Ok::<_, std::io::Error>(status_line)
    })
    .await;

    match read_result {
        Ok(Ok(status_line)) => parse_status(&status_line).map(is_ready_status).unwrap_or(false),
        _ => false,
    }
}

/// Status code from a line like `HTTP/1.1 200 OK`
fn parse_status(status_line: &str) -> Option<u16> {
    let mut parts = status_line.split_whitespace();
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

/// Redirects count as ready: tools often answer `/` with one
pub fn is_ready_status(code: u16) -> bool {
    code < 400
}
