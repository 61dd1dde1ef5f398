//! Shared helpers for the harness integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use trialforge::runner::{
    AgentClient, AgentError, AgentEvent, AgentReply, AgentRequest, HarnessConfig,
};
use trialforge::task::{parse_tasks, Task};

/// Sweep settings isolated under `root`.
pub fn harness_config(root: &Path, base_port: u16) -> HarnessConfig {
    HarnessConfig::new()
        .with_output_dir(root.join("out"))
        .with_workspace_root(root.join("workspaces"))
        .with_ports(base_port, 8)
        .with_show_progress(false)
        .with_kill_grace(Duration::from_millis(300))
        .with_grader_timeout(Duration::from_secs(20))
}

pub fn tasks_from_yaml(yaml: &str) -> Vec<Task> {
    parse_tasks(yaml).expect("task yaml should parse")
}

pub fn text(text: impl Into<String>) -> AgentReply {
    AgentReply::new(vec![AgentEvent::Text { text: text.into() }])
}

/// Value of `key` in the request environment.
pub fn env_var<'a>(request: &'a AgentRequest, key: &str) -> Option<&'a str> {
    request
        .env
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

pub type Handler = Arc<dyn Fn(&str, &str, &str) -> (u16, String) + Send + Sync>;

/// Serves HTTP/1.1 on `127.0.0.1:port` with `handler`.
///
/// With `crash_after`, the listener is closed before the reply to that
/// request is written, so the service is already gone when the client
/// sees the answer.
pub async fn serve_on(port: u16, handler: Handler, crash_after: Option<usize>) -> std::io::Result<()> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    tokio::spawn(async move {
        let mut listener = Some(listener);
        let mut handled = 0usize;
        while let Some(current) = listener.as_ref() {
            let Ok((mut stream, _)) = current.accept().await else {
                break;
            };
            let Some((method, path, body)) = read_request(&mut stream).await else {
                continue;
            };
            let (status, reply) = handler(&method, &path, &body);
            handled += 1;
            if crash_after.is_some_and(|max| handled >= max) {
                listener = None;
            }
            let response = format!(
                "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                reply.len(),
                reply
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    });
    Ok(())
}

async fn read_request(stream: &mut TcpStream) -> Option<(String, String, String)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut chunk))
            .await
            .ok()?
            .ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut parts = head.lines().next()?.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();
    let content_length = head
        .lines()
        .filter_map(|l| l.split_once(':'))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let end = buf.len().min(header_end + content_length);
    Some((method, path, String::from_utf8_lossy(&buf[header_end..end]).to_string()))
}

/// Agent that "builds" a service on its first turn by serving `handler`
/// on the workspace's service port.
pub struct ServiceBuilderAgent {
    handler: Handler,
    crash_after: Option<usize>,
    pub turns: AtomicUsize,
}

impl ServiceBuilderAgent {
    pub fn new(handler: Handler, crash_after: Option<usize>) -> Self {
        Self {
            handler,
            crash_after,
            turns: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl AgentClient for ServiceBuilderAgent {
    fn describe(&self) -> String {
        "service builder".to_string()
    }

    async fn send(&self, request: &AgentRequest) -> Result<AgentReply, AgentError> {
        let turn = self.turns.fetch_add(1, Ordering::SeqCst);
        if request.history.is_empty() {
            let port: u16 = env_var(request, "SERVICE_PORT")
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| AgentError::Config("SERVICE_PORT missing".into()))?;
            serve_on(port, Arc::clone(&self.handler), self.crash_after).await?;
            return Ok(text(format!("Server listening on port {}", port)));
        }
        Ok(text(format!("Turn {} done", turn + 1)))
    }
}
