//! Command-line agent client.
//!
//! Runs a shell command in the project directory, writes the request JSON
//! to its stdin and decodes its stdout.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::stream::parse_reply;
use super::{AgentClient, AgentError, AgentEvent, AgentReply, AgentRequest};
use crate::utils::tail;
use crate::workspace::process::{process_group_alive, signal_process_group, Signal};

const STDERR_TAIL: usize = 2000;

/// How long output is still collected after the shell exits.
const OUTPUT_DRAIN: Duration = Duration::from_millis(500);

/// Agent driven through a shell command.
pub struct CommandAgent {
    /// Run with `sh -c`.
    command: String,
    /// Extra environment for every turn.
    env: Vec<(String, String)>,
}

impl CommandAgent {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

#[async_trait]
impl AgentClient for CommandAgent {
    fn describe(&self) -> String {
        format!("command: {}", self.command)
    }

    async fn send(&self, request: &AgentRequest) -> Result<AgentReply, AgentError> {
        let start = Instant::now();

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .current_dir(&request.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        for (key, value) in request.env.iter().chain(&self.env) {
            cmd.env(key, value);
        }
        if let Some(model) = &request.model {
            cmd.env("TRIALFORGE_MODEL", model);
        }

        info!(
            command = %self.command,
            cwd = %request.working_dir.display(),
            "Starting agent turn"
        );

        let mut child = cmd.spawn().map_err(|e| {
            AgentError::ExecutionFailed(format!("Failed to spawn {}: {}", self.command, e))
        })?;
        let pid = child.id();

        let payload = serde_json::to_vec(&request.payload())
            .map_err(|e| AgentError::Config(format!("Unserializable request: {}", e)))?;
        if let Some(mut stdin) = child.stdin.take() {
            // An agent that ignores stdin may close it early.
            if let Err(e) = stdin.write_all(&payload).await {
                debug!(error = %e, "Agent closed stdin before reading the request");
            }
            stdin.shutdown().await.ok();
        }

        let stdout_reader = child.stdout.take().map(spawn_collector);
        let stderr_reader = child.stderr.take().map(spawn_collector);

        let status = match tokio::time::timeout(request.timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(command = %self.command, timeout = ?request.timeout, "Agent turn timed out");
                if let Some(pid) = pid {
                    signal_process_group(pid, Signal::Kill);
                }
                child.kill().await.ok();
                return Err(AgentError::Timeout(request.timeout));
            }
        };

        // Background children may hold the pipes open long after the shell
        // exits; take what arrived within the drain window.
        let drain_deadline = tokio::time::Instant::now() + OUTPUT_DRAIN;
        let stdout = drain(stdout_reader, drain_deadline).await;
        let stderr = drain(stderr_reader, drain_deadline).await;
        let stdout = String::from_utf8_lossy(&stdout).to_string();
        let stderr = String::from_utf8_lossy(&stderr).to_string();

        let lingering = pid.filter(|&pid| process_group_alive(pid));
        debug!(
            exit_code = ?status.code(),
            stdout_bytes = stdout.len(),
            background = lingering.is_some(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Agent turn completed"
        );

        if !status.success() && stdout.trim().is_empty() {
            if let Some(pgid) = lingering {
                signal_process_group(pgid, Signal::Kill);
            }
            return Err(AgentError::ExecutionFailed(format!(
                "exited with code {:?}: {}",
                status.code(),
                tail(stderr.trim(), STDERR_TAIL)
            )));
        }

        if let Some(pgid) = lingering {
            info!(pgid, "Agent left processes running after the turn");
        }
        let mut reply = parse_reply(&stdout).with_process_group(lingering);
        if !status.success() {
            reply.events.push(AgentEvent::Error {
                message: format!(
                    "agent exited with code {:?}: {}",
                    status.code(),
                    tail(stderr.trim(), STDERR_TAIL)
                ),
            });
        }
        Ok(reply)
    }
}

/// Forwards everything read from `reader` as chunks. Once the receiver is
/// gone the pipe is still read to EOF so writers never hit a broken pipe.
fn spawn_collector<R>(mut reader: R) -> mpsc::UnboundedReceiver<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut chunk = vec![0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let _ = tx.send(chunk[..n].to_vec());
                }
            }
        }
    });
    rx
}

/// Collects chunks until the writer side closes or `deadline` passes.
async fn drain(receiver: Option<mpsc::UnboundedReceiver<Vec<u8>>>, deadline: tokio::time::Instant) -> Vec<u8> {
    let mut buf = Vec::new();
    let Some(mut receiver) = receiver else {
        return buf;
    };
    while let Ok(Some(chunk)) = tokio::time::timeout_at(deadline, receiver.recv()).await {
        buf.extend_from_slice(&chunk);
    }
    // Keep whatever was already queued when the deadline hit.
    while let Ok(chunk) = receiver.try_recv() {
        buf.extend_from_slice(&chunk);
    }
    buf
}
