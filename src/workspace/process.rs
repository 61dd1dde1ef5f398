//! Supervised child processes.
//!
//! Dev servers and service processes are started through `sh -c` in their
//! own process group so that the whole tree (npm, node, watchers) can be
//! signalled at once. Each process is owned by a [`ProcessRegistry`] that
//! belongs to a workspace; terminating the registry, or dropping it, takes
//! every child down with it.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::ProcessError;
use crate::utils::tail;

/// Output keywords that mark a dev server as ready.
pub const READY_KEYWORDS: &[&str] = &["ready", "listening", "started server", "local:"];

/// Lines retained per process; older lines are dropped first.
const MAX_OUTPUT_LINES: usize = 2000;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Description of a process to start.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Label used in logs and error messages.
    pub name: String,
    /// Shell command line, run through `sh -c`.
    pub command: String,
    /// Working directory.
    pub cwd: PathBuf,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Port whose TCP availability (or mention in output) signals readiness.
    pub ready_port: Option<u16>,
    /// Regex over output lines that signals readiness.
    pub ready_pattern: Option<String>,
    /// Upper bound on the readiness wait.
    pub ready_timeout: Duration,
}

impl ProcessSpec {
    /// Creates a spec with a 60 second readiness timeout.
    pub fn new(name: impl Into<String>, command: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            cwd: cwd.into(),
            env: Vec::new(),
            ready_port: None,
            ready_pattern: None,
            ready_timeout: Duration::from_secs(60),
        }
    }

    /// Adds environment variables.
    pub fn with_env(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(env);
        self
    }

    /// Sets the readiness port.
    pub fn with_ready_port(mut self, port: u16) -> Self {
        self.ready_port = Some(port);
        self
    }

    /// Sets a readiness regex.
    pub fn with_ready_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.ready_pattern = Some(pattern.into());
        self
    }

    /// Sets the readiness timeout.
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }
}

/// Bounded, shared log of a process's stdout and stderr lines.
#[derive(Debug, Clone, Default)]
pub struct OutputLog {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl OutputLog {
    fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == MAX_OUTPUT_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Returns a copy of the retained lines.
    pub fn lines(&self) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.iter().cloned().collect()
    }

    /// Returns true when any retained line satisfies `predicate`.
    pub fn any(&self, predicate: impl Fn(&str) -> bool) -> bool {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.iter().any(|l| predicate(l))
    }

    /// Returns the retained output joined with newlines.
    pub fn joined(&self) -> String {
        self.lines().join("\n")
    }
}

/// Cheap handle onto a process that lives in a registry.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub name: String,
    pub pid: Option<u32>,
    pub output: OutputLog,
}

/// A running child process in its own process group.
pub struct SupervisedProcess {
    name: String,
    child: Child,
    pid: Option<u32>,
    output: OutputLog,
    started_at: Instant,
}

impl SupervisedProcess {
    /// Spawns the process and waits until it is ready.
    ///
    /// Readiness is the first of: an output line containing the ready port
    /// or a ready keyword, a line matching `ready_pattern`, or a successful
    /// TCP connect to `ready_port`. A process with neither a port nor a
    /// pattern is considered ready once spawned. Exiting before readiness
    /// and exceeding the timeout are errors; the child is killed on timeout.
    pub async fn start(spec: &ProcessSpec) -> Result<Self, ProcessError> {
        let pattern = match &spec.ready_pattern {
            Some(p) => Some(Regex::new(p).map_err(|e| ProcessError::Spawn {
                command: spec.command.clone(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()),
            })?),
            None => None,
        };

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&spec.command)
            .current_dir(&spec.cwd)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            command: spec.command.clone(),
            source,
        })?;

        let pid = child.id();
        let output = OutputLog::default();
        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, output.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, output.clone());
        }

        info!(name = %spec.name, pid = ?pid, cwd = %spec.cwd.display(), "Started process");

        let mut process = Self {
            name: spec.name.clone(),
            child,
            pid,
            output,
            started_at: Instant::now(),
        };

        if spec.ready_port.is_none() && pattern.is_none() {
            return Ok(process);
        }

        let deadline = Instant::now() + spec.ready_timeout;
        loop {
            if process
                .output
                .any(|line| line_signals_ready(line, spec.ready_port, pattern.as_ref()))
            {
                break;
            }
            if let Some(port) = spec.ready_port {
                if port_accepts(port, POLL_INTERVAL).await {
                    break;
                }
            }
            if let Some(status) = process.child.try_wait()? {
                // Let the readers drain what the process printed before exiting.
                tokio::time::sleep(POLL_INTERVAL).await;
                return Err(ProcessError::ExitedEarly {
                    name: spec.name.clone(),
                    code: status.code(),
                    output: tail(&process.output.joined(), 4000),
                });
            }
            if Instant::now() >= deadline {
                process.terminate(Duration::from_secs(2)).await;
                return Err(ProcessError::ReadyTimeout {
                    name: spec.name.clone(),
                    timeout: spec.ready_timeout,
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        debug!(
            name = %spec.name,
            elapsed_ms = process.started_at.elapsed().as_millis() as u64,
            "Process ready"
        );
        Ok(process)
    }

    /// Returns a handle sharing this process's output log.
    pub fn handle(&self) -> ProcessHandle {
        ProcessHandle {
            name: self.name.clone(),
            pid: self.pid,
            output: self.output.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true while the child has not exited.
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Sends SIGTERM to the process group, waits up to `grace`, then SIGKILLs.
    pub async fn terminate(&mut self, grace: Duration) -> Option<ExitStatus> {
        if let Ok(Some(status)) = self.child.try_wait() {
            // The leader is gone but group members may linger.
            self.kill_remaining_group();
            return Some(status);
        }

        self.signal_group(Signal::Term);
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.kill_remaining_group();
                debug!(name = %self.name, "Process exited after SIGTERM");
                Some(status)
            }
            _ => {
                warn!(name = %self.name, grace_ms = grace.as_millis() as u64, "Process ignored SIGTERM, killing");
                self.signal_group(Signal::Kill);
                let _ = self.child.start_kill();
                self.child.wait().await.ok()
            }
        }
    }

    fn signal_group(&self, signal: Signal) {
        if let Some(pid) = self.pid {
            signal_process_group(pid, signal);
        }
    }

    /// SIGKILLs group members that outlived the leader. An empty group is
    /// left alone: its pgid may already belong to someone else.
    fn kill_remaining_group(&self) {
        if let Some(pid) = self.pid.filter(|&pid| process_group_alive(pid)) {
            signal_process_group(pid, Signal::Kill);
        }
    }
}

impl Drop for SupervisedProcess {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(None)) {
            self.signal_group(Signal::Kill);
            let _ = self.child.start_kill();
        }
    }
}

/// Signal delivered to a whole process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

/// Signals the process group led by `pid`.
///
/// Children spawned here use `process_group(0)`, so the leader's pid is the pgid.
pub fn signal_process_group(pid: u32, signal: Signal) {
    #[cfg(unix)]
    {
        let sig = match signal {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        // SAFETY: kill(2) takes plain integers and touches no memory; a
        // negative pid addresses the process group.
        unsafe {
            libc::kill(-(pid as i32), sig);
        }
    }
    #[cfg(not(unix))]
    let _ = (pid, signal);
}

/// Returns true while some process in the group `pgid` still exists.
#[cfg(unix)]
pub fn process_group_alive(pgid: u32) -> bool {
    // SAFETY: signal 0 only checks that the group exists and may be
    // signalled; no signal is delivered and no memory is touched.
    unsafe { libc::kill(-(pgid as i32), 0) == 0 }
}

#[cfg(not(unix))]
pub fn process_group_alive(_pgid: u32) -> bool {
    false
}

/// SIGTERMs the group `pgid`, waits up to `grace` for it to empty, then
/// SIGKILLs whatever is left. Returns false when the group was already gone.
pub async fn terminate_process_group(pgid: u32, grace: Duration) -> bool {
    if !process_group_alive(pgid) {
        return false;
    }
    signal_process_group(pgid, Signal::Term);
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        tokio::time::sleep(POLL_INTERVAL.min(grace)).await;
        if !process_group_alive(pgid) {
            debug!(pgid, "Process group exited after SIGTERM");
            return true;
        }
    }
    warn!(pgid, grace_ms = grace.as_millis() as u64, "Process group ignored SIGTERM, killing");
    signal_process_group(pgid, Signal::Kill);
    true
}

/// Every process started for one workspace.
///
/// Besides supervised processes it tracks foreign process groups, such as
/// the group of an agent turn that left children running in the background.
#[derive(Default)]
pub struct ProcessRegistry {
    processes: tokio::sync::Mutex<Vec<SupervisedProcess>>,
    groups: Mutex<Vec<u32>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes ownership of a started process and returns a handle to it.
    pub async fn register(&self, process: SupervisedProcess) -> ProcessHandle {
        let handle = process.handle();
        self.processes.lock().await.push(process);
        handle
    }

    /// Tracks the process group `pgid` until the registry terminates.
    pub fn register_group(&self, pgid: u32) {
        let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        if !groups.contains(&pgid) {
            debug!(pgid, "Tracking process group");
            groups.push(pgid);
        }
    }

    /// Tracked process groups, in registration order.
    pub fn groups(&self) -> Vec<u32> {
        self.groups.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of registered processes, running or not.
    pub async fn len(&self) -> usize {
        self.processes.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Names of processes that are still running.
    pub async fn running(&self) -> Vec<String> {
        let mut processes = self.processes.lock().await;
        processes
            .iter_mut()
            .filter_map(|p| p.is_running().then(|| p.name.clone()))
            .collect()
    }

    /// Output lines of every registered process, in registration order.
    pub async fn output_lines(&self) -> Vec<String> {
        let processes = self.processes.lock().await;
        processes.iter().flat_map(|p| p.output.lines()).collect()
    }

    /// Terminates and removes every process and tracked group; returns how
    /// many supervised processes and live groups were stopped.
    pub async fn terminate_all(&self, grace: Duration) -> usize {
        let drained: Vec<SupervisedProcess> = {
            let mut processes = self.processes.lock().await;
            processes.drain(..).collect()
        };
        let mut count = drained.len();
        for mut process in drained {
            process.terminate(grace).await;
        }

        let groups: Vec<u32> = {
            let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
            groups.drain(..).collect()
        };
        for pgid in groups {
            if terminate_process_group(pgid, grace).await {
                count += 1;
            }
        }
        count
    }
}

impl Drop for ProcessRegistry {
    fn drop(&mut self) {
        let groups = self.groups.get_mut().unwrap_or_else(|e| e.into_inner());
        for pgid in groups.drain(..) {
            if process_group_alive(pgid) {
                signal_process_group(pgid, Signal::Kill);
            }
        }
    }
}

/// Returns true when `line` announces readiness.
pub fn line_signals_ready(line: &str, port: Option<u16>, pattern: Option<&Regex>) -> bool {
    if let Some(re) = pattern {
        if re.is_match(line) {
            return true;
        }
    }
    if let Some(port) = port {
        if line.contains(&port.to_string()) {
            return true;
        }
    }
    let lower = line.to_lowercase();
    READY_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// Returns true when a TCP connect to 127.0.0.1:`port` succeeds within `timeout`.
pub async fn port_accepts(port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

fn spawn_line_reader<R>(reader: R, output: OutputLog)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            output.push(line);
        }
    });
}
