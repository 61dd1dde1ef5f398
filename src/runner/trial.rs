//! One trial: setup, conversation, grading.
//!
//! The [`TrialRunner`] drives a single (task, trial index) pair through
//! `pending → setup → conversation → grading → done`. Any fault, whether an
//! error from a stage or a panic, moves the trial to `error` instead. Every
//! path produces a [`TrialResult`] and disposes of the workspace.

use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::agents::{AgentClient, AgentRequest, ConversationTurn};
use super::progress::ProgressDisplay;
use super::result::{overall_pass, score_map, OutcomeSnapshot, TrialResult, TrialState};
use crate::error::WorkspaceError;
use crate::grader::{GraderKind, GraderRegistry, GraderResult, GradingContext};
use crate::task::Task;
use crate::transcript::{digest_entries, TranscriptRecorder};
use crate::workspace::process::port_accepts;
use crate::workspace::{Workspace, WorkspaceManager};

/// Extra time granted to an agent past the trial budget before it is abandoned.
const AGENT_GRACE: Duration = Duration::from_secs(5);

/// Directories left out of the outcome file list.
const SKIPPED_DIRS: &[&str] = &["node_modules", ".git", "target", ".next", "dist"];

/// Faults that end a trial in the error state.
#[derive(Debug, Error)]
pub enum TrialError {
    #[error("Workspace setup failed: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("Trial panicked during {stage}: {message}")]
    Panicked { stage: TrialState, message: String },
}

/// Runs trials against one agent with one grader registry.
pub struct TrialRunner {
    agent: Arc<dyn AgentClient>,
    graders: Arc<GraderRegistry>,
    manager: Arc<WorkspaceManager>,
    http: reqwest::Client,
    grader_timeout: Duration,
    keep_workspaces: bool,
    model: Option<String>,
    progress: ProgressDisplay,
}

impl TrialRunner {
    pub fn new(
        agent: Arc<dyn AgentClient>,
        graders: Arc<GraderRegistry>,
        manager: Arc<WorkspaceManager>,
    ) -> Self {
        Self {
            agent,
            graders,
            manager,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            grader_timeout: Duration::from_secs(120),
            keep_workspaces: false,
            model: None,
            progress: ProgressDisplay::hidden(),
        }
    }

    pub fn with_grader_timeout(mut self, timeout: Duration) -> Self {
        self.grader_timeout = timeout;
        self
    }

    pub fn with_keep_workspaces(mut self, keep: bool) -> Self {
        self.keep_workspaces = keep;
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_progress(mut self, progress: ProgressDisplay) -> Self {
        self.progress = progress;
        self
    }

    pub fn manager(&self) -> &Arc<WorkspaceManager> {
        &self.manager
    }

    /// Runs trial `trial` of `task`.
    ///
    /// `workspace` is used when the caller already created one; otherwise the
    /// runner creates it. Never fails: faults are reported in the result.
    pub async fn run(&self, task: &Task, trial: u32, workspace: Option<Arc<Workspace>>) -> TrialResult {
        let mut run = TrialRun::new(task, trial, self.progress.clone());
        info!(task_id = %task.id, trial, agent = %self.agent.describe(), "Trial started");

        let outcome = AssertUnwindSafe(self.drive(&mut run, workspace))
            .catch_unwind()
            .await;
        let fault = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(panic) => Some(TrialError::Panicked {
                stage: run.state,
                message: panic_message(panic.as_ref()),
            }),
        };

        self.finish(run, fault).await
    }

    /// Result for a trial whose pre-created workspace could not be built.
    pub async fn setup_failed(&self, task: &Task, trial: u32, error: WorkspaceError) -> TrialResult {
        let mut run = TrialRun::new(task, trial, self.progress.clone());
        run.transition(TrialState::Setup);
        self.finish(run, Some(TrialError::Workspace(error))).await
    }

    async fn drive(&self, run: &mut TrialRun<'_>, workspace: Option<Arc<Workspace>>) -> Result<(), TrialError> {
        run.transition(TrialState::Setup);
        let workspace = match workspace {
            Some(ws) => ws,
            None => {
                self.manager
                    .create(&run.task.id, run.task.create_options())
                    .await?
            }
        };
        run.workspace = Some(Arc::clone(&workspace));
        let turns: Vec<String> = run
            .task
            .turns
            .iter()
            .map(|turn| workspace.substitute(turn))
            .collect();

        run.transition(TrialState::Conversation);
        self.converse(run, &workspace, &turns).await;

        run.transition(TrialState::Grading);
        self.grade(run, &workspace).await;
        Ok(())
    }

    /// Sends the turns in order. A failed or timed-out turn ends the
    /// conversation; grading still follows.
    async fn converse(&self, run: &mut TrialRun<'_>, workspace: &Workspace, turns: &[String]) {
        let deadline = run.started + run.task.timeout();
        let mut history: Vec<ConversationTurn> = Vec::new();

        for (index, turn) in turns.iter().enumerate() {
            let stage = format!("turn {}", index + 1);
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                run.recorder.record_error(
                    &stage,
                    &format!("trial time budget of {:?} exhausted", run.task.timeout()),
                );
                break;
            }

            run.recorder.record_user(turn);
            let request = AgentRequest::new(turn.clone(), &workspace.project_dir)
                .with_history(history.clone())
                .with_env(workspace.env())
                .with_timeout(remaining)
                .with_model(self.model.clone());

            match tokio::time::timeout(remaining + AGENT_GRACE, self.agent.send(&request)).await {
                Ok(Ok(reply)) => {
                    if let Some(pgid) = reply.process_group {
                        workspace.processes().register_group(pgid);
                    }
                    for event in &reply.events {
                        run.recorder.record_agent_event(event);
                    }
                    let text = reply.text();
                    run.recorder.record_assistant(&text);
                    debug!(
                        task_id = %run.task.id,
                        turn = index + 1,
                        events = reply.events.len(),
                        tools = reply.tool_invocations().len(),
                        "Turn completed"
                    );
                    history.push(ConversationTurn::user(turn.clone()));
                    history.push(ConversationTurn::assistant(text));
                }
                Ok(Err(e)) => {
                    warn!(task_id = %run.task.id, turn = index + 1, error = %e, "Agent turn failed");
                    run.recorder.record_error(&stage, &e.to_string());
                    break;
                }
                Err(_) => {
                    warn!(task_id = %run.task.id, turn = index + 1, "Agent turn timed out");
                    run.recorder
                        .record_error(&stage, &format!("agent timed out after {:?}", remaining));
                    break;
                }
            }
        }
    }

    async fn grade(&self, run: &mut TrialRun<'_>, workspace: &Workspace) {
        for config in &run.task.graders {
            let snapshot = run.recorder.entries();
            let ctx = GradingContext::new(workspace, &snapshot, &self.http, self.grader_timeout);
            let result = self.graders.run(config, &ctx).await;
            run.recorder.record_grader_result(&result);
            run.grader_results.push(result);
        }
    }

    /// Captures the outcome, disposes of the workspace and builds the result.
    async fn finish(&self, mut run: TrialRun<'_>, fault: Option<TrialError>) -> TrialResult {
        let error = fault.map(|e| {
            let message = e.to_string();
            warn!(task_id = %run.task.id, trial = run.trial, state = %run.state, error = %message, "Trial errored");
            run.recorder.record_error(&run.state.to_string(), &message);
            message
        });

        let mut outcome = OutcomeSnapshot::default();
        if let Some(workspace) = &run.workspace {
            outcome = snapshot_outcome(workspace, &run.grader_results).await;
            match self.manager.dispose(workspace, self.keep_workspaces).await {
                Ok(report) => debug!(
                    task_id = %run.task.id,
                    workspace_id = %report.workspace_id,
                    processes = report.processes_stopped,
                    "Workspace disposed"
                ),
                Err(e) => warn!(task_id = %run.task.id, error = %e, "Workspace cleanup failed"),
            }
        }

        run.transition(if error.is_some() {
            TrialState::Error
        } else {
            TrialState::Done
        });

        let transcript = run.recorder.into_entries();
        let passed = overall_pass(&run.grader_results, error.is_some());
        let result = TrialResult {
            task_id: run.task.id.clone(),
            task_name: run.task.display_name().to_string(),
            category: run.task.category.clone(),
            trial: run.trial,
            passed,
            scores: score_map(&run.grader_results),
            transcript_digest: digest_entries(&transcript),
            transcript,
            grader_results: run.grader_results,
            outcome,
            started_at: run.started_at,
            duration_ms: run.started.elapsed().as_millis() as u64,
            state: run.state,
            error,
            workspace_id: run.workspace.as_ref().map(|ws| ws.id.clone()),
            ports: run.workspace.as_ref().map(|ws| ws.ports),
        };

        info!(
            task_id = %result.task_id,
            trial = result.trial,
            passed = result.passed,
            state = %result.state,
            duration_ms = result.duration_ms,
            "Trial finished"
        );
        result
    }
}

/// Mutable state of one trial while it runs.
struct TrialRun<'a> {
    task: &'a Task,
    trial: u32,
    state: TrialState,
    recorder: TranscriptRecorder,
    grader_results: Vec<GraderResult>,
    workspace: Option<Arc<Workspace>>,
    started: Instant,
    started_at: chrono::DateTime<Utc>,
    progress: ProgressDisplay,
}

impl<'a> TrialRun<'a> {
    fn new(task: &'a Task, trial: u32, progress: ProgressDisplay) -> Self {
        Self {
            task,
            trial,
            state: TrialState::Pending,
            recorder: TranscriptRecorder::new(),
            grader_results: Vec::new(),
            workspace: None,
            started: Instant::now(),
            started_at: Utc::now(),
            progress,
        }
    }

    fn transition(&mut self, to: TrialState) {
        if self.state.is_terminal() || self.state == to {
            return;
        }
        self.progress
            .state_changed(&self.task.id, self.trial, self.state, to);
        self.state = to;
    }
}

/// Observable end state of `workspace`, read before it is disposed of.
async fn snapshot_outcome(workspace: &Workspace, results: &[GraderResult]) -> OutcomeSnapshot {
    let probe = Duration::from_millis(200);
    let service_started = !workspace.processes().is_empty().await
        || port_accepts(workspace.ports.service, probe).await
        || port_accepts(workspace.ports.dev, probe).await;

    let data_persisted = results.iter().any(|r| match r.grader_type.as_str() {
        t if t == GraderKind::Ingestion.as_str() => r
            .details
            .get("persisted")
            .and_then(|v| v.as_u64())
            .is_some_and(|n| n > 0),
        t if t == GraderKind::FileStorage.as_str() => {
            r.details.get("exists").and_then(|v| v.as_bool()) == Some(true)
        }
        _ => false,
    });

    let runtime_errors = results
        .iter()
        .filter(|r| r.grader_type == GraderKind::Runtime.as_str())
        .filter_map(|r| r.details.get("errors"))
        .filter_map(|v| v.as_array())
        .flatten()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();

    OutcomeSnapshot {
        files: list_project_files(&workspace.project_dir),
        service_started,
        data_persisted,
        runtime_errors,
        setup_warnings: workspace.setup_warnings().to_vec(),
    }
}

/// Project-relative file paths, sorted, dependency and build dirs skipped.
fn list_project_files(root: &Path) -> Vec<String> {
    let mut files: Vec<String> = WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !e
                    .file_name()
                    .to_str()
                    .is_some_and(|name| SKIPPED_DIRS.contains(&name))
        })
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            e.path()
                .strip_prefix(root)
                .ok()
                .map(|p| p.to_string_lossy().replace('\\', "/"))
        })
        .collect();
    files.sort();
    files
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grader::{ContextConfig, FileStorageConfig, GraderConfig};
    use crate::runner::agents::{AgentError, AgentEvent, AgentReply};
    use crate::runner::testing::{text_reply, ScriptedAgent};
    use crate::transcript::EntryKind;
    use crate::workspace::{PortAllocator, TemplateKind, WorkspaceConfig};
    use tempfile::TempDir;

    fn manager(root: &Path, base: u16) -> Arc<WorkspaceManager> {
        let ports = Arc::new(PortAllocator::new(base, 4).unwrap().with_bind_check(false));
        Arc::new(WorkspaceManager::new(
            WorkspaceConfig::new(root).with_kill_grace(Duration::from_millis(200)),
            ports,
        ))
    }

    fn runner(agent: ScriptedAgent, manager: Arc<WorkspaceManager>) -> TrialRunner {
        TrialRunner::new(
            Arc::new(agent),
            Arc::new(GraderRegistry::with_defaults(None)),
            manager,
        )
        .with_grader_timeout(Duration::from_secs(10))
    }

    fn mentions(pattern: &str) -> GraderConfig {
        GraderConfig::Context(ContextConfig {
            must_mention: vec![pattern.to_string()],
            must_not_mention: vec![],
            turn: None,
        })
    }

    fn stored(path: &str, contains: &str) -> GraderConfig {
        GraderConfig::FileStorage(FileStorageConfig {
            path: path.to_string(),
            must_exist: true,
            json: false,
            required_keys: vec![],
            contains: vec![contains.to_string()],
        })
    }

    #[tokio::test]
    async fn test_successful_trial() {
        let temp = TempDir::new().unwrap();
        let manager = manager(temp.path(), 43000);
        let agent = ScriptedAgent::new(|req| {
            std::fs::write(req.working_dir.join("notes.txt"), &req.message).unwrap();
            Ok(AgentReply::new(vec![
                AgentEvent::ToolCall {
                    id: Some("c1".into()),
                    name: "write_file".into(),
                    input: serde_json::json!({"path": "notes.txt"}),
                },
                AgentEvent::Text {
                    text: "Saved the notes file.".into(),
                },
            ]))
        });
        let task = Task::new(
            "notes",
            vec!["write port {{SERVICE_PORT}}".into()],
            vec![mentions("notes file"), stored("notes.txt", "write port 43000")],
        );

        let result = runner(agent, Arc::clone(&manager)).run(&task, 1, None).await;
        assert!(result.passed, "{:?}", result.grader_results);
        assert_eq!(result.state, TrialState::Done);
        assert!(result.error.is_none());
        assert_eq!(result.scores["context"], 1.0);
        assert!(result.outcome.data_persisted);
        assert!(result.outcome.files.contains(&"notes.txt".to_string()));

        let kinds: Vec<EntryKind> = result.transcript.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EntryKind::UserMessage,
                EntryKind::ToolCall,
                EntryKind::AssistantMessage,
                EntryKind::GraderResult,
                EntryKind::GraderResult,
            ]
        );
        assert_eq!(result.transcript[0].content(), Some("write port 43000"));
        assert_eq!(manager.live_count(), 0);
        assert!(manager.ports().in_use().is_empty());
    }

    #[tokio::test]
    async fn test_agent_process_group_stops_with_workspace() {
        use std::os::unix::process::CommandExt;
        use std::sync::Mutex;

        let temp = TempDir::new().unwrap();
        let spawned: Arc<Mutex<Vec<std::process::Child>>> = Arc::default();
        let children = Arc::clone(&spawned);
        let agent = ScriptedAgent::new(move |req| {
            let child = std::process::Command::new("sleep")
                .arg("30")
                .current_dir(&req.working_dir)
                .process_group(0)
                .spawn()?;
            let pgid = child.id();
            children.lock().unwrap().push(child);
            Ok(text_reply("started a watcher").with_process_group(Some(pgid)))
        });
        let task = Task::new("watcher", vec!["start it".into()], vec![mentions("watcher")]);

        let result = runner(agent, manager(temp.path(), 43080)).run(&task, 1, None).await;
        assert!(result.passed, "{:?}", result.grader_results);

        let mut child = spawned.lock().unwrap().pop().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let status = loop {
            if let Some(status) = child.try_wait().unwrap() {
                break status;
            }
            assert!(Instant::now() < deadline, "agent child survived cleanup");
            std::thread::sleep(Duration::from_millis(50));
        };
        assert!(!status.success());
    }

    #[tokio::test]
    async fn test_turns_carry_history() {
        let temp = TempDir::new().unwrap();
        let agent = ScriptedAgent::new(|req| {
            Ok(text_reply(&format!("seen {} prior turns", req.history.len())))
        });
        let task = Task::new(
            "history",
            vec!["one".into(), "two".into(), "three".into()],
            vec![mentions("seen 4 prior turns")],
        );

        let result = runner(agent, manager(temp.path(), 43010)).run(&task, 1, None).await;
        assert!(result.passed);
        let replies: Vec<_> = result
            .transcript
            .iter()
            .filter(|e| e.kind == EntryKind::AssistantMessage)
            .filter_map(|e| e.content())
            .collect();
        assert_eq!(replies, vec!["seen 0 prior turns", "seen 2 prior turns", "seen 4 prior turns"]);
    }

    #[tokio::test]
    async fn test_agent_failure_ends_conversation_but_grades() {
        let temp = TempDir::new().unwrap();
        let agent = ScriptedAgent::new(|_| Err(AgentError::ExecutionFailed("agent crashed".into())));
        let agent_calls = Arc::new(agent);
        let task = Task::new(
            "broken",
            vec!["first".into(), "second".into()],
            vec![mentions("anything")],
        );

        let runner = TrialRunner::new(
            Arc::clone(&agent_calls) as Arc<dyn AgentClient>,
            Arc::new(GraderRegistry::with_defaults(None)),
            manager(temp.path(), 43020),
        );
        let result = runner.run(&task, 1, None).await;
        assert_eq!(agent_calls.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(result.state, TrialState::Done);
        assert!(!result.passed);
        assert_eq!(result.grader_results.len(), 1);
        assert!(result
            .transcript
            .iter()
            .any(|e| e.kind == EntryKind::Error && e.payload["message"].as_str().unwrap().contains("agent crashed")));
    }

    #[tokio::test]
    async fn test_panicking_agent_yields_error_result() {
        let temp = TempDir::new().unwrap();
        let manager = manager(temp.path(), 43030);
        let agent = ScriptedAgent::new(|_| panic!("agent exploded"));
        let task = Task::new("panics", vec!["hi".into()], vec![mentions("x")]);

        let result = runner(agent, Arc::clone(&manager)).run(&task, 2, None).await;
        assert_eq!(result.state, TrialState::Error);
        assert!(!result.passed);
        assert_eq!(result.trial, 2);
        let error = result.error.as_deref().unwrap();
        assert!(error.contains("agent exploded"));
        assert!(error.contains("conversation"));
        assert_eq!(result.transcript.last().unwrap().kind, EntryKind::Error);
        assert_eq!(manager.live_count(), 0);
        assert!(manager.ports().in_use().is_empty());
    }

    #[tokio::test]
    async fn test_agent_timeout_records_error() {
        let temp = TempDir::new().unwrap();
        let agent = ScriptedAgent::replying("late").with_delay(Duration::from_secs(30));
        let task = Task::new("slow", vec!["hi".into()], vec![mentions("late")]).with_timeout_secs(1);

        let started = Instant::now();
        let result = runner(agent, manager(temp.path(), 43040)).run(&task, 1, None).await;
        assert!(started.elapsed() < Duration::from_secs(15));
        assert!(!result.passed);
        assert!(result
            .transcript
            .iter()
            .any(|e| e.kind == EntryKind::Error && e.payload["message"].as_str().unwrap().contains("timed out")));
    }

    #[tokio::test]
    async fn test_setup_failure_result() {
        let temp = TempDir::new().unwrap();
        let manager = manager(temp.path(), 43050);
        let runner = runner(ScriptedAgent::replying("ok"), Arc::clone(&manager));
        let task = Task::new("t", vec!["hi".into()], vec![mentions("ok")]);

        let err = WorkspaceError::Template {
            file: "x".into(),
            reason: "broken".into(),
        };
        let result = runner.setup_failed(&task, 1, err).await;
        assert_eq!(result.state, TrialState::Error);
        assert!(result.error.unwrap().contains("broken"));
        assert_eq!(result.transcript.len(), 1);
        assert_eq!(result.transcript[0].payload["stage"], "setup");
    }

    #[tokio::test]
    async fn test_keep_workspaces_retains_dir() {
        let temp = TempDir::new().unwrap();
        let manager = manager(temp.path(), 43060);
        let runner = runner(ScriptedAgent::replying("ok"), Arc::clone(&manager)).with_keep_workspaces(true);
        let task = Task::new("kept", vec!["hi".into()], vec![mentions("ok")])
            .with_template(TemplateKind::Static);

        let result = runner.run(&task, 1, None).await;
        assert!(result.passed);
        assert!(result.outcome.files.contains(&"index.html".to_string()));
        let kept: Vec<_> = std::fs::read_dir(temp.path()).unwrap().collect();
        assert_eq!(kept.len(), 1);
        assert!(manager.ports().in_use().is_empty());
    }

    #[test]
    fn test_list_project_files_skips_dependencies() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("node_modules/pkg")).unwrap();
        std::fs::create_dir_all(temp.path().join("src")).unwrap();
        std::fs::write(temp.path().join("node_modules/pkg/index.js"), "").unwrap();
        std::fs::write(temp.path().join("src/app.js"), "").unwrap();
        std::fs::write(temp.path().join("package.json"), "{}").unwrap();

        assert_eq!(
            list_project_files(temp.path()),
            vec!["package.json".to_string(), "src/app.js".to_string()]
        );
    }
}
