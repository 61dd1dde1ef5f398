//! End-to-end tests: scheduler, trial runner, graders and reporter together.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use common::{harness_config, tasks_from_yaml, text, ServiceBuilderAgent};
use trialforge::error::{PortError, SchedulerError, TaskError};
use trialforge::grader::context::ContextGrader;
use trialforge::grader::GraderRegistry;
use trialforge::report::load_report;
use trialforge::runner::{
    AgentClient, AgentError, AgentReply, AgentRequest, CommandAgent, RunMode, Scheduler,
    TrialState,
};
use trialforge::task::load_tasks;
use trialforge::transcript::EntryKind;
use trialforge::workspace::PortAllocator;

fn assistant_messages(result: &trialforge::runner::TrialResult) -> Vec<&str> {
    result
        .transcript
        .iter()
        .filter(|e| e.kind == EntryKind::AssistantMessage)
        .filter_map(|e| e.content())
        .collect()
}

#[tokio::test]
async fn test_behaviors_endpoint_scenario() {
    let temp = TempDir::new().unwrap();
    let tasks = tasks_from_yaml(
        r#"
tasks:
  - id: behaviors-endpoint
    category: api
    turns:
      - "Create a service on port {{SERVICE_PORT}} that accepts POST /behaviors"
      - "Make sure it answers 200 for JSON bodies"
    graders:
      - type: service
        method: POST
        path: /behaviors
        body:
          behavior: rage_click
          count: 3
        expect_status: 200
"#,
    );
    let agent = Arc::new(ServiceBuilderAgent::new(
        Arc::new(|method: &str, path: &str, body: &str| {
            if method == "POST" && path == "/behaviors" && serde_json::from_str::<serde_json::Value>(body).is_ok() {
                (200, r#"{"ok":true}"#.to_string())
            } else {
                (404, "{}".to_string())
            }
        }),
        None,
    ));

    let scheduler = Scheduler::new(
        harness_config(temp.path(), 45000),
        Arc::clone(&agent) as Arc<dyn AgentClient>,
        Arc::new(GraderRegistry::with_defaults(None)),
    );
    let eval = scheduler.run(&tasks).await.unwrap();

    assert_eq!(eval.results.len(), 1);
    let result = &eval.results[0];
    assert_eq!(result.state, TrialState::Done);
    assert_eq!(result.grader_results.len(), 1);
    let grader = &result.grader_results[0];
    assert_eq!(grader.grader_type, "server");
    assert!(grader.passed, "{:?}", grader);
    assert_eq!(grader.score, 1.0);
    assert!(result.passed);
    assert!(eval.all_passed());

    let users = result
        .transcript
        .iter()
        .filter(|e| e.kind == EntryKind::UserMessage)
        .count();
    assert_eq!(users, 2);
    let port = result.ports.unwrap().service;
    assert_eq!(
        assistant_messages(result)[0],
        format!("Server listening on port {}", port)
    );
    assert!(result.outcome.service_started);
}

#[tokio::test]
async fn test_error_injection_crash_scenario() {
    let temp = TempDir::new().unwrap();
    let tasks = tasks_from_yaml(
        r#"
id: crash-on-bad-json
category: resilience
turns:
  - "Build an events endpoint on port {{SERVICE_PORT}}"
graders:
  - type: error_injection
    endpoint: /events
    cases:
      - name: valid event
        body:
          event_type: click
          timestamp: 1706601600000
        expect_status: 200
      - name: malformed body
        raw: "not json{{{"
        expect_status: 400
"#,
    );
    let agent = Arc::new(ServiceBuilderAgent::new(
        Arc::new(|_: &str, _: &str, body: &str| {
            if serde_json::from_str::<serde_json::Value>(body).is_ok() {
                (200, "{}".to_string())
            } else {
                (400, r#"{"error":"bad json"}"#.to_string())
            }
        }),
        Some(2),
    ));

    let scheduler = Scheduler::new(
        harness_config(temp.path(), 45020),
        agent,
        Arc::new(GraderRegistry::with_defaults(None)),
    );
    let eval = scheduler.run(&tasks).await.unwrap();
    let result = &eval.results[0];
    let grader = &result.grader_results[0];

    assert_eq!(grader.grader_type, "error_injection");
    assert!(!grader.passed);
    assert!((grader.score - 0.2).abs() < 1e-9, "score {}", grader.score);
    assert_eq!(grader.details["serverCrashed"], serde_json::json!(true));
    assert!(!result.passed);
    assert_eq!(result.state, TrialState::Done);
    assert!(!eval.all_passed());

    // The sweep still produced a complete report.
    let report = load_report(&temp.path().join("out/report.json")).unwrap();
    assert_eq!(report.progress.completed, 1);
    assert_eq!(report.summary.failed, 1);
}

#[tokio::test]
async fn test_parallel_trials_are_isolated() {
    let temp = TempDir::new().unwrap();
    let yaml: String = (0..5)
        .map(|i| {
            format!(
                r#"
  - id: isolated-{i}
    turns:
      - "Record your port"
    graders:
      - type: file_storage
        path: port.txt
      - type: context
        must_mention: ["wrote \\d+"]
"#
            )
        })
        .collect();
    let tasks = tasks_from_yaml(&format!("tasks:{}", yaml));

    let agent = CommandAgent::new(
        r#"cat > /dev/null; echo "$SERVICE_PORT" > port.txt; printf '{"type":"text","text":"wrote %s"}\n' "$SERVICE_PORT""#,
    );
    let scheduler = Scheduler::new(
        harness_config(temp.path(), 45100)
            .with_mode(RunMode::Parallel)
            .with_concurrency(3),
        Arc::new(agent),
        Arc::new(GraderRegistry::with_defaults(None)),
    );
    let eval = scheduler.run(&tasks).await.unwrap();

    assert_eq!(eval.results.len(), 5);
    let mut workspace_ids = Vec::new();
    for result in &eval.results {
        assert!(result.passed, "{} failed: {:?}", result.task_id, result.grader_results);
        let port = result.ports.unwrap().service;
        assert_eq!(assistant_messages(result), vec![format!("wrote {}", port)]);
        assert!(result.outcome.files.contains(&"port.txt".to_string()));
        workspace_ids.push(result.workspace_id.clone().unwrap());
    }
    workspace_ids.sort();
    workspace_ids.dedup();
    assert_eq!(workspace_ids.len(), 5);

    // Cleanup completeness: no project directory survives the sweep.
    let leftover = std::fs::read_dir(temp.path().join("workspaces")).unwrap().count();
    assert_eq!(leftover, 0);
    assert_eq!(
        load_report(&temp.path().join("out/report.json")).unwrap().progress.completed,
        5
    );
}

/// Answers immediately unless the turn asks it to block.
struct BlockingAgent;

#[async_trait]
impl AgentClient for BlockingAgent {
    fn describe(&self) -> String {
        "blocking".to_string()
    }

    async fn send(&self, request: &AgentRequest) -> Result<AgentReply, AgentError> {
        if request.message.contains("block") {
            tokio::time::sleep(Duration::from_secs(600)).await;
        }
        Ok(text("done"))
    }
}

#[tokio::test]
async fn test_report_is_valid_after_partial_sweep() {
    let temp = TempDir::new().unwrap();
    let tasks = tasks_from_yaml(
        r#"
tasks:
  - id: a
    turns: ["go"]
    graders: [{type: context, must_mention: [done]}]
  - id: b
    turns: ["go"]
    graders: [{type: context, must_mention: [done]}]
  - id: c
    turns: ["block forever"]
    graders: [{type: context, must_mention: [done]}]
"#,
    );
    let scheduler = Scheduler::new(
        harness_config(temp.path(), 45200),
        Arc::new(BlockingAgent),
        Arc::new(GraderRegistry::with_defaults(None)),
    );
    let sweep = tokio::spawn(async move { scheduler.run(&tasks).await });

    let report_path = temp.path().join("out/report.json");
    let mut completed = 0;
    for _ in 0..200 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if let Ok(report) = load_report(&report_path) {
            completed = report.progress.completed;
            if completed == 2 {
                break;
            }
        }
    }
    // Kill the sweep while the third trial is still running.
    sweep.abort();
    assert_eq!(completed, 2);

    let report = load_report(&report_path).unwrap();
    assert_eq!(report.progress.completed, 2);
    assert_eq!(report.progress.total, 3);
    let ids: Vec<_> = report.results.iter().map(|r| r.task_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert!(report.results.iter().all(|r| r.passed && r.transcript.is_empty()));
    assert!(temp.path().join("out/transcripts/a.json").exists());
}

#[tokio::test]
async fn test_grader_faults_do_not_stop_other_graders() {
    let temp = TempDir::new().unwrap();
    let tasks = tasks_from_yaml(
        r#"
id: partial
turns: ["say hello"]
graders:
  - type: server
    path: /health
  - type: rubric
    rubric: "The reply is polite."
  - type: context
    must_mention: [hello]
"#,
    );
    let mut registry = GraderRegistry::new();
    registry.register(Arc::new(ContextGrader));
    let scheduler = Scheduler::new(
        harness_config(temp.path(), 45300),
        Arc::new(common_hello_agent()),
        Arc::new(registry),
    );

    let eval = scheduler.run(&tasks).await.unwrap();
    let result = &eval.results[0];
    assert_eq!(result.state, TrialState::Done);
    assert_eq!(result.grader_results.len(), 3);
    assert!(!result.grader_results[0].passed);
    assert!(result.grader_results[0]
        .error
        .as_deref()
        .unwrap()
        .contains("no grader registered"));
    assert!(!result.grader_results[1].passed);
    assert!(result.grader_results[2].passed);
    assert!(!result.passed);
    assert_eq!(result.scores["context"], 1.0);
    assert_eq!(result.scores["server"], 0.0);
}

fn common_hello_agent() -> impl AgentClient {
    struct Hello;

    #[async_trait]
    impl AgentClient for Hello {
        fn describe(&self) -> String {
            "hello".to_string()
        }

        async fn send(&self, _request: &AgentRequest) -> Result<AgentReply, AgentError> {
            Ok(text("hello there"))
        }
    }

    Hello
}

#[tokio::test]
async fn test_task_without_graders_is_rejected() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("bare.yaml");
    std::fs::write(&path, "id: bare\nturns: [\"hi\"]\ngraders: []\n").unwrap();
    assert!(matches!(load_tasks(&path), Err(TaskError::NoGraders(id)) if id == "bare"));

    let unknown = temp.path().join("unknown.yaml");
    std::fs::write(&unknown, "id: odd\nturns: [\"hi\"]\ngraders:\n  - type: telepathy\n").unwrap();
    assert!(matches!(load_tasks(&unknown), Err(TaskError::Parse { .. })));

    let tasks = tasks_from_yaml("id: bare\nturns: [\"hi\"]\ngraders: []\n");
    let scheduler = Scheduler::new(
        harness_config(temp.path(), 45400),
        Arc::new(common_hello_agent()),
        Arc::new(GraderRegistry::with_defaults(None)),
    );
    assert!(matches!(
        scheduler.run(&tasks).await,
        Err(SchedulerError::Task(TaskError::NoGraders(_)))
    ));
}

/// True once `pid` has exited (gone, or a zombie awaiting its reaper).
#[cfg(target_os = "linux")]
fn process_exited(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Err(_) => true,
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_some_and(|state| state == "Z" || state == "X"),
    }
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_agent_background_processes_end_with_the_sweep() {
    let temp = TempDir::new().unwrap();
    let pid_file = temp.path().join("background.pid");
    let tasks = tasks_from_yaml(
        r#"
id: background-server
timeout_secs: 30
turns:
  - "Start the service and leave it running"
graders:
  - type: context
    must_mention: [started]
"#,
    );
    // The background child keeps the agent's stdout open after the shell exits.
    let agent = CommandAgent::new(
        r#"cat > /dev/null; sleep 60 & echo $! > "$PID_FILE"; printf '{"type":"text","text":"started"}\n'"#,
    )
    .with_env("PID_FILE", pid_file.display().to_string());
    let scheduler = Scheduler::new(
        harness_config(temp.path(), 45600),
        Arc::new(agent),
        Arc::new(GraderRegistry::with_defaults(None)),
    );

    let started = std::time::Instant::now();
    let eval = scheduler.run(&tasks).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(15));

    let result = &eval.results[0];
    assert!(result.passed, "{:?}", result.transcript);
    assert_eq!(assistant_messages(result), vec!["started"]);

    let pid: u32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !process_exited(pid) {
        assert!(std::time::Instant::now() < deadline, "background child {} outlived cleanup", pid);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[test]
fn test_port_allocation_is_idempotent() {
    let ports = PortAllocator::new(45500, 2).unwrap().with_bind_check(false);
    let first = ports.allocate("w1").unwrap();
    assert_eq!(ports.allocate("w1").unwrap(), first);

    let second = ports.allocate("w2").unwrap();
    assert_ne!(first, second);
    assert!(matches!(ports.allocate("w3"), Err(PortError::Exhausted { .. })));

    ports.release("w1");
    ports.release("w1");
    assert_eq!(ports.allocate("w3").unwrap(), first);
}
