//! Batch execution of trials.
//!
//! The [`Scheduler`] expands tasks into `(task, trial)` jobs and runs them
//! one at a time or concurrently behind a [`ConcurrencyLimiter`]. It owns the
//! port allocator and workspace manager of the batch; nothing is shared
//! between batches.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{error, info, warn};

use super::agents::AgentClient;
use super::config::{HarnessConfig, RunMode};
use super::limiter::ConcurrencyLimiter;
use super::progress::{ProgressDisplay, ProgressMonitor};
use super::result::{EvalResult, TrialResult};
use super::trial::TrialRunner;
use crate::error::{SchedulerError, WorkspaceError};
use crate::grader::GraderRegistry;
use crate::report::IncrementalReporter;
use crate::task::{validate_tasks, Task};
use crate::workspace::{PortAllocator, WorkspaceManager};

/// Runs a batch of tasks against one agent.
pub struct Scheduler {
    config: HarnessConfig,
    agent: Arc<dyn AgentClient>,
    graders: Arc<GraderRegistry>,
}

impl Scheduler {
    pub fn new(config: HarnessConfig, agent: Arc<dyn AgentClient>, graders: Arc<GraderRegistry>) -> Self {
        Self {
            config,
            agent,
            graders,
        }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Runs every task `trials_per_task` times.
    ///
    /// Only configuration problems fail the batch, including a port range
    /// that runs dry. Trial faults end up in the returned results, sorted by
    /// `(task_id, trial)`.
    pub async fn run(&self, tasks: &[Task]) -> Result<EvalResult, SchedulerError> {
        if tasks.is_empty() {
            return Err(SchedulerError::NoTasks);
        }
        self.config.validate()?;
        validate_tasks(tasks)?;

        let started_at = Utc::now();
        let start = Instant::now();

        let ports = PortAllocator::new(self.config.base_port, self.config.port_pairs)
            .map_err(WorkspaceError::from)?
            .with_bind_check(self.config.check_ports);
        let manager = Arc::new(WorkspaceManager::new(
            self.config.workspace_config(),
            Arc::new(ports),
        ));

        let jobs: Vec<(Arc<Task>, u32)> = tasks
            .iter()
            .flat_map(|task| {
                let task = Arc::new(task.clone());
                (1..=self.config.trials_per_task).map(move |trial| (Arc::clone(&task), trial))
            })
            .collect();

        let reporter = Arc::new(IncrementalReporter::new(
            &self.config.output_dir,
            jobs.len(),
            self.config.model.clone(),
        ));
        reporter.init()?;

        let progress = ProgressDisplay::new(jobs.len(), self.config.show_progress);
        let monitor = ProgressMonitor::start(progress.clone(), self.config.progress_interval());

        let runner = Arc::new(
            TrialRunner::new(
                Arc::clone(&self.agent),
                Arc::clone(&self.graders),
                Arc::clone(&manager),
            )
            .with_grader_timeout(self.config.grader_timeout())
            .with_keep_workspaces(self.config.keep_workspaces)
            .with_model(self.config.model.clone())
            .with_progress(progress.clone()),
        );

        info!(
            tasks = tasks.len(),
            trials = jobs.len(),
            mode = %self.config.mode,
            concurrency = self.config.concurrency,
            agent = %self.agent.describe(),
            "Sweep started"
        );

        let sink = ResultSink {
            reporter: Arc::clone(&reporter),
            progress,
        };
        let outcome = match self.config.mode {
            RunMode::Serial => run_serial(&runner, jobs, &sink).await,
            RunMode::Parallel => run_parallel(&runner, jobs, &sink, self.config.concurrency).await,
        };

        let cleaned = manager.cleanup_all().await;
        if !cleaned.is_empty() {
            warn!(workspaces = cleaned.len(), "Disposed of workspaces left behind by trials");
        }
        monitor.stop().await;
        let results = outcome?;

        let eval = EvalResult::new(
            results,
            self.config.mode,
            self.config.model.clone(),
            started_at,
            start.elapsed().as_millis() as u64,
        );
        info!(
            total = eval.summary.total,
            passed = eval.summary.passed,
            failed = eval.summary.failed,
            errored = eval.summary.errored,
            pass_rate = format!("{:.1}%", eval.summary.pass_rate * 100.0),
            duration_ms = eval.duration_ms,
            report = %reporter.report_path().display(),
            "Sweep finished"
        );
        Ok(eval)
    }
}

/// Where finished trials go as soon as they finish.
#[derive(Clone)]
struct ResultSink {
    reporter: Arc<IncrementalReporter>,
    progress: ProgressDisplay,
}

impl ResultSink {
    fn push(&self, result: &TrialResult) {
        if let Err(e) = self.reporter.add_result(result) {
            warn!(task_id = %result.task_id, trial = result.trial, error = %e, "Failed to update report");
        }
        self.progress.trial_finished(result);
    }
}

/// Creates the workspace for one trial and runs it.
///
/// `Err` only for configuration errors that would fail every remaining
/// trial too; other setup failures become errored results.
async fn run_job(runner: &TrialRunner, task: &Task, trial: u32) -> Result<TrialResult, WorkspaceError> {
    match runner.manager().create(&task.id, task.create_options()).await {
        Ok(workspace) => Ok(runner.run(task, trial, Some(workspace)).await),
        Err(e) if e.is_config_error() => Err(e),
        Err(e) => Ok(runner.setup_failed(task, trial, e).await),
    }
}

async fn run_serial(
    runner: &TrialRunner,
    jobs: Vec<(Arc<Task>, u32)>,
    sink: &ResultSink,
) -> Result<Vec<TrialResult>, SchedulerError> {
    let mut results = Vec::with_capacity(jobs.len());
    for (task, trial) in jobs {
        let result = run_job(runner, &task, trial).await.map_err(|e| {
            error!(task_id = %task.id, trial, error = %e, "Stopping sweep");
            e
        })?;
        sink.push(&result);
        results.push(result);
    }
    Ok(results)
}

async fn run_parallel(
    runner: &Arc<TrialRunner>,
    jobs: Vec<(Arc<Task>, u32)>,
    sink: &ResultSink,
    concurrency: usize,
) -> Result<Vec<TrialResult>, SchedulerError> {
    let limiter = ConcurrencyLimiter::new(concurrency)?;
    let mut handles = Vec::with_capacity(jobs.len());

    for (task, trial) in jobs {
        let runner = Arc::clone(runner);
        let limiter = limiter.clone();
        let sink = sink.clone();
        let job = Arc::clone(&task);
        // Ok(None): skipped because the sweep is stopping.
        let handle = tokio::spawn(async move {
            let Ok(_permit) = limiter.acquire().await else {
                return Ok(None);
            };
            match run_job(&runner, &job, trial).await {
                Ok(result) => {
                    sink.push(&result);
                    Ok(Some(result))
                }
                Err(e) => {
                    // Trials already running finish; waiting ones are turned away.
                    limiter.close();
                    Err(e)
                }
            }
        });
        handles.push((task, trial, handle));
    }

    let mut results = Vec::with_capacity(handles.len());
    let mut fatal: Option<WorkspaceError> = None;
    for (task, trial, handle) in handles {
        match handle.await {
            Ok(Ok(Some(result))) => results.push(result),
            Ok(Ok(None)) => {}
            Ok(Err(e)) => {
                error!(task_id = %task.id, trial, error = %e, "Stopping sweep");
                fatal.get_or_insert(e);
            }
            Err(e) => {
                warn!(task_id = %task.id, trial, error = %e, "Trial task panicked");
                let result = TrialResult::errored(
                    &task.id,
                    task.display_name(),
                    &task.category,
                    trial,
                    format!("trial task panicked: {}", e),
                );
                sink.push(&result);
                results.push(result);
            }
        }
    }
    match fatal {
        Some(e) => Err(e.into()),
        None => Ok(results),
    }
}
