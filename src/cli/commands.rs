//! CLI command definitions for trialforge.
//!
//! `run` executes a sweep, `list` prints the tasks a path resolves to and
//! `validate` checks task files without running anything.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use crate::grader::{ChatJudge, GraderKind, GraderRegistry, RubricJudge};
use crate::runner::{AgentSpec, EvalResult, HarnessConfig, RunMode, Scheduler, TrialState};
use crate::task::{filter_tasks, load_tasks, Task};

/// Evaluation harness for coding agents.
#[derive(Parser)]
#[command(name = "trialforge")]
#[command(about = "Run coding agents against scripted tasks and grade the result")]
#[command(version)]
#[command(
    long_about = "trialforge runs an agent through the conversation turns of each task inside an isolated workspace, then grades the workspace with the task's graders.\n\nExample usage:\n  trialforge run --tasks ./tasks --agent-cmd ./my-agent --parallel --concurrency 4"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run every task against an agent and write a report.
    Run(RunArgs),

    /// List the tasks found under a path.
    #[command(alias = "ls")]
    List(ListArgs),

    /// Load and validate task files without running them.
    Validate(ValidateArgs),
}

/// Arguments for `trialforge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Task file or directory of task files.
    #[arg(short, long)]
    pub tasks: PathBuf,

    /// YAML file with sweep settings; flags override it.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Report directory.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Directory for per-trial workspaces.
    #[arg(long)]
    pub workspace_root: Option<PathBuf>,

    /// Run trials concurrently.
    #[arg(long)]
    pub parallel: bool,

    /// Maximum concurrent trials in parallel mode.
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Trials per task.
    #[arg(long)]
    pub trials: Option<u32>,

    /// Shell command that speaks the agent protocol on stdin/stdout.
    #[arg(long, env = "TRIALFORGE_AGENT_CMD", conflicts_with = "agent_url")]
    pub agent_cmd: Option<String>,

    /// HTTP endpoint that speaks the agent protocol.
    #[arg(long, env = "TRIALFORGE_AGENT_URL")]
    pub agent_url: Option<String>,

    /// Model name passed to the agent and recorded in the report.
    #[arg(short, long, env = "TRIALFORGE_MODEL")]
    pub model: Option<String>,

    /// Model used by the rubric judge.
    #[arg(long)]
    pub judge_model: Option<String>,

    /// First port of the allocation range.
    #[arg(long)]
    pub base_port: Option<u16>,

    /// Number of (service, dev) port pairs.
    #[arg(long)]
    pub port_pairs: Option<u16>,

    /// Leave workspace directories on disk.
    #[arg(long)]
    pub keep_workspaces: bool,

    /// Only tasks whose id or name contains this string.
    #[arg(short, long)]
    pub filter: Option<String>,

    /// Only tasks of this category.
    #[arg(short, long)]
    pub category: Option<String>,

    /// Print the result as JSON instead of a summary.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `trialforge list`.
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Task file or directory of task files.
    #[arg(short, long)]
    pub tasks: PathBuf,

    #[arg(short, long)]
    pub filter: Option<String>,

    #[arg(short, long)]
    pub category: Option<String>,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `trialforge validate`.
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Task file or directory of task files.
    #[arg(short, long)]
    pub tasks: PathBuf,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI with the parsed arguments.
///
/// `Ok` carries the exit code: 0 when every trial passed, 1 otherwise.
/// Errors are fatal configuration problems.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Commands::Run(args) => run_sweep_command(args).await,
        Commands::List(args) => {
            run_list_command(args)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Validate(args) => {
            run_validate_command(args)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

// ============================================================================
// Run
// ============================================================================

/// Builds the sweep configuration: file (if any), then flags.
fn build_config(args: &RunArgs) -> anyhow::Result<HarnessConfig> {
    let mut config = match &args.config {
        Some(path) => HarnessConfig::from_yaml_file(path)?,
        None => HarnessConfig::default(),
    };

    if args.parallel {
        config.mode = RunMode::Parallel;
    }
    if let Some(n) = args.concurrency {
        config.concurrency = n;
    }
    if let Some(n) = args.trials {
        config.trials_per_task = n;
    }
    if let Some(dir) = &args.output {
        config.output_dir = dir.clone();
    }
    if let Some(dir) = &args.workspace_root {
        config.workspace_root = dir.clone();
    }
    if let Some(port) = args.base_port {
        config.base_port = port;
    }
    if let Some(pairs) = args.port_pairs {
        config.port_pairs = pairs;
    }
    if args.keep_workspaces {
        config.keep_workspaces = true;
    }
    if let Some(model) = &args.model {
        config.model = Some(model.clone());
    }
    if let Some(model) = &args.judge_model {
        config.judge_model = Some(model.clone());
    }
    if let Some(command) = &args.agent_cmd {
        config.agent = Some(AgentSpec::Command {
            command: command.clone(),
        });
    } else if let Some(url) = &args.agent_url {
        config.agent = Some(AgentSpec::Http {
            url: url.clone(),
            token: std::env::var("TRIALFORGE_AGENT_TOKEN").ok(),
        });
    }
    if args.json {
        config.show_progress = false;
    }

    config.validate()?;
    Ok(config)
}

fn uses_rubric(tasks: &[Task]) -> bool {
    tasks
        .iter()
        .flat_map(|t| &t.graders)
        .any(|g| g.kind() == GraderKind::Rubric)
}

async fn run_sweep_command(args: RunArgs) -> anyhow::Result<ExitCode> {
    let config = build_config(&args)?;
    let spec = config.agent.clone().ok_or_else(|| {
        anyhow::anyhow!("No agent configured: pass --agent-cmd or --agent-url, or set `agent` in the config file")
    })?;
    let agent = spec.build()?;

    let tasks = filter_tasks(
        load_tasks(&args.tasks)?,
        args.filter.as_deref(),
        args.category.as_deref(),
    );
    if tasks.is_empty() {
        anyhow::bail!("No tasks matched under {}", args.tasks.display());
    }

    let judge: Option<Arc<dyn RubricJudge>> = match ChatJudge::from_env(config.judge_model.as_deref()) {
        Some(judge) => Some(Arc::new(judge?) as Arc<dyn RubricJudge>),
        None => {
            if uses_rubric(&tasks) {
                warn!("Rubric graders present but no judge configured; set OPENROUTER_API_KEY or LITELLM_API_BASE");
            }
            None
        }
    };

    info!(
        tasks = tasks.len(),
        mode = %config.mode,
        output = %config.output_dir.display(),
        "Loaded tasks"
    );

    let scheduler = Scheduler::new(config, agent, Arc::new(GraderRegistry::with_defaults(judge)));
    let eval = scheduler.run(&tasks).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&eval)?);
    } else {
        print_summary(&eval, &scheduler.config().output_dir);
    }

    Ok(if eval.all_passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

fn print_summary(eval: &EvalResult, output_dir: &Path) {
    let s = &eval.summary;
    println!("\n=== trialforge results ===");
    println!("Mode:        {}", eval.mode);
    if let Some(model) = &eval.model {
        println!("Model:       {}", model);
    }
    println!("Trials:      {}", s.total);
    println!("Passed:      {}", s.passed);
    println!("Failed:      {}", s.failed);
    println!("Errored:     {}", s.errored);
    println!("Pass rate:   {:.1}%", s.pass_rate * 100.0);
    println!("Mean score:  {:.2}", s.mean_score);
    println!("Duration:    {:.1}s", eval.duration_ms as f64 / 1000.0);
    println!();

    for r in &eval.results {
        let status = match (r.passed, r.state) {
            (true, _) => "PASS",
            (false, TrialState::Error) => "ERROR",
            (false, _) => "FAIL",
        };
        println!(
            "  {} #{} [{}] score={:.2} {:.1}s",
            r.task_id,
            r.trial,
            status,
            r.mean_score(),
            r.duration_ms as f64 / 1000.0
        );
        for g in r.grader_results.iter().filter(|g| !g.passed) {
            println!(
                "    {} {:.2}{}",
                g.grader_type,
                g.score,
                g.error
                    .as_deref()
                    .map(|e| format!(": {}", e))
                    .unwrap_or_default()
            );
        }
        if let Some(err) = &r.error {
            println!("    error: {err}");
        }
    }
    println!("\nReport: {}", output_dir.join(crate::report::REPORT_JSON).display());
}

// ============================================================================
// List / validate
// ============================================================================

#[derive(Debug, Serialize)]
struct TaskListing<'a> {
    id: &'a str,
    name: &'a str,
    category: &'a str,
    template: String,
    turns: usize,
    graders: Vec<&'static str>,
}

fn run_list_command(args: ListArgs) -> anyhow::Result<()> {
    let tasks = filter_tasks(
        load_tasks(&args.tasks)?,
        args.filter.as_deref(),
        args.category.as_deref(),
    );
    let listings: Vec<TaskListing<'_>> = tasks
        .iter()
        .map(|t| TaskListing {
            id: &t.id,
            name: t.display_name(),
            category: &t.category,
            template: t.template.to_string(),
            turns: t.turns.len(),
            graders: t.graders.iter().map(|g| g.kind().as_str()).collect(),
        })
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&listings)?);
        return Ok(());
    }
    for l in &listings {
        println!(
            "{:<32} {:<12} {:<8} turns={} graders={}",
            l.id,
            l.category,
            l.template,
            l.turns,
            l.graders.join(",")
        );
    }
    println!("\n{} task(s)", listings.len());
    Ok(())
}

fn run_validate_command(args: ValidateArgs) -> anyhow::Result<()> {
    let tasks = load_tasks(&args.tasks)?;
    let graders: usize = tasks.iter().map(|t| t.graders.len()).sum();
    println!(
        "{} task(s) with {} grader(s) are valid",
        tasks.len(),
        graders
    );
    Ok(())
}
