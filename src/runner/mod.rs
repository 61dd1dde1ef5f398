//! Trial execution.
//!
//! ```text
//! Scheduler ─► TrialRunner ─► WorkspaceManager   (setup / cleanup)
//!                         ├─► AgentClient        (conversation)
//!                         └─► GraderRegistry     (grading)
//!                                   │
//!                         TrialResult ─► IncrementalReporter, ProgressDisplay
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use trialforge::grader::GraderRegistry;
//! use trialforge::runner::{CommandAgent, HarnessConfig, RunMode, Scheduler};
//!
//! let config = HarnessConfig::new()
//!     .with_mode(RunMode::Parallel)
//!     .with_concurrency(4);
//! let agent = Arc::new(CommandAgent::new("./my-agent"));
//! let scheduler = Scheduler::new(config, agent, Arc::new(GraderRegistry::with_defaults(None)));
//!
//! let eval = scheduler.run(&tasks).await?;
//! println!("pass rate {:.1}%", eval.summary.pass_rate * 100.0);
//! ```

pub mod agents;
pub mod config;
pub mod limiter;
pub mod progress;
pub mod result;
pub mod scheduler;
pub mod trial;

#[cfg(test)]
pub(crate) mod testing;

pub use agents::{
    AgentClient, AgentError, AgentEvent, AgentReply, AgentRequest, CommandAgent, ConversationTurn,
    HttpAgent, Role,
};
pub use config::{AgentSpec, ConfigError, HarnessConfig, RunMode};
pub use limiter::{ConcurrencyLimiter, LimiterPermit};
pub use progress::{ProgressDisplay, ProgressMonitor, ProgressSnapshot};
pub use result::{
    overall_pass, score_map, Breakdown, EvalResult, OutcomeSnapshot, ReportSummary, TrialResult,
    TrialState,
};
pub use scheduler::Scheduler;
pub use trial::{TrialError, TrialRunner};
