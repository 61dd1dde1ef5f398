//! Trial results and sweep aggregates.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::config::RunMode;
use crate::grader::GraderResult;
use crate::transcript::{digest_entries, TranscriptEntry};
use crate::workspace::PortPair;

/// Where a trial is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialState {
    Pending,
    Setup,
    Conversation,
    Grading,
    Done,
    Error,
}

impl TrialState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TrialState::Done | TrialState::Error)
    }
}

impl std::fmt::Display for TrialState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TrialState::Pending => "pending",
            TrialState::Setup => "setup",
            TrialState::Conversation => "conversation",
            TrialState::Grading => "grading",
            TrialState::Done => "done",
            TrialState::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Observable end state of the workspace, captured before cleanup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutcomeSnapshot {
    /// Project-relative files, sorted, dependency dirs skipped.
    pub files: Vec<String>,
    /// Something listened on the service or dev port, or a process was started.
    pub service_started: bool,
    /// A storage or ingestion grader found persisted data.
    pub data_persisted: bool,
    /// Error lines reported by the runtime grader.
    pub runtime_errors: Vec<String>,
    pub setup_warnings: Vec<String>,
}

/// Everything known about one trial. Built once by the trial runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    pub task_id: String,
    pub task_name: String,
    pub category: String,
    /// 1-based repetition index.
    pub trial: u32,
    pub passed: bool,
    /// Grader type to score; repeated types get `#2`, `#3` suffixes.
    pub scores: BTreeMap<String, f64>,
    pub grader_results: Vec<GraderResult>,
    #[serde(default)]
    pub transcript: Vec<TranscriptEntry>,
    /// SHA-256 of the serialized transcript.
    pub transcript_digest: String,
    pub outcome: OutcomeSnapshot,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub state: TrialState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<PortPair>,
}

impl TrialResult {
    /// A result for a trial that never got to run its own state machine.
    pub fn errored(
        task_id: impl Into<String>,
        task_name: impl Into<String>,
        category: impl Into<String>,
        trial: u32,
        error: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            task_name: task_name.into(),
            category: category.into(),
            trial,
            passed: false,
            scores: BTreeMap::new(),
            grader_results: Vec::new(),
            transcript: Vec::new(),
            transcript_digest: digest_entries(&[]),
            outcome: OutcomeSnapshot::default(),
            started_at: Utc::now(),
            duration_ms: 0,
            state: TrialState::Error,
            error: Some(error.into()),
            workspace_id: None,
            ports: None,
        }
    }

    /// Mean grader score; 0 without results.
    pub fn mean_score(&self) -> f64 {
        mean(self.grader_results.iter().map(|r| r.score))
    }

    /// Copy without the transcript, for the report body.
    pub fn without_transcript(&self) -> Self {
        Self {
            transcript: Vec::new(),
            ..self.clone()
        }
    }
}

/// AND over grader verdicts. False without results or after a fault.
pub fn overall_pass(results: &[GraderResult], errored: bool) -> bool {
    !errored && !results.is_empty() && results.iter().all(|r| r.passed)
}

/// Grader type to score, suffixing repeated types.
pub fn score_map(results: &[GraderResult]) -> BTreeMap<String, f64> {
    let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
    let mut scores = BTreeMap::new();
    for result in results {
        let count = seen.entry(result.grader_type.as_str()).or_insert(0);
        *count += 1;
        let key = if *count == 1 {
            result.grader_type.clone()
        } else {
            format!("{}#{}", result.grader_type, count)
        };
        scores.insert(key, result.score);
    }
    scores
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

/// Pass counts for one slice of the results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Breakdown {
    pub total: usize,
    pub passed: usize,
    pub pass_rate: f64,
    pub mean_score: f64,
}

impl Breakdown {
    fn from_scores(entries: &[(bool, f64)]) -> Self {
        let total = entries.len();
        let passed = entries.iter().filter(|(p, _)| *p).count();
        Self {
            total,
            passed,
            pass_rate: if total == 0 {
                0.0
            } else {
                passed as f64 / total as f64
            },
            mean_score: mean(entries.iter().map(|(_, s)| *s)),
        }
    }
}

/// Aggregate over finished trials.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    /// Trials that ended in the error state.
    pub errored: usize,
    pub pass_rate: f64,
    pub mean_score: f64,
    pub by_category: BTreeMap<String, Breakdown>,
    pub by_grader: BTreeMap<String, Breakdown>,
}

impl ReportSummary {
    pub fn from_results(results: &[TrialResult]) -> Self {
        let total = results.len();
        let passed = results.iter().filter(|r| r.passed).count();

        let mut categories: BTreeMap<String, Vec<(bool, f64)>> = BTreeMap::new();
        let mut graders: BTreeMap<String, Vec<(bool, f64)>> = BTreeMap::new();
        for result in results {
            categories
                .entry(result.category.clone())
                .or_default()
                .push((result.passed, result.mean_score()));
            for grader in &result.grader_results {
                graders
                    .entry(grader.grader_type.clone())
                    .or_default()
                    .push((grader.passed, grader.score));
            }
        }

        Self {
            total,
            passed,
            failed: total - passed,
            errored: results
                .iter()
                .filter(|r| r.state == TrialState::Error)
                .count(),
            pass_rate: if total == 0 {
                0.0
            } else {
                passed as f64 / total as f64
            },
            mean_score: mean(results.iter().map(TrialResult::mean_score)),
            by_category: categories
                .iter()
                .map(|(k, v)| (k.clone(), Breakdown::from_scores(v)))
                .collect(),
            by_grader: graders
                .iter()
                .map(|(k, v)| (k.clone(), Breakdown::from_scores(v)))
                .collect(),
        }
    }
}

/// Outcome of a whole sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalResult {
    /// Sorted by `(task_id, trial)`.
    pub results: Vec<TrialResult>,
    pub summary: ReportSummary,
    pub mode: RunMode,
    pub model: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl EvalResult {
    pub fn new(
        mut results: Vec<TrialResult>,
        mode: RunMode,
        model: Option<String>,
        started_at: DateTime<Utc>,
        duration_ms: u64,
    ) -> Self {
        results.sort_by(|a, b| a.task_id.cmp(&b.task_id).then(a.trial.cmp(&b.trial)));
        let summary = ReportSummary::from_results(&results);
        Self {
            results,
            summary,
            mode,
            model,
            started_at,
            duration_ms,
        }
    }

    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }
}
