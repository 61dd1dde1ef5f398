//! Crash-safe incremental reporting.
//!
//! The [`IncrementalReporter`] rewrites the whole report after every trial,
//! so a sweep killed at any point leaves a complete, parseable report of the
//! trials finished so far.
//!
//! Layout under the output directory:
//!
//! ```text
//! report.json              summary + transcript-free trial results
//! report.md                the same as markdown tables
//! transcripts/<task>.json  every trial transcript of one task
//! ```

pub mod markdown;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ReportError;
use crate::runner::{ReportSummary, TrialResult, TrialState};
use crate::transcript::TranscriptEntry;
use crate::utils::{atomic_write_file, sanitize_file_component};

pub const REPORT_JSON: &str = "report.json";
pub const REPORT_MARKDOWN: &str = "report.md";
pub const TRANSCRIPTS_DIR: &str = "transcripts";

/// Completed versus expected trials.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportProgress {
    pub completed: usize,
    pub total: usize,
}

/// Contents of `report.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportDocument {
    /// Last rewrite.
    pub timestamp: DateTime<Utc>,
    pub model: Option<String>,
    pub progress: ReportProgress,
    pub results: Vec<TrialResult>,
    pub summary: ReportSummary,
}

/// One trial's transcript inside `transcripts/<task>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptRecord {
    pub task_id: String,
    pub trial: u32,
    pub state: TrialState,
    pub passed: bool,
    pub transcript_digest: String,
    pub transcript: Vec<TranscriptEntry>,
}

impl TranscriptRecord {
    fn from_result(result: &TrialResult) -> Self {
        Self {
            task_id: result.task_id.clone(),
            trial: result.trial,
            state: result.state,
            passed: result.passed,
            transcript_digest: result.transcript_digest.clone(),
            transcript: result.transcript.clone(),
        }
    }
}

#[derive(Default)]
struct ReportState {
    results: Vec<TrialResult>,
    transcripts: BTreeMap<String, Vec<TranscriptRecord>>,
}

/// Persists results as trials finish. Safe to share between trial tasks.
pub struct IncrementalReporter {
    output_dir: PathBuf,
    model: Option<String>,
    total: usize,
    state: Mutex<ReportState>,
}

impl IncrementalReporter {
    /// `total` is the number of trials the sweep expects to run.
    pub fn new(output_dir: impl Into<PathBuf>, total: usize, model: Option<String>) -> Self {
        Self {
            output_dir: output_dir.into(),
            model,
            total,
            state: Mutex::new(ReportState::default()),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn report_path(&self) -> PathBuf {
        self.output_dir.join(REPORT_JSON)
    }

    pub fn markdown_path(&self) -> PathBuf {
        self.output_dir.join(REPORT_MARKDOWN)
    }

    pub fn transcript_path(&self, task_id: &str) -> PathBuf {
        self.output_dir
            .join(TRANSCRIPTS_DIR)
            .join(format!("{}.json", sanitize_file_component(task_id)))
    }

    /// Creates the output directories and writes an empty report.
    pub fn init(&self) -> Result<(), ReportError> {
        let transcripts = self.output_dir.join(TRANSCRIPTS_DIR);
        std::fs::create_dir_all(&transcripts).map_err(|source| ReportError::Write {
            path: transcripts,
            source,
        })?;
        let state = self.lock();
        self.write_report(&state)
    }

    /// Stores `result` and rewrites the report and the task's transcript file.
    pub fn add_result(&self, result: &TrialResult) -> Result<(), ReportError> {
        let mut state = self.lock();
        state.results.push(result.without_transcript());
        let records = state.transcripts.entry(result.task_id.clone()).or_default();
        records.push(TranscriptRecord::from_result(result));
        records.sort_by_key(|r| r.trial);

        let path = self.transcript_path(&result.task_id);
        write_json(&path, records)?;
        self.write_report(&state)?;

        debug!(
            task_id = %result.task_id,
            trial = result.trial,
            completed = state.results.len(),
            total = self.total,
            "Report updated"
        );
        Ok(())
    }

    /// Current report contents.
    pub fn document(&self) -> ReportDocument {
        let state = self.lock();
        self.build_document(&state)
    }

    fn build_document(&self, state: &ReportState) -> ReportDocument {
        let mut results = state.results.clone();
        results.sort_by(|a, b| a.task_id.cmp(&b.task_id).then(a.trial.cmp(&b.trial)));
        ReportDocument {
            timestamp: Utc::now(),
            model: self.model.clone(),
            progress: ReportProgress {
                completed: results.len(),
                total: self.total.max(results.len()),
            },
            summary: ReportSummary::from_results(&results),
            results,
        }
    }

    fn write_report(&self, state: &ReportState) -> Result<(), ReportError> {
        let document = self.build_document(state);
        write_json(&self.report_path(), &document)?;
        let markdown = markdown::render(&document);
        let path = self.markdown_path();
        atomic_write_file(&path, markdown.as_bytes())
            .map_err(|source| ReportError::Write { path, source })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ReportState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), ReportError> {
    let body = serde_json::to_vec_pretty(value)?;
    atomic_write_file(path, &body).map_err(|source| ReportError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Reads a `report.json` back.
pub fn load_report(path: &Path) -> Result<ReportDocument, ReportError> {
    let content = std::fs::read(path).map_err(|source| ReportError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_slice(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grader::{GraderKind, GraderResult};
    use crate::runner::{overall_pass, score_map};
    use crate::transcript::TranscriptRecorder;
    use tempfile::TempDir;

    fn result(task: &str, trial: u32, passed: bool) -> TrialResult {
        let grader = if passed {
            GraderResult::pass(GraderKind::Server)
        } else {
            GraderResult::fail(GraderKind::Server, "404")
        };
        let mut recorder = TranscriptRecorder::new();
        recorder.record_user("build it");
        recorder.record_assistant("done");
        recorder.record_grader_result(&grader);

        let mut r = TrialResult::errored(task, task, "api", trial, "");
        r.error = None;
        r.state = TrialState::Done;
        r.transcript = recorder.into_entries();
        r.passed = overall_pass(std::slice::from_ref(&grader), false);
        r.scores = score_map(std::slice::from_ref(&grader));
        r.grader_results = vec![grader];
        r
    }

    #[test]
    fn test_init_writes_empty_report() {
        let temp = TempDir::new().unwrap();
        let reporter = IncrementalReporter::new(temp.path().join("out"), 3, Some("m".into()));
        reporter.init().unwrap();

        let doc = load_report(&reporter.report_path()).unwrap();
        assert_eq!(doc.progress, ReportProgress { completed: 0, total: 3 });
        assert!(doc.results.is_empty());
        assert_eq!(doc.model.as_deref(), Some("m"));
        assert!(temp.path().join("out/transcripts").is_dir());
        assert!(reporter.markdown_path().exists());
    }

    #[test]
    fn test_report_is_complete_after_each_trial() {
        let temp = TempDir::new().unwrap();
        let reporter = IncrementalReporter::new(temp.path(), 4, None);
        reporter.init().unwrap();

        reporter.add_result(&result("b", 1, true)).unwrap();
        reporter.add_result(&result("a", 1, false)).unwrap();

        // A sweep killed here still leaves 2 of 4 trials on disk.
        let doc = load_report(&reporter.report_path()).unwrap();
        assert_eq!(doc.progress, ReportProgress { completed: 2, total: 4 });
        assert_eq!(doc.results[0].task_id, "a");
        assert!(doc.results.iter().all(|r| r.transcript.is_empty()));
        assert_eq!(doc.summary.passed, 1);
        assert_eq!(doc.summary.failed, 1);

        let leftovers: Vec<_> = std::fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_transcripts_grouped_by_task() {
        let temp = TempDir::new().unwrap();
        let reporter = IncrementalReporter::new(temp.path(), 2, None);
        reporter.init().unwrap();
        reporter.add_result(&result("svc/one", 2, true)).unwrap();
        reporter.add_result(&result("svc/one", 1, true)).unwrap();

        let path = reporter.transcript_path("svc/one");
        assert!(path.ends_with("transcripts/svc_one.json"));
        let records: Vec<TranscriptRecord> =
            serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].trial, 1);
        assert_eq!(records[1].transcript.len(), 3);
    }
}
