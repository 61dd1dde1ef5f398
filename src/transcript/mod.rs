//! Per-trial transcripts.
//!
//! Every message, tool call, error and grader verdict of a trial is appended
//! to a [`TranscriptRecorder`] with its offset from the trial start. The
//! finished transcript is stored in the trial result and written to
//! `transcripts/<task_id>.json` by the reporter.

pub mod recorder;
pub mod types;

pub use recorder::{digest_entries, summarize, TranscriptRecorder};
pub use types::{EntryKind, TranscriptEntry, TranscriptSummary};
