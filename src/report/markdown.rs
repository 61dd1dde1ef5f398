//! Markdown rendering of a report.

use std::fmt::Write;

use super::ReportDocument;
use crate::runner::{Breakdown, TrialState};
use crate::utils::truncate;

/// Renders `doc` as a markdown page.
pub fn render(doc: &ReportDocument) -> String {
    let mut out = String::new();
    let summary = &doc.summary;

    let _ = writeln!(out, "# trialforge report\n");
    let _ = writeln!(out, "- Updated: {}", doc.timestamp.to_rfc3339());
    if let Some(model) = &doc.model {
        let _ = writeln!(out, "- Model: `{}`", model);
    }
    let _ = writeln!(
        out,
        "- Progress: {}/{} trials",
        doc.progress.completed, doc.progress.total
    );
    let _ = writeln!(
        out,
        "- Passed: {} / failed: {} / errored: {}",
        summary.passed, summary.failed, summary.errored
    );
    let _ = writeln!(
        out,
        "- Pass rate: {:.1}%, mean score {:.2}\n",
        summary.pass_rate * 100.0,
        summary.mean_score
    );

    if doc.results.is_empty() {
        out.push_str("_No trials finished yet._\n");
        return out;
    }

    out.push_str("## Trials\n\n");
    out.push_str("| Task | Trial | Result | Scores | Duration | Error |\n");
    out.push_str("|---|---|---|---|---|---|\n");
    for r in &doc.results {
        let verdict = match (r.passed, r.state) {
            (true, _) => "PASS",
            (false, TrialState::Error) => "ERROR",
            (false, _) => "FAIL",
        };
        let scores = r
            .scores
            .iter()
            .map(|(k, v)| format!("{} {:.2}", k, v))
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(
            out,
            "| {} | {} | {} | {} | {:.1}s | {} |",
            cell(&r.task_id),
            r.trial,
            verdict,
            cell(&scores),
            r.duration_ms as f64 / 1000.0,
            cell(r.error.as_deref().unwrap_or(""))
        );
    }

    breakdown_table(&mut out, "By category", "Category", summary.by_category.iter());
    breakdown_table(&mut out, "By grader", "Grader", summary.by_grader.iter());
    out
}

fn breakdown_table<'a>(
    out: &mut String,
    title: &str,
    label: &str,
    rows: impl Iterator<Item = (&'a String, &'a Breakdown)>,
) {
    let _ = writeln!(out, "\n## {}\n", title);
    let _ = writeln!(out, "| {} | Passed | Total | Pass rate | Mean score |", label);
    out.push_str("|---|---|---|---|---|\n");
    for (name, b) in rows {
        let _ = writeln!(
            out,
            "| {} | {} | {} | {:.1}% | {:.2} |",
            cell(name),
            b.passed,
            b.total,
            b.pass_rate * 100.0,
            b.mean_score
        );
    }
}

/// Escapes pipes and newlines so text stays inside its table cell.
fn cell(text: &str) -> String {
    truncate(text, 160).replace('|', "\\|").replace('\n', " ")
}
