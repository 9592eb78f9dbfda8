//! Per-run report files and the recent-runs digest.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use gdp_core::{RunSummary, ScoredOpportunity};
use tokio::fs;

pub const SUMMARY_FILE: &str = "run_summary.json";
pub const BRIEF_FILE: &str = "discovery_brief.md";
const BRIEF_TOP_N: usize = 10;

/// Writes `<reports_dir>/<run_id>/run_summary.json` and `discovery_brief.md`.
pub async fn write_run_reports(
    reports_dir: &Path,
    summary: &RunSummary,
    selected: &[ScoredOpportunity],
) -> Result<PathBuf> {
    let run_dir = reports_dir.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(run_dir.join(SUMMARY_FILE), json)
        .await
        .with_context(|| format!("writing {SUMMARY_FILE}"))?;

    fs::write(run_dir.join(BRIEF_FILE), render_brief(summary, selected))
        .await
        .with_context(|| format!("writing {BRIEF_FILE}"))?;

    Ok(run_dir)
}

fn render_brief(summary: &RunSummary, selected: &[ScoredOpportunity]) -> String {
    let mut lines = vec![
        "# Grant Discovery Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Trigger: {}", summary.trigger.as_str()),
        format!("- Started: {}", summary.timestamp.to_rfc3339()),
        format!("- Duration: {} ms", summary.duration_ms),
        format!("- Taxonomy: {}", summary.taxonomy_version),
        format!(
            "- Outcome: {}",
            match (summary.success, summary.timed_out) {
                (true, _) => "completed",
                (false, true) => "deadline reached (partial)",
                (false, false) => "failed",
            }
        ),
        format!(
            "- Discovered {} / imported {} / updated {} / skipped {} / high priority {}",
            summary.discovered,
            summary.imported,
            summary.updated,
            summary.skipped,
            summary.high_priority
        ),
        String::new(),
        "## Sources".to_string(),
    ];
    for source in &summary.sources {
        lines.push(format!("- {}: {}", source.name, source.count));
    }

    if !selected.is_empty() {
        lines.push(String::new());
        lines.push("## Top Matches".to_string());
        lines.push(String::new());
        lines.push("| Score | Win % | Priority | Title | Tags | Closes |".to_string());
        lines.push("|---|---|---|---|---|---|".to_string());
        for scored in selected.iter().take(BRIEF_TOP_N) {
            let opp = &scored.opportunity;
            lines.push(format!(
                "| {} | {} | {} | {} | {} | {} |",
                scored.match_score,
                scored.win_probability,
                scored.priority(),
                opp.title.replace('|', "/"),
                scored.matched_tags.join(", "),
                opp.close_date
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "-".to_string())
            ));
        }
    }

    if !summary.errors.is_empty() {
        lines.push(String::new());
        lines.push("## Errors".to_string());
        for error in &summary.errors {
            lines.push(format!("- {error}"));
        }
    }

    lines.push(String::new());
    lines.join("\n")
}

/// Markdown digest of the most recent `runs` run summaries under `reports_dir`.
pub fn report_recent_runs_markdown(reports_dir: &Path, runs: usize) -> Result<String> {
    let mut summaries = Vec::new();
    let entries = std::fs::read_dir(reports_dir)
        .with_context(|| format!("reading {}", reports_dir.display()))?;
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path().join(SUMMARY_FILE);
        if !path.is_file() {
            continue;
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let summary: RunSummary = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        summaries.push((summary, entry.path()));
    }
    summaries.sort_by(|(a, _), (b, _)| b.timestamp.cmp(&a.timestamp));

    let mut lines = vec!["# Grant Discovery Runs".to_string(), String::new()];
    if summaries.is_empty() {
        lines.push("No runs recorded yet.".to_string());
    }
    for (summary, dir) in summaries.into_iter().take(runs.max(1)) {
        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!(
            "- {} via {}, {} ms{}",
            summary.timestamp.to_rfc3339(),
            summary.trigger.as_str(),
            summary.duration_ms,
            if summary.timed_out { " (timed out)" } else { "" }
        ));
        lines.push(format!(
            "- discovered {}, imported {}, updated {}, skipped {}, high priority {}",
            summary.discovered, summary.imported, summary.updated, summary.skipped, summary.high_priority
        ));
        lines.push(format!("- errors: {}", summary.errors.len()));
        let brief = dir.join(BRIEF_FILE);
        if brief.exists() {
            lines.push(format!("- brief: `{}`", brief.display()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}
