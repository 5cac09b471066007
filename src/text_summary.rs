//! Text summary builder for CLI output.

use crate::model::WorkflowReport;
use crate::orchestrator::ProcessedReport;

/// Pre-formatted lines for text output.
pub struct TextSummary {
    pub lines: Vec<String>,
}

/// Build a text summary from a finished report.
pub fn build_text_summary(report: &WorkflowReport, processed: &ProcessedReport) -> TextSummary {
    let mut lines = Vec::new();
    lines.push(format!(
        "Workflow: {} (session {})",
        report.workflow, report.session_id
    ));
    lines.push(format!("Started:  {}", report.timestamp_utc));
    lines.push(format!(
        "Elapsed:  {} ({} commands, exit {})",
        humantime::format_duration(std::time::Duration::from_millis(
            report.elapsed.as_millis() as u64
        )),
        report.commands_sent,
        report
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".into())
    ));

    let width = report.artifacts.keys().map(String::len).max().unwrap_or(0);
    for (name, path) in &report.artifacts {
        let flag = if processed.missing.contains(name) {
            " (missing)"
        } else {
            ""
        };
        lines.push(format!("  {name:<width$}  {}{flag}", path.display()));
    }
    lines.extend(processed.export_messages.iter().cloned());

    TextSummary { lines }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn lists_artifacts_aligned_and_flags_missing() {
        let mut artifacts = BTreeMap::new();
        artifacts.insert("ignorance".to_string(), PathBuf::from("/w/ignorance.txt"));
        artifacts.insert("generalized_roc".to_string(), PathBuf::from("/w/generalized_roc.txt"));
        let report = WorkflowReport {
            session_id: "abc".into(),
            workflow: "probabilistic_forecast_verification".into(),
            timestamp_utc: "2026-01-01T00:00:00Z".into(),
            commands_sent: 35,
            elapsed: Duration::from_millis(2345),
            artifacts,
            exit_code: Some(0),
        };
        let processed = ProcessedReport {
            export_messages: vec!["Exported JSON: /tmp/r.json".into()],
            missing: vec!["ignorance".into()],
        };
        let s = build_text_summary(&report, &processed);
        assert_eq!(s.lines[2], "Elapsed:  2s 345ms (35 commands, exit 0)");
        assert_eq!(s.lines[3], "  generalized_roc  /w/generalized_roc.txt");
        assert_eq!(s.lines[4], "  ignorance        /w/ignorance.txt (missing)");
        assert_eq!(s.lines.last().unwrap(), "Exported JSON: /tmp/r.json");
    }
}
