//! Post-run processing: export the report and re-check the delivered files.

use crate::error::{DriverError, Result};
use crate::model::WorkflowReport;
use std::path::Path;

/// Result of post-run processing, ready for presentation layers.
#[derive(Debug, Default)]
pub struct ProcessedReport {
    pub export_messages: Vec<String>,
    /// Artifacts reported ready that are no longer on disk.
    pub missing: Vec<String>,
}

/// Write the report as pretty JSON, creating parent directories.
pub fn export_json(path: &Path, report: &WorkflowReport) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| DriverError::io(format!("creating {}", parent.display()), e))?;
    }
    let json = serde_json::to_string_pretty(report).map_err(|e| {
        DriverError::io("serializing report", std::io::Error::other(e))
    })?;
    std::fs::write(path, json)
        .map_err(|e| DriverError::io(format!("writing {}", path.display()), e))
}

pub fn process_report(report: &WorkflowReport, export_path: Option<&Path>) -> ProcessedReport {
    let mut out = ProcessedReport::default();
    if let Some(path) = export_path {
        match export_json(path, report) {
            Ok(()) => out
                .export_messages
                .push(format!("Exported JSON: {}", path.display())),
            Err(e) => out.export_messages.push(format!("Export JSON failed: {e}")),
        }
    }
    out.missing = report
        .artifacts
        .iter()
        .filter(|(_, path)| !path.is_file())
        .map(|(name, _)| name.clone())
        .collect();
    out
}
