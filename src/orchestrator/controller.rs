//! Workflow runner.
//!
//! Drives one script through one engine session from start to close. The
//! session is torn down on every exit path; a workflow either delivers every
//! requested artifact or fails as a whole.

use crate::engine::encoder::Command;
use crate::engine::sync::PendingArtifacts;
use crate::engine::EngineSession;
use crate::error::{DriverError, Result};
use crate::model::{DriverEvent, WorkflowReport};
use crate::registry::OutputRegistry;
use crate::workflow::{ArchiveWriter, Script, Step};
use rand::RngCore;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Random identifier tying log lines and reports to one run.
fn gen_session_id() -> String {
    let mut b = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut b);
    format!("{:016x}", u64::from_le_bytes(b))
}

/// Run `script` on a fresh session.
///
/// Destinations are claimed for the lifetime of the run and the registry is
/// frozen before the first command goes out. Cancel through
/// [`EngineSession::controller`], taken before the session is handed over.
pub async fn run_workflow<W: ArchiveWriter>(
    mut session: EngineSession,
    registry: &mut OutputRegistry,
    script: &Script,
    writer: &W,
) -> Result<WorkflowReport> {
    let _claim = registry.claim(script.artifacts())?;
    registry.freeze();

    let session_id = gen_session_id();
    let timestamp_utc = time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "now".into());
    let started = Instant::now();
    info!(session = %session_id, workflow = %script.name, steps = script.steps.len(), "workflow starting");

    let artifacts = match execute(&mut session, registry, script, writer).await {
        Ok(ready) => ready,
        Err(e) => {
            warn!(session = %session_id, error = %e, "workflow failed");
            session.abort().await;
            return Err(e);
        }
    };
    let summary = match session.close(&script.quit).await {
        Ok(s) => s,
        Err(e) => {
            session.abort().await;
            return Err(e);
        }
    };

    let elapsed = started.elapsed();
    info!(
        session = %session_id,
        artifacts = artifacts.len(),
        elapsed_ms = elapsed.as_millis() as u64,
        "workflow complete"
    );
    Ok(WorkflowReport {
        session_id,
        workflow: script.name.clone(),
        timestamp_utc,
        commands_sent: summary.commands_sent,
        elapsed,
        artifacts,
        exit_code: summary.exit_code,
    })
}

async fn execute<W: ArchiveWriter>(
    session: &mut EngineSession,
    registry: &mut OutputRegistry,
    script: &Script,
    writer: &W,
) -> Result<BTreeMap<String, PathBuf>> {
    session.start().await?;
    let mut pending = PendingArtifacts::new();
    let mut ready = BTreeMap::new();

    for step in &script.steps {
        match step {
            Step::Stage { artifact, source } => {
                let dest = registry.issue(artifact)?;
                writer.write_archive(source, &dest).await.map_err(|e| {
                    DriverError::io(format!("staging {artifact} at {}", dest.display()), e)
                })?;
                session.emit(DriverEvent::ArtifactStaged {
                    name: artifact.clone(),
                    path: dest,
                });
            }
            Step::Send(cmd) => session.send(cmd).await?,
            Step::SendArtifact(name) => {
                let path = registry.issue(name)?;
                session.send(&Command::Path(path)).await?;
            }
            Step::Expect(name) => {
                let file = registry.artifact_file(name)?;
                prepare_destination(&file).await?;
                pending.insert(name.clone(), file);
            }
            Step::Synchronize => {
                let report = session.synchronize(&mut pending).await?;
                ready.extend(report.ready);
            }
        }
    }

    if !pending.is_empty() {
        return Err(DriverError::ordering(format!(
            "script `{}` ends with unsynchronized artifacts: {}",
            script.name,
            pending.names().join(", ")
        )));
    }
    Ok(ready)
}

/// Make sure the engine can write `file` and that no earlier copy of it is
/// left over; a stale file would pass the stability check at once.
async fn prepare_destination(file: &std::path::Path) -> Result<()> {
    if let Some(parent) = file.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DriverError::io(format!("creating {}", parent.display()), e))?;
    }
    match tokio::fs::remove_file(file).await {
        Ok(()) => {
            debug!(path = %file.display(), "removed stale artifact");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DriverError::io(
            format!("removing stale artifact {}", file.display()),
            e,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_hex_and_distinct() {
        let a = gen_session_id();
        let b = gen_session_id();
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn stale_files_are_removed_and_absent_ones_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("pearson.txt");
        std::fs::write(&file, "old").unwrap();
        prepare_destination(&file).await.unwrap();
        assert!(!file.exists());
        prepare_destination(&file).await.unwrap();

        let nested = dir.path().join("run2/out/spearman.txt");
        prepare_destination(&nested).await.unwrap();
        assert!(nested.parent().unwrap().is_dir());
    }
}
