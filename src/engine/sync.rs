//! Completion synchronizer.
//!
//! The engine never says when a file is done; it just writes it. We poll each
//! pending artifact and call it ready once its size and mtime have held still
//! for the stability window. Engine exit, the overall deadline and caller
//! cancellation all end the wait early.

use crate::engine::EngineControl;
use crate::error::{DriverError, Result};
use crate::model::SyncPolicy;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

/// What one poll sees of an artifact file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSnapshot {
    pub len: u64,
    pub modified: Option<SystemTime>,
}

/// Readiness source for artifact files; the real one reads filesystem metadata.
pub trait ArtifactProbe {
    /// `Ok(None)` while the file does not exist yet.
    fn observe(&self, path: &Path) -> io::Result<Option<FileSnapshot>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FsProbe;

impl ArtifactProbe for FsProbe {
    fn observe(&self, path: &Path) -> io::Result<Option<FileSnapshot>> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.is_file() => Ok(Some(FileSnapshot {
                len: meta.len(),
                modified: meta.modified().ok(),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Lets the synchronizer notice that the engine is gone.
pub trait ExitWatch {
    /// `Some(code)` once the engine has terminated (`code` is `None` for a signal).
    fn poll_exit(&mut self) -> Result<Option<Option<i32>>>;
}

/// Artifacts a workflow step expects before it may continue.
#[derive(Debug, Clone, Default)]
pub struct PendingArtifacts {
    items: BTreeMap<String, PathBuf>,
}

impl PendingArtifacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, file: impl Into<PathBuf>) {
        self.items.insert(name.into(), file.into());
    }

    pub(crate) fn remove(&mut self, name: &str) -> Option<PathBuf> {
        self.items.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.items.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn names(&self) -> Vec<String> {
        self.items.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.items.iter().map(|(k, v)| (k.as_str(), v.as_path()))
    }
}

#[derive(Debug, Clone)]
pub struct SyncReport {
    pub ready: Vec<(String, PathBuf)>,
    pub elapsed: Duration,
}

struct Track {
    last: FileSnapshot,
    since: Instant,
}

pub struct Synchronizer<P = FsProbe> {
    policy: SyncPolicy,
    probe: P,
}

impl Synchronizer<FsProbe> {
    pub fn new(policy: SyncPolicy) -> Self {
        Self {
            policy,
            probe: FsProbe,
        }
    }
}

impl<P: ArtifactProbe> Synchronizer<P> {
    pub fn with_probe(policy: SyncPolicy, probe: P) -> Self {
        Self { policy, probe }
    }

    pub fn policy(&self) -> &SyncPolicy {
        &self.policy
    }

    /// Block until every pending artifact is ready.
    ///
    /// Ready artifacts are removed from `pending` as they are confirmed, so on
    /// failure `pending` holds exactly what never completed. `EngineExit` and
    /// `Cancelled` errors carry a zero command count; the session fills it in.
    pub async fn wait<W: ExitWatch>(
        &self,
        pending: &mut PendingArtifacts,
        watch: &mut W,
        mut control: Option<&mut UnboundedReceiver<EngineControl>>,
        mut on_ready: impl FnMut(&str, &Path),
    ) -> Result<SyncReport> {
        let start = Instant::now();
        let deadline = start + self.policy.deadline;
        let mut ready = Vec::with_capacity(pending.len());
        let mut tracks: BTreeMap<String, Track> = BTreeMap::new();

        let mut ticker = tokio::time::interval(self.policy.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                msg = next_control(&mut control) => {
                    match msg {
                        Some(EngineControl::Cancel) => {
                            debug!(pending = pending.len(), "synchronization cancelled");
                            return Err(DriverError::Cancelled { commands_sent: 0 });
                        }
                        // All controllers dropped; nobody can cancel any more.
                        None => {
                            control = None;
                            continue;
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(self.timeout(pending, start));
                }
                _ = ticker.tick() => {}
            }

            let now = Instant::now();
            self.sweep(pending, &mut tracks, now, &mut ready, &mut on_ready)?;
            if pending.is_empty() {
                return Ok(SyncReport {
                    ready,
                    elapsed: start.elapsed(),
                });
            }

            // A dead engine never completes what is still pending, whatever
            // is on disk and whatever its exit status.
            if let Some(code) = watch.poll_exit()? {
                debug!(?code, pending = ?pending.names(), "engine exited before artifacts completed");
                return Err(DriverError::EngineExit {
                    code,
                    commands_sent: 0,
                    pending: pending.names(),
                    stderr: String::new(),
                });
            }
        }
    }

    fn sweep(
        &self,
        pending: &mut PendingArtifacts,
        tracks: &mut BTreeMap<String, Track>,
        now: Instant,
        ready: &mut Vec<(String, PathBuf)>,
        on_ready: &mut impl FnMut(&str, &Path),
    ) -> Result<()> {
        let mut done = Vec::new();
        for (name, file) in pending.iter() {
            let snapshot = self
                .probe
                .observe(file)
                .map_err(|e| DriverError::io(format!("inspecting {}", file.display()), e))?;
            let Some(snap) = snapshot.filter(|s| self.policy.allow_empty || s.len > 0) else {
                tracks.remove(name);
                continue;
            };
            match tracks.get(name) {
                Some(t) if t.last == snap => {
                    if now.saturating_duration_since(t.since) >= self.policy.stability_window {
                        done.push(name.to_string());
                    }
                }
                _ => {
                    trace!(artifact = name, len = snap.len, "artifact changed");
                    tracks.insert(
                        name.to_string(),
                        Track {
                            last: snap,
                            since: now,
                        },
                    );
                }
            }
        }
        for name in done {
            tracks.remove(&name);
            if let Some(file) = pending.remove(&name) {
                debug!(artifact = %name, file = %file.display(), "artifact ready");
                on_ready(&name, &file);
                ready.push((name, file));
            }
        }
        Ok(())
    }

    fn timeout(&self, pending: &PendingArtifacts, start: Instant) -> DriverError {
        let names = pending.names();
        DriverError::Timeout {
            artifact: names.first().cloned().unwrap_or_default(),
            elapsed: start.elapsed(),
            pending: names,
        }
    }
}

async fn next_control(
    control: &mut Option<&mut UnboundedReceiver<EngineControl>>,
) -> Option<EngineControl> {
    match control.as_mut() {
        Some(rx) => rx.recv().await,
        None => futures::future::pending().await,
    }
}
