use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// How the engine is launched and supervised.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub executable: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Added on top of the inherited environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Transcript of everything the engine prints on stdout.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(with = "humantime_serde", default = "default_shutdown_grace")]
    pub shutdown_grace: Duration,
    /// Treat any stderr output during command feeding as a rejected command.
    #[serde(default = "default_true")]
    pub fail_on_stderr: bool,
    #[serde(default)]
    pub sync: SyncPolicy,
}

impl EngineConfig {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            log_file: None,
            shutdown_grace: default_shutdown_grace(),
            fail_on_stderr: true,
            sync: SyncPolicy::default(),
        }
    }
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_true() -> bool {
    true
}

/// Heuristic bounds for deciding that an artifact file is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPolicy {
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Size and mtime must stay unchanged for at least this long.
    #[serde(with = "humantime_serde")]
    pub stability_window: Duration,
    /// Overall bound for one synchronization wait.
    #[serde(with = "humantime_serde")]
    pub deadline: Duration,
    /// Accept zero-length files as complete.
    #[serde(default)]
    pub allow_empty: bool,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        let poll_interval = Duration::from_millis(200);
        Self {
            poll_interval,
            stability_window: poll_interval * 2,
            deadline: Duration::from_secs(600),
            allow_empty: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    NotStarted,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionState::NotStarted | SessionState::Running)
    }
}

/// Progress notifications emitted while a session runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DriverEvent {
    SessionStarted {
        pid: Option<u32>,
    },
    CommandSent {
        index: usize,
        line: String,
    },
    ArtifactStaged {
        name: String,
        path: PathBuf,
    },
    ArtifactReady {
        name: String,
        path: PathBuf,
    },
    Synchronized {
        artifacts: usize,
        #[serde(with = "humantime_serde")]
        elapsed: Duration,
    },
    SessionClosed {
        code: Option<i32>,
    },
    Info(String),
}

impl DriverEvent {
    /// Render a human-readable message for CLI output.
    pub fn to_message(&self) -> String {
        match self {
            DriverEvent::SessionStarted { pid } => match pid {
                Some(pid) => format!("Engine started (pid {pid})"),
                None => "Engine started".to_string(),
            },
            DriverEvent::CommandSent { index, line } => format!("#{index:<4} > {line}"),
            DriverEvent::ArtifactStaged { name, path } => {
                format!("Staged {name}: {}", path.display())
            }
            DriverEvent::ArtifactReady { name, path } => {
                format!("Ready {name}: {}", path.display())
            }
            DriverEvent::Synchronized { artifacts, elapsed } => format!(
                "Synchronized {artifacts} artifact(s) in {}",
                humantime::format_duration(round_millis(*elapsed))
            ),
            DriverEvent::SessionClosed { code } => match code {
                Some(c) => format!("Engine exited with status {c}"),
                None => "Engine terminated".to_string(),
            },
            DriverEvent::Info(msg) => msg.clone(),
        }
    }
}

fn round_millis(d: Duration) -> Duration {
    Duration::from_millis(d.as_millis() as u64)
}

/// What the engine left behind when a session closed cleanly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub exit_code: Option<i32>,
    pub commands_sent: usize,
    #[serde(default)]
    pub stderr: String,
}

/// Outcome of a complete workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowReport {
    pub session_id: String,
    pub workflow: String,
    #[serde(default)]
    pub timestamp_utc: String,
    pub commands_sent: usize,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    /// Logical artifact name to the ready file on disk.
    pub artifacts: BTreeMap<String, PathBuf>,
    pub exit_code: Option<i32>,
}
