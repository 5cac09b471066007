//! Error taxonomy for driving the engine.
//!
//! Every failure carries enough context (command index, artifact name, captured
//! stderr) to tell which step of a workflow went wrong. Nothing here is retried
//! automatically: the engine's menu state cannot be rewound, so callers retry
//! whole workflows or not at all.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DriverError>;

#[derive(Debug, Error)]
pub enum DriverError {
    /// The engine binary could not be spawned.
    #[error("failed to launch engine `{program}`: {source}")]
    Launch {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A command or step was issued while its preconditions did not hold.
    #[error("protocol ordering violation: {0}")]
    ProtocolOrdering(String),

    /// The engine terminated while artifacts were still outstanding.
    #[error(
        "engine exited with {} after command #{commands_sent}{}{}",
        describe_code(*code),
        pending_suffix(pending),
        stderr_suffix(stderr)
    )]
    EngineExit {
        code: Option<i32>,
        commands_sent: usize,
        pending: Vec<String>,
        stderr: String,
    },

    /// The engine wrote to its error stream while commands were being fed.
    #[error("engine rejected input after command #{command_index}: {}", stderr.trim())]
    EngineRejected { command_index: usize, stderr: String },

    /// The engine ignored the quit sequence and had to be killed.
    #[error("engine did not exit within {:?} of closing its input and was killed", grace)]
    EngineHung { grace: Duration },

    /// An artifact never became stable before the deadline.
    #[error("timed out after {:?} waiting for artifact `{artifact}` ({} still pending)", elapsed, pending.len())]
    Timeout {
        artifact: String,
        elapsed: Duration,
        pending: Vec<String>,
    },

    /// The caller cancelled the session.
    #[error("session cancelled after command #{commands_sent}")]
    Cancelled { commands_sent: usize },

    /// A registry override arrived after the path had been used.
    #[error("cannot override artifact `{artifact}`: {reason}")]
    OverrideAfterUse { artifact: String, reason: String },

    #[error("unknown artifact `{0}`")]
    UnknownArtifact(String),

    /// Another live session already owns this destination.
    #[error("artifact path {} is already claimed by another session", path.display())]
    DestinationConflict { path: PathBuf },

    /// A command cannot be serialized as a single engine line.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl DriverError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn ordering(msg: impl Into<String>) -> Self {
        Self::ProtocolOrdering(msg.into())
    }
}

fn describe_code(code: Option<i32>) -> String {
    match code {
        Some(c) => format!("status {c}"),
        None => "no status (signal)".to_string(),
    }
}

fn pending_suffix(pending: &[String]) -> String {
    if pending.is_empty() {
        String::new()
    } else {
        format!(" with artifacts still pending: {}", pending.join(", "))
    }
}

fn stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("; stderr: {trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_exit_message_names_pending_and_stderr() {
        let err = DriverError::EngineExit {
            code: Some(3),
            commands_sent: 4,
            pending: vec!["goodness_index".into()],
            stderr: "boom\n".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("status 3"));
        assert!(msg.contains("command #4"));
        assert!(msg.contains("goodness_index"));
        assert!(msg.ends_with("stderr: boom"));
    }

    #[test]
    fn engine_exit_message_without_extras() {
        let err = DriverError::EngineExit {
            code: None,
            commands_sent: 0,
            pending: vec![],
            stderr: String::new(),
        };
        assert_eq!(
            err.to_string(),
            "engine exited with no status (signal) after command #0"
        );
    }
}
