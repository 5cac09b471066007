//! Line encoding for the engine's control channel.
//!
//! Every command becomes exactly one `\n`-terminated line. The engine parses
//! numbers as plain decimal text, so floats are written with the shortest
//! digit string that reads back to the same `f64` and never in exponent form.

use crate::error::{DriverError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

pub const LINE_SEPARATOR: char = '\n';

/// A typed numeric parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Int(i64),
    Float(f64),
}

impl Scalar {
    /// Parse a value back out of an encoded line.
    pub fn parse_line(line: &str) -> Option<Scalar> {
        let text = line.strip_suffix(LINE_SEPARATOR).unwrap_or(line);
        if let Ok(i) = text.parse::<i64>() {
            return Some(Scalar::Int(i));
        }
        text.parse::<f64>().ok().map(Scalar::Float)
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Scalar::Int(i) => i as f64,
            Scalar::Float(f) => f,
        }
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int(v)
    }
}

impl From<i32> for Scalar {
    fn from(v: i32) -> Self {
        Scalar::Int(v as i64)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Float(v)
    }
}

/// One unit of input for the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Menu selection.
    Select(i64),
    Scalar(Scalar),
    Path(PathBuf),
}

impl Command {
    pub fn scalar(v: impl Into<Scalar>) -> Self {
        Command::Scalar(v.into())
    }

    pub fn path(p: impl Into<PathBuf>) -> Self {
        Command::Path(p.into())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Select(code) => write!(f, "select {code}"),
            Command::Scalar(Scalar::Int(i)) => write!(f, "int {i}"),
            Command::Scalar(Scalar::Float(x)) => write!(f, "float {x}"),
            Command::Path(p) => write!(f, "path {}", p.display()),
        }
    }
}

/// Serialize a command into the line the engine reads.
pub fn encode(command: &Command) -> Result<String> {
    let mut line = match command {
        Command::Select(code) => code.to_string(),
        Command::Scalar(Scalar::Int(i)) => i.to_string(),
        Command::Scalar(Scalar::Float(x)) => encode_float(*x)?,
        Command::Path(p) => encode_path(p)?,
    };
    line.push(LINE_SEPARATOR);
    Ok(line)
}

fn encode_float(x: f64) -> Result<String> {
    if !x.is_finite() {
        return Err(DriverError::InvalidCommand(format!(
            "non-finite value {x} cannot be sent to the engine"
        )));
    }
    // f64's Display is the shortest round-trip form and never uses exponents.
    if x == 0.0 {
        return Ok("0".to_string());
    }
    Ok(x.to_string())
}

fn encode_path(p: &Path) -> Result<String> {
    let abs = absolute(p)?;
    let text = abs.to_str().ok_or_else(|| {
        DriverError::InvalidCommand(format!("path {} is not valid UTF-8", abs.display()))
    })?;
    if text.contains(['\n', '\r']) {
        return Err(DriverError::InvalidCommand(format!(
            "path {text:?} contains a line separator"
        )));
    }
    Ok(text.to_string())
}

/// Resolve `p` against the current directory without touching the filesystem.
pub fn absolute(p: &Path) -> Result<PathBuf> {
    if p.as_os_str().is_empty() {
        return Err(DriverError::InvalidCommand("empty path".into()));
    }
    if p.is_absolute() {
        return Ok(p.to_path_buf());
    }
    let cwd = std::env::current_dir()
        .map_err(|e| DriverError::io("resolving current directory", e))?;
    Ok(cwd.join(p))
}
