//! Batch driver for the Climate Predictability Tool.
//!
//! The engine is an interactive, menu-driven program with no structured
//! completion signal. This crate feeds it ordered command scripts over stdin
//! and decides from the filesystem when the files it was asked to write are
//! complete.

pub mod engine;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod registry;
pub mod text_summary;
pub mod workflow;

pub use engine::encoder::{encode, Command, Scalar};
pub use engine::sync::{PendingArtifacts, SyncReport, Synchronizer};
pub use engine::{EngineSession, SessionController};
pub use error::{DriverError, Result};
pub use model::{EngineConfig, SessionState, SyncPolicy, WorkflowReport};
pub use orchestrator::run_workflow;
pub use registry::{ArtifactKind, OutputRegistry};
