//! Application-level orchestration.
//!
//! Runs a workflow script over one engine session and handles what happens
//! to the report afterwards. The CLI calls into this module rather than
//! driving sessions itself.

mod controller;
mod post_process;

pub use controller::run_workflow;
pub use post_process::{export_json, process_report, ProcessedReport};
