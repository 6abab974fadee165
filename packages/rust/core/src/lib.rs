//! Core orchestration for siteindexer.
//!
//! This crate ties the sitemap source, crawl activity, task store and index
//! provisioner together into one replayable workflow:
//! - [`diff`]: what changed since the last baseline
//! - [`workflow`]: recorded steps and the orchestration state machine
//! - [`orchestrator`]: fan-out/fan-in crawling, baseline update, provisioning

pub mod diff;
pub mod orchestrator;
pub mod progress;
pub mod workflow;

pub use diff::{TaskDiff, diff};
pub use orchestrator::{
    ActivityFailure, Collaborators, DiffPreview, Orchestrator, OrchestratorSettings, RunReport,
};
pub use progress::{ProgressReporter, SilentProgress};
pub use workflow::{OrchestrationState, WorkflowContext};
