//! Progress callbacks for long-running orchestrations.

use crate::orchestrator::RunReport;

/// Receives orchestration progress. Implementations must be cheap; they are
/// called from the orchestrator's control loop.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called once the diff is known, before any activity is scheduled.
    fn activities_scheduled(&self, crawls: usize, deletes: usize);
    /// Called whenever a crawl or delete activity resolves.
    fn activity_finished(&self, step_id: &str, ok: bool, current: usize, total: usize);
    /// Called when the orchestration completes.
    fn done(&self, report: &RunReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn activities_scheduled(&self, _crawls: usize, _deletes: usize) {}
    fn activity_finished(&self, _step_id: &str, _ok: bool, _current: usize, _total: usize) {}
    fn done(&self, _report: &RunReport) {}
}
