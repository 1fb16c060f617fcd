use super::executor::{ExecutionReport, OperationResult, Outcome};
use super::plan::{OperationKind, Plan};
use std::fmt;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    PartialFailure,
    Aborted,
}

impl RunStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            RunStatus::Success => 0,
            RunStatus::PartialFailure => 1,
            RunStatus::Aborted => 2,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Success => f.write_str("success"),
            RunStatus::PartialFailure => f.write_str("partial-failure"),
            RunStatus::Aborted => f.write_str("aborted"),
        }
    }
}

/// Outcome counts for one run, plus every per-operation result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub skipped: usize,
    pub status: RunStatus,
    pub results: Vec<OperationResult>,
    pub abort_reason: Option<String>,
}

impl RunSummary {
    fn empty(status: RunStatus) -> Self {
        Self {
            created: 0,
            updated: 0,
            deleted: 0,
            unchanged: 0,
            failed: 0,
            skipped: 0,
            status,
            results: Vec::new(),
            abort_reason: None,
        }
    }

    pub fn from_report(plan: &Plan, report: ExecutionReport) -> Self {
        let mut summary = Self::empty(RunStatus::Success);
        summary.unchanged = plan.unchanged;

        for result in &report.results {
            match &result.outcome {
                Outcome::Completed { .. } => match result.operation.kind() {
                    OperationKind::CreateList | OperationKind::CreatePolicy => summary.created += 1,
                    OperationKind::UpdateList | OperationKind::UpdatePolicy => summary.updated += 1,
                    OperationKind::DeleteList | OperationKind::DeletePolicy => summary.deleted += 1,
                },
                Outcome::Failed { .. } => summary.failed += 1,
                Outcome::Skipped(_) => summary.skipped += 1,
            }
        }

        summary.status = if let Some(fatal) = &report.fatal {
            summary.abort_reason = Some(fatal.to_string());
            RunStatus::Aborted
        } else if summary.failed + summary.skipped > 0 {
            RunStatus::PartialFailure
        } else {
            RunStatus::Success
        };
        summary.results = report.results;
        summary
    }

    /// A run that stopped before executing anything.
    pub fn aborted(reason: impl Into<String>) -> Self {
        let mut summary = Self::empty(RunStatus::Aborted);
        summary.abort_reason = Some(reason.into());
        summary
    }

    /// A dry run: nothing executed, everything planned counts as skipped.
    pub fn planned(plan: &Plan) -> Self {
        let mut summary = Self::empty(RunStatus::Success);
        summary.unchanged = plan.unchanged;
        summary.skipped = plan.len();
        summary
    }

    pub fn log(&self) {
        info!(
            "Run {}: {} created, {} updated, {} deleted, {} unchanged, {} failed, {} skipped",
            self.status,
            self.created,
            self.updated,
            self.deleted,
            self.unchanged,
            self.failed,
            self.skipped
        );
        for result in &self.results {
            match &result.outcome {
                Outcome::Failed { error, attempts } => {
                    warn!(
                        "  failed: {} after {} attempt(s): {}",
                        result.operation, attempts, error
                    )
                }
                Outcome::Skipped(reason) => warn!("  skipped: {} ({})", result.operation, reason),
                Outcome::Completed { .. } => {}
            }
        }
        if let Some(reason) = &self.abort_reason {
            error!("Run aborted: {}", reason);
        }
    }
}
