use super::chunker::chunk_domains;
use super::executor::{Executor, ExecutorSettings};
use super::inventory::InventoryReader;
use super::plan::Plan;
use super::reconciler::Reconciler;
use super::summary::RunSummary;
use super::types::ListNaming;
use crate::api::GatewayApi;
use crate::config::Config;
use crate::domain::Domain;
use crate::error::SyncError;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Chunking,
    FetchingInventory,
    Reconciling,
    Executing,
    Summarizing,
    Done,
    Aborted,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Converge with the smallest set of changes.
    Sync,
    /// Delete everything owned, then rebuild.
    FreshStart,
    /// Delete everything owned and stop.
    Teardown,
}

/// Everything the controller needs from the configuration.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub naming: ListNaming,
    pub policy_name: String,
    pub chunk_limit: usize,
    pub list_quota: usize,
    pub recover_drift: bool,
    pub dry_run: bool,
    pub executor: ExecutorSettings,
}

impl SyncSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            naming: ListNaming::new(config.sync.list_prefix.clone()),
            policy_name: config.sync.policy_name.clone(),
            chunk_limit: config.sync.chunk_limit,
            list_quota: config.sync.list_quota,
            recover_drift: config.sync.recover_drift,
            dry_run: config.sync.dry_run,
            executor: ExecutorSettings::from_config(config),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    /// `Done` or `Aborted`.
    pub state: RunState,
    pub summary: RunSummary,
    /// Absent when the run aborted before reconciling.
    pub plan: Option<Plan>,
    pub transitions: Vec<RunState>,
}

/// Drives one pass: chunk, read inventory, reconcile, execute, summarize.
///
/// Nothing is retried across states. A failure before `Executing` ends the
/// run without a single mutating call.
pub struct RunController {
    api: Arc<dyn GatewayApi>,
    settings: SyncSettings,
    state: RunState,
    transitions: Vec<RunState>,
}

impl RunController {
    pub fn new(api: Arc<dyn GatewayApi>, settings: SyncSettings) -> Self {
        Self {
            api,
            settings,
            state: RunState::Idle,
            transitions: vec![RunState::Idle],
        }
    }

    fn enter(&mut self, next: RunState) {
        debug!("Run state {} -> {}", self.state, next);
        self.state = next;
        self.transitions.push(next);
    }

    fn abort(mut self, error: SyncError) -> RunReport {
        warn!("Aborting run during {}: {}", self.state, error);
        self.enter(RunState::Aborted);
        RunReport {
            state: self.state,
            summary: RunSummary::aborted(error.to_string()),
            plan: None,
            transitions: self.transitions,
        }
    }

    fn finish(mut self, summary: RunSummary, plan: Plan) -> RunReport {
        self.enter(RunState::Done);
        RunReport {
            state: self.state,
            summary,
            plan: Some(plan),
            transitions: self.transitions,
        }
    }

    pub async fn run(mut self, desired: &BTreeSet<Domain>, mode: RunMode) -> RunReport {
        let chunks = if mode == RunMode::Teardown {
            Vec::new()
        } else {
            self.enter(RunState::Chunking);
            match chunk_domains(desired, self.settings.chunk_limit, self.settings.list_quota) {
                Ok(chunks) => chunks,
                Err(e) => return self.abort(e),
            }
        };

        self.enter(RunState::FetchingInventory);
        let reader = InventoryReader::new(
            self.api.clone(),
            self.settings.naming.clone(),
            self.settings.policy_name.clone(),
            self.settings.executor.parallelism,
            self.settings.executor.retry.clone(),
        );
        let inventory = match reader.read().await {
            Ok(inventory) => inventory,
            Err(e) => return self.abort(e.into()),
        };
        info!(
            "Account holds {} owned list(s); {} desired",
            inventory.owned_list_count(),
            chunks.len()
        );

        self.enter(RunState::Reconciling);
        let mut mode = mode;
        if inventory.is_inconsistent() && mode == RunMode::Sync {
            let drift = SyncError::InconsistentState(format!(
                "policy references {} list(s) outside the managed set",
                inventory.dangling.len()
            ));
            if self.settings.recover_drift {
                warn!("{}. Switching to fresh start.", drift);
                mode = RunMode::FreshStart;
            } else {
                warn!("{}. A fresh start is recommended.", drift);
            }
        }

        let reconciler = Reconciler::new(
            self.settings.naming.clone(),
            self.settings.policy_name.clone(),
        );
        let plan = match mode {
            RunMode::Sync => reconciler.plan(&chunks, &inventory),
            RunMode::FreshStart => reconciler.plan_fresh_start(&chunks, &inventory),
            RunMode::Teardown => reconciler.plan_teardown(&inventory),
        };
        info!(
            "Plan: {} operation(s), {} unchanged",
            plan.len(),
            plan.unchanged
        );
        for step in &plan.steps {
            debug!("  {:?}: {}", step.stage, step.operation);
        }

        if self.settings.dry_run {
            for step in &plan.steps {
                info!("[dry-run] would {}", step.operation);
            }
            let summary = RunSummary::planned(&plan);
            return self.finish(summary, plan);
        }

        self.enter(RunState::Executing);
        let executor = Executor::new(self.api.clone(), self.settings.executor.clone());
        let report = executor.execute(&plan).await;

        self.enter(RunState::Summarizing);
        let summary = RunSummary::from_report(&plan, report);
        if summary.abort_reason.is_some() {
            self.enter(RunState::Aborted);
            return RunReport {
                state: self.state,
                summary,
                plan: Some(plan),
                transitions: self.transitions,
            };
        }
        self.finish(summary, plan)
    }
}
