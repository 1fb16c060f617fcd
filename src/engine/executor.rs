use super::plan::{ListRef, Operation, Plan, PlanMode, Stage, Step};
use super::retry::{Retried, RetryPolicy};
use crate::api::{GatewayApi, PolicySpec};
use crate::config::{Config, PartialFailurePolicy};
use crate::error::RemoteError;
use futures::{stream, StreamExt};
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Upper bound on concurrent remote calls.
    pub parallelism: usize,
    pub retry: RetryPolicy,
    pub partial_failure: PartialFailurePolicy,
}

impl ExecutorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            parallelism: config.sync.parallelism,
            retry: RetryPolicy::from_config(config),
            partial_failure: config.sync.policy_on_partial_failure,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// A prerequisite operation failed or was skipped.
    DependencyFailed,
    /// A fatal error stopped the run before this operation started.
    Cancelled,
    /// Best-effort policy update with no surviving list to point at.
    NothingToReference,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::DependencyFailed => f.write_str("dependency failed"),
            SkipReason::Cancelled => f.write_str("run cancelled"),
            SkipReason::NothingToReference => f.write_str("no lists to reference"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// `id` is set for creates.
    Completed { id: Option<String>, attempts: u32 },
    Failed { error: RemoteError, attempts: u32 },
    Skipped(SkipReason),
}

impl Outcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResult {
    pub stage: Stage,
    pub operation: Operation,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    /// One result per plan step, in plan order.
    pub results: Vec<OperationResult>,
    /// Set when a fatal error cancelled the run.
    pub fatal: Option<RemoteError>,
}

enum Gate {
    Run(Vec<String>),
    Skip(SkipReason),
}

/// Runs a plan stage by stage against the remote API.
pub struct Executor {
    api: Arc<dyn GatewayApi>,
    settings: ExecutorSettings,
}

impl Executor {
    pub fn new(api: Arc<dyn GatewayApi>, settings: ExecutorSettings) -> Self {
        Self { api, settings }
    }

    pub async fn execute(&self, plan: &Plan) -> ExecutionReport {
        let token = CancellationToken::new();
        let mut outcomes: Vec<Option<Outcome>> = vec![None; plan.len()];
        let mut created: FxHashMap<usize, String> = FxHashMap::default();
        let mut fatal: Option<RemoteError> = None;

        for stage in Stage::ORDER {
            let mut runnable = Vec::new();
            for (idx, step) in plan.steps_in(stage) {
                match self.gate(plan, step, &outcomes, &created, &token) {
                    Gate::Run(list_ids) => runnable.push((idx, &step.operation, list_ids)),
                    Gate::Skip(reason) => {
                        warn!("Skipping {}: {}", step.operation, reason);
                        outcomes[idx] = Some(Outcome::Skipped(reason));
                    }
                }
            }
            if runnable.is_empty() {
                continue;
            }

            let token = &token;
            let tasks = runnable.into_iter().map(|(idx, operation, list_ids)| async move {
                (idx, self.run_with_retry(operation, &list_ids, token).await)
            });
            // Barrier: the next stage starts only once all of these finished.
            let finished: Vec<(usize, Outcome)> = stream::iter(tasks)
                .buffer_unordered(self.settings.parallelism.max(1))
                .collect()
                .await;

            for (idx, outcome) in finished {
                match (&plan.steps[idx].operation, &outcome) {
                    (Operation::CreateList { index, .. }, Outcome::Completed { id: Some(id), .. }) => {
                        created.insert(*index, id.clone());
                    }
                    (_, Outcome::Failed { error, .. }) if error.is_fatal() && fatal.is_none() => {
                        fatal = Some(error.clone());
                    }
                    _ => {}
                }
                outcomes[idx] = Some(outcome);
            }
        }

        let results = plan
            .steps
            .iter()
            .zip(outcomes)
            .map(|(step, outcome)| OperationResult {
                stage: step.stage,
                operation: step.operation.clone(),
                outcome: outcome.unwrap_or(Outcome::Skipped(SkipReason::Cancelled)),
            })
            .collect();

        ExecutionReport { results, fatal }
    }

    /// Decides whether a step may run given the outcomes of earlier stages,
    /// and resolves the list ids a policy step will reference.
    fn gate(
        &self,
        plan: &Plan,
        step: &Step,
        outcomes: &[Option<Outcome>],
        created: &FxHashMap<usize, String>,
        token: &CancellationToken,
    ) -> Gate {
        if token.is_cancelled() {
            return Gate::Skip(SkipReason::Cancelled);
        }

        let stage_ok = |stage: Stage| {
            plan.steps_in(stage)
                .all(|(idx, _)| outcomes[idx].as_ref().is_some_and(Outcome::is_completed))
        };
        let rebuilding = plan.mode != PlanMode::Diff;

        match step.stage {
            Stage::PolicyTeardown => Gate::Run(Vec::new()),
            Stage::ListTeardown | Stage::ListUpsert if rebuilding && !stage_ok(Stage::PolicyTeardown) => {
                Gate::Skip(SkipReason::DependencyFailed)
            }
            Stage::ListTeardown | Stage::ListUpsert => Gate::Run(Vec::new()),
            Stage::Policy => {
                if rebuilding && !stage_ok(Stage::PolicyTeardown) {
                    return Gate::Skip(SkipReason::DependencyFailed);
                }
                let refs = step.operation.list_refs();
                if refs.is_empty() {
                    return Gate::Run(Vec::new());
                }
                if !stage_ok(Stage::ListUpsert)
                    && self.settings.partial_failure == PartialFailurePolicy::Skip
                {
                    return Gate::Skip(SkipReason::DependencyFailed);
                }
                // Only best-effort gets here with failed creates; drop them.
                let list_ids: Vec<String> = refs
                    .iter()
                    .filter_map(|r| match r {
                        ListRef::Existing(id) => Some(id.clone()),
                        ListRef::Pending(index) => created.get(index).cloned(),
                    })
                    .collect();
                if list_ids.is_empty() {
                    return Gate::Skip(SkipReason::NothingToReference);
                }
                if list_ids.len() < refs.len() {
                    warn!(
                        "Policy will reference {} of {} lists after failures",
                        list_ids.len(),
                        refs.len()
                    );
                }
                Gate::Run(list_ids)
            }
            Stage::ListPrune => {
                let Operation::DeleteList { id, .. } = &step.operation else {
                    return Gate::Run(Vec::new());
                };
                let policy_moved =
                    plan.steps_in(Stage::Policy).next().is_some() && stage_ok(Stage::Policy);
                if plan.previously_referenced.contains(id) && !policy_moved {
                    Gate::Skip(SkipReason::DependencyFailed)
                } else {
                    Gate::Run(Vec::new())
                }
            }
        }
    }

    async fn run_with_retry(
        &self,
        operation: &Operation,
        list_ids: &[String],
        token: &CancellationToken,
    ) -> Outcome {
        let retried = self
            .settings
            .retry
            .run(operation, token, move || self.attempt(operation, list_ids))
            .await;
        match retried {
            Retried::Succeeded { value, attempts } => {
                info!("✓ {}", operation);
                Outcome::Completed {
                    id: value,
                    attempts,
                }
            }
            Retried::Failed { error, attempts } => Outcome::Failed { error, attempts },
            Retried::Cancelled => Outcome::Skipped(SkipReason::Cancelled),
        }
    }

    async fn attempt(
        &self,
        operation: &Operation,
        list_ids: &[String],
    ) -> Result<Option<String>, RemoteError> {
        match operation {
            Operation::CreateList {
                name,
                description,
                domains,
                ..
            } => self
                .api
                .create_list(name, description, domains)
                .await
                .map(Some),
            Operation::UpdateList { id, add, remove, .. } => {
                self.api.update_list(id, add, remove).await.map(|_| None)
            }
            Operation::DeleteList { id, .. } => self.api.delete_list(id).await.map(|_| None),
            Operation::CreatePolicy { name, .. } => self
                .api
                .create_policy(&policy_spec(name, list_ids))
                .await
                .map(Some),
            Operation::UpdatePolicy { id, name, .. } => self
                .api
                .update_policy(id, &policy_spec(name, list_ids))
                .await
                .map(|_| None),
            Operation::DeletePolicy { id, .. } => self.api.delete_policy(id).await.map(|_| None),
        }
    }
}

/// The description only carries what the policy's references determine, so
/// an unchanged reference set never leaves it stale.
fn policy_spec(name: &str, list_ids: &[String]) -> PolicySpec {
    PolicySpec {
        name: name.to_string(),
        description: format!(
            "Block domains from {} lists, managed by gateway-sync",
            list_ids.len()
        ),
        list_ids: list_ids.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{CallKind, MemoryGateway};
    use crate::domain::Domain;
    use std::time::Duration;

    fn settings() -> ExecutorSettings {
        ExecutorSettings {
            parallelism: 4,
            retry: RetryPolicy {
                max_retries: 2,
                backoff_base: Duration::from_millis(1),
                max_backoff: Duration::from_millis(100),
                attempt_timeout: Duration::from_secs(5),
            },
            partial_failure: PartialFailurePolicy::Skip,
        }
    }

    fn create(index: usize) -> Operation {
        Operation::CreateList {
            index,
            name: format!("L_{}", index),
            description: String::new(),
            domains: vec![Domain::parse(&format!("host{}.example.com", index)).unwrap()],
        }
    }

    fn plan_with_policy(lists: usize) -> Plan {
        let mut plan = Plan::new(PlanMode::Diff);
        for i in 0..lists {
            plan.push(Stage::ListUpsert, create(i));
        }
        plan.push(
            Stage::Policy,
            Operation::CreatePolicy {
                name: "Block".to_string(),
                lists: (0..lists).map(ListRef::Pending).collect(),
                domain_count: lists,
            },
        );
        plan.seal()
    }

    #[tokio::test]
    async fn test_creates_resolve_policy_refs() {
        let gw = Arc::new(MemoryGateway::new());
        let report = Executor::new(gw.clone(), settings())
            .execute(&plan_with_policy(3))
            .await;

        assert!(report.results.iter().all(|r| r.outcome.is_completed()));
        assert!(report.fatal.is_none());
        let policy = &gw.policies()[0];
        for list in gw.lists() {
            assert!(policy.traffic.contains(&list.id));
        }
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let gw = Arc::new(MemoryGateway::new());
        gw.fail(
            CallKind::CreateList,
            Some("L_1"),
            RemoteError::transient("503"),
            2,
        );

        let report = Executor::new(gw.clone(), settings())
            .execute(&plan_with_policy(2))
            .await;

        assert_eq!(
            report.results[1].outcome,
            Outcome::Completed {
                id: Some(gw.list_named("L_1").unwrap().id),
                attempts: 3
            }
        );
        assert!(report.results[2].outcome.is_completed());
    }

    #[tokio::test]
    async fn test_exhausted_retries_skip_policy() {
        let gw = Arc::new(MemoryGateway::new());
        gw.fail(
            CallKind::CreateList,
            Some("L_0"),
            RemoteError::transient("503"),
            10,
        );

        let report = Executor::new(gw.clone(), settings())
            .execute(&plan_with_policy(2))
            .await;

        assert!(matches!(
            report.results[0].outcome,
            Outcome::Failed { attempts: 3, .. }
        ));
        assert!(report.results[1].outcome.is_completed());
        assert_eq!(
            report.results[2].outcome,
            Outcome::Skipped(SkipReason::DependencyFailed)
        );
        assert!(gw.policies().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_is_not_retried() {
        let gw = Arc::new(MemoryGateway::new());
        gw.fail(
            CallKind::CreateList,
            Some("L_0"),
            RemoteError::rejected("invalid item"),
            1,
        );

        let report = Executor::new(gw.clone(), settings())
            .execute(&plan_with_policy(1))
            .await;
        assert!(matches!(
            report.results[0].outcome,
            Outcome::Failed { attempts: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_best_effort_drops_failed_creates() {
        let gw = Arc::new(MemoryGateway::new());
        gw.fail(
            CallKind::CreateList,
            Some("L_0"),
            RemoteError::rejected("invalid item"),
            1,
        );
        let mut settings = settings();
        settings.partial_failure = PartialFailurePolicy::BestEffort;

        let report = Executor::new(gw.clone(), settings)
            .execute(&plan_with_policy(2))
            .await;

        assert!(report.results[2].outcome.is_completed());
        let traffic = gw.policies()[0].traffic.clone();
        assert_eq!(
            traffic,
            format!("any(dns.domains[*] in ${})", gw.list_named("L_1").unwrap().id)
        );
    }

    #[tokio::test]
    async fn test_fatal_cancels_remaining_work() {
        let gw = Arc::new(MemoryGateway::new());
        gw.fail(CallKind::CreateList, None, RemoteError::fatal("403"), 1);
        let mut settings = settings();
        settings.parallelism = 1;

        let report = Executor::new(gw.clone(), settings)
            .execute(&plan_with_policy(3))
            .await;

        assert!(report.fatal.is_some());
        assert!(matches!(report.results[0].outcome, Outcome::Failed { .. }));
        assert_eq!(
            report.results[1].outcome,
            Outcome::Skipped(SkipReason::Cancelled)
        );
        assert_eq!(
            report.results[3].outcome,
            Outcome::Skipped(SkipReason::Cancelled)
        );
        assert_eq!(gw.mutation_count(), 1);
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let gw = Arc::new(MemoryGateway::new());
        gw.set_latency(Duration::from_millis(20));
        let mut settings = settings();
        settings.parallelism = 3;

        let report = Executor::new(gw.clone(), settings)
            .execute(&plan_with_policy(10))
            .await;

        assert!(report.results.iter().all(|r| r.outcome.is_completed()));
        assert!(gw.max_in_flight() <= 3);
        assert!(gw.max_in_flight() >= 2);
    }

    #[tokio::test]
    async fn test_slow_attempts_time_out_and_exhaust_retries() {
        let gw = Arc::new(MemoryGateway::new());
        gw.set_latency(Duration::from_millis(200));
        let mut settings = settings();
        settings.retry.attempt_timeout = Duration::from_millis(10);

        let report = Executor::new(gw.clone(), settings.clone())
            .execute(&plan_with_policy(1))
            .await;

        match &report.results[0].outcome {
            Outcome::Failed { error, attempts } => {
                assert!(error.is_transient());
                assert!(error.to_string().contains("timed out"));
                assert_eq!(*attempts, settings.retry.max_retries + 1);
            }
            other => panic!("expected a timeout failure, got {:?}", other),
        }
        assert_eq!(
            report.results[1].outcome,
            Outcome::Skipped(SkipReason::DependencyFailed)
        );
        assert!(report.fatal.is_none());
        assert!(gw.lists().is_empty());
    }

    #[tokio::test]
    async fn test_fatal_drains_in_flight_and_skips_queued() {
        let gw = Arc::new(MemoryGateway::new());
        gw.set_latency(Duration::from_millis(20));
        gw.set_latency_for("L_1", Duration::from_millis(80));
        gw.set_latency_for("L_2", Duration::from_millis(80));
        gw.fail(CallKind::CreateList, Some("L_0"), RemoteError::fatal("403"), 1);
        let mut settings = settings();
        settings.parallelism = 3;

        let report = Executor::new(gw.clone(), settings)
            .execute(&plan_with_policy(6))
            .await;

        assert!(report.fatal.as_ref().is_some_and(RemoteError::is_fatal));
        assert!(matches!(
            report.results[0].outcome,
            Outcome::Failed { attempts: 1, .. }
        ));
        // already in flight when L_0 failed
        assert!(report.results[1].outcome.is_completed());
        assert!(report.results[2].outcome.is_completed());
        for result in &report.results[3..] {
            assert_eq!(result.outcome, Outcome::Skipped(SkipReason::Cancelled));
        }
        assert_eq!(gw.lists().len(), 2);
        assert!(gw.policies().is_empty());
    }

    #[test]
    fn test_policy_description_ignores_domain_count() {
        let ids = vec!["a".to_string(), "b".to_string()];
        let spec = policy_spec("Block", &ids);
        assert_eq!(
            spec.description,
            "Block domains from 2 lists, managed by gateway-sync"
        );
        assert_eq!(spec.list_ids, ids);
    }
}
