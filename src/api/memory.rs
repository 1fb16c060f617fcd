//! In-memory implementation of the Gateway API.
//!
//! Behaves like the real service where the engine depends on it: ids are
//! assigned on create, lists referenced by a rule cannot be deleted, and
//! rules cannot reference unknown lists. Faults can be injected per call
//! kind to exercise retry and abort handling.

use super::expression::{build_traffic_expression, parse_list_references};
use super::types::{GatewayApi, ListInfo, PolicyInfo, PolicySpec};
use crate::domain::Domain;
use crate::error::RemoteError;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockWriteGuard};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    ListLists,
    ListItems,
    CreateList,
    UpdateList,
    DeleteList,
    ListPolicies,
    CreatePolicy,
    UpdatePolicy,
    DeletePolicy,
}

impl CallKind {
    pub fn is_mutation(self) -> bool {
        !matches!(
            self,
            CallKind::ListLists | CallKind::ListItems | CallKind::ListPolicies
        )
    }
}

/// One recorded call. `target` is the name for creates and the id otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub kind: CallKind,
    pub target: String,
}

/// Snapshot of a stored list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryList {
    pub id: String,
    pub name: String,
    pub items: BTreeSet<String>,
}

#[derive(Debug)]
struct Fault {
    kind: CallKind,
    target: Option<String>,
    error: RemoteError,
    remaining: usize,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: u64,
    lists: BTreeMap<String, MemoryList>,
    policies: BTreeMap<String, PolicyInfo>,
    faults: Vec<Fault>,
    calls: Vec<Call>,
    slow_targets: BTreeMap<String, Duration>,
}

impl MemoryState {
    fn assign_id(&mut self, kind: &str) -> String {
        self.next_id += 1;
        format!("{}-{:06}", kind, self.next_id)
    }

    /// Records the call and returns an injected fault, if one matches.
    fn enter(&mut self, kind: CallKind, target: &str) -> Result<(), RemoteError> {
        self.calls.push(Call {
            kind,
            target: target.to_string(),
        });

        let pos = self.faults.iter().position(|f| {
            f.kind == kind && f.target.as_deref().is_none_or(|t| t == target)
        });
        if let Some(pos) = pos {
            let error = self.faults[pos].error.clone();
            self.faults[pos].remaining -= 1;
            if self.faults[pos].remaining == 0 {
                self.faults.remove(pos);
            }
            return Err(error);
        }
        Ok(())
    }

    fn referenced_by_policy(&self, list_id: &str) -> bool {
        self.policies
            .values()
            .any(|p| parse_list_references(&p.traffic).iter().any(|id| id == list_id))
    }

    fn check_references(&self, list_ids: &[String]) -> Result<(), RemoteError> {
        match list_ids.iter().find(|id| !self.lists.contains_key(id.as_str())) {
            Some(missing) => Err(RemoteError::rejected(format!(
                "policy references unknown list {}",
                missing
            ))),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryGateway {
    state: RwLock<MemoryState>,
    latency_ms: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> RwLockWriteGuard<'_, MemoryState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Makes every mutating call take at least `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Overrides the latency of mutating calls aimed at `target`.
    pub fn set_latency_for(&self, target: &str, latency: Duration) {
        self.state()
            .slow_targets
            .insert(target.to_string(), latency);
    }

    /// Highest number of mutating calls that were in progress at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Fails the next `times` calls of `kind` (optionally only for one
    /// target) with `error`.
    pub fn fail(&self, kind: CallKind, target: Option<&str>, error: RemoteError, times: usize) {
        if times == 0 {
            return;
        }
        self.state().faults.push(Fault {
            kind,
            target: target.map(str::to_string),
            error,
            remaining: times,
        });
    }

    pub fn seed_list<I, S>(&self, name: &str, items: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.state();
        let id = state.assign_id("list");
        state.lists.insert(
            id.clone(),
            MemoryList {
                id: id.clone(),
                name: name.to_string(),
                items: items.into_iter().map(Into::into).collect(),
            },
        );
        id
    }

    pub fn seed_policy(&self, name: &str, list_ids: &[String]) -> String {
        let mut state = self.state();
        let id = state.assign_id("rule");
        state.policies.insert(
            id.clone(),
            PolicyInfo {
                id: id.clone(),
                name: name.to_string(),
                traffic: build_traffic_expression(list_ids),
            },
        );
        id
    }

    pub fn lists(&self) -> Vec<MemoryList> {
        self.state().lists.values().cloned().collect()
    }

    pub fn list_named(&self, name: &str) -> Option<MemoryList> {
        self.state().lists.values().find(|l| l.name == name).cloned()
    }

    pub fn policies(&self) -> Vec<PolicyInfo> {
        self.state().policies.values().cloned().collect()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn mutation_count(&self) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.kind.is_mutation())
            .count()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    async fn mutate(&self, target: &str) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);

        let slow = self.state().slow_targets.get(target).copied();
        let latency = slow
            .unwrap_or_else(|| Duration::from_millis(self.latency_ms.load(Ordering::SeqCst)));
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        guard
    }
}

#[async_trait]
impl GatewayApi for MemoryGateway {
    async fn list_lists(&self) -> Result<Vec<ListInfo>, RemoteError> {
        let mut state = self.state();
        state.enter(CallKind::ListLists, "")?;
        Ok(state
            .lists
            .values()
            .map(|l| ListInfo {
                id: l.id.clone(),
                name: l.name.clone(),
            })
            .collect())
    }

    async fn list_items(&self, list_id: &str) -> Result<Vec<String>, RemoteError> {
        let mut state = self.state();
        state.enter(CallKind::ListItems, list_id)?;
        state
            .lists
            .get(list_id)
            .map(|l| l.items.iter().cloned().collect())
            .ok_or_else(|| RemoteError::rejected(format!("list {} not found", list_id)))
    }

    async fn create_list(
        &self,
        name: &str,
        _description: &str,
        domains: &[Domain],
    ) -> Result<String, RemoteError> {
        let _flight = self.mutate(name).await;
        let mut state = self.state();
        state.enter(CallKind::CreateList, name)?;
        let id = state.assign_id("list");
        state.lists.insert(
            id.clone(),
            MemoryList {
                id: id.clone(),
                name: name.to_string(),
                items: domains.iter().map(|d| d.to_string()).collect(),
            },
        );
        Ok(id)
    }

    async fn update_list(
        &self,
        list_id: &str,
        append: &[Domain],
        remove: &[String],
    ) -> Result<(), RemoteError> {
        let _flight = self.mutate(list_id).await;
        let mut state = self.state();
        state.enter(CallKind::UpdateList, list_id)?;
        let list = state
            .lists
            .get_mut(list_id)
            .ok_or_else(|| RemoteError::rejected(format!("list {} not found", list_id)))?;
        for value in remove {
            list.items.remove(value);
        }
        list.items.extend(append.iter().map(|d| d.to_string()));
        Ok(())
    }

    async fn delete_list(&self, list_id: &str) -> Result<(), RemoteError> {
        let _flight = self.mutate(list_id).await;
        let mut state = self.state();
        state.enter(CallKind::DeleteList, list_id)?;
        if state.referenced_by_policy(list_id) {
            return Err(RemoteError::rejected(format!(
                "list {} is in use by a rule",
                list_id
            )));
        }
        state
            .lists
            .remove(list_id)
            .map(|_| ())
            .ok_or_else(|| RemoteError::rejected(format!("list {} not found", list_id)))
    }

    async fn list_policies(&self) -> Result<Vec<PolicyInfo>, RemoteError> {
        let mut state = self.state();
        state.enter(CallKind::ListPolicies, "")?;
        Ok(state.policies.values().cloned().collect())
    }

    async fn create_policy(&self, spec: &PolicySpec) -> Result<String, RemoteError> {
        let _flight = self.mutate(&spec.name).await;
        let mut state = self.state();
        state.enter(CallKind::CreatePolicy, &spec.name)?;
        state.check_references(&spec.list_ids)?;
        let id = state.assign_id("rule");
        state.policies.insert(
            id.clone(),
            PolicyInfo {
                id: id.clone(),
                name: spec.name.clone(),
                traffic: build_traffic_expression(&spec.list_ids),
            },
        );
        Ok(id)
    }

    async fn update_policy(&self, policy_id: &str, spec: &PolicySpec) -> Result<(), RemoteError> {
        let _flight = self.mutate(policy_id).await;
        let mut state = self.state();
        state.enter(CallKind::UpdatePolicy, policy_id)?;
        state.check_references(&spec.list_ids)?;
        let policy = state
            .policies
            .get_mut(policy_id)
            .ok_or_else(|| RemoteError::rejected(format!("rule {} not found", policy_id)))?;
        policy.name = spec.name.clone();
        policy.traffic = build_traffic_expression(&spec.list_ids);
        Ok(())
    }

    async fn delete_policy(&self, policy_id: &str) -> Result<(), RemoteError> {
        let _flight = self.mutate(policy_id).await;
        let mut state = self.state();
        state.enter(CallKind::DeletePolicy, policy_id)?;
        state
            .policies
            .remove(policy_id)
            .map(|_| ())
            .ok_or_else(|| RemoteError::rejected(format!("rule {} not found", policy_id)))
    }
}
