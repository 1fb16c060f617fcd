//! Turns desired chunks and the remote inventory into a plan.
//!
//! Planning is pure: identical inputs always produce an identical plan.

use super::plan::{ListRef, Operation, Plan, PlanMode, Stage};
use super::types::{DesiredChunk, Inventory, ListNaming, RemoteList};
use crate::domain::Domain;
use std::collections::BTreeSet;
use tracing::debug;

pub struct Reconciler {
    naming: ListNaming,
    policy_name: String,
}

impl Reconciler {
    pub fn new(naming: ListNaming, policy_name: impl Into<String>) -> Self {
        Self {
            naming,
            policy_name: policy_name.into(),
        }
    }

    /// Minimal set of operations converging `inventory` to `desired`.
    pub fn plan(&self, desired: &[DesiredChunk], inventory: &Inventory) -> Plan {
        let mut plan = Plan::new(PlanMode::Diff);
        plan.previously_referenced = inventory.referenced_ids();

        let mut refs = Vec::with_capacity(desired.len());
        for chunk in desired {
            match inventory.lists.get(&chunk.index) {
                None => {
                    plan.push(Stage::ListUpsert, self.create_list(chunk, desired.len()));
                    refs.push(ListRef::Pending(chunk.index));
                }
                Some(remote) => {
                    match diff_list(chunk, remote) {
                        Some(update) => plan.push(Stage::ListUpsert, update),
                        None => plan.unchanged += 1,
                    }
                    refs.push(ListRef::Existing(remote.id.clone()));
                }
            }
        }

        let desired_indexes: BTreeSet<usize> = desired.iter().map(|c| c.index).collect();
        for (ordinal, remote) in &inventory.lists {
            if !desired_indexes.contains(ordinal) {
                debug!(ordinal, name = %remote.name, "list no longer needed");
                plan.push(Stage::ListPrune, delete_list(remote));
            }
        }
        for duplicate in &inventory.duplicates {
            plan.push(Stage::ListPrune, delete_list(duplicate));
        }

        let domain_count = desired.iter().map(|c| c.domains.len()).sum();
        match (&inventory.policy, refs.is_empty()) {
            (None, true) => {}
            (None, false) => plan.push(
                Stage::Policy,
                Operation::CreatePolicy {
                    name: self.policy_name.clone(),
                    lists: refs,
                    domain_count,
                },
            ),
            // Gateway refuses a rule with an empty expression.
            (Some(policy), true) => plan.push(
                Stage::Policy,
                Operation::DeletePolicy {
                    id: policy.id.clone(),
                    name: policy.name.clone(),
                },
            ),
            (Some(policy), false) => {
                let current: Vec<ListRef> = policy
                    .list_ids
                    .iter()
                    .cloned()
                    .map(ListRef::Existing)
                    .collect();
                if current == refs {
                    plan.unchanged += 1;
                } else {
                    plan.push(
                        Stage::Policy,
                        Operation::UpdatePolicy {
                            id: policy.id.clone(),
                            name: policy.name.clone(),
                            lists: refs,
                            domain_count,
                        },
                    );
                }
            }
        }
        for extra in &inventory.duplicate_policies {
            plan.push(
                Stage::Policy,
                Operation::DeletePolicy {
                    id: extra.id.clone(),
                    name: extra.name.clone(),
                },
            );
        }

        plan.seal()
    }

    /// Deletes everything owned, then recreates every chunk and the policy.
    pub fn plan_fresh_start(&self, desired: &[DesiredChunk], inventory: &Inventory) -> Plan {
        let mut plan = self.teardown_steps(inventory, PlanMode::FreshStart);

        let mut refs = Vec::with_capacity(desired.len());
        for chunk in desired {
            plan.push(Stage::ListUpsert, self.create_list(chunk, desired.len()));
            refs.push(ListRef::Pending(chunk.index));
        }
        if !refs.is_empty() {
            plan.push(
                Stage::Policy,
                Operation::CreatePolicy {
                    name: self.policy_name.clone(),
                    lists: refs,
                    domain_count: desired.iter().map(|c| c.domains.len()).sum(),
                },
            );
        }

        plan.seal()
    }

    /// Deletes every owned list and the policy without rebuilding.
    pub fn plan_teardown(&self, inventory: &Inventory) -> Plan {
        self.teardown_steps(inventory, PlanMode::Teardown).seal()
    }

    fn teardown_steps(&self, inventory: &Inventory, mode: PlanMode) -> Plan {
        let mut plan = Plan::new(mode);
        plan.previously_referenced = inventory.referenced_ids();

        for policy in inventory
            .policy
            .iter()
            .chain(inventory.duplicate_policies.iter())
        {
            plan.push(
                Stage::PolicyTeardown,
                Operation::DeletePolicy {
                    id: policy.id.clone(),
                    name: policy.name.clone(),
                },
            );
        }
        for list in inventory.lists.values().chain(inventory.duplicates.iter()) {
            plan.push(Stage::ListTeardown, delete_list(list));
        }
        plan
    }

    fn create_list(&self, chunk: &DesiredChunk, total: usize) -> Operation {
        Operation::CreateList {
            index: chunk.index,
            name: self.naming.name_for(chunk.index),
            description: format!("{} chunk {}/{}", self.policy_name, chunk.index + 1, total),
            domains: chunk.domains.iter().cloned().collect(),
        }
    }
}

/// Add/remove deltas between a chunk and its list, or None if they match.
fn diff_list(chunk: &DesiredChunk, remote: &RemoteList) -> Option<Operation> {
    let add: Vec<Domain> = chunk.domains.difference(&remote.domains).cloned().collect();
    let mut remove: Vec<String> = remote
        .domains
        .difference(&chunk.domains)
        .map(|d| d.to_string())
        .chain(remote.unknown_items.iter().cloned())
        .collect();
    remove.sort();

    if add.is_empty() && remove.is_empty() {
        return None;
    }
    Some(Operation::UpdateList {
        index: chunk.index,
        id: remote.id.clone(),
        name: remote.name.clone(),
        add,
        remove,
    })
}

fn delete_list(list: &RemoteList) -> Operation {
    Operation::DeleteList {
        id: list.id.clone(),
        name: list.name.clone(),
    }
}
