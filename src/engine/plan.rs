use crate::domain::Domain;
use std::collections::BTreeSet;
use std::fmt;

/// Execution stages. A stage starts only after the previous one finished,
/// which is what keeps the policy from ever pointing at a missing list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    /// Fresh-start: remove the policy so its lists become deletable.
    PolicyTeardown,
    /// Fresh-start: remove every owned list.
    ListTeardown,
    /// Create and update lists.
    ListUpsert,
    /// Create, update or delete the policy.
    Policy,
    /// Delete lists that the policy no longer references.
    ListPrune,
}

impl Stage {
    pub const ORDER: [Stage; 5] = [
        Stage::PolicyTeardown,
        Stage::ListTeardown,
        Stage::ListUpsert,
        Stage::Policy,
        Stage::ListPrune,
    ];
}

/// A list as seen by a policy operation. Lists created in the same plan
/// have no id until their create completes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ListRef {
    Existing(String),
    Pending(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    CreateList,
    UpdateList,
    DeleteList,
    CreatePolicy,
    UpdatePolicy,
    DeletePolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    CreateList {
        index: usize,
        name: String,
        description: String,
        domains: Vec<Domain>,
    },
    UpdateList {
        index: usize,
        id: String,
        name: String,
        add: Vec<Domain>,
        remove: Vec<String>,
    },
    DeleteList {
        id: String,
        name: String,
    },
    CreatePolicy {
        name: String,
        lists: Vec<ListRef>,
        domain_count: usize,
    },
    UpdatePolicy {
        id: String,
        name: String,
        lists: Vec<ListRef>,
        domain_count: usize,
    },
    DeletePolicy {
        id: String,
        name: String,
    },
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::CreateList { .. } => OperationKind::CreateList,
            Operation::UpdateList { .. } => OperationKind::UpdateList,
            Operation::DeleteList { .. } => OperationKind::DeleteList,
            Operation::CreatePolicy { .. } => OperationKind::CreatePolicy,
            Operation::UpdatePolicy { .. } => OperationKind::UpdatePolicy,
            Operation::DeletePolicy { .. } => OperationKind::DeletePolicy,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Operation::CreateList { name, .. }
            | Operation::UpdateList { name, .. }
            | Operation::DeleteList { name, .. }
            | Operation::CreatePolicy { name, .. }
            | Operation::UpdatePolicy { name, .. }
            | Operation::DeletePolicy { name, .. } => name,
        }
    }

    /// Lists a policy operation will reference once it has run.
    pub fn list_refs(&self) -> &[ListRef] {
        match self {
            Operation::CreatePolicy { lists, .. } | Operation::UpdatePolicy { lists, .. } => lists,
            _ => &[],
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::CreateList { name, domains, .. } => {
                write!(f, "create list {} ({} domains)", name, domains.len())
            }
            Operation::UpdateList {
                name, add, remove, ..
            } => write!(f, "update list {} (+{} -{})", name, add.len(), remove.len()),
            Operation::DeleteList { name, id } => write!(f, "delete list {} ({})", name, id),
            Operation::CreatePolicy {
                name,
                lists,
                domain_count,
                ..
            } => write!(
                f,
                "create policy '{}' ({} lists, {} domains)",
                name,
                lists.len(),
                domain_count
            ),
            Operation::UpdatePolicy {
                name,
                lists,
                domain_count,
                ..
            } => write!(
                f,
                "update policy '{}' ({} lists, {} domains)",
                name,
                lists.len(),
                domain_count
            ),
            Operation::DeletePolicy { name, id } => write!(f, "delete policy '{}' ({})", name, id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub stage: Stage,
    pub operation: Operation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanMode {
    /// Minimal diff against the inventory.
    Diff,
    /// Tear everything down, then rebuild.
    FreshStart,
    /// Tear everything down and stop.
    Teardown,
}

/// Ordered operations that converge the remote side to the desired state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub mode: PlanMode,
    /// Sorted by stage; order within a stage is deterministic.
    pub steps: Vec<Step>,
    /// Lists and policy that already match.
    pub unchanged: usize,
    /// List ids the managed policies referenced when the plan was made.
    pub previously_referenced: BTreeSet<String>,
}

impl Plan {
    pub fn new(mode: PlanMode) -> Self {
        Self {
            mode,
            steps: Vec::new(),
            unchanged: 0,
            previously_referenced: BTreeSet::new(),
        }
    }

    pub fn push(&mut self, stage: Stage, operation: Operation) {
        self.steps.push(Step { stage, operation });
    }

    /// Stable sort by stage, keeping push order inside a stage.
    pub fn seal(mut self) -> Self {
        self.steps.sort_by_key(|s| s.stage);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn count(&self, kind: OperationKind) -> usize {
        self.steps
            .iter()
            .filter(|s| s.operation.kind() == kind)
            .count()
    }

    pub fn steps_in(&self, stage: Stage) -> impl Iterator<Item = (usize, &Step)> {
        self.steps
            .iter()
            .enumerate()
            .filter(move |(_, s)| s.stage == stage)
    }
}
