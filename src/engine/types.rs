use crate::domain::Domain;
use std::collections::{BTreeMap, BTreeSet};

/// One bounded slice of the desired domain set, backed by one remote list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredChunk {
    pub index: usize,
    pub domains: BTreeSet<Domain>,
}

/// An owned remote list as read back from the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteList {
    pub id: String,
    pub name: String,
    pub domains: BTreeSet<Domain>,
    /// Items that are not valid domains. They are always removed.
    pub unknown_items: Vec<String>,
}

/// The managed blocking policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePolicy {
    pub id: String,
    pub name: String,
    pub list_ids: Vec<String>,
}

/// Everything this tool owns on the remote side, as of one read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    /// Owned lists keyed by chunk ordinal.
    pub lists: BTreeMap<usize, RemoteList>,
    /// Owned lists whose ordinal is already taken by an entry in `lists`.
    pub duplicates: Vec<RemoteList>,
    pub policy: Option<RemotePolicy>,
    /// Further rules carrying the managed policy name.
    pub duplicate_policies: Vec<RemotePolicy>,
    /// Ids the policy references that are not owned lists.
    pub dangling: Vec<String>,
}

impl Inventory {
    pub fn owned_list_count(&self) -> usize {
        self.lists.len() + self.duplicates.len()
    }

    /// The policy points at lists this tool cannot account for.
    pub fn is_inconsistent(&self) -> bool {
        !self.dangling.is_empty()
    }

    /// Every list id some managed policy references right now.
    pub fn referenced_ids(&self) -> BTreeSet<String> {
        self.policy
            .iter()
            .chain(self.duplicate_policies.iter())
            .flat_map(|p| p.list_ids.iter().cloned())
            .collect()
    }
}

/// Maps chunk ordinals to list names and back.
///
/// A list is owned only if its name is the prefix followed by a canonical
/// decimal ordinal; "Prefix_07" or "Prefix_x" are someone else's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListNaming {
    prefix: String,
}

impl ListNaming {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn name_for(&self, index: usize) -> String {
        format!("{}{}", self.prefix, index)
    }

    pub fn ordinal_of(&self, name: &str) -> Option<usize> {
        let suffix = name.strip_prefix(&self.prefix)?;
        if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if suffix.len() > 1 && suffix.starts_with('0') {
            return None;
        }
        suffix.parse().ok()
    }
}
