use super::retry::RetryPolicy;
use super::types::{Inventory, ListNaming, RemoteList, RemotePolicy};
use crate::api::expression::parse_list_references;
use crate::api::{GatewayApi, ListInfo};
use crate::domain::Domain;
use crate::error::RemoteError;
use futures::{stream, StreamExt, TryStreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reads back every list and the policy this tool owns.
pub struct InventoryReader {
    api: Arc<dyn GatewayApi>,
    naming: ListNaming,
    policy_name: String,
    parallelism: usize,
    retry: RetryPolicy,
}

impl InventoryReader {
    pub fn new(
        api: Arc<dyn GatewayApi>,
        naming: ListNaming,
        policy_name: impl Into<String>,
        parallelism: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            api,
            naming,
            policy_name: policy_name.into(),
            parallelism: parallelism.max(1),
            retry,
        }
    }

    /// Transient failures are retried; a fatal one stops the remaining reads.
    async fn fetch<T, F, Fut>(
        &self,
        what: &(dyn Display + Sync),
        token: &CancellationToken,
        call: F,
    ) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        self.retry
            .run(what, token, call)
            .await
            .into_result(|| RemoteError::fatal("inventory read cancelled"))
    }

    /// Builds a complete inventory or fails; never returns a partial one.
    pub async fn read(&self) -> Result<Inventory, RemoteError> {
        info!("Fetching current Gateway lists and policies...");
        let api = &self.api;
        let token = &CancellationToken::new();
        let all_lists = self
            .fetch(&"List lists", token, || api.list_lists())
            .await?;
        let all_policies = self
            .fetch(&"List policies", token, || api.list_policies())
            .await?;
        info!(
            "Found {} lists and {} policies in the account",
            all_lists.len(),
            all_policies.len()
        );

        let mut owned: Vec<(usize, ListInfo)> = all_lists
            .into_iter()
            .filter_map(|list| self.naming.ordinal_of(&list.name).map(|o| (o, list)))
            .collect();
        owned.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));

        let fetched: Vec<(usize, RemoteList)> = stream::iter(owned.into_iter().map(
            |(ordinal, info)| async move {
                let label = format!("Read items of list {}", info.name);
                let id = info.id.as_str();
                let items = self.fetch(&label, token, || api.list_items(id)).await?;
                debug!("Read {} items from list {}", items.len(), info.name);
                Ok::<_, RemoteError>((ordinal, into_remote_list(info, items)))
            },
        ))
        .buffered(self.parallelism)
        .try_collect()
        .await?;

        let mut lists = BTreeMap::new();
        let mut duplicates = Vec::new();
        for (ordinal, list) in fetched {
            if lists.contains_key(&ordinal) {
                warn!(
                    "Duplicate list '{}' ({}) will be removed",
                    list.name, list.id
                );
                duplicates.push(list);
            } else {
                lists.insert(ordinal, list);
            }
        }

        let mut managed: Vec<RemotePolicy> = all_policies
            .into_iter()
            .filter(|p| p.name == self.policy_name)
            .map(|p| RemotePolicy {
                list_ids: parse_list_references(&p.traffic),
                id: p.id,
                name: p.name,
            })
            .collect();
        managed.sort_by(|a, b| a.id.cmp(&b.id));
        let mut managed = managed.into_iter();
        let policy = managed.next();
        let duplicate_policies: Vec<RemotePolicy> = managed.collect();
        for extra in &duplicate_policies {
            warn!(
                "Duplicate policy '{}' ({}) will be removed",
                extra.name, extra.id
            );
        }

        let owned_ids: BTreeSet<&str> = lists
            .values()
            .chain(duplicates.iter())
            .map(|l| l.id.as_str())
            .collect();
        let mut dangling: Vec<String> = policy
            .iter()
            .chain(duplicate_policies.iter())
            .flat_map(|p| p.list_ids.iter())
            .filter(|id| !owned_ids.contains(id.as_str()))
            .cloned()
            .collect();
        dangling.sort();
        dangling.dedup();
        if !dangling.is_empty() {
            warn!(
                "Policy '{}' references {} list(s) that are not owned: {:?}",
                self.policy_name,
                dangling.len(),
                dangling
            );
        }

        info!(
            "Inventory: {} owned list(s), policy {}",
            lists.len() + duplicates.len(),
            if policy.is_some() { "present" } else { "absent" }
        );

        Ok(Inventory {
            lists,
            duplicates,
            policy,
            duplicate_policies,
            dangling,
        })
    }
}

fn into_remote_list(info: ListInfo, items: Vec<String>) -> RemoteList {
    let mut domains = BTreeSet::new();
    let mut unknown_items = Vec::new();
    for item in items {
        // Anything not already in normalized form gets removed and re-added.
        match Domain::parse(&item) {
            Some(domain) if domain.as_str() == item => {
                domains.insert(domain);
            }
            _ => unknown_items.push(item),
        }
    }
    unknown_items.sort();

    RemoteList {
        id: info.id,
        name: info.name,
        domains,
        unknown_items,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{CallKind, MemoryGateway};
    use std::time::Duration;

    const PREFIX: &str = "Adblock_List_";
    const POLICY: &str = "Block Adblock";

    fn reader(gw: &Arc<MemoryGateway>) -> InventoryReader {
        let retry = RetryPolicy {
            max_retries: 2,
            backoff_base: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
            attempt_timeout: Duration::from_secs(5),
        };
        InventoryReader::new(gw.clone(), ListNaming::new(PREFIX), POLICY, 4, retry)
    }

    #[tokio::test]
    async fn test_filters_by_naming_convention() {
        let gw = Arc::new(MemoryGateway::new());
        let l0 = gw.seed_list("Adblock_List_0", ["a.com", "b.com"]);
        gw.seed_list("Adblock_List_1", ["c.com"]);
        gw.seed_list("My own list", ["d.com"]);
        gw.seed_list("Adblock_List_x", ["e.com"]);
        gw.seed_policy(POLICY, std::slice::from_ref(&l0));
        gw.seed_policy("Someone else", &[]);

        let inventory = reader(&gw).read().await.unwrap();
        assert_eq!(inventory.lists.len(), 2);
        assert_eq!(inventory.lists[&0].domains.len(), 2);
        assert_eq!(inventory.lists[&1].name, "Adblock_List_1");
        let policy = inventory.policy.unwrap();
        assert_eq!(policy.list_ids, vec![l0]);
        assert!(inventory.dangling.is_empty());
        assert!(inventory.duplicates.is_empty());
    }

    #[tokio::test]
    async fn test_detects_drift() {
        let gw = Arc::new(MemoryGateway::new());
        let first = gw.seed_list("Adblock_List_0", ["a.com"]);
        let second = gw.seed_list("Adblock_List_0", ["a.com"]);
        let foreign = gw.seed_list("Other", ["x.com"]);
        gw.seed_policy(POLICY, &[first.clone(), foreign.clone()]);
        gw.seed_policy(POLICY, &[]);

        let inventory = reader(&gw).read().await.unwrap();
        assert_eq!(inventory.lists[&0].id, first);
        assert_eq!(inventory.duplicates.len(), 1);
        assert_eq!(inventory.duplicates[0].id, second);
        assert_eq!(inventory.dangling, vec![foreign]);
        assert_eq!(inventory.duplicate_policies.len(), 1);
        assert!(inventory.is_inconsistent());
    }

    #[tokio::test]
    async fn test_unnormalized_items_are_unknown() {
        let gw = Arc::new(MemoryGateway::new());
        gw.seed_list("Adblock_List_0", ["ok.com", "Upper.com", "not a domain"]);

        let inventory = reader(&gw).read().await.unwrap();
        let list = &inventory.lists[&0];
        assert_eq!(list.domains.len(), 1);
        assert_eq!(
            list.unknown_items,
            vec!["Upper.com".to_string(), "not a domain".to_string()]
        );
    }

    #[tokio::test]
    async fn test_surfaces_failures() {
        let gw = Arc::new(MemoryGateway::new());
        gw.seed_list("Adblock_List_0", ["a.com"]);
        gw.fail(CallKind::ListItems, None, RemoteError::fatal("403"), 1);

        let err = reader(&gw).read().await.unwrap_err();
        assert!(err.is_fatal());
        let item_reads = gw
            .calls()
            .iter()
            .filter(|c| c.kind == CallKind::ListItems)
            .count();
        assert_eq!(item_reads, 1);
    }

    #[tokio::test]
    async fn test_transient_read_failures_are_retried() {
        let gw = Arc::new(MemoryGateway::new());
        let id = gw.seed_list("Adblock_List_0", ["a.com"]);
        gw.fail(CallKind::ListLists, None, RemoteError::transient("HTTP 502"), 1);
        gw.fail(CallKind::ListPolicies, None, RemoteError::transient("HTTP 503"), 1);
        gw.fail(CallKind::ListItems, Some(&id), RemoteError::transient("HTTP 429"), 2);

        let inventory = reader(&gw).read().await.unwrap();
        assert_eq!(inventory.lists[&0].domains.len(), 1);
        let item_reads = gw
            .calls()
            .iter()
            .filter(|c| c.kind == CallKind::ListItems)
            .count();
        assert_eq!(item_reads, 3);
    }

    #[tokio::test]
    async fn test_persistent_transient_failure_fails_the_read() {
        let gw = Arc::new(MemoryGateway::new());
        gw.fail(CallKind::ListPolicies, None, RemoteError::transient("HTTP 503"), 10);

        let err = reader(&gw).read().await.unwrap_err();
        assert!(err.is_transient());
        let policy_reads = gw
            .calls()
            .iter()
            .filter(|c| c.kind == CallKind::ListPolicies)
            .count();
        assert_eq!(policy_reads, 3);
    }
}
