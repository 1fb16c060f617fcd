use crate::domain::Domain;
use crate::error::RemoteError;

/// List metadata as returned by the list enumeration endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListInfo {
    pub id: String,
    pub name: String,
}

/// A Gateway rule, with its traffic expression still unparsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyInfo {
    pub id: String,
    pub name: String,
    pub traffic: String,
}

/// Desired content of the managed blocking policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySpec {
    pub name: String,
    pub description: String,
    pub list_ids: Vec<String>,
}

/// Abstract Gateway API so the engine can run against Cloudflare or an
/// in-memory double.
///
/// Every call either succeeds or fails with one of the `RemoteError`
/// classes; pagination is handled inside the implementation.
#[async_trait::async_trait]
pub trait GatewayApi: Send + Sync {
    async fn list_lists(&self) -> Result<Vec<ListInfo>, RemoteError>;

    /// Raw item values of one list, across all pages.
    async fn list_items(&self, list_id: &str) -> Result<Vec<String>, RemoteError>;

    /// Returns the id assigned to the new list.
    async fn create_list(
        &self,
        name: &str,
        description: &str,
        domains: &[Domain],
    ) -> Result<String, RemoteError>;

    async fn update_list(
        &self,
        list_id: &str,
        append: &[Domain],
        remove: &[String],
    ) -> Result<(), RemoteError>;

    async fn delete_list(&self, list_id: &str) -> Result<(), RemoteError>;

    async fn list_policies(&self) -> Result<Vec<PolicyInfo>, RemoteError>;

    /// Returns the id assigned to the new policy.
    async fn create_policy(&self, spec: &PolicySpec) -> Result<String, RemoteError>;

    async fn update_policy(&self, policy_id: &str, spec: &PolicySpec) -> Result<(), RemoteError>;

    async fn delete_policy(&self, policy_id: &str) -> Result<(), RemoteError>;
}
