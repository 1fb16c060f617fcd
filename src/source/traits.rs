use crate::domain::Domain;
use crate::error::SyncError;
use std::collections::BTreeSet;

/// Produces the full desired domain set for one run.
#[async_trait::async_trait]
pub trait BlocklistSource: Send + Sync {
    /// Fetches every configured list and merges them. Fails rather than
    /// returning a partial set when any list is unavailable.
    async fn fetch(&self) -> Result<BTreeSet<Domain>, SyncError>;
}
