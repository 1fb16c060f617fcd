use super::types::DesiredChunk;
use crate::domain::Domain;
use crate::error::SyncError;
use std::collections::BTreeSet;
use tracing::{info, warn};

/// Splits `domains` into the fewest chunks of at most `chunk_limit`.
///
/// Domains are assigned in sorted order, so the same set always yields the
/// same chunks. Fails with `QuotaExceeded` when more than `list_quota`
/// lists would be needed.
pub fn chunk_domains(
    domains: &BTreeSet<Domain>,
    chunk_limit: usize,
    list_quota: usize,
) -> Result<Vec<DesiredChunk>, SyncError> {
    if chunk_limit == 0 {
        return Err(SyncError::InvalidConfig(
            "chunk_limit must be at least 1".to_string(),
        ));
    }

    let required = domains.len().div_ceil(chunk_limit);
    if required > list_quota {
        return Err(SyncError::QuotaExceeded {
            required,
            quota: list_quota,
        });
    }
    if required.saturating_mul(10) > list_quota.saturating_mul(9) {
        warn!(
            "{} lists is close to the account limit of {}",
            required, list_quota
        );
    }

    let sorted: Vec<&Domain> = domains.iter().collect();
    let chunks: Vec<DesiredChunk> = sorted
        .chunks(chunk_limit)
        .enumerate()
        .map(|(index, part)| DesiredChunk {
            index,
            domains: part.iter().map(|d| (*d).clone()).collect(),
        })
        .collect();

    info!(
        "Split {} domains into {} chunk(s) of at most {}",
        domains.len(),
        chunks.len(),
        chunk_limit
    );
    Ok(chunks)
}
