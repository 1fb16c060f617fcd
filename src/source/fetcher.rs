use super::traits::BlocklistSource;
use crate::config::{BlocklistConfig, Config};
use crate::domain::Domain;
use crate::error::SyncError;
use futures::{stream, StreamExt};
use reqwest::Client;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::io::StreamReader;
use tracing::{error, info, warn};

/// Classification of one blocklist line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEntry {
    /// Comment or blank line.
    Skip,
    Domain(Domain),
    Invalid,
}

/// Parses plain domain lists and hosts files.
pub fn parse_line(line: &str) -> LineEntry {
    let line = line.trim();
    // Skip comments and empty lines
    if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
        return LineEntry::Skip;
    }
    let line = match line.find(" #") {
        Some(pos) => line[..pos].trim_end(),
        None => line,
    };

    let mut fields = line.split_whitespace();
    let first = fields.next().unwrap_or_default();
    let host = if first.parse::<IpAddr>().is_ok() {
        match fields.next() {
            Some(host) => host,
            None => return LineEntry::Invalid,
        }
    } else if fields.next().is_some() {
        return LineEntry::Invalid;
    } else {
        first
    };
    let host = host.strip_prefix("*.").unwrap_or(host);

    match Domain::parse(host) {
        Some(domain) => LineEntry::Domain(domain),
        None => LineEntry::Invalid,
    }
}

#[derive(Debug, Default)]
struct ParsedList {
    domains: BTreeSet<Domain>,
    invalid: usize,
}

/// Downloads the configured blocklists over HTTP.
pub struct HttpBlocklistSource {
    client: Client,
    blocklists: Vec<(String, BlocklistConfig)>,
    allowlist: Vec<String>,
    concurrent_downloads: usize,
}

impl HttpBlocklistSource {
    pub fn new(config: &Config) -> Result<Self, SyncError> {
        let client = Client::builder()
            .user_agent("GatewaySync/1.0")
            .timeout(Duration::from_secs(config.sources.timeout_secs))
            .build()
            .map_err(|e| SyncError::InvalidConfig(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            // Sorted for deterministic logs
            blocklists: config.get_blocklists_sorted(),
            allowlist: config.allowlist.clone(),
            concurrent_downloads: config.sources.concurrent_downloads.max(1),
        })
    }

    async fn fetch_and_parse(client: &Client, name: &str, url: &str) -> Result<ParsedList, String> {
        info!("Fetching blocklist '{}' from {}", name, url);
        let resp = client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| e.to_string())?;

        let stream = resp
            .bytes_stream()
            .map(|result| result.map_err(std::io::Error::other));
        let reader = StreamReader::new(stream);
        let mut lines = BufReader::new(reader).lines();
        let mut parsed = ParsedList::default();

        // A broken stream must not pass for a shorter list.
        while let Some(line) = lines.next_line().await.map_err(|e| e.to_string())? {
            match parse_line(&line) {
                LineEntry::Domain(domain) => {
                    parsed.domains.insert(domain);
                }
                LineEntry::Invalid => parsed.invalid += 1,
                LineEntry::Skip => {}
            }
        }

        if parsed.domains.is_empty() {
            return Err("no valid domains found".to_string());
        }
        info!(
            "Parsed {} domains from '{}' ({} invalid entries dropped)",
            parsed.domains.len(),
            name,
            parsed.invalid
        );
        Ok(parsed)
    }

    /// Tries the primary URL, then the backup.
    async fn fetch_one(
        client: &Client,
        name: &str,
        list: &BlocklistConfig,
    ) -> Result<ParsedList, SyncError> {
        let mut last_error = String::new();
        for url in std::iter::once(&list.url).chain(list.backup_url.iter()) {
            match Self::fetch_and_parse(client, name, url).await {
                Ok(parsed) => return Ok(parsed),
                Err(e) => {
                    warn!("Failed to fetch '{}' from {}: {}", name, url, e);
                    last_error = e;
                }
            }
        }
        Err(SyncError::Source {
            name: name.to_string(),
            reason: last_error,
        })
    }

    fn allowed(&self) -> BTreeSet<Domain> {
        self.allowlist
            .iter()
            .filter_map(|entry| {
                let domain = Domain::parse(entry);
                if domain.is_none() {
                    warn!("Ignoring invalid allowlist entry '{}'", entry);
                }
                domain
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl BlocklistSource for HttpBlocklistSource {
    async fn fetch(&self) -> Result<BTreeSet<Domain>, SyncError> {
        if self.blocklists.is_empty() {
            return Err(SyncError::InvalidConfig(
                "no blocklists configured".to_string(),
            ));
        }
        info!("Fetching {} blocklist(s)...", self.blocklists.len());

        let client = &self.client;
        let tasks: Vec<_> = self
            .blocklists
            .iter()
            .map(|(name, list)| async move {
                (name.as_str(), Self::fetch_one(client, name, list).await)
            })
            .collect();
        let results: Vec<(&str, Result<ParsedList, SyncError>)> = stream::iter(tasks)
            .buffer_unordered(self.concurrent_downloads)
            .collect()
            .await;

        let mut merged = BTreeSet::new();
        let mut raw_count = 0;
        let mut invalid = 0;
        let mut first_error = None;
        for (name, result) in results {
            match result {
                Ok(parsed) => {
                    raw_count += parsed.domains.len();
                    invalid += parsed.invalid;
                    merged.extend(parsed.domains);
                }
                Err(e) => {
                    error!("Blocklist '{}' unavailable: {}", name, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let allowed = self.allowed();
        let before = merged.len();
        merged.retain(|d| !allowed.contains(d));

        info!(
            "Blocklists merged. Total distinct domains: {} (from {} entries, {} invalid, {} allowlisted)",
            merged.len(),
            raw_count,
            invalid,
            before - merged.len()
        );
        Ok(merged)
    }
}
