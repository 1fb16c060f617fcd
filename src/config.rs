use crate::error::SyncError;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::fs;

pub const API_TOKEN_ENV: &str = "CLOUDFLARE_API_TOKEN";
pub const ACCOUNT_ID_ENV: &str = "CLOUDFLARE_ACCOUNT_ID";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub cloudflare: CloudflareConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub sources: SourceConfig,

    #[serde(default = "default_blocklists")]
    pub blocklists: HashMap<String, BlocklistConfig>,

    #[serde(default)]
    pub allowlist: Vec<String>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CloudflareConfig {
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub api_token: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_item_page_size")]
    pub item_page_size: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_list_prefix")]
    pub list_prefix: String,
    #[serde(default = "default_policy_name")]
    pub policy_name: String,
    #[serde(default = "default_chunk_limit")]
    pub chunk_limit: usize,
    #[serde(default = "default_list_quota")]
    pub list_quota: usize,
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default)]
    pub fresh_start: bool,
    #[serde(default = "default_recover_drift")]
    pub recover_drift: bool,
    #[serde(default)]
    pub policy_on_partial_failure: PartialFailurePolicy,
    #[serde(default)]
    pub dry_run: bool,
}

/// What to do with the policy when some of its list operations failed.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PartialFailurePolicy {
    /// Leave the policy untouched.
    #[default]
    Skip,
    /// Point the policy at every list that exists after the list stage.
    BestEffort,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Cap on a single wait, including the server's Retry-After.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    #[serde(default = "default_concurrent_downloads")]
    pub concurrent_downloads: usize,
    #[serde(default = "default_download_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct BlocklistConfig {
    pub url: String,
    #[serde(default)]
    pub backup_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Defaults
fn default_api_base() -> String {
    "https://api.cloudflare.com/client/v4".to_string()
}
fn default_request_timeout() -> u64 {
    30
}
fn default_page_size() -> usize {
    100
}
fn default_item_page_size() -> usize {
    1000
}
fn default_list_prefix() -> String {
    "Adblock_List_".to_string()
}
fn default_policy_name() -> String {
    "Block Adblock".to_string()
}
fn default_chunk_limit() -> usize {
    1000
}
fn default_list_quota() -> usize {
    300
}
fn default_parallelism() -> usize {
    4
}
fn default_recover_drift() -> bool {
    true
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_max_backoff_ms() -> u64 {
    60_000
}
fn default_concurrent_downloads() -> usize {
    4
}
fn default_download_timeout() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}
fn default_blocklists() -> HashMap<String, BlocklistConfig> {
    let mut m = HashMap::new();
    m.insert(
        "hagezi-pro-plus".to_string(),
        BlocklistConfig {
            url: "https://cdn.jsdelivr.net/gh/hagezi/dns-blocklists@latest/wildcard/pro.plus-onlydomains.txt"
                .to_string(),
            backup_url: Some(
                "https://gitlab.com/hagezi/mirror/-/raw/main/dns-blocklists/wildcard/pro.plus-onlydomains.txt"
                    .to_string(),
            ),
        },
    );
    m
}

impl Default for CloudflareConfig {
    fn default() -> Self {
        Self {
            account_id: String::new(),
            api_token: String::new(),
            api_base: default_api_base(),
            request_timeout_secs: default_request_timeout(),
            page_size: default_page_size(),
            item_page_size: default_item_page_size(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            list_prefix: default_list_prefix(),
            policy_name: default_policy_name(),
            chunk_limit: default_chunk_limit(),
            list_quota: default_list_quota(),
            parallelism: default_parallelism(),
            fresh_start: false,
            recover_drift: default_recover_drift(),
            policy_on_partial_failure: PartialFailurePolicy::default(),
            dry_run: false,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            concurrent_downloads: default_concurrent_downloads(),
            timeout_secs: default_download_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cloudflare: CloudflareConfig::default(),
            sync: SyncConfig::default(),
            retry: RetryConfig::default(),
            sources: SourceConfig::default(),
            blocklists: default_blocklists(),
            allowlist: Vec::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl CloudflareConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl RetryConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;
        let config: Config = toml::from_str(&contents).context("Failed to parse config TOML")?;
        Ok(config)
    }

    /// Credentials from the environment win over the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var(API_TOKEN_ENV) {
            if !token.is_empty() {
                self.cloudflare.api_token = token;
            }
        }
        if let Ok(account) = std::env::var(ACCOUNT_ID_ENV) {
            if !account.is_empty() {
                self.cloudflare.account_id = account;
            }
        }
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.cloudflare.api_token.is_empty() || self.cloudflare.account_id.is_empty() {
            return Err(SyncError::InvalidConfig(format!(
                "missing API token or account ID (set {} and {})",
                API_TOKEN_ENV, ACCOUNT_ID_ENV
            )));
        }
        if self.sync.list_prefix.trim().is_empty() {
            return Err(SyncError::InvalidConfig(
                "list_prefix must not be empty".to_string(),
            ));
        }
        if self.sync.policy_name.trim().is_empty() {
            return Err(SyncError::InvalidConfig(
                "policy_name must not be empty".to_string(),
            ));
        }
        if self.sync.chunk_limit == 0 {
            return Err(SyncError::InvalidConfig(
                "chunk_limit must be at least 1".to_string(),
            ));
        }
        if self.sync.parallelism == 0 {
            return Err(SyncError::InvalidConfig(
                "parallelism must be at least 1".to_string(),
            ));
        }
        if self.cloudflare.request_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "request_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn get_blocklists_sorted(&self) -> Vec<(String, BlocklistConfig)> {
        let mut list: Vec<_> = self
            .blocklists
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        list.sort_by(|a, b| a.0.cmp(&b.0));
        list
    }
}
