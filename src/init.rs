//! Initialization helpers for the application startup.

use crate::api::{CloudflareClient, GatewayApi};
use crate::config::Config;
use crate::error::SyncError;
use std::sync::Arc;
use tracing::info;

/// Sets up the tracing subscriber with the configured filters.
pub fn setup_logging(config: &Config) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let mut filter = config.logging.level.clone();

        // Connection-level chatter from the HTTP stack is noise here
        if !filter.contains("hyper") {
            filter.push_str(",hyper=warn");
        }
        if !filter.contains("reqwest") {
            filter.push_str(",reqwest=warn");
        }

        tracing_subscriber::EnvFilter::new(filter)
    });

    let builder = tracing_subscriber::fmt().with_env_filter(env_filter);
    if config.logging.format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Builds the Gateway client for the configured account.
pub fn init_gateway(config: &Config) -> Result<Arc<dyn GatewayApi>, SyncError> {
    let client = CloudflareClient::new(&config.cloudflare)?;
    info!(
        "Using Cloudflare Gateway for account {}",
        config.cloudflare.account_id
    );
    Ok(Arc::new(client))
}
