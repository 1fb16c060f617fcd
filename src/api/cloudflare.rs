use super::expression::{build_traffic_expression, MAX_EXPRESSION_LEN};
use super::types::{GatewayApi, ListInfo, PolicyInfo, PolicySpec};
use crate::config::CloudflareConfig;
use crate::domain::Domain;
use crate::error::{RemoteError, SyncError};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Standard Cloudflare v4 response envelope.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
    #[serde(default)]
    result_info: Option<ResultInfo>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct ResultInfo {
    per_page: Option<usize>,
    total_count: Option<usize>,
    cursors: Option<Cursors>,
}

#[derive(Debug, Deserialize)]
struct Cursors {
    after: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListRecord {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ListItemRecord {
    value: String,
}

#[derive(Debug, Deserialize)]
struct RuleRecord {
    id: String,
    name: String,
    #[serde(default)]
    traffic: String,
}

impl<T> Envelope<T> {
    fn error_text(&self) -> String {
        if self.errors.is_empty() {
            return "API returned success=false".to_string();
        }
        self.errors
            .iter()
            .map(|e| format!("[{}] {}", e.code, e.message))
            .collect::<Vec<_>>()
            .join("; ")
    }

    fn into_result(self, action: &str) -> Result<T, RemoteError> {
        self.result
            .ok_or_else(|| RemoteError::rejected(format!("{}: response has no result", action)))
    }
}

/// Gateway API client for one Cloudflare account.
pub struct CloudflareClient {
    client: Client,
    base: String,
    page_size: usize,
    item_page_size: usize,
}

impl CloudflareClient {
    pub fn new(config: &CloudflareConfig) -> Result<Self, SyncError> {
        let api_base = Url::parse(&config.api_base).map_err(|e| {
            SyncError::InvalidConfig(format!("invalid api_base '{}': {}", config.api_base, e))
        })?;

        let mut auth = HeaderValue::from_str(&format!("Bearer {}", config.api_token))
            .map_err(|_| SyncError::InvalidConfig("API token is not a valid header".to_string()))?;
        auth.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let client = Client::builder()
            .user_agent("GatewaySync/1.0")
            .default_headers(headers)
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| SyncError::InvalidConfig(format!("failed to build HTTP client: {}", e)))?;

        let base = format!(
            "{}/accounts/{}/gateway",
            api_base.as_str().trim_end_matches('/'),
            config.account_id
        );

        Ok(Self {
            client,
            base,
            page_size: config.page_size.max(1),
            item_page_size: config.item_page_size.max(1),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        action: &str,
    ) -> Result<Envelope<T>, RemoteError> {
        let response = request
            .send()
            .await
            .map_err(|e| classify_transport_error(&e, action))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, action, &body));
        }

        let envelope: Envelope<T> = response.json().await.map_err(|e| {
            RemoteError::transient(format!("{}: unreadable response body: {}", action, e))
        })?;

        if !envelope.success {
            return Err(RemoteError::rejected(format!(
                "{}: {}",
                action,
                envelope.error_text()
            )));
        }
        Ok(envelope)
    }

    /// Fetches every page of a page-numbered collection.
    async fn get_all_paginated<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<Vec<T>, RemoteError> {
        let mut all_items = Vec::new();
        let mut page = 1usize;

        loop {
            let request = self
                .client
                .get(self.url(path))
                .query(&[("page", page), ("per_page", self.page_size)]);
            let envelope: Envelope<Vec<T>> = self
                .call(request, &format!("GET {} page {}", path, page))
                .await?;

            let info = envelope.result_info.unwrap_or_default();
            let items = envelope.result.unwrap_or_default();
            let fetched = items.len();
            all_items.extend(items);

            let per_page = info.per_page.unwrap_or(self.page_size).max(1);
            let total_count = info.total_count.unwrap_or(0);
            if fetched == 0 || page.saturating_mul(per_page) >= total_count {
                break;
            }
            page += 1;
        }

        debug!(
            "Fetched {} items from {} ({} page(s))",
            all_items.len(),
            path,
            page
        );
        Ok(all_items)
    }
}

fn classify_transport_error(err: &reqwest::Error, action: &str) -> RemoteError {
    if err.is_builder() {
        return RemoteError::rejected(format!("{}: {}", action, err));
    }
    if err.is_timeout() {
        return RemoteError::transient(format!("{}: timed out", action));
    }
    RemoteError::transient(format!("{}: {}", action, err))
}

fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    action: &str,
    body: &str,
) -> RemoteError {
    let body = body.trim();
    let message = if body.is_empty() {
        format!("{}: HTTP {}", action, status.as_u16())
    } else {
        format!("{}: HTTP {} {}", action, status.as_u16(), body)
    };
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Fatal { message },
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => RemoteError::Transient {
            message,
            retry_after,
        },
        s if s.is_server_error() => RemoteError::Transient {
            message,
            retry_after,
        },
        _ => RemoteError::Rejected { message },
    }
}

fn domain_items(domains: &[Domain]) -> Vec<Value> {
    domains
        .iter()
        .map(|d| json!({ "value": d.as_str() }))
        .collect()
}

fn policy_body(spec: &PolicySpec) -> Value {
    let traffic = build_traffic_expression(&spec.list_ids);
    if traffic.len() > MAX_EXPRESSION_LEN {
        warn!(
            "Expression length ({}) for policy '{}' may exceed Gateway limits",
            traffic.len(),
            spec.name
        );
    }
    json!({
        "name": spec.name,
        "description": spec.description,
        "action": "block",
        "enabled": true,
        "filters": ["dns"],
        "traffic": traffic,
    })
}

#[async_trait::async_trait]
impl GatewayApi for CloudflareClient {
    async fn list_lists(&self) -> Result<Vec<ListInfo>, RemoteError> {
        let records: Vec<ListRecord> = self.get_all_paginated("/lists").await?;
        Ok(records
            .into_iter()
            .map(|r| ListInfo {
                id: r.id,
                name: r.name,
            })
            .collect())
    }

    async fn list_items(&self, list_id: &str) -> Result<Vec<String>, RemoteError> {
        let path = format!("/lists/{}/items", list_id);
        let mut values = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut request = self
                .client
                .get(self.url(&path))
                .query(&[("per_page", self.item_page_size)]);
            if let Some(after) = &cursor {
                request = request.query(&[("cursor", after.as_str())]);
            }

            let envelope: Envelope<Vec<ListItemRecord>> =
                self.call(request, &format!("GET {}", path)).await?;
            let items = envelope.result.unwrap_or_default();
            let page_empty = items.is_empty();
            values.extend(items.into_iter().map(|item| item.value));

            cursor = envelope
                .result_info
                .and_then(|info| info.cursors)
                .and_then(|c| c.after)
                .filter(|after| !after.is_empty());
            if page_empty || cursor.is_none() {
                break;
            }
        }

        Ok(values)
    }

    async fn create_list(
        &self,
        name: &str,
        description: &str,
        domains: &[Domain],
    ) -> Result<String, RemoteError> {
        let action = format!("creating list {}", name);
        let body = json!({
            "name": name,
            "type": "DOMAIN",
            "description": description,
            "items": domain_items(domains),
        });
        let envelope: Envelope<ListRecord> = self
            .call(self.client.post(self.url("/lists")).json(&body), &action)
            .await?;
        let record = envelope.into_result(&action)?;
        debug!("Created list {} ({})", record.name, record.id);
        Ok(record.id)
    }

    async fn update_list(
        &self,
        list_id: &str,
        append: &[Domain],
        remove: &[String],
    ) -> Result<(), RemoteError> {
        let body = json!({
            "append": domain_items(append),
            "remove": remove,
        });
        let _: Envelope<Value> = self
            .call(
                self.client
                    .patch(self.url(&format!("/lists/{}", list_id)))
                    .json(&body),
                &format!("updating list {}", list_id),
            )
            .await?;
        Ok(())
    }

    async fn delete_list(&self, list_id: &str) -> Result<(), RemoteError> {
        let _: Envelope<Value> = self
            .call(
                self.client.delete(self.url(&format!("/lists/{}", list_id))),
                &format!("deleting list {}", list_id),
            )
            .await?;
        Ok(())
    }

    async fn list_policies(&self) -> Result<Vec<PolicyInfo>, RemoteError> {
        let records: Vec<RuleRecord> = self.get_all_paginated("/rules").await?;
        Ok(records
            .into_iter()
            .map(|r| PolicyInfo {
                id: r.id,
                name: r.name,
                traffic: r.traffic,
            })
            .collect())
    }

    async fn create_policy(&self, spec: &PolicySpec) -> Result<String, RemoteError> {
        let action = format!("creating policy {}", spec.name);
        let envelope: Envelope<RuleRecord> = self
            .call(
                self.client.post(self.url("/rules")).json(&policy_body(spec)),
                &action,
            )
            .await?;
        Ok(envelope.into_result(&action)?.id)
    }

    async fn update_policy(&self, policy_id: &str, spec: &PolicySpec) -> Result<(), RemoteError> {
        let _: Envelope<Value> = self
            .call(
                self.client
                    .put(self.url(&format!("/rules/{}", policy_id)))
                    .json(&policy_body(spec)),
                &format!("updating policy {}", spec.name),
            )
            .await?;
        Ok(())
    }

    async fn delete_policy(&self, policy_id: &str) -> Result<(), RemoteError> {
        let _: Envelope<Value> = self
            .call(
                self.client.delete(self.url(&format!("/rules/{}", policy_id))),
                &format!("deleting policy {}", policy_id),
            )
            .await?;
        Ok(())
    }
}
