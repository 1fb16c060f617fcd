//! HTTP-level tests for the Cloudflare Gateway client.

use gateway_sync::api::{CloudflareClient, GatewayApi, PolicySpec};
use gateway_sync::config::CloudflareConfig;
use gateway_sync::domain::Domain;
use gateway_sync::error::RemoteError;
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{
    body_partial_json, header, method, path, query_param, query_param_is_missing,
};
use wiremock::{Mock, MockServer, ResponseTemplate};

const GATEWAY: &str = "/client/v4/accounts/acc-1/gateway";

fn client(server: &MockServer) -> CloudflareClient {
    let config = CloudflareConfig {
        account_id: "acc-1".to_string(),
        api_token: "secret-token".to_string(),
        api_base: format!("{}/client/v4", server.uri()),
        request_timeout_secs: 5,
        page_size: 2,
        item_page_size: 2,
    };
    CloudflareClient::new(&config).unwrap()
}

fn ok(result: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "success": true,
        "errors": [],
        "result": result,
    }))
}

fn domain(s: &str) -> Domain {
    Domain::parse(s).unwrap()
}

#[tokio::test]
async fn test_list_lists_follows_pages() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(format!("{}/lists", GATEWAY)))
        .and(query_param("page", "1"))
        .and(header("authorization", "Bearer secret-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "errors": [],
            "result": [
                {"id": "l1", "name": "Adblock_List_0"},
                {"id": "l2", "name": "Adblock_List_1"}
            ],
            "result_info": {"page": 1, "per_page": 2, "total_count": 3}
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("{}/lists", GATEWAY)))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "errors": [],
            "result": [{"id": "l3", "name": "Other"}],
            "result_info": {"page": 2, "per_page": 2, "total_count": 3}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let lists = client(&server).list_lists().await.unwrap();
    let ids: Vec<&str> = lists.iter().map(|l| l.id.as_str()).collect();
    assert_eq!(ids, vec!["l1", "l2", "l3"]);
}

#[tokio::test]
async fn test_list_items_follows_cursor() {
    let server = MockServer::start().await;
    let items_path = format!("{}/lists/l1/items", GATEWAY);

    Mock::given(method("GET"))
        .and(path(items_path.clone()))
        .and(query_param_is_missing("cursor"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "errors": [],
            "result": [{"value": "a.com"}, {"value": "b.com"}],
            "result_info": {"cursors": {"after": "next-1"}}
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(items_path))
        .and(query_param("cursor", "next-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "errors": [],
            "result": [{"value": "c.com"}],
            "result_info": {"cursors": {}}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let items = client(&server).list_items("l1").await.unwrap();
    assert_eq!(items, vec!["a.com", "b.com", "c.com"]);
}

#[tokio::test]
async fn test_status_classification() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path(format!("{}/lists/throttled", GATEWAY)))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(format!("{}/lists/unavailable", GATEWAY)))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(format!("{}/lists/forbidden", GATEWAY)))
        .respond_with(ResponseTemplate::new(403).set_body_string("no access"))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(format!("{}/lists/in-use", GATEWAY)))
        .respond_with(ResponseTemplate::new(400))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(format!("{}/lists/refused", GATEWAY)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": false,
            "errors": [{"code": 7003, "message": "list is in use"}],
            "result": null
        })))
        .mount(&server)
        .await;

    let client = client(&server);

    match client.delete_list("throttled").await.unwrap_err() {
        RemoteError::Transient { retry_after, .. } => {
            assert_eq!(retry_after, Some(Duration::from_secs(7)))
        }
        other => panic!("expected transient, got {:?}", other),
    }
    assert!(client.delete_list("unavailable").await.unwrap_err().is_transient());
    assert!(client.delete_list("forbidden").await.unwrap_err().is_fatal());
    assert!(matches!(
        client.delete_list("in-use").await.unwrap_err(),
        RemoteError::Rejected { .. }
    ));
    let refused = client.delete_list("refused").await.unwrap_err();
    assert!(matches!(refused, RemoteError::Rejected { .. }));
    assert!(refused.to_string().contains("list is in use"));
}

#[tokio::test]
async fn test_create_list_body() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(format!("{}/lists", GATEWAY)))
        .and(body_partial_json(json!({
            "name": "Adblock_List_0",
            "type": "DOMAIN",
            "items": [{"value": "a.com"}, {"value": "b.com"}]
        })))
        .respond_with(ok(json!({"id": "new-list", "name": "Adblock_List_0"})))
        .expect(1)
        .mount(&server)
        .await;

    let id = client(&server)
        .create_list("Adblock_List_0", "chunk 1/1", &[domain("a.com"), domain("b.com")])
        .await
        .unwrap();
    assert_eq!(id, "new-list");
}

#[tokio::test]
async fn test_update_list_sends_deltas() {
    let server = MockServer::start().await;

    Mock::given(method("PATCH"))
        .and(path(format!("{}/lists/l1", GATEWAY)))
        .and(body_partial_json(json!({
            "append": [{"value": "new.com"}],
            "remove": ["old.com"]
        })))
        .respond_with(ok(json!({"id": "l1"})))
        .expect(1)
        .mount(&server)
        .await;

    client(&server)
        .update_list("l1", &[domain("new.com")], &["old.com".to_string()])
        .await
        .unwrap();
}

#[tokio::test]
async fn test_policy_expression_round_trip() {
    let server = MockServer::start().await;
    let traffic = "any(dns.domains[*] in $l1) or any(dns.domains[*] in $l2)";

    Mock::given(method("POST"))
        .and(path(format!("{}/rules", GATEWAY)))
        .and(body_partial_json(json!({
            "name": "Block Adblock",
            "action": "block",
            "enabled": true,
            "filters": ["dns"],
            "traffic": traffic
        })))
        .respond_with(ok(json!({"id": "rule-1", "name": "Block Adblock", "traffic": traffic})))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("{}/rules", GATEWAY)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "errors": [],
            "result": [{"id": "rule-1", "name": "Block Adblock", "traffic": traffic}],
            "result_info": {"page": 1, "per_page": 2, "total_count": 1}
        })))
        .mount(&server)
        .await;

    let client = client(&server);
    let spec = PolicySpec {
        name: "Block Adblock".to_string(),
        description: "2 lists".to_string(),
        list_ids: vec!["l1".to_string(), "l2".to_string()],
    };
    assert_eq!(client.create_policy(&spec).await.unwrap(), "rule-1");

    let policies = client.list_policies().await.unwrap();
    assert_eq!(policies.len(), 1);
    assert_eq!(
        gateway_sync::api::expression::parse_list_references(&policies[0].traffic),
        spec.list_ids
    );
}
