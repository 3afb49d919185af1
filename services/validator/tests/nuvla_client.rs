//! HTTP contract of the control-plane client.

use edgeval_id::{EdgeId, ResourceId};
use edgeval_validator::client::{ControlPlane, ControlPlaneError, NuvlaClient};
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_login_posts_api_key_template() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/session"))
        .and(body_partial_json(json!({
            "template": {
                "href": "session-template/api-key",
                "key": "credential/abc",
                "secret": "s3cr3t",
            }
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "status": 201,
            "resource-id": "session/1",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = NuvlaClient::new(&server.uri()).unwrap();
    client.login_api_key("credential/abc", "s3cr3t").await.unwrap();
}

#[tokio::test]
async fn test_rejected_login() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/session"))
        .respond_with(ResponseTemplate::new(403).set_body_string("invalid credentials"))
        .mount(&server)
        .await;

    let client = NuvlaClient::new(&server.uri()).unwrap();
    let result = client.login_api_key("credential/abc", "wrong").await;

    assert!(matches!(
        result,
        Err(ControlPlaneError::Api { status: 403, body }) if body == "invalid credentials"
    ));
}

#[tokio::test]
async fn test_add_returns_created_id() {
    let server = MockServer::start().await;
    let edge = EdgeId::new();
    Mock::given(method("POST"))
        .and(path("/api/nuvlabox"))
        .and(body_partial_json(json!({ "name": "[pi-1] Validation" })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "status": 201,
            "message": format!("{edge} created"),
            "resource-id": edge.to_string(),
        })))
        .mount(&server)
        .await;

    let client = NuvlaClient::new(&format!("{}/", server.uri())).unwrap();
    let id = client
        .add("nuvlabox", &json!({ "name": "[pi-1] Validation" }))
        .await
        .unwrap();

    assert_eq!(id, edge.to_resource_id());
}

#[tokio::test]
async fn test_add_without_id_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/nuvlabox"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "status": 201 })))
        .mount(&server)
        .await;

    let client = NuvlaClient::new(&server.uri()).unwrap();
    let result = client.add("nuvlabox", &json!({})).await;

    assert!(matches!(result, Err(ControlPlaneError::MissingField { .. })));
}

#[tokio::test]
async fn test_get_with_selected_fields() {
    let server = MockServer::start().await;
    let edge = EdgeId::new();
    Mock::given(method("GET"))
        .and(path(format!("/api/{edge}")))
        .and(query_param("select", "state,online"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": edge.to_string(),
            "state": "COMMISSIONED",
            "online": true,
        })))
        .mount(&server)
        .await;

    let client = NuvlaClient::new(&server.uri()).unwrap();
    let resource = client
        .get(&edge.to_resource_id(), Some(&["state", "online"][..]))
        .await
        .unwrap();

    assert_eq!(resource.state(), Some("COMMISSIONED"));
    assert_eq!(resource.online(), Some(true));
}

#[tokio::test]
async fn test_missing_resource() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "status": 404,
            "message": "not found",
        })))
        .mount(&server)
        .await;

    let client = NuvlaClient::new(&server.uri()).unwrap();
    let result = client.get(&EdgeId::new().to_resource_id(), None).await;

    assert!(matches!(result, Err(ControlPlaneError::Api { status: 404, .. })));
}

#[tokio::test]
async fn test_search_returns_resources() {
    let server = MockServer::start().await;
    let edge = EdgeId::new();
    let filter = format!("created-by=\"{edge}\"");
    Mock::given(method("GET"))
        .and(path("/api/nuvlabox-peripheral"))
        .and(query_param("filter", filter.as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "count": 2,
            "resources": [
                { "id": "nuvlabox-peripheral/1", "interface": "USB" },
                { "id": "nuvlabox-peripheral/2", "interface": "Network" },
            ],
        })))
        .mount(&server)
        .await;

    let client = NuvlaClient::new(&server.uri()).unwrap();
    let found = client.search("nuvlabox-peripheral", &filter).await.unwrap();

    let ids: Vec<_> = found.iter().filter_map(|r| r.id()).collect();
    assert_eq!(ids, vec!["nuvlabox-peripheral/1", "nuvlabox-peripheral/2"]);
}

#[tokio::test]
async fn test_operation_returns_job_location() {
    let server = MockServer::start().await;
    let edge = EdgeId::new();
    let job = ResourceId::parse("job/3a1b8c4d-2e6f-4a70-9b12-5c3d4e5f6a7b").unwrap();
    Mock::given(method("POST"))
        .and(path(format!("/api/{edge}/reboot")))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({
            "status": 202,
            "message": "starting reboot",
            "location": job.to_string(),
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = NuvlaClient::new(&server.uri()).unwrap();
    let response = client
        .operation(&edge.to_resource_id(), "reboot", None)
        .await
        .unwrap();

    assert_eq!(response.status, 202);
    assert_eq!(response.job(), Some(job));
}

#[tokio::test]
async fn test_delete() {
    let server = MockServer::start().await;
    let edge = EdgeId::new();
    Mock::given(method("DELETE"))
        .and(path(format!("/api/{edge}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": 200 })))
        .expect(1)
        .mount(&server)
        .await;

    let client = NuvlaClient::new(&server.uri()).unwrap();
    client.delete(&edge.to_resource_id()).await.unwrap();
}
