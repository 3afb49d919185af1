//! Release index lookup against a mocked GitHub releases API.

use edgeval_release::{GithubReleaseIndex, ReleaseError, ReleaseIndex, ReleaseSelector, Version};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn releases_body() -> serde_json::Value {
    serde_json::json!([
        {"tag_name": "2.20.0-rc1", "prerelease": true, "draft": false, "assets": []},
        {"tag_name": "2.20.0", "prerelease": true, "draft": false, "assets": []},
        {"tag_name": "2.19.1", "prerelease": false, "draft": false,
         "assets": [{"name": "docker-compose.yml"}, {"name": "docker-compose.network.yml"}]},
        {"tag_name": "2.9.0", "prerelease": false, "draft": false, "assets": []},
        {"tag_name": "3.0.0", "prerelease": false, "draft": true, "assets": []}
    ])
}

#[tokio::test]
async fn test_latest_skips_prereleases_and_drafts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/releases"))
        .respond_with(ResponseTemplate::new(200).set_body_json(releases_body()))
        .expect(1)
        .mount(&server)
        .await;

    let index = GithubReleaseIndex::new(format!("{}/releases", server.uri())).unwrap();

    assert_eq!(index.latest_release().await.unwrap(), Version::new(2, 19, 1));
    // Second call is served from the cache (expect(1) above).
    assert_eq!(index.latest_release().await.unwrap(), Version::new(2, 19, 1));

    let releases = index.releases().await.unwrap();
    assert_eq!(releases.len(), 3, "malformed tag and draft are dropped");
    assert_eq!(releases[1].assets.len(), 2);
}

#[tokio::test]
async fn test_api_error_is_surfaced() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/releases"))
        .respond_with(ResponseTemplate::new(403).set_body_string("rate limited"))
        .mount(&server)
        .await;

    let index = GithubReleaseIndex::new(format!("{}/releases", server.uri())).unwrap();
    let err = index.latest_release().await.unwrap_err();
    assert!(matches!(err, ReleaseError::Api { status: 403, .. }));
}

#[tokio::test]
async fn test_selector_resolves_through_index() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/releases"))
        .respond_with(ResponseTemplate::new(200).set_body_json(releases_body()))
        .mount(&server)
        .await;

    let index = GithubReleaseIndex::new(format!("{}/releases", server.uri())).unwrap();
    let resolved = ReleaseSelector::latest()
        .with_engine_branch("feature-x")
        .resolve(&index)
        .await
        .unwrap();

    assert_eq!(resolved.image.tag(), "feature-x");
    assert_eq!(resolved.deployment.label(), "2.19.1");
}
