//! HTTP-level tests for the release-manifest client against a mock server.

use kmodctl::error::RemoteError;
use kmodctl::kernel::KernelVersion;
use kmodctl::remote::{self, GitHubReleaseClient, ReleaseSource};

const MANIFEST_BODY: &str = r#"[
    {
        "tag_name": "v1.3.0",
        "name": "Release v1.3.0",
        "assets": [
            {
                "name": "batt_design_override-android13-5.15.123.ko",
                "browser_download_url": "https://example.invalid/dl/batt_design_override-android13-5.15.123.ko",
                "size": 21544
            },
            {
                "name": "chg_param_override-android13-5.15.123.ko",
                "browser_download_url": "https://example.invalid/dl/chg_param_override-android13-5.15.123.ko",
                "size": 18032
            }
        ]
    },
    {
        "tag_name": "v1.2.1",
        "name": "Release v1.2.1",
        "assets": [
            {
                "name": "batt_design_override-5.10.ko",
                "browser_download_url": "https://example.invalid/dl/batt_design_override-5.10.ko",
                "size": 20110
            }
        ]
    }
]"#;

#[tokio::test]
async fn test_fetch_and_resolve_against_mock_server() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/repos/acme/ko-releases/releases")
        .match_header("accept", "application/vnd.github.v3+json")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(MANIFEST_BODY)
        .create_async()
        .await;

    let client = GitHubReleaseClient::with_base_url(&server.url(), "acme", "ko-releases");
    let kv = KernelVersion::parse("5.15.123-g1234567");
    let artifact = remote::find_asset(&client, "batt_design_override", &kv)
        .await
        .unwrap()
        .expect("manifest holds a matching asset");

    assert_eq!(artifact.version, "v1.3.0");
    assert_eq!(artifact.kernel_version, "5.15.123");
    assert_eq!(artifact.size, 21544);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_server_errors_exhaust_all_attempts() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/repos/acme/ko-releases/releases")
        .with_status(502)
        .expect(3)
        .create_async()
        .await;

    let client = GitHubReleaseClient::with_base_url(&server.url(), "acme", "ko-releases");
    let err = client.releases().await.unwrap_err();
    assert!(matches!(err, RemoteError::Exhausted { attempts: 3, .. }));
    // Each attempt must actually reach the server.
    mock.assert_async().await;
}

#[tokio::test]
async fn test_malformed_body_fails_without_retry() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/repos/acme/ko-releases/releases")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body("{") // not a release array
        .expect(1)
        .create_async()
        .await;

    let client = GitHubReleaseClient::with_base_url(&server.url(), "acme", "ko-releases");
    let err = client.releases().await.unwrap_err();
    assert!(matches!(err, RemoteError::Decode(_)));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_flat_ko_listing_spans_releases() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/repos/acme/ko-releases/releases")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(MANIFEST_BODY)
        .create_async()
        .await;

    let client = GitHubReleaseClient::with_base_url(&server.url(), "acme", "ko-releases");
    let assets = remote::list_ko_assets(&client, remote::DEFAULT_KO_ASSET_LIMIT)
        .await
        .unwrap();

    let names: Vec<&str> = assets.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "batt_design_override-android13-5.15.123.ko",
            "chg_param_override-android13-5.15.123.ko",
            "batt_design_override-5.10.ko",
        ]
    );
}
