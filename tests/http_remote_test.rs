//! HTTP adapter tests against a mock system of record

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::RESULT;
use inspection_sync::config::RemoteConfig;
use inspection_sync::error::{FailureClass, RemoteError};
use inspection_sync::model::ResultStatus;
use inspection_sync::remote::{
    ChecklistApi, HttpRemote, ObjectStorage, ReachabilityProbe, ReadApi, Remote, ResultApi,
    ResultUpdate,
};
use inspection_sync::sync::ChecklistPatch;
use inspection_sync::ResultChange;

fn remote_for(server: &MockServer, timeout: Duration) -> HttpRemote {
    let config = RemoteConfig {
        base_url: server.uri(),
        api_key: Some("secret-key".into()),
        bucket: "audit-evidence".into(),
    };
    HttpRemote::new(&config, timeout).unwrap()
}

async fn update_status(server: &MockServer, code: u16) -> RemoteError {
    Mock::given(method("PATCH"))
        .and(path("/api/results/r1"))
        .respond_with(ResponseTemplate::new(code).set_body_string("nope"))
        .mount(server)
        .await;
    let remote = remote_for(server, Duration::from_secs(5));
    remote
        .update_result("r1", &ResultUpdate::default(), "r1:1")
        .await
        .unwrap_err()
}

// =============================================================================
// Structured writes
// =============================================================================

#[tokio::test]
async fn test_update_result_sends_key_auth_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/api/results/r1"))
        .and(header("Idempotency-Key", "r1:1760000000000"))
        .and(header("Authorization", "Bearer secret-key"))
        .and(header("apikey", "secret-key"))
        .and(body_json(json!({
            "status": "DEFECT",
            "comment": "Door 3 does not latch",
            "photos": ["https://cdn/a.jpg"]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "updated_at": "2026-10-19T09:30:00Z" })))
        .expect(1)
        .mount(&server)
        .await;

    let remote = remote_for(&server, Duration::from_secs(5));
    let update = ResultUpdate {
        status: Some(ResultStatus::Defect),
        comment: Some(Some("Door 3 does not latch".into())),
        photos: Some(vec!["https://cdn/a.jpg".into()]),
        quantitative: None,
    };
    let ack = remote.update_result("r1", &update, "r1:1760000000000").await.unwrap();
    assert_eq!(ack.updated_at.as_deref(), Some("2026-10-19T09:30:00Z"));
}

#[tokio::test]
async fn test_empty_success_body_is_an_ack() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/api/checklists/c1"))
        .and(body_json(json!({ "status": "COMPLETE" })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let remote = remote_for(&server, Duration::from_secs(5));
    let patch = ChecklistPatch { status: Some("COMPLETE".into()), ..Default::default() };
    let ack = remote.update_checklist("c1", &patch, "c1:1").await.unwrap();
    assert!(ack.updated_at.is_none());
}

#[tokio::test]
async fn test_status_codes_map_to_failure_classes() {
    let cases = [
        (400, FailureClass::Permanent),
        (422, FailureClass::Permanent),
        (404, FailureClass::Conflict),
        (409, FailureClass::Conflict),
        (429, FailureClass::Transient),
        (503, FailureClass::Transient),
    ];
    for (code, expected) in cases {
        let server = MockServer::start().await;
        let err = update_status(&server, code).await;
        assert_eq!(err.failure_class(), expected, "status {}", code);
    }
}

#[tokio::test]
async fn test_error_body_is_kept_in_message() {
    let server = MockServer::start().await;
    let err = update_status(&server, 422).await;
    assert!(matches!(err, RemoteError::Validation(msg) if msg == "nope"));
}

#[tokio::test]
async fn test_slow_response_is_a_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let remote = remote_for(&server, Duration::from_millis(100));
    let err = remote
        .update_result("r1", &ResultUpdate::default(), "r1:1")
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::Timeout));
    assert!(err.is_transient());
}

// =============================================================================
// Object storage
// =============================================================================

#[tokio::test]
async fn test_upload_puts_object_with_upsert() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/storage/audit-evidence/projects/p1/r1/r1-a.jpg"))
        .and(header("x-upsert", "true"))
        .and(header("content-type", "image/jpeg"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let remote = remote_for(&server, Duration::from_secs(5));
    let uploaded = remote
        .upload("projects/p1/r1/r1-a.jpg", &common::jpeg_bytes(), "image/jpeg")
        .await
        .unwrap();
    assert_eq!(
        uploaded.public_url,
        format!("{}/storage/public/audit-evidence/projects/p1/r1/r1-a.jpg", server.uri())
    );
}

#[tokio::test]
async fn test_upload_prefers_url_from_response() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "public_url": "https://cdn/x.jpg" })))
        .mount(&server)
        .await;

    let remote = remote_for(&server, Duration::from_secs(5));
    let uploaded = remote.upload("x.jpg", b"x", "image/jpeg").await.unwrap();
    assert_eq!(uploaded.public_url, "https://cdn/x.jpg");
}

// =============================================================================
// Reads and reachability
// =============================================================================

#[tokio::test]
async fn test_project_bundle_is_parsed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/projects/p1/bundle"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "project": { "id": "p1", "name": "Harbour Tower", "status": "ACTIVE" },
            "checklists": [
                { "id": "c1", "project_id": "p1", "status": "IN_PROGRESS", "name": "Fire doors" }
            ],
            "results": [
                {
                    "id": "r1",
                    "checklist_id": "c1",
                    "requirement_id": "req-1",
                    "status": "VIOLATION",
                    "photos": ["https://cdn/a.jpg"]
                }
            ]
        })))
        .mount(&server)
        .await;

    let remote = remote_for(&server, Duration::from_secs(5));
    let bundle = remote.get_project_bundle("p1").await.unwrap();
    assert_eq!(bundle.project.name, "Harbour Tower");
    assert_eq!(bundle.checklists.len(), 1);
    assert_eq!(bundle.results[0].status, ResultStatus::Defect);
    assert_eq!(bundle.results[0].photos, vec!["https://cdn/a.jpg".to_string()]);
}

#[tokio::test]
async fn test_missing_project_and_malformed_bundle() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/projects/gone/bundle"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/projects/bad/bundle"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"project\": 7}"))
        .mount(&server)
        .await;

    let remote = remote_for(&server, Duration::from_secs(5));
    assert!(matches!(
        remote.get_project_bundle("gone").await,
        Err(RemoteError::NotFound(_))
    ));
    assert!(matches!(
        remote.get_project_bundle("bad").await,
        Err(RemoteError::Validation(_))
    ));
}

#[tokio::test]
async fn test_probe_follows_health_endpoint() {
    let server = MockServer::start().await;
    let remote = remote_for(&server, Duration::from_secs(5));

    // Unmatched requests get a 404 from the mock server
    assert!(!remote.probe().await);

    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
        .mount(&server)
        .await;
    assert!(remote.probe().await);
}

// =============================================================================
// Service over HTTP
// =============================================================================

#[tokio::test]
async fn test_service_syncs_through_http_remote() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path(format!("/api/results/{}", RESULT)))
        .and(body_json(json!({ "status": "OK", "comment": null, "photos": [] })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let http = Arc::new(remote_for(&server, Duration::from_secs(5)));
    let store = common::seeded_store(&[RESULT]);
    let mut config = common::test_config();
    config.remote.base_url = server.uri();
    let service = inspection_sync::SyncService::new(config, store, Remote::from_backend(http), None);

    service
        .update_result(RESULT, ResultChange { status: Some(ResultStatus::Ok), ..Default::default() })
        .unwrap();
    let report = service.process_sync_queue().await;
    assert_eq!(report.succeeded, 1, "errors: {:?}", report.errors);
    assert_eq!(report.remaining, 0);
}
