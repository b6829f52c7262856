//! HTTP-level tests: device endpoints and admin API wired to the in-memory
//! backend.

use std::collections::HashMap;
use std::sync::Arc;

use aspen_core::PushResponse;
use aspen_http::{
    checkin_and_command_handler, enqueue_handler, push_handler, ApiResult, ApiState,
    CHECKIN_CONTENT_TYPE,
};
use aspen_push::Pusher;
use aspen_service::Engine;
use aspen_storage::InMemStorage;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::{post, put};
use axum::Router;
use tower::ServiceExt as _;

struct FakePusher {
    reachable: Vec<String>,
}

impl Pusher for FakePusher {
    async fn push(
        &self,
        ids: &[String],
    ) -> color_eyre::eyre::Result<HashMap<String, PushResponse>> {
        Ok(ids
            .iter()
            .filter(|id| self.reachable.contains(id))
            .map(|id| (id.clone(), PushResponse::success(format!("apns-{id}"))))
            .collect())
    }
}

type TestEngine = Engine<InMemStorage>;

fn test_app(store: InMemStorage, reachable: &[&str]) -> Router {
    let engine: Arc<TestEngine> = Arc::new(Engine::new(store.clone()));
    let state = ApiState {
        store: Arc::new(store),
        pusher: Arc::new(FakePusher {
            reachable: reachable.iter().map(|s| s.to_string()).collect(),
        }),
    };
    let device = Router::new()
        .route(
            "/mdm",
            put(checkin_and_command_handler::<TestEngine>)
                .post(checkin_and_command_handler::<TestEngine>),
        )
        .with_state(engine);
    let api = Router::new()
        .route(
            "/v1/enqueue/:ids",
            put(enqueue_handler::<InMemStorage, FakePusher>),
        )
        .route(
            "/v1/push/:ids",
            post(push_handler::<InMemStorage, FakePusher>),
        )
        .with_state(state);
    device.merge(api)
}

fn plist_doc(body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
{body}
</dict>
</plist>"#
    )
}

async fn do_request(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

async fn checkin(app: &Router, body: String) -> (StatusCode, Vec<u8>) {
    do_request(
        app,
        Request::builder()
            .method("PUT")
            .uri("/mdm")
            .header("content-type", CHECKIN_CONTENT_TYPE)
            .body(Body::from(body))
            .unwrap(),
    )
    .await
}

async fn enroll(app: &Router, udid: &str) {
    let auth = plist_doc(&format!(
        "    <key>MessageType</key>\n    <string>Authenticate</string>\n    <key>UDID</key>\n    <string>{udid}</string>\n    <key>Topic</key>\n    <string>com.apple.mgmt.X</string>"
    ));
    let (status, _) = checkin(app, auth).await;
    assert_eq!(status, StatusCode::OK);

    let token_update = plist_doc(&format!(
        "    <key>MessageType</key>\n    <string>TokenUpdate</string>\n    <key>UDID</key>\n    <string>{udid}</string>\n    <key>Topic</key>\n    <string>com.apple.mgmt.X</string>\n    <key>PushMagic</key>\n    <string>PM</string>\n    <key>Token</key>\n    <data>3q2+7w==</data>"
    ));
    let (status, _) = checkin(app, token_update).await;
    assert_eq!(status, StatusCode::OK);
}

fn command_plist(uuid: &str) -> String {
    plist_doc(&format!(
        "    <key>CommandUUID</key>\n    <string>{uuid}</string>\n    <key>Command</key>\n    <dict>\n        <key>RequestType</key>\n        <string>DeviceInformation</string>\n    </dict>"
    ))
}

fn idle_report(udid: &str) -> String {
    plist_doc(&format!(
        "    <key>UDID</key>\n    <string>{udid}</string>\n    <key>Status</key>\n    <string>Idle</string>"
    ))
}

#[tokio::test]
async fn enqueue_then_device_poll_returns_the_command() {
    let store = InMemStorage::new();
    let app = test_app(store, &["AAAA-1111"]);
    enroll(&app, "AAAA-1111").await;

    // enqueue (nopush so the fake pusher stays out of the way)
    let (status, body) = do_request(
        &app,
        Request::builder()
            .method("PUT")
            .uri("/v1/enqueue/AAAA-1111?nopush=1")
            .body(Body::from(command_plist("CMD-1")))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let result: ApiResult = serde_json::from_slice(&body).unwrap();
    assert_eq!(result.command_uuid, "CMD-1");
    assert_eq!(result.request_type, "DeviceInformation");
    assert!(result.no_push);

    // the device polls with Idle and receives the raw command plist back
    let (status, body) = checkin_command(&app, idle_report("AAAA-1111")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, command_plist("CMD-1").into_bytes());
}

async fn checkin_command(app: &Router, body: String) -> (StatusCode, Vec<u8>) {
    // command reports go to the combined endpoint without the check-in
    // content type
    do_request(
        app,
        Request::builder()
            .method("PUT")
            .uri("/mdm")
            .body(Body::from(body))
            .unwrap(),
    )
    .await
}

#[tokio::test]
async fn empty_queue_returns_empty_body() {
    let store = InMemStorage::new();
    let app = test_app(store, &[]);
    enroll(&app, "AAAA-1111").await;

    let (status, body) = checkin_command(&app, idle_report("AAAA-1111")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());
}

#[tokio::test]
async fn unknown_message_type_is_bad_request() {
    let store = InMemStorage::new();
    let app = test_app(store, &[]);
    let body = plist_doc(
        "    <key>MessageType</key>\n    <string>Nonsense</string>\n    <key>UDID</key>\n    <string>X</string>",
    );
    let (status, _) = checkin(&app, body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn malformed_command_is_bad_request() {
    let store = InMemStorage::new();
    let app = test_app(store, &[]);
    let (status, body) = do_request(
        &app,
        Request::builder()
            .method("PUT")
            .uri("/v1/enqueue/AAAA-1111")
            .body(Body::from("not a plist"))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let result: ApiResult = serde_json::from_slice(&body).unwrap();
    assert!(result.enqueue_error.is_some());
}

#[tokio::test]
async fn push_api_reports_only_reachable_ids() {
    let store = InMemStorage::new();
    let app = test_app(store, &["A", "C"]);

    let (status, body) = do_request(
        &app,
        Request::builder()
            .method("POST")
            .uri("/v1/push/A,B,C")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let result: ApiResult = serde_json::from_slice(&body).unwrap();
    assert_eq!(result.status.len(), 2);
    assert_eq!(result.status["A"].push_id.as_deref(), Some("apns-A"));
    assert!(!result.status.contains_key("B"));
}
