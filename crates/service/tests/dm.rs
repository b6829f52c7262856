//! Declarative Management caller tests against a local HTTP endpoint.

use std::sync::{Arc, Mutex};

use aspen_core::{
    find_in_chain, DeclarativeManagement, EnrollId, EnrollType, Enrollment, HttpStatusError,
    Request,
};
use aspen_service::{DeclarativeManagementHandler, DmHttpCaller};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::{get, put};
use axum::Router;

#[derive(Debug, Default, Clone)]
struct Seen {
    method: String,
    path: String,
    content_type: Option<String>,
    enrollment_id: Option<String>,
    enrollment_type: Option<String>,
    enrollment_parent_id: Option<String>,
    body: Vec<u8>,
}

type Shared = Arc<Mutex<Seen>>;

async fn record(
    method: &str,
    path: &str,
    state: &Shared,
    headers: &HeaderMap,
    body: &[u8],
) -> Vec<u8> {
    let mut seen = state.lock().unwrap();
    seen.method = method.to_string();
    seen.path = path.to_string();
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    seen.content_type = header("content-type");
    seen.enrollment_id = header("x-enrollment-id");
    seen.enrollment_type = header("x-enrollment-type");
    seen.enrollment_parent_id = header("x-enrollment-parentid");
    seen.body = body.to_vec();
    b"dm-response".to_vec()
}

async fn spawn_server(seen: Shared) -> String {
    let app = Router::new()
        .route(
            "/dm/status",
            put(
                |State(state): State<Shared>, headers: HeaderMap, body: axum::body::Bytes| async move {
                    record("PUT", "/dm/status", &state, &headers, &body).await
                },
            ),
        )
        .route(
            "/dm/declaration-items",
            get(|State(state): State<Shared>, headers: HeaderMap| async move {
                record("GET", "/dm/declaration-items", &state, &headers, b"").await
            }),
        )
        .route(
            "/dm/gone",
            get(|| async { (axum::http::StatusCode::GONE, "gone") }),
        )
        .with_state(seen);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/dm/")
}

fn dm_message(endpoint: &str, data: Option<&[u8]>) -> DeclarativeManagement {
    DeclarativeManagement {
        enrollment: Enrollment::default(),
        endpoint: endpoint.to_string(),
        data: data.map(|d| serde_bytes::ByteBuf::from(d.to_vec())),
        raw: Vec::new(),
    }
}

fn user_request() -> Request {
    Request::new().with_enroll_id(EnrollId {
        enroll_type: EnrollType::User,
        id: "D1:U1".into(),
        parent_id: Some("D1".into()),
    })
}

#[tokio::test]
async fn status_report_is_put_with_json_and_enrollment_headers() {
    let seen: Shared = Arc::default();
    let prefix = spawn_server(seen.clone()).await;
    let caller = DmHttpCaller::new(&prefix).unwrap();

    let body = caller
        .declarative_management(&user_request(), &dm_message("status", Some(b"{\"k\":1}")))
        .await
        .unwrap();
    assert_eq!(body, b"dm-response");

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.method, "PUT");
    assert_eq!(seen.content_type.as_deref(), Some("application/json"));
    assert_eq!(seen.enrollment_id.as_deref(), Some("D1:U1"));
    assert_eq!(seen.enrollment_type.as_deref(), Some("User"));
    assert_eq!(seen.enrollment_parent_id.as_deref(), Some("D1"));
    assert_eq!(seen.body, b"{\"k\":1}");
}

#[tokio::test]
async fn empty_data_is_get() {
    let seen: Shared = Arc::default();
    let prefix = spawn_server(seen.clone()).await;
    let caller = DmHttpCaller::new(&prefix).unwrap();

    let body = caller
        .declarative_management(&user_request(), &dm_message("declaration-items", None))
        .await
        .unwrap();
    assert_eq!(body, b"dm-response");
    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.method, "GET");
    assert_eq!(seen.content_type, None);
}

#[tokio::test]
async fn upstream_status_is_carried_in_the_error() {
    let seen: Shared = Arc::default();
    let prefix = spawn_server(seen).await;
    let caller = DmHttpCaller::new(&prefix).unwrap();

    let err = caller
        .declarative_management(&user_request(), &dm_message("gone", None))
        .await
        .unwrap_err();
    assert_eq!(find_in_chain::<HttpStatusError>(&err).unwrap().status, 410);
}
