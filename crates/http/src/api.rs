//! Admin API: command enqueueing, raw pushes, push-cert upload, version.

use std::collections::HashMap;
use std::sync::Arc;

use aspen_core::decode_command;
use aspen_push::Pusher;
use aspen_storage::{CommandEnqueuer, PushCertStore};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

/// Per-enrollment result of the push and enqueue APIs.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct EnrollmentResult {
    /// `apns-id` of a successful push.
    #[serde(rename = "push_result", default, skip_serializing_if = "Option::is_none")]
    pub push_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_error: Option<String>,

    #[serde(rename = "command_error", default, skip_serializing_if = "Option::is_none")]
    pub enqueue_error: Option<String>,
}

/// Result of the push and enqueue APIs.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ApiResult {
    /// Per-enrollment results, keyed by enrollment ID.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub status: HashMap<String, EnrollmentResult>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub no_push: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_error: Option<String>,

    #[serde(rename = "command_error", default, skip_serializing_if = "Option::is_none")]
    pub enqueue_error: Option<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command_uuid: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_type: String,
}

/// Translate an [`ApiResult`] into a response status: 200 all-success, 207
/// partial, 500 total failure (including any whole-batch error).
pub fn result_code(result: &ApiResult, id_count: usize) -> StatusCode {
    if result.push_error.is_some() || result.enqueue_error.is_some() {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    let err_count = result
        .status
        .values()
        .filter(|r| r.push_error.is_some() || r.enqueue_error.is_some())
        .count();
    if err_count == 0 {
        StatusCode::OK
    } else if err_count < id_count {
        StatusCode::MULTI_STATUS
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

/// Shared state of the admin API handlers.
pub struct ApiState<St, P> {
    pub store: Arc<St>,
    pub pusher: Arc<P>,
}

impl<St, P> Clone for ApiState<St, P> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            pusher: Arc::clone(&self.pusher),
        }
    }
}

fn split_ids(path: &str) -> Vec<String> {
    path.split(',')
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

async fn do_push<P: Pusher>(result: &mut ApiResult, pusher: &P, ids: &[String]) {
    match pusher.push(ids).await {
        Ok(responses) => {
            for (id, response) in responses {
                let entry = result.status.entry(id).or_default();
                if !response.id.is_empty() {
                    entry.push_id = Some(response.id);
                }
                entry.push_error = response.error;
            }
        }
        Err(err) => {
            tracing::info!(id_count = ids.len(), error = %err, "push");
            result.push_error = Some(err.to_string());
        }
    }
}

/// `POST /v1/push/<id,id,…>`: send APNs wakeups without enqueueing.
pub async fn push_handler<St, P>(
    State(state): State<ApiState<St, P>>,
    Path(ids): Path<String>,
) -> impl IntoResponse
where
    St: Send + Sync,
    P: Pusher,
{
    let ids = split_ids(&ids);
    let mut result = ApiResult::default();
    do_push(&mut result, state.pusher.as_ref(), &ids).await;
    (result_code(&result, ids.len()), Json(result))
}

/// `PUT /v1/enqueue/<id,id,…>?nopush=1`: enqueue a raw command plist and
/// (unless suppressed) push to the targeted enrollments.
pub async fn enqueue_handler<St, P>(
    State(state): State<ApiState<St, P>>,
    Path(ids): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> impl IntoResponse
where
    St: CommandEnqueuer,
    P: Pusher,
{
    let ids = split_ids(&ids);
    let no_push = params
        .get("nopush")
        .map(|v| !v.is_empty())
        .unwrap_or(false);
    let mut result = ApiResult {
        no_push,
        ..Default::default()
    };

    let command = match decode_command(&body) {
        Ok(command) => command,
        Err(err) => {
            tracing::info!(error = %err, "decoding command");
            result.enqueue_error = Some(err.to_string());
            return (StatusCode::BAD_REQUEST, Json(result));
        }
    };
    result.command_uuid = command.command_uuid.clone();
    result.request_type = command.command.request_type.clone();

    match state.store.enqueue_command(&ids, &command) {
        Ok(id_errors) => {
            for (id, err) in id_errors {
                result.status.entry(id).or_default().enqueue_error = Some(err.to_string());
            }
        }
        Err(err) => {
            tracing::info!(
                id_count = ids.len(),
                command_uuid = %result.command_uuid,
                error = %err,
                "enqueue"
            );
            result.enqueue_error = Some(err.to_string());
        }
    }

    if !no_push && result.enqueue_error.is_none() {
        do_push(&mut result, state.pusher.as_ref(), &ids).await;
    }

    (result_code(&result, ids.len()), Json(result))
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PushCertResult {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `PUT /v1/pushcert`: store a concatenated PEM certificate and private
/// key, e.g. `cat push.pem push.key | curl -T - …/v1/pushcert`.
pub async fn store_push_cert_handler<St, P>(
    State(state): State<ApiState<St, P>>,
    body: Bytes,
) -> impl IntoResponse
where
    St: PushCertStore,
    P: Send + Sync,
{
    let stored = aspen_crypto::split_pem_cert_and_key(&body)
        .and_then(|pair| state.store.store_push_cert(&pair.cert_pem, &pair.key_pem));
    match stored {
        Ok(topic) => {
            tracing::info!(topic = %topic, "stored push cert");
            (
                StatusCode::OK,
                Json(PushCertResult {
                    topic,
                    error: None,
                }),
            )
        }
        Err(err) => {
            tracing::info!(error = %err, "store push cert");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(PushCertResult {
                    topic: String::new(),
                    error: Some(err.to_string()),
                }),
            )
        }
    }
}

#[derive(Debug, Serialize)]
pub struct VersionInfo {
    pub version: String,
}

/// `GET /version`: the running build version.
pub async fn version_handler(State(version): State<Arc<String>>) -> impl IntoResponse {
    Json(VersionInfo {
        version: version.as_ref().clone(),
    })
}
