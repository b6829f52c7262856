//! Device-facing MDM endpoints: check-in and command/report.

use std::collections::HashMap;
use std::sync::Arc;

use aspen_core::{
    decode_checkin, decode_command_results, find_in_chain, to_plist_xml, AuthError,
    CheckinMessage, HttpStatusError, InvalidCommand, ParseError, Request,
    UnrecognizedMessageType, ValidationError,
};
use aspen_service::{Checkin, CheckinAndCommand, CommandAndReportResults};
use axum::body::Bytes;
use axum::extract::{RawQuery, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;

use crate::ClientCert;

/// Content type of MDM check-in requests.
pub const CHECKIN_CONTENT_TYPE: &str = "application/x-apple-aspen-mdm-checkin";

/// Translate a service-chain error into the HTTP status the protocol
/// mandates.
///
/// Client-caused failures (malformed plists, unknown message types, cert
/// binding mismatches) map to 400; cert mismatches deliberately avoid 401,
/// which could trigger device-side unenrollment. An [`HttpStatusError`]
/// anywhere in the chain wins.
pub fn error_status(err: &color_eyre::eyre::Report) -> StatusCode {
    if let Some(status) = find_in_chain::<HttpStatusError>(err) {
        return StatusCode::from_u16(status.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    }
    let client_error = find_in_chain::<ParseError>(err).is_some()
        || find_in_chain::<UnrecognizedMessageType>(err).is_some()
        || find_in_chain::<InvalidCommand>(err).is_some()
        || find_in_chain::<ValidationError>(err).is_some()
        || find_in_chain::<AuthError>(err).is_some();
    if client_error {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

fn log_service_error(context: &str, err: &color_eyre::eyre::Report, status: StatusCode) {
    if let Some(parse) = find_in_chain::<ParseError>(err) {
        tracing::info!(
            http_status = status.as_u16(),
            error = %err,
            content = %String::from_utf8_lossy(&parse.content),
            "{context}"
        );
    } else {
        tracing::info!(http_status = status.as_u16(), error = %err, "{context}");
    }
}

fn mdm_request(cert: Option<ClientCert>, query: Option<String>) -> Request {
    let params: HashMap<String, String> = query
        .as_deref()
        .map(|q| {
            q.split('&')
                .filter(|kv| !kv.is_empty())
                .map(|kv| match kv.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (kv.to_string(), String::new()),
                })
                .collect()
        })
        .unwrap_or_default();
    let mut req = Request::new().with_params(params);
    if let Some(cert) = cert {
        req = req.with_certificate(cert.0);
    }
    req
}

/// Decode a check-in body and dispatch it to the service, returning the
/// response body for the device.
pub async fn checkin_request<S: Checkin>(
    svc: &S,
    req: &Request,
    body: &[u8],
) -> color_eyre::eyre::Result<Vec<u8>> {
    use color_eyre::eyre::WrapErr as _;

    let response = match decode_checkin(body)? {
        CheckinMessage::Authenticate(m) => {
            svc.authenticate(req, &m)
                .await
                .wrap_err("authenticate service")?;
            None
        }
        CheckinMessage::TokenUpdate(m) => {
            svc.token_update(req, &m)
                .await
                .wrap_err("tokenupdate service")?;
            None
        }
        CheckinMessage::CheckOut(m) => {
            svc.checkout(req, &m).await.wrap_err("checkout service")?;
            None
        }
        CheckinMessage::UserAuthenticate(m) => svc
            .user_authenticate(req, &m)
            .await
            .wrap_err("userauthenticate service")?,
        CheckinMessage::SetBootstrapToken(m) => {
            svc.set_bootstrap_token(req, &m)
                .await
                .wrap_err("setbootstraptoken service")?;
            None
        }
        CheckinMessage::GetBootstrapToken(m) => svc
            .get_bootstrap_token(req, &m)
            .await
            .wrap_err("getbootstraptoken service")?
            .map(|token| to_plist_xml(&token))
            .transpose()?,
        CheckinMessage::DeclarativeManagement(m) => svc
            .declarative_management(req, &m)
            .await
            .wrap_err("declarativemanagement service")?,
        CheckinMessage::GetToken(m) => svc
            .get_token(req, &m)
            .await
            .wrap_err("gettoken service")?
            .map(|token| to_plist_xml(&token))
            .transpose()?,
    };
    Ok(response.unwrap_or_default())
}

/// Handle MDM check-in requests.
pub async fn checkin_handler<S>(
    State(service): State<Arc<S>>,
    cert: Option<axum::Extension<ClientCert>>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> impl IntoResponse
where
    S: Checkin,
{
    let req = mdm_request(cert.map(|axum::Extension(c)| c), query);
    match checkin_request(service.as_ref(), &req, &body).await {
        Ok(response) => (StatusCode::OK, response),
        Err(err) => {
            let status = error_status(&err);
            log_service_error("check-in request", &err, status);
            (status, Vec::new())
        }
    }
}

/// Handle command/report-results requests, replying with the next queued
/// command (or nothing).
pub async fn command_handler<S>(
    State(service): State<Arc<S>>,
    cert: Option<axum::Extension<ClientCert>>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> impl IntoResponse
where
    S: CommandAndReportResults,
{
    let req = mdm_request(cert.map(|axum::Extension(c)| c), query);
    let result = async {
        use color_eyre::eyre::WrapErr as _;
        let results = decode_command_results(&body)?;
        service
            .command_and_report_results(&req, &results)
            .await
            .wrap_err("command and report results service")
    }
    .await;
    match result {
        Ok(Some(cmd)) => (StatusCode::OK, cmd.raw),
        Ok(None) => (StatusCode::OK, Vec::new()),
        Err(err) => {
            let status = error_status(&err);
            log_service_error("command report results", &err, status);
            (status, Vec::new())
        }
    }
}

/// Handle both check-in and command requests on one endpoint, dispatched by
/// Content-Type.
pub async fn checkin_and_command_handler<S>(
    state: State<Arc<S>>,
    headers: HeaderMap,
    cert: Option<axum::Extension<ClientCert>>,
    query: RawQuery,
    body: Bytes,
) -> axum::response::Response
where
    S: CheckinAndCommand,
{
    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if content_type.starts_with(CHECKIN_CONTENT_TYPE) {
        checkin_handler(state, cert, query, body).await.into_response()
    } else {
        // a non-check-in request is assumed to be a command request
        command_handler(state, cert, query, body).await.into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_error_wins() {
        let err: color_eyre::eyre::Report =
            HttpStatusError::new(410, color_eyre::eyre::eyre!("declined")).into();
        assert_eq!(error_status(&err), StatusCode::GONE);
    }

    #[test]
    fn parse_errors_are_bad_request() {
        let err = decode_checkin(b"junk").unwrap_err();
        assert_eq!(error_status(&err), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn other_errors_are_internal() {
        let err = color_eyre::eyre::eyre!("backend exploded");
        assert_eq!(error_status(&err), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
