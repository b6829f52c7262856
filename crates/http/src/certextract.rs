//! Client certificate extraction and verification middleware.
//!
//! Certificates reach the server three ways: the TLS peer certificate
//! forwarded by a terminating proxy as a URL-escaped PEM header, an RFC
//! 9440 header, or the `Mdm-Signature` header carrying a CMS detached
//! signature over the request body. These middlewares normalize all of
//! them into one request extension.

use std::sync::Arc;

use aspen_crypto::CertVerifier;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

/// DER-encoded client identity certificate extracted from the request.
#[derive(Debug, Clone)]
pub struct ClientCert(pub Vec<u8>);

/// Extract a certificate from a URL-escaped PEM (or RFC 9440) header set by
/// a TLS-terminating reverse proxy, e.g. Nginx' `$ssl_client_escaped_cert`.
///
/// Requests without the header pass through untouched; the handler decides
/// whether a missing certificate matters.
pub async fn cert_extract_header_middleware(
    State(header_name): State<Arc<String>>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(value) = request
        .headers()
        .get(header_name.as_str())
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        tracing::debug!(header = %header_name, "empty header");
        return next.run(request).await;
    };
    let extracted = if value.starts_with(':') {
        aspen_crypto::extract_rfc9440(&value)
    } else {
        aspen_crypto::extract_query_escaped_pem(&value)
    };
    match extracted {
        Ok(cert_der) => {
            request.extensions_mut().insert(ClientCert(cert_der));
            next.run(request).await
        }
        Err(err) => {
            tracing::info!(header = %header_name, error = %err, "extracting certificate");
            StatusCode::BAD_REQUEST.into_response()
        }
    }
}

/// Extract (and verify) the signer certificate from the `Mdm-Signature`
/// header.
///
/// Requests without the header pass through; a present-but-invalid
/// signature is a 400.
pub async fn cert_extract_mdm_signature_middleware(request: Request, next: Next) -> Response {
    let Some(signature) = request
        .headers()
        .get("Mdm-Signature")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        tracing::debug!("empty Mdm-Signature header");
        return next.run(request).await;
    };

    // signature verification needs the body; buffer and replace it
    let (parts, body) = request.into_parts();
    let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::info!(error = %err, "reading body");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    match aspen_crypto::verify_mdm_signature(&signature, &body_bytes) {
        Ok(cert_der) => {
            let mut request = Request::from_parts(parts, Body::from(body_bytes));
            request.extensions_mut().insert(ClientCert(cert_der));
            next.run(request).await
        }
        Err(err) => {
            tracing::info!(error = %err, "verifying Mdm-Signature header");
            StatusCode::BAD_REQUEST.into_response()
        }
    }
}

/// Check the extracted certificate against the configured trust anchors.
///
/// Replies 400 (never 401, which could unenroll the device) when the
/// certificate is missing or fails verification.
pub async fn cert_verify_middleware(
    State(verifier): State<Arc<dyn CertVerifier>>,
    request: Request,
    next: Next,
) -> Response {
    let result = match request.extensions().get::<ClientCert>() {
        Some(cert) => verifier.verify(&cert.0),
        None => Err(color_eyre::eyre::eyre!("missing MDM certificate")),
    };
    if let Err(err) = result {
        tracing::info!(error = %err, "verifying MDM certificate");
        return StatusCode::BAD_REQUEST.into_response();
    }
    next.run(request).await
}
