//! APNs HTTP/2 client.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use aspen_core::{Push, PushResponse};
use aspen_storage::PushCert;
use color_eyre::eyre::WrapErr as _;

use crate::{PushProvider, PushProviderFactory};

const PRODUCTION_ENDPOINT: &str = "https://api.push.apple.com";

/// How much of a non-200 APNs response body is preserved in the error.
const ERROR_BODY_PREFIX: usize = 256;

/// Builds [`ApnsProvider`]s with an mTLS identity from the stored PEM
/// certificate and key.
pub struct ApnsProviderFactory {
    endpoint: String,
    expiration: Option<Duration>,
}

impl Default for ApnsProviderFactory {
    fn default() -> Self {
        Self {
            endpoint: PRODUCTION_ENDPOINT.to_string(),
            expiration: None,
        }
    }
}

impl ApnsProviderFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the APNs endpoint (tests, proxies).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Set the `apns-expiration` offset on outgoing notifications.
    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }
}

impl PushProviderFactory for ApnsProviderFactory {
    type Provider = ApnsProvider;

    fn new_provider(&self, cert: &PushCert) -> color_eyre::eyre::Result<ApnsProvider> {
        let mut identity_pem = cert.cert_pem.clone();
        identity_pem.extend_from_slice(&cert.key_pem);
        let identity =
            reqwest::Identity::from_pem(&identity_pem).wrap_err("loading push certificate")?;
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .identity(identity)
            .http2_prior_knowledge()
            .build()
            .wrap_err("building APNs client")?;
        Ok(ApnsProvider {
            client,
            endpoint: self.endpoint.clone(),
            expiration: self.expiration,
        })
    }
}

/// An APNs HTTP/2 connection for one push topic.
pub struct ApnsProvider {
    client: reqwest::Client,
    endpoint: String,
    expiration: Option<Duration>,
}

impl PushProvider for ApnsProvider {
    async fn push_one(&self, push: &Push) -> PushResponse {
        let url = format!("{}/3/device/{}", self.endpoint, push.token_hex());
        let payload = format!(r#"{{"mdm":"{}"}}"#, push.push_magic);
        let mut request = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload);
        if let Some(expiration) = self.expiration {
            let expires = SystemTime::now() + expiration;
            let unix = expires
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            request = request.header("apns-expiration", unix.to_string());
        }
        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => return PushResponse::failure(err),
        };
        let status = response.status();
        if status.as_u16() != 200 {
            let body = response.bytes().await.unwrap_or_default();
            let prefix = String::from_utf8_lossy(&body[..body.len().min(ERROR_BODY_PREFIX)])
                .into_owned();
            return PushResponse::failure(format!("invalid status code: {status}: {prefix}"));
        }
        let apns_id = response
            .headers()
            .get("apns-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        PushResponse::success(apns_id)
    }
}
