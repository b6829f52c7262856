//! Declarative Management HTTP caller.
//!
//! Brokers DM check-in messages to an external HTTP endpoint that speaks
//! the actual Declarative Management protocol.

use aspen_core::{DeclarativeManagement, HttpStatusError, Request};
use base64::Engine as _;
use color_eyre::eyre::WrapErr as _;
use hmac::{Hmac, Mac as _};
use sha2::Sha256;

use crate::DeclarativeManagementHandler;

const ENROLLMENT_ID_HEADER: &str = "X-Enrollment-ID";
const ENROLLMENT_TYPE_HEADER: &str = "X-Enrollment-Type";
const ENROLLMENT_PARENT_ID_HEADER: &str = "X-Enrollment-ParentID";

/// HTTP header carrying base64 HMAC-SHA256 body signatures.
pub const HMAC_HEADER: &str = "X-Hmac-Signature";

/// Calls out to an HTTP URL prefix for the Declarative Management protocol.
pub struct DmHttpCaller {
    url_prefix: reqwest::Url,
    client: reqwest::Client,
    sign_key: Option<Vec<u8>>,
    verify_key: Option<Vec<u8>>,
}

impl DmHttpCaller {
    pub fn new(url_prefix: &str) -> color_eyre::eyre::Result<Self> {
        Ok(Self {
            url_prefix: reqwest::Url::parse(url_prefix).wrap_err("parsing DM URL prefix")?,
            client: reqwest::Client::new(),
            sign_key: None,
            verify_key: None,
        })
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Sign request bodies with an HMAC-SHA256 of the shared secret.
    pub fn with_hmac_signing(mut self, key: Vec<u8>) -> Self {
        self.sign_key = Some(key);
        self
    }

    /// Verify response bodies against an HMAC-SHA256 of the shared secret.
    pub fn with_hmac_verification(mut self, key: Vec<u8>) -> Self {
        self.verify_key = Some(key);
        self
    }
}

fn hmac_b64(key: &[u8], body: &[u8]) -> color_eyre::eyre::Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|e| color_eyre::eyre::eyre!("HMAC key: {e}"))?;
    mac.update(body);
    Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

impl DeclarativeManagementHandler for DmHttpCaller {
    async fn declarative_management(
        &self,
        req: &Request,
        msg: &DeclarativeManagement,
    ) -> color_eyre::eyre::Result<Vec<u8>> {
        let id = req.require_enroll_id()?;
        let url = self
            .url_prefix
            .join(&msg.endpoint)
            .wrap_err("resolving DM endpoint URL")?;

        let data = msg.data().to_vec();
        let mut request = if data.is_empty() {
            self.client.get(url)
        } else {
            self.client
                .put(url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(data.clone())
        };
        request = request.header(ENROLLMENT_ID_HEADER, &id.id);
        request = request.header(ENROLLMENT_TYPE_HEADER, id.enroll_type.to_string());
        if let Some(parent) = &id.parent_id {
            request = request.header(ENROLLMENT_PARENT_ID_HEADER, parent);
        }
        if let Some(key) = &self.sign_key {
            request = request.header(HMAC_HEADER, hmac_b64(key, &data)?);
        }

        let response = request.send().await.wrap_err("sending DM request")?;
        let status = response.status();
        let signature = response
            .headers()
            .get(HMAC_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.wrap_err("reading DM response")?;

        if let Some(key) = &self.verify_key {
            let signature =
                signature.ok_or_else(|| color_eyre::eyre::eyre!("missing DM response HMAC"))?;
            if signature != hmac_b64(key, &body)? {
                color_eyre::eyre::bail!("DM response HMAC mismatch");
            }
        }

        if status.as_u16() != 200 {
            return Err(HttpStatusError::new(
                status.as_u16(),
                color_eyre::eyre::eyre!("unexpected DM HTTP status: {status}"),
            )
            .into());
        }
        Ok(body.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_is_deterministic_base64() {
        let a = hmac_b64(b"secret", b"body").unwrap();
        let b = hmac_b64(b"secret", b"body").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, hmac_b64(b"secret", b"other").unwrap());
        assert!(base64::engine::general_purpose::STANDARD
            .decode(&a)
            .is_ok());
    }
}
