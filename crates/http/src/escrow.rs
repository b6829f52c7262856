//! Activation Lock "escrow key unlock" API.
//!
//! Sends a bypass-code unlock request to Apple's device services endpoint,
//! authenticating with the APNs TLS keypair stored for the given topic. See
//! <https://developer.apple.com/documentation/devicemanagement/creating-and-using-bypass-codes>

use std::collections::HashMap;
use std::sync::Arc;

use aspen_storage::PushCertStore;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Form;
use color_eyre::eyre::WrapErr as _;
use serde::Deserialize;

pub const ESCROW_KEY_UNLOCK_URL: &str =
    "https://deviceservices-external.apple.com/deviceservicesworkers/escrowKeyUnlock";

/// Parameters of an escrow key unlock request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EscrowKeyUnlockParams {
    /// Device serial number (required).
    #[serde(default)]
    pub serial: String,

    /// Device IMEI (omit for non-cellular devices).
    #[serde(default)]
    pub imei: String,

    /// Secondary IMEI (omit for non-cellular and single-SIM devices).
    #[serde(default)]
    pub imei2: String,

    /// Device MEID (omit for non-cellular devices).
    #[serde(default)]
    pub meid: String,

    /// Example: `iPad4,1` (required).
    #[serde(default, rename = "productType")]
    pub product_type: String,

    /// Auditing: name of the organization (required).
    #[serde(default, rename = "orgName")]
    pub org_name: String,

    /// Auditing: identifies the user requesting the removal, such as an
    /// email or LDAP ID (required).
    #[serde(default)]
    pub guid: String,

    /// The device's bypass code (required).
    #[serde(default, rename = "escrowKey")]
    pub escrow_key: String,
}

impl EscrowKeyUnlockParams {
    /// Whether all required fields are present.
    pub fn valid(&self) -> bool {
        !self.serial.is_empty()
            && !self.product_type.is_empty()
            && !self.org_name.is_empty()
            && !self.guid.is_empty()
            && !self.escrow_key.is_empty()
    }

    /// URL query parameters. Each device identifier uses its own key.
    pub fn query_params(&self) -> Vec<(&'static str, &str)> {
        let mut q = vec![
            ("serial", self.serial.as_str()),
            ("productType", self.product_type.as_str()),
        ];
        if !self.imei.is_empty() {
            q.push(("imei", &self.imei));
        }
        if !self.imei2.is_empty() {
            q.push(("imei2", &self.imei2));
        }
        if !self.meid.is_empty() {
            q.push(("meid", &self.meid));
        }
        q
    }

    /// Form (body) parameters.
    pub fn form_params(&self) -> Vec<(&'static str, &str)> {
        vec![
            ("orgName", &self.org_name),
            ("guid", &self.guid),
            ("escrowKey", &self.escrow_key),
        ]
    }
}

/// Send an escrow key unlock request to `url`, authenticating with the
/// push keypair stored for `topic`.
pub async fn escrow_key_unlock<S: PushCertStore>(
    store: &S,
    topic: &str,
    url: &str,
    params: &EscrowKeyUnlockParams,
) -> color_eyre::eyre::Result<(StatusCode, Vec<u8>)> {
    let cert = store
        .retrieve_push_cert(topic)
        .wrap_err("retrieving push cert")?
        .ok_or_else(|| color_eyre::eyre::eyre!("no push certificate for topic: {topic}"))?;
    let mut identity_pem = cert.cert_pem.clone();
    identity_pem.extend_from_slice(&cert.key_pem);
    let identity =
        reqwest::Identity::from_pem(&identity_pem).wrap_err("loading push certificate")?;
    let client = reqwest::Client::builder()
        .use_rustls_tls()
        .identity(identity)
        .build()
        .wrap_err("building mTLS client")?;

    let response = client
        .post(url)
        .query(&params.query_params())
        .form(&params.form_params())
        .send()
        .await
        .wrap_err("sending escrow key unlock")?;
    let status = StatusCode::from_u16(response.status().as_u16())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = response
        .bytes()
        .await
        .wrap_err("reading escrow key unlock response")?;
    Ok((status, body.to_vec()))
}

#[derive(Debug, Deserialize)]
pub struct EscrowKeyUnlockForm {
    #[serde(default)]
    pub topic: String,
    #[serde(flatten)]
    pub params: EscrowKeyUnlockParams,
}

/// `POST /v1/escrowkeyunlock`: proxy an Activation Lock bypass request to
/// Apple, relaying its status and body.
pub async fn escrow_key_unlock_handler<St, P>(
    State(state): State<crate::ApiState<St, P>>,
    Form(form): Form<EscrowKeyUnlockForm>,
) -> impl IntoResponse
where
    St: PushCertStore,
    P: Send + Sync,
{
    if !form.params.valid() {
        return error_json(StatusCode::BAD_REQUEST, "invalid or missing parameters");
    }
    if form.topic.is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "empty topic");
    }
    match escrow_key_unlock(
        state.store.as_ref(),
        &form.topic,
        ESCROW_KEY_UNLOCK_URL,
        &form.params,
    )
    .await
    {
        Ok((status, body)) => {
            tracing::debug!(
                serial = %form.params.serial,
                http_status = status.as_u16(),
                "escrow key unlock"
            );
            (status, body)
        }
        Err(err) => {
            tracing::info!(error = %err, "escrow key unlock");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "escrow key unlock failed")
        }
    }
}

fn error_json(status: StatusCode, message: &str) -> (StatusCode, Vec<u8>) {
    let mut body = HashMap::new();
    body.insert("error", message);
    (
        status,
        serde_json::to_vec(&body).unwrap_or_default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> EscrowKeyUnlockParams {
        EscrowKeyUnlockParams {
            serial: "S1".into(),
            product_type: "iPad4,1".into(),
            org_name: "Acme".into(),
            guid: "admin@example.com".into(),
            escrow_key: "KEY".into(),
            imei2: "356938035643810".into(),
            meid: "35693803564381".into(),
            ..Default::default()
        }
    }

    #[test]
    fn requires_all_mandatory_fields() {
        assert!(params().valid());
        let mut missing = params();
        missing.escrow_key.clear();
        assert!(!missing.valid());
    }

    #[test]
    fn device_identifiers_use_distinct_query_keys() {
        let p = params();
        let q = p.query_params();
        assert!(q.contains(&("imei2", "356938035643810")));
        assert!(q.contains(&("meid", "35693803564381")));
        assert!(!q.iter().any(|(k, _)| *k == "imei"));
    }
}
