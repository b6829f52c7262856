//! Webhook event service.
//!
//! A terminal service (normally composed as a multi-service secondary) that
//! posts a JSON event for every check-in message and command report to a
//! configured URL.

use std::collections::HashMap;
use std::sync::Arc;

use aspen_core::{
    Authenticate, BootstrapToken, CheckOut, Command, CommandResults, DeclarativeManagement,
    EnrollId, Enrollment, GetBootstrapToken, GetToken, GetTokenResponse, Request,
    SetBootstrapToken, TokenUpdate, UserAuthenticate,
};
use aspen_storage::TokenUpdateTallyStore;
use base64::Engine as _;
use color_eyre::eyre::WrapErr as _;
use hmac::{Hmac, Mac as _};
use serde::Serialize;
use sha2::Sha256;

use crate::dm::HMAC_HEADER;
use crate::{Checkin, CommandAndReportResults};

#[derive(Debug, Serialize)]
struct Ids<'a> {
    id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_id: Option<&'a str>,
    r#type: String,
}

impl<'a> From<&'a EnrollId> for Ids<'a> {
    fn from(eid: &'a EnrollId) -> Self {
        Self {
            id: &eid.id,
            parent_id: eid.parent_id.as_deref(),
            r#type: eid.enroll_type.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct CheckinEvent<'a> {
    ids: Ids<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    udid: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    enrollment_id: Option<&'a str>,
    raw_payload: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    url_params: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    token_update_tally: Option<i64>,
}

#[derive(Debug, Serialize)]
struct AcknowledgeEvent<'a> {
    ids: Ids<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    udid: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    enrollment_id: Option<&'a str>,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    command_uuid: Option<&'a str>,
    raw_payload: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    url_params: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
struct Event<'a> {
    topic: &'static str,
    created_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    checkin_event: Option<CheckinEvent<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    acknowledge_event: Option<AcknowledgeEvent<'a>>,
}

/// Webhook event sender.
pub struct Webhook {
    url: String,
    client: reqwest::Client,
    hmac_key: Option<Vec<u8>>,
    tally_store: Option<Arc<dyn TokenUpdateTallyStore>>,
}

impl Webhook {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
            hmac_key: None,
            tally_store: None,
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Sign event bodies with an HMAC-SHA256 of the shared secret.
    pub fn with_hmac_secret(mut self, key: Vec<u8>) -> Self {
        self.hmac_key = Some(key);
        self
    }

    /// Include the TokenUpdate tally in TokenUpdate events.
    pub fn with_token_update_tally(mut self, store: Arc<dyn TokenUpdateTallyStore>) -> Self {
        self.tally_store = Some(store);
        self
    }

    async fn send(&self, event: &Event<'_>) -> color_eyre::eyre::Result<()> {
        let body = serde_json::to_vec(event).wrap_err("encoding webhook event")?;
        let mut request = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json; charset=utf-8")
            .body(body.clone());
        if let Some(key) = &self.hmac_key {
            let mut mac = Hmac::<Sha256>::new_from_slice(key)
                .map_err(|e| color_eyre::eyre::eyre!("HMAC key: {e}"))?;
            mac.update(&body);
            let sig = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
            request = request.header(HMAC_HEADER, sig);
        }
        let response = request.send().await.wrap_err("sending webhook")?;
        if response.status().as_u16() != 200 {
            color_eyre::eyre::bail!("unexpected webhook HTTP status: {}", response.status());
        }
        Ok(())
    }

    async fn send_checkin(
        &self,
        topic: &'static str,
        req: &Request,
        enrollment: &Enrollment,
        raw: &[u8],
        with_tally: bool,
    ) -> color_eyre::eyre::Result<()> {
        let eid = enrollment.normalize()?;
        let tally = match (&self.tally_store, with_tally) {
            (Some(store), true) => Some(store.retrieve_token_update_tally(&eid.id)?),
            _ => None,
        };
        let event = Event {
            topic,
            created_at: chrono::Utc::now(),
            checkin_event: Some(CheckinEvent {
                ids: Ids::from(&eid),
                udid: enrollment.udid.as_deref(),
                enrollment_id: enrollment.enrollment_id.as_deref(),
                raw_payload: base64::engine::general_purpose::STANDARD.encode(raw),
                url_params: req.params.clone(),
                token_update_tally: tally,
            }),
            acknowledge_event: None,
        };
        self.send(&event).await
    }
}

impl Checkin for Webhook {
    async fn authenticate(
        &self,
        req: &Request,
        msg: &Authenticate,
    ) -> color_eyre::eyre::Result<()> {
        self.send_checkin("mdm.Authenticate", req, &msg.enrollment, &msg.raw, false)
            .await
    }

    async fn token_update(
        &self,
        req: &Request,
        msg: &TokenUpdate,
    ) -> color_eyre::eyre::Result<()> {
        self.send_checkin("mdm.TokenUpdate", req, &msg.enrollment, &msg.raw, true)
            .await
    }

    async fn checkout(&self, req: &Request, msg: &CheckOut) -> color_eyre::eyre::Result<()> {
        self.send_checkin("mdm.CheckOut", req, &msg.enrollment, &msg.raw, false)
            .await
    }

    async fn user_authenticate(
        &self,
        req: &Request,
        msg: &UserAuthenticate,
    ) -> color_eyre::eyre::Result<Option<Vec<u8>>> {
        self.send_checkin("mdm.UserAuthenticate", req, &msg.enrollment, &msg.raw, false)
            .await?;
        Ok(None)
    }

    async fn set_bootstrap_token(
        &self,
        req: &Request,
        msg: &SetBootstrapToken,
    ) -> color_eyre::eyre::Result<()> {
        self.send_checkin(
            "mdm.SetBootstrapToken",
            req,
            &msg.enrollment,
            &msg.raw,
            false,
        )
        .await
    }

    async fn get_bootstrap_token(
        &self,
        req: &Request,
        msg: &GetBootstrapToken,
    ) -> color_eyre::eyre::Result<Option<BootstrapToken>> {
        self.send_checkin(
            "mdm.GetBootstrapToken",
            req,
            &msg.enrollment,
            &msg.raw,
            false,
        )
        .await?;
        Ok(None)
    }

    async fn declarative_management(
        &self,
        req: &Request,
        msg: &DeclarativeManagement,
    ) -> color_eyre::eyre::Result<Option<Vec<u8>>> {
        self.send_checkin(
            "mdm.DeclarativeManagement",
            req,
            &msg.enrollment,
            &msg.raw,
            false,
        )
        .await?;
        Ok(None)
    }

    async fn get_token(
        &self,
        req: &Request,
        msg: &GetToken,
    ) -> color_eyre::eyre::Result<Option<GetTokenResponse>> {
        self.send_checkin("mdm.GetToken", req, &msg.enrollment, &msg.raw, false)
            .await?;
        Ok(None)
    }
}

impl CommandAndReportResults for Webhook {
    async fn command_and_report_results(
        &self,
        req: &Request,
        results: &CommandResults,
    ) -> color_eyre::eyre::Result<Option<Command>> {
        let eid = results.enrollment.normalize()?;
        let event = Event {
            topic: "mdm.Connect",
            created_at: chrono::Utc::now(),
            checkin_event: None,
            acknowledge_event: Some(AcknowledgeEvent {
                ids: Ids::from(&eid),
                udid: results.enrollment.udid.as_deref(),
                enrollment_id: results.enrollment.enrollment_id.as_deref(),
                status: results.status.to_string(),
                command_uuid: (!results.command_uuid.is_empty())
                    .then_some(results.command_uuid.as_str()),
                raw_payload: base64::engine::general_purpose::STANDARD.encode(&results.raw),
                url_params: req.params.clone(),
            }),
        };
        self.send(&event).await?;
        Ok(None)
    }
}
