//! The core MDM service: check-in state machine and command dispatch.

use std::sync::Arc;

use aspen_core::{
    Authenticate, BootstrapToken, CheckOut, Command, CommandResults, CommandStatus,
    DeclarativeManagement, Enrollment, GetBootstrapToken, GetToken, GetTokenResponse,
    HttpStatusError, Request, SetBootstrapToken, TokenUpdate, UserAuthenticate,
};
use aspen_storage::AllStorage;
use color_eyre::eyre::WrapErr as _;

use crate::{Checkin, CommandAndReportResults, DeclarativeManagementHandler, GetTokenHandler};

/// Canned reply to the first UserAuthenticate message when empty digest
/// challenges are enabled. The device accepts exactly this body.
const EMPTY_DIGEST_CHALLENGE: &[u8] = br#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>DigestChallenge</key>
    <string></string>
</dict>
</plist>"#;

/// Placeholder DM collaborator for engines without Declarative Management
/// configured.
pub struct UnconfiguredDm;

impl DeclarativeManagementHandler for UnconfiguredDm {
    async fn declarative_management(
        &self,
        _req: &Request,
        _msg: &DeclarativeManagement,
    ) -> color_eyre::eyre::Result<Vec<u8>> {
        color_eyre::eyre::bail!("no Declarative Management handler")
    }
}

/// The main MDM service, dispatching check-ins and command reports to
/// storage.
pub struct Engine<S, D = UnconfiguredDm> {
    store: S,
    dm: D,
    token_handler: Option<Arc<dyn GetTokenHandler>>,
    // By default the UserAuthenticate message is rejected with a 410. When
    // set, a static zero-length digest challenge is supplied to the first
    // UserAuthenticate check-in message instead.
    send_empty_digest_challenge: bool,
    store_rejected_user_auth: bool,
}

impl<S> Engine<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            dm: UnconfiguredDm,
            token_handler: None,
            send_empty_digest_challenge: false,
            store_rejected_user_auth: false,
        }
    }
}

impl<S, D> Engine<S, D> {
    /// Configure the Declarative Management collaborator.
    pub fn with_declarative_management<D2>(self, dm: D2) -> Engine<S, D2> {
        Engine {
            store: self.store,
            dm,
            token_handler: self.token_handler,
            send_empty_digest_challenge: self.send_empty_digest_challenge,
            store_rejected_user_auth: self.store_rejected_user_auth,
        }
    }

    /// Route GetToken messages through the given handler (usually a
    /// [`crate::TokenServiceTypeMux`]).
    pub fn with_get_token_handler(mut self, handler: Arc<dyn GetTokenHandler>) -> Self {
        self.token_handler = Some(handler);
        self
    }

    /// Reply to the first UserAuthenticate with an empty DigestChallenge
    /// instead of declining management.
    pub fn with_empty_digest_challenge(mut self) -> Self {
        self.send_empty_digest_challenge = true;
        self
    }

    /// Persist UserAuthenticate messages even when declining.
    pub fn with_store_rejected_user_auth(mut self) -> Self {
        self.store_rejected_user_auth = true;
        self
    }

    /// Derive the normalized request for this message's enrollment.
    fn normalized(
        &self,
        req: &Request,
        enrollment: &Enrollment,
    ) -> color_eyre::eyre::Result<Request> {
        if req.enroll_id.is_some() {
            tracing::debug!("overwriting enrollment id");
        }
        Ok(req.clone().with_enroll_id(enrollment.normalize()?))
    }
}

impl<S: AllStorage, D: DeclarativeManagementHandler> Checkin for Engine<S, D> {
    async fn authenticate(
        &self,
        req: &Request,
        msg: &Authenticate,
    ) -> color_eyre::eyre::Result<()> {
        let req = self.normalized(req, &msg.enrollment)?;
        let id = req.require_enroll_id()?;
        match &msg.serial_number {
            Some(serial) => tracing::info!(
                id = %id.id,
                r#type = %id.enroll_type,
                serial_number = %serial,
                "Authenticate"
            ),
            None => tracing::info!(id = %id.id, r#type = %id.enroll_type, "Authenticate"),
        }
        self.store
            .store_authenticate(&req, msg)
            .wrap_err("storing authenticate")?;
        // clear the command queue for the enrollment and any
        // sub-enrollments so nothing lingers from a prior enrollment
        self.store.clear_queue(&req).wrap_err("clearing queue")?;
        // then disable: an enrollment is only valid after a TokenUpdate
        self.store.disable(&req).wrap_err("disabling enrollment")
    }

    async fn token_update(
        &self,
        req: &Request,
        msg: &TokenUpdate,
    ) -> color_eyre::eyre::Result<()> {
        let req = self.normalized(req, &msg.enrollment)?;
        let id = req.require_enroll_id()?;
        tracing::info!(id = %id.id, r#type = %id.enroll_type, "TokenUpdate");
        self.store
            .store_token_update(&req, msg)
            .wrap_err("storing token update")
    }

    async fn checkout(&self, req: &Request, msg: &CheckOut) -> color_eyre::eyre::Result<()> {
        let req = self.normalized(req, &msg.enrollment)?;
        let id = req.require_enroll_id()?;
        tracing::info!(id = %id.id, r#type = %id.enroll_type, "CheckOut");
        self.store
            .store_checkout(&req, msg)
            .wrap_err("storing checkout")?;
        self.store.disable(&req).wrap_err("disabling enrollment")
    }

    async fn user_authenticate(
        &self,
        req: &Request,
        msg: &UserAuthenticate,
    ) -> color_eyre::eyre::Result<Option<Vec<u8>>> {
        let req = self.normalized(req, &msg.enrollment)?;
        let id = req.require_enroll_id()?;
        if self.send_empty_digest_challenge || self.store_rejected_user_auth {
            self.store
                .store_user_authenticate(&req, msg)
                .wrap_err("storing user authenticate")?;
        }
        // an empty DigestResponse is the first of the (up to) two
        // UserAuthenticate messages, depending on our response
        if msg.digest_response.is_empty() {
            if self.send_empty_digest_challenge {
                tracing::info!(
                    id = %id.id,
                    r#type = %id.enroll_type,
                    "sending empty DigestChallenge response to UserAuthenticate"
                );
                return Ok(Some(EMPTY_DIGEST_CHALLENGE.to_vec()));
            }
            return Err(HttpStatusError::new(
                410,
                color_eyre::eyre::eyre!("declining management of user: {}", id.id),
            )
            .into());
        }
        tracing::debug!(
            id = %id.id,
            r#type = %id.enroll_type,
            "sending empty response to second UserAuthenticate"
        );
        Ok(None)
    }

    async fn set_bootstrap_token(
        &self,
        req: &Request,
        msg: &SetBootstrapToken,
    ) -> color_eyre::eyre::Result<()> {
        let req = self.normalized(req, &msg.enrollment)?;
        let id = req.require_enroll_id()?;
        tracing::info!(id = %id.id, r#type = %id.enroll_type, "SetBootstrapToken");
        self.store
            .store_bootstrap_token(&req, msg)
            .wrap_err("storing bootstrap token")
    }

    async fn get_bootstrap_token(
        &self,
        req: &Request,
        msg: &GetBootstrapToken,
    ) -> color_eyre::eyre::Result<Option<BootstrapToken>> {
        let req = self.normalized(req, &msg.enrollment)?;
        let id = req.require_enroll_id()?;
        tracing::info!(id = %id.id, r#type = %id.enroll_type, "GetBootstrapToken");
        self.store
            .retrieve_bootstrap_token(&req, msg)
            .wrap_err("retrieving bootstrap token")
    }

    async fn declarative_management(
        &self,
        req: &Request,
        msg: &DeclarativeManagement,
    ) -> color_eyre::eyre::Result<Option<Vec<u8>>> {
        let req = self.normalized(req, &msg.enrollment)?;
        let id = req.require_enroll_id()?;
        tracing::info!(
            id = %id.id,
            r#type = %id.enroll_type,
            endpoint = %msg.endpoint,
            "DeclarativeManagement"
        );
        let body = self.dm.declarative_management(&req, msg).await?;
        Ok(Some(body))
    }

    async fn get_token(
        &self,
        req: &Request,
        msg: &GetToken,
    ) -> color_eyre::eyre::Result<Option<GetTokenResponse>> {
        let req = self.normalized(req, &msg.enrollment)?;
        let id = req.require_enroll_id()?;
        tracing::info!(
            id = %id.id,
            r#type = %id.enroll_type,
            service_type = %msg.token_service_type,
            "GetToken"
        );
        let handler = self
            .token_handler
            .as_ref()
            .ok_or_else(|| color_eyre::eyre::eyre!("no GetToken handler"))?;
        handler.get_token(&req, msg).map(Some)
    }
}

impl<S: AllStorage, D: DeclarativeManagementHandler> CommandAndReportResults for Engine<S, D> {
    async fn command_and_report_results(
        &self,
        req: &Request,
        results: &CommandResults,
    ) -> color_eyre::eyre::Result<Option<Command>> {
        let req = self.normalized(req, &results.enrollment)?;
        let id = req.require_enroll_id()?;
        if results.status == CommandStatus::Idle {
            tracing::info!(id = %id.id, r#type = %id.enroll_type, status = %results.status, "command report");
        } else {
            tracing::info!(
                id = %id.id,
                r#type = %id.enroll_type,
                status = %results.status,
                command_uuid = %results.command_uuid,
                "command report"
            );
        }
        self.store
            .store_command_report(&req, results)
            .wrap_err("storing command report")?;
        let next = self
            .store
            .retrieve_next_command(&req, results.status == CommandStatus::NotNow)
            .wrap_err("retrieving next command")?;
        match &next {
            Some(cmd) => {
                tracing::debug!(id = %id.id, command_uuid = %cmd.command_uuid, "command retrieved")
            }
            None => tracing::debug!(id = %id.id, "no command retrieved"),
        }
        Ok(next)
    }
}
