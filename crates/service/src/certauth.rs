//! Certificate-authentication middleware.
//!
//! Binds an enrollment to its client certificate's SHA-256 fingerprint the
//! first time the enrollment appears (Authenticate) and enforces the
//! binding on every subsequent request. Associations are keyed by the
//! device-channel ID, so user-channel requests authenticate against their
//! parent device's binding.

use aspen_core::{
    AuthError, Authenticate, BootstrapToken, CheckOut, Command, CommandResults,
    DeclarativeManagement, EnrollId, Enrollment, GetBootstrapToken, GetToken, GetTokenResponse,
    Request, SetBootstrapToken, TokenUpdate, UserAuthenticate,
};
use aspen_storage::CertAuthStore;
use color_eyre::eyre::WrapErr as _;

use crate::{Checkin, CommandAndReportResults};

/// Certificate-auth middleware wrapping another service.
pub struct CertAuthMiddleware<S, N> {
    store: S,
    next: N,
    // Associate an enrollment missing a binding on first use instead of
    // rejecting it. Useful when moving devices between servers.
    allow_retroactive: bool,
}

impl<S, N> CertAuthMiddleware<S, N> {
    pub fn new(store: S, next: N) -> Self {
        Self {
            store,
            next,
            allow_retroactive: false,
        }
    }

    /// Allow retroactive association for enrollments with no existing
    /// binding.
    pub fn with_retroactive(mut self) -> Self {
        self.allow_retroactive = true;
        self
    }
}

impl<S: CertAuthStore, N> CertAuthMiddleware<S, N> {
    /// Associations are scoped to the device channel.
    fn device_channel_request(
        &self,
        req: &Request,
        enrollment: &Enrollment,
    ) -> color_eyre::eyre::Result<(Request, String)> {
        let id = enrollment.normalize()?;
        let device_id = EnrollId {
            enroll_type: id.enroll_type,
            id: id.device_channel_id().to_string(),
            parent_id: None,
        };
        let hash = match &req.certificate {
            Some(cert_der) => aspen_crypto::cert_hash(cert_der),
            None => return Err(AuthError::MissingCertificate.into()),
        };
        Ok((req.clone().with_enroll_id(device_id), hash))
    }

    /// Associate a new enrollment's certificate on Authenticate. An
    /// existing binding is overwritten (re-enrollment is a legitimate
    /// rotation), but a hash already bound to a different enrollment is
    /// rejected.
    fn associate_new_enrollment(
        &self,
        req: &Request,
        enrollment: &Enrollment,
    ) -> color_eyre::eyre::Result<()> {
        let (req, hash) = self.device_channel_request(req, enrollment)?;
        if self
            .store
            .has_cert_hash(&req, &hash)
            .wrap_err("checking cert hash")?
            && !self
                .store
                .is_cert_hash_associated(&req, &hash)
                .wrap_err("checking association")?
        {
            return Err(AuthError::HashBoundElsewhere.into());
        }
        tracing::debug!(
            id = %req.require_enroll_id()?.id,
            hash = %hash,
            "cert associated"
        );
        self.store
            .associate_cert_hash(&req, &hash)
            .wrap_err("associating cert hash")
    }

    /// Validate an existing enrollment's certificate binding; with
    /// retroactive mode, associate a missing binding once.
    fn validate_existing_enrollment(
        &self,
        req: &Request,
        enrollment: &Enrollment,
    ) -> color_eyre::eyre::Result<()> {
        let (req, hash) = self.device_channel_request(req, enrollment)?;
        let id = req.require_enroll_id()?.id.clone();
        if !self
            .store
            .enrollment_has_cert_hash(&req)
            .wrap_err("checking enrollment cert hash")?
        {
            if !self.allow_retroactive {
                return Err(AuthError::NoAssociation(id).into());
            }
            if self
                .store
                .has_cert_hash(&req, &hash)
                .wrap_err("checking cert hash")?
            {
                return Err(AuthError::HashBoundElsewhere.into());
            }
            tracing::debug!(id = %id, hash = %hash, "cert retroactively associated");
            return self
                .store
                .associate_cert_hash(&req, &hash)
                .wrap_err("associating cert hash");
        }
        if !self
            .store
            .is_cert_hash_associated(&req, &hash)
            .wrap_err("checking association")?
        {
            return Err(AuthError::CertMismatch(id).into());
        }
        Ok(())
    }
}

impl<S: CertAuthStore, N: Checkin> Checkin for CertAuthMiddleware<S, N> {
    async fn authenticate(
        &self,
        req: &Request,
        msg: &Authenticate,
    ) -> color_eyre::eyre::Result<()> {
        self.associate_new_enrollment(req, &msg.enrollment)
            .wrap_err("cert auth: new enrollment")?;
        self.next.authenticate(req, msg).await
    }

    async fn token_update(
        &self,
        req: &Request,
        msg: &TokenUpdate,
    ) -> color_eyre::eyre::Result<()> {
        self.validate_existing_enrollment(req, &msg.enrollment)
            .wrap_err("cert auth: existing enrollment")?;
        self.next.token_update(req, msg).await
    }

    async fn checkout(&self, req: &Request, msg: &CheckOut) -> color_eyre::eyre::Result<()> {
        self.validate_existing_enrollment(req, &msg.enrollment)
            .wrap_err("cert auth: existing enrollment")?;
        self.next.checkout(req, msg).await
    }

    async fn user_authenticate(
        &self,
        req: &Request,
        msg: &UserAuthenticate,
    ) -> color_eyre::eyre::Result<Option<Vec<u8>>> {
        self.validate_existing_enrollment(req, &msg.enrollment)
            .wrap_err("cert auth: existing enrollment")?;
        self.next.user_authenticate(req, msg).await
    }

    async fn set_bootstrap_token(
        &self,
        req: &Request,
        msg: &SetBootstrapToken,
    ) -> color_eyre::eyre::Result<()> {
        self.validate_existing_enrollment(req, &msg.enrollment)
            .wrap_err("cert auth: existing enrollment")?;
        self.next.set_bootstrap_token(req, msg).await
    }

    async fn get_bootstrap_token(
        &self,
        req: &Request,
        msg: &GetBootstrapToken,
    ) -> color_eyre::eyre::Result<Option<BootstrapToken>> {
        self.validate_existing_enrollment(req, &msg.enrollment)
            .wrap_err("cert auth: existing enrollment")?;
        self.next.get_bootstrap_token(req, msg).await
    }

    async fn declarative_management(
        &self,
        req: &Request,
        msg: &DeclarativeManagement,
    ) -> color_eyre::eyre::Result<Option<Vec<u8>>> {
        self.validate_existing_enrollment(req, &msg.enrollment)
            .wrap_err("cert auth: existing enrollment")?;
        self.next.declarative_management(req, msg).await
    }

    async fn get_token(
        &self,
        req: &Request,
        msg: &GetToken,
    ) -> color_eyre::eyre::Result<Option<GetTokenResponse>> {
        self.validate_existing_enrollment(req, &msg.enrollment)
            .wrap_err("cert auth: existing enrollment")?;
        self.next.get_token(req, msg).await
    }
}

impl<S: CertAuthStore, N: CommandAndReportResults> CommandAndReportResults
    for CertAuthMiddleware<S, N>
{
    async fn command_and_report_results(
        &self,
        req: &Request,
        results: &CommandResults,
    ) -> color_eyre::eyre::Result<Option<Command>> {
        self.validate_existing_enrollment(req, &results.enrollment)
            .wrap_err("cert auth: existing enrollment")?;
        self.next.command_and_report_results(req, results).await
    }
}
