//! Multi-service fan-out.
//!
//! The primary service's return value and error are authoritative.
//! Secondary services run as detached tasks after the primary finishes, so
//! primary-request cancellation cannot drop their work; their errors are
//! only logged.

use std::sync::Arc;

use aspen_core::{
    Authenticate, BootstrapToken, CheckOut, Command, CommandResults, DeclarativeManagement,
    GetBootstrapToken, GetToken, GetTokenResponse, Request, SetBootstrapToken, TokenUpdate,
    UserAuthenticate,
};

use crate::{Checkin, CheckinAndCommand, CommandAndReportResults};

pub struct MultiService<P, S> {
    primary: P,
    secondary: Vec<Arc<S>>,
}

impl<P, S> MultiService<P, S> {
    pub fn new(primary: P, secondary: Vec<Arc<S>>) -> Self {
        Self { primary, secondary }
    }

    pub fn with_secondary(mut self, service: Arc<S>) -> Self {
        self.secondary.push(service);
        self
    }
}

macro_rules! fan_out {
    ($self:ident, $method:ident, $req:ident, $msg:ident) => {
        for (n, svc) in $self.secondary.iter().enumerate() {
            let svc = Arc::clone(svc);
            let req = $req.clone();
            let msg = $msg.clone();
            tokio::spawn(async move {
                if let Err(err) = svc.$method(&req, &msg).await {
                    tracing::warn!(service = n + 1, error = %err, "multi service");
                }
            });
        }
    };
}

impl<P, S> Checkin for MultiService<P, S>
where
    P: Checkin,
    S: CheckinAndCommand + 'static,
{
    async fn authenticate(
        &self,
        req: &Request,
        msg: &Authenticate,
    ) -> color_eyre::eyre::Result<()> {
        let result = self.primary.authenticate(req, msg).await;
        fan_out!(self, authenticate, req, msg);
        result
    }

    async fn token_update(
        &self,
        req: &Request,
        msg: &TokenUpdate,
    ) -> color_eyre::eyre::Result<()> {
        let result = self.primary.token_update(req, msg).await;
        fan_out!(self, token_update, req, msg);
        result
    }

    async fn checkout(&self, req: &Request, msg: &CheckOut) -> color_eyre::eyre::Result<()> {
        let result = self.primary.checkout(req, msg).await;
        fan_out!(self, checkout, req, msg);
        result
    }

    async fn user_authenticate(
        &self,
        req: &Request,
        msg: &UserAuthenticate,
    ) -> color_eyre::eyre::Result<Option<Vec<u8>>> {
        let result = self.primary.user_authenticate(req, msg).await;
        fan_out!(self, user_authenticate, req, msg);
        result
    }

    async fn set_bootstrap_token(
        &self,
        req: &Request,
        msg: &SetBootstrapToken,
    ) -> color_eyre::eyre::Result<()> {
        let result = self.primary.set_bootstrap_token(req, msg).await;
        fan_out!(self, set_bootstrap_token, req, msg);
        result
    }

    async fn get_bootstrap_token(
        &self,
        req: &Request,
        msg: &GetBootstrapToken,
    ) -> color_eyre::eyre::Result<Option<BootstrapToken>> {
        let result = self.primary.get_bootstrap_token(req, msg).await;
        fan_out!(self, get_bootstrap_token, req, msg);
        result
    }

    async fn declarative_management(
        &self,
        req: &Request,
        msg: &DeclarativeManagement,
    ) -> color_eyre::eyre::Result<Option<Vec<u8>>> {
        let result = self.primary.declarative_management(req, msg).await;
        fan_out!(self, declarative_management, req, msg);
        result
    }

    async fn get_token(
        &self,
        req: &Request,
        msg: &GetToken,
    ) -> color_eyre::eyre::Result<Option<GetTokenResponse>> {
        let result = self.primary.get_token(req, msg).await;
        fan_out!(self, get_token, req, msg);
        result
    }
}

impl<P, S> CommandAndReportResults for MultiService<P, S>
where
    P: CommandAndReportResults,
    S: CheckinAndCommand + 'static,
{
    async fn command_and_report_results(
        &self,
        req: &Request,
        results: &CommandResults,
    ) -> color_eyre::eyre::Result<Option<Command>> {
        let result = self.primary.command_and_report_results(req, results).await;
        fan_out!(self, command_and_report_results, req, results);
        result
    }
}
