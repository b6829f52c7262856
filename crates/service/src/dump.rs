//! Raw request/response dumping decorator.

use std::io::Write;
use std::sync::Mutex;

use aspen_core::{
    Authenticate, BootstrapToken, CheckOut, Command, CommandResults, DeclarativeManagement,
    GetBootstrapToken, GetToken, GetTokenResponse, Request, SetBootstrapToken, TokenUpdate,
    UserAuthenticate,
};
use base64::Engine as _;

use crate::{Checkin, CommandAndReportResults};

/// Middleware that dumps raw MDM request (and some response) bodies to a
/// writer, usually stdout.
pub struct Dumper<N, W: Write + Send> {
    next: N,
    w: Mutex<W>,
}

impl<N, W: Write + Send> Dumper<N, W> {
    pub fn new(next: N, w: W) -> Self {
        Self {
            next,
            w: Mutex::new(w),
        }
    }

    fn dump(&self, bytes: &[u8]) {
        let mut w = self.w.lock().unwrap_or_else(|e| e.into_inner());
        let _ = w.write_all(bytes);
        let _ = w.write_all(b"\n");
    }
}

impl<N: Checkin, W: Write + Send + Sync> Checkin for Dumper<N, W> {
    async fn authenticate(
        &self,
        req: &Request,
        msg: &Authenticate,
    ) -> color_eyre::eyre::Result<()> {
        self.dump(&msg.raw);
        self.next.authenticate(req, msg).await
    }

    async fn token_update(
        &self,
        req: &Request,
        msg: &TokenUpdate,
    ) -> color_eyre::eyre::Result<()> {
        self.dump(&msg.raw);
        self.next.token_update(req, msg).await
    }

    async fn checkout(&self, req: &Request, msg: &CheckOut) -> color_eyre::eyre::Result<()> {
        self.dump(&msg.raw);
        self.next.checkout(req, msg).await
    }

    async fn user_authenticate(
        &self,
        req: &Request,
        msg: &UserAuthenticate,
    ) -> color_eyre::eyre::Result<Option<Vec<u8>>> {
        self.dump(&msg.raw);
        let resp = self.next.user_authenticate(req, msg).await?;
        if let Some(body) = &resp {
            self.dump(body);
        }
        Ok(resp)
    }

    async fn set_bootstrap_token(
        &self,
        req: &Request,
        msg: &SetBootstrapToken,
    ) -> color_eyre::eyre::Result<()> {
        self.dump(&msg.raw);
        self.next.set_bootstrap_token(req, msg).await
    }

    async fn get_bootstrap_token(
        &self,
        req: &Request,
        msg: &GetBootstrapToken,
    ) -> color_eyre::eyre::Result<Option<BootstrapToken>> {
        self.dump(&msg.raw);
        let token = self.next.get_bootstrap_token(req, msg).await?;
        if let Some(token) = &token {
            let b64 = base64::engine::general_purpose::STANDARD.encode(&token.bootstrap_token);
            self.dump(format!("Bootstrap token: {b64}").as_bytes());
        }
        Ok(token)
    }

    async fn declarative_management(
        &self,
        req: &Request,
        msg: &DeclarativeManagement,
    ) -> color_eyre::eyre::Result<Option<Vec<u8>>> {
        self.dump(&msg.raw);
        if !msg.data().is_empty() {
            self.dump(msg.data());
        }
        let resp = self.next.declarative_management(req, msg).await?;
        if let Some(body) = &resp {
            self.dump(body);
        }
        Ok(resp)
    }

    async fn get_token(
        &self,
        req: &Request,
        msg: &GetToken,
    ) -> color_eyre::eyre::Result<Option<GetTokenResponse>> {
        self.dump(&msg.raw);
        let token = self.next.get_token(req, msg).await?;
        if let Some(token) = &token {
            let b64 = base64::engine::general_purpose::STANDARD.encode(&token.token_data);
            self.dump(format!("GetToken TokenData: {b64}").as_bytes());
        }
        Ok(token)
    }
}

impl<N: CommandAndReportResults, W: Write + Send + Sync> CommandAndReportResults
    for Dumper<N, W>
{
    async fn command_and_report_results(
        &self,
        req: &Request,
        results: &CommandResults,
    ) -> color_eyre::eyre::Result<Option<Command>> {
        self.dump(&results.raw);
        let cmd = self.next.command_and_report_results(req, results).await?;
        if let Some(cmd) = &cmd {
            self.dump(&cmd.raw);
        }
        Ok(cmd)
    }
}
