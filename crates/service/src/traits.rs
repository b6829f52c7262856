//! Service traits.

use aspen_core::{
    Authenticate, BootstrapToken, CheckOut, Command, CommandResults, DeclarativeManagement,
    GetBootstrapToken, GetToken, GetTokenResponse, Request, SetBootstrapToken, TokenUpdate,
    UserAuthenticate,
};

/// Check-in message service.
///
/// Implementations normalize the enrollment identity from each message
/// themselves; the incoming [`Request`] carries transport facts only
/// (certificate, URL parameters).
#[trait_variant::make(Send)]
pub trait Checkin: Send + Sync {
    async fn authenticate(&self, req: &Request, msg: &Authenticate)
        -> color_eyre::eyre::Result<()>;

    async fn token_update(&self, req: &Request, msg: &TokenUpdate)
        -> color_eyre::eyre::Result<()>;

    async fn checkout(&self, req: &Request, msg: &CheckOut) -> color_eyre::eyre::Result<()>;

    /// Returns a response body (a DigestChallenge plist) or `None` for an
    /// empty reply.
    async fn user_authenticate(
        &self,
        req: &Request,
        msg: &UserAuthenticate,
    ) -> color_eyre::eyre::Result<Option<Vec<u8>>>;

    async fn set_bootstrap_token(
        &self,
        req: &Request,
        msg: &SetBootstrapToken,
    ) -> color_eyre::eyre::Result<()>;

    async fn get_bootstrap_token(
        &self,
        req: &Request,
        msg: &GetBootstrapToken,
    ) -> color_eyre::eyre::Result<Option<BootstrapToken>>;

    /// Returns the raw DM response body to hand back to the device.
    async fn declarative_management(
        &self,
        req: &Request,
        msg: &DeclarativeManagement,
    ) -> color_eyre::eyre::Result<Option<Vec<u8>>>;

    async fn get_token(
        &self,
        req: &Request,
        msg: &GetToken,
    ) -> color_eyre::eyre::Result<Option<GetTokenResponse>>;
}

/// Command-report service: stores the report and returns the next queued
/// command, if any.
#[trait_variant::make(Send)]
pub trait CommandAndReportResults: Send + Sync {
    async fn command_and_report_results(
        &self,
        req: &Request,
        results: &CommandResults,
    ) -> color_eyre::eyre::Result<Option<Command>>;
}

/// Combined check-in and command service.
pub trait CheckinAndCommand: Checkin + CommandAndReportResults {}

impl<T: Checkin + CommandAndReportResults> CheckinAndCommand for T {}

/// Collaborator brokering the Declarative Management protocol.
#[trait_variant::make(Send)]
pub trait DeclarativeManagementHandler: Send + Sync {
    async fn declarative_management(
        &self,
        req: &Request,
        msg: &DeclarativeManagement,
    ) -> color_eyre::eyre::Result<Vec<u8>>;
}

/// Handler for one GetToken service type.
///
/// Handlers are small lookups, so the trait is synchronous and object-safe;
/// the mux holds them behind `Arc<dyn GetTokenHandler>`.
pub trait GetTokenHandler: Send + Sync {
    fn get_token(
        &self,
        req: &Request,
        msg: &GetToken,
    ) -> color_eyre::eyre::Result<GetTokenResponse>;
}
