//! Push traits.

use std::collections::HashMap;

use aspen_core::{Push, PushResponse};
use aspen_storage::PushCert;

/// Sends APNs wakeups to enrollment IDs.
///
/// The result map carries one entry per destination ID for which push info
/// was retrievable; per-destination failures live in the entries, not the
/// outer error.
#[trait_variant::make(Send)]
pub trait Pusher: Send + Sync {
    async fn push(
        &self,
        ids: &[String],
    ) -> color_eyre::eyre::Result<HashMap<String, PushResponse>>;
}

/// A connection to APNs authenticated with one topic's push certificate.
#[trait_variant::make(Send)]
pub trait PushProvider: Send + Sync {
    async fn push_one(&self, push: &Push) -> PushResponse;
}

/// Builds [`PushProvider`]s from stored push certificates.
pub trait PushProviderFactory: Send + Sync {
    type Provider: PushProvider + Send + Sync + 'static;

    fn new_provider(&self, cert: &PushCert) -> color_eyre::eyre::Result<Self::Provider>;
}
