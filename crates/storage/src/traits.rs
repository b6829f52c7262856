//! Storage traits.
//!
//! All operations are scoped by the normalized enrollment ID carried in the
//! [`Request`]. Backends are responsible for their own locking and
//! transactions; enqueue and report operations must be atomic per
//! (enrollment ID, command UUID).

use std::collections::HashMap;

use aspen_core::{
    Authenticate, BootstrapToken, CheckOut, CheckinMessage, Command, CommandResults,
    GetBootstrapToken, Push, Request, SetBootstrapToken, TokenUpdate, UserAuthenticate,
};
use thiserror::Error;

/// Operation attempted on a user channel that only makes sense on the
/// device channel (bootstrap tokens, disable, queue clearing).
#[derive(Debug, Clone, Copy, Error)]
#[error("enrollment is not a device channel")]
pub struct DeviceChannelOnly;

/// Stores MDM check-in data.
pub trait CheckinStore: Send + Sync {
    /// Store the Authenticate message: raw plist, identity certificate, and
    /// nice-to-have device attributes. Clears any escrowed bootstrap token.
    fn store_authenticate(&self, req: &Request, msg: &Authenticate)
        -> color_eyre::eyre::Result<()>;

    /// Store the TokenUpdate message. Storing the first TokenUpdate
    /// represents a successful enrollment: the enrollment becomes enabled,
    /// the tally increments, and the enrolled-at timestamp is set on the
    /// first tally. Both device and user channels receive TokenUpdates.
    fn store_token_update(&self, req: &Request, msg: &TokenUpdate)
        -> color_eyre::eyre::Result<()>;

    /// Store a UserAuthenticate message (with or without DigestResponse).
    fn store_user_authenticate(
        &self,
        req: &Request,
        msg: &UserAuthenticate,
    ) -> color_eyre::eyre::Result<()>;

    /// Store the CheckOut message. Disabling is a separate step.
    fn store_checkout(&self, req: &Request, msg: &CheckOut) -> color_eyre::eyre::Result<()>;

    /// Disable the enrollment. Device-channel only; disabling a device also
    /// disables every user channel whose parent is this device, and resets
    /// their token-update tallies.
    fn disable(&self, req: &Request) -> color_eyre::eyre::Result<()>;
}

/// Stores and retrieves MDM command queue data.
pub trait CommandQueueStore: Send + Sync {
    /// Record a command report. `Idle` reports never mutate the queue.
    /// `NotNow` records the first-NotNow timestamp (first-only) and bumps
    /// the per-command NotNow tally. Terminal statuses finalize the per-ID
    /// attachment.
    fn store_command_report(
        &self,
        req: &Request,
        report: &CommandResults,
    ) -> color_eyre::eyre::Result<()>;

    /// The oldest active command whose status is pending, or additionally
    /// NotNow when `skip_not_now` is false. `None` when the queue is empty.
    fn retrieve_next_command(
        &self,
        req: &Request,
        skip_not_now: bool,
    ) -> color_eyre::eyre::Result<Option<Command>>;

    /// Mark all pending or NotNow attachments inactive for this device and
    /// its user-channel children. Terminal results are preserved.
    /// Device-channel only.
    fn clear_queue(&self, req: &Request) -> color_eyre::eyre::Result<()>;
}

/// Per-enrollment errors from a partially-failed enqueue, keyed by ID.
pub type EnqueueIdErrors = HashMap<String, color_eyre::eyre::Report>;

/// Enqueues MDM commands.
pub trait CommandEnqueuer: Send + Sync {
    /// Persist the command body once and attach it to each ID's queue.
    /// Per-ID failures land in the returned map; a whole-batch failure is
    /// the outer error.
    fn enqueue_command(
        &self,
        ids: &[String],
        cmd: &Command,
    ) -> color_eyre::eyre::Result<EnqueueIdErrors>;
}

/// Retrieves APNs push data.
pub trait PushInfoStore: Send + Sync {
    /// Push data for the given IDs. IDs that are unknown, disabled, or not
    /// fully enrolled are silently absent from the result; callers reconcile
    /// the map against their input.
    fn retrieve_push_info(
        &self,
        ids: &[String],
    ) -> color_eyre::eyre::Result<HashMap<String, Push>>;
}

/// A stored APNs push certificate.
#[derive(Debug, Clone)]
pub struct PushCert {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
    /// Opaque marker that changes whenever the cert/key changes; used to
    /// invalidate cached push providers.
    pub stale_token: String,
}

/// Stores and retrieves APNs push certificates, keyed by topic.
pub trait PushCertStore: Send + Sync {
    /// Store a PEM certificate and private key, returning the topic decoded
    /// from the certificate's UID attribute. Re-storing a topic must change
    /// its stale token.
    fn store_push_cert(&self, pem_cert: &[u8], pem_key: &[u8])
        -> color_eyre::eyre::Result<String>;

    fn retrieve_push_cert(&self, topic: &str) -> color_eyre::eyre::Result<Option<PushCert>>;

    /// Whether `stale_token` no longer matches the stored certificate.
    fn is_push_cert_stale(
        &self,
        topic: &str,
        stale_token: &str,
    ) -> color_eyre::eyre::Result<bool>;
}

/// Stores cert-to-enrollment associations.
///
/// The request enrollment ID is normalized to the device channel by the
/// cert-auth middleware. The hash is the lowercase-hex SHA-256 of the
/// certificate DER.
pub trait CertAuthStore: Send + Sync {
    /// Whether `hash` has ever been associated to any enrollment.
    fn has_cert_hash(&self, req: &Request, hash: &str) -> color_eyre::eyre::Result<bool>;

    /// Whether the request's enrollment has any hash associated.
    fn enrollment_has_cert_hash(&self, req: &Request) -> color_eyre::eyre::Result<bool>;

    /// Whether the request's enrollment is associated to exactly `hash`.
    fn is_cert_hash_associated(&self, req: &Request, hash: &str)
        -> color_eyre::eyre::Result<bool>;

    /// Associate the request's enrollment with `hash`, overwriting any
    /// previous association and maintaining the reverse index.
    fn associate_cert_hash(&self, req: &Request, hash: &str) -> color_eyre::eyre::Result<()>;
}

/// Reverse lookup from a certificate hash to an enrollment ID.
pub trait CertAuthRetriever: Send + Sync {
    /// `None` when no association exists.
    fn enrollment_from_hash(&self, hash: &str) -> color_eyre::eyre::Result<Option<String>>;
}

/// Escrows per-device bootstrap tokens. Device channel only.
pub trait BootstrapTokenStore: Send + Sync {
    fn store_bootstrap_token(
        &self,
        req: &Request,
        msg: &SetBootstrapToken,
    ) -> color_eyre::eyre::Result<()>;

    /// `None` when no token has been escrowed.
    fn retrieve_bootstrap_token(
        &self,
        req: &Request,
        msg: &GetBootstrapToken,
    ) -> color_eyre::eyre::Result<Option<BootstrapToken>>;
}

/// Retrieves the TokenUpdate tally for an enrollment.
pub trait TokenUpdateTallyStore: Send + Sync {
    /// 0 when no tally exists yet.
    fn retrieve_token_update_tally(&self, id: &str) -> color_eyre::eyre::Result<i64>;
}

/// Replays enrollment-defining check-in messages for bulk migration.
pub trait StoreMigrator: Send + Sync {
    /// Visit decoded Authenticate and TokenUpdate (and synthesized
    /// SetBootstrapToken) messages in enrollment order: device-channel
    /// TokenUpdates follow their Authenticate, and user-channel messages
    /// follow the device channel's. Disabled enrollments are skipped.
    fn retrieve_migration_checkins(
        &self,
        visit: &mut dyn FnMut(CheckinMessage) -> color_eyre::eyre::Result<()>,
    ) -> color_eyre::eyre::Result<()>;
}

/// Everything a full backend provides.
pub trait AllStorage:
    CheckinStore
    + CommandQueueStore
    + CommandEnqueuer
    + PushInfoStore
    + PushCertStore
    + CertAuthStore
    + CertAuthRetriever
    + BootstrapTokenStore
    + TokenUpdateTallyStore
    + StoreMigrator
{
}

impl<T> AllStorage for T where
    T: CheckinStore
        + CommandQueueStore
        + CommandEnqueuer
        + PushInfoStore
        + PushCertStore
        + CertAuthStore
        + CertAuthRetriever
        + BootstrapTokenStore
        + TokenUpdateTallyStore
        + StoreMigrator
{
}
