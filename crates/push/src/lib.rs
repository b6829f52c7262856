//! APNs push notification delivery.
//!
//! [`PushService`] resolves enrollment IDs to push info, maintains a cache
//! of per-topic [`PushProvider`]s built from stored push certificates, and
//! fans deliveries out through a bounded worker pool.

mod apns;
mod service;
mod traits;

pub use apns::{ApnsProvider, ApnsProviderFactory};
pub use service::PushService;
pub use traits::*;
