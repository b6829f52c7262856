//! HTTP ingress: device-facing MDM endpoints and the admin API.

mod api;
mod auth;
mod certextract;
mod escrow;
mod mdm;

pub use api::*;
pub use auth::*;
pub use certextract::*;
pub use escrow::*;
pub use mdm::*;
