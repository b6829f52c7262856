//! MDM service layer.
//!
//! The [`Engine`] is the core check-in and command service dispatching to
//! storage. Around it compose the certificate-auth middleware, the
//! multi-service fan-out, and the dump/webhook decorators. The Declarative
//! Management HTTP caller and the GetToken mux live here too.

mod certauth;
mod dm;
mod dump;
mod engine;
mod multi;
mod token;
mod traits;
mod webhook;

pub use certauth::CertAuthMiddleware;
pub use dm::{DmHttpCaller, HMAC_HEADER};
pub use dump::Dumper;
pub use engine::{Engine, UnconfiguredDm};
pub use multi::MultiService;
pub use token::{StaticToken, TokenServiceTypeMux};
pub use traits::*;
pub use webhook::Webhook;
