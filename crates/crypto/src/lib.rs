//! Certificate parsing, Mdm-Signature verification, and related crypto
//! operations for the MDM server.

mod cert;
mod signature;
mod verify;

pub use cert::*;
pub use signature::*;
pub use verify::*;
