//! MDM request context.

use std::collections::HashMap;

use crate::EnrollId;

/// Context carried alongside every MDM client request.
///
/// The enrollment ID is populated by the service layer's normalizer so that
/// middleware and storage layers can rely on it. The certificate is the
/// DER-encoded enrollment identity extracted by the transport.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub enroll_id: Option<EnrollId>,

    /// DER-encoded client identity certificate.
    pub certificate: Option<Vec<u8>>,

    /// URL query parameters from the MDM enrollment profile's ServerURL.
    pub params: HashMap<String, String>,
}

impl Request {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_enroll_id(mut self, id: EnrollId) -> Self {
        self.enroll_id = Some(id);
        self
    }

    pub fn with_certificate(mut self, cert_der: Vec<u8>) -> Self {
        self.certificate = Some(cert_der);
        self
    }

    pub fn with_params(mut self, params: HashMap<String, String>) -> Self {
        self.params = params;
        self
    }

    /// The normalized enrollment ID, erroring when not yet resolved.
    pub fn require_enroll_id(&self) -> color_eyre::eyre::Result<&EnrollId> {
        self.enroll_id
            .as_ref()
            .ok_or_else(|| color_eyre::eyre::eyre!("enrollment ID not resolved"))
    }
}
