//! Typed protocol errors.
//!
//! These are carried inside `eyre` reports through the service chain; the
//! HTTP layer walks the error chain to translate them into status codes.

use thiserror::Error;

/// Failure to parse an MDM structure (usually an Apple plist).
///
/// Retains the offending raw content so transport layers can log it.
#[derive(Debug, Error)]
#[error("parse error: {source}: raw content: {}", String::from_utf8_lossy(.content))]
pub struct ParseError {
    #[source]
    pub source: plist::Error,
    pub content: Vec<u8>,
}

impl ParseError {
    pub fn new(source: plist::Error, content: &[u8]) -> Self {
        Self {
            source,
            content: content.to_vec(),
        }
    }
}

/// A check-in plist with a valid structure but an unknown `MessageType`.
#[derive(Debug, Error)]
#[error("unrecognized MessageType: {0:?}")]
pub struct UnrecognizedMessageType(pub String);

/// A command plist missing its UUID or request type, or with no bytes at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvalidCommand {
    #[error("empty command bytes")]
    Empty,
    #[error("invalid command")]
    MissingFields,
}

/// Missing or malformed identifiers and other request-shape failures.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

/// An HTTP status carried up through the service chain.
///
/// Used for responses with protocol-mandated statuses (the UserAuthenticate
/// 410 decline, Declarative Management upstream statuses) so the transport
/// can unwrap them without guessing.
#[derive(Debug, Error)]
#[error("HTTP status {status}: {message}")]
pub struct HttpStatusError {
    pub status: u16,
    pub message: String,
}

impl HttpStatusError {
    pub fn new(status: u16, message: impl std::fmt::Display) -> Self {
        Self {
            status,
            message: message.to_string(),
        }
    }
}

/// Certificate-to-enrollment binding failure.
///
/// Deliberately mapped to HTTP 400 (not 401) by the transport so a device
/// does not interpret the failure as an unenrollment signal.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("certificate not associated with enrollment {0}")]
    CertMismatch(String),
    #[error("certificate hash already associated with another enrollment")]
    HashBoundElsewhere,
    #[error("no certificate association for enrollment {0}")]
    NoAssociation(String),
    #[error("no certificate in MDM request")]
    MissingCertificate,
}

/// Find a typed error anywhere in an eyre report's chain.
pub fn find_in_chain<'a, E>(report: &'a color_eyre::eyre::Report) -> Option<&'a E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    report.chain().find_map(|cause| cause.downcast_ref::<E>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use color_eyre::eyre::WrapErr as _;

    #[test]
    fn finds_typed_error_through_context_layers() {
        let inner: color_eyre::eyre::Result<()> =
            Err(UnrecognizedMessageType("Bogus".into()).into());
        let wrapped = inner.wrap_err("check-in request").unwrap_err();
        let found = find_in_chain::<UnrecognizedMessageType>(&wrapped).unwrap();
        assert_eq!(found.0, "Bogus");
    }

    #[test]
    fn http_status_error_survives_wrapping() {
        let err: color_eyre::eyre::Report =
            HttpStatusError::new(410, color_eyre::eyre::eyre!("declining management")).into();
        let err = Err::<(), _>(err)
            .wrap_err("user authenticate")
            .unwrap_err();
        assert_eq!(find_in_chain::<HttpStatusError>(&err).unwrap().status, 410);
    }
}
