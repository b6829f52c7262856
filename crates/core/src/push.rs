//! APNs push data types.

use serde::{Deserialize, Serialize};

/// Data needed to send an APNs wakeup to an enrollment.
///
/// Only valid while the enrollment is enabled and a TokenUpdate has been
/// received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Push {
    /// APNs topic from the push certificate's UID attribute.
    pub topic: String,
    /// Device-provided magic that must appear in the push payload.
    pub push_magic: String,
    /// Raw APNs device token.
    #[serde(with = "serde_bytes")]
    pub token: Vec<u8>,
}

impl Push {
    /// Hex form of the token as used in the APNs request path.
    pub fn token_hex(&self) -> String {
        hex::encode(&self.token)
    }
}

/// Per-destination outcome of a push attempt.
#[derive(Debug, Clone, Default)]
pub struct PushResponse {
    /// The `apns-id` response header of a successful push.
    pub id: String,
    pub error: Option<String>,
}

impl PushResponse {
    pub fn success(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            error: None,
        }
    }

    pub fn failure(error: impl std::fmt::Display) -> Self {
        Self {
            id: String::new(),
            error: Some(error.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_hex_is_lowercase() {
        let push = Push {
            topic: "com.apple.mgmt.X".into(),
            push_magic: "PM".into(),
            token: vec![0xde, 0xad, 0xbe, 0xef],
        };
        assert_eq!(push.token_hex(), "deadbeef");
    }
}
