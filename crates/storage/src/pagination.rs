//! Pagination parameters for backends that grow list APIs.
//!
//! Backends may support offset- or cursor-based pagination (or both), but a
//! single call may only use one of the two.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Error)]
#[error("both cursor and offset set")]
pub struct BothCursorAndOffset;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pagination {
    /// Offset-based pagination. Cannot be used with `cursor`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,

    /// Backends may apply a default limit when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,

    /// Cursor-based pagination; the initial cursor is the empty string.
    /// Cannot be used with `offset`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

impl Pagination {
    pub fn validate(&self) -> Result<(), BothCursorAndOffset> {
        if self.cursor.is_some() && self.offset.is_some() {
            return Err(BothCursorAndOffset);
        }
        Ok(())
    }

    /// Offset and limit with a backend default limit applied.
    pub fn offset_limit(&self, default_limit: usize) -> (usize, usize) {
        let offset = self.offset.unwrap_or(0);
        let limit = match self.limit {
            Some(l) if l >= 1 => l,
            _ => default_limit,
        };
        (offset, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_and_offset_together_are_invalid() {
        let p = Pagination {
            offset: Some(10),
            cursor: Some(String::new()),
            limit: None,
        };
        assert!(p.validate().is_err());
    }

    #[test]
    fn default_limit_applies() {
        let p = Pagination::default();
        assert!(p.validate().is_ok());
        assert_eq!(p.offset_limit(50), (0, 50));
    }
}
