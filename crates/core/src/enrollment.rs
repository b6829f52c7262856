//! Enrollment identity resolution.
//!
//! Every check-in and command-report message carries some subset of the
//! enrollment identifiers. [`Enrollment::resolve`] derives the channel
//! structure from them and [`Enrollment::normalize`] produces the stable
//! [`EnrollId`] used everywhere else: storage keys, certificate
//! associations, logging, push targeting.

use serde::{Deserialize, Serialize};

/// Type of MDM enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnrollType {
    /// Device channel of a UDID-based enrollment.
    Device,
    /// User channel on a UDID-based enrollment.
    User,
    /// Device channel of a User Enrollment (EnrollmentID-based).
    UserEnrollmentDevice,
    /// User channel of a User Enrollment.
    UserEnrollment,
}

impl EnrollType {
    /// Whether this is a user channel (and so carries a parent device ID).
    pub fn is_user_channel(self) -> bool {
        matches!(self, Self::User | Self::UserEnrollment)
    }
}

impl std::fmt::Display for EnrollType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Device => "Device",
            Self::User => "User",
            Self::UserEnrollmentDevice => "UserEnrollmentDevice",
            Self::UserEnrollment => "UserEnrollment",
        };
        f.write_str(s)
    }
}

/// Enrollment-identifying fields sent with every MDM request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Enrollment {
    #[serde(default, rename = "UDID", skip_serializing_if = "Option::is_none")]
    pub udid: Option<String>,

    #[serde(default, rename = "UserID", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_short_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_long_name: Option<String>,

    /// Identifier for User Enrollment devices (no UDID is disclosed).
    #[serde(default, rename = "EnrollmentID", skip_serializing_if = "Option::is_none")]
    pub enrollment_id: Option<String>,

    #[serde(default, rename = "EnrollmentUserID", skip_serializing_if = "Option::is_none")]
    pub enrollment_user_id: Option<String>,
}

/// Channel structure resolved from an [`Enrollment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEnrollment<'a> {
    pub enroll_type: EnrollType,
    pub device_channel_id: &'a str,
    /// Set only for user channels.
    pub user_channel_id: Option<&'a str>,
}

impl ResolvedEnrollment<'_> {
    pub fn is_user_channel(&self) -> bool {
        self.user_channel_id.is_some()
    }
}

/// Normalized enrollment identifier.
///
/// These identifiers are what is used for MDM client identification all
/// around: database keys, logging, certificate associations. Their format
/// must stay consistent across the lifetime of any enrolled device: device
/// channels use the device identifier as-is and user channels append the
/// user identifier after a colon, with `parent_id` referencing the device
/// channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnrollId {
    pub enroll_type: EnrollType,
    pub id: String,
    /// Device-channel ID for user channels; `None` otherwise.
    pub parent_id: Option<String>,
}

impl EnrollId {
    /// Validation used by services before touching storage.
    pub fn validate(&self) -> color_eyre::eyre::Result<()> {
        if self.id.is_empty() {
            return Err(crate::ValidationError("empty enrollment id".into()).into());
        }
        if self.enroll_type.is_user_channel() != self.parent_id.is_some() {
            return Err(
                crate::ValidationError("enrollment id channel/parent mismatch".into()).into(),
            );
        }
        Ok(())
    }

    /// The device-channel ID: `parent_id` for user channels, `id` otherwise.
    pub fn device_channel_id(&self) -> &str {
        self.parent_id.as_deref().unwrap_or(&self.id)
    }
}

impl std::fmt::Display for EnrollId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id)
    }
}

fn non_empty(s: &Option<String>) -> Option<&str> {
    s.as_deref().filter(|s| !s.is_empty())
}

impl Enrollment {
    /// Resolve the channel structure from whichever identifiers are present.
    ///
    /// Device identifier preference is `UDID` then `EnrollmentID`; user
    /// identifier preference is `UserID` then `EnrollmentUserID`. Returns
    /// `None` when no device identifier is present.
    pub fn resolve(&self) -> Option<ResolvedEnrollment<'_>> {
        let user_channel_id = non_empty(&self.user_id).or(non_empty(&self.enrollment_user_id));
        if let Some(udid) = non_empty(&self.udid) {
            return Some(ResolvedEnrollment {
                enroll_type: if user_channel_id.is_some() {
                    EnrollType::User
                } else {
                    EnrollType::Device
                },
                device_channel_id: udid,
                user_channel_id,
            });
        }
        if let Some(enrollment_id) = non_empty(&self.enrollment_id) {
            return Some(ResolvedEnrollment {
                enroll_type: if user_channel_id.is_some() {
                    EnrollType::UserEnrollment
                } else {
                    EnrollType::UserEnrollmentDevice
                },
                device_channel_id: enrollment_id,
                user_channel_id,
            });
        }
        None
    }

    /// Derive the normalized [`EnrollId`] for this enrollment.
    ///
    /// User channels are identified as `"<deviceID>:<userID>"` with the
    /// device channel as parent.
    pub fn normalize(&self) -> color_eyre::eyre::Result<EnrollId> {
        let resolved = self.resolve().ok_or_else(|| {
            crate::ValidationError("no device identifier in enrollment".into())
        })?;
        let eid = match resolved.user_channel_id {
            Some(user) => EnrollId {
                enroll_type: resolved.enroll_type,
                id: format!("{}:{}", resolved.device_channel_id, user),
                parent_id: Some(resolved.device_channel_id.to_string()),
            },
            None => EnrollId {
                enroll_type: resolved.enroll_type,
                id: resolved.device_channel_id.to_string(),
                parent_id: None,
            },
        };
        eid.validate()?;
        Ok(eid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_enrollment() {
        let enrollment = Enrollment {
            udid: Some("AAAA-1111".into()),
            ..Default::default()
        };
        let id = enrollment.normalize().unwrap();
        assert_eq!(id.enroll_type, EnrollType::Device);
        assert_eq!(id.id, "AAAA-1111");
        assert!(id.parent_id.is_none());
        assert_eq!(id.device_channel_id(), "AAAA-1111");
    }

    #[test]
    fn user_channel_enrollment() {
        let enrollment = Enrollment {
            udid: Some("AAAA-1111".into()),
            user_id: Some("user-456".into()),
            ..Default::default()
        };
        let id = enrollment.normalize().unwrap();
        assert_eq!(id.enroll_type, EnrollType::User);
        assert_eq!(id.id, "AAAA-1111:user-456");
        assert_eq!(id.parent_id.as_deref(), Some("AAAA-1111"));
        assert_eq!(id.device_channel_id(), "AAAA-1111");
    }

    #[test]
    fn user_enrollment_device() {
        let enrollment = Enrollment {
            enrollment_id: Some("UE-1".into()),
            ..Default::default()
        };
        let id = enrollment.normalize().unwrap();
        assert_eq!(id.enroll_type, EnrollType::UserEnrollmentDevice);
        assert_eq!(id.id, "UE-1");
    }

    #[test]
    fn user_enrollment_user_channel() {
        let enrollment = Enrollment {
            enrollment_id: Some("UE-1".into()),
            enrollment_user_id: Some("u1".into()),
            ..Default::default()
        };
        let id = enrollment.normalize().unwrap();
        assert_eq!(id.enroll_type, EnrollType::UserEnrollment);
        assert_eq!(id.id, "UE-1:u1");
        assert_eq!(id.parent_id.as_deref(), Some("UE-1"));
    }

    #[test]
    fn udid_preferred_over_enrollment_id() {
        let enrollment = Enrollment {
            udid: Some("AAAA-1111".into()),
            enrollment_id: Some("UE-1".into()),
            ..Default::default()
        };
        let id = enrollment.normalize().unwrap();
        assert_eq!(id.enroll_type, EnrollType::Device);
        assert_eq!(id.id, "AAAA-1111");
    }

    #[test]
    fn missing_device_identifier_is_an_error() {
        let enrollment = Enrollment {
            user_id: Some("u1".into()),
            ..Default::default()
        };
        assert!(enrollment.normalize().is_err());
    }

    #[test]
    fn empty_identifiers_are_ignored() {
        let enrollment = Enrollment {
            udid: Some(String::new()),
            enrollment_id: Some("UE-1".into()),
            ..Default::default()
        };
        let id = enrollment.normalize().unwrap();
        assert_eq!(id.id, "UE-1");
    }
}
