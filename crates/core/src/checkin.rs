//! MDM check-in message types and codec.
//!
//! Check-in messages are XML property lists discriminated by a `MessageType`
//! key. Decoding happens in two stages: the discriminator alone is decoded
//! first to pick the concrete variant, then the full variant is decoded and
//! the original bytes are retained for storage, auditing and webhooks.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::{Enrollment, ParseError, UnrecognizedMessageType};

/// Authenticate check-in message: initial device identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Authenticate {
    #[serde(flatten)]
    pub enrollment: Enrollment,

    pub topic: String,

    // Not required for protocol operation, but worth persisting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_version: Option<String>,

    #[serde(default, rename = "OSVersion", skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,

    /// Original XML plist.
    #[serde(skip)]
    pub raw: Vec<u8>,
}

/// TokenUpdate check-in message: push registration; completes an enrollment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TokenUpdate {
    #[serde(flatten)]
    pub enrollment: Enrollment,

    pub topic: String,

    pub push_magic: String,

    /// APNs push token.
    #[serde(with = "serde_bytes")]
    pub token: Vec<u8>,

    /// Escrowed separately on the device channel; future TokenUpdates may
    /// omit it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlock_token: Option<ByteBuf>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub awaiting_configuration: bool,

    /// Original XML plist.
    #[serde(skip)]
    pub raw: Vec<u8>,
}

/// CheckOut check-in message: device-initiated unenrollment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CheckOut {
    #[serde(flatten)]
    pub enrollment: Enrollment,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,

    /// Original XML plist.
    #[serde(skip)]
    pub raw: Vec<u8>,
}

/// UserAuthenticate check-in message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserAuthenticate {
    #[serde(flatten)]
    pub enrollment: Enrollment,

    /// Empty on the first of the (up to) two UserAuthenticate messages.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub digest_response: String,

    /// Original XML plist.
    #[serde(skip)]
    pub raw: Vec<u8>,
}

/// SetBootstrapToken check-in message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SetBootstrapToken {
    #[serde(flatten)]
    pub enrollment: Enrollment,

    #[serde(with = "serde_bytes")]
    pub bootstrap_token: Vec<u8>,

    /// Original XML plist.
    #[serde(skip)]
    pub raw: Vec<u8>,
}

/// GetBootstrapToken check-in message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetBootstrapToken {
    #[serde(flatten)]
    pub enrollment: Enrollment,

    /// Original XML plist.
    #[serde(skip)]
    pub raw: Vec<u8>,
}

/// Reply to a GetBootstrapToken message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BootstrapToken {
    #[serde(with = "serde_bytes")]
    pub bootstrap_token: Vec<u8>,
}

/// DeclarativeManagement check-in message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeclarativeManagement {
    #[serde(flatten)]
    pub enrollment: Enrollment,

    #[serde(default)]
    pub endpoint: String,

    /// DM status report or other payload; presence selects HTTP PUT over GET
    /// when brokered to the DM collaborator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ByteBuf>,

    /// Original XML plist.
    #[serde(skip)]
    pub raw: Vec<u8>,
}

impl DeclarativeManagement {
    pub fn data(&self) -> &[u8] {
        self.data.as_ref().map(|b| b.as_slice()).unwrap_or_default()
    }
}

/// GetToken check-in message: token exchange for other services.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetToken {
    #[serde(flatten)]
    pub enrollment: Enrollment,

    pub token_service_type: String,

    /// Original XML plist.
    #[serde(skip)]
    pub raw: Vec<u8>,
}

/// Reply to a GetToken message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetTokenResponse {
    #[serde(with = "serde_bytes")]
    pub token_data: Vec<u8>,
}

/// A decoded check-in message.
#[derive(Debug, Clone)]
pub enum CheckinMessage {
    Authenticate(Authenticate),
    TokenUpdate(TokenUpdate),
    CheckOut(CheckOut),
    UserAuthenticate(UserAuthenticate),
    SetBootstrapToken(SetBootstrapToken),
    GetBootstrapToken(GetBootstrapToken),
    DeclarativeManagement(DeclarativeManagement),
    GetToken(GetToken),
}

impl CheckinMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Authenticate(_) => "Authenticate",
            Self::TokenUpdate(_) => "TokenUpdate",
            Self::CheckOut(_) => "CheckOut",
            Self::UserAuthenticate(_) => "UserAuthenticate",
            Self::SetBootstrapToken(_) => "SetBootstrapToken",
            Self::GetBootstrapToken(_) => "GetBootstrapToken",
            Self::DeclarativeManagement(_) => "DeclarativeManagement",
            Self::GetToken(_) => "GetToken",
        }
    }

    pub fn enrollment(&self) -> &Enrollment {
        match self {
            Self::Authenticate(m) => &m.enrollment,
            Self::TokenUpdate(m) => &m.enrollment,
            Self::CheckOut(m) => &m.enrollment,
            Self::UserAuthenticate(m) => &m.enrollment,
            Self::SetBootstrapToken(m) => &m.enrollment,
            Self::GetBootstrapToken(m) => &m.enrollment,
            Self::DeclarativeManagement(m) => &m.enrollment,
            Self::GetToken(m) => &m.enrollment,
        }
    }

    pub fn raw(&self) -> &[u8] {
        match self {
            Self::Authenticate(m) => &m.raw,
            Self::TokenUpdate(m) => &m.raw,
            Self::CheckOut(m) => &m.raw,
            Self::UserAuthenticate(m) => &m.raw,
            Self::SetBootstrapToken(m) => &m.raw,
            Self::GetBootstrapToken(m) => &m.raw,
            Self::DeclarativeManagement(m) => &m.raw,
            Self::GetToken(m) => &m.raw,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MessageTypeOnly {
    message_type: String,
}

fn decode_variant<T>(raw: &[u8]) -> Result<T, ParseError>
where
    T: serde::de::DeserializeOwned,
{
    plist::from_bytes(raw).map_err(|e| ParseError::new(e, raw))
}

/// Decode a check-in message, retaining the raw bytes on the result.
///
/// Unknown message types fail with [`UnrecognizedMessageType`]; malformed
/// plists fail with [`ParseError`].
pub fn decode_checkin(raw: &[u8]) -> color_eyre::eyre::Result<CheckinMessage> {
    let discriminator: MessageTypeOnly = decode_variant(raw)?;
    let msg = match discriminator.message_type.as_str() {
        "Authenticate" => {
            let mut m: Authenticate = decode_variant(raw)?;
            m.raw = raw.to_vec();
            CheckinMessage::Authenticate(m)
        }
        "TokenUpdate" => {
            let mut m: TokenUpdate = decode_variant(raw)?;
            m.raw = raw.to_vec();
            CheckinMessage::TokenUpdate(m)
        }
        "CheckOut" => {
            let mut m: CheckOut = decode_variant(raw)?;
            m.raw = raw.to_vec();
            CheckinMessage::CheckOut(m)
        }
        "UserAuthenticate" => {
            let mut m: UserAuthenticate = decode_variant(raw)?;
            m.raw = raw.to_vec();
            CheckinMessage::UserAuthenticate(m)
        }
        "SetBootstrapToken" => {
            let mut m: SetBootstrapToken = decode_variant(raw)?;
            m.raw = raw.to_vec();
            CheckinMessage::SetBootstrapToken(m)
        }
        "GetBootstrapToken" => {
            let mut m: GetBootstrapToken = decode_variant(raw)?;
            m.raw = raw.to_vec();
            CheckinMessage::GetBootstrapToken(m)
        }
        "DeclarativeManagement" => {
            let mut m: DeclarativeManagement = decode_variant(raw)?;
            m.raw = raw.to_vec();
            CheckinMessage::DeclarativeManagement(m)
        }
        "GetToken" => {
            let mut m: GetToken = decode_variant(raw)?;
            m.raw = raw.to_vec();
            CheckinMessage::GetToken(m)
        }
        other => return Err(UnrecognizedMessageType(other.to_string()).into()),
    };
    Ok(msg)
}

/// Serialize a value as an XML property list.
pub fn to_plist_xml<T: Serialize>(value: &T) -> color_eyre::eyre::Result<Vec<u8>> {
    use color_eyre::eyre::WrapErr as _;

    let mut buf = Vec::new();
    plist::to_writer_xml(&mut buf, value).wrap_err("serializing plist")?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::find_in_chain;

    fn plist_doc(body: &str) -> Vec<u8> {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
{body}
</dict>
</plist>"#
        )
        .into_bytes()
    }

    #[test]
    fn decodes_authenticate_and_retains_raw() {
        let raw = plist_doc(
            r#"    <key>MessageType</key>
    <string>Authenticate</string>
    <key>UDID</key>
    <string>AAAA-1111</string>
    <key>Topic</key>
    <string>com.apple.mgmt.X</string>
    <key>SerialNumber</key>
    <string>S1</string>"#,
        );
        let msg = decode_checkin(&raw).unwrap();
        let CheckinMessage::Authenticate(m) = msg else {
            panic!("expected Authenticate");
        };
        assert_eq!(m.enrollment.udid.as_deref(), Some("AAAA-1111"));
        assert_eq!(m.topic, "com.apple.mgmt.X");
        assert_eq!(m.serial_number.as_deref(), Some("S1"));
        assert_eq!(m.raw, raw);
    }

    #[test]
    fn decodes_token_update_with_data_fields() {
        // 0xDEADBEEF
        let raw = plist_doc(
            r#"    <key>MessageType</key>
    <string>TokenUpdate</string>
    <key>UDID</key>
    <string>AAAA-1111</string>
    <key>Topic</key>
    <string>com.apple.mgmt.X</string>
    <key>PushMagic</key>
    <string>PM</string>
    <key>Token</key>
    <data>3q2+7w==</data>"#,
        );
        let msg = decode_checkin(&raw).unwrap();
        let CheckinMessage::TokenUpdate(m) = msg else {
            panic!("expected TokenUpdate");
        };
        assert_eq!(m.token, vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(m.push_magic, "PM");
        assert!(m.unlock_token.is_none());
        assert!(!m.awaiting_configuration);
    }

    #[test]
    fn unknown_message_type_is_typed() {
        let raw = plist_doc(
            r#"    <key>MessageType</key>
    <string>NotARealMessage</string>"#,
        );
        let err = decode_checkin(&raw).unwrap_err();
        let unrecognized = find_in_chain::<UnrecognizedMessageType>(&err).unwrap();
        assert_eq!(unrecognized.0, "NotARealMessage");
    }

    #[test]
    fn malformed_plist_carries_content() {
        let raw = b"not a plist at all";
        let err = decode_checkin(raw).unwrap_err();
        let parse = find_in_chain::<ParseError>(&err).unwrap();
        assert_eq!(parse.content, raw.to_vec());
    }

    #[test]
    fn reencoding_a_decoded_message_is_semantically_equal() {
        let raw = plist_doc(
            r#"    <key>MessageType</key>
    <string>TokenUpdate</string>
    <key>UDID</key>
    <string>AAAA-1111</string>
    <key>Topic</key>
    <string>com.apple.mgmt.X</string>
    <key>PushMagic</key>
    <string>PM</string>
    <key>Token</key>
    <data>3q2+7w==</data>"#,
        );
        let CheckinMessage::TokenUpdate(first) = decode_checkin(&raw).unwrap() else {
            panic!("expected TokenUpdate");
        };
        let reencoded = to_plist_xml(&first).unwrap();
        let second: TokenUpdate = plist::from_bytes(&reencoded).unwrap();
        assert_eq!(second.enrollment, first.enrollment);
        assert_eq!(second.topic, first.topic);
        assert_eq!(second.push_magic, first.push_magic);
        assert_eq!(second.token, first.token);
    }

    #[test]
    fn round_trips_user_authenticate() {
        let raw = plist_doc(
            r#"    <key>MessageType</key>
    <string>UserAuthenticate</string>
    <key>UDID</key>
    <string>AAAA-1111</string>
    <key>UserID</key>
    <string>u-1</string>
    <key>DigestResponse</key>
    <string>resp</string>"#,
        );
        let msg = decode_checkin(&raw).unwrap();
        let CheckinMessage::UserAuthenticate(m) = msg else {
            panic!("expected UserAuthenticate");
        };
        assert_eq!(m.digest_response, "resp");
        let id = m.enrollment.normalize().unwrap();
        assert_eq!(id.id, "AAAA-1111:u-1");
    }
}
