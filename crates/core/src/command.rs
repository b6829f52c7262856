//! MDM command and command-result types.

use serde::{Deserialize, Serialize};

use crate::{Enrollment, InvalidCommand, ParseError};

/// A generic MDM command without command-specific fields.
///
/// The raw plist is the canonical command body; it is stored once and shared
/// by every enrollment the command is queued to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Command {
    #[serde(default, rename = "CommandUUID")]
    pub command_uuid: String,

    pub command: CommandPayload,

    /// Original command XML plist.
    #[serde(skip)]
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CommandPayload {
    #[serde(default)]
    pub request_type: String,
}

/// Command execution status reported by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandStatus {
    Acknowledged,
    Error,
    CommandFormatError,
    /// Busy; retry after the device asks again.
    NotNow,
    /// No report; the device is only polling for the next command.
    Idle,
}

impl CommandStatus {
    /// Terminal statuses finalize the per-enrollment command attachment.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Acknowledged | Self::Error | Self::CommandFormatError
        )
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Acknowledged => "Acknowledged",
            Self::Error => "Error",
            Self::CommandFormatError => "CommandFormatError",
            Self::NotNow => "NotNow",
            Self::Idle => "Idle",
        };
        f.write_str(s)
    }
}

/// An error reported by the client while executing a command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorChainItem {
    pub error_code: i64,

    #[serde(default)]
    pub error_domain: String,

    #[serde(default)]
    pub localized_description: String,

    #[serde(default, rename = "USEnglishDescription")]
    pub us_english_description: String,
}

/// A "command and report results" request from a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CommandResults {
    #[serde(flatten)]
    pub enrollment: Enrollment,

    /// Empty for `Idle` reports.
    #[serde(default, rename = "CommandUUID", skip_serializing_if = "String::is_empty")]
    pub command_uuid: String,

    /// A missing status is a hard parse error.
    pub status: CommandStatus,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_chain: Vec<ErrorChainItem>,

    /// Original command result XML plist.
    #[serde(skip)]
    pub raw: Vec<u8>,
}

/// Decode a command-result report, retaining the raw bytes.
pub fn decode_command_results(raw: &[u8]) -> color_eyre::eyre::Result<CommandResults> {
    let mut results: CommandResults =
        plist::from_bytes(raw).map_err(|e| ParseError::new(e, raw))?;
    results.raw = raw.to_vec();
    Ok(results)
}

/// Decode a command plist, retaining the raw bytes.
///
/// Empty bodies and commands missing a `CommandUUID` or
/// `Command.RequestType` are rejected.
pub fn decode_command(raw: &[u8]) -> color_eyre::eyre::Result<Command> {
    if raw.is_empty() {
        return Err(InvalidCommand::Empty.into());
    }
    let mut command: Command = plist::from_bytes(raw).map_err(|e| ParseError::new(e, raw))?;
    command.raw = raw.to_vec();
    if command.command_uuid.is_empty() || command.command.request_type.is_empty() {
        return Err(InvalidCommand::MissingFields.into());
    }
    Ok(command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::find_in_chain;

    fn command_plist(uuid: &str, request_type: &str) -> Vec<u8> {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>CommandUUID</key>
    <string>{uuid}</string>
    <key>Command</key>
    <dict>
        <key>RequestType</key>
        <string>{request_type}</string>
    </dict>
</dict>
</plist>"#
        )
        .into_bytes()
    }

    #[test]
    fn decodes_command() {
        let raw = command_plist("CMD-1", "DeviceInformation");
        let cmd = decode_command(&raw).unwrap();
        assert_eq!(cmd.command_uuid, "CMD-1");
        assert_eq!(cmd.command.request_type, "DeviceInformation");
        assert_eq!(cmd.raw, raw);
    }

    #[test]
    fn rejects_empty_command() {
        let err = decode_command(b"").unwrap_err();
        assert_eq!(
            *find_in_chain::<InvalidCommand>(&err).unwrap(),
            InvalidCommand::Empty
        );
    }

    #[test]
    fn rejects_command_missing_uuid() {
        let raw = command_plist("", "DeviceInformation");
        let err = decode_command(&raw).unwrap_err();
        assert_eq!(
            *find_in_chain::<InvalidCommand>(&err).unwrap(),
            InvalidCommand::MissingFields
        );
    }

    #[test]
    fn decodes_idle_report() {
        let raw = br#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>UDID</key>
    <string>AAAA-1111</string>
    <key>Status</key>
    <string>Idle</string>
</dict>
</plist>"#;
        let results = decode_command_results(raw).unwrap();
        assert_eq!(results.status, CommandStatus::Idle);
        assert!(results.command_uuid.is_empty());
    }

    #[test]
    fn missing_status_is_a_parse_error() {
        let raw = br#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>UDID</key>
    <string>AAAA-1111</string>
</dict>
</plist>"#;
        let err = decode_command_results(raw).unwrap_err();
        assert!(find_in_chain::<ParseError>(&err).is_some());
    }

    #[test]
    fn decodes_error_chain() {
        let raw = br#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>UDID</key>
    <string>AAAA-1111</string>
    <key>CommandUUID</key>
    <string>CMD-1</string>
    <key>Status</key>
    <string>Error</string>
    <key>ErrorChain</key>
    <array>
        <dict>
            <key>ErrorCode</key>
            <integer>12021</integer>
            <key>ErrorDomain</key>
            <string>MCMDMErrorDomain</string>
            <key>LocalizedDescription</key>
            <string>invalid profile</string>
            <key>USEnglishDescription</key>
            <string>invalid profile</string>
        </dict>
    </array>
</dict>
</plist>"#;
        let results = decode_command_results(raw).unwrap();
        assert_eq!(results.status, CommandStatus::Error);
        assert_eq!(results.error_chain.len(), 1);
        assert_eq!(results.error_chain[0].error_code, 12021);
    }
}
