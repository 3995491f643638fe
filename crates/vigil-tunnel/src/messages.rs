//! App Messages
//!
//! Binary requests from the host application. The first byte is the
//! message code and the rest is the payload; an empty payload selects
//! the default where a message takes one.
//!
//! | code | message | payload | response |
//! |------|---------|---------|----------|
//! | 0 | expire key | | |
//! | 1 | last error | | UTF-8 |
//! | 2 | runtime configuration | | UTF-8 |
//! | 3 | connectivity issues | | `[1]` or `[0]` |
//! | 4 | set selected server | UTF-8 name, empty = automatic | |
//! | 5 | server location | | UTF-8 |
//! | 6 | server address | | UTF-8 |
//! | 7 | set key validity | u64 LE seconds, empty = default | |
//! | 8 | reset all state | | |
//! | 9 | trigger test notification | | |

use std::time::Duration;

/// Decoded app message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppMessage {
    ExpireKey,
    GetLastError,
    GetRuntimeConfiguration,
    IsHavingConnectivityIssues,
    /// `None` switches back to automatic selection
    SetSelectedServer(Option<String>),
    GetServerLocation,
    GetServerAddress,
    /// `None` restores the default validity
    SetKeyValidity(Option<Duration>),
    ResetAllState,
    TriggerTestNotification,
}

impl AppMessage {
    pub fn code(&self) -> u8 {
        match self {
            AppMessage::ExpireKey => 0,
            AppMessage::GetLastError => 1,
            AppMessage::GetRuntimeConfiguration => 2,
            AppMessage::IsHavingConnectivityIssues => 3,
            AppMessage::SetSelectedServer(_) => 4,
            AppMessage::GetServerLocation => 5,
            AppMessage::GetServerAddress => 6,
            AppMessage::SetKeyValidity(_) => 7,
            AppMessage::ResetAllState => 8,
            AppMessage::TriggerTestNotification => 9,
        }
    }

    /// Decode a message from raw bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let (&code, payload) = bytes.split_first().ok_or(MessageError::Empty)?;

        let message = match code {
            0 => AppMessage::ExpireKey,
            1 => AppMessage::GetLastError,
            2 => AppMessage::GetRuntimeConfiguration,
            3 => AppMessage::IsHavingConnectivityIssues,
            4 if payload.is_empty() => AppMessage::SetSelectedServer(None),
            4 => {
                let name = std::str::from_utf8(payload).map_err(|_| MessageError::InvalidUtf8)?;
                AppMessage::SetSelectedServer(Some(name.to_string()))
            }
            5 => AppMessage::GetServerLocation,
            6 => AppMessage::GetServerAddress,
            7 if payload.is_empty() => AppMessage::SetKeyValidity(None),
            7 => {
                let secs: [u8; 8] = payload.try_into()
                    .map_err(|_| MessageError::InvalidKeyValidity(payload.len()))?;
                AppMessage::SetKeyValidity(Some(Duration::from_secs(u64::from_le_bytes(secs))))
            }
            8 => AppMessage::ResetAllState,
            9 => AppMessage::TriggerTestNotification,
            other => return Err(MessageError::UnknownCode(other)),
        };

        Ok(message)
    }

    /// Encode for sending
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = vec![self.code()];
        match self {
            AppMessage::SetSelectedServer(Some(name)) => bytes.extend_from_slice(name.as_bytes()),
            AppMessage::SetKeyValidity(Some(validity)) => {
                bytes.extend_from_slice(&validity.as_secs().to_le_bytes())
            }
            _ => {}
        }
        bytes
    }
}

/// Encode a boolean response
pub fn encode_bool(value: bool) -> Vec<u8> {
    vec![u8::from(value)]
}

/// App message decoding errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("Empty app message")]
    Empty,

    #[error("Unknown app message code: {0}")]
    UnknownCode(u8),

    #[error("Server name is not valid UTF-8")]
    InvalidUtf8,

    #[error("Key validity payload must be 8 bytes, got {0}")]
    InvalidKeyValidity(usize),
}
