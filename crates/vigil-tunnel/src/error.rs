//! Error taxonomy for the tunnel control plane.
//!
//! Errors fall into four groups:
//!
//! - configuration: a tunnel configuration could not be generated
//!   ([`TunnelError::CouldNotGenerateTunnelConfiguration`] wrapping a
//!   [`RegistrationError`])
//! - adapter: the cryptographic adapter refused to start or update
//!   ([`AdapterError`])
//! - self-heal exhaustion: [`TunnelError::CouldNotFixConnection`]
//! - simulated: [`TunnelError::SimulatedFailure`], only reachable through
//!   [`StartOptions::simulate_failure`](crate::StartOptions)
//!
//! Every variant is also mapped to a telemetry event in
//! [`telemetry`](crate::telemetry).

use std::time::Duration;

/// Errors surfaced by the tunnel lifecycle controller
#[derive(Debug, Clone, thiserror::Error)]
pub enum TunnelError {
    #[error("Failed to generate a tunnel configuration: {0}")]
    CouldNotGenerateTunnelConfiguration(#[source] RegistrationError),

    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Could not fix the tunnel connection")]
    CouldNotFixConnection,

    #[error("Simulated a tunnel error as requested")]
    SimulatedFailure,

    #[error("Tunnel session already started")]
    AlreadyStarted,
}

/// Errors reported by the cryptographic adapter
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    #[error("Starting tunnel failed: could not determine file descriptor")]
    CannotLocateTunnelFileDescriptor,

    #[error("DNS resolution failed for the following hostnames: {}", .0.join(", "))]
    DnsResolution(Vec<String>),

    #[error("Starting tunnel failed while applying network settings: {0}")]
    SetNetworkSettings(String),

    #[error("Starting tunnel failed with backend returning: {0}")]
    StartBackend(i32),

    #[error("Adapter is in an invalid state")]
    InvalidState,

    #[error("Adapter call `{operation}` timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
}

/// Errors from the registration / device-management collaborator
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error("Server has no registration info")]
    NoServerRegistrationInfo,

    #[error("Could not select the closest server")]
    CouldNotSelectClosestServer,

    #[error("Could not get the peer public key")]
    CouldNotGetPeerPublicKey,

    #[error("Could not get the peer host name")]
    CouldNotGetPeerHostName,

    #[error("Could not get the interface address range")]
    CouldNotGetInterfaceAddressRange,

    #[error("Unknown server: {0}")]
    UnknownServer(String),

    #[error("Failed to fetch server list: {0}")]
    FailedToFetchServerList(String),

    #[error("Failed to parse server list: {0}")]
    FailedToParseServerList(String),

    #[error("Server list is inconsistent")]
    ServerListInconsistency,

    #[error("No server list found")]
    NoServerListFound,

    #[error("No auth token found")]
    NoAuthTokenFound,

    #[error("Invalid auth token")]
    InvalidAuthToken,

    #[error("Keychain read failed for {field} (status {status})")]
    KeychainReadError { field: String, status: i32 },

    #[error("Keychain write failed for {field} (status {status})")]
    KeychainWriteError { field: String, status: i32 },

    #[error("Registration timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unhandled error in {function} line {line}: {message}")]
    Unhandled {
        function: &'static str,
        line: u32,
        message: String,
    },
}

impl TunnelError {
    /// Whether the error ends the session when raised after start
    pub fn is_fatal(&self) -> bool {
        matches!(self, TunnelError::CouldNotFixConnection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dns_error_lists_hosts() {
        let err = AdapterError::DnsResolution(vec!["a.example".into(), "b.example".into()]);
        assert!(err.to_string().contains("a.example, b.example"));
    }

    #[test]
    fn test_configuration_error_keeps_cause() {
        let err = TunnelError::CouldNotGenerateTunnelConfiguration(RegistrationError::NoAuthTokenFound);
        assert!(err.to_string().contains("No auth token found"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_only_fix_exhaustion_is_fatal() {
        assert!(TunnelError::CouldNotFixConnection.is_fatal());
        assert!(!TunnelError::SimulatedFailure.is_fatal());
        assert!(!TunnelError::Adapter(AdapterError::InvalidState).is_fatal());
    }
}
