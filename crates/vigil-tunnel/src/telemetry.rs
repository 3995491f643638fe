//! Telemetry
//!
//! Maps control plane events to reportable events. Every error variant is
//! matched exhaustively so a new variant cannot be added without deciding
//! whether it is reported.

use crate::error::{AdapterError, RegistrationError, TunnelError};
use std::collections::BTreeMap;
use tracing::info;

/// Something that may be worth reporting
#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    Tunnel(TunnelError),
    /// Failover had to keep the server it was asked to avoid
    ServerListInconsistency { avoided: String },
    RekeyCompleted,
    /// A tunnel session became connected
    ActiveUser,
    /// Measured latency to the connected server
    ReportLatency {
        ms: u64,
        server: String,
        network_type: &'static str,
    },
}

/// Reportable event: a name plus string parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportableEvent {
    pub name: &'static str,
    pub parameters: BTreeMap<&'static str, String>,
}

impl ReportableEvent {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            parameters: BTreeMap::new(),
        }
    }

    fn with(mut self, key: &'static str, value: impl ToString) -> Self {
        self.parameters.insert(key, value.to_string());
        self
    }
}

impl TelemetryEvent {
    /// Reportable form, or `None` for events that are not reported
    pub fn reportable(&self) -> Option<ReportableEvent> {
        match self {
            TelemetryEvent::Tunnel(error) => tunnel_event(error),
            TelemetryEvent::ServerListInconsistency { .. } => {
                Some(ReportableEvent::new("vpn_server_list_inconsistency"))
            }
            TelemetryEvent::RekeyCompleted => Some(ReportableEvent::new("vpn_rekey_completed")),
            TelemetryEvent::ActiveUser => Some(ReportableEvent::new("vpn_active_user")),
            TelemetryEvent::ReportLatency { ms, server, network_type } => Some(
                ReportableEvent::new("vpn_latency")
                    .with("latency", ms)
                    .with("server", server)
                    .with("network_type", network_type),
            ),
        }
    }
}

fn tunnel_event(error: &TunnelError) -> Option<ReportableEvent> {
    match error {
        TunnelError::CouldNotGenerateTunnelConfiguration(e) => registration_event(e),
        TunnelError::Adapter(e) => Some(adapter_event(e)),
        TunnelError::CouldNotFixConnection => Some(ReportableEvent::new("vpn_could_not_fix_connection")),
        TunnelError::SimulatedFailure => Some(ReportableEvent::new("vpn_simulated_failure")),
        TunnelError::AlreadyStarted => None,
    }
}

fn registration_event(error: &RegistrationError) -> Option<ReportableEvent> {
    let event = match error {
        RegistrationError::NoServerRegistrationInfo => {
            ReportableEvent::new("vpn_registration_no_server_info")
        }
        RegistrationError::CouldNotSelectClosestServer => {
            ReportableEvent::new("vpn_registration_no_closest_server")
        }
        RegistrationError::CouldNotGetPeerPublicKey => {
            ReportableEvent::new("vpn_registration_no_peer_public_key")
        }
        RegistrationError::CouldNotGetPeerHostName => {
            ReportableEvent::new("vpn_registration_no_peer_host_name")
        }
        RegistrationError::CouldNotGetInterfaceAddressRange => {
            ReportableEvent::new("vpn_registration_no_interface_address")
        }
        RegistrationError::UnknownServer(_) => ReportableEvent::new("vpn_registration_unknown_server"),
        RegistrationError::FailedToFetchServerList(reason) => {
            ReportableEvent::new("vpn_registration_server_list_fetch").with("reason", reason)
        }
        RegistrationError::FailedToParseServerList(reason) => {
            ReportableEvent::new("vpn_registration_server_list_parse").with("reason", reason)
        }
        RegistrationError::NoAuthTokenFound => ReportableEvent::new("vpn_registration_no_auth_token"),
        RegistrationError::InvalidAuthToken => ReportableEvent::new("vpn_registration_invalid_auth_token"),
        RegistrationError::KeychainReadError { field, status } => {
            ReportableEvent::new("vpn_keychain_read_error")
                .with("field", field)
                .with("status", status)
        }
        RegistrationError::KeychainWriteError { field, status } => {
            ReportableEvent::new("vpn_keychain_write_error")
                .with("field", field)
                .with("status", status)
        }
        RegistrationError::Timeout(timeout) => {
            ReportableEvent::new("vpn_registration_timeout").with("seconds", timeout.as_secs())
        }
        RegistrationError::Unhandled { function, line, .. } => {
            ReportableEvent::new("vpn_registration_unhandled")
                .with("function", function)
                .with("line", line)
        }
        // Reported where the fallback happens.
        RegistrationError::ServerListInconsistency => return None,
        RegistrationError::NoServerListFound => return None,
    };
    Some(event)
}

fn adapter_event(error: &AdapterError) -> ReportableEvent {
    match error {
        AdapterError::CannotLocateTunnelFileDescriptor => {
            ReportableEvent::new("vpn_adapter_no_file_descriptor")
        }
        AdapterError::DnsResolution(hosts) => {
            ReportableEvent::new("vpn_adapter_dns_resolution").with("host_count", hosts.len())
        }
        AdapterError::SetNetworkSettings(_) => ReportableEvent::new("vpn_adapter_network_settings"),
        AdapterError::StartBackend(code) => {
            ReportableEvent::new("vpn_adapter_start_backend").with("code", code)
        }
        AdapterError::InvalidState => ReportableEvent::new("vpn_adapter_invalid_state"),
        AdapterError::Timeout { operation, .. } => {
            ReportableEvent::new("vpn_adapter_timeout").with("operation", operation)
        }
    }
}

/// Destination for telemetry events
pub trait EventSink: Send + Sync {
    fn fire(&self, event: TelemetryEvent);
}

/// Logs reportable events through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn fire(&self, event: TelemetryEvent) {
        if let Some(event) = event.reportable() {
            info!(event = event.name, parameters = ?event.parameters, "Telemetry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_configuration_error_uses_registration_name() {
        let event = TelemetryEvent::Tunnel(TunnelError::CouldNotGenerateTunnelConfiguration(
            RegistrationError::KeychainReadError {
                field: "auth_token".into(),
                status: -25300,
            },
        ));

        let reportable = event.reportable().unwrap();
        assert_eq!(reportable.name, "vpn_keychain_read_error");
        assert_eq!(reportable.parameters["field"], "auth_token");
        assert_eq!(reportable.parameters["status"], "-25300");
    }

    #[test]
    fn test_unreported_errors() {
        assert!(TelemetryEvent::Tunnel(TunnelError::AlreadyStarted).reportable().is_none());
        assert!(TelemetryEvent::Tunnel(TunnelError::CouldNotGenerateTunnelConfiguration(
            RegistrationError::NoServerListFound
        ))
        .reportable()
        .is_none());
    }

    #[test]
    fn test_adapter_timeout_parameters() {
        let event = TelemetryEvent::Tunnel(TunnelError::Adapter(AdapterError::Timeout {
            operation: "update",
            timeout: Duration::from_secs(30),
        }));

        let reportable = event.reportable().unwrap();
        assert_eq!(reportable.name, "vpn_adapter_timeout");
        assert_eq!(reportable.parameters["operation"], "update");
    }

    #[test]
    fn test_latency_parameters() {
        let event = TelemetryEvent::ReportLatency {
            ms: 37,
            server: "egress-1".into(),
            network_type: "wifi",
        };

        let reportable = event.reportable().unwrap();
        assert_eq!(reportable.name, "vpn_latency");
        assert_eq!(reportable.parameters["latency"], "37");
        assert_eq!(reportable.parameters["server"], "egress-1");
        assert_eq!(reportable.parameters["network_type"], "wifi");
    }

    #[test]
    fn test_provider_events() {
        assert_eq!(TelemetryEvent::RekeyCompleted.reportable().unwrap().name, "vpn_rekey_completed");
        assert_eq!(TelemetryEvent::ActiveUser.reportable().unwrap().name, "vpn_active_user");
        assert_eq!(
            TelemetryEvent::Tunnel(TunnelError::CouldNotFixConnection).reportable().unwrap().name,
            "vpn_could_not_fix_connection"
        );
    }
}
