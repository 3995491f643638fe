//! Vigil Tunnel - VPN Tunnel Lifecycle Control Plane
//!
//! Keeps a WireGuard-style tunnel healthy: starts and stops it,
//! verifies that traffic really flows through it, rotates keys and
//! fails over between relay servers. The encrypted transport itself is
//! an external [`TunnelAdapter`]; relay registration is an external
//! [`DeviceManagement`] collaborator.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   TunnelController                        │
//! │                                                           │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐  │
//! │  │ServerSelector│──▶│TunnelAdapter │   │  KeyRotation │  │
//! │  └──────────────┘   └──────────────┘   └──────▲───────┘  │
//! │         ▲                                     │ idle?    │
//! │         │ avoid server  ┌──────────────┐  ┌───┴────────┐ │
//! │         └───────────────│  Connection  │─▶│ Bandwidth  │ │
//! │                         │    Tester    │  │  Analyzer  │ │
//! │                         └──────────────┘  └────────────┘ │
//! └───────────────────────────────┬──────────────────────────┘
//!                                 ▼
//!                       StatusBroadcaster / telemetry
//! ```
//!
//! # Recovery
//!
//! - 1st failed connection test: fail over to another server
//! - 2nd consecutive failure: stop with [`TunnelError::CouldNotFixConnection`]

mod adapter;
mod bandwidth;
mod config;
mod controller;
mod error;
mod health;
mod keys;
mod latency;
mod messages;
mod notifications;
mod rekey;
mod selection;
mod servers;
mod settings;
mod status;
mod telemetry;
mod tester;

#[cfg(test)]
mod testing;

pub use adapter::TunnelAdapter;
pub use bandwidth::{BandwidthAnalyzer, BandwidthSnapshot};
pub use config::{
    ConfigError, Endpoint, InterfaceConfiguration, IpAddressRange, PeerConfiguration,
    TunnelConfiguration,
};
pub use controller::{ControllerDependencies, StartOptions, StopReason, TunnelController};
pub use error::{AdapterError, RegistrationError, TunnelError};
pub use health::{ErrorStore, TunnelHealth};
pub use keys::{KeyError, KeyPair, KeyStore, MemoryKeyStore, PrivateKey, PublicKey};
pub use latency::{LatencyMeter, LatencyReporter, TcpLatencyMeter};
pub use messages::{AppMessage, MessageError};
pub use notifications::{LogNotifications, Notifications};
pub use rekey::{KeyRotation, Rekey};
pub use selection::{
    DeviceManagement, Registration, SelectedServer, SelectedServerStore, ServerInfo,
    ServerSelectionMethod, ServerSelector,
};
pub use servers::{ServerList, ServerListConfig, ServerListError, ServerProfile};
pub use settings::{
    IdleSettings, KeySettings, LatencySettings, SettingsError, TesterSettings, TimeoutSettings,
    TunnelSettings,
};
pub use status::{
    ConnectionStatus, ConnectionStatusChange, IpcMessage, IpcTopic, IpcTransport,
    StatusBroadcaster, StatusEvent, StatusServerInfo,
};
pub use telemetry::{EventSink, ReportableEvent, TelemetryEvent, TracingEventSink};
pub use tester::{
    ConnectionTester, InterfaceResolver, NetworkInterface, ProbeInterfaces, ProbeRoute, Prober,
    SystemInterfaces, TcpProber, TestReport, TestResult, TesterError, classify,
    default_route_interface, select_direct_interface,
};
