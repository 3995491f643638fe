//! Relay Server List
//!
//! A static list of relay servers, loaded from TOML or JSON, that acts
//! as an in-process [`DeviceManagement`] collaborator.
//!
//! ```toml
//! interface_address = "10.64.0.2/32"
//! dns = ["10.64.0.1"]
//!
//! [[servers]]
//! name = "egress.fra.1"
//! location = "Frankfurt, DE"
//! endpoint_ip = "192.0.2.10"
//! public_key = "WDvCRKv9hVAx1P3L7dKxiNxI3CxbK9Ue1tL8x2ZqRVk="
//! ```

use crate::config::{
    Endpoint, InterfaceConfiguration, IpAddressRange, PeerConfiguration, TunnelConfiguration,
};
use crate::error::RegistrationError;
use crate::keys::{KeyPair, PublicKey};
use crate::selection::{DeviceManagement, Registration, ServerInfo, ServerSelectionMethod};
use crate::telemetry::{EventSink, TelemetryEvent};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// One relay server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerProfile {
    /// Unique server name
    pub name: String,
    /// Human readable location
    pub location: String,
    /// Server endpoint IP
    pub endpoint_ip: String,
    /// Server port (usually 51820)
    #[serde(default = "default_port")]
    pub endpoint_port: u16,
    /// Server public key (base64)
    pub public_key: String,
    /// Allowed IPs (CIDR notation); empty routes everything
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    /// Seconds the server keeps a key registration
    #[serde(default)]
    pub registration_ttl_secs: Option<u64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_port() -> u16 {
    51820
}

fn default_true() -> bool {
    true
}

impl ServerProfile {
    /// Parse endpoint
    pub fn endpoint(&self) -> Result<Endpoint, RegistrationError> {
        let ip: IpAddr = self.endpoint_ip.parse()
            .map_err(|_| RegistrationError::CouldNotGetPeerHostName)?;
        Ok(Endpoint::new(ip, self.endpoint_port))
    }

    /// Convert to a peer
    pub fn to_peer_configuration(&self) -> Result<PeerConfiguration, RegistrationError> {
        let public_key = PublicKey::from_base64(&self.public_key)
            .map_err(|_| RegistrationError::CouldNotGetPeerPublicKey)?;
        let mut peer = PeerConfiguration::new(public_key, self.endpoint()?);

        if !self.allowed_ips.is_empty() {
            peer.allowed_ips = self.allowed_ips.iter()
                .map(|cidr| cidr.parse::<IpAddressRange>())
                .collect::<Result<_, _>>()
                .map_err(|e| RegistrationError::FailedToParseServerList(e.to_string()))?;
        }

        Ok(peer)
    }

    /// Status-facing view of the server
    pub fn server_info(&self) -> ServerInfo {
        ServerInfo {
            name: self.name.clone(),
            location: self.location.clone(),
            endpoint: self.endpoint().ok(),
            public_key: self.public_key.clone(),
        }
    }
}

/// Server list file contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerListConfig {
    /// Client tunnel address
    pub interface_address: String,
    /// DNS servers to use inside the tunnel
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default)]
    pub listen_port: Option<u16>,
    #[serde(default)]
    pub servers: Vec<ServerProfile>,
}

/// Static server list acting as the registration collaborator
pub struct ServerList {
    config: ServerListConfig,
    events: Option<Arc<dyn EventSink>>,
}

impl ServerList {
    /// Create from parsed contents
    pub fn new(config: ServerListConfig) -> Self {
        Self { config, events: None }
    }

    /// Report list inconsistencies through `events`
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Load from a `.toml` or `.json` file
    pub fn load(path: &Path) -> Result<Self, ServerListError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ServerListError::Io(e.to_string()))?;

        let ext = path.extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");

        match ext {
            "toml" => Self::from_toml(&content),
            "json" => Self::from_json(&content),
            _ => Err(ServerListError::UnsupportedFormat),
        }
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ServerListError> {
        toml::from_str(content)
            .map(Self::new)
            .map_err(|e| ServerListError::Parse(e.to_string()))
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, ServerListError> {
        serde_json::from_str(content)
            .map(Self::new)
            .map_err(|e| ServerListError::Parse(e.to_string()))
    }

    /// Enabled servers, in file order
    pub fn enabled_servers(&self) -> impl Iterator<Item = &ServerProfile> {
        self.config.servers.iter().filter(|s| s.enabled)
    }

    /// Pick the server `method` resolves to.
    ///
    /// Automatic takes the first enabled server. Avoidance takes the first
    /// other enabled server, falling back to the avoided one when it is
    /// the only server left.
    pub fn select(&self, method: &ServerSelectionMethod) -> Result<&ServerProfile, RegistrationError> {
        if self.config.servers.is_empty() {
            return Err(RegistrationError::NoServerListFound);
        }

        match method {
            ServerSelectionMethod::Automatic => self.enabled_servers()
                .next()
                .ok_or(RegistrationError::CouldNotSelectClosestServer),
            ServerSelectionMethod::PreferredServer(name) => self.enabled_servers()
                .find(|s| &s.name == name)
                .ok_or_else(|| RegistrationError::UnknownServer(name.clone())),
            ServerSelectionMethod::AvoidServer(name) => {
                if let Some(other) = self.enabled_servers().find(|s| &s.name != name) {
                    return Ok(other);
                }

                let fallback = self.enabled_servers()
                    .next()
                    .ok_or(RegistrationError::CouldNotSelectClosestServer)?;
                warn!(avoided = %name, "No alternative server to fail over to, keeping the same one");
                if let Some(events) = &self.events {
                    events.fire(TelemetryEvent::ServerListInconsistency { avoided: name.clone() });
                }
                Ok(fallback)
            }
        }
    }

    fn interface(&self, key_pair: &KeyPair) -> Result<InterfaceConfiguration, RegistrationError> {
        let address: IpAddressRange = self.config.interface_address.parse()
            .map_err(|_| RegistrationError::CouldNotGetInterfaceAddressRange)?;

        Ok(InterfaceConfiguration {
            private_key: key_pair.private.clone(),
            addresses: vec![address],
            dns: self.config.dns.iter()
                .filter_map(|s| s.parse().ok())
                .collect(),
            listen_port: self.config.listen_port,
        })
    }
}

#[async_trait]
impl DeviceManagement for ServerList {
    async fn generate_configuration(
        &self,
        method: &ServerSelectionMethod,
        key_pair: &KeyPair,
    ) -> Result<Registration, RegistrationError> {
        let profile = self.select(method)?;
        debug!(server = %profile.name, %method, "Selected server");

        let configuration = TunnelConfiguration {
            name: profile.name.clone(),
            interface: self.interface(key_pair)?,
            peers: vec![profile.to_peer_configuration()?],
        };

        let key_expires_at = profile.registration_ttl_secs
            .and_then(|secs| chrono::Duration::try_seconds(secs.try_into().ok()?))
            .and_then(|ttl| Utc::now().checked_add_signed(ttl));

        Ok(Registration {
            configuration,
            server: profile.server_info(),
            key_expires_at,
        })
    }
}

/// Server list loading errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServerListError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported server list format")]
    UnsupportedFormat,
}
