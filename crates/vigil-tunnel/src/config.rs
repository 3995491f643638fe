//! Tunnel Configuration
//!
//! The bundle handed to the cryptographic adapter: our interface
//! (private key, addresses, DNS) and the relay peers.
//! A configuration is immutable once built; rekey and failover
//! replace it as a whole.

use crate::keys::{PrivateKey, PublicKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

/// Network endpoint (IP + port)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// IP address
    pub addr: IpAddr,
    /// UDP port
    pub port: u16,
}

impl Endpoint {
    /// Create a new endpoint
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self { addr, port }
    }

    /// Create from IPv4 address
    pub fn ipv4(a: u8, b: u8, c: u8, d: u8, port: u16) -> Self {
        Self {
            addr: IpAddr::V4(Ipv4Addr::new(a, b, c, d)),
            port,
        }
    }

    /// Convert to SocketAddr
    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_socket_addr())
    }
}

/// An address with a prefix length, e.g. `10.64.0.2/32`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpAddressRange {
    pub addr: IpAddr,
    pub prefix: u8,
}

impl IpAddressRange {
    /// Every IPv4 address
    pub const ALL_V4: Self = Self {
        addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        prefix: 0,
    };

    /// Every IPv6 address
    pub const ALL_V6: Self = Self {
        addr: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        prefix: 0,
    };

    fn max_prefix(addr: &IpAddr) -> u8 {
        match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        }
    }
}

impl FromStr for IpAddressRange {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };

        let addr: IpAddr = addr.trim().parse()
            .map_err(|_| ConfigError::InvalidAddressRange(s.to_string()))?;
        let max = Self::max_prefix(&addr);
        let prefix = match prefix {
            Some(p) => p.trim().parse::<u8>()
                .ok()
                .filter(|p| *p <= max)
                .ok_or_else(|| ConfigError::InvalidAddressRange(s.to_string()))?,
            None => max,
        };

        Ok(Self { addr, prefix })
    }
}

impl fmt::Display for IpAddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// Our side of the tunnel
#[derive(Debug, Clone)]
pub struct InterfaceConfiguration {
    pub private_key: PrivateKey,
    pub addresses: Vec<IpAddressRange>,
    pub dns: Vec<IpAddr>,
    pub listen_port: Option<u16>,
}

/// WireGuard peer configuration
#[derive(Debug, Clone)]
pub struct PeerConfiguration {
    /// Peer's public key
    pub public_key: PublicKey,
    /// Peer's endpoint
    pub endpoint: Endpoint,
    /// What traffic to route through this peer
    pub allowed_ips: Vec<IpAddressRange>,
    /// Persistent keepalive interval (seconds)
    pub keepalive: Option<u16>,
}

impl PeerConfiguration {
    /// Create a peer that routes all traffic
    pub fn new(public_key: PublicKey, endpoint: Endpoint) -> Self {
        Self {
            public_key,
            endpoint,
            allowed_ips: vec![IpAddressRange::ALL_V4, IpAddressRange::ALL_V6],
            keepalive: Some(25),
        }
    }
}

/// Complete adapter configuration
#[derive(Debug, Clone)]
pub struct TunnelConfiguration {
    pub name: String,
    pub interface: InterfaceConfiguration,
    pub peers: Vec<PeerConfiguration>,
}

impl TunnelConfiguration {
    /// Endpoint of the first peer
    pub fn primary_endpoint(&self) -> Option<Endpoint> {
        self.peers.first().map(|p| p.endpoint)
    }

    /// Public key the interface was configured with
    pub fn interface_public_key(&self) -> PublicKey {
        self.interface.private_key.public_key()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.peers.is_empty() {
            return Err(ConfigError::NoPeers);
        }
        if self.interface.addresses.is_empty() {
            return Err(ConfigError::NoInterfaceAddress);
        }
        if self.peers.iter().any(|p| p.endpoint.port == 0) {
            return Err(ConfigError::InvalidPort);
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid peer port")]
    InvalidPort,

    #[error("Configuration has no peers")]
    NoPeers,

    #[error("Configuration has no interface address")]
    NoInterfaceAddress,

    #[error("Invalid address range: {0}")]
    InvalidAddressRange(String),
}
