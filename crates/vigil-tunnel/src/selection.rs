//! Server Selection & Failover
//!
//! Maps a [`ServerSelectionMethod`] to a concrete tunnel configuration
//! through the registration collaborator ([`DeviceManagement`]).

use crate::config::{Endpoint, TunnelConfiguration};
use crate::error::RegistrationError;
use crate::keys::{KeyPair, KeyStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info};

/// How the next server is chosen
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServerSelectionMethod {
    /// The collaborator's own policy
    Automatic,
    /// That exact server; no fallback
    PreferredServer(String),
    /// Any server but this one
    AvoidServer(String),
}

impl fmt::Display for ServerSelectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerSelectionMethod::Automatic => write!(f, "automatic"),
            ServerSelectionMethod::PreferredServer(name) => write!(f, "preferred:{}", name),
            ServerSelectionMethod::AvoidServer(name) => write!(f, "avoid:{}", name),
        }
    }
}

/// The relay a configuration was generated for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub name: String,
    pub location: String,
    pub endpoint: Option<Endpoint>,
    /// Peer public key (base64)
    pub public_key: String,
}

/// A successful registration
#[derive(Debug, Clone)]
pub struct Registration {
    pub configuration: TunnelConfiguration,
    pub server: ServerInfo,
    /// When the server drops our key registration, if it says
    pub key_expires_at: Option<DateTime<Utc>>,
}

/// Registration / device-management collaborator
#[async_trait]
pub trait DeviceManagement: Send + Sync {
    /// Register `key_pair` with a server picked by `method` and build a
    /// configuration for it
    async fn generate_configuration(
        &self,
        method: &ServerSelectionMethod,
        key_pair: &KeyPair,
    ) -> Result<Registration, RegistrationError>;
}

/// The user's persistent server choice
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SelectedServer {
    #[default]
    Automatic,
    Endpoint(String),
}

impl SelectedServer {
    /// Server name, if one was picked
    pub fn name(&self) -> Option<&str> {
        match self {
            SelectedServer::Automatic => None,
            SelectedServer::Endpoint(name) => Some(name),
        }
    }

    /// Selection method this choice implies
    pub fn selection_method(&self) -> ServerSelectionMethod {
        match self {
            SelectedServer::Automatic => ServerSelectionMethod::Automatic,
            SelectedServer::Endpoint(name) => ServerSelectionMethod::PreferredServer(name.clone()),
        }
    }
}

/// Injected store for the selected server
#[derive(Debug, Default)]
pub struct SelectedServerStore {
    selected: RwLock<SelectedServer>,
}

impl SelectedServerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> SelectedServer {
        match self.selected.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set(&self, selected: SelectedServer) {
        match self.selected.write() {
            Ok(mut guard) => *guard = selected,
            Err(poisoned) => *poisoned.into_inner() = selected,
        }
    }
}

/// Produces tunnel configurations for selection methods
pub struct ServerSelector {
    devices: Arc<dyn DeviceManagement>,
    keys: Arc<dyn KeyStore>,
    timeout: Duration,
}

impl ServerSelector {
    pub fn new(
        devices: Arc<dyn DeviceManagement>,
        keys: Arc<dyn KeyStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            devices,
            keys,
            timeout,
        }
    }

    /// Generate a configuration for `method` using the current key pair.
    ///
    /// Registration failures propagate as is; `PreferredServer` never
    /// falls back to another server.
    pub async fn generate(
        &self,
        method: &ServerSelectionMethod,
    ) -> Result<(TunnelConfiguration, ServerInfo), RegistrationError> {
        let key_pair = self.keys.current_key_pair();
        debug!(%method, "Generating tunnel configuration");

        let registration = tokio::time::timeout(
            self.timeout,
            self.devices.generate_configuration(method, &key_pair),
        )
        .await
        .map_err(|_| RegistrationError::Timeout(self.timeout))??;

        if let Some(server_expiration) = registration.key_expires_at {
            if key_pair.expires_at > server_expiration {
                debug!(%server_expiration, "Server registration expires first, shortening key validity");
                self.keys.update_current_key_pair(server_expiration);
            }
        }

        info!(
            server = %registration.server.name,
            location = %registration.server.location,
            "Generated tunnel configuration"
        );

        Ok((registration.configuration, registration.server))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::MemoryKeyStore;
    use crate::testing::FakeDeviceManager;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn selector(devices: Arc<FakeDeviceManager>, keys: Arc<MemoryKeyStore>) -> ServerSelector {
        ServerSelector::new(devices, keys, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_avoid_server_picks_another() {
        let devices = Arc::new(FakeDeviceManager::with_servers(&["X", "Y"]));
        let selector = selector(devices, Arc::new(MemoryKeyStore::new(DAY)));

        let (_, server) = selector
            .generate(&ServerSelectionMethod::AvoidServer("X".into()))
            .await
            .unwrap();

        assert_ne!(server.name, "X");
    }

    #[tokio::test]
    async fn test_preferred_server_does_not_fall_back() {
        let devices = Arc::new(FakeDeviceManager::with_servers(&["X", "Y"]));
        let selector = selector(devices, Arc::new(MemoryKeyStore::new(DAY)));

        let result = selector
            .generate(&ServerSelectionMethod::PreferredServer("Z".into()))
            .await;

        assert_eq!(result.unwrap_err(), RegistrationError::UnknownServer("Z".into()));
    }

    #[tokio::test]
    async fn test_server_expiration_shortens_key() {
        let devices = Arc::new(FakeDeviceManager::with_servers(&["X"]));
        let expiry = Utc::now() + chrono::Duration::hours(1);
        devices.set_key_expiry(Some(expiry));
        let keys = Arc::new(MemoryKeyStore::new(DAY));
        let selector = selector(devices, keys.clone());

        selector.generate(&ServerSelectionMethod::Automatic).await.unwrap();

        assert_eq!(keys.current_key_pair().expires_at, expiry);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_timeout() {
        let devices = Arc::new(FakeDeviceManager::with_servers(&["X"]));
        devices.set_delay(Duration::from_secs(60));
        let selector = selector(devices, Arc::new(MemoryKeyStore::new(DAY)));

        let result = selector.generate(&ServerSelectionMethod::Automatic).await;
        assert_eq!(result.unwrap_err(), RegistrationError::Timeout(Duration::from_secs(5)));
    }

    #[test]
    fn test_selected_server_round_trip() {
        let store = SelectedServerStore::new();
        assert_eq!(store.get().selection_method(), ServerSelectionMethod::Automatic);

        store.set(SelectedServer::Endpoint("egress.fra.1".into()));
        assert_eq!(
            store.get().selection_method(),
            ServerSelectionMethod::PreferredServer("egress.fra.1".into())
        );
        assert_eq!(store.get().name(), Some("egress.fra.1"));
    }
}
