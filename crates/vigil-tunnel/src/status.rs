//! Status Broadcasting
//!
//! Publishes connection status and server selection changes to any
//! interested observer. In-process observers subscribe to a typed
//! broadcast channel; out-of-process observers receive the same events
//! serialized as JSON through an [`IpcTransport`].
//!
//! The lifecycle controller is the only publisher.

use crate::selection::ServerInfo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Capacity of the in-process event channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Tunnel state as observed by consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected { since: DateTime<Utc> },
    /// Network configuration is being swapped; still connected
    Reasserting,
    Disconnecting,
}

impl ConnectionStatus {
    /// Connected, or briefly reasserting while connected
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected { .. } | ConnectionStatus::Reasserting)
    }

    /// Whether a tunnel session exists (started and not torn down)
    pub fn is_session_active(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::Connecting
                | ConnectionStatus::Connected { .. }
                | ConnectionStatus::Reasserting
        )
    }

    /// Time the tunnel became connected
    pub fn connected_since(&self) -> Option<DateTime<Utc>> {
        match self {
            ConnectionStatus::Connected { since } => Some(*since),
            _ => None,
        }
    }
}

/// Status change payload: status plus the time it changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatusChange {
    pub status: ConnectionStatus,
    pub changed_at: DateTime<Utc>,
}

/// Server payload. Carries location and address only, never keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusServerInfo {
    pub server_location: Option<String>,
    pub server_address: Option<String>,
}

impl From<&ServerInfo> for StatusServerInfo {
    fn from(info: &ServerInfo) -> Self {
        Self {
            server_location: Some(info.location.clone()),
            server_address: info.endpoint.map(|e| e.addr.to_string()),
        }
    }
}

/// Event delivered to in-process observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    StatusChanged(ConnectionStatusChange),
    ServerSelected(StatusServerInfo),
}

/// IPC topic an event is posted under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpcTopic {
    StatusDidChange,
    ServerSelected,
}

impl IpcTopic {
    pub fn name(&self) -> &'static str {
        match self {
            IpcTopic::StatusDidChange => "tunnel.status-did-change",
            IpcTopic::ServerSelected => "tunnel.server-selected",
        }
    }
}

/// A serialized event crossing a process boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcMessage {
    pub topic: IpcTopic,
    pub payload: Vec<u8>,
}

impl IpcMessage {
    /// Encode an event as a JSON payload
    pub fn encode(event: &StatusEvent) -> Result<Self, serde_json::Error> {
        let (topic, payload) = match event {
            StatusEvent::StatusChanged(change) => (IpcTopic::StatusDidChange, serde_json::to_vec(change)?),
            StatusEvent::ServerSelected(info) => (IpcTopic::ServerSelected, serde_json::to_vec(info)?),
        };
        Ok(Self { topic, payload })
    }

    /// Decode the event carried by this message
    pub fn decode(&self) -> Result<StatusEvent, serde_json::Error> {
        Ok(match self.topic {
            IpcTopic::StatusDidChange => StatusEvent::StatusChanged(serde_json::from_slice(&self.payload)?),
            IpcTopic::ServerSelected => StatusEvent::ServerSelected(serde_json::from_slice(&self.payload)?),
        })
    }
}

/// Outbound IPC boundary to other processes
pub trait IpcTransport: Send + Sync {
    fn send(&self, message: IpcMessage);
}

struct BroadcastState {
    status: Option<ConnectionStatus>,
    changed_at: DateTime<Utc>,
    server: Option<StatusServerInfo>,
}

/// Status & server-info publisher with strict deduplication
pub struct StatusBroadcaster {
    sender: broadcast::Sender<StatusEvent>,
    ipc: Option<Arc<dyn IpcTransport>>,
    state: Mutex<BroadcastState>,
}

impl StatusBroadcaster {
    /// Create a broadcaster without an IPC boundary
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            sender,
            ipc: None,
            state: Mutex::new(BroadcastState {
                status: None,
                changed_at: Utc::now(),
                server: None,
            }),
        }
    }

    /// Also forward every event through `ipc`
    pub fn with_ipc(mut self, ipc: Arc<dyn IpcTransport>) -> Self {
        self.ipc = Some(ipc);
        self
    }

    /// Subscribe to future events
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.sender.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, BroadcastState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish `status` if it differs from the last published status.
    ///
    /// Returns whether an event was emitted.
    pub fn publish_status(&self, status: ConnectionStatus) -> bool {
        let change = {
            let mut state = self.lock();
            if state.status == Some(status) {
                return false;
            }
            state.status = Some(status);
            state.changed_at = Utc::now();
            ConnectionStatusChange {
                status,
                changed_at: state.changed_at,
            }
        };

        debug!(?status, "Connection status changed");
        self.emit(StatusEvent::StatusChanged(change));
        true
    }

    /// Publish the newly selected server
    pub fn publish_server(&self, server: &ServerInfo) {
        let info = StatusServerInfo::from(server);
        self.lock().server = Some(info.clone());
        self.emit(StatusEvent::ServerSelected(info));
    }

    /// Re-emit the current status and server info, bypassing deduplication
    pub fn rebroadcast(&self) {
        let (change, server) = {
            let state = self.lock();
            let change = state.status.map(|status| ConnectionStatusChange {
                status,
                changed_at: state.changed_at,
            });
            (change, state.server.clone())
        };

        if let Some(change) = change {
            self.emit(StatusEvent::StatusChanged(change));
        }
        if let Some(server) = server {
            self.emit(StatusEvent::ServerSelected(server));
        }
    }

    /// Last published status
    pub fn last_status(&self) -> Option<ConnectionStatus> {
        self.lock().status
    }

    fn emit(&self, event: StatusEvent) {
        if let Some(ipc) = &self.ipc {
            match IpcMessage::encode(&event) {
                Ok(message) => ipc.send(message),
                Err(e) => warn!("Could not encode status event for IPC: {}", e),
            }
        }

        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
