//! User Notifications
//!
//! Presentation is out of scope; the controller only decides when a
//! notification is due and hands it to a [`Notifications`] implementation.

use tracing::{info, warn};

/// Notification presenter
pub trait Notifications: Send + Sync {
    /// The tunnel lost connectivity and is trying to recover
    fn show_reconnecting(&self);
    /// Connectivity came back
    fn show_reconnected(&self);
    /// Recovery failed and the tunnel was stopped
    fn show_connection_failure(&self);
    /// Another tunnel configuration took over
    fn show_superseded(&self);
    fn show_test(&self);
}

/// Logs notifications instead of presenting them
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifications;

impl Notifications for LogNotifications {
    fn show_reconnecting(&self) {
        warn!("Connection interrupted, attempting to reconnect");
    }

    fn show_reconnected(&self) {
        info!("Connection restored");
    }

    fn show_connection_failure(&self) {
        warn!("Unable to reconnect, the tunnel was stopped");
    }

    fn show_superseded(&self) {
        info!("Tunnel disconnected because another configuration took over");
    }

    fn show_test(&self) {
        info!("Test notification");
    }
}
