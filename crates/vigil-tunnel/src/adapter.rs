//! Tunnel Adapter Boundary
//!
//! The cryptographic transport is a black box: it applies a
//! configuration to an interface and reports byte counters. Only the
//! lifecycle controller calls into it.

use crate::config::TunnelConfiguration;
use crate::error::AdapterError;
use async_trait::async_trait;

/// Cryptographic tunnel adapter
#[async_trait]
pub trait TunnelAdapter: Send + Sync {
    /// Bring the tunnel up with `configuration`
    async fn start(&self, configuration: &TunnelConfiguration) -> Result<(), AdapterError>;

    async fn stop(&self) -> Result<(), AdapterError>;

    /// Replace the configuration in place.
    ///
    /// With `reassert` the host network stack is told the tunnel is
    /// being re-established; without it the swap is invisible.
    async fn update(&self, configuration: &TunnelConfiguration, reassert: bool) -> Result<(), AdapterError>;

    /// Total `(rx, tx)` bytes since the adapter started
    async fn byte_counters(&self) -> Result<(u64, u64), AdapterError>;

    /// Name of the interface the adapter is driving, once started
    fn interface_name(&self) -> Option<String>;

    /// Adapter's view of its running configuration
    async fn runtime_configuration(&self) -> Option<String>;
}
