//! Key Rotation
//!
//! Decides when the device key pair must be rotated and keeps a retry
//! timer armed while a rotation keeps failing.

use crate::error::TunnelError;
use crate::keys::KeyStore;
use crate::settings::KeySettings;
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Something that can rotate the key and reconfigure the tunnel
#[async_trait]
pub trait Rekey: Send + Sync {
    async fn rekey(&self) -> Result<(), TunnelError>;
}

/// Key expiry policy on top of a [`KeyStore`]
pub struct KeyRotation {
    keys: Arc<dyn KeyStore>,
    settings: KeySettings,
    retry_epoch: Arc<AtomicU64>,
    retry_timer: Mutex<Option<JoinHandle<()>>>,
}

impl KeyRotation {
    pub fn new(keys: Arc<dyn KeyStore>, settings: KeySettings) -> Self {
        Self {
            keys,
            settings,
            retry_epoch: Arc::new(AtomicU64::new(0)),
            retry_timer: Mutex::new(None),
        }
    }

    pub fn key_store(&self) -> &Arc<dyn KeyStore> {
        &self.keys
    }

    /// Whether the current key pair has expired
    pub fn is_expired(&self) -> bool {
        self.keys.current_key_pair().is_expired()
    }

    /// Override the key validity; `None` restores the default
    pub fn set_key_validity(&self, validity: Option<Duration>) {
        match validity {
            Some(validity) => info!(?validity, "Overriding key validity"),
            None => info!(validity = ?self.settings.validity(), "Restoring default key validity"),
        }
        self.keys.set_validity_interval(validity);
    }

    /// Delay before retrying a failed rekey: the default retry, or the
    /// key validity when that is shorter
    pub fn retry_interval(&self) -> Duration {
        self.settings.retry().min(self.keys.validity_interval())
    }

    /// Rekey through `target` only if the key has expired
    pub async fn rekey_if_expired(&self, target: &dyn Rekey) -> Result<bool, TunnelError> {
        if !self.is_expired() {
            return Ok(false);
        }

        debug!("Key expired, rekeying");
        target.rekey().await?;
        Ok(true)
    }

    fn retry_timer(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.retry_timer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arm the retry timer. When it fires, `rekey` runs unconditionally
    /// unless the timer was cancelled or re-armed in the meantime.
    pub fn schedule_retry<F>(&self, rekey: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let epoch = self.retry_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let current = Arc::clone(&self.retry_epoch);
        let delay = self.retry_interval();
        info!(?delay, "Scheduling rekey retry");

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if current.load(Ordering::SeqCst) != epoch {
                return;
            }
            // Detached: the rekey itself cancels this timer.
            tokio::spawn(rekey);
        });

        if let Some(previous) = self.retry_timer().replace(handle) {
            previous.abort();
        }
    }

    /// Cancel a pending retry. Safe to call when none is armed.
    pub fn cancel_retry(&self) {
        self.retry_epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.retry_timer().take() {
            handle.abort();
            debug!("Rekey retry cancelled");
        }
    }

    pub fn has_pending_retry(&self) -> bool {
        self.retry_timer().as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for KeyRotation {
    fn drop(&mut self) {
        if let Some(handle) = self.retry_timer().take() {
            handle.abort();
        }
    }
}
