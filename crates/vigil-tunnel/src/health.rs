//! Tunnel Health
//!
//! Small shared state objects the controller updates and app messages
//! read back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Whether the tunnel is currently having connectivity issues
#[derive(Debug, Default)]
pub struct TunnelHealth {
    connectivity_issues: AtomicBool,
}

impl TunnelHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_having_connectivity_issues(&self) -> bool {
        self.connectivity_issues.load(Ordering::SeqCst)
    }

    pub fn set_connectivity_issues(&self, issues: bool) {
        if self.connectivity_issues.swap(issues, Ordering::SeqCst) != issues {
            debug!(issues, "Tunnel health changed");
        }
    }
}

/// Last error message recorded by the controller
#[derive(Debug, Default)]
pub struct ErrorStore {
    last_error: Mutex<Option<String>>,
}

impl ErrorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<String>> {
        self.last_error.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().clone()
    }

    pub fn record(&self, error: &impl std::fmt::Display) {
        *self.lock() = Some(error.to_string());
    }

    pub fn clear(&self) {
        *self.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TunnelError;

    #[test]
    fn test_health_flag() {
        let health = TunnelHealth::new();
        assert!(!health.is_having_connectivity_issues());

        health.set_connectivity_issues(true);
        assert!(health.is_having_connectivity_issues());
    }

    #[test]
    fn test_error_store() {
        let store = ErrorStore::new();
        store.record(&TunnelError::CouldNotFixConnection);
        assert_eq!(store.last_error().as_deref(), Some("Could not fix the tunnel connection"));

        store.clear();
        assert!(store.last_error().is_none());
    }
}
