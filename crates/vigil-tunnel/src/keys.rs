//! WireGuard Key Management
//!
//! X25519 key pairs with an expiration date, and the key store that
//! owns the single current key pair of a device.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

/// WireGuard private key (Curve25519)
#[derive(Clone)]
pub struct PrivateKey {
    secret: StaticSecret,
}

impl PrivateKey {
    /// Generate a new random private key
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            secret: StaticSecret::from(bytes),
        }
    }

    /// Create from base64 string
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        Ok(Self::from_bytes(decode_key(s)?))
    }

    /// Get the corresponding public key
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            key: X25519Public::from(&self.secret),
        }
    }

    /// Get raw bytes
    pub fn to_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey([redacted])")
    }
}

/// WireGuard public key (Curve25519)
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PublicKey {
    key: X25519Public,
}

impl PublicKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            key: X25519Public::from(bytes),
        }
    }

    /// Create from base64 string
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        Ok(Self::from_bytes(decode_key(s)?))
    }

    /// Get raw bytes
    pub fn to_bytes(&self) -> [u8; 32] {
        self.key.to_bytes()
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}...)", &self.to_base64()[..8])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

fn decode_key(s: &str) -> Result<[u8; 32], KeyError> {
    let bytes = BASE64.decode(s)
        .map_err(|_| KeyError::InvalidBase64)?;

    bytes.try_into().map_err(|_| KeyError::InvalidLength)
}

/// The device key pair registered with relay servers
#[derive(Clone)]
pub struct KeyPair {
    pub private: PrivateKey,
    pub public: PublicKey,
    /// After this instant the pair must be rotated
    pub expires_at: DateTime<Utc>,
}

impl KeyPair {
    /// Generate a new random key pair valid for `validity` from now
    pub fn generate(validity: Duration) -> Self {
        let private = PrivateKey::generate();
        let public = private.public_key();
        Self {
            private,
            public,
            expires_at: expiration_from_now(validity),
        }
    }

    /// Check whether the pair has expired
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

fn expiration_from_now(validity: Duration) -> DateTime<Utc> {
    let validity = chrono::Duration::from_std(validity).unwrap_or(chrono::Duration::MAX);
    Utc::now().checked_add_signed(validity).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Storage for the device's current key pair
///
/// Implementations must guarantee that at most one current key pair
/// exists and that replacing it is atomic.
pub trait KeyStore: Send + Sync {
    /// Current key pair, generating one if none exists yet
    fn current_key_pair(&self) -> KeyPair;

    /// Drop the current key pair and install a freshly generated one
    fn reset_current_key_pair(&self) -> KeyPair;

    /// Shorten or extend the current pair's expiration
    fn update_current_key_pair(&self, new_expiration: DateTime<Utc>) -> KeyPair;

    /// Override the validity used for newly generated pairs.
    /// `None` restores the default validity.
    fn set_validity_interval(&self, validity: Option<Duration>);

    /// Validity used for newly generated pairs
    fn validity_interval(&self) -> Duration;
}

/// In-process key store
pub struct MemoryKeyStore {
    default_validity: Duration,
    state: Mutex<KeyStoreState>,
}

struct KeyStoreState {
    current: Option<KeyPair>,
    validity: Option<Duration>,
}

impl MemoryKeyStore {
    /// Create an empty store whose pairs are valid for `default_validity`
    pub fn new(default_validity: Duration) -> Self {
        Self {
            default_validity,
            state: Mutex::new(KeyStoreState {
                current: None,
                validity: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, KeyStoreState> {
        // The state holds no invariants a panicking writer could break.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn validity_of(&self, state: &KeyStoreState) -> Duration {
        state.validity.unwrap_or(self.default_validity)
    }
}

impl KeyStore for MemoryKeyStore {
    fn current_key_pair(&self) -> KeyPair {
        let mut state = self.lock();
        if let Some(pair) = &state.current {
            return pair.clone();
        }

        let pair = KeyPair::generate(self.validity_of(&state));
        debug!(expires_at = %pair.expires_at, "Generated initial key pair");
        state.current = Some(pair.clone());
        pair
    }

    fn reset_current_key_pair(&self) -> KeyPair {
        let mut state = self.lock();
        let pair = KeyPair::generate(self.validity_of(&state));
        info!(expires_at = %pair.expires_at, "Replaced current key pair");
        state.current = Some(pair.clone());
        pair
    }

    fn update_current_key_pair(&self, new_expiration: DateTime<Utc>) -> KeyPair {
        let mut state = self.lock();
        let mut pair = match state.current.take() {
            Some(pair) => pair,
            None => KeyPair::generate(self.validity_of(&state)),
        };
        pair.expires_at = new_expiration;
        state.current = Some(pair.clone());
        pair
    }

    fn set_validity_interval(&self, validity: Option<Duration>) {
        let mut state = self.lock();
        state.validity = validity;

        // A shorter validity applies to the current pair right away.
        let validity = self.validity_of(&state);
        let limit = expiration_from_now(validity);
        if let Some(pair) = state.current.as_mut() {
            if pair.expires_at > limit {
                pair.expires_at = limit;
            }
        }
    }

    fn validity_interval(&self) -> Duration {
        let state = self.lock();
        self.validity_of(&state)
    }
}

/// Key parsing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("Invalid base64 encoding")]
    InvalidBase64,

    #[error("Invalid key length (expected 32 bytes)")]
    InvalidLength,
}
