//! Signing-key lifecycle: generation, atomic rotation and grace-window
//! retirement.
//!
//! Exactly one key signs at any time. Rotation retires the current signer and
//! activates a fresh one inside a single locked section, so verifiers never
//! observe a state without an active key. Retired keys keep verifying tokens
//! until the grace window elapses, after which they are purged; the window is
//! validated at configuration time to cover the access-token lifetime.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey};
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{info, instrument};
use zeroize::Zeroizing;

use crate::config::KeyRotationConfig;
use crate::errors::{AuthError, AuthResult};

const MAX_KEY_EVENTS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum KeyState {
    Active,
    Retired,
}

/// An Ed25519 signing key. Private material stays in a zeroized buffer and
/// never leaves this module except wrapped in a [`jsonwebtoken`] key handle.
#[derive(Clone)]
pub struct SigningKey {
    pub kid: String,
    pub algorithm: Algorithm,
    pkcs8_der: Zeroizing<Vec<u8>>,
    public_der: Vec<u8>,
    pub state: KeyState,
    pub created_at: DateTime<Utc>,
    pub retired_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .field("state", &self.state)
            .field("created_at", &self.created_at)
            .field("retired_at", &self.retired_at)
            .finish_non_exhaustive()
    }
}

impl SigningKey {
    fn generate() -> AuthResult<Self> {
        let rng = SystemRandom::new();
        let document = Ed25519KeyPair::generate_pkcs8(&rng)?;
        let pair = Ed25519KeyPair::from_pkcs8(document.as_ref()).map_err(|e| AuthError::Crypto {
            reason: format!("ed25519 keypair: {e}"),
        })?;
        let public_der = pair.public_key().as_ref().to_vec();
        let kid = derive_kid(&public_der);
        Ok(Self {
            kid,
            algorithm: Algorithm::EdDSA,
            pkcs8_der: Zeroizing::new(document.as_ref().to_vec()),
            public_der,
            state: KeyState::Active,
            created_at: Utc::now(),
            retired_at: None,
        })
    }

    pub fn encoding_key(&self) -> EncodingKey {
        EncodingKey::from_ed_der(&self.pkcs8_der)
    }

    pub fn decoding_key(&self) -> DecodingKey {
        DecodingKey::from_ed_der(&self.public_der)
    }

    fn is_purgeable(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        self.state == KeyState::Retired
            && self.retired_at.map_or(false, |at| now - at > grace)
    }
}

fn derive_kid(public_der: &[u8]) -> String {
    let digest = Sha256::digest(public_der);
    hex::encode(&digest[..8])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum KeyEventKind {
    Generated,
    Activated,
    Retired,
    Purged,
}

/// Bounded in-memory trail of key lifecycle changes, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct KeyEvent {
    pub at: DateTime<Utc>,
    pub kid: String,
    pub kind: KeyEventKind,
}

/// Metadata view of a key, without material.
#[derive(Debug, Clone, Serialize)]
pub struct KeyInfo {
    pub kid: String,
    pub state: KeyState,
    pub created_at: DateTime<Utc>,
    pub retired_at: Option<DateTime<Utc>>,
}

/// Owns the signing-key ring. Injected into the token service rather than
/// living in a process-wide singleton, so tests run with isolated material.
pub struct KeyManager {
    keys: RwLock<HashMap<String, SigningKey>>,
    active_kid: RwLock<String>,
    decoder_cache: DashMap<String, DecodingKey>,
    events: Mutex<VecDeque<KeyEvent>>,
    grace: Duration,
}

impl fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyManager")
            .field("grace", &self.grace)
            .finish_non_exhaustive()
    }
}

impl KeyManager {
    /// Generates the initial active key. RNG failure here is fatal; the
    /// subsystem must not start without a signer.
    pub fn new(config: &KeyRotationConfig) -> AuthResult<Self> {
        let key = SigningKey::generate()?;
        let kid = key.kid.clone();
        let manager = Self {
            decoder_cache: DashMap::new(),
            events: Mutex::new(VecDeque::new()),
            grace: config.grace_period(),
            keys: RwLock::new(HashMap::from([(kid.clone(), key)])),
            active_kid: RwLock::new(kid.clone()),
        };
        manager.push_event(&kid, KeyEventKind::Generated);
        manager.push_event(&kid, KeyEventKind::Activated);
        Ok(manager)
    }

    /// The current signer as a (kid, key) pair ready for JWT encoding.
    pub async fn current_signer(&self) -> AuthResult<(String, EncodingKey)> {
        let kid = self.active_kid.read().await.clone();
        let keys = self.keys.read().await;
        let key = keys
            .get(&kid)
            .ok_or_else(|| AuthError::internal("active kid missing from key ring"))?;
        let encoder = key.encoding_key();
        Ok((kid, encoder))
    }

    pub async fn active_key(&self) -> AuthResult<SigningKey> {
        let kid = self.active_kid.read().await.clone();
        let keys = self.keys.read().await;
        keys.get(&kid)
            .cloned()
            .ok_or_else(|| AuthError::internal("active kid missing from key ring"))
    }

    pub async fn key_by_id(&self, kid: &str) -> Option<SigningKey> {
        self.keys.read().await.get(kid).cloned()
    }

    /// Verification key for a token's kid. Retired keys resolve until purged,
    /// which is what keeps rotation invisible to already-issued tokens.
    pub async fn decoder_for(&self, kid: &str) -> AuthResult<DecodingKey> {
        if let Some(cached) = self.decoder_cache.get(kid) {
            return Ok(cached.clone());
        }
        let keys = self.keys.read().await;
        match keys.get(kid) {
            Some(key) => {
                let decoder = key.decoding_key();
                self.decoder_cache.insert(kid.to_string(), decoder.clone());
                Ok(decoder)
            }
            None => Err(AuthError::InvalidToken {
                reason: format!("unknown signing key {kid}"),
            }),
        }
    }

    /// Retires the current signer and activates a fresh key. The swap runs
    /// with both write guards held, so no reader can observe zero active
    /// keys.
    #[instrument(skip(self))]
    pub async fn rotate(&self) -> AuthResult<String> {
        let new_key = SigningKey::generate()?;
        let new_kid = new_key.kid.clone();
        let retired_kid;
        {
            let mut keys = self.keys.write().await;
            let mut active = self.active_kid.write().await;
            retired_kid = active.clone();
            if let Some(old) = keys.get_mut(&retired_kid) {
                old.state = KeyState::Retired;
                old.retired_at = Some(Utc::now());
            }
            self.decoder_cache
                .insert(new_kid.clone(), new_key.decoding_key());
            keys.insert(new_kid.clone(), new_key);
            *active = new_kid.clone();
        }
        self.push_event(&new_kid, KeyEventKind::Generated);
        self.push_event(&new_kid, KeyEventKind::Activated);
        self.push_event(&retired_kid, KeyEventKind::Retired);
        info!(
            retired_kid = %retired_kid,
            new_kid = %new_kid,
            "Rotated signing key"
        );
        Ok(new_kid)
    }

    /// Drops retired keys whose grace window has elapsed. The active key is
    /// never purged.
    pub async fn purge_expired(&self) -> AuthResult<Vec<String>> {
        let now = Utc::now();
        let purged: Vec<String>;
        {
            let mut keys = self.keys.write().await;
            let active = self.active_kid.read().await.clone();
            purged = keys
                .iter()
                .filter(|(kid, key)| **kid != active && key.is_purgeable(now, self.grace))
                .map(|(kid, _)| kid.clone())
                .collect();
            for kid in &purged {
                keys.remove(kid);
                self.decoder_cache.remove(kid);
            }
        }
        for kid in &purged {
            self.push_event(kid, KeyEventKind::Purged);
        }
        if !purged.is_empty() {
            info!(count = purged.len(), "Purged retired signing keys");
        }
        Ok(purged)
    }

    pub async fn verification_keys(&self) -> Vec<KeyInfo> {
        let keys = self.keys.read().await;
        let mut infos: Vec<KeyInfo> = keys
            .values()
            .map(|k| KeyInfo {
                kid: k.kid.clone(),
                state: k.state,
                created_at: k.created_at,
                retired_at: k.retired_at,
            })
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    pub fn events(&self) -> Vec<KeyEvent> {
        self.events
            .lock()
            .map(|events| events.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn push_event(&self, kid: &str, kind: KeyEventKind) {
        if let Ok(mut events) = self.events.lock() {
            events.push_back(KeyEvent {
                at: Utc::now(),
                kid: kid.to_string(),
                kind,
            });
            while events.len() > MAX_KEY_EVENTS {
                events.pop_front();
            }
        }
    }
}
