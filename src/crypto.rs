//! Cryptographic primitives: Argon2id password hashing, policy checks and
//! secure random material for token ids.

use std::fmt;

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::seq::SliceRandom;
use rand::Rng;
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::config::{Argon2Config, PasswordPolicy};
use crate::errors::{AuthError, AuthResult};

const MAX_RNG_RETRIES: usize = 3;

const UPPERCASE: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const LOWERCASE: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const DIGITS: &[u8] = b"0123456789";
const SPECIAL: &[u8] = b"!@#$%^&*()-_=+[]{};:,.<>?";

/// Fills a buffer from the OS entropy source, retrying transient failures.
pub fn secure_bytes(len: usize) -> AuthResult<Zeroizing<Vec<u8>>> {
    let rng = SystemRandom::new();
    let mut bytes = Zeroizing::new(vec![0u8; len]);
    let mut attempts = 0;
    loop {
        match rng.fill(&mut bytes) {
            Ok(()) => return Ok(bytes),
            Err(err) => {
                attempts += 1;
                if attempts >= MAX_RNG_RETRIES {
                    return Err(err.into());
                }
            }
        }
    }
}

/// Unguessable URL-safe token string from `byte_length` random bytes.
pub fn secure_token(byte_length: usize) -> AuthResult<String> {
    let bytes = secure_bytes(byte_length)?;
    Ok(URL_SAFE_NO_PAD.encode(bytes.as_slice()))
}

/// SHA-256 digest of a token, hex encoded. Refresh tokens are stored and
/// linked under this digest so a dumped store never yields replayable values.
pub fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Password hashing and policy enforcement.
///
/// Hashes are Argon2id PHC strings with a fresh random salt per call. A
/// mismatched password verifies to `Ok(false)`; `Err` is reserved for broken
/// stored material or parameter misconfiguration.
pub struct CryptoService {
    argon2: Argon2<'static>,
    policy: PasswordPolicy,
}

impl fmt::Debug for CryptoService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoService")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl CryptoService {
    pub fn new(params: &Argon2Config, policy: PasswordPolicy) -> AuthResult<Self> {
        let params = Params::new(params.memory_kib, params.iterations, params.parallelism, None)
            .map_err(|e| AuthError::Crypto {
                reason: format!("argon2 params: {e}"),
            })?;
        Ok(Self {
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
            policy,
        })
    }

    pub fn hash_password(&self, plaintext: &str) -> AuthResult<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self.argon2.hash_password(plaintext.as_bytes(), &salt)?;
        Ok(hash.to_string())
    }

    pub fn verify_password(&self, plaintext: &str, stored_hash: &str) -> AuthResult<bool> {
        let parsed = PasswordHash::new(stored_hash)?;
        match self.argon2.verify_password(plaintext.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(other) => Err(other.into()),
        }
    }

    /// Checks a candidate password against the configured policy.
    pub fn validate_password_strength(&self, plaintext: &str) -> AuthResult<()> {
        let mut failures = Vec::new();
        if plaintext.chars().count() < self.policy.min_length {
            failures.push(format!("at least {} characters", self.policy.min_length));
        }
        if self.policy.require_uppercase && !plaintext.chars().any(|c| c.is_ascii_uppercase()) {
            failures.push("an uppercase letter".to_string());
        }
        if self.policy.require_lowercase && !plaintext.chars().any(|c| c.is_ascii_lowercase()) {
            failures.push("a lowercase letter".to_string());
        }
        if self.policy.require_digit && !plaintext.chars().any(|c| c.is_ascii_digit()) {
            failures.push("a digit".to_string());
        }
        if self.policy.require_special
            && !plaintext
                .chars()
                .any(|c| !c.is_alphanumeric() && !c.is_whitespace())
        {
            failures.push("a special character".to_string());
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(AuthError::WeakPassword {
                reason: format!("password needs {}", failures.join(", ")),
            })
        }
    }

    /// Generates a temporary password satisfying the configured policy, for
    /// admin-driven reset flows.
    pub fn generate_temp_password(&self) -> String {
        let length = self.policy.min_length.max(16);
        let mut rng = rand::thread_rng();
        let mut chars: Vec<u8> = Vec::with_capacity(length);

        // One character from every required class up front, filler after.
        if self.policy.require_uppercase {
            chars.push(UPPERCASE[rng.gen_range(0..UPPERCASE.len())]);
        }
        if self.policy.require_lowercase {
            chars.push(LOWERCASE[rng.gen_range(0..LOWERCASE.len())]);
        }
        if self.policy.require_digit {
            chars.push(DIGITS[rng.gen_range(0..DIGITS.len())]);
        }
        if self.policy.require_special {
            chars.push(SPECIAL[rng.gen_range(0..SPECIAL.len())]);
        }
        let alphabet: Vec<u8> = [UPPERCASE, LOWERCASE, DIGITS, SPECIAL].concat();
        while chars.len() < length {
            chars.push(alphabet[rng.gen_range(0..alphabet.len())]);
        }
        chars.shuffle(&mut rng);
        String::from_utf8(chars).unwrap_or_default()
    }

    pub fn random_token(&self, byte_length: usize) -> AuthResult<String> {
        secure_token(byte_length)
    }

    pub fn policy(&self) -> &PasswordPolicy {
        &self.policy
    }
}
