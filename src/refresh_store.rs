//! Refresh-token persistence and rotation.
//!
//! Tokens are stored hashed: the record id is the SHA-256 digest of the raw
//! token, and the raw value exists only in the response that delivered it.
//! Each rotation links a successor record into the same chain, identified by
//! the digest of the chain's first token. Rotation itself is a compare-and-set
//! on the presented record, so under concurrent presentation exactly one
//! caller wins; a presented token that was already used is treated as replay
//! evidence and poisons the entire chain.
//!
//! Two stores implement the capability trait: Redis for shared deployments
//! (single Lua script per mutation, TTL-based expiry) and an in-process map
//! that doubles as the degradation fallback when Redis is unreachable.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

use crate::audit::{AuditLogger, SecurityEvent, SecurityEventType, SecuritySeverity};
use crate::config::StoreConfig;
use crate::crypto::{secure_token, token_digest};
use crate::errors::{AuthError, AuthResult};
use crate::user::UserId;

/// Raw refresh tokens carry 32 bytes of entropy.
const REFRESH_TOKEN_BYTES: usize = 32;

const RECORD_PREFIX: &str = "auth:refresh:";
const CHAIN_PREFIX: &str = "auth:refresh:chain:";
const USER_PREFIX: &str = "auth:refresh:user:";

fn record_key(digest: &str) -> String {
    format!("{RECORD_PREFIX}{digest}")
}

fn chain_key(chain_root: &str) -> String {
    format!("{CHAIN_PREFIX}{chain_root}")
}

fn user_key(user_id: &UserId) -> String {
    format!("{USER_PREFIX}{user_id}")
}

// ---------------------------------------------------------------------------
// Record and rotation outcome
// ---------------------------------------------------------------------------

/// Stored representation of one refresh token. `id` and `chain_root` are
/// token digests, never raw tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshTokenRecord {
    pub id: String,
    pub user_id: UserId,
    pub chain_root: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    pub revoked: bool,
    pub successor: Option<String>,
}

impl RefreshTokenRecord {
    /// Generates a fresh raw token and its record. Passing no chain root
    /// starts a new chain; the record then roots itself.
    pub fn mint(
        user_id: &UserId,
        chain_root: Option<&str>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> AuthResult<(String, Self)> {
        let raw = secure_token(REFRESH_TOKEN_BYTES)?;
        let id = token_digest(&raw);
        let chain_root = chain_root.map(str::to_string).unwrap_or_else(|| id.clone());
        let record = Self {
            id,
            user_id: *user_id,
            chain_root,
            issued_at: now,
            expires_at: now + ttl,
            used: false,
            revoked: false,
            successor: None,
        };
        Ok((raw, record))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Result of a compare-and-set rotation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotateOutcome {
    /// This caller won; the presented record is marked used and the successor
    /// is stored.
    Rotated,
    /// No record for the presented digest. Redis also reports TTL-expired
    /// tokens this way, since expiry deletes the key.
    Missing,
    /// The presented token was already rotated: replay evidence.
    AlreadyUsed,
    Revoked,
    /// Present but past its expiry. Only the in-process store produces this;
    /// it keeps records until swept.
    Expired,
}

// ---------------------------------------------------------------------------
// Capability trait
// ---------------------------------------------------------------------------

/// Storage capability for refresh-token records. Implementations must make
/// [`TokenRecordStore::rotate_cas`] atomic with respect to concurrent calls
/// presenting the same digest.
#[async_trait]
pub trait TokenRecordStore: Send + Sync + fmt::Debug {
    async fn put(&self, record: &RefreshTokenRecord, ttl: StdDuration) -> AuthResult<()>;
    /// Fetches by digest. Expired records are returned as stored; expiry
    /// policy belongs to the caller.
    async fn get(&self, digest: &str) -> AuthResult<Option<RefreshTokenRecord>>;
    /// Atomically marks the presented record used and stores its successor.
    async fn rotate_cas(
        &self,
        presented: &str,
        successor: &RefreshTokenRecord,
        ttl: StdDuration,
    ) -> AuthResult<RotateOutcome>;
    /// Marks one record revoked. Returns whether the call changed anything.
    async fn revoke(&self, digest: &str) -> AuthResult<bool>;
    /// Revokes every record in a chain, returning how many transitioned.
    async fn revoke_chain(&self, chain_root: &str) -> AuthResult<u64>;
    /// Revokes every chain belonging to the user.
    async fn revoke_all_for_user(&self, user_id: &UserId) -> AuthResult<u64>;
    /// All records of a chain, oldest first.
    async fn list_chain(&self, chain_root: &str) -> AuthResult<Vec<RefreshTokenRecord>>;
    async fn ping(&self) -> AuthResult<()>;
}

// ---------------------------------------------------------------------------
// In-process implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct TokenTables {
    records: HashMap<String, RefreshTokenRecord>,
    chains: HashMap<String, Vec<String>>,
    user_chains: HashMap<UserId, Vec<String>>,
}

impl TokenTables {
    fn revoke_chain(&mut self, chain_root: &str) -> u64 {
        let mut count = 0;
        if let Some(digests) = self.chains.get(chain_root) {
            for digest in digests {
                if let Some(record) = self.records.get_mut(digest) {
                    if !record.revoked {
                        record.revoked = true;
                        count += 1;
                    }
                }
            }
        }
        count
    }
}

/// Process-local token store. Primary in single-node setups, fallback when a
/// configured Redis is unreachable. All state sits behind one lock so the
/// rotation compare-and-set is a single critical section.
#[derive(Debug, Default)]
pub struct InMemoryTokenStore {
    inner: RwLock<TokenTables>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops expired records, pruning emptied chains and user indexes.
    /// Mirrors what Redis TTLs do on their own.
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut guard = self.inner.write().await;
        let tables = &mut *guard;
        let before = tables.records.len();
        tables.records.retain(|_, record| !record.is_expired(now));
        let records = &tables.records;
        for digests in tables.chains.values_mut() {
            digests.retain(|d| records.contains_key(d));
        }
        tables.chains.retain(|_, digests| !digests.is_empty());
        let chains = &tables.chains;
        for roots in tables.user_chains.values_mut() {
            roots.retain(|r| chains.contains_key(r));
        }
        tables.user_chains.retain(|_, roots| !roots.is_empty());
        before - tables.records.len()
    }

    pub async fn record_count(&self) -> usize {
        self.inner.read().await.records.len()
    }
}

#[async_trait]
impl TokenRecordStore for InMemoryTokenStore {
    async fn put(&self, record: &RefreshTokenRecord, _ttl: StdDuration) -> AuthResult<()> {
        let mut tables = self.inner.write().await;
        tables
            .chains
            .entry(record.chain_root.clone())
            .or_default()
            .push(record.id.clone());
        if record.id == record.chain_root {
            tables
                .user_chains
                .entry(record.user_id)
                .or_default()
                .push(record.chain_root.clone());
        }
        tables.records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, digest: &str) -> AuthResult<Option<RefreshTokenRecord>> {
        Ok(self.inner.read().await.records.get(digest).cloned())
    }

    async fn rotate_cas(
        &self,
        presented: &str,
        successor: &RefreshTokenRecord,
        _ttl: StdDuration,
    ) -> AuthResult<RotateOutcome> {
        let mut tables = self.inner.write().await;
        match tables.records.get_mut(presented) {
            None => return Ok(RotateOutcome::Missing),
            Some(current) => {
                if current.revoked {
                    return Ok(RotateOutcome::Revoked);
                }
                if current.used {
                    return Ok(RotateOutcome::AlreadyUsed);
                }
                if current.is_expired(Utc::now()) {
                    return Ok(RotateOutcome::Expired);
                }
                current.used = true;
                current.successor = Some(successor.id.clone());
            }
        }
        tables
            .chains
            .entry(successor.chain_root.clone())
            .or_default()
            .push(successor.id.clone());
        tables
            .records
            .insert(successor.id.clone(), successor.clone());
        Ok(RotateOutcome::Rotated)
    }

    async fn revoke(&self, digest: &str) -> AuthResult<bool> {
        let mut tables = self.inner.write().await;
        match tables.records.get_mut(digest) {
            Some(record) if !record.revoked => {
                record.revoked = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke_chain(&self, chain_root: &str) -> AuthResult<u64> {
        let mut tables = self.inner.write().await;
        Ok(tables.revoke_chain(chain_root))
    }

    async fn revoke_all_for_user(&self, user_id: &UserId) -> AuthResult<u64> {
        let mut tables = self.inner.write().await;
        let roots = tables.user_chains.get(user_id).cloned().unwrap_or_default();
        let mut count = 0;
        for root in roots {
            count += tables.revoke_chain(&root);
        }
        Ok(count)
    }

    async fn list_chain(&self, chain_root: &str) -> AuthResult<Vec<RefreshTokenRecord>> {
        let tables = self.inner.read().await;
        let digests = tables.chains.get(chain_root).cloned().unwrap_or_default();
        Ok(digests
            .iter()
            .filter_map(|d| tables.records.get(d).cloned())
            .collect())
    }

    async fn ping(&self) -> AuthResult<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Redis implementation
// ---------------------------------------------------------------------------

/// Marks the presented record used, stores the linked successor and refreshes
/// the chain and user indexes, all server-side. The presented record keeps
/// its remaining TTL; the indexes take the successor's, so a chain kept alive
/// by rotation stays reachable for revoke-all. Record fields are strings,
/// booleans and null only, so the cjson round-trip is lossless.
static ROTATE_SCRIPT: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
        local raw = redis.call('GET', KEYS[1])
        if not raw then
            return 'missing'
        end
        local record = cjson.decode(raw)
        if record.revoked then
            return 'revoked'
        end
        if record.used then
            return 'used'
        end
        record.used = true
        record.successor = ARGV[1]
        local ttl = redis.call('TTL', KEYS[1])
        if ttl > 0 then
            redis.call('SET', KEYS[1], cjson.encode(record), 'EX', ttl)
        else
            redis.call('SET', KEYS[1], cjson.encode(record))
        end
        redis.call('SET', KEYS[2], ARGV[2], 'EX', tonumber(ARGV[3]))
        redis.call('SADD', KEYS[3], ARGV[1])
        redis.call('EXPIRE', KEYS[3], tonumber(ARGV[3]))
        redis.call('SADD', KEYS[4], ARGV[4])
        redis.call('EXPIRE', KEYS[4], tonumber(ARGV[3]))
        return 'rotated'
        "#,
    )
});

static REVOKE_SCRIPT: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
        local raw = redis.call('GET', KEYS[1])
        if not raw then
            return 0
        end
        local record = cjson.decode(raw)
        if record.revoked then
            return 0
        end
        record.revoked = true
        local ttl = redis.call('TTL', KEYS[1])
        if ttl > 0 then
            redis.call('SET', KEYS[1], cjson.encode(record), 'EX', ttl)
        else
            redis.call('SET', KEYS[1], cjson.encode(record))
        end
        return 1
        "#,
    )
});

static REVOKE_CHAIN_SCRIPT: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
        local digests = redis.call('SMEMBERS', KEYS[1])
        local count = 0
        for _, digest in ipairs(digests) do
            local key = ARGV[1] .. digest
            local raw = redis.call('GET', key)
            if raw then
                local record = cjson.decode(raw)
                if not record.revoked then
                    record.revoked = true
                    local ttl = redis.call('TTL', key)
                    if ttl > 0 then
                        redis.call('SET', key, cjson.encode(record), 'EX', ttl)
                    else
                        redis.call('SET', key, cjson.encode(record))
                    end
                    count = count + 1
                end
            end
        end
        return count
        "#,
    )
});

/// Redis-backed token store. Rotation and revocation each run as a single Lua
/// script evaluation, so the compare-and-set stays atomic across service
/// instances. All calls are bounded by the configured operation timeout.
pub struct RedisTokenStore {
    manager: ConnectionManager,
    op_timeout: StdDuration,
}

impl fmt::Debug for RedisTokenStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisTokenStore")
            .field("op_timeout", &self.op_timeout)
            .finish_non_exhaustive()
    }
}

impl RedisTokenStore {
    pub async fn connect(url: &str, op_timeout: StdDuration) -> AuthResult<Self> {
        let client = redis::Client::open(url)?;
        let manager = tokio::time::timeout(op_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| AuthError::StoreUnavailable {
                reason: "redis connect timed out".to_string(),
            })??;
        Ok(Self {
            manager,
            op_timeout,
        })
    }

    async fn bounded<T>(
        &self,
        op: impl Future<Output = redis::RedisResult<T>>,
    ) -> AuthResult<T> {
        match tokio::time::timeout(self.op_timeout, op).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(AuthError::StoreUnavailable {
                reason: "redis operation timed out".to_string(),
            }),
        }
    }
}

#[async_trait]
impl TokenRecordStore for RedisTokenStore {
    async fn put(&self, record: &RefreshTokenRecord, ttl: StdDuration) -> AuthResult<()> {
        let payload = serde_json::to_string(record)?;
        let key = record_key(&record.id);
        let chain = chain_key(&record.chain_root);
        let user = user_key(&record.user_id);
        let digest = record.id.clone();
        let chain_root = record.chain_root.clone();
        let is_root = record.id == record.chain_root;
        let ttl_secs = ttl.as_secs().max(1);
        let mut conn = self.manager.clone();
        self.bounded(async move {
            conn.set_ex::<_, _, ()>(&key, &payload, ttl_secs).await?;
            conn.sadd::<_, _, ()>(&chain, &digest).await?;
            conn.expire::<_, ()>(&chain, ttl_secs as i64).await?;
            if is_root {
                conn.sadd::<_, _, ()>(&user, &chain_root).await?;
                conn.expire::<_, ()>(&user, ttl_secs as i64).await?;
            }
            Ok(())
        })
        .await
    }

    async fn get(&self, digest: &str) -> AuthResult<Option<RefreshTokenRecord>> {
        let key = record_key(digest);
        let mut conn = self.manager.clone();
        let raw: Option<String> = self
            .bounded(async move { conn.get(&key).await })
            .await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn rotate_cas(
        &self,
        presented: &str,
        successor: &RefreshTokenRecord,
        ttl: StdDuration,
    ) -> AuthResult<RotateOutcome> {
        let payload = serde_json::to_string(successor)?;
        let ttl_secs = ttl.as_secs().max(1);
        let mut conn = self.manager.clone();
        let status: String = self
            .bounded(
                ROTATE_SCRIPT
                    .key(record_key(presented))
                    .key(record_key(&successor.id))
                    .key(chain_key(&successor.chain_root))
                    .key(user_key(&successor.user_id))
                    .arg(&successor.id)
                    .arg(payload)
                    .arg(ttl_secs)
                    .arg(&successor.chain_root)
                    .invoke_async(&mut conn),
            )
            .await?;
        match status.as_str() {
            "rotated" => Ok(RotateOutcome::Rotated),
            "missing" => Ok(RotateOutcome::Missing),
            "used" => Ok(RotateOutcome::AlreadyUsed),
            "revoked" => Ok(RotateOutcome::Revoked),
            other => Err(AuthError::internal(&format!(
                "unexpected rotate script result: {other}"
            ))),
        }
    }

    async fn revoke(&self, digest: &str) -> AuthResult<bool> {
        let mut conn = self.manager.clone();
        let changed: i64 = self
            .bounded(
                REVOKE_SCRIPT
                    .key(record_key(digest))
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(changed == 1)
    }

    async fn revoke_chain(&self, chain_root: &str) -> AuthResult<u64> {
        let mut conn = self.manager.clone();
        let count: i64 = self
            .bounded(
                REVOKE_CHAIN_SCRIPT
                    .key(chain_key(chain_root))
                    .arg(RECORD_PREFIX)
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn revoke_all_for_user(&self, user_id: &UserId) -> AuthResult<u64> {
        let key = user_key(user_id);
        let mut conn = self.manager.clone();
        let roots: Vec<String> = self
            .bounded(async move { conn.smembers(&key).await })
            .await?;
        let mut count = 0;
        for root in roots {
            count += self.revoke_chain(&root).await?;
        }
        Ok(count)
    }

    async fn list_chain(&self, chain_root: &str) -> AuthResult<Vec<RefreshTokenRecord>> {
        let key = chain_key(chain_root);
        let mut conn = self.manager.clone();
        let digests: Vec<String> = self
            .bounded(async move { conn.smembers(&key).await })
            .await?;
        let mut records = Vec::with_capacity(digests.len());
        for digest in digests {
            if let Some(record) = self.get(&digest).await? {
                records.push(record);
            }
        }
        records.sort_by_key(|r| r.issued_at);
        Ok(records)
    }

    async fn ping(&self) -> AuthResult<()> {
        let mut conn = self.manager.clone();
        let _: String = self
            .bounded(async move { redis::cmd("PING").query_async(&mut conn).await })
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Facade with degradation
// ---------------------------------------------------------------------------

/// Refresh-token API the auth service talks to. Owns token minting, the
/// rotation protocol and replay handling, and degrades from the configured
/// primary to the in-process fallback on transient storage failure. The
/// degraded latch holds for the process lifetime; recovery is an operational
/// restart, not a silent flip-flop.
#[derive(Debug)]
pub struct RefreshTokenStore {
    primary: Option<Arc<dyn TokenRecordStore>>,
    fallback: Arc<InMemoryTokenStore>,
    degraded: AtomicBool,
    refresh_ttl: Duration,
    audit: AuditLogger,
}

impl RefreshTokenStore {
    /// In-process only. Nothing to degrade from.
    pub fn in_memory(refresh_ttl: Duration, audit: AuditLogger) -> Self {
        Self {
            primary: None,
            fallback: Arc::new(InMemoryTokenStore::new()),
            degraded: AtomicBool::new(false),
            refresh_ttl,
            audit,
        }
    }

    pub fn with_primary(
        primary: Arc<dyn TokenRecordStore>,
        refresh_ttl: Duration,
        audit: AuditLogger,
    ) -> Self {
        Self {
            primary: Some(primary),
            fallback: Arc::new(InMemoryTokenStore::new()),
            degraded: AtomicBool::new(false),
            refresh_ttl,
            audit,
        }
    }

    /// Builds the store from configuration: Redis primary when a URL is
    /// configured and reachable, in-process otherwise. An unreachable
    /// configured Redis starts the store already degraded rather than
    /// failing startup.
    pub async fn connect(
        config: &StoreConfig,
        refresh_ttl: Duration,
        audit: AuditLogger,
    ) -> Self {
        let Some(url) = config.redis_url.as_deref() else {
            return Self::in_memory(refresh_ttl, audit);
        };
        match RedisTokenStore::connect(url, config.operation_timeout()).await {
            Ok(redis) => {
                info!("Refresh-token store using redis primary");
                Self::with_primary(Arc::new(redis), refresh_ttl, audit)
            }
            Err(err) => {
                let store = Self::in_memory(refresh_ttl, audit);
                store.mark_degraded(&err);
                store
            }
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Issues a fresh chain-root token for the user. Returns the raw token
    /// (the only copy that will ever exist) and the stored record.
    #[instrument(skip_all, fields(user_id = %user_id))]
    pub async fn issue(&self, user_id: &UserId) -> AuthResult<(String, RefreshTokenRecord)> {
        let (raw, record) = RefreshTokenRecord::mint(user_id, None, Utc::now(), self.refresh_ttl)?;
        let ttl = self.ttl_std();
        let stored = record.clone();
        self.run(move |store| {
            let record = stored.clone();
            async move { store.put(&record, ttl).await }
        })
        .await?;
        Ok((raw, record))
    }

    /// Rotates a presented raw token: validates it, then lets the store's
    /// compare-and-set pick the single winner. A loser whose token was
    /// already used is replay evidence; its whole chain is revoked before the
    /// error surfaces.
    #[instrument(skip_all)]
    pub async fn rotate(&self, presented: &str) -> AuthResult<(String, RefreshTokenRecord)> {
        let digest = token_digest(presented);
        let now = Utc::now();

        let lookup = digest.clone();
        let current = self
            .run(move |store| {
                let digest = lookup.clone();
                async move { store.get(&digest).await }
            })
            .await?
            .ok_or_else(|| AuthError::InvalidToken {
                reason: "unknown refresh token".to_string(),
            })?;

        if current.revoked {
            return Err(AuthError::InvalidToken {
                reason: "revoked refresh token".to_string(),
            });
        }
        if current.is_expired(now) {
            return Err(AuthError::TokenExpired);
        }

        let (raw, successor) = RefreshTokenRecord::mint(
            &current.user_id,
            Some(&current.chain_root),
            now,
            self.refresh_ttl,
        )?;
        let ttl = self.ttl_std();
        let cas_digest = digest.clone();
        let cas_successor = successor.clone();
        let outcome = self
            .run(move |store| {
                let presented = cas_digest.clone();
                let successor = cas_successor.clone();
                async move { store.rotate_cas(&presented, &successor, ttl).await }
            })
            .await?;

        match outcome {
            RotateOutcome::Rotated => Ok((raw, successor)),
            RotateOutcome::AlreadyUsed => {
                self.handle_reuse(&current).await
            }
            RotateOutcome::Revoked => Err(AuthError::InvalidToken {
                reason: "revoked refresh token".to_string(),
            }),
            RotateOutcome::Missing => Err(AuthError::InvalidToken {
                reason: "unknown refresh token".to_string(),
            }),
            RotateOutcome::Expired => Err(AuthError::TokenExpired),
        }
    }

    /// Revokes the presented token. Idempotent: unknown and already-revoked
    /// tokens are not errors, so logout never fails on a stale client.
    pub async fn revoke(&self, presented: &str) -> AuthResult<bool> {
        let digest = token_digest(presented);
        self.run(move |store| {
            let digest = digest.clone();
            async move { store.revoke(&digest).await }
        })
        .await
    }

    /// Revokes every token in the presented token's chain.
    pub async fn revoke_chain_of(&self, presented: &str) -> AuthResult<u64> {
        let digest = token_digest(presented);
        let lookup = digest.clone();
        let Some(record) = self
            .run(move |store| {
                let digest = lookup.clone();
                async move { store.get(&digest).await }
            })
            .await?
        else {
            return Ok(0);
        };
        let root = record.chain_root;
        self.run(move |store| {
            let root = root.clone();
            async move { store.revoke_chain(&root).await }
        })
        .await
    }

    /// Revokes every chain the user owns. Backs the logout-everywhere path.
    pub async fn revoke_all_for_user(&self, user_id: &UserId) -> AuthResult<u64> {
        let user_id = *user_id;
        self.run(move |store| async move { store.revoke_all_for_user(&user_id).await })
            .await
    }

    /// Record lookup by raw token, for diagnostics and the service layer's
    /// audit context.
    pub async fn lookup(&self, presented: &str) -> AuthResult<Option<RefreshTokenRecord>> {
        let digest = token_digest(presented);
        self.run(move |store| {
            let digest = digest.clone();
            async move { store.get(&digest).await }
        })
        .await
    }

    /// Health probe against whichever store is currently active.
    pub async fn health_check(&self) -> AuthResult<()> {
        self.run(move |store| async move { store.ping().await }).await
    }

    /// Expiry sweep for the in-process tables. Redis records expire on their
    /// own TTLs.
    pub async fn sweep_expired(&self) -> usize {
        self.fallback.sweep_expired().await
    }

    fn ttl_std(&self) -> StdDuration {
        StdDuration::from_secs(self.refresh_ttl.num_seconds().max(1) as u64)
    }

    fn active(&self) -> Arc<dyn TokenRecordStore> {
        match &self.primary {
            Some(primary) if !self.is_degraded() => primary.clone(),
            _ => self.fallback.clone(),
        }
    }

    /// Runs one store operation, degrading to the fallback on a transient
    /// failure of the primary. The closure is replayed on the fallback, so
    /// the caller sees the fallback's answer instead of the primary's error.
    async fn run<T, F, Fut>(&self, op: F) -> AuthResult<T>
    where
        F: Fn(Arc<dyn TokenRecordStore>) -> Fut,
        Fut: Future<Output = AuthResult<T>>,
    {
        let result = op(self.active()).await;
        match result {
            Err(err) if err.is_transient() && self.primary.is_some() && !self.is_degraded() => {
                self.mark_degraded(&err);
                op(self.fallback.clone()).await
            }
            other => other,
        }
    }

    fn mark_degraded(&self, err: &AuthError) {
        if self
            .degraded
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            warn!(
                error = %err,
                "Refresh-token primary store unavailable; degraded to in-process fallback"
            );
            self.audit.record(
                SecurityEvent::new(
                    SecurityEventType::StoreDegraded,
                    SecuritySeverity::Warning,
                    "refresh-token store degraded to in-process fallback",
                )
                .with_detail(json!({ "error": err.to_string() })),
            );
        }
    }

    async fn handle_reuse(&self, current: &RefreshTokenRecord) -> AuthResult<(String, RefreshTokenRecord)> {
        let root = current.chain_root.clone();
        let revoked = self
            .run(move |store| {
                let root = root.clone();
                async move { store.revoke_chain(&root).await }
            })
            .await?;
        warn!(
            user_id = %current.user_id,
            revoked,
            "Refresh token replay detected; chain revoked"
        );
        self.audit.record(
            SecurityEvent::new(
                SecurityEventType::TokenReuse,
                SecuritySeverity::Critical,
                "refresh token presented after rotation; chain revoked",
            )
            .with_user(&current.user_id)
            .with_detail(json!({
                "chain_root": current.chain_root,
                "revoked_tokens": revoked,
            })),
        );
        Err(AuthError::ReuseDetected)
    }
}
