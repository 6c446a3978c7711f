//! Leader election
//!
//! Short-lived, renewable mutual exclusion keyed by job name, backed by a
//! shared key-value store. Multiple identically configured replicas call
//! [`LeaderElection::acquire`] before a periodic job's side effects; at
//! most one observes `true` within a lock window.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::LockConfig;

/// Prefix for lock keys in the shared store
const LOCK_KEY_PREFIX: &str = "snowstorm";

/// Errors from the lock store
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Lock store error: {0}")]
    Store(String),
}

impl From<redis::RedisError> for LockError {
    fn from(err: redis::RedisError) -> Self {
        LockError::Store(err.to_string())
    }
}

/// Compare-and-set seam over the shared key-value store
///
/// `try_hold` must atomically: read the value at `key`; if it is unset or
/// already equals `holder`, set it to `holder` with expiry `ttl` and
/// report `true`; otherwise leave it untouched and report `false`. A
/// concurrent writer must not be able to interleave between the read and
/// the write.
#[async_trait]
pub trait LockStore: Send + Sync {
    async fn try_hold(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool, LockError>;
}

/// Redis-backed lock store
///
/// The compare-and-set runs as a single server-side script, so the
/// read-check-write is atomic without client-side WATCH bookkeeping.
pub struct RedisLockStore {
    client: redis::Client,
}

/// GET/compare/SET-with-expiry as one atomic unit
const ACQUIRE_SCRIPT: &str = r#"
local holder = redis.call('GET', KEYS[1])
if holder == false or holder == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[2])
    return 1
end
return 0
"#;

impl RedisLockStore {
    pub fn new(redis_url: &str) -> Result<Self, LockError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn try_hold(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let held: i32 = redis::Script::new(ACQUIRE_SCRIPT)
            .key(key)
            .arg(holder)
            .arg(ttl.as_secs())
            .invoke_async(&mut conn)
            .await?;

        Ok(held == 1)
    }
}

/// Two-state election policy, selected once from configuration
enum Policy {
    /// Single-instance deployments skip coordination entirely
    Disabled,
    /// Compare-and-set against the shared store, deny on loss or error
    Enabled {
        store: Box<dyn LockStore>,
        ttl: Duration,
    },
}

/// Leader-election gate for periodic jobs
pub struct LeaderElection {
    policy: Policy,
    identity: String,
}

impl LeaderElection {
    /// Build the election gate from configuration, using the process
    /// hostname as its identity.
    pub fn from_config(config: &LockConfig) -> Result<Self, LockError> {
        let identity = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown-host".to_string());

        if !config.election_enabled {
            return Ok(Self::disabled(identity));
        }

        let store = RedisLockStore::new(&config.redis_url)?;
        Ok(Self::enabled(
            Box::new(store),
            Duration::from_secs(config.ttl_secs),
            identity,
        ))
    }

    /// Every caller is leader; used when election is configured off
    pub fn disabled(identity: String) -> Self {
        Self {
            policy: Policy::Disabled,
            identity,
        }
    }

    /// Compare-and-set election against `store`
    pub fn enabled(store: Box<dyn LockStore>, ttl: Duration, identity: String) -> Self {
        Self {
            policy: Policy::Enabled { store, ttl },
            identity,
        }
    }

    /// The holder string written into lock entries
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Acquire or confirm leadership for `job_name`.
    ///
    /// Returns `false` on a lost race and on lock-store failure: a
    /// periodic job never performs side effects while the store is
    /// unreachable. The job is simply skipped until the next scheduled
    /// invocation.
    pub async fn acquire(&self, job_name: &str) -> bool {
        match &self.policy {
            Policy::Disabled => true,
            Policy::Enabled { store, ttl } => {
                let key = lock_key(job_name);
                match store.try_hold(&key, &self.identity, *ttl).await {
                    Ok(true) => {
                        debug!(job = job_name, holder = %self.identity, "Leadership confirmed");
                        true
                    }
                    Ok(false) => {
                        debug!(job = job_name, "Another replica holds the lock, skipping");
                        false
                    }
                    Err(e) => {
                        warn!(job = job_name, error = %e, "Lock store unavailable, skipping job");
                        false
                    }
                }
            }
        }
    }
}

/// Lock entry key for a job name
fn lock_key(job_name: &str) -> String {
    format!("{LOCK_KEY_PREFIX}-{job_name}")
}
