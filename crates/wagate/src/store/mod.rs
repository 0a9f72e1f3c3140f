//! Credential persistence.
//!
//! Credentials are kept in a ranked list of backends:
//!
//! 1. primary Redis
//! 2. secondary Redis (identical shape, separate connection)
//! 3. local files (authoritative)
//!
//! Every backend call runs under a timeout and is optional: a slow or dead
//! tier is logged and skipped, never surfaced to the connect flow. Writes
//! always go to the file tier. Reads trust the file tier whenever it answers,
//! so a cache that missed a rotation or a removal while it was down cannot
//! resurrect stale credentials. Redis only serves reads when the file tier is
//! unreachable.

mod error;
mod file;
mod redis_store;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

pub use self::error::{StorageError, StorageResult};
pub use self::file::FileCredentialStore;
pub use self::redis_store::RedisCredentialStore;

use crate::config::StoreConfig;

const MAX_INSTANCE_ID_LEN: usize = 128;

/// Opaque credential blob owned by the protocol client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credentials(pub Value);

/// Persisted credentials of one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub instance_id: String,
    pub credentials: Credentials,
    pub last_seen: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(instance_id: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            instance_id: instance_id.into(),
            credentials,
            last_seen: Utc::now(),
        }
    }
}

/// Check that an instance id is usable as a store key and a single path segment.
pub fn validate_instance_id(instance_id: &str) -> StorageResult<()> {
    let valid = !instance_id.is_empty()
        && instance_id.len() <= MAX_INSTANCE_ID_LEN
        && instance_id != "."
        && instance_id != ".."
        && instance_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@' | '+'));
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidInstanceId(instance_id.to_string()))
    }
}

/// A single credential storage tier.
#[async_trait]
pub trait CredentialBackend: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    async fn load(&self, instance_id: &str) -> StorageResult<Option<SessionRecord>>;

    async fn save(&self, record: &SessionRecord) -> StorageResult<()>;

    async fn delete(&self, instance_id: &str) -> StorageResult<()>;
}

// ============================================================================
// SessionStore
// ============================================================================

/// Tiered credential store: cache backends in rank order, then the durable tier.
#[derive(Clone)]
pub struct SessionStore {
    caches: Vec<Arc<dyn CredentialBackend>>,
    durable: Arc<dyn CredentialBackend>,
    timeout: Duration,
}

impl SessionStore {
    pub fn new(
        caches: Vec<Arc<dyn CredentialBackend>>,
        durable: Arc<dyn CredentialBackend>,
        timeout: Duration,
    ) -> Self {
        Self {
            caches,
            durable,
            timeout,
        }
    }

    /// Build the primary/secondary Redis tiers and the file tier from config.
    ///
    /// A Redis tier with an unusable URL is dropped with a warning; the file
    /// tier is always present.
    pub fn from_config(config: &StoreConfig) -> Self {
        let mut caches: Vec<Arc<dyn CredentialBackend>> = Vec::new();
        for (name, redis) in [("primary", &config.primary), ("secondary", &config.secondary)] {
            if !redis.enabled {
                continue;
            }
            match RedisCredentialStore::new(name, &redis.url(), config.key_prefix.clone()) {
                Ok(backend) => caches.push(Arc::new(backend)),
                Err(e) => warn!(backend = name, error = %e, "Redis tier disabled"),
            }
        }
        let durable = Arc::new(FileCredentialStore::new(config.sessions_dir.clone()));
        Self::new(caches, durable, config.command_timeout())
    }

    /// Look up credentials.
    ///
    /// The durable tier answers first and its answer is final, including a
    /// miss. Cache tiers are consulted in rank order only when the durable
    /// tier fails or times out.
    pub async fn get(&self, instance_id: &str) -> Option<SessionRecord> {
        match self.bounded(&self.durable, self.durable.load(instance_id)).await {
            Ok(found) => {
                debug!(instance_id, backend = self.durable.name(), found = found.is_some(), "Credential lookup");
                return found;
            }
            Err(e) => {
                warn!(instance_id, backend = self.durable.name(), error = %e, "Durable lookup failed, trying caches");
            }
        }

        for backend in &self.caches {
            match self.bounded(backend, backend.load(instance_id)).await {
                Ok(Some(record)) => {
                    debug!(instance_id, backend = backend.name(), "Credentials found");
                    return Some(record);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(instance_id, backend = backend.name(), error = %e, "Credential lookup failed, trying next tier");
                }
            }
        }
        None
    }

    /// Persist credentials.
    ///
    /// Always written to the durable tier, mirrored to the first cache tier
    /// that accepts the write. Fails only if no tier accepted it.
    pub async fn put(&self, instance_id: &str, credentials: Credentials) -> StorageResult<()> {
        validate_instance_id(instance_id)?;
        let record = SessionRecord::new(instance_id, credentials);

        let durable_ok = match self.bounded(&self.durable, self.durable.save(&record)).await {
            Ok(()) => true,
            Err(e) => {
                warn!(instance_id, backend = self.durable.name(), error = %e, "Credential write failed");
                false
            }
        };

        let mut mirrored = false;
        for backend in &self.caches {
            match self.bounded(backend, backend.save(&record)).await {
                Ok(()) => {
                    debug!(instance_id, backend = backend.name(), "Credentials mirrored");
                    mirrored = true;
                    break;
                }
                Err(e) => {
                    warn!(instance_id, backend = backend.name(), error = %e, "Credential mirror failed, trying next tier");
                }
            }
        }

        if durable_ok || mirrored {
            Ok(())
        } else {
            Err(StorageError::AllTiersFailed)
        }
    }

    /// Forget credentials in every tier. Best effort.
    pub async fn remove(&self, instance_id: &str) -> StorageResult<()> {
        validate_instance_id(instance_id)?;
        let mut any_ok = false;
        for backend in self.tiers() {
            match self.bounded(backend, backend.delete(instance_id)).await {
                Ok(()) => any_ok = true,
                Err(e) => {
                    warn!(instance_id, backend = backend.name(), error = %e, "Credential delete failed");
                }
            }
        }
        if any_ok {
            Ok(())
        } else {
            Err(StorageError::AllTiersFailed)
        }
    }

    fn tiers(&self) -> impl Iterator<Item = &Arc<dyn CredentialBackend>> {
        self.caches.iter().chain(std::iter::once(&self.durable))
    }

    async fn bounded<T>(
        &self,
        backend: &Arc<dyn CredentialBackend>,
        fut: impl std::future::Future<Output = StorageResult<T>>,
    ) -> StorageResult<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout {
                backend: backend.name().to_string(),
                after: self.timeout,
            }),
        }
    }
}
