//! Redis credential backend.
//!
//! Records are stored as a hash per instance:
//!
//! ```text
//! HSET <prefix><instance_id> creds <json> lastSeen <rfc3339>
//! ```
//!
//! The connection is opened lazily and cached; any command error drops the
//! cached connection so the next call reconnects.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;
use tracing::debug;

use super::error::{StorageError, StorageResult};
use super::{CredentialBackend, Credentials, SessionRecord};

const FIELD_CREDS: &str = "creds";
const FIELD_LAST_SEEN: &str = "lastSeen";

pub struct RedisCredentialStore {
    name: String,
    client: redis::Client,
    key_prefix: String,
    conn: Mutex<Option<MultiplexedConnection>>,
}

impl RedisCredentialStore {
    /// Build a backend for `url`. No connection is made until first use.
    pub fn new(
        name: impl Into<String>,
        url: &str,
        key_prefix: impl Into<String>,
    ) -> StorageResult<Self> {
        Ok(Self {
            name: name.into(),
            client: redis::Client::open(url)?,
            key_prefix: key_prefix.into(),
            conn: Mutex::new(None),
        })
    }

    fn key(&self, instance_id: &str) -> String {
        format!("{}{}", self.key_prefix, instance_id)
    }

    async fn connection(&self) -> StorageResult<MultiplexedConnection> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        debug!(backend = %self.name, "Redis connection established");
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn reset(&self) {
        self.conn.lock().await.take();
    }

    async fn run<T, F, Fut>(&self, op: F) -> StorageResult<T>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: std::future::Future<Output = redis::RedisResult<T>>,
    {
        let conn = self.connection().await?;
        match op(conn).await {
            Ok(value) => Ok(value),
            Err(e) => {
                self.reset().await;
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl CredentialBackend for RedisCredentialStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self, instance_id: &str) -> StorageResult<Option<SessionRecord>> {
        let key = self.key(instance_id);
        let fields: HashMap<String, String> = self
            .run(|mut conn| async move {
                redis::cmd("HGETALL").arg(&key).query_async(&mut conn).await
            })
            .await?;

        let Some(raw) = fields.get(FIELD_CREDS) else {
            return Ok(None);
        };
        let credentials: Credentials = serde_json::from_str(raw)?;
        let last_seen = fields
            .get(FIELD_LAST_SEEN)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_default();

        Ok(Some(SessionRecord {
            instance_id: instance_id.to_string(),
            credentials,
            last_seen,
        }))
    }

    async fn save(&self, record: &SessionRecord) -> StorageResult<()> {
        let key = self.key(&record.instance_id);
        let creds = serde_json::to_string(&record.credentials)?;
        let last_seen = record.last_seen.to_rfc3339();
        self.run(|mut conn| async move {
            redis::cmd("HSET")
                .arg(&key)
                .arg(FIELD_CREDS)
                .arg(creds)
                .arg(FIELD_LAST_SEEN)
                .arg(last_seen)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn delete(&self, instance_id: &str) -> StorageResult<()> {
        let key = self.key(instance_id);
        self.run(|mut conn| async move {
            redis::cmd("DEL")
                .arg(&key)
                .query_async(&mut conn)
                .await
        })
        .await
    }
}
