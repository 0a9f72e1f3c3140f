//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tower::ServiceExt;

use wagate::config::LifecycleConfig;
use wagate::protocol::{
    ClientConfig, ClientFactory, OutboundContent, ProtocolClient, ProtocolError, ProtocolEvent,
};
use wagate::server::{AppState, build_app};
use wagate::session::LifecycleManager;
use wagate::store::{CredentialBackend, Credentials, SessionRecord, SessionStore, StorageResult};

// ============================================================================
// ScriptedClient
// ============================================================================

/// Protocol client whose events are pushed by the test.
pub struct ScriptedClient {
    pub instance_id: String,
    pub credentials: Option<Credentials>,
    tx: mpsc::Sender<ProtocolEvent>,
    rx: Mutex<Option<mpsc::Receiver<ProtocolEvent>>>,
    sent: Mutex<Vec<(String, OutboundContent)>>,
    shut_down: AtomicBool,
}

impl ScriptedClient {
    fn new(instance_id: &str, credentials: Option<Credentials>) -> Self {
        let (tx, rx) = mpsc::channel(64);
        Self {
            instance_id: instance_id.to_string(),
            credentials,
            tx,
            rx: Mutex::new(Some(rx)),
            sent: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    pub async fn emit(&self, event: ProtocolEvent) {
        // The session task may already have dropped its receiver.
        let _ = self.tx.send(event).await;
    }

    pub fn sent(&self) -> Vec<(String, OutboundContent)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProtocolClient for ScriptedClient {
    async fn connect(&self) -> Result<mpsc::Receiver<ProtocolEvent>, ProtocolError> {
        self.rx
            .lock()
            .unwrap()
            .take()
            .ok_or(ProtocolError::AlreadyConnected)
    }

    async fn send(&self, to: &str, content: OutboundContent) -> Result<String, ProtocolError> {
        if self.is_shut_down() {
            return Err(ProtocolError::Closed);
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push((to.to_string(), content));
        Ok(format!("MSG{}", sent.len()))
    }

    async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// ScriptedFactory
// ============================================================================

pub struct ScriptedFactory {
    config: ClientConfig,
    clients: Mutex<Vec<Arc<ScriptedClient>>>,
    created: watch::Sender<usize>,
    failure: Option<String>,
}

impl ScriptedFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            config: ClientConfig::default(),
            clients: Mutex::new(Vec::new()),
            created: watch::Sender::new(0),
            failure: None,
        })
    }

    /// A factory whose every `create` fails with `reason`.
    pub fn failing(reason: &str) -> Arc<Self> {
        Arc::new(Self {
            config: ClientConfig::default(),
            clients: Mutex::new(Vec::new()),
            created: watch::Sender::new(0),
            failure: Some(reason.to_string()),
        })
    }

    pub fn created(&self) -> usize {
        *self.created.borrow()
    }

    /// Wait until `n` clients exist and return the `n`th.
    pub async fn wait_for_client(&self, n: usize) -> Arc<ScriptedClient> {
        let mut rx = self.created.subscribe();
        rx.wait_for(|count| *count >= n).await.unwrap();
        self.clients.lock().unwrap()[n - 1].clone()
    }
}

impl ClientFactory for ScriptedFactory {
    fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn create(
        &self,
        instance_id: &str,
        credentials: Option<Credentials>,
    ) -> Result<Arc<dyn ProtocolClient>, ProtocolError> {
        if let Some(reason) = &self.failure {
            return Err(ProtocolError::Construction(reason.clone()));
        }
        let client = Arc::new(ScriptedClient::new(instance_id, credentials));
        let count = {
            let mut clients = self.clients.lock().unwrap();
            clients.push(client.clone());
            clients.len()
        };
        self.created.send_replace(count);
        Ok(client)
    }
}

// ============================================================================
// MemoryBackend
// ============================================================================

#[derive(Default)]
pub struct MemoryBackend {
    records: Mutex<HashMap<String, SessionRecord>>,
    stalled: AtomicBool,
}

impl MemoryBackend {
    pub fn record(&self, instance_id: &str) -> Option<SessionRecord> {
        self.records.lock().unwrap().get(instance_id).cloned()
    }

    /// Make every write hang until the store's timeout gives up on it.
    pub fn stall_writes(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    async fn write_gate(&self) {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl CredentialBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn load(&self, instance_id: &str) -> StorageResult<Option<SessionRecord>> {
        Ok(self.record(instance_id))
    }

    async fn save(&self, record: &SessionRecord) -> StorageResult<()> {
        self.write_gate().await;
        self.records
            .lock()
            .unwrap()
            .insert(record.instance_id.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, instance_id: &str) -> StorageResult<()> {
        self.write_gate().await;
        self.records.lock().unwrap().remove(instance_id);
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub factory: Arc<ScriptedFactory>,
    pub backend: Arc<MemoryBackend>,
    pub manager: LifecycleManager,
    pub app: Router,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_factory(ScriptedFactory::new())
    }

    pub fn with_factory(factory: Arc<ScriptedFactory>) -> Self {
        Self::build(factory, LifecycleConfig::default())
    }

    pub fn with_config(config: LifecycleConfig) -> Self {
        Self::build(ScriptedFactory::new(), config)
    }

    fn build(factory: Arc<ScriptedFactory>, config: LifecycleConfig) -> Self {
        let backend = Arc::new(MemoryBackend::default());
        let store = SessionStore::new(Vec::new(), backend.clone(), Duration::from_secs(1));
        let manager = LifecycleManager::new(factory.clone(), store, config);
        let app = build_app(AppState::new(manager.clone()), 240);
        Self {
            factory,
            backend,
            manager,
            app,
        }
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        self.call(request).await
    }

    pub async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.post_raw(uri, body.to_string()).await
    }

    pub async fn post_raw(&self, uri: &str, body: String) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap();
        self.call(request).await
    }

    async fn call(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    /// Poll under the (usually paused) clock until `check` holds.
    pub async fn eventually(&self, check: impl Fn(&Self) -> bool) {
        for _ in 0..1_000 {
            if check(self) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }
}
