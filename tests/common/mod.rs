#![allow(dead_code)]

use async_trait::async_trait;
use bson::Document;
use mongo_mcp_core::exports::{DocumentSource, ExportsConfig};
use mongo_mcp_core::logging::SessionLogger;
use mongo_mcp_core::session::{
    ApiClient, ConnectionDescriptor, Connector, DeviceFlowInfo, DriverEvents, ServiceProvider, SessionTransport,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::Level;

/// Shared, ordered record of what the fakes were asked to do
#[derive(Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }
}

pub struct FakeProvider {
    id: usize,
    journal: Journal,
    fail_close: bool,
    close_delay: Duration,
}

#[async_trait]
impl ServiceProvider for FakeProvider {
    async fn close(&self) -> anyhow::Result<()> {
        self.journal.record(format!("close {}", self.id));
        tokio::time::sleep(self.close_delay).await;
        if self.fail_close {
            anyhow::bail!("provider {} refused to close", self.id);
        }
        Ok(())
    }
}

/// What the next `connect` call does
#[derive(Clone)]
pub enum ConnectBehavior {
    Succeed,
    Fail(String),
    /// Never resolve on its own
    Hang,
    /// Resolve after the delay
    Delay(Duration),
    /// Report the device flow, then wait for `FakeConnector::finish_oidc`
    DeviceFlow(DeviceFlowInfo),
}

pub struct FakeConnector {
    journal: Journal,
    behaviors: Mutex<VecDeque<ConnectBehavior>>,
    opened: AtomicUsize,
    fail_close: bool,
    close_delay: Duration,
    descriptors: Mutex<Vec<ConnectionDescriptor>>,
    driver_events: Mutex<Vec<DriverEvents>>,
    oidc_outcome: tokio::sync::Notify,
    oidc_result: Mutex<Option<Result<(), String>>>,
}

impl FakeConnector {
    pub fn new(journal: Journal) -> Arc<Self> {
        Arc::new(Self::build(journal, false, Duration::ZERO))
    }

    pub fn failing_close(journal: Journal) -> Arc<Self> {
        Arc::new(Self::build(journal, true, Duration::ZERO))
    }

    /// Providers take `close_delay` to close
    pub fn slow_close(journal: Journal, close_delay: Duration) -> Arc<Self> {
        Arc::new(Self::build(journal, false, close_delay))
    }

    fn build(journal: Journal, fail_close: bool, close_delay: Duration) -> Self {
        FakeConnector {
            journal,
            behaviors: Mutex::new(VecDeque::new()),
            opened: AtomicUsize::new(0),
            fail_close,
            close_delay,
            descriptors: Mutex::new(Vec::new()),
            driver_events: Mutex::new(Vec::new()),
            oidc_outcome: tokio::sync::Notify::new(),
            oidc_result: Mutex::new(None),
        }
    }

    /// Queue behaviors for upcoming connects; once empty every connect succeeds
    pub fn push(&self, behavior: ConnectBehavior) {
        self.behaviors.lock().push_back(behavior);
    }

    pub fn descriptors(&self) -> Vec<ConnectionDescriptor> {
        self.descriptors.lock().clone()
    }

    pub fn last_driver_events(&self) -> Option<DriverEvents> {
        self.driver_events.lock().last().cloned()
    }

    /// Complete a pending device flow connect
    pub fn finish_oidc(&self, result: Result<(), String>) {
        *self.oidc_result.lock() = Some(result);
        self.oidc_outcome.notify_one();
    }

    fn open(&self) -> Arc<dyn ServiceProvider> {
        let id = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
        self.journal.record(format!("open {id}"));
        Arc::new(FakeProvider {
            id,
            journal: self.journal.clone(),
            fail_close: self.fail_close,
            close_delay: self.close_delay,
        })
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        descriptor: ConnectionDescriptor,
        events: DriverEvents,
    ) -> anyhow::Result<Arc<dyn ServiceProvider>> {
        self.descriptors.lock().push(descriptor);
        self.driver_events.lock().push(events.clone());
        let behavior = self.behaviors.lock().pop_front().unwrap_or(ConnectBehavior::Succeed);

        match behavior {
            ConnectBehavior::Succeed => Ok(self.open()),
            ConnectBehavior::Fail(reason) => Err(anyhow::anyhow!(reason)),
            ConnectBehavior::Hang => futures::future::pending().await,
            ConnectBehavior::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(self.open())
            }
            ConnectBehavior::DeviceFlow(info) => {
                events.notify_device_flow(info);
                loop {
                    let outcome = self.oidc_result.lock().take();
                    if let Some(result) = outcome {
                        return match result {
                            Ok(()) => Ok(self.open()),
                            Err(reason) => Err(anyhow::anyhow!(reason)),
                        };
                    }
                    self.oidc_outcome.notified().await;
                }
            }
        }
    }
}

pub struct FakeTransport {
    pub id: String,
    journal: Journal,
    fail_close: bool,
}

impl FakeTransport {
    pub fn new(id: impl Into<String>, journal: Journal) -> Arc<Self> {
        Arc::new(FakeTransport { id: id.into(), journal, fail_close: false })
    }

    pub fn failing(id: impl Into<String>, journal: Journal) -> Arc<Self> {
        Arc::new(FakeTransport { id: id.into(), journal, fail_close: true })
    }
}

#[async_trait]
impl SessionTransport for FakeTransport {
    async fn close(&self) -> anyhow::Result<()> {
        self.journal.record(format!("close transport {}", self.id));
        if self.fail_close {
            anyhow::bail!("transport {} is already gone", self.id);
        }
        Ok(())
    }
}

pub struct FakeApiClient {
    journal: Journal,
    fail_delete: bool,
}

impl FakeApiClient {
    pub fn new(journal: Journal) -> Arc<Self> {
        Arc::new(FakeApiClient { journal, fail_delete: false })
    }

    pub fn failing_delete(journal: Journal) -> Arc<Self> {
        Arc::new(FakeApiClient { journal, fail_delete: true })
    }
}

#[async_trait]
impl ApiClient for FakeApiClient {
    async fn delete_database_user(&self, project_id: &str, username: &str) -> anyhow::Result<()> {
        self.journal.record(format!("delete user {username} in {project_id}"));
        if self.fail_delete {
            anyhow::bail!("user {username} not found");
        }
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.journal.record("close api client");
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSessionLogger {
    messages: Mutex<Vec<(Level, String, String)>>,
}

impl RecordingSessionLogger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<(Level, String, String)> {
        self.messages.lock().clone()
    }

    pub fn contains(&self, message: &str) -> bool {
        self.messages.lock().iter().any(|(_, _, m)| m == message)
    }
}

impl SessionLogger for RecordingSessionLogger {
    fn log(&self, level: Level, context: &str, message: &str) {
        self.messages.lock().push((level, context.to_string(), message.to_string()));
    }
}

/// Yields `documents`, then fails instead of finishing
pub struct FailingSource {
    documents: VecDeque<Document>,
    pub closed: Arc<AtomicUsize>,
}

impl FailingSource {
    pub fn new(documents: Vec<Document>) -> Self {
        FailingSource {
            documents: documents.into(),
            closed: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl DocumentSource for FailingSource {
    async fn next_document(&mut self) -> anyhow::Result<Option<Document>> {
        match self.documents.pop_front() {
            Some(document) => Ok(Some(document)),
            None => anyhow::bail!("cursor killed"),
        }
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Exports config rooted in a temp dir, without the background sweeper
pub fn exports_config(dir: &tempfile::TempDir, export_timeout: Duration) -> ExportsConfig {
    ExportsConfig {
        exports_path: dir.path().to_path_buf(),
        export_timeout,
        cleanup_interval: Duration::ZERO,
    }
}

/// Poll `condition` until it holds or a few seconds pass
pub async fn wait_for<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
