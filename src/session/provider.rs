use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::descriptor::ConnectionDescriptor;

/// A live handle to a deployment, produced by the driver integration layer
#[async_trait]
pub trait ServiceProvider: Send + Sync + 'static {
    async fn close(&self) -> anyhow::Result<()>;
}

/// Opens providers for prepared descriptors.
///
/// `events` lets the driver report out-of-band authentication progress (OIDC)
/// for this particular attempt.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        descriptor: ConnectionDescriptor,
        events: DriverEvents,
    ) -> anyhow::Result<Arc<dyn ServiceProvider>>;
}

/// Device authorization data shown to the user during the OIDC device flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFlowInfo {
    pub verification_url: String,
    pub user_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    AuthFailed(String),
    AuthSucceeded,
    NotifyDeviceFlow(DeviceFlowInfo),
}

/// Driver callbacks for one connection attempt. Every event is tagged with
/// the attempt so the manager can ignore those from superseded attempts.
#[derive(Clone)]
pub struct DriverEvents {
    attempt: u64,
    sender: mpsc::UnboundedSender<(u64, DriverEvent)>,
}

impl DriverEvents {
    pub(crate) fn new(attempt: u64, sender: mpsc::UnboundedSender<(u64, DriverEvent)>) -> Self {
        DriverEvents { attempt, sender }
    }

    pub fn auth_failed(&self, reason: impl Into<String>) {
        self.send(DriverEvent::AuthFailed(reason.into()));
    }

    pub fn auth_succeeded(&self) {
        self.send(DriverEvent::AuthSucceeded);
    }

    pub fn notify_device_flow(&self, info: DeviceFlowInfo) {
        self.send(DriverEvent::NotifyDeviceFlow(info));
    }

    fn send(&self, event: DriverEvent) {
        // The manager may have gone away already; nothing left to notify then
        let _ = self.sender.send((self.attempt, event));
    }
}

impl fmt::Debug for DriverEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverEvents").field("attempt", &self.attempt).finish()
    }
}

type ProviderFuture = Shared<BoxFuture<'static, Result<Arc<dyn ServiceProvider>, String>>>;

/// Handle to a provider that is still being established.
///
/// Cloning shares the same underlying attempt; every clone resolves to the same
/// provider or the same error message.
#[derive(Clone)]
pub struct PendingProvider {
    future: ProviderFuture,
}

impl PendingProvider {
    pub(crate) fn new(
        connector: Arc<dyn Connector>,
        descriptor: ConnectionDescriptor,
        events: DriverEvents,
    ) -> Self {
        let future = async move {
            connector
                .connect(descriptor, events)
                .await
                .map_err(|e| format!("{e:#}"))
        }
        .boxed()
        .shared();
        PendingProvider { future }
    }

    pub async fn resolve(&self) -> Result<Arc<dyn ServiceProvider>, String> {
        self.future.clone().await
    }
}

impl fmt::Debug for PendingProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self.future.peek() {
            None => "pending",
            Some(Ok(_)) => "resolved",
            Some(Err(_)) => "failed",
        };
        f.debug_struct("PendingProvider").field("status", &status).finish()
    }
}
