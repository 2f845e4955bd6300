use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::ConnectionError;
use crate::exports::{ExportsConfig, ExportsManager};
use super::connection_manager::ConnectionManager;
use super::connection_state::{ConnectionEvent, ConnectionState};
use super::descriptor::{AtlasClusterConnectionInfo, ConnectionSettings};
use super::provider::{Connector, ServiceProvider};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// The slice of the Atlas administration API the session lifecycle needs
#[async_trait]
pub trait ApiClient: Send + Sync + 'static {
    async fn delete_database_user(&self, project_id: &str, username: &str) -> anyhow::Result<()>;

    async fn close(&self) -> anyhow::Result<()>;
}

/// Identity of the MCP client driving a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

/// Client-facing session events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connect,
    Disconnect,
    ConnectionError(String),
    Close,
}

/// Per-client aggregate of a connection manager, an exports manager and an
/// optional Atlas API client
pub struct Session {
    session_id: String,
    connection_manager: Arc<ConnectionManager>,
    exports_manager: ExportsManager,
    api_client: Option<Arc<dyn ApiClient>>,
    client_info: Mutex<Option<ClientInfo>>,
    events: broadcast::Sender<SessionEvent>,
    closed: AtomicBool,
}

impl Session {
    pub fn new(
        session_id: Option<String>,
        connection_manager: Arc<ConnectionManager>,
        exports_manager: ExportsManager,
        api_client: Option<Arc<dyn ApiClient>>,
    ) -> Self {
        let session_id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let session_events = events.clone();
        connection_manager.add_listener(move |event| {
            if let Some(event) = session_event(event) {
                let _ = session_events.send(event);
            }
        });

        Session {
            session_id,
            connection_manager,
            exports_manager,
            api_client,
            client_info: Mutex::new(None),
            events,
            closed: AtomicBool::new(false),
        }
    }

    /// Build a session and its collaborators from the server configuration
    pub fn from_config(
        config: &Config,
        connector: Arc<dyn Connector>,
        api_client: Option<Arc<dyn ApiClient>>,
    ) -> Self {
        let session_id = uuid::Uuid::new_v4().to_string();
        let connection_manager = ConnectionManager::new(connector, config);
        let exports_manager = ExportsManager::init(session_id.clone(), ExportsConfig::from(config));
        Self::new(Some(session_id), connection_manager, exports_manager, api_client)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn connection_manager(&self) -> &Arc<ConnectionManager> {
        &self.connection_manager
    }

    pub fn exports_manager(&self) -> &ExportsManager {
        &self.exports_manager
    }

    pub fn api_client(&self) -> Option<&Arc<dyn ApiClient>> {
        self.api_client.as_ref()
    }

    pub fn client_info(&self) -> Option<ClientInfo> {
        self.client_info.lock().clone()
    }

    /// Remember the MCP client; its name is reported in appName on later connects
    pub fn set_mcp_client(&self, client: ClientInfo) {
        self.connection_manager.set_client_name(client.name.clone());
        *self.client_info.lock() = Some(client);
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_manager.current_state()
    }

    pub fn is_connected_to_mongodb(&self) -> bool {
        self.connection_manager.current_state().is_connected()
    }

    pub fn service_provider(&self) -> Result<Arc<dyn ServiceProvider>, ConnectionError> {
        self.connection_manager.service_provider()
    }

    pub fn connected_atlas_cluster(&self) -> Option<AtlasClusterConnectionInfo> {
        self.connection_manager.current_state().atlas_cluster().cloned()
    }

    pub async fn connect_to_mongodb(&self, settings: ConnectionSettings) -> Result<ConnectionState, ConnectionError> {
        self.connection_manager.connect(settings).await
    }

    /// Disconnect, then remove the temporary Atlas database user created for
    /// this session, if any. Failing to remove the user is only logged.
    pub async fn disconnect(&self) {
        let atlas_cluster = self.connected_atlas_cluster();

        self.connection_manager.disconnect().await;

        let Some(cluster) = atlas_cluster.filter(AtlasClusterConnectionInfo::has_scoped_user) else {
            return;
        };
        let Some(api_client) = &self.api_client else {
            warn!(
                "No Atlas API client to remove temporary user {} from project {}",
                cluster.username, cluster.project_id
            );
            return;
        };

        match api_client.delete_database_user(&cluster.project_id, &cluster.username).await {
            Ok(()) => debug!("Deleted temporary database user {} for cluster {}", cluster.username, cluster.cluster_name),
            Err(e) => error!(
                "Error deleting previous database user {} in project {}: {:#}",
                cluster.username, cluster.project_id, e
            ),
        }
    }

    /// Tear down the connection, the API client and the exports, then emit
    /// `Close`. Every step runs even if an earlier one failed. Closing twice
    /// is a no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.disconnect().await;

        if let Some(api_client) = &self.api_client
            && let Err(e) = api_client.close().await
        {
            error!("Error closing Atlas API client: {:#}", e);
        }

        self.connection_manager.close().await;
        self.exports_manager.close().await;

        let _ = self.events.send(SessionEvent::Close);
        info!("Session {} closed", self.session_id);
    }
}

/// The client-facing event for a connection event, if it has one
fn session_event(event: &ConnectionEvent) -> Option<SessionEvent> {
    match event {
        ConnectionEvent::Success(_) => Some(SessionEvent::Connect),
        ConnectionEvent::Close(_) => Some(SessionEvent::Disconnect),
        ConnectionEvent::Error(state) | ConnectionEvent::TimeOut(state) => Some(SessionEvent::ConnectionError(
            state.error_reason().unwrap_or_default().to_string(),
        )),
        ConnectionEvent::Request(_) | ConnectionEvent::Closed(_) => None,
    }
}
