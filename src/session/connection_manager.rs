use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::ConnectionError;
use super::connection_state::{ConnectionEvent, ConnectionEventKind, ConnectionState, ConnectionStatus};
use super::descriptor::{ConnectionDescriptor, ConnectionSettings, DescriptorOptions};
use super::provider::{Connector, DriverEvent, DriverEvents, PendingProvider, ServiceProvider};

const EVENT_CHANNEL_CAPACITY: usize = 64;

type EventListener = Box<dyn Fn(&ConnectionEvent) + Send + Sync>;
type DriverEventReceiver = mpsc::UnboundedReceiver<(u64, DriverEvent)>;

/// Owns the lifecycle of one logical connection to a deployment.
///
/// At most one provider is live at any time: every new `connect` first
/// disconnects whatever is connected or connecting.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    options: Mutex<DescriptorOptions>,
    connect_timeout: Duration,
    state: Mutex<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    /// Called synchronously for every event, under the state lock
    listeners: Mutex<Vec<EventListener>>,
    next_attempt: AtomicU64,
    /// Serializes disconnects so a provider is closed by exactly one caller
    lifecycle: tokio::sync::Mutex<()>,
    /// Background task driving an OIDC attempt that `connect` returned early from
    attempt_task: Mutex<Option<JoinHandle<()>>>,
    driver_events: mpsc::UnboundedSender<(u64, DriverEvent)>,
    /// Taken by the first connect, which starts the driver event listener
    driver_receiver: Mutex<Option<DriverEventReceiver>>,
    driver_listener: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, config: &Config) -> Arc<Self> {
        let options = DescriptorOptions {
            app_name: config.app_name.clone(),
            client_name: None,
            browser: config.browser.clone(),
        };
        Self::with_options(connector, options, config.connect_timeout_duration())
    }

    pub fn with_options(
        connector: Arc<dyn Connector>,
        options: DescriptorOptions,
        connect_timeout: Duration,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (driver_events, driver_receiver) = mpsc::unbounded_channel();
        Arc::new(ConnectionManager {
            connector,
            options: Mutex::new(options),
            connect_timeout,
            state: Mutex::new(ConnectionState::Disconnected),
            events,
            listeners: Mutex::new(Vec::new()),
            next_attempt: AtomicU64::new(0),
            lifecycle: tokio::sync::Mutex::new(()),
            attempt_task: Mutex::new(None),
            driver_events,
            driver_receiver: Mutex::new(Some(driver_receiver)),
            driver_listener: Mutex::new(None),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Register a callback that runs for every event before `subscribe`
    /// receivers see it. It runs while the state lock is held and must not
    /// call back into the manager.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.listeners.lock().push(Box::new(listener));
    }

    pub fn current_state(&self) -> ConnectionState {
        self.state.lock().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.lock().status()
    }

    /// Name of the MCP client, reported through appName on the next connect
    pub fn set_client_name(&self, client_name: impl Into<String>) {
        self.options.lock().client_name = Some(client_name.into());
    }

    /// The live provider, or `NotConnectedToMongoDB` if there is none
    pub fn service_provider(&self) -> Result<Arc<dyn ServiceProvider>, ConnectionError> {
        match &*self.state.lock() {
            ConnectionState::Connected { provider, .. } => Ok(provider.clone()),
            ConnectionState::Errored { reason, .. } => Err(ConnectionError::NotConnectedToMongoDB(reason.clone())),
            ConnectionState::Connecting { .. } => Err(ConnectionError::NotConnectedToMongoDB(
                "Connection is still being established".to_string(),
            )),
            ConnectionState::Disconnected => Err(ConnectionError::NotConnectedToMongoDB(
                "Not connected to MongoDB".to_string(),
            )),
        }
    }

    pub async fn connect(self: &Arc<Self>, settings: ConnectionSettings) -> Result<ConnectionState, ConnectionError> {
        if matches!(
            &*self.state.lock(),
            ConnectionState::Connected { .. } | ConnectionState::Connecting { .. }
        ) {
            self.disconnect().await;
        }

        let options = self.options.lock().clone();
        let descriptor = match ConnectionDescriptor::prepare(&settings, &options) {
            Ok(descriptor) => descriptor,
            Err(reason) => {
                warn!("Failed to prepare connection: {}", reason);
                self.change_state(
                    ConnectionEventKind::Error,
                    ConnectionState::Errored {
                        reason: reason.clone(),
                        connection_info: None,
                        atlas_cluster: settings.atlas,
                    },
                );
                return Err(ConnectionError::MisconfiguredConnectionString(reason));
            }
        };

        let attempt = self.next_attempt.fetch_add(1, Ordering::SeqCst) + 1;
        self.ensure_driver_event_listener();
        let driver_events = DriverEvents::new(attempt, self.driver_events.clone());

        let auth_type = descriptor.auth_type;
        let connection_info = descriptor.info();
        debug!("Connecting (attempt {}, auth {}) to {}", attempt, auth_type, connection_info.redacted_connection_string);

        let pending_provider = PendingProvider::new(self.connector.clone(), descriptor, driver_events);
        let connecting = self.change_state(
            ConnectionEventKind::Request,
            ConnectionState::Connecting {
                attempt,
                pending_provider: pending_provider.clone(),
                auth_type,
                connection_info,
                atlas_cluster: settings.atlas,
                login_url: None,
                user_code: None,
            },
        );

        if auth_type.is_oidc() {
            // The driver reports OIDC progress through `DriverEvents`; keep the
            // attempt moving without blocking the caller on user interaction
            self.spawn_oidc_attempt(attempt, pending_provider);
            return Ok(connecting);
        }

        match tokio::time::timeout(self.connect_timeout, pending_provider.resolve()).await {
            Ok(Ok(provider)) => {
                let connected = self.transition_attempt(attempt, ConnectionEventKind::Success, |state| {
                    connected_from(state, provider)
                });
                match connected {
                    Some(state) => {
                        info!("Connected to MongoDB (attempt {})", attempt);
                        Ok(state)
                    }
                    None => {
                        // A concurrent disconnect already closed this provider
                        debug!("Connection attempt {} was superseded", attempt);
                        Ok(self.current_state())
                    }
                }
            }
            Ok(Err(reason)) => {
                error!("Failed to connect to MongoDB: {}", reason);
                self.fail_attempt(attempt, ConnectionEventKind::Error, reason.clone());
                Err(ConnectionError::NotConnectedToMongoDB(reason))
            }
            Err(_) => {
                let reason = format!("Connection timed out after {} ms", self.connect_timeout.as_millis());
                error!("Failed to connect to MongoDB: {}", reason);
                self.fail_attempt(attempt, ConnectionEventKind::TimeOut, reason.clone());
                Err(ConnectionError::NotConnectedToMongoDB(reason))
            }
        }
    }

    /// Close the live or pending provider and move to `Disconnected`.
    ///
    /// Provider close failures are logged and never returned. Concurrent calls
    /// queue behind each other; a later call finds the state already
    /// disconnected and closes nothing.
    pub async fn disconnect(&self) -> ConnectionState {
        let _lifecycle = self.lifecycle.lock().await;

        let current = self.current_state();
        let closing = match &current {
            ConnectionState::Disconnected | ConnectionState::Errored { .. } => return current,
            ConnectionState::Connected { provider, .. } => {
                close_provider(provider).await;
                Closing::Provider(provider.clone())
            }
            ConnectionState::Connecting { attempt, pending_provider, .. } => {
                let resolved = tokio::select! {
                    result = pending_provider.resolve() => match result {
                        Ok(provider) => {
                            close_provider(&provider).await;
                            Some(provider)
                        }
                        Err(reason) => {
                            debug!("Pending connection attempt {} failed: {}", attempt, reason);
                            None
                        }
                    },
                    _ = tokio::time::sleep(self.connect_timeout) => {
                        warn!("Gave up waiting for connection attempt {} while disconnecting", attempt);
                        None
                    }
                };
                if let Some(task) = self.attempt_task.lock().take() {
                    task.abort();
                }
                Closing::Attempt(*attempt, resolved)
            }
        };

        let disconnected = self.transition_if(
            |state| closing.matches(state),
            ConnectionEventKind::Close,
            ConnectionState::Disconnected,
        );
        match disconnected {
            Some(state) => {
                info!("Disconnected from MongoDB");
                state
            }
            None => {
                // The state moved on while the provider was closing; it no
                // longer refers to what was closed
                debug!("Connection state changed while disconnecting");
                self.current_state()
            }
        }
    }

    /// Best-effort disconnect followed by the terminal `close` event
    pub async fn close(&self) {
        self.disconnect().await;

        let state = self.state.lock();
        self.publish(ConnectionEvent::Closed(state.clone()));
    }

    /// A live connection failed asynchronously (for example its credentials
    /// were revoked). Moves `Connected` to `Errored` and releases the provider.
    pub async fn report_connection_failure(&self, reason: impl Into<String>) -> ConnectionState {
        let reason = reason.into();
        let _lifecycle = self.lifecycle.lock().await;
        let failed = {
            let mut state = self.state.lock();
            match &*state {
                ConnectionState::Connected { provider, connection_info, atlas_cluster } => {
                    let provider = provider.clone();
                    let errored = ConnectionState::Errored {
                        reason: reason.clone(),
                        connection_info: Some(connection_info.clone()),
                        atlas_cluster: atlas_cluster.clone(),
                    };
                    *state = errored.clone();
                    self.publish(ConnectionEvent::Error(errored.clone()));
                    Some((provider, errored))
                }
                _ => None,
            }
        };

        match failed {
            Some((provider, errored)) => {
                warn!("Connection to MongoDB failed: {}", reason);
                close_provider(&provider).await;
                errored
            }
            None => {
                debug!("Ignoring connection failure while not connected: {}", reason);
                self.current_state()
            }
        }
    }

    pub(crate) async fn handle_driver_event(&self, attempt: u64, event: DriverEvent) {
        let oidc_attempt = match &*self.state.lock() {
            ConnectionState::Connecting { attempt: current, auth_type, pending_provider, .. }
                if *current == attempt && auth_type.is_oidc() =>
            {
                Some(pending_provider.clone())
            }
            _ => None,
        };
        let Some(pending_provider) = oidc_attempt else {
            debug!("Ignoring driver event {:?} for attempt {}", event, attempt);
            return;
        };

        match event {
            DriverEvent::AuthFailed(reason) => {
                warn!("OIDC authentication failed: {}", reason);
                let before = self.current_state();
                self.disconnect().await;
                self.transition_if(
                    |state| matches!(state, ConnectionState::Disconnected),
                    ConnectionEventKind::Error,
                    ConnectionState::Errored {
                        reason,
                        connection_info: before.connection_info().cloned(),
                        atlas_cluster: before.atlas_cluster().cloned(),
                    },
                );
            }
            DriverEvent::AuthSucceeded => match pending_provider.resolve().await {
                Ok(provider) => {
                    let connected = self.transition_attempt(attempt, ConnectionEventKind::Success, |state| {
                        connected_from(state, provider)
                    });
                    if connected.is_some() {
                        info!("Connected to MongoDB after OIDC authentication (attempt {})", attempt);
                    }
                }
                Err(reason) => {
                    error!("OIDC authentication succeeded but the connection failed: {}", reason);
                    self.fail_attempt(attempt, ConnectionEventKind::Error, reason);
                }
            },
            DriverEvent::NotifyDeviceFlow(flow) => {
                debug!("OIDC device flow requested, verification url {}", flow.verification_url);
                self.transition_attempt(attempt, ConnectionEventKind::Request, |state| match state {
                    ConnectionState::Connecting {
                        attempt,
                        pending_provider,
                        auth_type,
                        connection_info,
                        atlas_cluster,
                        ..
                    } => ConnectionState::Connecting {
                        attempt: *attempt,
                        pending_provider: pending_provider.clone(),
                        auth_type: *auth_type,
                        connection_info: connection_info.clone(),
                        atlas_cluster: atlas_cluster.clone(),
                        login_url: Some(flow.verification_url),
                        user_code: Some(flow.user_code),
                    },
                    other => other.clone(),
                });
            }
        }
    }

    /// One listener serves every attempt; `handle_driver_event` drops events
    /// from attempts that are no longer current
    fn ensure_driver_event_listener(self: &Arc<Self>) {
        let Some(mut receiver) = self.driver_receiver.lock().take() else {
            return;
        };
        let manager: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some((attempt, event)) = receiver.recv().await {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.handle_driver_event(attempt, event).await;
            }
        });
        *self.driver_listener.lock() = Some(task);
    }

    fn spawn_oidc_attempt(self: &Arc<Self>, attempt: u64, pending_provider: PendingProvider) {
        let manager: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            if let Err(reason) = pending_provider.resolve().await {
                if let Some(manager) = manager.upgrade() {
                    warn!("OIDC connection attempt {} failed: {}", attempt, reason);
                    manager.fail_attempt(attempt, ConnectionEventKind::Error, reason);
                }
            }
        });
        if let Some(previous) = self.attempt_task.lock().replace(task) {
            previous.abort();
        }
    }

    fn fail_attempt(&self, attempt: u64, kind: ConnectionEventKind, reason: String) {
        self.transition_attempt(attempt, kind, |state| ConnectionState::Errored {
            reason,
            connection_info: state.connection_info().cloned(),
            atlas_cluster: state.atlas_cluster().cloned(),
        });
    }

    /// Replace the state and publish the event under the same lock, so
    /// subscribers observe transitions in order
    fn change_state(&self, kind: ConnectionEventKind, next: ConnectionState) -> ConnectionState {
        let mut state = self.state.lock();
        debug!("Connection state {} -> {}", state.tag(), next.tag());
        *state = next.clone();
        self.publish(kind.with_state(next.clone()));
        next
    }

    /// Transition only while `attempt` is still the current connecting attempt
    fn transition_attempt<F>(&self, attempt: u64, kind: ConnectionEventKind, next: F) -> Option<ConnectionState>
    where
        F: FnOnce(&ConnectionState) -> ConnectionState,
    {
        let mut state = self.state.lock();
        if state.attempt() != Some(attempt) {
            return None;
        }
        let next = next(&state);
        debug!("Connection state {} -> {} (attempt {})", state.tag(), next.tag(), attempt);
        *state = next.clone();
        self.publish(kind.with_state(next.clone()));
        Some(next)
    }

    fn transition_if<P>(&self, predicate: P, kind: ConnectionEventKind, next: ConnectionState) -> Option<ConnectionState>
    where
        P: FnOnce(&ConnectionState) -> bool,
    {
        let mut state = self.state.lock();
        if !predicate(&state) {
            return None;
        }
        *state = next.clone();
        self.publish(kind.with_state(next.clone()));
        Some(next)
    }

    /// Callers hold the state lock, which orders listener calls and
    /// broadcasts with the transitions they describe
    fn publish(&self, event: ConnectionEvent) {
        for listener in self.listeners.lock().iter() {
            listener(&event);
        }
        let _ = self.events.send(event);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(listener) = self.driver_listener.get_mut().take() {
            listener.abort();
        }
        if let Some(task) = self.attempt_task.get_mut().take() {
            task.abort();
        }
    }
}

/// What a disconnect closed, used to check the state still refers to it
enum Closing {
    Provider(Arc<dyn ServiceProvider>),
    Attempt(u64, Option<Arc<dyn ServiceProvider>>),
}

impl Closing {
    fn matches(&self, state: &ConnectionState) -> bool {
        match (self, state) {
            (Closing::Provider(closed), ConnectionState::Connected { provider, .. }) => same_provider(closed, provider),
            (Closing::Attempt(closed, _), ConnectionState::Connecting { attempt, .. }) => closed == attempt,
            // An OIDC attempt may have been promoted while its provider was closing
            (Closing::Attempt(_, Some(closed)), ConnectionState::Connected { provider, .. }) => {
                same_provider(closed, provider)
            }
            _ => false,
        }
    }
}

fn same_provider(a: &Arc<dyn ServiceProvider>, b: &Arc<dyn ServiceProvider>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Promote a connecting state to connected, keeping its connection metadata
fn connected_from(state: &ConnectionState, provider: Arc<dyn ServiceProvider>) -> ConnectionState {
    match state {
        ConnectionState::Connecting { connection_info, atlas_cluster, .. } => ConnectionState::Connected {
            provider,
            connection_info: connection_info.clone(),
            atlas_cluster: atlas_cluster.clone(),
        },
        other => other.clone(),
    }
}

async fn close_provider(provider: &Arc<dyn ServiceProvider>) {
    if let Err(e) = provider.close().await {
        error!("Error closing service provider: {:#}", e);
    }
}
