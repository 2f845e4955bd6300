use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::SessionStoreError;
use crate::logging::SessionLogger;
use crate::timer::ManagedTimer;

const LOG_CONTEXT: &str = "sessionStore";

/// Anything the store can close when a session goes idle, usually the HTTP
/// transport serving that session
#[async_trait]
pub trait SessionTransport: Send + Sync + 'static {
    async fn close(&self) -> anyhow::Result<()>;
}

/// Registry of transports keyed by external session id, with idle eviction.
///
/// Each session gets an idle timer that closes it and a shorter notification
/// timer that warns its consumer first. Reading a session restarts both.
pub struct SessionStore<T: SessionTransport> {
    inner: Arc<StoreInner<T>>,
}

impl<T: SessionTransport> Clone for SessionStore<T> {
    fn clone(&self) -> Self {
        SessionStore { inner: self.inner.clone() }
    }
}

struct StoreInner<T> {
    idle_timeout: Duration,
    notification_timeout: Duration,
    sessions: Mutex<HashMap<String, SessionEntry<T>>>,
}

struct SessionEntry<T> {
    transport: Arc<T>,
    idle_timer: ManagedTimer,
    notification_timer: ManagedTimer,
    logger: Arc<dyn SessionLogger>,
}

impl<T: SessionTransport> SessionStore<T> {
    /// Fails unless `idle_timeout > notification_timeout > 0`
    pub fn new(idle_timeout: Duration, notification_timeout: Duration) -> Result<Self, SessionStoreError> {
        if notification_timeout.is_zero() || idle_timeout <= notification_timeout {
            return Err(SessionStoreError::InvalidTimeouts {
                idle: idle_timeout,
                notification: notification_timeout,
            });
        }

        Ok(SessionStore {
            inner: Arc::new(StoreInner {
                idle_timeout,
                notification_timeout,
                sessions: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, SessionStoreError> {
        Self::new(config.idle_timeout_duration(), config.notification_timeout_duration())
    }

    pub fn idle_timeout(&self) -> Duration {
        self.inner.idle_timeout
    }

    pub fn notification_timeout(&self) -> Duration {
        self.inner.notification_timeout
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    /// Whether `session_id` is registered. Unlike `get_session` this does not
    /// count as activity.
    pub fn contains(&self, session_id: &str) -> bool {
        self.inner.sessions.lock().contains_key(session_id)
    }

    /// Look up a transport, restarting the session's idle and notification timers
    pub fn get_session(&self, session_id: &str) -> Option<Arc<T>> {
        let sessions = self.inner.sessions.lock();
        let entry = sessions.get(session_id)?;
        entry.idle_timer.restart();
        entry.notification_timer.restart();
        Some(entry.transport.clone())
    }

    pub fn set_session(
        &self,
        session_id: impl Into<String>,
        transport: Arc<T>,
        logger: Arc<dyn SessionLogger>,
    ) -> Result<(), SessionStoreError> {
        let session_id = session_id.into();
        let mut sessions = self.inner.sessions.lock();
        if sessions.contains_key(&session_id) {
            return Err(SessionStoreError::DuplicateSession(session_id));
        }

        let idle_timer = {
            let store = Arc::downgrade(&self.inner);
            let session_id = session_id.clone();
            ManagedTimer::start(
                move || close_idle_session(store.clone(), session_id.clone()),
                self.inner.idle_timeout,
            )
        };
        let notification_timer = {
            let store = Arc::downgrade(&self.inner);
            let session_id = session_id.clone();
            ManagedTimer::start(
                move || notify_idle_session(store.clone(), session_id.clone()),
                self.inner.notification_timeout,
            )
        };

        sessions.insert(
            session_id.clone(),
            SessionEntry {
                transport,
                idle_timer,
                notification_timer,
                logger,
            },
        );
        debug!("Registered session {} (total sessions: {})", session_id, sessions.len());
        Ok(())
    }

    /// Unregister a session and optionally close its transport.
    ///
    /// Transport close failures are logged, not returned.
    pub async fn close_session(&self, session_id: &str, close_transport: bool) -> Result<(), SessionStoreError> {
        let entry = self
            .inner
            .sessions
            .lock()
            .remove(session_id)
            .ok_or_else(|| SessionStoreError::UnknownSession(session_id.to_string()))?;

        entry.idle_timer.cancel();
        entry.notification_timer.cancel();

        if close_transport && let Err(e) = entry.transport.close().await {
            error!("Failed to close transport for session {}: {:#}", session_id, e);
        }

        info!("Closed session {} (remaining sessions: {})", session_id, self.session_count());
        Ok(())
    }

    /// Close every registered session concurrently
    pub async fn close_all_sessions(&self) {
        let session_ids: Vec<String> = self.inner.sessions.lock().keys().cloned().collect();
        let results = futures::future::join_all(session_ids.iter().map(|id| self.close_session(id, true))).await;

        for (session_id, result) in session_ids.iter().zip(results) {
            if let Err(e) = result {
                // Someone else closed it first
                debug!("Skipped closing session {}: {}", session_id, e);
            }
        }
    }
}

impl<T: SessionTransport> StoreInner<T> {
    fn logger_for(&self, session_id: &str) -> Option<Arc<dyn SessionLogger>> {
        self.sessions.lock().get(session_id).map(|entry| entry.logger.clone())
    }
}

async fn notify_idle_session<T: SessionTransport>(store: Weak<StoreInner<T>>, session_id: String) {
    let Some(store) = store.upgrade() else {
        return;
    };
    match store.logger_for(&session_id) {
        Some(logger) => logger.info(LOG_CONTEXT, "Session is about to be closed due to inactivity"),
        None => warn!("Session {} not found when sending inactivity notification", session_id),
    }
}

async fn close_idle_session<T: SessionTransport>(store: Weak<StoreInner<T>>, session_id: String) {
    let Some(inner) = store.upgrade() else {
        return;
    };
    let Some(logger) = inner.logger_for(&session_id) else {
        return;
    };
    logger.info(LOG_CONTEXT, "Session closed due to inactivity");

    let store = SessionStore { inner };
    if let Err(e) = store.close_session(&session_id, true).await {
        error!("Failed to close idle session {}: {}", session_id, e);
    }
}
