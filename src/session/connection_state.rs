use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use super::descriptor::{AtlasClusterConnectionInfo, AuthType, ConnectionInfo};
use super::provider::{PendingProvider, ServiceProvider};

/// Current state of a connection manager. Exactly one is current at a time and
/// transitions always replace the whole value.
#[derive(Clone)]
pub enum ConnectionState {
    Disconnected,
    Connecting {
        attempt: u64,
        pending_provider: PendingProvider,
        auth_type: AuthType,
        connection_info: ConnectionInfo,
        atlas_cluster: Option<AtlasClusterConnectionInfo>,
        login_url: Option<String>,
        user_code: Option<String>,
    },
    Connected {
        provider: Arc<dyn ServiceProvider>,
        connection_info: ConnectionInfo,
        atlas_cluster: Option<AtlasClusterConnectionInfo>,
    },
    Errored {
        reason: String,
        connection_info: Option<ConnectionInfo>,
        atlas_cluster: Option<AtlasClusterConnectionInfo>,
    },
}

impl ConnectionState {
    pub fn tag(&self) -> ConnectionTag {
        match self {
            ConnectionState::Disconnected => ConnectionTag::Disconnected,
            ConnectionState::Connecting { .. } => ConnectionTag::Connecting,
            ConnectionState::Connected { .. } => ConnectionTag::Connected,
            ConnectionState::Errored { .. } => ConnectionTag::Errored,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }

    pub fn atlas_cluster(&self) -> Option<&AtlasClusterConnectionInfo> {
        match self {
            ConnectionState::Disconnected => None,
            ConnectionState::Connecting { atlas_cluster, .. }
            | ConnectionState::Connected { atlas_cluster, .. }
            | ConnectionState::Errored { atlas_cluster, .. } => atlas_cluster.as_ref(),
        }
    }

    pub fn connection_info(&self) -> Option<&ConnectionInfo> {
        match self {
            ConnectionState::Disconnected => None,
            ConnectionState::Connecting { connection_info, .. }
            | ConnectionState::Connected { connection_info, .. } => Some(connection_info),
            ConnectionState::Errored { connection_info, .. } => connection_info.as_ref(),
        }
    }

    pub fn error_reason(&self) -> Option<&str> {
        match self {
            ConnectionState::Errored { reason, .. } => Some(reason),
            _ => None,
        }
    }

    pub(crate) fn attempt(&self) -> Option<u64> {
        match self {
            ConnectionState::Connecting { attempt, .. } => Some(*attempt),
            _ => None,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        let (login_url, user_code) = match self {
            ConnectionState::Connecting { login_url, user_code, .. } => (login_url.clone(), user_code.clone()),
            _ => (None, None),
        };
        let info = self.connection_info();
        ConnectionStatus {
            tag: self.tag(),
            auth_type: info.map(|i| i.auth_type),
            connection_string: info.map(|i| i.redacted_connection_string.clone()),
            error_reason: self.error_reason().map(str::to_string),
            login_url,
            user_code,
            atlas_cluster: self.atlas_cluster().cloned(),
        }
    }
}

impl fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("Disconnected"),
            ConnectionState::Connecting { attempt, pending_provider, auth_type, login_url, user_code, .. } => f
                .debug_struct("Connecting")
                .field("attempt", attempt)
                .field("pending_provider", pending_provider)
                .field("auth_type", auth_type)
                .field("login_url", login_url)
                .field("user_code", user_code)
                .finish_non_exhaustive(),
            ConnectionState::Connected { connection_info, .. } => f
                .debug_struct("Connected")
                .field("connection_info", connection_info)
                .finish_non_exhaustive(),
            ConnectionState::Errored { reason, .. } => f
                .debug_struct("Errored")
                .field("reason", reason)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionTag {
    Disconnected,
    Connecting,
    Connected,
    Errored,
}

impl fmt::Display for ConnectionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            ConnectionTag::Disconnected => "disconnected",
            ConnectionTag::Connecting => "connecting",
            ConnectionTag::Connected => "connected",
            ConnectionTag::Errored => "errored",
        };
        f.write_str(tag)
    }
}

/// Serializable snapshot of a connection for debug and status output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub tag: ConnectionTag,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_type: Option<AuthType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atlas_cluster: Option<AtlasClusterConnectionInfo>,
}

/// Events published by a connection manager, each carrying the new state
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// `connection-request`: an attempt started or its device-flow data changed
    Request(ConnectionState),
    /// `connection-success`
    Success(ConnectionState),
    /// `connection-time-out`
    TimeOut(ConnectionState),
    /// `connection-close`
    Close(ConnectionState),
    /// `connection-error`
    Error(ConnectionState),
    /// `close`: the manager itself was closed
    Closed(ConnectionState),
}

impl ConnectionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionEvent::Request(_) => "connection-request",
            ConnectionEvent::Success(_) => "connection-success",
            ConnectionEvent::TimeOut(_) => "connection-time-out",
            ConnectionEvent::Close(_) => "connection-close",
            ConnectionEvent::Error(_) => "connection-error",
            ConnectionEvent::Closed(_) => "close",
        }
    }

    pub fn state(&self) -> &ConnectionState {
        match self {
            ConnectionEvent::Request(state)
            | ConnectionEvent::Success(state)
            | ConnectionEvent::TimeOut(state)
            | ConnectionEvent::Close(state)
            | ConnectionEvent::Error(state)
            | ConnectionEvent::Closed(state) => state,
        }
    }
}

/// Which event accompanies a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionEventKind {
    Request,
    Success,
    TimeOut,
    Close,
    Error,
}

impl ConnectionEventKind {
    pub(crate) fn with_state(self, state: ConnectionState) -> ConnectionEvent {
        match self {
            ConnectionEventKind::Request => ConnectionEvent::Request(state),
            ConnectionEventKind::Success => ConnectionEvent::Success(state),
            ConnectionEventKind::TimeOut => ConnectionEvent::TimeOut(state),
            ConnectionEventKind::Close => ConnectionEvent::Close(state),
            ConnectionEventKind::Error => ConnectionEvent::Error(state),
        }
    }
}
