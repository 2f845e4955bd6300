// Module for session and connection lifecycle management
pub mod connection_manager;
pub mod connection_state;
pub mod descriptor;
pub mod provider;
pub mod state;
pub mod store;

pub use connection_manager::ConnectionManager;
pub use connection_state::{ConnectionEvent, ConnectionState, ConnectionStatus, ConnectionTag};
pub use descriptor::{
    AtlasClusterConnectionInfo, AuthType, ConnectionDescriptor, ConnectionInfo, ConnectionSettings, DescriptorOptions,
    OidcOptions, redact,
};
pub use provider::{Connector, DeviceFlowInfo, DriverEvent, DriverEvents, PendingProvider, ServiceProvider};
pub use state::{ApiClient, ClientInfo, Session, SessionEvent};
pub use store::{SessionStore, SessionTransport};
