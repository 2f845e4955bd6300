use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// Install the global tracing subscriber using the configured log level
pub fn init(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    // A subscriber may already be installed by an embedding server or a test
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Session-scoped logger handed to the session store together with a transport.
///
/// Messages logged here are meant for the session's own consumer (for example an
/// MCP client receiving log notifications), not just the server log.
pub trait SessionLogger: Send + Sync + 'static {
    fn log(&self, level: Level, context: &str, message: &str);

    fn info(&self, context: &str, message: &str) {
        self.log(Level::INFO, context, message);
    }

    fn warning(&self, context: &str, message: &str) {
        self.log(Level::WARN, context, message);
    }

    fn error(&self, context: &str, message: &str) {
        self.log(Level::ERROR, context, message);
    }
}

/// Forwards session messages to `tracing`, tagged with the session id
#[derive(Debug, Clone)]
pub struct TracingSessionLogger {
    session_id: String,
}

impl TracingSessionLogger {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self { session_id: session_id.into() }
    }
}

impl SessionLogger for TracingSessionLogger {
    fn log(&self, level: Level, context: &str, message: &str) {
        let session_id = self.session_id.as_str();
        match level {
            Level::ERROR => error!(session_id, context, "{}", message),
            Level::WARN => warn!(session_id, context, "{}", message),
            Level::INFO => info!(session_id, context, "{}", message),
            _ => debug!(session_id, context, "{}", message),
        }
    }
}
