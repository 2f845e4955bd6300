use clap::Parser;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "mongodb-mcp-server")]
#[command(about = "MongoDB MCP server - connection and session lifecycle", long_about = None)]
pub struct Config {
    #[arg(long, default_value = "info", env = "MDB_MCP_LOG_LEVEL")]
    pub log_level: String,

    #[arg(long, default_value = "MongoDB MCP Server", env = "MDB_MCP_APP_NAME", help = "Application name reported to the deployment through appName")]
    pub app_name: String,

    // Connection
    #[arg(long, default_value = "30000", env = "MDB_MCP_CONNECT_TIMEOUT_MS", help = "Maximum time to wait for a connection to be established in milliseconds")]
    pub connect_timeout_ms: u64,

    #[arg(long, env = "MDB_MCP_BROWSER", help = "Browser used for the OIDC auth-code flow; device flow is used when unset")]
    pub browser: Option<String>,

    // Exports
    #[arg(long, env = "MDB_MCP_EXPORTS_PATH", help = "Directory in which per-session export directories are created")]
    pub exports_path: Option<PathBuf>,

    #[arg(long, default_value = "300000", env = "MDB_MCP_EXPORT_TIMEOUT_MS", help = "Time after which a finished export expires in milliseconds")]
    pub export_timeout_ms: u64,

    #[arg(long, default_value = "120000", env = "MDB_MCP_EXPORT_CLEANUP_INTERVAL_MS", help = "Interval between expired export sweeps in milliseconds")]
    pub export_cleanup_interval_ms: u64,

    // Session store
    #[arg(long, default_value = "600000", env = "MDB_MCP_IDLE_TIMEOUT_MS", help = "Idle time after which an HTTP session is closed in milliseconds")]
    pub idle_timeout_ms: u64,

    #[arg(long, default_value = "540000", env = "MDB_MCP_NOTIFICATION_TIMEOUT_MS", help = "Idle time after which a session is warned about its upcoming closure in milliseconds")]
    pub notification_timeout_ms: u64,
}

impl Config {
    /// Get a configuration instance with all values resolved from CLI args and environment variables
    pub fn load() -> Self {
        Config::parse()
    }

    pub fn connect_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn export_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.export_timeout_ms)
    }

    pub fn export_cleanup_interval_duration(&self) -> Duration {
        Duration::from_millis(self.export_cleanup_interval_ms)
    }

    pub fn idle_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn notification_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.notification_timeout_ms)
    }

    /// Get the exports directory, defaulting to a folder under the system temp dir
    pub fn get_exports_path(&self) -> PathBuf {
        self.exports_path.clone().unwrap_or_else(|| {
            env::temp_dir().join("mongodb-mcp").join("exports")
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::parse_from(["mongodb-mcp-server"])
    }
}
