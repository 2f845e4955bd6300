use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::BufWriter;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use unicode_normalization::UnicodeNormalization;

use crate::config::Config;
use crate::error::ExportError;
use super::ejson::{EjsonArrayWriter, JsonExportFormat};
use super::source::DocumentSource;

const EXPORT_EXTENSION: &str = ".json";
const EXPORT_URI_SCHEME: &str = "exported-data://";
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Settings shared by every session's exports manager
#[derive(Debug, Clone)]
pub struct ExportsConfig {
    /// Parent directory; each session writes into `<exports_path>/<session_id>`
    pub exports_path: PathBuf,
    /// How long a finished export stays available
    pub export_timeout: Duration,
    /// Interval of the background expiry sweep, disabled when zero
    pub cleanup_interval: Duration,
}

impl From<&Config> for ExportsConfig {
    fn from(config: &Config) -> Self {
        ExportsConfig {
            exports_path: config.get_exports_path(),
            export_timeout: config.export_timeout_duration(),
            cleanup_interval: config.export_cleanup_interval_duration(),
        }
    }
}

/// Public view of a stored export
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvailableExport {
    pub name: String,
    pub title: String,
    pub uri: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub enum StoredExport {
    InProgress {
        name: String,
        title: String,
        path: PathBuf,
        uri: String,
    },
    Ready {
        name: String,
        title: String,
        path: PathBuf,
        uri: String,
        created_at: DateTime<Utc>,
        doc_count: u64,
    },
}

impl StoredExport {
    pub fn path(&self) -> &Path {
        match self {
            StoredExport::InProgress { path, .. } | StoredExport::Ready { path, .. } => path,
        }
    }

    fn is_expired(&self, timeout: Duration) -> bool {
        match self {
            StoredExport::Ready { created_at, .. } => is_expired(*created_at, timeout),
            StoredExport::InProgress { .. } => false,
        }
    }

    fn to_available(&self) -> AvailableExport {
        match self {
            StoredExport::InProgress { name, title, path, uri } | StoredExport::Ready { name, title, path, uri, .. } => {
                AvailableExport {
                    name: name.clone(),
                    title: title.clone(),
                    uri: uri.clone(),
                    path: path.clone(),
                }
            }
        }
    }
}

/// Contents of a finished export
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportContent {
    pub content: String,
    pub doc_count: u64,
}

/// Request for a new JSON export
pub struct CreateExport {
    pub source: Box<dyn DocumentSource>,
    pub name: String,
    pub title: String,
    pub format: JsonExportFormat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportEvent {
    /// `export-available`: the export behind `uri` can be read
    Available { uri: String },
    /// `export-expired`: the export was swept
    Expired { name: String },
    /// `closed`: the manager shut down and removed its directory
    Closed,
}

/// Per-session registry of exports streamed to disk.
///
/// Cloning is cheap and every clone refers to the same registry.
#[derive(Clone)]
pub struct ExportsManager {
    inner: Arc<ExportsInner>,
}

struct ExportsInner {
    session_id: String,
    exports_dir: PathBuf,
    export_timeout: Duration,
    stored: Mutex<HashMap<String, StoredExport>>,
    shutdown: CancellationToken,
    /// Pipelines and their file cleanups; `close` waits for them before
    /// removing the directory
    pipelines: TaskTracker,
    closing: AtomicBool,
    cleanup_in_progress: AtomicBool,
    events: broadcast::Sender<ExportEvent>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ExportsManager {
    /// Create the manager for a session and start its expiry sweeper
    pub fn init(session_id: impl Into<String>, config: ExportsConfig) -> Self {
        let session_id = session_id.into();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Arc::new(ExportsInner {
            exports_dir: config.exports_path.join(&session_id),
            session_id,
            export_timeout: config.export_timeout,
            stored: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            pipelines: TaskTracker::new(),
            closing: AtomicBool::new(false),
            cleanup_in_progress: AtomicBool::new(false),
            events,
            sweeper: Mutex::new(None),
        });

        if !config.cleanup_interval.is_zero() {
            let sweeper = spawn_sweeper(&inner, config.cleanup_interval);
            *inner.sweeper.lock() = Some(sweeper);
        }

        ExportsManager { inner }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn exports_dir(&self) -> &Path {
        &self.inner.exports_dir
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExportEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Exports that are ready and not yet expired, sorted by name
    pub fn available_exports(&self) -> Result<Vec<AvailableExport>, ExportError> {
        self.ensure_not_shutting_down()?;
        let timeout = self.inner.export_timeout;
        let mut exports: Vec<AvailableExport> = self
            .inner
            .stored
            .lock()
            .values()
            .filter(|export| matches!(export, StoredExport::Ready { .. }) && !export.is_expired(timeout))
            .map(StoredExport::to_available)
            .collect();
        exports.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(exports)
    }

    /// Register an export and start streaming it to disk in the background.
    ///
    /// Returns as soon as the in-progress placeholder is registered; the file
    /// does not exist yet at that point.
    pub fn create_json_export(&self, request: CreateExport) -> Result<AvailableExport, ExportError> {
        self.ensure_not_shutting_down()?;
        let CreateExport { source, name, title, format } = request;

        let name = normalize_export_name(&name)?;
        let path = self.inner.exports_dir.join(&name);
        let placeholder = StoredExport::InProgress {
            name: name.clone(),
            title,
            path: path.clone(),
            uri: export_uri(&name),
        };

        {
            let mut stored = self.inner.stored.lock();
            if stored.contains_key(&name) {
                return Err(ExportError::AlreadyExists(name));
            }
            stored.insert(name.clone(), placeholder.clone());
        }

        debug!("Starting export {} for session {}", name, self.inner.session_id);
        self.inner.pipelines.spawn(run_pipeline(self.inner.clone(), source, format, name, path));

        Ok(placeholder.to_available())
    }

    pub async fn read_export(&self, name: &str) -> Result<ExportContent, ExportError> {
        self.ensure_not_shutting_down()?;
        let name = normalize_export_name(name)?;

        let (path, doc_count) = match self.inner.stored.lock().get(&name) {
            None => return Err(ExportError::NotFound),
            Some(StoredExport::InProgress { .. }) => return Err(ExportError::StillGenerating),
            Some(StoredExport::Ready { created_at, .. }) if is_expired(*created_at, self.inner.export_timeout) => {
                return Err(ExportError::NotFound);
            }
            Some(StoredExport::Ready { path, doc_count, .. }) => (path.clone(), *doc_count),
        };

        let content = tokio::select! {
            biased;
            _ = self.inner.shutdown.cancelled() => return Err(ExportError::ShuttingDown),
            result = tokio::fs::read_to_string(&path) => match result {
                Ok(content) => content,
                // Swept between the lookup and the read
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(ExportError::NotFound),
                Err(e) => return Err(ExportError::Io(e)),
            },
        };

        Ok(ExportContent { content, doc_count })
    }

    /// Unregister expired exports, then delete their files.
    ///
    /// Returns the number of exports swept, or `None` when another sweep was
    /// already running or the manager is shutting down.
    pub async fn cleanup_expired_exports(&self) -> Option<usize> {
        if self.is_shutting_down() {
            return None;
        }
        if self
            .inner
            .cleanup_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Export cleanup already in progress for session {}", self.inner.session_id);
            return None;
        }
        let _guard = CleanupGuard(&self.inner.cleanup_in_progress);

        let expired: Vec<(String, PathBuf)> = {
            let mut stored = self.inner.stored.lock();
            let names: Vec<String> = stored
                .iter()
                .filter(|(_, export)| export.is_expired(self.inner.export_timeout))
                .map(|(name, _)| name.clone())
                .collect();

            names
                .into_iter()
                .filter_map(|name| {
                    let export = stored.remove(&name)?;
                    let _ = self.inner.events.send(ExportEvent::Expired { name: name.clone() });
                    Some((name, export.path().to_path_buf()))
                })
                .collect()
        };

        if !expired.is_empty() {
            info!("Removing {} expired exports for session {}", expired.len(), self.inner.session_id);
        }
        futures::future::join_all(expired.iter().map(|(_, path)| silently_remove_export(path))).await;

        Some(expired.len())
    }

    /// Abort in-flight work, wait for the pipelines to unwind, delete the
    /// session's export directory and emit `closed`. Later calls are no-ops.
    pub async fn close(&self) {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.cancel();
        if let Some(sweeper) = self.inner.sweeper.lock().take() {
            sweeper.abort();
        }
        self.inner.stored.lock().clear();

        self.inner.pipelines.close();
        self.inner.pipelines.wait().await;

        match tokio::fs::remove_dir_all(&self.inner.exports_dir).await {
            Ok(()) => debug!("Removed exports directory {}", self.inner.exports_dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => error!("Failed to remove exports directory {}: {}", self.inner.exports_dir.display(), e),
        }

        let _ = self.inner.events.send(ExportEvent::Closed);
    }

    fn ensure_not_shutting_down(&self) -> Result<(), ExportError> {
        if self.is_shutting_down() {
            Err(ExportError::ShuttingDown)
        } else {
            Ok(())
        }
    }
}

impl ExportsInner {
    fn promote(&self, name: &str, doc_count: u64) {
        let mut stored = self.stored.lock();
        let Some(StoredExport::InProgress { name, title, path, uri }) = stored.get(name).cloned() else {
            return;
        };
        stored.insert(
            name.clone(),
            StoredExport::Ready {
                name: name.clone(),
                title,
                path,
                uri: uri.clone(),
                created_at: Utc::now(),
                doc_count,
            },
        );
        info!("Export {} is ready with {} documents", name, doc_count);
        let _ = self.events.send(ExportEvent::Available { uri });
    }

    /// Forget a failed export before its partial file is removed
    fn discard(&self, name: &str, path: PathBuf) {
        {
            let mut stored = self.stored.lock();
            if matches!(stored.get(name), Some(StoredExport::InProgress { .. })) {
                stored.remove(name);
            }
        }
        self.pipelines.spawn(async move {
            silently_remove_export(&path).await;
        });
    }
}

impl Drop for ExportsInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct CleanupGuard<'a>(&'a AtomicBool);

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

async fn run_pipeline(
    inner: Arc<ExportsInner>,
    mut source: Box<dyn DocumentSource>,
    format: JsonExportFormat,
    name: String,
    path: PathBuf,
) {
    let result = write_export(&inner.exports_dir, &path, source.as_mut(), format, &inner.shutdown).await;

    match result {
        Ok(doc_count) => inner.promote(&name, doc_count),
        Err(e) => {
            error!("Export {} failed: {:#}", name, e);
            inner.discard(&name, path);
        }
    }

    if let Err(e) = source.close().await {
        warn!("Failed to close the source of export {}: {:#}", name, e);
    }
}

/// Stream `source` into `path`.
///
/// Shutdown is checked between filesystem steps, never by dropping one
/// midway: a dropped `tokio::fs` future still runs on the blocking pool.
async fn write_export(
    dir: &Path,
    path: &Path,
    source: &mut dyn DocumentSource,
    format: JsonExportFormat,
    shutdown: &CancellationToken,
) -> anyhow::Result<u64> {
    ensure_running(shutdown)?;
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create exports directory {}", dir.display()))?;
    ensure_running(shutdown)?;
    let file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("Failed to create export file {}", path.display()))?;

    let mut writer = EjsonArrayWriter::new(BufWriter::new(file), format);
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(shutting_down()),
            next = source.next_document() => next?,
        };
        let Some(document) = next else {
            break;
        };
        writer.write_document(document).await?;
    }
    ensure_running(shutdown)?;
    Ok(writer.finish().await?)
}

fn ensure_running(shutdown: &CancellationToken) -> anyhow::Result<()> {
    if shutdown.is_cancelled() {
        return Err(shutting_down());
    }
    Ok(())
}

fn shutting_down() -> anyhow::Error {
    anyhow::anyhow!("exports manager is shutting down")
}

async fn silently_remove_export(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed export file {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => error!("Failed to remove export file {}: {}", path.display(), e),
    }
}

fn spawn_sweeper(inner: &Arc<ExportsInner>, interval: Duration) -> JoinHandle<()> {
    let manager: Weak<ExportsInner> = Arc::downgrade(inner);
    let shutdown = inner.shutdown.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(inner) = manager.upgrade() else {
                        break;
                    };
                    ExportsManager { inner }.cleanup_expired_exports().await;
                }
            }
        }
    })
}

fn is_expired(created_at: DateTime<Utc>, timeout: Duration) -> bool {
    (Utc::now() - created_at)
        .to_std()
        .map(|age| age > timeout)
        .unwrap_or(false)
}

fn export_uri(name: &str) -> String {
    format!("{}{}", EXPORT_URI_SCHEME, urlencoding::encode(name))
}

/// Percent-decode, NFKC-normalize and validate a requested export name,
/// appending the `.json` extension when missing
pub fn normalize_export_name(raw: &str) -> Result<String, ExportError> {
    let decoded = urlencoding::decode(raw).map_err(|e| ExportError::InvalidName(format!("{raw}: {e}")))?;
    let normalized: String = decoded.nfkc().collect();
    let name = normalized.trim();

    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || name.chars().any(char::is_control)
    {
        return Err(ExportError::InvalidName(raw.to_string()));
    }

    if name.ends_with(EXPORT_EXTENSION) {
        Ok(name.to_string())
    } else {
        Ok(format!("{name}{EXPORT_EXTENSION}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_appends_extension_once() {
        assert_eq!(normalize_export_name("report").unwrap(), "report.json");
        assert_eq!(normalize_export_name("report.json").unwrap(), "report.json");
    }

    #[test]
    fn test_normalize_decodes_and_normalizes() {
        assert_eq!(normalize_export_name("my%20report").unwrap(), "my report.json");
        // Fullwidth letters fold to ASCII under NFKC
        assert_eq!(normalize_export_name("ｒｅｐｏｒｔ").unwrap(), "report.json");
    }

    #[test]
    fn test_normalize_rejects_paths() {
        for name in ["", "..", "a/b", "..%2Fetc%2Fpasswd", "a\\b", "bad\u{0007}name"] {
            assert!(
                matches!(normalize_export_name(name), Err(ExportError::InvalidName(_))),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_export_uri_is_percent_encoded() {
        assert_eq!(export_uri("my report.json"), "exported-data://my%20report.json");
    }

    #[test]
    fn test_expiry() {
        let fresh = Utc::now();
        assert!(!is_expired(fresh, Duration::from_secs(60)));

        let old = Utc::now() - chrono::Duration::seconds(120);
        assert!(is_expired(old, Duration::from_secs(60)));

        // Clock skew into the future never counts as expired
        let future = Utc::now() + chrono::Duration::seconds(120);
        assert!(!is_expired(future, Duration::from_secs(0)));
    }
}
