//! Live reloading: re-evaluate a snippet file every time it is saved
//!
//! The parent directory is watched rather than the file itself, since many
//! editors save by writing a new file and renaming it over the old one.
//! Bursts of events are debounced and unchanged content is not re-evaluated.

use crate::controller::Backend;
use crate::studio::StudioHandle;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const DEBOUNCE: Duration = Duration::from_millis(150);

#[derive(Debug)]
pub enum WatchError {
    Io { path: PathBuf, source: std::io::Error },
    Notify(notify::Error),
}

impl fmt::Display for WatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchError::Io { path, source } => {
                write!(f, "Cannot read {}: {}", path.display(), source)
            }
            WatchError::Notify(e) => write!(f, "File watcher failed: {}", e),
        }
    }
}

impl std::error::Error for WatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WatchError::Io { source, .. } => Some(source),
            WatchError::Notify(e) => Some(e),
        }
    }
}

impl From<notify::Error> for WatchError {
    fn from(e: notify::Error) -> Self {
        WatchError::Notify(e)
    }
}

/// Tracks the file being watched and what was last evaluated
#[derive(Debug)]
pub struct LiveFile {
    path: PathBuf,
    last: Option<String>,
    reloads: usize,
}

impl LiveFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last: None,
            reloads: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn reloads(&self) -> usize {
        self.reloads
    }

    /// Whether a filesystem event concerns this file
    pub fn is_relevant(&self, event: &notify::Event) -> bool {
        matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
            && event
                .paths
                .iter()
                .any(|p| p.file_name() == self.path.file_name())
    }

    /// Read the file, returning its content if it differs from the last read
    pub fn read_changed(&mut self) -> Result<Option<String>, WatchError> {
        let content = fs::read_to_string(&self.path).map_err(|source| WatchError::Io {
            path: self.path.clone(),
            source,
        })?;
        if self.last.as_deref() == Some(content.as_str()) {
            return Ok(None);
        }
        self.last = Some(content.clone());
        self.reloads += 1;
        Ok(Some(content))
    }
}

/// Evaluate `path` now and after every change, until the watcher stops
pub async fn run(studio: &StudioHandle, path: &Path, backend: Backend) -> Result<(), WatchError> {
    let mut file = LiveFile::new(path);
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<notify::Result<notify::Event>>();
    let mut watcher: RecommendedWatcher = notify::recommended_watcher(move |res| {
        let _ = tx.send(res);
    })?;
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;

    info!("👀 Watching {} ({} backend)", path.display(), backend);
    reload(studio, &mut file, backend).await?;

    while let Some(res) = rx.recv().await {
        match res {
            Ok(event) if file.is_relevant(&event) => {
                // Let the burst of events from one save settle
                tokio::time::sleep(DEBOUNCE).await;
                while rx.try_recv().is_ok() {}
                if let Err(e) = reload(studio, &mut file, backend).await {
                    warn!("{}", e);
                }
            }
            Ok(event) => debug!("Ignoring {:?}", event.kind),
            Err(e) => warn!("Watch error: {}", e),
        }
    }

    Ok(())
}

async fn reload(studio: &StudioHandle, file: &mut LiveFile, backend: Backend) -> Result<(), WatchError> {
    let Some(code) = file.read_changed()? else {
        debug!("{} unchanged", file.path().display());
        return Ok(());
    };

    match studio.evaluate_with(backend, code).await {
        Ok(Some(session)) => info!(
            "▶ Reload {} of {}: session {}",
            file.reloads(),
            file.path().display(),
            session
        ),
        Ok(None) => info!("⏹ {} is empty, idle", file.path().display()),
        Err(e) => error!("❌ {}", e),
    }
    Ok(())
}
