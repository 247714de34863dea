//! Hot reload of the orchestrator TOML file.
//!
//! ## Responsibility
//! Notice edits to the config file, re-run the loader on them and publish
//! each config that validates on a broadcast channel.
//!
//! ## Guarantees
//! - Subscribers only ever see configs that passed validation
//! - A burst of writes produces one reload once the file settles
//! - Dropping the [`ConfigWatcher`] ends the reload task
//!
//! ## NOT Responsible For
//! - Pushing a new config into running components (`Orchestrator::apply_config`)
//! - The first load at start-up (`loader`)

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::loader::load_from_file;
use super::validation::ConfigError;
use super::OrchestratorConfig;

/// Quiet period after the last file event before reloading.
const SETTLE: Duration = Duration::from_millis(300);

/// Publishes validated reloads of one config file.
pub struct ConfigWatcher {
    tx: broadcast::Sender<OrchestratorConfig>,
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl ConfigWatcher {
    /// Start watching `path`.
    ///
    /// The current file content is not published; load it with
    /// `loader::load_from_file` first.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] if no OS watcher can be created or the file's
    /// directory cannot be watched.
    pub fn new(
        path: PathBuf,
    ) -> Result<(Self, broadcast::Receiver<OrchestratorConfig>), ConfigError> {
        let (tx, rx) = broadcast::channel(8);
        let (touched_tx, touched_rx) = mpsc::unbounded_channel::<()>();

        let target: Option<OsString> = path.file_name().map(|n| n.to_os_string());
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                let Ok(event) = res else { return };
                let relevant = matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
                    && event.paths.iter().any(|p| p.file_name() == target.as_deref());
                if relevant {
                    let _ = touched_tx.send(());
                }
            },
            notify::Config::default(),
        )
        .map_err(|e| watch_error(&path, e))?;

        // Atomic saves replace the inode, so the directory is watched instead.
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| watch_error(&dir, e))?;

        let task = tokio::spawn(reload_loop(path, touched_rx, tx.clone()));

        Ok((
            Self {
                tx,
                _watcher: watcher,
                task,
            },
            rx,
        ))
    }

    /// Another receiver for reloads.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorConfig> {
        self.tx.subscribe()
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn watch_error(path: &Path, e: notify::Error) -> ConfigError {
    ConfigError::Io {
        file: path.display().to_string(),
        source: std::io::Error::other(e.to_string()),
    }
}

async fn reload_loop(
    path: PathBuf,
    mut touched: mpsc::UnboundedReceiver<()>,
    tx: broadcast::Sender<OrchestratorConfig>,
) {
    while touched.recv().await.is_some() {
        loop {
            tokio::time::sleep(SETTLE).await;
            let mut more = false;
            while touched.try_recv().is_ok() {
                more = true;
            }
            if !more {
                break;
            }
        }

        match load_from_file(&path) {
            Ok(config) => {
                info!(
                    path = %path.display(),
                    pipeline = %config.pipeline.name,
                    "config file changed, publishing reload"
                );
                let _ = tx.send(config);
            }
            Err(e) => warn!(
                path = %path.display(),
                error = %e,
                "ignoring invalid config edit"
            ),
        }
    }
}
