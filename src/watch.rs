//! Debounced file watching for credential rotation
//!
//! Credential files are usually mounted through a symlink that is atomically
//! re-pointed when they rotate, so watching the file itself stops working
//! after the first rotation. Every path is therefore resolved to its
//! containing directory and the directory is watched instead.

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecursiveMode, Watcher as _};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Sleep;
use tracing::{debug, error, info, warn};

/// Callback invoked once per debounced burst of changes. It runs on the
/// blocking thread pool, so file reads and parsing are fine there; the
/// runtime is still entered, so it may spawn tasks.
pub type OnChange = Arc<dyn Fn() + Send + Sync>;

/// Watches a named set of files and invokes a callback at most once per
/// quiet window.
pub struct Watcher {
    name: String,
    paths: Vec<PathBuf>,
    min_delay: Duration,
    on_change: OnChange,
}

impl Watcher {
    pub fn new<F>(name: impl Into<String>, paths: Vec<PathBuf>, min_delay: Duration, on_change: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            paths,
            min_delay,
            on_change: Arc::new(on_change),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directories that will be watched, deduplicated and sorted
    pub fn directories(&self) -> Vec<PathBuf> {
        watch_directories(&self.paths)
    }

    /// Run until `shutdown` flips to true.
    ///
    /// If a directory watch cannot be installed the error is logged and the
    /// watcher returns without ever notifying.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let name = self.name.clone();

        let mut inner = match notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let _ = tx.send(event);
            }
            Err(e) => warn!(watcher = %name, error = %e, "File watch error"),
        }) {
            Ok(w) => w,
            Err(e) => {
                error!(watcher = %self.name, error = %e, "Failed to create file watcher");
                return;
            }
        };

        let dirs = self.directories();
        for dir in &dirs {
            if let Err(e) = inner.watch(dir, RecursiveMode::NonRecursive) {
                error!(
                    watcher = %self.name,
                    dir = %dir.display(),
                    error = %e,
                    "Failed to watch directory, changes will not be reloaded"
                );
                return;
            }
        }

        info!(
            watcher = %self.name,
            dirs = ?dirs,
            min_delay_ms = self.min_delay.as_millis() as u64,
            "Watching for changes"
        );

        debounce_events(&self.name, rx, self.min_delay, self.on_change, shutdown).await;

        // Dropping the notify handle removes the directory watches
        drop(inner);
        debug!(watcher = %self.name, "Watcher stopped");
    }
}

fn watch_directories(paths: &[PathBuf]) -> Vec<PathBuf> {
    let dirs: BTreeSet<PathBuf> = paths
        .iter()
        .map(|p| match p.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => Path::new(".").to_path_buf(),
        })
        .collect();
    dirs.into_iter().collect()
}

/// Attribute-only changes and reads are not rotations.
fn is_change(kind: &EventKind) -> bool {
    !matches!(
        kind,
        EventKind::Access(_) | EventKind::Modify(ModifyKind::Metadata(_))
    )
}

/// The first change after an idle period arms a timer of `min_delay`;
/// changes arriving while it runs are swallowed. When the timer fires the
/// callback runs once and the loop goes back to idle.
async fn debounce_events(
    name: &str,
    mut events: mpsc::UnboundedReceiver<Event>,
    min_delay: Duration,
    on_change: OnChange,
    mut shutdown: watch::Receiver<bool>,
) {
    if *shutdown.borrow() {
        return;
    }

    let mut timer: Option<Pin<Box<Sleep>>> = None;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    return;
                };
                if !is_change(&event.kind) {
                    continue;
                }
                if timer.is_none() {
                    debug!(watcher = %name, kind = ?event.kind, paths = ?event.paths, "Change detected");
                    timer = Some(Box::pin(tokio::time::sleep(min_delay)));
                }
            }
            _ = async {
                match timer.as_mut() {
                    Some(t) => t.await,
                    None => std::future::pending().await,
                }
            } => {
                timer = None;
                debug!(watcher = %name, "Quiet window elapsed, notifying");
                let callback = Arc::clone(&on_change);
                if let Err(e) = tokio::task::spawn_blocking(move || callback()).await {
                    error!(watcher = %name, error = %e, "Change callback failed");
                }
            }
            _ = shutdown.changed() => {
                return;
            }
        }
    }
}
