//! Debounced filesystem watcher.
//!
//! Keeps the index honest when files are edited outside the API (a human in
//! an editor, another tool writing markdown). Watches the store directory
//! recursively, queues `.md` paths, and after a quiet period syncs every
//! queued path and attempts a single `auto-sync` commit.
//!
//! The `.git` and `.index` subtrees are never acted on. Sync failures are
//! logged and skipped; a clean tree at commit time is normal (the change may
//! have been one the API already committed).

use notify::{Event, EventKind, RecursiveMode, Watcher as _};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::manager::Manager;

/// Default debounce window.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Running watcher handle. Dropping it without [`Watcher::stop`] detaches
/// the background task; `stop` shuts it down deterministically.
pub struct Watcher {
    stop_tx: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
}

impl Watcher {
    /// Start watching `manager`'s store directory.
    pub fn start(manager: Arc<Manager>, debounce: Duration) -> Result<Self> {
        let root = manager.root().to_path_buf();

        let (event_tx, event_rx) = mpsc::unbounded_channel::<PathBuf>();

        let mut notifier =
            notify::recommended_watcher(move |res: notify::Result<Event>| {
                let Ok(event) = res else { return };
                if !is_relevant_kind(&event.kind) {
                    return;
                }
                for path in event.paths {
                    let _ = event_tx.send(path);
                }
            })
            .map_err(|e| Error::Internal(format!("watcher init failed: {}", e)))?;

        notifier
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| Error::Internal(format!("watch failed: {}", e)))?;

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(debounce_loop(
            manager, root, notifier, event_rx, stop_rx, debounce,
        ));

        Ok(Self {
            stop_tx: Some(stop_tx),
            task,
        })
    }

    /// Shut down: closes the notifier and waits for the task to finish.
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
    }
}

async fn debounce_loop(
    manager: Arc<Manager>,
    root: PathBuf,
    _notifier: notify::RecommendedWatcher,
    mut events: mpsc::UnboundedReceiver<PathBuf>,
    mut stop: oneshot::Receiver<()>,
    debounce: Duration,
) {
    let mut queue: BTreeSet<String> = BTreeSet::new();
    let mut deadline: Option<tokio::time::Instant> = None;

    loop {
        tokio::select! {
            _ = &mut stop => break,
            maybe = events.recv() => {
                let Some(path) = maybe else { break };
                if let Some(rel) = store_relative_md(&root, &path) {
                    queue.insert(rel);
                    // Every event resets the timer.
                    deadline = Some(tokio::time::Instant::now() + debounce);
                }
            }
            _ = tokio::time::sleep_until(
                deadline.unwrap_or_else(tokio::time::Instant::now)
            ), if deadline.is_some() => {
                flush(&manager, &mut queue).await;
                deadline = None;
            }
        }
    }
    // The notifier drops here, closing the OS watch.
}

async fn flush(manager: &Manager, queue: &mut BTreeSet<String>) {
    if queue.is_empty() {
        return;
    }
    debug!(count = queue.len(), "watcher flush");

    for path in std::mem::take(queue) {
        if let Err(e) = manager.sync(&path).await {
            warn!(path = %path, error = %e, "watcher sync failed");
        }
    }

    if let Err(e) = manager.auto_commit("auto-sync").await {
        warn!(error = %e, "auto-sync commit failed");
    }
}

/// Create, modify, and remove events matter; reads do not.
fn is_relevant_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) | EventKind::Any
    )
}

/// Store-relative path for a notification worth acting on: an `.md` file
/// outside the `.git` and `.index` subtrees.
fn store_relative_md(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;

    for component in rel.components() {
        let name = component.as_os_str().to_string_lossy();
        if name == ".git" || name == crate::git::INDEX_DIR_NAME {
            return None;
        }
    }

    if rel.extension().and_then(|e| e.to_str()) != Some("md") {
        return None;
    }

    // Files inside a nested store (a per-repo store under `repos/`) belong
    // to that store's own watcher.
    let mut prefix = root.to_path_buf();
    if let Some(parent) = rel.parent() {
        for component in parent.components() {
            prefix.push(component);
            if prefix.join(".git").exists() {
                return None;
            }
        }
    }

    Some(rel.to_string_lossy().replace('\\', "/"))
}
