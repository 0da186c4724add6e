//! Debounced filesystem event source feeding the synchronizer.
//!
//! Events are debounced per path, filtered (dotfiles, tool caches, the
//! store's own data directory, symlinks, unsupported extensions), and
//! pushed into a bounded queue. When the queue is full the newest event is
//! shed with a warning; the next full sync repairs anything missed. The
//! initial scan belongs to the synchronizer, not the watcher.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::RecursiveMode;
use notify_debouncer_full::{new_debouncer, DebounceEventResult, DebouncedEvent, RecommendedCache};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::{is_excluded_directory, is_supported_extension};
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Changed,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct FileEvent {
    pub kind: ChangeKind,
    pub path: PathBuf,
}

pub struct FileWatcher {
    _debouncer: notify_debouncer_full::Debouncer<notify::RecommendedWatcher, RecommendedCache>,
}

impl FileWatcher {
    /// Watch `root` recursively. Returns the watcher handle (dropping it
    /// stops the watch) and the bounded event receiver.
    pub fn start(
        root: &Path,
        data_dir: &Path,
        debounce: Duration,
        queue_capacity: usize,
    ) -> AppResult<(Self, mpsc::Receiver<FileEvent>)> {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let data_dir = data_dir.to_path_buf();
        let root_dir = root.to_path_buf();

        let mut debouncer = new_debouncer(
            debounce,
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    // Last event type wins per path within a debounce batch.
                    let mut latest: HashMap<PathBuf, ChangeKind> = HashMap::new();
                    for event in &events {
                        let Some(kind) = classify(event) else { continue };
                        for path in &event.paths {
                            if is_ignored(path, &root_dir, &data_dir, kind) {
                                continue;
                            }
                            latest.insert(path.clone(), kind);
                        }
                    }

                    for (path, kind) in latest {
                        match tx.try_send(FileEvent { kind, path }) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(event)) => {
                                warn!(
                                    path = %event.path.display(),
                                    "watcher queue full, shedding newest event"
                                );
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => {}
                        }
                    }
                }
                Err(errors) => {
                    for e in errors {
                        warn!(error = ?e, "file watcher error");
                    }
                }
            },
        )
        .map_err(|e| AppError::Io(std::io::Error::other(e)))?;

        debouncer
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| AppError::Io(std::io::Error::other(e)))?;

        info!(
            root = %root.display(),
            debounce_ms = debounce.as_millis() as u64,
            queue = queue_capacity,
            "file watcher started"
        );
        Ok((Self { _debouncer: debouncer }, rx))
    }
}

fn classify(event: &DebouncedEvent) -> Option<ChangeKind> {
    use notify::EventKind;
    match event.kind {
        EventKind::Create(_) => Some(ChangeKind::Added),
        EventKind::Modify(_) => Some(ChangeKind::Changed),
        EventKind::Remove(_) => Some(ChangeKind::Deleted),
        _ => None,
    }
}

/// Filter applied before an event enters the queue. Deleted paths can no
/// longer be stat-ed, so only name-based checks apply to them. Dotfile
/// and cache-directory rules look only at components below the watched
/// root, so a hidden-named root directory still works.
fn is_ignored(path: &Path, root: &Path, data_dir: &Path, kind: ChangeKind) -> bool {
    if path.starts_with(data_dir) {
        return true;
    }
    let relative = path.strip_prefix(root).unwrap_or(path);
    for component in relative.components() {
        if let std::path::Component::Normal(name) = component {
            let name = name.to_string_lossy();
            if name.starts_with('.') || is_excluded_directory(&name) {
                return true;
            }
        }
    }
    let ext = path
        .extension()
        .unwrap_or_default()
        .to_string_lossy()
        .to_lowercase();
    if !is_supported_extension(&ext) {
        return true;
    }
    if kind != ChangeKind::Deleted {
        // Symlinks are ignored to avoid traversal loops.
        if let Ok(meta) = std::fs::symlink_metadata(path) {
            if meta.file_type().is_symlink() || meta.is_dir() {
                return true;
            }
        }
    }
    false
}
