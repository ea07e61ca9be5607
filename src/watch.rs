//! Recursive file watching with tick-batched events.
//!
//! Raw filesystem notifications are coalesced on a fixed one-second tick
//! into event batches; consumers receive groups, not individual events.
//! The watcher can be paused so that a rebuild's own writes do not
//! retrigger the loop — batches accumulated while paused are dropped.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event as NotifyEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::Result;

const BATCH_INTERVAL: Duration = Duration::from_secs(1);

/// The kind of change observed for a single path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Create,
    Write,
    Remove,
    Rename,
}

/// One observed filesystem change.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub kind: WatchKind,
}

impl WatchEvent {
    pub fn new(path: impl Into<PathBuf>, kind: WatchKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Shared pause/close control for a running [`DirWatcher`].
#[derive(Clone)]
pub struct WatchControl {
    paused: Arc<AtomicBool>,
    close_tx: mpsc::Sender<()>,
}

impl WatchControl {
    /// Pauses batch emission. Returns false if already paused.
    pub fn pause(&self) -> bool {
        self.paused
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Resumes batch emission. Returns false if not paused.
    pub fn resume(&self) -> bool {
        self.paused
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Pauses and returns a guard that resumes on drop, so the resume
    /// cannot be skipped on early returns.
    pub fn pause_scoped(&self) -> PauseGuard {
        self.pause();
        PauseGuard(self.clone())
    }

    /// Requests a flush-then-stop shutdown of the watcher.
    pub fn close(&self) {
        let _ = self.close_tx.try_send(());
    }
}

/// Resumes the paused watcher when dropped.
pub struct PauseGuard(WatchControl);

impl Drop for PauseGuard {
    fn drop(&mut self) {
        self.0.resume();
    }
}

/// Watches a directory tree and emits batches of change events.
pub struct DirWatcher {
    control: WatchControl,
    batches: mpsc::Receiver<Vec<WatchEvent>>,
    /// Directories registered at start time.
    pub dirs: Vec<PathBuf>,
    // Dropping the OS watcher unregisters every watch.
    _watcher: RecommendedWatcher,
}

impl DirWatcher {
    /// Registers a non-recursive watch on every directory under `root`
    /// (inclusive) accepted by `filter`, evaluated per directory before
    /// registration. A rejected directory prunes its whole subtree.
    pub fn new<F>(root: &Path, filter: F) -> Result<Self>
    where
        F: Fn(&Path) -> bool,
    {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = raw_tx.send(res);
            },
            notify::Config::default(),
        )?;

        let mut dirs = Vec::new();
        collect_dirs(root, &filter, &mut dirs)?;
        for dir in &dirs {
            watcher.watch(dir, RecursiveMode::NonRecursive)?;
        }

        let paused = Arc::new(AtomicBool::new(false));
        let (close_tx, close_rx) = mpsc::channel(1);
        let (batch_tx, batch_rx) = mpsc::channel(1);
        tokio::spawn(batch_events(raw_rx, batch_tx, paused.clone(), close_rx));

        Ok(Self {
            control: WatchControl { paused, close_tx },
            batches: batch_rx,
            dirs,
            _watcher: watcher,
        })
    }

    /// Receives the next event batch. `None` is the terminal close signal.
    pub async fn next_batch(&mut self) -> Option<Vec<WatchEvent>> {
        self.batches.recv().await
    }

    /// Returns a cloneable pause/close handle.
    pub fn control(&self) -> WatchControl {
        self.control.clone()
    }
}

fn collect_dirs<F>(dir: &Path, filter: &F, out: &mut Vec<PathBuf>) -> std::io::Result<()>
where
    F: Fn(&Path) -> bool,
{
    if !dir.is_dir() || !filter(dir) {
        return Ok(());
    }
    out.push(dir.to_path_buf());
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_dirs(&path, filter, out)?;
        }
    }
    Ok(())
}

async fn batch_events(
    mut raw_rx: mpsc::UnboundedReceiver<notify::Result<NotifyEvent>>,
    batch_tx: mpsc::Sender<Vec<WatchEvent>>,
    paused: Arc<AtomicBool>,
    mut close_rx: mpsc::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(BATCH_INTERVAL);
    let mut pending: Vec<WatchEvent> = Vec::new();

    loop {
        tokio::select! {
            raw = raw_rx.recv() => match raw {
                Some(Ok(event)) => {
                    if let Some(kind) = map_kind(&event.kind) {
                        for path in event.paths {
                            pending.push(WatchEvent::new(path, kind));
                        }
                    }
                }
                Some(Err(err)) => warn!(err = %err, "watch error"),
                None => break,
            },
            _ = ticker.tick() => {
                if paused.load(Ordering::SeqCst) {
                    // Dropped, not queued: a paused watcher must not replay
                    // a rebuild's own writes after resume.
                    pending.clear();
                } else if !pending.is_empty()
                    && batch_tx.send(std::mem::take(&mut pending)).await.is_err()
                {
                    break;
                }
            }
            _ = close_rx.recv() => {
                if !pending.is_empty() {
                    let _ = batch_tx.send(std::mem::take(&mut pending)).await;
                }
                break;
            }
        }
    }
}

// Metadata-only changes (chmod and friends) are noise and discarded.
fn map_kind(kind: &EventKind) -> Option<WatchKind> {
    use notify::event::ModifyKind;
    match kind {
        EventKind::Create(_) => Some(WatchKind::Create),
        EventKind::Remove(_) => Some(WatchKind::Remove),
        EventKind::Modify(ModifyKind::Metadata(_)) => None,
        EventKind::Modify(ModifyKind::Name(_)) => Some(WatchKind::Rename),
        EventKind::Modify(_) => Some(WatchKind::Write),
        EventKind::Access(_) => None,
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_dirs_applies_filter_per_directory() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("src/deep")).unwrap();
        std::fs::create_dir_all(root.path().join("node_modules/pkg")).unwrap();

        let mut dirs = Vec::new();
        collect_dirs(
            root.path(),
            &|dir: &Path| {
                dir.file_name()
                    .map(|n| n != "node_modules")
                    .unwrap_or(true)
            },
            &mut dirs,
        )
        .unwrap();

        assert!(dirs.contains(&root.path().to_path_buf()));
        assert!(dirs.contains(&root.path().join("src/deep")));
        // Rejected directory prunes its subtree.
        assert!(!dirs.iter().any(|d| d.starts_with(root.path().join("node_modules"))));
    }

    #[test]
    fn pause_and_resume_are_compare_and_swap() {
        let (close_tx, _close_rx) = mpsc::channel(1);
        let control = WatchControl {
            paused: Arc::new(AtomicBool::new(false)),
            close_tx,
        };
        assert!(control.pause());
        assert!(!control.pause());
        assert!(control.resume());
        assert!(!control.resume());
    }

    #[test]
    fn metadata_changes_are_discarded() {
        use notify::event::{MetadataKind, ModifyKind};
        assert_eq!(
            map_kind(&EventKind::Modify(ModifyKind::Metadata(MetadataKind::Any))),
            None
        );
        assert_eq!(
            map_kind(&EventKind::Create(notify::event::CreateKind::File)),
            Some(WatchKind::Create)
        );
    }

    #[tokio::test]
    async fn close_flushes_buffered_events_then_terminates() {
        let root = tempfile::tempdir().unwrap();
        let mut watcher = DirWatcher::new(root.path(), |_| true).unwrap();
        let control = watcher.control();

        std::fs::write(root.path().join("main.go"), "package main\n").unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        control.close();

        let batch = watcher.next_batch().await.expect("flushed batch");
        assert!(batch
            .iter()
            .any(|evt| evt.path.file_name().map(|n| n == "main.go").unwrap_or(false)));
        assert!(watcher.next_batch().await.is_none());
    }
}
