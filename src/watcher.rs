//! Debounced filesystem observer for the sync directory.
//!
//! Raw notify events are collapsed by `notify-debouncer-full` and converted
//! into the three shapes the session cares about. Writes performed by the
//! daemon itself are filtered out through [`PathSuppressor`], a count-based
//! map shared with the file writer: the writer registers every path it is
//! about to touch, and the session consumes one count per matching event.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use notify::RecursiveMode;
use notify_debouncer_full::{
    new_debouncer,
    notify::event::{CreateKind, EventKind, ModifyKind, RemoveKind, RenameMode},
    DebounceEventResult, Debouncer, RecommendedCache,
};

/// A filesystem event that survived debouncing.
#[derive(Debug, Clone, PartialEq)]
pub enum WatcherEvent {
    Added(PathBuf),
    Changed(PathBuf),
    Removed(PathBuf),
}

impl WatcherEvent {
    pub fn path(&self) -> &Path {
        match self {
            WatcherEvent::Added(path)
            | WatcherEvent::Changed(path)
            | WatcherEvent::Removed(path) => path,
        }
    }
}

/// Tracks paths the daemon is about to write or remove so their echo events
/// can be discarded. Counters are per event class: a pending remove never
/// swallows a create, which matters on platforms that coalesce a rapid
/// delete+recreate into odd event orders.
#[derive(Debug, Default)]
pub struct PathSuppressor {
    // (remove_count, write_count) per normalized path
    inner: Mutex<HashMap<PathBuf, (usize, usize)>>,
}

impl PathSuppressor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalizes a path for use as a suppression key. The file itself may
    /// not exist yet (or already be gone), so fall back to canonicalizing
    /// the parent and re-appending the file name.
    fn key(path: &Path) -> PathBuf {
        if let Ok(canonical) = fs_err::canonicalize(path) {
            return canonical;
        }
        if let (Some(parent), Some(file_name)) = (path.parent(), path.file_name()) {
            if let Ok(canonical_parent) = fs_err::canonicalize(parent) {
                return canonical_parent.join(file_name);
            }
        }
        path.to_path_buf()
    }

    pub fn expect_write(&self, path: &Path) {
        let mut inner = self.inner.lock().unwrap();
        inner.entry(Self::key(path)).or_insert((0, 0)).1 += 1;
    }

    pub fn expect_remove(&self, path: &Path) {
        let mut inner = self.inner.lock().unwrap();
        inner.entry(Self::key(path)).or_insert((0, 0)).0 += 1;
    }

    /// Withdraws an expectation after the corresponding filesystem call
    /// failed, so a future genuine event is not swallowed.
    pub fn forget_write(&self, path: &Path) {
        self.forget(path, false);
    }

    pub fn forget_remove(&self, path: &Path) {
        self.forget(path, true);
    }

    fn forget(&self, path: &Path, remove: bool) {
        let mut inner = self.inner.lock().unwrap();
        let key = Self::key(path);
        if let Some(counts) = inner.get_mut(&key) {
            if remove {
                counts.0 = counts.0.saturating_sub(1);
            } else {
                counts.1 = counts.1.saturating_sub(1);
            }
            if *counts == (0, 0) {
                inner.remove(&key);
            }
        }
    }

    /// Returns `true` when `event` is an echo of the daemon's own write and
    /// should be dropped, consuming one pending count.
    pub fn consume(&self, event: &WatcherEvent) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let key = Self::key(event.path());
        let Some(counts) = inner.get_mut(&key) else {
            return false;
        };

        let consumed = match event {
            WatcherEvent::Removed(_) if counts.0 > 0 => {
                counts.0 -= 1;
                true
            }
            WatcherEvent::Added(_) | WatcherEvent::Changed(_) if counts.1 > 0 => {
                counts.1 -= 1;
                true
            }
            _ => false,
        };

        if *counts == (0, 0) {
            inner.remove(&key);
        }
        consumed
    }
}

/// Recursive watcher over the sync directory. Events arrive on a crossbeam
/// channel so the session can `select!` over them next to plugin messages.
pub struct SyncWatcher {
    // Held for its Drop side effect: dropping stops the watch threads.
    #[allow(unused)]
    debouncer: Debouncer<notify::RecommendedWatcher, RecommendedCache>,
    receiver: Receiver<WatcherEvent>,
}

impl SyncWatcher {
    pub fn new(base_dir: &Path, debounce: Duration) -> io::Result<Self> {
        let (event_tx, event_rx) = crossbeam_channel::unbounded();

        let mut debouncer = Self::create_debouncer(debounce, event_tx)?;

        debouncer
            .watch(base_dir, RecursiveMode::Recursive)
            .map_err(|err| io::Error::other(format!("{err:?}")))?;

        log::debug!(
            "Watching {} with {}ms debounce",
            base_dir.display(),
            debounce.as_millis()
        );

        Ok(SyncWatcher {
            debouncer,
            receiver: event_rx,
        })
    }

    fn create_debouncer(
        debounce: Duration,
        event_tx: Sender<WatcherEvent>,
    ) -> io::Result<Debouncer<notify::RecommendedWatcher, RecommendedCache>> {
        new_debouncer(debounce, None, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    for event in events {
                        for converted in convert_event(&event.event) {
                            if event_tx.send(converted).is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(errors) => {
                    for error in errors {
                        log::warn!("File watcher error: {error:?}");
                    }
                }
            }
        })
        .map_err(|err| io::Error::other(format!("{err:?}")))
    }

    pub fn event_receiver(&self) -> Receiver<WatcherEvent> {
        self.receiver.clone()
    }
}

fn convert_event(event: &notify::Event) -> Vec<WatcherEvent> {
    let mut out = Vec::new();

    match &event.kind {
        EventKind::Create(CreateKind::File)
        | EventKind::Create(CreateKind::Any)
        | EventKind::Create(CreateKind::Other) => {
            for path in &event.paths {
                out.push(WatcherEvent::Added(path.clone()));
            }
        }

        // Folder creation is uninteresting: directories only matter once a
        // script file lands inside them.
        EventKind::Create(CreateKind::Folder) => {}

        EventKind::Modify(ModifyKind::Data(_))
        | EventKind::Modify(ModifyKind::Any)
        | EventKind::Modify(ModifyKind::Other) => {
            for path in &event.paths {
                out.push(WatcherEvent::Changed(path.clone()));
            }
        }

        EventKind::Modify(ModifyKind::Metadata(_)) => {}

        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            if event.paths.len() >= 2 {
                out.push(WatcherEvent::Removed(event.paths[0].clone()));
                out.push(WatcherEvent::Added(event.paths[1].clone()));
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            for path in &event.paths {
                out.push(WatcherEvent::Removed(path.clone()));
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            for path in &event.paths {
                out.push(WatcherEvent::Added(path.clone()));
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Any))
        | EventKind::Modify(ModifyKind::Name(RenameMode::Other)) => {
            for path in &event.paths {
                out.push(WatcherEvent::Changed(path.clone()));
            }
        }

        EventKind::Remove(RemoveKind::File)
        | EventKind::Remove(RemoveKind::Folder)
        | EventKind::Remove(RemoveKind::Any)
        | EventKind::Remove(RemoveKind::Other) => {
            for path in &event.paths {
                out.push(WatcherEvent::Removed(path.clone()));
            }
        }

        EventKind::Access(_) => {}

        EventKind::Other | EventKind::Any => {
            for path in &event.paths {
                out.push(WatcherEvent::Changed(path.clone()));
            }
        }
    }

    out
}
