//! Filesystem watcher for generated data artifacts.
//!
//! Watches the reports directory recursively and publishes `data_update`
//! events when recognized files appear, change or disappear. Rapid repeats
//! on the same path are coalesced; hidden and temp files are ignored.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::{DataAction, DataKind, Event, OutputLevel};
use crate::hub::EventHub;

/// Map a filename to its artifact category. Unknown files are not watched.
pub fn classify(filename: &str) -> Option<DataKind> {
    match filename {
        "ticker_summary.json" => Some(DataKind::TickerSummary),
        "isx_combined_data.csv" => Some(DataKind::CombinedData),
        "indexes.csv" => Some(DataKind::Indexes),
        name if name.starts_with("isx_daily_") => Some(DataKind::DailyReport),
        name if name.ends_with("_trading_history.csv") => Some(DataKind::TickerHistory),
        _ => None,
    }
}

/// Hidden and editor-temp files never produce events.
pub fn is_ignored(filename: &str) -> bool {
    filename.starts_with('.') || filename.starts_with('~')
}

/// Per-path suppression window for bursts of filesystem events.
struct Debouncer {
    window: Duration,
    last: HashMap<PathBuf, Instant>,
}

impl Debouncer {
    fn new(window: Duration) -> Self {
        Self {
            window,
            last: HashMap::new(),
        }
    }

    fn should_emit(&mut self, path: &Path, now: Instant) -> bool {
        if let Some(prev) = self.last.get(path) {
            if now.duration_since(*prev) < self.window {
                return false;
            }
        }
        self.last.insert(path.to_path_buf(), now);
        true
    }
}

/// Watches a directory tree and feeds artifact changes into the hub.
pub struct FileWatcher {
    root: PathBuf,
    debounce: Duration,
    hub: std::sync::Arc<EventHub>,
}

impl FileWatcher {
    pub fn new(
        root: impl Into<PathBuf>,
        debounce: Duration,
        hub: std::sync::Arc<EventHub>,
    ) -> Self {
        Self {
            root: root.into(),
            debounce,
            hub,
        }
    }

    /// Start watching in a background task until the token is cancelled.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    async fn run(self, cancel: CancellationToken) {
        if let Err(e) = std::fs::create_dir_all(&self.root) {
            warn!("cannot create watch root {}: {}", self.root.display(), e);
            return;
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher: RecommendedWatcher =
            match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
                let _ = tx.send(res);
            }) {
                Ok(watcher) => watcher,
                Err(e) => {
                    warn!("failed to create file watcher: {}", e);
                    return;
                }
            };

        if let Err(e) = watcher.watch(&self.root, RecursiveMode::Recursive) {
            warn!("failed to watch {}: {}", self.root.display(), e);
            return;
        }
        debug!("watching {} for data updates", self.root.display());

        let mut debouncer = Debouncer::new(self.debounce);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(Ok(event)) => self.handle(event, &mut debouncer).await,
                    Some(Err(e)) => debug!("watch error: {}", e),
                    None => break,
                },
            }
        }
        debug!("file watcher stopped");
    }

    async fn handle(&self, event: notify::Event, debouncer: &mut Debouncer) {
        let action = match event.kind {
            EventKind::Create(_) => DataAction::Created,
            EventKind::Modify(_) => DataAction::Updated,
            EventKind::Remove(_) => DataAction::Deleted,
            _ => return,
        };

        for path in event.paths {
            let filename = match path.file_name() {
                Some(name) => name.to_string_lossy().to_string(),
                None => continue,
            };
            if is_ignored(&filename) {
                continue;
            }
            let Some(subtype) = classify(&filename) else {
                continue;
            };
            if !debouncer.should_emit(&path, Instant::now()) {
                continue;
            }

            let relative = path
                .strip_prefix(&self.root)
                .unwrap_or(&path)
                .display()
                .to_string();
            self.hub
                .publish(&Event::data_update(
                    subtype,
                    action,
                    json!({
                        "filename": filename,
                        "relative_path": relative,
                    }),
                ))
                .await;

            let level = match action {
                DataAction::Deleted => OutputLevel::Warning,
                _ => OutputLevel::Info,
            };
            self.hub
                .publish(&Event::output(
                    level,
                    format!("{} {}", filename, action.as_str()),
                    None,
                ))
                .await;
        }
    }
}
