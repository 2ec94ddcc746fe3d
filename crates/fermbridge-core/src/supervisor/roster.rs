//! Configuration directory watching

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::is_device_config_path;

/// Signals device config changes in the configuration directory
pub struct RosterWatcher {
    _watcher: RecommendedWatcher,
    rx: mpsc::Receiver<()>,
    closed: bool,
}

impl RosterWatcher {
    /// Start watching `dir` (non-recursive)
    pub fn new(dir: &Path) -> notify::Result<Self> {
        let (tx, rx) = mpsc::channel(16);

        // The callback runs on notify's own thread; a full channel already
        // carries a pending signal.
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) if is_roster_event(&event) => {
                let _ = tx.try_send(());
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("config directory watcher error: {}", e),
        })?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        tracing::info!("watching device configs in {}", dir.display());

        Ok(Self {
            _watcher: watcher,
            rx,
            closed: false,
        })
    }

    /// Wait for the next roster change
    ///
    /// A burst of events within `debounce` of each other yields one signal.
    /// Never completes once the underlying watcher has stopped.
    pub async fn changed(&mut self, debounce: Duration) {
        if self.closed || self.rx.recv().await.is_none() {
            if !self.closed {
                tracing::warn!("config directory watcher stopped; relying on periodic rescans");
                self.closed = true;
            }
            return std::future::pending().await;
        }
        while let Ok(Some(())) = tokio::time::timeout(debounce, self.rx.recv()).await {}
    }
}

/// Create, modify or remove of a device config file
pub fn is_roster_event(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) && event.paths.iter().any(|p| is_device_config_path(p))
}
