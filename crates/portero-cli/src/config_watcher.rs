//! Config hot-reload watcher.
//!
//! Watches the catalog and rules files for modifications and invokes a
//! callback after a debounce window, coalescing editor save bursts into
//! a single reload.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use portero_core::{PorteroError, PorteroResult};
use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;

/// Watches config files on disk and calls back on every (debounced)
/// change.
///
/// The watcher is kept alive as long as this struct is alive; dropping
/// it stops the background thread and releases the file-system watch.
pub struct ConfigWatcher {
    /// Stored to prevent the watcher from being dropped (which would
    /// stop watching the files).
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Start watching `paths` for modifications.
    ///
    /// * `debounce_ms` -- minimum milliseconds between two successive
    ///   callbacks. The gateway uses `1000`.
    /// * `on_change` -- called on a background thread each time a
    ///   watched file changes, after the debounce window.
    pub fn start<F>(paths: Vec<PathBuf>, debounce_ms: u64, on_change: F) -> PorteroResult<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let (tx, rx) = std_mpsc::channel();

        let mut watcher =
            notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                        let _ = tx.send(());
                    }
                }
            })
            .map_err(|e| {
                PorteroError::ConfigInvalid(format!("failed to create file watcher: {e}"))
            })?;

        for path in &paths {
            watcher
                .watch(path.as_ref(), RecursiveMode::NonRecursive)
                .map_err(|e| {
                    PorteroError::ConfigInvalid(format!(
                        "failed to watch '{}': {e}",
                        path.display()
                    ))
                })?;
        }

        std::thread::spawn(move || {
            let mut last_fire = std::time::Instant::now();
            let debounce = std::time::Duration::from_millis(debounce_ms);

            while rx.recv().is_ok() {
                // Drain any additional events that arrived during the
                // debounce window so one save burst fires one reload.
                while rx.try_recv().is_ok() {}

                let now = std::time::Instant::now();
                if now.duration_since(last_fire) < debounce {
                    std::thread::sleep(debounce - now.duration_since(last_fire));
                    while rx.try_recv().is_ok() {}
                }
                last_fire = std::time::Instant::now();

                on_change();
            }

            tracing::debug!("config watcher thread exiting");
        });

        tracing::info!(watched = paths.len(), "config hot-reload watcher started");
        Ok(Self { _watcher: watcher })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_watch_nonexistent_path_errors() {
        let result = ConfigWatcher::start(
            vec![PathBuf::from("/nonexistent/portero/config.json")],
            100,
            || {},
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_modification_fires_callback() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("mcp.json");
        std::fs::write(&path, "{}").unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let _watcher = ConfigWatcher::start(vec![path.clone()], 50, move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        // Give the watcher a moment to register, then touch the file.
        std::thread::sleep(Duration::from_millis(200));
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f).unwrap();
        f.sync_all().unwrap();

        for _ in 0..50 {
            if fired.load(Ordering::SeqCst) > 0 {
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        panic!("watcher never fired");
    }

    #[test]
    fn test_save_burst_coalesces() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(&path, "{}").unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let _watcher = ConfigWatcher::start(vec![path.clone()], 500, move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        std::thread::sleep(Duration::from_millis(200));
        for _ in 0..5 {
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(f).unwrap();
            f.sync_all().unwrap();
            std::thread::sleep(Duration::from_millis(20));
        }

        std::thread::sleep(Duration::from_millis(1500));
        let count = fired.load(Ordering::SeqCst);
        assert!(count >= 1, "watcher never fired");
        assert!(count <= 2, "burst was not coalesced: {count} callbacks");
    }
}
