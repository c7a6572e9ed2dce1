use anyhow::{Result, bail};
use async_trait::async_trait;
use notify::{Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    sync::mpsc::UnboundedReceiver,
    task::JoinHandle,
    time::{Duration, sleep},
};
use tracing::{error, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Something that reacts to files changing on disk.
#[async_trait]
pub trait WatchedType: Send + Sync + 'static {
    fn is_relevant(&self, path: &Path) -> bool;
    async fn on_create_or_modify(&self, path: &Path) -> Result<()>;

    async fn on_remove(&self, path: &Path) -> Result<()>;

    async fn reload(&self, path: &Path) -> Result<()> {
        self.on_create_or_modify(path).await
    }
}

/// Polls one directory and dispatches relevant events, one at a time, to a
/// [`WatchedType`]. Dropping it does not stop the tasks; call `shutdown()`.
pub struct DirectoryWatcher {
    handles: Vec<JoinHandle<()>>,
}

impl DirectoryWatcher {
    /// Start watching `dir` for paths with one of `exts` or for which
    /// `is_relevant` holds. With `initial_scan` every existing match is
    /// reloaded first; with `enable_retry` failed reloads are retried.
    pub async fn new(
        dir: PathBuf,
        watcher_impl: Arc<dyn WatchedType>,
        exts: &[&str],
        initial_scan: bool,
        enable_retry: bool,
    ) -> Result<DirectoryWatcher> {
        if !dir.exists() {
            let msg = format!("Directory {} does not exist", dir.to_string_lossy());
            warn!(%msg);
            bail!(msg);
        }

        let exts: Vec<String> = exts.iter().map(|s| s.to_string()).collect();
        let matches = {
            let watcher_impl = watcher_impl.clone();
            move |path: &Path| watcher_impl.is_relevant(path) || is_valid_extension(path, &exts)
        };

        if initial_scan {
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if matches(path.as_path()) {
                    try_reload(&watcher_impl, &path, enable_retry).await;
                }
            }
        }

        let (tx, mut rx): (_, UnboundedReceiver<notify::Result<Event>>) =
            tokio::sync::mpsc::unbounded_channel();

        let mut watcher = PollWatcher::new(
            move |res| {
                // receiver gone means we are shutting down
                let _ = tx.send(res);
            },
            Config::default().with_poll_interval(POLL_INTERVAL),
        )?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        // owns the poll watcher; aborting this task stops polling
        let handle_watcher = tokio::spawn(async move {
            let _watcher = watcher;
            futures::future::pending::<()>().await;
        });

        let handle_dispatch = tokio::spawn(async move {
            while let Some(res) = rx.recv().await {
                match res {
                    Ok(Event {
                        kind: EventKind::Create(_) | EventKind::Modify(_),
                        paths,
                        ..
                    }) => {
                        for path in paths.iter().filter(|p| matches(p.as_path())) {
                            try_reload(&watcher_impl, path, enable_retry).await;
                        }
                    }
                    Ok(Event {
                        kind: EventKind::Remove(_),
                        paths,
                        ..
                    }) => {
                        for path in paths.iter().filter(|p| matches(p.as_path())) {
                            if let Err(e) = watcher_impl.on_remove(path).await {
                                warn!(?path, ?e, "Failed to handle removal");
                            }
                        }
                    }
                    Err(e) => {
                        warn!(?e, "Watcher error");
                    }
                    _ => {}
                }
            }
        });

        Ok(DirectoryWatcher {
            handles: vec![handle_dispatch, handle_watcher],
        })
    }

    /// Abort the watcher tasks. No events are dispatched afterwards.
    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

fn is_valid_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
}

async fn try_reload(watched: &Arc<dyn WatchedType>, path: &Path, retry: bool) {
    const MAX_RETRIES: usize = 10;

    for attempt in 0..MAX_RETRIES {
        match watched.reload(path).await {
            Ok(_) => return,
            Err(e) => {
                if !retry || attempt == MAX_RETRIES - 1 {
                    error!("Failed to reload {:?}: {e:?}", path);
                    return;
                }
                warn!(
                    "Retrying reload {:?} (attempt {}): {e:?}",
                    path,
                    attempt + 1
                );
                sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
