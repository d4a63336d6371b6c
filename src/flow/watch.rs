//! Hot reload of the flow definition directory: created or edited files are
//! (re)registered on the next poll, deleted files unregister their flow.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Result, bail};
use dashmap::DashMap;
use notify::{Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::store::InMemoryFlowStore;

const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(2);

fn is_flow_file(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .as_deref(),
        Some("json") | Some("yaml") | Some("yml")
    )
}

pub struct FlowDirWatcher {
    handles: Vec<JoinHandle<()>>,
}

impl FlowDirWatcher {
    /// Watch `dir` until the token is cancelled. The store must already hold
    /// the initial directory scan; this only tracks changes from here on.
    pub fn start(
        store: Arc<InMemoryFlowStore>,
        dir: PathBuf,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        if !dir.exists() {
            bail!("flow directory {} does not exist", dir.display());
        }

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<notify::Result<Event>>();

        let watch_dir = dir.clone();
        let watch_shutdown = shutdown.clone();
        let watch_handle = tokio::spawn(async move {
            let mut watcher = match PollWatcher::new(
                move |res| {
                    let _ = tx.send(res);
                },
                Config::default().with_poll_interval(POLL_INTERVAL),
            ) {
                Ok(w) => w,
                Err(e) => {
                    error!(error = %e, "failed to create flow watcher");
                    return;
                }
            };
            if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
                error!(dir = %watch_dir.display(), error = %e, "failed to watch flow directory");
                return;
            }
            info!(dir = %watch_dir.display(), "watching flow directory");
            // Keeps `watcher` alive until shutdown.
            watch_shutdown.cancelled().await;
        });

        let dispatch_handle = tokio::spawn(dispatch_events(store, rx, shutdown));

        Ok(Self {
            handles: vec![watch_handle, dispatch_handle],
        })
    }

    pub async fn stop(self) {
        for handle in self.handles {
            handle.abort();
            let _ = handle.await;
        }
    }
}

async fn dispatch_events(
    store: Arc<InMemoryFlowStore>,
    mut rx: UnboundedReceiver<notify::Result<Event>>,
    shutdown: CancellationToken,
) {
    // Which flow id each file last registered, so deletions can unregister.
    let flow_of_path: DashMap<PathBuf, String> = DashMap::new();

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            Ok(Event {
                kind: EventKind::Create(_) | EventKind::Modify(_),
                paths,
                ..
            }) => {
                for path in paths.into_iter().filter(|p| is_flow_file(p)) {
                    match store.load_file(&path) {
                        Ok(id) => {
                            info!(path = %path.display(), flow = %id, "flow file reloaded");
                            flow_of_path.insert(path, id);
                        }
                        Err(e) => {
                            error!(path = %path.display(), error = %e, "failed to reload flow file");
                        }
                    }
                }
            }
            Ok(Event {
                kind: EventKind::Remove(_),
                paths,
                ..
            }) => {
                for path in paths.into_iter().filter(|p| is_flow_file(p)) {
                    if let Some((_, id)) = flow_of_path.remove(&path) {
                        info!(path = %path.display(), flow = %id, "flow file removed, unregistering");
                        store.remove(&id);
                    }
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "flow watcher error"),
        }
    }
}
