//! Wiring: build the stores, engine, scheduler and flow watcher, and tear
//! them down on shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::channel::Channel;
use crate::engine::scheduler::Scheduler;
use crate::engine::{EngineConfig, FlowEngine};
use crate::flow::store::{BulkStore, FlowStore, InMemoryBulkStore, InMemoryFlowStore};
use crate::flow::watch::FlowDirWatcher;
use crate::leads::{InMemoryLeadStore, LeadStore};

pub struct App {
    engine: Arc<FlowEngine>,
    flow_store: Arc<InMemoryFlowStore>,
    bulk_store: Arc<InMemoryBulkStore>,
    scheduler_task: Option<JoinHandle<()>>,
    watcher: Option<FlowDirWatcher>,
    shutdown: CancellationToken,
}

impl App {
    /// Bootstrap the runtime: load flow files from `flows_dir` (and keep
    /// watching it), optionally seed leads from a JSON file, then start the
    /// scheduler loop.
    pub async fn bootstrap(
        flows_dir: PathBuf,
        leads_file: Option<PathBuf>,
        channel: Channel,
        engine_config: EngineConfig,
    ) -> Result<App> {
        let flow_store = InMemoryFlowStore::new();
        flow_store.load_dir(&flows_dir)?;
        info!(count = flow_store.len(), dir = %flows_dir.display(), "flows loaded");

        let lead_store = InMemoryLeadStore::new();
        if let Some(path) = leads_file {
            match lead_store.load_file(&path) {
                Ok(count) => info!(count, path = %path.display(), "leads loaded"),
                Err(e) => warn!(path = %path.display(), error = %e, "failed to load leads file"),
            }
        }

        let bulk_store = InMemoryBulkStore::new();
        let engine = FlowEngine::with_config(
            flow_store.clone() as FlowStore,
            lead_store as LeadStore,
            channel,
            engine_config,
        );

        let shutdown = CancellationToken::new();
        let scheduler_task =
            Scheduler::new(engine.clone(), bulk_store.clone() as BulkStore).spawn(shutdown.clone());
        let watcher = FlowDirWatcher::start(flow_store.clone(), flows_dir, shutdown.clone())?;

        Ok(App {
            engine,
            flow_store,
            bulk_store,
            scheduler_task: Some(scheduler_task),
            watcher: Some(watcher),
            shutdown,
        })
    }

    pub fn engine(&self) -> Arc<FlowEngine> {
        self.engine.clone()
    }

    pub fn flow_store(&self) -> Arc<InMemoryFlowStore> {
        self.flow_store.clone()
    }

    pub fn bulk_store(&self) -> Arc<InMemoryBulkStore> {
        self.bulk_store.clone()
    }

    pub async fn shutdown(mut self) {
        info!("shutting down");
        self.shutdown.cancel();
        if let Some(task) = self.scheduler_task.take() {
            let _ = task.await;
        }
        if let Some(watcher) = self.watcher.take() {
            watcher.stop().await;
        }
    }
}
