//! Storage contracts for flow definitions and scheduled bulk messages.
//!
//! The engine only ever issues simple find/update calls; anything resembling
//! a real document store lives behind these traits. The in-memory
//! implementations back the runtime (definitions come from files on disk) and
//! the test suite.

use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::{FlowDefinition, FlowError, StatKind};

pub type FlowStore = Arc<dyn FlowStoreType>;

/// Find/update access to flow definitions.
#[async_trait]
pub trait FlowStoreType: Send + Sync + Debug {
    /// All active definitions. The returned order is the trigger-matching
    /// order, which is observable but arbitrary; implementations should at
    /// least keep it stable.
    async fn list_active(&self) -> Vec<FlowDefinition>;
    async fn get_by_id(&self, id: &str) -> Option<FlowDefinition>;
    async fn save(&self, def: FlowDefinition);
    /// Best-effort counter bump; failures are logged, never surfaced.
    async fn increment_stat(&self, id: &str, stat: StatKind);
}

/// DashMap-backed store fed from a directory of flow files.
#[derive(Debug, Default)]
pub struct InMemoryFlowStore {
    flows: DashMap<String, FlowDefinition>,
}

impl InMemoryFlowStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            flows: DashMap::new(),
        })
    }

    pub fn register(&self, flow: FlowDefinition) {
        info!(flow = %flow.id, name = %flow.name, "registered flow");
        self.flows.insert(flow.id.clone(), flow);
    }

    pub fn remove(&self, id: &str) {
        if self.flows.remove(id).is_some() {
            info!(flow = %id, "removed flow");
        }
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    /// Synchronous lookup, handy outside async contexts.
    pub fn get(&self, id: &str) -> Option<FlowDefinition> {
        self.flows.get(id).map(|entry| entry.value().clone())
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Load and register a single flow file, returning its id.
    pub fn load_file(&self, path: &Path) -> Result<String, FlowError> {
        let flow = FlowDefinition::load_from_file(path)?;
        let id = flow.id.clone();
        self.register(flow);
        Ok(id)
    }

    /// Scan a directory for `.json`/`.yaml`/`.yml` flow files. Files that
    /// fail to parse or validate are skipped with an error log so one broken
    /// definition cannot take the rest down.
    pub fn load_dir(&self, dir: &Path) -> Result<(), FlowError> {
        if !dir.exists() {
            std::fs::create_dir_all(dir).map_err(|e| FlowError::Io(e.to_string()))?;
        }
        let entries = std::fs::read_dir(dir).map_err(|e| FlowError::Io(e.to_string()))?;
        for entry in entries {
            let path = entry.map_err(|e| FlowError::Io(e.to_string()))?.path();
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or_default()
                .to_lowercase();
            if !matches!(ext.as_str(), "json" | "yaml" | "yml") {
                continue;
            }
            if let Err(e) = self.load_file(&path) {
                error!(path = %path.display(), error = %e, "failed to load flow file");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl FlowStoreType for InMemoryFlowStore {
    async fn list_active(&self) -> Vec<FlowDefinition> {
        let mut active: Vec<FlowDefinition> = self
            .flows
            .iter()
            .filter(|entry| entry.value().active)
            .map(|entry| entry.value().clone())
            .collect();
        // DashMap iteration order is nondeterministic; sort by id so trigger
        // tie-breaking stays stable between calls.
        active.sort_by(|a, b| a.id.cmp(&b.id));
        active
    }

    async fn get_by_id(&self, id: &str) -> Option<FlowDefinition> {
        self.flows.get(id).map(|entry| entry.value().clone())
    }

    async fn save(&self, def: FlowDefinition) {
        self.flows.insert(def.id.clone(), def);
    }

    async fn increment_stat(&self, id: &str, stat: StatKind) {
        match self.flows.get_mut(id) {
            Some(mut entry) => {
                stat.apply(&mut entry.value_mut().stats);
                debug!(flow = %id, stat = ?stat, "stat incremented");
            }
            None => debug!(flow = %id, stat = ?stat, "stat skipped, flow not found"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum BulkStatus {
    #[default]
    Pending,
    Sent,
    Failed,
}

/// A one-shot bulk text send, consumed by the scheduler exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledBulkMessage {
    pub id: String,
    pub message: String,
    #[serde(default)]
    pub recipients: Vec<String>,
    pub scheduled_time: DateTime<Utc>,
    #[serde(default)]
    pub personalize: bool,
    #[serde(default)]
    pub add_delay: bool,
    #[serde(default)]
    pub status: BulkStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
}

impl ScheduledBulkMessage {
    pub fn new(
        message: impl Into<String>,
        recipients: Vec<String>,
        scheduled_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            message: message.into(),
            recipients,
            scheduled_time,
            personalize: false,
            add_delay: false,
            status: BulkStatus::Pending,
            executed_at: None,
        }
    }
}

pub type BulkStore = Arc<dyn BulkStoreType>;

#[async_trait]
pub trait BulkStoreType: Send + Sync + Debug {
    async fn enqueue(&self, msg: ScheduledBulkMessage);
    /// Pending messages whose scheduled time has passed, oldest first.
    async fn list_due(&self, now: DateTime<Utc>) -> Vec<ScheduledBulkMessage>;
    async fn update(&self, msg: ScheduledBulkMessage);
}

#[derive(Debug, Default)]
pub struct InMemoryBulkStore {
    messages: DashMap<String, ScheduledBulkMessage>,
}

impl InMemoryBulkStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            messages: DashMap::new(),
        })
    }

    pub fn get(&self, id: &str) -> Option<ScheduledBulkMessage> {
        self.messages.get(id).map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl BulkStoreType for InMemoryBulkStore {
    async fn enqueue(&self, msg: ScheduledBulkMessage) {
        self.messages.insert(msg.id.clone(), msg);
    }

    async fn list_due(&self, now: DateTime<Utc>) -> Vec<ScheduledBulkMessage> {
        let mut due: Vec<ScheduledBulkMessage> = self
            .messages
            .iter()
            .filter(|entry| {
                entry.value().status == BulkStatus::Pending && entry.value().scheduled_time <= now
            })
            .map(|entry| entry.value().clone())
            .collect();
        due.sort_by_key(|m| m.scheduled_time);
        due
    }

    async fn update(&self, msg: ScheduledBulkMessage) {
        self.messages.insert(msg.id.clone(), msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn minimal_flow(id: &str, active: bool) -> FlowDefinition {
        serde_json::from_value(json!({
            "id": id,
            "name": id,
            "trigger": "hi",
            "active": active,
            "nodes": [{"id": "s", "type": "start"}],
            "connections": []
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_list_active_filters_and_sorts() {
        let store = InMemoryFlowStore::new();
        store.register(minimal_flow("b-flow", true));
        store.register(minimal_flow("a-flow", true));
        store.register(minimal_flow("c-flow", false));

        let active = store.list_active().await;
        let ids: Vec<&str> = active.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["a-flow", "b-flow"]);
    }

    #[tokio::test]
    async fn test_increment_stat() {
        let store = InMemoryFlowStore::new();
        store.register(minimal_flow("f", true));
        store.increment_stat("f", StatKind::Delivered).await;
        store.increment_stat("f", StatKind::Delivered).await;
        store.increment_stat("f", StatKind::Clicked).await;
        // Unknown flows are a no-op, not an error.
        store.increment_stat("ghost", StatKind::Sent).await;

        let flow = store.get_by_id("f").await.unwrap();
        assert_eq!(flow.stats.delivered, 2);
        assert_eq!(flow.stats.clicked, 1);
    }

    #[tokio::test]
    async fn test_bulk_list_due_orders_oldest_first() {
        let store = InMemoryBulkStore::new();
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();
        let later = ScheduledBulkMessage::new("later", vec!["1".into()], t0 + chrono::Duration::minutes(5));
        let earlier = ScheduledBulkMessage::new("earlier", vec!["1".into()], t0);
        let mut done = ScheduledBulkMessage::new("done", vec!["1".into()], t0);
        done.status = BulkStatus::Sent;
        store.enqueue(later).await;
        store.enqueue(earlier).await;
        store.enqueue(done).await;

        let due = store.list_due(t0 + chrono::Duration::hours(1)).await;
        let texts: Vec<&str> = due.iter().map(|m| m.message.as_str()).collect();
        assert_eq!(texts, vec!["earlier", "later"]);

        let due = store.list_due(t0 + chrono::Duration::minutes(1)).await;
        assert_eq!(due.len(), 1);
    }
}
