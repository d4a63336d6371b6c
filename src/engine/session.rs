//! Per-user execution state and the session table it lives in.
//!
//! Sessions are process-memory only and lost on restart; that is a deliberate
//! simplicity/durability trade-off. The fuzzy identity lookup is a secondary
//! strategy layered on top of the store, not baked into it, so the store can
//! later be swapped for an external key-value backend.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use crate::flow::FlowDefinition;

/// In-progress execution context for one user on one flow.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub flow_id: String,
    pub current_node_id: String,
    /// Collected values, last-write-wins. `lastResponse`,
    /// `lastButtonClicked` and `lastListItemSelected` are maintained by the
    /// engine; flows may reference any of them in conditions and templates.
    pub variables: HashMap<String, String>,
    /// Visited node ids, append-only. Loop diagnostics only.
    pub node_history: Vec<String>,
}

impl Session {
    pub fn new(flow_id: impl Into<String>, start_node_id: impl Into<String>) -> Self {
        let start_node_id = start_node_id.into();
        Self {
            flow_id: flow_id.into(),
            current_node_id: start_node_id.clone(),
            variables: HashMap::new(),
            node_history: vec![start_node_id],
        }
    }
}

pub type SessionStore = Arc<dyn SessionStoreType>;

/// Keyed session state with whole-table scan support (required by the fuzzy
/// identity lookup).
#[async_trait]
pub trait SessionStoreType: Send + Sync + Debug {
    async fn get(&self, key: &str) -> Option<Session>;
    async fn set(&self, key: &str, session: Session);
    async fn remove(&self, key: &str);
    /// All live sessions. Implementations should return a stable order.
    async fn scan(&self) -> Vec<(String, Session)>;
    async fn clear(&self);
    async fn count(&self) -> usize;
}

#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<String, Session>,
}

impl InMemorySessionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
        })
    }
}

#[async_trait]
impl SessionStoreType for InMemorySessionStore {
    async fn get(&self, key: &str) -> Option<Session> {
        self.sessions.get(key).map(|entry| entry.value().clone())
    }

    async fn set(&self, key: &str, session: Session) {
        self.sessions.insert(key.to_string(), session);
    }

    async fn remove(&self, key: &str) {
        self.sessions.remove(key);
    }

    async fn scan(&self) -> Vec<(String, Session)> {
        let mut all: Vec<(String, Session)> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    async fn clear(&self) {
        self.sessions.clear();
    }

    async fn count(&self) -> usize {
        self.sessions.len()
    }
}

/// Resolve an inbound identity to a live session, tolerating representation
/// differences between locally-formatted and internationally-prefixed
/// numbers: exact lookup first, then a suffix-or-prefix scan over all keys.
///
/// The scan is O(sessions) per miss and has no minimum shared-length guard,
/// so short numeric identities can match the wrong user. Both properties are
/// part of the observable contract and must not be "fixed" here.
pub async fn find_session(store: &SessionStore, identity: &str) -> Option<(String, Session)> {
    if let Some(session) = store.get(identity).await {
        return Some((identity.to_string(), session));
    }
    for (key, session) in store.scan().await {
        if key.ends_with(identity) || identity.ends_with(&key) {
            debug!(input = %identity, matched = %key, "fuzzy session match");
            return Some((key, session));
        }
    }
    None
}

/// TTL-bounded registry for unsaved flow definitions registered by "test this
/// flow" tooling. Entries expire on their own so trial runs cannot grow
/// process memory without bound.
pub struct TempFlowRegistry {
    cache: moka::future::Cache<String, FlowDefinition>,
}

impl std::fmt::Debug for TempFlowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TempFlowRegistry({} entries)", self.cache.entry_count())
    }
}

impl TempFlowRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: moka::future::Cache::builder()
                .time_to_live(ttl)
                .max_capacity(1024)
                .build(),
        }
    }

    pub async fn register(&self, flow: FlowDefinition) {
        debug!(flow = %flow.id, "registered temporary flow");
        self.cache.insert(flow.id.clone(), flow).await;
    }

    pub async fn get(&self, id: &str) -> Option<FlowDefinition> {
        self.cache.get(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(keys: &[&str]) -> SessionStore {
        let store = InMemorySessionStore::new();
        for key in keys {
            store
                .sessions
                .insert(key.to_string(), Session::new("flow", "start"));
        }
        store
    }

    #[tokio::test]
    async fn test_exact_match_wins() {
        let store = store_with(&["890000000", "91890000000"]);
        let (key, _) = find_session(&store, "890000000").await.unwrap();
        assert_eq!(key, "890000000");
    }

    #[tokio::test]
    async fn test_fuzzy_suffix_match_both_directions() {
        // Session keyed internationally, inbound arrives local.
        let store = store_with(&["91890000000"]);
        let (key, _) = find_session(&store, "890000000").await.unwrap();
        assert_eq!(key, "91890000000");

        // Session keyed locally, inbound arrives international.
        let store = store_with(&["890000000"]);
        let (key, _) = find_session(&store, "91890000000").await.unwrap();
        assert_eq!(key, "890000000");
    }

    #[tokio::test]
    async fn test_no_match_returns_none() {
        let store = store_with(&["15550001111"]);
        assert!(find_session(&store, "4470002222").await.is_none());
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let store: SessionStore = InMemorySessionStore::new();
        let mut session = Session::new("flow-1", "start-1");
        session.variables.insert("lastResponse".into(), "yes".into());
        store.set("311", session).await;

        assert_eq!(store.count().await, 1);
        let loaded = store.get("311").await.unwrap();
        assert_eq!(loaded.flow_id, "flow-1");
        assert_eq!(loaded.node_history, vec!["start-1"]);

        store.remove("311").await;
        assert!(store.get("311").await.is_none());
    }
}
