//! The flow session engine: trigger matching, session lifecycle, node
//! execution dispatch, interactive-response resolution, and the burst
//! advancer that chains non-interactive nodes inside a single turn.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

pub mod executor;
pub mod personalize;
pub mod scheduler;
pub mod session;
pub mod trigger;

use executor::{MatchedOption, find_next_node, match_interactive_option};
use personalize::personalize_message;
use session::{
    InMemorySessionStore, Session, SessionStore, TempFlowRegistry, find_session,
};
use trigger::find_matching_flow;

use crate::channel::{Channel, ChannelError};
use crate::flow::store::FlowStore;
use crate::flow::{FlowDefinition, Node, StatKind};
use crate::leads::LeadStore;
use crate::message::OutboundPayload;

/// Fixed text returned when a condition chain crosses the depth bound.
pub const LOOP_GUARD_MESSAGE: &str =
    "This conversation hit a loop in its flow configuration and was stopped. Please try again later.";

/// Fixed text returned when a triggered flow has no start node.
pub const CONFIG_ERROR_MESSAGE: &str = "Flow configuration error.";

/// Tunables with production defaults. Tests shrink the pacing values; the
/// depth bound stays at 20 unless an operator really knows better.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum condition-to-condition traversals inside one turn.
    pub max_condition_depth: u32,
    /// Settling pause between messages dispatched by the burst advancer.
    pub burst_settle: Duration,
    /// Pause between recipients of a bulk send when `addDelay` is set.
    pub bulk_send_delay: Duration,
    /// Scheduler scan cadence.
    pub scheduler_tick: Duration,
    /// Lifetime of temporary "test this flow" definitions.
    pub temp_flow_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_condition_depth: 20,
            burst_settle: Duration::from_millis(400),
            bulk_send_delay: Duration::from_secs(2),
            scheduler_tick: Duration::from_secs(5),
            temp_flow_ttl: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// A mid-burst dispatch failed. This is the one failure that propagates
    /// to the caller, so it can decide whether to retry or surface the
    /// delivery problem upstream.
    #[error("burst dispatch failed: {0}")]
    Dispatch(#[from] ChannelError),
}

/// The core runtime. One instance serves every user; per-identity turn locks
/// keep each session's steps sequential even on a multi-threaded executor.
#[derive(Debug)]
pub struct FlowEngine {
    pub(crate) flows: FlowStore,
    pub(crate) leads: LeadStore,
    pub(crate) channel: Channel,
    sessions: SessionStore,
    temp_flows: TempFlowRegistry,
    turn_locks: DashMap<String, Arc<Mutex<()>>>,
    pub(crate) config: EngineConfig,
}

impl FlowEngine {
    pub fn new(flows: FlowStore, leads: LeadStore, channel: Channel) -> Arc<Self> {
        Self::with_config(flows, leads, channel, EngineConfig::default())
    }

    pub fn with_config(
        flows: FlowStore,
        leads: LeadStore,
        channel: Channel,
        config: EngineConfig,
    ) -> Arc<Self> {
        Self::with_stores(flows, leads, channel, InMemorySessionStore::new(), config)
    }

    /// Full-injection constructor for callers that back sessions with their
    /// own store.
    pub fn with_stores(
        flows: FlowStore,
        leads: LeadStore,
        channel: Channel,
        sessions: SessionStore,
        config: EngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            flows,
            leads,
            channel,
            sessions,
            temp_flows: TempFlowRegistry::new(config.temp_flow_ttl),
            turn_locks: DashMap::new(),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn flows(&self) -> FlowStore {
        self.flows.clone()
    }

    pub fn leads(&self) -> LeadStore {
        self.leads.clone()
    }

    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    /// Top-level entry point for one inbound event.
    ///
    /// Resolves the identity to a live session (resume) or matches a trigger
    /// (start); returns `Ok(None)` when no flow produced output, signaling
    /// the caller to fall back to its next responder. A user with an active
    /// session never starts a second flow: the session check runs first.
    pub async fn on_inbound_message(
        &self,
        identity: &str,
        text: &str,
    ) -> Result<Option<OutboundPayload>, EngineError> {
        debug!(
            identity,
            text,
            sessions = self.sessions.count().await,
            "inbound message"
        );

        let resolved = find_session(&self.sessions, identity).await;
        let key = resolved
            .as_ref()
            .map(|(k, _)| k.clone())
            .unwrap_or_else(|| identity.to_string());

        // Per-identity mutual exclusion: storage and send calls suspend, and
        // the runtime is multi-threaded, so two in-flight events for the same
        // user must not interleave their session steps.
        let lock = self.turn_lock(&key);
        let _guard = lock.lock().await;

        if self.sessions.get(&key).await.is_some() {
            debug!(identity, session_key = %key, "resuming session");
            return self.continue_flow(&key, text).await;
        }

        let flows = self.flows.list_active().await;
        let Some(flow) = find_matching_flow(&flows, text) else {
            debug!(identity, "no matching flow for message");
            return Ok(None);
        };
        info!(flow = %flow.id, name = %flow.name, identity, "trigger matched, starting flow");
        self.start_flow(identity, flow).await
    }

    /// Start a fresh session for `identity` rooted at the flow's start node
    /// and run the first turn. Also used by the scheduler and by "test this
    /// flow" tooling; any existing session for the identity is replaced.
    pub async fn start_flow(
        &self,
        identity: &str,
        flow: &FlowDefinition,
    ) -> Result<Option<OutboundPayload>, EngineError> {
        let Some(start) = flow.start_node() else {
            error!(flow = %flow.id, "flow has no start node");
            return Ok(Some(OutboundPayload::text(CONFIG_ERROR_MESSAGE)));
        };

        let mut session = Session::new(flow.id.clone(), start.id.clone());
        self.sessions.set(identity, session.clone()).await;
        self.bump_stat(flow, StatKind::Sent);

        // The start node itself never emits output; move straight past it.
        let Some(next) = find_next_node(flow, &start.id, None, Some(&session)) else {
            debug!(flow = %flow.id, "nothing connected after start, ending flow");
            self.end_session(identity).await;
            return Ok(None);
        };

        self.execute_with_burst(identity, flow, next, &mut session)
            .await
    }

    /// Resume an existing session with a new inbound message.
    async fn continue_flow(
        &self,
        key: &str,
        message: &str,
    ) -> Result<Option<OutboundPayload>, EngineError> {
        let Some(mut session) = self.sessions.get(key).await else {
            return Ok(None);
        };

        // Definitions are re-fetched every turn so edits take effect on the
        // next resume.
        let flow = if session.flow_id.starts_with("temp") {
            self.temp_flows.get(&session.flow_id).await
        } else {
            self.flows.get_by_id(&session.flow_id).await
        };
        let Some(flow) = flow else {
            warn!(flow = %session.flow_id, "flow definition gone (expired temp or deleted), ending session");
            self.end_session(key).await;
            return Ok(None);
        };

        let Some(current) = flow.node(&session.current_node_id) else {
            warn!(node = %session.current_node_id, "current node no longer in flow, ending session");
            self.end_session(key).await;
            return Ok(None);
        };
        debug!(node = %current.id, kind = current.kind.type_name(), "continuing flow");

        if current.kind.is_interactive() {
            if let Some(matched) = match_interactive_option(current, message) {
                return self
                    .follow_matched_branch(key, &flow, current, matched, &mut session)
                    .await;
            }
            debug!("no interactive match, treating reply as free text");
        }

        session
            .variables
            .insert("lastResponse".into(), message.to_string());

        let Some(next) = find_next_node(&flow, &current.id, Some(message), Some(&session)) else {
            debug!(node = %current.id, "flow ended, no next node");
            self.end_session(key).await;
            return Ok(None);
        };

        self.execute_with_burst(key, &flow, next, &mut session)
            .await
    }

    /// A button or list row matched: record the choice, bump the click stat,
    /// and resolve the branch by handle, then by label, then by the generic
    /// edge search on the display text.
    async fn follow_matched_branch(
        &self,
        key: &str,
        flow: &FlowDefinition,
        current: &Node,
        matched: MatchedOption,
        session: &mut Session,
    ) -> Result<Option<OutboundPayload>, EngineError> {
        info!(option = %matched.display, node = %current.id, "interactive option matched");

        let var = if matched.from_list {
            "lastListItemSelected"
        } else {
            "lastButtonClicked"
        };
        session
            .variables
            .insert(var.into(), matched.display.clone());
        session
            .variables
            .insert("lastResponse".into(), matched.display.clone());
        self.bump_stat(flow, StatKind::Clicked);

        let branch_text = matched.display.trim().to_lowercase();
        // Option equality on the handle is intentional: a button without an
        // id pairs with a connection without a sourceHandle.
        let connection = flow
            .connections_from(&current.id)
            .find(|c| c.source_handle == matched.id)
            .or_else(|| {
                flow.connections_from(&current.id).find(|c| {
                    c.label.as_deref().map(|l| l.trim().to_lowercase()).as_deref()
                        == Some(branch_text.as_str())
                })
            });

        let mut next = connection.and_then(|c| flow.node(&c.target));
        if next.is_none() {
            next = find_next_node(flow, &current.id, Some(&matched.display), Some(session));
        }

        match next {
            Some(node) => self.execute_with_burst(key, flow, node, session).await,
            None => {
                // Branch matched but leads nowhere: answer with the option's
                // configured feedback and end the flow.
                let content =
                    personalize_message(matched.feedback(), key, Some(session), &self.leads).await;
                self.end_session(key).await;
                Ok(Some(OutboundPayload::Text { content }))
            }
        }
    }

    /// Execute `first` and keep advancing while the graph chains
    /// non-interactive nodes: each intermediate payload is dispatched
    /// straight through the channel adapter (failures propagate), followed by
    /// a short settling pause for delivery ordering. The loop advances into a
    /// trailing interactive node so the session parks there awaiting input,
    /// and that node's payload is what the caller gets to send.
    async fn execute_with_burst(
        &self,
        identity: &str,
        flow: &FlowDefinition,
        first: &Node,
        session: &mut Session,
    ) -> Result<Option<OutboundPayload>, EngineError> {
        let mut result = self.execute_node(identity, flow, first, session, 0).await;
        self.sessions.set(identity, session.clone()).await;
        let mut last = first;

        while result.is_some() && last.kind.is_bursty() {
            let Some(next) = find_next_node(flow, &last.id, None, Some(session)) else {
                break;
            };
            if !next.kind.is_bursty() && !next.kind.is_interactive() {
                // Condition (or stray start) lookahead: leave it for the next
                // inbound turn.
                break;
            }

            if let Some(payload) = &result {
                debug!(node = %last.id, kind = payload.type_name(), "dispatching burst message");
                self.channel.send(identity, payload).await?;
            }
            sleep(self.config.burst_settle).await;

            result = self.execute_node(identity, flow, next, session, 0).await;
            self.sessions.set(identity, session.clone()).await;
            last = next;
        }

        Ok(result)
    }

    /// Register an unsaved definition for trial runs. It lives in a
    /// time-boxed registry (not the flow store), keeps no stats, and expires
    /// on its own.
    pub async fn register_temp_flow(&self, flow: FlowDefinition) {
        self.temp_flows.register(flow).await;
    }

    /// Fuzzy-resolved session lookup, mostly for dashboards and tests.
    pub async fn get_session(&self, identity: &str) -> Option<Session> {
        find_session(&self.sessions, identity)
            .await
            .map(|(_, session)| session)
    }

    /// Drop a user's session, fuzzy-resolving the identity first.
    pub async fn clear_session(&self, identity: &str) {
        if let Some((key, _)) = find_session(&self.sessions, identity).await {
            self.sessions.remove(&key).await;
        }
    }

    async fn end_session(&self, key: &str) {
        debug!(session_key = %key, "ending session");
        self.sessions.remove(key).await;
    }

    fn turn_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.turn_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
