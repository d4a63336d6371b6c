//! Node execution: the state machine that turns one graph node into an
//! outbound payload, plus the edge-search and condition-evaluation helpers it
//! routes with.

use tokio::time::{Duration, sleep};
use tracing::{debug, error, warn};

use super::personalize::personalize_message;
use super::session::Session;
use super::{FlowEngine, LOOP_GUARD_MESSAGE};
use crate::flow::{CtaType, FlowDefinition, Node, NodeKind, StatKind};
use crate::message::{ButtonKind, OutboundButton, OutboundPayload};

/// Evaluate a `type:value` condition rule against a test value.
///
/// `contains:<x>` is a substring test, `equals:<x>` an equality test, and any
/// other rule string is compared raw against the value. Both sides are
/// trimmed and lowercased. An empty rule or empty test value is always false.
pub fn evaluate_condition(condition: &str, test_value: &str) -> bool {
    if condition.is_empty() || test_value.is_empty() {
        return false;
    }
    let value = test_value.trim().to_lowercase();
    let rule = condition.trim().to_lowercase();

    if let Some(check) = rule.strip_prefix("contains:") {
        return value.contains(check.trim());
    }
    if let Some(check) = rule.strip_prefix("equals:") {
        return value.trim() == check.trim();
    }
    value == rule
}

/// Generic edge search: resolve the node that follows `current_node_id`.
///
/// Condition nodes are routed by evaluating their rule and following the
/// `true`/`false` branch; every other node follows the first connection whose
/// label or handle matches the message, or simply the first connection when
/// no message was supplied. `None` means the flow ends for this turn.
pub fn find_next_node<'a>(
    flow: &'a FlowDefinition,
    current_node_id: &str,
    message: Option<&str>,
    session: Option<&Session>,
) -> Option<&'a Node> {
    let current = flow.node(current_node_id)?;

    if let NodeKind::Condition { data } = &current.kind {
        let variable = data
            .variable
            .as_deref()
            .filter(|v| !v.is_empty())
            .unwrap_or("lastResponse");
        let value_to_test = session
            .and_then(|s| s.variables.get(variable))
            .map(String::as_str)
            .filter(|v| !v.is_empty())
            .or(message)
            .unwrap_or("");

        let cond_type = data
            .condition
            .as_deref()
            .filter(|c| !c.is_empty())
            .unwrap_or("equals");
        let cond_value = data.value.as_deref().unwrap_or("");
        let rule = format!("{cond_type}:{cond_value}");

        let handle = if evaluate_condition(&rule, value_to_test) {
            "true"
        } else {
            "false"
        };
        debug!(node = %current_node_id, handle, "condition evaluated");

        let connection = flow.connections_from(current_node_id).find(|c| {
            c.source_handle.as_deref() == Some(handle)
                || c.label.as_deref().map(|l| l.to_lowercase()).as_deref() == Some(handle)
        });
        if let Some(conn) = connection {
            return flow.node(&conn.target);
        }
        // No true/false branch wired up; fall through to the generic search.
    }

    let connection = flow.connections_from(current_node_id).find(|c| {
        let Some(message) = message else {
            return true;
        };
        let label_matches = c
            .label
            .as_deref()
            .map(|l| l.trim().to_lowercase() == message.trim().to_lowercase())
            .unwrap_or(false);
        label_matches || c.source_handle.as_deref() == Some(message)
    });
    connection.and_then(|c| flow.node(&c.target))
}

/// An interactive option (button or list row) resolved from an inbound reply.
#[derive(Debug, Clone)]
pub(crate) struct MatchedOption {
    pub id: Option<String>,
    pub display: String,
    pub reply: Option<String>,
    pub value: Option<String>,
    pub from_list: bool,
}

impl MatchedOption {
    /// Terminal feedback when the chosen branch has no outgoing connection:
    /// the configured reply text, or the option's value, or its display text.
    pub fn feedback(&self) -> &str {
        self.reply
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| self.value.as_deref().filter(|s| !s.is_empty()))
            .unwrap_or(&self.display)
    }
}

/// Match an inbound reply against the options of an interactive node.
///
/// Buttons match by id, then by case-insensitive trimmed label, then by the
/// first 20 characters of labels longer than that (providers truncate long
/// button titles on the wire). List rows across all sections plus the legacy
/// flat item list match by id, then by title. `cta` nodes configure no
/// selectable options, so replies to them always fall through to the generic
/// edge search.
pub(crate) fn match_interactive_option(node: &Node, message: &str) -> Option<MatchedOption> {
    match &node.kind {
        NodeKind::Buttons { data } => data
            .buttons
            .iter()
            .find(|b| {
                let id_hit = b
                    .id
                    .as_deref()
                    .is_some_and(|id| !id.is_empty() && id == message);
                let label_hit = message.trim().to_lowercase() == b.text.trim().to_lowercase();
                let truncated_hit = b.text.chars().count() > 20
                    && message == b.text.chars().take(20).collect::<String>();
                id_hit || label_hit || truncated_hit
            })
            .map(|b| MatchedOption {
                id: b.id.clone(),
                display: b.text.clone(),
                reply: b.reply.clone(),
                value: b.value.clone(),
                from_list: false,
            }),
        NodeKind::List { data } => data
            .sections
            .iter()
            .flat_map(|s| s.rows.iter())
            .chain(data.list_items.iter())
            .find(|r| {
                let id_hit = !r.id.is_empty() && r.id == message;
                let title_hit = message.trim().to_lowercase() == r.title.trim().to_lowercase();
                id_hit || title_hit
            })
            .map(|r| MatchedOption {
                id: if r.id.is_empty() {
                    None
                } else {
                    Some(r.id.clone())
                },
                display: r.title.clone(),
                reply: None,
                value: None,
                from_list: true,
            }),
        _ => None,
    }
}

impl FlowEngine {
    /// Execute one node and return its payload, walking condition chains in
    /// place under the bounded depth counter.
    ///
    /// Condition traversal is a trampoline rather than recursion: each hop
    /// from a condition node into its resolved target increments `depth`, and
    /// crossing the configured bound halts the turn with a fixed warning
    /// text. The session is left mid-graph on purpose so the misconfiguration
    /// stays visible on the next inbound message.
    pub(crate) async fn execute_node(
        &self,
        identity: &str,
        flow: &FlowDefinition,
        node: &Node,
        session: &mut Session,
        depth: u32,
    ) -> Option<OutboundPayload> {
        let mut current = node;
        let mut depth = depth;

        loop {
            if depth > self.config.max_condition_depth {
                error!(identity, node = %current.id, depth, "condition loop detected, halting turn");
                return Some(OutboundPayload::text(LOOP_GUARD_MESSAGE));
            }

            session.current_node_id = current.id.clone();
            session.node_history.push(current.id.clone());
            debug!(node = %current.id, kind = current.kind.type_name(), "executing node");

            match &current.kind {
                NodeKind::Condition { .. } => {
                    let last_response = session
                        .variables
                        .get("lastResponse")
                        .cloned()
                        .unwrap_or_default();
                    match find_next_node(flow, &current.id, Some(&last_response), Some(session)) {
                        Some(next) => {
                            depth += 1;
                            current = next;
                        }
                        None => return None,
                    }
                }
                NodeKind::Message { data } => {
                    let content =
                        personalize_message(&data.text, identity, Some(session), &self.leads).await;
                    // A delay node directly after a message is executed
                    // inline: it paces this reply without becoming the
                    // session's current node.
                    if let Some(next) = find_next_node(flow, &current.id, None, Some(session)) {
                        if let NodeKind::Delay { data } = &next.kind {
                            sleep(Duration::from_secs(data.seconds())).await;
                        }
                    }
                    self.bump_stat(flow, StatKind::Delivered);
                    return Some(OutboundPayload::Text { content });
                }
                NodeKind::Buttons { data } => {
                    let content =
                        personalize_message(&data.text, identity, Some(session), &self.leads).await;
                    let buttons = data
                        .buttons
                        .iter()
                        .map(|b| OutboundButton {
                            id: b.id.clone(),
                            text: b.text.clone(),
                            kind: b.kind,
                            value: b.value.clone(),
                        })
                        .collect();
                    self.bump_stat(flow, StatKind::Delivered);
                    return Some(OutboundPayload::Buttons { content, buttons });
                }
                NodeKind::Cta { data } => {
                    let content =
                        personalize_message(&data.text, identity, Some(session), &self.leads).await;
                    let kind = match data.cta_type {
                        Some(CtaType::Phone) => ButtonKind::Call,
                        _ => ButtonKind::Url,
                    };
                    let value = match kind {
                        ButtonKind::Call => data.phone_number.clone(),
                        _ => data.url.clone(),
                    };
                    let button = OutboundButton {
                        id: None,
                        text: data
                            .button_text
                            .clone()
                            .unwrap_or_else(|| "Click Here".to_string()),
                        kind,
                        value,
                    };
                    self.bump_stat(flow, StatKind::Delivered);
                    return Some(OutboundPayload::Buttons {
                        content,
                        buttons: vec![button],
                    });
                }
                NodeKind::List { data } => {
                    let content =
                        personalize_message(&data.text, identity, Some(session), &self.leads).await;
                    self.bump_stat(flow, StatKind::Delivered);
                    return Some(OutboundPayload::List {
                        content,
                        button_text: data.button_text.clone(),
                        sections: data.sections.clone(),
                        items: data.list_items.clone(),
                    });
                }
                NodeKind::Image { data } => {
                    let caption = self.media_caption(data, identity, session).await;
                    self.bump_stat(flow, StatKind::Delivered);
                    return Some(OutboundPayload::Image {
                        url: data.resolved_url().map(str::to_string),
                        caption,
                    });
                }
                NodeKind::Video { data } => {
                    let caption = self.media_caption(data, identity, session).await;
                    self.bump_stat(flow, StatKind::Delivered);
                    return Some(OutboundPayload::Video {
                        url: data.resolved_url().map(str::to_string),
                        caption,
                    });
                }
                NodeKind::Document { data } => {
                    let caption = self.media_caption(data, identity, session).await;
                    self.bump_stat(flow, StatKind::Delivered);
                    return Some(OutboundPayload::Document {
                        url: data.resolved_url().map(str::to_string),
                        caption,
                        filename: Some(
                            data.filename
                                .clone()
                                .unwrap_or_else(|| "document.pdf".to_string()),
                        ),
                    });
                }
                NodeKind::Audio { data } => {
                    // Audio carries no caption on the wire.
                    self.bump_stat(flow, StatKind::Delivered);
                    return Some(OutboundPayload::Audio {
                        url: data.resolved_url().map(str::to_string),
                    });
                }
                NodeKind::Delay { data } => {
                    let seconds = data.seconds();
                    debug!(node = %current.id, seconds, "delaying");
                    sleep(Duration::from_secs(seconds)).await;
                    return Some(OutboundPayload::NoReply);
                }
                NodeKind::Start { .. } => {
                    warn!(node = %current.id, "start node executed directly, producing nothing");
                    return None;
                }
            }
        }
    }

    async fn media_caption(
        &self,
        data: &crate::flow::MediaData,
        identity: &str,
        session: &Session,
    ) -> Option<String> {
        let caption = personalize_message(
            data.caption.as_deref().unwrap_or_default(),
            identity,
            Some(session),
            &self.leads,
        )
        .await;
        (!caption.is_empty()).then_some(caption)
    }

    /// Best-effort stat bump, dispatched off the response path. Temporary
    /// test flows keep no stats.
    pub(crate) fn bump_stat(&self, flow: &FlowDefinition, stat: StatKind) {
        if flow.is_temporary() {
            return;
        }
        let store = self.flows.clone();
        let id = flow.id.clone();
        tokio::spawn(async move {
            store.increment_stat(&id, stat).await;
        });
    }
}
