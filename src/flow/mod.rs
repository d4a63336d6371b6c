//! Flow definitions: the directed graph an operator authors in the visual
//! builder, deserialized from `.json`/`.yaml` files with a wire format that
//! must stay compatible with existing flow documents.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::message::ButtonKind;

pub mod store;
pub mod watch;

/// How an inbound message is matched against a flow's trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Exact,
    Contains,
    #[default]
    Keyword,
    Regex,
    Scheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum Repeat {
    #[default]
    Once,
    Daily,
    Weekly,
    Monthly,
}

/// Delivery cadence for `scheduled` flows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct Schedule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat: Option<Repeat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum AudienceType {
    #[default]
    All,
    Tags,
    Specific,
    Individual,
    Manual,
}

/// Who a scheduled flow is delivered to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct RecipientConfig {
    pub audience_type: AudienceType,
    pub tags: Vec<String>,
    pub phones: Vec<String>,
}

/// Best-effort delivery counters kept on the definition itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct FlowStats {
    pub sent: u64,
    pub delivered: u64,
    pub read: u64,
    pub clicked: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatKind {
    Sent,
    Delivered,
    Read,
    Clicked,
    Errors,
}

impl StatKind {
    pub fn apply(self, stats: &mut FlowStats) {
        match self {
            StatKind::Sent => stats.sent += 1,
            StatKind::Delivered => stats.delivered += 1,
            StatKind::Read => stats.read += 1,
            StatKind::Clicked => stats.clicked += 1,
            StatKind::Errors => stats.errors += 1,
        }
    }
}

/// Editor canvas position. Preserved on round-trip, ignored by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// One button configured on a `buttons` node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Button {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub text: String,
    /// Optional feedback text sent when the button branch has no outgoing
    /// connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: ButtonKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ListRow {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ListSection {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub rows: Vec<ListRow>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct MessageData {
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ButtonsData {
    pub text: String,
    pub buttons: Vec<Button>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct ListData {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub button_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    pub sections: Vec<ListSection>,
    /// Legacy flat item list, kept for flows authored before sections existed.
    pub list_items: Vec<ListRow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum CtaType {
    #[default]
    Url,
    Phone,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct CtaData {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub button_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cta_type: Option<CtaType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct MediaData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Legacy field name; `url` wins when both are present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl MediaData {
    /// Primary url with legacy fallback; empty strings count as absent.
    pub fn resolved_url(&self) -> Option<&str> {
        self.url
            .as_deref()
            .filter(|u| !u.is_empty())
            .or_else(|| self.media_url.as_deref().filter(|u| !u.is_empty()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct DelayData {
    /// Seconds to pause. Editors have emitted both numbers and numeric
    /// strings here, so the raw value is kept and parsed leniently.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<Value>,
}

impl DelayData {
    /// Configured pause, defaulting to 1 second when missing or unparsable.
    pub fn seconds(&self) -> u64 {
        let parsed = match &self.delay {
            Some(Value::Number(n)) => n.as_f64().map(|f| f as i64),
            Some(Value::String(s)) => s.trim().parse::<f64>().ok().map(|f| f as i64),
            _ => None,
        };
        match parsed {
            Some(n) if n > 0 => n as u64,
            Some(n) if n < 0 => 0,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ConditionData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variable: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Node kinds, discriminated by the wire-stable `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NodeKind {
    /// Entry marker. Never produces output; execution advances past it
    /// immediately. Editors stash trigger echoes in its `data`, which the
    /// engine ignores.
    Start {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    Message {
        #[serde(default)]
        data: MessageData,
    },
    Buttons {
        #[serde(default)]
        data: ButtonsData,
    },
    List {
        #[serde(default)]
        data: ListData,
    },
    Cta {
        #[serde(default)]
        data: CtaData,
    },
    Image {
        #[serde(default)]
        data: MediaData,
    },
    Video {
        #[serde(default)]
        data: MediaData,
    },
    Audio {
        #[serde(default)]
        data: MediaData,
    },
    Document {
        #[serde(default)]
        data: MediaData,
    },
    Delay {
        #[serde(default)]
        data: DelayData,
    },
    Condition {
        #[serde(default)]
        data: ConditionData,
    },
}

impl NodeKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKind::Start { .. } => "start",
            NodeKind::Message { .. } => "message",
            NodeKind::Buttons { .. } => "buttons",
            NodeKind::List { .. } => "list",
            NodeKind::Cta { .. } => "cta",
            NodeKind::Image { .. } => "image",
            NodeKind::Video { .. } => "video",
            NodeKind::Audio { .. } => "audio",
            NodeKind::Document { .. } => "document",
            NodeKind::Delay { .. } => "delay",
            NodeKind::Condition { .. } => "condition",
        }
    }

    /// Nodes that wait for a user choice before the flow can advance.
    pub fn is_interactive(&self) -> bool {
        matches!(
            self,
            NodeKind::Buttons { .. } | NodeKind::List { .. } | NodeKind::Cta { .. }
        )
    }

    /// Nodes the burst advancer may chain through without user input.
    pub fn is_bursty(&self) -> bool {
        matches!(
            self,
            NodeKind::Message { .. }
                | NodeKind::Image { .. }
                | NodeKind::Video { .. }
                | NodeKind::Audio { .. }
                | NodeKind::Document { .. }
                | NodeKind::Delay { .. }
        )
    }
}

/// One step in a flow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Node {
    pub id: String,
    #[serde(flatten)]
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

/// A directed edge between two nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub source: String,
    pub target: String,
    /// Stable branch key, e.g. a button id or `true`/`false` on conditions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
    /// Human label, used as a fallback match key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

fn default_true() -> bool {
    true
}

/// A declarative flow: trigger metadata, nodes, connections, schedule and
/// audience config, plus delivery stats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FlowDefinition {
    #[serde(alias = "_id")]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub trigger: String,
    #[serde(default)]
    pub trigger_type: TriggerType,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub schedule: Schedule,
    #[serde(default, rename = "recipientConfig")]
    pub recipients: RecipientConfig,
    #[serde(default)]
    pub stats: FlowStats,
}

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Serialization(String),
    #[error("unsupported extension for {0} (expected .json or .yaml)")]
    UnsupportedExtension(String),
    #[error("flow `{0}` has no start node")]
    NoStartNode(String),
    #[error("flow `{flow}` has {count} start nodes, expected exactly one")]
    MultipleStartNodes { flow: String, count: usize },
    #[error("flow `{flow}` connection references unknown node `{node}`")]
    DanglingConnection { flow: String, node: String },
}

impl FlowDefinition {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn start_node(&self) -> Option<&Node> {
        self.nodes
            .iter()
            .find(|n| matches!(n.kind, NodeKind::Start { .. }))
    }

    pub fn connections_from<'a>(&'a self, source: &'a str) -> impl Iterator<Item = &'a Connection> {
        self.connections.iter().filter(move |c| c.source == source)
    }

    /// Temporary definitions registered by "test this flow" tooling are keyed
    /// by a `temp` id prefix and excluded from stats bookkeeping.
    pub fn is_temporary(&self) -> bool {
        self.id.starts_with("temp")
    }

    /// Structural validation: exactly one start node, no dangling connection
    /// endpoints. Unreachable nodes are tolerated with a warning since the
    /// editor can leave orphans behind mid-edit.
    pub fn validate(&self) -> Result<(), FlowError> {
        let starts = self
            .nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::Start { .. }))
            .count();
        if starts == 0 {
            return Err(FlowError::NoStartNode(self.id.clone()));
        }
        if starts > 1 {
            return Err(FlowError::MultipleStartNodes {
                flow: self.id.clone(),
                count: starts,
            });
        }

        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut index_of: HashMap<&str, NodeIndex> = HashMap::new();
        for node in &self.nodes {
            let idx = graph.add_node(node.id.as_str());
            index_of.insert(node.id.as_str(), idx);
        }
        for conn in &self.connections {
            let source = index_of.get(conn.source.as_str()).copied();
            let target = index_of.get(conn.target.as_str()).copied();
            match (source, target) {
                (Some(s), Some(t)) => {
                    graph.add_edge(s, t, ());
                }
                _ => {
                    let missing = if source.is_none() {
                        conn.source.clone()
                    } else {
                        conn.target.clone()
                    };
                    return Err(FlowError::DanglingConnection {
                        flow: self.id.clone(),
                        node: missing,
                    });
                }
            }
        }

        // Cycles are legal (condition loops are bounded at runtime), so only
        // reachability from the start node is checked here.
        let start_id = self.start_node().map(|n| n.id.as_str()).unwrap_or_default();
        let mut reachable = vec![false; graph.node_count()];
        if let Some(&start_idx) = index_of.get(start_id) {
            let mut dfs = Dfs::new(&graph, start_idx);
            while let Some(nx) = dfs.next(&graph) {
                reachable[nx.index()] = true;
            }
        }
        for node in &self.nodes {
            let idx = index_of[node.id.as_str()];
            if !reachable[idx.index()] && node.id != start_id {
                warn!(flow = %self.id, node = %node.id, "node is unreachable from start");
            }
        }
        Ok(())
    }

    /// Load a definition from a `.json` or `.yaml`/`.yml` file and validate it.
    pub fn load_from_file(path: &Path) -> Result<FlowDefinition, FlowError> {
        let contents =
            fs::read_to_string(path).map_err(|e| FlowError::Io(format!("read error: {e}")))?;
        let ext = path
            .extension()
            .and_then(|os| os.to_str())
            .unwrap_or_default()
            .to_lowercase();

        let flow: FlowDefinition = match ext.as_str() {
            "json" => serde_json::from_str(&contents)
                .map_err(|e| FlowError::Serialization(format!("JSON parse error: {e}")))?,
            "yaml" | "yml" => serde_yaml_bw::from_str(&contents)
                .map_err(|e| FlowError::Serialization(format!("YAML parse error: {e}")))?,
            _ => {
                return Err(FlowError::UnsupportedExtension(
                    path.to_string_lossy().to_string(),
                ));
            }
        };

        flow.validate()?;
        Ok(flow)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), FlowError> {
        let ext = path
            .extension()
            .and_then(|os| os.to_str())
            .unwrap_or_default()
            .to_lowercase();
        let contents = match ext.as_str() {
            "json" => serde_json::to_string_pretty(self)
                .map_err(|e| FlowError::Serialization(e.to_string()))?,
            "yaml" | "yml" => serde_yaml_bw::to_string(self)
                .map_err(|e| FlowError::Serialization(e.to_string()))?,
            _ => {
                return Err(FlowError::UnsupportedExtension(
                    path.to_string_lossy().to_string(),
                ));
            }
        };
        fs::write(path, contents).map_err(|e| FlowError::Io(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn flow_json() -> Value {
        json!({
            "_id": "flow-1",
            "name": "Welcome",
            "trigger": "hi",
            "triggerType": "exact",
            "nodes": [
                {"id": "start-1", "type": "start", "position": {"x": 0.0, "y": 0.0}},
                {"id": "msg-1", "type": "message", "data": {"text": "Hello {name}"}},
                {"id": "btn-1", "type": "buttons", "data": {
                    "text": "Interested?",
                    "buttons": [
                        {"id": "b1", "text": "Yes", "type": "reply"},
                        {"id": "b2", "text": "No", "type": "reply", "reply": "Maybe later!"}
                    ]
                }},
                {"id": "list-1", "type": "list", "data": {
                    "text": "Pick a slot",
                    "buttonText": "View slots",
                    "listItems": [{"id": "r1", "title": "Morning"}]
                }},
                {"id": "delay-1", "type": "delay", "data": {"delay": "3"}}
            ],
            "connections": [
                {"source": "start-1", "target": "msg-1"},
                {"source": "msg-1", "target": "btn-1"},
                {"source": "btn-1", "target": "list-1", "sourceHandle": "b1"},
                {"source": "btn-1", "target": "delay-1", "label": "No"}
            ]
        })
    }

    #[test]
    fn test_wire_format_round_trip() {
        let flow: FlowDefinition = serde_json::from_value(flow_json()).unwrap();
        assert_eq!(flow.id, "flow-1");
        assert_eq!(flow.trigger_type, TriggerType::Exact);
        assert!(flow.active, "active defaults to true");
        assert_eq!(flow.nodes.len(), 5);

        match &flow.node("btn-1").unwrap().kind {
            NodeKind::Buttons { data } => {
                assert_eq!(data.buttons[1].reply.as_deref(), Some("Maybe later!"));
                assert_eq!(data.buttons[0].kind, ButtonKind::Reply);
            }
            other => panic!("expected buttons node, got {}", other.type_name()),
        }
        match &flow.node("list-1").unwrap().kind {
            NodeKind::List { data } => {
                assert_eq!(data.button_text.as_deref(), Some("View slots"));
                assert_eq!(data.list_items[0].title, "Morning");
            }
            other => panic!("expected list node, got {}", other.type_name()),
        }

        // The `type` discriminator must survive serialization untouched.
        let back = serde_json::to_value(&flow).unwrap();
        assert_eq!(back["nodes"][0]["type"], "start");
        assert_eq!(back["nodes"][2]["type"], "buttons");
        assert_eq!(back["connections"][2]["sourceHandle"], "b1");
        assert_eq!(back["triggerType"], "exact");
    }

    #[test]
    fn test_validate_requires_exactly_one_start() {
        let mut value = flow_json();
        value["nodes"][0]["type"] = json!("message");
        let flow: FlowDefinition = serde_json::from_value(value).unwrap();
        assert!(matches!(flow.validate(), Err(FlowError::NoStartNode(_))));

        let mut value = flow_json();
        value["nodes"]
            .as_array_mut()
            .unwrap()
            .push(json!({"id": "start-2", "type": "start"}));
        let flow: FlowDefinition = serde_json::from_value(value).unwrap();
        assert!(matches!(
            flow.validate(),
            Err(FlowError::MultipleStartNodes { count: 2, .. })
        ));
    }

    #[test]
    fn test_validate_rejects_dangling_connection() {
        let mut value = flow_json();
        value["connections"]
            .as_array_mut()
            .unwrap()
            .push(json!({"source": "msg-1", "target": "ghost"}));
        let flow: FlowDefinition = serde_json::from_value(value).unwrap();
        match flow.validate() {
            Err(FlowError::DanglingConnection { node, .. }) => assert_eq!(node, "ghost"),
            other => panic!("expected dangling connection error, got {other:?}"),
        }
    }

    #[test]
    fn test_delay_seconds_lenient_parse() {
        let parse = |v: Value| DelayData { delay: Some(v) }.seconds();
        assert_eq!(parse(json!(5)), 5);
        assert_eq!(parse(json!("3")), 3);
        assert_eq!(parse(json!(2.7)), 2);
        assert_eq!(parse(json!("nope")), 1);
        assert_eq!(parse(json!(0)), 1);
        assert_eq!(parse(json!(-4)), 0);
        assert_eq!(DelayData::default().seconds(), 1);
    }

    #[test]
    fn test_media_url_legacy_fallback() {
        let data = MediaData {
            url: Some(String::new()),
            media_url: Some("https://cdn.example/a.png".into()),
            ..Default::default()
        };
        assert_eq!(data.resolved_url(), Some("https://cdn.example/a.png"));
    }

    #[test]
    fn test_temporary_flow_detection() {
        let mut flow: FlowDefinition = serde_json::from_value(flow_json()).unwrap();
        assert!(!flow.is_temporary());
        flow.id = "temp-123".into();
        assert!(flow.is_temporary());
    }

    #[test]
    fn test_load_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("welcome.yaml");
        let yaml = r#"
id: flow-yaml
name: Welcome
trigger: hello
triggerType: contains
nodes:
  - id: start-1
    type: start
  - id: msg-1
    type: message
    data:
      text: hi there
connections:
  - source: start-1
    target: msg-1
"#;
        std::fs::write(&path, yaml).unwrap();
        let flow = FlowDefinition::load_from_file(&path).unwrap();
        assert_eq!(flow.id, "flow-yaml");
        assert_eq!(flow.trigger_type, TriggerType::Contains);
    }
}
