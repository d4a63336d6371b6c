use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::flow::{ListRow, ListSection};

/// What tapping a button does on the provider side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum ButtonKind {
    #[default]
    Reply,
    Url,
    Call,
}

/// One button on an outbound interactive payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OutboundButton {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub text: String,
    #[serde(rename = "type", default)]
    pub kind: ButtonKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Abstract outbound message produced by node execution.
///
/// The `type` discriminator is wire-stable: channel adapters and any existing
/// flow tooling dispatch on it, so variant names must not change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundPayload {
    Text {
        content: String,
    },
    Buttons {
        content: String,
        buttons: Vec<OutboundButton>,
    },
    List {
        content: String,
        #[serde(rename = "buttonText", default, skip_serializing_if = "Option::is_none")]
        button_text: Option<String>,
        #[serde(default)]
        sections: Vec<ListSection>,
        #[serde(default)]
        items: Vec<ListRow>,
    },
    Image {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    Video {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    Document {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
    Audio {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    /// A completed step that produces no visible output (e.g. a delay node).
    NoReply,
}

impl OutboundPayload {
    pub fn text(content: impl Into<String>) -> Self {
        OutboundPayload::Text {
            content: content.into(),
        }
    }

    /// Wire name of the payload variant, mostly for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            OutboundPayload::Text { .. } => "text",
            OutboundPayload::Buttons { .. } => "buttons",
            OutboundPayload::List { .. } => "list",
            OutboundPayload::Image { .. } => "image",
            OutboundPayload::Video { .. } => "video",
            OutboundPayload::Document { .. } => "document",
            OutboundPayload::Audio { .. } => "audio",
            OutboundPayload::NoReply => "no_reply",
        }
    }

    /// True for payloads the end user actually sees.
    pub fn is_visible(&self) -> bool {
        !matches!(self, OutboundPayload::NoReply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_wire_discriminator() {
        let payload = OutboundPayload::text("hello");
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value, json!({"type": "text", "content": "hello"}));

        let value = serde_json::to_value(&OutboundPayload::NoReply).unwrap();
        assert_eq!(value, json!({"type": "no_reply"}));
    }

    #[test]
    fn test_buttons_payload_round_trip() {
        let payload = OutboundPayload::Buttons {
            content: "pick one".into(),
            buttons: vec![OutboundButton {
                id: Some("b1".into()),
                text: "Yes".into(),
                kind: ButtonKind::Reply,
                value: None,
            }],
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["type"], "buttons");
        assert_eq!(value["buttons"][0]["type"], "reply");

        let back: OutboundPayload = serde_json::from_value(value).unwrap();
        assert_eq!(back, payload);
    }
}
