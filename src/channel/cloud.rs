//! WhatsApp-Cloud-style HTTP adapter: turns abstract payloads into the
//! provider's interactive/media wire bodies and posts them with bearer auth.
//!
//! Provider limits are enforced here, not in the engine: 3 reply buttons with
//! 20-char titles, 10 list rows with 24-char titles and 72-char descriptions,
//! captions only on media kinds that support them.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, error, info};

use super::{ChannelAdapter, ChannelError, DeliveryReceipt};
use crate::config::ConfigManager;
use crate::message::{ButtonKind, OutboundPayload};

pub const TOKEN_KEY: &str = "WHATSAPP_TOKEN";
pub const PHONE_ID_KEY: &str = "PHONE_NUMBER_ID";
pub const PUBLIC_URL_KEY: &str = "PUBLIC_URL";

const MAX_REPLY_BUTTONS: usize = 3;
const MAX_LIST_ROWS: usize = 10;
const BUTTON_TITLE_CHARS: usize = 20;
const ROW_TITLE_CHARS: usize = 24;
const ROW_DESCRIPTION_CHARS: usize = 72;

#[derive(Debug)]
pub struct CloudChannel {
    http: Client,
    config: ConfigManager,
    api_base: String,
}

impl CloudChannel {
    pub fn new(config: ConfigManager) -> Self {
        Self {
            http: Client::new(),
            config,
            api_base: "https://graph.facebook.com/v19.0".to_string(),
        }
    }

    /// Point the adapter at a different API root (tests, proxies).
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }
}

#[async_trait]
impl ChannelAdapter for CloudChannel {
    fn name(&self) -> &str {
        "whatsapp-cloud"
    }

    async fn send(
        &self,
        to: &str,
        payload: &OutboundPayload,
    ) -> Result<DeliveryReceipt, ChannelError> {
        if !payload.is_visible() {
            return Ok(DeliveryReceipt::default());
        }

        let token = self.config.0.get(TOKEN_KEY).await;
        let phone_id = self.config.0.get(PHONE_ID_KEY).await;
        let (token, phone_id) = match (token, phone_id) {
            (Some(t), Some(p)) => (t, p),
            _ => {
                error!("outbound credentials missing, cannot send");
                return Err(ChannelError::MissingCredentials);
            }
        };
        let public_url = self.config.0.get(PUBLIC_URL_KEY).await;

        let body = build_request_body(to, payload, public_url.as_deref());
        debug!(to = %to, kind = payload.type_name(), "posting outbound message");

        let url = format!("{}/{}/messages", self.api_base, phone_id);
        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;

        let status = response.status();
        let data: Value = response
            .json()
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;

        if !status.is_success() {
            let message = data["error"]["message"]
                .as_str()
                .unwrap_or("failed to send message")
                .to_string();
            let code = data["error"]["code"]
                .as_i64()
                .map(|c| c.to_string())
                .unwrap_or_else(|| status.as_u16().to_string());
            error!(code = %code, message = %message, "provider rejected message");
            return Err(ChannelError::Api { code, message });
        }

        let message_id = data["messages"][0]["id"].as_str().map(str::to_string);
        info!(to = %to, id = ?message_id, "message sent");
        Ok(DeliveryReceipt { message_id })
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn envelope(to: &str) -> Value {
    json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": to,
    })
}

/// Prefix relative `/uploads/...` style urls with the public base url when
/// one is configured; the provider only fetches absolute links.
fn absolutize(url: &str, public_url: Option<&str>) -> String {
    if !url.starts_with('/') {
        return url.to_string();
    }
    match public_url {
        Some(base) => format!("{}{}", base.trim_end_matches('/'), url),
        None => url.to_string(),
    }
}

/// Build the provider wire body for one payload. Pure so it can be tested
/// without a network.
pub fn build_request_body(to: &str, payload: &OutboundPayload, public_url: Option<&str>) -> Value {
    let mut body = envelope(to);
    match payload {
        OutboundPayload::Text { content } => {
            body["type"] = json!("text");
            body["text"] = json!({"body": content});
        }
        OutboundPayload::Buttons { content, buttons } => {
            let reply: Vec<_> = buttons
                .iter()
                .filter(|b| b.kind == ButtonKind::Reply)
                .take(MAX_REPLY_BUTTONS)
                .collect();
            let cta: Vec<_> = buttons
                .iter()
                .filter(|b| matches!(b.kind, ButtonKind::Url | ButtonKind::Call))
                .collect();

            if let Some(first) = cta.first() {
                // Url/call buttons ride the cta_url template; the provider
                // only supports one per message.
                let value = first.value.as_deref().unwrap_or_default();
                body["type"] = json!("interactive");
                body["interactive"] = json!({
                    "type": "cta_url",
                    "body": {"text": if content.is_empty() { "Choose an option" } else { content.as_str() }},
                    "action": {
                        "name": "cta_url",
                        "parameters": {
                            "display_text": first.text,
                            "url": absolutize(value, public_url),
                        }
                    }
                });
            } else if !reply.is_empty() {
                let wire_buttons: Vec<Value> = reply
                    .iter()
                    .map(|b| {
                        let id = b
                            .id
                            .clone()
                            .unwrap_or_else(|| truncate_chars(&b.text, BUTTON_TITLE_CHARS));
                        json!({
                            "type": "reply",
                            "reply": {
                                "id": id,
                                "title": truncate_chars(&b.text, BUTTON_TITLE_CHARS),
                            }
                        })
                    })
                    .collect();
                body["type"] = json!("interactive");
                body["interactive"] = json!({
                    "type": "button",
                    "body": {"text": content},
                    "action": {"buttons": wire_buttons},
                });
            } else {
                body["type"] = json!("text");
                body["text"] = json!({"body": content});
            }
        }
        OutboundPayload::List {
            content,
            button_text,
            sections,
            items,
        } => {
            if sections.is_empty() && items.is_empty() {
                body["type"] = json!("text");
                body["text"] =
                    json!({"body": if content.is_empty() { "No items available" } else { content.as_str() }});
                return body;
            }
            let wire_sections: Value = if !sections.is_empty() {
                sections
                    .iter()
                    .map(|sec| {
                        json!({
                            "title": truncate_chars(&sec.title, ROW_TITLE_CHARS),
                            "rows": sec.rows.iter().map(|row| json!({
                                "id": row.id,
                                "title": truncate_chars(&row.title, ROW_TITLE_CHARS),
                                "description": truncate_chars(
                                    row.description.as_deref().unwrap_or_default(),
                                    ROW_DESCRIPTION_CHARS,
                                ),
                            })).collect::<Vec<_>>(),
                        })
                    })
                    .collect::<Vec<_>>()
                    .into()
            } else {
                json!([{
                    "title": "Options",
                    "rows": items.iter().take(MAX_LIST_ROWS).enumerate().map(|(idx, row)| json!({
                        "id": if row.id.is_empty() { format!("item_{idx}") } else { row.id.clone() },
                        "title": truncate_chars(&row.title, ROW_TITLE_CHARS),
                        "description": truncate_chars(
                            row.description.as_deref().unwrap_or_default(),
                            ROW_DESCRIPTION_CHARS,
                        ),
                    })).collect::<Vec<_>>(),
                }])
            };
            body["type"] = json!("interactive");
            body["interactive"] = json!({
                "type": "list",
                "body": {"text": if content.is_empty() { "Select an option" } else { content.as_str() }},
                "action": {
                    "button": button_text.as_deref().unwrap_or("View Menu"),
                    "sections": wire_sections,
                }
            });
        }
        OutboundPayload::Image { url, caption } => {
            media_body(&mut body, "image", url.as_deref(), caption.as_deref(), None, public_url);
        }
        OutboundPayload::Video { url, caption } => {
            media_body(&mut body, "video", url.as_deref(), caption.as_deref(), None, public_url);
        }
        OutboundPayload::Document {
            url,
            caption,
            filename,
        } => {
            media_body(
                &mut body,
                "document",
                url.as_deref(),
                caption.as_deref(),
                Some(filename.as_deref().unwrap_or("document.pdf")),
                public_url,
            );
        }
        OutboundPayload::Audio { url } => {
            media_body(&mut body, "audio", url.as_deref(), None, None, public_url);
        }
        OutboundPayload::NoReply => {}
    }
    body
}

fn media_body(
    body: &mut Value,
    kind: &str,
    url: Option<&str>,
    caption: Option<&str>,
    filename: Option<&str>,
    public_url: Option<&str>,
) {
    let Some(url) = url.filter(|u| !u.is_empty()) else {
        // No link to attach; degrade to the caption as plain text rather
        // than failing the whole turn.
        let text = caption
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{kind} placeholder (no URL provided)"));
        body["type"] = json!("text");
        body["text"] = json!({"body": text});
        return;
    };

    let mut media = json!({"link": absolutize(url, public_url)});
    if matches!(kind, "image" | "video" | "document") {
        if let Some(caption) = caption.map(str::trim).filter(|c| !c.is_empty()) {
            media["caption"] = json!(caption);
        }
    }
    if kind == "document" {
        if let Some(filename) = filename {
            media["filename"] = json!(sanitize_filename(filename));
        }
    }
    body["type"] = json!(kind);
    body[kind] = media;
}

/// Strip characters the provider chokes on and make sure an extension exists.
fn sanitize_filename(name: &str) -> String {
    let mut cleaned: String = name
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    if !cleaned.contains('.') {
        cleaned.push_str(".pdf");
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{ListRow, ListSection};
    use crate::message::OutboundButton;

    fn reply_button(id: &str, text: &str) -> OutboundButton {
        OutboundButton {
            id: Some(id.into()),
            text: text.into(),
            kind: ButtonKind::Reply,
            value: None,
        }
    }

    #[test]
    fn test_text_body() {
        let body = build_request_body("311", &OutboundPayload::text("hi"), None);
        assert_eq!(body["type"], "text");
        assert_eq!(body["text"]["body"], "hi");
        assert_eq!(body["to"], "311");
    }

    #[test]
    fn test_reply_buttons_capped_and_truncated() {
        let long = "A very long button label that exceeds limits";
        let payload = OutboundPayload::Buttons {
            content: "pick".into(),
            buttons: vec![
                reply_button("b1", "One"),
                OutboundButton {
                    id: None,
                    text: long.into(),
                    kind: ButtonKind::Reply,
                    value: None,
                },
                reply_button("b3", "Three"),
                reply_button("b4", "Four"),
            ],
        };
        let body = build_request_body("311", &payload, None);
        let buttons = body["interactive"]["action"]["buttons"].as_array().unwrap();
        assert_eq!(buttons.len(), 3, "provider allows at most three buttons");
        let title = buttons[1]["reply"]["title"].as_str().unwrap();
        assert_eq!(title.chars().count(), 20);
        // Missing id falls back to the truncated label.
        assert_eq!(buttons[1]["reply"]["id"], title);
    }

    #[test]
    fn test_cta_button_wins_over_reply() {
        let payload = OutboundPayload::Buttons {
            content: "book now".into(),
            buttons: vec![
                reply_button("b1", "ignored"),
                OutboundButton {
                    id: None,
                    text: "Open site".into(),
                    kind: ButtonKind::Url,
                    value: Some("/book".into()),
                },
            ],
        };
        let body = build_request_body("311", &payload, Some("https://example.com/"));
        assert_eq!(body["interactive"]["type"], "cta_url");
        assert_eq!(
            body["interactive"]["action"]["parameters"]["url"],
            "https://example.com/book"
        );
    }

    #[test]
    fn test_legacy_items_become_single_section() {
        let payload = OutboundPayload::List {
            content: "slots".into(),
            button_text: None,
            sections: vec![],
            items: vec![ListRow {
                id: String::new(),
                title: "Morning".into(),
                description: None,
            }],
        };
        let body = build_request_body("311", &payload, None);
        let sections = body["interactive"]["action"]["sections"].as_array().unwrap();
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0]["title"], "Options");
        assert_eq!(sections[0]["rows"][0]["id"], "item_0");
        assert_eq!(body["interactive"]["action"]["button"], "View Menu");
    }

    #[test]
    fn test_sectioned_list_truncation() {
        let payload = OutboundPayload::List {
            content: "slots".into(),
            button_text: Some("Pick".into()),
            sections: vec![ListSection {
                title: "A title much longer than twenty four characters".into(),
                rows: vec![ListRow {
                    id: "r1".into(),
                    title: "Row".into(),
                    description: Some("d".repeat(100)),
                }],
            }],
            items: vec![],
        };
        let body = build_request_body("311", &payload, None);
        let section = &body["interactive"]["action"]["sections"][0];
        assert_eq!(section["title"].as_str().unwrap().chars().count(), 24);
        assert_eq!(
            section["rows"][0]["description"].as_str().unwrap().len(),
            72
        );
    }

    #[test]
    fn test_document_filename_sanitized() {
        let payload = OutboundPayload::Document {
            url: Some("/files/plan one.pdf".into()),
            caption: Some("  your plan  ".into()),
            filename: Some("diet plan (v2)".into()),
        };
        let body = build_request_body("311", &payload, Some("https://example.com"));
        assert_eq!(body["type"], "document");
        assert_eq!(
            body["document"]["link"],
            "https://example.com/files/plan one.pdf"
        );
        assert_eq!(body["document"]["filename"], "diet_plan_v2.pdf");
        assert_eq!(body["document"]["caption"], "your plan");
    }

    #[test]
    fn test_media_without_url_degrades_to_text() {
        let payload = OutboundPayload::Image {
            url: None,
            caption: Some("a caption".into()),
        };
        let body = build_request_body("311", &payload, None);
        assert_eq!(body["type"], "text");
        assert_eq!(body["text"]["body"], "a caption");
    }

    #[test]
    fn test_audio_carries_no_caption() {
        let payload = OutboundPayload::Audio {
            url: Some("https://cdn.example/a.mp3".into()),
        };
        let body = build_request_body("311", &payload, None);
        assert_eq!(body["type"], "audio");
        assert!(body["audio"].get("caption").is_none());
    }
}
