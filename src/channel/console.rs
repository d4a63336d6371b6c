//! Stdout adapter backing the `flow test` CLI command: prints payloads as
//! pretty JSON instead of delivering them.

use async_trait::async_trait;

use super::{ChannelAdapter, ChannelError, DeliveryReceipt};
use crate::message::OutboundPayload;

#[derive(Debug, Default)]
pub struct ConsoleChannel;

#[async_trait]
impl ChannelAdapter for ConsoleChannel {
    fn name(&self) -> &str {
        "console"
    }

    async fn send(
        &self,
        to: &str,
        payload: &OutboundPayload,
    ) -> Result<DeliveryReceipt, ChannelError> {
        if payload.is_visible() {
            let rendered = serde_json::to_string_pretty(payload)
                .unwrap_or_else(|_| payload.type_name().to_string());
            println!("→ {to}\n{rendered}");
        }
        Ok(DeliveryReceipt::default())
    }
}
