//! The narrow outbound contract between the engine and a messaging provider.
//! The engine only ever calls [`ChannelAdapter::send`] with an abstract
//! payload; everything provider-specific stays on the adapter side.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::message::OutboundPayload;

pub mod cloud;
pub mod console;
pub mod mock;

pub type Channel = Arc<dyn ChannelAdapter>;

/// Provider acknowledgement for one outbound send.
#[derive(Debug, Clone, Default)]
pub struct DeliveryReceipt {
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    #[error("outbound channel credentials are missing")]
    MissingCredentials,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("provider rejected the message ({code}): {message}")]
    Api { code: String, message: String },
}

#[async_trait]
pub trait ChannelAdapter: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Deliver one payload to one recipient. `NoReply` payloads must resolve
    /// successfully without reaching the provider.
    async fn send(&self, to: &str, payload: &OutboundPayload)
    -> Result<DeliveryReceipt, ChannelError>;
}
