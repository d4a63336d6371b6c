//! Recording adapter used by the test suite: captures every payload instead
//! of delivering it, and can be told to fail globally or for specific
//! recipients to exercise error paths.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use super::{ChannelAdapter, ChannelError, DeliveryReceipt};
use crate::message::OutboundPayload;

#[derive(Debug, Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<(String, OutboundPayload)>>,
    fail_all: AtomicBool,
    fail_recipients: Mutex<HashSet<String>>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything sent so far, in send order.
    pub fn sent(&self) -> Vec<(String, OutboundPayload)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// When set, every subsequent send fails with a transport error.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    /// Fail sends to one specific recipient only.
    pub fn fail_recipient(&self, to: &str) {
        self.fail_recipients.lock().unwrap().insert(to.to_string());
    }
}

#[async_trait]
impl ChannelAdapter for RecordingChannel {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(
        &self,
        to: &str,
        payload: &OutboundPayload,
    ) -> Result<DeliveryReceipt, ChannelError> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(ChannelError::Transport(
                "recording channel set to fail".into(),
            ));
        }
        if self.fail_recipients.lock().unwrap().contains(to) {
            return Err(ChannelError::Transport(format!(
                "recording channel set to fail for {to}"
            )));
        }
        if payload.is_visible() {
            self.sent
                .lock()
                .unwrap()
                .push((to.to_string(), payload.clone()));
        }
        Ok(DeliveryReceipt::default())
    }
}
