//! Recurring scan for due scheduled flows and due bulk sends.
//!
//! Each tick runs two independent passes. Recipients are processed strictly
//! sequentially: that keeps per-recipient delay settings meaningful and
//! provides implicit backpressure against the outbound channel, at the cost
//! of one slow recipient delaying the rest of its batch.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Months, Utc};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::FlowEngine;
use super::personalize::personalize_bulk;
use crate::channel::Channel;
use crate::flow::store::{BulkStatus, BulkStore, FlowStore, ScheduledBulkMessage};
use crate::flow::{AudienceType, FlowDefinition, Repeat, TriggerType};
use crate::leads::LeadStore;
use crate::message::OutboundPayload;

pub struct Scheduler {
    engine: Arc<FlowEngine>,
    flows: FlowStore,
    leads: LeadStore,
    channel: Channel,
    bulk: BulkStore,
    tick: Duration,
    bulk_send_delay: Duration,
}

impl Scheduler {
    pub fn new(engine: Arc<FlowEngine>, bulk: BulkStore) -> Self {
        let tick = engine.config().scheduler_tick;
        let bulk_send_delay = engine.config().bulk_send_delay;
        Self {
            flows: engine.flows(),
            leads: engine.leads(),
            channel: engine.channel(),
            engine,
            bulk,
            tick,
            bulk_send_delay,
        }
    }

    /// Start the recurring loop. Runs until the token is cancelled.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        info!(tick = ?self.tick, "flow scheduler started");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("flow scheduler stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.run_once(Utc::now()).await;
                    }
                }
            }
        })
    }

    /// One scheduler pass at the given instant. Public so tests and embedders
    /// can drive ticks deterministically.
    pub async fn run_once(&self, now: DateTime<Utc>) {
        self.run_due_flows(now).await;
        self.run_due_bulk(now).await;
    }

    async fn run_due_flows(&self, now: DateTime<Utc>) {
        let due: Vec<FlowDefinition> = self
            .flows
            .list_active()
            .await
            .into_iter()
            .filter(|f| {
                f.trigger_type == TriggerType::Scheduled
                    && f.schedule.next_run.is_some_and(|t| t <= now)
            })
            .collect();
        if due.is_empty() {
            return;
        }
        info!(count = due.len(), "scheduled flows due for execution");
        for flow in due {
            self.execute_scheduled_flow(flow, now).await;
        }
    }

    async fn execute_scheduled_flow(&self, mut flow: FlowDefinition, now: DateTime<Utc>) {
        info!(flow = %flow.id, name = %flow.name, "executing scheduled flow");

        let recipients = self.resolve_recipients(&flow).await;
        if recipients.is_empty() {
            // Terminal misconfiguration, not an error: a scheduled flow with
            // nobody to talk to is switched off rather than retried forever.
            warn!(flow = %flow.id, "no recipients resolved, deactivating scheduled flow");
            flow.schedule.last_run = Some(now);
            flow.active = false;
            self.flows.save(flow).await;
            return;
        }
        info!(flow = %flow.id, recipients = recipients.len(), "dispatching scheduled flow");

        for phone in &recipients {
            match self.engine.start_flow(phone, &flow).await {
                Ok(Some(payload)) => {
                    if let Err(e) = self.channel.send(phone, &payload).await {
                        error!(recipient = %phone, error = %e, "failed to send scheduled flow message");
                    }
                }
                Ok(None) => {
                    warn!(
                        recipient = %phone,
                        flow = %flow.id,
                        "no starting content; check connections after the start node"
                    );
                }
                Err(e) => {
                    error!(recipient = %phone, flow = %flow.id, error = %e, "scheduled flow failed for recipient");
                }
            }
        }

        flow.schedule.last_run = Some(now);
        match flow.schedule.repeat {
            Some(repeat) if repeat != Repeat::Once => {
                // Single-step advance from the previous nextRun, not from
                // now: missed cycles are neither compounded nor caught up.
                flow.schedule.next_run = flow.schedule.next_run.and_then(|prev| match repeat {
                    Repeat::Daily => prev.checked_add_signed(chrono::Duration::days(1)),
                    Repeat::Weekly => prev.checked_add_signed(chrono::Duration::days(7)),
                    Repeat::Monthly => prev.checked_add_months(Months::new(1)),
                    Repeat::Once => None,
                });
            }
            _ => {
                flow.schedule.next_run = None;
                flow.active = false;
            }
        }
        debug!(flow = %flow.id, next_run = ?flow.schedule.next_run, "schedule updated");
        self.flows.save(flow).await;
    }

    async fn resolve_recipients(&self, flow: &FlowDefinition) -> Vec<String> {
        match flow.recipients.audience_type {
            AudienceType::Tags => {
                if flow.recipients.tags.is_empty() {
                    return Vec::new();
                }
                self.leads
                    .find_by_any_tag(&flow.recipients.tags)
                    .await
                    .into_iter()
                    .map(|lead| lead.phone)
                    .collect()
            }
            AudienceType::Specific | AudienceType::Individual | AudienceType::Manual => flow
                .recipients
                .phones
                .iter()
                .map(|p| p.chars().filter(|c| c.is_ascii_digit()).collect::<String>())
                .filter(|p| !p.is_empty())
                .collect(),
            AudienceType::All => self
                .leads
                .list_all()
                .await
                .into_iter()
                .map(|lead| lead.phone)
                .collect(),
        }
    }

    async fn run_due_bulk(&self, now: DateTime<Utc>) {
        let due = self.bulk.list_due(now).await;
        if due.is_empty() {
            return;
        }
        info!(count = due.len(), "bulk messages due for execution");
        for msg in due {
            self.execute_bulk(msg, now).await;
        }
    }

    async fn execute_bulk(&self, mut msg: ScheduledBulkMessage, now: DateTime<Utc>) {
        info!(id = %msg.id, recipients = msg.recipients.len(), "executing scheduled bulk message");

        let total = msg.recipients.len();
        let mut success = 0usize;
        let mut failed = 0usize;

        for (idx, phone) in msg.recipients.iter().enumerate() {
            let text = if msg.personalize {
                personalize_bulk(&msg.message, phone, &self.leads).await
            } else {
                msg.message.clone()
            };

            match self.channel.send(phone, &OutboundPayload::text(text)).await {
                Ok(_) => success += 1,
                Err(e) => {
                    failed += 1;
                    error!(recipient = %phone, error = %e, "bulk send failed");
                }
            }

            if msg.add_delay && idx + 1 < total {
                sleep(self.bulk_send_delay).await;
            }
        }

        // Failed only when every recipient failed; partial delivery still
        // counts as sent.
        msg.status = if failed == total {
            BulkStatus::Failed
        } else {
            BulkStatus::Sent
        };
        msg.executed_at = Some(now);
        self.bulk.update(msg).await;
        info!(success, failed, "bulk message execution complete");
    }
}
