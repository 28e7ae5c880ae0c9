//! Delivery orchestrator: the outbound state machine.
//!
//! Consumes reply-ready events, consults the opt-out registry, formats the
//! body, invokes the transport, and reacts to provider callbacks, inbound
//! opt-outs, and timer fires. The orchestrator is the sole writer of
//! `DeliveryRecord.status`; every transition is a conditional update that
//! re-reads current status immediately before mutating, so a webhook racing
//! a timer (or a duplicate webhook) degrades to a benign no-op.
//!
//! State machine:
//! `Pending -> Sent -> {Delivered, Failed, Undelivered} -> (retry) -> Pending ...`
//! with terminal states `Delivered`, `OptedOut`, `FailedPermanent`.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::DeliveryConfig;
use crate::format::{format_reply, FormatError};
use crate::metrics::{DeliveryMetrics, MetricsSnapshot};
use crate::optout::{self, OptOutRegistry};
use crate::phone;
use crate::store::{
    now_millis, DeliveryRecord, DeliveryStatus, DeliveryStore, OptOutStore, RecordUpdate,
    StoreError, NON_TERMINAL,
};
use crate::timers::{RetryScheduler, TimeoutMonitor};
use crate::transport::{SendOutcome, TenantResolver, TransportClient};

pub mod sweeper;

/// A generated reply ready to be sent to a lead. The recipient lookup has
/// already happened upstream; a missing phone number is a permanent failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyReady {
    pub lead_id: String,
    pub tenant_id: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient_name: Option<String>,
}

/// Provider-reported delivery status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackStatus {
    Delivered,
    Failed,
    Undelivered,
}

/// Webhook payload forwarded by the HTTP layer. Callbacks are not
/// exactly-once: duplicates and unknown message ids must be tolerated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryCallback {
    pub provider_message_id: String,
    pub status: CallbackStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Inbound message forwarded for opt-out scanning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub from_phone: String,
    pub to_phone: String,
    pub body: String,
}

/// Failures surfaced to callers of the orchestrator. Permanent input
/// failures (`NoPhoneNumber`, `Format`) are recorded as durable
/// `FailedPermanent` records before the error is returned.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("lead {0} already has an in-flight delivery")]
    AlreadyInFlight(String),

    #[error("lead has no phone number on file")]
    NoPhoneNumber,

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error("no delivery record for lead {0}")]
    RecordMissing(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The delivery engine. Construct once, share via `Arc`, and feed it events;
/// spawn [`sweeper::run_sweeper`] alongside it for restart safety.
pub struct DeliveryOrchestrator {
    config: DeliveryConfig,
    store: Arc<dyn DeliveryStore>,
    registry: OptOutRegistry,
    transport: Arc<dyn TransportClient>,
    tenants: Arc<dyn TenantResolver>,
    metrics: Arc<DeliveryMetrics>,
    retries: RetryScheduler,
    timeouts: TimeoutMonitor,
    /// Handle to ourselves for timer callbacks; set by `new`.
    self_ref: Weak<Self>,
}

impl DeliveryOrchestrator {
    pub fn new(
        config: DeliveryConfig,
        store: Arc<dyn DeliveryStore>,
        optouts: Arc<dyn OptOutStore>,
        transport: Arc<dyn TransportClient>,
        tenants: Arc<dyn TenantResolver>,
        metrics: Arc<DeliveryMetrics>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            registry: OptOutRegistry::new(optouts, Arc::clone(&store)),
            config,
            store,
            transport,
            tenants,
            metrics,
            retries: RetryScheduler::default(),
            timeouts: TimeoutMonitor::default(),
            self_ref: self_ref.clone(),
        })
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// The opt-out registry, for the tenant-facing compliance view.
    pub fn opt_outs(&self) -> &OptOutRegistry {
        &self.registry
    }

    /// Current record for a lead, for downstream status display.
    pub async fn record(&self, lead_id: &str) -> Result<Option<DeliveryRecord>, StoreError> {
        self.store.get(lead_id).await
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Whether a retry timer is armed for a lead. The sweeper uses this to
    /// avoid double-driving a retry that in-memory state already owns.
    pub fn retry_armed(&self, lead_id: &str) -> bool {
        self.retries.is_armed(lead_id)
    }

    /// Entry point for "reply ready" events.
    ///
    /// Returns the status the record landed in (`Sent`, `Failed` pending
    /// retry, or `OptedOut`, which is a business outcome, not an error).
    /// Errors are either rejections (`AlreadyInFlight`), permanent input
    /// failures already recorded durably, or store faults.
    pub async fn handle_reply_ready(
        &self,
        event: ReplyReady,
    ) -> Result<DeliveryStatus, DeliveryError> {
        if let Some(existing) = self.store.get(&event.lead_id).await? {
            if !existing.status.is_terminal() {
                return Err(DeliveryError::AlreadyInFlight(event.lead_id));
            }
        }

        let phone = match &event.phone {
            Some(p) if !phone::digits(p).is_empty() => p.clone(),
            _ => {
                self.record_permanent_failure(&event, "no phone number on file")
                    .await?;
                return Err(DeliveryError::NoPhoneNumber);
            }
        };

        if self.registry.is_opted_out(&event.tenant_id, &phone).await? {
            let mut record =
                DeliveryRecord::new(&event.lead_id, &event.tenant_id, &phone, String::new());
            record.status = DeliveryStatus::OptedOut;
            self.insert_superseding(record).await?;
            info!(
                lead_id = %event.lead_id,
                phone = %phone::mask(&phone),
                next = %DeliveryStatus::OptedOut,
                cause = "recipient on opt-out list",
                "send suppressed"
            );
            return Ok(DeliveryStatus::OptedOut);
        }

        let body = match format_reply(
            &event.text,
            event.recipient_name.as_deref(),
            self.config.message_limit,
            &self.config.compliance_footer,
        ) {
            Ok(body) => body,
            Err(e) => {
                self.record_permanent_failure(&event, &e.to_string()).await?;
                return Err(e.into());
            }
        };

        let record = DeliveryRecord::new(&event.lead_id, &event.tenant_id, &phone, body);
        match self.store.insert(record).await {
            Ok(()) => {}
            Err(StoreError::ActiveRecordExists(lead_id)) => {
                return Err(DeliveryError::AlreadyInFlight(lead_id));
            }
            Err(e) => return Err(e.into()),
        }

        self.attempt_send(&event.lead_id).await
    }

    /// Webhook ingress. Unknown provider message ids are logged and ignored;
    /// duplicate callbacks are no-ops.
    pub async fn handle_callback(
        &self,
        callback: DeliveryCallback,
    ) -> Result<(), DeliveryError> {
        let record = match self
            .store
            .get_by_provider_id(&callback.provider_message_id)
            .await?
        {
            Some(r) => r,
            None => {
                debug!(
                    provider_message_id = %callback.provider_message_id,
                    "callback for unknown provider message id; ignoring"
                );
                return Ok(());
            }
        };

        match callback.status {
            CallbackStatus::Delivered => {
                let now = now_millis();
                let updated = self
                    .store
                    .update_where_status(
                        &record.lead_id,
                        &[DeliveryStatus::Sent, DeliveryStatus::Undelivered],
                        RecordUpdate::status(DeliveryStatus::Delivered).with_delivered_at(now),
                    )
                    .await?;
                if !updated {
                    debug!(
                        lead_id = %record.lead_id,
                        status = %record.status,
                        "duplicate or late delivered callback; ignoring"
                    );
                    return Ok(());
                }
                self.timeouts.cancel(&callback.provider_message_id);
                // A retry may be armed if the record had already gone
                // Undelivered; the confirmation wins.
                self.retries.cancel(&record.lead_id);
                self.metrics.delivered_total.inc();
                if let Some(sent_at) = record.sent_at {
                    self.metrics
                        .delivery_latency_ms
                        .observe((now - sent_at).max(0) as u64);
                }
                info!(
                    lead_id = %record.lead_id,
                    prev = %record.status,
                    next = %DeliveryStatus::Delivered,
                    cause = "provider callback",
                    "delivery confirmed"
                );
            }
            CallbackStatus::Failed | CallbackStatus::Undelivered => {
                let next = match callback.status {
                    CallbackStatus::Failed => DeliveryStatus::Failed,
                    _ => DeliveryStatus::Undelivered,
                };
                let error = callback
                    .error_message
                    .or(callback.error_code)
                    .unwrap_or_else(|| "provider reported failure".to_string());
                let updated = self
                    .store
                    .update_where_status(
                        &record.lead_id,
                        &[DeliveryStatus::Sent],
                        RecordUpdate::status(next)
                            .with_error(&error)
                            .with_retry_increment(),
                    )
                    .await?;
                if !updated {
                    debug!(
                        lead_id = %record.lead_id,
                        status = %record.status,
                        "out-of-order failure callback; ignoring"
                    );
                    return Ok(());
                }
                self.timeouts.cancel(&callback.provider_message_id);
                warn!(
                    lead_id = %record.lead_id,
                    prev = %record.status,
                    next = %next,
                    error = %error,
                    cause = "provider callback",
                    "delivery failed"
                );
                self.arm_retry_or_exhaust(&record.lead_id, record.retry_count + 1)
                    .await?;
            }
        }
        Ok(())
    }

    /// Inbound message ingress: scan for opt-out keywords, resolve the
    /// owning tenant from the destination number, then run the cascade.
    pub async fn handle_inbound(
        &self,
        message: InboundMessage,
    ) -> Result<(), DeliveryError> {
        if !optout::is_opt_out_message(&message.body) {
            return Ok(());
        }
        let tenant_id = match self.tenants.tenant_for_destination(&message.to_phone).await {
            Some(t) => t,
            None => {
                warn!(
                    to = %phone::mask(&message.to_phone),
                    "opt-out for unrecognized destination; no tenant resolved"
                );
                return Ok(());
            }
        };
        self.process_opt_out(&tenant_id, &message.from_phone, "inbound stop keyword")
            .await
    }

    /// Record an opt-out and cancel everything in flight for that phone
    /// within the tenant. Already-in-flight transport sends run to their
    /// terminal state; pending retries and timeouts do not.
    pub async fn process_opt_out(
        &self,
        tenant_id: &str,
        phone_number: &str,
        reason: &str,
    ) -> Result<(), DeliveryError> {
        let created = self
            .registry
            .record_opt_out(tenant_id, phone_number, reason)
            .await?;
        if created {
            self.metrics.optout_total.inc();
        }

        let affected = self
            .registry
            .find_affected_leads(tenant_id, phone_number)
            .await?;
        for lead_id in affected {
            // One bad lead must not stop the rest of the cascade.
            if let Err(e) = self.opt_out_lead(&lead_id).await {
                warn!(lead_id = %lead_id, error = %e, "opt-out cascade failed for lead");
            }
        }
        Ok(())
    }

    async fn opt_out_lead(&self, lead_id: &str) -> Result<(), DeliveryError> {
        let record = match self.store.get(lead_id).await? {
            Some(r) => r,
            None => return Ok(()),
        };
        let updated = self
            .store
            .update_where_status(lead_id, NON_TERMINAL, RecordUpdate::status(DeliveryStatus::OptedOut))
            .await?;
        self.retries.cancel(lead_id);
        if let Some(pmid) = record.provider_message_id.as_deref() {
            self.timeouts.cancel(pmid);
        }
        if updated {
            info!(
                lead_id = %lead_id,
                prev = %record.status,
                next = %DeliveryStatus::OptedOut,
                cause = "opt-out",
                "delivery cancelled"
            );
        }
        Ok(())
    }

    /// Run one send attempt for a lead whose record is `Pending`. Shared by
    /// the first send and every retry; the opt-out registry is consulted
    /// before each attempt.
    async fn attempt_send(&self, lead_id: &str) -> Result<DeliveryStatus, DeliveryError> {
        let record = self
            .store
            .get(lead_id)
            .await?
            .ok_or_else(|| DeliveryError::RecordMissing(lead_id.to_string()))?;

        if self
            .registry
            .is_opted_out(&record.tenant_id, &record.phone)
            .await?
        {
            let updated = self
                .store
                .update_where_status(lead_id, NON_TERMINAL, RecordUpdate::status(DeliveryStatus::OptedOut))
                .await?;
            if updated {
                info!(
                    lead_id = %lead_id,
                    prev = %record.status,
                    next = %DeliveryStatus::OptedOut,
                    cause = "opt-out recorded since last attempt",
                    "send suppressed"
                );
            }
            return Ok(DeliveryStatus::OptedOut);
        }

        // A client-level failure is handled like a provider rejection:
        // transient, retried on the same budget.
        let outcome = match self
            .transport
            .send(&record.tenant_id, &record.phone, &record.body)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => SendOutcome::rejected(e.to_string()),
        };

        match (outcome.accepted, outcome.provider_message_id) {
            (true, Some(provider_message_id)) => {
                let now = now_millis();
                let updated = self
                    .store
                    .update_where_status(
                        lead_id,
                        &[DeliveryStatus::Pending],
                        RecordUpdate::status(DeliveryStatus::Sent)
                            .with_provider_message_id(&provider_message_id)
                            .with_sent_at(now),
                    )
                    .await?;
                if !updated {
                    // Lost a race with a concurrent transition (opt-out
                    // cascade); whatever won owns the record now.
                    let status = self.current_status(lead_id).await?;
                    debug!(lead_id = %lead_id, status = %status, "send raced a concurrent transition");
                    return Ok(status);
                }
                self.metrics.sent_total.inc();
                info!(
                    lead_id = %lead_id,
                    phone = %record.phone_masked,
                    provider_message_id = %provider_message_id,
                    prev = %DeliveryStatus::Pending,
                    next = %DeliveryStatus::Sent,
                    cause = "transport accepted",
                    "message sent"
                );
                if let Some(orchestrator) = self.self_ref.upgrade() {
                    let key = provider_message_id.clone();
                    self.timeouts.arm(
                        &provider_message_id,
                        self.config.delivery_timeout(),
                        async move {
                            orchestrator.on_timeout_due(&key).await;
                        },
                    );
                }
                Ok(DeliveryStatus::Sent)
            }
            (accepted, _) => {
                let error = if accepted {
                    "transport accepted without a provider message id".to_string()
                } else {
                    outcome
                        .error
                        .unwrap_or_else(|| "transport rejected send".to_string())
                };
                let updated = self
                    .store
                    .update_where_status(
                        lead_id,
                        &[DeliveryStatus::Pending],
                        RecordUpdate::status(DeliveryStatus::Failed)
                            .with_error(&error)
                            .with_retry_increment(),
                    )
                    .await?;
                warn!(
                    lead_id = %lead_id,
                    error = %error,
                    prev = %DeliveryStatus::Pending,
                    next = %DeliveryStatus::Failed,
                    cause = "transport rejected",
                    "send failed"
                );
                if updated {
                    self.arm_retry_or_exhaust(lead_id, record.retry_count + 1)
                        .await?;
                }
                Ok(DeliveryStatus::Failed)
            }
        }
    }

    /// Schedule the next retry, or convert to `FailedPermanent` when the
    /// budget is spent. `retry_count` is the value after the failure that
    /// brought us here.
    async fn arm_retry_or_exhaust(
        &self,
        lead_id: &str,
        retry_count: u32,
    ) -> Result<(), DeliveryError> {
        if retry_count >= self.config.max_retries {
            let updated = self
                .store
                .update_where_status(
                    lead_id,
                    &[DeliveryStatus::Failed, DeliveryStatus::Undelivered],
                    RecordUpdate::status(DeliveryStatus::FailedPermanent),
                )
                .await?;
            if updated {
                self.metrics.failed_total.inc();
                warn!(
                    lead_id = %lead_id,
                    retry_count,
                    next = %DeliveryStatus::FailedPermanent,
                    cause = "retry budget exhausted",
                    "delivery abandoned"
                );
            }
            return Ok(());
        }
        if let Some(orchestrator) = self.self_ref.upgrade() {
            let lead = lead_id.to_string();
            let fut: Pin<Box<dyn Future<Output = ()> + Send>> = Box::pin(async move {
                orchestrator.on_retry_due(&lead).await;
            });
            self.retries.schedule(lead_id, self.config.retry_delay(), fut);
        }
        debug!(
            lead_id = %lead_id,
            retry_count,
            delay_ms = self.config.retry_delay_ms,
            "retry scheduled"
        );
        Ok(())
    }

    /// Retry timer callback. Also the sweeper's entry point: the sweeper
    /// drives exactly this path for records whose timers died with the
    /// process. Never propagates: a fault in one callback must not take
    /// down its caller.
    pub(crate) async fn on_retry_due(&self, lead_id: &str) {
        if let Err(e) = self.run_retry(lead_id).await {
            warn!(lead_id = %lead_id, error = %e, "retry attempt aborted");
        }
    }

    async fn run_retry(&self, lead_id: &str) -> Result<(), DeliveryError> {
        let record = match self.store.get(lead_id).await? {
            Some(r) => r,
            None => return Ok(()),
        };
        if record.status.is_terminal() {
            debug!(lead_id = %lead_id, status = %record.status, "retry fired for terminal record; ignoring");
            return Ok(());
        }
        if record.retry_count >= self.config.max_retries {
            return self.arm_retry_or_exhaust(lead_id, record.retry_count).await;
        }
        let updated = self
            .store
            .update_where_status(
                lead_id,
                &[DeliveryStatus::Failed, DeliveryStatus::Undelivered],
                RecordUpdate::status(DeliveryStatus::Pending),
            )
            .await?;
        if !updated {
            debug!(lead_id = %lead_id, status = %record.status, "retry raced a concurrent transition; ignoring");
            return Ok(());
        }
        self.metrics.retry_total.inc();
        info!(
            lead_id = %lead_id,
            retry_count = record.retry_count,
            prev = %record.status,
            next = %DeliveryStatus::Pending,
            cause = "retry due",
            "re-running send"
        );
        self.attempt_send(lead_id).await?;
        Ok(())
    }

    /// Delivery-timeout callback. Re-checks status before declaring the
    /// send undelivered, so a confirmation processed in the same tick wins.
    pub(crate) async fn on_timeout_due(&self, provider_message_id: &str) {
        if let Err(e) = self.run_timeout(provider_message_id).await {
            warn!(provider_message_id = %provider_message_id, error = %e, "timeout handling aborted");
        }
    }

    async fn run_timeout(&self, provider_message_id: &str) -> Result<(), DeliveryError> {
        let record = match self.store.get_by_provider_id(provider_message_id).await? {
            Some(r) => r,
            None => return Ok(()),
        };
        let updated = self
            .store
            .update_where_status(
                &record.lead_id,
                &[DeliveryStatus::Sent],
                RecordUpdate::status(DeliveryStatus::Undelivered)
                    .with_error("no delivery confirmation within timeout")
                    .with_retry_increment(),
            )
            .await?;
        if !updated {
            debug!(
                lead_id = %record.lead_id,
                status = %record.status,
                "timeout raced a terminal callback; ignoring"
            );
            return Ok(());
        }
        warn!(
            lead_id = %record.lead_id,
            prev = %DeliveryStatus::Sent,
            next = %DeliveryStatus::Undelivered,
            cause = "delivery timeout",
            "no confirmation from provider"
        );
        self.arm_retry_or_exhaust(&record.lead_id, record.retry_count + 1)
            .await
    }

    async fn current_status(&self, lead_id: &str) -> Result<DeliveryStatus, DeliveryError> {
        self.store
            .get(lead_id)
            .await?
            .map(|r| r.status)
            .ok_or_else(|| DeliveryError::RecordMissing(lead_id.to_string()))
    }

    /// Durably record a permanent input failure so downstream tooling can
    /// branch on it, then let the caller surface the error.
    async fn record_permanent_failure(
        &self,
        event: &ReplyReady,
        error: &str,
    ) -> Result<(), DeliveryError> {
        let phone = event.phone.clone().unwrap_or_default();
        let mut record =
            DeliveryRecord::new(&event.lead_id, &event.tenant_id, phone, String::new());
        record.status = DeliveryStatus::FailedPermanent;
        record.last_error = Some(error.to_string());
        self.insert_superseding(record).await?;
        self.metrics.failed_total.inc();
        warn!(
            lead_id = %event.lead_id,
            error = %error,
            next = %DeliveryStatus::FailedPermanent,
            cause = "permanent input failure",
            "send aborted"
        );
        Ok(())
    }

    async fn insert_superseding(&self, record: DeliveryRecord) -> Result<(), DeliveryError> {
        match self.store.insert(record).await {
            Ok(()) => Ok(()),
            Err(StoreError::ActiveRecordExists(lead_id)) => {
                Err(DeliveryError::AlreadyInFlight(lead_id))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct StubTransport {
        scripted: Mutex<VecDeque<Result<SendOutcome, TransportError>>>,
        calls: AtomicU32,
    }

    impl StubTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                scripted: Mutex::new(VecDeque::new()),
                calls: AtomicU32::new(0),
            })
        }

        fn push(&self, outcome: Result<SendOutcome, TransportError>) {
            self.scripted.lock().push_back(outcome);
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TransportClient for StubTransport {
        async fn send(
            &self,
            _tenant_id: &str,
            _phone: &str,
            _body: &str,
        ) -> Result<SendOutcome, TransportError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.scripted.lock().pop_front() {
                Some(outcome) => outcome,
                None => Ok(SendOutcome::accepted(format!("PM-{}", n))),
            }
        }
    }

    struct FixedTenant;

    #[async_trait]
    impl TenantResolver for FixedTenant {
        async fn tenant_for_destination(&self, _to_phone: &str) -> Option<String> {
            Some("tenant-1".to_string())
        }
    }

    struct Fixture {
        orchestrator: Arc<DeliveryOrchestrator>,
        transport: Arc<StubTransport>,
        metrics: Arc<DeliveryMetrics>,
    }

    /// Long timer delays: these tests drive the timer callbacks directly.
    fn fixture() -> Fixture {
        let config = DeliveryConfig {
            retry_delay_ms: 60_000,
            delivery_timeout_ms: 60_000,
            ..Default::default()
        };
        let store = MemoryStore::shared();
        let transport = StubTransport::new();
        let metrics = Arc::new(DeliveryMetrics::new());
        let orchestrator = DeliveryOrchestrator::new(
            config,
            Arc::clone(&store) as Arc<dyn DeliveryStore>,
            Arc::clone(&store) as Arc<dyn OptOutStore>,
            Arc::clone(&transport) as Arc<dyn TransportClient>,
            Arc::new(FixedTenant),
            Arc::clone(&metrics),
        );
        Fixture {
            orchestrator,
            transport,
            metrics,
        }
    }

    fn reply(lead_id: &str) -> ReplyReady {
        ReplyReady {
            lead_id: lead_id.to_string(),
            tenant_id: "tenant-1".to_string(),
            text: "Your test drive is confirmed for 2pm.".to_string(),
            phone: Some("+15550104477".to_string()),
            recipient_name: None,
        }
    }

    fn delivered(provider_message_id: &str) -> DeliveryCallback {
        DeliveryCallback {
            provider_message_id: provider_message_id.to_string(),
            status: CallbackStatus::Delivered,
            error_code: None,
            error_message: None,
            timestamp: Utc::now(),
        }
    }

    async fn sent_record(f: &Fixture, lead_id: &str) -> DeliveryRecord {
        let status = f.orchestrator.handle_reply_ready(reply(lead_id)).await.unwrap();
        assert_eq!(status, DeliveryStatus::Sent);
        f.orchestrator.record(lead_id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_timeout_after_delivery_is_noop() {
        let f = fixture();
        let record = sent_record(&f, "lead-1").await;
        let pmid = record.provider_message_id.unwrap();
        f.orchestrator.handle_callback(delivered(&pmid)).await.unwrap();

        f.orchestrator.on_timeout_due(&pmid).await;

        let record = f.orchestrator.record("lead-1").await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::Delivered);
        assert_eq!(record.retry_count, 0);
        assert_eq!(f.metrics.delivered_total.get(), 1);
    }

    #[tokio::test]
    async fn test_retry_fire_on_terminal_record_is_noop() {
        let f = fixture();
        let record = sent_record(&f, "lead-1").await;
        let pmid = record.provider_message_id.unwrap();
        f.orchestrator.handle_callback(delivered(&pmid)).await.unwrap();
        let calls_before = f.transport.calls();

        f.orchestrator.on_retry_due("lead-1").await;

        assert_eq!(f.transport.calls(), calls_before);
        assert_eq!(f.metrics.retry_total.get(), 0);
        let record = f.orchestrator.record("lead-1").await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::Delivered);
    }

    #[tokio::test]
    async fn test_failure_callback_after_delivery_is_noop() {
        let f = fixture();
        let record = sent_record(&f, "lead-1").await;
        let pmid = record.provider_message_id.unwrap();
        f.orchestrator.handle_callback(delivered(&pmid)).await.unwrap();

        let failure = DeliveryCallback {
            provider_message_id: pmid,
            status: CallbackStatus::Failed,
            error_code: Some("30006".to_string()),
            error_message: None,
            timestamp: Utc::now(),
        };
        f.orchestrator.handle_callback(failure).await.unwrap();

        let record = f.orchestrator.record("lead-1").await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::Delivered);
        assert_eq!(record.retry_count, 0);
    }

    #[tokio::test]
    async fn test_timeout_marks_undelivered_and_arms_retry() {
        let f = fixture();
        let record = sent_record(&f, "lead-1").await;
        let pmid = record.provider_message_id.unwrap();

        f.orchestrator.on_timeout_due(&pmid).await;

        let record = f.orchestrator.record("lead-1").await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::Undelivered);
        assert_eq!(record.retry_count, 1);
        assert!(f.orchestrator.retry_armed("lead-1"));
    }

    #[tokio::test]
    async fn test_transport_client_error_is_transient() {
        let f = fixture();
        f.transport
            .push(Err(TransportError::Client("connection reset".to_string())));

        let status = f.orchestrator.handle_reply_ready(reply("lead-1")).await.unwrap();

        assert_eq!(status, DeliveryStatus::Failed);
        let record = f.orchestrator.record("lead-1").await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::Failed);
        assert_eq!(record.retry_count, 1);
        assert!(record.last_error.unwrap().contains("connection reset"));
        assert!(f.orchestrator.retry_armed("lead-1"));
    }

    #[tokio::test]
    async fn test_delivered_from_undelivered_cancels_retry() {
        let f = fixture();
        let record = sent_record(&f, "lead-1").await;
        let pmid = record.provider_message_id.unwrap();
        f.orchestrator.on_timeout_due(&pmid).await;
        assert!(f.orchestrator.retry_armed("lead-1"));

        // The late confirmation wins over the pending retry.
        f.orchestrator.handle_callback(delivered(&pmid)).await.unwrap();

        let record = f.orchestrator.record("lead-1").await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::Delivered);
        assert!(!f.orchestrator.retry_armed("lead-1"));
    }
}
