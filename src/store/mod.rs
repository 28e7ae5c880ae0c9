//! Delivery record model and durable-store ports.
//!
//! The relational datastore itself belongs to the embedding application;
//! this module defines the record types, the conditional-update primitive
//! every state transition rides on, and the async ports the orchestrator
//! talks to. [`memory::MemoryStore`] is the reference implementation used
//! in tests and single-process deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::phone;

pub mod memory;

/// Current time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Delivery status of an outbound attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Record created, transport not yet invoked (or a retry re-entering
    /// the send path).
    Pending,
    /// Transport accepted the send; awaiting provider confirmation.
    Sent,
    /// Provider confirmed delivery. Terminal.
    Delivered,
    /// Transport rejected the send, or the provider reported failure.
    Failed,
    /// No provider confirmation arrived within the delivery timeout.
    Undelivered,
    /// Recipient opted out. Terminal.
    OptedOut,
    /// Retry budget exhausted or unrecoverable input. Terminal.
    FailedPermanent,
}

/// States from which further automatic transitions are possible.
pub const NON_TERMINAL: &[DeliveryStatus] = &[
    DeliveryStatus::Pending,
    DeliveryStatus::Sent,
    DeliveryStatus::Failed,
    DeliveryStatus::Undelivered,
];

impl DeliveryStatus {
    /// True for statuses with no further automatic transition.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Delivered | Self::OptedOut | Self::FailedPermanent
        )
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Sent => write!(f, "sent"),
            Self::Delivered => write!(f, "delivered"),
            Self::Failed => write!(f, "failed"),
            Self::Undelivered => write!(f, "undelivered"),
            Self::OptedOut => write!(f, "opted_out"),
            Self::FailedPermanent => write!(f, "failed_permanent"),
        }
    }
}

/// One outbound delivery attempt, keyed by lead id.
///
/// Records are never deleted in normal operation; a new send for a lead
/// whose record is terminal supersedes it, and at most one non-terminal
/// record exists per lead at any time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub lead_id: String,
    pub tenant_id: String,
    /// Raw recipient number as captured upstream. Never logged; use
    /// `phone_masked`.
    pub phone: String,
    pub phone_masked: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,
    pub status: DeliveryStatus,
    pub retry_count: u32,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<i64>,
    pub updated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl DeliveryRecord {
    /// Create a fresh `Pending` record for a send attempt.
    pub fn new(
        lead_id: impl Into<String>,
        tenant_id: impl Into<String>,
        phone: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        let phone = phone.into();
        let now = now_millis();
        Self {
            lead_id: lead_id.into(),
            tenant_id: tenant_id.into(),
            phone_masked: phone::mask(&phone),
            phone,
            body: body.into(),
            provider_message_id: None,
            status: DeliveryStatus::Pending,
            retry_count: 0,
            created_at: now,
            sent_at: None,
            delivered_at: None,
            updated_at: now,
            last_error: None,
        }
    }
}

/// Field patch applied by a conditional update. Unset fields are left alone;
/// `updated_at` is always stamped.
#[derive(Debug, Clone, Default)]
pub struct RecordUpdate {
    pub status: Option<DeliveryStatus>,
    pub provider_message_id: Option<String>,
    pub sent_at: Option<i64>,
    pub delivered_at: Option<i64>,
    pub last_error: Option<String>,
    pub bump_retry: bool,
}

impl RecordUpdate {
    /// Patch that moves the record to `status`.
    pub fn status(status: DeliveryStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_provider_message_id(mut self, id: impl Into<String>) -> Self {
        self.provider_message_id = Some(id.into());
        self
    }

    pub fn with_sent_at(mut self, ts: i64) -> Self {
        self.sent_at = Some(ts);
        self
    }

    pub fn with_delivered_at(mut self, ts: i64) -> Self {
        self.delivered_at = Some(ts);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }

    /// Also increment the retry counter.
    pub fn with_retry_increment(mut self) -> Self {
        self.bump_retry = true;
        self
    }

    /// Apply the patch to a record in place.
    pub fn apply(self, record: &mut DeliveryRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(id) = self.provider_message_id {
            record.provider_message_id = Some(id);
        }
        if let Some(ts) = self.sent_at {
            record.sent_at = Some(ts);
        }
        if let Some(ts) = self.delivered_at {
            record.delivered_at = Some(ts);
        }
        if let Some(error) = self.last_error {
            record.last_error = Some(error);
        }
        if self.bump_retry {
            record.retry_count += 1;
        }
        record.updated_at = now_millis();
    }
}

/// A `(tenant, phone)` pair excluded from all future sends. Immutable once
/// created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptOutEntry {
    pub id: String,
    pub tenant_id: String,
    /// Normalized last-10-digit key, not the raw number.
    pub phone_suffix: String,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

impl OptOutEntry {
    pub fn new(
        tenant_id: impl Into<String>,
        phone_suffix: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            phone_suffix: phone_suffix.into(),
            reason: reason.into(),
            recorded_at: Utc::now(),
        }
    }
}

/// Store failures.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("lead {0} already has an in-flight record")]
    ActiveRecordExists(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable persistence for delivery records.
///
/// `update_where_status` is the optimistic-concurrency primitive: every
/// transition names the statuses it expects, and zero rows affected is a
/// benign `Ok(false)`, never an error.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Create a record, superseding a terminal one for the same lead.
    /// Fails with [`StoreError::ActiveRecordExists`] when a non-terminal
    /// record is present, which is what keeps sends single-flight per lead.
    async fn insert(&self, record: DeliveryRecord) -> Result<(), StoreError>;

    async fn get(&self, lead_id: &str) -> Result<Option<DeliveryRecord>, StoreError>;

    async fn get_by_provider_id(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<DeliveryRecord>, StoreError>;

    /// Apply `patch` only if the record's current status is one of
    /// `expected`. Returns whether a row was updated.
    async fn update_where_status(
        &self,
        lead_id: &str,
        expected: &[DeliveryStatus],
        patch: RecordUpdate,
    ) -> Result<bool, StoreError>;

    /// Sweep query: `Failed`/`Undelivered` records with retry budget left,
    /// last touched at or before `updated_before`, created at or after
    /// `created_after`.
    async fn find_retryable(
        &self,
        max_retries: u32,
        updated_before: i64,
        created_after: i64,
    ) -> Result<Vec<DeliveryRecord>, StoreError>;

    /// Non-terminal records in a tenant whose phone matches the given
    /// 10-digit suffix.
    async fn find_active_by_phone(
        &self,
        tenant_id: &str,
        phone_suffix: &str,
    ) -> Result<Vec<DeliveryRecord>, StoreError>;
}

/// Durable persistence for opt-out entries.
#[async_trait]
pub trait OptOutStore: Send + Sync {
    /// Idempotent insert. `Ok(true)` when a new entry was created.
    async fn insert(&self, entry: OptOutEntry) -> Result<bool, StoreError>;

    async fn contains(&self, tenant_id: &str, phone_suffix: &str) -> Result<bool, StoreError>;

    /// All entries for a tenant, for the compliance audit view.
    async fn list(&self, tenant_id: &str) -> Result<Vec<OptOutEntry>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(DeliveryStatus::Delivered.is_terminal());
        assert!(DeliveryStatus::OptedOut.is_terminal());
        assert!(DeliveryStatus::FailedPermanent.is_terminal());
        for status in NON_TERMINAL {
            assert!(!status.is_terminal());
        }
    }

    #[test]
    fn test_status_display_matches_serde() {
        let json = serde_json::to_string(&DeliveryStatus::FailedPermanent).unwrap();
        assert_eq!(json, format!("\"{}\"", DeliveryStatus::FailedPermanent));
    }

    #[test]
    fn test_new_record_masks_phone() {
        let record = DeliveryRecord::new("lead-1", "tenant-1", "+15550104477", "hello");
        assert_eq!(record.status, DeliveryStatus::Pending);
        assert_eq!(record.phone_masked, "***4477");
        assert_eq!(record.retry_count, 0);
        assert!(record.provider_message_id.is_none());
    }

    #[test]
    fn test_record_update_applies_fields() {
        let mut record = DeliveryRecord::new("lead-1", "tenant-1", "5550104477", "hello");
        let before = record.updated_at;
        RecordUpdate::status(DeliveryStatus::Sent)
            .with_provider_message_id("SM123")
            .with_sent_at(42)
            .apply(&mut record);
        assert_eq!(record.status, DeliveryStatus::Sent);
        assert_eq!(record.provider_message_id.as_deref(), Some("SM123"));
        assert_eq!(record.sent_at, Some(42));
        assert!(record.updated_at >= before);
        // Untouched fields stay put.
        assert!(record.delivered_at.is_none());
        assert_eq!(record.retry_count, 0);
    }

    #[test]
    fn test_record_update_bumps_retry() {
        let mut record = DeliveryRecord::new("lead-1", "tenant-1", "5550104477", "hello");
        RecordUpdate::status(DeliveryStatus::Failed)
            .with_error("rejected")
            .with_retry_increment()
            .apply(&mut record);
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.last_error.as_deref(), Some("rejected"));
    }
}
