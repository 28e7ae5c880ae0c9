//! In-memory store implementation.
//!
//! Reference implementation of the store ports over `parking_lot`-guarded
//! maps. Used by tests and single-process deployments; a relational
//! implementation in the embedding app expresses `update_where_status` as
//! `UPDATE ... WHERE status IN (...)`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{
    DeliveryRecord, DeliveryStatus, DeliveryStore, OptOutEntry, OptOutStore, RecordUpdate,
    StoreError,
};
use crate::phone;

/// In-memory delivery record and opt-out storage.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, DeliveryRecord>>,
    optouts: RwLock<HashMap<(String, String), OptOutEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience for wiring: one allocation shared across both ports.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl DeliveryStore for MemoryStore {
    async fn insert(&self, record: DeliveryRecord) -> Result<(), StoreError> {
        let mut records = self.records.write();
        if let Some(existing) = records.get(&record.lead_id) {
            if !existing.status.is_terminal() {
                return Err(StoreError::ActiveRecordExists(record.lead_id));
            }
        }
        records.insert(record.lead_id.clone(), record);
        Ok(())
    }

    async fn get(&self, lead_id: &str) -> Result<Option<DeliveryRecord>, StoreError> {
        Ok(self.records.read().get(lead_id).cloned())
    }

    async fn get_by_provider_id(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<DeliveryRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .values()
            .find(|r| r.provider_message_id.as_deref() == Some(provider_message_id))
            .cloned())
    }

    async fn update_where_status(
        &self,
        lead_id: &str,
        expected: &[DeliveryStatus],
        patch: RecordUpdate,
    ) -> Result<bool, StoreError> {
        let mut records = self.records.write();
        let record = match records.get_mut(lead_id) {
            Some(r) => r,
            None => return Ok(false),
        };
        if !expected.contains(&record.status) {
            return Ok(false);
        }
        patch.apply(record);
        Ok(true)
    }

    async fn find_retryable(
        &self,
        max_retries: u32,
        updated_before: i64,
        created_after: i64,
    ) -> Result<Vec<DeliveryRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|r| {
                matches!(r.status, DeliveryStatus::Failed | DeliveryStatus::Undelivered)
                    && r.retry_count < max_retries
                    && r.updated_at <= updated_before
                    && r.created_at >= created_after
            })
            .cloned()
            .collect())
    }

    async fn find_active_by_phone(
        &self,
        tenant_id: &str,
        phone_suffix: &str,
    ) -> Result<Vec<DeliveryRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|r| {
                r.tenant_id == tenant_id
                    && !r.status.is_terminal()
                    && phone::suffix10(&r.phone) == phone_suffix
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl OptOutStore for MemoryStore {
    async fn insert(&self, entry: OptOutEntry) -> Result<bool, StoreError> {
        let key = (entry.tenant_id.clone(), entry.phone_suffix.clone());
        let mut optouts = self.optouts.write();
        if optouts.contains_key(&key) {
            return Ok(false);
        }
        optouts.insert(key, entry);
        Ok(true)
    }

    async fn contains(&self, tenant_id: &str, phone_suffix: &str) -> Result<bool, StoreError> {
        Ok(self
            .optouts
            .read()
            .contains_key(&(tenant_id.to_string(), phone_suffix.to_string())))
    }

    async fn list(&self, tenant_id: &str) -> Result<Vec<OptOutEntry>, StoreError> {
        Ok(self
            .optouts
            .read()
            .values()
            .filter(|e| e.tenant_id == tenant_id)
            .cloned()
            .collect())
    }
}
