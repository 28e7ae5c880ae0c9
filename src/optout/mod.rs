//! Opt-out compliance: inbound keyword detection and the per-tenant registry.
//!
//! The registry is consulted before every send; entries are immutable once
//! created and govern future sends only. Phone comparison uses the last-10
//! digit suffix so "+15550104477" and "555-010-4477" resolve to the same
//! entry.

use std::sync::Arc;

use tracing::info;

use crate::phone;
use crate::store::{DeliveryStore, OptOutEntry, OptOutStore, StoreError};

/// Keywords that constitute an opt-out request, compared after trimming and
/// lowercasing the inbound body. Exact match only: "please stop" is not an
/// opt-out.
pub const OPT_OUT_KEYWORDS: [&str; 6] = ["stop", "stopall", "unsubscribe", "cancel", "end", "quit"];

/// True when an inbound message body is an opt-out request.
pub fn is_opt_out_message(body: &str) -> bool {
    let normalized = body.trim().to_lowercase();
    OPT_OUT_KEYWORDS.iter().any(|k| *k == normalized)
}

/// Durable set of `(tenant, phone)` pairs excluded from sending.
pub struct OptOutRegistry {
    optouts: Arc<dyn OptOutStore>,
    records: Arc<dyn DeliveryStore>,
}

impl OptOutRegistry {
    pub fn new(optouts: Arc<dyn OptOutStore>, records: Arc<dyn DeliveryStore>) -> Self {
        Self { optouts, records }
    }

    /// Exact-match lookup after normalization.
    pub async fn is_opted_out(&self, tenant_id: &str, phone: &str) -> Result<bool, StoreError> {
        self.optouts
            .contains(tenant_id, &phone::suffix10(phone))
            .await
    }

    /// Idempotent insert. `Ok(true)` when a new entry was recorded.
    pub async fn record_opt_out(
        &self,
        tenant_id: &str,
        phone: &str,
        reason: &str,
    ) -> Result<bool, StoreError> {
        let entry = OptOutEntry::new(tenant_id, phone::suffix10(phone), reason);
        let created = self.optouts.insert(entry).await?;
        if created {
            info!(
                tenant_id = %tenant_id,
                phone = %phone::mask(phone),
                reason = %reason,
                "opt-out recorded"
            );
        }
        Ok(created)
    }

    /// Leads in the tenant with a non-terminal record sharing this phone's
    /// 10-digit suffix. Used for cascading cancellation.
    pub async fn find_affected_leads(
        &self,
        tenant_id: &str,
        phone: &str,
    ) -> Result<Vec<String>, StoreError> {
        Ok(self
            .records
            .find_active_by_phone(tenant_id, &phone::suffix10(phone))
            .await?
            .into_iter()
            .map(|r| r.lead_id)
            .collect())
    }

    /// All entries for a tenant (compliance audit view).
    pub async fn list(&self, tenant_id: &str) -> Result<Vec<OptOutEntry>, StoreError> {
        self.optouts.list(tenant_id).await
    }
}
