//! Call log recorder and read paths.
//!
//! Appends one immutable [`CallLog`] row per dispatch attempt and folds
//! the outcome into the service's rolling aggregates, in that order, both
//! after dispatch. The aggregate update is delegated to the store's
//! per-row atomic [`CatalogStore::apply_call_outcome`].

use std::sync::Arc;

use serde::Serialize;
use stoa_proto::UsdcAmount;
use uuid::Uuid;

use crate::catalog::{CallLog, CatalogStore, OwnerStats, StoreError, now_millis};

/// Upper bound on rows returned by any read path.
pub const MAX_ROWS: usize = 50;

/// Everything known about one finished dispatch attempt.
#[derive(Debug, Clone)]
pub struct CallRecord {
    /// The service that was called.
    pub service_id: Uuid,
    /// Resolved caller account, when known.
    pub caller_id: Option<Uuid>,
    /// Paying address, or `"free"` for unpriced calls.
    pub caller_address: String,
    /// Amount actually charged.
    pub cost: UsdcAmount,
    /// Whether the provider answered successfully.
    pub success: bool,
    /// Observed dispatch latency in milliseconds.
    pub latency_ms: u64,
    /// Settlement reference, when payment settled. A settled-but-failed
    /// call keeps its hash here for manual reconciliation.
    pub tx_hash: Option<String>,
    /// Failure detail, when the call failed.
    pub error_message: Option<String>,
}

/// One row of the public activity feed, enriched for display.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    /// Call log row id.
    pub id: Uuid,
    /// The called service.
    pub service_id: Uuid,
    /// Service display name, `"Unknown"` if the row disappeared.
    pub service_name: String,
    /// Paying address.
    pub caller_address: String,
    /// Amount charged, in USDC.
    pub cost_usdc: rust_decimal::Decimal,
    /// Whether the call succeeded.
    pub success: bool,
    /// Dispatch latency in milliseconds.
    pub latency_ms: u64,
    /// Settlement transaction hash, if settled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    /// Block-explorer URL for the settlement, if settled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explorer_url: Option<String>,
    /// Creation time, epoch milliseconds.
    pub created_at: u64,
}

/// Records call outcomes and serves the call-log read paths.
pub struct MetricsRecorder {
    store: Arc<dyn CatalogStore>,
    explorer_tx_base: String,
}

impl std::fmt::Debug for MetricsRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRecorder")
            .field("explorer_tx_base", &self.explorer_tx_base)
            .finish()
    }
}

impl MetricsRecorder {
    /// Creates a recorder over the given store.
    pub fn new(store: Arc<dyn CatalogStore>, explorer_tx_base: impl Into<String>) -> Self {
        Self {
            store,
            explorer_tx_base: explorer_tx_base.into(),
        }
    }

    /// Block-explorer URL for a settlement transaction.
    #[must_use]
    pub fn explorer_url(&self, tx_hash: &str) -> String {
        format!("{}{tx_hash}", self.explorer_tx_base)
    }

    /// Appends the call log row, then updates the service aggregates.
    ///
    /// The row is written first: if the aggregate update fails, the audit
    /// trail still has the attempt.
    ///
    /// # Errors
    ///
    /// Returns the store's error; the caller logs and proceeds, since a
    /// recording failure must not turn a delivered call into an error.
    pub async fn record(&self, record: CallRecord) -> Result<(), StoreError> {
        let log = CallLog {
            id: Uuid::new_v4(),
            service_id: record.service_id,
            caller_id: record.caller_id,
            caller_address: record.caller_address,
            cost: record.cost,
            success: record.success,
            latency_ms: record.latency_ms,
            tx_hash: record.tx_hash,
            error_message: record.error_message,
            created_at: now_millis(),
        };
        self.store.append_call(log).await?;
        self.store
            .apply_call_outcome(record.service_id, record.success, record.latency_ms)
            .await
    }

    /// Most recent calls globally, enriched, capped at [`MAX_ROWS`].
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub async fn recent_activity(&self, limit: usize) -> Result<Vec<ActivityEntry>, StoreError> {
        let limit = limit.clamp(1, MAX_ROWS);
        let calls = self.store.recent_calls(limit).await?;

        let mut entries = Vec::with_capacity(calls.len());
        for call in calls {
            let service_name = self
                .store
                .service(call.service_id)
                .await?
                .map_or_else(|| "Unknown".to_owned(), |s| s.name);
            let explorer_url = call.tx_hash.as_deref().map(|tx| self.explorer_url(tx));
            entries.push(ActivityEntry {
                id: call.id,
                service_id: call.service_id,
                service_name,
                caller_address: call.caller_address,
                cost_usdc: call.cost.to_decimal(),
                success: call.success,
                latency_ms: call.latency_ms,
                tx_hash: call.tx_hash,
                explorer_url,
                created_at: call.created_at,
            });
        }
        Ok(entries)
    }

    /// Most recent calls for one service, capped at [`MAX_ROWS`].
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub async fn service_calls(
        &self,
        service_id: Uuid,
        limit: usize,
    ) -> Result<Vec<CallLog>, StoreError> {
        self.store
            .calls_for_service(service_id, limit.clamp(1, MAX_ROWS))
            .await
    }

    /// Most recent calls for one caller, capped at [`MAX_ROWS`].
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub async fn caller_calls(
        &self,
        caller_id: Uuid,
        limit: usize,
    ) -> Result<Vec<CallLog>, StoreError> {
        self.store
            .calls_for_caller(caller_id, limit.clamp(1, MAX_ROWS))
            .await
    }

    /// Aggregate earnings and call counts for one owning caller.
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub async fn owner_stats(&self, owner_id: Uuid) -> Result<OwnerStats, StoreError> {
        self.store.owner_stats(owner_id).await
    }
}
