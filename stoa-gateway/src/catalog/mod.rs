//! Catalog data model and storage port.
//!
//! The catalog is owned by the storage layer; the pipeline reads it and
//! touches exactly three fields per call through
//! [`CatalogStore::apply_call_outcome`]. Call logs are append-only: rows
//! are created once by the metrics recorder and never mutated again, so
//! they stay usable as an audit trail for billing disputes.

mod memory;

pub use memory::MemoryCatalog;

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stoa_proto::UsdcAmount;
use uuid::Uuid;

/// Milliseconds since the Unix epoch.
///
/// # Panics
///
/// Panics if the system clock is set before the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_millis() as u64
}

/// Marketplace category a service is listed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Medical,
    Finance,
    Legal,
    Code,
    Data,
    Creative,
    Research,
    Security,
    Agriculture,
    Other,
}

impl Category {
    /// All valid category names, for error messages.
    pub const ALL: [&'static str; 10] = [
        "medical",
        "finance",
        "legal",
        "code",
        "data",
        "creative",
        "research",
        "security",
        "agriculture",
        "other",
    ];
}

impl FromStr for Category {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "medical" => Ok(Self::Medical),
            "finance" => Ok(Self::Finance),
            "legal" => Ok(Self::Legal),
            "code" => Ok(Self::Code),
            "data" => Ok(Self::Data),
            "creative" => Ok(Self::Creative),
            "research" => Ok(Self::Research),
            "security" => Ok(Self::Security),
            "agriculture" => Ok(Self::Agriculture),
            "other" => Ok(Self::Other),
            _ => Err(UnknownVariant("category")),
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Medical => "medical",
            Self::Finance => "finance",
            Self::Legal => "legal",
            Self::Code => "code",
            Self::Data => "data",
            Self::Creative => "creative",
            Self::Research => "research",
            Self::Security => "security",
            Self::Agriculture => "agriculture",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// What kind of callable a service is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceKind {
    MlModel,
    AiAgent,
    ApiTool,
    DataFeed,
    Workflow,
}

impl ServiceKind {
    /// All valid kind names, for error messages.
    pub const ALL: [&'static str; 5] =
        ["ml-model", "ai-agent", "api-tool", "data-feed", "workflow"];
}

impl FromStr for ServiceKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ml-model" => Ok(Self::MlModel),
            "ai-agent" => Ok(Self::AiAgent),
            "api-tool" => Ok(Self::ApiTool),
            "data-feed" => Ok(Self::DataFeed),
            "workflow" => Ok(Self::Workflow),
            _ => Err(UnknownVariant("service kind")),
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MlModel => "ml-model",
            Self::AiAgent => "ai-agent",
            Self::ApiTool => "api-tool",
            Self::DataFeed => "data-feed",
            Self::Workflow => "workflow",
        };
        f.write_str(name)
    }
}

/// A string did not name a member of an enumerated set.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("unknown {0}")]
pub struct UnknownVariant(pub &'static str);

/// Rolling aggregate statistics for one service.
///
/// Updated incrementally after every call; the update is atomic per
/// service row (see [`CatalogStore::apply_call_outcome`]).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStats {
    /// Total dispatch attempts recorded.
    pub total_calls: u64,
    /// Fraction of successful calls, in `[0, 1]`.
    pub success_rate: f64,
    /// Mean dispatch latency in milliseconds.
    pub avg_latency_ms: f64,
}

impl Default for ServiceStats {
    fn default() -> Self {
        Self {
            total_calls: 0,
            success_rate: 1.0,
            avg_latency_ms: 0.0,
        }
    }
}

impl ServiceStats {
    /// Folds one call outcome into the aggregates using the pre-update
    /// values, avoiding drift.
    pub fn absorb(&mut self, success: bool, latency_ms: u64) {
        let prior = self.total_calls as f64;
        let next = prior + 1.0;
        let hit = if success { 1.0 } else { 0.0 };
        self.success_rate = (self.success_rate * prior + hit) / next;
        self.avg_latency_ms = (self.avg_latency_ms * prior + latency_ms as f64) / next;
        self.total_calls += 1;
    }
}

/// A catalog entry for one machine-callable service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    /// Row id.
    pub id: Uuid,
    /// Wallet address payments for this service settle to.
    pub owner_address: String,
    /// Owning caller, when the service is linked to an account.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<Uuid>,
    /// Display name.
    pub name: String,
    /// What the service does.
    pub description: String,
    /// Capability tags used for embedding and display.
    pub capabilities: Vec<String>,
    /// Marketplace category.
    pub category: Category,
    /// Kind of callable.
    pub kind: ServiceKind,
    /// Price per call in micro-USDC. Zero means the service is free.
    pub price: UsdcAmount,
    /// Provider endpoint the gateway dispatches to.
    pub endpoint_url: String,
    /// JSON schema of the expected input payload.
    pub input_schema: Value,
    /// JSON schema of the produced output.
    pub output_schema: Value,
    /// Embedding of name + description + capabilities. A vector whose
    /// length differs from the configured dimension is unusable for
    /// ranking and is skipped by the query ranker.
    #[serde(skip_serializing, default)]
    pub embedding: Vec<f32>,
    /// Rolling aggregates.
    #[serde(flatten)]
    pub stats: ServiceStats,
    /// Whether the service is listed and callable.
    pub is_active: bool,
    /// Creation time, epoch milliseconds.
    pub created_at: u64,
    /// Last update time, epoch milliseconds.
    pub updated_at: u64,
}

/// One dispatch attempt, append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallLog {
    /// Row id.
    pub id: Uuid,
    /// The service that was called.
    pub service_id: Uuid,
    /// Resolved caller account, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_id: Option<Uuid>,
    /// Paying address, or a marker like `"free"` for unpriced calls.
    pub caller_address: String,
    /// Amount actually charged.
    pub cost: UsdcAmount,
    /// Whether the provider answered successfully.
    pub success: bool,
    /// Observed dispatch latency in milliseconds.
    pub latency_ms: u64,
    /// Settlement transaction hash, when payment settled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    /// Failure detail, when the call failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Creation time, epoch milliseconds.
    pub created_at: u64,
}

/// A resolved caller identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Caller {
    /// Row id.
    pub id: Uuid,
    /// Display name, if set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Wallet address used to pay for calls, if provisioned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet_address: Option<String>,
    /// SHA-256 hex digest of the caller's API key. The raw key is never
    /// stored.
    #[serde(skip_serializing, default)]
    pub api_key_hash: String,
}

/// Aggregate earnings for one owning caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerStats {
    /// Number of services the owner lists.
    pub total_services: u64,
    /// Calls recorded across those services.
    pub total_calls: u64,
    /// Summed charges across those calls, micro-USDC.
    pub total_earnings: UsdcAmount,
}

/// Sort orders for service listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceSort {
    /// Most recently registered first.
    #[default]
    Newest,
    /// Most called first.
    Popular,
    /// Lowest price first.
    Cheapest,
}

/// Filters and paging for service listings.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListOptions {
    /// Restrict to one category.
    pub category: Option<Category>,
    /// Restrict to one kind.
    pub kind: Option<ServiceKind>,
    /// Restrict to one owner.
    pub owner_id: Option<Uuid>,
    /// Sort order.
    pub sort: ServiceSort,
    /// Maximum rows returned.
    pub limit: usize,
    /// Rows skipped before the first returned one.
    pub offset: usize,
}

/// Storage-layer failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The referenced row does not exist.
    #[error("row not found: {0}")]
    RowNotFound(Uuid),
    /// The backing store could not be reached or answered out of contract.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Storage port for the catalog.
///
/// Implementations must make [`apply_call_outcome`](Self::apply_call_outcome)
/// atomic per service row: concurrent calls to the same service must not
/// interleave the read and write of the three aggregate fields. Durable
/// implementations typically use a per-row atomic `UPDATE` or
/// compare-and-retry; the in-process [`MemoryCatalog`] mutates the row
/// under its map entry lock.
#[async_trait]
pub trait CatalogStore: Send + Sync + 'static {
    /// Reads one service by id.
    async fn service(&self, id: Uuid) -> Result<Option<Service>, StoreError>;

    /// Returns all active services in insertion order.
    async fn active_services(&self) -> Result<Vec<Service>, StoreError>;

    /// Returns active services matching `opts`.
    async fn list_services(&self, opts: ListOptions) -> Result<Vec<Service>, StoreError>;

    /// Inserts a new service row.
    async fn insert_service(&self, service: Service) -> Result<(), StoreError>;

    /// Atomically folds one call outcome into a service's aggregates.
    async fn apply_call_outcome(
        &self,
        id: Uuid,
        success: bool,
        latency_ms: u64,
    ) -> Result<(), StoreError>;

    /// Appends one immutable call log row.
    async fn append_call(&self, log: CallLog) -> Result<(), StoreError>;

    /// Most recent calls globally, newest first.
    async fn recent_calls(&self, limit: usize) -> Result<Vec<CallLog>, StoreError>;

    /// Most recent calls for one service, newest first.
    async fn calls_for_service(&self, id: Uuid, limit: usize) -> Result<Vec<CallLog>, StoreError>;

    /// Most recent calls for one caller, newest first.
    async fn calls_for_caller(&self, id: Uuid, limit: usize) -> Result<Vec<CallLog>, StoreError>;

    /// Aggregate earnings and call counts over one owner's services.
    async fn owner_stats(&self, owner_id: Uuid) -> Result<OwnerStats, StoreError>;

    /// Resolves a caller by API-key hash.
    async fn caller_by_key_hash(&self, key_hash: &str) -> Result<Option<Caller>, StoreError>;

    /// Inserts a caller row.
    async fn insert_caller(&self, caller: Caller) -> Result<(), StoreError>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_absorb_matches_fraction() {
        let mut stats = ServiceStats::default();
        let outcomes = [true, true, false, true, false, false, true, true];
        for (i, &ok) in outcomes.iter().enumerate() {
            stats.absorb(ok, (i as u64 + 1) * 100);
        }
        assert_eq!(stats.total_calls, 8);
        let expected = outcomes.iter().filter(|&&b| b).count() as f64 / 8.0;
        assert!((stats.success_rate - expected).abs() < 1e-9);
        let expected_latency = (1..=8).map(|i| i as f64 * 100.0).sum::<f64>() / 8.0;
        assert!((stats.avg_latency_ms - expected_latency).abs() < 1e-9);
    }

    #[test]
    fn first_call_overrides_the_optimistic_default() {
        let mut stats = ServiceStats::default();
        stats.absorb(false, 250);
        assert_eq!(stats.total_calls, 1);
        assert!((stats.success_rate - 0.0).abs() < 1e-9);
        assert!((stats.avg_latency_ms - 250.0).abs() < 1e-9);
    }

    #[test]
    fn enums_parse_and_display() {
        assert_eq!("medical".parse::<Category>().unwrap(), Category::Medical);
        assert_eq!(Category::Medical.to_string(), "medical");
        assert!("astrology".parse::<Category>().is_err());
        assert_eq!(
            "ml-model".parse::<ServiceKind>().unwrap(),
            ServiceKind::MlModel
        );
        assert!("human".parse::<ServiceKind>().is_err());
    }
}
