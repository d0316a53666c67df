//! In-process reference implementation of the catalog store.
//!
//! Backs the gateway in tests and single-node deployments. Service rows
//! live in a [`DashMap`]; the aggregate update in
//! [`apply_call_outcome`](CatalogStore::apply_call_outcome) mutates the
//! row under its entry lock, which serializes concurrent updates to the
//! same service while leaving different services fully parallel.

use std::sync::RwLock;

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use super::{
    CallLog, Caller, CatalogStore, ListOptions, OwnerStats, Service, ServiceSort, StoreError,
};

/// In-memory catalog store.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    services: DashMap<Uuid, Service>,
    /// Service ids in insertion order; ranking tie-breaks and `Newest`
    /// listings depend on it.
    service_order: RwLock<Vec<Uuid>>,
    /// Append-only call log, oldest first.
    calls: RwLock<Vec<CallLog>>,
    callers: DashMap<Uuid, Caller>,
    key_index: DashMap<String, Uuid>,
}

impl MemoryCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn ordered_services(&self) -> Vec<Service> {
        let order = self
            .service_order
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        order
            .iter()
            .filter_map(|id| self.services.get(id).map(|r| r.value().clone()))
            .collect()
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn service(&self, id: Uuid) -> Result<Option<Service>, StoreError> {
        Ok(self.services.get(&id).map(|r| r.value().clone()))
    }

    async fn active_services(&self) -> Result<Vec<Service>, StoreError> {
        Ok(self
            .ordered_services()
            .into_iter()
            .filter(|s| s.is_active)
            .collect())
    }

    async fn list_services(&self, opts: ListOptions) -> Result<Vec<Service>, StoreError> {
        let mut rows: Vec<Service> = self
            .ordered_services()
            .into_iter()
            .filter(|s| {
                s.is_active
                    && opts.category.is_none_or(|c| s.category == c)
                    && opts.kind.is_none_or(|k| s.kind == k)
                    && opts.owner_id.is_none_or(|o| s.owner_id == Some(o))
            })
            .collect();

        match opts.sort {
            ServiceSort::Newest => rows.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
            ServiceSort::Popular => {
                rows.sort_by(|a, b| b.stats.total_calls.cmp(&a.stats.total_calls));
            }
            ServiceSort::Cheapest => rows.sort_by(|a, b| a.price.cmp(&b.price)),
        }

        Ok(rows.into_iter().skip(opts.offset).take(opts.limit).collect())
    }

    async fn insert_service(&self, service: Service) -> Result<(), StoreError> {
        let id = service.id;
        self.services.insert(id, service);
        self.service_order
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(id);
        Ok(())
    }

    async fn apply_call_outcome(
        &self,
        id: Uuid,
        success: bool,
        latency_ms: u64,
    ) -> Result<(), StoreError> {
        // get_mut holds the shard write lock: the read-modify-write of the
        // three aggregate fields cannot interleave for one service.
        let mut row = self.services.get_mut(&id).ok_or(StoreError::RowNotFound(id))?;
        row.stats.absorb(success, latency_ms);
        row.updated_at = super::now_millis();
        Ok(())
    }

    async fn append_call(&self, log: CallLog) -> Result<(), StoreError> {
        self.calls
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(log);
        Ok(())
    }

    async fn recent_calls(&self, limit: usize) -> Result<Vec<CallLog>, StoreError> {
        let calls = self
            .calls
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(calls.iter().rev().take(limit).cloned().collect())
    }

    async fn calls_for_service(&self, id: Uuid, limit: usize) -> Result<Vec<CallLog>, StoreError> {
        let calls = self
            .calls
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(calls
            .iter()
            .rev()
            .filter(|c| c.service_id == id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn calls_for_caller(&self, id: Uuid, limit: usize) -> Result<Vec<CallLog>, StoreError> {
        let calls = self
            .calls
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(calls
            .iter()
            .rev()
            .filter(|c| c.caller_id == Some(id))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn owner_stats(&self, owner_id: Uuid) -> Result<OwnerStats, StoreError> {
        let mut stats = OwnerStats::default();
        let owned: Vec<Uuid> = self
            .services
            .iter()
            .filter(|s| s.owner_id == Some(owner_id))
            .map(|s| {
                stats.total_services += 1;
                stats.total_calls += s.stats.total_calls;
                s.id
            })
            .collect();

        let calls = self
            .calls
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let earned: u64 = calls
            .iter()
            .filter(|c| owned.contains(&c.service_id))
            .map(|c| c.cost.as_micros())
            .sum();
        stats.total_earnings = stoa_proto::UsdcAmount::from_micros(earned);
        Ok(stats)
    }

    async fn caller_by_key_hash(&self, key_hash: &str) -> Result<Option<Caller>, StoreError> {
        Ok(self
            .key_index
            .get(key_hash)
            .and_then(|id| self.callers.get(&id).map(|r| r.value().clone())))
    }

    async fn insert_caller(&self, caller: Caller) -> Result<(), StoreError> {
        self.key_index.insert(caller.api_key_hash.clone(), caller.id);
        self.callers.insert(caller.id, caller);
        Ok(())
    }
}
