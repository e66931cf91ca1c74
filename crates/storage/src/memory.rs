//! In-memory [`DataFlowStore`].
//!
//! Suitable for single-process deployments, the one-shot CLI transfer and
//! tests. Several runtimes sharing one `Arc<InMemoryDataFlowStore>` behave
//! exactly like runtimes sharing a database: every operation takes the same
//! lock, so selection and leasing are atomic.
//!
//! ## Limitations
//!
//! - No persistence: all flows are lost when the process exits
//! - No cross-process coordination

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use ferry_core::config::LeaseConfig;
use ferry_core::{Clock, DataFlow, DataFlowState, Lease, SystemClock};
use tracing::debug;

use crate::error::StorageError;
use crate::traits::{DataFlowStore, FlowQuery, LeaseMode, SaveMode};

fn poison_err<T>(_: PoisonError<T>) -> StorageError {
    StorageError::Backend("lock poisoned".to_string())
}

#[derive(Debug)]
pub struct InMemoryDataFlowStore {
    flows: Mutex<HashMap<String, DataFlow>>,
    clock: Arc<dyn Clock>,
    lease: LeaseConfig,
}

impl InMemoryDataFlowStore {
    pub fn new(clock: Arc<dyn Clock>, lease: LeaseConfig) -> Self {
        InMemoryDataFlowStore {
            flows: Mutex::new(HashMap::new()),
            clock,
            lease,
        }
    }

    /// Store driven by wall-clock time.
    pub fn with_lease_config(lease: LeaseConfig) -> Self {
        Self::new(Arc::new(SystemClock), lease)
    }

    pub fn lease_config(&self) -> LeaseConfig {
        self.lease
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, DataFlow>>, StorageError> {
        self.flows.lock().map_err(poison_err)
    }

    fn new_lease(&self, holder: &str, now: i64) -> Lease {
        Lease {
            runtime_id: holder.to_string(),
            leased_at: now,
            lease_expiry: now.saturating_add(self.lease.lease_time().as_millis() as i64),
        }
    }

    fn abandon_ms(&self) -> i64 {
        self.lease.abandon_time().as_millis() as i64
    }

    fn is_available(&self, flow: &DataFlow, holder: &str, now: i64) -> bool {
        flow.lease
            .as_ref()
            .map_or(true, |l| l.is_reclaimable_by(holder, now, self.abandon_ms()))
    }
}

impl Default for InMemoryDataFlowStore {
    fn default() -> Self {
        Self::with_lease_config(LeaseConfig::default())
    }
}

#[async_trait]
impl DataFlowStore for InMemoryDataFlowStore {
    async fn create(&self, flow: DataFlow) -> Result<DataFlow, StorageError> {
        let mut flows = self.lock()?;
        if flows.contains_key(&flow.id) {
            return Err(StorageError::AlreadyExists { flow_id: flow.id });
        }
        let mut stored = flow;
        stored.version = 1;
        stored.lease = None;
        flows.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn find_by_id(&self, flow_id: &str) -> Result<Option<DataFlow>, StorageError> {
        Ok(self.lock()?.get(flow_id).cloned())
    }

    async fn next_not_leased(
        &self,
        holder: &str,
        batch_size: usize,
        query: &FlowQuery,
    ) -> Result<Vec<DataFlow>, StorageError> {
        let mut flows = self.lock()?;
        let now = self.clock.now_millis();

        let mut candidates: Vec<(i64, i64, String)> = flows
            .values()
            .filter(|f| query.matches(f) && self.is_available(f, holder, now))
            .map(|f| (f.state_timestamp, f.created_at, f.id.clone()))
            .collect();
        candidates.sort();
        candidates.truncate(batch_size);

        let mut leased = Vec::with_capacity(candidates.len());
        for (_, _, id) in candidates {
            if let Some(flow) = flows.get_mut(&id) {
                if let Some(previous) = flow.lease.as_ref().filter(|l| l.runtime_id != holder) {
                    debug!(flow_id = %id, previous = %previous.runtime_id, holder, "reclaiming abandoned lease");
                }
                flow.lease = Some(self.new_lease(holder, now));
                flow.runtime_id = Some(holder.to_string());
                leased.push(flow.clone());
            }
        }
        Ok(leased)
    }

    async fn acquire_lease(
        &self,
        holder: &str,
        flow_id: &str,
        mode: LeaseMode,
    ) -> Result<DataFlow, StorageError> {
        let mut flows = self.lock()?;
        let now = self.clock.now_millis();
        let flow = flows.get_mut(flow_id).ok_or_else(|| StorageError::NotFound {
            flow_id: flow_id.to_string(),
        })?;

        if let Some(current) = &flow.lease {
            let live_elsewhere = current.runtime_id != holder
                && !current.is_reclaimable_by(holder, now, self.abandon_ms());
            if live_elsewhere {
                match mode {
                    LeaseMode::Acquire => {
                        return Err(StorageError::AlreadyLeased {
                            flow_id: flow_id.to_string(),
                            holder: current.runtime_id.clone(),
                        })
                    }
                    LeaseMode::Steal => {
                        debug!(flow_id, previous = %current.runtime_id, holder, "stealing lease");
                    }
                }
            }
        }
        flow.lease = Some(self.new_lease(holder, now));
        flow.runtime_id = Some(holder.to_string());
        Ok(flow.clone())
    }

    async fn renew_lease(&self, holder: &str, flow_id: &str) -> Result<(), StorageError> {
        let mut flows = self.lock()?;
        let now = self.clock.now_millis();
        let flow = flows.get_mut(flow_id).ok_or_else(|| StorageError::NotFound {
            flow_id: flow_id.to_string(),
        })?;
        match &flow.lease {
            Some(lease) if lease.runtime_id == holder => {
                flow.lease = Some(self.new_lease(holder, now));
                Ok(())
            }
            _ => Err(StorageError::LeaseLost {
                flow_id: flow_id.to_string(),
            }),
        }
    }

    async fn save(
        &self,
        holder: &str,
        flow: &DataFlow,
        mode: SaveMode,
    ) -> Result<i64, StorageError> {
        let mut flows = self.lock()?;
        let now = self.clock.now_millis();

        let next_version = match flows.get(&flow.id) {
            None if flow.version == 0 => 1,
            None => {
                return Err(StorageError::NotFound {
                    flow_id: flow.id.clone(),
                })
            }
            Some(stored) => {
                if stored.lease_holder().is_some_and(|h| h != holder) {
                    return Err(StorageError::LeaseLost {
                        flow_id: flow.id.clone(),
                    });
                }
                if stored.version != flow.version {
                    return Err(StorageError::ConcurrentConflict {
                        flow_id: flow.id.clone(),
                        expected_version: flow.version,
                    });
                }
                stored.version + 1
            }
        };

        let mut updated = flow.clone();
        updated.version = next_version;
        updated.runtime_id = Some(holder.to_string());
        updated.lease = match mode {
            SaveMode::ReleaseLease => None,
            SaveMode::RetainLease => Some(self.new_lease(holder, now)),
        };
        flows.insert(updated.id.clone(), updated);
        Ok(next_version)
    }

    async fn release_lease(&self, holder: &str, flow_id: &str) -> Result<(), StorageError> {
        let mut flows = self.lock()?;
        if let Some(flow) = flows.get_mut(flow_id) {
            if flow.lease_holder() == Some(holder) {
                flow.lease = None;
            }
        }
        Ok(())
    }

    async fn release_leases_held_by(&self, holder: &str) -> Result<usize, StorageError> {
        let mut flows = self.lock()?;
        let mut released = 0;
        for flow in flows.values_mut() {
            if flow.lease_holder() == Some(holder) {
                flow.lease = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn query(
        &self,
        state: Option<DataFlowState>,
        limit: usize,
    ) -> Result<Vec<DataFlow>, StorageError> {
        let flows = self.lock()?;
        let mut matching: Vec<DataFlow> = flows
            .values()
            .filter(|f| state.map_or(true, |s| f.state == s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            (a.state_timestamp, a.created_at, &a.id).cmp(&(b.state_timestamp, b.created_at, &b.id))
        });
        if limit > 0 {
            matching.truncate(limit);
        }
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::{DataAddress, FlowType, ManualClock, TransferType};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn flow(id: &str, ts: i64) -> DataFlow {
        let mut flow = DataFlow::from_start_message(
            id.to_string(),
            ferry_core::DataFlowStartMessage {
                flow_id: None,
                process_id: format!("proc-{id}"),
                agreement_id: None,
                asset_id: None,
                source: DataAddress::new("Memory"),
                destination: None,
                transfer_type: TransferType::new("Memory", FlowType::Push),
                callback_address: None,
                properties: BTreeMap::new(),
                trace_context: BTreeMap::new(),
            },
            ts,
        );
        flow.state_timestamp = ts;
        flow
    }

    fn store(clock: Arc<ManualClock>) -> InMemoryDataFlowStore {
        InMemoryDataFlowStore::new(clock, LeaseConfig::new(Duration::from_millis(100), 3))
    }

    #[tokio::test]
    async fn holder_reacquires_after_expiry_others_after_abandon() {
        let clock = Arc::new(ManualClock::new(0));
        let store = store(clock.clone());
        store.create(flow("f1", 0)).await.unwrap();
        let q = FlowQuery::in_state(DataFlowState::Received);

        assert_eq!(store.next_not_leased("a", 10, &q).await.unwrap().len(), 1);
        clock.advance(Duration::from_millis(100));
        assert!(store.next_not_leased("b", 10, &q).await.unwrap().is_empty());
        let again = store.next_not_leased("a", 10, &q).await.unwrap();
        assert_eq!(again.len(), 1);

        // a re-leased at 100; b may reclaim at 100 + 300.
        clock.set(399);
        assert!(store.next_not_leased("b", 10, &q).await.unwrap().is_empty());
        clock.set(400);
        let stolen = store.next_not_leased("b", 10, &q).await.unwrap();
        assert_eq!(stolen[0].lease_holder(), Some("b"));
    }

    #[tokio::test]
    async fn lease_operations_do_not_bump_version() {
        let clock = Arc::new(ManualClock::new(0));
        let store = store(clock);
        store.create(flow("f1", 0)).await.unwrap();
        let leased = store
            .acquire_lease("a", "f1", LeaseMode::Acquire)
            .await
            .unwrap();
        store.renew_lease("a", "f1").await.unwrap();
        assert_eq!(leased.version, 1);
        assert_eq!(store.save("a", &leased, SaveMode::RetainLease).await.unwrap(), 2);
        let stored = store.find_by_id("f1").await.unwrap().unwrap();
        assert_eq!(stored.lease_holder(), Some("a"));
    }

    #[tokio::test]
    async fn query_filters_and_limits() {
        let clock = Arc::new(ManualClock::new(0));
        let store = store(clock);
        for (i, id) in ["c", "a", "b"].iter().enumerate() {
            store.create(flow(id, 10 - i as i64)).await.unwrap();
        }
        let all = store.query(None, 0).await.unwrap();
        let ids: Vec<&str> = all.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
        assert_eq!(store.query(None, 2).await.unwrap().len(), 2);
        assert!(store
            .query(Some(DataFlowState::Started), 0)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn release_leases_held_by_only_touches_holder() {
        let clock = Arc::new(ManualClock::new(0));
        let store = store(clock);
        store.create(flow("f1", 0)).await.unwrap();
        store.create(flow("f2", 1)).await.unwrap();
        store.acquire_lease("a", "f1", LeaseMode::Acquire).await.unwrap();
        store.acquire_lease("b", "f2", LeaseMode::Acquire).await.unwrap();
        assert_eq!(store.release_leases_held_by("a").await.unwrap(), 1);
        let f2 = store.find_by_id("f2").await.unwrap().unwrap();
        assert_eq!(f2.lease_holder(), Some("b"));
    }
}
