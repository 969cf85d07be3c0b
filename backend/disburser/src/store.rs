//! Grant persistence port and its in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use crate::errors::{DisburserError, Result};
use crate::grant::{Disbursement, DisbursementStatus, GrantState, PoolGrant};

/// Mutation applied to a record inside [`GrantStore::compare_and_transition`].
pub type GrantMutation<'a> = Box<dyn FnOnce(&mut PoolGrant) -> Result<()> + Send + 'a>;

/// Outcome of [`GrantStore::reserve_disbursement`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// Amount newly counted against the pool.
    Fresh(Disbursement),
    /// A disbursement with this transaction id was already recorded.
    Existing(Disbursement),
}

/// Durable per-pool grant state.
///
/// Writes to one pool are serialized; writes to different pools never wait
/// on each other. A call returns only after its write is committed.
#[async_trait]
pub trait GrantStore: Send + Sync {
    async fn get(&self, pool_id: &str) -> Result<Option<PoolGrant>>;

    /// Create the record, or replace one whose lifecycle ended
    /// (`Expired`/`Failed`). Any other existing record is a conflict.
    async fn put(&self, grant: &PoolGrant) -> Result<PoolGrant>;

    /// Apply `mutation` if the record is still in `expected` state.
    async fn compare_and_transition(
        &self,
        pool_id: &str,
        expected: GrantState,
        operation: &'static str,
        mutation: GrantMutation<'_>,
    ) -> Result<PoolGrant>;

    /// Count `disbursement.amount` against the pool unless that would take
    /// the pool's total past `limit`. Idempotent per transaction id.
    async fn reserve_disbursement(
        &self,
        disbursement: &Disbursement,
        limit: u64,
    ) -> Result<Reservation>;

    /// Checkpoint progress of an already reserved disbursement.
    async fn update_disbursement(&self, disbursement: &Disbursement) -> Result<()>;

    /// Drop a reservation that never reached the value-moving step.
    async fn release_disbursement(&self, pool_id: &str, transaction_id: &str) -> Result<()>;

    /// Sum of all reserved, in-flight and completed disbursements.
    async fn disbursed_total(&self, pool_id: &str) -> Result<u64>;

    /// Like [`GrantStore::get`], with a missing record as an error.
    async fn load(&self, pool_id: &str) -> Result<PoolGrant> {
        self.get(pool_id)
            .await?
            .ok_or_else(|| DisburserError::NotFound {
                pool_id: pool_id.to_string(),
            })
    }
}

struct PoolEntry {
    grant: PoolGrant,
    disbursements: HashMap<String, Disbursement>,
}

impl PoolEntry {
    fn disbursed(&self) -> u64 {
        self.disbursements.values().map(|d| d.amount).sum()
    }
}

/// A thread-safe in-memory grant store.
///
/// Each pool sits behind its own mutex; the outer map is only write-locked
/// when a pool is first created. Ideal for tests, loses everything on exit.
#[derive(Default, Clone)]
pub struct InMemoryGrantStore {
    pools: Arc<RwLock<HashMap<String, Arc<Mutex<PoolEntry>>>>>,
}

impl InMemoryGrantStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, pool_id: &str) -> Result<Arc<Mutex<PoolEntry>>> {
        self.pools
            .read()
            .await
            .get(pool_id)
            .cloned()
            .ok_or_else(|| DisburserError::NotFound {
                pool_id: pool_id.to_string(),
            })
    }
}

#[async_trait]
impl GrantStore for InMemoryGrantStore {
    async fn get(&self, pool_id: &str) -> Result<Option<PoolGrant>> {
        let entry = match self.pools.read().await.get(pool_id) {
            Some(entry) => entry.clone(),
            None => return Ok(None),
        };
        let entry = entry.lock().await;
        Ok(Some(entry.grant.clone()))
    }

    async fn put(&self, grant: &PoolGrant) -> Result<PoolGrant> {
        let mut stored = grant.clone();
        stored.version = 1;

        let existing = {
            let mut pools = self.pools.write().await;
            match pools.get(&grant.pool_id) {
                Some(entry) => entry.clone(),
                None => {
                    pools.insert(
                        grant.pool_id.clone(),
                        Arc::new(Mutex::new(PoolEntry {
                            grant: stored.clone(),
                            disbursements: HashMap::new(),
                        })),
                    );
                    return Ok(stored);
                }
            }
        };

        let mut entry = existing.lock().await;
        if !entry.grant.state.is_terminal() {
            return Err(DisburserError::StateConflict {
                pool_id: grant.pool_id.clone(),
                state: entry.grant.state,
                operation: "request a new pool grant",
            });
        }
        stored.version = entry.grant.version + 1;
        entry.grant = stored.clone();
        entry.disbursements.clear();
        Ok(stored)
    }

    async fn compare_and_transition(
        &self,
        pool_id: &str,
        expected: GrantState,
        operation: &'static str,
        mutation: GrantMutation<'_>,
    ) -> Result<PoolGrant> {
        let entry = self.entry(pool_id).await?;
        let mut entry = entry.lock().await;
        if entry.grant.state != expected {
            return Err(DisburserError::StateConflict {
                pool_id: pool_id.to_string(),
                state: entry.grant.state,
                operation,
            });
        }

        // Mutate a copy so a rejected mutation leaves the record untouched.
        let mut next = entry.grant.clone();
        mutation(&mut next)?;
        next.version = entry.grant.version + 1;
        entry.grant = next.clone();
        Ok(next)
    }

    async fn reserve_disbursement(
        &self,
        disbursement: &Disbursement,
        limit: u64,
    ) -> Result<Reservation> {
        let entry = self.entry(&disbursement.pool_id).await?;
        let mut entry = entry.lock().await;

        if let Some(existing) = entry.disbursements.get(&disbursement.transaction_id) {
            return Ok(Reservation::Existing(existing.clone()));
        }

        let disbursed = entry.disbursed();
        let remaining = limit.saturating_sub(disbursed);
        if disbursement.amount > remaining {
            return Err(DisburserError::ExhaustedGrant {
                pool_id: disbursement.pool_id.clone(),
                requested: disbursement.amount,
                remaining,
            });
        }

        entry
            .disbursements
            .insert(disbursement.transaction_id.clone(), disbursement.clone());
        Ok(Reservation::Fresh(disbursement.clone()))
    }

    async fn update_disbursement(&self, disbursement: &Disbursement) -> Result<()> {
        let entry = self.entry(&disbursement.pool_id).await?;
        let mut entry = entry.lock().await;
        match entry.disbursements.get_mut(&disbursement.transaction_id) {
            Some(slot) => {
                *slot = disbursement.clone();
                Ok(())
            }
            None => Err(DisburserError::Conflict {
                pool_id: disbursement.pool_id.clone(),
            }),
        }
    }

    async fn release_disbursement(&self, pool_id: &str, transaction_id: &str) -> Result<()> {
        let entry = self.entry(pool_id).await?;
        let mut entry = entry.lock().await;
        if entry
            .disbursements
            .get(transaction_id)
            .is_some_and(|d| d.status != DisbursementStatus::Completed)
        {
            entry.disbursements.remove(transaction_id);
        }
        Ok(())
    }

    async fn disbursed_total(&self, pool_id: &str) -> Result<u64> {
        let entry = self.entry(pool_id).await?;
        let entry = entry.lock().await;
        Ok(entry.disbursed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{pending_grant, sample_grant};

    #[tokio::test]
    async fn test_put_and_get() {
        let store = InMemoryGrantStore::new();
        assert!(store.get("P1").await.unwrap().is_none());

        store.put(&sample_grant("P1")).await.unwrap();
        let loaded = store.load("P1").await.unwrap();
        assert_eq!(loaded.state, GrantState::Requested);
        assert_eq!(loaded.version, 1);

        let err = store.load("P2").await.unwrap_err();
        assert!(matches!(err, DisburserError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_put_refuses_live_record() {
        let store = InMemoryGrantStore::new();
        store.put(&sample_grant("P1")).await.unwrap();
        let err = store.put(&sample_grant("P1")).await.unwrap_err();
        assert!(matches!(err, DisburserError::StateConflict { .. }));
    }

    #[tokio::test]
    async fn test_put_replaces_ended_record() {
        let store = InMemoryGrantStore::new();
        store.put(&sample_grant("P1")).await.unwrap();
        store
            .compare_and_transition(
                "P1",
                GrantState::Requested,
                "fail",
                Box::new(|g: &mut PoolGrant| g.advance(GrantState::Failed, "fail")),
            )
            .await
            .unwrap();

        let replaced = store.put(&sample_grant("P1")).await.unwrap();
        assert_eq!(replaced.state, GrantState::Requested);
        assert_eq!(replaced.version, 3);
    }

    #[tokio::test]
    async fn test_compare_and_transition_rejects_stale_state() {
        let store = InMemoryGrantStore::new();
        store.put(&pending_grant("P1")).await.unwrap();

        let updated = store
            .compare_and_transition(
                "P1",
                GrantState::PendingAuth,
                "complete interaction",
                Box::new(|g: &mut PoolGrant| g.record_interaction("abc123".into())),
            )
            .await
            .unwrap();
        assert_eq!(updated.state, GrantState::Authorized);

        let err = store
            .compare_and_transition(
                "P1",
                GrantState::PendingAuth,
                "complete interaction",
                Box::new(|g: &mut PoolGrant| g.record_interaction("other".into())),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DisburserError::StateConflict {
                state: GrantState::Authorized,
                ..
            }
        ));
        let stored = store.load("P1").await.unwrap();
        assert_eq!(stored.interaction_correlator.as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn test_failed_mutation_leaves_record_untouched() {
        let store = InMemoryGrantStore::new();
        store.put(&sample_grant("P1")).await.unwrap();

        let err = store
            .compare_and_transition(
                "P1",
                GrantState::Requested,
                "complete interaction",
                Box::new(|g: &mut PoolGrant| {
                    g.redirect_uri = Some("https://mutated.example".into());
                    g.record_interaction("abc123".into())
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DisburserError::StateConflict { .. }));

        let stored = store.load("P1").await.unwrap();
        assert!(stored.redirect_uri.is_none());
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn test_reservations_respect_limit() {
        let store = InMemoryGrantStore::new();
        store.put(&sample_grant("P1")).await.unwrap();

        let first = Disbursement::reserve("P1", "TX1", "w1", None, 60);
        assert!(matches!(
            store.reserve_disbursement(&first, 100).await.unwrap(),
            Reservation::Fresh(_)
        ));

        let again = store.reserve_disbursement(&first, 100).await.unwrap();
        assert_eq!(again, Reservation::Existing(first.clone()));

        let second = Disbursement::reserve("P1", "TX2", "w2", None, 50);
        let err = store.reserve_disbursement(&second, 100).await.unwrap_err();
        assert!(matches!(
            err,
            DisburserError::ExhaustedGrant { remaining: 40, .. }
        ));

        store.release_disbursement("P1", "TX1").await.unwrap();
        assert_eq!(store.disbursed_total("P1").await.unwrap(), 0);
        assert!(store.reserve_disbursement(&second, 100).await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_reservations_never_overspend() {
        let store = InMemoryGrantStore::new();
        store.put(&sample_grant("P1")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let d = Disbursement::reserve("P1", format!("TX{i}"), "w", None, 10);
                store.reserve_disbursement(&d, 100).await
            }));
        }

        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 10);
        assert_eq!(store.disbursed_total("P1").await.unwrap(), 100);
    }
}
