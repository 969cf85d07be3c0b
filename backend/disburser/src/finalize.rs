//! Grant finalization: trade the interaction reference for an access token.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::errors::{DisburserError, Result};
use crate::grant::{GrantState, PoolGrant};
use crate::lock::KeyedLocks;
use crate::open_payments::{AuthorizationClient, GrantOutcome};
use crate::store::GrantStore;

/// Caller-facing view of a finalized pool. The token itself stays in the store.
#[derive(Debug, Clone, Serialize)]
pub struct FinalizedPool {
    pub pool_id: String,
    pub state: GrantState,
    pub finalized_at: chrono::DateTime<chrono::Utc>,
    /// `false` when an earlier finalize already obtained the token.
    pub newly_finalized: bool,
}

pub struct Finalizer {
    store: Arc<dyn GrantStore>,
    auth: Arc<dyn AuthorizationClient>,
    locks: KeyedLocks,
}

impl Finalizer {
    pub fn new(store: Arc<dyn GrantStore>, auth: Arc<dyn AuthorizationClient>) -> Self {
        Self {
            store,
            auth,
            locks: KeyedLocks::new(),
        }
    }

    /// Finalize `pool_id`, or return the existing finalized record.
    ///
    /// Continuation happens at most once per grant: concurrent callers for the
    /// same pool queue behind one another and the later ones see `Finalized`.
    pub async fn finalize(&self, pool_id: &str) -> Result<FinalizedPool> {
        let _guard = self.locks.acquire(pool_id).await;
        let grant = self.store.load(pool_id).await?;

        match grant.state {
            GrantState::Finalized => Ok(view(&grant, false)),
            GrantState::Authorized => self.continue_grant(grant).await,
            GrantState::PendingAuth if !grant.expects_callback() => self.continue_grant(grant).await,
            GrantState::PendingAuth => Err(DisburserError::NotYetAuthorized {
                pool_id: pool_id.to_string(),
            }),
            state => Err(DisburserError::StateConflict {
                pool_id: pool_id.to_string(),
                state,
                operation: "finalize",
            }),
        }
    }

    async fn continue_grant(&self, grant: PoolGrant) -> Result<FinalizedPool> {
        let pool_id = grant.pool_id.as_str();
        let Some(handle) = grant.continuation.clone() else {
            self.expire(pool_id, grant.state).await;
            return Err(DisburserError::AuthorizationStale {
                pool_id: pool_id.to_string(),
            });
        };

        let outcome = match self
            .auth
            .continue_grant(&handle, grant.interaction_correlator.as_deref())
            .await
        {
            Ok(outcome) => outcome,
            Err(DisburserError::UpstreamAuthorization {
                status,
                message,
                retryable: false,
            }) => {
                warn!("Continuation for pool {pool_id} rejected ({status}): {message}");
                self.expire(pool_id, grant.state).await;
                return Err(DisburserError::AuthorizationStale {
                    pool_id: pool_id.to_string(),
                });
            }
            Err(e) => return Err(e),
        };

        let finalized = match outcome {
            GrantOutcome::Finalized(finalized) => finalized,
            GrantOutcome::Pending(pending) => {
                // The server rotates the continuation token on every call.
                let continuation = pending.continuation;
                self.store
                    .compare_and_transition(
                        pool_id,
                        grant.state,
                        "rotate continuation",
                        Box::new(move |g: &mut PoolGrant| {
                            g.continuation = Some(continuation);
                            Ok(())
                        }),
                    )
                    .await?;
                return Err(DisburserError::NotYetAuthorized {
                    pool_id: pool_id.to_string(),
                });
            }
        };

        if grant.state == GrantState::PendingAuth {
            self.store
                .compare_and_transition(
                    pool_id,
                    GrantState::PendingAuth,
                    "finalize",
                    Box::new(|g: &mut PoolGrant| g.advance(GrantState::Authorized, "finalize")),
                )
                .await?;
        }

        if let Some(manage) = &finalized.manage_uri {
            debug!("Pool {pool_id} token can be managed at {manage}");
        }
        let token = finalized.access_token;
        let continuation = finalized.continuation;
        let stored = self
            .store
            .compare_and_transition(
                pool_id,
                GrantState::Authorized,
                "finalize",
                Box::new(move |g: &mut PoolGrant| g.record_finalized(token, continuation)),
            )
            .await?;

        info!("Pool {pool_id} finalized");
        Ok(view(&stored, true))
    }

    async fn expire(&self, pool_id: &str, from: GrantState) {
        let result = self
            .store
            .compare_and_transition(
                pool_id,
                from,
                "expire",
                Box::new(|g: &mut PoolGrant| g.advance(GrantState::Expired, "expire")),
            )
            .await;
        if let Err(e) = result {
            warn!("Could not expire pool {pool_id}: {e}");
        }
    }
}

fn view(grant: &PoolGrant, newly_finalized: bool) -> FinalizedPool {
    FinalizedPool {
        pool_id: grant.pool_id.clone(),
        state: grant.state,
        finalized_at: grant.last_transition_at,
        newly_finalized,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryGrantStore;
    use crate::testing::{
        authorized_grant, finalized_grant, pending_grant, ContinueBehavior, ScriptedAuthClient,
    };
    use secrecy::ExposeSecret;

    fn setup() -> (Arc<Finalizer>, Arc<InMemoryGrantStore>, Arc<ScriptedAuthClient>) {
        let store = Arc::new(InMemoryGrantStore::new());
        let auth = Arc::new(ScriptedAuthClient::new());
        let finalizer = Arc::new(Finalizer::new(store.clone(), auth.clone()));
        (finalizer, store, auth)
    }

    #[tokio::test]
    async fn authorized_pool_is_finalized_with_token() {
        let (finalizer, store, auth) = setup();
        store.put(&authorized_grant("P1")).await.unwrap();

        let view = finalizer.finalize("P1").await.unwrap();
        assert_eq!(view.state, GrantState::Finalized);
        assert!(view.newly_finalized);

        let record = store.load("P1").await.unwrap();
        assert_eq!(record.finalized_token.unwrap().expose_secret(), "T");
        assert_eq!(auth.interact_refs(), vec![Some("abc123".to_string())]);
    }

    #[tokio::test]
    async fn finalize_before_callback_is_not_yet_authorized() {
        let (finalizer, store, auth) = setup();
        store.put(&pending_grant("P1")).await.unwrap();

        let err = finalizer.finalize("P1").await.unwrap_err();
        assert!(matches!(err, DisburserError::NotYetAuthorized { .. }));
        assert!(err.is_retryable());
        assert_eq!(auth.calls().continuations, 0);
        assert_eq!(store.load("P1").await.unwrap().state, GrantState::PendingAuth);
    }

    #[tokio::test]
    async fn already_finalized_reuses_token() {
        let (finalizer, store, auth) = setup();
        store.put(&finalized_grant("P1")).await.unwrap();

        let view = finalizer.finalize("P1").await.unwrap();
        assert!(!view.newly_finalized);
        assert_eq!(auth.calls().continuations, 0);
    }

    #[tokio::test]
    async fn concurrent_finalize_continues_once() {
        let (finalizer, store, auth) = setup();
        store.put(&authorized_grant("P1")).await.unwrap();

        let a = tokio::spawn({
            let f = finalizer.clone();
            async move { f.finalize("P1").await }
        });
        let b = tokio::spawn({
            let f = finalizer.clone();
            async move { f.finalize("P1").await }
        });
        let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());

        assert_eq!(auth.calls().continuations, 1);
        assert!(a.newly_finalized ^ b.newly_finalized);
    }

    #[tokio::test]
    async fn stale_continuation_expires_pool() {
        let (finalizer, store, auth) = setup();
        store.put(&authorized_grant("P1")).await.unwrap();
        auth.set_continue(ContinueBehavior::Stale);

        let err = finalizer.finalize("P1").await.unwrap_err();
        assert!(matches!(err, DisburserError::AuthorizationStale { .. }));
        assert_eq!(store.load("P1").await.unwrap().state, GrantState::Expired);
    }

    #[tokio::test]
    async fn transient_rejection_keeps_pool_authorized() {
        let (finalizer, store, auth) = setup();
        store.put(&authorized_grant("P1")).await.unwrap();
        auth.set_continue(ContinueBehavior::TooFast);

        let err = finalizer.finalize("P1").await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.load("P1").await.unwrap().state, GrantState::Authorized);

        auth.set_continue(ContinueBehavior::Finalize("T".into()));
        finalizer.finalize("P1").await.unwrap();
    }

    #[tokio::test]
    async fn poll_mode_grant_finalizes_without_callback() {
        let (finalizer, store, auth) = setup();
        let mut grant = pending_grant("P1");
        grant.nonces = None;
        store.put(&grant).await.unwrap();

        auth.set_continue(ContinueBehavior::StillPending);
        let err = finalizer.finalize("P1").await.unwrap_err();
        assert!(matches!(err, DisburserError::NotYetAuthorized { .. }));
        let rotated = store.load("P1").await.unwrap().continuation.unwrap();
        assert_eq!(rotated.uri, "https://auth.example/continue/101");

        auth.set_continue(ContinueBehavior::Finalize("T".into()));
        let view = finalizer.finalize("P1").await.unwrap();
        assert_eq!(view.state, GrantState::Finalized);
        assert_eq!(auth.interact_refs(), vec![None, None]);

        let record = store.load("P1").await.unwrap();
        assert!(record.interaction_correlator.is_none());
    }

    #[tokio::test]
    async fn unknown_or_ended_pool() {
        let (finalizer, store, auth) = setup();
        assert!(matches!(
            finalizer.finalize("nope").await.unwrap_err(),
            DisburserError::NotFound { .. }
        ));

        store.put(&authorized_grant("P1")).await.unwrap();
        auth.set_continue(ContinueBehavior::Stale);
        finalizer.finalize("P1").await.unwrap_err();

        let err = finalizer.finalize("P1").await.unwrap_err();
        assert!(matches!(
            err,
            DisburserError::StateConflict {
                state: GrantState::Expired,
                ..
            }
        ));
    }
}
