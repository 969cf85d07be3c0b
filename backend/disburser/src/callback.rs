//! Interaction callback: binds the funder's approval to the pending pool grant.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{info, warn};
use url::Url;

use crate::errors::{DisburserError, Result};
use crate::grant::{GrantState, InteractionNonces, PoolGrant};
use crate::store::GrantStore;

/// Query string the authorization server appends when redirecting the funder back.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    #[serde(default)]
    pub pool_id: String,
    pub interact_ref: Option<String>,
    pub hash: Option<String>,
    /// Set by the authorization server when the funder declined.
    pub result: Option<String>,
}

pub struct CallbackCorrelator {
    store: Arc<dyn GrantStore>,
    operator_redirect: Url,
    require_hash: bool,
}

impl CallbackCorrelator {
    pub fn new(store: Arc<dyn GrantStore>, operator_redirect: Url, require_hash: bool) -> Self {
        Self {
            store,
            operator_redirect,
            require_hash,
        }
    }

    /// Mark the pool authorized and return where to send the funder next.
    pub async fn complete_interaction(&self, params: CallbackParams) -> Result<Url> {
        let pool_id = params.pool_id.trim();
        if pool_id.is_empty() {
            return Err(DisburserError::Validation("pool_id is required".into()));
        }

        // Declines are unauthenticated. The pool stays pending and the next
        // continuation reports the authorization server's verdict.
        if let Some(result) = params.result.as_deref().filter(|r| *r != "success") {
            self.store.load(pool_id).await?;
            warn!("Funder declined pool {pool_id} ({result})");
            return Ok(self.redirect(pool_id, false));
        }

        let interact_ref = params
            .interact_ref
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .ok_or_else(|| DisburserError::Validation("interact_ref is required".into()))?
            .to_string();

        let grant = self.store.load(pool_id).await?;
        if grant.state != GrantState::PendingAuth {
            return Err(DisburserError::StateConflict {
                pool_id: pool_id.to_string(),
                state: grant.state,
                operation: "complete interaction",
            });
        }
        self.verify_hash(&grant, &interact_ref, params.hash.as_deref())?;

        self.store
            .compare_and_transition(
                pool_id,
                GrantState::PendingAuth,
                "complete interaction",
                Box::new(move |g: &mut PoolGrant| g.record_interaction(interact_ref)),
            )
            .await?;

        info!("Funder authorized pool {pool_id}");
        Ok(self.redirect(pool_id, true))
    }

    fn verify_hash(&self, grant: &PoolGrant, interact_ref: &str, hash: Option<&str>) -> Result<()> {
        let (Some(nonces), Some(endpoint)) = (&grant.nonces, &grant.grant_endpoint) else {
            return Ok(());
        };

        match hash {
            Some(hash) if hashes_match(hash, &interaction_hash(nonces, interact_ref, endpoint)) => {
                Ok(())
            }
            Some(_) => {
                warn!("Callback hash mismatch for pool {}", grant.pool_id);
                Err(DisburserError::Validation(
                    "callback hash does not match the pending grant".into(),
                ))
            }
            None if self.require_hash => Err(DisburserError::Validation(
                "callback hash is required".into(),
            )),
            None => Ok(()),
        }
    }

    fn redirect(&self, pool_id: &str, completed: bool) -> Url {
        let mut url = self.operator_redirect.clone();
        url.query_pairs_mut()
            .append_pair("auth_complete", if completed { "1" } else { "0" })
            .append_pair("pool_id", pool_id);
        url
    }
}

/// GNAP interaction finish hash over both nonces, the reference and the
/// grant endpoint, base64 encoded.
pub fn interaction_hash(nonces: &InteractionNonces, interact_ref: &str, grant_endpoint: &str) -> String {
    let input = format!(
        "{}\n{}\n{}\n{}",
        nonces.client_nonce, nonces.finish_nonce, interact_ref, grant_endpoint
    );
    STANDARD.encode(Sha256::digest(input.as_bytes()))
}

fn hashes_match(received: &str, expected: &str) -> bool {
    bool::from(received.as_bytes().ct_eq(expected.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryGrantStore;
    use crate::testing::{authorized_grant, pending_grant, sample_grant};

    async fn setup(require_hash: bool) -> (CallbackCorrelator, Arc<InMemoryGrantStore>) {
        let store = Arc::new(InMemoryGrantStore::new());
        store.put(&pending_grant("P1")).await.unwrap();
        let correlator = CallbackCorrelator::new(
            store.clone(),
            Url::parse("https://platform.example/pools?tab=funding").unwrap(),
            require_hash,
        );
        (correlator, store)
    }

    fn params(interact_ref: &str, hash: Option<String>) -> CallbackParams {
        CallbackParams {
            pool_id: "P1".into(),
            interact_ref: Some(interact_ref.into()),
            hash,
            result: None,
        }
    }

    fn valid_hash(interact_ref: &str) -> String {
        let grant = pending_grant("P1");
        interaction_hash(
            grant.nonces.as_ref().unwrap(),
            interact_ref,
            grant.grant_endpoint.as_deref().unwrap(),
        )
    }

    #[test]
    fn hash_is_base64_sha256() {
        let nonces = InteractionNonces {
            client_nonce: "a".into(),
            finish_nonce: "b".into(),
        };
        let hash = interaction_hash(&nonces, "c", "https://auth.example");
        assert_eq!(STANDARD.decode(&hash).unwrap().len(), 32);
        assert_ne!(hash, interaction_hash(&nonces, "d", "https://auth.example"));
    }

    #[tokio::test]
    async fn binds_correlator_and_redirects_to_operator() {
        let (correlator, store) = setup(false).await;

        let redirect = correlator
            .complete_interaction(params("abc123", Some(valid_hash("abc123"))))
            .await
            .unwrap();
        assert_eq!(
            redirect.as_str(),
            "https://platform.example/pools?tab=funding&auth_complete=1&pool_id=P1"
        );

        let record = store.load("P1").await.unwrap();
        assert_eq!(record.state, GrantState::Authorized);
        assert_eq!(record.interaction_correlator.as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn second_callback_is_rejected_and_keeps_first_correlator() {
        let (correlator, store) = setup(false).await;
        correlator
            .complete_interaction(params("abc123", None))
            .await
            .unwrap();

        let err = correlator
            .complete_interaction(params("evil", None))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DisburserError::StateConflict {
                state: GrantState::Authorized,
                ..
            }
        ));
        assert_eq!(
            store.load("P1").await.unwrap().interaction_correlator.as_deref(),
            Some("abc123")
        );
    }

    #[tokio::test]
    async fn forged_hash_leaves_record_untouched() {
        let (correlator, store) = setup(false).await;
        let err = correlator
            .complete_interaction(params("abc123", Some(valid_hash("other"))))
            .await
            .unwrap_err();

        assert!(matches!(err, DisburserError::Validation(_)));
        let record = store.load("P1").await.unwrap();
        assert_eq!(record.state, GrantState::PendingAuth);
        assert!(record.interaction_correlator.is_none());
    }

    #[tokio::test]
    async fn missing_hash_rejected_when_required() {
        let (correlator, _store) = setup(true).await;
        let err = correlator
            .complete_interaction(params("abc123", None))
            .await
            .unwrap_err();
        assert!(matches!(err, DisburserError::Validation(_)));

        correlator
            .complete_interaction(params("abc123", Some(valid_hash("abc123"))))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_pool_and_wrong_state() {
        let (correlator, store) = setup(false).await;

        let mut unknown = params("abc123", None);
        unknown.pool_id = "nope".into();
        let err = correlator.complete_interaction(unknown).await.unwrap_err();
        assert!(matches!(err, DisburserError::NotFound { .. }));

        store.put(&sample_grant("P2")).await.unwrap();
        let mut requested = params("abc123", None);
        requested.pool_id = "P2".into();
        let err = correlator.complete_interaction(requested).await.unwrap_err();
        assert_eq!(err.kind(), "state_conflict");

        store.put(&authorized_grant("P3")).await.unwrap();
        let mut authorized = params("xyz", None);
        authorized.pool_id = "P3".into();
        assert!(correlator.complete_interaction(authorized).await.is_err());
    }

    #[tokio::test]
    async fn empty_interact_ref_is_invalid() {
        let (correlator, _store) = setup(false).await;
        let err = correlator
            .complete_interaction(params("  ", None))
            .await
            .unwrap_err();
        assert!(matches!(err, DisburserError::Validation(_)));
    }

    #[tokio::test]
    async fn declined_redirect_keeps_the_pool_pending() {
        let (correlator, store) = setup(true).await;
        let redirect = correlator
            .complete_interaction(CallbackParams {
                pool_id: "P1".into(),
                result: Some("grant_rejected".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(redirect.as_str().ends_with("auth_complete=0&pool_id=P1"));
        assert_eq!(store.load("P1").await.unwrap().state, GrantState::PendingAuth);

        // The genuine approval still lands afterwards.
        correlator
            .complete_interaction(params("abc123", Some(valid_hash("abc123"))))
            .await
            .unwrap();
        assert_eq!(store.load("P1").await.unwrap().state, GrantState::Authorized);
    }

    #[test]
    fn hash_comparison_is_exact() {
        let hash = valid_hash("abc123");
        assert!(hashes_match(&hash, &hash));
        assert!(!hashes_match(&hash[..hash.len() - 1], &hash));
        assert!(!hashes_match(&valid_hash("abc124"), &hash));
    }
}
