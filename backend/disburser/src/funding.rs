//! Pool funding: from "no grant" to a grant waiting on the funder.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::errors::{DisburserError, Result};
use crate::grant::{AssetAmount, GrantState, InteractionNonces, PoolGrant};
use crate::open_payments::{
    normalize_wallet_ref, Amount, AuthorizationClient, GrantOutcome, GrantRequest, InteractFinish,
};
use crate::store::GrantStore;

/// Input of [`PoolFundingOrchestrator::request_pool_grant`].
#[derive(Debug, Clone, Deserialize)]
pub struct PoolGrantRequest {
    #[serde(skip)]
    pub pool_id: String,
    pub sender_wallet: String,
    pub receiver_wallet: String,
    pub amount: u64,
    /// Must match the sender wallet's asset when given.
    pub asset_code: Option<String>,
    pub asset_scale: Option<u8>,
    pub callback_uri: Option<String>,
}

/// What the funder needs to approve the grant.
///
/// The continuation token stays inside the service; only the URI is echoed.
#[derive(Debug, Clone, Serialize)]
pub struct PendingPoolGrant {
    pub pool_id: String,
    pub state: GrantState,
    pub redirect_uri: Option<String>,
    pub continue_uri: Option<String>,
    pub continue_wait_secs: Option<u64>,
    pub total: AssetAmount,
    /// `true` when the funder is sent back through the callback, `false` for
    /// grants that must be polled through finalize.
    pub callback: bool,
    /// An identical request was already pending; nothing new was issued.
    pub reused: bool,
}

impl PendingPoolGrant {
    fn from_record(grant: &PoolGrant, reused: bool) -> Self {
        Self {
            pool_id: grant.pool_id.clone(),
            state: grant.state,
            redirect_uri: grant.redirect_uri.clone(),
            continue_uri: grant.continuation.as_ref().map(|c| c.uri.clone()),
            continue_wait_secs: grant.continuation.as_ref().and_then(|c| c.wait_secs),
            total: grant.total.clone(),
            callback: grant.expects_callback(),
            reused,
        }
    }
}

/// How long a record may sit in `Requested` before a new request may take
/// the pool over.
const DEFAULT_STALE_REQUEST_AFTER: Duration = Duration::from_secs(60);

pub struct PoolFundingOrchestrator {
    store: Arc<dyn GrantStore>,
    auth: Arc<dyn AuthorizationClient>,
    /// Public base of this service, used to derive a callback when none is given.
    service_url: Option<Url>,
    stale_request_after: Duration,
}

impl PoolFundingOrchestrator {
    pub fn new(
        store: Arc<dyn GrantStore>,
        auth: Arc<dyn AuthorizationClient>,
        service_url: Option<Url>,
    ) -> Self {
        Self {
            store,
            auth,
            service_url,
            stale_request_after: DEFAULT_STALE_REQUEST_AFTER,
        }
    }

    /// A `Requested` record older than this was left behind by an attempt
    /// that never finished, and no longer blocks the pool.
    pub fn with_stale_request_after(mut self, stale_after: Duration) -> Self {
        self.stale_request_after = stale_after;
        self
    }

    /// Start interactive authorization of `request.amount` from the sender wallet.
    pub async fn request_pool_grant(&self, request: PoolGrantRequest) -> Result<PendingPoolGrant> {
        validate(&request)?;
        let callback = self.callback_for(&request)?;
        let pool_id = request.pool_id.as_str();

        if let Some(existing) = self.store.get(pool_id).await? {
            if is_same_pending_request(&existing, &request) {
                info!("Pool {pool_id} already has an identical pending grant");
                return Ok(PendingPoolGrant::from_record(&existing, true));
            }
            if existing.state == GrantState::Requested
                && is_stale(&existing, self.stale_request_after)
            {
                self.abandon_stale_request(pool_id).await?;
            } else if !existing.state.is_terminal() {
                return Err(DisburserError::StateConflict {
                    pool_id: pool_id.to_string(),
                    state: existing.state,
                    operation: "request a new pool grant",
                });
            }
        }

        let (sender, receiver) = tokio::try_join!(
            self.auth.resolve_wallet(&request.sender_wallet),
            self.auth.resolve_wallet(&request.receiver_wallet),
        )?;
        check_asset(&request, &sender.asset_code, sender.asset_scale)?;

        let total = AssetAmount {
            value: request.amount,
            asset_code: sender.asset_code.clone(),
            asset_scale: sender.asset_scale,
        };
        let record = PoolGrant::requested(pool_id, &sender.id, &receiver.id, total, Utc::now());
        let requested_at = record.created_at;
        self.store.put(&record).await?;
        info!(
            "Requesting grant for pool {pool_id}: {} {} (scale {}) from {}",
            request.amount, sender.asset_code, sender.asset_scale, sender.id
        );

        let client_nonce = callback.as_ref().map(|_| Uuid::new_v4().to_string());
        let finish = callback
            .zip(client_nonce.clone())
            .map(|(uri, nonce)| InteractFinish {
                method: "redirect",
                uri: uri.to_string(),
                nonce,
            });
        let grant_request = GrantRequest::outgoing_payment(
            &sender.id,
            Amount::new(request.amount, &sender.asset_code, sender.asset_scale),
            finish,
        );

        let pending = match self.auth.request_grant(&sender.auth_server, &grant_request).await {
            Ok(GrantOutcome::Pending(pending)) if pending.redirect.is_some() => pending,
            Ok(_) => {
                self.mark_failed(pool_id, requested_at).await;
                return Err(DisburserError::UpstreamAuthorization {
                    status: 200,
                    message: "outgoing payment grant did not ask for interaction".to_string(),
                    retryable: false,
                });
            }
            Err(e) => {
                self.mark_failed(pool_id, requested_at).await;
                return Err(e);
            }
        };

        let nonces = match (client_nonce, pending.finish_nonce) {
            (Some(client_nonce), Some(finish_nonce)) => Some(InteractionNonces {
                client_nonce,
                finish_nonce,
            }),
            (None, _) => None,
            (Some(_), None) => {
                self.mark_failed(pool_id, requested_at).await;
                return Err(DisburserError::UpstreamAuthorization {
                    status: 200,
                    message: "grant response is missing the interaction finish nonce".to_string(),
                    retryable: false,
                });
            }
        };

        let grant_endpoint = sender.auth_server.clone();
        let redirect = pending.redirect;
        let continuation = pending.continuation;
        let stored = self
            .store
            .compare_and_transition(
                pool_id,
                GrantState::Requested,
                "record pending grant",
                Box::new(move |g: &mut PoolGrant| {
                    same_attempt(g, requested_at, "record pending grant")?;
                    g.record_pending(grant_endpoint, redirect, continuation, nonces)
                }),
            )
            .await?;

        info!(
            "Pool {pool_id} is waiting for funder approval ({} mode)",
            if stored.expects_callback() { "callback" } else { "poll" }
        );
        Ok(PendingPoolGrant::from_record(&stored, false))
    }

    fn callback_for(&self, request: &PoolGrantRequest) -> Result<Option<Url>> {
        if let Some(raw) = &request.callback_uri {
            let url = Url::parse(raw)
                .map_err(|e| DisburserError::Validation(format!("callback_uri {raw:?}: {e}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(DisburserError::Validation(format!(
                    "callback_uri must be http or https, got {}",
                    url.scheme()
                )));
            }
            return Ok(Some(url));
        }

        Ok(self.service_url.as_ref().map(|base| {
            let mut url = base.clone();
            url.set_path(&format!("{}/pools/callback", base.path().trim_end_matches('/')));
            url.set_query(None);
            url.query_pairs_mut().append_pair("pool_id", &request.pool_id);
            url
        }))
    }

    async fn mark_failed(&self, pool_id: &str, requested_at: DateTime<Utc>) {
        let result = self
            .store
            .compare_and_transition(
                pool_id,
                GrantState::Requested,
                "mark failed",
                Box::new(move |g: &mut PoolGrant| {
                    same_attempt(g, requested_at, "mark failed")?;
                    g.advance(GrantState::Failed, "mark failed")
                }),
            )
            .await;
        if let Err(e) = result {
            warn!("Could not mark pool {pool_id} failed: {e}");
        }
    }

    async fn abandon_stale_request(&self, pool_id: &str) -> Result<()> {
        let stale_after = self.stale_request_after;
        self.store
            .compare_and_transition(
                pool_id,
                GrantState::Requested,
                "request a new pool grant",
                Box::new(move |g: &mut PoolGrant| {
                    // Re-checked under the store's write: a concurrent retry may
                    // already have replaced the stale record with a fresh one.
                    if !is_stale(g, stale_after) {
                        return Err(DisburserError::StateConflict {
                            pool_id: g.pool_id.clone(),
                            state: g.state,
                            operation: "request a new pool grant",
                        });
                    }
                    g.advance(GrantState::Failed, "abandon stale grant request")
                }),
            )
            .await?;
        warn!("Pool {pool_id} was left in requested; abandoning that grant request");
        Ok(())
    }
}

fn is_stale(grant: &PoolGrant, stale_after: Duration) -> bool {
    (Utc::now() - grant.last_transition_at)
        .to_std()
        .is_ok_and(|age| age >= stale_after)
}

/// Rejects a write from an attempt whose record has since been replaced.
/// Compared at millisecond precision, which is what the database keeps.
fn same_attempt(
    grant: &PoolGrant,
    requested_at: DateTime<Utc>,
    operation: &'static str,
) -> Result<()> {
    if grant.created_at.timestamp_millis() != requested_at.timestamp_millis() {
        return Err(DisburserError::StateConflict {
            pool_id: grant.pool_id.clone(),
            state: grant.state,
            operation,
        });
    }
    Ok(())
}

fn validate(request: &PoolGrantRequest) -> Result<()> {
    if request.pool_id.trim().is_empty() {
        return Err(DisburserError::Validation("pool_id must not be empty".into()));
    }
    if request.amount == 0 {
        return Err(DisburserError::Validation("amount must be greater than zero".into()));
    }
    if request.sender_wallet.trim().is_empty() || request.receiver_wallet.trim().is_empty() {
        return Err(DisburserError::Validation(
            "sender_wallet and receiver_wallet are required".into(),
        ));
    }
    Ok(())
}

fn check_asset(request: &PoolGrantRequest, asset_code: &str, asset_scale: u8) -> Result<()> {
    if request.asset_code.as_deref().is_some_and(|c| c != asset_code)
        || request.asset_scale.is_some_and(|s| s != asset_scale)
    {
        return Err(DisburserError::Validation(format!(
            "sender wallet holds {asset_code} (scale {asset_scale}), not the requested asset"
        )));
    }
    Ok(())
}

fn is_same_pending_request(existing: &PoolGrant, request: &PoolGrantRequest) -> bool {
    existing.state == GrantState::PendingAuth
        && existing.sender_wallet == normalize_wallet_ref(&request.sender_wallet)
        && existing.receiver_wallet == normalize_wallet_ref(&request.receiver_wallet)
        && existing.total.value == request.amount
}
