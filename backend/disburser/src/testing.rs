//! Fixtures shared by the unit tests.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use crate::errors::{DisburserError, Result};
use crate::grant::{AssetAmount, ContinuationHandle, GrantState, InteractionNonces, PoolGrant};
use crate::open_payments::{
    AuthorizationClient, FinalizedGrant, GrantOutcome, GrantRequest, IncomingPayment,
    NewIncomingPayment, NewOutgoingPayment, NewQuote, OutgoingPayment, PendingGrant, Quote,
    WalletAddress,
};

/// Fresh in-memory database with migrations applied.
pub async fn setup_test_db() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

pub fn sample_grant(pool_id: &str) -> PoolGrant {
    PoolGrant::requested(
        pool_id,
        "https://wallet.example/sender",
        "https://wallet.example/receiver",
        AssetAmount {
            value: 100_000,
            asset_code: "USD".into(),
            asset_scale: 2,
        },
        Utc::now(),
    )
}

pub fn pending_grant(pool_id: &str) -> PoolGrant {
    let mut grant = sample_grant(pool_id);
    grant
        .record_pending(
            "https://auth.example".into(),
            Some(format!("https://auth.example/interact/{pool_id}")),
            ContinuationHandle {
                uri: format!("https://auth.example/continue/{pool_id}"),
                access_token: SecretString::from(format!("continue-{pool_id}")),
                wait_secs: None,
            },
            Some(InteractionNonces {
                client_nonce: format!("client-{pool_id}"),
                finish_nonce: format!("server-{pool_id}"),
            }),
        )
        .unwrap();
    grant
}

pub fn authorized_grant(pool_id: &str) -> PoolGrant {
    let mut grant = pending_grant(pool_id);
    grant.record_interaction("abc123".into()).unwrap();
    grant
}

pub fn finalized_grant(pool_id: &str) -> PoolGrant {
    let mut grant = authorized_grant(pool_id);
    grant.record_finalized(SecretString::from("T"), None).unwrap();
    assert_eq!(grant.state, GrantState::Finalized);
    grant
}

// ─────────────────────────────────────────────────────────
// Scripted authorization client
// ─────────────────────────────────────────────────────────

/// What the authorization server answers to a grant continuation.
#[derive(Debug, Clone)]
pub enum ContinueBehavior {
    Finalize(String),
    Stale,
    TooFast,
    StillPending,
}

/// What the resource server does with an outgoing payment request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutgoingBehavior {
    Succeed,
    /// Payment is created but the response never arrives (502). Succeeds afterwards.
    LostResponse,
    /// Payment is refused outright (403).
    Rejected,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub wallet_lookups: usize,
    pub grant_requests: usize,
    pub continuations: usize,
    pub incoming_payments: usize,
    pub quotes: usize,
    pub outgoing_payments: usize,
    pub listings: usize,
}

struct Script {
    calls: CallCounts,
    continue_behavior: ContinueBehavior,
    outgoing_behavior: OutgoingBehavior,
    fail_grant_requests: bool,
    incoming_needs_interaction: bool,
    fail_quotes: bool,
    quote_delay: Option<Duration>,
    grant_requests: Vec<(String, GrantRequest)>,
    interact_refs: Vec<Option<String>>,
    outgoing_tokens: Vec<String>,
    created_outgoing: Vec<OutgoingPayment>,
}

/// In-process [`AuthorizationClient`] whose answers are set per test.
pub struct ScriptedAuthClient {
    script: Mutex<Script>,
}

impl Default for ScriptedAuthClient {
    fn default() -> Self {
        Self {
            script: Mutex::new(Script {
                calls: CallCounts::default(),
                continue_behavior: ContinueBehavior::Finalize("T".into()),
                outgoing_behavior: OutgoingBehavior::Succeed,
                fail_grant_requests: false,
                incoming_needs_interaction: false,
                fail_quotes: false,
                quote_delay: None,
                grant_requests: Vec::new(),
                interact_refs: Vec::new(),
                outgoing_tokens: Vec::new(),
                created_outgoing: Vec::new(),
            }),
        }
    }
}

impl ScriptedAuthClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> CallCounts {
        self.script.lock().unwrap().calls
    }

    pub fn set_continue(&self, behavior: ContinueBehavior) {
        self.script.lock().unwrap().continue_behavior = behavior;
    }

    pub fn set_outgoing(&self, behavior: OutgoingBehavior) {
        self.script.lock().unwrap().outgoing_behavior = behavior;
    }

    pub fn fail_grant_requests(&self) {
        self.script.lock().unwrap().fail_grant_requests = true;
    }

    pub fn require_interaction_for_incoming(&self) {
        self.script.lock().unwrap().incoming_needs_interaction = true;
    }

    pub fn fail_quotes(&self, fail: bool) {
        self.script.lock().unwrap().fail_quotes = fail;
    }

    pub fn delay_quotes(&self, delay: Option<Duration>) {
        self.script.lock().unwrap().quote_delay = delay;
    }

    pub fn grant_requests(&self) -> Vec<(String, GrantRequest)> {
        self.script.lock().unwrap().grant_requests.clone()
    }

    pub fn interact_refs(&self) -> Vec<Option<String>> {
        self.script.lock().unwrap().interact_refs.clone()
    }

    pub fn outgoing_tokens(&self) -> Vec<String> {
        self.script.lock().unwrap().outgoing_tokens.clone()
    }

    pub fn created_outgoing(&self) -> Vec<OutgoingPayment> {
        self.script.lock().unwrap().created_outgoing.clone()
    }
}

fn continuation(n: usize) -> ContinuationHandle {
    ContinuationHandle {
        uri: format!("https://auth.example/continue/{n}"),
        access_token: SecretString::from(format!("cont-{n}")),
        wait_secs: Some(5),
    }
}

fn finalized(token: &str) -> GrantOutcome {
    GrantOutcome::Finalized(FinalizedGrant {
        access_token: SecretString::from(token),
        manage_uri: None,
        continuation: None,
    })
}

#[async_trait]
impl AuthorizationClient for ScriptedAuthClient {
    async fn resolve_wallet(&self, wallet_ref: &str) -> Result<WalletAddress> {
        self.script.lock().unwrap().calls.wallet_lookups += 1;
        if wallet_ref.contains("unknown") {
            return Err(DisburserError::Validation(format!(
                "wallet address {wallet_ref} could not be resolved (status 404 Not Found)"
            )));
        }
        // Wallets named for JPY hold yen; everything else is USD cents.
        let (asset_code, asset_scale) = if wallet_ref.contains("JPY") {
            ("JPY", 0)
        } else {
            ("USD", 2)
        };
        Ok(WalletAddress {
            id: wallet_ref.to_string(),
            asset_code: asset_code.into(),
            asset_scale,
            auth_server: "https://auth.example".into(),
            resource_server: format!("{wallet_ref}/rs"),
        })
    }

    async fn request_grant(&self, auth_server: &str, request: &GrantRequest) -> Result<GrantOutcome> {
        let mut script = self.script.lock().unwrap();
        script.calls.grant_requests += 1;
        script
            .grant_requests
            .push((auth_server.to_string(), request.clone()));
        let n = script.calls.grant_requests;

        if script.fail_grant_requests {
            return Err(DisburserError::UpstreamAuthorization {
                status: 400,
                message: "invalid_request".into(),
                retryable: false,
            });
        }

        let interactive = request.interact.is_some()
            || (request.access_kind() == "incoming-payment" && script.incoming_needs_interaction);
        if !interactive {
            return Ok(finalized(&format!("{}-token", request.access_kind())));
        }

        Ok(GrantOutcome::Pending(PendingGrant {
            redirect: Some(format!("https://auth.example/interact/{n}")),
            finish_nonce: Some(format!("server-nonce-{n}")),
            continuation: continuation(n),
        }))
    }

    async fn continue_grant(
        &self,
        _handle: &ContinuationHandle,
        interact_ref: Option<&str>,
    ) -> Result<GrantOutcome> {
        let mut script = self.script.lock().unwrap();
        script.calls.continuations += 1;
        script.interact_refs.push(interact_ref.map(String::from));

        match &script.continue_behavior {
            ContinueBehavior::Finalize(token) => Ok(finalized(token)),
            ContinueBehavior::Stale => Err(DisburserError::UpstreamAuthorization {
                status: 401,
                message: "invalid_continuation".into(),
                retryable: false,
            }),
            ContinueBehavior::TooFast => Err(DisburserError::UpstreamAuthorization {
                status: 400,
                message: "too_fast".into(),
                retryable: true,
            }),
            ContinueBehavior::StillPending => Ok(GrantOutcome::Pending(PendingGrant {
                redirect: None,
                finish_nonce: None,
                continuation: continuation(100 + script.calls.continuations),
            })),
        }
    }

    async fn create_incoming_payment(
        &self,
        resource_server: &str,
        _token: &SecretString,
        _payment: &NewIncomingPayment,
    ) -> Result<IncomingPayment> {
        let mut script = self.script.lock().unwrap();
        script.calls.incoming_payments += 1;
        Ok(IncomingPayment {
            id: format!("{resource_server}/incoming-payments/{}", script.calls.incoming_payments),
        })
    }

    async fn create_quote(
        &self,
        resource_server: &str,
        _token: &SecretString,
        _quote: &NewQuote,
    ) -> Result<Quote> {
        let delay = self.script.lock().unwrap().quote_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut script = self.script.lock().unwrap();
        script.calls.quotes += 1;
        if script.fail_quotes {
            return Err(DisburserError::UpstreamResource {
                resource: "quote",
                status: 500,
                message: "quote engine down".into(),
                value_at_risk: false,
            });
        }
        Ok(Quote {
            id: format!("{resource_server}/quotes/{}", script.calls.quotes),
            debit_amount: None,
        })
    }

    async fn create_outgoing_payment(
        &self,
        resource_server: &str,
        token: &SecretString,
        payment: &NewOutgoingPayment,
    ) -> Result<OutgoingPayment> {
        let mut script = self.script.lock().unwrap();
        script.calls.outgoing_payments += 1;
        script.outgoing_tokens.push(token.expose_secret().to_string());

        if script.outgoing_behavior == OutgoingBehavior::Rejected {
            return Err(DisburserError::UpstreamResource {
                resource: "outgoing payment",
                status: 403,
                message: "insufficient grant".into(),
                value_at_risk: false,
            });
        }

        let created = OutgoingPayment {
            id: format!(
                "{resource_server}/outgoing-payments/{}",
                script.calls.outgoing_payments
            ),
            metadata: Some(payment.metadata.clone()),
        };
        script.created_outgoing.push(created.clone());

        if script.outgoing_behavior == OutgoingBehavior::LostResponse {
            script.outgoing_behavior = OutgoingBehavior::Succeed;
            return Err(DisburserError::UpstreamResource {
                resource: "outgoing payment",
                status: 502,
                message: "bad gateway".into(),
                value_at_risk: true,
            });
        }
        Ok(created)
    }

    async fn list_outgoing_payments(
        &self,
        _resource_server: &str,
        _token: &SecretString,
        _wallet_address: &str,
    ) -> Result<Vec<OutgoingPayment>> {
        let mut script = self.script.lock().unwrap();
        script.calls.listings += 1;
        Ok(script.created_outgoing.clone())
    }
}

/// Metadata value recorded on an outgoing payment.
pub fn metadata_field<'a>(payment: &'a OutgoingPayment, key: &str) -> Option<&'a Value> {
    payment.metadata.as_ref()?.get(key)
}
