//! Pool grant records and the disbursements drawn against them.
//!
//! A [`PoolGrant`] follows a strict forward-only lifecycle:
//!
//! ```text
//! Requested ──► PendingAuth ──► Authorized ──► Finalized
//!     │              │               │              │
//!     └──────────────┴───────┬───────┴──────────────┘
//!                            ▼
//!                    Expired / Failed
//! ```
//!
//! The mutators on [`PoolGrant`] are the only place these rules are checked;
//! stores persist whatever a mutator produced.

use std::fmt;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::Serialize;

use crate::errors::{DisburserError, Result};

/// Lifecycle state of a pool grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantState {
    /// Record written, grant request not yet answered by the authorization server.
    Requested,
    /// Waiting for the funder to approve at the redirect URI.
    PendingAuth,
    /// Funder approved; the callback delivered an interaction reference.
    Authorized,
    /// Continuation completed; an access token for outgoing payments is held.
    Finalized,
    /// Continuation was rejected as stale; a new grant is needed.
    Expired,
    /// The grant request failed or the funder rejected it.
    Failed,
}

impl GrantState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::PendingAuth => "pending_auth",
            Self::Authorized => "authorized",
            Self::Finalized => "finalized",
            Self::Expired => "expired",
            Self::Failed => "failed",
        }
    }

    /// Parse the identifier written by [`GrantState::as_str`].
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "requested" => Some(Self::Requested),
            "pending_auth" => Some(Self::PendingAuth),
            "authorized" => Some(Self::Authorized),
            "finalized" => Some(Self::Finalized),
            "expired" => Some(Self::Expired),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Expired | Self::Failed)
    }

    pub fn can_transition_to(&self, next: GrantState) -> bool {
        use GrantState::*;
        match (self, next) {
            (Requested, PendingAuth) | (PendingAuth, Authorized) | (Authorized, Finalized) => true,
            (from, Expired | Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for GrantState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An integer amount in minor units of an asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssetAmount {
    pub value: u64,
    pub asset_code: String,
    pub asset_scale: u8,
}

/// Handle needed to resume a grant negotiation.
///
/// `access_token` is a credential for the authorization server only; it never
/// leaves this service except on the continuation request itself.
#[derive(Debug, Clone)]
pub struct ContinuationHandle {
    pub uri: String,
    pub access_token: SecretString,
    pub wait_secs: Option<u64>,
}

/// Nonces exchanged in the interaction finish clause, used to check the
/// callback `hash`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InteractionNonces {
    pub client_nonce: String,
    pub finish_nonce: String,
}

/// Authorization state for one funding pool.
#[derive(Debug, Clone)]
pub struct PoolGrant {
    pub pool_id: String,
    pub state: GrantState,
    pub sender_wallet: String,
    pub receiver_wallet: String,
    pub total: AssetAmount,
    /// Authorization server the grant was requested from.
    pub grant_endpoint: Option<String>,
    /// Where the funder approves the grant.
    pub redirect_uri: Option<String>,
    pub continuation: Option<ContinuationHandle>,
    /// Present when the grant was requested with a redirect finish clause.
    pub nonces: Option<InteractionNonces>,
    pub interaction_correlator: Option<String>,
    pub finalized_token: Option<SecretString>,
    pub created_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
    /// Bumped by the store on every committed write.
    pub version: i64,
}

impl PoolGrant {
    pub fn requested(
        pool_id: impl Into<String>,
        sender_wallet: impl Into<String>,
        receiver_wallet: impl Into<String>,
        total: AssetAmount,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            pool_id: pool_id.into(),
            state: GrantState::Requested,
            sender_wallet: sender_wallet.into(),
            receiver_wallet: receiver_wallet.into(),
            total,
            grant_endpoint: None,
            redirect_uri: None,
            continuation: None,
            nonces: None,
            interaction_correlator: None,
            finalized_token: None,
            created_at: now,
            last_transition_at: now,
            version: 0,
        }
    }

    /// Whether the funder will be sent back through the callback.
    pub fn expects_callback(&self) -> bool {
        self.nonces.is_some()
    }

    fn conflict(&self, operation: &'static str) -> DisburserError {
        DisburserError::StateConflict {
            pool_id: self.pool_id.clone(),
            state: self.state,
            operation,
        }
    }

    /// Move to `next`, rejecting anything the lifecycle does not allow.
    pub fn advance(&mut self, next: GrantState, operation: &'static str) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(self.conflict(operation));
        }
        self.state = next;
        self.last_transition_at = Utc::now();
        Ok(())
    }

    /// Record the pending grant returned by the authorization server.
    pub fn record_pending(
        &mut self,
        grant_endpoint: String,
        redirect_uri: Option<String>,
        continuation: ContinuationHandle,
        nonces: Option<InteractionNonces>,
    ) -> Result<()> {
        self.advance(GrantState::PendingAuth, "record pending grant")?;
        self.grant_endpoint = Some(grant_endpoint);
        self.redirect_uri = redirect_uri;
        self.continuation = Some(continuation);
        self.nonces = nonces;
        Ok(())
    }

    /// Bind the interaction reference delivered by the callback.
    ///
    /// Only a pending grant accepts one, and only once.
    pub fn record_interaction(&mut self, correlator: String) -> Result<()> {
        if self.state != GrantState::PendingAuth || self.interaction_correlator.is_some() {
            return Err(self.conflict("complete interaction"));
        }
        self.advance(GrantState::Authorized, "complete interaction")?;
        self.interaction_correlator = Some(correlator);
        Ok(())
    }

    /// Store the access token obtained by continuing the grant.
    pub fn record_finalized(
        &mut self,
        token: SecretString,
        continuation: Option<ContinuationHandle>,
    ) -> Result<()> {
        if self.state != GrantState::Authorized || self.finalized_token.is_some() {
            return Err(self.conflict("finalize"));
        }
        self.advance(GrantState::Finalized, "finalize")?;
        self.finalized_token = Some(token);
        if continuation.is_some() {
            self.continuation = continuation;
        }
        Ok(())
    }
}

/// Progress of one disbursement through the payment chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisbursementStatus {
    /// Amount counted against the pool; no value has moved.
    Reserved,
    /// Outgoing payment requested; the outcome may not have been observed.
    Submitting,
    Completed,
}

impl DisbursementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::Submitting => "submitting",
            Self::Completed => "completed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "reserved" => Some(Self::Reserved),
            "submitting" => Some(Self::Submitting),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// A disbursement keyed by `(pool_id, transaction_id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disbursement {
    pub pool_id: String,
    pub transaction_id: String,
    pub recipient_wallet: String,
    pub recipient_label: Option<String>,
    pub amount: u64,
    pub status: DisbursementStatus,
    pub incoming_payment_id: Option<String>,
    pub quote_id: Option<String>,
    pub outgoing_payment_id: Option<String>,
}

impl Disbursement {
    pub fn reserve(
        pool_id: impl Into<String>,
        transaction_id: impl Into<String>,
        recipient_wallet: impl Into<String>,
        recipient_label: Option<String>,
        amount: u64,
    ) -> Self {
        Self {
            pool_id: pool_id.into(),
            transaction_id: transaction_id.into(),
            recipient_wallet: recipient_wallet.into(),
            recipient_label,
            amount,
            status: DisbursementStatus::Reserved,
            incoming_payment_id: None,
            quote_id: None,
            outgoing_payment_id: None,
        }
    }

    /// Whether a retried request describes the same logical transfer.
    pub fn same_request(&self, other: &Disbursement) -> bool {
        self.recipient_wallet == other.recipient_wallet && self.amount == other.amount
    }

    /// The caller-facing transaction record, once all resources exist.
    pub fn receipt(&self) -> Option<DisbursementReceipt> {
        Some(DisbursementReceipt {
            pool_id: self.pool_id.clone(),
            transaction_id: self.transaction_id.clone(),
            amount: self.amount,
            incoming_payment_id: self.incoming_payment_id.clone()?,
            quote_id: self.quote_id.clone()?,
            outgoing_payment_id: self.outgoing_payment_id.clone()?,
        })
    }
}

/// Result of a completed disbursement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisbursementReceipt {
    pub pool_id: String,
    pub transaction_id: String,
    pub amount: u64,
    pub incoming_payment_id: String,
    pub quote_id: String,
    pub outgoing_payment_id: String,
}
