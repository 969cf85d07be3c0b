//! Disbursement: one payment from the pool's sender wallet to one recipient.
//!
//! The chain per transaction:
//!
//! ```text
//!   reserve amount ─► resolve wallets ─┬─► incoming-payment grant ─► incoming payment ─┐
//!                                      └─► quote grant ─────────────────────────────────┴─► quote
//!                                                                                          │
//!                        checkpoint "submitting" ◄────────────────────────────────────────┘
//!                                  │
//!                                  ▼
//!                        outgoing payment (moves value) ─► "completed"
//! ```
//!
//! Everything before the outgoing payment is safe to repeat, so a failure there
//! releases the reservation, and so does a caller that goes away before the
//! checkpoint. Once a record is `submitting`, a retry first looks for an
//! outgoing payment already stamped with the transaction id.

use std::sync::Arc;

use secrecy::SecretString;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::errors::{DisburserError, Result};
use crate::finalize::Finalizer;
use crate::grant::{Disbursement, DisbursementReceipt, DisbursementStatus, GrantState, PoolGrant};
use crate::lock::{KeyGuard, KeyedLocks};
use crate::open_payments::{
    normalize_wallet_ref, Amount, AuthorizationClient, GrantOutcome, GrantRequest,
    IncomingPayment, NewIncomingPayment, NewOutgoingPayment, NewQuote, Quote, WalletAddress,
};
use crate::store::{GrantStore, Reservation};

#[derive(Debug, Clone, Deserialize)]
pub struct DisbursementRequest {
    #[serde(skip)]
    pub pool_id: String,
    pub recipient_wallet: String,
    pub amount: u64,
    pub transaction_id: String,
    pub recipient_label: Option<String>,
}

pub struct DisbursementOrchestrator {
    store: Arc<dyn GrantStore>,
    auth: Arc<dyn AuthorizationClient>,
    finalizer: Arc<Finalizer>,
    locks: KeyedLocks,
    finalize_on_disburse: bool,
    description: String,
}

impl DisbursementOrchestrator {
    pub fn new(
        store: Arc<dyn GrantStore>,
        auth: Arc<dyn AuthorizationClient>,
        finalizer: Arc<Finalizer>,
        finalize_on_disburse: bool,
        description: String,
    ) -> Self {
        Self {
            store,
            auth,
            finalizer,
            locks: KeyedLocks::new(),
            finalize_on_disburse,
            description,
        }
    }

    /// Pay `request.amount` to the recipient, at most once per transaction id.
    pub async fn disburse(&self, request: DisbursementRequest) -> Result<DisbursementReceipt> {
        validate(&request)?;
        let pool_id = request.pool_id.as_str();
        let transaction_id = request.transaction_id.as_str();

        let lock = self
            .locks
            .acquire(&format!("{pool_id}/{transaction_id}"))
            .await;

        let grant = self.usable_grant(pool_id).await?;
        let token = grant
            .finalized_token
            .clone()
            .ok_or_else(|| DisburserError::StateConflict {
                pool_id: pool_id.to_string(),
                state: grant.state,
                operation: "disburse",
            })?;

        let wanted = Disbursement::reserve(
            pool_id,
            transaction_id,
            normalize_wallet_ref(&request.recipient_wallet),
            request.recipient_label.clone(),
            request.amount,
        );

        let record = match self
            .store
            .reserve_disbursement(&wanted, grant.total.value)
            .await?
        {
            Reservation::Fresh(record) => {
                info!(pool_id, transaction_id, amount = record.amount, "Reserved disbursement");
                record
            }
            Reservation::Existing(existing) if !existing.same_request(&wanted) => {
                return Err(DisburserError::Validation(format!(
                    "transaction_id {transaction_id} was already used for a different disbursement"
                )));
            }
            Reservation::Existing(existing) => match existing.status {
                DisbursementStatus::Completed => {
                    info!(pool_id, transaction_id, "Disbursement already completed");
                    return existing.receipt().ok_or_else(|| DisburserError::Conflict {
                        pool_id: pool_id.to_string(),
                    });
                }
                DisbursementStatus::Submitting => {
                    match self.recover(&grant, &token, existing.clone()).await? {
                        Some(receipt) => return Ok(receipt),
                        None => existing,
                    }
                }
                DisbursementStatus::Reserved => {
                    info!(pool_id, transaction_id, "Resuming reserved disbursement");
                    existing
                }
            },
        };

        let reservation = ReservationGuard::new(self.store.clone(), &record, lock);
        self.execute(&grant, &token, record, reservation).await
    }

    /// Load the pool and make sure it holds a usable token.
    async fn usable_grant(&self, pool_id: &str) -> Result<PoolGrant> {
        let grant = self.store.load(pool_id).await?;
        let lazily_finalizable = match grant.state {
            GrantState::Finalized => return Ok(grant),
            GrantState::Authorized => true,
            GrantState::PendingAuth if !grant.expects_callback() => true,
            GrantState::PendingAuth => {
                return Err(DisburserError::NotYetAuthorized {
                    pool_id: pool_id.to_string(),
                })
            }
            _ => false,
        };

        if !(lazily_finalizable && self.finalize_on_disburse) {
            return Err(DisburserError::StateConflict {
                pool_id: pool_id.to_string(),
                state: grant.state,
                operation: "disburse",
            });
        }

        info!("Finalizing pool {pool_id} on first disbursement");
        self.finalizer.finalize(pool_id).await?;
        self.store.load(pool_id).await
    }

    /// Look for an outgoing payment a previous attempt may have created.
    async fn recover(
        &self,
        grant: &PoolGrant,
        token: &SecretString,
        mut record: Disbursement,
    ) -> Result<Option<DisbursementReceipt>> {
        let pool_id = record.pool_id.as_str();
        let transaction_id = record.transaction_id.as_str();
        warn!(pool_id, transaction_id, "Previous attempt stopped at the outgoing payment; checking sender");

        let sender = self.auth.resolve_wallet(&grant.sender_wallet).await?;
        let payments = self
            .auth
            .list_outgoing_payments(&sender.resource_server, token, &sender.id)
            .await?;

        let Some(found) = payments
            .into_iter()
            .find(|p| p.transaction_id() == Some(transaction_id))
        else {
            info!(pool_id, transaction_id, "No outgoing payment found; restarting the chain");
            return Ok(None);
        };

        info!(
            pool_id,
            transaction_id,
            outgoing_payment_id = %found.id,
            "Recovered outgoing payment"
        );
        record.outgoing_payment_id = Some(found.id);
        record.status = DisbursementStatus::Completed;
        self.store.update_disbursement(&record).await?;
        Ok(record.receipt())
    }

    async fn execute(
        &self,
        grant: &PoolGrant,
        token: &SecretString,
        mut record: Disbursement,
        mut reservation: ReservationGuard,
    ) -> Result<DisbursementReceipt> {
        let (sender, recipient) = match tokio::try_join!(
            self.auth.resolve_wallet(&grant.sender_wallet),
            self.auth.resolve_wallet(&record.recipient_wallet),
        ) {
            Ok(wallets) => wallets,
            Err(e) => return Err(self.abandon(&mut reservation, None, e).await),
        };
        if let Err(e) = check_recipient_asset(grant, &recipient) {
            return Err(self.abandon(&mut reservation, None, e).await);
        }

        let (incoming, quote_token) = tokio::join!(
            self.create_incoming_payment(&recipient, &record),
            self.sub_grant(&sender, GrantRequest::quote()),
        );
        let incoming = match incoming {
            Ok(incoming) => incoming,
            Err(e) => return Err(self.abandon(&mut reservation, None, e).await),
        };

        let quote = match quote_token {
            Ok(quote_token) => self.create_quote(&sender, &quote_token, &record, &incoming).await,
            Err(e) => Err(e),
        };
        let quote = match quote {
            Ok(quote) => quote,
            Err(e) => return Err(self.abandon(&mut reservation, Some(&incoming.id), e).await),
        };

        record.incoming_payment_id = Some(incoming.id.clone());
        record.quote_id = Some(quote.id.clone());
        record.status = DisbursementStatus::Submitting;
        if let Err(e) = self.store.update_disbursement(&record).await {
            return Err(self.abandon(&mut reservation, Some(&incoming.id), e).await);
        }
        reservation.disarm();

        let pool_id = record.pool_id.as_str();
        let transaction_id = record.transaction_id.as_str();
        let payment = NewOutgoingPayment {
            wallet_address: sender.id.clone(),
            quote_id: quote.id.clone(),
            metadata: json!({
                "description": self.description,
                "transactionId": transaction_id,
                "poolId": pool_id,
            }),
        };

        let outgoing = match self
            .auth
            .create_outgoing_payment(&sender.resource_server, token, &payment)
            .await
        {
            Ok(outgoing) => outgoing,
            Err(e @ DisburserError::UpstreamResource { value_at_risk: false, .. }) => {
                return Err(self.abandon(&mut reservation, Some(&incoming.id), e).await);
            }
            Err(e) => {
                error!(
                    pool_id,
                    transaction_id,
                    quote_id = %quote.id,
                    "Outgoing payment outcome unknown: {e}"
                );
                return Err(value_at_risk(e));
            }
        };

        info!(
            pool_id,
            transaction_id,
            outgoing_payment_id = %outgoing.id,
            "Created outgoing payment"
        );
        record.outgoing_payment_id = Some(outgoing.id);
        record.status = DisbursementStatus::Completed;
        if let Err(e) = self.store.update_disbursement(&record).await {
            // A retry finds the payment through its transaction id.
            error!(pool_id, transaction_id, "Could not record completed disbursement: {e}");
        }

        record.receipt().ok_or_else(|| DisburserError::Conflict {
            pool_id: record.pool_id.clone(),
        })
    }

    async fn sub_grant(&self, wallet: &WalletAddress, request: GrantRequest) -> Result<SecretString> {
        match self.auth.request_grant(&wallet.auth_server, &request).await? {
            GrantOutcome::Finalized(grant) => Ok(grant.access_token),
            GrantOutcome::Pending(_) => Err(DisburserError::UnexpectedInteractionRequired {
                access: request.access_kind(),
            }),
        }
    }

    async fn create_incoming_payment(
        &self,
        recipient: &WalletAddress,
        record: &Disbursement,
    ) -> Result<IncomingPayment> {
        let token = self
            .sub_grant(recipient, GrantRequest::incoming_payment())
            .await?;

        let mut metadata = json!({
            "description": self.description,
            "transactionId": record.transaction_id,
        });
        if let Some(label) = &record.recipient_label {
            metadata["recipientLabel"] = json!(label);
        }

        let incoming = self
            .auth
            .create_incoming_payment(
                &recipient.resource_server,
                &token,
                &NewIncomingPayment {
                    wallet_address: recipient.id.clone(),
                    incoming_amount: Amount::new(
                        record.amount,
                        &recipient.asset_code,
                        recipient.asset_scale,
                    ),
                    metadata,
                },
            )
            .await?;

        info!(
            pool_id = %record.pool_id,
            transaction_id = %record.transaction_id,
            incoming_payment_id = %incoming.id,
            "Created incoming payment"
        );
        Ok(incoming)
    }

    async fn create_quote(
        &self,
        sender: &WalletAddress,
        token: &SecretString,
        record: &Disbursement,
        incoming: &IncomingPayment,
    ) -> Result<Quote> {
        let quote = self
            .auth
            .create_quote(
                &sender.resource_server,
                token,
                &NewQuote {
                    wallet_address: sender.id.clone(),
                    receiver: incoming.id.clone(),
                    method: "ilp",
                },
            )
            .await?;

        info!(
            pool_id = %record.pool_id,
            transaction_id = %record.transaction_id,
            quote_id = %quote.id,
            debit_amount = quote.debit_amount.as_ref().map(|a| a.value.as_str()),
            "Created quote"
        );
        Ok(quote)
    }

    /// Give the reserved amount back after a failure that moved no value.
    async fn abandon(
        &self,
        reservation: &mut ReservationGuard,
        orphaned_incoming: Option<&str>,
        err: DisburserError,
    ) -> DisburserError {
        let pool_id = reservation.pool_id.as_str();
        let transaction_id = reservation.transaction_id.as_str();

        if let Some(incoming_payment_id) = orphaned_incoming {
            warn!(
                pool_id,
                transaction_id,
                incoming_payment_id,
                "Orphaned incoming payment left on recipient server"
            );
        }
        let released = self
            .store
            .release_disbursement(pool_id, transaction_id)
            .await;
        match released {
            Ok(()) => {
                warn!(pool_id, transaction_id, "Disbursement failed before moving value: {err}");
                reservation.disarm();
            }
            // Left armed so dropping the guard tries once more.
            Err(e) => error!(pool_id, transaction_id, "Could not release reservation: {e}"),
        }
        err
    }
}

/// Holds a reservation (and its transaction lock) until the outgoing payment
/// is about to be attempted.
///
/// Dropped while armed, it releases the reservation on a background task, so
/// a caller that disconnects before the checkpoint leaves nothing counted
/// against the pool. The transaction lock is held until the release lands.
struct ReservationGuard {
    store: Arc<dyn GrantStore>,
    pool_id: String,
    transaction_id: String,
    lock: Option<KeyGuard>,
    armed: bool,
}

impl ReservationGuard {
    fn new(store: Arc<dyn GrantStore>, record: &Disbursement, lock: KeyGuard) -> Self {
        Self {
            store,
            pool_id: record.pool_id.clone(),
            transaction_id: record.transaction_id.clone(),
            lock: Some(lock),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let pool_id = std::mem::take(&mut self.pool_id);
        let transaction_id = std::mem::take(&mut self.transaction_id);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!(%pool_id, %transaction_id, "No runtime to release an abandoned reservation");
            return;
        };

        let store = self.store.clone();
        let lock = self.lock.take();
        runtime.spawn(async move {
            let _lock = lock;
            match store.release_disbursement(&pool_id, &transaction_id).await {
                Ok(()) => warn!(
                    %pool_id,
                    %transaction_id,
                    "Disbursement cancelled before moving value; reservation released"
                ),
                Err(e) => error!(
                    %pool_id,
                    %transaction_id,
                    "Could not release cancelled reservation: {e}"
                ),
            }
        });
    }
}

/// The pool's limit is counted in the sender's asset, so every recipient
/// must be paid in that same asset.
fn check_recipient_asset(grant: &PoolGrant, recipient: &WalletAddress) -> Result<()> {
    if recipient.asset_code != grant.total.asset_code
        || recipient.asset_scale != grant.total.asset_scale
    {
        return Err(DisburserError::Validation(format!(
            "recipient wallet {} holds {} (scale {}), but pool {} is funded in {} (scale {})",
            recipient.id,
            recipient.asset_code,
            recipient.asset_scale,
            grant.pool_id,
            grant.total.asset_code,
            grant.total.asset_scale
        )));
    }
    Ok(())
}

fn value_at_risk(err: DisburserError) -> DisburserError {
    match err {
        DisburserError::UpstreamResource {
            resource,
            status,
            message,
            ..
        } => DisburserError::UpstreamResource {
            resource,
            status,
            message,
            value_at_risk: true,
        },
        other => DisburserError::UpstreamResource {
            resource: "outgoing payment",
            status: 0,
            message: other.to_string(),
            value_at_risk: true,
        },
    }
}

fn validate(request: &DisbursementRequest) -> Result<()> {
    if request.transaction_id.trim().is_empty() {
        return Err(DisburserError::Validation("transaction_id is required".into()));
    }
    if request.amount == 0 {
        return Err(DisburserError::Validation("amount must be greater than zero".into()));
    }
    if request.recipient_wallet.trim().is_empty() {
        return Err(DisburserError::Validation("recipient_wallet is required".into()));
    }
    Ok(())
}
