//! Database layer: migrations and the SQLite-backed [`GrantStore`].

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{SqliteExecutor, SqlitePool};
use tracing::{info, warn};

use crate::errors::{DisburserError, Result};
use crate::grant::{
    AssetAmount, ContinuationHandle, Disbursement, DisbursementStatus, GrantState,
    InteractionNonces, PoolGrant,
};
use crate::store::{GrantMutation, GrantStore, Reservation};

/// Establish a SQLite connection pool and run pending migrations.
///
/// Commits are fully synced to disk before a write reports success.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    let options = SqliteConnectOptions::from_str(&url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

// ─────────────────────────────────────────────────────────
// Row shapes
// ─────────────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct GrantRow {
    pool_id: String,
    state: String,
    sender_wallet: String,
    receiver_wallet: String,
    total_value: i64,
    asset_code: String,
    asset_scale: i64,
    grant_endpoint: Option<String>,
    redirect_uri: Option<String>,
    continue_uri: Option<String>,
    continue_token: Option<String>,
    continue_wait_secs: Option<i64>,
    client_nonce: Option<String>,
    finish_nonce: Option<String>,
    interaction_correlator: Option<String>,
    finalized_token: Option<String>,
    created_at: i64,
    last_transition_at: i64,
    version: i64,
}

#[derive(sqlx::FromRow)]
struct DisbursementRow {
    pool_id: String,
    transaction_id: String,
    recipient_wallet: String,
    recipient_label: Option<String>,
    amount: i64,
    status: String,
    incoming_payment_id: Option<String>,
    quote_id: Option<String>,
    outgoing_payment_id: Option<String>,
}

fn corrupt(what: String) -> DisburserError {
    DisburserError::Database(sqlx::Error::Decode(what.into()))
}

fn timestamp(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| corrupt(format!("bad timestamp {millis}")))
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| DisburserError::Validation(format!("amount {value} is out of range")))
}

impl TryFrom<GrantRow> for PoolGrant {
    type Error = DisburserError;

    fn try_from(row: GrantRow) -> Result<Self> {
        let state = GrantState::parse(&row.state)
            .ok_or_else(|| corrupt(format!("unknown grant state '{}'", row.state)))?;

        let continuation = match (row.continue_uri, row.continue_token) {
            (Some(uri), Some(token)) => Some(ContinuationHandle {
                uri,
                access_token: SecretString::from(token),
                wait_secs: row.continue_wait_secs.map(|w| w.max(0) as u64),
            }),
            _ => None,
        };

        let nonces = match (row.client_nonce, row.finish_nonce) {
            (Some(client_nonce), Some(finish_nonce)) => Some(InteractionNonces {
                client_nonce,
                finish_nonce,
            }),
            _ => None,
        };

        Ok(PoolGrant {
            pool_id: row.pool_id,
            state,
            sender_wallet: row.sender_wallet,
            receiver_wallet: row.receiver_wallet,
            total: AssetAmount {
                value: u64::try_from(row.total_value)
                    .map_err(|_| corrupt(format!("negative total {}", row.total_value)))?,
                asset_code: row.asset_code,
                asset_scale: u8::try_from(row.asset_scale)
                    .map_err(|_| corrupt(format!("bad asset scale {}", row.asset_scale)))?,
            },
            grant_endpoint: row.grant_endpoint,
            redirect_uri: row.redirect_uri,
            continuation,
            nonces,
            interaction_correlator: row.interaction_correlator,
            finalized_token: row.finalized_token.map(SecretString::from),
            created_at: timestamp(row.created_at)?,
            last_transition_at: timestamp(row.last_transition_at)?,
            version: row.version,
        })
    }
}

impl TryFrom<DisbursementRow> for Disbursement {
    type Error = DisburserError;

    fn try_from(row: DisbursementRow) -> Result<Self> {
        Ok(Disbursement {
            status: DisbursementStatus::parse(&row.status)
                .ok_or_else(|| corrupt(format!("unknown disbursement status '{}'", row.status)))?,
            amount: u64::try_from(row.amount)
                .map_err(|_| corrupt(format!("negative amount {}", row.amount)))?,
            pool_id: row.pool_id,
            transaction_id: row.transaction_id,
            recipient_wallet: row.recipient_wallet,
            recipient_label: row.recipient_label,
            incoming_payment_id: row.incoming_payment_id,
            quote_id: row.quote_id,
            outgoing_payment_id: row.outgoing_payment_id,
        })
    }
}

// ─────────────────────────────────────────────────────────
// Queries
// ─────────────────────────────────────────────────────────

const SELECT_GRANT: &str = r#"
    SELECT pool_id, state, sender_wallet, receiver_wallet, total_value, asset_code,
           asset_scale, grant_endpoint, redirect_uri, continue_uri, continue_token,
           continue_wait_secs, client_nonce, finish_nonce, interaction_correlator,
           finalized_token, created_at, last_transition_at, version
    FROM   pool_grants
    WHERE  pool_id = ?1
"#;

async fn fetch_grant<'e>(db: impl SqliteExecutor<'e>, pool_id: &str) -> Result<Option<PoolGrant>> {
    let row = sqlx::query_as::<_, GrantRow>(SELECT_GRANT)
        .bind(pool_id)
        .fetch_optional(db)
        .await?;
    row.map(PoolGrant::try_from).transpose()
}

async fn fetch_disbursement<'e>(
    db: impl SqliteExecutor<'e>,
    pool_id: &str,
    transaction_id: &str,
) -> Result<Option<Disbursement>> {
    let row = sqlx::query_as::<_, DisbursementRow>(
        r#"
        SELECT pool_id, transaction_id, recipient_wallet, recipient_label, amount, status,
               incoming_payment_id, quote_id, outgoing_payment_id
        FROM   disbursements
        WHERE  pool_id = ?1 AND transaction_id = ?2
        "#,
    )
    .bind(pool_id)
    .bind(transaction_id)
    .fetch_optional(db)
    .await?;
    row.map(Disbursement::try_from).transpose()
}

async fn sum_disbursed<'e>(db: impl SqliteExecutor<'e>, pool_id: &str) -> Result<u64> {
    let (total,): (i64,) =
        sqlx::query_as("SELECT COALESCE(SUM(amount), 0) FROM disbursements WHERE pool_id = ?1")
            .bind(pool_id)
            .fetch_one(db)
            .await?;
    Ok(total.max(0) as u64)
}

/// Overwrite every column of the record, provided nobody else committed
/// since `expected_version` was read. Returns whether the row was written.
async fn write_grant<'e>(
    db: impl SqliteExecutor<'e>,
    grant: &PoolGrant,
    expected_version: i64,
) -> Result<bool> {
    let continuation = grant.continuation.as_ref();
    let nonces = grant.nonces.as_ref();
    let rows = sqlx::query(
        r#"
        UPDATE pool_grants
        SET    state = ?1, sender_wallet = ?2, receiver_wallet = ?3, total_value = ?4,
               asset_code = ?5, asset_scale = ?6, grant_endpoint = ?7, redirect_uri = ?8,
               continue_uri = ?9, continue_token = ?10, continue_wait_secs = ?11,
               client_nonce = ?12, finish_nonce = ?13, interaction_correlator = ?14,
               finalized_token = ?15, created_at = ?16, last_transition_at = ?17,
               version = ?18
        WHERE  pool_id = ?19 AND version = ?20
        "#,
    )
    .bind(grant.state.as_str())
    .bind(&grant.sender_wallet)
    .bind(&grant.receiver_wallet)
    .bind(to_i64(grant.total.value)?)
    .bind(&grant.total.asset_code)
    .bind(i64::from(grant.total.asset_scale))
    .bind(&grant.grant_endpoint)
    .bind(&grant.redirect_uri)
    .bind(continuation.map(|c| c.uri.as_str()))
    .bind(continuation.map(|c| c.access_token.expose_secret()))
    .bind(continuation.and_then(|c| c.wait_secs).map(|w| w as i64))
    .bind(nonces.map(|n| n.client_nonce.as_str()))
    .bind(nonces.map(|n| n.finish_nonce.as_str()))
    .bind(&grant.interaction_correlator)
    .bind(grant.finalized_token.as_ref().map(|t| t.expose_secret()))
    .bind(grant.created_at.timestamp_millis())
    .bind(grant.last_transition_at.timestamp_millis())
    .bind(expected_version + 1)
    .bind(&grant.pool_id)
    .bind(expected_version)
    .execute(db)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

// ─────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────

/// SQLite implementation of [`GrantStore`].
///
/// Per-pool serialization comes from the `version` column: every write is a
/// single conditional `UPDATE` against the version it was derived from.
#[derive(Debug, Clone)]
pub struct SqliteGrantStore {
    pool: SqlitePool,
}

impl SqliteGrantStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GrantStore for SqliteGrantStore {
    async fn get(&self, pool_id: &str) -> Result<Option<PoolGrant>> {
        fetch_grant(&self.pool, pool_id).await
    }

    async fn put(&self, grant: &PoolGrant) -> Result<PoolGrant> {
        let mut tx = self.pool.begin().await?;

        // A placeholder row is inserted first so creation and replacement
        // both go through the same versioned write. It is never visible
        // outside this transaction.
        let inserted = sqlx::query(
            r#"
            INSERT INTO pool_grants
                (pool_id, state, sender_wallet, receiver_wallet, total_value, asset_code,
                 asset_scale, created_at, last_transition_at, version)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8, 0)
            ON CONFLICT (pool_id) DO NOTHING
            "#,
        )
        .bind(&grant.pool_id)
        .bind(GrantState::Failed.as_str())
        .bind(&grant.sender_wallet)
        .bind(&grant.receiver_wallet)
        .bind(to_i64(grant.total.value)?)
        .bind(&grant.total.asset_code)
        .bind(i64::from(grant.total.asset_scale))
        .bind(grant.created_at.timestamp_millis())
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        let existing = fetch_grant(&mut *tx, &grant.pool_id)
            .await?
            .ok_or_else(|| DisburserError::Conflict {
                pool_id: grant.pool_id.clone(),
            })?;

        if !inserted && !existing.state.is_terminal() {
            return Err(DisburserError::StateConflict {
                pool_id: grant.pool_id.clone(),
                state: existing.state,
                operation: "request a new pool grant",
            });
        }

        sqlx::query("DELETE FROM disbursements WHERE pool_id = ?1")
            .bind(&grant.pool_id)
            .execute(&mut *tx)
            .await?;

        if !write_grant(&mut *tx, grant, existing.version).await? {
            return Err(DisburserError::Conflict {
                pool_id: grant.pool_id.clone(),
            });
        }
        tx.commit().await?;

        let mut stored = grant.clone();
        stored.version = existing.version + 1;
        Ok(stored)
    }

    async fn compare_and_transition(
        &self,
        pool_id: &str,
        expected: GrantState,
        operation: &'static str,
        mutation: GrantMutation<'_>,
    ) -> Result<PoolGrant> {
        let current = self.load(pool_id).await?;
        if current.state != expected {
            return Err(DisburserError::StateConflict {
                pool_id: pool_id.to_string(),
                state: current.state,
                operation,
            });
        }

        let mut next = current.clone();
        mutation(&mut next)?;

        if !write_grant(&self.pool, &next, current.version).await? {
            warn!(pool_id, operation, "Lost a concurrent update on pool grant");
            let latest = self.load(pool_id).await?;
            if latest.state != expected {
                return Err(DisburserError::StateConflict {
                    pool_id: pool_id.to_string(),
                    state: latest.state,
                    operation,
                });
            }
            return Err(DisburserError::Conflict {
                pool_id: pool_id.to_string(),
            });
        }

        next.version = current.version + 1;
        Ok(next)
    }

    async fn reserve_disbursement(
        &self,
        disbursement: &Disbursement,
        limit: u64,
    ) -> Result<Reservation> {
        // Limit check and insert are one statement, so two reservations on the
        // same pool can never both see the old total.
        let inserted = sqlx::query(
            r#"
            INSERT INTO disbursements
                (pool_id, transaction_id, recipient_wallet, recipient_label, amount, status)
            SELECT ?1, ?2, ?3, ?4, ?5, ?6
            WHERE  ?5 + (SELECT COALESCE(SUM(amount), 0) FROM disbursements WHERE pool_id = ?1) <= ?7
            ON CONFLICT (pool_id, transaction_id) DO NOTHING
            "#,
        )
        .bind(&disbursement.pool_id)
        .bind(&disbursement.transaction_id)
        .bind(&disbursement.recipient_wallet)
        .bind(&disbursement.recipient_label)
        .bind(to_i64(disbursement.amount)?)
        .bind(disbursement.status.as_str())
        .bind(to_i64(limit)?)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            return Ok(Reservation::Fresh(disbursement.clone()));
        }

        if let Some(existing) = fetch_disbursement(
            &self.pool,
            &disbursement.pool_id,
            &disbursement.transaction_id,
        )
        .await?
        {
            return Ok(Reservation::Existing(existing));
        }

        let disbursed = sum_disbursed(&self.pool, &disbursement.pool_id).await?;
        Err(DisburserError::ExhaustedGrant {
            pool_id: disbursement.pool_id.clone(),
            requested: disbursement.amount,
            remaining: limit.saturating_sub(disbursed),
        })
    }

    async fn update_disbursement(&self, disbursement: &Disbursement) -> Result<()> {
        let rows = sqlx::query(
            r#"
            UPDATE disbursements
            SET    status = ?1, incoming_payment_id = ?2, quote_id = ?3,
                   outgoing_payment_id = ?4, updated_at = strftime('%s', 'now')
            WHERE  pool_id = ?5 AND transaction_id = ?6
            "#,
        )
        .bind(disbursement.status.as_str())
        .bind(&disbursement.incoming_payment_id)
        .bind(&disbursement.quote_id)
        .bind(&disbursement.outgoing_payment_id)
        .bind(&disbursement.pool_id)
        .bind(&disbursement.transaction_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            return Err(DisburserError::Conflict {
                pool_id: disbursement.pool_id.clone(),
            });
        }
        Ok(())
    }

    async fn release_disbursement(&self, pool_id: &str, transaction_id: &str) -> Result<()> {
        sqlx::query(
            "DELETE FROM disbursements WHERE pool_id = ?1 AND transaction_id = ?2 AND status != ?3",
        )
        .bind(pool_id)
        .bind(transaction_id)
        .bind(DisbursementStatus::Completed.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn disbursed_total(&self, pool_id: &str) -> Result<u64> {
        sum_disbursed(&self.pool, pool_id).await
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
