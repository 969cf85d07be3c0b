//! Open Payments client: GNAP grant negotiation plus incoming payment, quote and
//! outgoing payment creation.
//!
//! ## Resilience
//!
//! * Idempotent reads (wallet address lookup, outgoing payment listing) are
//!   retried with exponential back-off, up to [`MAX_READ_ATTEMPTS`] attempts.
//! * Writes are never retried here. Whether a failed write may be repeated is
//!   the caller's decision.
//!
//! HTTP message signatures are not produced by this client; deployments that
//! require them put a signing proxy in front of it.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{DisburserError, Result};
use crate::grant::ContinuationHandle;

const MAX_READ_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF_MILLIS: u64 = 250;
const MAX_BACKOFF_MILLIS: u64 = 2_000;
const LIST_PAGE_SIZE: u32 = 100;

// ─────────────────────────────────────────────────────────
// Wire shapes
// ─────────────────────────────────────────────────────────

/// Public description of a wallet address.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletAddress {
    pub id: String,
    pub asset_code: String,
    pub asset_scale: u8,
    pub auth_server: String,
    pub resource_server: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Amount {
    pub value: String,
    pub asset_code: String,
    pub asset_scale: u8,
}

impl Amount {
    pub fn new(value: u64, asset_code: &str, asset_scale: u8) -> Self {
        Self {
            value: value.to_string(),
            asset_code: asset_code.to_string(),
            asset_scale,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessLimits {
    pub debit_amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessItem {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub actions: Vec<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limits: Option<AccessLimits>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessTokenRequest {
    pub access: Vec<AccessItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InteractFinish {
    pub method: &'static str,
    pub uri: String,
    pub nonce: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InteractRequest {
    pub start: Vec<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish: Option<InteractFinish>,
}

/// Body of a GNAP grant request, minus the `client` field which the
/// transport fills in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GrantRequest {
    pub access_token: AccessTokenRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interact: Option<InteractRequest>,
}

impl GrantRequest {
    /// Interactive grant for outgoing payments from `wallet`, capped at `limit`.
    pub fn outgoing_payment(wallet: &str, limit: Amount, finish: Option<InteractFinish>) -> Self {
        Self {
            access_token: AccessTokenRequest {
                access: vec![AccessItem {
                    kind: "outgoing-payment",
                    actions: vec!["read", "create", "list"],
                    identifier: Some(wallet.to_string()),
                    limits: Some(AccessLimits {
                        debit_amount: limit,
                    }),
                }],
            },
            interact: Some(InteractRequest {
                start: vec!["redirect"],
                finish,
            }),
        }
    }

    /// Non-interactive grant to create one incoming payment.
    pub fn incoming_payment() -> Self {
        Self::non_interactive("incoming-payment", vec!["read", "complete", "create"])
    }

    /// Non-interactive grant to create quotes.
    pub fn quote() -> Self {
        Self::non_interactive("quote", vec!["create", "read"])
    }

    fn non_interactive(kind: &'static str, actions: Vec<&'static str>) -> Self {
        Self {
            access_token: AccessTokenRequest {
                access: vec![AccessItem {
                    kind,
                    actions,
                    identifier: None,
                    limits: None,
                }],
            },
            interact: None,
        }
    }

    pub fn access_kind(&self) -> &'static str {
        self.access_token
            .access
            .first()
            .map(|a| a.kind)
            .unwrap_or("unknown")
    }
}

#[derive(Serialize)]
struct ClientGrantRequest<'a> {
    #[serde(flatten)]
    request: &'a GrantRequest,
    client: &'a str,
}

#[derive(Deserialize)]
struct RawToken {
    value: String,
    manage: Option<String>,
}

#[derive(Deserialize)]
struct RawContinue {
    access_token: RawToken,
    uri: String,
    wait: Option<u64>,
}

#[derive(Deserialize)]
struct RawInteract {
    redirect: Option<String>,
    finish: Option<String>,
}

#[derive(Deserialize)]
struct RawGrantResponse {
    access_token: Option<RawToken>,
    #[serde(rename = "continue")]
    continuation: Option<RawContinue>,
    interact: Option<RawInteract>,
}

#[derive(Deserialize)]
struct RawGnapError {
    error: Value,
}

impl From<RawContinue> for ContinuationHandle {
    fn from(raw: RawContinue) -> Self {
        ContinuationHandle {
            uri: raw.uri,
            access_token: SecretString::from(raw.access_token.value),
            wait_secs: raw.wait,
        }
    }
}

/// A grant still waiting for the resource owner.
#[derive(Debug, Clone)]
pub struct PendingGrant {
    pub redirect: Option<String>,
    /// The authorization server's half of the finish hash.
    pub finish_nonce: Option<String>,
    pub continuation: ContinuationHandle,
}

/// A grant that carries an access token.
#[derive(Debug, Clone)]
pub struct FinalizedGrant {
    pub access_token: SecretString,
    pub manage_uri: Option<String>,
    pub continuation: Option<ContinuationHandle>,
}

#[derive(Debug, Clone)]
pub enum GrantOutcome {
    Pending(PendingGrant),
    Finalized(FinalizedGrant),
}

impl TryFrom<RawGrantResponse> for GrantOutcome {
    type Error = DisburserError;

    fn try_from(raw: RawGrantResponse) -> Result<Self> {
        if let Some(token) = raw.access_token {
            return Ok(Self::Finalized(FinalizedGrant {
                access_token: SecretString::from(token.value),
                manage_uri: token.manage,
                continuation: raw.continuation.map(ContinuationHandle::from),
            }));
        }

        let continuation = raw.continuation.ok_or_else(|| DisburserError::UpstreamAuthorization {
            status: 200,
            message: "grant response has neither access_token nor continue".to_string(),
            retryable: false,
        })?;
        let (redirect, finish_nonce) = raw
            .interact
            .map(|i| (i.redirect, i.finish))
            .unwrap_or((None, None));

        Ok(Self::Pending(PendingGrant {
            redirect,
            finish_nonce,
            continuation: continuation.into(),
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewIncomingPayment {
    pub wallet_address: String,
    pub incoming_amount: Amount,
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingPayment {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewQuote {
    pub wallet_address: String,
    pub receiver: String,
    pub method: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub id: String,
    pub debit_amount: Option<Amount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOutgoingPayment {
    pub wallet_address: String,
    pub quote_id: String,
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingPayment {
    pub id: String,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl OutgoingPayment {
    /// Transaction id this service stamped into the payment's metadata.
    pub fn transaction_id(&self) -> Option<&str> {
        self.metadata.as_ref()?.get("transactionId")?.as_str()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

#[derive(Deserialize)]
struct OutgoingPaymentPage {
    pagination: Option<PageInfo>,
    result: Vec<OutgoingPayment>,
}

// ─────────────────────────────────────────────────────────
// Port
// ─────────────────────────────────────────────────────────

/// Everything the orchestrators need from authorization and resource servers.
#[async_trait]
pub trait AuthorizationClient: Send + Sync {
    async fn resolve_wallet(&self, wallet_ref: &str) -> Result<WalletAddress>;

    async fn request_grant(&self, auth_server: &str, request: &GrantRequest) -> Result<GrantOutcome>;

    async fn continue_grant(
        &self,
        handle: &ContinuationHandle,
        interact_ref: Option<&str>,
    ) -> Result<GrantOutcome>;

    async fn create_incoming_payment(
        &self,
        resource_server: &str,
        token: &SecretString,
        payment: &NewIncomingPayment,
    ) -> Result<IncomingPayment>;

    async fn create_quote(
        &self,
        resource_server: &str,
        token: &SecretString,
        quote: &NewQuote,
    ) -> Result<Quote>;

    async fn create_outgoing_payment(
        &self,
        resource_server: &str,
        token: &SecretString,
        payment: &NewOutgoingPayment,
    ) -> Result<OutgoingPayment>;

    async fn list_outgoing_payments(
        &self,
        resource_server: &str,
        token: &SecretString,
        wallet_address: &str,
    ) -> Result<Vec<OutgoingPayment>>;
}

// ─────────────────────────────────────────────────────────
// HTTP implementation
// ─────────────────────────────────────────────────────────

pub struct OpenPaymentsClient {
    client: Client,
    /// Wallet address that identifies this service to authorization servers.
    client_wallet: String,
}

impl OpenPaymentsClient {
    pub fn new(client: Client, client_wallet: String) -> Self {
        Self {
            client,
            client_wallet,
        }
    }

    fn authorized(builder: RequestBuilder, token: &SecretString) -> RequestBuilder {
        builder.header(
            reqwest::header::AUTHORIZATION,
            format!("GNAP {}", token.expose_secret()),
        )
    }

    /// Send an idempotent GET, retrying connection failures and 5xx/429.
    async fn get_with_backoff(&self, build: impl Fn() -> RequestBuilder) -> Result<Response> {
        let mut backoff = INITIAL_BACKOFF_MILLIS;
        let mut attempt = 1;

        loop {
            match build().send().await {
                Err(e) if attempt < MAX_READ_ATTEMPTS => {
                    warn!("GET failed (attempt {attempt}, retrying in {backoff}ms): {e}");
                }
                Err(e) => return Err(e.into()),
                Ok(resp)
                    if attempt < MAX_READ_ATTEMPTS
                        && (resp.status().is_server_error()
                            || resp.status() == StatusCode::TOO_MANY_REQUESTS) =>
                {
                    warn!(
                        "GET returned {} (attempt {attempt}, retrying in {backoff}ms)",
                        resp.status()
                    );
                }
                Ok(resp) => return Ok(resp),
            }

            tokio::time::sleep(Duration::from_millis(backoff)).await;
            backoff = (backoff * 2).min(MAX_BACKOFF_MILLIS);
            attempt += 1;
        }
    }

    async fn read_grant_response(response: Response) -> Result<GrantOutcome> {
        let status = response.status();
        if !status.is_success() {
            return Err(authorization_error(status, response).await);
        }
        let raw: RawGrantResponse = response.json().await?;
        GrantOutcome::try_from(raw)
    }
}

async fn error_body(response: Response) -> String {
    response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string())
}

/// Map a failed authorization server response onto the error taxonomy.
///
/// Server-side failures, rate limiting and GNAP `too_fast` are transient;
/// every other rejection means the request itself will not succeed again.
async fn authorization_error(status: StatusCode, response: Response) -> DisburserError {
    let message = error_body(response).await;
    let code = serde_json::from_str::<RawGnapError>(&message)
        .ok()
        .and_then(|e| match e.error {
            Value::String(code) => Some(code),
            Value::Object(map) => map.get("code").and_then(|c| c.as_str()).map(String::from),
            _ => None,
        });

    let retryable = status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || code.as_deref() == Some("too_fast");

    DisburserError::UpstreamAuthorization {
        status: status.as_u16(),
        message,
        retryable,
    }
}

async fn resource_error(resource: &'static str, status: StatusCode, response: Response) -> DisburserError {
    DisburserError::UpstreamResource {
        resource,
        status: status.as_u16(),
        message: error_body(response).await,
        value_at_risk: false,
    }
}

#[async_trait]
impl AuthorizationClient for OpenPaymentsClient {
    async fn resolve_wallet(&self, wallet_ref: &str) -> Result<WalletAddress> {
        let url = normalize_wallet_ref(wallet_ref);
        let response = self
            .get_with_backoff(|| {
                self.client
                    .get(&url)
                    .header(reqwest::header::ACCEPT, "application/json")
            })
            .await?;

        let status = response.status();
        if status.is_client_error() {
            return Err(DisburserError::Validation(format!(
                "wallet address {wallet_ref} could not be resolved (status {status})"
            )));
        }
        if !status.is_success() {
            return Err(resource_error("wallet address", status, response).await);
        }

        let wallet: WalletAddress = response.json().await?;
        debug!("Resolved wallet address {} ({})", wallet.id, wallet.asset_code);
        Ok(wallet)
    }

    async fn request_grant(&self, auth_server: &str, request: &GrantRequest) -> Result<GrantOutcome> {
        let response = self
            .client
            .post(auth_server)
            .json(&ClientGrantRequest {
                request,
                client: &self.client_wallet,
            })
            .send()
            .await?;
        Self::read_grant_response(response).await
    }

    async fn continue_grant(
        &self,
        handle: &ContinuationHandle,
        interact_ref: Option<&str>,
    ) -> Result<GrantOutcome> {
        let body = match interact_ref {
            Some(interact_ref) => serde_json::json!({ "interact_ref": interact_ref }),
            None => serde_json::json!({}),
        };
        let response = Self::authorized(self.client.post(&handle.uri), &handle.access_token)
            .json(&body)
            .send()
            .await?;
        Self::read_grant_response(response).await
    }

    async fn create_incoming_payment(
        &self,
        resource_server: &str,
        token: &SecretString,
        payment: &NewIncomingPayment,
    ) -> Result<IncomingPayment> {
        let url = format!("{}/incoming-payments", resource_server.trim_end_matches('/'));
        let response = Self::authorized(self.client.post(&url), token)
            .json(payment)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(resource_error("incoming payment", status, response).await);
        }
        Ok(response.json().await?)
    }

    async fn create_quote(
        &self,
        resource_server: &str,
        token: &SecretString,
        quote: &NewQuote,
    ) -> Result<Quote> {
        let url = format!("{}/quotes", resource_server.trim_end_matches('/'));
        let response = Self::authorized(self.client.post(&url), token)
            .json(quote)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(resource_error("quote", status, response).await);
        }
        Ok(response.json().await?)
    }

    async fn create_outgoing_payment(
        &self,
        resource_server: &str,
        token: &SecretString,
        payment: &NewOutgoingPayment,
    ) -> Result<OutgoingPayment> {
        let url = format!("{}/outgoing-payments", resource_server.trim_end_matches('/'));
        let response = Self::authorized(self.client.post(&url), token)
            .json(payment)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let mut err = resource_error("outgoing payment", status, response).await;
            // A 5xx leaves it unknown whether the payment was created.
            if let DisburserError::UpstreamResource { value_at_risk, .. } = &mut err {
                *value_at_risk = status.is_server_error();
            }
            return Err(err);
        }
        Ok(response.json().await?)
    }

    async fn list_outgoing_payments(
        &self,
        resource_server: &str,
        token: &SecretString,
        wallet_address: &str,
    ) -> Result<Vec<OutgoingPayment>> {
        let url = format!("{}/outgoing-payments", resource_server.trim_end_matches('/'));
        let mut payments = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let response = self
                .get_with_backoff(|| {
                    let mut query = vec![
                        ("wallet-address", wallet_address.to_string()),
                        ("first", LIST_PAGE_SIZE.to_string()),
                    ];
                    if let Some(cursor) = &cursor {
                        query.push(("cursor", cursor.clone()));
                    }
                    Self::authorized(self.client.get(&url), token).query(&query)
                })
                .await?;

            let status = response.status();
            if !status.is_success() {
                return Err(resource_error("outgoing payment listing", status, response).await);
            }

            let page: OutgoingPaymentPage = response.json().await?;
            payments.extend(page.result);

            match page.pagination {
                Some(PageInfo {
                    has_next_page: true,
                    end_cursor: Some(next),
                }) => cursor = Some(next),
                _ => break,
            }
        }

        debug!("Listed {} outgoing payments for {wallet_address}", payments.len());
        Ok(payments)
    }
}

/// Accept payment pointers (`$wallet.example/alice`) as well as URLs.
pub fn normalize_wallet_ref(wallet_ref: &str) -> String {
    match wallet_ref.strip_prefix('$') {
        Some(rest) => format!("https://{rest}"),
        None => wallet_ref.to_string(),
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
