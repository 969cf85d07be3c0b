//! Application configuration loaded from environment variables.

use url::Url;

use crate::errors::{DisburserError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database holding pool grants and disbursements (`memory` for a
    /// throwaway in-process store)
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// Public base URL of this service; the default callback is derived from it.
    /// Empty `SERVICE_URL` disables the default, so grants without a callback are polled.
    pub service_url: Option<Url>,
    /// Where funders are sent after the callback (operator controlled)
    pub operator_redirect_url: Url,
    /// Wallet address identifying this service to authorization servers
    pub client_wallet_address: String,
    /// Timeout for every outbound request
    pub http_timeout_secs: u64,
    /// Finalize an authorized pool on its first disbursement
    pub finalize_on_disburse: bool,
    /// Reject callbacks without the interaction `hash`
    pub require_interact_hash: bool,
    /// Description stamped on incoming and outgoing payments
    pub incoming_payment_description: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env_var = |key: &str| {
            lookup(key).ok_or_else(|| DisburserError::Config(format!("Missing env var: {key}")))
        };

        let api_port: u16 = env_var("API_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|_| DisburserError::Config("Invalid API_PORT".to_string()))?;

        let service_url = match lookup("SERVICE_URL") {
            Some(raw) if raw.trim().is_empty() => None,
            Some(raw) => Some(parse_url("SERVICE_URL", &raw)?),
            None => Some(parse_url("SERVICE_URL", &format!("http://localhost:{api_port}"))?),
        };

        Ok(Config {
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./pool_grants.db".to_string()),
            api_port,
            service_url,
            operator_redirect_url: env_var("OPERATOR_REDIRECT_URL")
                .and_then(|raw| parse_url("OPERATOR_REDIRECT_URL", &raw))?,
            client_wallet_address: env_var("CLIENT_WALLET_ADDRESS_URL")?,
            http_timeout_secs: env_var("HTTP_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .map_err(|_| DisburserError::Config("Invalid HTTP_TIMEOUT_SECS".to_string()))?,
            finalize_on_disburse: parse_flag(
                lookup("FINALIZE_ON_DISBURSE"),
                true,
                "FINALIZE_ON_DISBURSE",
            )?,
            require_interact_hash: parse_flag(
                lookup("REQUIRE_INTERACT_HASH"),
                false,
                "REQUIRE_INTERACT_HASH",
            )?,
            incoming_payment_description: env_var("INCOMING_PAYMENT_DESCRIPTION")
                .unwrap_or_else(|_| "Pool disbursement".to_string()),
        })
    }
}

fn parse_url(key: &str, raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| DisburserError::Config(format!("Invalid {key}: {e}")))
}

fn parse_flag(raw: Option<String>, default: bool, key: &str) -> Result<bool> {
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(default),
        Some("1" | "true" | "yes") => Ok(true),
        Some("0" | "false" | "no") => Ok(false),
        Some(_) => Err(DisburserError::Config(format!("Invalid {key}"))),
    }
}
