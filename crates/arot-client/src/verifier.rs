//! Token verification against the issuer's `vpn-manager` function.
//!
//! One request per call, no retries. The outcome is classified into a
//! [`VerifyResult`] rather than an error: every variant is an expected answer.

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use arot_core::config::IssuerConfig;

/// Outcome of a single verification attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResult {
    /// Token accepted.
    Ok,
    /// The request never reached the issuer.
    NoNetwork,
    /// The issuer answered with a non-success status or an unreadable body.
    ServerError { status: u16 },
    /// The issuer understood the request and refused the token.
    Rejected(String),
}

/// Expired tokens and exhausted bandwidth both call for a new token.
pub fn reason_needs_reissue(reason: &str) -> bool {
    let lower = reason.to_lowercase();
    lower.contains("expired") || lower.contains("bandwidth")
}

/// Verifies bearer tokens with the remote issuer.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> VerifyResult;
}

/// Verifier construction errors.
#[derive(Debug, Error)]
pub enum VerifierError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

#[derive(Debug, Serialize)]
struct VerifyRequest<'a> {
    action: &'static str,
    token: &'a str,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    #[serde(default)]
    success: bool,
    error: Option<String>,
}

/// reqwest-backed verifier.
#[derive(Debug)]
pub struct HttpTokenVerifier {
    http: reqwest::Client,
    url: String,
}

impl HttpTokenVerifier {
    /// Create a verifier for the configured issuer.
    pub fn new(config: &IssuerConfig) -> Result<Self, VerifierError> {
        if config.base_url.is_empty() {
            return Err(VerifierError::Config("issuer base_url is empty".into()));
        }

        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(&config.api_key)
            .map_err(|_| VerifierError::Config("Invalid API key format".into()))?;
        headers.insert("apikey", key);

        // reqwest is built with rustls-no-provider; the Err case only means a
        // provider was already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout())
            .build()?;

        Ok(Self {
            http,
            url: config.verify_url(),
        })
    }
}

#[async_trait]
impl TokenVerifier for HttpTokenVerifier {
    async fn verify(&self, token: &str) -> VerifyResult {
        let request = VerifyRequest {
            action: "verify",
            token,
        };
        let response = match self.http.post(&self.url).json(&request).send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(error = %e, url = %self.url, "Verification request failed");
                return VerifyResult::NoNetwork;
            }
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, %status, "Failed to read verification response");
                return VerifyResult::ServerError {
                    status: status.as_u16(),
                };
            }
        };
        let result = classify(status, &body);
        debug!(%status, ?result, "Token verification finished");
        result
    }
}

/// Map an issuer response onto a [`VerifyResult`].
pub fn classify(status: StatusCode, body: &str) -> VerifyResult {
    if !status.is_success() {
        return VerifyResult::ServerError {
            status: status.as_u16(),
        };
    }
    match serde_json::from_str::<VerifyResponse>(body) {
        Ok(resp) if resp.success => VerifyResult::Ok,
        Ok(resp) => VerifyResult::Rejected(resp.error.unwrap_or_else(|| "Invalid Token".into())),
        Err(e) => {
            warn!(error = %e, "Unreadable verification response");
            VerifyResult::ServerError {
                status: status.as_u16(),
            }
        }
    }
}
