//! Signed HTTP implementations of the provider interfaces.
//!
//! Provider services (rails, fulfillment, audit, live updates) are separate
//! deployments reached over HTTPS. Every request body is signed with
//! HMAC-SHA256 so providers can verify the caller, and every client carries
//! a bounded timeout so a slow provider cannot hold a payment open forever.

use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;
use uuid::Uuid;

use crate::error::LedgerError;
use crate::providers::{
    BankRail, FulfillmentProvider, FulfillmentRequest, FulfillmentResult, PayRequest,
    RailErrorClass, RailReceipt, RefundStatus,
};

type HmacSha256 = Hmac<Sha256>;

/// `sha256=<hex>` signature over the exact request body.
///
/// Receivers recompute HMAC-SHA256(secret, body) and compare in constant
/// time.
pub fn sign_payload(secret: &str, payload: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC key length is valid");
    mac.update(payload.as_bytes());
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Hex SHA-256 of a payload, used as the external ledger reference hash.
pub fn payload_hash(payload: &str) -> String {
    hex::encode(Sha256::digest(payload.as_bytes()))
}

/// Validate a configured provider endpoint.
///
/// # Rules
///
/// - Must be a valid URL, at most 2048 characters
/// - Must be HTTPS; plain HTTP only for localhost (development)
pub fn validate_endpoint_url(url: &str) -> Result<Url, LedgerError> {
    if url.len() > 2048 {
        return Err(LedgerError::Validation(
            "endpoint URL exceeds 2048 characters".to_string(),
        ));
    }

    let parsed = Url::parse(url)
        .map_err(|_| LedgerError::Validation(format!("invalid endpoint URL: {url}")))?;

    match parsed.scheme() {
        "https" => Ok(parsed),
        "http" => {
            if matches!(
                parsed.host_str(),
                Some("localhost") | Some("127.0.0.1") | Some("0.0.0.0")
            ) {
                Ok(parsed)
            } else {
                Err(LedgerError::Validation(
                    "HTTP is only allowed for localhost endpoints".to_string(),
                ))
            }
        }
        _ => Err(LedgerError::Validation(
            "endpoint URL must use HTTP or HTTPS".to_string(),
        )),
    }
}

/// Shared signed-POST client for one provider deployment.
pub struct ProviderClient {
    client: reqwest::Client,
    base: Url,
    secret: String,
}

impl ProviderClient {
    pub fn new(base_url: &str, secret: &str, timeout: Duration) -> Result<Self, LedgerError> {
        let base = validate_endpoint_url(base_url)?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base,
            secret: secret.to_string(),
        })
    }

    async fn post_signed<B: Serialize, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, LedgerError> {
        let payload = serde_json::to_string(body)
            .map_err(|e| LedgerError::Validation(format!("payload serialization failed: {e}")))?;
        let url = self
            .base
            .join(path)
            .map_err(|e| LedgerError::Validation(format!("bad provider path '{path}': {e}")))?;

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("X-Signature", sign_payload(&self.secret, &payload))
            .body(payload)
            .send()
            .await?
            .error_for_status()?;

        Ok(response.json::<R>().await?)
    }
}

#[derive(Debug, Deserialize)]
struct PayResponse {
    status: String,
    rail_reference: Option<String>,
    error_class: Option<RailErrorClass>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DebitResponse {
    success: bool,
    rail_reference: Option<String>,
    error_class: Option<RailErrorClass>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefundStatusResponse {
    status: RefundStatus,
}

#[derive(Debug, Serialize)]
struct DebitBody<'a> {
    account_ref: &'a str,
    amount_cents: i64,
    reason: &'a str,
}

#[derive(Debug, Serialize)]
struct RefundStatusBody<'a> {
    rail_reference: &'a str,
}

/// Bank/card/UPI rail over the rail-gateway service.
///
/// An unreachable gateway is reported as `BankDown`: from the ledger's
/// point of view a rail that cannot be reached and a rail that is down are
/// the same thing, and both are fallback-eligible.
pub struct HttpBankRail {
    client: ProviderClient,
}

impl HttpBankRail {
    pub fn new(base_url: &str, secret: &str, timeout: Duration) -> Result<Self, LedgerError> {
        Ok(Self {
            client: ProviderClient::new(base_url, secret, timeout)?,
        })
    }

    fn transport_as_bank_down(err: LedgerError) -> LedgerError {
        match err {
            LedgerError::Transport(e) => LedgerError::Rail {
                class: RailErrorClass::BankDown,
                message: format!("rail unreachable: {e}"),
            },
            other => other,
        }
    }
}

#[async_trait]
impl BankRail for HttpBankRail {
    async fn pay(&self, request: &PayRequest) -> Result<RailReceipt, LedgerError> {
        let response: PayResponse = self
            .client
            .post_signed("pay", request)
            .await
            .map_err(Self::transport_as_bank_down)?;

        match (response.status.as_str(), response.rail_reference) {
            ("captured", Some(rail_reference)) => Ok(RailReceipt { rail_reference }),
            _ => Err(LedgerError::Rail {
                class: response.error_class.unwrap_or(RailErrorClass::GenericDecline),
                message: response
                    .message
                    .unwrap_or_else(|| "rail declined the payment".to_string()),
            }),
        }
    }

    async fn debit(
        &self,
        account_ref: &str,
        amount_cents: i64,
        reason: &str,
    ) -> Result<RailReceipt, LedgerError> {
        let body = DebitBody {
            account_ref,
            amount_cents,
            reason,
        };
        let response: DebitResponse = self
            .client
            .post_signed("debit", &body)
            .await
            .map_err(Self::transport_as_bank_down)?;

        match (response.success, response.rail_reference) {
            (true, Some(rail_reference)) => Ok(RailReceipt { rail_reference }),
            _ => Err(LedgerError::Rail {
                class: response.error_class.unwrap_or(RailErrorClass::GenericDecline),
                message: response
                    .message
                    .unwrap_or_else(|| "rail rejected the debit".to_string()),
            }),
        }
    }

    async fn query_refund_status(
        &self,
        rail_reference: &str,
    ) -> Result<RefundStatus, LedgerError> {
        let body = RefundStatusBody { rail_reference };
        let response: RefundStatusResponse = self.client.post_signed("refund-status", &body).await?;
        Ok(response.status)
    }
}

#[derive(Debug, Serialize)]
struct FulfillBody<'a> {
    correlation_id: Uuid,
    service: &'a str,
    params: &'a serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct FulfillResponse {
    status: String,
    reference: Option<String>,
    message: Option<String>,
}

/// Fulfillment over the order/booking/bill-pay provider service.
pub struct HttpFulfillment {
    client: ProviderClient,
}

impl HttpFulfillment {
    pub fn new(base_url: &str, secret: &str, timeout: Duration) -> Result<Self, LedgerError> {
        Ok(Self {
            client: ProviderClient::new(base_url, secret, timeout)?,
        })
    }
}

#[async_trait]
impl FulfillmentProvider for HttpFulfillment {
    async fn fulfill(
        &self,
        correlation_id: Uuid,
        request: &FulfillmentRequest,
    ) -> Result<FulfillmentResult, LedgerError> {
        let body = FulfillBody {
            correlation_id,
            service: &request.service,
            params: &request.params,
        };
        let response: FulfillResponse = self.client.post_signed("fulfill", &body).await?;

        Ok(match response.status.as_str() {
            "completed" => FulfillmentResult::Completed {
                reference: response.reference,
            },
            "pending" => FulfillmentResult::Pending {
                reference: response.reference,
            },
            other => FulfillmentResult::Failed {
                message: response
                    .message
                    .unwrap_or_else(|| format!("provider returned status '{other}'")),
            },
        })
    }
}
