//! Interfaces to out-of-scope collaborators.
//!
//! The core never talks to a biller, booking system or bank network
//! directly; it consumes these narrow traits. Production wiring uses the
//! signed HTTP clients in [`http`], tests use in-memory mocks.

pub mod http;
pub mod retry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::models::transaction::RailKind;

/// Classified cause of a rail-side payment failure.
///
/// The class is what the payment orchestrator's fallback decision keys on:
/// only an allow-listed subset of failures may be bridged with wallet funds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RailErrorClass {
    /// Per-transaction or daily limit exceeded on the rail
    LimitExceeded,
    /// Issuing/acquiring bank unreachable
    BankDown,
    /// Bank responded too slowly; outcome treated as failed
    BankSlow,
    /// Insufficient funds in the rail-side account
    InsufficientFunds,
    /// Any other decline (wrong credentials, blocked instrument, fraud)
    GenericDecline,
}

impl RailErrorClass {
    /// Failure classes eligible for the wallet-fallback substitution.
    pub fn allows_wallet_fallback(&self) -> bool {
        matches!(
            self,
            RailErrorClass::LimitExceeded
                | RailErrorClass::BankDown
                | RailErrorClass::BankSlow
                | RailErrorClass::InsufficientFunds
        )
    }

    /// Transient classes may be retried with backoff; declines never are.
    pub fn is_transient(&self) -> bool {
        matches!(self, RailErrorClass::BankDown | RailErrorClass::BankSlow)
    }
}

impl std::fmt::Display for RailErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RailErrorClass::LimitExceeded => "limit_exceeded",
            RailErrorClass::BankDown => "bank_down",
            RailErrorClass::BankSlow => "bank_slow",
            RailErrorClass::InsufficientFunds => "insufficient_funds",
            RailErrorClass::GenericDecline => "generic_decline",
        };
        f.write_str(s)
    }
}

/// A payment to capture on a non-wallet rail.
#[derive(Debug, Clone, Serialize)]
pub struct PayRequest {
    pub user_id: Uuid,
    /// Positive amount in cents
    pub amount_cents: i64,
    pub rail: RailKind,
    /// Correlation token: the transaction id pre-logged for this attempt
    pub reference: Uuid,
    pub counterparty: String,
}

/// Successful rail capture or debit.
#[derive(Debug, Clone, Deserialize)]
pub struct RailReceipt {
    /// Reference issued by the rail, stored on the transaction for
    /// settlement queries and support
    pub rail_reference: String,
}

/// What the rail reports about a possibly-refunded debit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    /// The rail already refunded out-of-band
    Refunded,
    /// The debit never settled
    NotDebited,
    /// A refund is in flight on the rail
    PendingRefund,
    /// The rail cannot say
    Unknown,
}

/// Bank/card/UPI rail operations.
///
/// `pay` is interactive capture during a user-facing payment; `debit` is the
/// non-interactive mandate-backed debit used only by the recovery worker.
/// Rail-reported failures come back as [`LedgerError::Rail`] so the class
/// flows to the fallback/retry decisions.
#[async_trait]
pub trait BankRail: Send + Sync {
    async fn pay(&self, request: &PayRequest) -> Result<RailReceipt, LedgerError>;

    async fn debit(
        &self,
        account_ref: &str,
        amount_cents: i64,
        reason: &str,
    ) -> Result<RailReceipt, LedgerError>;

    async fn query_refund_status(
        &self,
        rail_reference: &str,
    ) -> Result<RefundStatus, LedgerError>;
}

/// A bill payment, booking or recharge to execute after capture.
#[derive(Debug, Clone, Serialize)]
pub struct FulfillmentRequest {
    /// Which provider capability this is ("bill_pay", "booking", "recharge")
    pub service: String,
    /// Provider-specific parameters, opaque to the core
    pub params: serde_json::Value,
}

/// Outcome of a fulfillment call.
///
/// Explicit variants instead of a loosely-typed payload: the orchestrator
/// branches on exactly these three cases.
#[derive(Debug, Clone)]
pub enum FulfillmentResult {
    /// Delivered; reference is the biller/operator receipt
    Completed { reference: Option<String> },
    /// Accepted but settling asynchronously on the provider side
    Pending { reference: Option<String> },
    /// Not delivered; the payment must be compensated
    Failed { message: String },
}

/// Order/booking/bill-payment execution.
///
/// Called at most once per correlation id: the orchestrator never retries
/// on ambiguous errors, because a second call could double-deliver.
#[async_trait]
pub trait FulfillmentProvider: Send + Sync {
    async fn fulfill(
        &self,
        correlation_id: Uuid,
        request: &FulfillmentRequest,
    ) -> Result<FulfillmentResult, LedgerError>;
}
