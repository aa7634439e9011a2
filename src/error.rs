//! Error types for the ledger core.
//!
//! This module defines all errors the core can produce and the propagation
//! rules attached to them. Handlers in the (out-of-scope) HTTP layer map
//! these onto status codes; inside the core they drive the fallback and
//! compensation decisions.

use uuid::Uuid;

use crate::providers::RailErrorClass;

/// Application-wide error type.
///
/// # Propagation
///
/// - `Validation`, `InsufficientFunds` and `AccountNotFound` surface
///   directly to the caller with no retry.
/// - `Rail` drives the wallet-fallback decision inside the payment
///   orchestrator and only surfaces when fallback is not applicable.
/// - `Fulfillment` after a captured payment is always handled locally by
///   issuing a compensating credit; it is never returned bare.
/// - `Compensation` and `RecoveryCredit` are operator-fatal: funds are in an
///   inconsistent state and a human has to reconcile. They are logged with
///   maximum detail and left behind in durable records, never swallowed and
///   never retried indefinitely.
/// - `ConcurrencyConflict` is transient; the wallet mutator retries the
///   atomic mutation a bounded number of times before giving up.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Database operation failed (connection, query, migration).
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Request data is invalid (bad amount, unknown identifiers, window
    /// violations). The String carries the detail.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// A debit was requested against a user with no wallet yet.
    ///
    /// Credits never produce this: they create the account on demand.
    #[error("Wallet account not found")]
    AccountNotFound,

    /// A debit would have taken the balance negative.
    ///
    /// The failed attempt is still logged; `transaction_id` references the
    /// Failed record so the caller always has a support handle.
    #[error("Insufficient wallet balance")]
    InsufficientFunds { transaction_id: Option<Uuid> },

    /// A non-wallet rail rejected or could not process a payment.
    ///
    /// The class decides whether the orchestrator may substitute the wallet.
    #[error("Rail failure ({class}): {message}")]
    Rail {
        class: RailErrorClass,
        message: String,
    },

    /// The fulfillment provider reported failure after payment capture.
    #[error("Fulfillment failed: {0}")]
    Fulfillment(String),

    /// The compensating credit after a fulfillment failure itself failed.
    ///
    /// Money has left the user and could not be returned automatically.
    #[error("Compensation failed for transaction {original}: {reason}")]
    Compensation { original: Uuid, reason: String },

    /// The recovery worker could not debit the user's bank account.
    #[error("Recovery bank debit failed: {0}")]
    RecoveryDebit(String),

    /// The recovery worker debited the bank but could not credit the wallet.
    ///
    /// The debit reference is preserved so the task surfaces for manual
    /// review with everything an operator needs.
    #[error("Recovery wallet credit failed for task {task}: {reason}")]
    RecoveryCredit { task: Uuid, reason: String },

    /// The per-key atomic mutation lost a serialization conflict.
    #[error("Concurrent mutation conflict")]
    ConcurrencyConflict,

    /// Outbound provider call failed at the transport level.
    #[error("Provider transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl LedgerError {
    /// True for conditions that require manual reconciliation by an
    /// operator: the automated paths have already done everything they
    /// safely can.
    pub fn is_operator_fatal(&self) -> bool {
        matches!(
            self,
            LedgerError::Compensation { .. } | LedgerError::RecoveryCredit { .. }
        )
    }

    /// True for transient conditions where retrying the same operation is
    /// safe and likely to succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            LedgerError::ConcurrencyConflict => true,
            LedgerError::Rail { class, .. } => class.is_transient(),
            _ => false,
        }
    }
}
