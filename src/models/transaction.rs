//! Transaction log models and the status state machine.
//!
//! This module defines:
//! - `Transaction`: one money-movement attempt, successful or not
//! - `TxCategory` / `TxStatus`: typed log classification and lifecycle
//! - `TransactionDraft` / `TransactionPatch`: insert and in-place update
//!   shapes used by the ledger store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a transaction represents, from the owning user's point of view.
///
/// The category fixes the sign of the amount: debits from the user are
/// negative, credits to the user are positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxCategory {
    /// Outgoing payment (bill, booking, recharge, transfer out)
    PaymentSent,
    /// Incoming payment from another user or a provider
    PaymentReceived,
    /// Money loaded into the wallet (including recovery credits)
    TopUp,
    /// Compensating or sweeper-issued credit linked to an earlier debit
    Refund,
    /// Amount reserved but not yet captured
    Hold,
    /// A debit that was rejected or an attempt that died before capture
    FailedAttempt,
}

impl TxCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxCategory::PaymentSent => "payment_sent",
            TxCategory::PaymentReceived => "payment_received",
            TxCategory::TopUp => "top_up",
            TxCategory::Refund => "refund",
            TxCategory::Hold => "hold",
            TxCategory::FailedAttempt => "failed_attempt",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "payment_sent" => Some(TxCategory::PaymentSent),
            "payment_received" => Some(TxCategory::PaymentReceived),
            "top_up" => Some(TxCategory::TopUp),
            "refund" => Some(TxCategory::Refund),
            "hold" => Some(TxCategory::Hold),
            "failed_attempt" => Some(TxCategory::FailedAttempt),
            _ => None,
        }
    }

    /// Categories a user or operator may cancel inside the window.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, TxCategory::PaymentSent | TxCategory::Hold)
    }

    /// Debit categories carry negative amounts in the log.
    pub fn is_debit(&self) -> bool {
        matches!(
            self,
            TxCategory::PaymentSent | TxCategory::Hold | TxCategory::FailedAttempt
        )
    }
}

impl std::fmt::Display for TxCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transaction lifecycle status.
///
/// # State machine
///
/// ```text
/// Pending ──> Processing ──> Completed
///    │            │              │
///    │            │              └──> Cancelled   (window-bounded)
///    │            ├──> Failed ──> Refunded | RefundedToWallet
///    │            └──> Cancelled (window-bounded)
///    └──> Completed | Failed | Cancelled
/// ```
///
/// Terminal states are never left again except `Failed`, which may move to
/// `Refunded` (operator/compensation flows) or `RefundedToWallet` (refund
/// sweeper). Racing updates resolve terminal-wins: see
/// [`TxStatus::accepts_transition_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    /// Created before any external call; the attempt is auditable even if
    /// the process crashes before capture
    Pending,
    /// Payment captured, fulfillment in flight or accepted-pending
    Processing,
    /// Terminal success
    Completed,
    /// Terminal failure
    Failed,
    /// Reversed inside the cancellation window
    Cancelled,
    /// A compensating credit has been linked to this failed transaction
    Refunded,
    /// The refund sweeper auto-credited the wallet for this failure
    RefundedToWallet,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Pending => "pending",
            TxStatus::Processing => "processing",
            TxStatus::Completed => "completed",
            TxStatus::Failed => "failed",
            TxStatus::Cancelled => "cancelled",
            TxStatus::Refunded => "refunded",
            TxStatus::RefundedToWallet => "refunded_to_wallet",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TxStatus::Pending),
            "processing" => Some(TxStatus::Processing),
            "completed" => Some(TxStatus::Completed),
            "failed" => Some(TxStatus::Failed),
            "cancelled" => Some(TxStatus::Cancelled),
            "refunded" => Some(TxStatus::Refunded),
            "refunded_to_wallet" => Some(TxStatus::RefundedToWallet),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TxStatus::Pending | TxStatus::Processing)
    }

    /// Whether a transition from `self` to `next` is legal.
    ///
    /// Tie-break for racing writers: a terminal status always beats a
    /// non-terminal one, and terminal states are never overwritten — the
    /// only exits from a terminal state are `Failed -> Refunded` and
    /// `Failed -> RefundedToWallet`. The store logs and ignores anything
    /// else instead of silently clobbering.
    pub fn accepts_transition_to(&self, next: TxStatus) -> bool {
        if *self == next {
            return false;
        }
        match self {
            TxStatus::Pending => matches!(
                next,
                TxStatus::Processing
                    | TxStatus::Completed
                    | TxStatus::Failed
                    | TxStatus::Cancelled
            ),
            TxStatus::Processing => matches!(
                next,
                TxStatus::Completed | TxStatus::Failed | TxStatus::Cancelled
            ),
            // Cancellation of an already-settled payment; window is
            // enforced by the payment service, not here.
            TxStatus::Completed => matches!(next, TxStatus::Cancelled),
            TxStatus::Failed => {
                matches!(next, TxStatus::Refunded | TxStatus::RefundedToWallet)
            }
            TxStatus::Cancelled | TxStatus::Refunded | TxStatus::RefundedToWallet => false,
        }
    }
}

impl std::fmt::Display for TxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the external rail eventually said about a swept failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Settlement {
    /// The rail refunded on its own; no wallet credit must be issued
    RefundedByRail,
    /// The rail confirmed the debit never happened
    NotDebited,
}

impl Settlement {
    pub fn as_str(&self) -> &'static str {
        match self {
            Settlement::RefundedByRail => "refunded_by_rail",
            Settlement::NotDebited => "not_debited",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "refunded_by_rail" => Some(Settlement::RefundedByRail),
            "not_debited" => Some(Settlement::NotDebited),
            _ => None,
        }
    }
}

/// The payment channel a transaction went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RailKind {
    Wallet,
    Card,
    Upi,
}

impl RailKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RailKind::Wallet => "wallet",
            RailKind::Card => "card",
            RailKind::Upi => "upi",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "wallet" => Some(RailKind::Wallet),
            "card" => Some(RailKind::Card),
            "upi" => Some(RailKind::Upi),
            _ => None,
        }
    }
}

impl std::fmt::Display for RailKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One money-movement attempt in the transaction log.
///
/// Immutable identity, mutable status and references. Rows are updated in
/// place as outcomes resolve and never physically deleted.
#[derive(Debug, Clone, Serialize)]
pub struct Transaction {
    /// Unique identifier, assigned at creation and immutable
    pub id: Uuid,

    /// Owning user
    pub user_id: Uuid,

    pub category: TxCategory,

    /// Counterparty or display name ("Acme Power Co", "Movie tickets")
    pub counterparty: String,

    pub description: Option<String>,

    /// Signed amount in cents: negative = debit from user, positive =
    /// credit to user
    pub amount_cents: i64,

    pub status: TxStatus,

    /// Rail the payment went through, if any
    pub rail: Option<RailKind>,

    /// True when the wallet was substituted for a failing bank rail
    pub via_fallback: bool,

    /// Reference issued by the external rail on capture
    pub rail_reference: Option<String>,

    /// Reference issued by the biller/booking/fulfillment provider
    pub operator_reference: Option<String>,

    /// Support ticket handle, set when an operator has to look at this
    pub ticket_id: Option<String>,

    /// Expected refund date communicated to the user on ambiguous failures
    pub refund_eta: Option<DateTime<Utc>>,

    /// For refunds and compensations: the transaction being reversed
    pub original_transaction_id: Option<Uuid>,

    /// Rail-confirmed settlement outcome recorded by the refund sweeper
    pub settlement: Option<Settlement>,

    /// Reference hash returned by the external audit ledger
    pub audit_hash: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert shape for a new transaction record.
///
/// The store assigns timestamps; the id is generated up front so callers
/// can hand it to providers as a correlation token before the row exists.
#[derive(Debug, Clone)]
pub struct TransactionDraft {
    pub id: Uuid,
    pub user_id: Uuid,
    pub category: TxCategory,
    pub counterparty: String,
    pub description: Option<String>,
    pub amount_cents: i64,
    pub status: TxStatus,
    pub rail: Option<RailKind>,
    pub via_fallback: bool,
    pub original_transaction_id: Option<Uuid>,
}

impl TransactionDraft {
    pub fn new(
        user_id: Uuid,
        category: TxCategory,
        counterparty: impl Into<String>,
        amount_cents: i64,
        status: TxStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            category,
            counterparty: counterparty.into(),
            description: None,
            amount_cents,
            status,
            rail: None,
            via_fallback: false,
            original_transaction_id: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn rail(mut self, rail: RailKind) -> Self {
        self.rail = Some(rail);
        self
    }

    pub fn via_fallback(mut self, via_fallback: bool) -> Self {
        self.via_fallback = via_fallback;
        self
    }

    pub fn original(mut self, original: Uuid) -> Self {
        self.original_transaction_id = Some(original);
        self
    }
}

/// In-place update shape for a transaction record.
///
/// All fields optional; `None` leaves the column untouched. Status changes
/// go through the state-machine guard in the store — reference attachments
/// still apply when an illegal status change is dropped, because audit
/// hashes and ticket ids legitimately arrive after a state is terminal.
#[derive(Debug, Clone, Default)]
pub struct TransactionPatch {
    pub status: Option<TxStatus>,
    pub description: Option<String>,
    pub rail_reference: Option<String>,
    pub operator_reference: Option<String>,
    pub ticket_id: Option<String>,
    pub refund_eta: Option<DateTime<Utc>>,
    pub settlement: Option<Settlement>,
    pub audit_hash: Option<String>,
    pub via_fallback: Option<bool>,
}

impl TransactionPatch {
    pub fn status(status: TxStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.description.is_none()
            && self.rail_reference.is_none()
            && self.operator_reference.is_none()
            && self.ticket_id.is_none()
            && self.refund_eta.is_none()
            && self.settlement.is_none()
            && self.audit_hash.is_none()
            && self.via_fallback.is_none()
    }
}
