//! Recovery task model.
//!
//! A recovery task is created when the wallet was substituted for a failing
//! bank rail: the user paid from wallet funds, and the deferred task debits
//! their bank account later to restore the wallet.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Recovery task lifecycle.
///
/// Scheduled -> Processing -> {Completed, Failed}, exactly once. The worker
/// claims a task by compare-and-setting Scheduled -> Processing, so a second
/// worker (or a second run of the same worker) is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    Scheduled,
    Processing,
    Completed,
    Failed,
}

impl RecoveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStatus::Scheduled => "scheduled",
            RecoveryStatus::Processing => "processing",
            RecoveryStatus::Completed => "completed",
            RecoveryStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(RecoveryStatus::Scheduled),
            "processing" => Some(RecoveryStatus::Processing),
            "completed" => Some(RecoveryStatus::Completed),
            "failed" => Some(RecoveryStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RecoveryStatus::Completed | RecoveryStatus::Failed)
    }
}

impl std::fmt::Display for RecoveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A deferred "debit the bank, restore the wallet" job.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryTask {
    pub id: Uuid,

    pub user_id: Uuid,

    /// Positive amount to recover, in cents
    pub amount_cents: i64,

    /// Counterparty of the original payment, kept for the debit narration
    pub counterparty: String,

    /// Bank account pinned at creation; resolved from the user's linked
    /// accounts at execution time when absent
    pub bank_account_ref: Option<String>,

    pub status: RecoveryStatus,

    /// Tasks are batched to a cutover instant rather than run immediately
    pub scheduled_for: DateTime<Utc>,

    /// The fallback-sourced payment this task recovers
    pub original_transaction_id: Uuid,

    /// Rail reference of the successful bank debit
    pub debit_reference: Option<String>,

    /// Wallet-credit transaction written on completion
    pub credit_transaction_id: Option<Uuid>,

    pub failure_reason: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert shape for a new recovery task.
#[derive(Debug, Clone)]
pub struct RecoveryTaskDraft {
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount_cents: i64,
    pub counterparty: String,
    pub bank_account_ref: Option<String>,
    pub scheduled_for: DateTime<Utc>,
    pub original_transaction_id: Uuid,
}

impl RecoveryTaskDraft {
    pub fn new(
        user_id: Uuid,
        amount_cents: i64,
        counterparty: impl Into<String>,
        scheduled_for: DateTime<Utc>,
        original_transaction_id: Uuid,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            amount_cents,
            counterparty: counterparty.into(),
            bank_account_ref: None,
            scheduled_for,
            original_transaction_id,
        }
    }
}

/// Terminal outcome the worker records on a claimed task.
#[derive(Debug, Clone)]
pub enum RecoveryOutcome {
    Completed {
        debit_reference: String,
        credit_transaction_id: Uuid,
    },
    Failed {
        reason: String,
        /// Present when the bank was debited but the wallet credit failed;
        /// an operator needs this to reconcile by hand.
        debit_reference: Option<String>,
    },
}
