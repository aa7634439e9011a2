//! Per-user fallback eligibility and linked bank accounts.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Whether (and up to what amount) the wallet may stand in for a failing
/// bank rail for this user.
///
/// Defaults to disabled with a zero ceiling; the store returns the default
/// for users with no explicit row.
#[derive(Debug, Clone, Serialize)]
pub struct FallbackPolicy {
    pub user_id: Uuid,
    pub enabled: bool,
    pub ceiling_cents: i64,
}

impl FallbackPolicy {
    pub fn disabled(user_id: Uuid) -> Self {
        Self {
            user_id,
            enabled: false,
            ceiling_cents: 0,
        }
    }

    /// The fallback ceiling check applied by the payment orchestrator.
    pub fn covers(&self, amount_cents: i64) -> bool {
        self.enabled && amount_cents <= self.ceiling_cents
    }
}

/// A bank account the user has linked for payments and recovery debits.
#[derive(Debug, Clone, Serialize)]
pub struct LinkedBankAccount {
    pub id: Uuid,
    pub user_id: Uuid,

    /// Opaque rail-side account reference
    pub account_ref: String,

    pub is_default: bool,

    /// Pre-authorized debit mandate; required for non-interactive recovery
    pub mandate_ref: Option<String>,

    pub created_at: DateTime<Utc>,
}
