//! Wallet account model.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// A user's wallet balance record.
///
/// One record per user, created lazily on first balance query or first
/// credit, never deleted. The balance is only ever changed through the
/// ledger store's atomic per-key mutation; nothing derives it by summing
/// transactions.
///
/// # Balance Storage
///
/// Balances are stored as `i64` cents to avoid floating-point precision
/// issues. $10.50 is 1050 cents.
#[derive(Debug, Clone, Serialize)]
pub struct WalletAccount {
    /// Owning user. One wallet per user.
    pub user_id: Uuid,

    /// Current balance in cents. Never negative.
    pub balance_cents: i64,

    /// Currency code (ISO 4217)
    pub currency: String,

    /// When the wallet was created
    pub created_at: DateTime<Utc>,

    /// Timestamp of the last balance change
    pub updated_at: DateTime<Utc>,
}

impl WalletAccount {
    /// A fresh zero-balance wallet for `user_id`.
    pub fn new(user_id: Uuid, currency: &str, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            balance_cents: 0,
            currency: currency.to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}
