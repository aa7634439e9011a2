//! Wallet mutator - the single entry point for balance changes.
//!
//! Every credit and debit in the system routes through this service:
//! user-facing payments, compensating credits after fulfillment failures,
//! recovery credits, sweeper refunds. There is no second code path that
//! touches a balance.
//!
//! # Atomicity Guarantees
//!
//! The balance read, balance write and transaction-log write of one
//! mutation are a single atomic unit inside the ledger store, serialized
//! per user key. This service adds amount/sign validation, bounded retry
//! on serialization conflicts, the failed-attempt audit record, and the
//! balance-changed notification.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::LedgerError;
use crate::models::transaction::{Transaction, TransactionDraft, TransactionPatch, TxCategory, TxStatus};
use crate::models::wallet::WalletAccount;
use crate::providers::retry::{RetryPolicy, retry_transient};
use crate::services::notify_service::{LiveUpdates, WalletEvent};
use crate::store::{LedgerStore, Mutation, MutationLog, MutationOutcome};

/// A successfully applied mutation.
#[derive(Debug, Clone)]
pub struct Applied {
    pub transaction: Transaction,
    pub new_balance: i64,
}

pub struct WalletService {
    store: Arc<dyn LedgerStore>,
    live: Arc<dyn LiveUpdates>,
    conflict_retry: RetryPolicy,
}

impl WalletService {
    pub fn new(store: Arc<dyn LedgerStore>, live: Arc<dyn LiveUpdates>) -> Self {
        Self {
            store,
            live,
            // Serialization conflicts resolve in milliseconds; three
            // immediate attempts before surfacing a failure.
            conflict_retry: RetryPolicy::immediate(3),
        }
    }

    /// Current balance, creating the wallet lazily on first access.
    pub async fn balance(&self, user_id: Uuid) -> Result<WalletAccount, LedgerError> {
        self.store.ensure_account(user_id).await
    }

    /// Add money to the wallet. Creates the account on demand and never
    /// fails for balance reasons.
    ///
    /// `category` must be a credit category; `original` links refunds and
    /// compensations back to the transaction they reverse.
    pub async fn credit(
        &self,
        user_id: Uuid,
        amount_cents: i64,
        category: TxCategory,
        counterparty: &str,
        description: Option<String>,
        original: Option<Uuid>,
    ) -> Result<Applied, LedgerError> {
        validate_amount(amount_cents)?;
        if category.is_debit() {
            return Err(LedgerError::Validation(format!(
                "category {category} is not a credit category"
            )));
        }

        let mut draft = TransactionDraft::new(
            user_id,
            category,
            counterparty,
            amount_cents,
            TxStatus::Completed,
        );
        draft.description = description;
        draft.original_transaction_id = original;

        let outcome = self
            .apply(Mutation {
                user_id,
                amount_cents,
                log: MutationLog::Append(draft),
            })
            .await?;
        Ok(self.applied(outcome))
    }

    /// Remove money from the wallet as a standalone completed debit.
    ///
    /// On `InsufficientFunds` or `AccountNotFound` a Failed
    /// `failed_attempt` record is appended so the rejection is auditable,
    /// and its id travels inside the `InsufficientFunds` error.
    pub async fn debit(
        &self,
        user_id: Uuid,
        amount_cents: i64,
        category: TxCategory,
        counterparty: &str,
        description: Option<String>,
    ) -> Result<Applied, LedgerError> {
        validate_amount(amount_cents)?;
        if !category.is_debit() || category == TxCategory::FailedAttempt {
            return Err(LedgerError::Validation(format!(
                "category {category} is not a debit category"
            )));
        }

        let mut draft = TransactionDraft::new(
            user_id,
            category,
            counterparty,
            -amount_cents,
            TxStatus::Completed,
        );
        draft.description = description.clone();

        match self
            .apply(Mutation {
                user_id,
                amount_cents: -amount_cents,
                log: MutationLog::Append(draft),
            })
            .await
        {
            Ok(outcome) => Ok(self.applied(outcome)),
            Err(err @ (LedgerError::InsufficientFunds { .. } | LedgerError::AccountNotFound)) => {
                let failed = self
                    .record_failed_attempt(user_id, amount_cents, counterparty, &err)
                    .await?;
                match err {
                    LedgerError::InsufficientFunds { .. } => {
                        Err(LedgerError::InsufficientFunds {
                            transaction_id: Some(failed.id),
                        })
                    }
                    other => Err(other),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Debit the wallet by completing a pre-logged Pending transaction in
    /// the same atomic unit as the balance change.
    ///
    /// This is the payment orchestrator's path: the Pending record was
    /// written before any rail was touched, and either flips to Completed
    /// here or is marked Failed when the wallet cannot cover the amount.
    pub async fn settle_pending_debit(
        &self,
        user_id: Uuid,
        amount_cents: i64,
        transaction_id: Uuid,
        mark_fallback: bool,
    ) -> Result<Applied, LedgerError> {
        validate_amount(amount_cents)?;

        match self
            .apply(Mutation {
                user_id,
                amount_cents: -amount_cents,
                log: MutationLog::Complete {
                    transaction_id,
                    mark_fallback,
                },
            })
            .await
        {
            Ok(outcome) => Ok(self.applied(outcome)),
            Err(err @ (LedgerError::InsufficientFunds { .. } | LedgerError::AccountNotFound)) => {
                let mut patch = TransactionPatch::status(TxStatus::Failed);
                patch.description = Some(err.to_string());
                self.store.update_transaction(transaction_id, patch).await?;
                match err {
                    LedgerError::InsufficientFunds { .. } => {
                        Err(LedgerError::InsufficientFunds {
                            transaction_id: Some(transaction_id),
                        })
                    }
                    other => Err(other),
                }
            }
            Err(err) => Err(err),
        }
    }

    async fn apply(&self, mutation: Mutation) -> Result<MutationOutcome, LedgerError> {
        let store = &self.store;
        retry_transient(&self.conflict_retry, "wallet_mutation", || {
            let mutation = mutation.clone();
            async move { store.apply_mutation(mutation).await }
        })
        .await
    }

    async fn record_failed_attempt(
        &self,
        user_id: Uuid,
        amount_cents: i64,
        counterparty: &str,
        cause: &LedgerError,
    ) -> Result<Transaction, LedgerError> {
        let draft = TransactionDraft::new(
            user_id,
            TxCategory::FailedAttempt,
            counterparty,
            -amount_cents,
            TxStatus::Failed,
        )
        .description(cause.to_string());
        self.store.insert_transaction(draft).await
    }

    fn applied(&self, outcome: MutationOutcome) -> Applied {
        let user_id = outcome.transaction.user_id;
        let event = WalletEvent::BalanceChanged {
            transaction_id: outcome.transaction.id,
            new_balance_cents: outcome.new_balance,
        };
        let live = self.live.clone();
        // Best-effort: the response never waits on the push channel.
        tokio::spawn(async move {
            live.notify(user_id, event).await;
        });

        Applied {
            transaction: outcome.transaction,
            new_balance: outcome.new_balance,
        }
    }
}

fn validate_amount(amount_cents: i64) -> Result<(), LedgerError> {
    if amount_cents <= 0 {
        return Err(LedgerError::Validation(
            "amount must be positive".to_string(),
        ));
    }
    Ok(())
}
