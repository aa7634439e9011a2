//! Recovery scheduler.
//!
//! Executes deferred "debit the bank, restore the wallet" tasks created
//! when the wallet was substituted for a failing rail. Each tick selects
//! due Scheduled tasks and processes them one by one; a task is claimed
//! with a compare-and-set before any external call, so re-running the
//! worker (or running several instances) never double-debits.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::error::LedgerError;
use crate::models::recovery::{RecoveryOutcome, RecoveryTask};
use crate::models::transaction::TxCategory;
use crate::providers::retry::{RetryPolicy, retry_transient};
use crate::providers::BankRail;
use crate::services::wallet_service::WalletService;
use crate::store::LedgerStore;

pub struct RecoveryWorker {
    store: Arc<dyn LedgerStore>,
    wallet: Arc<WalletService>,
    bank: Arc<dyn BankRail>,
    poll_interval: Duration,
    debit_retry: RetryPolicy,
}

impl RecoveryWorker {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        wallet: Arc<WalletService>,
        bank: Arc<dyn BankRail>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            wallet,
            bank,
            poll_interval,
            debit_retry: RetryPolicy::default(),
        }
    }

    /// Run the polling loop forever.
    pub async fn run(&self) {
        info!(poll_interval_secs = self.poll_interval.as_secs(), "recovery worker started");
        loop {
            if let Err(e) = self.tick().await {
                error!("recovery tick failed: {e}");
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Process everything currently due. Returns how many tasks this
    /// worker actually claimed.
    pub async fn tick(&self) -> Result<usize, LedgerError> {
        let due = self.store.due_recovery_tasks(Utc::now()).await?;
        let mut claimed = 0;
        for task in due {
            // Idempotency guard: whoever wins the CAS owns the task.
            if !self.store.claim_recovery_task(task.id).await? {
                continue;
            }
            claimed += 1;
            if let Err(e) = self.process(&task).await {
                error!(task_id = %task.id, "recovery task processing failed: {e}");
            }
        }
        Ok(claimed)
    }

    async fn process(&self, task: &RecoveryTask) -> Result<(), LedgerError> {
        let account_ref = match self.resolve_bank_account(task).await? {
            Some(account_ref) => account_ref,
            None => {
                warn!(task_id = %task.id, user_id = %task.user_id, "no linked bank account");
                self.store
                    .finish_recovery_task(
                        task.id,
                        RecoveryOutcome::Failed {
                            reason: "no linked bank account".to_string(),
                            debit_reference: None,
                        },
                    )
                    .await?;
                return Ok(());
            }
        };

        let reason = format!("wallet recovery for payment to {}", task.counterparty);
        let receipt = retry_transient(&self.debit_retry, "recovery_debit", || {
            self.bank.debit(&account_ref, task.amount_cents, &reason)
        })
        .await;

        let receipt = match receipt {
            Ok(receipt) => receipt,
            Err(err) => {
                // Conservative by design: the user keeps the fallback
                // credit until an operator intervenes.
                let failure = LedgerError::RecoveryDebit(err.to_string());
                warn!(
                    task_id = %task.id,
                    user_id = %task.user_id,
                    amount_cents = task.amount_cents,
                    "{failure}"
                );
                self.store
                    .finish_recovery_task(
                        task.id,
                        RecoveryOutcome::Failed {
                            reason: failure.to_string(),
                            debit_reference: None,
                        },
                    )
                    .await?;
                return Ok(());
            }
        };

        match self
            .wallet
            .credit(
                task.user_id,
                task.amount_cents,
                TxCategory::TopUp,
                &task.counterparty,
                Some("wallet restored after rail fallback".to_string()),
                Some(task.original_transaction_id),
            )
            .await
        {
            Ok(applied) => {
                info!(
                    task_id = %task.id,
                    user_id = %task.user_id,
                    amount_cents = task.amount_cents,
                    debit_reference = %receipt.rail_reference,
                    credit_transaction_id = %applied.transaction.id,
                    "recovery completed"
                );
                self.store
                    .finish_recovery_task(
                        task.id,
                        RecoveryOutcome::Completed {
                            debit_reference: receipt.rail_reference,
                            credit_transaction_id: applied.transaction.id,
                        },
                    )
                    .await
            }
            Err(err) => {
                // Bank money is taken and the wallet was not restored.
                // This must surface for manual review, with the debit
                // reference attached, and must not be retried blindly.
                let critical = LedgerError::RecoveryCredit {
                    task: task.id,
                    reason: err.to_string(),
                };
                error!(
                    task_id = %task.id,
                    user_id = %task.user_id,
                    amount_cents = task.amount_cents,
                    debit_reference = %receipt.rail_reference,
                    error = %critical,
                    "bank debited but wallet credit failed, manual reconciliation required"
                );
                self.store
                    .finish_recovery_task(
                        task.id,
                        RecoveryOutcome::Failed {
                            reason: format!(
                                "bank debit {} succeeded but wallet credit failed: {err}",
                                receipt.rail_reference
                            ),
                            debit_reference: Some(receipt.rail_reference),
                        },
                    )
                    .await
            }
        }
    }

    /// Task-pinned account, else the user's default linked account, else
    /// any linked account.
    async fn resolve_bank_account(
        &self,
        task: &RecoveryTask,
    ) -> Result<Option<String>, LedgerError> {
        if let Some(pinned) = &task.bank_account_ref {
            return Ok(Some(pinned.clone()));
        }
        let linked = self.store.linked_accounts(task.user_id).await?;
        Ok(linked
            .iter()
            .find(|a| a.is_default)
            .or_else(|| linked.first())
            .map(|a| a.account_ref.clone()))
    }
}
