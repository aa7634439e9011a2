//! In-memory ledger store.
//!
//! Backs the test suite and local development. A single async mutex around
//! the whole state plays the role of the database transaction: every
//! mutation runs in one critical section, which is strictly stronger than
//! the per-key serialization the contract asks for.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::LedgerError;
use crate::models::recovery::{RecoveryOutcome, RecoveryStatus, RecoveryTask, RecoveryTaskDraft};
use crate::models::transaction::{
    Transaction, TransactionDraft, TransactionPatch, TxCategory, TxStatus,
};
use crate::models::user::{FallbackPolicy, LinkedBankAccount};
use crate::models::wallet::WalletAccount;
use crate::store::{LedgerStore, Mutation, MutationLog, MutationOutcome};

#[derive(Default)]
struct Inner {
    wallets: HashMap<Uuid, WalletAccount>,
    transactions: HashMap<Uuid, Transaction>,
    /// Creation order of transaction ids, per the ordering guarantee
    tx_order: Vec<Uuid>,
    tasks: HashMap<Uuid, RecoveryTask>,
    task_order: Vec<Uuid>,
    policies: HashMap<Uuid, FallbackPolicy>,
    linked: HashMap<Uuid, Vec<LinkedBankAccount>>,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    currency: String,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            currency: "INR".to_string(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn materialize(draft: TransactionDraft, now: DateTime<Utc>) -> Transaction {
    Transaction {
        id: draft.id,
        user_id: draft.user_id,
        category: draft.category,
        counterparty: draft.counterparty,
        description: draft.description,
        amount_cents: draft.amount_cents,
        status: draft.status,
        rail: draft.rail,
        via_fallback: draft.via_fallback,
        rail_reference: None,
        operator_reference: None,
        ticket_id: None,
        refund_eta: None,
        original_transaction_id: draft.original_transaction_id,
        settlement: None,
        audit_hash: None,
        created_at: now,
        updated_at: now,
    }
}

impl Inner {
    fn insert_tx(
        &mut self,
        draft: TransactionDraft,
        now: DateTime<Utc>,
    ) -> Result<Transaction, LedgerError> {
        if let Some(original) = draft.original_transaction_id
            && !self.transactions.contains_key(&original)
        {
            return Err(LedgerError::Validation(format!(
                "original transaction {original} does not exist"
            )));
        }
        let tx = materialize(draft, now);
        self.tx_order.push(tx.id);
        self.transactions.insert(tx.id, tx.clone());
        Ok(tx)
    }

    fn has_linked_refund(&self, original: Uuid) -> bool {
        self.transactions.values().any(|t| {
            t.original_transaction_id == Some(original) && t.category == TxCategory::Refund
        })
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn ensure_account(&self, user_id: Uuid) -> Result<WalletAccount, LedgerError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let wallet = inner
            .wallets
            .entry(user_id)
            .or_insert_with(|| WalletAccount::new(user_id, &self.currency, now));
        Ok(wallet.clone())
    }

    async fn account(&self, user_id: Uuid) -> Result<Option<WalletAccount>, LedgerError> {
        let inner = self.inner.lock().await;
        Ok(inner.wallets.get(&user_id).cloned())
    }

    async fn apply_mutation(&self, mutation: Mutation) -> Result<MutationOutcome, LedgerError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        let new_balance = if mutation.amount_cents < 0 {
            let wallet = inner
                .wallets
                .get(&mutation.user_id)
                .ok_or(LedgerError::AccountNotFound)?;
            let candidate = wallet.balance_cents + mutation.amount_cents;
            if candidate < 0 {
                return Err(LedgerError::InsufficientFunds {
                    transaction_id: None,
                });
            }
            candidate
        } else {
            let wallet = inner
                .wallets
                .entry(mutation.user_id)
                .or_insert_with(|| WalletAccount::new(mutation.user_id, &self.currency, now));
            wallet.balance_cents + mutation.amount_cents
        };

        // Log write first: it can still fail validation, and nothing has
        // been modified up to this point.
        let transaction = match mutation.log {
            MutationLog::Append(draft) => inner.insert_tx(draft, now)?,
            MutationLog::Complete {
                transaction_id,
                mark_fallback,
            } => {
                let tx = inner.transactions.get_mut(&transaction_id).ok_or_else(|| {
                    LedgerError::Validation(format!("transaction {transaction_id} not found"))
                })?;
                if !tx.status.accepts_transition_to(TxStatus::Completed) {
                    return Err(LedgerError::Validation(format!(
                        "transaction {transaction_id} cannot complete from {}",
                        tx.status
                    )));
                }
                tx.status = TxStatus::Completed;
                if mark_fallback {
                    tx.via_fallback = true;
                }
                tx.updated_at = now;
                tx.clone()
            }
        };

        let wallet = inner
            .wallets
            .get_mut(&mutation.user_id)
            .expect("wallet checked or created above");
        wallet.balance_cents = new_balance;
        wallet.updated_at = now;

        Ok(MutationOutcome {
            transaction,
            new_balance,
        })
    }

    async fn insert_transaction(
        &self,
        draft: TransactionDraft,
    ) -> Result<Transaction, LedgerError> {
        let mut inner = self.inner.lock().await;
        inner.insert_tx(draft, Utc::now())
    }

    async fn transaction(&self, id: Uuid) -> Result<Option<Transaction>, LedgerError> {
        let inner = self.inner.lock().await;
        Ok(inner.transactions.get(&id).cloned())
    }

    async fn user_transactions(&self, user_id: Uuid) -> Result<Vec<Transaction>, LedgerError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .tx_order
            .iter()
            .filter_map(|id| inner.transactions.get(id))
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn update_transaction(
        &self,
        id: Uuid,
        patch: TransactionPatch,
    ) -> Result<Transaction, LedgerError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let tx = inner
            .transactions
            .get_mut(&id)
            .ok_or_else(|| LedgerError::Validation(format!("transaction {id} not found")))?;

        if let Some(next) = patch.status {
            if tx.status.accepts_transition_to(next) {
                tx.status = next;
            } else {
                tracing::warn!(
                    transaction_id = %id,
                    from = %tx.status,
                    to = %next,
                    "illegal status transition dropped"
                );
            }
        }
        if let Some(description) = patch.description {
            tx.description = Some(description);
        }
        if let Some(rail_reference) = patch.rail_reference {
            tx.rail_reference = Some(rail_reference);
        }
        if let Some(operator_reference) = patch.operator_reference {
            tx.operator_reference = Some(operator_reference);
        }
        if let Some(ticket_id) = patch.ticket_id {
            tx.ticket_id = Some(ticket_id);
        }
        if let Some(refund_eta) = patch.refund_eta {
            tx.refund_eta = Some(refund_eta);
        }
        if let Some(settlement) = patch.settlement {
            tx.settlement = Some(settlement);
        }
        if let Some(audit_hash) = patch.audit_hash {
            tx.audit_hash = Some(audit_hash);
        }
        if let Some(via_fallback) = patch.via_fallback {
            tx.via_fallback = via_fallback;
        }
        tx.updated_at = now;
        Ok(tx.clone())
    }

    async fn linked_refund(&self, original: Uuid) -> Result<Option<Transaction>, LedgerError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .transactions
            .values()
            .find(|t| {
                t.original_transaction_id == Some(original) && t.category == TxCategory::Refund
            })
            .cloned())
    }

    async fn sweepable_failures(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, LedgerError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .tx_order
            .iter()
            .filter_map(|id| inner.transactions.get(id))
            .filter(|t| {
                t.status == TxStatus::Failed
                    && t.rail_reference.is_some()
                    && t.settlement.is_none()
                    && t.created_at < cutoff
                    && !inner.has_linked_refund(t.id)
            })
            .cloned()
            .collect())
    }

    async fn insert_recovery_task(
        &self,
        draft: RecoveryTaskDraft,
    ) -> Result<RecoveryTask, LedgerError> {
        let mut inner = self.inner.lock().await;
        if !inner
            .transactions
            .contains_key(&draft.original_transaction_id)
        {
            return Err(LedgerError::Validation(format!(
                "original transaction {} does not exist",
                draft.original_transaction_id
            )));
        }
        let now = Utc::now();
        let task = RecoveryTask {
            id: draft.id,
            user_id: draft.user_id,
            amount_cents: draft.amount_cents,
            counterparty: draft.counterparty,
            bank_account_ref: draft.bank_account_ref,
            status: RecoveryStatus::Scheduled,
            scheduled_for: draft.scheduled_for,
            original_transaction_id: draft.original_transaction_id,
            debit_reference: None,
            credit_transaction_id: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        inner.task_order.push(task.id);
        inner.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn recovery_task(&self, id: Uuid) -> Result<Option<RecoveryTask>, LedgerError> {
        let inner = self.inner.lock().await;
        Ok(inner.tasks.get(&id).cloned())
    }

    async fn due_recovery_tasks(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<RecoveryTask>, LedgerError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .task_order
            .iter()
            .filter_map(|id| inner.tasks.get(id))
            .filter(|t| t.status == RecoveryStatus::Scheduled && t.scheduled_for <= now)
            .cloned()
            .collect())
    }

    async fn claim_recovery_task(&self, id: Uuid) -> Result<bool, LedgerError> {
        let mut inner = self.inner.lock().await;
        match inner.tasks.get_mut(&id) {
            Some(task) if task.status == RecoveryStatus::Scheduled => {
                task.status = RecoveryStatus::Processing;
                task.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finish_recovery_task(
        &self,
        id: Uuid,
        outcome: RecoveryOutcome,
    ) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock().await;
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or_else(|| LedgerError::Validation(format!("recovery task {id} not found")))?;
        if task.status != RecoveryStatus::Processing {
            tracing::warn!(
                task_id = %id,
                status = %task.status,
                "finish on a task that is not Processing, ignoring"
            );
            return Ok(());
        }
        match outcome {
            RecoveryOutcome::Completed {
                debit_reference,
                credit_transaction_id,
            } => {
                task.status = RecoveryStatus::Completed;
                task.debit_reference = Some(debit_reference);
                task.credit_transaction_id = Some(credit_transaction_id);
            }
            RecoveryOutcome::Failed {
                reason,
                debit_reference,
            } => {
                task.status = RecoveryStatus::Failed;
                task.failure_reason = Some(reason);
                task.debit_reference = debit_reference;
            }
        }
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn fallback_policy(&self, user_id: Uuid) -> Result<FallbackPolicy, LedgerError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .policies
            .get(&user_id)
            .cloned()
            .unwrap_or_else(|| FallbackPolicy::disabled(user_id)))
    }

    async fn set_fallback_policy(&self, policy: FallbackPolicy) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock().await;
        inner.policies.insert(policy.user_id, policy);
        Ok(())
    }

    async fn linked_accounts(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<LinkedBankAccount>, LedgerError> {
        let inner = self.inner.lock().await;
        Ok(inner.linked.get(&user_id).cloned().unwrap_or_default())
    }

    async fn link_bank_account(&self, account: LinkedBankAccount) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock().await;
        inner.linked.entry(account.user_id).or_default().push(account);
        Ok(())
    }
}
