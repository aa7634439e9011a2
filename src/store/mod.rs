//! Ledger storage abstraction.
//!
//! The only hard requirement on the backend is serializable isolation per
//! wallet key: the balance read, balance write and transaction-log write of
//! one mutation must be a single atomic unit, and concurrent mutations for
//! the same user must apply one at a time. [`postgres::PgStore`] provides
//! this with row locks inside a database transaction; [`memory::MemoryStore`]
//! with an in-process critical section, for tests and local development.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::models::recovery::{RecoveryOutcome, RecoveryTask, RecoveryTaskDraft};
use crate::models::transaction::{Transaction, TransactionDraft, TransactionPatch};
use crate::models::user::{FallbackPolicy, LinkedBankAccount};
use crate::models::wallet::WalletAccount;

/// How a mutation writes the transaction log.
#[derive(Debug, Clone)]
pub enum MutationLog {
    /// Insert a fresh record (normal credits, standalone debits)
    Append(TransactionDraft),
    /// Flip a pre-logged Pending record to Completed in the same atomic
    /// unit as the balance change (payment orchestrator path)
    Complete {
        transaction_id: Uuid,
        /// Set when the wallet was substituted for the requested rail
        mark_fallback: bool,
    },
}

/// One atomic balance change plus its log write.
///
/// `amount_cents` is signed: negative debits the user, positive credits.
/// Debits require an existing account with sufficient balance; credits
/// create the account on demand.
#[derive(Debug, Clone)]
pub struct Mutation {
    pub user_id: Uuid,
    pub amount_cents: i64,
    pub log: MutationLog,
}

/// Result of a successful mutation.
#[derive(Debug, Clone)]
pub struct MutationOutcome {
    pub transaction: Transaction,
    pub new_balance: i64,
}

/// Durable storage for wallets, the transaction log, the recovery queue and
/// per-user fallback data.
///
/// Status updates enforce the transaction state machine: an update carrying an
/// illegal or terminal-overwriting status is logged and dropped while the
/// rest of the patch still applies. `claim_recovery_task` is a
/// compare-and-set so task execution is idempotent across workers.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Fetch the wallet, creating it lazily on first access.
    async fn ensure_account(&self, user_id: Uuid) -> Result<WalletAccount, LedgerError>;

    /// Fetch the wallet without creating it.
    async fn account(&self, user_id: Uuid) -> Result<Option<WalletAccount>, LedgerError>;

    /// The atomic read-modify-write primitive. See [`Mutation`].
    async fn apply_mutation(&self, mutation: Mutation) -> Result<MutationOutcome, LedgerError>;

    /// Append a log record without touching any balance (Pending pre-logs,
    /// Failed attempt audit records).
    async fn insert_transaction(
        &self,
        draft: TransactionDraft,
    ) -> Result<Transaction, LedgerError>;

    async fn transaction(&self, id: Uuid) -> Result<Option<Transaction>, LedgerError>;

    /// A user's log in creation order.
    async fn user_transactions(&self, user_id: Uuid) -> Result<Vec<Transaction>, LedgerError>;

    /// Patch a record in place, status changes gated by the state machine.
    async fn update_transaction(
        &self,
        id: Uuid,
        patch: TransactionPatch,
    ) -> Result<Transaction, LedgerError>;

    /// The refund transaction linked to `original`, if one was recorded.
    async fn linked_refund(&self, original: Uuid) -> Result<Option<Transaction>, LedgerError>;

    /// Failed transactions with a rail reference, no settlement annotation,
    /// no linked refund, created before `cutoff` — the sweeper's worklist.
    async fn sweepable_failures(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, LedgerError>;

    async fn insert_recovery_task(
        &self,
        draft: RecoveryTaskDraft,
    ) -> Result<RecoveryTask, LedgerError>;

    async fn recovery_task(&self, id: Uuid) -> Result<Option<RecoveryTask>, LedgerError>;

    /// Scheduled tasks whose `scheduled_for` has elapsed.
    async fn due_recovery_tasks(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<RecoveryTask>, LedgerError>;

    /// Compare-and-set Scheduled -> Processing. Returns false when another
    /// worker got there first or the task is already terminal.
    async fn claim_recovery_task(&self, id: Uuid) -> Result<bool, LedgerError>;

    /// Record the terminal outcome of a claimed task.
    async fn finish_recovery_task(
        &self,
        id: Uuid,
        outcome: RecoveryOutcome,
    ) -> Result<(), LedgerError>;

    /// The user's fallback policy; the disabled default when none is set.
    async fn fallback_policy(&self, user_id: Uuid) -> Result<FallbackPolicy, LedgerError>;

    async fn set_fallback_policy(&self, policy: FallbackPolicy) -> Result<(), LedgerError>;

    async fn linked_accounts(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<LinkedBankAccount>, LedgerError>;

    async fn link_bank_account(&self, account: LinkedBankAccount) -> Result<(), LedgerError>;
}
