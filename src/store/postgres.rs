//! PostgreSQL ledger store.
//!
//! The atomicity contract is implemented the classic way: every mutation is
//! one database transaction that locks the wallet row with `FOR UPDATE`,
//! checks funds, writes the new balance and writes the log record, then
//! commits. Serialization failures and deadlocks surface as
//! `ConcurrencyConflict` so the wallet mutator can retry them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::DbPool;
use crate::error::LedgerError;
use crate::models::recovery::{RecoveryOutcome, RecoveryStatus, RecoveryTask, RecoveryTaskDraft};
use crate::models::transaction::{
    RailKind, Settlement, Transaction, TransactionDraft, TransactionPatch, TxCategory, TxStatus,
};
use crate::models::user::{FallbackPolicy, LinkedBankAccount};
use crate::models::wallet::WalletAccount;
use crate::store::{LedgerStore, Mutation, MutationLog, MutationOutcome};

pub struct PgStore {
    pool: DbPool,
    currency: String,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            currency: "INR".to_string(),
        }
    }
}

/// Map retryable Postgres failures onto the transient conflict variant.
///
/// 40001 = serialization_failure, 40P01 = deadlock_detected.
fn map_sql(err: sqlx::Error) -> LedgerError {
    if let sqlx::Error::Database(ref db) = err
        && let Some(code) = db.code()
        && (code == "40001" || code == "40P01")
    {
        return LedgerError::ConcurrencyConflict;
    }
    LedgerError::Database(err)
}

#[derive(sqlx::FromRow)]
struct WalletRow {
    user_id: Uuid,
    balance_cents: i64,
    currency: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<WalletRow> for WalletAccount {
    fn from(row: WalletRow) -> Self {
        Self {
            user_id: row.user_id,
            balance_cents: row.balance_cents,
            currency: row.currency,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TransactionRow {
    id: Uuid,
    user_id: Uuid,
    category: String,
    counterparty: String,
    description: Option<String>,
    amount_cents: i64,
    status: String,
    rail: Option<String>,
    via_fallback: bool,
    rail_reference: Option<String>,
    operator_reference: Option<String>,
    ticket_id: Option<String>,
    refund_eta: Option<DateTime<Utc>>,
    original_transaction_id: Option<Uuid>,
    settlement: Option<String>,
    audit_hash: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = LedgerError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        let category = TxCategory::parse(&row.category).ok_or_else(|| {
            LedgerError::Validation(format!("unrecognized category '{}'", row.category))
        })?;
        let status = TxStatus::parse(&row.status).ok_or_else(|| {
            LedgerError::Validation(format!("unrecognized status '{}'", row.status))
        })?;
        let rail = match row.rail {
            Some(ref s) => Some(RailKind::parse(s).ok_or_else(|| {
                LedgerError::Validation(format!("unrecognized rail '{s}'"))
            })?),
            None => None,
        };
        let settlement = match row.settlement {
            Some(ref s) => Some(Settlement::parse(s).ok_or_else(|| {
                LedgerError::Validation(format!("unrecognized settlement '{s}'"))
            })?),
            None => None,
        };
        Ok(Transaction {
            id: row.id,
            user_id: row.user_id,
            category,
            counterparty: row.counterparty,
            description: row.description,
            amount_cents: row.amount_cents,
            status,
            rail,
            via_fallback: row.via_fallback,
            rail_reference: row.rail_reference,
            operator_reference: row.operator_reference,
            ticket_id: row.ticket_id,
            refund_eta: row.refund_eta,
            original_transaction_id: row.original_transaction_id,
            settlement,
            audit_hash: row.audit_hash,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RecoveryTaskRow {
    id: Uuid,
    user_id: Uuid,
    amount_cents: i64,
    counterparty: String,
    bank_account_ref: Option<String>,
    status: String,
    scheduled_for: DateTime<Utc>,
    original_transaction_id: Uuid,
    debit_reference: Option<String>,
    credit_transaction_id: Option<Uuid>,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RecoveryTaskRow> for RecoveryTask {
    type Error = LedgerError;

    fn try_from(row: RecoveryTaskRow) -> Result<Self, Self::Error> {
        let status = RecoveryStatus::parse(&row.status).ok_or_else(|| {
            LedgerError::Validation(format!("unrecognized task status '{}'", row.status))
        })?;
        Ok(RecoveryTask {
            id: row.id,
            user_id: row.user_id,
            amount_cents: row.amount_cents,
            counterparty: row.counterparty,
            bank_account_ref: row.bank_account_ref,
            status,
            scheduled_for: row.scheduled_for,
            original_transaction_id: row.original_transaction_id,
            debit_reference: row.debit_reference,
            credit_transaction_id: row.credit_transaction_id,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const INSERT_TRANSACTION: &str = r#"
    INSERT INTO transactions (
        id, user_id, category, counterparty, description,
        amount_cents, status, rail, via_fallback, original_transaction_id
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
    RETURNING *
"#;

async fn insert_tx(
    executor: &mut sqlx::PgConnection,
    draft: &TransactionDraft,
) -> Result<Transaction, LedgerError> {
    let row = sqlx::query_as::<_, TransactionRow>(INSERT_TRANSACTION)
        .bind(draft.id)
        .bind(draft.user_id)
        .bind(draft.category.as_str())
        .bind(&draft.counterparty)
        .bind(&draft.description)
        .bind(draft.amount_cents)
        .bind(draft.status.as_str())
        .bind(draft.rail.map(|r| r.as_str()))
        .bind(draft.via_fallback)
        .bind(draft.original_transaction_id)
        .fetch_one(executor)
        .await
        .map_err(map_sql)?;
    row.try_into()
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn ensure_account(&self, user_id: Uuid) -> Result<WalletAccount, LedgerError> {
        sqlx::query("INSERT INTO wallets (user_id, currency) VALUES ($1, $2) ON CONFLICT (user_id) DO NOTHING")
            .bind(user_id)
            .bind(&self.currency)
            .execute(&self.pool)
            .await?;
        let row = sqlx::query_as::<_, WalletRow>("SELECT * FROM wallets WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.into())
    }

    async fn account(&self, user_id: Uuid) -> Result<Option<WalletAccount>, LedgerError> {
        let row = sqlx::query_as::<_, WalletRow>("SELECT * FROM wallets WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn apply_mutation(&self, mutation: Mutation) -> Result<MutationOutcome, LedgerError> {
        let mut tx = self.pool.begin().await.map_err(map_sql)?;

        // Lock (or create) the wallet row. FOR UPDATE serializes all
        // mutations for this user for the rest of the transaction.
        if mutation.amount_cents >= 0 {
            sqlx::query(
                "INSERT INTO wallets (user_id, currency) VALUES ($1, $2) ON CONFLICT (user_id) DO NOTHING",
            )
            .bind(mutation.user_id)
            .bind(&self.currency)
            .execute(&mut *tx)
            .await
            .map_err(map_sql)?;
        }

        let balance: i64 = sqlx::query_scalar(
            "SELECT balance_cents FROM wallets WHERE user_id = $1 FOR UPDATE",
        )
        .bind(mutation.user_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sql)?
        .ok_or(LedgerError::AccountNotFound)?;

        if balance + mutation.amount_cents < 0 {
            tx.rollback().await?;
            return Err(LedgerError::InsufficientFunds {
                transaction_id: None,
            });
        }

        let new_balance: i64 = sqlx::query_scalar(
            r#"
            UPDATE wallets
            SET balance_cents = balance_cents + $1,
                updated_at = NOW()
            WHERE user_id = $2
            RETURNING balance_cents
            "#,
        )
        .bind(mutation.amount_cents)
        .bind(mutation.user_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sql)?;

        let transaction = match &mutation.log {
            MutationLog::Append(draft) => insert_tx(&mut *tx, draft).await?,
            MutationLog::Complete {
                transaction_id,
                mark_fallback,
            } => {
                let current: Option<String> =
                    sqlx::query_scalar("SELECT status FROM transactions WHERE id = $1 FOR UPDATE")
                        .bind(transaction_id)
                        .fetch_optional(&mut *tx)
                        .await
                        .map_err(map_sql)?;
                let current = current
                    .and_then(|s| TxStatus::parse(&s))
                    .ok_or_else(|| {
                        LedgerError::Validation(format!(
                            "transaction {transaction_id} not found"
                        ))
                    })?;
                if !current.accepts_transition_to(TxStatus::Completed) {
                    tx.rollback().await?;
                    return Err(LedgerError::Validation(format!(
                        "transaction {transaction_id} cannot complete from {current}"
                    )));
                }
                let row = sqlx::query_as::<_, TransactionRow>(
                    r#"
                    UPDATE transactions
                    SET status = 'completed',
                        via_fallback = via_fallback OR $2,
                        updated_at = NOW()
                    WHERE id = $1
                    RETURNING *
                    "#,
                )
                .bind(transaction_id)
                .bind(mark_fallback)
                .fetch_one(&mut *tx)
                .await
                .map_err(map_sql)?;
                row.try_into()?
            }
        };

        tx.commit().await.map_err(map_sql)?;

        Ok(MutationOutcome {
            transaction,
            new_balance,
        })
    }

    async fn insert_transaction(
        &self,
        draft: TransactionDraft,
    ) -> Result<Transaction, LedgerError> {
        let mut conn = self.pool.acquire().await?;
        insert_tx(&mut *conn, &draft).await
    }

    async fn transaction(&self, id: Uuid) -> Result<Option<Transaction>, LedgerError> {
        let row =
            sqlx::query_as::<_, TransactionRow>("SELECT * FROM transactions WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn user_transactions(&self, user_id: Uuid) -> Result<Vec<Transaction>, LedgerError> {
        let rows = sqlx::query_as::<_, TransactionRow>(
            "SELECT * FROM transactions WHERE user_id = $1 ORDER BY created_at, id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn update_transaction(
        &self,
        id: Uuid,
        patch: TransactionPatch,
    ) -> Result<Transaction, LedgerError> {
        let mut tx = self.pool.begin().await.map_err(map_sql)?;

        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM transactions WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_sql)?;
        let current = current
            .and_then(|s| TxStatus::parse(&s))
            .ok_or_else(|| LedgerError::Validation(format!("transaction {id} not found")))?;

        // Tie-break: terminal statuses are never clobbered; illegal jumps
        // are dropped while the reference patch still lands.
        let status = match patch.status {
            Some(next) if current.accepts_transition_to(next) => next,
            Some(next) => {
                tracing::warn!(
                    transaction_id = %id,
                    from = %current,
                    to = %next,
                    "illegal status transition dropped"
                );
                current
            }
            None => current,
        };

        let row = sqlx::query_as::<_, TransactionRow>(
            r#"
            UPDATE transactions
            SET status = $2,
                description = COALESCE($3, description),
                rail_reference = COALESCE($4, rail_reference),
                operator_reference = COALESCE($5, operator_reference),
                ticket_id = COALESCE($6, ticket_id),
                refund_eta = COALESCE($7, refund_eta),
                settlement = COALESCE($8, settlement),
                audit_hash = COALESCE($9, audit_hash),
                via_fallback = COALESCE($10, via_fallback),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(&patch.description)
        .bind(&patch.rail_reference)
        .bind(&patch.operator_reference)
        .bind(&patch.ticket_id)
        .bind(patch.refund_eta)
        .bind(patch.settlement.map(|s| s.as_str()))
        .bind(&patch.audit_hash)
        .bind(patch.via_fallback)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sql)?;

        tx.commit().await.map_err(map_sql)?;
        row.try_into()
    }

    async fn linked_refund(&self, original: Uuid) -> Result<Option<Transaction>, LedgerError> {
        let row = sqlx::query_as::<_, TransactionRow>(
            "SELECT * FROM transactions WHERE original_transaction_id = $1 AND category = 'refund' LIMIT 1",
        )
        .bind(original)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn sweepable_failures(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, LedgerError> {
        let rows = sqlx::query_as::<_, TransactionRow>(
            r#"
            SELECT * FROM transactions t
            WHERE t.status = 'failed'
              AND t.rail_reference IS NOT NULL
              AND t.settlement IS NULL
              AND t.created_at < $1
              AND NOT EXISTS (
                  SELECT 1 FROM transactions r
                  WHERE r.original_transaction_id = t.id
                    AND r.category = 'refund'
              )
            ORDER BY t.created_at
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn insert_recovery_task(
        &self,
        draft: RecoveryTaskDraft,
    ) -> Result<RecoveryTask, LedgerError> {
        let row = sqlx::query_as::<_, RecoveryTaskRow>(
            r#"
            INSERT INTO recovery_tasks (
                id, user_id, amount_cents, counterparty,
                bank_account_ref, scheduled_for, original_transaction_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(draft.id)
        .bind(draft.user_id)
        .bind(draft.amount_cents)
        .bind(&draft.counterparty)
        .bind(&draft.bank_account_ref)
        .bind(draft.scheduled_for)
        .bind(draft.original_transaction_id)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn recovery_task(&self, id: Uuid) -> Result<Option<RecoveryTask>, LedgerError> {
        let row =
            sqlx::query_as::<_, RecoveryTaskRow>("SELECT * FROM recovery_tasks WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn due_recovery_tasks(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<RecoveryTask>, LedgerError> {
        let rows = sqlx::query_as::<_, RecoveryTaskRow>(
            "SELECT * FROM recovery_tasks WHERE status = 'scheduled' AND scheduled_for <= $1 ORDER BY scheduled_for",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn claim_recovery_task(&self, id: Uuid) -> Result<bool, LedgerError> {
        let claimed = sqlx::query(
            "UPDATE recovery_tasks SET status = 'processing', updated_at = NOW() WHERE id = $1 AND status = 'scheduled'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(claimed == 1)
    }

    async fn finish_recovery_task(
        &self,
        id: Uuid,
        outcome: RecoveryOutcome,
    ) -> Result<(), LedgerError> {
        let updated = match outcome {
            RecoveryOutcome::Completed {
                debit_reference,
                credit_transaction_id,
            } => {
                sqlx::query(
                    r#"
                    UPDATE recovery_tasks
                    SET status = 'completed',
                        debit_reference = $2,
                        credit_transaction_id = $3,
                        updated_at = NOW()
                    WHERE id = $1 AND status = 'processing'
                    "#,
                )
                .bind(id)
                .bind(debit_reference)
                .bind(credit_transaction_id)
                .execute(&self.pool)
                .await?
                .rows_affected()
            }
            RecoveryOutcome::Failed {
                reason,
                debit_reference,
            } => {
                sqlx::query(
                    r#"
                    UPDATE recovery_tasks
                    SET status = 'failed',
                        failure_reason = $2,
                        debit_reference = COALESCE($3, debit_reference),
                        updated_at = NOW()
                    WHERE id = $1 AND status = 'processing'
                    "#,
                )
                .bind(id)
                .bind(reason)
                .bind(debit_reference)
                .execute(&self.pool)
                .await?
                .rows_affected()
            }
        };
        if updated == 0 {
            tracing::warn!(task_id = %id, "finish on a task that is not Processing, ignoring");
        }
        Ok(())
    }

    async fn fallback_policy(&self, user_id: Uuid) -> Result<FallbackPolicy, LedgerError> {
        let row: Option<(bool, i64)> = sqlx::query_as(
            "SELECT enabled, ceiling_cents FROM fallback_policies WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            Some((enabled, ceiling_cents)) => FallbackPolicy {
                user_id,
                enabled,
                ceiling_cents,
            },
            None => FallbackPolicy::disabled(user_id),
        })
    }

    async fn set_fallback_policy(&self, policy: FallbackPolicy) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO fallback_policies (user_id, enabled, ceiling_cents)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id)
            DO UPDATE SET enabled = $2, ceiling_cents = $3, updated_at = NOW()
            "#,
        )
        .bind(policy.user_id)
        .bind(policy.enabled)
        .bind(policy.ceiling_cents)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn linked_accounts(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<LinkedBankAccount>, LedgerError> {
        let rows: Vec<(Uuid, Uuid, String, bool, Option<String>, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT id, user_id, account_ref, is_default, mandate_ref, created_at
            FROM linked_bank_accounts
            WHERE user_id = $1
            ORDER BY is_default DESC, created_at
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(
                |(id, user_id, account_ref, is_default, mandate_ref, created_at)| {
                    LinkedBankAccount {
                        id,
                        user_id,
                        account_ref,
                        is_default,
                        mandate_ref,
                        created_at,
                    }
                },
            )
            .collect())
    }

    async fn link_bank_account(&self, account: LinkedBankAccount) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO linked_bank_accounts (id, user_id, account_ref, is_default, mandate_ref)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(account.id)
        .bind(account.user_id)
        .bind(&account.account_ref)
        .bind(account.is_default)
        .bind(&account.mandate_ref)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
