//! Payment orchestrator.
//!
//! Drives a user-initiated payment through capture, the wallet-fallback
//! decision, fulfillment, and the compensating credit when fulfillment
//! fails after money has moved. The one invariant this module exists to
//! protect: money is never taken without either delivering the purchased
//! good or returning the money — and when automation cannot guarantee
//! either, the case is recorded loudly enough that an operator will.
//!
//! # Flow
//!
//! 1. Pre-log a Pending transaction (auditable even if we crash mid-call)
//! 2. Capture on the requested rail, or substitute the wallet when the
//!    rail failure class, the user's fallback policy and the wallet
//!    balance all allow it (scheduling a recovery task for later)
//! 3. Call the fulfillment provider at most once
//! 4. On fulfillment failure, compensate: credit the money back, linked to
//!    the original transaction
//! 5. Fire audit-log and live-update writes off the critical path

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::models::recovery::RecoveryTaskDraft;
use crate::models::transaction::{
    RailKind, Transaction, TransactionDraft, TransactionPatch, TxCategory, TxStatus,
};
use crate::providers::{
    BankRail, FulfillmentProvider, FulfillmentRequest, FulfillmentResult, PayRequest,
    RailErrorClass,
};
use crate::services::notify_service::{AuditLog, LiveUpdates, WalletEvent};
use crate::services::wallet_service::WalletService;
use crate::store::LedgerStore;

/// Orchestrator tunables, loaded from configuration.
#[derive(Debug, Clone)]
pub struct PaymentPolicy {
    /// How long after creation a transaction may still be cancelled
    pub cancellation_window: Duration,
    /// Hour of day (UTC) recovery tasks are batched to
    pub recovery_cutover_hour: u32,
    /// Fixed-delay override for recovery scheduling; when set, tasks run
    /// this long after creation instead of at the cutover
    pub recovery_delay: Option<Duration>,
    /// Refund ETA quoted on failures that need manual reconciliation
    pub manual_refund_eta: Duration,
}

impl Default for PaymentPolicy {
    fn default() -> Self {
        Self {
            cancellation_window: Duration::minutes(30),
            recovery_cutover_hour: 0,
            recovery_delay: None,
            manual_refund_eta: Duration::hours(72),
        }
    }
}

impl PaymentPolicy {
    /// When a recovery task created at `now` should run: either after the
    /// fixed delay, or at the next occurrence of the cutover hour.
    pub fn next_recovery_slot(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        if let Some(delay) = self.recovery_delay {
            return now + delay;
        }
        let cutover = now
            .date_naive()
            .and_hms_opt(self.recovery_cutover_hour, 0, 0)
            .expect("cutover hour is validated at configuration load")
            .and_utc();
        if cutover > now {
            cutover
        } else {
            cutover + Duration::days(1)
        }
    }
}

/// A user-initiated payment.
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub user_id: Uuid,
    /// Positive amount in cents
    pub amount_cents: i64,
    pub rail: RailKind,
    /// Payee display name
    pub counterparty: String,
    pub description: Option<String>,
    pub fulfillment: FulfillmentRequest,
}

/// Terminal disposition of a payment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    Completed,
    /// Captured and accepted; settling asynchronously on the provider side
    Processing,
    Failed,
}

/// What the caller gets back. Always carries a transaction id — even
/// attempts rejected before capture leave a record the user can reference
/// with support.
#[derive(Debug, Clone)]
pub struct PaymentOutcome {
    pub status: PaymentStatus,
    pub transaction_id: Uuid,
    pub message: String,
}

pub struct PaymentService {
    store: Arc<dyn LedgerStore>,
    wallet: Arc<WalletService>,
    bank: Arc<dyn BankRail>,
    fulfillment: Arc<dyn FulfillmentProvider>,
    audit: Arc<dyn AuditLog>,
    live: Arc<dyn LiveUpdates>,
    policy: PaymentPolicy,
}

impl PaymentService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        wallet: Arc<WalletService>,
        bank: Arc<dyn BankRail>,
        fulfillment: Arc<dyn FulfillmentProvider>,
        audit: Arc<dyn AuditLog>,
        live: Arc<dyn LiveUpdates>,
        policy: PaymentPolicy,
    ) -> Self {
        Self {
            store,
            wallet,
            bank,
            fulfillment,
            audit,
            live,
            policy,
        }
    }

    /// Execute a payment end to end.
    ///
    /// Business failures come back as `PaymentOutcome` with
    /// `PaymentStatus::Failed`, never as a bare error: the caller (and the
    /// user) always gets a transaction id. Only storage failures that
    /// prevent even the failure from being recorded propagate as `Err`.
    pub async fn execute(&self, request: PaymentRequest) -> Result<PaymentOutcome, LedgerError> {
        if request.amount_cents <= 0 {
            // Rejected before any rail is touched; a post-hoc record still
            // gives the caller a stable reference.
            let record = self
                .store
                .insert_transaction(
                    TransactionDraft::new(
                        request.user_id,
                        TxCategory::FailedAttempt,
                        request.counterparty.clone(),
                        -request.amount_cents.max(0),
                        TxStatus::Failed,
                    )
                    .description("amount must be positive"),
                )
                .await?;
            return Ok(PaymentOutcome {
                status: PaymentStatus::Failed,
                transaction_id: record.id,
                message: "amount must be positive".to_string(),
            });
        }

        // Pre-log intent: if the process dies before capture, this Pending
        // record is what makes the attempt auditable.
        let mut draft = TransactionDraft::new(
            request.user_id,
            TxCategory::PaymentSent,
            request.counterparty.clone(),
            -request.amount_cents,
            TxStatus::Pending,
        )
        .rail(request.rail);
        draft.description = request.description.clone();
        let pending = self.store.insert_transaction(draft).await?;

        let outcome = match self.run(&request, &pending).await {
            Ok(outcome) => outcome,
            Err(err) => self.fail_pending(&pending, err).await?,
        };

        self.finalize(pending.id, request.user_id, &outcome);
        Ok(outcome)
    }

    async fn run(
        &self,
        request: &PaymentRequest,
        pending: &Transaction,
    ) -> Result<PaymentOutcome, LedgerError> {
        self.capture(request, pending).await?;

        match self
            .fulfillment
            .fulfill(pending.id, &request.fulfillment)
            .await
        {
            Ok(FulfillmentResult::Completed { reference }) => {
                let mut patch = TransactionPatch::status(TxStatus::Completed);
                patch.operator_reference = reference;
                self.store.update_transaction(pending.id, patch).await?;
                Ok(PaymentOutcome {
                    status: PaymentStatus::Completed,
                    transaction_id: pending.id,
                    message: "payment completed".to_string(),
                })
            }
            Ok(FulfillmentResult::Pending { reference }) => {
                let mut patch = TransactionPatch::status(TxStatus::Processing);
                patch.operator_reference = reference;
                self.store.update_transaction(pending.id, patch).await?;
                Ok(PaymentOutcome {
                    status: PaymentStatus::Processing,
                    transaction_id: pending.id,
                    message: "payment accepted, fulfillment in progress".to_string(),
                })
            }
            Ok(FulfillmentResult::Failed { message }) => {
                let failure = LedgerError::Fulfillment(message.clone());
                tracing::warn!(
                    transaction_id = %pending.id,
                    error = %failure,
                    "fulfillment reported failure after capture"
                );
                self.compensate(request.user_id, pending.id, request.amount_cents, &message)
                    .await
            }
            // An ambiguous transport error is treated as a failure: the
            // provider is never called a second time for this correlation
            // id, and the user gets their money back.
            Err(err) => {
                let message = err.to_string();
                self.compensate(request.user_id, pending.id, request.amount_cents, &message)
                    .await
            }
        }
    }

    /// Capture the payment: wallet fast path, or rail with the fallback
    /// substitution. On return the pending transaction is Completed (wallet
    /// funded) or Processing with a rail reference (rail funded).
    async fn capture(
        &self,
        request: &PaymentRequest,
        pending: &Transaction,
    ) -> Result<(), LedgerError> {
        if request.rail == RailKind::Wallet {
            // Fast path: no fallback exists for the wallet itself.
            self.wallet
                .settle_pending_debit(request.user_id, request.amount_cents, pending.id, false)
                .await?;
            return Ok(());
        }

        let pay = PayRequest {
            user_id: request.user_id,
            amount_cents: request.amount_cents,
            rail: request.rail,
            reference: pending.id,
            counterparty: request.counterparty.clone(),
        };
        match self.bank.pay(&pay).await {
            Ok(receipt) => {
                let mut patch = TransactionPatch::status(TxStatus::Processing);
                patch.rail_reference = Some(receipt.rail_reference);
                self.store.update_transaction(pending.id, patch).await?;
                Ok(())
            }
            Err(LedgerError::Rail { class, message }) if class.allows_wallet_fallback() => {
                self.try_wallet_fallback(request, pending, class, message).await
            }
            Err(err) => Err(err),
        }
    }

    /// The wallet-bridge substitution: pay from the wallet in place of the
    /// failed rail, and schedule a deferred bank debit to restore it.
    async fn try_wallet_fallback(
        &self,
        request: &PaymentRequest,
        pending: &Transaction,
        failure_class: RailErrorClass,
        failure_message: String,
    ) -> Result<(), LedgerError> {
        let policy = self.store.fallback_policy(request.user_id).await?;
        if !policy.covers(request.amount_cents) {
            tracing::info!(
                user_id = %request.user_id,
                amount_cents = request.amount_cents,
                fallback_enabled = policy.enabled,
                ceiling_cents = policy.ceiling_cents,
                "rail failed and wallet fallback not permitted"
            );
            return Err(LedgerError::Rail {
                class: failure_class,
                message: format!("{failure_message} (fallback not permitted)"),
            });
        }

        let balance = self
            .store
            .account(request.user_id)
            .await?
            .map(|w| w.balance_cents)
            .unwrap_or(0);
        if balance < request.amount_cents {
            tracing::info!(
                user_id = %request.user_id,
                amount_cents = request.amount_cents,
                balance_cents = balance,
                "rail failed and wallet balance cannot cover fallback"
            );
            return Err(LedgerError::Rail {
                class: failure_class,
                message: format!("{failure_message} (wallet cannot cover)"),
            });
        }

        self.wallet
            .settle_pending_debit(request.user_id, request.amount_cents, pending.id, true)
            .await?;

        let scheduled_for = self.policy.next_recovery_slot(Utc::now());
        let task = self
            .store
            .insert_recovery_task(RecoveryTaskDraft::new(
                request.user_id,
                request.amount_cents,
                request.counterparty.clone(),
                scheduled_for,
                pending.id,
            ))
            .await?;

        tracing::info!(
            user_id = %request.user_id,
            transaction_id = %pending.id,
            task_id = %task.id,
            %scheduled_for,
            failure_class = %failure_class,
            "wallet substituted for failed rail, recovery scheduled"
        );
        Ok(())
    }

    /// The critical path: fulfillment failed after money already moved.
    async fn compensate(
        &self,
        user_id: Uuid,
        original: Uuid,
        amount_cents: i64,
        reason: &str,
    ) -> Result<PaymentOutcome, LedgerError> {
        match self
            .wallet
            .credit(
                user_id,
                amount_cents,
                TxCategory::Refund,
                "wallet refund",
                Some(format!("refund for failed fulfillment: {reason}")),
                Some(original),
            )
            .await
        {
            Ok(applied) => {
                let mut patch = TransactionPatch::status(TxStatus::Failed);
                patch.description =
                    Some(format!("fulfillment failed: {reason}; refund issued to wallet"));
                self.store.update_transaction(original, patch).await?;
                tracing::warn!(
                    %user_id,
                    transaction_id = %original,
                    refund_transaction_id = %applied.transaction.id,
                    amount_cents,
                    reason,
                    "fulfillment failed after capture, wallet compensated"
                );
                Ok(PaymentOutcome {
                    status: PaymentStatus::Failed,
                    transaction_id: original,
                    message: format!("payment failed ({reason}); amount refunded to wallet"),
                })
            }
            Err(credit_err) => {
                // Funds are now inconsistent: money left, fulfillment did
                // not happen, and the automatic refund failed too. Record
                // everything an operator needs and surface a ticket.
                let critical = LedgerError::Compensation {
                    original,
                    reason: credit_err.to_string(),
                };
                let ticket = support_ticket();
                let eta = Utc::now() + self.policy.manual_refund_eta;
                tracing::error!(
                    %user_id,
                    transaction_id = %original,
                    amount_cents,
                    reason,
                    error = %critical,
                    ticket = %ticket,
                    "compensating credit failed, manual reconciliation required"
                );
                let mut patch = TransactionPatch::status(TxStatus::Failed);
                patch.description = Some(format!(
                    "fulfillment failed: {reason}; automatic refund failed: {credit_err}"
                ));
                patch.ticket_id = Some(ticket.clone());
                patch.refund_eta = Some(eta);
                self.store.update_transaction(original, patch).await?;
                Ok(PaymentOutcome {
                    status: PaymentStatus::Failed,
                    transaction_id: original,
                    message: format!(
                        "payment failed; refund pending manual review (ticket {ticket})"
                    ),
                })
            }
        }
    }

    /// Cancel a transaction inside the cancellation window.
    ///
    /// Cancellation is a mutation like any other: it runs under the same
    /// per-user serialization, and a captured payment gets the same
    /// compensating credit as a fulfillment failure.
    pub async fn cancel(
        &self,
        user_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<Transaction, LedgerError> {
        let tx = self
            .store
            .transaction(transaction_id)
            .await?
            .ok_or_else(|| {
                LedgerError::Validation(format!("transaction {transaction_id} not found"))
            })?;

        if tx.user_id != user_id {
            return Err(LedgerError::Validation(
                "transaction does not belong to this user".to_string(),
            ));
        }
        if !tx.category.is_cancellable() {
            return Err(LedgerError::Validation(format!(
                "{} transactions cannot be cancelled",
                tx.category
            )));
        }
        if Utc::now() - tx.created_at > self.policy.cancellation_window {
            return Err(LedgerError::Validation(
                "outside the cancellation window".to_string(),
            ));
        }
        if !tx.status.accepts_transition_to(TxStatus::Cancelled) {
            return Err(LedgerError::Validation(format!(
                "transaction in state {} cannot be cancelled",
                tx.status
            )));
        }

        // Money only moved if the payment got past Pending.
        let money_moved = matches!(tx.status, TxStatus::Processing | TxStatus::Completed);

        let cancelled = self
            .store
            .update_transaction(transaction_id, TransactionPatch::status(TxStatus::Cancelled))
            .await?;

        if money_moved {
            let amount = tx.amount_cents.abs();
            if let Err(err) = self
                .wallet
                .credit(
                    user_id,
                    amount,
                    TxCategory::Refund,
                    "cancellation refund",
                    Some("refund for cancelled payment".to_string()),
                    Some(transaction_id),
                )
                .await
            {
                let ticket = support_ticket();
                tracing::error!(
                    %user_id,
                    %transaction_id,
                    amount_cents = amount,
                    error = %err,
                    ticket = %ticket,
                    "cancellation refund failed, manual reconciliation required"
                );
                let mut patch = TransactionPatch::default();
                patch.ticket_id = Some(ticket);
                patch.refund_eta = Some(Utc::now() + self.policy.manual_refund_eta);
                self.store.update_transaction(transaction_id, patch).await?;
            }
        }

        self.finalize_status(transaction_id, user_id, TxStatus::Cancelled);
        Ok(cancelled)
    }

    async fn fail_pending(
        &self,
        pending: &Transaction,
        err: LedgerError,
    ) -> Result<PaymentOutcome, LedgerError> {
        let message = err.to_string();
        // The wallet mutator may already have marked the record Failed;
        // the store drops a repeated terminal write, so only patch when
        // the record is still open.
        if let Some(current) = self.store.transaction(pending.id).await?
            && !current.status.is_terminal()
        {
            let mut patch = TransactionPatch::status(TxStatus::Failed);
            patch.description = Some(message.clone());
            self.store.update_transaction(pending.id, patch).await?;
        }
        tracing::info!(
            user_id = %pending.user_id,
            transaction_id = %pending.id,
            error = %message,
            "payment failed"
        );
        Ok(PaymentOutcome {
            status: PaymentStatus::Failed,
            transaction_id: pending.id,
            message,
        })
    }

    /// Terminal-outcome side effects: audit write and live update, both
    /// fire-and-forget. Neither can fail the user-facing call.
    fn finalize(&self, transaction_id: Uuid, user_id: Uuid, outcome: &PaymentOutcome) {
        let status = match outcome.status {
            PaymentStatus::Completed => TxStatus::Completed,
            PaymentStatus::Processing => TxStatus::Processing,
            PaymentStatus::Failed => TxStatus::Failed,
        };
        self.finalize_status(transaction_id, user_id, status);
    }

    fn finalize_status(&self, transaction_id: Uuid, user_id: Uuid, status: TxStatus) {
        let store = self.store.clone();
        let audit = self.audit.clone();
        tokio::spawn(async move {
            let payload = match store.transaction(transaction_id).await {
                Ok(Some(tx)) => match serde_json::to_value(&tx) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(%transaction_id, "audit payload serialization failed: {e}");
                        return;
                    }
                },
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!(%transaction_id, "audit read failed: {e}");
                    return;
                }
            };
            match audit.record(transaction_id, payload).await {
                Ok(hash) => {
                    let mut patch = TransactionPatch::default();
                    patch.audit_hash = Some(hash);
                    if let Err(e) = store.update_transaction(transaction_id, patch).await {
                        tracing::warn!(%transaction_id, "audit hash attach failed: {e}");
                    }
                }
                Err(e) => {
                    tracing::warn!(%transaction_id, "audit log write failed: {e}");
                }
            }
        });

        let live = self.live.clone();
        tokio::spawn(async move {
            live.notify(
                user_id,
                WalletEvent::TransactionUpdated {
                    transaction_id,
                    status,
                },
            )
            .await;
        });
    }
}

/// Short human-quotable support reference.
fn support_ticket() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("TKT-{}", &id[..8].to_uppercase())
}
