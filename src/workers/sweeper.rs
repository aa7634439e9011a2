//! Refund sweeper.
//!
//! Reconciles payments that failed with a rail reference attached — the
//! cases where money may have left the user without either delivery or a
//! recorded refund. After the grace period the sweeper asks the rail what
//! actually happened; when the rail cannot say, the user is credited. The
//! bias toward crediting is an explicit policy choice: a rare double
//! credit (reconciled later by audit) beats leaving a user without their
//! money.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::error::LedgerError;
use crate::models::transaction::{Settlement, Transaction, TransactionPatch, TxCategory, TxStatus};
use crate::providers::{BankRail, RefundStatus};
use crate::services::wallet_service::WalletService;
use crate::store::LedgerStore;

pub struct RefundSweeper {
    store: Arc<dyn LedgerStore>,
    wallet: Arc<WalletService>,
    bank: Arc<dyn BankRail>,
    grace_period: chrono::Duration,
    poll_interval: Duration,
}

impl RefundSweeper {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        wallet: Arc<WalletService>,
        bank: Arc<dyn BankRail>,
        grace_period: chrono::Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            wallet,
            bank,
            grace_period,
            poll_interval,
        }
    }

    /// Run the polling loop forever.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            grace_hours = self.grace_period.num_hours(),
            "refund sweeper started"
        );
        loop {
            if let Err(e) = self.tick().await {
                error!("sweeper tick failed: {e}");
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Sweep everything past the grace period. Returns how many
    /// transactions were looked at.
    pub async fn tick(&self) -> Result<usize, LedgerError> {
        let cutoff = Utc::now() - self.grace_period;
        let candidates = self.store.sweepable_failures(cutoff).await?;
        let count = candidates.len();
        for tx in candidates {
            if let Err(e) = self.sweep_one(&tx).await {
                error!(transaction_id = %tx.id, "sweep failed: {e}");
            }
        }
        Ok(count)
    }

    async fn sweep_one(&self, tx: &Transaction) -> Result<(), LedgerError> {
        // Belt and braces against a racing sweeper instance: the candidate
        // query already excludes linked refunds, but the credit below is
        // not idempotent by itself.
        if self.store.linked_refund(tx.id).await?.is_some() {
            return Ok(());
        }
        let Some(rail_reference) = tx.rail_reference.as_deref() else {
            return Ok(());
        };

        let status = match self.bank.query_refund_status(rail_reference).await {
            Ok(status) => status,
            Err(err) => {
                warn!(
                    transaction_id = %tx.id,
                    rail_reference,
                    "rail status query unavailable, treating as unknown: {err}"
                );
                RefundStatus::Unknown
            }
        };

        match status {
            RefundStatus::Refunded => {
                info!(transaction_id = %tx.id, "rail already refunded, annotating only");
                self.annotate(tx, Settlement::RefundedByRail).await
            }
            RefundStatus::NotDebited => {
                info!(transaction_id = %tx.id, "rail confirms no debit, annotating only");
                self.annotate(tx, Settlement::NotDebited).await
            }
            RefundStatus::PendingRefund | RefundStatus::Unknown => {
                self.credit_back(tx).await
            }
        }
    }

    async fn annotate(&self, tx: &Transaction, settlement: Settlement) -> Result<(), LedgerError> {
        let mut patch = TransactionPatch::default();
        patch.settlement = Some(settlement);
        self.store.update_transaction(tx.id, patch).await?;
        Ok(())
    }

    async fn credit_back(&self, tx: &Transaction) -> Result<(), LedgerError> {
        let amount = tx.amount_cents.abs();
        let applied = self
            .wallet
            .credit(
                tx.user_id,
                amount,
                TxCategory::Refund,
                &tx.counterparty,
                Some("automatic refund for unresolved failed payment".to_string()),
                Some(tx.id),
            )
            .await?;

        self.store
            .update_transaction(tx.id, TransactionPatch::status(TxStatus::RefundedToWallet))
            .await?;

        info!(
            transaction_id = %tx.id,
            user_id = %tx.user_id,
            amount_cents = amount,
            refund_transaction_id = %applied.transaction.id,
            "wallet credited for unresolved failed payment"
        );
        Ok(())
    }
}
