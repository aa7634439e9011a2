//! Background worker behavior: recovery scheduling and the refund
//! sweeper, including idempotency under repeated runs.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use uuid::Uuid;

use common::{
    DebitBehavior, Harness, PayBehavior, RefundQueryBehavior, fulfillment_request,
};
use wallet_ledger_core::{
    FallbackPolicy, LedgerStore, LinkedBankAccount, PaymentRequest, PaymentStatus, RailErrorClass,
    RailKind, RecoveryStatus, RecoveryWorker, RefundStatus, RefundSweeper, Settlement,
    TransactionDraft, TransactionPatch, TxCategory, TxStatus,
};

fn recovery_worker(h: &Harness) -> RecoveryWorker {
    RecoveryWorker::new(
        h.store.clone(),
        h.wallet.clone(),
        h.bank.clone(),
        Duration::from_secs(60),
    )
}

fn sweeper(h: &Harness) -> RefundSweeper {
    // Zero grace period so freshly created failures are in scope
    RefundSweeper::new(
        h.store.clone(),
        h.wallet.clone(),
        h.bank.clone(),
        chrono::Duration::zero(),
        Duration::from_secs(300),
    )
}

fn link_account(user: Uuid, account_ref: &str, is_default: bool) -> LinkedBankAccount {
    LinkedBankAccount {
        id: Uuid::new_v4(),
        user_id: user,
        account_ref: account_ref.to_string(),
        is_default,
        mandate_ref: Some(format!("MANDATE-{account_ref}")),
        created_at: chrono::Utc::now(),
    }
}

/// Drive a fallback-funded payment: wallet 800, rail down, amount 300.
/// Leaves the wallet at 500 with one Scheduled (and already due) task.
async fn fallback_payment(h: &Harness, user: Uuid) -> Uuid {
    h.wallet
        .credit(user, 800, TxCategory::TopUp, "load", None, None)
        .await
        .unwrap();
    h.store
        .set_fallback_policy(FallbackPolicy {
            user_id: user,
            enabled: true,
            ceiling_cents: 1000,
        })
        .await
        .unwrap();
    h.bank
        .set_pay(PayBehavior::Decline(RailErrorClass::BankDown, "bank down"))
        .await;

    let outcome = h
        .payments
        .execute(PaymentRequest {
            user_id: user,
            amount_cents: 300,
            rail: RailKind::Upi,
            counterparty: "Acme Power Co".to_string(),
            description: None,
            fulfillment: fulfillment_request(),
        })
        .await
        .unwrap();
    assert_eq!(outcome.status, PaymentStatus::Completed);
    assert_eq!(h.wallet.balance(user).await.unwrap().balance_cents, 500);
    outcome.transaction_id
}

/// Leave a Failed transaction with a rail reference behind, as a payment
/// whose rail capture succeeded but which later failed ambiguously.
async fn stranded_failure(h: &Harness, user: Uuid, amount_cents: i64) -> Uuid {
    h.wallet.balance(user).await.unwrap();
    let tx = h
        .store
        .insert_transaction(
            TransactionDraft::new(
                user,
                TxCategory::PaymentSent,
                "Acme Power Co",
                -amount_cents,
                TxStatus::Pending,
            )
            .rail(RailKind::Upi),
        )
        .await
        .unwrap();
    let mut patch = TransactionPatch::status(TxStatus::Processing);
    patch.rail_reference = Some(format!("RAIL-{}", tx.id.simple()));
    h.store.update_transaction(tx.id, patch).await.unwrap();
    h.store
        .update_transaction(tx.id, TransactionPatch::status(TxStatus::Failed))
        .await
        .unwrap();
    tx.id
}

#[tokio::test]
async fn recovery_restores_the_wallet_after_a_fallback() {
    // Scenario: fallback for 300 leaves the wallet at 500; a successful
    // bank debit brings it back to 800.
    let h = Harness::new();
    let user = Uuid::new_v4();
    let original = fallback_payment(&h, user).await;
    h.store
        .link_bank_account(link_account(user, "ACC-1", true))
        .await
        .unwrap();

    let claimed = recovery_worker(&h).tick().await.unwrap();
    assert_eq!(claimed, 1);

    assert_eq!(h.wallet.balance(user).await.unwrap().balance_cents, 800);

    let tasks = h.store.due_recovery_tasks(chrono::Utc::now()).await.unwrap();
    assert!(tasks.is_empty(), "completed tasks are no longer due");

    let log = h.store.user_transactions(user).await.unwrap();
    let credit = log
        .iter()
        .find(|t| t.category == TxCategory::TopUp && t.original_transaction_id == Some(original))
        .expect("recovery credit must link the original payment");
    assert_eq!(credit.amount_cents, 300);
}

#[tokio::test]
async fn recovery_records_both_references_on_completion() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    fallback_payment(&h, user).await;
    h.store
        .link_bank_account(link_account(user, "ACC-1", true))
        .await
        .unwrap();

    let task_before = h.store.due_recovery_tasks(chrono::Utc::now()).await.unwrap()[0].clone();
    recovery_worker(&h).tick().await.unwrap();

    let task = h
        .store
        .recovery_task(task_before.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, RecoveryStatus::Completed);
    assert!(task.debit_reference.is_some());
    assert!(task.credit_transaction_id.is_some());
}

#[tokio::test]
async fn recovery_prefers_the_default_linked_account() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    fallback_payment(&h, user).await;
    h.store
        .link_bank_account(link_account(user, "ACC-OLD", false))
        .await
        .unwrap();
    h.store
        .link_bank_account(link_account(user, "ACC-DEFAULT", true))
        .await
        .unwrap();

    recovery_worker(&h).tick().await.unwrap();

    assert_eq!(
        h.bank.last_debit_account.lock().await.as_deref(),
        Some("ACC-DEFAULT")
    );
}

#[tokio::test]
async fn recovery_without_a_linked_account_fails_the_task() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    fallback_payment(&h, user).await;

    recovery_worker(&h).tick().await.unwrap();

    // Wallet untouched; the fallback credit stands
    assert_eq!(h.wallet.balance(user).await.unwrap().balance_cents, 500);
    assert_eq!(h.bank.debit_calls.load(Ordering::SeqCst), 0);

    let log = h.store.user_transactions(user).await.unwrap();
    assert!(
        log.iter()
            .all(|t| t.category != TxCategory::TopUp || t.original_transaction_id.is_none())
    );
}

#[tokio::test]
async fn recovery_debit_decline_leaves_the_wallet_alone() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    fallback_payment(&h, user).await;
    h.store
        .link_bank_account(link_account(user, "ACC-1", true))
        .await
        .unwrap();
    h.bank
        .set_debit(DebitBehavior::Fail(
            RailErrorClass::GenericDecline,
            "mandate revoked",
        ))
        .await;

    let task_id = h.store.due_recovery_tasks(chrono::Utc::now()).await.unwrap()[0].id;
    recovery_worker(&h).tick().await.unwrap();

    assert_eq!(h.wallet.balance(user).await.unwrap().balance_cents, 500);
    // Declines are final: exactly one debit attempt
    assert_eq!(h.bank.debit_calls.load(Ordering::SeqCst), 1);

    let task = h.store.recovery_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, RecoveryStatus::Failed);
    assert!(task.failure_reason.is_some());
}

#[tokio::test]
async fn recovery_retries_transient_debit_failures() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    fallback_payment(&h, user).await;
    h.store
        .link_bank_account(link_account(user, "ACC-1", true))
        .await
        .unwrap();
    h.bank.set_debit(DebitBehavior::FailThenSucceed(2)).await;

    recovery_worker(&h).tick().await.unwrap();

    assert_eq!(h.bank.debit_calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.wallet.balance(user).await.unwrap().balance_cents, 800);
}

#[tokio::test]
async fn recovery_runs_are_idempotent() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    fallback_payment(&h, user).await;
    h.store
        .link_bank_account(link_account(user, "ACC-1", true))
        .await
        .unwrap();

    let worker = recovery_worker(&h);
    assert_eq!(worker.tick().await.unwrap(), 1);
    assert_eq!(worker.tick().await.unwrap(), 0);
    assert_eq!(worker.tick().await.unwrap(), 0);

    // One debit, one credit, no matter how often the worker runs
    assert_eq!(h.bank.debit_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.wallet.balance(user).await.unwrap().balance_cents, 800);
}

#[tokio::test]
async fn sweeper_credits_once_on_unknown_rail_status() {
    // Scenario: a Failed transaction with a rail reference past the grace
    // period; the rail answers Unknown.
    let h = Harness::new();
    let user = Uuid::new_v4();
    let original = stranded_failure(&h, user, 400).await;
    h.bank
        .set_refund_query(RefundQueryBehavior::Status(RefundStatus::Unknown))
        .await;

    let sw = sweeper(&h);
    assert_eq!(sw.tick().await.unwrap(), 1);

    assert_eq!(h.wallet.balance(user).await.unwrap().balance_cents, 400);
    let tx = h.store.transaction(original).await.unwrap().unwrap();
    assert_eq!(tx.status, TxStatus::RefundedToWallet);

    let refund = h
        .store
        .linked_refund(original)
        .await
        .unwrap()
        .expect("sweeper refund must be linked");
    assert_eq!(refund.amount_cents, 400);

    // Running the sweeper again makes no further change
    assert_eq!(sw.tick().await.unwrap(), 0);
    assert_eq!(h.wallet.balance(user).await.unwrap().balance_cents, 400);
}

#[tokio::test]
async fn sweeper_only_annotates_when_the_rail_already_refunded() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    let original = stranded_failure(&h, user, 400).await;
    h.bank
        .set_refund_query(RefundQueryBehavior::Status(RefundStatus::Refunded))
        .await;

    let sw = sweeper(&h);
    sw.tick().await.unwrap();

    // No wallet movement: crediting here would double-refund
    assert_eq!(h.wallet.balance(user).await.unwrap().balance_cents, 0);
    let tx = h.store.transaction(original).await.unwrap().unwrap();
    assert_eq!(tx.status, TxStatus::Failed);
    assert_eq!(tx.settlement, Some(Settlement::RefundedByRail));
    assert!(h.store.linked_refund(original).await.unwrap().is_none());

    // Annotated transactions leave the sweeper's worklist
    assert_eq!(sw.tick().await.unwrap(), 0);
}

#[tokio::test]
async fn sweeper_only_annotates_when_the_rail_never_debited() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    let original = stranded_failure(&h, user, 250).await;
    h.bank
        .set_refund_query(RefundQueryBehavior::Status(RefundStatus::NotDebited))
        .await;

    sweeper(&h).tick().await.unwrap();

    assert_eq!(h.wallet.balance(user).await.unwrap().balance_cents, 0);
    let tx = h.store.transaction(original).await.unwrap().unwrap();
    assert_eq!(tx.settlement, Some(Settlement::NotDebited));
}

#[tokio::test]
async fn sweeper_credits_when_the_rail_query_is_unavailable() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    let original = stranded_failure(&h, user, 150).await;
    h.bank
        .set_refund_query(RefundQueryBehavior::Unavailable)
        .await;

    sweeper(&h).tick().await.unwrap();

    // Unreachable rail is treated as Unknown: the user gets their money
    assert_eq!(h.wallet.balance(user).await.unwrap().balance_cents, 150);
    let tx = h.store.transaction(original).await.unwrap().unwrap();
    assert_eq!(tx.status, TxStatus::RefundedToWallet);
}

#[tokio::test]
async fn sweeper_skips_failures_without_a_rail_reference() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    h.wallet.balance(user).await.unwrap();
    // A wallet-funded failure that was already compensated inline: no
    // rail reference, nothing for the sweeper to reconcile
    h.store
        .insert_transaction(TransactionDraft::new(
            user,
            TxCategory::PaymentSent,
            "shop",
            -100,
            TxStatus::Failed,
        ))
        .await
        .unwrap();

    assert_eq!(sweeper(&h).tick().await.unwrap(), 0);
    assert_eq!(h.wallet.balance(user).await.unwrap().balance_cents, 0);
}

#[tokio::test]
async fn sweeper_skips_failures_with_a_linked_refund() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    let original = stranded_failure(&h, user, 300).await;
    // A compensating credit already exists for this failure
    h.wallet
        .credit(
            user,
            300,
            TxCategory::Refund,
            "wallet refund",
            None,
            Some(original),
        )
        .await
        .unwrap();

    assert_eq!(sweeper(&h).tick().await.unwrap(), 0);
    assert_eq!(h.wallet.balance(user).await.unwrap().balance_cents, 300);
    assert_eq!(h.bank.refund_queries.load(Ordering::SeqCst), 0);
}
