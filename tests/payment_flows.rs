//! Payment orchestrator flows: capture, fallback, compensation,
//! cancellation.

mod common;

use std::sync::atomic::Ordering;

use uuid::Uuid;

use common::{FulfillBehavior, Harness, PayBehavior, fulfillment_request, test_policy};
use wallet_ledger_core::{
    LedgerError, LedgerStore, PaymentPolicy, PaymentRequest, PaymentStatus, RailErrorClass,
    RailKind, RecoveryStatus, TxCategory, TxStatus,
};

fn payment(user: Uuid, amount_cents: i64, rail: RailKind) -> PaymentRequest {
    PaymentRequest {
        user_id: user,
        amount_cents,
        rail,
        counterparty: "Acme Power Co".to_string(),
        description: Some("electricity bill".to_string()),
        fulfillment: fulfillment_request(),
    }
}

#[tokio::test]
async fn wallet_payment_completes_and_attaches_operator_reference() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    h.wallet
        .credit(user, 1000, TxCategory::TopUp, "load", None, None)
        .await
        .unwrap();

    let outcome = h
        .payments
        .execute(payment(user, 300, RailKind::Wallet))
        .await
        .unwrap();

    assert_eq!(outcome.status, PaymentStatus::Completed);
    assert_eq!(h.wallet.balance(user).await.unwrap().balance_cents, 700);

    let tx = h
        .store
        .transaction(outcome.transaction_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.status, TxStatus::Completed);
    assert_eq!(tx.amount_cents, -300);
    assert_eq!(tx.category, TxCategory::PaymentSent);
    assert!(tx.operator_reference.is_some());
    assert!(!tx.via_fallback);
}

#[tokio::test]
async fn fulfillment_failure_compensates_and_links_the_refund() {
    // Scenario: balance 1000, debit 500 succeeds, fulfillment fails
    let h = Harness::new();
    let user = Uuid::new_v4();
    h.wallet
        .credit(user, 1000, TxCategory::TopUp, "load", None, None)
        .await
        .unwrap();
    h.fulfillment.set(FulfillBehavior::Fail("biller offline")).await;

    let outcome = h
        .payments
        .execute(payment(user, 500, RailKind::Wallet))
        .await
        .unwrap();

    assert_eq!(outcome.status, PaymentStatus::Failed);
    assert_eq!(h.wallet.balance(user).await.unwrap().balance_cents, 1000);

    let original = h
        .store
        .transaction(outcome.transaction_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(original.status, TxStatus::Failed);
    assert!(
        original
            .description
            .as_deref()
            .unwrap()
            .contains("refund issued")
    );

    let refund = h
        .store
        .linked_refund(original.id)
        .await
        .unwrap()
        .expect("compensating credit must be linked");
    assert_eq!(refund.amount_cents, 500);
    assert_eq!(refund.status, TxStatus::Completed);
    assert_eq!(refund.category, TxCategory::Refund);
    assert_eq!(refund.original_transaction_id, Some(original.id));

    // Exactly two records for this payment: the failure and the refund
    let log = h.store.user_transactions(user).await.unwrap();
    assert_eq!(log.len(), 3); // top-up + payment + refund
}

#[tokio::test]
async fn fulfillment_pending_leaves_the_payment_processing() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    h.wallet
        .credit(user, 1000, TxCategory::TopUp, "load", None, None)
        .await
        .unwrap();
    h.fulfillment.set(FulfillBehavior::Pending).await;

    let outcome = h
        .payments
        .execute(payment(user, 200, RailKind::Wallet))
        .await
        .unwrap();

    assert_eq!(outcome.status, PaymentStatus::Processing);
    let tx = h
        .store
        .transaction(outcome.transaction_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.status, TxStatus::Processing);
    assert!(tx.operator_reference.is_some());
}

#[tokio::test]
async fn insufficient_wallet_balance_is_terminal_for_the_wallet_rail() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    h.wallet
        .credit(user, 100, TxCategory::TopUp, "load", None, None)
        .await
        .unwrap();

    let outcome = h
        .payments
        .execute(payment(user, 500, RailKind::Wallet))
        .await
        .unwrap();

    assert_eq!(outcome.status, PaymentStatus::Failed);
    assert_eq!(h.wallet.balance(user).await.unwrap().balance_cents, 100);
    // Fulfillment is never reached without a captured payment
    assert_eq!(h.fulfillment.calls.load(Ordering::SeqCst), 0);

    let tx = h
        .store
        .transaction(outcome.transaction_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.status, TxStatus::Failed);
}

#[tokio::test]
async fn bank_down_bridges_to_wallet_and_schedules_recovery() {
    // Scenario: rail reports BankDown for 300, ceiling 1000, wallet 800
    let h = Harness::new();
    let user = Uuid::new_v4();
    h.wallet
        .credit(user, 800, TxCategory::TopUp, "load", None, None)
        .await
        .unwrap();
    h.store
        .set_fallback_policy(wallet_ledger_core::FallbackPolicy {
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
        .execute(payment(user, 300, RailKind::Upi))
        .await
        .unwrap();

    assert_eq!(outcome.status, PaymentStatus::Completed);
    assert_eq!(h.wallet.balance(user).await.unwrap().balance_cents, 500);

    let tx = h
        .store
        .transaction(outcome.transaction_id)
        .await
        .unwrap()
        .unwrap();
    assert!(tx.via_fallback);
    assert_eq!(tx.status, TxStatus::Completed);

    let due = h
        .store
        .due_recovery_tasks(chrono::Utc::now())
        .await
        .unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].amount_cents, 300);
    assert_eq!(due[0].status, RecoveryStatus::Scheduled);
    assert_eq!(due[0].original_transaction_id, tx.id);
}

#[tokio::test]
async fn fallback_requires_an_enabled_policy() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    h.wallet
        .credit(user, 800, TxCategory::TopUp, "load", None, None)
        .await
        .unwrap();
    h.bank
        .set_pay(PayBehavior::Decline(RailErrorClass::BankDown, "bank down"))
        .await;

    let outcome = h
        .payments
        .execute(payment(user, 300, RailKind::Upi))
        .await
        .unwrap();

    assert_eq!(outcome.status, PaymentStatus::Failed);
    assert_eq!(h.wallet.balance(user).await.unwrap().balance_cents, 800);
    assert_eq!(h.fulfillment.calls.load(Ordering::SeqCst), 0);
    assert!(
        h.store
            .due_recovery_tasks(chrono::Utc::now())
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn fallback_requires_the_wallet_to_cover_the_amount() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    h.wallet
        .credit(user, 100, TxCategory::TopUp, "load", None, None)
        .await
        .unwrap();
    h.store
        .set_fallback_policy(wallet_ledger_core::FallbackPolicy {
            user_id: user,
            enabled: true,
            ceiling_cents: 1000,
        })
        .await
        .unwrap();
    h.bank
        .set_pay(PayBehavior::Decline(RailErrorClass::LimitExceeded, "limit"))
        .await;

    let outcome = h
        .payments
        .execute(payment(user, 300, RailKind::Upi))
        .await
        .unwrap();

    assert_eq!(outcome.status, PaymentStatus::Failed);
    assert_eq!(h.wallet.balance(user).await.unwrap().balance_cents, 100);
}

#[tokio::test]
async fn declines_never_fall_back() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    h.wallet
        .credit(user, 5000, TxCategory::TopUp, "load", None, None)
        .await
        .unwrap();
    h.store
        .set_fallback_policy(wallet_ledger_core::FallbackPolicy {
            user_id: user,
            enabled: true,
            ceiling_cents: 10_000,
        })
        .await
        .unwrap();
    h.bank
        .set_pay(PayBehavior::Decline(
            RailErrorClass::GenericDecline,
            "do not honour",
        ))
        .await;

    let outcome = h
        .payments
        .execute(payment(user, 300, RailKind::Card))
        .await
        .unwrap();

    assert_eq!(outcome.status, PaymentStatus::Failed);
    assert_eq!(h.wallet.balance(user).await.unwrap().balance_cents, 5000);
}

#[tokio::test]
async fn non_positive_amounts_are_rejected_before_any_rail() {
    let h = Harness::new();
    let user = Uuid::new_v4();

    let outcome = h
        .payments
        .execute(payment(user, 0, RailKind::Upi))
        .await
        .unwrap();

    assert_eq!(outcome.status, PaymentStatus::Failed);
    assert_eq!(h.bank.pay_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.fulfillment.calls.load(Ordering::SeqCst), 0);

    // Even a pre-validation rejection leaves a referenceable record
    let tx = h
        .store
        .transaction(outcome.transaction_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.status, TxStatus::Failed);
    assert_eq!(tx.category, TxCategory::FailedAttempt);
}

#[tokio::test]
async fn rail_capture_then_fulfillment_completes() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    h.wallet.balance(user).await.unwrap();

    let outcome = h
        .payments
        .execute(payment(user, 400, RailKind::Card))
        .await
        .unwrap();

    assert_eq!(outcome.status, PaymentStatus::Completed);
    // Rail-funded: wallet balance untouched
    assert_eq!(h.wallet.balance(user).await.unwrap().balance_cents, 0);

    let tx = h
        .store
        .transaction(outcome.transaction_id)
        .await
        .unwrap()
        .unwrap();
    assert!(tx.rail_reference.is_some());
    assert!(!tx.via_fallback);
}

#[tokio::test]
async fn cancellation_inside_the_window_refunds_a_captured_payment() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    h.wallet
        .credit(user, 1000, TxCategory::TopUp, "load", None, None)
        .await
        .unwrap();

    let outcome = h
        .payments
        .execute(payment(user, 400, RailKind::Wallet))
        .await
        .unwrap();
    assert_eq!(outcome.status, PaymentStatus::Completed);
    assert_eq!(h.wallet.balance(user).await.unwrap().balance_cents, 600);

    let cancelled = h
        .payments
        .cancel(user, outcome.transaction_id)
        .await
        .unwrap();
    assert_eq!(cancelled.status, TxStatus::Cancelled);
    assert_eq!(h.wallet.balance(user).await.unwrap().balance_cents, 1000);

    let refund = h
        .store
        .linked_refund(outcome.transaction_id)
        .await
        .unwrap()
        .expect("cancellation must link a refund");
    assert_eq!(refund.amount_cents, 400);
}

#[tokio::test]
async fn cancellation_outside_the_window_is_rejected() {
    let policy = PaymentPolicy {
        cancellation_window: chrono::Duration::zero(),
        ..test_policy()
    };
    let h = Harness::with_policy(policy);
    let user = Uuid::new_v4();
    h.wallet
        .credit(user, 1000, TxCategory::TopUp, "load", None, None)
        .await
        .unwrap();

    let outcome = h
        .payments
        .execute(payment(user, 400, RailKind::Wallet))
        .await
        .unwrap();

    let err = h
        .payments
        .cancel(user, outcome.transaction_id)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Validation(_)));
    assert_eq!(h.wallet.balance(user).await.unwrap().balance_cents, 600);
}

#[tokio::test]
async fn refunds_cannot_be_cancelled() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    h.wallet
        .credit(user, 1000, TxCategory::TopUp, "load", None, None)
        .await
        .unwrap();
    h.fulfillment.set(FulfillBehavior::Fail("biller offline")).await;

    let outcome = h
        .payments
        .execute(payment(user, 500, RailKind::Wallet))
        .await
        .unwrap();
    let refund = h
        .store
        .linked_refund(outcome.transaction_id)
        .await
        .unwrap()
        .unwrap();

    let err = h.payments.cancel(user, refund.id).await.unwrap_err();
    assert!(matches!(err, LedgerError::Validation(_)));
}

#[tokio::test]
async fn cancelling_someone_elses_transaction_is_rejected() {
    let h = Harness::new();
    let owner = Uuid::new_v4();
    let other = Uuid::new_v4();
    h.wallet
        .credit(owner, 1000, TxCategory::TopUp, "load", None, None)
        .await
        .unwrap();

    let outcome = h
        .payments
        .execute(payment(owner, 400, RailKind::Wallet))
        .await
        .unwrap();

    let err = h
        .payments
        .cancel(other, outcome.transaction_id)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Validation(_)));
    assert_eq!(h.wallet.balance(owner).await.unwrap().balance_cents, 600);
}
