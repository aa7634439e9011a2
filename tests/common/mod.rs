//! Shared test fixtures: mock providers and a wired-up service stack.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use wallet_ledger_core::services::notify_service::{NoopAuditLog, NoopLiveUpdates};
use wallet_ledger_core::{
    BankRail, FulfillmentProvider, FulfillmentRequest, FulfillmentResult, LedgerError,
    MemoryStore, PayRequest, PaymentPolicy, PaymentService, RailErrorClass, RailReceipt,
    RefundStatus, WalletService,
};

/// How the mock rail answers `pay`.
#[derive(Debug, Clone)]
pub enum PayBehavior {
    Capture,
    Decline(RailErrorClass, &'static str),
}

/// How the mock rail answers `debit`.
#[derive(Debug, Clone)]
pub enum DebitBehavior {
    Succeed,
    Fail(RailErrorClass, &'static str),
    /// Fail with a transient class this many times, then succeed
    FailThenSucceed(usize),
}

/// How the mock rail answers `query_refund_status`.
#[derive(Debug, Clone)]
pub enum RefundQueryBehavior {
    Status(RefundStatus),
    Unavailable,
}

pub struct MockBankRail {
    pub pay_behavior: Mutex<PayBehavior>,
    pub debit_behavior: Mutex<DebitBehavior>,
    pub refund_query: Mutex<RefundQueryBehavior>,
    pub pay_calls: AtomicUsize,
    pub debit_calls: AtomicUsize,
    pub refund_queries: AtomicUsize,
    pub last_debit_account: Mutex<Option<String>>,
}

impl MockBankRail {
    pub fn new() -> Self {
        Self {
            pay_behavior: Mutex::new(PayBehavior::Capture),
            debit_behavior: Mutex::new(DebitBehavior::Succeed),
            refund_query: Mutex::new(RefundQueryBehavior::Status(RefundStatus::Unknown)),
            pay_calls: AtomicUsize::new(0),
            debit_calls: AtomicUsize::new(0),
            refund_queries: AtomicUsize::new(0),
            last_debit_account: Mutex::new(None),
        }
    }

    pub async fn set_pay(&self, behavior: PayBehavior) {
        *self.pay_behavior.lock().await = behavior;
    }

    pub async fn set_debit(&self, behavior: DebitBehavior) {
        *self.debit_behavior.lock().await = behavior;
    }

    pub async fn set_refund_query(&self, behavior: RefundQueryBehavior) {
        *self.refund_query.lock().await = behavior;
    }
}

#[async_trait]
impl BankRail for MockBankRail {
    async fn pay(&self, _request: &PayRequest) -> Result<RailReceipt, LedgerError> {
        let n = self.pay_calls.fetch_add(1, Ordering::SeqCst);
        match &*self.pay_behavior.lock().await {
            PayBehavior::Capture => Ok(RailReceipt {
                rail_reference: format!("RAIL-{n}"),
            }),
            PayBehavior::Decline(class, message) => Err(LedgerError::Rail {
                class: *class,
                message: (*message).to_string(),
            }),
        }
    }

    async fn debit(
        &self,
        account_ref: &str,
        _amount_cents: i64,
        _reason: &str,
    ) -> Result<RailReceipt, LedgerError> {
        let n = self.debit_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_debit_account.lock().await = Some(account_ref.to_string());
        let mut behavior = self.debit_behavior.lock().await;
        match &mut *behavior {
            DebitBehavior::Succeed => Ok(RailReceipt {
                rail_reference: format!("DEBIT-{n}"),
            }),
            DebitBehavior::Fail(class, message) => Err(LedgerError::Rail {
                class: *class,
                message: (*message).to_string(),
            }),
            DebitBehavior::FailThenSucceed(remaining) => {
                if *remaining == 0 {
                    Ok(RailReceipt {
                        rail_reference: format!("DEBIT-{n}"),
                    })
                } else {
                    *remaining -= 1;
                    Err(LedgerError::Rail {
                        class: RailErrorClass::BankDown,
                        message: "gateway timeout".to_string(),
                    })
                }
            }
        }
    }

    async fn query_refund_status(
        &self,
        _rail_reference: &str,
    ) -> Result<RefundStatus, LedgerError> {
        self.refund_queries.fetch_add(1, Ordering::SeqCst);
        match &*self.refund_query.lock().await {
            RefundQueryBehavior::Status(status) => Ok(*status),
            RefundQueryBehavior::Unavailable => Err(LedgerError::Rail {
                class: RailErrorClass::BankDown,
                message: "status service unavailable".to_string(),
            }),
        }
    }
}

/// How the mock fulfillment provider answers.
#[derive(Debug, Clone)]
pub enum FulfillBehavior {
    Complete,
    Pending,
    Fail(&'static str),
}

pub struct MockFulfillment {
    pub behavior: Mutex<FulfillBehavior>,
    pub calls: AtomicUsize,
}

impl MockFulfillment {
    pub fn new() -> Self {
        Self {
            behavior: Mutex::new(FulfillBehavior::Complete),
            calls: AtomicUsize::new(0),
        }
    }

    pub async fn set(&self, behavior: FulfillBehavior) {
        *self.behavior.lock().await = behavior;
    }
}

#[async_trait]
impl FulfillmentProvider for MockFulfillment {
    async fn fulfill(
        &self,
        correlation_id: Uuid,
        _request: &FulfillmentRequest,
    ) -> Result<FulfillmentResult, LedgerError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(match &*self.behavior.lock().await {
            FulfillBehavior::Complete => FulfillmentResult::Completed {
                reference: Some(format!("OP-{correlation_id}-{n}")),
            },
            FulfillBehavior::Pending => FulfillmentResult::Pending {
                reference: Some(format!("OP-{correlation_id}-{n}")),
            },
            FulfillBehavior::Fail(message) => FulfillmentResult::Failed {
                message: (*message).to_string(),
            },
        })
    }
}

/// The full service stack over the in-memory store.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub wallet: Arc<WalletService>,
    pub bank: Arc<MockBankRail>,
    pub fulfillment: Arc<MockFulfillment>,
    pub payments: PaymentService,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_policy(test_policy())
    }

    pub fn with_policy(policy: PaymentPolicy) -> Self {
        let store = Arc::new(MemoryStore::new());
        let wallet = Arc::new(WalletService::new(
            store.clone(),
            Arc::new(NoopLiveUpdates),
        ));
        let bank = Arc::new(MockBankRail::new());
        let fulfillment = Arc::new(MockFulfillment::new());
        let payments = PaymentService::new(
            store.clone(),
            wallet.clone(),
            bank.clone(),
            fulfillment.clone(),
            Arc::new(NoopAuditLog),
            Arc::new(NoopLiveUpdates),
            policy,
        );
        Self {
            store,
            wallet,
            bank,
            fulfillment,
            payments,
        }
    }
}

/// Policy used by the tests: recovery tasks are due immediately so worker
/// ticks can run without clock manipulation.
pub fn test_policy() -> PaymentPolicy {
    PaymentPolicy {
        recovery_delay: Some(chrono::Duration::zero()),
        ..PaymentPolicy::default()
    }
}

pub fn fulfillment_request() -> FulfillmentRequest {
    FulfillmentRequest {
        service: "bill_pay".to_string(),
        params: serde_json::json!({ "biller": "acme-power", "consumer_no": "4411" }),
    }
}
