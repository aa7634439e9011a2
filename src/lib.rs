//! Wallet ledger and payment-fallback/recovery core.
//!
//! The backend core of a consumer payments super-app's wallet: an
//! authoritative per-user balance with atomic mutations under concurrency,
//! a payment orchestrator that survives partial failure (payment captured
//! but fulfillment failed, or a rail failure bridged with wallet funds),
//! and the background workers that pay the wallet back and reconcile
//! transactions stuck in uncertain failure states.
//!
//! # Architecture
//!
//! - **Storage**: PostgreSQL with sqlx (`store::postgres`), or an
//!   in-memory backend (`store::memory`) for tests and local development.
//!   Both implement the same atomic per-key mutation contract.
//! - **Wallet mutator** (`services::wallet_service`): the only path that
//!   changes a balance.
//! - **Payment orchestrator** (`services::payment_service`): capture,
//!   wallet-fallback decision, fulfillment, compensation, cancellation.
//! - **Workers** (`workers`): the recovery scheduler and refund sweeper,
//!   run as periodic tokio tasks by the daemon binary.
//! - **Providers** (`providers`): traits for the out-of-scope rail,
//!   fulfillment, audit and live-update collaborators, plus signed HTTP
//!   clients.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod providers;
pub mod services;
pub mod store;
pub mod workers;

pub use config::Config;
pub use error::LedgerError;
pub use models::recovery::{RecoveryOutcome, RecoveryStatus, RecoveryTask, RecoveryTaskDraft};
pub use models::transaction::{
    RailKind, Settlement, Transaction, TransactionDraft, TransactionPatch, TxCategory, TxStatus,
};
pub use models::user::{FallbackPolicy, LinkedBankAccount};
pub use models::wallet::WalletAccount;
pub use providers::{
    BankRail, FulfillmentProvider, FulfillmentRequest, FulfillmentResult, PayRequest,
    RailErrorClass, RailReceipt, RefundStatus,
};
pub use services::notify_service::{
    AuditLog, HttpAuditLog, LiveUpdates, NoopAuditLog, NoopLiveUpdates, WalletEvent,
    WebhookNotifier,
};
pub use services::payment_service::{
    PaymentOutcome, PaymentPolicy, PaymentRequest, PaymentService, PaymentStatus,
};
pub use services::wallet_service::{Applied, WalletService};
pub use store::memory::MemoryStore;
pub use store::postgres::PgStore;
pub use store::{LedgerStore, Mutation, MutationLog, MutationOutcome};
pub use workers::recovery::RecoveryWorker;
pub use workers::sweeper::RefundSweeper;
