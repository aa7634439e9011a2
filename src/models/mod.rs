//! Data models for the wallet ledger core.

pub mod recovery;
pub mod transaction;
pub mod user;
pub mod wallet;
