//! Business logic services.

pub mod notify_service;
pub mod payment_service;
pub mod wallet_service;
