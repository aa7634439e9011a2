//! Background workers, decoupled from request handling.

pub mod recovery;
pub mod sweeper;
