//! Application configuration management.
//!
//! Configuration comes from environment variables, deserialized with the
//! `envy` crate into a type-safe struct. A `.env` file is honored when
//! present.

use serde::Deserialize;

use crate::services::payment_service::PaymentPolicy;

/// Configuration for the ledger core and its worker daemon.
///
/// # Environment Variables
///
/// - `DATABASE_URL` (required): PostgreSQL connection string
/// - `BANK_RAIL_URL` (required): base URL of the rail gateway
/// - `PROVIDER_SECRET` (required): HMAC key for signing provider requests
/// - `FULFILLMENT_URL`, `LIVE_UPDATES_URL`, `AUDIT_LOG_URL` (optional)
/// - Worker knobs, all optional with defaults: `MAX_CONNECTIONS`,
///   `PROVIDER_TIMEOUT_SECS`, `RECOVERY_POLL_SECS`, `SWEEPER_POLL_SECS`,
///   `REFUND_GRACE_HOURS`, `CANCELLATION_WINDOW_MINS`,
///   `RECOVERY_CUTOVER_HOUR`, `RECOVERY_DELAY_SECS`
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    pub bank_rail_url: String,

    pub provider_secret: String,

    pub fulfillment_url: Option<String>,

    pub live_updates_url: Option<String>,

    pub audit_log_url: Option<String>,

    /// Per-request timeout for every outbound provider call
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,

    #[serde(default = "default_recovery_poll_secs")]
    pub recovery_poll_secs: u64,

    #[serde(default = "default_sweeper_poll_secs")]
    pub sweeper_poll_secs: u64,

    /// How long a failed transaction may sit unresolved before the
    /// sweeper reconciles it
    #[serde(default = "default_refund_grace_hours")]
    pub refund_grace_hours: i64,

    #[serde(default = "default_cancellation_window_mins")]
    pub cancellation_window_mins: i64,

    /// Hour of day (UTC) recovery tasks are batched to
    #[serde(default = "default_recovery_cutover_hour")]
    pub recovery_cutover_hour: u32,

    /// When set, recovery tasks run this many seconds after creation
    /// instead of at the cutover hour
    pub recovery_delay_secs: Option<i64>,
}

fn default_max_connections() -> u32 {
    5
}

fn default_provider_timeout_secs() -> u64 {
    5
}

fn default_recovery_poll_secs() -> u64 {
    60
}

fn default_sweeper_poll_secs() -> u64 {
    300
}

fn default_refund_grace_hours() -> i64 {
    24
}

fn default_cancellation_window_mins() -> i64 {
    30
}

fn default_recovery_cutover_hour() -> u32 {
    0
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required variables are missing, values cannot
    /// be parsed, or the cutover hour is out of range.
    pub fn from_env() -> Result<Self, envy::Error> {
        // Try to load .env file if it exists (does nothing if not found)
        dotenvy::dotenv().ok();

        let config = envy::from_env::<Config>()?;
        if config.recovery_cutover_hour > 23 {
            return Err(envy::Error::Custom(format!(
                "RECOVERY_CUTOVER_HOUR must be 0..=23, got {}",
                config.recovery_cutover_hour
            )));
        }
        Ok(config)
    }

    /// The orchestrator tunables derived from this configuration.
    pub fn payment_policy(&self) -> PaymentPolicy {
        PaymentPolicy {
            cancellation_window: chrono::Duration::minutes(self.cancellation_window_mins),
            recovery_cutover_hour: self.recovery_cutover_hour,
            recovery_delay: self
                .recovery_delay_secs
                .map(chrono::Duration::seconds),
            manual_refund_eta: chrono::Duration::hours(72),
        }
    }
}
