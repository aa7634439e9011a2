//! Live-update notifications and the external audit ledger.
//!
//! Both channels are strictly best-effort: the wallet stays consistent in
//! storage whether or not a subscriber is connected, and an audit write
//! that fails is logged and forgotten, never allowed to fail the
//! user-facing operation. Callers fire these through `tokio::spawn` so
//! neither sits on the critical path of a payment.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::error::LedgerError;
use crate::models::transaction::TxStatus;
use crate::providers::http::{payload_hash, sign_payload, validate_endpoint_url};

/// An event pushed to the user's live-update channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WalletEvent {
    /// The wallet balance changed
    BalanceChanged {
        transaction_id: Uuid,
        new_balance_cents: i64,
    },
    /// A transaction reached a new status
    TransactionUpdated {
        transaction_id: Uuid,
        status: TxStatus,
    },
}

/// Push channel to connected clients. At-most-once, best-effort.
#[async_trait]
pub trait LiveUpdates: Send + Sync {
    async fn notify(&self, user_id: Uuid, event: WalletEvent);
}

/// External append-only audit ledger.
///
/// Returns a reference hash for the recorded payload.
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn record(
        &self,
        transaction_id: Uuid,
        payload: serde_json::Value,
    ) -> Result<String, LedgerError>;
}

/// No-op channel for deployments without a push gateway.
pub struct NoopLiveUpdates;

#[async_trait]
impl LiveUpdates for NoopLiveUpdates {
    async fn notify(&self, _user_id: Uuid, _event: WalletEvent) {}
}

#[derive(Serialize)]
struct EventEnvelope<'a> {
    user_id: Uuid,
    event: &'a WalletEvent,
}

/// Live updates delivered as signed webhooks to the push gateway.
pub struct WebhookNotifier {
    client: reqwest::Client,
    endpoint: url::Url,
    secret: String,
}

impl WebhookNotifier {
    pub fn new(endpoint: &str, secret: &str, timeout: Duration) -> Result<Self, LedgerError> {
        let endpoint = validate_endpoint_url(endpoint)?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint,
            secret: secret.to_string(),
        })
    }
}

#[async_trait]
impl LiveUpdates for WebhookNotifier {
    async fn notify(&self, user_id: Uuid, event: WalletEvent) {
        let envelope = EventEnvelope {
            user_id,
            event: &event,
        };
        let payload = match serde_json::to_string(&envelope) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(%user_id, "failed to serialize wallet event: {e}");
                return;
            }
        };

        let result = self
            .client
            .post(self.endpoint.clone())
            .header("Content-Type", "application/json")
            .header("X-Signature", sign_payload(&self.secret, &payload))
            .body(payload)
            .send()
            .await;

        // Delivery failures are logged and dropped: the channel is
        // best-effort and storage already holds the truth.
        if let Err(e) = result {
            tracing::warn!(%user_id, "live-update delivery failed: {e}");
        }
    }
}

#[derive(Serialize)]
struct AuditEnvelope<'a> {
    transaction_id: Uuid,
    payload: &'a serde_json::Value,
}

/// Audit writes posted to the external ledger service.
///
/// The reference hash is computed locally over the exact posted body, so a
/// record can be matched against the external ledger later even when the
/// service's acknowledgement is lost.
pub struct HttpAuditLog {
    client: reqwest::Client,
    endpoint: url::Url,
    secret: String,
}

impl HttpAuditLog {
    pub fn new(endpoint: &str, secret: &str, timeout: Duration) -> Result<Self, LedgerError> {
        let endpoint = validate_endpoint_url(endpoint)?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint,
            secret: secret.to_string(),
        })
    }
}

#[async_trait]
impl AuditLog for HttpAuditLog {
    async fn record(
        &self,
        transaction_id: Uuid,
        payload: serde_json::Value,
    ) -> Result<String, LedgerError> {
        let envelope = AuditEnvelope {
            transaction_id,
            payload: &payload,
        };
        let body = serde_json::to_string(&envelope)
            .map_err(|e| LedgerError::Validation(format!("audit payload serialization: {e}")))?;
        let hash = payload_hash(&body);

        self.client
            .post(self.endpoint.clone())
            .header("Content-Type", "application/json")
            .header("X-Signature", sign_payload(&self.secret, &body))
            .body(body)
            .send()
            .await?
            .error_for_status()?;

        Ok(hash)
    }
}

/// No-op audit sink for deployments without an external ledger.
pub struct NoopAuditLog;

#[async_trait]
impl AuditLog for NoopAuditLog {
    async fn record(
        &self,
        _transaction_id: Uuid,
        payload: serde_json::Value,
    ) -> Result<String, LedgerError> {
        Ok(payload_hash(&payload.to_string()))
    }
}
