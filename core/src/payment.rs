//! Payment intents: attempts at an external gateway transaction.
//!
//! An order may accumulate several attempts, at most one of which is active
//! (non-terminal) at a time and exactly one of which may ever settle. Each
//! attempt carries a deterministic idempotency key so a retried creation
//! request can never duplicate a gateway charge.

use crate::events::DomainEvent;
use crate::types::{GatewayRef, Money, OrderId, PaymentIntentId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Lifecycle of a single payment attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentStatus {
    /// Created locally; the gateway transaction may or may not exist yet.
    Created,
    /// The gateway authorized the charge; settlement is pending.
    Authorized,
    /// The gateway confirmed the payment as final.
    Settled,
    /// The gateway rejected or failed the charge.
    Failed,
    /// The attempt was abandoned (order cancelled/expired, or the gateway
    /// expired the transaction).
    Expired,
}

impl IntentStatus {
    /// Terminal statuses absorb duplicate notifications as no-ops.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Settled | Self::Failed | Self::Expired)
    }
}

impl fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Authorized => "authorized",
            Self::Settled => "settled",
            Self::Failed => "failed",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// One attempt at charging an order through the external gateway.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentIntent {
    /// Intent identifier (internal).
    pub id: PaymentIntentId,
    /// The order this attempt charges.
    pub order_id: OrderId,
    /// Gateway-assigned transaction id, unique once assigned.
    pub gateway_reference: Option<GatewayRef>,
    /// Amount to charge; always the order total.
    pub amount: Money,
    /// Current lifecycle status.
    pub status: IntentStatus,
    /// 1-based attempt counter within the order.
    pub attempt_number: u32,
    /// Deterministic key derived from `(order_id, attempt_number)`.
    pub idempotency_key: String,
    /// When the attempt was created.
    pub created_at: DateTime<Utc>,
}

impl PaymentIntent {
    /// Creates attempt `attempt_number` for an order.
    #[must_use]
    pub fn new(
        order_id: OrderId,
        amount: Money,
        attempt_number: u32,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: PaymentIntentId::new(),
            order_id,
            gateway_reference: None,
            amount,
            status: IntentStatus::Created,
            attempt_number,
            idempotency_key: idempotency_key(order_id, attempt_number),
            created_at,
        }
    }

    /// Whether this attempt is still in flight (non-terminal).
    #[must_use]
    pub const fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// Derives the idempotency key for an `(order, attempt)` pair.
///
/// The key is a hex SHA-256 digest, so retried creation requests for the
/// same attempt always present the same key to the gateway and can never
/// duplicate a charge.
#[must_use]
pub fn idempotency_key(order_id: OrderId, attempt_number: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(order_id.as_uuid().as_bytes());
    hasher.update(b":");
    hasher.update(attempt_number.to_be_bytes());
    hex::encode(hasher.finalize())
}

/// Result of funnelling a gateway notification through the order aggregate.
#[derive(Debug)]
pub enum CallbackOutcome {
    /// State changed; the carried events (if any) must be published.
    Applied {
        /// Events to publish, e.g. `OrderPaid` on settlement.
        events: Vec<DomainEvent>,
    },
    /// The intent was already in this terminal status: duplicate
    /// notification absorbed, nothing to persist beyond a log line.
    Duplicate,
    /// The notification contradicts recorded state. Any defensible state
    /// change (recording that money actually moved) has been applied, but
    /// the order itself is left for manual reconciliation.
    Conflict {
        /// Alert for the operator channel.
        alert: crate::events::OperatorAlert,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::Currency;

    #[test]
    fn idempotency_key_is_deterministic_per_attempt() {
        let order = OrderId::new();
        assert_eq!(idempotency_key(order, 1), idempotency_key(order, 1));
        assert_ne!(idempotency_key(order, 1), idempotency_key(order, 2));
        assert_ne!(idempotency_key(order, 1), idempotency_key(OrderId::new(), 1));
    }

    #[test]
    fn new_intent_starts_created_with_derived_key() {
        let order = OrderId::new();
        let intent = PaymentIntent::new(
            order,
            Money::from_minor_units(1500, Currency::Usd),
            1,
            Utc::now(),
        );
        assert_eq!(intent.status, IntentStatus::Created);
        assert!(intent.is_active());
        assert!(intent.gateway_reference.is_none());
        assert_eq!(intent.idempotency_key, idempotency_key(order, 1));
    }

    #[test]
    fn terminal_statuses() {
        assert!(!IntentStatus::Created.is_terminal());
        assert!(!IntentStatus::Authorized.is_terminal());
        assert!(IntentStatus::Settled.is_terminal());
        assert!(IntentStatus::Failed.is_terminal());
        assert!(IntentStatus::Expired.is_terminal());
    }
}
