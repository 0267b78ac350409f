//! Domain events and operator alerts emitted by the settlement pipeline.
//!
//! Events are consumed by downstream collaborators (licence grant, email).
//! Alerts carry integrity findings to the operator channel; they are never
//! shown to end users, who only ever see a generic "payment pending" state.

use crate::types::{CartItem, GatewayRef, OrderId, UserId};
use serde::{Deserialize, Serialize};

/// Facts emitted when an order reaches a terminal status.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomainEvent {
    /// The order settled; downstream grants licences and sends the receipt.
    OrderPaid {
        /// The settled order.
        order_id: OrderId,
        /// Its owner.
        user_id: UserId,
        /// The purchased items, as snapshotted at checkout.
        items: Vec<CartItem>,
    },
    /// The order was cancelled by its owner before any payment attempt
    /// got off the ground.
    OrderCancelled {
        /// The cancelled order.
        order_id: OrderId,
        /// Caller-supplied reason, recorded for the audit trail.
        reason: String,
    },
    /// The order sat unpaid past the configured TTL and was expired by the
    /// reconciliation sweep.
    OrderExpired {
        /// The expired order.
        order_id: OrderId,
    },
}

impl DomainEvent {
    /// The order this event belongs to.
    #[must_use]
    pub const fn order_id(&self) -> OrderId {
        match self {
            Self::OrderPaid { order_id, .. }
            | Self::OrderCancelled { order_id, .. }
            | Self::OrderExpired { order_id } => *order_id,
        }
    }
}

/// Integrity findings routed to the operator-facing alert channel.
///
/// These imply a bug, an attack, or a genuine financial discrepancy, so they
/// are logged and held for manual review instead of being auto-resolved.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatorAlert {
    /// A gateway notification contradicted recorded settlement state, for
    /// example a settlement arriving after the order already expired.
    SettlementConflict {
        /// The affected order.
        order_id: OrderId,
        /// What contradicted what.
        detail: String,
    },
    /// An inbound notification failed signature verification and was
    /// discarded without touching state.
    UntrustedCallback {
        /// Where the notification claimed to come from.
        detail: String,
    },
    /// A notification referenced a transaction this system never created.
    UnknownReference {
        /// The unmatched gateway reference.
        reference: GatewayRef,
    },
    /// The gateway reported a transaction status outside the known set.
    UnrecognizedGatewayStatus {
        /// The transaction the status was reported for.
        reference: GatewayRef,
        /// The raw status string, preserved for diagnosis.
        raw: String,
    },
}
