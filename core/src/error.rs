//! Error taxonomy for the checkout pipeline.
//!
//! Every failure carries a [`ErrorKind`] classification that decides how it
//! propagates: validation and conflict errors go back to the caller,
//! integrity errors go to the operator alert channel, transient errors are
//! retried by the sweep/dispatcher. No financial-state error is ever masked
//! as success.

use crate::types::{Currency, GatewayRef, OrderId, PaymentIntentId};
use thiserror::Error;

/// Propagation class of a [`CheckoutError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected synchronously, no state change, reported to the caller.
    Validation,
    /// Concurrent or out-of-order mutation; retried locally for optimistic
    /// concurrency, otherwise surfaced to the caller.
    Conflict,
    /// A bug, an attack, or a genuine financial discrepancy. Never
    /// auto-resolved: logged, alerted, and held for manual review.
    Integrity,
    /// Temporary infrastructure failure; retried with backoff, never
    /// silently dropped.
    Transient,
}

/// Errors produced by the checkout domain and its runtime services.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CheckoutError {
    // ---- Validation -------------------------------------------------------
    /// Checkout attempted with an empty cart.
    #[error("cannot create an order from an empty cart")]
    EmptyCart,

    /// Item quantity below 1, or above 1 for a digital good.
    #[error("invalid quantity {quantity} for a digital purchase")]
    InvalidQuantity {
        /// The rejected quantity.
        quantity: u32,
    },

    /// The movie is already in the cart (one line per movie).
    #[error("movie {movie} is already in the cart")]
    AlreadyInCart {
        /// The duplicated movie.
        movie: crate::types::MovieId,
    },

    /// The user already owns this movie through a paid order.
    #[error("movie {movie} is already owned by user {user}")]
    AlreadyOwned {
        /// The movie in question.
        movie: crate::types::MovieId,
        /// The owning user.
        user: crate::types::UserId,
    },

    /// Client-supplied total disagrees with the server-side recomputation.
    #[error("client total {client} does not match computed total {computed}")]
    PriceMismatch {
        /// Total the client believed it was paying.
        client: crate::types::Money,
        /// Total recomputed from the snapshot.
        computed: crate::types::Money,
    },

    /// Arithmetic across two different currencies.
    #[error("currency mismatch: {left} vs {right}")]
    CurrencyMismatch {
        /// Currency of the left operand.
        left: Currency,
        /// Currency of the right operand.
        right: Currency,
    },

    /// Monetary arithmetic overflowed `u64` minor units.
    #[error("monetary amount overflow")]
    AmountOverflow,

    /// The movie is not in the catalog or not currently for sale.
    #[error("movie {movie} is not available for purchase")]
    MovieUnavailable {
        /// The unavailable movie.
        movie: crate::types::MovieId,
    },

    /// The referenced order does not exist.
    #[error("order {order} not found")]
    OrderNotFound {
        /// The missing order.
        order: OrderId,
    },

    // ---- Conflict ---------------------------------------------------------
    /// Optimistic-concurrency retries exhausted for this order.
    #[error("order {order} was concurrently modified; retries exhausted")]
    ConcurrentModification {
        /// The contended order.
        order: OrderId,
    },

    /// `mark_paid` referenced an intent that is not settled or belongs to a
    /// different order.
    #[error("intent {intent} does not settle order {order}")]
    IntentMismatch {
        /// The order being marked paid.
        order: OrderId,
        /// The referenced intent.
        intent: PaymentIntentId,
    },

    /// Cancellation requested while a payment attempt is authorized or
    /// settled; the caller must wait for reconciliation.
    #[error("order {order} has a payment in flight; cancellation rejected")]
    PaymentInFlight {
        /// The order with an active attempt.
        order: OrderId,
    },

    /// Mutation attempted on an order already in a terminal status.
    #[error("order {order} is closed ({status})")]
    OrderClosed {
        /// The closed order.
        order: OrderId,
        /// Its terminal status, for the log line.
        status: crate::order::OrderStatus,
    },

    // ---- Integrity --------------------------------------------------------
    /// A gateway notification contradicts recorded settlement state
    /// (e.g. FAILED after SETTLED, or SETTLED after expiry).
    #[error("settlement conflict on order {order}: {detail}")]
    SettlementConflict {
        /// The affected order.
        order: OrderId,
        /// Human-readable description for the operator.
        detail: String,
    },

    /// Inbound notification failed signature verification.
    #[error("callback signature verification failed")]
    UntrustedCallback,

    /// Notification referenced a gateway transaction we never created.
    /// Logged, not fatal: the gateway may be replaying an old or foreign
    /// event.
    #[error("unknown gateway reference {reference}")]
    UnknownReference {
        /// The unmatched reference.
        reference: GatewayRef,
    },

    // ---- Transient --------------------------------------------------------
    /// Outbound gateway call exceeded its timeout. The intent stays
    /// `Created` and is picked up by the next sweep.
    #[error("gateway call timed out")]
    GatewayTimeout,

    /// Gateway rejected or dropped the call for a retryable reason.
    #[error("gateway unavailable: {detail}")]
    GatewayUnavailable {
        /// Gateway-provided detail.
        detail: String,
    },

    /// The order store could not be reached.
    #[error("order store unavailable: {detail}")]
    StoreUnavailable {
        /// Store-provided detail.
        detail: String,
    },
}

impl CheckoutError {
    /// The propagation class of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyCart
            | Self::InvalidQuantity { .. }
            | Self::AlreadyInCart { .. }
            | Self::AlreadyOwned { .. }
            | Self::PriceMismatch { .. }
            | Self::CurrencyMismatch { .. }
            | Self::AmountOverflow
            | Self::MovieUnavailable { .. }
            | Self::OrderNotFound { .. } => ErrorKind::Validation,

            Self::ConcurrentModification { .. }
            | Self::IntentMismatch { .. }
            | Self::PaymentInFlight { .. }
            | Self::OrderClosed { .. } => ErrorKind::Conflict,

            Self::SettlementConflict { .. }
            | Self::UntrustedCallback
            | Self::UnknownReference { .. } => ErrorKind::Integrity,

            Self::GatewayTimeout
            | Self::GatewayUnavailable { .. }
            | Self::StoreUnavailable { .. } => ErrorKind::Transient,
        }
    }

    /// Whether the sweep/dispatcher should retry after this error.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::MovieId;

    #[test]
    fn kinds_match_the_taxonomy() {
        assert_eq!(CheckoutError::EmptyCart.kind(), ErrorKind::Validation);
        assert_eq!(
            CheckoutError::AlreadyInCart {
                movie: MovieId::new()
            }
            .kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            CheckoutError::PaymentInFlight {
                order: OrderId::new()
            }
            .kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            CheckoutError::UntrustedCallback.kind(),
            ErrorKind::Integrity
        );
        assert_eq!(CheckoutError::GatewayTimeout.kind(), ErrorKind::Transient);
        assert!(CheckoutError::GatewayTimeout.is_transient());
        assert!(!CheckoutError::UntrustedCallback.is_transient());
    }
}
