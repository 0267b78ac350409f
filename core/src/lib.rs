//! Cinema Checkout Core - order-to-payment settlement domain.
//!
//! This crate contains the pure domain model for an online cinema's checkout
//! pipeline. It has no I/O: every external collaborator (catalog, payment
//! gateway, task dispatcher, order store, clock) is a trait in [`ports`],
//! injected by the runtime crate.
//!
//! # Pipeline
//!
//! ```text
//! Cart ──(checkout)──> Order [PendingPayment]
//!                        │
//!                        ├─ begin_attempt ──> PaymentIntent [Created]
//!                        │                        │ gateway create_transaction
//!                        │                        ▼
//!                        │                    [Authorized]
//!                        │   webhook / sweep ──> record_callback
//!                        │                        │
//!                        ▼                        ▼
//!                 [Paid | Cancelled | Expired] <─ [Settled | Failed | Expired]
//! ```
//!
//! # Design rules
//!
//! - Money is integer minor units plus a currency code; arithmetic is
//!   checked and cross-currency operations are errors.
//! - The order aggregate owns its payment intents, so "intent settled" and
//!   "order paid" change under a single version check and can never be
//!   observed apart.
//! - Every externally-triggered mutation (gateway callback, sweep re-check)
//!   is idempotent: duplicates are absorbed as no-ops, contradictions are
//!   escalated as [`error::CheckoutError::SettlementConflict`] instead of
//!   being auto-resolved.

pub mod cart;
pub mod error;
pub mod events;
pub mod order;
pub mod payment;
pub mod ports;
pub mod types;

pub use cart::{Cart, CartSnapshot, PriceChanged};
pub use error::{CheckoutError, ErrorKind};
pub use events::{DomainEvent, OperatorAlert};
pub use order::{Order, OrderStatus, StatusTransition, TriggeredBy};
pub use payment::{idempotency_key, CallbackOutcome, IntentStatus, PaymentIntent};
pub use ports::{
    Catalog, Clock, EventPublisher, GatewayTransactionStatus, Notification, OrderStore,
    PaymentGateway, ReconciliationTask, SystemClock, TaskDispatcher, TaskKind,
    TransactionMetadata,
};
pub use types::{CartItem, Currency, GatewayRef, Money, MovieId, OrderId, PaymentIntentId, UserId};
