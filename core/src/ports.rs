//! Collaborator ports: traits the runtime injects into the settlement
//! pipeline.
//!
//! Everything the core touches outside its own state lives behind one of
//! these traits — catalog, payment gateway, task dispatcher, event
//! publisher, order store, and the clock. Tests swap in deterministic
//! implementations; production wires real ones.

use crate::error::CheckoutError;
use crate::events::{DomainEvent, OperatorAlert};
use crate::order::Order;
use crate::payment::IntentStatus;
use crate::types::{GatewayRef, Money, MovieId, OrderId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Clock
// ============================================================================

/// Abstracts time so TTL expiry and sweeps are testable by advancing a mock
/// clock instead of sleeping.
pub trait Clock: Send + Sync {
    /// The current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// ============================================================================
// Catalog / auth collaborator
// ============================================================================

/// Read-only view of the movie catalog and purchase history, owned by the
/// catalog subsystem. The core only consumes it.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Current catalog price for a movie, if it is purchasable.
    ///
    /// # Errors
    ///
    /// Transient store errors only; `Ok(None)` means the movie is not
    /// currently for sale.
    async fn current_price(&self, movie: MovieId) -> Result<Option<Money>, CheckoutError>;

    /// Whether the user already owns the movie through a completed order.
    ///
    /// # Errors
    ///
    /// Transient store errors only.
    async fn is_owned(&self, user: UserId, movie: MovieId) -> Result<bool, CheckoutError>;
}

// ============================================================================
// Payment gateway collaborator
// ============================================================================

/// Transaction status as reported by the gateway.
///
/// A tagged variant over the known statuses with an explicit
/// [`Unrecognized`](Self::Unrecognized) fallback — payload shapes outside
/// the known set are surfaced, never silently coerced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayTransactionStatus {
    /// Transaction exists but has not been authorized yet.
    Created,
    /// Charge authorized; settlement pending.
    Authorized,
    /// Payment confirmed final.
    Settled,
    /// Charge rejected or failed.
    Failed,
    /// Transaction expired gateway-side.
    Expired,
    /// Anything else the gateway said, preserved verbatim.
    Unrecognized(String),
}

impl GatewayTransactionStatus {
    /// Parses a raw gateway status string.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw {
            "created" => Self::Created,
            "authorized" => Self::Authorized,
            "settled" => Self::Settled,
            "failed" => Self::Failed,
            "expired" => Self::Expired,
            other => Self::Unrecognized(other.to_string()),
        }
    }

    /// Maps to the domain intent status; `None` for
    /// [`Unrecognized`](Self::Unrecognized).
    #[must_use]
    pub fn as_intent_status(&self) -> Option<IntentStatus> {
        match self {
            Self::Created => Some(IntentStatus::Created),
            Self::Authorized => Some(IntentStatus::Authorized),
            Self::Settled => Some(IntentStatus::Settled),
            Self::Failed => Some(IntentStatus::Failed),
            Self::Expired => Some(IntentStatus::Expired),
            Self::Unrecognized(_) => None,
        }
    }
}

/// Metadata attached to an outbound gateway transaction, echoed back in the
/// gateway's dashboard and notifications.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransactionMetadata {
    /// The order being charged.
    pub order_id: OrderId,
    /// The paying user.
    pub user_id: UserId,
    /// Human-readable line, e.g. the purchased titles.
    pub description: String,
}

/// The external payment processor, reached through a request/callback
/// contract. Gateway internals (tokenization, fraud scoring) are out of
/// scope; this is the whole surface the core sees.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Creates (or re-fetches, when the idempotency key repeats) a gateway
    /// transaction for `amount`.
    ///
    /// # Errors
    ///
    /// [`CheckoutError::GatewayTimeout`] or
    /// [`CheckoutError::GatewayUnavailable`]; timeouts leave the intent
    /// `Created` for the sweep rather than assuming failure.
    async fn create_transaction(
        &self,
        idempotency_key: &str,
        amount: Money,
        metadata: &TransactionMetadata,
    ) -> Result<GatewayRef, CheckoutError>;

    /// Queries the authoritative status of an existing transaction.
    ///
    /// # Errors
    ///
    /// Transient gateway errors; the sweep retries on its next pass.
    async fn query_transaction(
        &self,
        reference: &GatewayRef,
    ) -> Result<GatewayTransactionStatus, CheckoutError>;
}

/// An inbound gateway notification, exactly as delivered. Nothing in it is
/// trusted until the signature verifies against the shared secret.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Notification {
    /// The gateway transaction this notification is about.
    pub reference: GatewayRef,
    /// Raw status string from the payload.
    pub raw_status: String,
    /// Sender-computed signature over `payload`.
    pub signature: String,
    /// The raw payload bytes the signature covers.
    pub payload: String,
}

// ============================================================================
// Background task dispatcher collaborator
// ============================================================================

/// What a scheduled task should do when it fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    /// Run a reconciliation sweep over stale intents and overdue orders.
    Sweep,
    /// Re-query the gateway for one order's active intent.
    ReconcileOrder,
}

/// Ephemeral scheduling record handed to the dispatcher. Not state of
/// record: duplicate consumption is safe because every handler routes
/// through the idempotent callback/expiry paths.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationTask {
    /// What to do.
    pub kind: TaskKind,
    /// The order concerned, if the task targets one.
    pub order_id: Option<OrderId>,
    /// Earliest time the dispatcher may fire the task.
    pub due_at: DateTime<Utc>,
}

/// External at-least-once task execution facility (a queue, a cron, a timer
/// wheel — the core does not care which).
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    /// Schedules `task` to run at or after `task.due_at`. The handler may be
    /// invoked more than once.
    ///
    /// # Errors
    ///
    /// Transient dispatch errors; the caller retries or relies on the next
    /// periodic sweep.
    async fn schedule_at(&self, task: ReconciliationTask) -> Result<(), CheckoutError>;
}

// ============================================================================
// Domain event publisher
// ============================================================================

/// Sink for domain events (consumed by email/licence-grant collaborators)
/// and operator alerts (integrity findings, never shown to end users).
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publishes a domain event.
    ///
    /// # Errors
    ///
    /// Transient transport errors.
    async fn publish(&self, event: DomainEvent) -> Result<(), CheckoutError>;

    /// Routes an integrity finding to the operator channel.
    ///
    /// # Errors
    ///
    /// Transient transport errors.
    async fn alert(&self, alert: OperatorAlert) -> Result<(), CheckoutError>;
}

// ============================================================================
// Order store
// ============================================================================

/// Durable store for orders and their payment intents — the single shared
/// mutable resource of the pipeline.
///
/// All access follows the per-order optimistic-concurrency discipline:
/// [`update`](Self::update) compares the caller's expected version against
/// the stored one and rejects stale writes, serializing mutations per order
/// while different orders proceed fully in parallel.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Persists a newly created order.
    ///
    /// # Errors
    ///
    /// [`CheckoutError::StoreUnavailable`] on infrastructure failure.
    async fn insert(&self, order: &Order) -> Result<(), CheckoutError>;

    /// Loads an order by id.
    ///
    /// # Errors
    ///
    /// [`CheckoutError::StoreUnavailable`] on infrastructure failure.
    async fn load(&self, id: OrderId) -> Result<Option<Order>, CheckoutError>;

    /// Writes back a mutated order if the stored version still equals
    /// `expected_version`; the stored version becomes
    /// `expected_version + 1`.
    ///
    /// # Errors
    ///
    /// [`CheckoutError::ConcurrentModification`] when the version check
    /// fails (the caller re-reads and retries up to its bound);
    /// [`CheckoutError::StoreUnavailable`] on infrastructure failure.
    async fn update(&self, order: &Order, expected_version: u64) -> Result<u64, CheckoutError>;

    /// Finds the order holding a gateway reference, if any.
    ///
    /// # Errors
    ///
    /// [`CheckoutError::StoreUnavailable`] on infrastructure failure.
    async fn find_by_gateway_reference(
        &self,
        reference: &GatewayRef,
    ) -> Result<Option<Order>, CheckoutError>;

    /// All orders belonging to a user, newest first.
    ///
    /// # Errors
    ///
    /// [`CheckoutError::StoreUnavailable`] on infrastructure failure.
    async fn find_by_user(&self, user: UserId) -> Result<Vec<Order>, CheckoutError>;

    /// Pending orders created before `cutoff` — the sweep's TTL-expiry
    /// candidates.
    ///
    /// # Errors
    ///
    /// [`CheckoutError::StoreUnavailable`] on infrastructure failure.
    async fn pending_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Order>, CheckoutError>;

    /// Orders holding an active (created/authorized) intent with a gateway
    /// reference created before `cutoff` — the sweep's lost-webhook
    /// candidates.
    ///
    /// # Errors
    ///
    /// [`CheckoutError::StoreUnavailable`] on infrastructure failure.
    async fn stale_intent_references(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(OrderId, GatewayRef)>, CheckoutError>;
}
