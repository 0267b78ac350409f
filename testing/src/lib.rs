//! Deterministic collaborator implementations for tests.
//!
//! Everything here is programmable and inspectable: the clock advances on
//! demand, the gateway replays scripted verdicts and records every call,
//! and the dispatcher/publisher capture what production code would send
//! onward. No test in the workspace sleeps or talks to a real service.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use cinema_core::{
    Catalog, CheckoutError, Clock, DomainEvent, EventPublisher, GatewayRef,
    GatewayTransactionStatus, Money, MovieId, OperatorAlert, PaymentGateway, ReconciliationTask,
    TaskDispatcher, TransactionMetadata, UserId,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use tokio::sync::Mutex;

// ============================================================================
// Clock
// ============================================================================

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct MockClock {
    millis: AtomicI64,
}

impl MockClock {
    /// Creates a clock frozen at `start`.
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(start.timestamp_millis()),
        }
    }

    /// Advances the clock.
    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst)).unwrap_or_default()
    }
}

// ============================================================================
// Payment gateway
// ============================================================================

/// One recorded outbound `create_transaction` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateCall {
    /// The idempotency key presented.
    pub idempotency_key: String,
    /// The amount requested.
    pub amount: Money,
}

/// A programmable gateway.
///
/// Honors idempotency keys the way a well-behaved gateway does: repeated
/// creation with the same key returns the same reference. Query verdicts
/// are scripted per reference with [`set_status`](Self::set_status);
/// failures are injected with the `fail_next_*` methods.
#[derive(Debug, Default)]
pub struct ScriptedGateway {
    created: Mutex<HashMap<String, GatewayRef>>,
    statuses: Mutex<HashMap<String, GatewayTransactionStatus>>,
    create_failures: Mutex<VecDeque<CheckoutError>>,
    calls: Mutex<Vec<CreateCall>>,
    counter: AtomicU64,
    hang_creates: AtomicU64,
}

impl ScriptedGateway {
    /// Creates an empty gateway.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the verdict returned by `query_transaction` for a reference.
    pub async fn set_status(&self, reference: &GatewayRef, status: GatewayTransactionStatus) {
        let mut statuses = self.statuses.lock().await;
        statuses.insert(reference.as_str().to_string(), status);
    }

    /// Fails the next `create_transaction` call with `err`.
    pub async fn fail_next_create(&self, err: CheckoutError) {
        let mut failures = self.create_failures.lock().await;
        failures.push_back(err);
    }

    /// Makes the next `n` `create_transaction` calls hang forever, for
    /// driving the caller's timeout path.
    pub fn hang_next_creates(&self, n: u64) {
        self.hang_creates.store(n, Ordering::SeqCst);
    }

    /// Drops the idempotency record for a key, so the next creation with the
    /// same key mints a fresh reference. Models a gateway expiring its
    /// idempotency window.
    pub async fn forget_key(&self, idempotency_key: &str) {
        let mut created = self.created.lock().await;
        created.remove(idempotency_key);
    }

    /// Every `create_transaction` call recorded so far.
    pub async fn create_calls(&self) -> Vec<CreateCall> {
        self.calls.lock().await.clone()
    }

    /// The reference assigned for an idempotency key, if the call happened.
    pub async fn reference_for(&self, idempotency_key: &str) -> Option<GatewayRef> {
        let created = self.created.lock().await;
        created.get(idempotency_key).cloned()
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn create_transaction(
        &self,
        idempotency_key: &str,
        amount: Money,
        _metadata: &TransactionMetadata,
    ) -> Result<GatewayRef, CheckoutError> {
        if self
            .hang_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            std::future::pending::<()>().await;
        }
        {
            let mut calls = self.calls.lock().await;
            calls.push(CreateCall {
                idempotency_key: idempotency_key.to_string(),
                amount,
            });
        }
        if let Some(err) = self.create_failures.lock().await.pop_front() {
            return Err(err);
        }
        let mut created = self.created.lock().await;
        if let Some(existing) = created.get(idempotency_key) {
            return Ok(existing.clone());
        }
        let reference = GatewayRef::new(format!(
            "gw-{}",
            self.counter.fetch_add(1, Ordering::SeqCst) + 1
        ));
        created.insert(idempotency_key.to_string(), reference.clone());
        Ok(reference)
    }

    async fn query_transaction(
        &self,
        reference: &GatewayRef,
    ) -> Result<GatewayTransactionStatus, CheckoutError> {
        let statuses = self.statuses.lock().await;
        Ok(statuses
            .get(reference.as_str())
            .cloned()
            .unwrap_or(GatewayTransactionStatus::Created))
    }
}

// ============================================================================
// Task dispatcher
// ============================================================================

/// Captures scheduled tasks instead of executing them.
#[derive(Debug, Default)]
pub struct CaptureDispatcher {
    tasks: Mutex<Vec<ReconciliationTask>>,
}

impl CaptureDispatcher {
    /// Creates an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every task scheduled so far.
    pub async fn tasks(&self) -> Vec<ReconciliationTask> {
        self.tasks.lock().await.clone()
    }
}

#[async_trait]
impl TaskDispatcher for CaptureDispatcher {
    async fn schedule_at(&self, task: ReconciliationTask) -> Result<(), CheckoutError> {
        let mut tasks = self.tasks.lock().await;
        tasks.push(task);
        Ok(())
    }
}

// ============================================================================
// Event publisher
// ============================================================================

/// Captures published events and operator alerts.
#[derive(Debug, Default)]
pub struct CapturePublisher {
    events: Mutex<Vec<DomainEvent>>,
    alerts: Mutex<Vec<OperatorAlert>>,
}

impl CapturePublisher {
    /// Creates an empty publisher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every domain event published so far.
    pub async fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().await.clone()
    }

    /// Every operator alert delivered so far.
    pub async fn alerts(&self) -> Vec<OperatorAlert> {
        self.alerts.lock().await.clone()
    }
}

#[async_trait]
impl EventPublisher for CapturePublisher {
    async fn publish(&self, event: DomainEvent) -> Result<(), CheckoutError> {
        let mut events = self.events.lock().await;
        events.push(event);
        Ok(())
    }

    async fn alert(&self, alert: OperatorAlert) -> Result<(), CheckoutError> {
        let mut alerts = self.alerts.lock().await;
        alerts.push(alert);
        Ok(())
    }
}

// ============================================================================
// Catalog
// ============================================================================

/// A catalog with fixed prices and a mutable ownership set.
#[derive(Debug, Default)]
pub struct StaticCatalog {
    prices: Mutex<HashMap<MovieId, Money>>,
    owned: Mutex<HashSet<(UserId, MovieId)>>,
}

impl StaticCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets (or updates) a movie's price.
    pub async fn set_price(&self, movie: MovieId, price: Money) {
        let mut prices = self.prices.lock().await;
        prices.insert(movie, price);
    }

    /// Marks a movie as owned by a user.
    pub async fn grant(&self, user: UserId, movie: MovieId) {
        let mut owned = self.owned.lock().await;
        owned.insert((user, movie));
    }
}

#[async_trait]
impl Catalog for StaticCatalog {
    async fn current_price(&self, movie: MovieId) -> Result<Option<Money>, CheckoutError> {
        let prices = self.prices.lock().await;
        Ok(prices.get(&movie).copied())
    }

    async fn is_owned(&self, user: UserId, movie: MovieId) -> Result<bool, CheckoutError> {
        let owned = self.owned.lock().await;
        Ok(owned.contains(&(user, movie)))
    }
}
