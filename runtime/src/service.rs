//! Checkout service: the imperative shell around the order aggregate.
//!
//! Owns the per-user session carts and drives the order lifecycle through
//! the injected collaborators. Every order mutation goes through one
//! load-mutate-update loop with bounded retries on version conflicts, so
//! concurrent writers serialize per order without locks.

use chrono::{DateTime, Utc};
use cinema_core::{
    Cart, CartSnapshot, Catalog, CheckoutError, Clock, DomainEvent, EventPublisher, Money, MovieId,
    OperatorAlert, Order, OrderId, OrderStatus, OrderStore, PaymentGateway, PriceChanged,
    ReconciliationTask, TaskDispatcher, TaskKind, TransactionMetadata, TriggeredBy, UserId,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::config::{CheckoutConfig, GatewayConfig};
use crate::metrics;
use crate::retry::{RetryPolicy, is_version_conflict, retry_if};

/// Order-to-payment checkout service.
pub struct CheckoutService {
    store: Arc<dyn OrderStore>,
    gateway: Arc<dyn PaymentGateway>,
    catalog: Arc<dyn Catalog>,
    dispatcher: Arc<dyn TaskDispatcher>,
    publisher: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
    config: CheckoutConfig,
    gateway_config: GatewayConfig,
    carts: RwLock<HashMap<UserId, Cart>>,
}

impl CheckoutService {
    /// Wires the service with its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn OrderStore>,
        gateway: Arc<dyn PaymentGateway>,
        catalog: Arc<dyn Catalog>,
        dispatcher: Arc<dyn TaskDispatcher>,
        publisher: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
        config: CheckoutConfig,
        gateway_config: GatewayConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            catalog,
            dispatcher,
            publisher,
            clock,
            config,
            gateway_config,
            carts: RwLock::new(HashMap::new()),
        }
    }

    // ---- cart -----------------------------------------------------------

    /// Adds a movie to the user's cart at its current catalog price.
    ///
    /// # Errors
    ///
    /// [`CheckoutError::AlreadyOwned`] if a paid order already grants the
    /// movie, [`CheckoutError::MovieUnavailable`] if it is not for sale,
    /// [`CheckoutError::AlreadyInCart`] on a duplicate line.
    pub async fn add_to_cart(
        &self,
        user: UserId,
        movie: MovieId,
    ) -> Result<(), CheckoutError> {
        if self.catalog.is_owned(user, movie).await? {
            return Err(CheckoutError::AlreadyOwned { movie, user });
        }
        let price = self
            .catalog
            .current_price(movie)
            .await?
            .ok_or(CheckoutError::MovieUnavailable { movie })?;
        let mut carts = self.carts.write().await;
        carts
            .entry(user)
            .or_insert_with(|| Cart::new(user))
            .add_item(movie, price, 1)
    }

    /// Removes a movie from the user's cart. Returns `true` if a line was
    /// removed.
    pub async fn remove_from_cart(&self, user: UserId, movie: MovieId) -> bool {
        let mut carts = self.carts.write().await;
        carts
            .get_mut(&user)
            .is_some_and(|cart| cart.remove_item(movie))
    }

    /// The user's cart priced against the current catalog, with any drift
    /// since add time reported for re-confirmation.
    ///
    /// # Errors
    ///
    /// Transient catalog errors.
    pub async fn view_cart(
        &self,
        user: UserId,
    ) -> Result<(CartSnapshot, Vec<PriceChanged>), CheckoutError> {
        let cart = {
            let carts = self.carts.read().await;
            carts.get(&user).cloned().unwrap_or_else(|| Cart::new(user))
        };
        let prices = self.refresh_prices(&cart).await?;
        Ok(cart.snapshot(|movie| prices.get(&movie).copied()))
    }

    async fn refresh_prices(
        &self,
        cart: &Cart,
    ) -> Result<HashMap<MovieId, Money>, CheckoutError> {
        let mut prices = HashMap::new();
        for item in cart.items() {
            if let Some(price) = self.catalog.current_price(item.movie_id).await? {
                prices.insert(item.movie_id, price);
            }
        }
        Ok(prices)
    }

    // ---- checkout -------------------------------------------------------

    /// Converts the user's cart into a pending order.
    ///
    /// The snapshot is repriced against the catalog and ownership is
    /// re-checked, so a purchase completed in another session since add
    /// time is caught here. The cart is cleared only after the order is
    /// durably inserted.
    ///
    /// # Errors
    ///
    /// [`CheckoutError::EmptyCart`], [`CheckoutError::AlreadyOwned`],
    /// [`CheckoutError::PriceMismatch`] when `client_total` disagrees with
    /// the repriced total, or a transient store error (the cart survives).
    pub async fn checkout(
        &self,
        user: UserId,
        client_total: Option<Money>,
    ) -> Result<Order, CheckoutError> {
        let cart = {
            let carts = self.carts.read().await;
            carts.get(&user).cloned()
        }
        .ok_or(CheckoutError::EmptyCart)?;
        if cart.is_empty() {
            return Err(CheckoutError::EmptyCart);
        }
        for item in cart.items() {
            if self.catalog.is_owned(user, item.movie_id).await? {
                return Err(CheckoutError::AlreadyOwned {
                    movie: item.movie_id,
                    user,
                });
            }
        }

        let prices = self.refresh_prices(&cart).await?;
        let (snapshot, notices) = cart.snapshot(|movie| prices.get(&movie).copied());
        for notice in &notices {
            tracing::info!(
                movie_id = %notice.movie_id,
                previous = %notice.previous,
                current = %notice.current,
                "price changed since the movie was added to the cart"
            );
        }

        let now = self.clock.now();
        let order = Order::create(user, &snapshot, client_total, now)?;
        self.store.insert(&order).await?;
        metrics::record_order("created");
        tracing::info!(order_id = %order.id(), user_id = %user, total = %order.total(), "order created");

        // The periodic sweep also catches overdue orders; a failed schedule
        // is logged, not fatal.
        let task = ReconciliationTask {
            kind: TaskKind::ReconcileOrder,
            order_id: Some(order.id()),
            due_at: now + self.config.order_ttl(),
        };
        if let Err(err) = self.dispatcher.schedule_at(task).await {
            tracing::warn!(order_id = %order.id(), error = %err, "failed to schedule expiry check");
        }

        let mut carts = self.carts.write().await;
        carts.remove(&user);
        Ok(order)
    }

    // ---- payment --------------------------------------------------------

    /// Starts (or resumes) payment for a pending order.
    ///
    /// The attempt and its idempotency key are persisted before the gateway
    /// is called, so a crash or timeout mid-call can never lose track of a
    /// possibly-created transaction: the sweep finds the `Created` attempt
    /// and re-presents the same key. Returns the order with the gateway
    /// reference recorded.
    ///
    /// # Errors
    ///
    /// [`CheckoutError::OrderClosed`] for terminal orders,
    /// [`CheckoutError::GatewayTimeout`] when the gateway call expires
    /// (outcome unknown, resolved by the sweep), or transient
    /// gateway/store errors.
    pub async fn pay(&self, order_id: OrderId) -> Result<Order, CheckoutError> {
        let policy = RetryPolicy::with_max_retries(self.config.max_version_retries);

        // Phase 1: persist the attempt.
        let (order, intent_id, key, amount) = retry_if(
            &policy,
            || async move {
                let mut order = self.load(order_id).await?;
                let expected = order.version();
                let now = self.clock.now();
                let intent = order.begin_attempt(now)?;
                let (intent_id, key, amount) =
                    (intent.id, intent.idempotency_key.clone(), intent.amount);
                let new_version = self.store.update(&order, expected).await?;
                order.set_version(new_version);
                Ok((order, intent_id, key, amount))
            },
            is_version_conflict,
        )
        .await?;

        // Phase 2: call the gateway, bounded by the configured timeout.
        let metadata = TransactionMetadata {
            order_id,
            user_id: order.user_id(),
            description: format!("cinema order, {} movie(s)", order.items().len()),
        };
        let started = Instant::now();
        let call = self.gateway.create_transaction(&key, amount, &metadata);
        let reference = match tokio::time::timeout(self.gateway_config.call_timeout(), call).await
        {
            Ok(Ok(reference)) => reference,
            Ok(Err(err)) => {
                tracing::warn!(order_id = %order_id, error = %err, "gateway rejected the call");
                self.schedule_reconcile(order_id).await;
                return Err(err);
            }
            Err(_) => {
                // Outcome unknown: the transaction may exist gateway-side.
                // The attempt stays Created; the sweep re-presents its key
                // to recover the reference.
                tracing::warn!(order_id = %order_id, "gateway call timed out");
                self.schedule_reconcile(order_id).await;
                return Err(CheckoutError::GatewayTimeout);
            }
        };
        metrics::record_gateway_call("create_transaction", started.elapsed());

        // Phase 3: record the reference.
        let recorded = self
            .mutate(order_id, |order, _now| {
                order
                    .record_gateway_reference(intent_id, reference.clone())
                    .map(|()| vec![])
            })
            .await;
        match recorded {
            Err(CheckoutError::SettlementConflict { order, detail }) => {
                // The gateway returned a second reference for the same key.
                // An integrity finding goes to the operator channel, never
                // to the caller, who sees the order still pending under its
                // original reference.
                metrics::record_settlement_conflict();
                tracing::error!(order_id = %order, detail = %detail, "gateway returned a conflicting reference");
                let alert = OperatorAlert::SettlementConflict {
                    order_id: order,
                    detail,
                };
                if let Err(err) = self.publisher.alert(alert).await {
                    tracing::error!(order_id = %order_id, error = %err, "failed to deliver operator alert");
                }
                self.load(order_id).await
            }
            other => other,
        }
    }

    /// Cancels a pending order at the user's request.
    ///
    /// # Errors
    ///
    /// [`CheckoutError::PaymentInFlight`] while an attempt is authorized or
    /// settled, [`CheckoutError::OrderClosed`] for terminal orders.
    pub async fn cancel(&self, order_id: OrderId, reason: &str) -> Result<Order, CheckoutError> {
        let order = self
            .mutate(order_id, |order, now| {
                order.cancel(reason, TriggeredBy::User, now)
            })
            .await?;
        metrics::record_order("cancelled");
        Ok(order)
    }

    // ---- queries --------------------------------------------------------

    /// Loads one order.
    ///
    /// # Errors
    ///
    /// [`CheckoutError::OrderNotFound`] or a transient store error.
    pub async fn order(&self, order_id: OrderId) -> Result<Order, CheckoutError> {
        self.load(order_id).await
    }

    /// The user's orders, newest first.
    ///
    /// # Errors
    ///
    /// Transient store errors.
    pub async fn orders_for_user(
        &self,
        user: UserId,
    ) -> Result<Vec<Order>, CheckoutError> {
        self.store.find_by_user(user).await
    }

    /// Movies the user owns through paid orders.
    ///
    /// # Errors
    ///
    /// Transient store errors.
    pub async fn purchased_movies(
        &self,
        user: UserId,
    ) -> Result<Vec<MovieId>, CheckoutError> {
        let orders = self.store.find_by_user(user).await?;
        let mut movies: Vec<MovieId> = orders
            .iter()
            .filter(|order| order.status() == OrderStatus::Paid)
            .flat_map(|order| order.items().iter().map(|item| item.movie_id))
            .collect();
        movies.sort_unstable_by_key(|movie| *movie.as_uuid());
        movies.dedup();
        Ok(movies)
    }

    // ---- internals ------------------------------------------------------

    async fn load(&self, order_id: OrderId) -> Result<Order, CheckoutError> {
        self.store
            .load(order_id)
            .await?
            .ok_or(CheckoutError::OrderNotFound { order: order_id })
    }

    /// Load-mutate-update loop with bounded retries on version conflicts.
    /// Events returned by the mutation are published after the write lands.
    async fn mutate<F>(&self, order_id: OrderId, apply: F) -> Result<Order, CheckoutError>
    where
        F: Fn(&mut Order, DateTime<Utc>) -> Result<Vec<DomainEvent>, CheckoutError> + Sync,
    {
        let policy = RetryPolicy::with_max_retries(self.config.max_version_retries);
        let apply = &apply;
        let (order, events) = retry_if(
            &policy,
            || async move {
                let mut order = self.load(order_id).await?;
                let expected = order.version();
                let events = apply(&mut order, self.clock.now())?;
                let new_version = self.store.update(&order, expected).await?;
                order.set_version(new_version);
                Ok((order, events))
            },
            is_version_conflict,
        )
        .await?;
        for event in events {
            if let DomainEvent::OrderPaid { items, .. } = &event {
                metrics::record_order("paid");
                metrics::record_revenue(
                    items
                        .iter()
                        .fold(0u64, |acc, item| {
                            acc.saturating_add(item.unit_price.minor_units())
                        }),
                );
            }
            if let Err(err) = self.publisher.publish(event).await {
                tracing::error!(order_id = %order_id, error = %err, "failed to publish domain event");
            }
        }
        Ok(order)
    }

    async fn schedule_reconcile(&self, order_id: OrderId) {
        let task = ReconciliationTask {
            kind: TaskKind::ReconcileOrder,
            order_id: Some(order_id),
            due_at: self.clock.now() + self.config.reconcile_grace(),
        };
        if let Err(err) = self.dispatcher.schedule_at(task).await {
            tracing::warn!(order_id = %order_id, error = %err, "failed to schedule reconcile task");
        }
    }
}
