//! In-memory order store used by tests and the demo binary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cinema_core::{CheckoutError, GatewayRef, Order, OrderId, OrderStatus, OrderStore, UserId};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Hash-map order store with the same version compare-and-swap semantics as
/// the Postgres store.
#[derive(Debug, Default)]
pub struct InMemoryOrderStore {
    orders: RwLock<HashMap<OrderId, Order>>,
}

impl InMemoryOrderStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn insert(&self, order: &Order) -> Result<(), CheckoutError> {
        let mut orders = self.orders.write().await;
        orders.insert(order.id(), order.clone());
        Ok(())
    }

    async fn load(&self, id: OrderId) -> Result<Option<Order>, CheckoutError> {
        let orders = self.orders.read().await;
        Ok(orders.get(&id).cloned())
    }

    async fn update(&self, order: &Order, expected_version: u64) -> Result<u64, CheckoutError> {
        let mut orders = self.orders.write().await;
        let current = orders
            .get(&order.id())
            .ok_or(CheckoutError::OrderNotFound { order: order.id() })?;
        if current.version() != expected_version {
            return Err(CheckoutError::ConcurrentModification { order: order.id() });
        }
        // Gateway references are globally unique, matching the reference
        // side table of the Postgres store.
        for intent in order.intents() {
            if let Some(reference) = &intent.gateway_reference {
                let claimed = orders.values().any(|other| {
                    other.id() != order.id() && other.intent_by_reference(reference).is_some()
                });
                if claimed {
                    return Err(CheckoutError::SettlementConflict {
                        order: order.id(),
                        detail: format!(
                            "gateway reference {reference} is already recorded for another order"
                        ),
                    });
                }
            }
        }
        let mut updated = order.clone();
        updated.set_version(expected_version + 1);
        let new_version = updated.version();
        orders.insert(order.id(), updated);
        Ok(new_version)
    }

    async fn find_by_gateway_reference(
        &self,
        reference: &GatewayRef,
    ) -> Result<Option<Order>, CheckoutError> {
        let orders = self.orders.read().await;
        Ok(orders
            .values()
            .find(|order| order.intent_by_reference(reference).is_some())
            .cloned())
    }

    async fn find_by_user(&self, user: UserId) -> Result<Vec<Order>, CheckoutError> {
        let orders = self.orders.read().await;
        let mut found: Vec<Order> = orders
            .values()
            .filter(|order| order.user_id() == user)
            .cloned()
            .collect();
        found.sort_by_key(|order| std::cmp::Reverse(order.created_at()));
        Ok(found)
    }

    async fn pending_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Order>, CheckoutError> {
        let orders = self.orders.read().await;
        Ok(orders
            .values()
            .filter(|order| {
                order.status() == OrderStatus::PendingPayment && order.created_at() < cutoff
            })
            .cloned()
            .collect())
    }

    async fn stale_intent_references(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(OrderId, GatewayRef)>, CheckoutError> {
        let orders = self.orders.read().await;
        let mut stale = Vec::new();
        for order in orders.values() {
            for intent in order.intents() {
                if intent.is_active() && intent.created_at < cutoff {
                    if let Some(reference) = &intent.gateway_reference {
                        stale.push((order.id(), reference.clone()));
                    }
                }
            }
        }
        Ok(stale)
    }
}
