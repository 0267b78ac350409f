//! Shared wiring for integration tests: the service and reconciler built
//! over deterministic collaborators.

#![allow(dead_code, clippy::unwrap_used)]

use chrono::{TimeZone, Utc};
use cinema_core::{CheckoutError, Currency, GatewayRef, Money, MovieId, Notification, UserId};
use cinema_runtime::config::{CheckoutConfig, GatewayConfig};
use cinema_runtime::reconciler::{Reconciler, WebhookVerifier};
use cinema_runtime::service::CheckoutService;
use cinema_runtime::store::InMemoryOrderStore;
use cinema_testing::{CaptureDispatcher, CapturePublisher, MockClock, ScriptedGateway, StaticCatalog};
use std::sync::Arc;

pub struct Harness {
    pub service: CheckoutService,
    pub reconciler: Reconciler,
    pub store: Arc<InMemoryOrderStore>,
    pub gateway: Arc<ScriptedGateway>,
    pub catalog: Arc<StaticCatalog>,
    pub dispatcher: Arc<CaptureDispatcher>,
    pub publisher: Arc<CapturePublisher>,
    pub clock: Arc<MockClock>,
    pub verifier: WebhookVerifier,
}

impl Harness {
    pub fn new() -> Self {
        let config = CheckoutConfig {
            order_ttl: 24 * 60 * 60,
            sweep_interval: 60,
            reconcile_grace: 5 * 60,
            max_version_retries: 3,
        };
        let gateway_config = GatewayConfig {
            webhook_secret: "test-secret".to_string(),
            call_timeout: 1,
        };
        let store = Arc::new(InMemoryOrderStore::new());
        let gateway = Arc::new(ScriptedGateway::new());
        let catalog = Arc::new(StaticCatalog::new());
        let dispatcher = Arc::new(CaptureDispatcher::new());
        let publisher = Arc::new(CapturePublisher::new());
        let clock = Arc::new(MockClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap(),
        ));
        let verifier = WebhookVerifier::new(gateway_config.webhook_secret.clone());

        let service = CheckoutService::new(
            store.clone(),
            gateway.clone(),
            catalog.clone(),
            dispatcher.clone(),
            publisher.clone(),
            clock.clone(),
            config.clone(),
            gateway_config,
        );
        let reconciler = Reconciler::new(
            store.clone(),
            gateway.clone(),
            publisher.clone(),
            clock.clone(),
            verifier.clone(),
            config,
        );
        Self {
            service,
            reconciler,
            store,
            gateway,
            catalog,
            dispatcher,
            publisher,
            clock,
            verifier,
        }
    }

    pub fn usd(minor: u64) -> Money {
        Money::from_minor_units(minor, Currency::Usd)
    }

    /// Lists a movie at `price` minor units and puts it in the user's cart.
    pub async fn add_movie(&self, user: UserId, price: u64) -> MovieId {
        let movie = MovieId::new();
        self.catalog.set_price(movie, Self::usd(price)).await;
        self.service.add_to_cart(user, movie).await.unwrap();
        movie
    }

    /// A correctly signed gateway notification.
    pub fn notification(&self, reference: &GatewayRef, raw_status: &str) -> Notification {
        let payload = format!(r#"{{"reference":"{reference}","status":"{raw_status}"}}"#);
        Notification {
            reference: reference.clone(),
            raw_status: raw_status.to_string(),
            signature: self.verifier.sign(&payload),
            payload,
        }
    }

    /// Checks out the user's cart and starts payment, returning the order
    /// id and its gateway reference.
    pub async fn paid_up_to_gateway(
        &self,
        user: UserId,
    ) -> Result<(cinema_core::OrderId, GatewayRef), CheckoutError> {
        let order = self.service.checkout(user, None).await?;
        let order = self.service.pay(order.id()).await?;
        let reference = order
            .active_intent()
            .and_then(|intent| intent.gateway_reference.clone())
            .ok_or(CheckoutError::OrderNotFound { order: order.id() })?;
        Ok((order.id(), reference))
    }
}
