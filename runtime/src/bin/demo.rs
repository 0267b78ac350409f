//! End-to-end demo of the checkout pipeline against in-process
//! collaborators: add to cart, checkout, pay, settle via a signed webhook,
//! then run one reconciliation sweep.

use async_trait::async_trait;
use cinema_core::{
    Catalog, CheckoutError, Currency, DomainEvent, EventPublisher, GatewayRef,
    GatewayTransactionStatus, Money, MovieId, Notification, OperatorAlert, PaymentGateway,
    ReconciliationTask, SystemClock, TaskDispatcher, TransactionMetadata, UserId,
};
use cinema_runtime::reconciler::{Reconciler, WebhookVerifier};
use cinema_runtime::service::CheckoutService;
use cinema_runtime::store::InMemoryOrderStore;
use cinema_runtime::{Config, metrics};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

/// Fixed-price catalog; nothing is owned up front.
struct DemoCatalog {
    prices: HashMap<MovieId, Money>,
}

#[async_trait]
impl Catalog for DemoCatalog {
    async fn current_price(&self, movie: MovieId) -> Result<Option<Money>, CheckoutError> {
        Ok(self.prices.get(&movie).copied())
    }

    async fn is_owned(&self, _user: UserId, _movie: MovieId) -> Result<bool, CheckoutError> {
        Ok(false)
    }
}

/// Gateway that assigns references locally and settles everything it is
/// asked about.
#[derive(Default)]
struct DemoGateway {
    counter: AtomicU64,
    created: Mutex<HashMap<String, GatewayRef>>,
}

#[async_trait]
impl PaymentGateway for DemoGateway {
    async fn create_transaction(
        &self,
        idempotency_key: &str,
        amount: Money,
        metadata: &TransactionMetadata,
    ) -> Result<GatewayRef, CheckoutError> {
        let mut created = self.created.lock().await;
        if let Some(existing) = created.get(idempotency_key) {
            return Ok(existing.clone());
        }
        let reference = GatewayRef::new(format!(
            "demo-txn-{}",
            self.counter.fetch_add(1, Ordering::SeqCst) + 1
        ));
        tracing::info!(
            reference = %reference,
            amount = %amount,
            order_id = %metadata.order_id,
            "gateway transaction created"
        );
        created.insert(idempotency_key.to_string(), reference.clone());
        Ok(reference)
    }

    async fn query_transaction(
        &self,
        _reference: &GatewayRef,
    ) -> Result<GatewayTransactionStatus, CheckoutError> {
        Ok(GatewayTransactionStatus::Settled)
    }
}

/// Logs instead of dispatching; the demo drives the sweep directly.
struct LogDispatcher;

#[async_trait]
impl TaskDispatcher for LogDispatcher {
    async fn schedule_at(&self, task: ReconciliationTask) -> Result<(), CheckoutError> {
        tracing::debug!(?task, "task scheduled");
        Ok(())
    }
}

/// Logs events and alerts.
struct LogPublisher;

#[async_trait]
impl EventPublisher for LogPublisher {
    async fn publish(&self, event: DomainEvent) -> Result<(), CheckoutError> {
        tracing::info!(order_id = %event.order_id(), ?event, "domain event published");
        Ok(())
    }

    async fn alert(&self, alert: OperatorAlert) -> Result<(), CheckoutError> {
        tracing::warn!(?alert, "operator alert");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), CheckoutError> {
    dotenvy::dotenv().ok();
    let config = Config::from_env();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&config.log_level))
        .init();
    metrics::register_metrics();

    let movie_a = MovieId::new();
    let movie_b = MovieId::new();
    let mut prices = HashMap::new();
    prices.insert(movie_a, Money::from_minor_units(1000, Currency::Usd));
    prices.insert(movie_b, Money::from_minor_units(500, Currency::Usd));

    let store = Arc::new(InMemoryOrderStore::new());
    let gateway = Arc::new(DemoGateway::default());
    let catalog = Arc::new(DemoCatalog { prices });
    let dispatcher = Arc::new(LogDispatcher);
    let publisher = Arc::new(LogPublisher);
    let clock = Arc::new(SystemClock);

    let service = CheckoutService::new(
        store.clone(),
        gateway.clone(),
        catalog,
        dispatcher,
        publisher.clone(),
        clock.clone(),
        config.checkout.clone(),
        config.gateway.clone(),
    );
    let verifier = WebhookVerifier::new(config.gateway.webhook_secret.clone());
    let reconciler = Reconciler::new(
        store,
        gateway,
        publisher,
        clock,
        verifier.clone(),
        config.checkout.clone(),
    );

    // Shop and check out.
    let user = UserId::new();
    service.add_to_cart(user, movie_a).await?;
    service.add_to_cart(user, movie_b).await?;
    let (snapshot, _) = service.view_cart(user).await?;
    tracing::info!(total = %snapshot.total()?, "cart ready");

    let order = service.checkout(user, Some(snapshot.total()?)).await?;
    let order = service.pay(order.id()).await?;
    let Some(reference) = order
        .active_intent()
        .and_then(|intent| intent.gateway_reference.clone())
    else {
        tracing::error!(order_id = %order.id(), "no gateway reference recorded");
        return Ok(());
    };

    // The gateway settles and notifies us.
    let payload = format!(r#"{{"reference":"{reference}","status":"settled"}}"#);
    let notification = Notification {
        reference,
        raw_status: "settled".to_string(),
        signature: verifier.sign(&payload),
        payload,
    };
    let outcome = reconciler.handle_notification(&notification).await?;
    tracing::info!(?outcome, "webhook processed");

    let order = service.order(order.id()).await?;
    let owned = service.purchased_movies(user).await?;
    tracing::info!(status = %order.status(), movies_owned = owned.len(), "order settled");

    // One sweep pass; nothing is stale, so this is a no-op.
    let report = reconciler.run_sweep().await?;
    tracing::info!(?report, "sweep finished");
    Ok(())
}
