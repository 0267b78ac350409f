//! End-to-end settlement: cart to paid order through the webhook path.

#![allow(clippy::unwrap_used, clippy::panic)]

mod common;

use cinema_core::{
    CallbackOutcome, CheckoutError, DomainEvent, OperatorAlert, OrderStatus, TriggeredBy, UserId,
};
use common::Harness;

#[tokio::test]
async fn cart_to_paid_order_via_settled_webhook() {
    let h = Harness::new();
    let user = UserId::new();
    let movie_a = h.add_movie(user, 1000).await;
    let movie_b = h.add_movie(user, 500).await;

    let (snapshot, notices) = h.service.view_cart(user).await.unwrap();
    assert!(notices.is_empty());
    assert_eq!(snapshot.total().unwrap(), Harness::usd(1500));

    let order = h
        .service
        .checkout(user, Some(Harness::usd(1500)))
        .await
        .unwrap();
    assert_eq!(order.status(), OrderStatus::PendingPayment);
    assert_eq!(order.total(), Harness::usd(1500));

    // The cart is gone once the order exists.
    let (snapshot, _) = h.service.view_cart(user).await.unwrap();
    assert!(snapshot.is_empty());

    let order = h.service.pay(order.id()).await.unwrap();
    let reference = order
        .active_intent()
        .and_then(|i| i.gateway_reference.clone())
        .unwrap();

    let outcome = h
        .reconciler
        .handle_notification(&h.notification(&reference, "settled"))
        .await
        .unwrap();
    assert!(matches!(outcome, CallbackOutcome::Applied { .. }));

    let order = h.service.order(order.id()).await.unwrap();
    assert_eq!(order.status(), OrderStatus::Paid);

    let events = h.publisher.events().await;
    let paid: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, DomainEvent::OrderPaid { .. }))
        .collect();
    assert_eq!(paid.len(), 1);

    let owned = h.service.purchased_movies(user).await.unwrap();
    assert!(owned.contains(&movie_a) && owned.contains(&movie_b));
}

#[tokio::test]
async fn duplicate_settled_webhook_is_absorbed() {
    let h = Harness::new();
    let user = UserId::new();
    h.add_movie(user, 1000).await;
    let (order_id, reference) = h.paid_up_to_gateway(user).await.unwrap();

    let first = h
        .reconciler
        .handle_notification(&h.notification(&reference, "settled"))
        .await
        .unwrap();
    assert!(matches!(first, CallbackOutcome::Applied { .. }));

    let second = h
        .reconciler
        .handle_notification(&h.notification(&reference, "settled"))
        .await
        .unwrap();
    assert!(matches!(second, CallbackOutcome::Duplicate));

    // Exactly one OrderPaid, exactly one audit transition to Paid.
    let events = h.publisher.events().await;
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, DomainEvent::OrderPaid { .. }))
            .count(),
        1
    );
    let order = h.service.order(order_id).await.unwrap();
    assert_eq!(
        order
            .audit()
            .iter()
            .filter(|t| t.to == OrderStatus::Paid)
            .count(),
        1
    );
    assert_eq!(
        order.audit().last().unwrap().triggered_by,
        TriggeredBy::GatewayCallback
    );
}

#[tokio::test]
async fn repeated_pay_reuses_the_active_attempt() {
    let h = Harness::new();
    let user = UserId::new();
    h.add_movie(user, 1000).await;
    let order = h.service.checkout(user, None).await.unwrap();

    let first = h.service.pay(order.id()).await.unwrap();
    let second = h.service.pay(order.id()).await.unwrap();

    assert_eq!(first.intents().len(), 1);
    assert_eq!(second.intents().len(), 1);

    // Same idempotency key both times, so the gateway returned the same
    // reference and no second charge exists.
    let calls = h.gateway.create_calls().await;
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].idempotency_key, calls[1].idempotency_key);
    assert_eq!(
        first.intents()[0].gateway_reference,
        second.intents()[0].gateway_reference
    );
}

#[tokio::test]
async fn conflicting_gateway_reference_goes_to_the_operator_not_the_caller() {
    let h = Harness::new();
    let user = UserId::new();
    h.add_movie(user, 1000).await;
    let (order_id, reference) = h.paid_up_to_gateway(user).await.unwrap();

    // The gateway drops its idempotency record and mints a second
    // transaction for the same attempt on the next pay.
    let key = h.gateway.create_calls().await[0].idempotency_key.clone();
    h.gateway.forget_key(&key).await;

    let order = h.service.pay(order_id).await.unwrap();

    // The caller sees the order pending under its original reference; the
    // contradiction is escalated on the operator channel.
    assert_eq!(order.status(), OrderStatus::PendingPayment);
    assert_eq!(
        order.intents()[0].gateway_reference,
        Some(reference.clone())
    );
    assert!(
        h.publisher
            .alerts()
            .await
            .iter()
            .any(|a| matches!(a, OperatorAlert::SettlementConflict { .. }))
    );

    // Settlement of the original transaction still completes the order.
    h.reconciler
        .handle_notification(&h.notification(&reference, "settled"))
        .await
        .unwrap();
    let order = h.service.order(order_id).await.unwrap();
    assert_eq!(order.status(), OrderStatus::Paid);
}

#[tokio::test]
async fn checkout_rejects_a_stale_client_total() {
    let h = Harness::new();
    let user = UserId::new();
    let movie = h.add_movie(user, 1000).await;

    // Price changes between add and checkout.
    h.catalog.set_price(movie, Harness::usd(1200)).await;

    let result = h.service.checkout(user, Some(Harness::usd(1000))).await;
    assert!(matches!(
        result,
        Err(CheckoutError::PriceMismatch { client, computed })
            if client == Harness::usd(1000) && computed == Harness::usd(1200)
    ));

    // The cart survives a rejected checkout.
    let (snapshot, notices) = h.service.view_cart(user).await.unwrap();
    assert!(!snapshot.is_empty());
    assert_eq!(notices.len(), 1);
}

#[tokio::test]
async fn owned_movies_cannot_be_added_or_bought_again() {
    let h = Harness::new();
    let user = UserId::new();
    let movie = h.add_movie(user, 1000).await;

    // Purchased in another session while this cart was open.
    h.catalog.grant(user, movie).await;

    let result = h.service.add_to_cart(user, movie).await;
    assert!(matches!(result, Err(CheckoutError::AlreadyOwned { .. })));

    let result = h.service.checkout(user, None).await;
    assert!(matches!(result, Err(CheckoutError::AlreadyOwned { .. })));
}

#[tokio::test]
async fn cancel_closes_a_pending_order() {
    let h = Harness::new();
    let user = UserId::new();
    h.add_movie(user, 1000).await;
    let order = h.service.checkout(user, None).await.unwrap();

    let order = h
        .service
        .cancel(order.id(), "changed my mind")
        .await
        .unwrap();
    assert_eq!(order.status(), OrderStatus::Cancelled);
    assert!(
        h.publisher
            .events()
            .await
            .iter()
            .any(|e| matches!(e, DomainEvent::OrderCancelled { .. }))
    );

    // No payment can start on a closed order.
    let result = h.service.pay(order.id()).await;
    assert!(matches!(result, Err(CheckoutError::OrderClosed { .. })));
}

#[tokio::test]
async fn cancel_is_rejected_while_a_charge_is_authorized() {
    let h = Harness::new();
    let user = UserId::new();
    h.add_movie(user, 1000).await;
    let (order_id, reference) = h.paid_up_to_gateway(user).await.unwrap();

    h.reconciler
        .handle_notification(&h.notification(&reference, "authorized"))
        .await
        .unwrap();

    let result = h.service.cancel(order_id, "too slow").await;
    assert!(matches!(result, Err(CheckoutError::PaymentInFlight { .. })));
}

#[tokio::test(start_paused = true)]
async fn gateway_timeout_leaves_the_attempt_recoverable() {
    let h = Harness::new();
    let user = UserId::new();
    h.add_movie(user, 1000).await;
    let order = h.service.checkout(user, None).await.unwrap();

    h.gateway.hang_next_creates(1);
    let result = h.service.pay(order.id()).await;
    assert!(matches!(result, Err(CheckoutError::GatewayTimeout)));

    // The attempt survived with its key but no reference, and a reconcile
    // task was scheduled to resolve the unknown outcome.
    let stored = h.service.order(order.id()).await.unwrap();
    assert_eq!(stored.intents().len(), 1);
    assert!(stored.intents()[0].gateway_reference.is_none());
    assert!(!h.dispatcher.tasks().await.is_empty());

    // A later retry resumes the same attempt with the same key.
    let order = h.service.pay(order.id()).await.unwrap();
    assert_eq!(order.intents().len(), 1);
    assert!(order.intents()[0].gateway_reference.is_some());
}

#[tokio::test]
async fn empty_cart_cannot_check_out() {
    let h = Harness::new();
    let user = UserId::new();
    let result = h.service.checkout(user, None).await;
    assert!(matches!(result, Err(CheckoutError::EmptyCart)));
}
