//! Order aggregate: the state machine governing an order from creation
//! through settlement or cancellation.
//!
//! The aggregate owns its payment intents so that an intent transitioning to
//! settled and the order transitioning to paid happen in one mutation, under
//! one version check. No order can be observed pending while one of its
//! intents is settled, and vice versa.
//!
//! ```text
//! PendingPayment ──mark_paid──> Paid       (terminal)
//!       │────────────cancel───> Cancelled  (terminal)
//!       └────────────expire───> Expired    (terminal)
//! ```
//!
//! Transitions are monotonic: once terminal, an order only accepts audit
//! metadata. Every transition appends a [`StatusTransition`] record for
//! dispute resolution.

use crate::cart::CartSnapshot;
use crate::error::CheckoutError;
use crate::events::{DomainEvent, OperatorAlert};
use crate::payment::{CallbackOutcome, IntentStatus, PaymentIntent};
use crate::types::{CartItem, GatewayRef, Money, OrderId, PaymentIntentId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Order lifecycle status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Created from a cart snapshot, awaiting settlement.
    PendingPayment,
    /// A payment intent settled; licences may be granted.
    Paid,
    /// Cancelled by the owner before a payment attempt took hold.
    Cancelled,
    /// Unpaid past the configured TTL; expired by the sweep.
    Expired,
}

impl OrderStatus {
    /// Paid, Cancelled and Expired are terminal.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::PendingPayment)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PendingPayment => "pending_payment",
            Self::Paid => "paid",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Who triggered a state transition, for the audit trail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggeredBy {
    /// A request by the order's owner.
    User,
    /// An authenticated gateway notification.
    GatewayCallback,
    /// The periodic reconciliation sweep.
    ReconciliationSweep,
}

/// Append-only audit record of one status transition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTransition {
    /// Status before the transition; `None` for creation.
    pub from: Option<OrderStatus>,
    /// Status after the transition.
    pub to: OrderStatus,
    /// What caused it.
    pub triggered_by: TriggeredBy,
    /// When it happened.
    pub at: DateTime<Utc>,
}

/// An order: immutable snapshot of cart items plus the settlement state
/// machine and its payment intents.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Order {
    id: OrderId,
    user_id: UserId,
    items: Vec<CartItem>,
    total: Money,
    status: OrderStatus,
    created_at: DateTime<Utc>,
    version: u64,
    intents: Vec<PaymentIntent>,
    paid_by: Option<PaymentIntentId>,
    audit: Vec<StatusTransition>,
}

impl Order {
    /// Creates a pending order from a checkout snapshot.
    ///
    /// Item prices and quantities are copied immutably, so later catalog
    /// price changes never affect this order. When the client supplies the
    /// total it believed it was paying, it is checked against the
    /// server-side recomputation as a defense against stale client state.
    ///
    /// # Errors
    ///
    /// [`CheckoutError::EmptyCart`] for a snapshot with no items,
    /// [`CheckoutError::PriceMismatch`] when `client_total` disagrees with
    /// the recomputed total.
    pub fn create(
        user_id: UserId,
        snapshot: &CartSnapshot,
        client_total: Option<Money>,
        now: DateTime<Utc>,
    ) -> Result<Self, CheckoutError> {
        let total = snapshot.total()?;
        if let Some(client) = client_total {
            if client != total {
                return Err(CheckoutError::PriceMismatch {
                    client,
                    computed: total,
                });
            }
        }
        Ok(Self {
            id: OrderId::new(),
            user_id,
            items: snapshot.items().to_vec(),
            total,
            status: OrderStatus::PendingPayment,
            created_at: now,
            version: 0,
            intents: Vec::new(),
            paid_by: None,
            audit: vec![StatusTransition {
                from: None,
                to: OrderStatus::PendingPayment,
                triggered_by: TriggeredBy::User,
                at: now,
            }],
        })
    }

    // ---- accessors ---------------------------------------------------------

    /// The order identifier.
    #[must_use]
    pub const fn id(&self) -> OrderId {
        self.id
    }

    /// The owning user.
    #[must_use]
    pub const fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Current lifecycle status.
    #[must_use]
    pub const fn status(&self) -> OrderStatus {
        self.status
    }

    /// Order total; always the sum of item subtotals.
    #[must_use]
    pub const fn total(&self) -> Money {
        self.total
    }

    /// The immutable item snapshot.
    #[must_use]
    pub fn items(&self) -> &[CartItem] {
        &self.items
    }

    /// Creation timestamp; the sweep compares this against the payment TTL.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Optimistic-concurrency version; incremented by the store on update.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Sets the version. Only stores call this, after a successful
    /// compare-and-swap.
    pub fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    /// All payment attempts, oldest first.
    #[must_use]
    pub fn intents(&self) -> &[PaymentIntent] {
        &self.intents
    }

    /// The single non-terminal attempt, if any.
    #[must_use]
    pub fn active_intent(&self) -> Option<&PaymentIntent> {
        self.intents.iter().find(|intent| intent.is_active())
    }

    /// The attempt holding a given gateway reference.
    #[must_use]
    pub fn intent_by_reference(&self, reference: &GatewayRef) -> Option<&PaymentIntent> {
        self.intents
            .iter()
            .find(|intent| intent.gateway_reference.as_ref() == Some(reference))
    }

    /// The intent that settled this order, once paid.
    #[must_use]
    pub const fn paid_by(&self) -> Option<PaymentIntentId> {
        self.paid_by
    }

    /// The append-only audit trail.
    #[must_use]
    pub fn audit(&self) -> &[StatusTransition] {
        &self.audit
    }

    /// Whether the user owns `movie` through this order (paid orders only).
    #[must_use]
    pub fn grants_ownership_of(&self, movie: crate::types::MovieId) -> bool {
        self.status == OrderStatus::Paid && self.items.iter().any(|item| item.movie_id == movie)
    }

    // ---- payment intent tracking -------------------------------------------

    /// Starts (or resumes) a payment attempt.
    ///
    /// If a non-terminal attempt already exists it is returned as-is: its
    /// deterministic idempotency key makes re-presenting it to the gateway
    /// safe, and checking locally first avoids duplicate charges under retry
    /// storms even against gateways that mishandle idempotency keys.
    ///
    /// # Errors
    ///
    /// [`CheckoutError::OrderClosed`] if the order is no longer pending.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) -> Result<&PaymentIntent, CheckoutError> {
        if self.status != OrderStatus::PendingPayment {
            return Err(CheckoutError::OrderClosed {
                order: self.id,
                status: self.status,
            });
        }
        if let Some(pos) = self.intents.iter().position(PaymentIntent::is_active) {
            return Ok(&self.intents[pos]);
        }
        let attempt_number = u32::try_from(self.intents.len() + 1).unwrap_or(u32::MAX);
        let intent = PaymentIntent::new(self.id, self.total, attempt_number, now);
        self.intents.push(intent);
        let pos = self.intents.len() - 1;
        Ok(&self.intents[pos])
    }

    /// Records the gateway reference returned for an attempt.
    ///
    /// Idempotent: recording the same reference again is a no-op. A
    /// *different* reference for the same attempt means the idempotency key
    /// was not honored and is escalated.
    ///
    /// # Errors
    ///
    /// [`CheckoutError::IntentMismatch`] if the intent does not belong to
    /// this order; [`CheckoutError::SettlementConflict`] on a conflicting
    /// reference.
    pub fn record_gateway_reference(
        &mut self,
        intent_id: PaymentIntentId,
        reference: GatewayRef,
    ) -> Result<(), CheckoutError> {
        let order = self.id;
        let intent = self
            .intents
            .iter_mut()
            .find(|intent| intent.id == intent_id)
            .ok_or(CheckoutError::IntentMismatch {
                order,
                intent: intent_id,
            })?;
        match &intent.gateway_reference {
            None => {
                intent.gateway_reference = Some(reference);
                Ok(())
            }
            Some(existing) if *existing == reference => Ok(()),
            Some(existing) => Err(CheckoutError::SettlementConflict {
                order,
                detail: format!(
                    "attempt {} already references {existing}, gateway returned {reference}",
                    intent.attempt_number
                ),
            }),
        }
    }

    /// Applies an authoritative gateway status to the attempt holding
    /// `reference`. Both webhook deliveries and sweep re-queries funnel
    /// through here, so there is a single code path for every settlement
    /// state change regardless of trigger source.
    ///
    /// Duplicate notifications for a terminal attempt are absorbed as
    /// [`CallbackOutcome::Duplicate`]; contradictions (a different status
    /// after a terminal one, or a settlement after the order closed) come
    /// back as [`CallbackOutcome::Conflict`] for manual review rather than
    /// being auto-resolved.
    ///
    /// # Errors
    ///
    /// [`CheckoutError::UnknownReference`] when no attempt holds
    /// `reference`. Logged by the caller, not fatal: the gateway may be
    /// replaying an old or foreign event.
    pub fn record_callback(
        &mut self,
        reference: &GatewayRef,
        reported: IntentStatus,
        triggered_by: TriggeredBy,
        now: DateTime<Utc>,
    ) -> Result<CallbackOutcome, CheckoutError> {
        let order = self.id;
        let pos = self
            .intents
            .iter()
            .position(|intent| intent.gateway_reference.as_ref() == Some(reference))
            .ok_or_else(|| CheckoutError::UnknownReference {
                reference: reference.clone(),
            })?;

        let current = self.intents[pos].status;
        if current == reported {
            return Ok(CallbackOutcome::Duplicate);
        }
        if current.is_terminal() {
            // e.g. FAILED reported after SETTLED: financial correctness over
            // automatic recovery.
            return Ok(CallbackOutcome::Conflict {
                alert: OperatorAlert::SettlementConflict {
                    order_id: order,
                    detail: format!(
                        "gateway reported {reported} for {reference} already recorded {current}"
                    ),
                },
            });
        }

        match reported {
            IntentStatus::Created => {
                // Out-of-order replay of the creation event; nothing to do.
                Ok(CallbackOutcome::Duplicate)
            }
            IntentStatus::Authorized => {
                self.intents[pos].status = IntentStatus::Authorized;
                Ok(CallbackOutcome::Applied { events: vec![] })
            }
            IntentStatus::Failed | IntentStatus::Expired => {
                self.intents[pos].status = reported;
                Ok(CallbackOutcome::Applied { events: vec![] })
            }
            IntentStatus::Settled => self.settle_intent(pos, triggered_by, now),
        }
    }

    /// Settles the attempt at `pos`, marking the order paid when the state
    /// machine allows it.
    fn settle_intent(
        &mut self,
        pos: usize,
        triggered_by: TriggeredBy,
        now: DateTime<Utc>,
    ) -> Result<CallbackOutcome, CheckoutError> {
        if self.paid_by.is_some() {
            // Exactly one intent may ever settle; a second settlement means
            // the user was charged twice.
            return Ok(CallbackOutcome::Conflict {
                alert: OperatorAlert::SettlementConflict {
                    order_id: self.id,
                    detail: format!(
                        "attempt {} reported settled but the order is already paid",
                        self.intents[pos].attempt_number
                    ),
                },
            });
        }
        if self.status.is_terminal() {
            // Late settlement after expiry/cancellation: the charge is real,
            // so record it, but never reopen the order. Flagged for refund.
            self.intents[pos].status = IntentStatus::Settled;
            return Ok(CallbackOutcome::Conflict {
                alert: OperatorAlert::SettlementConflict {
                    order_id: self.id,
                    detail: format!(
                        "settlement arrived after the order was {}; refund required",
                        self.status
                    ),
                },
            });
        }

        self.intents[pos].status = IntentStatus::Settled;
        let intent_id = self.intents[pos].id;
        let events = self.mark_paid(intent_id, triggered_by, now)?;
        Ok(CallbackOutcome::Applied { events })
    }

    // ---- state machine transitions ------------------------------------------

    /// `PendingPayment -> Paid`, allowed only when the referenced intent is
    /// settled and belongs to this order.
    ///
    /// Idempotent: marking an order paid again with the same settled intent
    /// is a no-op that returns no events and appends no audit entry, which
    /// is how duplicate gateway notifications are absorbed.
    ///
    /// # Errors
    ///
    /// [`CheckoutError::IntentMismatch`] if the intent is not this order's
    /// settled attempt; [`CheckoutError::SettlementConflict`] if the order
    /// is already closed in a different terminal status.
    pub fn mark_paid(
        &mut self,
        intent_id: PaymentIntentId,
        triggered_by: TriggeredBy,
        now: DateTime<Utc>,
    ) -> Result<Vec<DomainEvent>, CheckoutError> {
        if self.status == OrderStatus::Paid {
            if self.paid_by == Some(intent_id) {
                return Ok(vec![]);
            }
            return Err(CheckoutError::IntentMismatch {
                order: self.id,
                intent: intent_id,
            });
        }
        if self.status.is_terminal() {
            return Err(CheckoutError::SettlementConflict {
                order: self.id,
                detail: format!("mark_paid on an order already {}", self.status),
            });
        }
        let settled_here = self
            .intents
            .iter()
            .any(|intent| intent.id == intent_id && intent.status == IntentStatus::Settled);
        if !settled_here {
            return Err(CheckoutError::IntentMismatch {
                order: self.id,
                intent: intent_id,
            });
        }

        self.transition(OrderStatus::Paid, triggered_by, now);
        self.paid_by = Some(intent_id);
        Ok(vec![DomainEvent::OrderPaid {
            order_id: self.id,
            user_id: self.user_id,
            items: self.items.clone(),
        }])
    }

    /// `PendingPayment -> Cancelled`, allowed only while no attempt is
    /// authorized or settled.
    ///
    /// # Errors
    ///
    /// [`CheckoutError::PaymentInFlight`] while an attempt is authorized or
    /// settled (the caller must wait for reconciliation);
    /// [`CheckoutError::OrderClosed`] if the order is already terminal.
    pub fn cancel(
        &mut self,
        reason: &str,
        triggered_by: TriggeredBy,
        now: DateTime<Utc>,
    ) -> Result<Vec<DomainEvent>, CheckoutError> {
        if self.status.is_terminal() {
            return Err(CheckoutError::OrderClosed {
                order: self.id,
                status: self.status,
            });
        }
        let in_flight = self.intents.iter().any(|intent| {
            matches!(
                intent.status,
                IntentStatus::Authorized | IntentStatus::Settled
            )
        });
        if in_flight {
            return Err(CheckoutError::PaymentInFlight { order: self.id });
        }

        // Abandon attempts the gateway never acknowledged; no notification
        // can ever arrive for them. An attempt holding a reference stays
        // open so a late verdict still matches it and a real settlement is
        // recorded (and escalated) instead of dropped.
        for intent in &mut self.intents {
            if intent.status == IntentStatus::Created && intent.gateway_reference.is_none() {
                intent.status = IntentStatus::Expired;
            }
        }
        self.transition(OrderStatus::Cancelled, triggered_by, now);
        Ok(vec![DomainEvent::OrderCancelled {
            order_id: self.id,
            reason: reason.to_string(),
        }])
    }

    /// `PendingPayment -> Expired`, triggered by the sweep once the order
    /// sat unpaid past the configured TTL. One-way: expiry never reopens,
    /// and a late settlement afterwards is flagged, not accepted.
    ///
    /// # Errors
    ///
    /// [`CheckoutError::OrderClosed`] if already terminal;
    /// [`CheckoutError::PaymentInFlight`] while an attempt is authorized
    /// (the sweep resolves it by querying the gateway first).
    pub fn expire(
        &mut self,
        triggered_by: TriggeredBy,
        now: DateTime<Utc>,
    ) -> Result<Vec<DomainEvent>, CheckoutError> {
        if self.status.is_terminal() {
            return Err(CheckoutError::OrderClosed {
                order: self.id,
                status: self.status,
            });
        }
        let in_flight = self.intents.iter().any(|intent| {
            matches!(
                intent.status,
                IntentStatus::Authorized | IntentStatus::Settled
            )
        });
        if in_flight {
            return Err(CheckoutError::PaymentInFlight { order: self.id });
        }

        // Same rule as cancel: only reference-less attempts are abandoned.
        for intent in &mut self.intents {
            if intent.status == IntentStatus::Created && intent.gateway_reference.is_none() {
                intent.status = IntentStatus::Expired;
            }
        }
        self.transition(OrderStatus::Expired, triggered_by, now);
        Ok(vec![DomainEvent::OrderExpired { order_id: self.id }])
    }

    fn transition(&mut self, to: OrderStatus, triggered_by: TriggeredBy, at: DateTime<Utc>) {
        self.audit.push(StatusTransition {
            from: Some(self.status),
            to,
            triggered_by,
            at,
        });
        self.status = to;
        tracing::debug!(
            order_id = %self.id,
            status = %to,
            ?triggered_by,
            "order transitioned"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::cart::Cart;
    use crate::types::{Currency, MovieId};

    fn usd(minor: u64) -> Money {
        Money::from_minor_units(minor, Currency::Usd)
    }

    fn two_item_snapshot() -> CartSnapshot {
        let mut cart = Cart::new(UserId::new());
        cart.add_item(MovieId::new(), usd(1000), 1).unwrap();
        cart.add_item(MovieId::new(), usd(500), 1).unwrap();
        cart.snapshot(|_| None).0
    }

    fn pending_order() -> Order {
        Order::create(UserId::new(), &two_item_snapshot(), None, Utc::now()).unwrap()
    }

    /// Drives an order through attempt creation and a settled callback.
    fn settled_order() -> (Order, GatewayRef) {
        let mut order = pending_order();
        let now = Utc::now();
        let intent_id = order.begin_attempt(now).unwrap().id;
        let reference = GatewayRef::from("txn_1");
        order
            .record_gateway_reference(intent_id, reference.clone())
            .unwrap();
        let outcome = order
            .record_callback(
                &reference,
                IntentStatus::Settled,
                TriggeredBy::GatewayCallback,
                now,
            )
            .unwrap();
        assert!(matches!(outcome, CallbackOutcome::Applied { .. }));
        (order, reference)
    }

    #[test]
    fn checkout_creates_pending_order_with_summed_total() {
        let order = pending_order();
        assert_eq!(order.status(), OrderStatus::PendingPayment);
        assert_eq!(order.total(), usd(1500));
        assert_eq!(order.audit().len(), 1);
        assert_eq!(order.audit()[0].from, None);
    }

    #[test]
    fn create_rejects_empty_cart() {
        let cart = Cart::new(UserId::new());
        let (snapshot, _) = cart.snapshot(|_| None);
        let err = Order::create(UserId::new(), &snapshot, None, Utc::now()).unwrap_err();
        assert_eq!(err, CheckoutError::EmptyCart);
    }

    #[test]
    fn create_rejects_stale_client_total() {
        let err = Order::create(
            UserId::new(),
            &two_item_snapshot(),
            Some(usd(1400)),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, CheckoutError::PriceMismatch { .. }));
    }

    #[test]
    fn begin_attempt_reuses_the_active_intent() {
        let mut order = pending_order();
        let now = Utc::now();
        let first = order.begin_attempt(now).unwrap().id;
        let second = order.begin_attempt(now).unwrap().id;
        assert_eq!(first, second);
        assert_eq!(order.intents().len(), 1);
    }

    #[test]
    fn begin_attempt_numbers_attempts_after_failures() {
        let mut order = pending_order();
        let now = Utc::now();
        let intent_id = order.begin_attempt(now).unwrap().id;
        order
            .record_gateway_reference(intent_id, GatewayRef::from("txn_1"))
            .unwrap();
        order
            .record_callback(
                &GatewayRef::from("txn_1"),
                IntentStatus::Failed,
                TriggeredBy::GatewayCallback,
                now,
            )
            .unwrap();

        let retry = order.begin_attempt(now).unwrap();
        assert_eq!(retry.attempt_number, 2);
        // Distinct attempts never share an idempotency key.
        assert_ne!(
            order.intents()[0].idempotency_key,
            order.intents()[1].idempotency_key
        );
    }

    #[test]
    fn settled_callback_pays_the_order_exactly_once() {
        let (order, _) = settled_order();
        assert_eq!(order.status(), OrderStatus::Paid);
        assert!(order.paid_by().is_some());
        // Bijection: the paid order has exactly one settled intent.
        let settled = order
            .intents()
            .iter()
            .filter(|intent| intent.status == IntentStatus::Settled)
            .count();
        assert_eq!(settled, 1);
    }

    #[test]
    fn duplicate_settled_callback_is_absorbed_without_audit_noise() {
        let (mut order, reference) = settled_order();
        let audit_len = order.audit().len();

        let outcome = order
            .record_callback(
                &reference,
                IntentStatus::Settled,
                TriggeredBy::GatewayCallback,
                Utc::now(),
            )
            .unwrap();

        assert!(matches!(outcome, CallbackOutcome::Duplicate));
        assert_eq!(order.status(), OrderStatus::Paid);
        assert_eq!(order.audit().len(), audit_len);
    }

    #[test]
    fn failed_after_settled_is_a_conflict_not_a_rollback() {
        let (mut order, reference) = settled_order();

        let outcome = order
            .record_callback(
                &reference,
                IntentStatus::Failed,
                TriggeredBy::GatewayCallback,
                Utc::now(),
            )
            .unwrap();

        assert!(matches!(outcome, CallbackOutcome::Conflict { .. }));
        assert_eq!(order.status(), OrderStatus::Paid);
    }

    #[test]
    fn mark_paid_is_idempotent_for_the_settling_intent() {
        let (mut order, _) = settled_order();
        let intent_id = order.paid_by().unwrap();
        let before = order.clone();

        let events = order
            .mark_paid(intent_id, TriggeredBy::GatewayCallback, Utc::now())
            .unwrap();

        assert!(events.is_empty());
        assert_eq!(order.status(), before.status());
        assert_eq!(order.audit().len(), before.audit().len());
    }

    #[test]
    fn mark_paid_rejects_foreign_or_unsettled_intents() {
        let mut order = pending_order();
        let now = Utc::now();
        let intent_id = order.begin_attempt(now).unwrap().id;

        // Intent exists but is not settled.
        let err = order
            .mark_paid(intent_id, TriggeredBy::User, now)
            .unwrap_err();
        assert!(matches!(err, CheckoutError::IntentMismatch { .. }));

        // Intent does not belong to the order at all.
        let err = order
            .mark_paid(PaymentIntentId::new(), TriggeredBy::User, now)
            .unwrap_err();
        assert!(matches!(err, CheckoutError::IntentMismatch { .. }));
    }

    #[test]
    fn cancel_rejected_while_payment_authorized() {
        let mut order = pending_order();
        let now = Utc::now();
        let intent_id = order.begin_attempt(now).unwrap().id;
        order
            .record_gateway_reference(intent_id, GatewayRef::from("txn_1"))
            .unwrap();
        order
            .record_callback(
                &GatewayRef::from("txn_1"),
                IntentStatus::Authorized,
                TriggeredBy::GatewayCallback,
                now,
            )
            .unwrap();

        let err = order
            .cancel("changed my mind", TriggeredBy::User, now)
            .unwrap_err();
        assert!(matches!(err, CheckoutError::PaymentInFlight { .. }));
        assert_eq!(order.status(), OrderStatus::PendingPayment);
    }

    #[test]
    fn cancel_abandons_unconfirmed_attempts() {
        let mut order = pending_order();
        let now = Utc::now();
        order.begin_attempt(now).unwrap();

        let events = order.cancel("user request", TriggeredBy::User, now).unwrap();

        assert_eq!(order.status(), OrderStatus::Cancelled);
        assert_eq!(order.intents()[0].status, IntentStatus::Expired);
        assert!(matches!(events[0], DomainEvent::OrderCancelled { .. }));
    }

    #[test]
    fn late_settlement_after_expiry_is_flagged_never_accepted() {
        let mut order = pending_order();
        let now = Utc::now();
        let intent_id = order.begin_attempt(now).unwrap().id;
        let reference = GatewayRef::from("txn_late");
        order
            .record_gateway_reference(intent_id, reference.clone())
            .unwrap();

        order.expire(TriggeredBy::ReconciliationSweep, now).unwrap();
        assert_eq!(order.status(), OrderStatus::Expired);

        let outcome = order
            .record_callback(
                &reference,
                IntentStatus::Settled,
                TriggeredBy::GatewayCallback,
                now,
            )
            .unwrap();

        let CallbackOutcome::Conflict { alert } = outcome else {
            panic!("expected a settlement conflict");
        };
        assert!(matches!(alert, OperatorAlert::SettlementConflict { .. }));
        // The charge is recorded, the order stays expired.
        assert_eq!(order.intents()[0].status, IntentStatus::Settled);
        assert_eq!(order.status(), OrderStatus::Expired);
    }

    #[test]
    fn expiry_keeps_referenced_attempts_open_for_late_verdicts() {
        let mut order = pending_order();
        let now = Utc::now();
        let intent_id = order.begin_attempt(now).unwrap().id;
        order
            .record_gateway_reference(intent_id, GatewayRef::from("txn_1"))
            .unwrap();

        order.expire(TriggeredBy::ReconciliationSweep, now).unwrap();

        // The gateway may still report a verdict for this reference; the
        // attempt must stay matchable.
        assert_eq!(order.intents()[0].status, IntentStatus::Created);
    }

    #[test]
    fn expire_is_one_way() {
        let mut order = pending_order();
        let now = Utc::now();
        order.expire(TriggeredBy::ReconciliationSweep, now).unwrap();

        let err = order
            .expire(TriggeredBy::ReconciliationSweep, now)
            .unwrap_err();
        assert!(matches!(err, CheckoutError::OrderClosed { .. }));
    }

    #[test]
    fn unknown_reference_is_reported_not_applied() {
        let mut order = pending_order();
        let err = order
            .record_callback(
                &GatewayRef::from("txn_foreign"),
                IntentStatus::Settled,
                TriggeredBy::GatewayCallback,
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, CheckoutError::UnknownReference { .. }));
        assert_eq!(order.status(), OrderStatus::PendingPayment);
    }

    #[test]
    fn pending_orders_never_hold_a_settled_intent() {
        // Bijection invariant: PendingPayment implies no settled intent.
        let mut order = pending_order();
        let now = Utc::now();
        let intent_id = order.begin_attempt(now).unwrap().id;
        order
            .record_gateway_reference(intent_id, GatewayRef::from("txn_1"))
            .unwrap();
        order
            .record_callback(
                &GatewayRef::from("txn_1"),
                IntentStatus::Authorized,
                TriggeredBy::GatewayCallback,
                now,
            )
            .unwrap();

        assert_eq!(order.status(), OrderStatus::PendingPayment);
        assert!(
            order
                .intents()
                .iter()
                .all(|intent| intent.status != IntentStatus::Settled)
        );
    }

    #[test]
    fn conflicting_gateway_reference_is_escalated() {
        let mut order = pending_order();
        let now = Utc::now();
        let intent_id = order.begin_attempt(now).unwrap().id;
        order
            .record_gateway_reference(intent_id, GatewayRef::from("txn_a"))
            .unwrap();

        // Same reference again: idempotent.
        order
            .record_gateway_reference(intent_id, GatewayRef::from("txn_a"))
            .unwrap();

        // A different reference for the same attempt is an integrity error.
        let err = order
            .record_gateway_reference(intent_id, GatewayRef::from("txn_b"))
            .unwrap_err();
        assert!(matches!(err, CheckoutError::SettlementConflict { .. }));
    }

    /// Stores persist the aggregate as a JSON document; settlement state
    /// must survive that round trip intact.
    #[test]
    fn aggregate_survives_document_persistence() {
        let (order, reference) = settled_order();
        let document = serde_json::to_value(&order).unwrap();
        let restored: Order = serde_json::from_value(document).unwrap();

        assert_eq!(restored.id(), order.id());
        assert_eq!(restored.status(), OrderStatus::Paid);
        assert_eq!(restored.paid_by(), order.paid_by());
        assert_eq!(restored.version(), order.version());
        assert_eq!(restored.audit().len(), order.audit().len());
        assert!(restored.intent_by_reference(&reference).is_some());

        // The restored aggregate keeps enforcing its rules.
        let mut restored = restored;
        let err = restored
            .cancel("late", TriggeredBy::User, Utc::now())
            .unwrap_err();
        assert!(matches!(err, CheckoutError::OrderClosed { .. }));
    }
}
