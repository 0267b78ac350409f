//! Gateway notification handling and the reconciliation sweep.
//!
//! Both inbound webhooks and the periodic sweep funnel through the same
//! aggregate path ([`cinema_core::Order::record_callback`]), so every
//! settlement state change follows one set of rules regardless of how the
//! verdict arrived. The sweep is the safety net for lost webhooks and
//! gateway timeouts: it re-queries the authoritative gateway status for
//! stale attempts, re-presents idempotency keys for attempts the gateway
//! never acknowledged, and expires orders that sat unpaid past their TTL.

use cinema_core::{
    CallbackOutcome, CheckoutError, Clock, EventPublisher, GatewayRef, GatewayTransactionStatus,
    IntentStatus, Notification, OperatorAlert, OrderId, OrderStatus, OrderStore,
    PaymentGateway, ReconciliationTask, TaskKind, TransactionMetadata, TriggeredBy,
};
use constant_time_eq::constant_time_eq;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Instant;

use crate::config::CheckoutConfig;
use crate::metrics;
use crate::retry::{RetryPolicy, is_transient, is_version_conflict, retry_if};

// ============================================================================
// Webhook signature verification
// ============================================================================

/// Verifies gateway notification signatures against the shared secret.
///
/// The signature is the hex SHA-256 digest of `secret || '.' || payload`.
/// Comparison is constant-time.
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
}

impl WebhookVerifier {
    /// Creates a verifier for the given shared secret.
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Computes the signature the gateway is expected to send for `payload`.
    #[must_use]
    pub fn sign(&self, payload: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(b".");
        hasher.update(payload.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Whether `signature` is valid for `payload`.
    #[must_use]
    pub fn verify(&self, signature: &str, payload: &str) -> bool {
        let expected = self.sign(payload);
        constant_time_eq(expected.as_bytes(), signature.as_bytes())
    }
}

// ============================================================================
// Reconciler
// ============================================================================

/// Counters from one sweep pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Stale attempts whose gateway status was re-applied.
    pub reconciled: usize,
    /// Orders expired for sitting unpaid past the TTL.
    pub expired: usize,
    /// Contradictions escalated to the operator channel.
    pub conflicts: usize,
    /// Candidates skipped after a transient failure; retried next pass.
    pub failures: usize,
}

/// Applies gateway verdicts to orders, from webhooks and from the sweep.
pub struct Reconciler {
    store: Arc<dyn OrderStore>,
    gateway: Arc<dyn PaymentGateway>,
    publisher: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
    verifier: WebhookVerifier,
    config: CheckoutConfig,
}

impl Reconciler {
    /// Wires the reconciler with its collaborators.
    pub fn new(
        store: Arc<dyn OrderStore>,
        gateway: Arc<dyn PaymentGateway>,
        publisher: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
        verifier: WebhookVerifier,
        config: CheckoutConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            publisher,
            clock,
            verifier,
            config,
        }
    }

    // ---- webhook path -----------------------------------------------------

    /// Handles an inbound gateway notification.
    ///
    /// The signature is verified before anything in the payload is trusted.
    /// Unrecognized statuses are escalated without touching order state.
    ///
    /// # Errors
    ///
    /// [`CheckoutError::UntrustedCallback`] on signature failure,
    /// [`CheckoutError::UnknownReference`] when no order holds the
    /// reference (both alerted), or a transient store error.
    pub async fn handle_notification(
        &self,
        notification: &Notification,
    ) -> Result<CallbackOutcome, CheckoutError> {
        if !self
            .verifier
            .verify(&notification.signature, &notification.payload)
        {
            tracing::warn!(reference = %notification.reference, "notification failed signature verification");
            metrics::record_callback("untrusted");
            self.alert(OperatorAlert::UntrustedCallback {
                detail: format!("bad signature for reference {}", notification.reference),
            })
            .await;
            return Err(CheckoutError::UntrustedCallback);
        }

        let status = GatewayTransactionStatus::parse(&notification.raw_status);
        let Some(reported) = status.as_intent_status() else {
            metrics::record_callback("unrecognized");
            let alert = OperatorAlert::UnrecognizedGatewayStatus {
                reference: notification.reference.clone(),
                raw: notification.raw_status.clone(),
            };
            self.alert(alert.clone()).await;
            return Ok(CallbackOutcome::Conflict { alert });
        };

        self.apply_status(&notification.reference, reported, TriggeredBy::GatewayCallback)
            .await
    }

    /// Applies an authoritative gateway status to whichever order holds the
    /// reference. Shared by the webhook path and the sweep.
    ///
    /// # Errors
    ///
    /// [`CheckoutError::UnknownReference`] when no order holds `reference`,
    /// or a transient store error.
    pub async fn apply_status(
        &self,
        reference: &GatewayRef,
        reported: IntentStatus,
        triggered_by: TriggeredBy,
    ) -> Result<CallbackOutcome, CheckoutError> {
        let Some(order) = self.store.find_by_gateway_reference(reference).await? else {
            tracing::warn!(reference = %reference, "notification for an unknown gateway reference");
            metrics::record_callback("unknown_reference");
            self.alert(OperatorAlert::UnknownReference {
                reference: reference.clone(),
            })
            .await;
            return Err(CheckoutError::UnknownReference {
                reference: reference.clone(),
            });
        };

        let order_id = order.id();
        let policy = RetryPolicy::with_max_retries(self.config.max_version_retries);
        let outcome = retry_if(
            &policy,
            || async move {
                let mut order = self
                    .store
                    .load(order_id)
                    .await?
                    .ok_or(CheckoutError::OrderNotFound { order: order_id })?;
                let expected = order.version();
                let outcome =
                    order.record_callback(reference, reported, triggered_by, self.clock.now())?;
                // Duplicates change nothing; skip the write.
                if !matches!(outcome, CallbackOutcome::Duplicate) {
                    self.store.update(&order, expected).await?;
                }
                Ok(outcome)
            },
            is_version_conflict,
        )
        .await?;

        match &outcome {
            CallbackOutcome::Applied { events } => {
                metrics::record_callback("applied");
                for event in events.clone() {
                    if let cinema_core::DomainEvent::OrderPaid { items, .. } = &event {
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
            }
            CallbackOutcome::Duplicate => {
                metrics::record_callback("duplicate");
                tracing::debug!(order_id = %order_id, reference = %reference, status = %reported, "duplicate notification absorbed");
            }
            CallbackOutcome::Conflict { alert } => {
                metrics::record_callback("conflict");
                metrics::record_settlement_conflict();
                self.alert(alert.clone()).await;
            }
        }
        Ok(outcome)
    }

    // ---- sweep path ---------------------------------------------------------

    /// Handles a dispatcher task: reconciles one order or runs a full sweep.
    ///
    /// Tasks are delivered at least once, so everything here is idempotent.
    ///
    /// # Errors
    ///
    /// Transient store/gateway errors; the dispatcher redelivers.
    pub async fn handle_task(&self, task: &ReconciliationTask) -> Result<(), CheckoutError> {
        match (task.kind, task.order_id) {
            (TaskKind::ReconcileOrder, Some(order_id)) => self.reconcile_order(order_id).await,
            (TaskKind::ReconcileOrder, None) => Ok(()),
            (TaskKind::Sweep, _) => self.run_sweep().await.map(|_| ()),
        }
    }

    /// Reconciles a single order: re-queries a stale attempt if one exists,
    /// recovers the gateway reference for an attempt the gateway never
    /// acknowledged, then expires the order if it overstayed its TTL.
    ///
    /// # Errors
    ///
    /// Transient store/gateway errors.
    pub async fn reconcile_order(&self, order_id: OrderId) -> Result<(), CheckoutError> {
        let Some(order) = self.store.load(order_id).await? else {
            return Ok(());
        };
        if order.status() != OrderStatus::PendingPayment {
            return Ok(());
        }
        let reference = match order
            .active_intent()
            .map(|intent| intent.gateway_reference.clone())
        {
            Some(Some(reference)) => Some(reference),
            // A create call timed out before the gateway answered; the
            // transaction may still exist under the stored idempotency key.
            Some(None) => self.recover_reference(order_id).await?,
            None => None,
        };
        if let Some(reference) = reference {
            self.requery(&reference).await?;
        }
        let ttl_cutoff = self.clock.now() - self.config.order_ttl();
        if order.created_at() < ttl_cutoff {
            self.expire_order(order_id).await?;
        }
        Ok(())
    }

    /// One full sweep pass: re-queries stale attempts, then expires overdue
    /// orders. Transient failures skip the candidate; it is retried on the
    /// next pass.
    ///
    /// # Errors
    ///
    /// A transient store error on the candidate scans themselves.
    pub async fn run_sweep(&self) -> Result<SweepReport, CheckoutError> {
        let started = Instant::now();
        let now = self.clock.now();
        let mut report = SweepReport::default();

        let stale = self
            .store
            .stale_intent_references(now - self.config.reconcile_grace())
            .await?;
        for (order_id, reference) in stale {
            match self.requery(&reference).await {
                Ok(CallbackOutcome::Applied { .. }) => report.reconciled += 1,
                Ok(CallbackOutcome::Conflict { .. }) => report.conflicts += 1,
                Ok(CallbackOutcome::Duplicate) => {}
                Err(err) => {
                    report.failures += 1;
                    tracing::warn!(order_id = %order_id, reference = %reference, error = %err, "sweep re-query failed");
                }
            }
        }

        // Attempts whose create call never got an answer carry no reference
        // and so never appear in the stale-reference scan. Re-present their
        // idempotency key to learn (or harmlessly re-create) the transaction,
        // then apply its authoritative status.
        let grace_cutoff = now - self.config.reconcile_grace();
        for order in self.store.pending_created_before(grace_cutoff).await? {
            let unacknowledged = order.active_intent().is_some_and(|intent| {
                intent.gateway_reference.is_none() && intent.created_at < grace_cutoff
            });
            if !unacknowledged {
                continue;
            }
            match self.recover_reference(order.id()).await {
                Ok(Some(reference)) => match self.requery(&reference).await {
                    Ok(CallbackOutcome::Applied { .. }) => report.reconciled += 1,
                    Ok(CallbackOutcome::Conflict { .. }) => report.conflicts += 1,
                    Ok(CallbackOutcome::Duplicate) => {}
                    Err(err) => {
                        report.failures += 1;
                        tracing::warn!(order_id = %order.id(), reference = %reference, error = %err, "sweep re-query failed");
                    }
                },
                Ok(None) => {}
                Err(err) => {
                    report.failures += 1;
                    tracing::warn!(order_id = %order.id(), error = %err, "sweep reference recovery failed");
                }
            }
        }

        let overdue = self
            .store
            .pending_created_before(now - self.config.order_ttl())
            .await?;
        for order in overdue {
            match self.expire_order(order.id()).await {
                Ok(true) => report.expired += 1,
                Ok(false) => {}
                Err(err) => {
                    report.failures += 1;
                    tracing::warn!(order_id = %order.id(), error = %err, "sweep expiry failed");
                }
            }
        }

        metrics::record_sweep(started.elapsed());
        tracing::info!(
            reconciled = report.reconciled,
            expired = report.expired,
            conflicts = report.conflicts,
            failures = report.failures,
            "reconciliation sweep completed"
        );
        Ok(report)
    }

    /// Runs sweeps forever at the configured interval. The first pass runs
    /// one interval after startup.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(err) = self.run_sweep().await {
                tracing::error!(error = %err, "reconciliation sweep pass failed");
            }
        }
    }

    /// Re-queries the gateway for a reference and applies the verdict.
    async fn requery(&self, reference: &GatewayRef) -> Result<CallbackOutcome, CheckoutError> {
        let started = Instant::now();
        let status = self.gateway.query_transaction(reference).await?;
        metrics::record_gateway_call("query_transaction", started.elapsed());
        let Some(reported) = status.as_intent_status() else {
            let raw = match status {
                GatewayTransactionStatus::Unrecognized(raw) => raw,
                _ => String::new(),
            };
            let alert = OperatorAlert::UnrecognizedGatewayStatus {
                reference: reference.clone(),
                raw,
            };
            self.alert(alert.clone()).await;
            return Ok(CallbackOutcome::Conflict { alert });
        };
        self.apply_status(reference, reported, TriggeredBy::ReconciliationSweep)
            .await
    }

    /// Recovers the gateway reference for an active attempt whose create
    /// call never got an answer. Re-presenting the stored idempotency key is
    /// safe: a well-behaved gateway returns the existing transaction instead
    /// of charging again. Returns `None` when the order no longer has an
    /// attempt to recover.
    async fn recover_reference(
        &self,
        order_id: OrderId,
    ) -> Result<Option<GatewayRef>, CheckoutError> {
        let Some(order) = self.store.load(order_id).await? else {
            return Ok(None);
        };
        if order.status() != OrderStatus::PendingPayment {
            return Ok(None);
        }
        let Some(intent) = order.active_intent() else {
            return Ok(None);
        };
        // A concurrent pay retry may have recorded the reference already.
        if let Some(existing) = &intent.gateway_reference {
            return Ok(Some(existing.clone()));
        }
        let (intent_id, key, amount) = (intent.id, intent.idempotency_key.clone(), intent.amount);
        let metadata = TransactionMetadata {
            order_id: order.id(),
            user_id: order.user_id(),
            description: format!("cinema order, {} movie(s)", order.items().len()),
        };

        let policy = RetryPolicy::with_max_retries(self.config.max_version_retries);
        let started = Instant::now();
        let reference = retry_if(
            &policy,
            || self.gateway.create_transaction(&key, amount, &metadata),
            is_transient,
        )
        .await?;
        metrics::record_gateway_call("create_transaction", started.elapsed());
        tracing::info!(order_id = %order_id, reference = %reference, "recovered gateway reference for an unacknowledged attempt");

        let result = retry_if(
            &policy,
            || {
                let reference = reference.clone();
                async move {
                    let mut order = self
                        .store
                        .load(order_id)
                        .await?
                        .ok_or(CheckoutError::OrderNotFound { order: order_id })?;
                    let expected = order.version();
                    order.record_gateway_reference(intent_id, reference)?;
                    self.store.update(&order, expected).await?;
                    Ok(())
                }
            },
            is_version_conflict,
        )
        .await;
        match result {
            Ok(()) => Ok(Some(reference)),
            Err(CheckoutError::SettlementConflict { order, detail }) => {
                // The attempt picked up a different reference while we were
                // recovering: the gateway broke its idempotency contract.
                metrics::record_settlement_conflict();
                let err = CheckoutError::SettlementConflict {
                    order,
                    detail: detail.clone(),
                };
                self.alert(OperatorAlert::SettlementConflict {
                    order_id: order,
                    detail,
                })
                .await;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Expires one order. Returns `false` when the order can not be expired
    /// yet (payment in flight) or already closed.
    async fn expire_order(&self, order_id: OrderId) -> Result<bool, CheckoutError> {
        let policy = RetryPolicy::with_max_retries(self.config.max_version_retries);
        let result = retry_if(
            &policy,
            || async move {
                let mut order = self
                    .store
                    .load(order_id)
                    .await?
                    .ok_or(CheckoutError::OrderNotFound { order: order_id })?;
                let expected = order.version();
                let events = order.expire(TriggeredBy::ReconciliationSweep, self.clock.now())?;
                self.store.update(&order, expected).await?;
                Ok(events)
            },
            is_version_conflict,
        )
        .await;
        match result {
            Ok(events) => {
                metrics::record_order("expired");
                for event in events {
                    if let Err(err) = self.publisher.publish(event).await {
                        tracing::error!(order_id = %order_id, error = %err, "failed to publish domain event");
                    }
                }
                Ok(true)
            }
            // Authorized attempt in flight, or a webhook closed the order
            // first. Both resolve without expiry.
            Err(
                CheckoutError::PaymentInFlight { .. }
                | CheckoutError::OrderClosed { .. }
                | CheckoutError::OrderNotFound { .. },
            ) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn alert(&self, alert: OperatorAlert) {
        if let Err(err) = self.publisher.alert(alert).await {
            tracing::error!(error = %err, "failed to deliver operator alert");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifier_accepts_its_own_signature() {
        let verifier = WebhookVerifier::new("secret");
        let payload = r#"{"reference":"gw-1","status":"settled"}"#;
        let signature = verifier.sign(payload);
        assert!(verifier.verify(&signature, payload));
    }

    #[test]
    fn verifier_rejects_tampered_payloads_and_wrong_secrets() {
        let verifier = WebhookVerifier::new("secret");
        let signature = verifier.sign("payload");
        assert!(!verifier.verify(&signature, "payload2"));
        assert!(!verifier.verify("deadbeef", "payload"));
        let other = WebhookVerifier::new("other-secret");
        assert!(!other.verify(&signature, "payload"));
    }
}
