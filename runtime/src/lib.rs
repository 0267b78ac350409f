//! Runtime services for the cinema checkout pipeline.
//!
//! [`service::CheckoutService`] drives carts and orders,
//! [`reconciler::Reconciler`] applies gateway verdicts and runs the
//! periodic sweep, and [`store`] provides the order stores. Collaborators
//! are injected through the trait ports defined in `cinema-core`.

pub mod config;
pub mod metrics;
pub mod reconciler;
pub mod retry;
pub mod service;
pub mod store;

pub use config::Config;
pub use reconciler::{Reconciler, SweepReport, WebhookVerifier};
pub use service::CheckoutService;
pub use store::{InMemoryOrderStore, PostgresOrderStore};
