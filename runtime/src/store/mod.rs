//! Order store implementations.
//!
//! [`memory::InMemoryOrderStore`] backs tests and the demo binary;
//! [`postgres::PostgresOrderStore`] is the production store. Both enforce
//! the same per-order version compare-and-swap contract.

pub mod memory;
pub mod postgres;

pub use memory::InMemoryOrderStore;
pub use postgres::PostgresOrderStore;
