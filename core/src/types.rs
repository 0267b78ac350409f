//! Domain types for the cinema checkout pipeline.
//!
//! Value objects and identifiers shared by the cart, order, and payment
//! modules. Identifiers are UUID newtypes; money is integer minor units with
//! an explicit currency code and checked arithmetic only.

use crate::error::CheckoutError;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for a user (cart owner, order owner).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(Uuid);

impl UserId {
    /// Creates a new random `UserId`.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `UserId` from a `Uuid`.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a purchasable movie in the catalog.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MovieId(Uuid);

impl MovieId {
    /// Creates a new random `MovieId`.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `MovieId` from a `Uuid`.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MovieId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MovieId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for an order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderId(Uuid);

impl OrderId {
    /// Creates a new random `OrderId`.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create an `OrderId` from a `Uuid`.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for OrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a payment intent (one attempt at charging an order).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaymentIntentId(Uuid);

impl PaymentIntentId {
    /// Creates a new random `PaymentIntentId`.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `PaymentIntentId` from a `Uuid`.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for PaymentIntentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PaymentIntentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// External transaction identifier assigned by the payment gateway.
///
/// Unique across all intents once assigned. The gateway-side transaction is
/// owned externally; this is only a reference to it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GatewayRef(String);

impl GatewayRef {
    /// Wraps a gateway-assigned transaction id.
    #[must_use]
    pub const fn new(reference: String) -> Self {
        Self(reference)
    }

    /// The reference as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GatewayRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for GatewayRef {
    fn from(reference: &str) -> Self {
        Self(reference.to_string())
    }
}

// ============================================================================
// Money Value Object (minor units + currency, no floating point)
// ============================================================================

/// Currency code for a monetary amount.
///
/// The catalog prices everything in one currency per market; mixing
/// currencies in arithmetic or comparison is a validation error, never a
/// silent conversion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Currency {
    /// United States dollar (minor unit: cent).
    Usd,
    /// Euro (minor unit: cent).
    Eur,
    /// Pound sterling (minor unit: penny).
    Gbp,
}

impl Currency {
    /// ISO 4217 alphabetic code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Usd => "USD",
            Self::Eur => "EUR",
            Self::Gbp => "GBP",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Monetary amount in integer minor units (cents) with a currency code.
///
/// Never represented as binary floating point. All arithmetic is checked:
/// overflow and currency mismatch surface as [`CheckoutError`] values rather
/// than panics or wrapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    minor_units: u64,
    currency: Currency,
}

impl Money {
    /// Creates a `Money` value from minor units (cents).
    #[must_use]
    pub const fn from_minor_units(minor_units: u64, currency: Currency) -> Self {
        Self {
            minor_units,
            currency,
        }
    }

    /// A zero amount in the given currency.
    #[must_use]
    pub const fn zero(currency: Currency) -> Self {
        Self::from_minor_units(0, currency)
    }

    /// The amount in minor units.
    #[must_use]
    pub const fn minor_units(&self) -> u64 {
        self.minor_units
    }

    /// The currency of this amount.
    #[must_use]
    pub const fn currency(&self) -> Currency {
        self.currency
    }

    /// Whether the amount is zero.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.minor_units == 0
    }

    /// Adds two amounts of the same currency.
    ///
    /// # Errors
    ///
    /// Returns [`CheckoutError::CurrencyMismatch`] if the currencies differ
    /// and [`CheckoutError::AmountOverflow`] if the sum does not fit in
    /// `u64` minor units.
    pub fn checked_add(self, other: Self) -> Result<Self, CheckoutError> {
        if self.currency != other.currency {
            return Err(CheckoutError::CurrencyMismatch {
                left: self.currency,
                right: other.currency,
            });
        }
        let minor_units = self
            .minor_units
            .checked_add(other.minor_units)
            .ok_or(CheckoutError::AmountOverflow)?;
        Ok(Self {
            minor_units,
            currency: self.currency,
        })
    }

    /// Multiplies the amount by a quantity.
    ///
    /// # Errors
    ///
    /// Returns [`CheckoutError::AmountOverflow`] if the product does not fit
    /// in `u64` minor units.
    pub fn checked_mul(self, quantity: u32) -> Result<Self, CheckoutError> {
        let minor_units = self
            .minor_units
            .checked_mul(u64::from(quantity))
            .ok_or(CheckoutError::AmountOverflow)?;
        Ok(Self {
            minor_units,
            currency: self.currency,
        })
    }

}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:02} {}",
            self.minor_units / 100,
            self.minor_units % 100,
            self.currency
        )
    }
}

// ============================================================================
// Cart line item
// ============================================================================

/// A line in a cart: a movie with its price snapshotted at add time.
///
/// Digital goods are owned at most once, so `quantity` is always 1 for
/// movies; the field exists because the order total is still computed as
/// `unit_price * quantity` and the cart validates the invariant at add time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    /// The purchasable movie this line refers to.
    pub movie_id: MovieId,
    /// Unit price snapshotted when the item was added.
    pub unit_price: Money,
    /// Number of units, `>= 1`.
    pub quantity: u32,
}

impl CartItem {
    /// The line subtotal (`unit_price * quantity`).
    ///
    /// # Errors
    ///
    /// Returns [`CheckoutError::AmountOverflow`] if the subtotal does not fit
    /// in `u64` minor units.
    pub fn subtotal(&self) -> Result<Money, CheckoutError> {
        self.unit_price.checked_mul(self.quantity)
    }
}
