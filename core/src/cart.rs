//! Cart aggregate.
//!
//! A cart is owned by exactly one user and holds at most one line per movie
//! (digital goods are owned once). It is mutated by add/remove/clear and
//! destroyed on successful checkout. Identity of a line is the referenced
//! movie; insertion order is irrelevant.

use crate::error::CheckoutError;
use crate::types::{CartItem, Money, MovieId, UserId};
use serde::{Deserialize, Serialize};

/// A user's shopping cart prior to order creation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Cart {
    user_id: UserId,
    items: Vec<CartItem>,
}

/// Notice emitted by [`Cart::snapshot`] when a catalog price changed since
/// the item was added. Not an error: the client is expected to re-confirm
/// the refreshed price before checking out.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceChanged {
    /// The movie whose price moved.
    pub movie_id: MovieId,
    /// Price snapshotted when the item was added.
    pub previous: Money,
    /// Current catalog price now carried by the snapshot.
    pub current: Money,
}

/// Immutable list of cart items produced at checkout time.
///
/// Prices in the snapshot are re-validated against the catalog, so an order
/// created from it is never affected by later catalog price changes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CartSnapshot {
    items: Vec<CartItem>,
}

impl CartSnapshot {
    /// The snapshotted items.
    #[must_use]
    pub fn items(&self) -> &[CartItem] {
        &self.items
    }

    /// Whether the snapshot holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Sum of line subtotals.
    ///
    /// # Errors
    ///
    /// Returns [`CheckoutError::AmountOverflow`] or
    /// [`CheckoutError::CurrencyMismatch`] if the items cannot be summed.
    pub fn total(&self) -> Result<Money, CheckoutError> {
        let mut iter = self.items.iter();
        let first = match iter.next() {
            Some(item) => item.subtotal()?,
            None => return Err(CheckoutError::EmptyCart),
        };
        iter.try_fold(first, |acc, item| acc.checked_add(item.subtotal()?))
    }
}

impl Cart {
    /// Creates an empty cart for the given user.
    #[must_use]
    pub const fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            items: Vec::new(),
        }
    }

    /// The owning user.
    #[must_use]
    pub const fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Current items, in insertion order.
    #[must_use]
    pub fn items(&self) -> &[CartItem] {
        &self.items
    }

    /// Whether the cart holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Adds a movie with its current catalog price.
    ///
    /// Movies are digital goods owned at most once, so the only valid
    /// quantity is 1. The ownership check against paid orders happens in the
    /// service layer, which rejects with [`CheckoutError::AlreadyOwned`]
    /// before this is called.
    ///
    /// # Errors
    ///
    /// Returns [`CheckoutError::InvalidQuantity`] for any quantity other
    /// than 1 and [`CheckoutError::AlreadyInCart`] if the movie already has
    /// a line.
    pub fn add_item(
        &mut self,
        movie_id: MovieId,
        unit_price: Money,
        quantity: u32,
    ) -> Result<(), CheckoutError> {
        if quantity != 1 {
            return Err(CheckoutError::InvalidQuantity { quantity });
        }
        if self.items.iter().any(|item| item.movie_id == movie_id) {
            return Err(CheckoutError::AlreadyInCart { movie: movie_id });
        }
        self.items.push(CartItem {
            movie_id,
            unit_price,
            quantity,
        });
        Ok(())
    }

    /// Removes the line for a movie. Returns `true` if a line was removed.
    pub fn remove_item(&mut self, movie_id: MovieId) -> bool {
        let before = self.items.len();
        self.items.retain(|item| item.movie_id != movie_id);
        self.items.len() != before
    }

    /// Removes all items.
    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Produces the immutable checkout snapshot, re-validating each price
    /// against the catalog.
    ///
    /// `current_price` is the catalog lookup; `None` means the catalog has
    /// no fresher price and the add-time snapshot stands. Each refreshed
    /// price is reported as a [`PriceChanged`] notice so the client can
    /// re-confirm before checkout.
    pub fn snapshot<F>(&self, current_price: F) -> (CartSnapshot, Vec<PriceChanged>)
    where
        F: Fn(MovieId) -> Option<Money>,
    {
        let mut notices = Vec::new();
        let items = self
            .items
            .iter()
            .map(|item| {
                let mut item = item.clone();
                if let Some(price) = current_price(item.movie_id) {
                    if price != item.unit_price {
                        notices.push(PriceChanged {
                            movie_id: item.movie_id,
                            previous: item.unit_price,
                            current: price,
                        });
                        item.unit_price = price;
                    }
                }
                item
            })
            .collect();
        (CartSnapshot { items }, notices)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::Currency;

    fn usd(minor: u64) -> Money {
        Money::from_minor_units(minor, Currency::Usd)
    }

    #[test]
    fn add_and_remove_items() {
        let mut cart = Cart::new(UserId::new());
        let movie = MovieId::new();

        cart.add_item(movie, usd(1000), 1).unwrap();
        assert_eq!(cart.items().len(), 1);

        assert!(cart.remove_item(movie));
        assert!(cart.is_empty());
        assert!(!cart.remove_item(movie));
    }

    #[test]
    fn rejects_quantity_other_than_one() {
        let mut cart = Cart::new(UserId::new());
        let err = cart.add_item(MovieId::new(), usd(1000), 0).unwrap_err();
        assert_eq!(err, CheckoutError::InvalidQuantity { quantity: 0 });

        let err = cart.add_item(MovieId::new(), usd(1000), 2).unwrap_err();
        assert_eq!(err, CheckoutError::InvalidQuantity { quantity: 2 });
    }

    #[test]
    fn rejects_duplicate_movie() {
        let mut cart = Cart::new(UserId::new());
        let movie = MovieId::new();
        cart.add_item(movie, usd(1000), 1).unwrap();

        let err = cart.add_item(movie, usd(1000), 1).unwrap_err();
        assert_eq!(err, CheckoutError::AlreadyInCart { movie });
    }

    #[test]
    fn snapshot_totals_line_items() {
        let mut cart = Cart::new(UserId::new());
        cart.add_item(MovieId::new(), usd(1000), 1).unwrap();
        cart.add_item(MovieId::new(), usd(500), 1).unwrap();

        let (snapshot, notices) = cart.snapshot(|_| None);
        assert!(notices.is_empty());
        assert_eq!(snapshot.total().unwrap(), usd(1500));
    }

    #[test]
    fn snapshot_refreshes_stale_prices_with_notice() {
        let mut cart = Cart::new(UserId::new());
        let movie = MovieId::new();
        cart.add_item(movie, usd(1000), 1).unwrap();

        let (snapshot, notices) = cart.snapshot(|id| (id == movie).then(|| usd(1200)));

        assert_eq!(
            notices,
            vec![PriceChanged {
                movie_id: movie,
                previous: usd(1000),
                current: usd(1200),
            }]
        );
        assert_eq!(snapshot.total().unwrap(), usd(1200));
        // The cart itself still carries the add-time price.
        assert_eq!(cart.items()[0].unit_price, usd(1000));
    }

    #[test]
    fn empty_snapshot_has_no_total() {
        let cart = Cart::new(UserId::new());
        let (snapshot, _) = cart.snapshot(|_| None);
        assert_eq!(snapshot.total().unwrap_err(), CheckoutError::EmptyCart);
    }
}
