//! Fractional ownership contracts.
//!
//! A contract splits a song into `total_shares`. The artist retains a
//! percentage; the rest may be sold. Ownership percentages are derived from
//! shares held rather than stored, so they can never drift from the share count.
//!
//! Sold shares can change hands later with [`OwnershipContract::transfer_shares`].
//! Every trade, primary or secondary, re-marks each holding at the trade's
//! price per share.

use crate::error::{LedgerError, Result};
use crate::types::{ArtistId, BasisPoints, ContractId, Money, SongId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One shareholder's position.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holding {
    /// Shares held.
    pub shares: u64,
    /// Total paid for the shares still held.
    pub purchase_price: Money,
    /// The shares valued at the contract's latest trade price.
    #[serde(default)]
    pub current_market_value: Money,
    /// Last trade touching this holding.
    pub updated_at: DateTime<Utc>,
}

/// Ownership contract for one song.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipContract {
    /// Contract.
    pub id: ContractId,
    /// Song.
    pub song_id: SongId,
    /// Artist.
    pub artist_id: ArtistId,
    /// Shares the song is split into.
    pub total_shares: u64,
    /// Percentage the artist keeps.
    pub artist_retained: BasisPoints,
    /// `floor(total_shares × (100% − retained))`.
    pub shares_available_for_sale: u64,
    /// Shares sold so far.
    pub shares_sold: u64,
    /// Positions by holder.
    pub holdings: BTreeMap<UserId, Holding>,
    /// When the contract was created.
    pub created_at: DateTime<Utc>,
}

impl OwnershipContract {
    /// New contract with nothing sold.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidAmount`] if `total_shares` is zero.
    pub fn new(
        id: ContractId,
        song_id: SongId,
        artist_id: ArtistId,
        total_shares: u64,
        artist_retained: BasisPoints,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        if total_shares == 0 {
            return Err(LedgerError::InvalidAmount(
                "contract must have at least one share".into(),
            ));
        }
        Ok(Self {
            id,
            song_id,
            artist_id,
            total_shares,
            artist_retained,
            shares_available_for_sale: Self::sellable(total_shares, artist_retained),
            shares_sold: 0,
            holdings: BTreeMap::new(),
            created_at: now,
        })
    }

    /// Shares the artist does not retain.
    #[must_use]
    pub fn sellable(total_shares: u64, artist_retained: BasisPoints) -> u64 {
        let sellable = u128::from(total_shares) * u128::from(artist_retained.complement().value())
            / u128::from(BasisPoints::MAX);
        u64::try_from(sellable).unwrap_or(total_shares)
    }

    /// Shares still for sale.
    #[must_use]
    pub const fn shares_remaining(&self) -> u64 {
        self.shares_available_for_sale.saturating_sub(self.shares_sold)
    }

    /// Sell `shares` to `holder` for `price`.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidAmount`] for zero shares or more than remain for sale.
    pub fn purchase_shares(
        &mut self,
        holder: UserId,
        shares: u64,
        price: Money,
        now: DateTime<Utc>,
    ) -> Result<&Holding> {
        if shares == 0 {
            return Err(LedgerError::InvalidAmount("share purchase must be positive".into()));
        }
        if shares > self.shares_remaining() {
            return Err(LedgerError::InvalidAmount(format!(
                "contract {} has {} shares left for sale, {shares} requested",
                self.id,
                self.shares_remaining()
            )));
        }

        let paid = self
            .holdings
            .get(&holder)
            .map_or(Money::ZERO, |h| h.purchase_price)
            .checked_add(price)
            .ok_or_else(|| LedgerError::InvalidAmount("purchase price overflow".into()))?;

        self.shares_sold += shares;
        let holding = self.holdings.entry(holder).or_insert(Holding {
            shares: 0,
            purchase_price: Money::ZERO,
            current_market_value: Money::ZERO,
            updated_at: now,
        });
        holding.shares += shares;
        holding.purchase_price = paid;
        holding.updated_at = now;
        self.mark_to_market(price, shares);
        Ok(&self.holdings[&holder])
    }

    /// Move `shares` from `seller` to `buyer`, who pays `price` for them.
    ///
    /// Shares sold and for sale are unchanged; only who holds them moves. The
    /// seller's cost basis shrinks in proportion to the shares given up, and a
    /// seller left with nothing is removed.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidAmount`] for zero shares, a transfer to oneself or
    /// more shares than the seller holds; [`LedgerError::NotFound`] when the
    /// seller holds nothing in this contract.
    pub fn transfer_shares(
        &mut self,
        seller: UserId,
        buyer: UserId,
        shares: u64,
        price: Money,
        now: DateTime<Utc>,
    ) -> Result<&Holding> {
        if shares == 0 {
            return Err(LedgerError::InvalidAmount("share transfer must be positive".into()));
        }
        if seller == buyer {
            return Err(LedgerError::InvalidAmount(format!(
                "holder {seller} cannot transfer shares to itself"
            )));
        }
        let held = self
            .holdings
            .get(&seller)
            .ok_or_else(|| LedgerError::NotFound {
                entity: "holding",
                id: format!("{}/{seller}", self.id),
            })?;
        if shares > held.shares {
            return Err(LedgerError::InvalidAmount(format!(
                "holder {seller} has {} shares of contract {}, {shares} requested",
                held.shares, self.id
            )));
        }
        let paid = self
            .holdings
            .get(&buyer)
            .map_or(Money::ZERO, |h| h.purchase_price)
            .checked_add(price)
            .ok_or_else(|| LedgerError::InvalidAmount("purchase price overflow".into()))?;

        let remaining = held.shares - shares;
        if remaining == 0 {
            self.holdings.remove(&seller);
        } else if let Some(holding) = self.holdings.get_mut(&seller) {
            holding.purchase_price = holding.purchase_price.mul_ratio(remaining, holding.shares);
            holding.shares = remaining;
            holding.updated_at = now;
        }

        let holding = self.holdings.entry(buyer).or_insert(Holding {
            shares: 0,
            purchase_price: Money::ZERO,
            current_market_value: Money::ZERO,
            updated_at: now,
        });
        holding.shares += shares;
        holding.purchase_price = paid;
        holding.updated_at = now;
        self.mark_to_market(price, shares);
        Ok(&self.holdings[&buyer])
    }

    /// Value every holding at `price` for `shares`, floored per holding.
    fn mark_to_market(&mut self, price: Money, shares: u64) {
        for holding in self.holdings.values_mut() {
            holding.current_market_value = price.mul_ratio(holding.shares, shares);
        }
    }

    /// Percentage of the song `holder` owns, floored.
    #[must_use]
    pub fn ownership(&self, holder: &UserId) -> BasisPoints {
        self.holdings
            .get(holder)
            .map_or(BasisPoints::ZERO, |h| BasisPoints::ratio(h.shares, self.total_shares))
    }

    /// Frozen `(holder, shares)` list in holder order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(UserId, u64)> {
        self.holdings
            .iter()
            .filter(|(_, h)| h.shares > 0)
            .map(|(holder, h)| (*holder, h.shares))
            .collect()
    }

    /// Check the share accounting.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvariantViolation`] when the counters disagree.
    pub fn validate(&self) -> Result<()> {
        let expected = Self::sellable(self.total_shares, self.artist_retained);
        if self.shares_available_for_sale != expected {
            return Err(LedgerError::InvariantViolation(format!(
                "contract {} offers {} shares for sale, expected {expected}",
                self.id, self.shares_available_for_sale
            )));
        }
        if self.shares_sold > self.shares_available_for_sale {
            return Err(LedgerError::InvariantViolation(format!(
                "contract {} oversold: {} of {}",
                self.id, self.shares_sold, self.shares_available_for_sale
            )));
        }
        let held: u64 = self.holdings.values().map(|h| h.shares).sum();
        if held != self.shares_sold {
            return Err(LedgerError::InvariantViolation(format!(
                "contract {} holdings sum to {held}, {} recorded sold",
                self.id, self.shares_sold
            )));
        }
        Ok(())
    }
}
