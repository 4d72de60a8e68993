//! Identifiers and amount types.
//!
//! Money and tokens are integer minor units and percentages are basis points,
//! so every split is exact and any remainder is an explicit value.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tuneshare_core::stream::AggregateId;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID.
            #[must_use]
            pub const fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// The inner UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            /// Aggregate identifier used for events about this entity.
            #[must_use]
            pub fn aggregate_id(&self) -> AggregateId {
                AggregateId::prefixed($prefix, self.0)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Reward pool identifier.
    PoolId,
    "reward_pool"
);
uuid_id!(
    /// Token reservation identifier.
    ReservationId,
    "reservation"
);
uuid_id!(
    /// Listen session identifier.
    SessionId,
    "listen_session"
);
uuid_id!(
    /// Listener or shareholder identifier.
    UserId,
    "user"
);
uuid_id!(
    /// Song identifier.
    SongId,
    "song"
);
uuid_id!(
    /// Artist identifier.
    ArtistId,
    "artist"
);
uuid_id!(
    /// Ownership contract identifier.
    ContractId,
    "ownership_contract"
);
uuid_id!(
    /// Revenue distribution identifier.
    DistributionId,
    "distribution"
);
uuid_id!(
    /// Payment batch identifier.
    BatchId,
    "payment_batch"
);
uuid_id!(
    /// Payment item identifier, unique within its batch.
    PaymentId,
    "payment"
);

/// Money amount in minor units (cents).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Money(u64);

impl Money {
    /// No money.
    pub const ZERO: Self = Self(0);

    /// Amount from minor units.
    #[must_use]
    pub const fn from_cents(cents: u64) -> Self {
        Self(cents)
    }

    /// Amount from whole major units.
    #[must_use]
    pub const fn from_dollars(dollars: u64) -> Self {
        Self(dollars.saturating_mul(100))
    }

    /// Minor units.
    #[must_use]
    pub const fn cents(self) -> u64 {
        self.0
    }

    /// Whether the amount is zero.
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// `self + other`, `None` on overflow.
    #[must_use]
    pub const fn checked_add(self, other: Self) -> Option<Self> {
        match self.0.checked_add(other.0) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// `self - other`, `None` if it would go negative.
    #[must_use]
    pub const fn checked_sub(self, other: Self) -> Option<Self> {
        match self.0.checked_sub(other.0) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// `floor(self × numerator / denominator)` computed without overflow.
    /// Returns zero when `denominator` is zero.
    #[must_use]
    pub fn mul_ratio(self, numerator: u64, denominator: u64) -> Self {
        if denominator == 0 {
            return Self::ZERO;
        }
        let scaled = u128::from(self.0) * u128::from(numerator) / u128::from(denominator);
        Self(u64::try_from(scaled).unwrap_or(u64::MAX))
    }

    /// `floor(self × bps / 10000)`.
    #[must_use]
    pub fn share(self, bps: BasisPoints) -> Self {
        self.mul_ratio(u64::from(bps.value()), u64::from(BasisPoints::MAX))
    }

    /// Sum of amounts, `None` on overflow.
    pub fn checked_sum<I: IntoIterator<Item = Self>>(amounts: I) -> Option<Self> {
        amounts
            .into_iter()
            .try_fold(Self::ZERO, |acc, m| acc.checked_add(m))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

/// Reward token amount in indivisible token units.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tokens(u64);

impl Tokens {
    /// No tokens.
    pub const ZERO: Self = Self(0);

    /// Units per whole token.
    pub const UNITS_PER_TOKEN: u64 = 1_000;

    /// Amount in token units.
    #[must_use]
    pub const fn new(units: u64) -> Self {
        Self(units)
    }

    /// Amount in whole tokens.
    #[must_use]
    pub const fn whole(tokens: u64) -> Self {
        Self(tokens.saturating_mul(Self::UNITS_PER_TOKEN))
    }

    /// Token units.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Whether the amount is zero.
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// `self + other`, `None` on overflow.
    #[must_use]
    pub const fn checked_add(self, other: Self) -> Option<Self> {
        match self.0.checked_add(other.0) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// `self - other`, `None` if it would go negative.
    #[must_use]
    pub const fn checked_sub(self, other: Self) -> Option<Self> {
        match self.0.checked_sub(other.0) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// `self - other`, floored at zero.
    #[must_use]
    pub const fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    /// `floor(self × bps / 10000)`; multipliers above 100% are allowed.
    #[must_use]
    pub fn scale(self, bps: u32) -> Self {
        let scaled = u128::from(self.0) * u128::from(bps) / u128::from(BasisPoints::MAX);
        Self(u64::try_from(scaled).unwrap_or(u64::MAX))
    }
}

impl fmt::Display for Tokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} units", self.0)
    }
}

/// A percentage in basis points (1 bp = 0.01%), between 0 and 100%.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BasisPoints(u32);

impl BasisPoints {
    /// 100%.
    pub const MAX: u32 = 10_000;

    /// 0%.
    pub const ZERO: Self = Self(0);

    /// 100%.
    pub const FULL: Self = Self(Self::MAX);

    /// `bps` basis points, `None` above 100%.
    #[must_use]
    pub const fn new(bps: u32) -> Option<Self> {
        if bps > Self::MAX { None } else { Some(Self(bps)) }
    }

    /// Whole percent, `None` above 100.
    #[must_use]
    pub const fn percent(percent: u32) -> Option<Self> {
        if percent > 100 {
            None
        } else {
            Some(Self(percent * 100))
        }
    }

    /// Raw basis points.
    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }

    /// `100% - self`.
    #[must_use]
    pub const fn complement(self) -> Self {
        Self(Self::MAX - self.0)
    }

    /// `self + other`, `None` above 100%.
    #[must_use]
    pub const fn checked_add(self, other: Self) -> Option<Self> {
        Self::new(self.0 + other.0)
    }

    /// Basis points held by `part` out of `whole`, floored. Zero when `whole` is zero.
    #[must_use]
    pub fn ratio(part: u64, whole: u64) -> Self {
        if whole == 0 {
            return Self::ZERO;
        }
        let bps = u128::from(part.min(whole)) * u128::from(Self::MAX) / u128::from(whole);
        Self(u32::try_from(bps).unwrap_or(Self::MAX))
    }
}

impl fmt::Display for BasisPoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}%", self.0 / 100, self.0 % 100)
    }
}

/// Settlement currency of a payment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Currency {
    /// US dollar.
    Usd,
    /// Euro.
    Eur,
    /// Pound sterling.
    Gbp,
    /// Platform reward token.
    Vibes,
}

impl Currency {
    /// ISO-style code.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Usd => "USD",
            Self::Eur => "EUR",
            Self::Gbp => "GBP",
            Self::Vibes => "VIBES",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Currency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "USD" => Ok(Self::Usd),
            "EUR" => Ok(Self::Eur),
            "GBP" => Ok(Self::Gbp),
            "VIBES" => Ok(Self::Vibes),
            other => Err(format!("unsupported currency: {other}")),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn money_display_and_arithmetic() {
        let m = Money::from_cents(12_345);
        assert_eq!(m.to_string(), "123.45");
        assert_eq!(Money::from_dollars(2).cents(), 200);
        assert_eq!(m.checked_sub(Money::from_cents(12_346)), None);
        assert_eq!(
            Money::checked_sum([Money::from_cents(1), Money::from_cents(2)]),
            Some(Money::from_cents(3))
        );
    }

    #[test]
    fn money_share_floors() {
        let pct = BasisPoints::new(3_333).unwrap();
        assert_eq!(Money::from_cents(100).share(pct), Money::from_cents(33));
        assert_eq!(Money::from_cents(7).mul_ratio(1, 3), Money::from_cents(2));
        assert_eq!(Money::from_cents(7).mul_ratio(1, 0), Money::ZERO);
        assert_eq!(
            Money::from_cents(u64::MAX).mul_ratio(10, 10),
            Money::from_cents(u64::MAX)
        );
    }

    #[test]
    fn basis_points_bounds() {
        assert!(BasisPoints::new(10_001).is_none());
        assert_eq!(BasisPoints::percent(20).unwrap().value(), 2_000);
        assert!(BasisPoints::percent(101).is_none());
        assert_eq!(BasisPoints::percent(30).unwrap().complement().value(), 7_000);
        assert!(
            BasisPoints::percent(60)
                .unwrap()
                .checked_add(BasisPoints::percent(50).unwrap())
                .is_none()
        );
        assert_eq!(BasisPoints::ratio(30, 100).value(), 3_000);
        assert_eq!(BasisPoints::ratio(1, 0), BasisPoints::ZERO);
        assert_eq!(BasisPoints::new(1_250).unwrap().to_string(), "12.50%");
    }

    #[test]
    fn tokens_scale_supports_multipliers_above_one() {
        assert_eq!(Tokens::new(100).scale(15_000), Tokens::new(150));
        assert_eq!(Tokens::new(3).scale(5_000), Tokens::new(1));
        assert_eq!(Tokens::whole(2).value(), 2_000);
        assert_eq!(Tokens::new(5).saturating_sub(Tokens::new(9)), Tokens::ZERO);
    }

    #[test]
    fn ids_map_to_prefixed_aggregates() {
        let id = PoolId::new();
        assert_eq!(
            id.aggregate_id().as_str(),
            format!("reward_pool-{}", id.as_uuid())
        );
    }

    #[test]
    fn currency_codes() {
        assert_eq!("usd".parse::<Currency>().unwrap(), Currency::Usd);
        assert_eq!(Currency::Vibes.to_string(), "VIBES");
        assert!("XYZ".parse::<Currency>().is_err());
    }
}
