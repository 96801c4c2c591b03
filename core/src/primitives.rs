//! Fixed-point amounts, rational prices, asset ids and the opaque address type.
//!
//! Grounded on the teacher's habit (e.g. `cf-amm`-adjacent arithmetic in the pack, and
//! the teacher's own `UtxoId`/`AggKey` newtypes in `engine/src/btc`) of wrapping raw
//! integers in single-field structs rather than passing `i64`/`u32` around bare.

use std::cmp::Ordering;
use std::fmt;

/// A token quantity in its asset's smallest unit. Spec §3: signed 64-bit, non-negative
/// except as an intermediate delta, capped at `2^63 - 1`.
pub type Amount = i64;

pub const MAX_AMOUNT: Amount = i64::MAX;

/// 32-bit asset identifier (spec §3). IDs below `ECOSYSTEM_RESERVED` are protocol
/// constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct AssetId(pub u32);

impl AssetId {
    pub const NATIVE: AssetId = AssetId(0);
    pub const MAIN_ECOSYSTEM: AssetId = AssetId(1);
    pub const TEST_ECOSYSTEM: AssetId = AssetId(2);

    /// IDs at or above this threshold are ecosystem-allocated, not protocol constants.
    pub const RESERVED_THRESHOLD: u32 = 3;

    pub fn is_native(self) -> bool {
        self == Self::NATIVE
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Ecosystem {
    Main,
    Test,
}

/// Opaque base-chain address, treated as an opaque key (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct Address(pub String);

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Address(s.to_owned())
    }
}

/// A rational price `num/den`, both checked 128-bit. Constructed from
/// `(amount_desired, amount_for_sale)`; never truncated to floating point (spec §3).
#[derive(Debug, Clone, Copy)]
pub struct Price {
    pub num: i128,
    pub den: i128,
}

impl Price {
    pub fn new(num: i128, den: i128) -> Option<Self> {
        if den == 0 {
            return None;
        }
        Some(Price { num, den })
    }

    pub fn from_amounts(amount_desired: Amount, amount_for_sale: Amount) -> Option<Self> {
        Price::new(amount_desired as i128, amount_for_sale as i128)
    }

    /// `den/num` — the price from the other side of the same trade.
    pub fn inverse(self) -> Option<Self> {
        Price::new(self.den, self.num)
    }

    pub fn is_positive(self) -> bool {
        // den is always > 0 by construction (checked at `new`), so sign follows num.
        self.num > 0
    }

    /// Largest whole units of the "for sale" side obtainable for `units` of the
    /// "desired" side at this price, rounded down: `floor(units * den / num)`.
    pub fn floor_quote(self, units: i128) -> Option<i128> {
        checked_mul_div_floor(units, self.den, self.num)
    }

    /// `ceil(units * num / den)` — used when computing what the taker owes the maker,
    /// which always rounds in the maker's favor (spec §4.4.1).
    pub fn ceil_cost(self, units: i128) -> Option<i128> {
        checked_mul_div_ceil(units, self.num, self.den)
    }
}

impl PartialOrd for Price {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Price {
    fn cmp(&self, other: &Self) -> Ordering {
        // a/b vs c/d via a*d vs c*b; both denominators are positive by construction.
        let lhs = self.num.checked_mul(other.den).expect("price cross-multiply overflow");
        let rhs = other.num.checked_mul(self.den).expect("price cross-multiply overflow");
        lhs.cmp(&rhs)
    }
}

impl PartialEq for Price {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for Price {}

/// `floor(a * b / c)` computed in 256-bit-safe fashion by staying in `i128` with
/// checked ops; spec's design notes ask for 256-bit intermediates to avoid overflow,
/// `i128` suffices for the 64-bit amounts / reasonable prices this engine handles.
pub fn checked_mul_div_floor(a: i128, b: i128, c: i128) -> Option<i128> {
    if c == 0 {
        return None;
    }
    let num = a.checked_mul(b)?;
    Some(num.div_euclid(c))
}

/// `ceil(a * b / c)`.
pub fn checked_mul_div_ceil(a: i128, b: i128, c: i128) -> Option<i128> {
    if c == 0 {
        return None;
    }
    let num = a.checked_mul(b)?;
    let floor = num.div_euclid(c);
    if num.rem_euclid(c) == 0 {
        Some(floor)
    } else {
        Some(floor + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_ordering_by_cross_multiplication() {
        let cheap = Price::from_amounts(10, 5).unwrap(); // 2/1
        let expensive = Price::from_amounts(30, 5).unwrap(); // 6/1
        assert!(cheap < expensive);
    }

    #[test]
    fn rounding_matches_spec_e3() {
        // Maker offers 3 A for 10 B -> unit_price = 10/3.
        let maker_price = Price::from_amounts(10, 3).unwrap();
        // Taker can buy floor(10 * 3 / 10) = 3.
        let n_could_buy = maker_price.floor_quote(10).unwrap();
        assert_eq!(n_could_buy, 3);
        let n_would_pay = maker_price.ceil_cost(n_could_buy).unwrap();
        assert_eq!(n_would_pay, 10);
    }

    #[test]
    fn inverse_price_round_trips() {
        let p = Price::from_amounts(200, 100).unwrap();
        let inv = p.inverse().unwrap();
        assert_eq!(inv.num, 100);
        assert_eq!(inv.den, 200);
    }
}
