//! Spot book / MetaDEx (spec §4.4). Arena of offers with a price-ordered secondary
//! index, per the design note in spec §9 ("cyclic graphs -> arenas"): never hold a
//! reference into the book across a mutation point, always go through `OfferId`.

use std::collections::BTreeMap;

use crate::activation::{features, ActivationState};
use crate::errors::TxError;
use crate::primitives::{Address, AssetId, Price};
use crate::tally::{Bucket, TallyLedger};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OfferId(pub u64);

#[derive(Debug, Clone)]
pub struct Offer {
    pub id: OfferId,
    pub maker_address: Address,
    pub property_for_sale: AssetId,
    pub property_desired: AssetId,
    pub amount_for_sale: i64,
    pub amount_desired: i64,
    pub amount_remaining: i64,
    pub unit_price: Price,
    pub block: u32,
    pub tx_index: u32,
    pub txid: String,
}

/// Key used for the price-level ordered set: `(unit_price, block, tx_index)` enforces
/// the "deterministic FIFO" invariant within a level (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct LevelKey {
    price: Price,
    block: u32,
    tx_index: u32,
}

#[derive(Default)]
pub struct SpotBook {
    // property_for_sale -> ordered set of offer ids by (price, block, tx_index)
    books: BTreeMap<AssetId, BTreeMap<LevelKey, OfferId>>,
    offers: BTreeMap<OfferId, Offer>,
    next_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeStatus {
    Open,
    OpenPartFilled,
    Filled,
    CancelledPartFilled,
    Cancelled,
    Invalid,
}

/// One matched fill produced while inserting a new order; the caller (the block
/// pipeline) is responsible for recording it via `DbTradeList`.
#[derive(Debug, Clone)]
pub struct Fill {
    pub maker: Address,
    pub maker_offer_id: OfferId,
    pub n_could_buy: i64,
    pub n_would_pay: i64,
    pub fee: i64,
}

pub struct InsertOutcome {
    pub fills: Vec<Fill>,
    pub residual_offer_id: Option<OfferId>,
}

impl SpotBook {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc_id(&mut self) -> OfferId {
        self.next_id += 1;
        OfferId(self.next_id)
    }

    pub fn offer(&self, id: OfferId) -> Option<&Offer> {
        self.offers.get(&id)
    }

    fn level_key(offer: &Offer) -> LevelKey {
        LevelKey { price: offer.unit_price, block: offer.block, tx_index: offer.tx_index }
    }

    fn remove_offer(&mut self, id: OfferId) -> Option<Offer> {
        let offer = self.offers.remove(&id)?;
        if let Some(levels) = self.books.get_mut(&offer.property_for_sale) {
            levels.remove(&Self::level_key(&offer));
            if levels.is_empty() {
                self.books.remove(&offer.property_for_sale);
            }
        }
        Some(offer)
    }

    fn insert_into_book(&mut self, offer: Offer) -> Result<OfferId, TxError> {
        let id = offer.id;
        let key = Self::level_key(&offer);
        let levels = self.books.entry(offer.property_for_sale).or_default();
        if levels.contains_key(&key) {
            // spec §3: duplicate (block, tx_index) collisions at a level are a
            // protocol invariant violation.
            return Err(TxError::Conflict);
        }
        levels.insert(key, id);
        self.offers.insert(id, offer);
        Ok(id)
    }

    /// Matching candidates for a new order desiring `property_desired`: offers whose
    /// `property_for_sale == property_desired`, scanned ascending by price (spec §4.4.1
    /// step 2).
    fn candidate_ids_ascending(&self, property_desired: AssetId) -> Vec<OfferId> {
        match self.books.get(&property_desired) {
            Some(levels) => levels.values().copied().collect(),
            None => Vec::new(),
        }
    }

    /// Inserts a new spot trade order and matches it against the book (spec §4.4.1).
    #[allow(clippy::too_many_arguments)]
    pub fn insert_trade(
        &mut self,
        ledger: &mut TallyLedger,
        activation: &ActivationState,
        maker_address: Address,
        property_for_sale: AssetId,
        amount_for_sale: i64,
        property_desired: AssetId,
        amount_desired: i64,
        block: u32,
        tx_index: u32,
        txid: String,
    ) -> Result<InsertOutcome, TxError> {
        if property_for_sale == property_desired {
            return Err(TxError::BadParameter);
        }
        if amount_for_sale <= 0 || amount_for_sale >= crate::primitives::MAX_AMOUNT || amount_desired <= 0 {
            return Err(TxError::BadParameter);
        }

        let unit_price = Price::from_amounts(amount_desired, amount_for_sale).ok_or(TxError::BadParameter)?;
        if !unit_price.is_positive() {
            return Err(TxError::BadParameter);
        }
        let inverse_price = unit_price.inverse().ok_or(TxError::BadParameter)?;

        let mut sp = ledger.save_point();
        if !sp.update(&maker_address, property_for_sale, -amount_for_sale, Bucket::Balance) {
            return Err(TxError::InsufficientFunds);
        }
        if !sp.update(&maker_address, property_for_sale, amount_for_sale, Bucket::MetaDexReserve) {
            return Err(TxError::InsufficientFunds);
        }

        // Tracked in `property_for_sale` units throughout: `n_would_pay` below (what the
        // new order actually hands the maker per fill) is denominated the same way, so
        // subtracting it directly tells us how much of the new order's sale side is left.
        let mut remaining_new = amount_for_sale as i128;
        let mut fills = Vec::new();
        let fee_active = activation.is_active(features::METADEX_FEES);

        for maker_id in self.candidate_ids_ascending(property_desired) {
            if remaining_new <= 0 {
                break;
            }
            let maker = match self.offers.get(&maker_id) {
                Some(o) => o.clone(),
                None => continue,
            };
            if maker.property_desired != property_for_sale {
                continue;
            }
            if maker.unit_price > inverse_price {
                // price levels are scanned ascending; once a level's price exceeds the
                // new order's max acceptable inverse, every later level does too.
                break;
            }

            let n_could_buy = match maker.unit_price.floor_quote(remaining_new) {
                Some(v) if v > 0 => v.min(maker.amount_remaining as i128),
                _ => continue,
            };
            if n_could_buy <= 0 {
                continue;
            }
            let n_would_pay = match maker.unit_price.ceil_cost(n_could_buy) {
                Some(v) => v,
                None => continue,
            };
            let effective_price = Price::new(n_would_pay, n_could_buy).ok_or(TxError::BadParameter)?;
            if effective_price > inverse_price {
                continue;
            }

            let n_could_buy_amt = n_could_buy as i64;
            let n_would_pay_amt = n_would_pay as i64;

            let fee = if fee_active && !property_desired.is_native() && !property_for_sale.is_native() {
                n_could_buy_amt / 2000
            } else {
                0
            };

            // Four tally updates, all-or-nothing under the save-point (spec §4.4.1
            // step 2's "commit four tally updates").
            let ok = sp.update(&maker.maker_address, property_for_sale, n_would_pay_amt, Bucket::Balance)
                && sp.update(&maker_address, property_for_sale, -n_would_pay_amt, Bucket::MetaDexReserve)
                && sp.update(&maker.maker_address, property_desired, -n_could_buy_amt, Bucket::MetaDexReserve)
                && sp.update(&maker_address, property_desired, n_could_buy_amt - fee, Bucket::Balance);
            if !ok {
                return Err(TxError::InsufficientFunds);
            }
            fills.push(Fill { maker: maker.maker_address.clone(), maker_offer_id: maker_id, n_could_buy: n_could_buy_amt, n_would_pay: n_would_pay_amt, fee });

            remaining_new -= n_would_pay;

            let new_remaining = maker.amount_remaining - n_could_buy_amt;
            if new_remaining <= 0 {
                self.remove_offer(maker_id);
            } else {
                if let Some(o) = self.offers.get_mut(&maker_id) {
                    o.amount_remaining = new_remaining;
                }
            }
        }

        let residual_offer_id = if remaining_new > 0 {
            let residual_for_sale = remaining_new as i64;
            let id = self.alloc_id();
            let offer = Offer {
                id,
                maker_address: maker_address.clone(),
                property_for_sale,
                property_desired,
                amount_for_sale,
                amount_desired,
                amount_remaining: residual_for_sale,
                unit_price,
                block,
                tx_index,
                txid: txid.clone(),
            };
            Some(self.insert_into_book(offer)?)
        } else {
            None
        };

        sp.commit();
        Ok(InsertOutcome { fills, residual_offer_id })
    }

    fn cancel_matching(&mut self, ledger: &mut TallyLedger, predicate: impl Fn(&Offer) -> bool) -> Vec<Offer> {
        let ids: Vec<OfferId> =
            self.offers.iter().filter(|(_, o)| predicate(o)).map(|(id, _)| *id).collect();
        let mut cancelled = Vec::new();
        let mut sp = ledger.save_point();
        for id in ids {
            if let Some(offer) = self.remove_offer(id) {
                sp.update(&offer.maker_address, offer.property_for_sale, offer.amount_remaining, Bucket::Balance);
                sp.update(&offer.maker_address, offer.property_for_sale, -offer.amount_remaining, Bucket::MetaDexReserve);
                cancelled.push(offer);
            }
        }
        sp.commit();
        cancelled
    }

    pub fn cancel_at_price(&mut self, ledger: &mut TallyLedger, sender: &Address, property_for_sale: AssetId, property_desired: AssetId, unit_price: Price) -> Vec<Offer> {
        self.cancel_matching(ledger, |o| {
            o.maker_address == *sender
                && o.property_for_sale == property_for_sale
                && o.property_desired == property_desired
                && o.unit_price == unit_price
        })
    }

    pub fn cancel_pair(&mut self, ledger: &mut TallyLedger, sender: &Address, property_for_sale: AssetId, property_desired: AssetId) -> Vec<Offer> {
        self.cancel_matching(ledger, |o| {
            o.maker_address == *sender && o.property_for_sale == property_for_sale && o.property_desired == property_desired
        })
    }

    pub fn cancel_ecosystem(&mut self, ledger: &mut TallyLedger, sender: &Address, threshold: u32, main_ecosystem: bool) -> Vec<Offer> {
        self.cancel_matching(ledger, |o| {
            o.maker_address == *sender
                && (o.property_for_sale.0 >= threshold) == main_ecosystem
        })
    }

    pub fn shutdown_non_native(&mut self, ledger: &mut TallyLedger) -> Vec<Offer> {
        self.cancel_matching(ledger, |o| !o.property_for_sale.is_native() && !o.property_desired.is_native())
    }

    pub fn shutdown_all(&mut self, ledger: &mut TallyLedger) -> Vec<Offer> {
        self.cancel_matching(ledger, |_| true)
    }

    pub fn reserve_for_address(&self, address: &Address, property_for_sale: AssetId) -> i64 {
        self.offers
            .values()
            .filter(|o| o.maker_address == *address && o.property_for_sale == property_for_sale)
            .map(|o| o.amount_remaining)
            .sum()
    }

    pub fn open_offers_for_property(&self, property_for_sale: AssetId) -> Vec<&Offer> {
        match self.books.get(&property_for_sale) {
            Some(levels) => levels.values().filter_map(|id| self.offers.get(id)).collect(),
            None => Vec::new(),
        }
    }

    pub fn iter_for_hash(&self) -> impl Iterator<Item = &Offer> {
        self.offers.values()
    }
}

pub fn trade_status(open: bool, total_sold: i64, amount_for_sale: i64, valid: Option<bool>) -> TradeStatus {
    match valid {
        Some(false) => {
            if total_sold > 0 {
                TradeStatus::CancelledPartFilled
            } else {
                TradeStatus::Cancelled
            }
        }
        None => TradeStatus::Invalid,
        Some(true) => {
            if open {
                if total_sold > 0 {
                    TradeStatus::OpenPartFilled
                } else {
                    TradeStatus::Open
                }
            } else if total_sold >= amount_for_sale {
                TradeStatus::Filled
            } else {
                TradeStatus::CancelledPartFilled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::ActivationState;

    fn addr(s: &str) -> Address {
        Address(s.to_owned())
    }

    #[test]
    fn e2_matching_trade() {
        let mut ledger = TallyLedger::new();
        let mut book = SpotBook::new();
        let activation = ActivationState::new();

        {
            let mut sp = ledger.save_point();
            sp.update(&addr("mallory"), AssetId(5), 100_00, Bucket::Balance);
            sp.update(&addr("taro"), AssetId(7), 200_00, Bucket::Balance);
            sp.commit();
        }

        // Mallory sells 100 of 5 for 200 of 7 at block 1000 idx 2.
        let out = book
            .insert_trade(&mut ledger, &activation, addr("mallory"), AssetId(5), 100_00, AssetId(7), 200_00, 1000, 2, "mallory-tx".into())
            .unwrap();
        assert!(out.fills.is_empty());
        assert!(out.residual_offer_id.is_some());

        // Taro sells 200 of 7 for 100 of 5 at block 1001 idx 1 -> matches Mallory fully.
        let out = book
            .insert_trade(&mut ledger, &activation, addr("taro"), AssetId(7), 200_00, AssetId(5), 100_00, 1001, 1, "taro-tx".into())
            .unwrap();
        assert_eq!(out.fills.len(), 1);
        assert!(out.residual_offer_id.is_none());

        assert_eq!(ledger.balance(&addr("mallory"), AssetId(7), Bucket::Balance), 200_00);
        assert_eq!(ledger.balance(&addr("taro"), AssetId(5), Bucket::Balance), 100_00);
        assert_eq!(ledger.balance(&addr("mallory"), AssetId(5), Bucket::MetaDexReserve), 0);
        assert_eq!(ledger.balance(&addr("taro"), AssetId(7), Bucket::MetaDexReserve), 0);
    }

    #[test]
    fn e3_rounding_favors_maker() {
        let mut ledger = TallyLedger::new();
        let mut book = SpotBook::new();
        let activation = ActivationState::new();
        {
            let mut sp = ledger.save_point();
            sp.update(&addr("maker"), AssetId(1), 3, Bucket::Balance);
            sp.update(&addr("taker"), AssetId(2), 10, Bucket::Balance);
            sp.commit();
        }
        book.insert_trade(&mut ledger, &activation, addr("maker"), AssetId(1), 3, AssetId(2), 10, 10, 0, "m".into()).unwrap();
        let out = book
            .insert_trade(&mut ledger, &activation, addr("taker"), AssetId(2), 10, AssetId(1), 3, 11, 0, "t".into())
            .unwrap();
        assert_eq!(out.fills.len(), 1);
        let fill = &out.fills[0];
        assert_eq!(fill.n_could_buy, 3);
        assert_eq!(fill.n_would_pay, 10);
        assert!(out.residual_offer_id.is_none());
    }

    #[test]
    fn rejects_identical_properties() {
        let mut ledger = TallyLedger::new();
        let mut book = SpotBook::new();
        let activation = ActivationState::new();
        let err = book
            .insert_trade(&mut ledger, &activation, addr("a"), AssetId(5), 10, AssetId(5), 10, 1, 0, "x".into())
            .unwrap_err();
        assert_eq!(err, TxError::BadParameter);
    }
}
