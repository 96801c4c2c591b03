//! Derivatives book / ContractDEx (spec §4.5): price-ladder matching, position
//! netting, margin sweep, and oracle-contract transitions.

use std::collections::BTreeMap;

use crate::errors::TxError;
use crate::primitives::{Address, AssetId};
use crate::registry::{ContractParams, PropertyRegistry};
use crate::tally::{Bucket, TallyLedger};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContractOfferId(pub u64);

#[derive(Debug, Clone)]
pub struct ContractOffer {
    pub id: ContractOfferId,
    pub maker_address: Address,
    pub contract_id: AssetId,
    pub side: Side,
    pub amount_for_sale: i64,
    pub amount_remaining: i64,
    pub effective_price: u64,
    pub leverage: u64,
    pub block: u32,
    pub tx_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionStatus {
    OpenLongPosition,
    OpenShortPosition,
    LongPosIncreased,
    ShortPosIncreased,
    LongPosNetted,
    LongPosNettedPartly,
    ShortPosNetted,
    ShortPosNettedPartly,
    OpenLongPosByShortPosNetted,
    OpenShortPosByLongPosNetted,
}

#[derive(Debug, Clone, Copy)]
pub struct SubEvent {
    pub status: PositionStatus,
    pub n_could_buy: i64,
    pub lives: i64,
}

/// Decomposes a party's side of a fill into up to two sub-events (spec §4.5.1 step 2):
/// a netting event against the opposite bucket, then (if the fill overruns what was
/// open) an opening event in the new direction.
fn decompose(pre_long: i64, pre_short: i64, delta_long: i64) -> Vec<SubEvent> {
    // delta_long > 0 means this party's position moves toward long by that amount
    // (a buy fill); delta_long < 0 means toward short (a sell fill).
    let mut events = Vec::new();
    if delta_long > 0 {
        if pre_short > 0 {
            let netted = delta_long.min(pre_short);
            let lives = pre_short - netted;
            let status = if lives == 0 { PositionStatus::ShortPosNetted } else { PositionStatus::ShortPosNettedPartly };
            events.push(SubEvent { status, n_could_buy: netted, lives });
            let remainder = delta_long - netted;
            if remainder > 0 {
                let status = if pre_long > 0 { PositionStatus::LongPosIncreased } else { PositionStatus::OpenLongPosByShortPosNetted };
                events.push(SubEvent { status, n_could_buy: remainder, lives: pre_long + remainder });
            }
        } else if pre_long > 0 {
            events.push(SubEvent { status: PositionStatus::LongPosIncreased, n_could_buy: delta_long, lives: pre_long + delta_long });
        } else {
            events.push(SubEvent { status: PositionStatus::OpenLongPosition, n_could_buy: delta_long, lives: delta_long });
        }
    } else if delta_long < 0 {
        let delta_short = -delta_long;
        if pre_long > 0 {
            let netted = delta_short.min(pre_long);
            let lives = pre_long - netted;
            let status = if lives == 0 { PositionStatus::LongPosNetted } else { PositionStatus::LongPosNettedPartly };
            events.push(SubEvent { status, n_could_buy: netted, lives });
            let remainder = delta_short - netted;
            if remainder > 0 {
                let status = if pre_short > 0 { PositionStatus::ShortPosIncreased } else { PositionStatus::OpenShortPosByLongPosNetted };
                events.push(SubEvent { status, n_could_buy: remainder, lives: pre_short + remainder });
            }
        } else if pre_short > 0 {
            events.push(SubEvent { status: PositionStatus::ShortPosIncreased, n_could_buy: delta_short, lives: pre_short + delta_short });
        } else {
            events.push(SubEvent { status: PositionStatus::OpenShortPosition, n_could_buy: delta_short, lives: delta_short });
        }
    }
    events
}

/// Rolling VWAP/TWAP accumulator state for one contract (spec §4.5.1 steps 3-4).
#[derive(Default, Clone)]
pub struct ContractStats {
    pub amount_times_price: Vec<i128>,
    pub volume: Vec<i128>,
    pub volume_to_vwap: usize,
    pub twap_block_buffer: Vec<u64>,
    pub twap_history: Vec<u64>,
    pub last_market_price: Option<u64>,
}

impl ContractStats {
    pub fn new(volume_to_vwap: usize) -> Self {
        ContractStats { volume_to_vwap: volume_to_vwap.max(1), ..Default::default() }
    }

    pub fn record_fill(&mut self, effective_price: u64, notional_size: u32, n_could_buy: i64) {
        let volume = (notional_size as i128) * (n_could_buy as i128);
        self.amount_times_price.push((effective_price as i128) * volume);
        self.volume.push(volume);
        let cap = self.volume_to_vwap;
        if self.amount_times_price.len() > cap {
            let excess = self.amount_times_price.len() - cap;
            self.amount_times_price.drain(0..excess);
            self.volume.drain(0..excess);
        }
        self.last_market_price = Some(effective_price);
        self.twap_block_buffer.push(effective_price);
    }

    pub fn vwap(&self) -> Option<u64> {
        let num: i128 = self.amount_times_price.iter().sum();
        let den: i128 = self.volume.iter().sum();
        if den == 0 {
            None
        } else {
            Some((num / den) as u64)
        }
    }

    /// Reduces the block-local price buffer to one TWAP sample (spec §4.5.1 step 4:
    /// `(first + min + max + last) / 4`) and appends it to history.
    pub fn roll_twap(&mut self) {
        if self.twap_block_buffer.is_empty() {
            return;
        }
        let first = self.twap_block_buffer[0];
        let last = *self.twap_block_buffer.last().unwrap();
        let min = *self.twap_block_buffer.iter().min().unwrap();
        let max = *self.twap_block_buffer.iter().max().unwrap();
        let sample = (first + min + max + last) / 4;
        self.twap_history.push(sample);
        self.twap_block_buffer.clear();
    }
}

#[derive(Debug, Clone)]
pub struct Fill {
    pub maker: Address,
    pub maker_offer_id: ContractOfferId,
    pub n_could_buy: i64,
    pub effective_price: u64,
    pub taker_events: Vec<SubEvent>,
    pub maker_events: Vec<SubEvent>,
}

#[derive(Default)]
pub struct ContractBook {
    // contract_id -> effective_price -> ordered set of offer ids by (block, tx_index)
    books: BTreeMap<AssetId, BTreeMap<u64, BTreeMap<(u32, u32), ContractOfferId>>>,
    offers: BTreeMap<ContractOfferId, ContractOffer>,
    next_id: u64,
    pub stats: BTreeMap<AssetId, ContractStats>,
    // Volume-weighted average entry price per open position, cleared once a position
    // nets back to zero. Not part of the consensus-hash commitment (spec §4.8 commits
    // only the tally/book/registry/activation/freeze/fee state); margin sweep (spec
    // §4.5.4) needs it to compute UPNL against the contract's last market price.
    entry_price: BTreeMap<(Address, AssetId), (u64, i64)>,
}

impl ContractBook {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc_id(&mut self) -> ContractOfferId {
        self.next_id += 1;
        ContractOfferId(self.next_id)
    }

    pub fn offer(&self, id: ContractOfferId) -> Option<&ContractOffer> {
        self.offers.get(&id)
    }

    fn remove_offer(&mut self, id: ContractOfferId) -> Option<ContractOffer> {
        let offer = self.offers.remove(&id)?;
        if let Some(levels) = self.books.get_mut(&offer.contract_id) {
            if let Some(level) = levels.get_mut(&offer.effective_price) {
                level.remove(&(offer.block, offer.tx_index));
                if level.is_empty() {
                    levels.remove(&offer.effective_price);
                }
            }
        }
        Some(offer)
    }

    fn insert_into_book(&mut self, offer: ContractOffer) -> Result<ContractOfferId, TxError> {
        let id = offer.id;
        let levels = self.books.entry(offer.contract_id).or_default();
        let level = levels.entry(offer.effective_price).or_default();
        if level.contains_key(&(offer.block, offer.tx_index)) {
            return Err(TxError::Conflict);
        }
        level.insert((offer.block, offer.tx_index), id);
        self.offers.insert(id, offer);
        Ok(id)
    }

    fn reserve_required(amount: i64, margin_requirement: u32, leverage: u64) -> Option<i64> {
        if leverage == 0 {
            return None;
        }
        let reserve = (amount as i128) * (margin_requirement as i128) / (leverage as i128);
        i64::try_from(reserve).ok()
    }

    fn candidate_ids(&self, contract_id: AssetId, side: Side, effective_price: u64) -> Vec<ContractOfferId> {
        let levels = match self.books.get(&contract_id) {
            Some(l) => l,
            None => return Vec::new(),
        };
        let mut out = Vec::new();
        match side {
            // Buyer scans ascending prices up to their limit.
            Side::Buy => {
                for (_price, level) in levels.range(..=effective_price) {
                    out.extend(level.values().copied());
                }
            }
            // Seller scans descending prices down to their limit.
            Side::Sell => {
                for (_price, level) in levels.range(effective_price..).rev() {
                    out.extend(level.values().copied());
                }
            }
        }
        out
    }

    #[allow(clippy::too_many_arguments)]
    pub fn insert_trade(
        &mut self,
        ledger: &mut TallyLedger,
        contract_id: AssetId,
        params: &ContractParams,
        maker_address: Address,
        side: Side,
        amount: i64,
        effective_price: u64,
        leverage: u64,
        block: u32,
        tx_index: u32,
    ) -> Result<Vec<Fill>, TxError> {
        if amount <= 0 || effective_price == 0 {
            return Err(TxError::BadParameter);
        }
        let reserve = Self::reserve_required(amount, params.margin_requirement, leverage).ok_or(TxError::BadParameter)?;

        let mut sp = ledger.save_point();
        if !sp.update(&maker_address, params.collateral_asset, -reserve, Bucket::Balance) {
            return Err(TxError::InsufficientFunds);
        }
        if !sp.update(&maker_address, params.collateral_asset, reserve, Bucket::ContractMargin) {
            return Err(TxError::InsufficientFunds);
        }

        let mut remaining = amount;
        let mut fills = Vec::new();
        let notional_size = params.notional_size;

        for maker_id in self.candidate_ids(contract_id, side, effective_price) {
            if remaining <= 0 {
                break;
            }
            let maker = match self.offers.get(&maker_id) {
                Some(o) => o.clone(),
                None => continue,
            };
            if maker.side == side || maker.maker_address == maker_address || maker.amount_remaining <= 0 {
                continue;
            }
            let n_could_buy = remaining.min(maker.amount_remaining);
            if n_could_buy <= 0 {
                continue;
            }

            let taker_pos_long = sp.balance(&maker_address, contract_id, Bucket::PositivePosition);
            let taker_pos_short = sp.balance(&maker_address, contract_id, Bucket::NegativePosition);
            let maker_pos_long = sp.balance(&maker.maker_address, contract_id, Bucket::PositivePosition);
            let maker_pos_short = sp.balance(&maker.maker_address, contract_id, Bucket::NegativePosition);

            let taker_delta_long = if side == Side::Buy { n_could_buy } else { -n_could_buy };
            let maker_delta_long = -taker_delta_long;

            let taker_events = decompose(taker_pos_long, taker_pos_short, taker_delta_long);
            let maker_events = decompose(maker_pos_long, maker_pos_short, maker_delta_long);

            if !apply_events(&mut sp, &maker_address, contract_id, &taker_events) {
                return Err(TxError::InsufficientFunds);
            }
            if !apply_events(&mut sp, &maker.maker_address, contract_id, &maker_events) {
                return Err(TxError::InsufficientFunds);
            }

            let stats = self.stats.entry(contract_id).or_insert_with(|| ContractStats::new(20));
            stats.record_fill(maker.effective_price, notional_size, n_could_buy);

            self.update_entry_price(&maker_address, contract_id, &taker_events, maker.effective_price);
            self.update_entry_price(&maker.maker_address, contract_id, &maker_events, maker.effective_price);

            fills.push(Fill {
                maker: maker.maker_address.clone(),
                maker_offer_id: maker_id,
                n_could_buy,
                effective_price: maker.effective_price,
                taker_events,
                maker_events,
            });

            remaining -= n_could_buy;
            let new_remaining = maker.amount_remaining - n_could_buy;
            if new_remaining <= 0 {
                self.remove_offer(maker_id);
            } else if let Some(o) = self.offers.get_mut(&maker_id) {
                o.amount_remaining = new_remaining;
            }
        }

        if remaining > 0 {
            let id = self.alloc_id();
            let offer = ContractOffer {
                id,
                maker_address,
                contract_id,
                side,
                amount_for_sale: amount,
                amount_remaining: remaining,
                effective_price,
                leverage,
                block,
                tx_index,
            };
            self.insert_into_book(offer)?;
        }

        sp.commit();
        Ok(fills)
    }

    pub fn best_edge(&self, contract_id: AssetId, side: Side) -> Option<u64> {
        let levels = self.books.get(&contract_id)?;
        // spec §9 open question: the sell-side branch of AddMarketPrice queries the
        // BUY-side edge orderbook (best bid) rather than SELL (best ask). Preserved
        // here rather than "fixed": `side` passed in is the edge being queried, chosen
        // by the caller exactly as the legacy behavior does.
        match side {
            Side::Buy => levels.keys().next().copied(),
            Side::Sell => levels.keys().next_back().copied(),
        }
    }

    fn cancel_matching(&mut self, ledger: &mut TallyLedger, params: &ContractParams, predicate: impl Fn(&ContractOffer) -> bool) -> Vec<ContractOffer> {
        let ids: Vec<ContractOfferId> = self.offers.iter().filter(|(_, o)| predicate(o)).map(|(id, _)| *id).collect();
        let mut cancelled = Vec::new();
        let mut sp = ledger.save_point();
        for id in ids {
            if let Some(offer) = self.remove_offer(id) {
                let released = Self::reserve_required(offer.amount_remaining, params.margin_requirement, offer.leverage).unwrap_or(0);
                if released > 0 {
                    sp.update(&offer.maker_address, params.collateral_asset, -released, Bucket::ContractMargin);
                    sp.update(&offer.maker_address, params.collateral_asset, released, Bucket::Balance);
                }
                cancelled.push(offer);
            }
        }
        sp.commit();
        cancelled
    }

    pub fn cancel_first_open(&mut self, ledger: &mut TallyLedger, params: &ContractParams, sender: &Address, contract_id: AssetId) -> Option<ContractOffer> {
        let id = self
            .offers
            .values()
            .filter(|o| o.maker_address == *sender && o.contract_id == contract_id)
            .min_by_key(|o| (o.block, o.tx_index))
            .map(|o| o.id)?;
        self.cancel_matching(ledger, params, |o| o.id == id).into_iter().next()
    }

    pub fn cancel_all_for_contract(&mut self, ledger: &mut TallyLedger, params: &ContractParams, sender: &Address, contract_id: AssetId) -> Vec<ContractOffer> {
        self.cancel_matching(ledger, params, |o| o.maker_address == *sender && o.contract_id == contract_id)
    }

    pub fn cancel_by_block_and_index(&mut self, ledger: &mut TallyLedger, params: &ContractParams, sender: &Address, block: u32, tx_index: u32) -> Vec<ContractOffer> {
        self.cancel_matching(ledger, params, |o| o.maker_address == *sender && o.block == block && o.tx_index == tx_index)
    }

    pub fn open_offers(&self, contract_id: AssetId) -> Vec<&ContractOffer> {
        self.offers.values().filter(|o| o.contract_id == contract_id).collect()
    }

    pub fn last_market_price(&self, contract_id: AssetId) -> Option<u64> {
        self.stats.get(&contract_id).and_then(|s| s.last_market_price)
    }

    pub fn iter_for_hash(&self) -> impl Iterator<Item = &ContractOffer> {
        self.offers.values()
    }

    /// Volume-weighted average entry price of `address`'s currently open position in
    /// `contract_id`, if any (spec §4.5.4 margin sweep needs this against the last
    /// market price to compute UPNL).
    pub fn entry_price(&self, address: &Address, contract_id: AssetId) -> Option<u64> {
        self.entry_price.get(&(address.clone(), contract_id)).map(|(avg, _)| *avg)
    }

    /// Updates the volume-weighted entry price for one party's side of a fill, keyed
    /// off the sub-events `decompose` already produced for them.
    fn update_entry_price(&mut self, address: &Address, contract_id: AssetId, events: &[SubEvent], fill_price: u64) {
        for ev in events {
            let key = (address.clone(), contract_id);
            match ev.status {
                PositionStatus::OpenLongPosition
                | PositionStatus::OpenShortPosition
                | PositionStatus::OpenLongPosByShortPosNetted
                | PositionStatus::OpenShortPosByLongPosNetted => {
                    self.entry_price.insert(key, (fill_price, ev.lives));
                }
                PositionStatus::LongPosIncreased | PositionStatus::ShortPosIncreased => {
                    let prior_size = (ev.lives - ev.n_could_buy).max(0);
                    let new_size = ev.lives.max(0);
                    let prior_avg = self.entry_price.get(&key).map(|(avg, _)| *avg).unwrap_or(fill_price);
                    let avg = if new_size == 0 {
                        fill_price
                    } else {
                        let weighted = (prior_avg as i128) * (prior_size as i128) + (fill_price as i128) * (ev.n_could_buy as i128);
                        (weighted / (new_size as i128)) as u64
                    };
                    self.entry_price.insert(key, (avg, new_size));
                }
                PositionStatus::LongPosNetted | PositionStatus::ShortPosNetted => {
                    self.entry_price.remove(&key);
                }
                PositionStatus::LongPosNettedPartly | PositionStatus::ShortPosNettedPartly => {
                    if let Some(entry) = self.entry_price.get_mut(&key) {
                        entry.1 = ev.lives;
                    }
                }
            }
        }
    }
}

fn apply_events(sp: &mut crate::tally::SavePoint<'_>, address: &Address, contract_id: AssetId, events: &[SubEvent]) -> bool {
    for ev in events {
        let (dec_bucket, inc_bucket) = match ev.status {
            PositionStatus::ShortPosNetted
            | PositionStatus::ShortPosNettedPartly
            | PositionStatus::OpenLongPosByShortPosNetted => (Bucket::NegativePosition, Bucket::PositivePosition),
            PositionStatus::LongPosNetted | PositionStatus::LongPosNettedPartly | PositionStatus::OpenShortPosByLongPosNetted => {
                (Bucket::PositivePosition, Bucket::NegativePosition)
            }
            PositionStatus::LongPosIncreased | PositionStatus::OpenLongPosition => (Bucket::NegativePosition, Bucket::PositivePosition),
            PositionStatus::ShortPosIncreased | PositionStatus::OpenShortPosition => (Bucket::PositivePosition, Bucket::NegativePosition),
        };
        let netted = match ev.status {
            PositionStatus::ShortPosNetted | PositionStatus::ShortPosNettedPartly => ev.n_could_buy,
            PositionStatus::LongPosNetted | PositionStatus::LongPosNettedPartly => ev.n_could_buy,
            _ => 0,
        };
        if netted > 0 && !sp.update(address, contract_id, -netted, dec_bucket) {
            return false;
        }
        let opened = match ev.status {
            PositionStatus::OpenLongPosByShortPosNetted
            | PositionStatus::OpenShortPosByLongPosNetted
            | PositionStatus::LongPosIncreased
            | PositionStatus::ShortPosIncreased
            | PositionStatus::OpenLongPosition
            | PositionStatus::OpenShortPosition => ev.n_could_buy,
            _ => 0,
        };
        if opened > 0 && !sp.update(address, contract_id, opened, inc_bucket) {
            return false;
        }
    }
    true
}

/// Margin sweep (spec §4.5.4). `market_price` is the contract's latest market price;
/// `liquidation_factor`/`warning_factor` are the governance-style thresholds (0.8/0.2).
pub struct SweepOutcome {
    pub liquidate: bool,
    pub warn: bool,
}

pub fn evaluate_margin(
    position: i64,
    margin_requirement: u32,
    init_margin: i64,
    market_price: u64,
    entry_price: u64,
    liquidation_factor: f64,
    warning_factor: f64,
) -> SweepOutcome {
    if init_margin <= 0 {
        return SweepOutcome { liquidate: false, warn: false };
    }
    let upnl = (position as i128) * (market_price as i128 - entry_price as i128);
    let ratio = -(upnl as f64) / (init_margin as f64);
    SweepOutcome { liquidate: ratio >= liquidation_factor, warn: ratio >= warning_factor && ratio < liquidation_factor }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ContractParams {
        ContractParams {
            notional_size: 1,
            margin_requirement: 10_00,
            collateral_asset: AssetId(31),
            blocks_until_expiration: 100_000,
            init_block: 0,
            oracle_high: 0,
            oracle_low: 0,
            oracle_last_update_block: 0,
            backup_address: None,
        }
    }

    fn addr(s: &str) -> Address {
        Address(s.to_owned())
    }

    #[test]
    fn opens_opposite_positions_on_match() {
        let mut ledger = TallyLedger::new();
        let mut book = ContractBook::new();
        let p = params();
        {
            let mut sp = ledger.save_point();
            sp.update(&addr("alice"), p.collateral_asset, 1_000_00, Bucket::Balance);
            sp.update(&addr("bob"), p.collateral_asset, 1_000_00, Bucket::Balance);
            sp.commit();
        }
        book.insert_trade(&mut ledger, AssetId(99), &p, addr("alice"), Side::Buy, 10, 100, 1, 10, 0).unwrap();
        let fills = book.insert_trade(&mut ledger, AssetId(99), &p, addr("bob"), Side::Sell, 10, 100, 1, 11, 0).unwrap();
        assert_eq!(fills.len(), 1);
        assert_eq!(ledger.balance(&addr("alice"), AssetId(99), Bucket::PositivePosition), 10);
        assert_eq!(ledger.balance(&addr("bob"), AssetId(99), Bucket::NegativePosition), 10);
    }

    #[test]
    fn e4_liquidation_threshold() {
        // margin_requirement=10_00, leverage=1, long 10 at 100, price drops to 20.
        let outcome = evaluate_margin(10, 10_00, 100_00, 20, 100, 0.8, 0.2);
        assert!(outcome.liquidate);
    }

    #[test]
    fn margin_sweep_warns_below_liquidation() {
        let outcome = evaluate_margin(10, 10_00, 100_00, 85, 100, 0.8, 0.2);
        assert!(outcome.warn);
        assert!(!outcome.liquidate);
    }
}
