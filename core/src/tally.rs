//! The tally ledger: per-(address, asset) balance buckets (spec §4.1).

use std::collections::BTreeMap;

use crate::primitives::{Address, AssetId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub enum Bucket {
    Balance,
    SellOfferReserve,
    AcceptReserve,
    MetaDexReserve,
    ContractMargin,
    ChannelReserve,
    PositivePosition,
    NegativePosition,
    LiquidationPrice,
    Unvested,
}

pub const ALL_BUCKETS: [Bucket; 10] = [
    Bucket::Balance,
    Bucket::SellOfferReserve,
    Bucket::AcceptReserve,
    Bucket::MetaDexReserve,
    Bucket::ContractMargin,
    Bucket::ChannelReserve,
    Bucket::PositivePosition,
    Bucket::NegativePosition,
    Bucket::LiquidationPrice,
    Bucket::Unvested,
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
struct Entry {
    balance: i64,
    sell_offer_reserve: i64,
    accept_reserve: i64,
    metadex_reserve: i64,
    contract_margin: i64,
    channel_reserve: i64,
    positive_position: i64,
    negative_position: i64,
    liquidation_price: i64,
    unvested: i64,
}

impl Entry {
    fn get(&self, bucket: Bucket) -> i64 {
        match bucket {
            Bucket::Balance => self.balance,
            Bucket::SellOfferReserve => self.sell_offer_reserve,
            Bucket::AcceptReserve => self.accept_reserve,
            Bucket::MetaDexReserve => self.metadex_reserve,
            Bucket::ContractMargin => self.contract_margin,
            Bucket::ChannelReserve => self.channel_reserve,
            Bucket::PositivePosition => self.positive_position,
            Bucket::NegativePosition => self.negative_position,
            Bucket::LiquidationPrice => self.liquidation_price,
            Bucket::Unvested => self.unvested,
        }
    }

    fn get_mut(&mut self, bucket: Bucket) -> &mut i64 {
        match bucket {
            Bucket::Balance => &mut self.balance,
            Bucket::SellOfferReserve => &mut self.sell_offer_reserve,
            Bucket::AcceptReserve => &mut self.accept_reserve,
            Bucket::MetaDexReserve => &mut self.metadex_reserve,
            Bucket::ContractMargin => &mut self.contract_margin,
            Bucket::ChannelReserve => &mut self.channel_reserve,
            Bucket::PositivePosition => &mut self.positive_position,
            Bucket::NegativePosition => &mut self.negative_position,
            Bucket::LiquidationPrice => &mut self.liquidation_price,
            Bucket::Unvested => &mut self.unvested,
        }
    }

    fn is_zero(&self) -> bool {
        ALL_BUCKETS.iter().all(|b| self.get(*b) == 0)
    }
}

/// A single mutation applied (or about to be applied) against the tally map, used to
/// compose multi-bucket moves under a save-point (spec §5 / §9: "failure aborts the
/// handler ... and unwinds via a per-tx save-point").
#[derive(Debug, Clone, Copy)]
pub struct Move {
    pub address: usize,
}

#[derive(Default)]
pub struct TallyLedger {
    // Keyed by (asset, address) so `total_for_asset` and the consensus-hash ordering
    // (spec §4.8: "sorted by (asset, address, bucket)") both fall out of iteration
    // order for free.
    entries: BTreeMap<(AssetId, Address), Entry>,
    frozen: std::collections::BTreeSet<(Address, AssetId)>,
}

/// A save-point capturing the pre-image of every key a transaction touches, so a
/// partially-applied multi-bucket move can be unwound atomically on failure.
pub struct SavePoint<'a> {
    ledger: &'a mut TallyLedger,
    pre_image: BTreeMap<(AssetId, Address), Option<Entry>>,
    committed: bool,
}

impl<'a> SavePoint<'a> {
    fn remember(&mut self, key: &(AssetId, Address)) {
        self.pre_image
            .entry(key.clone())
            .or_insert_with(|| self.ledger.entries.get(key).copied());
    }

    /// Apply `delta` to `(address, asset, bucket)`. Returns `false` (no mutation) on
    /// the conditions spec §4.1 enumerates: zero delta, or a result that would go
    /// negative. Freeze dominance (spec §8 property 11) is enforced here for
    /// `Balance`-decreasing updates.
    pub fn update(&mut self, address: &Address, asset: AssetId, delta: i64, bucket: Bucket) -> bool {
        if delta == 0 {
            return false;
        }
        if delta < 0 && bucket == Bucket::Balance && self.ledger.is_frozen(address, asset) {
            return false;
        }
        let key = (asset, address.clone());
        self.remember(&key);
        let entry = self.ledger.entries.entry(key).or_default();
        let slot = entry.get_mut(bucket);
        let new_value = match slot.checked_add(delta) {
            Some(v) => v,
            None => return false,
        };
        if new_value < 0 {
            return false;
        }
        *slot = new_value;
        true
    }

    pub fn balance(&self, address: &Address, asset: AssetId, bucket: Bucket) -> i64 {
        self.ledger.balance(address, asset, bucket)
    }

    /// Discard every mutation recorded by this save-point, restoring the ledger to the
    /// state it had when the save-point was opened.
    pub fn rollback(mut self) {
        self.unwind();
        self.committed = false;
    }

    /// Keep every mutation recorded by this save-point.
    pub fn commit(mut self) {
        self.committed = true;
        self.pre_image.clear();
    }

    fn unwind(&mut self) {
        for (key, pre) in self.pre_image.drain() {
            match pre {
                Some(entry) => {
                    self.ledger.entries.insert(key, entry);
                }
                None => {
                    self.ledger.entries.remove(&key);
                }
            }
        }
    }
}

impl<'a> Drop for SavePoint<'a> {
    fn drop(&mut self) {
        if !self.committed {
            self.unwind();
        }
    }
}

impl TallyLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a save-point. Every `update` through the save-point either all commit
    /// (caller calls `commit()`) or all vanish (caller calls `rollback()`, or simply
    /// drops the save-point, which rolls back by default).
    pub fn save_point(&mut self) -> SavePoint<'_> {
        SavePoint { ledger: self, pre_image: BTreeMap::new(), committed: false }
    }

    pub fn balance(&self, address: &Address, asset: AssetId, bucket: Bucket) -> i64 {
        self.entries
            .get(&(asset, address.clone()))
            .map(|e| e.get(bucket))
            .unwrap_or(0)
    }

    pub fn available_balance(&self, address: &Address, asset: AssetId) -> i64 {
        self.balance(address, asset, Bucket::Balance)
    }

    pub fn reserved_balance(&self, address: &Address, asset: AssetId) -> i64 {
        ALL_BUCKETS
            .iter()
            .filter(|b| **b != Bucket::Balance)
            .map(|b| self.balance(address, asset, *b))
            .sum()
    }

    pub fn total_for_asset(&self, asset: AssetId) -> (i128, usize) {
        let mut sum: i128 = 0;
        let mut owners = 0usize;
        for ((a, _addr), entry) in self.entries.range((asset, Address(String::new()))..) {
            if *a != asset {
                break;
            }
            if entry.is_zero() {
                continue;
            }
            owners += 1;
            for b in ALL_BUCKETS {
                sum += entry.get(b) as i128;
            }
        }
        (sum, owners)
    }

    /// Iterate the non-zero assets of `address` in deterministic order.
    pub fn for_each_asset(&self, address: &Address, mut f: impl FnMut(AssetId, &[(Bucket, i64)])) {
        for ((asset, addr), entry) in self.entries.iter() {
            if addr != address || entry.is_zero() {
                continue;
            }
            let pairs: Vec<(Bucket, i64)> =
                ALL_BUCKETS.iter().map(|b| (*b, entry.get(*b))).filter(|(_, v)| *v != 0).collect();
            f(*asset, &pairs);
        }
    }

    pub fn is_frozen(&self, address: &Address, asset: AssetId) -> bool {
        self.frozen.contains(&(address.clone(), asset))
    }

    pub fn set_frozen(&mut self, address: Address, asset: AssetId, frozen: bool) {
        if frozen {
            self.frozen.insert((address, asset));
        } else {
            self.frozen.remove(&(address, asset));
        }
    }

    /// Every address other than `exclude` holding a positive `Balance` of `asset`, in
    /// deterministic address order — the ownership snapshot `SendToOwners` (spec §4.1
    /// component table) distributes against.
    pub fn balance_holders(&self, asset: AssetId, exclude: &Address) -> Vec<(Address, i64)> {
        self.entries
            .range((asset, Address(String::new()))..)
            .take_while(|((a, _), _)| *a == asset)
            .filter(|((_, addr), entry)| addr != exclude && entry.get(Bucket::Balance) > 0)
            .map(|((_, addr), entry)| (addr.clone(), entry.get(Bucket::Balance)))
            .collect()
    }

    /// Non-zero entries sorted `(asset, address, bucket)`, feeding the consensus hash
    /// (spec §4.8).
    pub fn iter_for_hash(&self) -> impl Iterator<Item = (AssetId, &Address, Bucket, i64)> {
        self.entries.iter().flat_map(|((asset, addr), entry)| {
            ALL_BUCKETS.iter().filter_map(move |b| {
                let v = entry.get(*b);
                if v == 0 {
                    None
                } else {
                    Some((*asset, addr, *b, v))
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        Address(s.to_owned())
    }

    #[test]
    fn update_refuses_negative_result() {
        let mut ledger = TallyLedger::new();
        let mut sp = ledger.save_point();
        assert!(!sp.update(&addr("alice"), AssetId(5), -1, Bucket::Balance));
        sp.commit();
        assert_eq!(ledger.balance(&addr("alice"), AssetId(5), Bucket::Balance), 0);
    }

    #[test]
    fn update_refuses_zero_delta() {
        let mut ledger = TallyLedger::new();
        let mut sp = ledger.save_point();
        assert!(!sp.update(&addr("alice"), AssetId(5), 0, Bucket::Balance));
        sp.commit();
    }

    #[test]
    fn save_point_rolls_back_partial_multi_bucket_move() {
        let mut ledger = TallyLedger::new();
        {
            let mut sp = ledger.save_point();
            assert!(sp.update(&addr("alice"), AssetId(5), 100, Bucket::Balance));
            sp.commit();
        }
        {
            let mut sp = ledger.save_point();
            assert!(sp.update(&addr("alice"), AssetId(5), -100, Bucket::Balance));
            assert!(sp.update(&addr("alice"), AssetId(5), 100, Bucket::MetaDexReserve));
            // Simulate a downstream failure: roll back instead of commit.
            sp.rollback();
        }
        assert_eq!(ledger.balance(&addr("alice"), AssetId(5), Bucket::Balance), 100);
        assert_eq!(ledger.balance(&addr("alice"), AssetId(5), Bucket::MetaDexReserve), 0);
    }

    #[test]
    fn balance_holders_excludes_sender_and_zero_balances() {
        let mut ledger = TallyLedger::new();
        let mut sp = ledger.save_point();
        sp.update(&addr("alice"), AssetId(9), 100, Bucket::Balance);
        sp.update(&addr("bob"), AssetId(9), 300, Bucket::Balance);
        sp.update(&addr("carol"), AssetId(9), 0, Bucket::MetaDexReserve);
        sp.commit();
        let holders = ledger.balance_holders(AssetId(9), &addr("alice"));
        assert_eq!(holders, vec![(addr("bob"), 300)]);
    }

    #[test]
    fn freeze_blocks_balance_decrease_only() {
        let mut ledger = TallyLedger::new();
        {
            let mut sp = ledger.save_point();
            sp.update(&addr("alice"), AssetId(5), 100, Bucket::Balance);
            sp.commit();
        }
        ledger.set_frozen(addr("alice"), AssetId(5), true);
        let mut sp = ledger.save_point();
        assert!(!sp.update(&addr("alice"), AssetId(5), -10, Bucket::Balance));
        // Increases still pass through a freeze.
        assert!(sp.update(&addr("alice"), AssetId(5), 10, Bucket::Balance));
        sp.commit();
    }
}
