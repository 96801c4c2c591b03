//! In-process `HashMap`-backed implementation of every `Db*` trait plus `ChainView`,
//! the test-only double scenario tests and unit tests drive the engine against. The
//! analogue of the teacher's `utilities::test_utils` helpers — never compiled into a
//! production binary.

use std::collections::{BTreeMap, HashMap};

use bitcoin::Txid;

use crate::activation::{ActivationRecord, AlertRecord};
use crate::chain_view::{ChainView, Network, Tx};
use crate::primitives::{Address, AssetId, Ecosystem};
use crate::registry::Property;

use super::{DbFeeCache, DbFeeHistory, DbSTOList, DbSpInfo, DbTradeList, DbTransaction, DbTxList, Rewindable, TradeRecord, TxKind};

#[derive(Default, Clone)]
struct TxRecord {
    valid: bool,
    block: u32,
    kind: TxKind,
}

#[derive(Default)]
pub struct MemoryTxList {
    txs: HashMap<String, TxRecord>,
    activations: Vec<(u32, ActivationRecord)>,
    alerts: Vec<(u32, AlertRecord)>,
    freezes: Vec<(u32, Address, AssetId, bool)>,
}

impl DbTxList for MemoryTxList {
    fn record_tx(&mut self, hash: &str, valid: bool, block: u32, kind: TxKind, _amount: i64) {
        self.txs.insert(hash.to_owned(), TxRecord { valid, block, kind });
    }

    fn record_cancel(&mut self, hash: &str, _target_hash: &str, valid: bool, block: u32, _property: AssetId, _amount: i64) {
        self.txs.insert(hash.to_owned(), TxRecord { valid, block, kind: TxKind::MetaDexCancel });
    }

    fn exists(&self, hash: &str) -> bool {
        self.txs.contains_key(hash)
    }

    fn valid(&self, hash: &str) -> Option<bool> {
        self.txs.get(hash).map(|r| r.valid)
    }

    fn load_activations_up_to(&self, block: u32) -> Vec<ActivationRecord> {
        self.activations.iter().filter(|(b, _)| *b <= block).map(|(_, a)| a.clone()).collect()
    }

    fn load_alerts_up_to(&self, block: u32) -> Vec<AlertRecord> {
        self.alerts.iter().filter(|(b, _)| *b <= block).map(|(_, a)| a.clone()).collect()
    }

    fn load_freeze_state_up_to(&self, block: u32) -> Vec<(Address, AssetId, bool)> {
        self.freezes.iter().filter(|(b, ..)| *b <= block).map(|(_, a, p, f)| (a.clone(), *p, *f)).collect()
    }

    fn check_for_freeze_txs(&self, height: u32) -> bool {
        self.freezes.iter().any(|(b, ..)| *b == height)
    }

    fn is_in_block_range(&mut self, lo: u32, hi: u32, delete: bool) -> Vec<String> {
        let matching: Vec<String> = self
            .txs
            .iter()
            .filter(|(_, r)| r.block >= lo && r.block <= hi)
            .map(|(h, _)| h.clone())
            .collect();
        if delete {
            for h in &matching {
                self.txs.remove(h);
            }
        }
        matching
    }

    fn db_version(&self) -> u32 {
        1
    }
}

impl Rewindable for MemoryTxList {
    fn delete_above_block(&mut self, height: u32) {
        self.txs.retain(|_, r| r.block <= height);
        self.activations.retain(|(b, _)| *b <= height);
        self.alerts.retain(|(b, _)| *b <= height);
        self.freezes.retain(|(b, ..)| *b <= height);
    }
}

impl MemoryTxList {
    pub fn schedule_activation(&mut self, block: u32, record: ActivationRecord) {
        self.activations.push((block, record));
    }

    pub fn record_freeze(&mut self, block: u32, address: Address, asset: AssetId, frozen: bool) {
        self.freezes.push((block, address, asset, frozen));
    }
}

#[derive(Default)]
pub struct MemoryTradeList {
    trades: HashMap<String, Vec<TradeRecord>>,
    channels: BTreeMap<Address, (Address, Address, u32)>,
    commits: HashMap<(Address, Address, AssetId), i64>,
    withdrawals: Vec<(Address, Address, AssetId, i64, u32)>,
    id_registry: BTreeMap<Address, (String, String)>,
}

impl DbTradeList for MemoryTradeList {
    fn record_new_trade(&mut self, hash: &str, _p1: AssetId, _p2: AssetId, _block: u32, _idx: u32) {
        self.trades.entry(hash.to_owned()).or_default();
    }

    fn record_matched_trade(&mut self, new_hash: &str, _old_hash: &str, amount_sold: i64, amount_received: i64, block: u32) {
        self.trades.entry(new_hash.to_owned()).or_default().push(TradeRecord {
            block,
            tx_index: 0,
            amount_sold,
            amount_received,
        });
    }

    fn get_matching_trades(&self, hash: &str) -> Vec<TradeRecord> {
        self.trades.get(hash).cloned().unwrap_or_default()
    }

    fn record_new_channel(&mut self, multisig: &Address, first: &Address, second: &Address, expiry_block: u32) {
        self.channels.insert(multisig.clone(), (first.clone(), second.clone(), expiry_block));
    }

    fn check_channel_address(&self, multisig: &Address) -> bool {
        self.channels.contains_key(multisig)
    }

    fn channel_parties(&self, multisig: &Address) -> Option<(Address, Address, u32)> {
        self.channels.get(multisig).cloned()
    }

    fn record_new_commit(&mut self, multisig: &Address, sender: &Address, asset: AssetId, amount: i64, _block: u32) {
        *self.commits.entry((multisig.clone(), sender.clone(), asset)).or_insert(0) += amount;
    }

    fn record_new_withdrawal(&mut self, multisig: &Address, requester: &Address, asset: AssetId, amount: i64, deadline_block: u32) {
        self.withdrawals.push((multisig.clone(), requester.clone(), asset, amount, deadline_block));
    }

    fn get_remaining(&self, multisig: &Address, party: &Address, asset: AssetId) -> i64 {
        *self.commits.get(&(multisig.clone(), party.clone(), asset)).unwrap_or(&0)
    }

    fn record_new_instant_trade(&mut self, _multisig: &Address, _block: u32) {}

    fn record_new_transfer(&mut self, _multisig: &Address, _sender: &Address, _receiver: &Address, _asset: AssetId, _amount: i64) {}

    fn record_new_id_register(&mut self, address: &Address, website: &str, company: &str) {
        self.id_registry.insert(address.clone(), (website.to_owned(), company.to_owned()));
    }

    fn update_id_register(&mut self, _address: &Address) {}

    fn check_kyc_register(&self, address: &Address) -> bool {
        self.id_registry.contains_key(address)
    }

    fn matured_withdrawals(&mut self, height: u32) -> Vec<(Address, Address, AssetId, i64)> {
        let mut matured = Vec::new();
        self.withdrawals.retain(|(multisig, requester, asset, amount, deadline)| {
            if *deadline <= height {
                matured.push((multisig.clone(), requester.clone(), *asset, *amount));
                false
            } else {
                true
            }
        });
        matured
    }
}

#[derive(Default)]
pub struct MemorySpInfo {
    properties: BTreeMap<AssetId, Property>,
}

impl DbSpInfo for MemorySpInfo {
    fn put(&mut self, property: Property) -> AssetId {
        let id = property.id;
        self.properties.insert(id, property);
        id
    }
    fn get(&self, id: AssetId) -> Option<Property> {
        self.properties.get(&id).cloned()
    }
    fn update(&mut self, id: AssetId, property: Property) {
        self.properties.insert(id, property);
    }
    fn peek_next_id(&self, ecosystem: Ecosystem) -> AssetId {
        let threshold = match ecosystem {
            Ecosystem::Main => AssetId::RESERVED_THRESHOLD,
            Ecosystem::Test => AssetId::RESERVED_THRESHOLD + 1_000_000,
        };
        AssetId(self.properties.keys().map(|id| id.0).filter(|id| *id >= threshold).max().map(|m| m + 1).unwrap_or(threshold))
    }
}

#[derive(Default)]
pub struct MemoryFeeCache {
    balances: HashMap<AssetId, i64>,
}

impl DbFeeCache for MemoryFeeCache {
    fn add_fee(&mut self, asset: AssetId, amount: i64) {
        *self.balances.entry(asset).or_insert(0) += amount;
    }
    fn balance(&self, asset: AssetId) -> i64 {
        *self.balances.get(&asset).unwrap_or(&0)
    }
    fn iter_for_hash(&self) -> Vec<(AssetId, i64)> {
        let mut v: Vec<_> = self.balances.iter().map(|(a, b)| (*a, *b)).collect();
        v.sort_by_key(|(a, _)| *a);
        v
    }
    fn take_for_distribution(&mut self, asset: AssetId) -> i64 {
        self.balances.insert(asset, 0).unwrap_or(0)
    }
}

#[derive(Default)]
pub struct MemoryFeeHistory {
    distributions: Vec<(AssetId, u32, Vec<(Address, i64)>)>,
}

impl DbFeeHistory for MemoryFeeHistory {
    fn record_distribution(&mut self, asset: AssetId, block: u32, recipients: Vec<(Address, i64)>) {
        self.distributions.push((asset, block, recipients));
    }
}

#[derive(Default)]
pub struct MemorySTOList {
    recipients: Vec<(AssetId, Address, i64, u32)>,
}

impl DbSTOList for MemorySTOList {
    fn record_recipient(&mut self, property: AssetId, recipient: Address, share: i64, block: u32) {
        self.recipients.push((property, recipient, share, block));
    }
    fn recipients(&self, property: AssetId, block: u32) -> Vec<(Address, i64)> {
        self.recipients
            .iter()
            .filter(|(p, _, _, b)| *p == property && *b == block)
            .map(|(_, a, s, _)| (a.clone(), *s))
            .collect()
    }
}

#[derive(Default)]
pub struct MemoryDbTransaction {
    records: Vec<(String, u32, i32)>,
}

impl DbTransaction for MemoryDbTransaction {
    fn record(&mut self, hash: &str, index: u32, interp_ret: i32) {
        self.records.push((hash.to_owned(), index, interp_ret));
    }
}

/// A scripted, in-memory `ChainView`: blocks and transactions are inserted by the test
/// harness ahead of time rather than fetched from a live node.
#[derive(Default)]
pub struct ScriptedChainView {
    pub current_height: i32,
    pub network: Option<Network>,
    block_hashes: HashMap<u32, String>,
    block_times: HashMap<u32, i64>,
    txs: HashMap<Txid, Tx>,
    prev_output_addresses: HashMap<(Txid, u32), String>,
    prev_output_values: HashMap<(Txid, u32), u64>,
}

impl ScriptedChainView {
    pub fn new(network: Network) -> Self {
        ScriptedChainView { network: Some(network), ..Default::default() }
    }

    pub fn insert_tx(&mut self, tx: Tx) {
        self.txs.insert(tx.txid, tx);
    }

    pub fn insert_prev_output(&mut self, txid: Txid, vout: u32, address: &str, value_sat: u64) {
        self.prev_output_addresses.insert((txid, vout), address.to_owned());
        self.prev_output_values.insert((txid, vout), value_sat);
    }

    pub fn set_block(&mut self, height: u32, hash: &str, time: i64) {
        self.block_hashes.insert(height, hash.to_owned());
        self.block_times.insert(height, time);
    }
}

impl ChainView for ScriptedChainView {
    fn get_block_hash(&self, height: u32) -> Option<String> {
        self.block_hashes.get(&height).cloned()
    }
    fn get_block_time(&self, height: u32) -> Option<i64> {
        self.block_times.get(&height).copied()
    }
    fn get_tx(&self, hash: &Txid) -> Option<Tx> {
        self.txs.get(hash).cloned()
    }
    fn resolve_output_address(&self, txid: &Txid, vout: u32) -> Option<String> {
        self.prev_output_addresses.get(&(*txid, vout)).cloned()
    }
    fn resolve_output_value(&self, txid: &Txid, vout: u32) -> Option<u64> {
        self.prev_output_values.get(&(*txid, vout)).copied()
    }
    fn height(&self) -> i32 {
        self.current_height
    }
    fn network(&self) -> Network {
        self.network.unwrap_or(Network::RegTest)
    }
}
