//! Persistent store interfaces (spec §6.2). The core treats these as opaque
//! append/lookup services with atomic per-block commit; it never owns their storage
//! format. Grounded on the shape of the teacher's `db::PersistentKeyDB` (one struct per
//! concern, `delete_above_block`-style rewind support, owned by the engine's writer
//! path only).

#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod persistent;

use crate::primitives::{Address, AssetId};
use crate::registry::Property;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum TxKind {
    SimpleSend,
    MetaDexTrade,
    MetaDexCancel,
    ContractDexTrade,
    ContractDexCancel,
    IssuanceFixed,
    IssuanceManaged,
    GrantRevoke,
    CreateContract,
    Oracle,
    Channel,
    SendToOwners,
    Activation,
    Alert,
    Freeze,
    #[default]
    Other,
}

/// Append-only record of every transaction the pipeline has dispatched, plus the
/// activation/alert/freeze logs replayed on startup (spec §6.2).
pub trait DbTxList {
    fn record_tx(&mut self, hash: &str, valid: bool, block: u32, kind: TxKind, amount: i64);
    fn record_cancel(&mut self, hash: &str, target_hash: &str, valid: bool, block: u32, property: AssetId, amount: i64);
    fn exists(&self, hash: &str) -> bool;
    fn valid(&self, hash: &str) -> Option<bool>;
    fn load_activations_up_to(&self, block: u32) -> Vec<crate::activation::ActivationRecord>;
    fn load_alerts_up_to(&self, block: u32) -> Vec<crate::activation::AlertRecord>;
    fn load_freeze_state_up_to(&self, block: u32) -> Vec<(Address, AssetId, bool)>;
    fn check_for_freeze_txs(&self, height: u32) -> bool;
    fn is_in_block_range(&mut self, lo: u32, hi: u32, delete: bool) -> Vec<String>;
    fn db_version(&self) -> u32;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TradeRecord {
    pub block: u32,
    pub tx_index: u32,
    pub amount_sold: i64,
    pub amount_received: i64,
}

/// Matched trades, channel lifecycle events, instant-trade replays, and the registered
/// id/KYC list (spec §6.2).
pub trait DbTradeList {
    fn record_new_trade(&mut self, hash: &str, property_for_sale: AssetId, property_desired: AssetId, block: u32, tx_index: u32);
    fn record_matched_trade(&mut self, new_hash: &str, old_hash: &str, amount_sold: i64, amount_received: i64, block: u32);
    fn get_matching_trades(&self, hash: &str) -> Vec<TradeRecord>;

    fn record_new_channel(&mut self, multisig: &Address, first: &Address, second: &Address, expiry_block: u32);
    fn check_channel_address(&self, multisig: &Address) -> bool;
    /// The two parties and expiry block recorded for a channel, keyed by its multisig
    /// address — lets a handler resolve "the other party" for a two-sided settlement
    /// (spec §4.6.5), the same lookup the original does via `getChannelAddresses`.
    fn channel_parties(&self, multisig: &Address) -> Option<(Address, Address, u32)>;
    fn record_new_commit(&mut self, multisig: &Address, sender: &Address, asset: AssetId, amount: i64, block: u32);
    fn record_new_withdrawal(&mut self, multisig: &Address, requester: &Address, asset: AssetId, amount: i64, deadline_block: u32);
    fn get_remaining(&self, multisig: &Address, party: &Address, asset: AssetId) -> i64;
    /// Drains every withdrawal whose deadline has passed by `height`, returning
    /// `(multisig, requester, asset, amount)` for the block pipeline to settle
    /// (spec §4.7 pre-block step 3).
    fn matured_withdrawals(&mut self, height: u32) -> Vec<(Address, Address, AssetId, i64)>;
    fn record_new_instant_trade(&mut self, multisig: &Address, block: u32);
    fn record_new_transfer(&mut self, multisig: &Address, sender: &Address, receiver: &Address, asset: AssetId, amount: i64);
    fn record_new_id_register(&mut self, address: &Address, website: &str, company: &str);
    fn update_id_register(&mut self, address: &Address);
    fn check_kyc_register(&self, address: &Address) -> bool;
}

pub trait DbSTOList {
    fn record_recipient(&mut self, property: AssetId, recipient: Address, share: i64, block: u32);
    fn recipients(&self, property: AssetId, block: u32) -> Vec<(Address, i64)>;
}

pub trait DbFeeCache {
    fn add_fee(&mut self, asset: AssetId, amount: i64);
    fn balance(&self, asset: AssetId) -> i64;
    fn iter_for_hash(&self) -> Vec<(AssetId, i64)>;
    fn take_for_distribution(&mut self, asset: AssetId) -> i64;
}

pub trait DbFeeHistory {
    fn record_distribution(&mut self, asset: AssetId, block: u32, recipients: Vec<(Address, i64)>);
}

pub trait DbTransaction {
    fn record(&mut self, hash: &str, index: u32, interp_ret: i32);
}

pub trait DbSpInfo {
    fn put(&mut self, property: Property) -> AssetId;
    fn get(&self, id: AssetId) -> Option<Property>;
    fn update(&mut self, id: AssetId, property: Property);
    fn peek_next_id(&self, ecosystem: crate::primitives::Ecosystem) -> AssetId;
}

/// Every store must additionally support rewind for reorg handling (spec §4.9, §6.2)
/// and expose whether a per-block commit is outstanding.
pub trait Rewindable {
    fn delete_above_block(&mut self, height: u32);
}
