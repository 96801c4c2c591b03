//! End-to-end scenario tests driving `Engine` through the block pipeline the way a
//! real caller would: `on_block_begin` / `on_tx` / `on_block_end` against a scripted
//! chain view, with transactions hand-encoded in the wire format `decode` expects.

use std::collections::BTreeMap;
use std::str::FromStr;

use bitcoin::Txid;

use tl_core::chain_view::{Network, Tx, TxInput, TxOutput};
use tl_core::contractdex::Side;
use tl_core::db::memory::{
    MemoryDbTransaction, MemoryFeeCache, MemoryFeeHistory, MemorySTOList, MemorySpInfo, MemoryTradeList, MemoryTxList, ScriptedChainView,
};
use tl_core::engine::{Engine, EngineStores};
use tl_core::primitives::{Address, AssetId, Ecosystem};
use tl_core::registry::{ContractParams, Ecosystem2, Property, PropertyKind};
use tl_core::tally::Bucket;

const MARKER: &[u8] = b"tl";

fn txid(seed: u8) -> Txid {
    Txid::from_str(&format!("{seed:02x}{}", "0".repeat(62))).unwrap()
}

fn addr(s: &str) -> Address {
    Address(s.to_owned())
}

/// Builds a marker-tagged data-carrier output wrapping `version`/`msg_type`/`body`,
/// mirroring the wire layout `decode::parse_body` expects (spec §6.3).
fn marker_output(version: u16, msg_type: u16, body: &[u8]) -> TxOutput {
    let mut script = MARKER.to_vec();
    script.extend_from_slice(&version.to_be_bytes());
    script.extend_from_slice(&msg_type.to_be_bytes());
    script.extend_from_slice(body);
    TxOutput { value_sat: 0, script, address: None, is_null_data: true }
}

fn dest_output(address: &str) -> TxOutput {
    TxOutput { value_sat: 1_000, script: Vec::new(), address: Some(address.to_owned()), is_null_data: false }
}

fn cstr(s: &str) -> Vec<u8> {
    let mut v = s.as_bytes().to_vec();
    v.push(0);
    v
}

fn simple_send_body(property: AssetId, amount: i64) -> Vec<u8> {
    let mut body = property.0.to_be_bytes().to_vec();
    body.extend_from_slice(&amount.to_be_bytes());
    body
}

fn create_channel_body(expiry_blocks: u8, multisig: &str) -> Vec<u8> {
    let mut body = vec![expiry_blocks];
    body.extend_from_slice(&cstr(multisig));
    body
}

fn commit_channel_body(property: AssetId, amount: i64) -> Vec<u8> {
    let mut body = property.0.to_be_bytes().to_vec();
    body.extend_from_slice(&amount.to_be_bytes());
    body
}

fn metadex_trade_body(property: AssetId, amount: i64, desired_property: AssetId, desired_amount: i64) -> Vec<u8> {
    let mut body = property.0.to_be_bytes().to_vec();
    body.extend_from_slice(&amount.to_be_bytes());
    body.extend_from_slice(&desired_property.0.to_be_bytes());
    body.extend_from_slice(&desired_amount.to_be_bytes());
    body
}

fn send_to_owners_body(property: AssetId, amount: i64) -> Vec<u8> {
    let mut body = property.0.to_be_bytes().to_vec();
    body.extend_from_slice(&amount.to_be_bytes());
    body
}

fn instant_trade_body(property: AssetId, amount: i64, expiry: u8, desired: AssetId, desired_amount: i64) -> Vec<u8> {
    let mut body = property.0.to_be_bytes().to_vec();
    body.extend_from_slice(&amount.to_be_bytes());
    body.push(expiry);
    body.extend_from_slice(&desired.0.to_be_bytes());
    body.extend_from_slice(&desired_amount.to_be_bytes());
    body
}

fn memory_engine() -> Engine {
    let stores = EngineStores {
        tx_list: Box::new(MemoryTxList::default()),
        trade_list: Box::new(MemoryTradeList::default()),
        sp_info: Box::new(MemorySpInfo::default()),
        fee_cache: Box::new(MemoryFeeCache::default()),
        fee_history: Box::new(MemoryFeeHistory::default()),
        sto_list: Box::new(MemorySTOList::default()),
        db_tx: Box::new(MemoryDbTransaction::default()),
    };
    Engine::new(stores)
}

fn fixed_property(issuer: &str) -> Property {
    Property {
        id: AssetId(0),
        ecosystem: Ecosystem2::Main,
        kind: PropertyKind::Fixed,
        divisible: true,
        issuer: addr(issuer),
        creation_block_hash: "genesis".into(),
        update_block_hash: "genesis".into(),
        num_tokens: 1_000_000,
        vesting_marker: false,
        contract_params: None,
    }
}

fn no_checkpoints() -> BTreeMap<u32, [u8; 32]> {
    BTreeMap::new()
}

/// E1: a funded sender's `SimpleSend` moves balance to the tx's reference address.
#[test]
fn simple_send_moves_balance_to_reference() {
    let mut engine = memory_engine();
    let property = engine.registry.create(Ecosystem::Main, fixed_property("alice"));

    {
        let mut sp = engine.tally.save_point();
        sp.update(&addr("alice"), property, 10_000, Bucket::Balance);
        sp.commit();
    }

    let mut chain = ScriptedChainView::new(Network::RegTest);
    chain.insert_prev_output(txid(1), 0, "alice", 50_000);

    let tx = Tx {
        txid: txid(2),
        inputs: vec![TxInput { prev_txid: txid(1), prev_vout: 0 }],
        outputs: vec![marker_output(1, 0, &simple_send_body(property, 4_000)), dest_output("bob")],
    };

    engine.on_block_begin(1);
    engine.on_tx(&chain, &tx, 1, 0, 0);
    engine.on_block_end(1, &no_checkpoints(), false).unwrap();

    assert_eq!(engine.get_balance(&addr("alice"), property), 6_000);
    assert_eq!(engine.get_balance(&addr("bob"), property), 4_000);
    assert_eq!(engine.get_trade_status(&txid(2).to_string()), Some(true));
}

/// E2: a resting MetaDEx offer matched by a fully-filling taker order, driven through
/// `on_tx` rather than a direct `SpotBook` call, so the maker's own reserve bucket is
/// whatever `handle_metadex_trade` actually deposited it into.
#[test]
fn metadex_match_settles_both_sides_through_the_pipeline() {
    let mut engine = memory_engine();
    let asset_a = AssetId(5);
    let asset_b = AssetId(7);

    {
        let mut sp = engine.tally.save_point();
        sp.update(&addr("mallory"), asset_a, 100_00, Bucket::Balance);
        sp.update(&addr("taro"), asset_b, 200_00, Bucket::Balance);
        sp.commit();
    }

    let mut chain = ScriptedChainView::new(Network::RegTest);
    chain.insert_prev_output(txid(40), 0, "mallory", 50_000);
    chain.insert_prev_output(txid(41), 0, "taro", 50_000);

    let maker_tx = Tx {
        txid: txid(42),
        inputs: vec![TxInput { prev_txid: txid(40), prev_vout: 0 }],
        outputs: vec![marker_output(1, 25, &metadex_trade_body(asset_a, 100_00, asset_b, 200_00)), dest_output("mallory")],
    };
    let taker_tx = Tx {
        txid: txid(43),
        inputs: vec![TxInput { prev_txid: txid(41), prev_vout: 0 }],
        outputs: vec![marker_output(1, 25, &metadex_trade_body(asset_b, 200_00, asset_a, 100_00)), dest_output("taro")],
    };

    engine.on_block_begin(1000);
    engine.on_tx(&chain, &maker_tx, 1000, 2, 0);
    engine.on_block_end(1000, &no_checkpoints(), false).unwrap();

    engine.on_block_begin(1001);
    engine.on_tx(&chain, &taker_tx, 1001, 1, 0);
    engine.on_block_end(1001, &no_checkpoints(), false).unwrap();

    assert_eq!(engine.get_balance(&addr("mallory"), asset_b), 200_00);
    assert_eq!(engine.get_balance(&addr("taro"), asset_a), 100_00);
    assert_eq!(engine.tally.balance(&addr("mallory"), asset_a, Bucket::MetaDexReserve), 0);
    assert_eq!(engine.tally.balance(&addr("taro"), asset_b, Bucket::MetaDexReserve), 0);
    assert_eq!(engine.get_trade_status(&maker_tx.txid.to_string()), Some(true));
    assert_eq!(engine.get_trade_status(&taker_tx.txid.to_string()), Some(true));
}

/// E3: rounding favors the maker. A 3-for-10 offer matched by a 10-for-3 taker fills
/// exactly (`n_could_buy = 3`, `n_would_pay = 10`) with no residual on either side.
#[test]
fn metadex_rounding_settles_fully_with_no_residual() {
    let mut engine = memory_engine();
    let asset_a = AssetId(1);
    let asset_b = AssetId(2);

    {
        let mut sp = engine.tally.save_point();
        sp.update(&addr("maker"), asset_a, 3, Bucket::Balance);
        sp.update(&addr("taker"), asset_b, 10, Bucket::Balance);
        sp.commit();
    }

    let mut chain = ScriptedChainView::new(Network::RegTest);
    chain.insert_prev_output(txid(50), 0, "maker", 50_000);
    chain.insert_prev_output(txid(51), 0, "taker", 50_000);

    let maker_tx = Tx {
        txid: txid(52),
        inputs: vec![TxInput { prev_txid: txid(50), prev_vout: 0 }],
        outputs: vec![marker_output(1, 25, &metadex_trade_body(asset_a, 3, asset_b, 10)), dest_output("maker")],
    };
    let taker_tx = Tx {
        txid: txid(53),
        inputs: vec![TxInput { prev_txid: txid(51), prev_vout: 0 }],
        outputs: vec![marker_output(1, 25, &metadex_trade_body(asset_b, 10, asset_a, 3)), dest_output("taker")],
    };

    engine.on_block_begin(10);
    engine.on_tx(&chain, &maker_tx, 10, 0, 0);
    engine.on_block_end(10, &no_checkpoints(), false).unwrap();

    engine.on_block_begin(11);
    engine.on_tx(&chain, &taker_tx, 11, 0, 0);
    engine.on_block_end(11, &no_checkpoints(), false).unwrap();

    assert_eq!(engine.get_balance(&addr("maker"), asset_b), 10);
    assert_eq!(engine.get_balance(&addr("taker"), asset_a), 3);
    assert_eq!(engine.tally.balance(&addr("maker"), asset_a, Bucket::MetaDexReserve), 0);
    assert_eq!(engine.tally.balance(&addr("taker"), asset_b, Bucket::MetaDexReserve), 0);
}

/// E4: a position carried at a stale entry price gets picked up and partially
/// liquidated by the margin sweep once the market price moves far enough against it.
/// This is the scenario the `ContractBook::entry_price` tracking exists for — without
/// it `margin_sweep` compares market price to itself and liquidation never triggers.
#[test]
fn margin_sweep_partially_liquidates_stale_position() {
    let mut engine = memory_engine();
    let collateral = AssetId(31);
    let params = ContractParams {
        notional_size: 1,
        margin_requirement: 100,
        collateral_asset: collateral,
        blocks_until_expiration: 100_000,
        init_block: 0,
        oracle_high: 0,
        oracle_low: 0,
        oracle_last_update_block: 0,
        backup_address: None,
    };
    let property = Property {
        id: AssetId(0),
        ecosystem: Ecosystem2::Main,
        kind: PropertyKind::Contract,
        divisible: true,
        issuer: addr("issuer"),
        creation_block_hash: "genesis".into(),
        update_block_hash: "genesis".into(),
        num_tokens: 0,
        vesting_marker: false,
        contract_params: Some(params.clone()),
    };
    let contract_id = engine.registry.create(Ecosystem::Main, property);

    {
        let mut sp = engine.tally.save_point();
        sp.update(&addr("alice"), collateral, 100_000, Bucket::Balance);
        sp.update(&addr("bob"), collateral, 100_000, Bucket::Balance);
        sp.update(&addr("carol"), collateral, 100_000, Bucket::Balance);
        sp.update(&addr("dave"), collateral, 100_000, Bucket::Balance);
        sp.commit();
    }

    // Alice opens long 10 @ 100, bob takes the other side: both get an entry price of 100.
    engine.contract_book.insert_trade(&mut engine.tally, contract_id, &params, addr("alice"), Side::Buy, 10, 100, 1, 1, 0).unwrap();
    engine.contract_book.insert_trade(&mut engine.tally, contract_id, &params, addr("bob"), Side::Sell, 10, 100, 1, 1, 1).unwrap();
    assert_eq!(engine.tally.balance(&addr("alice"), contract_id, Bucket::PositivePosition), 10);
    assert_eq!(engine.contract_book.entry_price(&addr("alice"), contract_id), Some(100));

    // Carol rests a small buy at 1, dave partially fills it: this is the liquidity the
    // forced sell below needs, and the fill itself drags the last market price down to 1.
    engine.contract_book.insert_trade(&mut engine.tally, contract_id, &params, addr("carol"), Side::Buy, 5, 1, 1, 2, 0).unwrap();
    engine.contract_book.insert_trade(&mut engine.tally, contract_id, &params, addr("dave"), Side::Sell, 3, 1, 1, 2, 1).unwrap();
    assert_eq!(engine.contract_book.last_market_price(contract_id), Some(1));

    // Alice's entry price is untouched by carol/dave's trade.
    assert_eq!(engine.contract_book.entry_price(&addr("alice"), contract_id), Some(100));

    engine.on_block_begin(3);

    // Margin sweep forced a liquidating sell for alice against carol's remaining resting
    // buy (2 units), netting her long position down from 10 to 8.
    assert_eq!(engine.tally.balance(&addr("alice"), contract_id, Bucket::PositivePosition), 8);
}

/// E5: a channel is opened, both parties commit funds, and an instant trade inside the
/// channel swaps the two legs at full value, crediting each party's `Balance` from the
/// other's `ChannelReserve` with no fee skimmed.
#[test]
fn channel_instant_trade_credits_each_partys_balance() {
    let mut engine = memory_engine();
    let asset_a = engine.registry.create(Ecosystem::Main, fixed_property("alice"));
    let asset_b = engine.registry.create(Ecosystem::Main, fixed_property("bob"));

    {
        let mut sp = engine.tally.save_point();
        sp.update(&addr("alice"), asset_a, 1_000, Bucket::Balance);
        sp.update(&addr("bob"), asset_b, 1_000, Bucket::Balance);
        sp.commit();
    }

    let mut chain = ScriptedChainView::new(Network::RegTest);
    chain.insert_prev_output(txid(10), 0, "alice", 50_000);
    chain.insert_prev_output(txid(11), 0, "alice", 50_000);
    chain.insert_prev_output(txid(12), 0, "bob", 50_000);
    chain.insert_prev_output(txid(13), 0, "alice", 50_000);

    let multisig = "channel-multisig";

    let create_tx = Tx {
        txid: txid(20),
        inputs: vec![TxInput { prev_txid: txid(10), prev_vout: 0 }],
        outputs: vec![marker_output(1, 113, &create_channel_body(100, multisig)), dest_output("bob")],
    };
    let alice_commit_tx = Tx {
        txid: txid(21),
        inputs: vec![TxInput { prev_txid: txid(11), prev_vout: 0 }],
        outputs: vec![marker_output(1, 108, &commit_channel_body(asset_a, 500)), dest_output(multisig)],
    };
    let bob_commit_tx = Tx {
        txid: txid(22),
        inputs: vec![TxInput { prev_txid: txid(12), prev_vout: 0 }],
        outputs: vec![marker_output(1, 108, &commit_channel_body(asset_b, 300)), dest_output(multisig)],
    };
    let instant_trade_tx = Tx {
        txid: txid(23),
        inputs: vec![TxInput { prev_txid: txid(13), prev_vout: 0 }],
        outputs: vec![marker_output(1, 110, &instant_trade_body(asset_a, 500, 0, asset_b, 300)), dest_output(multisig)],
    };

    engine.on_block_begin(1);
    engine.on_tx(&chain, &create_tx, 1, 0, 0);
    engine.on_tx(&chain, &alice_commit_tx, 1, 1, 0);
    engine.on_tx(&chain, &bob_commit_tx, 1, 2, 0);
    engine.on_tx(&chain, &instant_trade_tx, 1, 3, 0);
    engine.on_block_end(1, &no_checkpoints(), false).unwrap();

    assert_eq!(engine.get_trade_status(&create_tx.txid.to_string()), Some(true));
    assert_eq!(engine.get_trade_status(&alice_commit_tx.txid.to_string()), Some(true));
    assert_eq!(engine.get_trade_status(&bob_commit_tx.txid.to_string()), Some(true));
    assert_eq!(engine.get_trade_status(&instant_trade_tx.txid.to_string()), Some(true));

    assert_eq!(engine.fee_cache_balance(asset_a), 0);
    assert_eq!(engine.tally.balance(&addr(multisig), asset_a, Bucket::ChannelReserve), 0);
    assert_eq!(engine.tally.balance(&addr(multisig), asset_b, Bucket::ChannelReserve), 0);
    assert_eq!(engine.get_balance(&addr("bob"), asset_a), 500);
    assert_eq!(engine.get_balance(&addr("alice"), asset_b), 300);
    assert_eq!(engine.get_balance(&addr("alice"), asset_a), 500);
    assert_eq!(engine.get_balance(&addr("bob"), asset_b), 700);
}

/// A send-to-owners distribution splits the sender's balance across every other holder
/// of the same asset, weighted by their holdings, with a largest-remainder rounding rule
/// so the payout sums to exactly the sent amount. Bob (weight 100) and Carol (weight 200)
/// get an uneven 10-unit split: floor division alone would only pay out 9.
#[test]
fn send_to_owners_splits_by_holding_with_largest_remainder() {
    let mut engine = memory_engine();
    let property = engine.registry.create(Ecosystem::Main, fixed_property("alice"));

    {
        let mut sp = engine.tally.save_point();
        sp.update(&addr("alice"), property, 1_000, Bucket::Balance);
        sp.update(&addr("bob"), property, 100, Bucket::Balance);
        sp.update(&addr("carol"), property, 200, Bucket::Balance);
        sp.commit();
    }

    let mut chain = ScriptedChainView::new(Network::RegTest);
    chain.insert_prev_output(txid(60), 0, "alice", 50_000);

    let tx = Tx {
        txid: txid(61),
        inputs: vec![TxInput { prev_txid: txid(60), prev_vout: 0 }],
        outputs: vec![marker_output(1, 3, &send_to_owners_body(property, 10)), dest_output("bob")],
    };

    engine.on_block_begin(1);
    engine.on_tx(&chain, &tx, 1, 0, 0);
    engine.on_block_end(1, &no_checkpoints(), false).unwrap();

    assert_eq!(engine.get_trade_status(&tx.txid.to_string()), Some(true));
    assert_eq!(engine.get_balance(&addr("alice"), property), 990);
    assert_eq!(engine.get_balance(&addr("bob"), property), 103);
    assert_eq!(engine.get_balance(&addr("carol"), property), 207);
}

/// E6: flagging a reorg without an active freeze rewinds the tx log and leaves freeze
/// state untouched (no feature-gated side effects fire on a plain rewind).
#[test]
fn reorg_rewind_without_freeze_has_no_freeze_side_effects() {
    let mut engine = memory_engine();
    let property = engine.registry.create(Ecosystem::Main, fixed_property("alice"));
    {
        let mut sp = engine.tally.save_point();
        sp.update(&addr("alice"), property, 10_000, Bucket::Balance);
        sp.commit();
    }

    let mut chain = ScriptedChainView::new(Network::RegTest);
    chain.insert_prev_output(txid(30), 0, "alice", 50_000);
    let tx = Tx {
        txid: txid(31),
        inputs: vec![TxInput { prev_txid: txid(30), prev_vout: 0 }],
        outputs: vec![marker_output(1, 0, &simple_send_body(property, 1_000)), dest_output("bob")],
    };

    engine.on_block_begin(5);
    engine.on_tx(&chain, &tx, 5, 0, 0);
    engine.on_block_end(5, &no_checkpoints(), false).unwrap();
    assert_eq!(engine.get_trade_status(&txid(31).to_string()), Some(true));

    engine.flag_reorg(5);
    engine.on_block_begin(6);

    assert_eq!(engine.get_trade_status(&txid(31).to_string()), None);
    assert_eq!(engine.freeze.is_frozen(&addr("alice"), property), false);
}
