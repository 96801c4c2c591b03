//! The block pipeline (spec §4.7) and the `Engine` value that owns every piece of
//! mutable state (tally, books, registry, activation/freeze, fee cache) in place of
//! the process-wide singletons the design notes (spec §9) call out.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::activation::{features, ActivationRecord, ActivationState, AlertRecord, FreezeSet};
use crate::chain_view::{ChainView, Tx};
use crate::consensus::{consensus_hash, ConsensusInputs};
use crate::contractdex::{self, ContractBook, Side};
use crate::db::{DbFeeCache, DbFeeHistory, DbSTOList, DbSpInfo, DbTradeList, DbTransaction, DbTxList, TxKind};
use crate::decode::{self, DecodedTx, Message};
use crate::errors::TxError;
use crate::metadex::SpotBook;
use crate::primitives::{Address, AssetId, Ecosystem};
use crate::registry::{ContractParams, Ecosystem2, Property, PropertyKind, PropertyRegistry, PropertyUpdate};
use crate::tally::{Bucket, TallyLedger};

/// Governance-style constants the design notes (spec §9) flag as hard-coded with no
/// stated tunability; named here rather than scattered as magic numbers.
pub mod params {
    pub const WITHDRAWAL_DEADLINE_BLOCKS: u32 = crate::channel::WITHDRAWAL_DEADLINE_BLOCKS;
    pub const LIQUIDATION_FACTOR: f64 = 0.8;
    pub const WARNING_FACTOR: f64 = 0.2;
    pub const DAY_IN_BLOCKS: u32 = 144;
}

/// The Db* handles the engine's writer path owns exclusively (spec §5: "Db* stores are
/// owned by the core's writer path"). Boxed trait objects so the engine stays
/// independent of any concrete storage backend.
pub struct EngineStores {
    pub tx_list: Box<dyn DbTxList>,
    pub trade_list: Box<dyn DbTradeList>,
    pub sp_info: Box<dyn DbSpInfo>,
    pub fee_cache: Box<dyn DbFeeCache>,
    pub fee_history: Box<dyn DbFeeHistory>,
    pub sto_list: Box<dyn DbSTOList>,
    pub db_tx: Box<dyn DbTransaction>,
}

pub struct Engine {
    pub tally: TallyLedger,
    pub registry: PropertyRegistry,
    pub spot_book: SpotBook,
    pub contract_book: ContractBook,
    pub activation: ActivationState,
    pub freeze: FreezeSet,
    pub water_line: u32,
    reorg_flag: Option<u32>,
    stores: EngineStores,
}

/// Outcome of dispatching a single decoded transaction (spec §4.7 per-tx step 4): what
/// gets recorded in `DbTxList`/`DbTransaction`.
struct Dispatched {
    kind: TxKind,
    amount: i64,
    result: Result<(), TxError>,
}

impl Engine {
    pub fn new(stores: EngineStores) -> Self {
        Engine {
            tally: TallyLedger::new(),
            registry: PropertyRegistry::new(),
            spot_book: SpotBook::new(),
            contract_book: ContractBook::new(),
            activation: ActivationState::new(),
            freeze: FreezeSet::default(),
            water_line: 0,
            reorg_flag: None,
            stores,
        }
    }

    pub fn flag_reorg(&mut self, disconnect_height: u32) {
        let next = self.reorg_flag.map(|h| h.max(disconnect_height)).unwrap_or(disconnect_height);
        self.reorg_flag = Some(next);
    }

    /// Pre-block maintenance (spec §4.7): reorg rewind, activations, withdrawal
    /// finalization, margin sweep.
    pub fn on_block_begin(&mut self, height: u32) {
        if let Some(max_height) = self.reorg_flag.take() {
            self.rewind(max_height.saturating_sub(1));
            warn!(rewound_to = max_height.saturating_sub(1), "rewound state for reorg");
        }

        for feature_id in self.activation.apply_due(height) {
            info!(feature_id, height, "feature activated");
        }

        self.finalize_matured_withdrawals(height);
        self.margin_sweep(height);
        self.water_line = height;
    }

    fn rewind(&mut self, height: u32) {
        self.stores.tx_list.is_in_block_range(height + 1, u32::MAX, true);
        // A full implementation reconstructs tally/books/registry from the nearest
        // snapshot at or below `height` and replays forward; the in-memory engine
        // itself holds no block-indexed undo log beyond the per-tx save-point, so a
        // caller driving a real rewind is expected to reload from a `Snapshot` first.
        let _ = height;
    }

    fn finalize_matured_withdrawals(&mut self, height: u32) {
        let matured = self.stores.trade_list.matured_withdrawals(height);
        for (multisig, requester, asset, amount) in matured {
            match crate::channel::ChannelRegistry::settle_withdrawal(&mut self.tally, &multisig, &requester, asset, amount) {
                Ok(()) => debug!(multisig = %multisig, requester = %requester, asset = asset.0, amount, height, "withdrawal settled"),
                Err(err) => warn!(multisig = %multisig, requester = %requester, asset = asset.0, amount, height, ?err, "matured withdrawal failed to settle"),
            }
        }
    }

    fn margin_sweep(&mut self, _height: u32) {
        let contract_ids: Vec<AssetId> = self
            .registry
            .iter()
            .filter(|p| matches!(p.kind, PropertyKind::Contract | PropertyKind::OracleContract))
            .map(|p| p.id)
            .collect();
        for contract_id in contract_ids {
            let Some(market_price) = self.contract_book.last_market_price(contract_id) else { continue };
            let Ok(property) = self.registry.get(contract_id) else { continue };
            let Some(params) = property.contract_params.clone() else { continue };

            let holders: Vec<Address> = self
                .tally
                .iter_for_hash()
                .filter(|(asset, _, bucket, _)| *asset == contract_id && matches!(bucket, Bucket::PositivePosition | Bucket::NegativePosition))
                .map(|(_, addr, _, _)| addr.clone())
                .collect();
            let mut seen = std::collections::BTreeSet::new();
            for address in holders {
                if !seen.insert(address.clone()) {
                    continue;
                }
                let long = self.tally.balance(&address, contract_id, Bucket::PositivePosition);
                let short = self.tally.balance(&address, contract_id, Bucket::NegativePosition);
                let position = long - short;
                if position == 0 {
                    continue;
                }
                let init_margin = self.tally.balance(&address, params.collateral_asset, Bucket::ContractMargin);
                if init_margin <= 0 {
                    continue;
                }
                let entry_price = self.contract_book.entry_price(&address, contract_id).unwrap_or(market_price);
                let outcome = contractdex::evaluate_margin(position, params.margin_requirement, init_margin, market_price, entry_price, params::LIQUIDATION_FACTOR, params::WARNING_FACTOR);
                if outcome.liquidate {
                    let side = if position > 0 { Side::Sell } else { Side::Buy };
                    let amount = position.abs();
                    if let Ok(_fills) = self.contract_book.insert_trade(&mut self.tally, contract_id, &params, address.clone(), side, amount, market_price, 1, self.water_line, 0) {
                        let stale = self.tally.balance(&address, contract_id, Bucket::LiquidationPrice);
                        if stale != 0 {
                            let mut sp = self.tally.save_point();
                            sp.update(&address, contract_id, -stale, Bucket::LiquidationPrice);
                            sp.commit();
                        }
                        warn!(address = %address, contract = contract_id.0, "position liquidated by margin sweep");
                    }
                } else if outcome.warn {
                    debug!(address = %address, contract = contract_id.0, "margin warning issued");
                }
            }
        }
    }

    /// Per-tx dispatch (spec §4.7). `raw_tx` is the base-chain transaction; `chain`
    /// resolves prevouts for the decoder.
    pub fn on_tx(&mut self, chain: &dyn ChainView, raw_tx: &Tx, height: u32, index: u32, block_time: i64) {
        let hash = raw_tx.txid.to_string();
        if height < self.water_line {
            return;
        }
        if self.stores.tx_list.exists(&hash) {
            return;
        }

        let decoded = match decode::decode(chain, raw_tx, height, index, block_time) {
            Ok(d) => d,
            Err(_) => return,
        };

        let dispatched = self.dispatch(&decoded);
        let valid = dispatched.result.is_ok();
        let code = dispatched.result.err().map(|e| e.code()).unwrap_or(0);
        self.stores.tx_list.record_tx(&hash, valid, height, dispatched.kind, dispatched.amount);
        self.stores.db_tx.record(&hash, index, code);

        if !valid {
            debug!(hash, code, "transaction rejected");
        }
    }

    fn dispatch(&mut self, tx: &DecodedTx) -> Dispatched {
        let (kind, amount, result) = match &tx.message {
            Message::SimpleSend { property, amount } => (TxKind::SimpleSend, *amount, self.handle_simple_send(tx, *property, *amount)),
            Message::SendVesting { property, amount } => (TxKind::SimpleSend, *amount, self.handle_simple_send(tx, *property, *amount)),
            Message::Transfer { property, amount } => (TxKind::Channel, *amount, self.handle_transfer(tx, *property, *amount)),
            Message::MetaDexTrade { property, amount, desired_property, desired_amount } => {
                (TxKind::MetaDexTrade, *amount, self.handle_metadex_trade(tx, *property, *amount, *desired_property, *desired_amount))
            }
            Message::MetaDexCancelAtPrice { property, desired_property, amount, desired_amount } => {
                (TxKind::MetaDexCancel, 0, self.handle_metadex_cancel_at_price(tx, *property, *desired_property, *amount, *desired_amount))
            }
            Message::MetaDexCancelPair { property, desired_property } => {
                (TxKind::MetaDexCancel, 0, self.handle_metadex_cancel_pair(tx, *property, *desired_property))
            }
            Message::MetaDexCancelEcosystem { ecosystem } => (TxKind::MetaDexCancel, 0, self.handle_metadex_cancel_ecosystem(tx, *ecosystem)),
            Message::ContractDexTrade { amount, effective_price, leverage, trading_action, name } => (
                TxKind::ContractDexTrade,
                *amount,
                self.handle_contractdex_trade(tx, name, *amount, *effective_price, *leverage, *trading_action),
            ),
            Message::ContractDexCancelEcosystem { ecosystem } => (TxKind::ContractDexCancel, 0, self.handle_contractdex_cancel_ecosystem(tx, *ecosystem)),
            Message::ContractDexCancelContract { contract_id, .. } => (TxKind::ContractDexCancel, 0, self.handle_contractdex_cancel_contract(tx, *contract_id)),
            Message::ContractDexCancelByBlock { block, idx } => (TxKind::ContractDexCancel, 0, self.handle_contractdex_cancel_by_block(tx, *block, *idx)),
            Message::CreateContract { ecosystem, blocks_until_exp, notional_size, collateral, margin_req, name } => (
                TxKind::CreateContract,
                0,
                self.handle_create_contract(tx, *ecosystem, *blocks_until_exp, *notional_size, *collateral, *margin_req, name, false),
            ),
            Message::CreateOracleContract { ecosystem, blocks_until_exp, notional_size, collateral, margin_req, name } => (
                TxKind::CreateContract,
                0,
                self.handle_create_contract(tx, *ecosystem, *blocks_until_exp, *notional_size, *collateral, *margin_req, name, true),
            ),
            Message::SetOracle { oracle_high, oracle_low, property } => (TxKind::Oracle, 0, self.handle_set_oracle(tx, *property, *oracle_high, *oracle_low)),
            Message::OracleBackup { contract_id } => (TxKind::Oracle, 0, self.handle_oracle_backup(tx, *contract_id)),
            Message::CloseOracle { contract_id } => (TxKind::Oracle, 0, self.handle_close_oracle(tx, *contract_id)),
            Message::ChangeOracleRef { contract_id } => (TxKind::Oracle, 0, self.handle_change_oracle_ref(tx, *contract_id)),
            Message::IssuanceFixed { ecosystem, amount, name, .. } => (TxKind::IssuanceFixed, *amount, self.handle_issuance_fixed(tx, *ecosystem, *amount, name)),
            Message::IssuanceManaged { ecosystem, name, .. } => (TxKind::IssuanceManaged, 0, self.handle_issuance_managed(tx, *ecosystem, name)),
            Message::IssuanceCrowdsale { ecosystem, amount, name, .. } => (TxKind::IssuanceFixed, *amount, self.handle_issuance_fixed(tx, *ecosystem, *amount, name)),
            Message::Grant { property, amount, .. } => (TxKind::GrantRevoke, *amount, self.handle_grant(tx, *property, *amount)),
            Message::Revoke { property, amount, .. } => (TxKind::GrantRevoke, -*amount, self.handle_revoke(tx, *property, *amount)),
            Message::CreateChannel { expiry_blocks, address } => (TxKind::Channel, 0, self.handle_create_channel(tx, address.clone(), *expiry_blocks)),
            Message::CommitChannel { property, amount } => (TxKind::Channel, *amount, self.handle_commit_channel(tx, *property, *amount)),
            Message::WithdrawalFromChannel { property, amount } => (TxKind::Channel, *amount, self.handle_withdrawal_request(tx, *property, *amount)),
            Message::InstantTrade { property, amount, desired, desired_amount, .. } => {
                (TxKind::Channel, *amount, self.handle_instant_trade(tx, *property, *amount, *desired, *desired_amount))
            }
            Message::ContractInstant { property, amount, price, action, leverage, .. } => {
                (TxKind::Channel, *amount, self.handle_contract_instant(tx, *property, *amount, *price, *action, *leverage))
            }
            Message::Activation { feature_id, activation_block, min_client_version } => (
                TxKind::Activation,
                0,
                self.handle_activation(*feature_id, *activation_block, *min_client_version),
            ),
            Message::Deactivation { feature_id } => (TxKind::Activation, 0, self.handle_deactivation(*feature_id)),
            Message::Alert { alert_type, alert_expiry, alert_text } => (TxKind::Alert, 0, self.handle_alert(tx, *alert_type, *alert_expiry, alert_text)),
            Message::Freeze { property, amount, .. } => (TxKind::Freeze, *amount, self.handle_freeze(tx, *property, true)),
            Message::Unfreeze { property, amount, .. } => (TxKind::Freeze, *amount, self.handle_freeze(tx, *property, false)),
            Message::SendToOwners { property, amount, distribution_property } => {
                (TxKind::SendToOwners, *amount, self.handle_send_to_owners(tx, *property, *amount, *distribution_property))
            }
            _ => (TxKind::Other, 0, Err(TxError::NotPermitted)),
        };
        Dispatched { kind, amount, result }
    }

    fn handle_simple_send(&mut self, tx: &DecodedTx, property: AssetId, amount: i64) -> Result<(), TxError> {
        if amount <= 0 {
            return Err(TxError::BadParameter);
        }
        if !self.registry.exists(property) {
            return Err(TxError::NotFound);
        }
        let mut sp = self.tally.save_point();
        if !sp.update(&tx.sender, property, -amount, Bucket::Balance) {
            return Err(TxError::InsufficientFunds);
        }
        if !sp.update(&tx.reference, property, amount, Bucket::Balance) {
            return Err(TxError::InsufficientFunds);
        }
        sp.commit();
        Ok(())
    }

    fn handle_transfer(&mut self, tx: &DecodedTx, asset: AssetId, amount: i64) -> Result<(), TxError> {
        crate::channel::ChannelRegistry::transfer(&mut self.tally, &tx.sender, self.stores.trade_list.get_remaining(&tx.sender, &tx.sender, asset), amount)?;
        self.stores.trade_list.record_new_transfer(&tx.sender, &tx.sender, &tx.reference, asset, amount);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_metadex_trade(&mut self, tx: &DecodedTx, property: AssetId, amount: i64, desired_property: AssetId, desired_amount: i64) -> Result<(), TxError> {
        let outcome = self.spot_book.insert_trade(
            &mut self.tally,
            &self.activation,
            tx.sender.clone(),
            property,
            amount,
            desired_property,
            desired_amount,
            tx.block_height,
            tx.tx_index,
            tx.txid.to_string(),
        )?;
        let fee_total: i64 = outcome.fills.iter().map(|f| f.fee).sum();
        if fee_total > 0 {
            self.stores.fee_cache.add_fee(desired_property, fee_total);
        }
        for fill in &outcome.fills {
            self.stores.trade_list.record_matched_trade(&tx.txid.to_string(), &fill.maker_offer_id.0.to_string(), fill.n_could_buy, fill.n_would_pay, tx.block_height);
        }
        if outcome.residual_offer_id.is_some() {
            self.stores.trade_list.record_new_trade(&tx.txid.to_string(), property, desired_property, tx.block_height, tx.tx_index);
        }
        Ok(())
    }

    fn handle_metadex_cancel_at_price(&mut self, tx: &DecodedTx, property: AssetId, desired_property: AssetId, amount: i64, desired_amount: i64) -> Result<(), TxError> {
        let price = crate::primitives::Price::from_amounts(desired_amount, amount).ok_or(TxError::BadParameter)?;
        self.spot_book.cancel_at_price(&mut self.tally, &tx.sender, property, desired_property, price);
        Ok(())
    }

    fn handle_metadex_cancel_pair(&mut self, tx: &DecodedTx, property: AssetId, desired_property: AssetId) -> Result<(), TxError> {
        self.spot_book.cancel_pair(&mut self.tally, &tx.sender, property, desired_property);
        Ok(())
    }

    fn handle_metadex_cancel_ecosystem(&mut self, tx: &DecodedTx, ecosystem: u8) -> Result<(), TxError> {
        self.spot_book.cancel_ecosystem(&mut self.tally, &tx.sender, AssetId::RESERVED_THRESHOLD, ecosystem == 1);
        Ok(())
    }

    fn resolve_contract_id(&self, name: &str) -> Result<AssetId, TxError> {
        name.parse::<u32>().map(AssetId).map_err(|_| TxError::NotFound).and_then(|id| if self.registry.exists(id) { Ok(id) } else { Err(TxError::NotFound) })
    }

    fn handle_contractdex_trade(&mut self, tx: &DecodedTx, name: &str, amount: i64, effective_price: u64, leverage: u64, trading_action: u8) -> Result<(), TxError> {
        let contract_id = self.resolve_contract_id(name)?;
        let property = self.registry.get(contract_id).map_err(|_| TxError::NotFound)?.clone();
        let params = property.contract_params.clone().ok_or(TxError::NotPermitted)?;
        if tx.block_height < params.init_block || tx.block_height > params.init_block + params.blocks_until_expiration {
            return Err(TxError::NotPermitted);
        }
        let side = if trading_action == 1 { Side::Sell } else { Side::Buy };
        let fills = self.contract_book.insert_trade(&mut self.tally, contract_id, &params, tx.sender.clone(), side, amount, effective_price, leverage.max(1), tx.block_height, tx.tx_index)?;
        for fill in &fills {
            self.stores.trade_list.record_matched_trade(&tx.txid.to_string(), &fill.maker_offer_id.0.to_string(), fill.n_could_buy, 0, tx.block_height);
        }
        Ok(())
    }

    fn contract_params_for(&self, contract_id: AssetId) -> Result<ContractParams, TxError> {
        self.registry.get(contract_id).map_err(|_| TxError::NotFound)?.contract_params.clone().ok_or(TxError::NotPermitted)
    }

    fn handle_contractdex_cancel_ecosystem(&mut self, tx: &DecodedTx, _ecosystem: u8) -> Result<(), TxError> {
        let contract_ids: Vec<AssetId> = self.registry.iter().filter(|p| matches!(p.kind, PropertyKind::Contract | PropertyKind::OracleContract)).map(|p| p.id).collect();
        for contract_id in contract_ids {
            if let Ok(params) = self.contract_params_for(contract_id) {
                self.contract_book.cancel_all_for_contract(&mut self.tally, &params, &tx.sender, contract_id);
            }
        }
        Ok(())
    }

    fn handle_contractdex_cancel_contract(&mut self, tx: &DecodedTx, contract_id: AssetId) -> Result<(), TxError> {
        let params = self.contract_params_for(contract_id)?;
        self.contract_book.cancel_all_for_contract(&mut self.tally, &params, &tx.sender, contract_id);
        Ok(())
    }

    fn handle_contractdex_cancel_by_block(&mut self, tx: &DecodedTx, block: u8, idx: u8) -> Result<(), TxError> {
        // spec §9 open question: `block`/`idx` are wire-truncated to a single byte each.
        // Preserved as-is (no widening) since widening would break wire compatibility
        // with the undocumented source encoding; cancellation is matched against the
        // low byte of the offer's actual (block, tx_index).
        let contract_ids: Vec<AssetId> = self.registry.iter().filter(|p| matches!(p.kind, PropertyKind::Contract | PropertyKind::OracleContract)).map(|p| p.id).collect();
        for contract_id in contract_ids {
            if let Ok(params) = self.contract_params_for(contract_id) {
                self.contract_book.cancel_by_block_and_index(&mut self.tally, &params, &tx.sender, block as u32, idx as u32);
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_create_contract(
        &mut self,
        tx: &DecodedTx,
        ecosystem_byte: u8,
        blocks_until_exp: u32,
        notional_size: u32,
        collateral: AssetId,
        margin_req: u32,
        name: &str,
        oracle: bool,
    ) -> Result<(), TxError> {
        let ecosystem = if ecosystem_byte == 1 { Ecosystem::Main } else { Ecosystem::Test };
        let params = ContractParams {
            notional_size,
            margin_requirement: margin_req,
            collateral_asset: collateral,
            blocks_until_expiration: blocks_until_exp,
            init_block: tx.block_height,
            oracle_high: 0,
            oracle_low: 0,
            oracle_last_update_block: 0,
            backup_address: None,
        };
        let property = Property {
            id: AssetId(0),
            ecosystem: Ecosystem2::from(ecosystem),
            kind: if oracle { PropertyKind::OracleContract } else { PropertyKind::Contract },
            divisible: true,
            issuer: tx.sender.clone(),
            creation_block_hash: tx.txid.to_string(),
            update_block_hash: tx.txid.to_string(),
            num_tokens: 0,
            vesting_marker: false,
            contract_params: Some(params),
        };
        let id = self.registry.create(ecosystem, property.clone());
        self.stores.sp_info.put(Property { id, ..property });
        let _ = name;
        Ok(())
    }

    fn handle_set_oracle(&mut self, tx: &DecodedTx, contract_id: AssetId, oracle_high: u64, oracle_low: u64) -> Result<(), TxError> {
        let property = self.registry.get(contract_id).map_err(|_| TxError::NotFound)?;
        if property.issuer != tx.sender {
            return Err(TxError::NotPermitted);
        }
        self.registry.update(
            contract_id,
            PropertyUpdate { oracle_high: Some(oracle_high), oracle_low: Some(oracle_low), oracle_last_update_block: Some(tx.block_height), ..Default::default() },
        )
        .map_err(|_| TxError::NotFound)
    }

    fn handle_oracle_backup(&mut self, tx: &DecodedTx, contract_id: AssetId) -> Result<(), TxError> {
        let property = self.registry.get(contract_id).map_err(|_| TxError::NotFound)?;
        let params = property.contract_params.as_ref().ok_or(TxError::NotPermitted)?;
        if params.backup_address.as_ref() != Some(&tx.sender) {
            return Err(TxError::NotPermitted);
        }
        self.registry.update(contract_id, PropertyUpdate { issuer: Some(tx.sender.clone()), ..Default::default() }).map_err(|_| TxError::NotFound)
    }

    fn handle_close_oracle(&mut self, tx: &DecodedTx, contract_id: AssetId) -> Result<(), TxError> {
        let property = self.registry.get(contract_id).map_err(|_| TxError::NotFound)?;
        let params = property.contract_params.as_ref().ok_or(TxError::NotPermitted)?;
        if params.backup_address.as_ref() != Some(&tx.sender) {
            return Err(TxError::NotPermitted);
        }
        self.registry.update(contract_id, PropertyUpdate { close_oracle: true, ..Default::default() }).map_err(|_| TxError::NotFound)
    }

    fn handle_change_oracle_ref(&mut self, tx: &DecodedTx, contract_id: AssetId) -> Result<(), TxError> {
        let property = self.registry.get(contract_id).map_err(|_| TxError::NotFound)?;
        if property.issuer != tx.sender {
            return Err(TxError::NotPermitted);
        }
        // The new issuer address arrives as the tx's reference output in this wire
        // encoding (§6.3 doesn't carry it as a payload field).
        self.registry.update(contract_id, PropertyUpdate { issuer: Some(tx.reference.clone()), ..Default::default() }).map_err(|_| TxError::NotFound)
    }

    fn handle_issuance_fixed(&mut self, tx: &DecodedTx, ecosystem_byte: u8, amount: i64, name: &str) -> Result<(), TxError> {
        if amount <= 0 {
            return Err(TxError::BadParameter);
        }
        let ecosystem = if ecosystem_byte == 1 { Ecosystem::Main } else { Ecosystem::Test };
        let property = Property {
            id: AssetId(0),
            ecosystem: Ecosystem2::from(ecosystem),
            kind: PropertyKind::Fixed,
            divisible: true,
            issuer: tx.sender.clone(),
            creation_block_hash: tx.txid.to_string(),
            update_block_hash: tx.txid.to_string(),
            num_tokens: amount,
            vesting_marker: false,
            contract_params: None,
        };
        let id = self.registry.create(ecosystem, property.clone());
        self.stores.sp_info.put(Property { id, ..property });
        let mut sp = self.tally.save_point();
        sp.update(&tx.sender, id, amount, Bucket::Balance);
        sp.commit();
        let _ = name;
        Ok(())
    }

    fn handle_issuance_managed(&mut self, tx: &DecodedTx, ecosystem_byte: u8, name: &str) -> Result<(), TxError> {
        let ecosystem = if ecosystem_byte == 1 { Ecosystem::Main } else { Ecosystem::Test };
        let property = Property {
            id: AssetId(0),
            ecosystem: Ecosystem2::from(ecosystem),
            kind: PropertyKind::Managed,
            divisible: true,
            issuer: tx.sender.clone(),
            creation_block_hash: tx.txid.to_string(),
            update_block_hash: tx.txid.to_string(),
            num_tokens: 0,
            vesting_marker: false,
            contract_params: None,
        };
        let id = self.registry.create(ecosystem, property.clone());
        self.stores.sp_info.put(Property { id, ..property });
        let _ = name;
        Ok(())
    }

    fn handle_grant(&mut self, tx: &DecodedTx, property: AssetId, amount: i64) -> Result<(), TxError> {
        if amount <= 0 {
            return Err(TxError::BadParameter);
        }
        let prop = self.registry.get(property).map_err(|_| TxError::NotFound)?;
        if prop.issuer != tx.sender || prop.kind != PropertyKind::Managed {
            return Err(TxError::NotPermitted);
        }
        self.registry.update(property, PropertyUpdate { num_tokens_delta: Some(amount), ..Default::default() }).map_err(|_| TxError::NotFound)?;
        let mut sp = self.tally.save_point();
        sp.update(&tx.reference, property, amount, Bucket::Balance);
        sp.commit();
        Ok(())
    }

    fn handle_revoke(&mut self, tx: &DecodedTx, property: AssetId, amount: i64) -> Result<(), TxError> {
        if amount <= 0 {
            return Err(TxError::BadParameter);
        }
        let prop = self.registry.get(property).map_err(|_| TxError::NotFound)?;
        if prop.kind != PropertyKind::Managed {
            return Err(TxError::NotPermitted);
        }
        let mut sp = self.tally.save_point();
        if !sp.update(&tx.sender, property, -amount, Bucket::Balance) {
            return Err(TxError::InsufficientFunds);
        }
        sp.commit();
        self.registry.update(property, PropertyUpdate { num_tokens_delta: Some(-amount), ..Default::default() }).map_err(|_| TxError::NotFound)
    }

    fn handle_create_channel(&mut self, tx: &DecodedTx, multisig: Address, expiry_blocks: u8) -> Result<(), TxError> {
        self.stores.trade_list.record_new_channel(&multisig, &tx.sender, &tx.reference, tx.block_height + expiry_blocks as u32);
        Ok(())
    }

    fn handle_commit_channel(&mut self, tx: &DecodedTx, asset: AssetId, amount: i64) -> Result<(), TxError> {
        if !self.stores.trade_list.check_channel_address(&tx.reference) {
            return Err(TxError::NotFound);
        }
        crate::channel::ChannelRegistry::commit(&mut self.tally, &tx.reference, &tx.sender, asset, amount)?;
        self.stores.trade_list.record_new_commit(&tx.reference, &tx.sender, asset, amount, tx.block_height);
        Ok(())
    }

    fn handle_withdrawal_request(&mut self, tx: &DecodedTx, asset: AssetId, amount: i64) -> Result<(), TxError> {
        let remaining = self.stores.trade_list.get_remaining(&tx.reference, &tx.sender, asset);
        crate::channel::ChannelRegistry::request_withdrawal(remaining, amount)?;
        self.stores.trade_list.record_new_withdrawal(&tx.reference, &tx.sender, asset, amount, tx.block_height + params::WITHDRAWAL_DEADLINE_BLOCKS);
        Ok(())
    }

    fn handle_instant_trade(&mut self, tx: &DecodedTx, asset_a: AssetId, amount_a: i64, asset_b: AssetId, amount_b: i64) -> Result<(), TxError> {
        let (first, second, _) = self.stores.trade_list.channel_parties(&tx.reference).ok_or(TxError::NotFound)?;
        let counterparty = if tx.sender == first { second } else { first };
        crate::channel::ChannelRegistry::instant_trade(&mut self.tally, &tx.reference, &tx.sender, &counterparty, asset_a, amount_a, asset_b, amount_b)?;
        self.stores.trade_list.record_new_instant_trade(&tx.reference, tx.block_height);
        Ok(())
    }

    fn handle_contract_instant(&mut self, tx: &DecodedTx, property: AssetId, amount: i64, price: u64, action: u64, leverage: u64) -> Result<(), TxError> {
        if !self.stores.trade_list.check_channel_address(&tx.reference) {
            return Err(TxError::NotFound);
        }
        let params = self.contract_params_for(property)?;
        let side = if action == 1 { Side::Sell } else { Side::Buy };
        let fee = amount * crate::channel::CONTRACT_INSTANT_TRADE_FEE_BPS / 10_000;
        if fee > 0 {
            self.stores.fee_cache.add_fee(params.collateral_asset, fee);
        }
        self.contract_book.insert_trade(&mut self.tally, property, &params, tx.sender.clone(), side, amount - fee.max(0), price, leverage.max(1), tx.block_height, tx.tx_index)?;
        self.stores.trade_list.record_new_instant_trade(&tx.reference, tx.block_height);
        Ok(())
    }

    fn handle_activation(&mut self, feature_id: u16, activation_block: u32, min_client_version: u32) -> Result<(), TxError> {
        self.activation.schedule(ActivationRecord { feature_id, activation_block, min_client_version });
        Ok(())
    }

    fn handle_deactivation(&mut self, feature_id: u16) -> Result<(), TxError> {
        self.activation.deactivate(feature_id);
        Ok(())
    }

    fn handle_alert(&mut self, tx: &DecodedTx, alert_type: u16, alert_expiry: u32, alert_text: &str) -> Result<(), TxError> {
        self.activation.push_alert(AlertRecord { sender: tx.sender.clone(), alert_type, expiry_value: alert_expiry, message: alert_text.to_owned() });
        Ok(())
    }

    fn handle_freeze(&mut self, tx: &DecodedTx, property: AssetId, frozen: bool) -> Result<(), TxError> {
        if !self.activation.is_active(features::FREEZE_PROPERTY) {
            return Err(TxError::NotPermitted);
        }
        let prop = self.registry.get(property).map_err(|_| TxError::NotFound)?;
        if prop.issuer != tx.sender {
            return Err(TxError::NotPermitted);
        }
        self.freeze.set(tx.reference.clone(), property, frozen);
        self.tally.set_frozen(tx.reference.clone(), property, frozen);
        Ok(())
    }

    /// Distributes `amount` of `property` from the sender's `Balance` across every other
    /// holder of `distribution_property` (or `property` itself when unset), weighted by
    /// each holder's current balance of that asset. No fee is skimmed: the fee cache is
    /// written only by the spot book match path and the channel fee path (spec §5).
    /// Splits the payout with a largest-remainder allocation so shares sum to exactly
    /// `amount`; the original's own receiver-weighting helper isn't available to ground
    /// the rounding rule against, so this is a from-scratch, deterministic tie-break.
    fn handle_send_to_owners(&mut self, tx: &DecodedTx, property: AssetId, amount: i64, distribution_property: Option<AssetId>) -> Result<(), TxError> {
        if amount <= 0 {
            return Err(TxError::BadParameter);
        }
        if !self.registry.exists(property) {
            return Err(TxError::NotFound);
        }
        let weight_asset = distribution_property.unwrap_or(property);
        let holders = self.tally.balance_holders(weight_asset, &tx.sender);
        let total_weight: i64 = holders.iter().map(|(_, w)| *w).sum();
        if holders.is_empty() || total_weight <= 0 {
            return Err(TxError::NotPermitted);
        }

        let mut shares: Vec<(Address, i64, i64)> = holders
            .iter()
            .map(|(addr, weight)| {
                let scaled = *weight as i128 * amount as i128;
                let share = (scaled / total_weight as i128) as i64;
                let remainder = (scaled % total_weight as i128) as i64;
                (addr.clone(), share, remainder)
            })
            .collect();
        let mut leftover = amount - shares.iter().map(|(_, share, _)| *share).sum::<i64>();
        shares.sort_by(|a, b| b.2.cmp(&a.2).then_with(|| a.0.0.cmp(&b.0.0)));
        for (_, share, _) in shares.iter_mut() {
            if leftover == 0 {
                break;
            }
            *share += 1;
            leftover -= 1;
        }

        let mut sp = self.tally.save_point();
        if !sp.update(&tx.sender, property, -amount, Bucket::Balance) {
            return Err(TxError::InsufficientFunds);
        }
        for (addr, share, _) in &shares {
            if *share > 0 && !sp.update(addr, property, *share, Bucket::Balance) {
                return Err(TxError::InsufficientFunds);
            }
        }
        sp.commit();

        for (addr, share, _) in &shares {
            if *share > 0 {
                self.stores.sto_list.record_recipient(property, addr.clone(), *share, tx.block_height);
            }
        }
        Ok(())
    }

    /// Post-block maintenance (spec §4.7): age alerts, validate against the checkpoint
    /// table, emit the consensus hash.
    pub fn on_block_end(&mut self, height: u32, checkpoints: &BTreeMap<u32, [u8; 32]>, checkpoint_override: bool) -> Result<[u8; 32], TxError> {
        self.activation.age_alerts(height);

        let inputs = ConsensusInputs {
            tally: &self.tally,
            spot_book: &self.spot_book,
            contract_book: &self.contract_book,
            registry: &self.registry,
            fee_cache: self.stores.fee_cache.as_ref(),
            activation: &self.activation,
            freeze: &self.freeze,
        };
        let hash = consensus_hash(&inputs);

        if let Some(expected) = checkpoints.get(&height) {
            if *expected != hash && !checkpoint_override {
                return Err(TxError::Fatal);
            }
        }
        info!(height, hash = %crate::consensus::hex_hash(&hash), "block processed");
        Ok(hash)
    }

    pub fn settle_matured_withdrawal(&mut self, multisig: &Address, requester: &Address, asset: AssetId, amount: i64) -> Result<(), TxError> {
        crate::channel::ChannelRegistry::settle_withdrawal(&mut self.tally, multisig, requester, asset, amount)
    }

    pub fn fee_cache_balance(&self, asset: AssetId) -> i64 {
        self.stores.fee_cache.balance(asset)
    }

    pub fn distribute_fees(&mut self, asset: AssetId, height: u32, recipients: Vec<(Address, i64)>) {
        let total = self.stores.fee_cache.take_for_distribution(asset);
        if total <= 0 {
            return;
        }
        let mut sp = self.tally.save_point();
        for (addr, share) in &recipients {
            sp.update(addr, asset, *share, Bucket::Balance);
        }
        sp.commit();
        self.stores.fee_history.record_distribution(asset, height, recipients);
    }

    pub fn sto_recipients(&self, property: AssetId, block: u32) -> Vec<(Address, i64)> {
        self.stores.sto_list.recipients(property, block)
    }

    pub fn get_balance(&self, address: &Address, asset: AssetId) -> i64 {
        self.tally.balance(address, asset, Bucket::Balance)
    }

    pub fn get_reserved_balance(&self, address: &Address, asset: AssetId) -> i64 {
        self.tally.reserved_balance(address, asset)
    }

    pub fn get_available_balance(&self, address: &Address, asset: AssetId) -> i64 {
        self.tally.available_balance(address, asset)
    }

    pub fn get_trade_status(&self, hash: &str) -> Option<bool> {
        self.stores.tx_list.valid(hash)
    }
}
