//! `ChainView`: the base-chain read interface the decoder consumes (spec §6.1). This
//! crate never parses scripts or walks the base chain's own index; it only calls out
//! through this trait, the way the teacher's `btc::rpc::BtcRpcApi` sits between the
//! engine and `bitcoincore_rpc`.

use bitcoin::Txid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    MainNet,
    TestNet,
    RegTest,
}

#[derive(Debug, Clone)]
pub struct TxOutput {
    pub value_sat: u64,
    pub script: Vec<u8>,
    /// Resolved destination address, when the output is a standard spendable one.
    pub address: Option<String>,
    pub is_null_data: bool,
}

#[derive(Debug, Clone)]
pub struct TxInput {
    pub prev_txid: Txid,
    pub prev_vout: u32,
}

#[derive(Debug, Clone)]
pub struct Tx {
    pub txid: Txid,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

pub trait ChainView {
    fn get_block_hash(&self, height: u32) -> Option<String>;
    fn get_block_time(&self, height: u32) -> Option<i64>;
    fn get_tx(&self, hash: &Txid) -> Option<Tx>;
    /// Resolves the destination address of a previous output, the one piece of
    /// script-level knowledge the decoder needs (spec §4.3 step 2).
    fn resolve_output_address(&self, txid: &Txid, vout: u32) -> Option<String>;
    /// Resolves the value of a previous output, used for the fee-paid computation
    /// (spec §4.3 step 5).
    fn resolve_output_value(&self, txid: &Txid, vout: u32) -> Option<u64>;
    fn height(&self) -> i32;
    fn network(&self) -> Network;
}
