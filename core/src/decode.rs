//! Transaction decoder (spec §4.3, wire format §6.3). Pure: performs no ledger writes,
//! only classifies a base-chain transaction into a typed protocol message.

use bitcoin::Txid;

use crate::chain_view::{ChainView, Tx};
use crate::errors::DecodeError;
use crate::primitives::{Address, AssetId};

pub const MARKER: &[u8] = b"tl";
pub const MAX_PACKETS: usize = 64;
pub const PACKET_SIZE: usize = 8 * 31; // matches the Class-C data-carrier convention

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    SimpleSend { property: AssetId, amount: i64 },
    SendToOwners { property: AssetId, amount: i64, distribution_property: Option<AssetId> },
    SendAll { ecosystem: u8 },
    SendVesting { property: AssetId, amount: i64 },
    TradeOffer { property: AssetId, amount: i64, amount_desired: i64, time_limit: u8, min_fee: i64, subaction: Option<u8> },
    AcceptOffer { property: AssetId, amount: i64 },
    MetaDexTrade { property: AssetId, amount: i64, desired_property: AssetId, desired_amount: i64 },
    MetaDexCancelAtPrice { property: AssetId, amount: i64, desired_property: AssetId, desired_amount: i64 },
    MetaDexCancelPair { property: AssetId, desired_property: AssetId },
    MetaDexCancelEcosystem { ecosystem: u8 },
    ContractDexTrade { amount: i64, effective_price: u64, leverage: u64, trading_action: u8, name: String },
    ContractDexCancelEcosystem { ecosystem: u8 },
    ContractDexCancelContract { ecosystem: u8, contract_id: AssetId },
    ContractDexCancelByBlock { block: u8, idx: u8 },
    CreateContract { ecosystem: u8, blocks_until_exp: u32, notional_size: u32, collateral: AssetId, margin_req: u32, name: String },
    IssuanceFixed { ecosystem: u8, kind: u16, prev_id: u32, category: String, subcat: String, name: String, url: String, data: String, amount: i64 },
    IssuanceCrowdsale {
        ecosystem: u8,
        kind: u16,
        prev_id: u32,
        category: String,
        subcat: String,
        name: String,
        url: String,
        data: String,
        amount: i64,
        desired: AssetId,
        rate: i64,
        deadline: i64,
        early_bonus: u8,
        percentage: u8,
    },
    IssuanceManaged { ecosystem: u8, kind: u16, prev_id: u32, category: String, subcat: String, name: String, url: String, data: String },
    Grant { property: AssetId, amount: i64, memo: String },
    Revoke { property: AssetId, amount: i64, memo: String },
    CreateOracleContract { ecosystem: u8, blocks_until_exp: u32, notional_size: u32, collateral: AssetId, margin_req: u32, name: String },
    ChangeOracleRef { contract_id: AssetId },
    SetOracle { oracle_high: u64, oracle_low: u64, property: AssetId },
    OracleBackup { contract_id: AssetId },
    CloseOracle { contract_id: AssetId },
    CommitChannel { property: AssetId, amount: i64 },
    WithdrawalFromChannel { property: AssetId, amount: i64 },
    InstantTrade { property: AssetId, amount: i64, expiry: u8, desired: AssetId, desired_amount: i64 },
    Transfer { property: AssetId, amount: i64 },
    CreateChannel { expiry_blocks: u8, address: Address },
    ContractInstant { property: AssetId, amount: i64, expiry: u8, price: u64, action: u64, leverage: u64 },
    NewIdRegistration { tokens: u8, ltc: u8, natives: u8, oracles: u8, website: String, company: String },
    UpdateIdRegistration,
    DExPayment,
    Freeze { property: AssetId, amount: i64, address_version: u8, address_hash160: [u8; 20] },
    Unfreeze { property: AssetId, amount: i64, address_version: u8, address_hash160: [u8; 20] },
    Deactivation { feature_id: u16 },
    Activation { feature_id: u16, activation_block: u32, min_client_version: u32 },
    Alert { alert_type: u16, alert_expiry: u32, alert_text: String },
}

#[derive(Debug, Clone)]
pub struct DecodedTx {
    pub txid: Txid,
    pub sender: Address,
    pub reference: Address,
    pub fee_paid: i64,
    pub version: u16,
    pub message: Message,
    pub block_height: u32,
    pub tx_index: u32,
    pub block_time: i64,
}

/// Cursor over a payload buffer, reading big-endian fixed-width fields and
/// null-terminated, 255-byte-capped UTF-8 strings (spec §4.3 step 6).
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn need(&self, n: usize) -> Result<(), DecodeError> {
        if self.pos + n > self.buf.len() {
            Err(DecodeError::Malformed)
        } else {
            Ok(())
        }
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        self.need(1)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        self.need(2)?;
        let v = u16::from_be_bytes(self.buf[self.pos..self.pos + 2].try_into().unwrap());
        self.pos += 2;
        Ok(v)
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        self.need(4)?;
        let v = u32::from_be_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        self.need(8)?;
        let v = u64::from_be_bytes(self.buf[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        Ok(v)
    }

    fn i64(&mut self) -> Result<i64, DecodeError> {
        Ok(self.u64()? as i64)
    }

    fn fixed(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        self.need(n)?;
        let v = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(v)
    }

    fn remaining(&self) -> bool {
        self.pos < self.buf.len()
    }

    /// Null-terminated UTF-8 string, truncated to 255 bytes (spec §6.3).
    fn cstr(&mut self) -> Result<String, DecodeError> {
        let start = self.pos;
        let mut end = start;
        while end < self.buf.len() && self.buf[end] != 0 {
            end += 1;
        }
        if end >= self.buf.len() {
            return Err(DecodeError::Malformed);
        }
        let bytes = &self.buf[start..end.min(start + 255)];
        self.pos = end + 1;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::Malformed)
    }
}

/// Concatenates the marker-prefixed data-carrier outputs in order, strips the marker,
/// and caps the result at `MAX_PACKETS * PACKET_SIZE` bytes (spec §4.3 step 4).
pub fn extract_payload(tx_outputs: &[crate::chain_view::TxOutput]) -> Option<Vec<u8>> {
    let mut payload = Vec::new();
    let mut found = false;
    for out in tx_outputs {
        if !out.is_null_data {
            continue;
        }
        if let Some(body) = out.script.strip_prefix(MARKER) {
            found = true;
            payload.extend_from_slice(body);
        }
    }
    if !found {
        return None;
    }
    payload.truncate(MAX_PACKETS * PACKET_SIZE);
    Some(payload)
}

fn parse_body(msg_type: u16, version: u16, r: &mut Reader) -> Result<Message, DecodeError> {
    Ok(match msg_type {
        0 => Message::SimpleSend { property: AssetId(r.u32()?), amount: r.i64()? },
        3 => {
            let property = AssetId(r.u32()?);
            let amount = r.i64()?;
            let distribution_property = if version >= 1 && r.remaining() { Some(AssetId(r.u32()?)) } else { None };
            Message::SendToOwners { property, amount, distribution_property }
        }
        4 => Message::SendAll { ecosystem: r.u8()? },
        5 => Message::SendVesting { property: AssetId(r.u32()?), amount: r.i64()? },
        20 => {
            let property = AssetId(r.u32()?);
            let amount = r.i64()?;
            let amount_desired = r.i64()?;
            let time_limit = r.u8()?;
            let min_fee = r.i64()?;
            let subaction = if version >= 1 && r.remaining() { Some(r.u8()?) } else { None };
            Message::TradeOffer { property, amount, amount_desired, time_limit, min_fee, subaction }
        }
        22 => Message::AcceptOffer { property: AssetId(r.u32()?), amount: r.i64()? },
        25 => Message::MetaDexTrade {
            property: AssetId(r.u32()?),
            amount: r.i64()?,
            desired_property: AssetId(r.u32()?),
            desired_amount: r.i64()?,
        },
        26 => Message::MetaDexCancelAtPrice {
            property: AssetId(r.u32()?),
            amount: r.i64()?,
            desired_property: AssetId(r.u32()?),
            desired_amount: r.i64()?,
        },
        27 => Message::MetaDexCancelPair { property: AssetId(r.u32()?), desired_property: AssetId(r.u32()?) },
        28 => Message::MetaDexCancelEcosystem { ecosystem: r.u8()? },
        29 => {
            let amount = r.i64()?;
            let effective_price = r.u64()?;
            let leverage = r.u64()?;
            let trading_action = r.u8()?;
            let name = r.cstr()?;
            Message::ContractDexTrade { amount, effective_price, leverage, trading_action, name }
        }
        32 => Message::ContractDexCancelEcosystem { ecosystem: r.u8()? },
        33 => Message::ContractDexCancelContract { ecosystem: r.u8()?, contract_id: AssetId(r.u32()?) },
        34 => Message::ContractDexCancelByBlock { block: r.u8()?, idx: r.u8()? },
        41 => {
            let ecosystem = r.u8()?;
            let blocks_until_exp = r.u32()?;
            let notional_size = r.u32()?;
            let collateral = AssetId(r.u32()?);
            let margin_req = r.u32()?;
            let name = r.cstr()?;
            Message::CreateContract { ecosystem, blocks_until_exp, notional_size, collateral, margin_req, name }
        }
        50 => {
            let ecosystem = r.u8()?;
            let kind = r.u16()?;
            let prev_id = r.u32()?;
            let category = r.cstr()?;
            let subcat = r.cstr()?;
            let name = r.cstr()?;
            let url = r.cstr()?;
            let data = r.cstr()?;
            let amount = r.i64()?;
            Message::IssuanceFixed { ecosystem, kind, prev_id, category, subcat, name, url, data, amount }
        }
        51 => {
            let ecosystem = r.u8()?;
            let kind = r.u16()?;
            let prev_id = r.u32()?;
            let category = r.cstr()?;
            let subcat = r.cstr()?;
            let name = r.cstr()?;
            let url = r.cstr()?;
            let data = r.cstr()?;
            let amount = r.i64()?;
            let desired = AssetId(r.u32()?);
            let rate = r.i64()?;
            let deadline = r.i64()?;
            let early_bonus = r.u8()?;
            let percentage = r.u8()?;
            Message::IssuanceCrowdsale {
                ecosystem,
                kind,
                prev_id,
                category,
                subcat,
                name,
                url,
                data,
                amount,
                desired,
                rate,
                deadline,
                early_bonus,
                percentage,
            }
        }
        54 => {
            let ecosystem = r.u8()?;
            let kind = r.u16()?;
            let prev_id = r.u32()?;
            let category = r.cstr()?;
            let subcat = r.cstr()?;
            let name = r.cstr()?;
            let url = r.cstr()?;
            let data = r.cstr()?;
            Message::IssuanceManaged { ecosystem, kind, prev_id, category, subcat, name, url, data }
        }
        55 => Message::Grant { property: AssetId(r.u32()?), amount: r.i64()?, memo: r.cstr()? },
        56 => Message::Revoke { property: AssetId(r.u32()?), amount: r.i64()?, memo: r.cstr()? },
        103 => {
            let ecosystem = r.u8()?;
            let blocks_until_exp = r.u32()?;
            let notional_size = r.u32()?;
            let collateral = AssetId(r.u32()?);
            let margin_req = r.u32()?;
            let name = r.cstr()?;
            Message::CreateOracleContract { ecosystem, blocks_until_exp, notional_size, collateral, margin_req, name }
        }
        104 => Message::ChangeOracleRef { contract_id: AssetId(r.u32()?) },
        105 => Message::SetOracle { oracle_high: r.u64()?, oracle_low: r.u64()?, property: AssetId(r.u32()?) },
        106 => Message::OracleBackup { contract_id: AssetId(r.u32()?) },
        107 => Message::CloseOracle { contract_id: AssetId(r.u32()?) },
        108 => Message::CommitChannel { property: AssetId(r.u32()?), amount: r.i64()? },
        109 => Message::WithdrawalFromChannel { property: AssetId(r.u32()?), amount: r.i64()? },
        110 => Message::InstantTrade {
            property: AssetId(r.u32()?),
            amount: r.i64()?,
            expiry: r.u8()?,
            desired: AssetId(r.u32()?),
            desired_amount: r.i64()?,
        },
        112 => Message::Transfer { property: AssetId(r.u32()?), amount: r.i64()? },
        113 => {
            let expiry_blocks = r.u8()?;
            let address = r.cstr()?;
            Message::CreateChannel { expiry_blocks, address: Address(address) }
        }
        114 => Message::ContractInstant {
            property: AssetId(r.u32()?),
            amount: r.i64()?,
            expiry: r.u8()?,
            price: r.u64()?,
            action: r.u64()?,
            leverage: r.u64()?,
        },
        115 => {
            let tokens = r.u8()?;
            let ltc = r.u8()?;
            let natives = r.u8()?;
            let oracles = r.u8()?;
            let website = r.cstr()?;
            let company = r.cstr()?;
            Message::NewIdRegistration { tokens, ltc, natives, oracles, website, company }
        }
        116 => Message::UpdateIdRegistration,
        117 => Message::DExPayment,
        185 => {
            let property = AssetId(r.u32()?);
            let amount = r.i64()?;
            let address_version = r.u8()?;
            let hash = r.fixed(20)?;
            let mut address_hash160 = [0u8; 20];
            address_hash160.copy_from_slice(hash);
            Message::Freeze { property, amount, address_version, address_hash160 }
        }
        186 => {
            let property = AssetId(r.u32()?);
            let amount = r.i64()?;
            let address_version = r.u8()?;
            let hash = r.fixed(20)?;
            let mut address_hash160 = [0u8; 20];
            address_hash160.copy_from_slice(hash);
            Message::Unfreeze { property, amount, address_version, address_hash160 }
        }
        65533 => {
            let feature_id = r.u16()?;
            Message::Deactivation { feature_id }
        }
        65534 => {
            let feature_id = r.u16()?;
            let activation_block = r.u32()?;
            let min_client_version = r.u32()?;
            Message::Activation { feature_id, activation_block, min_client_version }
        }
        65535 => Message::Alert { alert_type: r.u16()?, alert_expiry: r.u32()?, alert_text: r.cstr()? },
        other => return Err(DecodeError::UnknownType(other)),
    })
}

/// Decodes a base-chain transaction into a typed protocol message (spec §4.3).
pub fn decode(chain: &dyn ChainView, tx: &Tx, block_height: u32, tx_index: u32, block_time: i64) -> Result<DecodedTx, DecodeError> {
    let payload = extract_payload(&tx.outputs).ok_or(DecodeError::NoMarker)?;

    let first_input = tx.inputs.first().ok_or(DecodeError::MissingInput)?;
    let sender_str = chain
        .resolve_output_address(&first_input.prev_txid, first_input.prev_vout)
        .ok_or(DecodeError::MissingInput)?;
    let sender = Address(sender_str);

    let reference = tx
        .outputs
        .iter()
        .rev()
        .find_map(|o| o.address.as_ref().filter(|a| **a != sender.0))
        .map(|a| Address(a.clone()))
        .unwrap_or_else(|| sender.clone());

    let input_total: u64 = tx
        .inputs
        .iter()
        .filter_map(|i| chain.resolve_output_value(&i.prev_txid, i.prev_vout))
        .sum();
    let output_total: u64 = tx.outputs.iter().map(|o| o.value_sat).sum();
    let fee_paid = input_total as i64 - output_total as i64;

    let mut reader = Reader::new(&payload);
    let version = reader.u16()?;
    let msg_type = reader.u16()?;
    let message = parse_body(msg_type, version, &mut reader)?;

    Ok(DecodedTx { txid: tx.txid, sender, reference, fee_paid, version, message, block_height, tx_index, block_time })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_view::TxOutput;

    fn marker_output(body: &[u8]) -> TxOutput {
        let mut script = MARKER.to_vec();
        script.extend_from_slice(body);
        TxOutput { value_sat: 0, script, address: None, is_null_data: true }
    }

    #[test]
    fn decodes_simple_send() {
        let mut body = vec![0, 1]; // version 1
        body.extend_from_slice(&0u16.to_be_bytes()); // type 0
        body.extend_from_slice(&5u32.to_be_bytes()); // property
        body.extend_from_slice(&15000000i64.to_be_bytes()); // amount
        let payload = extract_payload(&[marker_output(&body)]).unwrap();
        let mut reader = Reader::new(&payload);
        let version = reader.u16().unwrap();
        let msg_type = reader.u16().unwrap();
        let msg = parse_body(msg_type, version, &mut reader).unwrap();
        assert_eq!(msg, Message::SimpleSend { property: AssetId(5), amount: 15_000_000 });
    }

    #[test]
    fn rejects_missing_marker() {
        let out = TxOutput { value_sat: 0, script: vec![1, 2, 3], address: None, is_null_data: true };
        assert!(extract_payload(&[out]).is_none());
    }

    #[test]
    fn truncates_string_fields() {
        let mut body = vec![0, 1, 0, 55]; // version 1, type 55 (Grant)
        body.extend_from_slice(&7u32.to_be_bytes());
        body.extend_from_slice(&1i64.to_be_bytes());
        body.push(b'h');
        body.push(0);
        let payload = extract_payload(&[marker_output(&body)]).unwrap();
        let mut reader = Reader::new(&payload);
        let version = reader.u16().unwrap();
        let msg_type = reader.u16().unwrap();
        let msg = parse_body(msg_type, version, &mut reader).unwrap();
        assert_eq!(msg, Message::Grant { property: AssetId(7), amount: 1, memo: "h".into() });
    }

    #[test]
    fn overrun_is_malformed() {
        let body = vec![0, 1, 0, 0, 0, 0]; // version, type=0 (SimpleSend), truncated body
        let payload = extract_payload(&[marker_output(&body)]).unwrap();
        let mut reader = Reader::new(&payload);
        let version = reader.u16().unwrap();
        let msg_type = reader.u16().unwrap();
        assert_eq!(parse_body(msg_type, version, &mut reader), Err(DecodeError::Malformed));
    }
}
