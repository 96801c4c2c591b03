//! Payment channel sub-ledger (spec §4.6): multisig channel creation, commits,
//! withdrawals with a cooling-off deadline, transfers and instant trades.

use crate::errors::TxError;
use crate::primitives::{Address, AssetId};
use crate::tally::{Bucket, TallyLedger};

/// Blocks a withdrawal request must wait before it matures (spec §4.6.3).
pub const WITHDRAWAL_DEADLINE_BLOCKS: u32 = 7;

/// Fee skimmed off a contract instant trade settled inside a channel (spec §4.6.5):
/// 1.25% of the traded amount into the fee cache. A plain `InstantTrade` carries no fee
/// (spec §4.6.5 only names "record the trade"; the original's `logicMath_Instant_Trade`
/// moves both legs at full value).
pub const CONTRACT_INSTANT_TRADE_FEE_BPS: i64 = 125;

pub struct ChannelRegistry;

impl ChannelRegistry {
    /// Moves `amount` from `sender`'s `Balance` into the channel's `ChannelReserve`
    /// bucket, tallied under the multisig address (spec §4.6.2).
    pub fn commit(
        ledger: &mut TallyLedger,
        multisig: &Address,
        sender: &Address,
        asset: AssetId,
        amount: i64,
    ) -> Result<(), TxError> {
        if amount <= 0 {
            return Err(TxError::BadParameter);
        }
        let mut sp = ledger.save_point();
        if !sp.update(sender, asset, -amount, Bucket::Balance) {
            return Err(TxError::InsufficientFunds);
        }
        if !sp.update(multisig, asset, amount, Bucket::ChannelReserve) {
            return Err(TxError::InsufficientFunds);
        }
        sp.commit();
        Ok(())
    }

    /// Requests a withdrawal; the caller (engine) is responsible for scheduling
    /// `WITHDRAWAL_DEADLINE_BLOCKS` ahead and calling `settle_withdrawal` once matured.
    pub fn request_withdrawal(remaining: i64, amount: i64) -> Result<(), TxError> {
        if amount <= 0 || amount > remaining {
            return Err(TxError::InsufficientFunds);
        }
        Ok(())
    }

    /// Moves a matured withdrawal out of the multisig's `ChannelReserve` back to the
    /// requester's `Balance` (spec §4.6.3: "after the deadline, anyone may settle").
    pub fn settle_withdrawal(
        ledger: &mut TallyLedger,
        multisig: &Address,
        requester: &Address,
        asset: AssetId,
        amount: i64,
    ) -> Result<(), TxError> {
        let mut sp = ledger.save_point();
        if !sp.update(multisig, asset, -amount, Bucket::ChannelReserve) {
            return Err(TxError::InsufficientFunds);
        }
        if !sp.update(requester, asset, amount, Bucket::Balance) {
            return Err(TxError::InsufficientFunds);
        }
        sp.commit();
        Ok(())
    }

    /// Moves committed funds from one party's share to the other's within the same
    /// channel, without ever leaving the `ChannelReserve` bucket (spec §4.6.4).
    pub fn transfer(
        ledger: &mut TallyLedger,
        multisig: &Address,
        from_remaining: i64,
        amount: i64,
    ) -> Result<(), TxError> {
        if amount <= 0 || amount > from_remaining {
            return Err(TxError::InsufficientFunds);
        }
        // The multisig's aggregate ChannelReserve bucket is unaffected; bookkeeping of
        // per-party shares lives in `DbTradeList::get_remaining`, not the tally ledger.
        let _ = (ledger, multisig);
        Ok(())
    }

    /// Settles an instant trade between the two channel counterparties (spec §4.6.5):
    /// `sender` gives up `amount_a` of `asset_a` from the multisig's reserve, which
    /// lands in `counterparty`'s `Balance`; `counterparty` gives up `amount_b` of
    /// `asset_b` from the reserve, which lands in `sender`'s `Balance`. Grounded on the
    /// original's `logicMath_Instant_Trade`: `update_tally_map(chnAddrs.second,
    /// property, amount_forsale, BALANCE)` paired with `update_tally_map(sender,
    /// property, -amount_forsale, CHANNEL_RESERVE)`, and the mirror pair for the
    /// desired side.
    pub fn instant_trade(
        ledger: &mut TallyLedger,
        multisig: &Address,
        sender: &Address,
        counterparty: &Address,
        asset_a: AssetId,
        amount_a: i64,
        asset_b: AssetId,
        amount_b: i64,
    ) -> Result<(), TxError> {
        if amount_a <= 0 || amount_b <= 0 {
            return Err(TxError::BadParameter);
        }

        let mut sp = ledger.save_point();
        if !sp.update(multisig, asset_a, -amount_a, Bucket::ChannelReserve) {
            return Err(TxError::InsufficientFunds);
        }
        if !sp.update(counterparty, asset_a, amount_a, Bucket::Balance) {
            return Err(TxError::InsufficientFunds);
        }
        if !sp.update(multisig, asset_b, -amount_b, Bucket::ChannelReserve) {
            return Err(TxError::InsufficientFunds);
        }
        if !sp.update(sender, asset_b, amount_b, Bucket::Balance) {
            return Err(TxError::InsufficientFunds);
        }
        sp.commit();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        Address(s.to_owned())
    }

    #[test]
    fn commit_moves_balance_into_channel_reserve() {
        let mut ledger = TallyLedger::new();
        {
            let mut sp = ledger.save_point();
            sp.update(&addr("alice"), AssetId(1), 500, Bucket::Balance);
            sp.commit();
        }
        ChannelRegistry::commit(&mut ledger, &addr("multisig"), &addr("alice"), AssetId(1), 200).unwrap();
        assert_eq!(ledger.balance(&addr("alice"), AssetId(1), Bucket::Balance), 300);
        assert_eq!(ledger.balance(&addr("multisig"), AssetId(1), Bucket::ChannelReserve), 200);
    }

    #[test]
    fn withdrawal_rejects_amount_over_remaining() {
        assert!(ChannelRegistry::request_withdrawal(50, 100).is_err());
        assert!(ChannelRegistry::request_withdrawal(50, 50).is_ok());
    }

    #[test]
    fn settle_withdrawal_moves_funds_back_to_requester() {
        let mut ledger = TallyLedger::new();
        {
            let mut sp = ledger.save_point();
            sp.update(&addr("multisig"), AssetId(1), 200, Bucket::ChannelReserve);
            sp.commit();
        }
        ChannelRegistry::settle_withdrawal(&mut ledger, &addr("multisig"), &addr("alice"), AssetId(1), 200).unwrap();
        assert_eq!(ledger.balance(&addr("alice"), AssetId(1), Bucket::Balance), 200);
        assert_eq!(ledger.balance(&addr("multisig"), AssetId(1), Bucket::ChannelReserve), 0);
    }

    #[test]
    fn instant_trade_credits_each_partys_balance() {
        let mut ledger = TallyLedger::new();
        {
            let mut sp = ledger.save_point();
            sp.update(&addr("multisig"), AssetId(1), 1_000_00, Bucket::ChannelReserve);
            sp.update(&addr("multisig"), AssetId(2), 1_000_00, Bucket::ChannelReserve);
            sp.commit();
        }
        ChannelRegistry::instant_trade(&mut ledger, &addr("multisig"), &addr("alice"), &addr("bob"), AssetId(1), 100_00, AssetId(2), 50_00).unwrap();

        assert_eq!(ledger.balance(&addr("bob"), AssetId(1), Bucket::Balance), 100_00);
        assert_eq!(ledger.balance(&addr("alice"), AssetId(2), Bucket::Balance), 50_00);
        assert_eq!(ledger.balance(&addr("multisig"), AssetId(1), Bucket::ChannelReserve), 900_00);
        assert_eq!(ledger.balance(&addr("multisig"), AssetId(2), Bucket::ChannelReserve), 950_00);
    }

    #[test]
    fn instant_trade_rejects_when_reserve_is_short() {
        let mut ledger = TallyLedger::new();
        {
            let mut sp = ledger.save_point();
            sp.update(&addr("multisig"), AssetId(1), 10_00, Bucket::ChannelReserve);
            sp.update(&addr("multisig"), AssetId(2), 1_000_00, Bucket::ChannelReserve);
            sp.commit();
        }
        let err = ChannelRegistry::instant_trade(&mut ledger, &addr("multisig"), &addr("alice"), &addr("bob"), AssetId(1), 100_00, AssetId(2), 50_00).unwrap_err();
        assert_eq!(err, TxError::InsufficientFunds);
        assert_eq!(ledger.balance(&addr("multisig"), AssetId(1), Bucket::ChannelReserve), 10_00);
    }
}
