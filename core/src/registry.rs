//! Property registry: asset metadata, issuance, and contract parameters (spec §4.2).

use std::collections::BTreeMap;

use crate::primitives::{Address, AssetId, Ecosystem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PropertyKind {
    Fixed,
    Managed,
    Crowdsale,
    Contract,
    OracleContract,
    Pegged,
    Vesting,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ContractParams {
    pub notional_size: u32,
    pub margin_requirement: u32,
    pub collateral_asset: AssetId,
    pub blocks_until_expiration: u32,
    pub init_block: u32,
    pub oracle_high: u64,
    pub oracle_low: u64,
    pub oracle_last_update_block: u32,
    pub backup_address: Option<Address>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Property {
    pub id: AssetId,
    pub ecosystem: Ecosystem2,
    pub kind: PropertyKind,
    pub divisible: bool,
    pub issuer: Address,
    pub creation_block_hash: String,
    pub update_block_hash: String,
    pub num_tokens: i64,
    pub vesting_marker: bool,
    pub contract_params: Option<ContractParams>,
}

/// Serializable mirror of `Ecosystem` (the primitives enum intentionally omits
/// `serde` derives since it never crosses a persistence boundary on its own).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Ecosystem2 {
    Main,
    Test,
}

impl From<Ecosystem> for Ecosystem2 {
    fn from(e: Ecosystem) -> Self {
        match e {
            Ecosystem::Main => Ecosystem2::Main,
            Ecosystem::Test => Ecosystem2::Test,
        }
    }
}

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    #[error("property not found")]
    NotFound,
    #[error("field not permitted for update")]
    NotPermitted,
}

/// Fields permitted on `update` (spec §4.2): issuer, update_block_hash, oracle fields,
/// blocks_until_expiration-to-zero (closing an oracle contract), and historical
/// grant/revoke deltas applied to `num_tokens`.
#[derive(Debug, Clone, Default)]
pub struct PropertyUpdate {
    pub issuer: Option<Address>,
    pub update_block_hash: Option<String>,
    pub oracle_high: Option<u64>,
    pub oracle_low: Option<u64>,
    pub oracle_last_update_block: Option<u32>,
    pub close_oracle: bool,
    pub num_tokens_delta: Option<i64>,
}

#[derive(Default)]
pub struct PropertyRegistry {
    properties: BTreeMap<AssetId, Property>,
    next_main: u32,
    next_test: u32,
}

impl PropertyRegistry {
    pub fn new() -> Self {
        PropertyRegistry {
            properties: BTreeMap::new(),
            next_main: AssetId::RESERVED_THRESHOLD,
            next_test: AssetId::RESERVED_THRESHOLD + 1_000_000,
        }
    }

    pub fn peek_next_id(&self, ecosystem: Ecosystem) -> AssetId {
        match ecosystem {
            Ecosystem::Main => AssetId(self.next_main),
            Ecosystem::Test => AssetId(self.next_test),
        }
    }

    /// Assigns the next id for `ecosystem` and stores `entry` under it. Ids are
    /// monotone per ecosystem (spec §4.2 invariant).
    pub fn create(&mut self, ecosystem: Ecosystem, mut entry: Property) -> AssetId {
        let id = self.peek_next_id(ecosystem);
        entry.id = id;
        entry.ecosystem = ecosystem.into();
        match ecosystem {
            Ecosystem::Main => self.next_main += 1,
            Ecosystem::Test => self.next_test += 1,
        }
        self.properties.insert(id, entry);
        id
    }

    pub fn get(&self, id: AssetId) -> Result<&Property, RegistryError> {
        self.properties.get(&id).ok_or(RegistryError::NotFound)
    }

    pub fn get_mut(&mut self, id: AssetId) -> Result<&mut Property, RegistryError> {
        self.properties.get_mut(&id).ok_or(RegistryError::NotFound)
    }

    pub fn exists(&self, id: AssetId) -> bool {
        self.properties.contains_key(&id)
    }

    pub fn update(&mut self, id: AssetId, update: PropertyUpdate) -> Result<(), RegistryError> {
        let prop = self.get_mut(id)?;
        if let Some(issuer) = update.issuer {
            prop.issuer = issuer;
        }
        if let Some(hash) = update.update_block_hash {
            prop.update_block_hash = hash;
        }
        if let Some(delta) = update.num_tokens_delta {
            prop.num_tokens = prop.num_tokens.saturating_add(delta);
        }
        if let Some(params) = prop.contract_params.as_mut() {
            if let Some(h) = update.oracle_high {
                params.oracle_high = h;
            }
            if let Some(l) = update.oracle_low {
                params.oracle_low = l;
            }
            if let Some(b) = update.oracle_last_update_block {
                params.oracle_last_update_block = b;
            }
            if update.close_oracle {
                params.blocks_until_expiration = 0;
            }
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Property> {
        self.properties.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(issuer: &str, kind: PropertyKind) -> Property {
        Property {
            id: AssetId(0),
            ecosystem: Ecosystem2::Main,
            kind,
            divisible: true,
            issuer: Address(issuer.to_owned()),
            creation_block_hash: "hash".into(),
            update_block_hash: "hash".into(),
            num_tokens: 1_000_000,
            vesting_marker: false,
            contract_params: None,
        }
    }

    #[test]
    fn ids_are_monotone_per_ecosystem() {
        let mut reg = PropertyRegistry::new();
        let a = reg.create(Ecosystem::Main, sample("alice", PropertyKind::Fixed));
        let b = reg.create(Ecosystem::Main, sample("alice", PropertyKind::Fixed));
        assert!(b.0 > a.0);
    }

    #[test]
    fn ecosystems_allocate_independently() {
        let mut reg = PropertyRegistry::new();
        let main_id = reg.create(Ecosystem::Main, sample("alice", PropertyKind::Fixed));
        let test_id = reg.create(Ecosystem::Test, sample("alice", PropertyKind::Fixed));
        assert_ne!(main_id, test_id);
    }

    #[test]
    fn update_not_found_errors() {
        let mut reg = PropertyRegistry::new();
        let err = reg.update(AssetId(999), PropertyUpdate::default()).unwrap_err();
        assert_eq!(err, RegistryError::NotFound);
    }
}
