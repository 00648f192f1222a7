use alloy_dyn_abi::DynSolValue;
use alloy_primitives::U256;

use crate::{
    Account,
    Entity,
    TypeCharacter,
    parse_address,
};

/// A fresh character with the base stats the ledger program hands out.
pub fn new_entity(id: u64, kind: TypeCharacter) -> Entity {
    Entity {
        id,
        dna: U256::from(id.wrapping_mul(7919)),
        xp: 1,
        hp: 100,
        attack: 10,
        armor: 10,
        mana: 10,
        magic_resistance: 10,
        type_character: kind.code(),
    }
}

pub fn entity_with_xp(id: u64, xp: u64) -> Entity {
    Entity {
        xp,
        ..new_entity(id, TypeCharacter::Berserker)
    }
}

/// Return data of a `get*Characters` read.
pub fn encode_entities(entities: &[Entity]) -> Vec<u8> {
    let items = entities
        .iter()
        .map(|e| {
            DynSolValue::Tuple(vec![
                DynSolValue::Uint(U256::from(e.id), 256),
                DynSolValue::Uint(e.dna, 256),
                DynSolValue::Uint(U256::from(e.xp), 256),
                DynSolValue::Uint(U256::from(e.hp), 256),
                DynSolValue::Uint(U256::from(e.attack), 256),
                DynSolValue::Uint(U256::from(e.armor), 256),
                DynSolValue::Uint(U256::from(e.mana), 256),
                DynSolValue::Uint(U256::from(e.magic_resistance), 256),
                DynSolValue::Uint(U256::from(e.type_character), 8),
            ])
        })
        .collect();
    DynSolValue::Tuple(vec![DynSolValue::Array(items)]).abi_encode_params()
}

/// Return data of `owner()`.
pub fn encode_owner(owner: &Account) -> Vec<u8> {
    let address = parse_address(owner).expect("test owner must be a valid address");
    DynSolValue::Address(address).abi_encode()
}
