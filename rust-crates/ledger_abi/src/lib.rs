use alloy_dyn_abi::{
    DynSolType,
    DynSolValue,
};
use alloy_primitives::{
    Address,
    U256,
    keccak256,
};
use anyhow::{
    Context,
    Result,
    anyhow,
};
use std::str::FromStr;

pub use nftg_types::{
    Account,
    Entity,
    TypeCharacter,
};

pub mod nftg_types {
    use alloy_primitives::U256;
    use std::fmt;

    /// An account address as handed out by the wallet. Addresses are
    /// case-insensitive, so they are kept lowercase.
    #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct Account(String);

    impl Account {
        pub fn new(raw: impl AsRef<str>) -> Self {
            Self(raw.as_ref().trim().to_ascii_lowercase())
        }

        pub fn as_str(&self) -> &str {
            &self.0
        }
    }

    impl fmt::Display for Account {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    impl From<&str> for Account {
        fn from(raw: &str) -> Self {
            Account::new(raw)
        }
    }

    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub enum TypeCharacter {
        #[default]
        Berserker,
        Spiritual,
        Elementary,
    }

    impl TypeCharacter {
        /// Strict decoding for values the user picks.
        pub fn try_from_code(code: u64) -> Option<Self> {
            match code {
                0 => Some(TypeCharacter::Berserker),
                1 => Some(TypeCharacter::Spiritual),
                2 => Some(TypeCharacter::Elementary),
                _ => None,
            }
        }

        /// Lenient decoding for values read back from the ledger: anything
        /// unexpected is treated as `Elementary`.
        pub fn from_code(code: i64) -> Self {
            match code {
                0 => TypeCharacter::Berserker,
                1 => TypeCharacter::Spiritual,
                _ => TypeCharacter::Elementary,
            }
        }

        pub fn code(self) -> u8 {
            match self {
                TypeCharacter::Berserker => 0,
                TypeCharacter::Spiritual => 1,
                TypeCharacter::Elementary => 2,
            }
        }

        pub fn label(self) -> &'static str {
            match self {
                TypeCharacter::Berserker => "BERSERKER",
                TypeCharacter::Spiritual => "SPIRITUAL",
                TypeCharacter::Elementary => "ELEMENTARY",
            }
        }
    }

    impl fmt::Display for TypeCharacter {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.label())
        }
    }

    /// A game character as stored by the ledger program.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct Entity {
        pub id: u64,
        pub dna: U256,
        pub xp: u64,
        pub hp: u64,
        pub attack: u64,
        pub armor: u64,
        pub mana: u64,
        pub magic_resistance: u64,
        /// Raw type code; kept raw so unexpected codes survive decoding.
        pub type_character: u8,
    }
}

#[cfg(feature = "test-helpers")]
pub mod test_helpers;

pub const OWNER: &str = "owner()";
pub const GET_MY_CHARACTERS: &str = "getMyCharacters()";
pub const GET_OTHERS_CHARACTERS: &str = "getOthersCharacters()";
pub const GET_ALL_CHARACTERS: &str = "getAllCharacters()";
pub const CREATE_CHARACTER: &str = "createCharacter(uint8)";
pub const HEAL: &str = "heal(uint256)";
pub const FIGHT: &str = "fight(uint256,uint256)";
pub const WITHDRAW: &str = "withdraw()";

/// Calls understood by the ledger program.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProgramCall {
    Owner,
    GetMyCharacters,
    GetOthersCharacters,
    GetAllCharacters,
    CreateCharacter(TypeCharacter),
    Heal { entity_id: u64 },
    Fight { mine: u64, rival: u64 },
    Withdraw,
}

impl ProgramCall {
    pub fn signature(&self) -> &'static str {
        match self {
            ProgramCall::Owner => OWNER,
            ProgramCall::GetMyCharacters => GET_MY_CHARACTERS,
            ProgramCall::GetOthersCharacters => GET_OTHERS_CHARACTERS,
            ProgramCall::GetAllCharacters => GET_ALL_CHARACTERS,
            ProgramCall::CreateCharacter(_) => CREATE_CHARACTER,
            ProgramCall::Heal { .. } => HEAL,
            ProgramCall::Fight { .. } => FIGHT,
            ProgramCall::Withdraw => WITHDRAW,
        }
    }

    fn arguments(&self) -> Vec<DynSolValue> {
        match self {
            ProgramCall::CreateCharacter(kind) => {
                vec![DynSolValue::Uint(U256::from(kind.code()), 8)]
            }
            ProgramCall::Heal { entity_id } => {
                vec![DynSolValue::Uint(U256::from(*entity_id), 256)]
            }
            ProgramCall::Fight { mine, rival } => vec![
                DynSolValue::Uint(U256::from(*mine), 256),
                DynSolValue::Uint(U256::from(*rival), 256),
            ],
            ProgramCall::Owner
            | ProgramCall::GetMyCharacters
            | ProgramCall::GetOthersCharacters
            | ProgramCall::GetAllCharacters
            | ProgramCall::Withdraw => Vec::new(),
        }
    }

    /// Selector followed by the ABI-encoded arguments.
    pub fn encode(&self) -> Vec<u8> {
        let mut data = selector(self.signature()).to_vec();
        let args = self.arguments();
        if !args.is_empty() {
            data.extend(DynSolValue::Tuple(args).abi_encode_params());
        }
        data
    }
}

pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

fn entity_type() -> DynSolType {
    let mut fields = vec![DynSolType::Uint(256); 8];
    fields.push(DynSolType::Uint(8));
    DynSolType::Tuple(fields)
}

/// Decodes the return data of the `get*Characters` reads.
pub fn decode_entities(data: &[u8]) -> Result<Vec<Entity>> {
    let returns = DynSolType::Tuple(vec![DynSolType::Array(Box::new(entity_type()))]);
    let decoded = returns
        .abi_decode_params(data)
        .map_err(|e| anyhow!("failed to decode character list: {e}"))?;
    let DynSolValue::Tuple(mut outer) = decoded else {
        return Err(anyhow!("character list did not decode as a tuple"));
    };
    let Some(DynSolValue::Array(items)) = outer.pop() else {
        return Err(anyhow!("character list did not decode as an array"));
    };
    items.into_iter().map(entity_from_value).collect()
}

/// Decodes the return data of `owner()`.
pub fn decode_owner(data: &[u8]) -> Result<Account> {
    let decoded = DynSolType::Address
        .abi_decode(data)
        .map_err(|e| anyhow!("failed to decode owner address: {e}"))?;
    match decoded {
        DynSolValue::Address(address) => Ok(account_from_address(&address)),
        other => Err(anyhow!("owner() returned a non-address value: {other:?}")),
    }
}

pub fn parse_address(account: &Account) -> Result<Address> {
    Address::from_str(account.as_str())
        .with_context(|| format!("{account} is not a valid address"))
}

pub fn account_from_address(address: &Address) -> Account {
    Account::new(format!("{address:#x}"))
}

fn entity_from_value(value: DynSolValue) -> Result<Entity> {
    let DynSolValue::Tuple(fields) = value else {
        return Err(anyhow!("character record is not a tuple"));
    };
    let [id, dna, xp, hp, attack, armor, mana, magic_resistance, type_character] =
        <[DynSolValue; 9]>::try_from(fields)
            .map_err(|fields| anyhow!("character record has {} fields", fields.len()))?;
    Ok(Entity {
        id: small_uint(id, "id")?,
        dna: uint(dna, "dna")?,
        xp: small_uint(xp, "xp")?,
        hp: small_uint(hp, "hp")?,
        attack: small_uint(attack, "attack")?,
        armor: small_uint(armor, "armor")?,
        mana: small_uint(mana, "mana")?,
        magic_resistance: small_uint(magic_resistance, "magicResistance")?,
        type_character: u8::try_from(uint(type_character, "typeCharacter")?)
            .map_err(|_| anyhow!("typeCharacter exceeds u8 range"))?,
    })
}

fn uint(value: DynSolValue, field: &str) -> Result<U256> {
    match value {
        DynSolValue::Uint(v, _) => Ok(v),
        other => Err(anyhow!("{field} is not an unsigned integer: {other:?}")),
    }
}

fn small_uint(value: DynSolValue, field: &str) -> Result<u64> {
    let v = uint(value, field)?;
    u64::try_from(v).map_err(|_| anyhow!("{field} exceeds u64 range"))
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;

    #[test]
    fn selector__known_signatures__match_keccak_prefix() {
        // withdraw() is a widely published selector
        assert_eq!(selector(WITHDRAW), [0x3c, 0xcf, 0xd6, 0x0b]);
        assert_eq!(selector(OWNER), [0x8d, 0xa5, 0xcb, 0x5b]);
    }

    #[test]
    fn encode__fight__appends_two_words() {
        // given
        let call = ProgramCall::Fight { mine: 3, rival: 9 };

        // when
        let data = call.encode();

        // then
        assert_eq!(data.len(), 4 + 64);
        assert_eq!(&data[..4], &selector(FIGHT));
        assert_eq!(data[4 + 31], 3);
        assert_eq!(data[4 + 63], 9);
    }

    #[test]
    fn encode__withdraw__is_selector_only() {
        assert_eq!(ProgramCall::Withdraw.encode(), selector(WITHDRAW).to_vec());
    }

    #[test]
    fn decode_entities__empty_list__returns_empty() {
        // given
        let mut data = vec![0u8; 64];
        data[31] = 0x20;

        // when
        let entities = decode_entities(&data).unwrap();

        // then
        assert!(entities.is_empty());
    }

    #[test]
    fn decode_entities__truncated_data__fails() {
        assert!(decode_entities(&[0u8; 12]).is_err());
    }

    #[test]
    fn type_character__from_code__unexpected_values_fall_back_to_elementary() {
        assert_eq!(TypeCharacter::from_code(0), TypeCharacter::Berserker);
        assert_eq!(TypeCharacter::from_code(1), TypeCharacter::Spiritual);
        assert_eq!(TypeCharacter::from_code(2), TypeCharacter::Elementary);
        assert_eq!(TypeCharacter::from_code(-4), TypeCharacter::Elementary);
        assert_eq!(TypeCharacter::try_from_code(3), None);
    }

    #[test]
    fn account__mixed_case__normalizes_to_lowercase() {
        assert_eq!(Account::new(" 0xAbC "), Account::new("0xabc"));
    }
}
