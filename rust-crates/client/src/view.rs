use ledger_abi::{
    Entity,
    TypeCharacter,
};

use crate::{
    dispatch::HEAL_THRESHOLD_XP,
    sync::{
        SyncSnapshot,
        SyncState,
    },
};

/// Total over every integer: 0 and 1 have their own labels, everything else
/// reads as ELEMENTARY.
pub fn type_label(type_character: i64) -> &'static str {
    TypeCharacter::from_code(type_character).label()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityView {
    pub id: u64,
    pub dna: String,
    pub type_label: &'static str,
    pub xp: u64,
    pub hp: u64,
    pub attack: u64,
    pub armor: u64,
    pub mana: u64,
    pub magic_resistance: u64,
    pub can_heal: bool,
}

impl EntityView {
    /// `action_in_flight` hides the heal affordance while a dispatch is pending.
    pub fn from_entity(entity: &Entity, action_in_flight: bool) -> Self {
        Self {
            id: entity.id,
            dna: entity.dna.to_string(),
            type_label: type_label(i64::from(entity.type_character)),
            xp: entity.xp,
            hp: entity.hp,
            attack: entity.attack,
            armor: entity.armor,
            mana: entity.mana,
            magic_resistance: entity.magic_resistance,
            can_heal: entity.xp < HEAL_THRESHOLD_XP && !action_in_flight,
        }
    }

    pub fn line(&self) -> String {
        let heal = if self.can_heal { "  [heal]" } else { "" };
        format!(
            "#{:<4} {:<10} xp {:>4}  hp {:>4}  atk {:>3}  arm {:>3}  mana {:>3}  mres {:>3}  dna {}{}",
            self.id,
            self.type_label,
            self.xp,
            self.hp,
            self.attack,
            self.armor,
            self.mana,
            self.magic_resistance,
            self.dna,
            heal
        )
    }
}

pub fn entity_views(entities: &[Entity], action_in_flight: bool) -> Vec<EntityView> {
    entities
        .iter()
        .map(|e| EntityView::from_entity(e, action_in_flight))
        .collect()
}

pub fn state_label(state: SyncState) -> &'static str {
    match state {
        SyncState::Uninitialized => "not loaded",
        SyncState::Loading => "loading",
        SyncState::Ready => "up to date",
        SyncState::Failed => "stale (last refresh failed)",
    }
}

pub fn status_line(snapshot: &SyncSnapshot, selected: TypeCharacter) -> String {
    let account = snapshot
        .account
        .as_ref()
        .map(|a| a.to_string())
        .unwrap_or_else(|| "-".to_string());
    let owner = if snapshot.cache.is_owner { " (owner)" } else { "" };
    format!(
        "account {account}{owner} | {} | mine {} | others {} | selected type {selected}",
        state_label(snapshot.state),
        snapshot.cache.mine.len(),
        snapshot.cache.others.len(),
    )
}
