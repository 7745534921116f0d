//! Character component: the player-controlled layer, including the
//! inventory and equipment with their invariants.

use std::collections::BTreeMap;

use evermire_core::character_data::{
    AttributePair, CharacterData, Gender, InventoryItem, Possessions,
};

use crate::actor::ActorComponent;
use crate::being::BeingComponent;
use crate::entity::EntityId;
use crate::map_composite::MapId;

/// Number of inventory slots a character has.
pub const INVENTORY_SLOTS: u16 = 50;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InventoryError {
    NoSuchSlot,
    InventoryFull,
    InvalidAmount,
    SlotOccupied,
    NotEquipped,
}

#[derive(Clone, Debug, Default)]
pub struct CharacterComponent {
    pub database_id: u32,
    pub account_id: u32,
    pub account_level: i8,
    pub gender: Gender,
    pub hair_style: u8,
    pub hair_color: u8,
    pub level: i16,
    pub character_points: i16,
    pub correction_points: i16,
    pub party_id: u32,
    pub possessions: Possessions,
    /// Monster class id -> kills.
    pub kill_counts: BTreeMap<u16, i32>,
    /// Skill id -> experience.
    pub skills: BTreeMap<u16, i32>,
    /// Quest variables fetched from the account service this session.
    pub quest_cache: BTreeMap<String, String>,
    /// NPC this character is currently talking to, when a dialogue thread
    /// is suspended.
    pub npc_thread: Option<EntityId>,
    /// Set when the character died and has not accepted respawn yet.
    pub awaiting_respawn: bool,
}

impl CharacterComponent {
    /// Build the component part of a freshly received character record.
    /// Attributes and status effects land on the being component instead.
    pub fn from_data(data: &CharacterData) -> Self {
        CharacterComponent {
            database_id: 0,
            account_id: 0,
            account_level: data.account_level,
            gender: data.gender,
            hair_style: data.hair_style,
            hair_color: data.hair_color,
            level: data.level,
            character_points: data.character_points,
            correction_points: data.correction_points,
            party_id: 0,
            possessions: data.possessions.clone(),
            kill_counts: data.kill_counts.clone(),
            skills: data.skills.clone(),
            quest_cache: BTreeMap::new(),
            npc_thread: None,
            awaiting_respawn: false,
        }
    }

    /// Assemble the full record for flushing back to the account service.
    pub fn to_data(
        &self,
        being: &BeingComponent,
        actor: &ActorComponent,
        map_id: MapId,
    ) -> CharacterData {
        let mut data = CharacterData {
            account_level: self.account_level,
            gender: self.gender,
            hair_style: self.hair_style,
            hair_color: self.hair_color,
            level: self.level,
            character_points: self.character_points,
            correction_points: self.correction_points,
            map_id,
            position: actor.position(),
            kill_counts: self.kill_counts.clone(),
            skills: self.skills.clone(),
            possessions: self.possessions.clone(),
            ..CharacterData::default()
        };
        for id in being.attributes.ids() {
            if let Some(attribute) = being.attributes.get(id) {
                data.attributes.insert(
                    id,
                    AttributePair {
                        base: attribute.base(),
                        modified: attribute.modified(),
                    },
                );
            }
        }
        for (id, ticks) in being.status_effects() {
            data.status_effects.insert(id, ticks);
        }
        data
    }

    pub fn increment_kill_count(&mut self, monster_class: u16) {
        *self.kill_counts.entry(monster_class).or_insert(0) += 1;
    }

    /// Insert items, stacking onto an existing slot of the same kind first.
    /// Returns the slot used.
    pub fn insert_item(&mut self, item_id: u16, amount: u16) -> Result<u16, InventoryError> {
        if amount == 0 {
            return Err(InventoryError::InvalidAmount);
        }
        let existing = self
            .possessions
            .inventory
            .iter()
            .find(|(_, item)| item.item_id == item_id)
            .map(|(slot, _)| *slot);
        if let Some(slot) = existing {
            let item = self
                .possessions
                .inventory
                .get_mut(&slot)
                .expect("slot was just found");
            item.amount += amount;
            return Ok(slot);
        }
        let free_slot = (0..INVENTORY_SLOTS)
            .find(|slot| !self.possessions.inventory.contains_key(slot))
            .ok_or(InventoryError::InventoryFull)?;
        self.possessions
            .inventory
            .insert(free_slot, InventoryItem { item_id, amount });
        Ok(free_slot)
    }

    /// Remove items from a slot; the slot disappears when it empties, and
    /// an emptied slot is unequipped first.
    pub fn remove_item(&mut self, slot: u16, amount: u16) -> Result<(), InventoryError> {
        let item = self
            .possessions
            .inventory
            .get_mut(&slot)
            .ok_or(InventoryError::NoSuchSlot)?;
        if amount == 0 || amount > item.amount {
            return Err(InventoryError::InvalidAmount);
        }
        item.amount -= amount;
        if item.amount == 0 {
            self.possessions.inventory.remove(&slot);
            self.possessions.equipment.retain(|(_, s)| *s != slot);
        }
        Ok(())
    }

    /// Move an amount between two slots.
    pub fn move_item(
        &mut self,
        from: u16,
        to: u16,
        amount: u16,
    ) -> Result<(), InventoryError> {
        if from == to {
            return Ok(());
        }
        let source = *self
            .possessions
            .inventory
            .get(&from)
            .ok_or(InventoryError::NoSuchSlot)?;
        if amount == 0 || amount > source.amount {
            return Err(InventoryError::InvalidAmount);
        }
        if to >= INVENTORY_SLOTS {
            return Err(InventoryError::NoSuchSlot);
        }
        match self.possessions.inventory.get_mut(&to) {
            Some(dest) => {
                if dest.item_id != source.item_id {
                    return Err(InventoryError::SlotOccupied);
                }
                dest.amount += amount;
            }
            None => {
                self.possessions.inventory.insert(
                    to,
                    InventoryItem {
                        item_id: source.item_id,
                        amount,
                    },
                );
            }
        }
        self.remove_item(from, amount)
    }

    /// Equip the item in an inventory slot into an equip slot.
    pub fn equip(&mut self, inventory_slot: u16, equip_slot: u8) -> Result<(), InventoryError> {
        if !self.possessions.inventory.contains_key(&inventory_slot) {
            return Err(InventoryError::NoSuchSlot);
        }
        if self
            .possessions
            .equipment
            .iter()
            .any(|(e, s)| *e == equip_slot && *s == inventory_slot)
        {
            return Err(InventoryError::SlotOccupied);
        }
        self.possessions.equipment.push((equip_slot, inventory_slot));
        Ok(())
    }

    /// Clear an equip slot.
    pub fn unequip(&mut self, equip_slot: u8) -> Result<(), InventoryError> {
        let before = self.possessions.equipment.len();
        self.possessions.equipment.retain(|(e, _)| *e != equip_slot);
        if self.possessions.equipment.len() == before {
            return Err(InventoryError::NotEquipped);
        }
        Ok(())
    }

    /// Verify the inventory invariants. Used by the simulation-invariant
    /// sweep; a violation quarantines the entity.
    pub fn possessions_consistent(&self) -> bool {
        self.possessions.inventory.values().all(|item| item.amount >= 1)
            && self
                .possessions
                .equipment
                .iter()
                .all(|(_, slot)| self.possessions.inventory.contains_key(slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_stacks_onto_existing_slots() {
        let mut character = CharacterComponent::default();
        let slot = character.insert_item(100, 3).unwrap();
        let again = character.insert_item(100, 2).unwrap();
        assert_eq!(slot, again);
        assert_eq!(character.possessions.inventory[&slot].amount, 5);
        assert!(character.possessions_consistent());
    }

    #[test]
    fn insert_uses_the_first_free_slot_for_new_items() {
        let mut character = CharacterComponent::default();
        let a = character.insert_item(100, 1).unwrap();
        let b = character.insert_item(200, 1).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
    }

    #[test]
    fn inventory_fills_up_eventually() {
        let mut character = CharacterComponent::default();
        for item_id in 0..INVENTORY_SLOTS {
            character.insert_item(1000 + item_id, 1).unwrap();
        }
        assert_eq!(
            character.insert_item(9999, 1),
            Err(InventoryError::InventoryFull)
        );
    }

    #[test]
    fn remove_empties_and_unequips() {
        let mut character = CharacterComponent::default();
        let slot = character.insert_item(100, 2).unwrap();
        character.equip(slot, 3).unwrap();

        character.remove_item(slot, 1).unwrap();
        assert!(character.possessions.inventory.contains_key(&slot));
        assert_eq!(character.possessions.equipment.len(), 1);

        character.remove_item(slot, 1).unwrap();
        assert!(!character.possessions.inventory.contains_key(&slot));
        assert!(character.possessions.equipment.is_empty());
        assert!(character.possessions_consistent());
    }

    #[test]
    fn remove_rejects_bad_amounts() {
        let mut character = CharacterComponent::default();
        let slot = character.insert_item(100, 2).unwrap();
        assert_eq!(
            character.remove_item(slot, 3),
            Err(InventoryError::InvalidAmount)
        );
        assert_eq!(
            character.remove_item(slot, 0),
            Err(InventoryError::InvalidAmount)
        );
        assert_eq!(
            character.remove_item(42, 1),
            Err(InventoryError::NoSuchSlot)
        );
    }

    #[test]
    fn move_splits_and_merges_stacks() {
        let mut character = CharacterComponent::default();
        let slot = character.insert_item(100, 5).unwrap();
        character.move_item(slot, 7, 2).unwrap();
        assert_eq!(character.possessions.inventory[&slot].amount, 3);
        assert_eq!(character.possessions.inventory[&7].amount, 2);

        character.move_item(slot, 7, 3).unwrap();
        assert!(!character.possessions.inventory.contains_key(&slot));
        assert_eq!(character.possessions.inventory[&7].amount, 5);
    }

    #[test]
    fn move_onto_a_different_item_is_refused() {
        let mut character = CharacterComponent::default();
        let a = character.insert_item(100, 1).unwrap();
        let b = character.insert_item(200, 1).unwrap();
        assert_eq!(
            character.move_item(a, b, 1),
            Err(InventoryError::SlotOccupied)
        );
    }

    #[test]
    fn equip_requires_an_existing_inventory_slot() {
        let mut character = CharacterComponent::default();
        assert_eq!(character.equip(0, 1), Err(InventoryError::NoSuchSlot));
        let slot = character.insert_item(100, 1).unwrap();
        character.equip(slot, 1).unwrap();
        assert_eq!(character.equip(slot, 1), Err(InventoryError::SlotOccupied));
        character.unequip(1).unwrap();
        assert_eq!(character.unequip(1), Err(InventoryError::NotEquipped));
    }

    #[test]
    fn record_round_trip_preserves_character_fields() {
        use crate::attributes::{attr, AttributeSchema};

        let schema = AttributeSchema::game_default();
        let mut data = CharacterData {
            account_level: 2,
            hair_style: 5,
            level: 9,
            ..CharacterData::default()
        };
        data.skills.insert(20, 500);
        data.kill_counts.insert(7, 3);
        data.possessions.inventory.insert(
            0,
            InventoryItem {
                item_id: 42,
                amount: 2,
            },
        );
        data.possessions.equipment.push((1, 0));

        let character = CharacterComponent::from_data(&data);
        let mut being = BeingComponent::new("alice");
        being.attributes.set_base(&schema, attr::VITALITY, 8.0);
        let actor = ActorComponent::default();

        let back = character.to_data(&being, &actor, 0);
        assert_eq!(back.account_level, 2);
        assert_eq!(back.hair_style, 5);
        assert_eq!(back.level, 9);
        assert_eq!(back.skills[&20], 500);
        assert_eq!(back.kill_counts[&7], 3);
        assert_eq!(back.possessions, data.possessions);
        assert!(back.attributes.contains_key(&attr::VITALITY));
    }
}
