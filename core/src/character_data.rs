//! The canonical character record and its wire serialization.
//!
//! The same blob is written by the account service on `PLAYER_ENTER`, read
//! back on `PLAYER_DATA`/`PLAYER_SYNC`, and stored in the database. Both
//! services must agree bit-for-bit, so the layout is spelled out here and
//! nowhere else:
//!
//! ```text
//! i8  account_level
//! i8  gender                     (0 male, 1 female)
//! i8  hair_style
//! i8  hair_color
//! i16 level
//! i16 character_points
//! i16 correction_points
//! i16 n_attr, { i16 id, f64 base, f64 mod } * n_attr
//! i16 n_skill, { i16 id, i32 xp } * n_skill
//! i16 n_status, { i16 id, i16 remaining_ticks } * n_status
//! i16 map_id, i16 x, i16 y
//! i16 n_kills, { i16 monster_id, i32 count } * n_kills
//! i16 n_abilities, { i32 id } * n_abilities
//! i16 n_equip, { i8 slot, i16 inv_slot } * n_equip
//!     { i16 inv_slot, i16 item_id, i16 amount } *   (remainder)
//! ```
//!
//! The inventory comes last because its size is not transmitted; the reader
//! consumes entries until the frame runs out.

use std::collections::BTreeMap;

use crate::point::Point;
use crate::wire::{MessageIn, MessageOut, WireError};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum Gender {
    #[default]
    Male = 0,
    Female = 1,
}

impl Gender {
    pub fn from_u8(value: u8) -> Option<Gender> {
        match value {
            0 => Some(Gender::Male),
            1 => Some(Gender::Female),
            _ => None,
        }
    }
}

/// One attribute as stored on a character: its base and the last computed
/// modified value.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AttributePair {
    pub base: f64,
    pub modified: f64,
}

/// One stack of items in an inventory slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InventoryItem {
    pub item_id: u16,
    pub amount: u16,
}

/// Inventory and equipment. Every equipment entry references an inventory
/// slot that exists, and every inventory amount is at least 1.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Possessions {
    pub inventory: BTreeMap<u16, InventoryItem>,
    /// (equip slot, inventory slot) pairs, insertion-ordered.
    pub equipment: Vec<(u8, u16)>,
}

/// The full serialized character record.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CharacterData {
    pub account_level: i8,
    pub gender: Gender,
    pub hair_style: u8,
    pub hair_color: u8,
    pub level: i16,
    pub character_points: i16,
    pub correction_points: i16,
    pub attributes: BTreeMap<u16, AttributePair>,
    pub skills: BTreeMap<u16, i32>,
    pub status_effects: BTreeMap<u16, u16>,
    pub map_id: u16,
    pub position: Point,
    pub kill_counts: BTreeMap<u16, i32>,
    pub abilities: Vec<i32>,
    pub possessions: Possessions,
}

impl CharacterData {
    pub fn serialize(&self, out: &mut MessageOut) {
        out.write_i8(self.account_level);
        out.write_i8(self.gender as i8);
        out.write_i8(self.hair_style as i8);
        out.write_i8(self.hair_color as i8);
        out.write_i16(self.level);
        out.write_i16(self.character_points);
        out.write_i16(self.correction_points);

        out.write_i16(self.attributes.len() as i16);
        for (id, attr) in &self.attributes {
            out.write_i16(*id as i16);
            out.write_f64(attr.base);
            out.write_f64(attr.modified);
        }

        out.write_i16(self.skills.len() as i16);
        for (id, xp) in &self.skills {
            out.write_i16(*id as i16);
            out.write_i32(*xp);
        }

        out.write_i16(self.status_effects.len() as i16);
        for (id, ticks) in &self.status_effects {
            out.write_i16(*id as i16);
            out.write_i16(*ticks as i16);
        }

        out.write_i16(self.map_id as i16);
        out.write_i16(self.position.x as i16);
        out.write_i16(self.position.y as i16);

        out.write_i16(self.kill_counts.len() as i16);
        for (monster_id, count) in &self.kill_counts {
            out.write_i16(*monster_id as i16);
            out.write_i32(*count);
        }

        out.write_i16(self.abilities.len() as i16);
        for id in &self.abilities {
            out.write_i32(*id);
        }

        out.write_i16(self.possessions.equipment.len() as i16);
        for (equip_slot, inv_slot) in &self.possessions.equipment {
            out.write_i8(*equip_slot as i8);
            out.write_i16(*inv_slot as i16);
        }

        // Inventory last: size is implied by the remainder of the frame.
        for (slot, item) in &self.possessions.inventory {
            out.write_i16(*slot as i16);
            out.write_i16(item.item_id as i16);
            out.write_i16(item.amount as i16);
        }
    }

    pub fn deserialize(msg: &mut MessageIn) -> Result<CharacterData, WireError> {
        let mut data = CharacterData {
            account_level: msg.read_i8()?,
            gender: Gender::from_u8(msg.read_i8()? as u8).unwrap_or_default(),
            hair_style: msg.read_i8()? as u8,
            hair_color: msg.read_i8()? as u8,
            level: msg.read_i16()?,
            character_points: msg.read_i16()?,
            correction_points: msg.read_i16()?,
            ..CharacterData::default()
        };

        let n_attr = msg.read_i16()?.max(0);
        for _ in 0..n_attr {
            let id = msg.read_i16()? as u16;
            let base = msg.read_f64()?;
            let modified = msg.read_f64()?;
            data.attributes.insert(id, AttributePair { base, modified });
        }

        let n_skill = msg.read_i16()?.max(0);
        for _ in 0..n_skill {
            let id = msg.read_i16()? as u16;
            let xp = msg.read_i32()?;
            data.skills.insert(id, xp);
        }

        let n_status = msg.read_i16()?.max(0);
        for _ in 0..n_status {
            let id = msg.read_i16()? as u16;
            let ticks = msg.read_i16()? as u16;
            data.status_effects.insert(id, ticks);
        }

        data.map_id = msg.read_i16()? as u16;
        data.position = Point::new(msg.read_i16()? as i32, msg.read_i16()? as i32);

        let n_kills = msg.read_i16()?.max(0);
        for _ in 0..n_kills {
            let monster_id = msg.read_i16()? as u16;
            let count = msg.read_i32()?;
            data.kill_counts.insert(monster_id, count);
        }

        let n_abilities = msg.read_i16()?.max(0);
        for _ in 0..n_abilities {
            data.abilities.push(msg.read_i32()?);
        }

        let n_equip = msg.read_i16()?.max(0);
        for _ in 0..n_equip {
            let equip_slot = msg.read_i8()? as u8;
            let inv_slot = msg.read_i16()? as u16;
            data.possessions.equipment.push((equip_slot, inv_slot));
        }

        while msg.unread_len() > 0 {
            let slot = msg.read_i16()? as u16;
            let item_id = msg.read_i16()? as u16;
            let amount = msg.read_i16()? as u16;
            data.possessions
                .inventory
                .insert(slot, InventoryItem { item_id, amount });
        }

        Ok(data)
    }

    /// Serialize to a standalone byte blob (no message id), the form the
    /// database stores.
    pub fn to_blob(&self) -> Vec<u8> {
        let mut out = MessageOut::new(0);
        self.serialize(&mut out);
        out.into_bytes()[2..].to_vec()
    }

    pub fn from_blob(blob: &[u8]) -> Result<CharacterData, WireError> {
        // Reuse the message reader by prepending a dummy id.
        let mut framed = Vec::with_capacity(blob.len() + 2);
        framed.extend_from_slice(&[0, 0]);
        framed.extend_from_slice(blob);
        let mut msg = MessageIn::from_bytes(&framed)?;
        CharacterData::deserialize(&mut msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CharacterData {
        let mut data = CharacterData {
            account_level: 1,
            gender: Gender::Female,
            hair_style: 3,
            hair_color: 7,
            level: 12,
            character_points: 5,
            correction_points: 2,
            map_id: 4,
            position: Point::new(416, 288),
            ..CharacterData::default()
        };
        data.attributes.insert(
            1,
            AttributePair {
                base: 10.0,
                modified: 12.5,
            },
        );
        data.attributes.insert(
            16,
            AttributePair {
                base: 100.0,
                modified: 100.0,
            },
        );
        data.skills.insert(20, 14_000);
        data.status_effects.insert(3, 250);
        data.kill_counts.insert(1002, 38);
        data.abilities.push(2);
        data.abilities.push(11);
        data.possessions.inventory.insert(
            0,
            InventoryItem {
                item_id: 508,
                amount: 1,
            },
        );
        data.possessions.inventory.insert(
            5,
            InventoryItem {
                item_id: 1201,
                amount: 30,
            },
        );
        data.possessions.equipment.push((2, 0));
        data
    }

    #[test]
    fn blob_round_trip_is_identity() {
        let data = sample();
        let blob = data.to_blob();
        let back = CharacterData::from_blob(&blob).unwrap();
        assert_eq!(data, back);
    }

    #[test]
    fn empty_record_round_trips() {
        let data = CharacterData::default();
        let back = CharacterData::from_blob(&data.to_blob()).unwrap();
        assert_eq!(data, back);
    }

    #[test]
    fn layout_starts_with_the_fixed_header() {
        let data = sample();
        let blob = data.to_blob();
        assert_eq!(blob[0] as i8, 1); // account level
        assert_eq!(blob[1], 1); // gender female
        assert_eq!(blob[2], 3); // hair style
        assert_eq!(blob[3], 7); // hair color
        assert_eq!(i16::from_le_bytes([blob[4], blob[5]]), 12); // level
        // attribute count comes right after the three point fields
        assert_eq!(i16::from_le_bytes([blob[10], blob[11]]), 2);
    }

    #[test]
    fn truncated_blob_is_an_error_not_a_panic() {
        let data = sample();
        let blob = data.to_blob();
        // Chop the blob mid-inventory-entry: must error cleanly. Cutting at
        // some offsets leaves a shorter but self-consistent record, so only
        // assert that no cut point panics.
        for cut in 1..blob.len() {
            let _ = CharacterData::from_blob(&blob[..cut]);
        }
        assert!(CharacterData::from_blob(&blob[..5]).is_err());
    }

    #[test]
    fn inventory_is_the_trailing_section() {
        let mut data = CharacterData::default();
        data.possessions.inventory.insert(
            9,
            InventoryItem {
                item_id: 77,
                amount: 3,
            },
        );
        let blob = data.to_blob();
        let tail = &blob[blob.len() - 6..];
        assert_eq!(i16::from_le_bytes([tail[0], tail[1]]), 9);
        assert_eq!(i16::from_le_bytes([tail[2], tail[3]]), 77);
        assert_eq!(i16::from_le_bytes([tail[4], tail[5]]), 3);
    }
}
