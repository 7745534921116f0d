//! Entities and their component tables.
//!
//! An entity is a typed handle plus a fixed set of optional components.
//! Handles are generational: a freed slot bumps its generation, so a stale
//! handle held by combat or aggression code dereferences to `None` instead
//! of a recycled entity.

use std::fmt;

use evermire_core::protocol::EntityKind;

use crate::abilities::AbilityComponent;
use crate::actor::ActorComponent;
use crate::being::BeingComponent;
use crate::character::CharacterComponent;
use crate::combat::CombatComponent;
use crate::map_composite::MapId;
use crate::monster::MonsterComponent;
use crate::npc::NpcComponent;
use crate::spawn_area::SpawnAreaComponent;
use crate::trigger_area::TriggerAreaComponent;

/// Stable identity of an entity within one game service.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId {
    index: u32,
    generation: u32,
}

impl EntityId {
    pub fn from_raw(index: u32, generation: u32) -> Self {
        EntityId { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}v{}", self.index, self.generation)
    }
}

/// Component classes an entity can carry, at most one instance each.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComponentType {
    Actor,
    Being,
    Character,
    Monster,
    Npc,
    Abilities,
    Combat,
    SpawnArea,
    TriggerArea,
}

/// One simulated thing: a type tag, the map it lives on, and its components.
#[derive(Default)]
pub struct Entity {
    pub kind: EntityKindTag,
    pub map: Option<MapId>,
    pub actor: Option<ActorComponent>,
    pub being: Option<BeingComponent>,
    pub character: Option<CharacterComponent>,
    pub monster: Option<MonsterComponent>,
    pub npc: Option<NpcComponent>,
    pub abilities: Option<AbilityComponent>,
    pub combat: Option<CombatComponent>,
    pub spawn_area: Option<SpawnAreaComponent>,
    pub trigger_area: Option<TriggerAreaComponent>,
}

/// Newtype wrapper so `Entity::default()` has a defined kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntityKindTag(pub EntityKind);

impl Default for EntityKindTag {
    fn default() -> Self {
        EntityKindTag(EntityKind::Other)
    }
}

impl Entity {
    pub fn new(kind: EntityKind) -> Self {
        Entity {
            kind: EntityKindTag(kind),
            ..Entity::default()
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind.0
    }

    pub fn has_component(&self, t: ComponentType) -> bool {
        match t {
            ComponentType::Actor => self.actor.is_some(),
            ComponentType::Being => self.being.is_some(),
            ComponentType::Character => self.character.is_some(),
            ComponentType::Monster => self.monster.is_some(),
            ComponentType::Npc => self.npc.is_some(),
            ComponentType::Abilities => self.abilities.is_some(),
            ComponentType::Combat => self.combat.is_some(),
            ComponentType::SpawnArea => self.spawn_area.is_some(),
            ComponentType::TriggerArea => self.trigger_area.is_some(),
        }
    }

    /// Whether this entity can be party to combat.
    pub fn can_fight(&self) -> bool {
        self.combat.is_some() && self.being.is_some()
    }
}

struct Slot {
    generation: u32,
    entity: Option<Box<Entity>>,
}

/// Generational arena owning every entity of the game service.
#[derive(Default)]
pub struct EntityArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl EntityArena {
    pub fn new() -> Self {
        EntityArena::default()
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn insert(&mut self, entity: Entity) -> EntityId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entity = Some(Box::new(entity));
            EntityId {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 1,
                entity: Some(Box::new(entity)),
            });
            EntityId {
                index,
                generation: 1,
            }
        }
    }

    /// Remove an entity; its components are dropped with it and the handle
    /// goes stale.
    pub fn remove(&mut self, id: EntityId) -> Option<Entity> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation || slot.entity.is_none() {
            return None;
        }
        slot.generation = slot.generation.wrapping_add(1);
        self.live -= 1;
        self.free.push(id.index);
        slot.entity.take().map(|e| *e)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entity.as_deref()
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entity.as_deref_mut()
    }

    /// Disjoint mutable access to two entities, for source/target updates.
    /// Returns `None` in a slot for a stale handle; both `None` when the
    /// ids alias.
    pub fn get_pair_mut(
        &mut self,
        a: EntityId,
        b: EntityId,
    ) -> (Option<&mut Entity>, Option<&mut Entity>) {
        if a.index == b.index {
            return (None, None);
        }
        if a.index as usize >= self.slots.len() || b.index as usize >= self.slots.len() {
            return (None, None);
        }
        let (low, high, swapped) = if a.index < b.index {
            (a, b, false)
        } else {
            (b, a, true)
        };
        let (head, tail) = self.slots.split_at_mut(high.index as usize);
        let low_slot = &mut head[low.index as usize];
        let high_slot = &mut tail[0];

        let low_ref = if low_slot.generation == low.generation {
            low_slot.entity.as_deref_mut()
        } else {
            None
        };
        let high_ref = if high_slot.generation == high.generation {
            high_slot.entity.as_deref_mut()
        } else {
            None
        };
        if swapped {
            (high_ref, low_ref)
        } else {
            (low_ref, high_ref)
        }
    }

    /// All live entity ids, in slot order.
    pub fn ids(&self) -> Vec<EntityId> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                slot.entity.as_ref().map(|_| EntityId {
                    index: i as u32,
                    generation: slot.generation,
                })
            })
            .collect()
    }
}
