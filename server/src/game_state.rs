//! The authoritative game state and its fixed-rate tick.
//!
//! One `GameState` value owns every map, the entity arena and the static
//! registries; nothing here is a global. During a tick no code mutates the
//! entity set directly — insertions, removals and warps are queued and
//! applied between ticks, in the order the specification gives:
//!
//! 1. drain warp and remove queues,
//! 2. drain the insert queue,
//! 3. clear the zones' `destinations` sets,
//! 4. run component updates entity by entity,
//! 5. move entities between zones and record crossings,
//! 6. (driven by the session layer) compute awareness deltas per player.
//!
//! A failing component update logs and continues; a broken entity is
//! quarantined — removed from the world without being flushed.

use std::collections::BTreeMap;

use evermire_core::point::Point;
use evermire_core::protocol::{BeingAction, EntityKind};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::abilities::{
    AbilityEvent, AbilityId, AbilityRegistry, AbilityTarget, UseError, UseOutcome,
};
use crate::actor::{ActorComponent, UpdateFlags};
use crate::attack::Damage;
use crate::attributes::{attr, AttributeId, AttributeSchema};
use crate::being::{BeingComponent, TimerId};
use crate::combat;
use crate::entity::{Entity, EntityArena, EntityId};
use crate::map::{BlockMask, BlockType};
use crate::map_composite::{InsertError, MapComposite, MapId};
use crate::monster::{
    MonsterComponent, MonsterRegistry, DECAY_TIME, KILLSTEAL_PROTECTION_TIME,
};
use crate::script::{CallbackSlot, CallbackTable, ScriptArg, ScriptEngine, ScriptRef};
use crate::trigger_area::TriggerAction;

/// How long a monster waits between strolls, in ticks.
const STROLL_PAUSE: i32 = 80;

#[derive(Clone, Debug)]
pub struct GameSettings {
    pub default_map: MapId,
    /// Ticks HP regeneration pauses after a hit.
    pub hp_regen_break_after_hit: i32,
}

impl Default for GameSettings {
    fn default() -> Self {
        GameSettings {
            default_map: 1,
            hp_regen_break_after_hit: 0,
        }
    }
}

/// Simulation events of one tick, drained by the session layer.
#[derive(Clone, Debug, PartialEq)]
pub enum EntityEvent {
    Inserted(EntityId),
    Removed(EntityId),
    MapChanged {
        entity: EntityId,
        map: MapId,
    },
    AttributeChanged {
        entity: EntityId,
        attribute: AttributeId,
    },
    Damaged {
        target: EntityId,
        source: Option<EntityId>,
        amount: u32,
    },
    Died(EntityId),
    /// Entity removed for violating a simulation invariant; must not be
    /// flushed to the database.
    Quarantined(EntityId),
    /// Experience awarded to a character for a skill.
    ExpGained {
        character: EntityId,
        skill: u16,
        exp: i32,
    },
}

/// A chat line said this tick, delivered with the awareness pass.
#[derive(Clone, Debug)]
pub struct SayEvent {
    pub speaker: EntityId,
    pub text: String,
}

/// An entity that left a map this tick, kept for the awareness pass.
#[derive(Clone, Copy, Debug)]
pub struct Departure {
    pub map: MapId,
    pub position: Point,
    pub public_id: u16,
}

/// A warp whose target map this shard does not host; the session layer
/// turns it into a migration through the account service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingMigration {
    pub character: EntityId,
    pub target_map: MapId,
    pub target_point: Point,
}

struct QueuedScriptCall {
    callback: ScriptRef,
    args: Vec<ScriptArg>,
}

pub struct GameState {
    tick: u32,
    pub settings: GameSettings,
    pub schema: AttributeSchema,
    pub ability_registry: AbilityRegistry,
    pub monster_registry: MonsterRegistry,
    pub callbacks: CallbackTable,
    pub script: Box<dyn ScriptEngine>,
    maps: BTreeMap<MapId, MapComposite>,
    entities: EntityArena,
    rng: StdRng,
    insert_queue: Vec<EntityId>,
    remove_queue: Vec<EntityId>,
    warp_queue: Vec<(EntityId, MapId, Point)>,
    events: Vec<EntityEvent>,
    say_events: Vec<SayEvent>,
    arrivals: Vec<EntityId>,
    departures: Vec<Departure>,
    migrations: Vec<PendingMigration>,
    script_calls: Vec<QueuedScriptCall>,
}

impl GameState {
    pub fn new(
        settings: GameSettings,
        schema: AttributeSchema,
        script: Box<dyn ScriptEngine>,
    ) -> Self {
        GameState {
            tick: 0,
            settings,
            schema,
            ability_registry: AbilityRegistry::new(),
            monster_registry: MonsterRegistry::new(),
            callbacks: CallbackTable::new(),
            script,
            maps: BTreeMap::new(),
            entities: EntityArena::new(),
            rng: StdRng::from_entropy(),
            insert_queue: Vec::new(),
            remove_queue: Vec::new(),
            warp_queue: Vec::new(),
            events: Vec::new(),
            say_events: Vec::new(),
            arrivals: Vec::new(),
            departures: Vec::new(),
            migrations: Vec::new(),
            script_calls: Vec::new(),
        }
    }

    /// Deterministic randomness for tests.
    pub fn reseed_rng(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    pub fn current_tick(&self) -> u32 {
        self.tick
    }

    pub fn add_map(&mut self, map: MapComposite) {
        self.maps.insert(map.id(), map);
    }

    pub fn map(&self, id: MapId) -> Option<&MapComposite> {
        self.maps.get(&id)
    }

    pub fn map_mut(&mut self, id: MapId) -> Option<&mut MapComposite> {
        self.maps.get_mut(&id)
    }

    pub fn maps(&self) -> impl Iterator<Item = &MapComposite> {
        self.maps.values()
    }

    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(id)
    }

    pub fn entity_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(id)
    }

    /// Create an entity now, bring it into the world between ticks. The
    /// entity must carry an actor and have its map set.
    pub fn enqueue_insert(&mut self, entity: Entity) -> EntityId {
        let id = self.entities.insert(entity);
        self.insert_queue.push(id);
        id
    }

    pub fn enqueue_remove(&mut self, id: EntityId) {
        if !self.remove_queue.contains(&id) {
            self.remove_queue.push(id);
        }
    }

    pub fn enqueue_warp(&mut self, character: EntityId, map: MapId, point: Point) {
        self.warp_queue.push((character, map, point));
    }

    pub fn take_events(&mut self) -> Vec<EntityEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn events(&self) -> &[EntityEvent] {
        &self.events
    }

    pub fn say(&mut self, speaker: EntityId, text: &str) {
        self.say_events.push(SayEvent {
            speaker,
            text: text.to_string(),
        });
    }

    pub fn say_events(&self) -> &[SayEvent] {
        &self.say_events
    }

    pub fn arrivals(&self) -> &[EntityId] {
        &self.arrivals
    }

    pub fn departures(&self) -> &[Departure] {
        &self.departures
    }

    pub fn take_migrations(&mut self) -> Vec<PendingMigration> {
        std::mem::take(&mut self.migrations)
    }

    /// Run one simulation tick (phases 1–5). The caller computes awareness
    /// deltas afterwards and then calls [`GameState::finish_tick`].
    pub fn update(&mut self) {
        self.tick = self.tick.wrapping_add(1);

        // Phase 1: warps, then removals.
        let warps = std::mem::take(&mut self.warp_queue);
        for (entity, map, point) in warps {
            self.process_warp(entity, map, point);
        }
        let removals = std::mem::take(&mut self.remove_queue);
        for id in removals {
            self.process_remove(id, false);
        }

        // Phase 2: insertions.
        let inserts = std::mem::take(&mut self.insert_queue);
        for id in inserts {
            self.process_insert(id);
        }

        // Phase 3: forget last tick's zone crossings.
        for map in self.maps.values_mut() {
            map.clear_destinations();
        }

        // Phase 4: component updates.
        self.update_components();

        // Phase 5: zone handoff for entities that moved.
        self.update_zones();
    }

    /// Clear per-tick state after the awareness pass consumed it.
    pub fn finish_tick(&mut self) {
        for id in self.entities.ids() {
            if let Some(entity) = self.entities.get_mut(id) {
                if let Some(actor) = entity.actor.as_mut() {
                    actor.clear_update_flags();
                    actor.commit_position();
                }
                if let Some(being) = entity.being.as_mut() {
                    being.clear_hits_taken();
                }
            }
        }
        self.events.clear();
        self.say_events.clear();
        self.arrivals.clear();
        self.departures.clear();
    }

    fn process_insert(&mut self, id: EntityId) {
        let snapshot = self
            .entities
            .get(id)
            .map(|e| (e.kind(), e.map, e.actor.as_ref().map(|a| (a.position(), a.block_type))));
        let Some((kind, map_id, actor_info)) = snapshot else {
            return;
        };
        let Some(map_id) = map_id else {
            log::error!("inserting {id:?} without a map, dropping it");
            self.entities.remove(id);
            return;
        };
        let Some((pos, block_type)) = actor_info else {
            log::error!("inserting {id:?} without an actor, dropping it");
            self.entities.remove(id);
            return;
        };

        let Some(map) = self.maps.get_mut(&map_id) else {
            log::error!("inserting {id:?} on unknown map {map_id}, dropping it");
            self.entities.remove(id);
            return;
        };
        match map.insert(id, kind, &pos) {
            Ok(public_id) => {
                if let Some(block_type) = block_type {
                    let tile = map.map().tile_at(&pos);
                    map.map_mut().block_tile(tile.x, tile.y, block_type);
                }
                if let Some(pid) = public_id {
                    if let Some(actor) = self
                        .entities
                        .get_mut(id)
                        .and_then(|e| e.actor.as_mut())
                    {
                        actor.public_id = pid;
                    }
                }
                self.arrivals.push(id);
                self.events.push(EntityEvent::Inserted(id));
            }
            Err(InsertError::MapFull) => {
                log::error!("map {map_id} has no public ids left, dropping {id:?}");
                self.entities.remove(id);
            }
            Err(InsertError::OutOfBounds) => {
                log::error!("{id:?} spawned outside map {map_id}, dropping it");
                self.entities.remove(id);
            }
        }
    }

    fn process_remove(&mut self, id: EntityId, quarantine: bool) {
        let snapshot = self.entities.get(id).map(|e| {
            let actor = e.actor.as_ref();
            (
                e.kind(),
                e.map,
                actor.map(|a| a.position()).unwrap_or_default(),
                actor.and_then(|a| (a.public_id != 0).then_some(a.public_id)),
                actor.and_then(|a| a.block_type),
            )
        });
        let Some((kind, map_id, pos, public_id, block_type)) = snapshot else {
            return;
        };

        if let Some(map_id) = map_id {
            if let Some(map) = self.maps.get_mut(&map_id) {
                map.remove(id, kind, &pos, public_id);
                if let Some(block_type) = block_type {
                    let tile = map.map().tile_at(&pos);
                    map.map_mut().free_tile(tile.x, tile.y, block_type);
                }
                if let Some(pid) = public_id {
                    self.departures.push(Departure {
                        map: map_id,
                        position: pos,
                        public_id: pid,
                    });
                }
            }
        }

        // Dead monsters give their spawn slot back.
        if let Some(spawner) = self
            .entities
            .get(id)
            .and_then(|e| e.monster.as_ref())
            .and_then(|m| m.spawner)
        {
            if let Some(area) = self
                .entities
                .get_mut(spawner)
                .and_then(|e| e.spawn_area.as_mut())
            {
                area.being_removed();
            }
        }

        self.entities.remove(id);
        self.events.push(if quarantine {
            EntityEvent::Quarantined(id)
        } else {
            EntityEvent::Removed(id)
        });
    }

    fn process_warp(&mut self, id: EntityId, target_map: MapId, point: Point) {
        if !self.maps.contains_key(&target_map) {
            // Not hosted here: hand over to the migration machinery.
            self.migrations.push(PendingMigration {
                character: id,
                target_map,
                target_point: point,
            });
            return;
        }

        let Some(entity) = self.entities.get(id) else {
            return;
        };
        let kind = entity.kind();
        let old_map_id = entity.map;
        let Some(actor) = entity.actor.as_ref() else {
            return;
        };
        let old_pos = actor.position();
        let old_public_id = (actor.public_id != 0).then_some(actor.public_id);
        let block_type = actor.block_type;

        if let Some(old_map_id) = old_map_id {
            if let Some(map) = self.maps.get_mut(&old_map_id) {
                map.remove(id, kind, &old_pos, old_public_id);
                if let Some(block_type) = block_type {
                    let tile = map.map().tile_at(&old_pos);
                    map.map_mut().free_tile(tile.x, tile.y, block_type);
                }
                if let Some(pid) = old_public_id {
                    self.departures.push(Departure {
                        map: old_map_id,
                        position: old_pos,
                        public_id: pid,
                    });
                }
            }
        }

        let map = self.maps.get_mut(&target_map).expect("checked above");
        match map.insert(id, kind, &point) {
            Ok(public_id) => {
                if let Some(block_type) = block_type {
                    let tile = map.map().tile_at(&point);
                    map.map_mut().block_tile(tile.x, tile.y, block_type);
                }
                let Some(entity) = self.entities.get_mut(id) else {
                    return;
                };
                entity.map = Some(target_map);
                if let Some(actor) = entity.actor.as_mut() {
                    actor.set_position(point);
                    actor.commit_position();
                    if let Some(pid) = public_id {
                        actor.public_id = pid;
                    }
                }
                if let Some(being) = entity.being.as_mut() {
                    let actor = entity.actor.as_mut().expect("warped entity has an actor");
                    being.clear_destination(actor);
                }
                self.arrivals.push(id);
                self.events.push(EntityEvent::MapChanged {
                    entity: id,
                    map: target_map,
                });
            }
            Err(e) => {
                log::error!("warp of {id:?} to map {target_map} failed: {e:?}");
                self.process_remove(id, true);
            }
        }
    }

    /// Stable update order: maps by id, entities in insertion order.
    fn ordered_entity_ids(&self) -> Vec<EntityId> {
        let mut ids = Vec::new();
        for map in self.maps.values() {
            ids.extend_from_slice(map.entities());
        }
        ids
    }

    fn update_components(&mut self) {
        let ids = self.ordered_entity_ids();

        // Intra-entity housekeeping: timers, modifier expiry, status
        // effects, regeneration, ability recharge, NPC update callbacks.
        for &id in &ids {
            self.update_housekeeping(id);
        }

        // Monster AI and attack scheduling both look at other entities.
        for &id in &ids {
            self.update_monster_ai(id);
        }
        let triggered = self.update_combat(&ids);
        self.resolve_attacks(triggered);

        // Movement.
        self.update_movement();

        // Spawn and trigger areas react to the post-move world.
        for &id in &ids {
            self.update_spawn_area(id);
            self.update_trigger_area(id);
        }

        // Scripts queued by any of the above run at a safe point, never
        // mid-step.
        self.run_queued_scripts();
    }

    fn update_housekeeping(&mut self, id: EntityId) {
        let GameState {
            entities,
            schema,
            ability_registry,
            events,
            script_calls,
            ..
        } = self;
        let Some(entity) = entities.get_mut(id) else {
            return;
        };

        if let Some(being) = entity.being.as_mut() {
            let changed = being.update(schema);
            for attribute in changed {
                events.push(EntityEvent::AttributeChanged {
                    entity: id,
                    attribute,
                });
                if attribute == attr::HP || attribute == attr::MAX_HP {
                    if let Some(actor) = entity.actor.as_mut() {
                        actor.raise_update_flags(UpdateFlags::HEALTH_CHANGE);
                    }
                }
            }
        }

        if let (Some(abilities), Some(being)) =
            (entity.abilities.as_mut(), entity.being.as_ref())
        {
            for event in abilities.update(ability_registry, &being.attributes) {
                if let AbilityEvent::Recharged(ability_id) = event {
                    if let Some(callback) = ability_registry
                        .get(ability_id)
                        .and_then(|info| info.recharged_callback)
                    {
                        script_calls.push(QueuedScriptCall {
                            callback,
                            args: vec![
                                ScriptArg::Entity(id),
                                ScriptArg::Int(ability_id as i64),
                            ],
                        });
                    }
                }
            }
        }

        if let Some(npc) = entity.npc.as_ref() {
            if npc.enabled {
                if let Some(callback) = npc.update_callback {
                    script_calls.push(QueuedScriptCall {
                        callback,
                        args: vec![ScriptArg::Entity(id)],
                    });
                }
            }
        }
    }

    fn update_monster_ai(&mut self, id: EntityId) {
        let snapshot = self.entities.get(id).and_then(|entity| {
            let monster = entity.monster.as_ref()?;
            let being = entity.being.as_ref()?;
            let actor = entity.actor.as_ref()?;
            let map_id = entity.map?;
            Some((
                monster.class_id,
                monster.angriest_target(),
                being.action(),
                being.is_timer_just_finished(TimerId::MonsterDecay),
                being.is_timer_just_finished(TimerId::MonsterStroll),
                being.timer(TimerId::MonsterStroll),
                actor.position(),
                map_id,
            ))
        });
        let Some((
            class_id,
            initial_target,
            action,
            decay_finished,
            stroll_finished,
            stroll_timer,
            my_pos,
            map_id,
        )) = snapshot
        else {
            return;
        };

        // Dead monsters only wait out their decay timer.
        if action == BeingAction::Dead {
            if decay_finished {
                self.enqueue_remove(id);
            }
            return;
        }

        let class = match self.monster_registry.get(class_id) {
            Some(class) => class.clone(),
            None => return,
        };

        // Validate the current hate target; stale handles mean the target
        // is gone.
        let mut target = initial_target;
        if let Some(t) = target {
            let alive = self
                .entities
                .get(t)
                .and_then(|e| e.being.as_ref())
                .map(|b| b.action() != BeingAction::Dead)
                .unwrap_or(false);
            let same_map = self.entities.get(t).and_then(|e| e.map) == Some(map_id);
            if !alive || !same_map {
                if let Some(m) = self.entities.get_mut(id).and_then(|e| e.monster.as_mut())
                {
                    m.forget_target(t);
                }
                target = None;
            }
        }

        // Aggressive monsters pick on the nearest character in range.
        if target.is_none() && class.aggressive {
            if let Some(map) = self.maps.get(&map_id) {
                let region = map.region_around(&my_pos, class.track_range);
                let mut best: Option<(EntityId, i64)> = None;
                for candidate in map.characters_in_region(&region) {
                    let Some(other) = self.entities.get(candidate) else {
                        continue;
                    };
                    let Some(other_actor) = other.actor.as_ref() else {
                        continue;
                    };
                    let alive = other
                        .being
                        .as_ref()
                        .map(|b| b.action() != BeingAction::Dead)
                        .unwrap_or(false);
                    if !alive {
                        continue;
                    }
                    let dist = my_pos.dist_squared(&other_actor.position());
                    let range = class.track_range as i64;
                    if dist <= range * range
                        && best.map(|(_, d)| dist < d).unwrap_or(true)
                    {
                        best = Some((candidate, dist));
                    }
                }
                if let Some((candidate, _)) = best {
                    if let Some(m) =
                        self.entities.get_mut(id).and_then(|e| e.monster.as_mut())
                    {
                        m.add_anger(candidate, 1);
                    }
                    target = Some(candidate);
                }
            }
        }

        match target {
            Some(target_id) => {
                let target_pos = self
                    .entities
                    .get(target_id)
                    .and_then(|e| e.actor.as_ref())
                    .map(|a| a.position());
                let Some(target_pos) = target_pos else {
                    return;
                };
                let reach =
                    (class.attack_distance + class.size) as i64;
                let in_reach = my_pos.dist_squared(&target_pos) <= reach * reach;
                let Some(entity) = self.entities.get_mut(id) else {
                    return;
                };
                if let Some(combat) = entity.combat.as_mut() {
                    combat.set_target(target_id);
                }
                let (Some(being), Some(actor)) =
                    (entity.being.as_mut(), entity.actor.as_mut())
                else {
                    return;
                };
                if in_reach {
                    being.clear_destination(actor);
                    being.set_action(actor, BeingAction::Attack);
                } else {
                    being.set_destination(actor, target_pos);
                    being.set_action(actor, BeingAction::Walk);
                }
            }
            None => {
                // Idle: stroll now and then.
                let strolls = class.stroll_range > 0 && stroll_finished;
                let needs_arm = stroll_timer < 0;
                let stroll_x = self.rng.gen_range(-class.stroll_range..=class.stroll_range);
                let stroll_y = self.rng.gen_range(-class.stroll_range..=class.stroll_range);
                let pause = STROLL_PAUSE + self.rng.gen_range(0..STROLL_PAUSE);
                let Some(entity) = self.entities.get_mut(id) else {
                    return;
                };
                let (Some(being), Some(actor)) =
                    (entity.being.as_mut(), entity.actor.as_mut())
                else {
                    return;
                };
                if being.action() == BeingAction::Attack {
                    being.set_action(actor, BeingAction::Stand);
                }
                if strolls {
                    let dest = Point::new(my_pos.x + stroll_x, my_pos.y + stroll_y);
                    if self
                        .maps
                        .get(&map_id)
                        .map(|m| m.map().contains_pixel(&dest))
                        .unwrap_or(false)
                    {
                        being.set_destination(actor, dest);
                        being.set_action(actor, BeingAction::Walk);
                    }
                    being.set_timer_hard(TimerId::MonsterStroll, pause);
                } else if needs_arm {
                    being.set_timer_hard(TimerId::MonsterStroll, pause);
                }
            }
        }
    }

    /// Advance attack timers, collect this tick's triggered attacks and
    /// start new performances on targets in range.
    fn update_combat(&mut self, ids: &[EntityId]) -> Vec<(EntityId, EntityId, Damage)> {
        let mut triggered = Vec::new();
        for &id in ids {
            // Timers always run; scheduling needs an attacking being.
            let (action, target) = {
                let Some(entity) = self.entities.get_mut(id) else {
                    continue;
                };
                let Some(combat) = entity.combat.as_mut() else {
                    continue;
                };
                combat.attacks.tick();
                let action = entity
                    .being
                    .as_ref()
                    .map(|b| b.action())
                    .unwrap_or(BeingAction::Stand);
                let target = entity.combat.as_ref().and_then(|c| c.target());
                (action, target)
            };

            let target_id = match target {
                Some(t) if action == BeingAction::Attack => t,
                _ => {
                    // Not attacking: abort warmups, keep cooldowns running.
                    if let Some(combat) =
                        self.entities.get_mut(id).and_then(|e| e.combat.as_mut())
                    {
                        combat.attacks.stop_all();
                    }
                    continue;
                }
            };

            if let Some(attack) = self
                .entities
                .get_mut(id)
                .and_then(|e| e.combat.as_mut())
                .and_then(|c| c.attacks.take_triggered())
            {
                triggered.push((id, target_id, attack.info().damage.clone()));
            }

            // Pick the highest-priority usable attack that reaches the
            // target, and wind it up.
            let attacker_info = self.entities.get(id).and_then(|e| {
                let actor = e.actor.as_ref()?;
                Some((actor.position(), actor.size))
            });
            let target_pos = self
                .entities
                .get(target_id)
                .and_then(|e| e.actor.as_ref())
                .map(|a| a.position());
            let (Some((my_pos, my_size)), Some(target_pos)) = (attacker_info, target_pos)
            else {
                continue;
            };

            let Some(combat) = self.entities.get_mut(id).and_then(|e| e.combat.as_mut())
            else {
                continue;
            };
            let mut best: Option<(usize, u32)> = None;
            for index in combat.attacks.usable() {
                let info = combat.attacks.attack(index).info();
                if !combat::target_in_range(&my_pos, my_size, &target_pos, info.damage.range)
                {
                    continue;
                }
                if best.map(|(_, p)| info.priority > p).unwrap_or(true) {
                    best = Some((index, info.priority));
                }
            }
            if let Some((index, _)) = best {
                combat.attacks.start(index);
                if let Some(actor) = self.entities.get_mut(id).and_then(|e| e.actor.as_mut())
                {
                    actor.raise_update_flags(UpdateFlags::ATTACK);
                }
            }
        }
        triggered
    }

    fn resolve_attacks(&mut self, triggered: Vec<(EntityId, EntityId, Damage)>) {
        for (attacker_id, target_id, damage) in triggered {
            if !self.attack_is_legal(attacker_id, target_id, &damage) {
                // Illegal target: the attack aborts silently.
                continue;
            }

            let regen_break = self.settings.hp_regen_break_after_hit;
            let GameState {
                entities,
                schema,
                rng,
                ..
            } = self;
            let (attacker, target) = entities.get_pair_mut(attacker_id, target_id);
            let (Some(_attacker), Some(target)) = (attacker, target) else {
                continue;
            };
            let (Some(being), Some(actor)) =
                (target.being.as_mut(), target.actor.as_mut())
            else {
                continue;
            };
            let outcome =
                combat::resolve_damage(schema, rng, being, actor, &damage, regen_break);

            if let Some(monster) = target.monster.as_mut() {
                let had_owner = monster.owner.is_some();
                monster.record_damage(attacker_id, damage.skill, outcome.hp_loss);
                if !had_owner && monster.owner.is_some() {
                    if let Some(b) = target.being.as_mut() {
                        b.set_timer_hard(
                            TimerId::KillstealProtected,
                            KILLSTEAL_PROTECTION_TIME,
                        );
                    }
                }
                if let Some(callback) = self.callbacks.get(CallbackSlot::MonsterDamaged) {
                    self.script_calls.push(QueuedScriptCall {
                        callback,
                        args: vec![
                            ScriptArg::Entity(target_id),
                            ScriptArg::Entity(attacker_id),
                            ScriptArg::Int(outcome.hp_loss as i64),
                        ],
                    });
                }
            }

            self.events.push(EntityEvent::Damaged {
                target: target_id,
                source: Some(attacker_id),
                amount: outcome.hp_loss,
            });

            if outcome.died {
                self.handle_death(target_id, Some(attacker_id));
            }
        }
    }

    fn attack_is_legal(&self, attacker_id: EntityId, target_id: EntityId, damage: &Damage) -> bool {
        if attacker_id == target_id {
            return false;
        }
        let (Some(attacker), Some(target)) =
            (self.entities.get(attacker_id), self.entities.get(target_id))
        else {
            return false;
        };
        if attacker.map.is_none() || attacker.map != target.map {
            return false;
        }
        if !combat::target_alive_and_able(target.being.as_ref(), target.can_fight()) {
            return false;
        }
        let (Some(attacker_actor), Some(target_actor)) =
            (attacker.actor.as_ref(), target.actor.as_ref())
        else {
            return false;
        };
        if !combat::target_in_range(
            &attacker_actor.position(),
            attacker_actor.size,
            &target_actor.position(),
            damage.range,
        ) {
            return false;
        }
        let pvp = attacker
            .map
            .and_then(|m| self.maps.get(&m))
            .map(|m| m.pvp())
            .unwrap_or_default();
        !combat::pvp_forbids(pvp, attacker.kind(), target.kind())
    }

    fn handle_death(&mut self, id: EntityId, killer: Option<EntityId>) {
        let Some(entity) = self.entities.get_mut(id) else {
            return;
        };
        let kind = entity.kind();
        if let (Some(being), Some(actor)) = (entity.being.as_mut(), entity.actor.as_mut()) {
            being.set_action(actor, BeingAction::Dead);
            being.clear_destination(actor);
        }
        self.events.push(EntityEvent::Died(id));

        match kind {
            EntityKind::Character => {
                if let Some(character) = self
                    .entities
                    .get_mut(id)
                    .and_then(|e| e.character.as_mut())
                {
                    character.awaiting_respawn = true;
                }
                if let Some(callback) = self.callbacks.get(CallbackSlot::CharacterDeath) {
                    self.script_calls.push(QueuedScriptCall {
                        callback,
                        args: vec![ScriptArg::Entity(id)],
                    });
                }
            }
            EntityKind::Monster => self.handle_monster_death(id, killer),
            _ => {}
        }
    }

    fn handle_monster_death(&mut self, id: EntityId, killer: Option<EntityId>) {
        let Some(entity) = self.entities.get_mut(id) else {
            return;
        };
        let protection_running = entity
            .being
            .as_ref()
            .map(|b| b.is_timer_running(TimerId::KillstealProtected))
            .unwrap_or(false);
        if let Some(being) = entity.being.as_mut() {
            being.set_timer_hard(TimerId::MonsterDecay, DECAY_TIME);
        }

        let (class_id, owner, shares, position, map_id) = {
            let Some(entity) = self.entities.get(id) else {
                return;
            };
            let Some(monster) = entity.monster.as_ref() else {
                return;
            };
            let class_exp = self
                .monster_registry
                .get(monster.class_id)
                .map(|c| c.exp)
                .unwrap_or(0);
            (
                monster.class_id,
                monster.owner,
                monster.split_exp(class_exp, protection_running),
                entity.actor.as_ref().map(|a| a.position()),
                entity.map,
            )
        };

        // Experience, proportional to contribution.
        for share in shares {
            let Some(receiver) = self.entities.get_mut(share.receiver) else {
                continue;
            };
            let Some(character) = receiver.character.as_mut() else {
                continue;
            };
            *character.skills.entry(share.skill).or_insert(0) += share.exp;
            self.events.push(EntityEvent::ExpGained {
                character: share.receiver,
                skill: share.skill,
                exp: share.exp,
            });
        }

        // The killer's tally.
        if let Some(killer) = killer {
            if let Some(character) = self
                .entities
                .get_mut(killer)
                .and_then(|e| e.character.as_mut())
            {
                character.increment_kill_count(class_id);
            }
        }

        // Drops appear where the monster fell.
        if let (Some(position), Some(map_id)) = (position, map_id) {
            let drop = self
                .monster_registry
                .get(class_id)
                .and_then(|class| class.random_drop(&mut self.rng));
            if let Some(item_id) = drop {
                let mut item = Entity::new(EntityKind::Item);
                item.map = Some(map_id);
                item.actor = Some(ActorComponent::new(
                    position,
                    0,
                    BlockMask::empty(),
                    None,
                ));
                let dropped = self.enqueue_insert(item);
                log::debug!("monster {id:?} dropped item {item_id} as {dropped:?}");
            }
        }

        // The owner hears about the kill.
        if let (Some(owner), Some(callback)) =
            (owner, self.callbacks.get(CallbackSlot::DeathNotification))
        {
            self.script_calls.push(QueuedScriptCall {
                callback,
                args: vec![ScriptArg::Entity(owner), ScriptArg::Entity(id)],
            });
        }
    }

    /// Run the ability-use checks for one entity. On success the caller
    /// feeds the returned callback to the script bridge.
    pub fn use_ability(
        &mut self,
        id: EntityId,
        ability: AbilityId,
        target: AbilityTarget,
    ) -> Result<UseOutcome, UseError> {
        let GameState {
            entities,
            ability_registry,
            ..
        } = self;
        let Some(entity) = entities.get_mut(id) else {
            return Err(UseError::NotKnown);
        };
        let (Some(abilities), Some(being)) =
            (entity.abilities.as_mut(), entity.being.as_ref())
        else {
            return Err(UseError::NotKnown);
        };
        match target {
            AbilityTarget::Being => {
                abilities.use_on_being(ability_registry, &being.attributes, ability)
            }
            AbilityTarget::Point => {
                abilities.use_on_point(ability_registry, &being.attributes, ability)
            }
        }
    }

    /// Bring a dead character back: full HP, configured spawn point.
    pub fn respawn_character(&mut self, id: EntityId) {
        let default_map = self.settings.default_map;
        let spawn = self
            .maps
            .get(&default_map)
            .map(|m| {
                let map = m.map();
                Point::new(map.pixel_width() / 2, map.pixel_height() / 2)
            })
            .unwrap_or_default();

        let GameState {
            entities, schema, ..
        } = self;
        let Some(entity) = entities.get_mut(id) else {
            return;
        };
        let Some(character) = entity.character.as_mut() else {
            return;
        };
        if !character.awaiting_respawn {
            return;
        }
        character.awaiting_respawn = false;
        if let (Some(being), Some(actor)) = (entity.being.as_mut(), entity.actor.as_mut()) {
            being.heal_fully(schema);
            being.set_action(actor, BeingAction::Stand);
        }
        self.enqueue_warp(id, default_map, spawn);
        if let Some(callback) = self.callbacks.get(CallbackSlot::CharacterDeathAccepted) {
            self.script_calls.push(QueuedScriptCall {
                callback,
                args: vec![ScriptArg::Entity(id)],
            });
        }
    }

    fn update_movement(&mut self) {
        let GameState {
            entities, maps, ..
        } = self;
        for map in maps.values_mut() {
            let ids: Vec<EntityId> = map.entities().to_vec();
            for id in ids {
                let Some(entity) = entities.get_mut(id) else {
                    continue;
                };
                if let (Some(being), Some(actor)) =
                    (entity.being.as_mut(), entity.actor.as_mut())
                {
                    being.step(actor, map.map_mut());
                }
            }
        }
    }

    fn update_spawn_area(&mut self, id: EntityId) {
        let Some(entity) = self.entities.get_mut(id) else {
            return;
        };
        let map_id = entity.map;
        let Some(area) = entity.spawn_area.as_mut() else {
            return;
        };
        if !area.update() {
            return;
        }
        let class_id = area.class_id;
        let mut zone = area.zone;

        let Some(map_id) = map_id else {
            return;
        };
        let Some(class) = self.monster_registry.get(class_id).cloned() else {
            log::warn!("spawn area references unknown monster class {class_id}");
            return;
        };
        let max_hp = class
            .attributes
            .get(&attr::MAX_HP)
            .or_else(|| class.attributes.get(&attr::VITALITY))
            .copied()
            .unwrap_or(0.0);
        if max_hp <= 0.0 {
            log::warn!("refusing to spawn dead monster {}", class.id);
            return;
        }

        let Some(map) = self.maps.get(&map_id) else {
            return;
        };
        // A dimensionless zone means the whole map.
        if zone.w == 0 || zone.h == 0 {
            zone.x = 0;
            zone.y = 0;
            zone.w = map.map().pixel_width();
            zone.h = map.map().pixel_height();
        }

        // Find a free spawn location; give up after 10 tries.
        let mut position = None;
        for _ in 0..10 {
            let candidate = Point::new(
                zone.x + self.rng.gen_range(0..zone.w),
                zone.y + self.rng.gen_range(0..zone.h),
            );
            let tile = map.map().tile_at(&candidate);
            if map.map().get_walk(tile.x, tile.y, BlockMask::WALL | BlockMask::MONSTER) {
                position = Some(candidate);
                break;
            }
        }
        let Some(position) = position else {
            log::warn!(
                "unable to find a free spawn location for monster {} on map {} ({},{},{},{})",
                class.id,
                map.name(),
                zone.x,
                zone.y,
                zone.w,
                zone.h
            );
            return;
        };

        let monster_id = self.spawn_monster(&class, map_id, position, Some(id));
        if monster_id.is_some() {
            if let Some(area) = self
                .entities
                .get_mut(id)
                .and_then(|e| e.spawn_area.as_mut())
            {
                area.being_spawned();
            }
        }
    }

    /// Assemble a monster entity from its class and queue it for insert.
    pub fn spawn_monster(
        &mut self,
        class: &crate::monster::MonsterClass,
        map_id: MapId,
        position: Point,
        spawner: Option<EntityId>,
    ) -> Option<EntityId> {
        let mut being = BeingComponent::new(&class.name);
        for (&attribute, &value) in &class.attributes {
            being.attributes.set_base(&self.schema, attribute, value);
        }
        let max_hp = being.attributes.modified(attr::MAX_HP);
        if max_hp <= 0.0 {
            return None;
        }
        being.attributes.set_base(&self.schema, attr::HP, max_hp);

        let mut combat = crate::combat::CombatComponent::new();
        for info in &class.attacks {
            combat.attacks.add(info.clone(), class.id as u32);
        }

        let mut monster = MonsterComponent::new(class.id);
        monster.spawner = spawner;

        let mut entity = Entity::new(EntityKind::Monster);
        entity.map = Some(map_id);
        entity.actor = Some(ActorComponent::new(
            position,
            class.size,
            BlockMask::WALL,
            Some(BlockType::Monster),
        ));
        entity.being = Some(being);
        entity.combat = Some(combat);
        entity.monster = Some(monster);
        Some(self.enqueue_insert(entity))
    }

    fn update_trigger_area(&mut self, id: EntityId) {
        let Some(entity) = self.entities.get(id) else {
            return;
        };
        let map_id = entity.map;
        let Some(trigger) = entity.trigger_area.as_ref() else {
            return;
        };
        let zone = trigger.zone;
        let action = trigger.action;
        let Some(map_id) = map_id else {
            return;
        };
        let Some(map) = self.maps.get(&map_id) else {
            return;
        };

        // Beings in the touched zones; the rectangle check happens inside
        // the component since zones overhang the area.
        let region = map.region_for_rect(&zone);
        let mut inside_now = Vec::new();
        for candidate in map.entities_in_region(&region) {
            if candidate == id {
                continue;
            }
            let Some(other) = self.entities.get(candidate) else {
                continue;
            };
            if other.being.is_none() {
                continue;
            }
            if let Some(actor) = other.actor.as_ref() {
                if actor.public_id != 0 {
                    inside_now.push((candidate, actor.position()));
                }
            }
        }

        let fired = {
            let Some(trigger) = self
                .entities
                .get_mut(id)
                .and_then(|e| e.trigger_area.as_mut())
            else {
                return;
            };
            trigger.process(&inside_now)
        };

        for target in fired {
            match action {
                TriggerAction::Warp { map, point } => {
                    let is_character = self
                        .entities
                        .get(target)
                        .map(|e| e.kind() == EntityKind::Character)
                        .unwrap_or(false);
                    if is_character {
                        self.enqueue_warp(target, map, point);
                    }
                }
                TriggerAction::Script { callback, arg } => {
                    log::debug!("script trigger area activated: ({target:?}, {arg})");
                    self.script_calls.push(QueuedScriptCall {
                        callback,
                        args: vec![ScriptArg::Entity(target), ScriptArg::Int(arg)],
                    });
                }
            }
        }
    }

    fn run_queued_scripts(&mut self) {
        let calls = std::mem::take(&mut self.script_calls);
        for call in calls {
            if let Err(e) = self.script.invoke(call.callback, &call.args) {
                // A script error turns the action into a no-op.
                log::error!("script callback {:?} failed: {e}", call.callback);
            }
        }
    }

    fn update_zones(&mut self) {
        let GameState {
            entities, maps, ..
        } = self;
        for map in maps.values_mut() {
            let mut moved = Vec::new();
            for &id in map.entities() {
                let Some(entity) = entities.get(id) else {
                    continue;
                };
                if let Some(actor) = entity.actor.as_ref() {
                    let old_pos = actor.old_position();
                    let pos = actor.position();
                    if old_pos != pos {
                        moved.push((id, entity.kind(), old_pos, pos));
                    }
                }
            }
            map.update_zones(&moved);
        }
    }

    /// Sweep for broken entities; violations quarantine rather than crash.
    pub fn check_invariants_sweep(&mut self) {
        let ids = self.ordered_entity_ids();
        for id in ids {
            let broken = match self.entities.get(id) {
                Some(entity) => {
                    let no_actor = entity.actor.is_none();
                    let bad_inventory = entity
                        .character
                        .as_ref()
                        .map(|c| !c.possessions_consistent())
                        .unwrap_or(false);
                    let off_map = match (entity.map, entity.actor.as_ref()) {
                        (Some(map_id), Some(actor)) => self
                            .maps
                            .get(&map_id)
                            .map(|m| !m.map().contains_pixel(&actor.position()))
                            .unwrap_or(true),
                        _ => false,
                    };
                    no_actor || bad_inventory || off_map
                }
                None => false,
            };
            if broken {
                log::error!("entity {id:?} violated a simulation invariant, quarantining");
                self.process_remove(id, true);
            }
        }
    }
}
