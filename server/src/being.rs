//! Being component: the living-actor layer shared by characters, monsters
//! and NPCs. Owns the action/direction state, the destination and path,
//! the per-being timer table, status effects and the attribute map.

use std::collections::BTreeMap;

use evermire_core::point::{Path, Point};
use evermire_core::protocol::{BeingAction, BeingDirection};

use crate::actor::{ActorComponent, UpdateFlags};
use crate::attributes::{attr, AttributeId, AttributeMap, AttributeSchema};
use crate::map::Map;

/// Per-being countdown timers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TimerId {
    /// Time until a monster strolls to a new location.
    MonsterStroll,
    /// Kill-steal protection window.
    KillstealProtected,
    /// Time until a dead monster is removed.
    MonsterDecay,
    /// Time until a monster can attack again.
    MonsterAttackTime,
    /// Time until HP regeneration resumes.
    HpRegen,
    /// Time until the character may chat again.
    Mute,
}

/// Maximum path cost handed to the pathfinder, in multiples of the basic
/// tile cost.
const FIND_PATH_MAX_COST: i32 = 20;

#[derive(Clone, Debug)]
pub struct BeingComponent {
    name: String,
    action: BeingAction,
    direction: BeingDirection,
    destination: Point,
    path: Path,
    /// Damage amounts taken since the last awareness flush.
    hits_taken: Vec<u32>,
    timers: BTreeMap<TimerId, i32>,
    pub attributes: AttributeMap,
    status_effects: BTreeMap<u16, u16>,
}

impl BeingComponent {
    pub fn new(name: &str) -> Self {
        BeingComponent {
            name: name.to_string(),
            action: BeingAction::Stand,
            direction: BeingDirection::Down,
            destination: Point::default(),
            path: Path::new(),
            hits_taken: Vec::new(),
            timers: BTreeMap::new(),
            attributes: AttributeMap::new(),
            status_effects: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub fn action(&self) -> BeingAction {
        self.action
    }

    pub fn set_action(&mut self, actor: &mut ActorComponent, action: BeingAction) {
        if self.action != action {
            self.action = action;
            actor.raise_update_flags(UpdateFlags::ACTION_CHANGE);
        }
    }

    pub fn direction(&self) -> BeingDirection {
        self.direction
    }

    pub fn set_direction(&mut self, actor: &mut ActorComponent, direction: BeingDirection) {
        if self.direction != direction {
            self.direction = direction;
            actor.raise_update_flags(UpdateFlags::DIRECTION_CHANGE);
        }
    }

    pub fn destination(&self) -> Point {
        self.destination
    }

    /// Point the being toward a new destination; the path is recomputed on
    /// the next step.
    pub fn set_destination(&mut self, actor: &mut ActorComponent, destination: Point) {
        self.destination = destination;
        self.path.clear();
        actor.raise_update_flags(UpdateFlags::NEW_DESTINATION);
    }

    /// Stop where we stand.
    pub fn clear_destination(&mut self, actor: &mut ActorComponent) {
        let here = actor.position();
        self.set_destination(actor, here);
    }

    pub fn hits_taken(&self) -> &[u32] {
        &self.hits_taken
    }

    pub fn push_hit(&mut self, amount: u32) {
        self.hits_taken.push(amount);
    }

    pub fn clear_hits_taken(&mut self) {
        self.hits_taken.clear();
    }

    /// Set a timer unless it is already higher.
    pub fn set_timer_soft(&mut self, id: TimerId, value: i32) {
        let current = self.timers.get(&id).copied().unwrap_or(0);
        if current < value {
            self.timers.insert(id, value);
        }
    }

    /// Set a timer even when already higher.
    pub fn set_timer_hard(&mut self, id: TimerId, value: i32) {
        self.timers.insert(id, value);
    }

    pub fn timer(&self, id: TimerId) -> i32 {
        self.timers.get(&id).copied().unwrap_or(-1)
    }

    pub fn is_timer_running(&self, id: TimerId) -> bool {
        self.timer(id) > 0
    }

    /// Whether the timer reached zero on this very tick.
    pub fn is_timer_just_finished(&self, id: TimerId) -> bool {
        self.timer(id) == 0
    }

    pub fn apply_status_effect(&mut self, id: u16, ticks: u16) {
        self.status_effects.insert(id, ticks);
    }

    pub fn remove_status_effect(&mut self, id: u16) {
        self.status_effects.remove(&id);
    }

    pub fn has_status_effect(&self, id: u16) -> bool {
        self.status_effects.contains_key(&id)
    }

    pub fn status_effect_time(&self, id: u16) -> u16 {
        self.status_effects.get(&id).copied().unwrap_or(0)
    }

    pub fn status_effects(&self) -> impl Iterator<Item = (u16, u16)> + '_ {
        self.status_effects.iter().map(|(k, v)| (*k, *v))
    }

    /// Restore hit points, clamped to the modified maximum.
    pub fn heal(&mut self, schema: &AttributeSchema, amount: f64) -> Vec<AttributeId> {
        let max_hp = self.attributes.modified(attr::MAX_HP);
        let hp = self.attributes.base(attr::HP);
        let new_hp = (hp + amount).min(max_hp);
        if new_hp != hp {
            self.attributes.set_base(schema, attr::HP, new_hp)
        } else {
            Vec::new()
        }
    }

    /// Restore all hit points.
    pub fn heal_fully(&mut self, schema: &AttributeSchema) -> Vec<AttributeId> {
        let max_hp = self.attributes.modified(attr::MAX_HP);
        self.attributes.set_base(schema, attr::HP, max_hp)
    }

    /// Per-tick housekeeping: timers count down, timed modifiers expire,
    /// status effects run out, and HP regenerates when allowed. Returns the
    /// attributes whose modified value changed.
    pub fn update(&mut self, schema: &AttributeSchema) -> Vec<AttributeId> {
        for value in self.timers.values_mut() {
            if *value > -10 {
                *value -= 1;
            }
        }

        let mut changed = self.attributes.tick_modifier_expiry(schema);

        let expired: Vec<u16> = self
            .status_effects
            .iter_mut()
            .filter_map(|(id, ticks)| {
                *ticks = ticks.saturating_sub(1);
                (*ticks == 0).then_some(*id)
            })
            .collect();
        for id in expired {
            self.status_effects.remove(&id);
        }

        if self.action != BeingAction::Dead && !self.is_timer_running(TimerId::HpRegen) {
            let regen = self.attributes.modified(attr::HP_REGEN);
            if regen > 0.0 && self.attributes.base(attr::HP) < self.attributes.modified(attr::MAX_HP)
            {
                for id in self.heal(schema, regen) {
                    if !changed.contains(&id) {
                        changed.push(id);
                    }
                }
            }
        }

        changed
    }

    /// Move one step toward the destination. Positions are pixels; routing
    /// is tile-based. Handles tile occupancy handoff and facing updates.
    pub fn step(&mut self, actor: &mut ActorComponent, map: &mut Map) {
        if self.action == BeingAction::Dead {
            return;
        }
        let start = actor.position();
        if start == self.destination && self.path.is_empty() {
            return;
        }

        let speed = self.attributes.modified(attr::SPEED);
        let mut budget = speed.max(0.0) as i32;
        if budget <= 0 {
            return;
        }

        if self.path.is_empty() {
            let start_tile = map.tile_at(&start);
            let dest_tile = map.tile_at(&self.destination);
            if start_tile != dest_tile {
                self.path =
                    map.find_path(start_tile, dest_tile, actor.walkmask, FIND_PATH_MAX_COST);
                if self.path.is_empty() {
                    // No route: give up and stand still.
                    self.destination = start;
                    if self.action == BeingAction::Walk {
                        self.set_action(actor, BeingAction::Stand);
                    }
                    return;
                }
            }
        }

        let mut current = start;
        while budget > 0 {
            let target = match self.path.front() {
                Some(tile) => map.tile_center(tile),
                None => self.destination,
            };
            let dx = target.x - current.x;
            let dy = target.y - current.y;
            if dx == 0 && dy == 0 {
                if self.path.pop_front().is_none() {
                    break;
                }
                continue;
            }
            // Diagonal steps advance both axes in the same tick.
            let needed = dx.abs().max(dy.abs());
            if needed <= budget {
                current = target;
                budget -= needed;
            } else {
                current.x += dx.signum() * dx.abs().min(budget);
                current.y += dy.signum() * dy.abs().min(budget);
                budget = 0;
            }
        }

        if current != start {
            let old_tile = map.tile_at(&start);
            let new_tile = map.tile_at(&current);
            if old_tile != new_tile {
                if let Some(block_type) = actor.block_type {
                    map.free_tile(old_tile.x, old_tile.y, block_type);
                    map.block_tile(new_tile.x, new_tile.y, block_type);
                }
            }
            actor.set_position(current);
            self.update_direction(actor, start, current);
        }

        if current == self.destination && self.path.is_empty() && self.action == BeingAction::Walk
        {
            self.set_action(actor, BeingAction::Stand);
        }
    }

    /// Recompute facing from a completed movement so clients stay in sync.
    fn update_direction(&mut self, actor: &mut ActorComponent, from: Point, to: Point) {
        let dx = to.x - from.x;
        let dy = to.y - from.y;
        let direction = if dy.abs() > dx.abs() {
            if dy > 0 {
                BeingDirection::Down
            } else {
                BeingDirection::Up
            }
        } else if dx > 0 {
            BeingDirection::Right
        } else {
            BeingDirection::Left
        };
        self.set_direction(actor, direction);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::{BlockMask, BlockType};

    fn schema() -> AttributeSchema {
        AttributeSchema::game_default()
    }

    fn walking_being(speed: f64) -> (BeingComponent, ActorComponent, Map) {
        let schema = schema();
        let mut being = BeingComponent::new("walker");
        // AGILITY drives SPEED through the schema: speed = agility/2 + 2.
        being
            .attributes
            .set_base(&schema, attr::AGILITY, (speed - 2.0) * 2.0);
        let mut map = Map::new(20, 20, 32, 32);
        let actor = ActorComponent::new(
            Point::new(16, 16),
            8,
            BlockMask::WALL,
            Some(BlockType::Character),
        );
        map.block_tile(0, 0, BlockType::Character);
        (being, actor, map)
    }

    #[test]
    fn step_reaches_an_adjacent_tile_destination() {
        let (mut being, mut actor, mut map) = walking_being(32.0);
        being.set_destination(&mut actor, Point::new(48, 16));
        being.set_action(&mut actor, BeingAction::Walk);
        actor.clear_update_flags();

        for _ in 0..2 {
            being.step(&mut actor, &mut map);
        }
        assert_eq!(actor.position(), Point::new(48, 16));
        assert_eq!(being.action(), BeingAction::Stand);
        assert_eq!(being.direction(), BeingDirection::Right);
        assert!(actor.update_flags().contains(UpdateFlags::ACTION_CHANGE));
        assert!(actor
            .update_flags()
            .contains(UpdateFlags::DIRECTION_CHANGE));
    }

    #[test]
    fn step_moves_at_most_speed_pixels() {
        let (mut being, mut actor, mut map) = walking_being(10.0);
        being.set_destination(&mut actor, Point::new(16 + 96, 16));
        being.set_action(&mut actor, BeingAction::Walk);

        being.step(&mut actor, &mut map);
        let moved = (actor.position().x - 16).abs() + (actor.position().y - 16).abs();
        assert!(moved <= 10, "moved {moved} pixels at speed 10");
        assert_eq!(being.action(), BeingAction::Walk);
    }

    #[test]
    fn tile_occupancy_follows_the_mover() {
        let (mut being, mut actor, mut map) = walking_being(32.0);
        being.set_destination(&mut actor, Point::new(80, 16));
        being.set_action(&mut actor, BeingAction::Walk);

        for _ in 0..4 {
            being.step(&mut actor, &mut map);
        }
        assert_eq!(actor.position(), Point::new(80, 16));
        let tile = map.tile_at(&actor.position());
        assert!(map.occupancy(tile.x, tile.y, BlockType::Character) >= 1);
        assert_eq!(map.occupancy(0, 0, BlockType::Character), 0);
    }

    #[test]
    fn blocked_destination_leaves_the_being_standing() {
        let (mut being, mut actor, mut map) = walking_being(32.0);
        // Wall off the target tile completely.
        for x in 0..20 {
            map.block_tile(x, 2, BlockType::Wall);
        }
        being.set_destination(&mut actor, Point::new(16, 144));
        being.set_action(&mut actor, BeingAction::Walk);

        being.step(&mut actor, &mut map);
        assert_eq!(actor.position(), Point::new(16, 16));
        assert_eq!(being.action(), BeingAction::Stand);
        assert_eq!(being.destination(), Point::new(16, 16));
    }

    #[test]
    fn dead_beings_do_not_move() {
        let (mut being, mut actor, mut map) = walking_being(32.0);
        being.set_destination(&mut actor, Point::new(80, 16));
        being.set_action(&mut actor, BeingAction::Dead);
        being.step(&mut actor, &mut map);
        assert_eq!(actor.position(), Point::new(16, 16));
    }

    #[test]
    fn timers_count_down_and_report_finishing() {
        let mut being = BeingComponent::new("timed");
        let schema = schema();
        being.set_timer_hard(TimerId::Mute, 2);
        assert!(being.is_timer_running(TimerId::Mute));

        being.update(&schema);
        assert!(being.is_timer_running(TimerId::Mute));
        being.update(&schema);
        assert!(being.is_timer_just_finished(TimerId::Mute));
        being.update(&schema);
        assert!(!being.is_timer_running(TimerId::Mute));
        assert!(!being.is_timer_just_finished(TimerId::Mute));
    }

    #[test]
    fn soft_timer_set_never_lowers() {
        let mut being = BeingComponent::new("timed");
        being.set_timer_hard(TimerId::HpRegen, 10);
        being.set_timer_soft(TimerId::HpRegen, 5);
        assert_eq!(being.timer(TimerId::HpRegen), 10);
        being.set_timer_soft(TimerId::HpRegen, 20);
        assert_eq!(being.timer(TimerId::HpRegen), 20);
        being.set_timer_hard(TimerId::HpRegen, 5);
        assert_eq!(being.timer(TimerId::HpRegen), 5);
    }

    #[test]
    fn hp_regenerates_unless_the_break_timer_runs() {
        let schema = schema();
        let mut being = BeingComponent::new("regen");
        being.attributes.set_base(&schema, attr::VITALITY, 10.0); // max hp 110
        being.attributes.set_base(&schema, attr::HP, 50.0);
        being.attributes.set_base(&schema, attr::HP_REGEN, 2.0);

        being.update(&schema);
        assert_eq!(being.attributes.base(attr::HP), 52.0);

        being.set_timer_hard(TimerId::HpRegen, 2);
        being.update(&schema);
        assert_eq!(being.attributes.base(attr::HP), 52.0);
        // The timer runs out during this tick and regeneration resumes.
        being.update(&schema);
        assert_eq!(being.attributes.base(attr::HP), 54.0);
        being.update(&schema);
        assert_eq!(being.attributes.base(attr::HP), 56.0);
    }

    #[test]
    fn hp_never_regenerates_past_the_maximum() {
        let schema = schema();
        let mut being = BeingComponent::new("regen");
        being.attributes.set_base(&schema, attr::VITALITY, 2.0); // max hp 30
        being.attributes.set_base(&schema, attr::HP, 29.5);
        being.attributes.set_base(&schema, attr::HP_REGEN, 5.0);
        being.update(&schema);
        assert_eq!(being.attributes.base(attr::HP), 30.0);
    }

    #[test]
    fn status_effects_expire_on_their_own() {
        let schema = schema();
        let mut being = BeingComponent::new("status");
        being.apply_status_effect(3, 2);
        assert!(being.has_status_effect(3));
        being.update(&schema);
        assert!(being.has_status_effect(3));
        being.update(&schema);
        assert!(!being.has_status_effect(3));
    }
}
