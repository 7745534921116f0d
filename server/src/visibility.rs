//! Awareness deltas: what each player learns about the world every tick.
//!
//! For one observer the messages of a tick are emitted in a fixed order:
//! leaves, enters, moves, combat deltas, chat. Between ticks, ordering is
//! the session channel's.

use evermire_core::protocol::{self, EntityKind, MOVING_DESTINATION, MOVING_POSITION};
use evermire_core::wire::MessageOut;

use crate::actor::UpdateFlags;
use crate::entity::EntityId;
use crate::game_state::GameState;

/// Pixel radius inside which an observer is kept aware of other entities.
/// Stays above `ZONE_DIAM` so the zone walk is the only spatial filter
/// that matters.
pub const AWARENESS_RADIUS: i32 = 320;

/// Compute the awareness delta for one observing character.
///
/// The zone walk unions the observer's old surroundings, every zone those
/// zones handed entities to this tick, and the new surroundings, so a
/// being crossing a zone border in the same tick as the observer cannot be
/// missed.
pub fn inform_player(state: &GameState, observer: EntityId) -> Vec<MessageOut> {
    let mut out = Vec::new();

    let Some(observer_entity) = state.entity(observer) else {
        return out;
    };
    let Some(observer_actor) = observer_entity.actor.as_ref() else {
        return out;
    };
    let Some(map_id) = observer_entity.map else {
        return out;
    };
    let Some(map) = state.map(map_id) else {
        return out;
    };

    let observer_pos = observer_actor.position();
    let observer_old = observer_actor.old_position();
    let observer_is_new = state.arrivals().contains(&observer);

    // Leaves for entities that left the map entirely this tick.
    for departure in state.departures() {
        if departure.map == map_id
            && departure.position.in_range_of(&observer_old, AWARENESS_RADIUS)
        {
            let mut msg = MessageOut::new(protocol::BEING_LEAVE);
            msg.write_u16(departure.public_id);
            out.push(msg);
        }
    }

    let region = map.region_around_player(&observer_old, &observer_pos, AWARENESS_RADIUS);

    let mut enters = Vec::new();
    let mut move_entries = Vec::new();
    let mut deltas = Vec::new();
    let mut damage_entries = Vec::new();
    let mut say_messages = Vec::new();

    for other_id in map.entities_in_region(&region) {
        let Some(other) = state.entity(other_id) else {
            continue;
        };
        let Some(actor) = other.actor.as_ref() else {
            continue;
        };
        if actor.public_id == 0 || other.being.is_none() {
            continue;
        }
        let being = other.being.as_ref().expect("checked above");

        let pos = actor.position();
        let old_pos = actor.old_position();
        let was = !observer_is_new
            && !state.arrivals().contains(&other_id)
            && old_pos.in_range_of(&observer_old, AWARENESS_RADIUS);
        let is = pos.in_range_of(&observer_pos, AWARENESS_RADIUS);

        if other_id != observer {
            if was && !is {
                let mut msg = MessageOut::new(protocol::BEING_LEAVE);
                msg.write_u16(actor.public_id);
                out.push(msg);
                continue;
            }
            if is && !was {
                enters.push(being_enter_message(other, actor.public_id));
            }
        }
        if !is {
            continue;
        }

        let flags = actor.update_flags();

        if pos != old_pos || flags.contains(UpdateFlags::NEW_DESTINATION) {
            move_entries.push((actor.public_id, pos, being.destination()));
        }

        if flags.contains(UpdateFlags::ACTION_CHANGE) {
            let mut msg = MessageOut::new(protocol::BEING_ACTION_CHANGE);
            msg.write_u16(actor.public_id);
            msg.write_u8(being.action() as u8);
            deltas.push(msg);
        }
        if flags.contains(UpdateFlags::DIRECTION_CHANGE) {
            let mut msg = MessageOut::new(protocol::BEING_DIR_CHANGE);
            msg.write_u16(actor.public_id);
            msg.write_u8(being.direction() as u8);
            deltas.push(msg);
        }
        if flags.contains(UpdateFlags::HEALTH_CHANGE) {
            let mut msg = MessageOut::new(protocol::BEING_HEALTH_CHANGE);
            msg.write_u16(actor.public_id);
            msg.write_u16(
                being
                    .attributes
                    .base(crate::attributes::attr::HP)
                    .max(0.0) as u16,
            );
            msg.write_u16(
                being
                    .attributes
                    .modified(crate::attributes::attr::MAX_HP)
                    .max(0.0) as u16,
            );
            deltas.push(msg);
        }
        if flags.contains(UpdateFlags::ATTACK) {
            let mut msg = MessageOut::new(protocol::BEING_ATTACK);
            msg.write_u16(actor.public_id);
            msg.write_u8(being.direction() as u8);
            deltas.push(msg);
        }
        if flags.contains(UpdateFlags::LOOKS_CHANGE) {
            if let Some(character) = other.character.as_ref() {
                let mut msg = MessageOut::new(protocol::BEING_LOOKS_CHANGE);
                msg.write_u16(actor.public_id);
                msg.write_u8(character.hair_style);
                msg.write_u8(character.hair_color);
                deltas.push(msg);
            }
        }
        if flags.contains(UpdateFlags::DAMAGED) {
            for hit in being.hits_taken() {
                damage_entries.push((actor.public_id, *hit));
            }
        }

        for say in state.say_events() {
            if say.speaker == other_id {
                let mut msg = MessageOut::new(protocol::BEING_SAY);
                msg.write_u16(actor.public_id);
                msg.write_string(&say.text);
                say_messages.push(msg);
            }
        }
    }

    out.extend(enters);

    if !move_entries.is_empty() {
        let mut msg = MessageOut::new(protocol::BEINGS_MOVE);
        for (public_id, pos, dst) in move_entries {
            msg.write_u16(public_id);
            msg.write_u8(MOVING_POSITION | MOVING_DESTINATION);
            msg.write_u16(pos.x as u16);
            msg.write_u16(pos.y as u16);
            msg.write_u16(dst.x as u16);
            msg.write_u16(dst.y as u16);
        }
        out.push(msg);
    }

    out.extend(deltas);

    if !damage_entries.is_empty() {
        let mut msg = MessageOut::new(protocol::BEINGS_DAMAGE);
        for (public_id, amount) in damage_entries {
            msg.write_u16(public_id);
            msg.write_u16(amount.min(u16::MAX as u32) as u16);
        }
        out.push(msg);
    }

    out.extend(say_messages);
    out
}

/// The full introduction of a being to an observer.
fn being_enter_message(entity: &crate::entity::Entity, public_id: u16) -> MessageOut {
    let being = entity.being.as_ref().expect("enter requires a being");
    let actor = entity.actor.as_ref().expect("enter requires an actor");
    let pos = actor.position();

    let mut msg = MessageOut::new(protocol::BEING_ENTER);
    msg.write_u8(entity.kind() as u8);
    msg.write_u16(public_id);
    msg.write_u8(being.action() as u8);
    msg.write_u16(pos.x as u16);
    msg.write_u16(pos.y as u16);
    msg.write_u8(being.direction() as u8);
    match entity.kind() {
        EntityKind::Character => {
            let character = entity.character.as_ref();
            msg.write_string(being.name());
            msg.write_u8(character.map(|c| c.hair_style).unwrap_or(0));
            msg.write_u8(character.map(|c| c.hair_color).unwrap_or(0));
            msg.write_u8(character.map(|c| c.gender as u8).unwrap_or(0));
        }
        EntityKind::Monster => {
            let class = entity.monster.as_ref().map(|m| m.class_id).unwrap_or(0);
            msg.write_u16(class);
            msg.write_string(being.name());
        }
        EntityKind::Npc => {
            let script_id = entity.npc.as_ref().map(|n| n.script_id).unwrap_or(0);
            msg.write_u16(script_id as u16);
            msg.write_string(being.name());
        }
        _ => {}
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorComponent;
    use crate::attributes::attr;
    use crate::attributes::AttributeSchema;
    use crate::being::BeingComponent;
    use crate::character::CharacterComponent;
    use crate::combat::CombatComponent;
    use crate::entity::Entity;
    use crate::game_state::{GameSettings, GameState};
    use crate::map::{BlockMask, BlockType, Map};
    use crate::map_composite::MapComposite;
    use crate::script::NullScriptEngine;
    use evermire_core::point::Point;
    use evermire_core::protocol::BeingAction;
    use evermire_core::wire::MessageIn;

    fn test_state() -> GameState {
        let mut state = GameState::new(
            GameSettings::default(),
            AttributeSchema::game_default(),
            Box::new(NullScriptEngine),
        );
        state.reseed_rng(7);
        // 64x64 tiles of 32px -> 2048px, an 8x8 zone grid.
        state.add_map(MapComposite::new(1, "main", Map::new(64, 64, 32, 32)));
        state
    }

    fn character(state: &GameState, name: &str, pos: Point, speed_px: f64) -> Entity {
        let mut being = BeingComponent::new(name);
        being
            .attributes
            .set_base(&state.schema, attr::AGILITY, (speed_px - 2.0) * 2.0);
        being.attributes.set_base(&state.schema, attr::VITALITY, 10.0);
        let max_hp = being.attributes.modified(attr::MAX_HP);
        being.attributes.set_base(&state.schema, attr::HP, max_hp);

        let mut entity = Entity::new(evermire_core::protocol::EntityKind::Character);
        entity.map = Some(1);
        entity.actor = Some(ActorComponent::new(
            pos,
            8,
            BlockMask::WALL,
            Some(BlockType::Character),
        ));
        entity.being = Some(being);
        entity.character = Some(CharacterComponent::default());
        entity.combat = Some(CombatComponent::new());
        entity
    }

    fn ids_of(messages: &[MessageOut]) -> Vec<u16> {
        messages
            .iter()
            .map(|m| MessageIn::from_bytes(m.as_bytes()).unwrap().id())
            .collect()
    }

    #[test]
    fn approaching_character_enters_exactly_once_then_stands() {
        let mut state = test_state();
        let observer = state.enqueue_insert(character(&state, "watcher", Point::new(100, 100), 0.0));
        let walker = state.enqueue_insert(character(&state, "walker", Point::new(600, 100), 32.0));
        state.update();
        state.finish_tick();

        {
            let entity = state.entity_mut(walker).unwrap();
            let (being, actor) = (
                entity.being.as_mut().unwrap(),
                entity.actor.as_mut().unwrap(),
            );
            being.set_destination(actor, Point::new(208, 100));
            being.set_action(actor, BeingAction::Walk);
        }

        let mut enters = 0;
        let mut stand_changes = 0;
        for _ in 0..40 {
            state.update();
            for msg in inform_player(&state, observer) {
                let mut parsed = MessageIn::from_bytes(msg.as_bytes()).unwrap();
                match parsed.id() {
                    evermire_core::protocol::BEING_ENTER => {
                        enters += 1;
                        // type, id, then action.
                        parsed.read_u8().unwrap();
                        parsed.read_u16().unwrap();
                    }
                    evermire_core::protocol::BEING_ACTION_CHANGE => {
                        parsed.read_u16().unwrap();
                        if parsed.read_u8().unwrap() == BeingAction::Stand as u8 {
                            stand_changes += 1;
                        }
                    }
                    _ => {}
                }
            }
            state.finish_tick();
        }

        assert_eq!(enters, 1, "one BEING_ENTER for the approaching walker");
        assert_eq!(stand_changes, 1, "one ACTION_CHANGE when it stops");
    }

    #[test]
    fn walking_away_produces_a_leave() {
        let mut state = test_state();
        let observer = state.enqueue_insert(character(&state, "watcher", Point::new(100, 100), 0.0));
        let walker = state.enqueue_insert(character(&state, "walker", Point::new(200, 100), 32.0));
        state.update();
        state.finish_tick();

        {
            let entity = state.entity_mut(walker).unwrap();
            let (being, actor) = (
                entity.being.as_mut().unwrap(),
                entity.actor.as_mut().unwrap(),
            );
            being.set_destination(actor, Point::new(800, 100));
            being.set_action(actor, BeingAction::Walk);
        }

        let mut leaves = 0;
        for _ in 0..60 {
            state.update();
            for msg in inform_player(&state, observer) {
                if MessageIn::from_bytes(msg.as_bytes()).unwrap().id()
                    == evermire_core::protocol::BEING_LEAVE
                {
                    leaves += 1;
                }
            }
            state.finish_tick();
        }
        assert_eq!(leaves, 1);
    }

    #[test]
    fn removal_from_the_map_is_a_leave_for_nearby_observers() {
        let mut state = test_state();
        let observer = state.enqueue_insert(character(&state, "watcher", Point::new(100, 100), 0.0));
        let other = state.enqueue_insert(character(&state, "goner", Point::new(150, 100), 0.0));
        state.update();
        state.finish_tick();

        state.enqueue_remove(other);
        state.update();
        let messages = inform_player(&state, observer);
        assert!(ids_of(&messages).contains(&evermire_core::protocol::BEING_LEAVE));
        state.finish_tick();
    }

    #[test]
    fn a_fresh_observer_sees_everyone_in_range_as_enters() {
        let mut state = test_state();
        let resident = state.enqueue_insert(character(&state, "resident", Point::new(150, 100), 0.0));
        state.update();
        state.finish_tick();

        let newcomer = state.enqueue_insert(character(&state, "newcomer", Point::new(100, 100), 0.0));
        state.update();
        let messages = inform_player(&state, newcomer);
        let enter_count = ids_of(&messages)
            .iter()
            .filter(|id| **id == evermire_core::protocol::BEING_ENTER)
            .count();
        // The resident enters the newcomer's view; the newcomer itself is
        // not announced to itself.
        assert_eq!(enter_count, 1);
        let _ = resident;
        state.finish_tick();
    }

    #[test]
    fn deltas_keep_the_specified_order() {
        let mut state = test_state();
        let observer = state.enqueue_insert(character(&state, "watcher", Point::new(100, 100), 0.0));
        let mover = state.enqueue_insert(character(&state, "mover", Point::new(200, 100), 16.0));
        let goner = state.enqueue_insert(character(&state, "goner", Point::new(250, 100), 0.0));
        state.update();
        state.finish_tick();

        // One removal, one mover saying something.
        state.enqueue_remove(goner);
        {
            let entity = state.entity_mut(mover).unwrap();
            let (being, actor) = (
                entity.being.as_mut().unwrap(),
                entity.actor.as_mut().unwrap(),
            );
            being.set_destination(actor, Point::new(400, 100));
            being.set_action(actor, BeingAction::Walk);
        }
        state.update();
        state.say(mover, "onwards!");

        let messages = inform_player(&state, observer);
        let ids = ids_of(&messages);

        let leave_at = ids
            .iter()
            .position(|id| *id == evermire_core::protocol::BEING_LEAVE);
        let move_at = ids
            .iter()
            .position(|id| *id == evermire_core::protocol::BEINGS_MOVE);
        let say_at = ids
            .iter()
            .position(|id| *id == evermire_core::protocol::BEING_SAY);

        let (leave_at, move_at, say_at) = (
            leave_at.expect("leave emitted"),
            move_at.expect("move emitted"),
            say_at.expect("say emitted"),
        );
        assert!(leave_at < move_at && move_at < say_at);
        state.finish_tick();
    }

    #[test]
    fn damage_shows_up_as_a_damage_summary() {
        let mut state = test_state();
        let observer = state.enqueue_insert(character(&state, "watcher", Point::new(100, 100), 0.0));
        let victim = state.enqueue_insert(character(&state, "victim", Point::new(150, 100), 0.0));
        state.update();
        state.finish_tick();

        {
            let entity = state.entity_mut(victim).unwrap();
            let (being, actor) = (
                entity.being.as_mut().unwrap(),
                entity.actor.as_mut().unwrap(),
            );
            being.push_hit(12);
            actor.raise_update_flags(UpdateFlags::DAMAGED);
        }
        state.update();
        let messages = inform_player(&state, observer);
        let damage = messages
            .iter()
            .find(|m| {
                MessageIn::from_bytes(m.as_bytes()).unwrap().id()
                    == evermire_core::protocol::BEINGS_DAMAGE
            })
            .expect("damage summary present");
        let mut parsed = MessageIn::from_bytes(damage.as_bytes()).unwrap();
        let _public_id = parsed.read_u16().unwrap();
        assert_eq!(parsed.read_u16().unwrap(), 12);
        state.finish_tick();
    }
}
