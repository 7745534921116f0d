//! Per-client session handling on the game service.
//!
//! A connection arrives anonymous, proves itself with the single-use token
//! the account service issued at character select, and becomes a playing
//! session bound to a character entity. Everything a client may do in the
//! world funnels through [`GameServer::handle_frame`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

use evermire_core::character_data::CharacterData;
use evermire_core::point::Point;
use evermire_core::protocol::{self, BeingAction, BeingDirection, EntityKind, ErrorCode};
use evermire_core::token::SessionToken;
use evermire_core::wire::{MessageIn, MessageOut, WireError};

use crate::actor::{ActorComponent, UpdateFlags};
use crate::being::{BeingComponent, TimerId};
use crate::character::{CharacterComponent, InventoryError};
use crate::combat::CombatComponent;
use crate::entity::{Entity, EntityId};
use crate::game_state::{EntityEvent, GameState};
use crate::map::{BlockMask, BlockType};
use crate::map_composite::MapId;
use evermire_core::net::ConnectionId;
use crate::script::{CallbackSlot, ResumeValue, ScriptArg, ScriptResult};
use crate::visibility;

/// Single-use connect tokens expire after this long.
pub const TOKEN_TTL: Duration = Duration::from_secs(60);

/// Dropping this many malformed frames disconnects the client.
const MAX_PROTOCOL_STRIKES: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionState {
    /// TCP established, token not verified yet.
    Connected,
    Playing,
    /// Told to reconnect elsewhere; the entity is on its way out.
    Migrating,
}

struct PlayerSession {
    state: SessionState,
    character: Option<EntityId>,
    character_id: u32,
    strikes: u32,
}

/// A character the account service announced; waiting for its client.
pub struct PendingConnect {
    pub character_id: u32,
    pub name: String,
    pub data: CharacterData,
    pub(crate) arrived: Instant,
}

struct MigratingCharacter {
    connection: ConnectionId,
    entity: EntityId,
    target_map: MapId,
    target_point: Point,
}

pub struct GameServer {
    pub state: GameState,
    sessions: HashMap<ConnectionId, PlayerSession>,
    pending_connects: HashMap<[u8; 32], PendingConnect>,
    migrating: HashMap<u32, MigratingCharacter>,
    migration_requests: Vec<u32>,
    completed_connects: Vec<(u32, SessionToken)>,
    outbox: Vec<(ConnectionId, MessageOut)>,
    closing: Vec<ConnectionId>,
}

impl GameServer {
    pub fn new(state: GameState) -> Self {
        GameServer {
            state,
            sessions: HashMap::new(),
            pending_connects: HashMap::new(),
            migrating: HashMap::new(),
            migration_requests: Vec::new(),
            completed_connects: Vec::new(),
            outbox: Vec::new(),
            closing: Vec::new(),
        }
    }

    /// Tokens whose client arrived; the account link confirms these so the
    /// account side releases its in-flight lock.
    pub fn take_completed_connects(&mut self) -> Vec<(u32, SessionToken)> {
        std::mem::take(&mut self.completed_connects)
    }

    /// A quest variable answer from the account service lands in the
    /// character's cache.
    pub fn apply_quest_var(&mut self, character_id: u32, name: &str, value: &str) {
        let entity_id = self
            .sessions
            .values()
            .find(|s| s.character_id == character_id)
            .and_then(|s| s.character);
        if let Some(character) = entity_id
            .and_then(|id| self.state.entity_mut(id))
            .and_then(|e| e.character.as_mut())
        {
            character
                .quest_cache
                .insert(name.to_string(), value.to_string());
        }
    }

    /// Messages produced since the last drain, in per-connection order.
    pub fn take_outbox(&mut self) -> Vec<(ConnectionId, MessageOut)> {
        std::mem::take(&mut self.outbox)
    }

    /// Connections to drop after their queued messages flush.
    pub fn take_closing(&mut self) -> Vec<ConnectionId> {
        std::mem::take(&mut self.closing)
    }

    /// Character ids needing a redirect from the account service.
    pub fn take_migration_requests(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.migration_requests)
    }

    /// Playing characters and their database ids, for the periodic flush.
    pub fn playing_characters(&self) -> Vec<(u32, EntityId)> {
        self.sessions
            .values()
            .filter(|s| s.state == SessionState::Playing)
            .filter_map(|s| s.character.map(|c| (s.character_id, c)))
            .collect()
    }

    /// Serialize one character's live record.
    pub fn character_data(&self, entity_id: EntityId) -> Option<CharacterData> {
        let entity = self.state.entity(entity_id)?;
        let character = entity.character.as_ref()?;
        let being = entity.being.as_ref()?;
        let actor = entity.actor.as_ref()?;
        Some(character.to_data(being, actor, entity.map.unwrap_or(0)))
    }

    /// The account service announced a player for this shard.
    pub fn register_pending_connect(
        &mut self,
        token: SessionToken,
        character_id: u32,
        name: &str,
        data: CharacterData,
    ) {
        self.pending_connects.insert(
            *token.as_bytes(),
            PendingConnect {
                character_id,
                name: name.to_string(),
                data,
                arrived: Instant::now(),
            },
        );
    }

    pub fn handle_connect(&mut self, connection: ConnectionId) {
        self.sessions.insert(
            connection,
            PlayerSession {
                state: SessionState::Connected,
                character: None,
                character_id: 0,
                strikes: 0,
            },
        );
    }

    pub fn handle_disconnect(&mut self, connection: ConnectionId) {
        let Some(session) = self.sessions.remove(&connection) else {
            return;
        };
        if let Some(entity_id) = session.character {
            // Any suspended dialogue dies with the connection.
            self.state.script.cancel(entity_id);
            self.state.enqueue_remove(entity_id);
        }
    }

    pub fn handle_frame(&mut self, connection: ConnectionId, frame: &[u8]) {
        match self.dispatch(connection, frame) {
            Ok(()) => {}
            Err(e) => {
                log::warn!("dropping malformed frame from connection {connection}: {e}");
                let strikes = {
                    let Some(session) = self.sessions.get_mut(&connection) else {
                        return;
                    };
                    session.strikes += 1;
                    session.strikes
                };
                if strikes >= MAX_PROTOCOL_STRIKES {
                    log::warn!("connection {connection} keeps sending garbage, closing");
                    self.handle_disconnect(connection);
                    self.closing.push(connection);
                }
            }
        }
    }

    fn dispatch(&mut self, connection: ConnectionId, frame: &[u8]) -> Result<(), WireError> {
        let mut msg = MessageIn::from_bytes(frame)?;
        match msg.id() {
            protocol::GAME_CONNECT => self.on_game_connect(connection, &mut msg),
            protocol::WALK => self.on_walk(connection, &mut msg),
            protocol::ATTACK => self.on_attack(connection, &mut msg),
            protocol::SAY => self.on_say(connection, &mut msg),
            protocol::USE_ABILITY_ON_BEING => self.on_use_ability_on_being(connection, &mut msg),
            protocol::USE_ABILITY_ON_POINT => self.on_use_ability_on_point(connection, &mut msg),
            protocol::NPC_TALK => self.on_npc_talk(connection, &mut msg),
            protocol::NPC_TALK_NEXT => self.on_npc_resume(connection, &mut msg, None),
            protocol::NPC_SELECT => {
                let _npc = msg.read_u16()?;
                let choice = msg.read_u8()?;
                self.resume_npc_thread(connection, ResumeValue::Selection(choice));
                Ok(())
            }
            protocol::NPC_NUMBER => {
                let _npc = msg.read_u16()?;
                let number = msg.read_i64()?;
                self.resume_npc_thread(connection, ResumeValue::Int(number));
                Ok(())
            }
            protocol::NPC_STRING => {
                let _npc = msg.read_u16()?;
                let text = msg.read_string()?;
                self.resume_npc_thread(connection, ResumeValue::Str(text));
                Ok(())
            }
            protocol::RESPAWN => self.on_respawn(connection),
            protocol::EQUIP => self.on_equip(connection, &mut msg),
            protocol::UNEQUIP => self.on_unequip(connection, &mut msg),
            protocol::MOVE_ITEM => self.on_move_item(connection, &mut msg),
            protocol::DROP => self.on_drop(connection, &mut msg),
            protocol::DIRECTION_CHANGE => self.on_direction_change(connection, &mut msg),
            protocol::ACTION_CHANGE => self.on_action_change(connection, &mut msg),
            protocol::DISCONNECT => self.on_disconnect_request(connection, &mut msg),
            other => {
                log::warn!("unknown message 0x{other:04x} from connection {connection}");
                Err(WireError::MissingId)
            }
        }
    }

    fn send(&mut self, connection: ConnectionId, msg: MessageOut) {
        self.outbox.push((connection, msg));
    }

    fn playing_character(&self, connection: ConnectionId) -> Option<EntityId> {
        let session = self.sessions.get(&connection)?;
        if session.state != SessionState::Playing {
            return None;
        }
        session.character
    }

    fn find_by_public_id(&self, map_id: MapId, public_id: u16) -> Option<EntityId> {
        let map = self.state.map(map_id)?;
        map.entities().iter().copied().find(|id| {
            self.state
                .entity(*id)
                .and_then(|e| e.actor.as_ref())
                .map(|a| a.public_id == public_id)
                .unwrap_or(false)
        })
    }

    /// Drop tokens whose client never showed up.
    pub fn expire_tokens(&mut self) {
        let before = self.pending_connects.len();
        self.pending_connects
            .retain(|_, pending| pending.arrived.elapsed() < TOKEN_TTL);
        if self.pending_connects.len() != before {
            log::info!(
                "expired {} unclaimed connect tokens",
                before - self.pending_connects.len()
            );
        }
    }

    fn on_game_connect(
        &mut self,
        connection: ConnectionId,
        msg: &mut MessageIn,
    ) -> Result<(), WireError> {
        let token = SessionToken::read(msg)?;

        let Some(session) = self.sessions.get(&connection) else {
            return Ok(());
        };
        if session.state != SessionState::Connected {
            let mut reply = MessageOut::new(protocol::GAME_CONNECT_RESPONSE);
            reply.write_u8(ErrorCode::Failure.into());
            self.send(connection, reply);
            return Ok(());
        }

        let pending = match self.pending_connects.remove(token.as_bytes()) {
            Some(pending) if pending.arrived.elapsed() < TOKEN_TTL => pending,
            _ => {
                // Unknown or expired token; the token is burned either way.
                let mut reply = MessageOut::new(protocol::GAME_CONNECT_RESPONSE);
                reply.write_u8(ErrorCode::Failure.into());
                self.send(connection, reply);
                return Ok(());
            }
        };

        let entity = self.build_character(&pending);
        let entity_id = self.state.enqueue_insert(entity);

        if let Some(session) = self.sessions.get_mut(&connection) {
            session.state = SessionState::Playing;
            session.character = Some(entity_id);
            session.character_id = pending.character_id;
        }

        let mut reply = MessageOut::new(protocol::GAME_CONNECT_RESPONSE);
        reply.write_u8(ErrorCode::Ok.into());
        self.send(connection, reply);
        self.completed_connects.push((pending.character_id, token));

        if let Some(callback) = self.state.callbacks.get(CallbackSlot::CharacterLogin) {
            if let Err(e) = self
                .state
                .script
                .invoke(callback, &[ScriptArg::Entity(entity_id)])
            {
                log::error!("character login script failed: {e}");
            }
        }
        Ok(())
    }

    /// Assemble a character entity from its serialized record.
    fn build_character(&mut self, pending: &PendingConnect) -> Entity {
        let data = &pending.data;
        let map_id = if self.state.map(data.map_id).is_some() {
            data.map_id
        } else {
            self.state.settings.default_map
        };
        let position = {
            let map = self.state.map(map_id).map(|m| m.map());
            match map {
                Some(map) if map.contains_pixel(&data.position) => data.position,
                Some(map) => Point::new(map.pixel_width() / 2, map.pixel_height() / 2),
                None => data.position,
            }
        };

        let mut being = BeingComponent::new(&pending.name);
        for (&id, pair) in &data.attributes {
            being.attributes.set_base(&self.state.schema, id, pair.base);
        }
        for (&id, &ticks) in &data.status_effects {
            being.apply_status_effect(id, ticks);
        }

        let mut character = CharacterComponent::from_data(data);
        character.database_id = pending.character_id;

        let mut abilities = crate::abilities::AbilityComponent::new();
        for id in &data.abilities {
            abilities.give(&self.state.ability_registry, *id as u32, 0);
        }

        let mut entity = Entity::new(EntityKind::Character);
        entity.map = Some(map_id);
        entity.actor = Some(ActorComponent::new(
            position,
            8,
            BlockMask::WALL,
            Some(BlockType::Character),
        ));
        entity.being = Some(being);
        entity.character = Some(character);
        entity.abilities = Some(abilities);
        entity.combat = Some(CombatComponent::new());
        entity
    }

    fn on_walk(&mut self, connection: ConnectionId, msg: &mut MessageIn) -> Result<(), WireError> {
        let x = msg.read_u16()? as i32;
        let y = msg.read_u16()? as i32;
        let Some(entity_id) = self.playing_character(connection) else {
            return Ok(());
        };
        let Some(entity) = self.state.entity_mut(entity_id) else {
            return Ok(());
        };
        let (Some(being), Some(actor)) = (entity.being.as_mut(), entity.actor.as_mut()) else {
            return Ok(());
        };
        if being.action() == BeingAction::Dead {
            return Ok(());
        }
        being.set_destination(actor, Point::new(x, y));
        being.set_action(actor, BeingAction::Walk);
        Ok(())
    }

    fn on_attack(
        &mut self,
        connection: ConnectionId,
        msg: &mut MessageIn,
    ) -> Result<(), WireError> {
        let target_public_id = msg.read_u16()?;
        let Some(entity_id) = self.playing_character(connection) else {
            return Ok(());
        };
        let Some(map_id) = self.state.entity(entity_id).and_then(|e| e.map) else {
            return Ok(());
        };
        let Some(target) = self.find_by_public_id(map_id, target_public_id) else {
            return Ok(());
        };
        if target == entity_id {
            return Ok(());
        }
        let Some(entity) = self.state.entity_mut(entity_id) else {
            return Ok(());
        };
        if let Some(combat) = entity.combat.as_mut() {
            combat.set_target(target);
        }
        let (Some(being), Some(actor)) = (entity.being.as_mut(), entity.actor.as_mut()) else {
            return Ok(());
        };
        if being.action() != BeingAction::Dead {
            being.set_action(actor, BeingAction::Attack);
        }
        Ok(())
    }

    fn on_say(&mut self, connection: ConnectionId, msg: &mut MessageIn) -> Result<(), WireError> {
        let text = msg.read_string()?;
        let Some(entity_id) = self.playing_character(connection) else {
            return Ok(());
        };
        let muted = self
            .state
            .entity(entity_id)
            .and_then(|e| e.being.as_ref())
            .map(|b| b.is_timer_running(TimerId::Mute))
            .unwrap_or(false);
        if muted {
            return Ok(());
        }
        self.state.say(entity_id, &text);
        Ok(())
    }

    fn on_use_ability_on_being(
        &mut self,
        connection: ConnectionId,
        msg: &mut MessageIn,
    ) -> Result<(), WireError> {
        let ability_id = msg.read_u8()? as u32;
        let target_public_id = msg.read_u16()?;
        let Some(entity_id) = self.playing_character(connection) else {
            return Ok(());
        };
        let Some(map_id) = self.state.entity(entity_id).and_then(|e| e.map) else {
            return Ok(());
        };
        let Some(target) = self.find_by_public_id(map_id, target_public_id) else {
            return Ok(());
        };

        let outcome =
            self.state
                .use_ability(entity_id, ability_id, crate::abilities::AbilityTarget::Being);
        match outcome {
            Ok(use_outcome) => {
                if let Some(actor) = self
                    .state
                    .entity_mut(entity_id)
                    .and_then(|e| e.actor.as_mut())
                {
                    actor.raise_update_flags(UpdateFlags::ABILITY_ON_BEING);
                }
                let args = [
                    ScriptArg::Entity(entity_id),
                    ScriptArg::Entity(target),
                    ScriptArg::Int(use_outcome.ability_id as i64),
                ];
                if let Err(e) = self.state.script.invoke(use_outcome.callback, &args) {
                    log::error!("ability callback failed: {e}");
                }
            }
            Err(e) => log::debug!("ability {ability_id} rejected: {e:?}"),
        }
        Ok(())
    }

    fn on_use_ability_on_point(
        &mut self,
        connection: ConnectionId,
        msg: &mut MessageIn,
    ) -> Result<(), WireError> {
        let ability_id = msg.read_u8()? as u32;
        let x = msg.read_u16()? as i32;
        let y = msg.read_u16()? as i32;
        let Some(entity_id) = self.playing_character(connection) else {
            return Ok(());
        };

        let outcome =
            self.state
                .use_ability(entity_id, ability_id, crate::abilities::AbilityTarget::Point);
        match outcome {
            Ok(use_outcome) => {
                if let Some(actor) = self
                    .state
                    .entity_mut(entity_id)
                    .and_then(|e| e.actor.as_mut())
                {
                    actor.raise_update_flags(UpdateFlags::ABILITY_ON_POINT);
                }
                let args = [
                    ScriptArg::Entity(entity_id),
                    ScriptArg::Int(x as i64),
                    ScriptArg::Int(y as i64),
                    ScriptArg::Int(use_outcome.ability_id as i64),
                ];
                if let Err(e) = self.state.script.invoke(use_outcome.callback, &args) {
                    log::error!("ability callback failed: {e}");
                }
            }
            Err(e) => log::debug!("ability {ability_id} rejected: {e:?}"),
        }
        Ok(())
    }

    fn on_npc_talk(
        &mut self,
        connection: ConnectionId,
        msg: &mut MessageIn,
    ) -> Result<(), WireError> {
        let npc_public_id = msg.read_u16()?;
        let Some(entity_id) = self.playing_character(connection) else {
            return Ok(());
        };
        let Some(map_id) = self.state.entity(entity_id).and_then(|e| e.map) else {
            return Ok(());
        };
        let Some(npc_id) = self.find_by_public_id(map_id, npc_public_id) else {
            return Ok(());
        };
        let callback = self
            .state
            .entity(npc_id)
            .and_then(|e| e.npc.as_ref())
            .filter(|npc| npc.enabled)
            .and_then(|npc| npc.talk_callback)
            .or_else(|| self.state.callbacks.get(CallbackSlot::NpcTalk));
        let Some(callback) = callback else {
            return Ok(());
        };

        let args = [ScriptArg::Entity(npc_id), ScriptArg::Entity(entity_id)];
        match self.state.script.invoke(callback, &args) {
            Ok(ScriptResult::Suspended) => {
                if let Some(character) = self
                    .state
                    .entity_mut(entity_id)
                    .and_then(|e| e.character.as_mut())
                {
                    character.npc_thread = Some(npc_id);
                }
            }
            Ok(ScriptResult::Done(_)) => {
                let mut close = MessageOut::new(protocol::NPC_CLOSE);
                close.write_u16(npc_public_id);
                self.send(connection, close);
            }
            Err(e) => log::error!("npc talk script failed: {e}"),
        }
        Ok(())
    }

    fn on_npc_resume(
        &mut self,
        connection: ConnectionId,
        msg: &mut MessageIn,
        value: Option<ResumeValue>,
    ) -> Result<(), WireError> {
        let _npc = msg.read_u16()?;
        self.resume_npc_thread(connection, value.unwrap_or(ResumeValue::Int(0)));
        Ok(())
    }

    fn resume_npc_thread(&mut self, connection: ConnectionId, value: ResumeValue) {
        let Some(entity_id) = self.playing_character(connection) else {
            return;
        };
        let talking_to = self
            .state
            .entity(entity_id)
            .and_then(|e| e.character.as_ref())
            .and_then(|c| c.npc_thread);
        let Some(npc_id) = talking_to else {
            return;
        };
        match self.state.script.resume(entity_id, value) {
            Ok(ScriptResult::Suspended) => {}
            Ok(ScriptResult::Done(_)) => {
                if let Some(character) = self
                    .state
                    .entity_mut(entity_id)
                    .and_then(|e| e.character.as_mut())
                {
                    character.npc_thread = None;
                }
                let npc_public_id = self
                    .state
                    .entity(npc_id)
                    .and_then(|e| e.actor.as_ref())
                    .map(|a| a.public_id)
                    .unwrap_or(0);
                let mut close = MessageOut::new(protocol::NPC_CLOSE);
                close.write_u16(npc_public_id);
                self.send(connection, close);
            }
            Err(e) => log::error!("npc dialogue resume failed: {e}"),
        }
    }

    fn on_respawn(&mut self, connection: ConnectionId) -> Result<(), WireError> {
        if let Some(entity_id) = self.playing_character(connection) {
            self.state.respawn_character(entity_id);
        }
        Ok(())
    }

    fn inventory_reply(&mut self, connection: ConnectionId, result: Result<(), InventoryError>) {
        let code: u8 = match result {
            Ok(()) => ErrorCode::Ok.into(),
            Err(InventoryError::InventoryFull) => ErrorCode::LimitReached.into(),
            Err(InventoryError::NoSuchSlot)
            | Err(InventoryError::InvalidAmount)
            | Err(InventoryError::SlotOccupied)
            | Err(InventoryError::NotEquipped) => ErrorCode::InvalidArgument.into(),
        };
        let mut reply = MessageOut::new(protocol::EQUIP_RESPONSE);
        reply.write_u8(code);
        self.send(connection, reply);
    }

    fn on_equip(&mut self, connection: ConnectionId, msg: &mut MessageIn) -> Result<(), WireError> {
        let inventory_slot = msg.read_u16()?;
        let equip_slot = msg.read_u8()?;
        let Some(entity_id) = self.playing_character(connection) else {
            return Ok(());
        };
        let result = {
            let Some(character) = self
                .state
                .entity_mut(entity_id)
                .and_then(|e| e.character.as_mut())
            else {
                return Ok(());
            };
            character.equip(inventory_slot, equip_slot)
        };
        if result.is_ok() {
            if let Some(actor) = self
                .state
                .entity_mut(entity_id)
                .and_then(|e| e.actor.as_mut())
            {
                actor.raise_update_flags(UpdateFlags::LOOKS_CHANGE);
            }
        }
        self.inventory_reply(connection, result);
        Ok(())
    }

    fn on_unequip(
        &mut self,
        connection: ConnectionId,
        msg: &mut MessageIn,
    ) -> Result<(), WireError> {
        let equip_slot = msg.read_u8()?;
        let Some(entity_id) = self.playing_character(connection) else {
            return Ok(());
        };
        let result = {
            let Some(character) = self
                .state
                .entity_mut(entity_id)
                .and_then(|e| e.character.as_mut())
            else {
                return Ok(());
            };
            character.unequip(equip_slot)
        };
        if result.is_ok() {
            if let Some(actor) = self
                .state
                .entity_mut(entity_id)
                .and_then(|e| e.actor.as_mut())
            {
                actor.raise_update_flags(UpdateFlags::LOOKS_CHANGE);
            }
        }
        self.inventory_reply(connection, result);
        Ok(())
    }

    fn on_move_item(
        &mut self,
        connection: ConnectionId,
        msg: &mut MessageIn,
    ) -> Result<(), WireError> {
        let from = msg.read_u16()?;
        let to = msg.read_u16()?;
        let amount = msg.read_u16()?;
        let Some(entity_id) = self.playing_character(connection) else {
            return Ok(());
        };
        let result = {
            let Some(character) = self
                .state
                .entity_mut(entity_id)
                .and_then(|e| e.character.as_mut())
            else {
                return Ok(());
            };
            character.move_item(from, to, amount)
        };
        self.inventory_reply(connection, result);
        Ok(())
    }

    fn on_drop(&mut self, connection: ConnectionId, msg: &mut MessageIn) -> Result<(), WireError> {
        let slot = msg.read_u16()?;
        let amount = msg.read_u16()?;
        let Some(entity_id) = self.playing_character(connection) else {
            return Ok(());
        };
        let (result, position, map_id) = {
            let Some(entity) = self.state.entity_mut(entity_id) else {
                return Ok(());
            };
            let position = entity.actor.as_ref().map(|a| a.position());
            let map_id = entity.map;
            let Some(character) = entity.character.as_mut() else {
                return Ok(());
            };
            (character.remove_item(slot, amount), position, map_id)
        };
        if result.is_ok() {
            // The stack materializes on the floor where the character
            // stands.
            if let (Some(position), Some(map_id)) = (position, map_id) {
                let mut item = Entity::new(EntityKind::Item);
                item.map = Some(map_id);
                item.actor = Some(ActorComponent::new(position, 0, BlockMask::empty(), None));
                self.state.enqueue_insert(item);
            }
        }
        self.inventory_reply(connection, result);
        Ok(())
    }

    fn on_direction_change(
        &mut self,
        connection: ConnectionId,
        msg: &mut MessageIn,
    ) -> Result<(), WireError> {
        let raw = msg.read_u8()?;
        let Some(direction) = BeingDirection::from_u8(raw) else {
            return Err(WireError::UnexpectedEnd { needed: 0 });
        };
        if let Some(entity_id) = self.playing_character(connection) {
            if let Some(entity) = self.state.entity_mut(entity_id) {
                if let (Some(being), Some(actor)) =
                    (entity.being.as_mut(), entity.actor.as_mut())
                {
                    being.set_direction(actor, direction);
                }
            }
        }
        Ok(())
    }

    fn on_action_change(
        &mut self,
        connection: ConnectionId,
        msg: &mut MessageIn,
    ) -> Result<(), WireError> {
        let raw = msg.read_u8()?;
        let Some(action) = BeingAction::from_u8(raw) else {
            return Err(WireError::UnexpectedEnd { needed: 0 });
        };
        // Clients may only request the passive stances.
        if !matches!(action, BeingAction::Stand | BeingAction::Sit) {
            return Ok(());
        }
        if let Some(entity_id) = self.playing_character(connection) {
            if let Some(entity) = self.state.entity_mut(entity_id) {
                if let (Some(being), Some(actor)) =
                    (entity.being.as_mut(), entity.actor.as_mut())
                {
                    if being.action() != BeingAction::Dead {
                        being.set_action(actor, action);
                    }
                }
            }
        }
        Ok(())
    }

    fn on_disconnect_request(
        &mut self,
        connection: ConnectionId,
        msg: &mut MessageIn,
    ) -> Result<(), WireError> {
        let _reconnect = msg.read_u8()?;
        let mut reply = MessageOut::new(protocol::DISCONNECT_RESPONSE);
        reply.write_u8(ErrorCode::Ok.into());
        self.send(connection, reply);
        self.handle_disconnect(connection);
        self.closing.push(connection);
        Ok(())
    }

    /// One full simulation beat: tick the world, stream awareness deltas,
    /// react to simulation events, surface migrations.
    pub fn pump(&mut self) {
        self.expire_tokens();
        self.state.update();

        // Awareness deltas per playing session.
        let mut deltas = Vec::new();
        for (&connection, session) in &self.sessions {
            if session.state != SessionState::Playing {
                continue;
            }
            let Some(entity_id) = session.character else {
                continue;
            };
            for msg in visibility::inform_player(&self.state, entity_id) {
                deltas.push((connection, msg));
            }
        }
        self.outbox.extend(deltas);

        // Simulation events with session-facing consequences.
        for event in self.state.take_events() {
            match event {
                EntityEvent::Inserted(entity_id)
                | EntityEvent::MapChanged {
                    entity: entity_id, ..
                } => {
                    self.announce_map(entity_id);
                }
                EntityEvent::AttributeChanged { entity, attribute } => {
                    if let Some(connection) = self.connection_for(entity) {
                        let (base, modified) = self
                            .state
                            .entity(entity)
                            .and_then(|e| e.being.as_ref())
                            .map(|b| {
                                (b.attributes.base(attribute), b.attributes.modified(attribute))
                            })
                            .unwrap_or((0.0, 0.0));
                        let mut msg = MessageOut::new(protocol::PLAYER_ATTRIBUTE_CHANGE);
                        msg.write_u16(attribute);
                        msg.write_f64(base);
                        msg.write_f64(modified);
                        self.send(connection, msg);
                    }
                }
                EntityEvent::Quarantined(entity_id) => {
                    if let Some(connection) = self.connection_for(entity_id) {
                        log::warn!("quarantined the character of connection {connection}");
                        if let Some(session) = self.sessions.get_mut(&connection) {
                            session.character = None;
                        }
                        self.closing.push(connection);
                    }
                }
                _ => {}
            }
        }

        // Warps onto maps other shards host become migrations.
        for migration in self.state.take_migrations() {
            let Some(connection) = self.connection_for(migration.character) else {
                continue;
            };
            let Some(session) = self.sessions.get_mut(&connection) else {
                continue;
            };
            session.state = SessionState::Migrating;
            let character_id = session.character_id;
            self.migration_requests.push(character_id);
            self.migrating.insert(
                character_id,
                MigratingCharacter {
                    connection,
                    entity: migration.character,
                    target_map: migration.target_map,
                    target_point: migration.target_point,
                },
            );
        }

        self.state.finish_tick();
    }

    fn connection_for(&self, entity_id: EntityId) -> Option<ConnectionId> {
        self.sessions
            .iter()
            .find(|(_, s)| s.character == Some(entity_id))
            .map(|(c, _)| *c)
    }

    fn announce_map(&mut self, entity_id: EntityId) {
        let Some(connection) = self.connection_for(entity_id) else {
            return;
        };
        let Some(entity) = self.state.entity(entity_id) else {
            return;
        };
        let Some(map_id) = entity.map else {
            return;
        };
        let Some(actor) = entity.actor.as_ref() else {
            return;
        };
        let Some(map) = self.state.map(map_id) else {
            return;
        };
        let pos = actor.position();
        let mut msg = MessageOut::new(protocol::PLAYER_MAP_CHANGE);
        msg.write_string(map.name());
        msg.write_u16(pos.x as u16);
        msg.write_u16(pos.y as u16);
        self.send(connection, msg);
    }

    /// The record flushed ahead of a redirect request, already pointing at
    /// the destination map so the account service can pick the right
    /// shard.
    pub fn migration_departure_record(&self, character_id: u32) -> Option<(u32, CharacterData)> {
        let migrating = self.migrating.get(&character_id)?;
        let mut data = self.character_data(migrating.entity)?;
        data.map_id = migrating.target_map;
        data.position = migrating.target_point;
        Some((character_id, data))
    }

    /// The account service answered a redirect: capture the blob for the
    /// sync flush and point the client at the target shard. Returns the
    /// (character id, record) pair the caller must `PLAYER_SYNC`.
    pub fn complete_migration(
        &mut self,
        character_id: u32,
        token: SessionToken,
        host: &str,
        port: u16,
    ) -> Option<(u32, CharacterData)> {
        let migrating = self.migrating.remove(&character_id)?;

        let mut data = self.character_data(migrating.entity)?;
        // The blob carries the destination, not the departure point.
        data.map_id = migrating.target_map;
        data.position = migrating.target_point;

        let mut msg = MessageOut::new(protocol::PLAYER_SERVER_CHANGE);
        token.write(&mut msg);
        msg.write_string(host);
        msg.write_u16(port);
        self.send(migrating.connection, msg);

        // The entity leaves this shard; the session dies with the socket.
        self.state.script.cancel(migrating.entity);
        self.state.enqueue_remove(migrating.entity);
        if let Some(session) = self.sessions.get_mut(&migrating.connection) {
            session.character = None;
        }
        self.closing.push(migrating.connection);

        Some((character_id, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{attr, AttributeSchema};
    use crate::game_state::{GameSettings, GameState};
    use crate::map::Map;
    use crate::map_composite::MapComposite;
    use crate::script::{NullScriptEngine, RecordingScriptEngine};
    use crate::trigger_area::{TriggerAction, TriggerAreaComponent};
    use evermire_core::character_data::AttributePair;
    use evermire_core::point::Rectangle;

    fn server() -> GameServer {
        let mut state = GameState::new(
            GameSettings::default(),
            AttributeSchema::game_default(),
            Box::new(NullScriptEngine),
        );
        state.reseed_rng(99);
        state.add_map(MapComposite::new(1, "main", Map::new(40, 40, 32, 32)));
        GameServer::new(state)
    }

    fn sample_data() -> CharacterData {
        let mut data = CharacterData {
            map_id: 1,
            position: Point::new(100, 100),
            ..CharacterData::default()
        };
        data.attributes.insert(
            attr::VITALITY,
            AttributePair {
                base: 10.0,
                modified: 10.0,
            },
        );
        data.attributes.insert(
            attr::AGILITY,
            AttributePair {
                base: 60.0,
                modified: 60.0,
            },
        );
        data.attributes.insert(
            attr::HP,
            AttributePair {
                base: 110.0,
                modified: 110.0,
            },
        );
        data
    }

    fn connect_player(server: &mut GameServer, connection: ConnectionId) -> EntityId {
        let token = SessionToken::generate();
        server.register_pending_connect(token, 42, "alice", sample_data());
        server.handle_connect(connection);

        let mut msg = MessageOut::new(protocol::GAME_CONNECT);
        token.write(&mut msg);
        server.handle_frame(connection, &msg.into_bytes());

        let replies = server.take_outbox();
        let mut parsed = MessageIn::from_bytes(replies[0].1.as_bytes()).unwrap();
        assert_eq!(parsed.id(), protocol::GAME_CONNECT_RESPONSE);
        assert_eq!(parsed.read_u8().unwrap(), 0);

        server.pump();
        server.playing_characters()[0].1
    }

    #[test]
    fn token_connect_enters_the_world_and_announces_the_map() {
        let mut server = server();
        let entity_id = connect_player(&mut server, 1);

        let messages = server.take_outbox();
        let map_change = messages
            .iter()
            .find(|(_, m)| {
                MessageIn::from_bytes(m.as_bytes()).unwrap().id() == protocol::PLAYER_MAP_CHANGE
            })
            .expect("PLAYER_MAP_CHANGE after the first tick");
        let mut parsed = MessageIn::from_bytes(map_change.1.as_bytes()).unwrap();
        assert_eq!(parsed.read_string().unwrap(), "main");
        assert_eq!(parsed.read_u16().unwrap(), 100);
        assert_eq!(parsed.read_u16().unwrap(), 100);

        let entity = server.state.entity(entity_id).unwrap();
        assert_eq!(entity.map, Some(1));
        assert_eq!(
            entity.being.as_ref().unwrap().attributes.modified(attr::MAX_HP),
            110.0
        );
    }

    #[test]
    fn a_token_is_single_use() {
        let mut server = server();
        let token = SessionToken::generate();
        server.register_pending_connect(token, 42, "alice", sample_data());

        server.handle_connect(1);
        let mut msg = MessageOut::new(protocol::GAME_CONNECT);
        token.write(&mut msg);
        let bytes = msg.into_bytes();
        server.handle_frame(1, &bytes);
        let first: Vec<_> = server.take_outbox();
        let mut parsed = MessageIn::from_bytes(first[0].1.as_bytes()).unwrap();
        assert_eq!(parsed.read_u8().unwrap(), 0);

        // Second use, from another connection, is refused.
        server.handle_connect(2);
        server.handle_frame(2, &bytes);
        let second = server.take_outbox();
        let mut parsed = MessageIn::from_bytes(second[0].1.as_bytes()).unwrap();
        assert_eq!(parsed.id(), protocol::GAME_CONNECT_RESPONSE);
        assert_eq!(parsed.read_u8().unwrap(), u8::from(ErrorCode::Failure));
    }

    #[test]
    fn expired_tokens_are_refused() {
        let mut server = server();
        let token = SessionToken::generate();
        server.register_pending_connect(token, 42, "alice", sample_data());
        // Backdate the token past its TTL.
        server
            .pending_connects
            .get_mut(token.as_bytes())
            .unwrap()
            .arrived = Instant::now() - TOKEN_TTL - Duration::from_secs(1);

        server.handle_connect(1);
        let mut msg = MessageOut::new(protocol::GAME_CONNECT);
        token.write(&mut msg);
        server.handle_frame(1, &msg.into_bytes());
        let replies = server.take_outbox();
        let mut parsed = MessageIn::from_bytes(replies[0].1.as_bytes()).unwrap();
        assert_eq!(parsed.read_u8().unwrap(), u8::from(ErrorCode::Failure));
    }

    #[test]
    fn walk_requests_move_the_character_over_ticks() {
        let mut server = server();
        let entity_id = connect_player(&mut server, 1);
        server.take_outbox();

        let mut walk = MessageOut::new(protocol::WALK);
        walk.write_u16(196);
        walk.write_u16(100);
        server.handle_frame(1, &walk.into_bytes());

        for _ in 0..6 {
            server.pump();
        }
        let pos = server
            .state
            .entity(entity_id)
            .unwrap()
            .actor
            .as_ref()
            .unwrap()
            .position();
        assert_eq!(pos, Point::new(196, 100));
    }

    #[test]
    fn walking_into_a_wall_goes_nowhere() {
        let mut server = server();
        let entity_id = connect_player(&mut server, 1);
        for x in 0..40 {
            server
                .state
                .map_mut(1)
                .unwrap()
                .map_mut()
                .block_tile(x, 5, BlockType::Wall);
        }

        let mut walk = MessageOut::new(protocol::WALK);
        walk.write_u16(100);
        walk.write_u16(300);
        server.handle_frame(1, &walk.into_bytes());

        for _ in 0..6 {
            server.pump();
        }
        let entity = server.state.entity(entity_id).unwrap();
        assert_eq!(
            entity.actor.as_ref().unwrap().position(),
            Point::new(100, 100)
        );
        assert_eq!(
            entity.being.as_ref().unwrap().action(),
            BeingAction::Stand
        );
    }

    #[test]
    fn muted_characters_say_nothing() {
        let mut server = server();
        let entity_id = connect_player(&mut server, 1);

        server
            .state
            .entity_mut(entity_id)
            .unwrap()
            .being
            .as_mut()
            .unwrap()
            .set_timer_hard(TimerId::Mute, 100);

        let mut say = MessageOut::new(protocol::SAY);
        say.write_string("can you hear me?");
        server.handle_frame(1, &say.into_bytes());
        assert!(server.state.say_events().is_empty());
    }

    #[test]
    fn repeated_garbage_disconnects_the_client() {
        let mut server = server();
        server.handle_connect(1);
        for _ in 0..MAX_PROTOCOL_STRIKES {
            server.handle_frame(1, &[0xff, 0xff, 0x01]);
        }
        assert_eq!(server.take_closing(), vec![1]);
        assert!(server.sessions.is_empty());
    }

    #[test]
    fn migration_flows_through_redirect_sync_and_server_change() {
        let mut server = server();
        let entity_id = connect_player(&mut server, 1);

        // A warp trigger to a map this shard does not host.
        let mut trigger = Entity::new(EntityKind::Other);
        trigger.map = Some(1);
        trigger.actor = Some(ActorComponent::new(
            Point::new(96, 96),
            0,
            BlockMask::empty(),
            None,
        ));
        trigger.trigger_area = Some(TriggerAreaComponent::new(
            Rectangle::new(64, 64, 64, 64),
            TriggerAction::Warp {
                map: 9,
                point: Point::new(50, 60),
            },
            true,
        ));
        server.state.enqueue_insert(trigger);

        // Character stands inside the trigger zone already.
        server.pump();
        server.pump();

        let requests = server.take_migration_requests();
        assert_eq!(requests, vec![42]);

        let token = SessionToken::generate();
        let (character_id, blob) = server
            .complete_migration(42, token, "shard-b", 9700)
            .expect("migration context exists");
        assert_eq!(character_id, 42);
        assert_eq!(blob.map_id, 9);
        assert_eq!(blob.position, Point::new(50, 60));

        let outbox = server.take_outbox();
        let server_change = outbox
            .iter()
            .find(|(_, m)| {
                MessageIn::from_bytes(m.as_bytes()).unwrap().id()
                    == protocol::PLAYER_SERVER_CHANGE
            })
            .expect("client told to reconnect");
        let mut parsed = MessageIn::from_bytes(server_change.1.as_bytes()).unwrap();
        let got_token = SessionToken::read(&mut parsed).unwrap();
        assert_eq!(got_token, token);
        assert_eq!(parsed.read_string().unwrap(), "shard-b");
        assert_eq!(parsed.read_u16().unwrap(), 9700);

        // The entity leaves this shard on the next tick.
        server.pump();
        assert!(server.state.entity(entity_id).is_none());
    }

    #[test]
    fn npc_dialogue_suspends_and_resumes() {
        let mut state = GameState::new(
            GameSettings::default(),
            AttributeSchema::game_default(),
            Box::new(RecordingScriptEngine {
                suspend_on: vec![crate::script::ScriptRef::new(500)],
                ..RecordingScriptEngine::default()
            }),
        );
        state.reseed_rng(7);
        state.add_map(MapComposite::new(1, "main", Map::new(40, 40, 32, 32)));
        let mut server = GameServer::new(state);
        let entity_id = connect_player(&mut server, 1);

        // An NPC with a yielding talk callback.
        let mut npc = Entity::new(EntityKind::Npc);
        npc.map = Some(1);
        npc.actor = Some(ActorComponent::new(
            Point::new(120, 100),
            8,
            BlockMask::WALL,
            None,
        ));
        npc.being = Some(BeingComponent::new("guide"));
        let mut npc_component = crate::npc::NpcComponent::new(7);
        npc_component.talk_callback = Some(crate::script::ScriptRef::new(500));
        npc.npc = Some(npc_component);
        let npc_id = server.state.enqueue_insert(npc);
        server.pump();
        server.take_outbox();

        let npc_public_id = server
            .state
            .entity(npc_id)
            .unwrap()
            .actor
            .as_ref()
            .unwrap()
            .public_id;

        let mut talk = MessageOut::new(protocol::NPC_TALK);
        talk.write_u16(npc_public_id);
        server.handle_frame(1, &talk.into_bytes());

        // Suspended: the character remembers whom it talks to.
        assert_eq!(
            server
                .state
                .entity(entity_id)
                .unwrap()
                .character
                .as_ref()
                .unwrap()
                .npc_thread,
            Some(npc_id)
        );

        let mut select = MessageOut::new(protocol::NPC_SELECT);
        select.write_u16(npc_public_id);
        select.write_u8(2);
        server.handle_frame(1, &select.into_bytes());

        // Resumed to completion: the thread is gone and the dialogue
        // closed.
        assert_eq!(
            server
                .state
                .entity(entity_id)
                .unwrap()
                .character
                .as_ref()
                .unwrap()
                .npc_thread,
            None
        );
        let outbox = server.take_outbox();
        assert!(outbox.iter().any(|(_, m)| {
            MessageIn::from_bytes(m.as_bytes()).unwrap().id() == protocol::NPC_CLOSE
        }));
    }

    #[test]
    fn disconnect_removes_the_character_and_cancels_dialogue() {
        let mut server = server();
        let entity_id = connect_player(&mut server, 1);
        server.handle_disconnect(1);
        server.pump();
        assert!(server.state.entity(entity_id).is_none());
        assert!(server.playing_characters().is_empty());
    }
}
