//! Game-server-facing side of the account service: shard registration,
//! record flushes, quest variables and the migration handoff.

use evermire_core::character_data::CharacterData;
use evermire_core::net::ConnectionId;
use evermire_core::protocol;
use evermire_core::token::SessionToken;
use evermire_core::wire::{MessageIn, MessageOut, WireError};

use crate::account_handler::{AccountService, GameServerEntry};

impl AccountService {
    pub(crate) fn dispatch_game_server(
        &mut self,
        connection: ConnectionId,
        msg: &mut MessageIn,
    ) -> Result<(), WireError> {
        // Everything but the registration itself requires a registered
        // shard on this connection.
        if msg.id() != protocol::GS_REGISTER && !self.game_servers.contains_key(&connection) {
            log::warn!(
                "connection {connection} sent inter-server message 0x{:04x} without registering",
                msg.id()
            );
            return Ok(());
        }
        match msg.id() {
            protocol::GS_REGISTER => self.on_gs_register(connection, msg),
            protocol::GS_ACTIVE_MAP => self.on_gs_active_map(connection, msg),
            protocol::GS_PLAYER_DATA => self.on_gs_player_data(msg),
            protocol::GS_REDIRECT => self.on_gs_redirect(connection, msg),
            protocol::GS_PLAYER_SYNC => self.on_gs_player_sync(msg),
            protocol::GS_PLAYER_RECONNECT => self.on_gs_player_reconnect(msg),
            protocol::GS_SET_QUEST => self.on_gs_set_quest(msg),
            protocol::GS_GET_QUEST => self.on_gs_get_quest(connection, msg),
            protocol::GS_TRANSACTION => self.on_gs_transaction(msg),
            protocol::GS_BAN_PLAYER => self.on_gs_ban_player(msg),
            other => {
                log::warn!("unknown inter-server message 0x{other:04x}");
                Err(WireError::MissingId)
            }
        }
    }

    fn on_gs_register(
        &mut self,
        connection: ConnectionId,
        msg: &mut MessageIn,
    ) -> Result<(), WireError> {
        let host = msg.read_string()?;
        let port = msg.read_u16()?;
        let password = msg.read_string()?;
        let mut maps = Vec::new();
        while msg.unread_len() >= 2 {
            maps.push(msg.read_u16()?);
        }

        let mut reply = MessageOut::new(protocol::GS_REGISTER_RESPONSE);
        if password != self.config.net_password {
            log::warn!("game server {host}:{port} presented a bad password");
            reply.write_u8(1);
            self.send(connection, reply);
            return Ok(());
        }

        log::info!("game server {host}:{port} registered with maps {maps:?}");
        self.game_servers.insert(
            connection,
            GameServerEntry { host, port, maps },
        );
        reply.write_u8(0);
        self.send(connection, reply);
        Ok(())
    }

    fn on_gs_active_map(
        &mut self,
        connection: ConnectionId,
        msg: &mut MessageIn,
    ) -> Result<(), WireError> {
        let map_id = msg.read_u16()?;
        if let Some(entry) = self.game_servers.get_mut(&connection) {
            if !entry.maps.contains(&map_id) {
                entry.maps.push(map_id);
            }
        }
        Ok(())
    }

    fn on_gs_player_data(&mut self, msg: &mut MessageIn) -> Result<(), WireError> {
        let character_id = msg.read_u32()?;
        let data = CharacterData::deserialize(msg)?;
        if let Err(e) = self.storage.update_character(character_id, &data, &[]) {
            log::error!("flush of character {character_id} failed: {e}");
        }
        Ok(())
    }

    /// Step 1 of a migration: the departing shard asks where to send the
    /// character. The preceding `PLAYER_DATA` flush already points the
    /// stored record at the destination map.
    fn on_gs_redirect(
        &mut self,
        connection: ConnectionId,
        msg: &mut MessageIn,
    ) -> Result<(), WireError> {
        let character_id = msg.read_u32()?;

        let record = match self.storage.get_character_by_id(character_id) {
            Ok(record) => record,
            Err(e) => {
                log::error!("redirect for unknown character {character_id}: {e}");
                return Ok(());
            }
        };
        let Some((target_connection, host, port)) = self.server_for_map(record.data.map_id)
        else {
            log::error!(
                "no shard hosts map {} for migrating character {character_id}",
                record.data.map_id
            );
            return Ok(());
        };

        // The character is mid-session, so no select-style lock exists
        // yet; issuing the migration token creates the in-flight lock.
        let Some(token) = self.tokens.issue(character_id) else {
            log::warn!("character {character_id} is already in flight");
            return Ok(());
        };
        self.migrations.insert(character_id, target_connection);

        let mut reply = MessageOut::new(protocol::GS_REDIRECT_RESPONSE);
        reply.write_u32(character_id);
        token.write(&mut reply);
        reply.write_string(&host);
        reply.write_u16(port);
        self.send(connection, reply);
        Ok(())
    }

    /// Step 3: the departing shard's final snapshot. Stored both as the
    /// durable record and as the revert point, then the target shard gets
    /// its `PLAYER_ENTER`.
    fn on_gs_player_sync(&mut self, msg: &mut MessageIn) -> Result<(), WireError> {
        let character_id = msg.read_u32()?;
        let data = CharacterData::deserialize(msg)?;

        if let Err(e) = self.storage.update_character(character_id, &data, &[]) {
            log::error!("sync of character {character_id} failed: {e}");
        }
        self.tokens.store_revert(character_id, data.clone());

        let Some(target_connection) = self.migrations.get(&character_id).copied() else {
            return Ok(());
        };
        let Some(token) = self.tokens.outstanding_token(character_id) else {
            return Ok(());
        };
        let name = self
            .storage
            .get_character_by_id(character_id)
            .map(|r| r.name)
            .unwrap_or_default();

        let mut enter = MessageOut::new(protocol::GS_PLAYER_ENTER);
        token.write(&mut enter);
        enter.write_u32(character_id);
        enter.write_string(&name);
        data.serialize(&mut enter);
        self.send(target_connection, enter);
        Ok(())
    }

    /// Step 5: the target shard confirms the client arrived; the lock
    /// releases and the character counts as online again.
    fn on_gs_player_reconnect(&mut self, msg: &mut MessageIn) -> Result<(), WireError> {
        let character_id = msg.read_u32()?;
        let token = SessionToken::read(msg)?;
        if self.tokens.confirm(character_id, &token) {
            self.migrations.remove(&character_id);
            if let Err(e) = self.storage.set_online_status(character_id, true) {
                log::error!("marking character {character_id} online failed: {e}");
            }
        } else {
            log::warn!("reconnect confirmation for {character_id} carried a stale token");
        }
        Ok(())
    }

    fn on_gs_set_quest(&mut self, msg: &mut MessageIn) -> Result<(), WireError> {
        let character_id = msg.read_u32()?;
        let name = msg.read_string()?;
        let value = msg.read_string()?;
        if let Err(e) = self.storage.set_quest_var(character_id, &name, &value) {
            log::error!("set_quest_var failed: {e}");
        }
        Ok(())
    }

    fn on_gs_get_quest(
        &mut self,
        connection: ConnectionId,
        msg: &mut MessageIn,
    ) -> Result<(), WireError> {
        let character_id = msg.read_u32()?;
        let name = msg.read_string()?;
        let value = self
            .storage
            .get_quest_var(character_id, &name)
            .unwrap_or_default();
        let mut reply = MessageOut::new(protocol::GS_GET_QUEST_RESPONSE);
        reply.write_u32(character_id);
        reply.write_string(&name);
        reply.write_string(&value);
        self.send(connection, reply);
        Ok(())
    }

    fn on_gs_transaction(&mut self, msg: &mut MessageIn) -> Result<(), WireError> {
        let character_id = msg.read_u32()?;
        let action = msg.read_u32()?;
        let message = msg.read_string()?;
        if let Err(e) = self.storage.add_transaction(character_id, action, &message) {
            log::error!("transaction log write failed: {e}");
        }
        Ok(())
    }

    fn on_gs_ban_player(&mut self, msg: &mut MessageIn) -> Result<(), WireError> {
        let character_id = msg.read_u32()?;
        let minutes = msg.read_u16()?;
        let account_id = match self.storage.get_character_by_id(character_id) {
            Ok(record) => record.account_id,
            Err(e) => {
                log::error!("ban for unknown character {character_id}: {e}");
                return Ok(());
            }
        };
        let until = chrono::Utc::now().timestamp() + minutes as i64 * 60;
        if let Err(e) = self.storage.ban_account(account_id, until) {
            log::error!("ban of account {account_id} failed: {e}");
        }
        Ok(())
    }
}
