//! Client-facing side of the account service: registration, login,
//! character management and game-server handoff.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use evermire_core::character_data::{AttributePair, CharacterData, Gender};
use evermire_core::net::ConnectionId;
use evermire_core::point::Point;
use evermire_core::protocol::{self, ErrorCode, PROTOCOL_VERSION};
use evermire_core::token::SessionToken;
use evermire_core::wire::{MessageIn, MessageOut, WireError};

use crate::storage::{Storage, StorageError};
use crate::tokens::TokenRegistry;

/// Minimum delay between login attempts from one connection.
const LOGIN_THROTTLE: Duration = Duration::from_secs(1);

/// Service-level policy knobs.
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub update_host: String,
    pub data_url: String,
    pub chat_host: String,
    pub chat_port: u16,
    /// Shared secret game servers register with.
    pub net_password: String,
    pub character_slots: u8,
    pub min_name_length: usize,
    pub max_name_length: usize,
    pub max_hair_style: u8,
    pub max_hair_color: u8,
    /// Points to distribute over the starting attributes.
    pub starting_points: u16,
    pub attribute_minimum: u16,
    pub attribute_maximum: u16,
    pub default_map: u16,
    pub default_spawn: Point,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            update_host: String::new(),
            data_url: String::new(),
            chat_host: "localhost".to_string(),
            chat_port: 9602,
            net_password: String::new(),
            character_slots: 3,
            min_name_length: 4,
            max_name_length: 16,
            max_hair_style: 15,
            max_hair_color: 11,
            starting_points: 60,
            attribute_minimum: 1,
            attribute_maximum: 20,
            default_map: 1,
            default_spawn: Point::new(2048, 2048),
        }
    }
}

/// The six creation attributes, in wire order.
const CREATION_ATTRIBUTES: [u16; 6] = [1, 2, 3, 4, 5, 6];

pub(crate) struct ClientSession {
    pub account_id: Option<u32>,
    pub last_login_attempt: Option<Instant>,
}

pub(crate) struct GameServerEntry {
    pub host: String,
    pub port: u16,
    pub maps: Vec<u16>,
}

pub struct AccountService {
    pub storage: Storage,
    pub tokens: TokenRegistry,
    pub config: ServiceConfig,
    pub(crate) clients: HashMap<ConnectionId, ClientSession>,
    pub(crate) game_servers: HashMap<ConnectionId, GameServerEntry>,
    /// Accounts with a live client session.
    pub(crate) logged_in: HashMap<u32, ConnectionId>,
    /// Migrating characters and the game-server connection awaiting them.
    pub(crate) migrations: HashMap<u32, ConnectionId>,
    pub(crate) outbox: Vec<(ConnectionId, MessageOut)>,
}

impl AccountService {
    pub fn new(storage: Storage, config: ServiceConfig) -> Self {
        AccountService {
            storage,
            tokens: TokenRegistry::new(),
            config,
            clients: HashMap::new(),
            game_servers: HashMap::new(),
            logged_in: HashMap::new(),
            migrations: HashMap::new(),
            outbox: Vec::new(),
        }
    }

    pub fn take_outbox(&mut self) -> Vec<(ConnectionId, MessageOut)> {
        std::mem::take(&mut self.outbox)
    }

    pub fn handle_connect(&mut self, connection: ConnectionId) {
        self.clients.insert(
            connection,
            ClientSession {
                account_id: None,
                last_login_attempt: None,
            },
        );
    }

    pub fn handle_disconnect(&mut self, connection: ConnectionId) {
        if let Some(session) = self.clients.remove(&connection) {
            if let Some(account_id) = session.account_id {
                self.logged_in.remove(&account_id);
            }
        }
        if self.game_servers.remove(&connection).is_some() {
            log::warn!("game server on connection {connection} went away");
            self.migrations.retain(|_, target| *target != connection);
        }
    }

    pub fn handle_frame(&mut self, connection: ConnectionId, frame: &[u8]) {
        let result = match MessageIn::from_bytes(frame) {
            Ok(mut msg) => {
                if msg.id() >= 0x0500 {
                    self.dispatch_game_server(connection, &mut msg)
                } else {
                    self.dispatch_client(connection, &mut msg)
                }
            }
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            log::warn!("dropping malformed frame from connection {connection}: {e}");
        }
    }

    fn dispatch_client(
        &mut self,
        connection: ConnectionId,
        msg: &mut MessageIn,
    ) -> Result<(), WireError> {
        match msg.id() {
            protocol::REGISTER => self.on_register(connection, msg),
            protocol::UNREGISTER => self.on_unregister(connection, msg),
            protocol::LOGIN => self.on_login(connection, msg),
            protocol::LOGOUT => self.on_logout(connection),
            protocol::CHAR_CREATE => self.on_char_create(connection, msg),
            protocol::CHAR_DELETE => self.on_char_delete(connection, msg),
            protocol::CHAR_SELECT => self.on_char_select(connection, msg),
            other => {
                log::warn!("unknown client message 0x{other:04x}");
                Err(WireError::MissingId)
            }
        }
    }

    pub(crate) fn send(&mut self, connection: ConnectionId, msg: MessageOut) {
        self.outbox.push((connection, msg));
    }

    fn reply_code(&mut self, connection: ConnectionId, id: u16, code: u8) {
        let mut msg = MessageOut::new(id);
        msg.write_u8(code);
        self.send(connection, msg);
    }

    // ----- registration and login ------------------------------------

    fn on_register(
        &mut self,
        connection: ConnectionId,
        msg: &mut MessageIn,
    ) -> Result<(), WireError> {
        let version = msg.read_u32()?;
        let username = msg.read_string()?;
        let password = msg.read_string()?;
        let email = msg.read_string()?;
        let _captcha = msg.read_string()?;

        let code: u8 = if version < PROTOCOL_VERSION {
            protocol::REGISTER_INVALID_VERSION
        } else if username.len() < self.config.min_name_length
            || username.len() > self.config.max_name_length
            || password.is_empty()
            || !email.contains('@')
        {
            ErrorCode::InvalidArgument.into()
        } else if self.storage.does_user_exist(&username).unwrap_or(true) {
            protocol::REGISTER_EXISTS_USERNAME
        } else if self.storage.does_email_exist(&email).unwrap_or(true) {
            protocol::REGISTER_EXISTS_EMAIL
        } else {
            let digest = digest_password(&username, &password);
            match self.storage.add_account(&username, &digest, &email) {
                Ok(id) => {
                    log::info!("registered account '{username}' ({id})");
                    ErrorCode::Ok.into()
                }
                Err(StorageError::NameTaken) => protocol::REGISTER_EXISTS_USERNAME,
                Err(e) => {
                    log::error!("account registration failed: {e}");
                    ErrorCode::Failure.into()
                }
            }
        };

        let mut reply = MessageOut::new(protocol::REGISTER_RESPONSE);
        reply.write_u8(code);
        reply.write_string(&self.config.update_host);
        reply.write_string(&self.config.data_url);
        reply.write_u8(self.config.character_slots);
        self.send(connection, reply);
        Ok(())
    }

    fn on_unregister(
        &mut self,
        connection: ConnectionId,
        msg: &mut MessageIn,
    ) -> Result<(), WireError> {
        let username = msg.read_string()?;
        let password = msg.read_string()?;

        let code: u8 = match self.storage.get_account_by_name(&username) {
            Ok(account)
                if account.password_digest == digest_password(&username, &password) =>
            {
                match self.storage.del_account(account.id) {
                    Ok(()) => {
                        self.logged_in.remove(&account.id);
                        ErrorCode::Ok.into()
                    }
                    Err(e) => {
                        log::error!("account deletion failed: {e}");
                        ErrorCode::Failure.into()
                    }
                }
            }
            // Never reveal whether the name or the password was wrong.
            _ => ErrorCode::Failure.into(),
        };
        self.reply_code(connection, protocol::UNREGISTER_RESPONSE, code);
        Ok(())
    }

    fn on_login(
        &mut self,
        connection: ConnectionId,
        msg: &mut MessageIn,
    ) -> Result<(), WireError> {
        let version = msg.read_u32()?;
        let username = msg.read_string()?;
        let password = msg.read_string()?;

        let throttled = {
            let Some(session) = self.clients.get_mut(&connection) else {
                return Ok(());
            };
            let throttled = session
                .last_login_attempt
                .map(|at| at.elapsed() < LOGIN_THROTTLE)
                .unwrap_or(false);
            session.last_login_attempt = Some(Instant::now());
            throttled
        };

        let mut account_for_session = None;
        let code: u8 = if version < PROTOCOL_VERSION {
            protocol::LOGIN_INVALID_VERSION
        } else if throttled {
            protocol::LOGIN_INVALID_TIME
        } else {
            match self.storage.get_account_by_name(&username) {
                Ok(account) => {
                    let now = chrono::Utc::now().timestamp();
                    if account.password_digest != digest_password(&username, &password) {
                        // Same code as an unknown user: do not reveal
                        // which field failed.
                        ErrorCode::Failure.into()
                    } else if account.banned_until > now {
                        protocol::LOGIN_BANNED
                    } else if self.logged_in.contains_key(&account.id) {
                        ErrorCode::Failure.into()
                    } else {
                        account_for_session = Some(account.id);
                        ErrorCode::Ok.into()
                    }
                }
                Err(StorageError::NotFound) => ErrorCode::Failure.into(),
                Err(e) => {
                    log::error!("login lookup failed: {e}");
                    ErrorCode::Failure.into()
                }
            }
        };

        if let Some(account_id) = account_for_session {
            if let Some(session) = self.clients.get_mut(&connection) {
                session.account_id = Some(account_id);
            }
            self.logged_in.insert(account_id, connection);
            if let Err(e) = self.storage.update_last_login(account_id) {
                log::error!("failed to stamp last login: {e}");
            }
        }

        let mut reply = MessageOut::new(protocol::LOGIN_RESPONSE);
        reply.write_u8(code);
        reply.write_string(&self.config.update_host);
        reply.write_string(&self.config.data_url);
        reply.write_u8(self.config.character_slots);
        self.send(connection, reply);

        if let Some(account_id) = account_for_session {
            self.send_char_infos(connection, account_id);
        }
        Ok(())
    }

    fn send_char_infos(&mut self, connection: ConnectionId, account_id: u32) {
        let records = match self.storage.characters_of_account(account_id) {
            Ok(records) => records,
            Err(e) => {
                log::error!("listing characters failed: {e}");
                return;
            }
        };
        for record in records {
            let mut info = MessageOut::new(protocol::CHAR_INFO);
            info.write_u8(record.slot);
            info.write_string(&record.name);
            info.write_u8(record.data.gender as u8);
            info.write_u8(record.data.hair_style);
            info.write_u8(record.data.hair_color);
            info.write_i16(record.data.level);
            self.send(connection, info);
        }
    }

    fn on_logout(&mut self, connection: ConnectionId) -> Result<(), WireError> {
        if let Some(session) = self.clients.get_mut(&connection) {
            if let Some(account_id) = session.account_id.take() {
                self.logged_in.remove(&account_id);
            }
        }
        self.reply_code(connection, protocol::LOGOUT_RESPONSE, ErrorCode::Ok.into());
        Ok(())
    }

    fn logged_in_account(&self, connection: ConnectionId) -> Option<u32> {
        self.clients.get(&connection).and_then(|s| s.account_id)
    }

    // ----- character management --------------------------------------

    fn on_char_create(
        &mut self,
        connection: ConnectionId,
        msg: &mut MessageIn,
    ) -> Result<(), WireError> {
        let name = msg.read_string()?;
        let hair_style = msg.read_u8()?;
        let hair_color = msg.read_u8()?;
        let gender = msg.read_u8()?;
        let slot = msg.read_u8()?;
        let mut attributes = Vec::new();
        for _ in 0..CREATION_ATTRIBUTES.len() {
            attributes.push(msg.read_u16()?);
        }

        let Some(account_id) = self.logged_in_account(connection) else {
            self.reply_code(
                connection,
                protocol::CHAR_CREATE_RESPONSE,
                ErrorCode::NoLogin.into(),
            );
            return Ok(());
        };

        let code = self.try_create_character(
            account_id,
            &name,
            hair_style,
            hair_color,
            gender,
            slot,
            &attributes,
        );
        self.reply_code(connection, protocol::CHAR_CREATE_RESPONSE, code);
        if code == u8::from(ErrorCode::Ok) {
            self.send_char_infos(connection, account_id);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn try_create_character(
        &mut self,
        account_id: u32,
        name: &str,
        hair_style: u8,
        hair_color: u8,
        gender: u8,
        slot: u8,
        attributes: &[u16],
    ) -> u8 {
        if name.len() < self.config.min_name_length || name.len() > self.config.max_name_length {
            return ErrorCode::InvalidArgument.into();
        }
        if hair_style > self.config.max_hair_style {
            return protocol::CREATE_INVALID_HAIRSTYLE;
        }
        if hair_color > self.config.max_hair_color {
            return protocol::CREATE_INVALID_HAIRCOLOR;
        }
        let Some(gender) = Gender::from_u8(gender) else {
            return protocol::CREATE_INVALID_GENDER;
        };
        if slot >= self.config.character_slots {
            return protocol::CREATE_INVALID_SLOT;
        }
        let existing = match self.storage.characters_of_account(account_id) {
            Ok(existing) => existing,
            Err(e) => {
                log::error!("listing characters failed: {e}");
                return ErrorCode::Failure.into();
            }
        };
        if existing.len() >= self.config.character_slots as usize {
            return protocol::CREATE_TOO_MANY_CHARACTERS;
        }
        if existing.iter().any(|c| c.slot == slot) {
            return protocol::CREATE_INVALID_SLOT;
        }
        if self.storage.does_character_name_exist(name).unwrap_or(true) {
            return protocol::CREATE_EXISTS_NAME;
        }
        for value in attributes {
            if *value < self.config.attribute_minimum || *value > self.config.attribute_maximum {
                return protocol::CREATE_ATTRIBUTES_OUT_OF_RANGE;
            }
        }
        let total: u16 = attributes.iter().sum();
        if total > self.config.starting_points {
            return protocol::CREATE_ATTRIBUTES_TOO_HIGH;
        }
        if total < self.config.starting_points {
            return protocol::CREATE_ATTRIBUTES_TOO_LOW;
        }

        let mut data = CharacterData {
            gender,
            hair_style,
            hair_color,
            level: 1,
            map_id: self.config.default_map,
            position: self.config.default_spawn,
            ..CharacterData::default()
        };
        for (id, value) in CREATION_ATTRIBUTES.iter().zip(attributes) {
            data.attributes.insert(
                *id,
                AttributePair {
                    base: *value as f64,
                    modified: *value as f64,
                },
            );
        }

        match self.storage.add_character(account_id, name, slot, &data) {
            Ok(id) => {
                log::info!("created character '{name}' ({id}) in slot {slot}");
                ErrorCode::Ok.into()
            }
            Err(StorageError::NameTaken) => protocol::CREATE_EXISTS_NAME,
            Err(e) => {
                log::error!("character creation failed: {e}");
                ErrorCode::Failure.into()
            }
        }
    }

    fn on_char_delete(
        &mut self,
        connection: ConnectionId,
        msg: &mut MessageIn,
    ) -> Result<(), WireError> {
        let slot = msg.read_u8()?;
        let code: u8 = match self.logged_in_account(connection) {
            None => ErrorCode::NoLogin.into(),
            Some(account_id) => {
                let record = self
                    .storage
                    .characters_of_account(account_id)
                    .ok()
                    .and_then(|records| records.into_iter().find(|r| r.slot == slot));
                match record {
                    None => ErrorCode::InvalidArgument.into(),
                    Some(record) if self.tokens.is_locked(record.id) => {
                        ErrorCode::Failure.into()
                    }
                    Some(record) => match self.storage.del_character(record.id) {
                        Ok(()) => ErrorCode::Ok.into(),
                        Err(e) => {
                            log::error!("character deletion failed: {e}");
                            ErrorCode::Failure.into()
                        }
                    },
                }
            }
        };
        self.reply_code(connection, protocol::CHAR_DELETE_RESPONSE, code);
        Ok(())
    }

    fn on_char_select(
        &mut self,
        connection: ConnectionId,
        msg: &mut MessageIn,
    ) -> Result<(), WireError> {
        let slot = msg.read_u8()?;

        let Some(account_id) = self.logged_in_account(connection) else {
            let mut reply = MessageOut::new(protocol::CHAR_SELECT_RESPONSE);
            reply.write_u8(ErrorCode::NoLogin.into());
            self.send(connection, reply);
            return Ok(());
        };

        let record = self
            .storage
            .characters_of_account(account_id)
            .ok()
            .and_then(|records| records.into_iter().find(|r| r.slot == slot));
        let Some(record) = record else {
            let mut reply = MessageOut::new(protocol::CHAR_SELECT_RESPONSE);
            reply.write_u8(ErrorCode::InvalidArgument.into());
            self.send(connection, reply);
            return Ok(());
        };

        // Pick the shard hosting the character's map.
        let game_server = self.server_for_map(record.data.map_id);
        let Some((server_connection, host, port)) = game_server else {
            log::warn!("no game server hosts map {}", record.data.map_id);
            let mut reply = MessageOut::new(protocol::CHAR_SELECT_RESPONSE);
            reply.write_u8(ErrorCode::ServerFull.into());
            self.send(connection, reply);
            return Ok(());
        };

        // While a token is outstanding the character is locked; a second
        // select fails.
        let Some(token) = self.tokens.issue(record.id) else {
            let mut reply = MessageOut::new(protocol::CHAR_SELECT_RESPONSE);
            reply.write_u8(ErrorCode::Failure.into());
            self.send(connection, reply);
            return Ok(());
        };

        // Announce the player to the shard ahead of the client.
        let mut enter = MessageOut::new(protocol::GS_PLAYER_ENTER);
        token.write(&mut enter);
        enter.write_u32(record.id);
        enter.write_string(&record.name);
        record.data.serialize(&mut enter);
        self.send(server_connection, enter);

        let mut reply = MessageOut::new(protocol::CHAR_SELECT_RESPONSE);
        reply.write_u8(ErrorCode::Ok.into());
        token.write(&mut reply);
        reply.write_string(&host);
        reply.write_u16(port);
        reply.write_string(&self.config.chat_host.clone());
        reply.write_u16(self.config.chat_port);
        self.send(connection, reply);
        Ok(())
    }

    pub(crate) fn server_for_map(&self, map_id: u16) -> Option<(ConnectionId, String, u16)> {
        self.game_servers
            .iter()
            .find(|(_, entry)| entry.maps.contains(&map_id))
            .or_else(|| self.game_servers.iter().next())
            .map(|(connection, entry)| (*connection, entry.host.clone(), entry.port))
    }

    /// Periodic maintenance: lift served bans, fail timed-out handoffs.
    pub fn sweep(&mut self) {
        if let Err(e) = self.storage.check_banned_accounts() {
            log::error!("ban sweep failed: {e}");
        }
        for expired in self.tokens.sweep_expired() {
            log::info!(
                "handoff for character {} timed out; reverting",
                expired.character_id
            );
            self.migrations.remove(&expired.character_id);
            if let Some(revert) = expired.revert {
                if let Err(e) =
                    self.storage
                        .update_character(expired.character_id, &revert, &[])
                {
                    log::error!("revert of character {} failed: {e}", expired.character_id);
                }
            }
            if let Err(e) = self.storage.set_online_status(expired.character_id, false) {
                log::error!(
                    "marking character {} offline failed: {e}",
                    expired.character_id
                );
            }
        }
    }
}

pub(crate) fn digest_password(username: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(username.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use evermire_core::protocol::{GS_PLAYER_ENTER, GS_REGISTER};

    pub(crate) fn service() -> AccountService {
        let storage = Storage::open_in_memory().unwrap();
        AccountService::new(storage, ServiceConfig::default())
    }

    fn frame(msg: MessageOut) -> Vec<u8> {
        msg.into_bytes()
    }

    fn register_msg(user: &str, pwd: &str, email: &str) -> Vec<u8> {
        let mut msg = MessageOut::new(protocol::REGISTER);
        msg.write_u32(PROTOCOL_VERSION);
        msg.write_string(user);
        msg.write_string(pwd);
        msg.write_string(email);
        msg.write_string("captcha");
        frame(msg)
    }

    fn login_msg(user: &str, pwd: &str) -> Vec<u8> {
        let mut msg = MessageOut::new(protocol::LOGIN);
        msg.write_u32(PROTOCOL_VERSION);
        msg.write_string(user);
        msg.write_string(pwd);
        frame(msg)
    }

    fn char_create_msg(name: &str, slot: u8, attrs: [u16; 6]) -> Vec<u8> {
        let mut msg = MessageOut::new(protocol::CHAR_CREATE);
        msg.write_string(name);
        msg.write_u8(2);
        msg.write_u8(3);
        msg.write_u8(0);
        msg.write_u8(slot);
        for a in attrs {
            msg.write_u16(a);
        }
        frame(msg)
    }

    pub(crate) fn first_reply_code(service: &mut AccountService, id: u16) -> u8 {
        let outbox = service.take_outbox();
        let reply = outbox
            .iter()
            .find(|(_, m)| MessageIn::from_bytes(m.as_bytes()).unwrap().id() == id)
            .unwrap_or_else(|| panic!("no reply with id 0x{id:04x}"));
        let mut parsed = MessageIn::from_bytes(reply.1.as_bytes()).unwrap();
        parsed.read_u8().unwrap()
    }

    pub(crate) fn register_game_server(
        service: &mut AccountService,
        connection: ConnectionId,
        maps: &[u16],
    ) {
        let mut msg = MessageOut::new(GS_REGISTER);
        msg.write_string("shard");
        msg.write_u16(9603);
        msg.write_string("");
        for m in maps {
            msg.write_u16(*m);
        }
        service.handle_frame(connection, &msg.into_bytes());
        service.take_outbox();
    }

    pub(crate) fn login(service: &mut AccountService, connection: ConnectionId) {
        service.handle_connect(connection);
        service.handle_frame(connection, &register_msg("alice", "secret", "a@example.org"));
        service.take_outbox();
        // The throttle window applies to the next attempt on this
        // connection; the registration above was not a login.
        service.handle_frame(connection, &login_msg("alice", "secret"));
        assert_eq!(
            first_reply_code(service, protocol::LOGIN_RESPONSE),
            u8::from(ErrorCode::Ok)
        );
    }

    #[test]
    fn register_then_login_succeeds() {
        let mut service = service();
        login(&mut service, 1);
        assert!(service.logged_in_account(1).is_some());
    }

    #[test]
    fn wrong_credentials_fail_without_saying_which_field() {
        let mut service = service();
        service.handle_connect(1);
        service.handle_frame(1, &register_msg("alice", "secret", "a@example.org"));
        service.take_outbox();

        service.handle_frame(1, &login_msg("alice", "wrong"));
        let wrong_password = first_reply_code(&mut service, protocol::LOGIN_RESPONSE);

        std::thread::sleep(LOGIN_THROTTLE);
        service.handle_frame(1, &login_msg("nobody", "secret"));
        let unknown_user = first_reply_code(&mut service, protocol::LOGIN_RESPONSE);

        assert_eq!(wrong_password, u8::from(ErrorCode::Failure));
        assert_eq!(unknown_user, wrong_password);
    }

    #[test]
    fn rapid_login_attempts_are_throttled() {
        let mut service = service();
        service.handle_connect(1);
        service.handle_frame(1, &register_msg("alice", "secret", "a@example.org"));
        service.take_outbox();

        service.handle_frame(1, &login_msg("alice", "wrong"));
        service.take_outbox();
        service.handle_frame(1, &login_msg("alice", "secret"));
        assert_eq!(
            first_reply_code(&mut service, protocol::LOGIN_RESPONSE),
            protocol::LOGIN_INVALID_TIME
        );
    }

    #[test]
    fn old_protocol_versions_are_rejected() {
        let mut service = service();
        service.handle_connect(1);
        let mut msg = MessageOut::new(protocol::LOGIN);
        msg.write_u32(0);
        msg.write_string("alice");
        msg.write_string("secret");
        service.handle_frame(1, &msg.into_bytes());
        assert_eq!(
            first_reply_code(&mut service, protocol::LOGIN_RESPONSE),
            protocol::LOGIN_INVALID_VERSION
        );
    }

    #[test]
    fn banned_accounts_cannot_log_in_until_the_ban_expires() {
        let mut service = service();
        service.handle_connect(1);
        service.handle_frame(1, &register_msg("alice", "secret", "a@example.org"));
        service.take_outbox();

        let account = service.storage.get_account_by_name("alice").unwrap();
        service
            .storage
            .ban_account(account.id, chrono::Utc::now().timestamp() + 3600)
            .unwrap();

        service.handle_frame(1, &login_msg("alice", "secret"));
        assert_eq!(
            first_reply_code(&mut service, protocol::LOGIN_RESPONSE),
            protocol::LOGIN_BANNED
        );
    }

    #[test]
    fn double_login_on_one_account_fails() {
        let mut service = service();
        login(&mut service, 1);

        service.handle_connect(2);
        service.handle_frame(2, &login_msg("alice", "secret"));
        assert_eq!(
            first_reply_code(&mut service, protocol::LOGIN_RESPONSE),
            u8::from(ErrorCode::Failure)
        );
    }

    #[test]
    fn character_creation_validates_everything() {
        let mut service = service();
        login(&mut service, 1);

        // Attribute sum must hit the budget exactly.
        service.handle_frame(1, &char_create_msg("Hero", 0, [10, 10, 10, 10, 10, 11]));
        assert_eq!(
            first_reply_code(&mut service, protocol::CHAR_CREATE_RESPONSE),
            protocol::CREATE_ATTRIBUTES_TOO_HIGH
        );
        service.handle_frame(1, &char_create_msg("Hero", 0, [10, 10, 10, 10, 10, 9]));
        assert_eq!(
            first_reply_code(&mut service, protocol::CHAR_CREATE_RESPONSE),
            protocol::CREATE_ATTRIBUTES_TOO_LOW
        );
        service.handle_frame(1, &char_create_msg("Hero", 0, [30, 10, 10, 4, 3, 3]));
        assert_eq!(
            first_reply_code(&mut service, protocol::CHAR_CREATE_RESPONSE),
            protocol::CREATE_ATTRIBUTES_OUT_OF_RANGE
        );

        // A valid creation, then slot and name collisions.
        service.handle_frame(1, &char_create_msg("Hero", 0, [10, 10, 10, 10, 10, 10]));
        assert_eq!(
            first_reply_code(&mut service, protocol::CHAR_CREATE_RESPONSE),
            u8::from(ErrorCode::Ok)
        );
        service.handle_frame(1, &char_create_msg("Other", 0, [10, 10, 10, 10, 10, 10]));
        assert_eq!(
            first_reply_code(&mut service, protocol::CHAR_CREATE_RESPONSE),
            protocol::CREATE_INVALID_SLOT
        );
        service.handle_frame(1, &char_create_msg("Hero", 1, [10, 10, 10, 10, 10, 10]));
        assert_eq!(
            first_reply_code(&mut service, protocol::CHAR_CREATE_RESPONSE),
            protocol::CREATE_EXISTS_NAME
        );
        service.handle_frame(1, &char_create_msg("Bad", 9, [10, 10, 10, 10, 10, 10]));
        assert_eq!(
            first_reply_code(&mut service, protocol::CHAR_CREATE_RESPONSE),
            protocol::CREATE_INVALID_SLOT
        );
    }

    #[test]
    fn select_issues_a_token_and_announces_to_the_shard() {
        let mut service = service();
        register_game_server(&mut service, 50, &[1]);
        login(&mut service, 1);
        service.handle_frame(1, &char_create_msg("Hero", 0, [10, 10, 10, 10, 10, 10]));
        service.take_outbox();

        let mut select = MessageOut::new(protocol::CHAR_SELECT);
        select.write_u8(0);
        service.handle_frame(1, &select.into_bytes());

        let outbox = service.take_outbox();
        let enter = outbox
            .iter()
            .find(|(conn, m)| {
                *conn == 50
                    && MessageIn::from_bytes(m.as_bytes()).unwrap().id() == GS_PLAYER_ENTER
            })
            .expect("PLAYER_ENTER pushed to the shard");
        let mut enter_parsed = MessageIn::from_bytes(enter.1.as_bytes()).unwrap();
        let pushed_token = SessionToken::read(&mut enter_parsed).unwrap();
        let character_id = enter_parsed.read_u32().unwrap();
        assert_eq!(enter_parsed.read_string().unwrap(), "Hero");

        let select_reply = outbox
            .iter()
            .find(|(conn, m)| {
                *conn == 1
                    && MessageIn::from_bytes(m.as_bytes()).unwrap().id()
                        == protocol::CHAR_SELECT_RESPONSE
            })
            .expect("select response to the client");
        let mut parsed = MessageIn::from_bytes(select_reply.1.as_bytes()).unwrap();
        assert_eq!(parsed.read_u8().unwrap(), u8::from(ErrorCode::Ok));
        let client_token = SessionToken::read(&mut parsed).unwrap();
        assert_eq!(parsed.read_string().unwrap(), "shard");
        assert_eq!(parsed.read_u16().unwrap(), 9603);

        // The same token reaches shard and client, and it locks the
        // character.
        assert_eq!(client_token, pushed_token);
        assert!(service.tokens.is_locked(character_id));

        // A second select while in flight fails.
        let mut select = MessageOut::new(protocol::CHAR_SELECT);
        select.write_u8(0);
        service.handle_frame(1, &select.into_bytes());
        assert_eq!(
            first_reply_code(&mut service, protocol::CHAR_SELECT_RESPONSE),
            u8::from(ErrorCode::Failure)
        );
    }

    #[test]
    fn select_without_a_shard_reports_server_full() {
        let mut service = service();
        login(&mut service, 1);
        service.handle_frame(1, &char_create_msg("Hero", 0, [10, 10, 10, 10, 10, 10]));
        service.take_outbox();

        let mut select = MessageOut::new(protocol::CHAR_SELECT);
        select.write_u8(0);
        service.handle_frame(1, &select.into_bytes());
        assert_eq!(
            first_reply_code(&mut service, protocol::CHAR_SELECT_RESPONSE),
            u8::from(ErrorCode::ServerFull)
        );
    }
}
