//! The game service's connection to the account service.
//!
//! On startup the shard registers itself with its address and hosted
//! maps. Afterwards the account service pushes entering players (token,
//! name, serialized record) and answers redirect requests for cross-shard
//! migration; the shard flushes character records back through the same
//! pipe.

use evermire_core::character_data::CharacterData;
use evermire_core::protocol;
use evermire_core::token::SessionToken;
use evermire_core::wire::{MessageIn, MessageOut, WireError};

use crate::map_composite::MapId;
use evermire_core::net::NetworkClient;

/// Something the account service told us.
#[derive(Debug)]
pub enum LinkEvent {
    /// Registration acknowledged.
    Registered,
    /// A player selected (or migrates to) this shard; expect their
    /// `GAME_CONNECT` with this token shortly.
    PlayerEnter {
        token: SessionToken,
        character_id: u32,
        name: String,
        data: CharacterData,
    },
    /// Redirect target for a character migrating away from this shard.
    RedirectResponse {
        character_id: u32,
        token: SessionToken,
        host: String,
        port: u16,
    },
    /// Answer to a quest variable lookup.
    QuestVar {
        character_id: u32,
        name: String,
        value: String,
    },
}

pub struct AccountLink {
    client: NetworkClient,
}

impl AccountLink {
    /// Connect and register this shard with the account service.
    pub fn connect(
        account_addr: &str,
        game_host: &str,
        game_port: u16,
        password: &str,
        maps: &[MapId],
    ) -> anyhow::Result<AccountLink> {
        let client = NetworkClient::connect(account_addr)?;
        let mut link = AccountLink { client };

        let mut msg = MessageOut::new(protocol::GS_REGISTER);
        msg.write_string(game_host);
        msg.write_u16(game_port);
        msg.write_string(password);
        for map in maps {
            msg.write_u16(*map);
        }
        link.client.send(&msg)?;
        Ok(link)
    }

    /// Wrap an already-established connection; used by tests.
    pub fn from_client(client: NetworkClient) -> AccountLink {
        AccountLink { client }
    }

    /// Parse everything the account service sent since the last poll.
    /// Malformed frames are dropped with a log line.
    pub fn poll(&mut self) -> anyhow::Result<Vec<LinkEvent>> {
        let mut events = Vec::new();
        for frame in self.client.poll()? {
            match parse_frame(&frame) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(e) => log::warn!("dropping malformed account-server frame: {e}"),
            }
        }
        Ok(events)
    }

    /// Periodic full flush of a character record.
    pub fn flush_character(
        &mut self,
        character_id: u32,
        data: &CharacterData,
    ) -> anyhow::Result<()> {
        let mut msg = MessageOut::new(protocol::GS_PLAYER_DATA);
        msg.write_u32(character_id);
        data.serialize(&mut msg);
        self.client.send(&msg)
    }

    /// Capture the migration snapshot the account service reverts to when
    /// the handoff times out.
    pub fn sync_character(
        &mut self,
        character_id: u32,
        data: &CharacterData,
    ) -> anyhow::Result<()> {
        let mut msg = MessageOut::new(protocol::GS_PLAYER_SYNC);
        msg.write_u32(character_id);
        data.serialize(&mut msg);
        self.client.send(&msg)
    }

    /// Ask where a character migrating off this shard should go.
    pub fn request_redirect(&mut self, character_id: u32) -> anyhow::Result<()> {
        let mut msg = MessageOut::new(protocol::GS_REDIRECT);
        msg.write_u32(character_id);
        self.client.send(&msg)
    }

    /// Confirm a migrated character arrived, releasing the account-side
    /// in-flight lock.
    pub fn confirm_reconnect(
        &mut self,
        character_id: u32,
        token: &SessionToken,
    ) -> anyhow::Result<()> {
        let mut msg = MessageOut::new(protocol::GS_PLAYER_RECONNECT);
        msg.write_u32(character_id);
        token.write(&mut msg);
        self.client.send(&msg)
    }

    pub fn set_quest_var(
        &mut self,
        character_id: u32,
        name: &str,
        value: &str,
    ) -> anyhow::Result<()> {
        let mut msg = MessageOut::new(protocol::GS_SET_QUEST);
        msg.write_u32(character_id);
        msg.write_string(name);
        msg.write_string(value);
        self.client.send(&msg)
    }

    pub fn get_quest_var(&mut self, character_id: u32, name: &str) -> anyhow::Result<()> {
        let mut msg = MessageOut::new(protocol::GS_GET_QUEST);
        msg.write_u32(character_id);
        msg.write_string(name);
        self.client.send(&msg)
    }

    pub fn record_transaction(
        &mut self,
        character_id: u32,
        action: u32,
        message: &str,
    ) -> anyhow::Result<()> {
        let mut msg = MessageOut::new(protocol::GS_TRANSACTION);
        msg.write_u32(character_id);
        msg.write_u32(action);
        msg.write_string(message);
        self.client.send(&msg)
    }

    pub fn ban_character(&mut self, character_id: u32, minutes: u16) -> anyhow::Result<()> {
        let mut msg = MessageOut::new(protocol::GS_BAN_PLAYER);
        msg.write_u32(character_id);
        msg.write_u16(minutes);
        self.client.send(&msg)
    }
}

fn parse_frame(frame: &[u8]) -> Result<Option<LinkEvent>, WireError> {
    let mut msg = MessageIn::from_bytes(frame)?;
    match msg.id() {
        protocol::GS_REGISTER_RESPONSE => {
            let error = msg.read_u8()?;
            if error != 0 {
                log::error!("account service refused our registration: error {error}");
            }
            Ok(Some(LinkEvent::Registered))
        }
        protocol::GS_PLAYER_ENTER => {
            let token = SessionToken::read(&mut msg)?;
            let character_id = msg.read_u32()?;
            let name = msg.read_string()?;
            let data = CharacterData::deserialize(&mut msg)?;
            Ok(Some(LinkEvent::PlayerEnter {
                token,
                character_id,
                name,
                data,
            }))
        }
        protocol::GS_REDIRECT_RESPONSE => {
            let character_id = msg.read_u32()?;
            let token = SessionToken::read(&mut msg)?;
            let host = msg.read_string()?;
            let port = msg.read_u16()?;
            Ok(Some(LinkEvent::RedirectResponse {
                character_id,
                token,
                host,
                port,
            }))
        }
        protocol::GS_GET_QUEST_RESPONSE => {
            let character_id = msg.read_u32()?;
            let name = msg.read_string()?;
            let value = msg.read_string()?;
            Ok(Some(LinkEvent::QuestVar {
                character_id,
                name,
                value,
            }))
        }
        other => {
            log::warn!("unhandled account-server message 0x{other:04x}");
            Ok(None)
        }
    }
}
