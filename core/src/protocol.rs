//! Message ids, error codes and shared wire-level enumerations.
//!
//! Id ranges:
//! - account <-> client: `0x0000..=0x00FF`
//! - game <-> client:    `0x0100..=0x03FF`
//! - chat <-> client:    `0x0400..=0x04FF` (served by the chat process)
//! - inter-server:       `0x0500..=0x05FF`

/// Protocol revision. Clients announcing an older version are rejected at
/// login and registration.
pub const PROTOCOL_VERSION: u32 = 1;

/// Length of a session token in bytes.
pub const TOKEN_LENGTH: usize = 32;

// Account <-> client.
pub const REGISTER: u16 = 0x0000; // D version, S username, S password, S email, S captcha
pub const REGISTER_RESPONSE: u16 = 0x0001; // B error, S update host, S data url, B slots
pub const UNREGISTER: u16 = 0x0002; // S username, S password
pub const UNREGISTER_RESPONSE: u16 = 0x0003; // B error
pub const LOGIN: u16 = 0x0010; // D version, S username, S password
pub const LOGIN_RESPONSE: u16 = 0x0011; // B error, S update host, S data url, B slots
pub const LOGOUT: u16 = 0x0012; // -
pub const LOGOUT_RESPONSE: u16 = 0x0013; // B error
pub const CHAR_CREATE: u16 = 0x0020; // S name, B hair style, B hair color, B gender, B slot, {W stat}*
pub const CHAR_CREATE_RESPONSE: u16 = 0x0021; // B error
pub const CHAR_DELETE: u16 = 0x0022; // B slot
pub const CHAR_DELETE_RESPONSE: u16 = 0x0023; // B error
pub const CHAR_INFO: u16 = 0x0024; // B slot, S name, B gender, B hair style, B hair color, W level
pub const CHAR_SELECT: u16 = 0x0026; // B slot
pub const CHAR_SELECT_RESPONSE: u16 = 0x0027; // B error, B*32 token, S game host, W game port, S chat host, W chat port

// Game <-> client.
pub const GAME_CONNECT: u16 = 0x0100; // B*32 token
pub const GAME_CONNECT_RESPONSE: u16 = 0x0101; // B error
pub const PLAYER_MAP_CHANGE: u16 = 0x0110; // S map name, W x, W y
pub const PLAYER_SERVER_CHANGE: u16 = 0x0111; // B*32 token, S game host, W game port
pub const WALK: u16 = 0x0120; // W x, W y
pub const ACTION_CHANGE: u16 = 0x0121; // B action
pub const BEING_ACTION_CHANGE: u16 = 0x0122; // W being id, B action
pub const DIRECTION_CHANGE: u16 = 0x0123; // B direction
pub const BEING_DIR_CHANGE: u16 = 0x0124; // W being id, B direction
pub const BEING_ENTER: u16 = 0x0130; // B type, W being id, B action, W x, W y, B direction, ...
pub const BEING_LEAVE: u16 = 0x0131; // W being id
pub const BEINGS_MOVE: u16 = 0x0132; // { W being id, B flags [, W x, W y, W dx, W dy] }*
pub const BEING_HEALTH_CHANGE: u16 = 0x0133; // W being id, W hp, W max hp
pub const BEINGS_DAMAGE: u16 = 0x0134; // { W being id, W amount }*
pub const BEING_ATTACK: u16 = 0x0135; // W being id, B direction, W attack id
pub const BEING_LOOKS_CHANGE: u16 = 0x0136; // W being id, B hair style, B hair color
pub const ATTACK: u16 = 0x0140; // W being id
pub const USE_ABILITY_ON_BEING: u16 = 0x0141; // B ability id, W being id
pub const USE_ABILITY_ON_POINT: u16 = 0x0142; // B ability id, W x, W y
pub const ABILITY_STATUS: u16 = 0x0143; // { B ability id, D current, D needed, D recharge }*
pub const SAY: u16 = 0x0150; // S text
pub const BEING_SAY: u16 = 0x0151; // W being id, S text
pub const NPC_TALK: u16 = 0x0160; // W being id
pub const NPC_MESSAGE: u16 = 0x0161; // W being id, S text
pub const NPC_CHOICE: u16 = 0x0162; // W being id, { S text }*
pub const NPC_TALK_NEXT: u16 = 0x0163; // W being id
pub const NPC_SELECT: u16 = 0x0164; // W being id, B choice
pub const NPC_NUMBER: u16 = 0x0165; // W being id, D number
pub const NPC_STRING: u16 = 0x0166; // W being id, S text
pub const NPC_CLOSE: u16 = 0x0167; // W being id
pub const RESPAWN: u16 = 0x0170; // -
pub const EQUIP: u16 = 0x0180; // W inventory slot, B equip slot
pub const UNEQUIP: u16 = 0x0181; // B equip slot
pub const MOVE_ITEM: u16 = 0x0182; // W slot1, W slot2, W amount
pub const DROP: u16 = 0x0183; // W slot, W amount
pub const EQUIP_RESPONSE: u16 = 0x0184; // B error
pub const INVENTORY_FULL: u16 = 0x0185; // W count { W slot, W item id, W amount }, W count { B equip slot, W inv slot }
pub const PLAYER_ATTRIBUTE_CHANGE: u16 = 0x0190; // { W attribute, DF base, DF modified }*
pub const DISCONNECT: u16 = 0x01a0; // B reconnect
pub const DISCONNECT_RESPONSE: u16 = 0x01a1; // B error [, B*32 token]

// Inter-server (game <-> account).
pub const GS_REGISTER: u16 = 0x0500; // S host, W port, S password, { W map id }*
pub const GS_REGISTER_RESPONSE: u16 = 0x0501; // B error
pub const GS_ACTIVE_MAP: u16 = 0x0502; // W map id
pub const GS_PLAYER_ENTER: u16 = 0x0510; // B*32 token, D character id, S name, blob
pub const GS_PLAYER_DATA: u16 = 0x0520; // D character id, blob
pub const GS_REDIRECT: u16 = 0x0530; // D character id
pub const GS_REDIRECT_RESPONSE: u16 = 0x0531; // D character id, B*32 token, S host, W port
pub const GS_PLAYER_RECONNECT: u16 = 0x0532; // D character id, B*32 token
pub const GS_PLAYER_SYNC: u16 = 0x0533; // D character id, blob
pub const GS_SET_QUEST: u16 = 0x0540; // D character id, S name, S value
pub const GS_GET_QUEST: u16 = 0x0541; // D character id, S name
pub const GS_GET_QUEST_RESPONSE: u16 = 0x0542; // D character id, S name, S value
pub const GS_BAN_PLAYER: u16 = 0x0550; // D character id, W duration (minutes)
pub const GS_TRANSACTION: u16 = 0x0560; // D character id, D action, S message

/// Generic result codes carried in response messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    Ok = 0,
    Failure = 1,
    NoLogin = 2,
    NoCharacterSelected = 3,
    InsufficientRights = 4,
    InvalidArgument = 5,
    EmailAlreadyExists = 6,
    AlreadyTaken = 7,
    ServerFull = 8,
    TimeOut = 9,
    LimitReached = 10,
    AdministrativeLogoff = 11,
}

impl From<ErrorCode> for u8 {
    fn from(code: ErrorCode) -> u8 {
        code as u8
    }
}

// Login specific return values.
pub const LOGIN_INVALID_VERSION: u8 = 0x40;
pub const LOGIN_BANNED: u8 = 0x41;
pub const LOGIN_INVALID_TIME: u8 = 0x50;

// Registration specific return values.
pub const REGISTER_INVALID_VERSION: u8 = 0x40;
pub const REGISTER_EXISTS_USERNAME: u8 = 0x41;
pub const REGISTER_EXISTS_EMAIL: u8 = 0x42;
pub const REGISTER_CAPTCHA_WRONG: u8 = 0x43;

// Character creation specific return values.
pub const CREATE_INVALID_HAIRSTYLE: u8 = 0x40;
pub const CREATE_INVALID_HAIRCOLOR: u8 = 0x41;
pub const CREATE_INVALID_GENDER: u8 = 0x42;
pub const CREATE_ATTRIBUTES_TOO_HIGH: u8 = 0x43;
pub const CREATE_ATTRIBUTES_TOO_LOW: u8 = 0x44;
pub const CREATE_ATTRIBUTES_OUT_OF_RANGE: u8 = 0x45;
pub const CREATE_EXISTS_NAME: u8 = 0x46;
pub const CREATE_TOO_MANY_CHARACTERS: u8 = 0x47;
pub const CREATE_INVALID_SLOT: u8 = 0x48;

/// Entity type tag as it appears in `BEING_ENTER` payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EntityKind {
    Item = 0,
    Actor = 1,
    Npc = 2,
    Monster = 3,
    Character = 4,
    Effect = 5,
    Other = 6,
}

/// Action state of a being. Has to stay in sync with the client.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum BeingAction {
    #[default]
    Stand = 0,
    Walk = 1,
    Attack = 2,
    Sit = 3,
    Dead = 4,
    Hurt = 5,
}

impl BeingAction {
    pub fn from_u8(value: u8) -> Option<BeingAction> {
        match value {
            0 => Some(BeingAction::Stand),
            1 => Some(BeingAction::Walk),
            2 => Some(BeingAction::Attack),
            3 => Some(BeingAction::Sit),
            4 => Some(BeingAction::Dead),
            5 => Some(BeingAction::Hurt),
            _ => None,
        }
    }
}

/// Facing direction of a being. The values are the client's sprite flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum BeingDirection {
    #[default]
    Down = 1,
    Left = 2,
    Up = 4,
    Right = 8,
}

impl BeingDirection {
    pub fn from_u8(value: u8) -> Option<BeingDirection> {
        match value {
            1 => Some(BeingDirection::Down),
            2 => Some(BeingDirection::Left),
            4 => Some(BeingDirection::Up),
            8 => Some(BeingDirection::Right),
            _ => None,
        }
    }
}

/// Flags used in `BEINGS_MOVE` payload entries.
pub const MOVING_POSITION: u8 = 1;
pub const MOVING_DESTINATION: u8 = 2;

/// Player-versus-player policy of a map.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PvpMode {
    #[default]
    None,
    Free,
}

/// Elemental affinity of a damage source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum Element {
    #[default]
    Neutral = 0,
    Fire = 1,
    Water = 2,
    Earth = 3,
    Air = 4,
    Lightning = 5,
    Metal = 6,
    Wood = 7,
    Ice = 8,
}

/// Method of damage calculation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DamageType {
    Physical,
    Magical,
    Direct,
    #[default]
    Other,
}
