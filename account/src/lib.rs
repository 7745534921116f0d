//! Account service library: authentication, character ownership, token
//! brokering and the persistence adapter.

pub mod account_handler;
pub mod game_link;
pub mod storage;
pub mod tokens;
