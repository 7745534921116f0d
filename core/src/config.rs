//! Service configuration.
//!
//! Settings come from the process environment, optionally seeded from a
//! `.env` file in the working directory. Key names match the server's
//! configuration vocabulary rather than SCREAMING_CASE, so a config file is
//! readable as `game_port=9603`.

use std::env;
use std::str::FromStr;

use anyhow::{Context, Result};
use log::LevelFilter;

#[derive(Clone, Debug)]
pub struct Settings {
    pub account_host: String,
    pub account_port: u16,
    pub game_host: String,
    pub game_port: u16,
    pub chat_host: String,
    pub chat_port: u16,
    /// Numeric map id players spawn on when their record has none.
    pub default_map: u16,
    /// Seconds before a dropped item decays; 0 disables persisting them.
    pub floor_item_decay_time: u32,
    /// Ticks the HP regeneration pauses after taking a hit.
    pub hp_regen_break_after_hit: u32,
    pub mail_max_attachments: u32,
    pub mail_max_letters: u32,
    pub net_max_clients: usize,
    pub log_level: LevelFilter,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            account_host: "localhost".to_string(),
            account_port: 9601,
            game_host: "localhost".to_string(),
            game_port: 9603,
            chat_host: "localhost".to_string(),
            chat_port: 9602,
            default_map: 1,
            floor_item_decay_time: 0,
            hp_regen_break_after_hit: 0,
            mail_max_attachments: 3,
            mail_max_letters: 10,
            net_max_clients: 1000,
            log_level: LevelFilter::Info,
        }
    }
}

fn var_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| anyhow::anyhow!("configuration key '{key}' has invalid value '{raw}'")),
        Err(_) => Ok(default),
    }
}

impl Settings {
    /// Load settings, seeding the environment from `.env` when present.
    pub fn load() -> Result<Settings> {
        // A missing .env file is fine; a malformed one is not.
        match dotenvy::dotenv() {
            Ok(_) | Err(dotenvy::Error::Io(_)) => {}
            Err(e) => return Err(e).context("failed to parse .env"),
        }
        Self::from_env()
    }

    /// Read settings from the current environment only.
    pub fn from_env() -> Result<Settings> {
        let defaults = Settings::default();

        let log_level = match env::var("log_level") {
            Ok(raw) => LevelFilter::from_str(&raw)
                .map_err(|_| anyhow::anyhow!("configuration key 'log_level' has invalid value '{raw}'"))?,
            Err(_) => defaults.log_level,
        };

        Ok(Settings {
            account_host: var_or("account_host", defaults.account_host)?,
            account_port: var_or("account_port", defaults.account_port)?,
            game_host: var_or("game_host", defaults.game_host)?,
            game_port: var_or("game_port", defaults.game_port)?,
            chat_host: var_or("chat_host", defaults.chat_host)?,
            chat_port: var_or("chat_port", defaults.chat_port)?,
            default_map: var_or("defaultMap", defaults.default_map)?,
            floor_item_decay_time: var_or(
                "game_floorItemDecayTime",
                defaults.floor_item_decay_time,
            )?,
            hp_regen_break_after_hit: var_or(
                "game_hpRegenBreakAfterHit",
                defaults.hp_regen_break_after_hit,
            )?,
            mail_max_attachments: var_or("mail_maxAttachments", defaults.mail_max_attachments)?,
            mail_max_letters: var_or("mail_maxLetters", defaults.mail_max_letters)?,
            net_max_clients: var_or("net_maxClients", defaults.net_max_clients)?,
            log_level,
        })
    }

    pub fn account_addr(&self) -> String {
        format!("{}:{}", self.account_host, self.account_port)
    }

    pub fn game_addr(&self) -> String {
        format!("{}:{}", self.game_host, self.game_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Environment mutation is process-global, so every env-touching check
    // lives in this single test.
    #[test]
    fn settings_read_env_overrides_and_reject_garbage() {
        env::remove_var("game_port");
        let defaults = Settings::from_env().unwrap();
        assert_eq!(defaults.game_port, 9603);
        assert_eq!(defaults.default_map, 1);
        assert_eq!(defaults.log_level, LevelFilter::Info);

        env::set_var("game_port", "7777");
        env::set_var("defaultMap", "12");
        env::set_var("net_maxClients", "25");
        env::set_var("log_level", "debug");
        let settings = Settings::from_env().unwrap();
        assert_eq!(settings.game_port, 7777);
        assert_eq!(settings.default_map, 12);
        assert_eq!(settings.net_max_clients, 25);
        assert_eq!(settings.log_level, LevelFilter::Debug);

        env::set_var("game_port", "not-a-port");
        assert!(Settings::from_env().is_err());

        env::remove_var("game_port");
        env::remove_var("defaultMap");
        env::remove_var("net_maxClients");
        env::remove_var("log_level");
    }

    #[test]
    fn addr_helpers_join_host_and_port() {
        let settings = Settings::default();
        assert_eq!(settings.account_addr(), "localhost:9601");
        assert_eq!(settings.game_addr(), "localhost:9603");
    }
}
