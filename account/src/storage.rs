//! The persistence adapter.
//!
//! SQLite owns the durable state: accounts, character records (the same
//! blob the wire carries), quest and world-state variables, letters,
//! transactions, guilds, floor items and bans. Every operation is atomic
//! at the granularity of one character record; the composite character
//! flush runs in a single transaction. Statements go through the
//! connection's prepared-statement cache.
//!
//! A connection failure at startup is fatal for the service; runtime
//! errors are logged by the callers and surfaced to clients as a plain
//! failure code.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use evermire_core::character_data::CharacterData;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("record not found")]
    NotFound,
    #[error("name already taken")]
    NameTaken,
    #[error("stored character blob is corrupt")]
    CorruptBlob,
}

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Clone, Debug, PartialEq)]
pub struct Account {
    pub id: u32,
    pub username: String,
    pub password_digest: String,
    pub email: String,
    pub level: i8,
    /// Unix timestamp the ban expires at; 0 means not banned.
    pub banned_until: i64,
    pub registration_date: i64,
    pub last_login: i64,
}

#[derive(Clone, Debug)]
pub struct CharacterRecord {
    pub id: u32,
    pub account_id: u32,
    pub name: String,
    pub slot: u8,
    pub online: bool,
    pub data: CharacterData,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Letter {
    pub id: u32,
    pub sender_id: u32,
    pub receiver_id: u32,
    pub text: String,
    pub sent_date: i64,
    pub attachments: Vec<(u16, u16)>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Transaction {
    pub id: u32,
    pub character_id: u32,
    pub action: u32,
    pub message: String,
    pub time: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FloorItem {
    pub id: u32,
    pub map_id: u16,
    pub item_id: u16,
    pub amount: u16,
    pub x: i32,
    pub y: i32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Guild {
    pub id: u32,
    pub name: String,
}

pub struct Storage {
    connection: Connection,
}

impl Storage {
    /// Open (and migrate) the database file. Failure here aborts startup.
    pub fn open(path: &str) -> StorageResult<Storage> {
        let connection = Connection::open(path)?;
        Self::from_connection(connection)
    }

    /// In-memory database, used by the tests.
    pub fn open_in_memory() -> StorageResult<Storage> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(connection: Connection) -> StorageResult<Storage> {
        connection.pragma_update(None, "foreign_keys", "ON")?;
        connection.execute_batch(
            "CREATE TABLE IF NOT EXISTS accounts (
                 id INTEGER PRIMARY KEY,
                 username TEXT UNIQUE NOT NULL,
                 password TEXT NOT NULL,
                 email TEXT NOT NULL,
                 level INTEGER NOT NULL DEFAULT 0,
                 banned_until INTEGER NOT NULL DEFAULT 0,
                 registration_date INTEGER NOT NULL,
                 last_login INTEGER NOT NULL DEFAULT 0
             );
             CREATE TABLE IF NOT EXISTS characters (
                 id INTEGER PRIMARY KEY,
                 account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                 name TEXT UNIQUE NOT NULL,
                 slot INTEGER NOT NULL,
                 online INTEGER NOT NULL DEFAULT 0,
                 data BLOB NOT NULL
             );
             CREATE TABLE IF NOT EXISTS quest_vars (
                 character_id INTEGER NOT NULL REFERENCES characters(id) ON DELETE CASCADE,
                 name TEXT NOT NULL,
                 value TEXT NOT NULL,
                 PRIMARY KEY (character_id, name)
             );
             CREATE TABLE IF NOT EXISTS world_state_vars (
                 map_id INTEGER NOT NULL DEFAULT 0,
                 name TEXT NOT NULL,
                 value TEXT NOT NULL,
                 PRIMARY KEY (map_id, name)
             );
             CREATE TABLE IF NOT EXISTS letters (
                 id INTEGER PRIMARY KEY,
                 sender_id INTEGER NOT NULL,
                 receiver_id INTEGER NOT NULL,
                 letter_text TEXT NOT NULL,
                 sent_date INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS letter_attachments (
                 letter_id INTEGER NOT NULL REFERENCES letters(id) ON DELETE CASCADE,
                 item_id INTEGER NOT NULL,
                 amount INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS transactions (
                 id INTEGER PRIMARY KEY,
                 character_id INTEGER NOT NULL,
                 action INTEGER NOT NULL,
                 message TEXT NOT NULL,
                 time INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS guilds (
                 id INTEGER PRIMARY KEY,
                 name TEXT UNIQUE NOT NULL
             );
             CREATE TABLE IF NOT EXISTS guild_members (
                 guild_id INTEGER NOT NULL REFERENCES guilds(id) ON DELETE CASCADE,
                 character_id INTEGER NOT NULL,
                 rights INTEGER NOT NULL DEFAULT 0,
                 PRIMARY KEY (guild_id, character_id)
             );
             CREATE TABLE IF NOT EXISTS floor_items (
                 id INTEGER PRIMARY KEY,
                 map_id INTEGER NOT NULL,
                 item_id INTEGER NOT NULL,
                 amount INTEGER NOT NULL,
                 pos_x INTEGER NOT NULL,
                 pos_y INTEGER NOT NULL
             );",
        )?;
        Ok(Storage { connection })
    }

    // ----- accounts --------------------------------------------------

    pub fn add_account(
        &mut self,
        username: &str,
        password_digest: &str,
        email: &str,
    ) -> StorageResult<u32> {
        let now = Utc::now().timestamp();
        let result = self
            .connection
            .prepare_cached(
                "INSERT INTO accounts (username, password, email, registration_date)
                 VALUES (?1, ?2, ?3, ?4)",
            )?
            .execute(params![username, password_digest, email, now]);
        match result {
            Ok(_) => Ok(self.connection.last_insert_rowid() as u32),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StorageError::NameTaken)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_account_by_name(&self, username: &str) -> StorageResult<Account> {
        self.connection
            .prepare_cached(
                "SELECT id, username, password, email, level, banned_until,
                        registration_date, last_login
                 FROM accounts WHERE username = ?1",
            )?
            .query_row(params![username], row_to_account)
            .optional()?
            .ok_or(StorageError::NotFound)
    }

    pub fn get_account_by_id(&self, id: u32) -> StorageResult<Account> {
        self.connection
            .prepare_cached(
                "SELECT id, username, password, email, level, banned_until,
                        registration_date, last_login
                 FROM accounts WHERE id = ?1",
            )?
            .query_row(params![id], row_to_account)
            .optional()?
            .ok_or(StorageError::NotFound)
    }

    /// Write back every mutable account field.
    pub fn flush_account(&mut self, account: &Account) -> StorageResult<()> {
        let changed = self
            .connection
            .prepare_cached(
                "UPDATE accounts
                 SET password = ?2, email = ?3, level = ?4, banned_until = ?5,
                     last_login = ?6
                 WHERE id = ?1",
            )?
            .execute(params![
                account.id,
                account.password_digest,
                account.email,
                account.level,
                account.banned_until,
                account.last_login,
            ])?;
        if changed == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    pub fn del_account(&mut self, id: u32) -> StorageResult<()> {
        let changed = self
            .connection
            .prepare_cached("DELETE FROM accounts WHERE id = ?1")?
            .execute(params![id])?;
        if changed == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    pub fn set_account_level(&mut self, id: u32, level: i8) -> StorageResult<()> {
        self.connection
            .prepare_cached("UPDATE accounts SET level = ?2 WHERE id = ?1")?
            .execute(params![id, level])?;
        Ok(())
    }

    pub fn update_last_login(&mut self, id: u32) -> StorageResult<()> {
        let now = Utc::now().timestamp();
        self.connection
            .prepare_cached("UPDATE accounts SET last_login = ?2 WHERE id = ?1")?
            .execute(params![id, now])?;
        Ok(())
    }

    pub fn ban_account(&mut self, id: u32, until: i64) -> StorageResult<()> {
        self.connection
            .prepare_cached("UPDATE accounts SET banned_until = ?2 WHERE id = ?1")?
            .execute(params![id, until])?;
        Ok(())
    }

    /// Clear bans whose time served is over. Returns how many were lifted.
    pub fn check_banned_accounts(&mut self) -> StorageResult<usize> {
        let now = Utc::now().timestamp();
        let lifted = self
            .connection
            .prepare_cached(
                "UPDATE accounts SET banned_until = 0
                 WHERE banned_until != 0 AND banned_until <= ?1",
            )?
            .execute(params![now])?;
        Ok(lifted)
    }

    pub fn does_user_exist(&self, username: &str) -> StorageResult<bool> {
        let count: i64 = self
            .connection
            .prepare_cached("SELECT COUNT(*) FROM accounts WHERE username = ?1")?
            .query_row(params![username], |row| row.get(0))?;
        Ok(count > 0)
    }

    pub fn does_email_exist(&self, email: &str) -> StorageResult<bool> {
        let count: i64 = self
            .connection
            .prepare_cached("SELECT COUNT(*) FROM accounts WHERE email = ?1")?
            .query_row(params![email], |row| row.get(0))?;
        Ok(count > 0)
    }

    // ----- characters ------------------------------------------------

    pub fn does_character_name_exist(&self, name: &str) -> StorageResult<bool> {
        let count: i64 = self
            .connection
            .prepare_cached("SELECT COUNT(*) FROM characters WHERE name = ?1")?
            .query_row(params![name], |row| row.get(0))?;
        Ok(count > 0)
    }

    pub fn add_character(
        &mut self,
        account_id: u32,
        name: &str,
        slot: u8,
        data: &CharacterData,
    ) -> StorageResult<u32> {
        let blob = data.to_blob();
        let result = self
            .connection
            .prepare_cached(
                "INSERT INTO characters (account_id, name, slot, data)
                 VALUES (?1, ?2, ?3, ?4)",
            )?
            .execute(params![account_id, name, slot, blob]);
        match result {
            Ok(_) => Ok(self.connection.last_insert_rowid() as u32),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StorageError::NameTaken)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_character_by_id(&self, id: u32) -> StorageResult<CharacterRecord> {
        self.connection
            .prepare_cached(
                "SELECT id, account_id, name, slot, online, data
                 FROM characters WHERE id = ?1",
            )?
            .query_row(params![id], row_to_character)
            .optional()?
            .ok_or(StorageError::NotFound)?
    }

    /// Look a character up by name, optionally verifying the owner.
    pub fn get_character_by_name(
        &self,
        name: &str,
        owner: Option<u32>,
    ) -> StorageResult<CharacterRecord> {
        let record = self
            .connection
            .prepare_cached(
                "SELECT id, account_id, name, slot, online, data
                 FROM characters WHERE name = ?1",
            )?
            .query_row(params![name], row_to_character)
            .optional()?
            .ok_or(StorageError::NotFound)??;
        if let Some(owner) = owner {
            if record.account_id != owner {
                return Err(StorageError::NotFound);
            }
        }
        Ok(record)
    }

    pub fn characters_of_account(&self, account_id: u32) -> StorageResult<Vec<CharacterRecord>> {
        let mut statement = self.connection.prepare_cached(
            "SELECT id, account_id, name, slot, online, data
             FROM characters WHERE account_id = ?1 ORDER BY slot",
        )?;
        let rows = statement.query_map(params![account_id], row_to_character)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row??);
        }
        Ok(records)
    }

    /// Replace a character's record, and optionally its quest variables,
    /// in one transaction.
    pub fn update_character(
        &mut self,
        id: u32,
        data: &CharacterData,
        quest_vars: &[(String, String)],
    ) -> StorageResult<()> {
        let tx = self.connection.transaction()?;
        let changed = tx
            .prepare_cached("UPDATE characters SET data = ?2 WHERE id = ?1")?
            .execute(params![id, data.to_blob()])?;
        if changed == 0 {
            return Err(StorageError::NotFound);
        }
        for (name, value) in quest_vars {
            tx.prepare_cached(
                "INSERT INTO quest_vars (character_id, name, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(character_id, name) DO UPDATE SET value = ?3",
            )?
            .execute(params![id, name, value])?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn del_character(&mut self, id: u32) -> StorageResult<()> {
        let changed = self
            .connection
            .prepare_cached("DELETE FROM characters WHERE id = ?1")?
            .execute(params![id])?;
        if changed == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    pub fn set_online_status(&mut self, character_id: u32, online: bool) -> StorageResult<()> {
        self.connection
            .prepare_cached("UPDATE characters SET online = ?2 WHERE id = ?1")?
            .execute(params![character_id, online as i32])?;
        Ok(())
    }

    /// Startup cleanup after an unclean shutdown.
    pub fn set_all_offline(&mut self) -> StorageResult<()> {
        self.connection
            .prepare_cached("UPDATE characters SET online = 0")?
            .execute([])?;
        Ok(())
    }

    // ----- quest and world state variables ---------------------------

    pub fn get_quest_var(&self, character_id: u32, name: &str) -> StorageResult<String> {
        Ok(self
            .connection
            .prepare_cached(
                "SELECT value FROM quest_vars WHERE character_id = ?1 AND name = ?2",
            )?
            .query_row(params![character_id, name], |row| row.get(0))
            .optional()?
            .unwrap_or_default())
    }

    pub fn set_quest_var(
        &mut self,
        character_id: u32,
        name: &str,
        value: &str,
    ) -> StorageResult<()> {
        self.connection
            .prepare_cached(
                "INSERT INTO quest_vars (character_id, name, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(character_id, name) DO UPDATE SET value = ?3",
            )?
            .execute(params![character_id, name, value])?;
        Ok(())
    }

    /// World state variables; `map_id` 0 holds the global ones.
    pub fn get_world_state_var(&self, name: &str, map_id: Option<u16>) -> StorageResult<String> {
        Ok(self
            .connection
            .prepare_cached(
                "SELECT value FROM world_state_vars WHERE map_id = ?1 AND name = ?2",
            )?
            .query_row(params![map_id.unwrap_or(0), name], |row| row.get(0))
            .optional()?
            .unwrap_or_default())
    }

    pub fn set_world_state_var(
        &mut self,
        name: &str,
        value: &str,
        map_id: Option<u16>,
    ) -> StorageResult<()> {
        self.connection
            .prepare_cached(
                "INSERT INTO world_state_vars (map_id, name, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(map_id, name) DO UPDATE SET value = ?3",
            )?
            .execute(params![map_id.unwrap_or(0), name, value])?;
        Ok(())
    }

    // ----- post ------------------------------------------------------

    pub fn store_letter(
        &mut self,
        sender_id: u32,
        receiver_id: u32,
        text: &str,
        attachments: &[(u16, u16)],
    ) -> StorageResult<u32> {
        let now = Utc::now().timestamp();
        let tx = self.connection.transaction()?;
        tx.prepare_cached(
            "INSERT INTO letters (sender_id, receiver_id, letter_text, sent_date)
             VALUES (?1, ?2, ?3, ?4)",
        )?
        .execute(params![sender_id, receiver_id, text, now])?;
        let letter_id = tx.last_insert_rowid() as u32;
        for (item_id, amount) in attachments {
            tx.prepare_cached(
                "INSERT INTO letter_attachments (letter_id, item_id, amount)
                 VALUES (?1, ?2, ?3)",
            )?
            .execute(params![letter_id, item_id, amount])?;
        }
        tx.commit()?;
        Ok(letter_id)
    }

    pub fn get_stored_post(&self, receiver_id: u32) -> StorageResult<Vec<Letter>> {
        let mut statement = self.connection.prepare_cached(
            "SELECT id, sender_id, receiver_id, letter_text, sent_date
             FROM letters WHERE receiver_id = ?1 ORDER BY id",
        )?;
        let rows = statement.query_map(params![receiver_id], |row| {
            Ok(Letter {
                id: row.get(0)?,
                sender_id: row.get(1)?,
                receiver_id: row.get(2)?,
                text: row.get(3)?,
                sent_date: row.get(4)?,
                attachments: Vec::new(),
            })
        })?;
        let mut letters = Vec::new();
        for row in rows {
            letters.push(row?);
        }
        for letter in &mut letters {
            let mut attachment_statement = self.connection.prepare_cached(
                "SELECT item_id, amount FROM letter_attachments WHERE letter_id = ?1",
            )?;
            let attachment_rows = attachment_statement
                .query_map(params![letter.id], |row| Ok((row.get(0)?, row.get(1)?)))?;
            for attachment in attachment_rows {
                letter.attachments.push(attachment?);
            }
        }
        Ok(letters)
    }

    pub fn delete_post(&mut self, letter_id: u32) -> StorageResult<()> {
        self.connection
            .prepare_cached("DELETE FROM letters WHERE id = ?1")?
            .execute(params![letter_id])?;
        Ok(())
    }

    // ----- transaction log -------------------------------------------

    pub fn add_transaction(
        &mut self,
        character_id: u32,
        action: u32,
        message: &str,
    ) -> StorageResult<()> {
        let now = Utc::now().timestamp();
        self.connection
            .prepare_cached(
                "INSERT INTO transactions (character_id, action, message, time)
                 VALUES (?1, ?2, ?3, ?4)",
            )?
            .execute(params![character_id, action, message, now])?;
        Ok(())
    }

    /// The most recent `num` transactions, in insertion order.
    pub fn get_transactions(&self, num: usize) -> StorageResult<Vec<Transaction>> {
        let mut statement = self.connection.prepare_cached(
            "SELECT id, character_id, action, message, time
             FROM transactions ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = statement.query_map(params![num as i64], row_to_transaction)?;
        let mut transactions = Vec::new();
        for row in rows {
            transactions.push(row?);
        }
        transactions.reverse();
        Ok(transactions)
    }

    /// All transactions logged at or after a unix timestamp.
    pub fn get_transactions_since(&self, since: i64) -> StorageResult<Vec<Transaction>> {
        let mut statement = self.connection.prepare_cached(
            "SELECT id, character_id, action, message, time
             FROM transactions WHERE time >= ?1 ORDER BY id",
        )?;
        let rows = statement.query_map(params![since], row_to_transaction)?;
        let mut transactions = Vec::new();
        for row in rows {
            transactions.push(row?);
        }
        Ok(transactions)
    }

    // ----- floor items -----------------------------------------------

    pub fn add_floor_item(
        &mut self,
        map_id: u16,
        item_id: u16,
        amount: u16,
        x: i32,
        y: i32,
    ) -> StorageResult<u32> {
        self.connection
            .prepare_cached(
                "INSERT INTO floor_items (map_id, item_id, amount, pos_x, pos_y)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?
            .execute(params![map_id, item_id, amount, x, y])?;
        Ok(self.connection.last_insert_rowid() as u32)
    }

    pub fn remove_floor_item(&mut self, id: u32) -> StorageResult<()> {
        self.connection
            .prepare_cached("DELETE FROM floor_items WHERE id = ?1")?
            .execute(params![id])?;
        Ok(())
    }

    pub fn get_floor_items_from_map(&self, map_id: u16) -> StorageResult<Vec<FloorItem>> {
        let mut statement = self.connection.prepare_cached(
            "SELECT id, map_id, item_id, amount, pos_x, pos_y
             FROM floor_items WHERE map_id = ?1 ORDER BY id",
        )?;
        let rows = statement.query_map(params![map_id], |row| {
            Ok(FloorItem {
                id: row.get(0)?,
                map_id: row.get(1)?,
                item_id: row.get(2)?,
                amount: row.get(3)?,
                x: row.get(4)?,
                y: row.get(5)?,
            })
        })?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }

    // ----- guilds ----------------------------------------------------

    pub fn get_guild_list(&self) -> StorageResult<Vec<Guild>> {
        let mut statement = self
            .connection
            .prepare_cached("SELECT id, name FROM guilds ORDER BY id")?;
        let rows = statement.query_map([], |row| {
            Ok(Guild {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })?;
        let mut guilds = Vec::new();
        for row in rows {
            guilds.push(row?);
        }
        Ok(guilds)
    }

    pub fn add_guild(&mut self, name: &str) -> StorageResult<u32> {
        let result = self
            .connection
            .prepare_cached("INSERT INTO guilds (name) VALUES (?1)")?
            .execute(params![name]);
        match result {
            Ok(_) => Ok(self.connection.last_insert_rowid() as u32),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StorageError::NameTaken)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn remove_guild(&mut self, guild_id: u32) -> StorageResult<()> {
        self.connection
            .prepare_cached("DELETE FROM guilds WHERE id = ?1")?
            .execute(params![guild_id])?;
        Ok(())
    }

    pub fn add_guild_member(&mut self, guild_id: u32, character_id: u32) -> StorageResult<()> {
        self.connection
            .prepare_cached(
                "INSERT OR IGNORE INTO guild_members (guild_id, character_id)
                 VALUES (?1, ?2)",
            )?
            .execute(params![guild_id, character_id])?;
        Ok(())
    }

    pub fn remove_guild_member(&mut self, guild_id: u32, character_id: u32) -> StorageResult<()> {
        self.connection
            .prepare_cached(
                "DELETE FROM guild_members WHERE guild_id = ?1 AND character_id = ?2",
            )?
            .execute(params![guild_id, character_id])?;
        Ok(())
    }

    pub fn set_member_rights(
        &mut self,
        guild_id: u32,
        character_id: u32,
        rights: u32,
    ) -> StorageResult<()> {
        self.connection
            .prepare_cached(
                "UPDATE guild_members SET rights = ?3
                 WHERE guild_id = ?1 AND character_id = ?2",
            )?
            .execute(params![guild_id, character_id, rights])?;
        Ok(())
    }

    pub fn guild_members(&self, guild_id: u32) -> StorageResult<Vec<(u32, u32)>> {
        let mut statement = self.connection.prepare_cached(
            "SELECT character_id, rights FROM guild_members WHERE guild_id = ?1",
        )?;
        let rows =
            statement.query_map(params![guild_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut members = Vec::new();
        for row in rows {
            members.push(row?);
        }
        Ok(members)
    }
}

fn row_to_account(row: &rusqlite::Row) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        username: row.get(1)?,
        password_digest: row.get(2)?,
        email: row.get(3)?,
        level: row.get(4)?,
        banned_until: row.get(5)?,
        registration_date: row.get(6)?,
        last_login: row.get(7)?,
    })
}

fn row_to_character(row: &rusqlite::Row) -> rusqlite::Result<StorageResult<CharacterRecord>> {
    let blob: Vec<u8> = row.get(5)?;
    let data = match CharacterData::from_blob(&blob) {
        Ok(data) => data,
        Err(_) => return Ok(Err(StorageError::CorruptBlob)),
    };
    Ok(Ok(CharacterRecord {
        id: row.get(0)?,
        account_id: row.get(1)?,
        name: row.get(2)?,
        slot: row.get(3)?,
        online: row.get::<_, i32>(4)? != 0,
        data,
    }))
}

fn row_to_transaction(row: &rusqlite::Row) -> rusqlite::Result<Transaction> {
    Ok(Transaction {
        id: row.get(0)?,
        character_id: row.get(1)?,
        action: row.get(2)?,
        message: row.get(3)?,
        time: row.get(4)?,
    })
}
