//! Session token registry.
//!
//! A token is single-use and lives at most [`TOKEN_TTL`]. While one is
//! outstanding the character is exclusively locked: a second login or
//! select attempt fails. During migration, the revert record captured at
//! `PLAYER_SYNC` is held here; if the target shard never confirms the
//! reconnect, the character falls back to that record and is marked
//! logged out.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use evermire_core::character_data::CharacterData;
use evermire_core::token::SessionToken;

pub const TOKEN_TTL: Duration = Duration::from_secs(60);

struct Outstanding {
    token: SessionToken,
    issued: Instant,
    /// Record to fall back to when the handoff times out.
    revert: Option<CharacterData>,
}

/// A character whose token expired before the reconnect confirmation.
pub struct ExpiredHandoff {
    pub character_id: u32,
    pub revert: Option<CharacterData>,
}

#[derive(Default)]
pub struct TokenRegistry {
    outstanding: HashMap<u32, Outstanding>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        TokenRegistry::default()
    }

    /// Whether a token is outstanding for this character (the exclusive
    /// lock of the handoff protocol).
    pub fn is_locked(&self, character_id: u32) -> bool {
        self.outstanding.contains_key(&character_id)
    }

    /// Issue a fresh token for a character. Fails while one is already
    /// outstanding.
    pub fn issue(&mut self, character_id: u32) -> Option<SessionToken> {
        if self.is_locked(character_id) {
            return None;
        }
        let token = SessionToken::generate();
        self.outstanding.insert(
            character_id,
            Outstanding {
                token,
                issued: Instant::now(),
                revert: None,
            },
        );
        Some(token)
    }

    /// Keep the record the character reverts to when the handoff dies.
    pub fn store_revert(&mut self, character_id: u32, data: CharacterData) {
        if let Some(outstanding) = self.outstanding.get_mut(&character_id) {
            outstanding.revert = Some(data);
        }
    }

    /// Consume a token on successful reconnect. Returns false for an
    /// unknown, stale or mismatching token; the token is burned either
    /// way.
    pub fn confirm(&mut self, character_id: u32, token: &SessionToken) -> bool {
        match self.outstanding.remove(&character_id) {
            Some(outstanding) => {
                outstanding.token == *token && outstanding.issued.elapsed() < TOKEN_TTL
            }
            None => false,
        }
    }

    /// Drop a character's token without confirming (logout, deletion).
    pub fn release(&mut self, character_id: u32) {
        self.outstanding.remove(&character_id);
    }

    /// The token currently outstanding for a character, if any.
    pub fn outstanding_token(&self, character_id: u32) -> Option<SessionToken> {
        self.outstanding.get(&character_id).map(|o| o.token)
    }

    #[cfg(test)]
    pub fn force_expire_for_test(&mut self, character_id: u32) {
        self.backdate(character_id, TOKEN_TTL + Duration::from_secs(1));
    }

    /// Collect handoffs whose TTL ran out.
    pub fn sweep_expired(&mut self) -> Vec<ExpiredHandoff> {
        let expired: Vec<u32> = self
            .outstanding
            .iter()
            .filter(|(_, o)| o.issued.elapsed() >= TOKEN_TTL)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|character_id| {
                self.outstanding.remove(&character_id).map(|o| ExpiredHandoff {
                    character_id,
                    revert: o.revert,
                })
            })
            .collect()
    }

    #[cfg(test)]
    fn backdate(&mut self, character_id: u32, by: Duration) {
        if let Some(outstanding) = self.outstanding.get_mut(&character_id) {
            outstanding.issued = Instant::now() - by;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_token_locks_the_character_until_confirmed() {
        let mut registry = TokenRegistry::new();
        let token = registry.issue(7).expect("first issue succeeds");
        assert!(registry.is_locked(7));
        assert!(registry.issue(7).is_none(), "second issue is refused");

        assert!(registry.confirm(7, &token));
        assert!(!registry.is_locked(7));
        // A confirmed token cannot be replayed.
        assert!(!registry.confirm(7, &token));
    }

    #[test]
    fn a_wrong_token_burns_the_outstanding_one() {
        let mut registry = TokenRegistry::new();
        registry.issue(7).unwrap();
        let forged = SessionToken::generate();
        assert!(!registry.confirm(7, &forged));
        assert!(!registry.is_locked(7));
    }

    #[test]
    fn expiry_returns_the_revert_record() {
        let mut registry = TokenRegistry::new();
        registry.issue(7).unwrap();
        let revert = CharacterData {
            level: 9,
            ..CharacterData::default()
        };
        registry.store_revert(7, revert);
        registry.backdate(7, TOKEN_TTL + Duration::from_secs(1));

        let expired = registry.sweep_expired();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].character_id, 7);
        assert_eq!(expired[0].revert.as_ref().unwrap().level, 9);
        assert!(!registry.is_locked(7));
    }

    #[test]
    fn fresh_tokens_survive_the_sweep() {
        let mut registry = TokenRegistry::new();
        registry.issue(7).unwrap();
        assert!(registry.sweep_expired().is_empty());
        assert!(registry.is_locked(7));
    }

    #[test]
    fn release_discards_without_confirmation() {
        let mut registry = TokenRegistry::new();
        let token = registry.issue(7).unwrap();
        registry.release(7);
        assert!(!registry.confirm(7, &token));
        assert!(registry.issue(7).is_some());
    }
}
