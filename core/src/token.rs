//! Single-use session tokens handed from the account service to a game
//! service by way of the client.

use std::fmt;

use crate::protocol::TOKEN_LENGTH;
use crate::wire::{MessageIn, MessageOut, WireError};

/// An opaque 32-byte credential. Compared byte-for-byte; displayed as a
/// short hex prefix so full tokens never land in logs.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionToken([u8; TOKEN_LENGTH]);

impl SessionToken {
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_LENGTH];
        for b in bytes.iter_mut() {
            *b = rand::random::<u8>();
        }
        SessionToken(bytes)
    }

    pub fn from_bytes(bytes: [u8; TOKEN_LENGTH]) -> Self {
        SessionToken(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; TOKEN_LENGTH] {
        &self.0
    }

    pub fn write(&self, out: &mut MessageOut) {
        out.write_bytes(&self.0);
    }

    pub fn read(msg: &mut MessageIn) -> Result<Self, WireError> {
        let slice = msg.read_bytes(TOKEN_LENGTH)?;
        let mut bytes = [0u8; TOKEN_LENGTH];
        bytes.copy_from_slice(slice);
        Ok(SessionToken(bytes))
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SessionToken({:02x}{:02x}{:02x}{:02x}..)",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_differ() {
        // Collisions in 256 bits would mean a broken rng.
        let a = SessionToken::generate();
        let b = SessionToken::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn token_round_trips_through_a_message() {
        let token = SessionToken::generate();
        let mut out = MessageOut::new(0x0100);
        token.write(&mut out);

        let bytes = out.into_bytes();
        let mut msg = MessageIn::from_bytes(&bytes).unwrap();
        let back = SessionToken::read(&mut msg).unwrap();
        assert_eq!(token, back);
        assert_eq!(msg.unread_len(), 0);
    }

    #[test]
    fn debug_format_reveals_only_a_prefix() {
        let token = SessionToken::from_bytes([0xab; TOKEN_LENGTH]);
        let shown = format!("{:?}", token);
        assert!(shown.contains("abababab"));
        assert!(shown.len() < 30);
    }
}
