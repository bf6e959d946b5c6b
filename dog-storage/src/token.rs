//! Capability tokens sequencing operations on a streaming handle.
//!
//! A handle mints exactly one token per successful operation. The next
//! operation must present that token, which is consumed on the spot. Tokens
//! are move-only values identified by the issuing handle and a sequence number.

use parking_lot::Mutex;
use uuid::Uuid;

use crate::{StorageError, StorageResult};

/// Single-use capability authorizing the next operation on one handle
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Token {
    handle: Uuid,
    sequence: u64,
}

impl Token {
    /// `false` for default-constructed tokens
    pub fn valid(&self) -> bool {
        !self.handle.is_nil()
    }
}

#[derive(Debug, Default)]
struct GateState {
    outstanding: Option<u64>,
    next_sequence: u64,
    closed: bool,
}

/// Issues and redeems the tokens of one handle
#[derive(Debug)]
pub struct TokenGate {
    handle: Uuid,
    state: Mutex<GateState>,
}

impl TokenGate {
    pub fn new() -> Self {
        Self {
            handle: Uuid::new_v4(),
            state: Mutex::new(GateState::default()),
        }
    }

    /// Mint the next token, invalidating any unredeemed one
    pub fn issue(&self) -> Token {
        let mut state = self.state.lock();
        state.next_sequence += 1;
        state.outstanding = Some(state.next_sequence);
        Token {
            handle: self.handle,
            sequence: state.next_sequence,
        }
    }

    /// Consume `token`; it is never valid again afterwards
    pub fn redeem(&self, token: Token) -> StorageResult<()> {
        if !token.valid() {
            return Err(StorageError::invalid_token("default-constructed token"));
        }
        if token.handle != self.handle {
            return Err(StorageError::invalid_token("token was issued by another handle"));
        }
        let mut state = self.state.lock();
        if state.closed {
            return Err(StorageError::cancelled("handle is closed"));
        }
        if state.outstanding != Some(token.sequence) {
            return Err(StorageError::invalid_token("token was already used"));
        }
        state.outstanding = None;
        Ok(())
    }

    /// Mark the handle terminal; outstanding tokens become useless
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.outstanding = None;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl Default for TokenGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StatusCode;

    #[test]
    fn test_token_round_trip() {
        let gate = TokenGate::new();
        let token = gate.issue();
        assert!(token.valid());
        assert!(gate.redeem(token).is_ok());
    }

    #[test]
    fn test_default_token_rejected() {
        let gate = TokenGate::new();
        let _live = gate.issue();
        let err = gate.redeem(Token::default()).unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);
    }

    #[test]
    fn test_foreign_token_rejected() {
        let ours = TokenGate::new();
        let theirs = TokenGate::new();
        let _live = ours.issue();
        let foreign = theirs.issue();
        let err = ours.redeem(foreign).unwrap_err();
        assert!(matches!(err, StorageError::InvalidToken { .. }));
    }

    #[test]
    fn test_superseded_token_rejected() {
        let gate = TokenGate::new();
        let first = gate.issue();
        let second = gate.issue();
        assert!(matches!(gate.redeem(first), Err(StorageError::InvalidToken { .. })));
        assert!(gate.redeem(second).is_ok());
    }

    #[test]
    fn test_closed_handle_cancels() {
        let gate = TokenGate::new();
        let token = gate.issue();
        gate.close();
        let err = gate.redeem(token).unwrap_err();
        assert_eq!(err.code(), StatusCode::Cancelled);
    }
}
