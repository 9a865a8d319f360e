//! Correlation tokens.
//!
//! A token is 16 random bytes, url-safe base64 encoded, and opaque by
//! construction. The payload it correlates to (which group/user/option) lives
//! only server-side, keyed by the token in the ephemeral cache, so a client
//! reading the token learns nothing about the answer.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;
use serde::{Deserialize, Serialize};

use gatehouse_common::{GroupId, UserId, WardenError};

/// Generate a cryptographically random correlation token.
pub(crate) fn mint() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Typed command a correlation token resolves to. Dispatch sites match
/// exhaustively; adding a variant is a compile error everywhere it matters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub(crate) enum TokenCommand {
    Answer {
        group_id: GroupId,
        user_id: UserId,
        value: String,
    },
}

impl TokenCommand {
    pub(crate) fn encode(&self) -> Result<String, WardenError> {
        serde_json::to_string(self).map_err(|e| WardenError::Internal(e.to_string()))
    }

    pub(crate) fn decode(raw: &str) -> Result<Self, WardenError> {
        serde_json::from_str(raw).map_err(|e| WardenError::InvalidToken(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_unique_and_opaque() {
        let a = mint();
        let b = mint();
        assert_ne!(a, b);
        // 16 bytes, unpadded url-safe base64.
        assert_eq!(a.len(), 22);
        assert!(!a.contains('='));
    }

    #[test]
    fn commands_round_trip() {
        let command = TokenCommand::Answer {
            group_id: GroupId(-100),
            user_id: UserId(42),
            value: "17".to_string(),
        };
        let raw = command.encode().unwrap();
        assert_eq!(TokenCommand::decode(&raw).unwrap(), command);
    }

    #[test]
    fn garbage_does_not_decode() {
        assert!(matches!(
            TokenCommand::decode("definitely not json"),
            Err(WardenError::InvalidToken(_))
        ));
    }
}
