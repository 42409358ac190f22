//! Security identifier.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Instrument identifier: a code traded on a board (`"AAPL@NASDAQ"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SecurityId {
    pub code: String,
    pub board: String,
}

impl SecurityId {
    pub fn new(code: impl Into<String>, board: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            board: board.into(),
        }
    }
}

impl fmt::Display for SecurityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.code, self.board)
    }
}

impl FromStr for SecurityId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (code, board) = s
            .split_once('@')
            .ok_or_else(|| CoreError::InvalidSecurityId(s.to_string()))?;
        let (code, board) = (code.trim(), board.trim());
        if code.is_empty() || board.is_empty() {
            return Err(CoreError::InvalidSecurityId(s.to_string()));
        }
        Ok(Self::new(code, board))
    }
}
