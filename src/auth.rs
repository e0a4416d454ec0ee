//! One-time launch tokens.
//!
//! The launcher hands every worker a fresh token through its environment.
//! A worker without a well-formed token was not started by a supervisor and
//! refuses to run; the supervisor only starts monitoring for a connection
//! whose `ready` carries the token of a worker it launched and has not yet
//! seen connect.

use std::fmt;

use thiserror::Error;
use uuid::Uuid;

/// Environment variable carrying the launch token.
pub const TOKEN_ENV: &str = "NETMOND_LAUNCH_TOKEN";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LaunchToken(Uuid);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("no launch token in the environment")]
    Missing,
    #[error("malformed launch token")]
    Malformed,
}

impl LaunchToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(raw: &str) -> Result<Self, TokenError> {
        Uuid::parse_str(raw.trim())
            .map(Self)
            .map_err(|_| TokenError::Malformed)
    }

    /// Read the token the launcher left for this process.
    pub fn from_env() -> Result<Self, TokenError> {
        match std::env::var(TOKEN_ENV) {
            Ok(raw) => Self::parse(&raw),
            Err(std::env::VarError::NotPresent) => Err(TokenError::Missing),
            Err(std::env::VarError::NotUnicode(_)) => Err(TokenError::Malformed),
        }
    }

    pub fn matches(&self, presented: &str) -> bool {
        Self::parse(presented).is_ok_and(|t| t == *self)
    }
}

impl fmt::Display for LaunchToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
