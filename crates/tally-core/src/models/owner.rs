//! Owner identity and operating mode

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Error;

/// Identifier of the guest or authenticated identity that owns a set of
/// transaction records
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::InvalidInput("owner id must not be empty".into()));
        }
        Ok(Self(id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for OwnerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the data layer behaves for an owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerMode {
    /// Anonymous, local-only; the remote store is never touched
    Guest,
    /// Server-backed; local-first with best-effort remote mirroring
    Authenticated,
}

impl OwnerMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Guest => "guest",
            Self::Authenticated => "authenticated",
        }
    }
}

impl std::str::FromStr for OwnerMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "guest" => Ok(Self::Guest),
            "authenticated" => Ok(Self::Authenticated),
            other => Err(Error::InvalidInput(format!("unknown owner mode: {other}"))),
        }
    }
}

/// A persisted owner identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub id: OwnerId,
    pub mode: OwnerMode,
    /// Creation timestamp (unix ms)
    pub created_at: i64,
}

/// Explicit per-call context: which owner, operating in which mode.
///
/// Passed into the router, sync engine, and merge service instead of being
/// read from global state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerContext {
    pub owner_id: OwnerId,
    pub mode: OwnerMode,
}

impl OwnerContext {
    #[must_use]
    pub const fn new(owner_id: OwnerId, mode: OwnerMode) -> Self {
        Self { owner_id, mode }
    }

    #[must_use]
    pub const fn guest(owner_id: OwnerId) -> Self {
        Self::new(owner_id, OwnerMode::Guest)
    }

    #[must_use]
    pub const fn authenticated(owner_id: OwnerId) -> Self {
        Self::new(owner_id, OwnerMode::Authenticated)
    }

    /// True when writes should be mirrored to the remote store
    #[must_use]
    pub fn is_hybrid(&self) -> bool {
        self.mode == OwnerMode::Authenticated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_id_rejects_blank() {
        assert!(OwnerId::new("  ").is_err());
        assert!(OwnerId::new("alice").is_ok());
    }

    #[test]
    fn test_mode_round_trips() {
        for mode in [OwnerMode::Guest, OwnerMode::Authenticated] {
            assert_eq!(mode.as_str().parse::<OwnerMode>().unwrap(), mode);
        }
    }

    #[test]
    fn test_context_modes() {
        let guest = OwnerContext::guest(OwnerId::from("g"));
        assert!(!guest.is_hybrid());
        let authed = OwnerContext::authenticated(OwnerId::from("alice"));
        assert!(authed.is_hybrid());
    }
}
