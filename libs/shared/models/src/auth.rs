use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Identity used by background jobs acting as the System role.
pub const SYSTEM_ACTOR_ID: Uuid = Uuid::nil();

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Patient,
    Provider,
    System,
}

impl fmt::Display for ActorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorRole::Patient => write!(f, "patient"),
            ActorRole::Provider => write!(f, "provider"),
            ActorRole::System => write!(f, "system"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown actor role: {0}")]
pub struct ParseRoleError(pub String);

impl FromStr for ActorRole {
    type Err = ParseRoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "patient" | "user" => Ok(ActorRole::Patient),
            "provider" | "doctor" => Ok(ActorRole::Provider),
            "system" => Ok(ActorRole::System),
            other => Err(ParseRoleError(other.to_string())),
        }
    }
}

/// A caller whose identity was already resolved by the authentication layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Uuid,
    pub role: ActorRole,
}

impl Actor {
    pub fn new(user_id: Uuid, role: ActorRole) -> Self {
        Self { user_id, role }
    }

    pub fn patient(user_id: Uuid) -> Self {
        Self::new(user_id, ActorRole::Patient)
    }

    pub fn provider(user_id: Uuid) -> Self {
        Self::new(user_id, ActorRole::Provider)
    }

    pub fn system() -> Self {
        Self::new(SYSTEM_ACTOR_ID, ActorRole::System)
    }

    pub fn is_system(&self) -> bool {
        self.role == ActorRole::System && self.user_id == SYSTEM_ACTOR_ID
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.role, self.user_id)
    }
}
