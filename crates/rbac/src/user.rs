//! User as seen by the authorization layer: an id and the username the
//! policy engine uses as subject id. Credentials live elsewhere.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use warden_core::{DomainResult, Entity, Named, UserId};

use crate::names::normalize_name;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPatch {
    pub username: Option<String>,
    pub is_active: Option<bool>,
}

impl User {
    pub fn create(username: &str, now: DateTime<Utc>) -> DomainResult<Self> {
        Ok(Self {
            id: UserId::new(),
            username: normalize_name("username", username)?,
            is_active: true,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn apply(&mut self, patch: UserPatch, now: DateTime<Utc>) -> DomainResult<()> {
        if let Some(raw) = patch.username {
            self.username = normalize_name("username", &raw)?;
        }
        if let Some(active) = patch.is_active {
            self.is_active = active;
        }
        self.updated_at = now;
        Ok(())
    }
}

impl Entity for User {
    type Id = UserId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl Named for User {
    fn name(&self) -> &str {
        &self.username
    }
}
