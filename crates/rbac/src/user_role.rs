//! User/role link. Drives which users are re-synchronized when a role changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use warden_core::{Entity, RoleId, UserId, UserRoleId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRole {
    pub id: UserRoleId,
    pub user_id: UserId,
    pub role_id: RoleId,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserRole {
    pub fn link(user_id: UserId, role_id: RoleId, now: DateTime<Utc>) -> Self {
        Self {
            id: UserRoleId::new(),
            user_id,
            role_id,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Entity for UserRole {
    type Id = UserRoleId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
