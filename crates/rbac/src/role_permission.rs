//! Role/permission link.
//!
//! A link is either present and active or gone; revocation deletes the row.
//! The `(role_id, permission_id)` pair is unique, which the store enforces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use warden_core::{Entity, PermissionId, RoleId, RolePermissionId};

use crate::permission::Permission;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolePermission {
    pub id: RolePermissionId,
    pub role_id: RoleId,
    pub permission_id: PermissionId,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RolePermission {
    pub fn link(role_id: RoleId, permission_id: PermissionId, now: DateTime<Utc>) -> Self {
        Self {
            id: RolePermissionId::new(),
            role_id,
            permission_id,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Entity for RolePermission {
    type Id = RolePermissionId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// A link joined with its permission.
///
/// `permission` is `None` when the permission row is gone or soft-deleted, so
/// callers decide explicitly whether a half-populated link counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolePermissionRecord {
    pub link: RolePermission,
    pub permission: Option<Permission>,
}

impl RolePermissionRecord {
    /// The joined permission, if the link is active and the permission loaded.
    pub fn active_permission(&self) -> Option<&Permission> {
        if !self.link.is_active {
            return None;
        }
        self.permission.as_ref().filter(|p| p.is_active)
    }
}
