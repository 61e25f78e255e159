//! Role: a named bundle of permissions, optionally nested under a parent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use warden_core::{DomainError, DomainResult, Entity, Named, RoleId};

use crate::names::normalize_name;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub name: String,
    pub description: String,
    pub source: String,
    pub parent_id: Option<RoleId>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRole {
    pub name: String,
    pub description: String,
    pub source: String,
    pub parent_id: Option<RoleId>,
}

impl NewRole {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Partial update. `None` leaves a field untouched; `parent_id: Some(None)`
/// detaches the role from its parent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolePatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub source: Option<String>,
    pub parent_id: Option<Option<RoleId>>,
    pub is_active: Option<bool>,
}

impl Role {
    pub fn create(input: NewRole, now: DateTime<Utc>) -> DomainResult<Self> {
        Self::create_with_id(RoleId::new(), input, now)
    }

    pub fn create_with_id(id: RoleId, input: NewRole, now: DateTime<Utc>) -> DomainResult<Self> {
        let name = normalize_name("role name", &input.name)?;
        if input.parent_id == Some(id) {
            return Err(DomainError::invariant("a role cannot be its own parent"));
        }
        Ok(Self {
            id,
            name,
            description: input.description,
            source: input.source,
            parent_id: input.parent_id,
            is_active: true,
            created_at: now,
            updated_at: now,
        })
    }

    /// Apply a patch, validating the result before touching `self`.
    pub fn apply(&mut self, patch: RolePatch, now: DateTime<Utc>) -> DomainResult<()> {
        let name = match patch.name {
            Some(raw) => Some(normalize_name("role name", &raw)?),
            None => None,
        };
        if let Some(Some(parent)) = patch.parent_id {
            if parent == self.id {
                return Err(DomainError::invariant("a role cannot be its own parent"));
            }
        }

        if let Some(name) = name {
            self.name = name;
        }
        if let Some(description) = patch.description {
            self.description = description;
        }
        if let Some(source) = patch.source {
            self.source = source;
        }
        if let Some(parent_id) = patch.parent_id {
            self.parent_id = parent_id;
        }
        if let Some(active) = patch.is_active {
            self.is_active = active;
        }
        self.updated_at = now;
        Ok(())
    }

    pub fn deactivate(&mut self, now: DateTime<Utc>) {
        self.is_active = false;
        self.updated_at = now;
    }
}

impl Entity for Role {
    type Id = RoleId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl Named for Role {
    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_trims_name() {
        let role = Role::create(NewRole::named("  agronomist "), Utc::now()).unwrap();
        assert_eq!(role.name, "agronomist");
        assert!(role.is_active);
    }

    #[test]
    fn empty_name_is_rejected() {
        let err = Role::create(NewRole::named("   "), Utc::now()).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn role_cannot_parent_itself() {
        let id = RoleId::new();
        let input = NewRole {
            parent_id: Some(id),
            ..NewRole::named("loop")
        };
        assert!(Role::create_with_id(id, input, Utc::now()).is_err());

        let mut role = Role::create_with_id(id, NewRole::named("loop"), Utc::now()).unwrap();
        let patch = RolePatch {
            parent_id: Some(Some(id)),
            ..RolePatch::default()
        };
        assert!(role.apply(patch, Utc::now()).is_err());
        assert_eq!(role.parent_id, None);
    }

    #[test]
    fn failed_patch_leaves_role_untouched() {
        let mut role = Role::create(NewRole::named("viewer"), Utc::now()).unwrap();
        let before = role.clone();
        let patch = RolePatch {
            name: Some(" ".into()),
            description: Some("changed".into()),
            ..RolePatch::default()
        };
        assert!(role.apply(patch, Utc::now()).is_err());
        assert_eq!(role, before);
    }

    #[test]
    fn patch_can_detach_parent() {
        let parent = RoleId::new();
        let mut role = Role::create(
            NewRole {
                parent_id: Some(parent),
                ..NewRole::named("child")
            },
            Utc::now(),
        )
        .unwrap();
        let patch = RolePatch {
            parent_id: Some(None),
            ..RolePatch::default()
        };
        role.apply(patch, Utc::now()).unwrap();
        assert_eq!(role.parent_id, None);
    }
}
