//! Action: a verb a permission can grant, grouped by category.
//!
//! Static actions are built in and must survive for the lifetime of the
//! deployment: they can be described differently but never deleted or
//! deactivated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use warden_core::{ActionId, DomainError, DomainResult, Entity, Named};

use crate::names::normalize_action_name;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionCategory {
    Crud,
    UserManagement,
    RoleManagement,
    PermissionManagement,
    System,
    Audit,
    Api,
    Database,
    #[default]
    General,
}

impl ActionCategory {
    pub const ALL: [ActionCategory; 9] = [
        ActionCategory::Crud,
        ActionCategory::UserManagement,
        ActionCategory::RoleManagement,
        ActionCategory::PermissionManagement,
        ActionCategory::System,
        ActionCategory::Audit,
        ActionCategory::Api,
        ActionCategory::Database,
        ActionCategory::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionCategory::Crud => "crud",
            ActionCategory::UserManagement => "user_management",
            ActionCategory::RoleManagement => "role_management",
            ActionCategory::PermissionManagement => "permission_management",
            ActionCategory::System => "system",
            ActionCategory::Audit => "audit",
            ActionCategory::Api => "api",
            ActionCategory::Database => "database",
            ActionCategory::General => "general",
        }
    }

    pub fn parse(raw: &str) -> DomainResult<Self> {
        let wanted = raw.trim().to_lowercase().replace(['-', ' '], "_");
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == wanted)
            .ok_or_else(|| DomainError::validation(format!("unknown action category '{raw}'")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub id: ActionId,
    pub name: String,
    pub description: String,
    pub category: ActionCategory,
    pub is_static: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAction {
    pub name: String,
    pub description: String,
    pub category: ActionCategory,
    pub is_static: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub category: Option<ActionCategory>,
    pub is_active: Option<bool>,
}

impl Action {
    pub fn create(input: NewAction, now: DateTime<Utc>) -> DomainResult<Self> {
        Ok(Self {
            id: ActionId::new(),
            name: normalize_action_name(&input.name)?,
            description: input.description,
            category: input.category,
            is_static: input.is_static,
            is_active: true,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn apply(&mut self, patch: ActionPatch, now: DateTime<Utc>) -> DomainResult<()> {
        if patch.is_active == Some(false) {
            self.ensure_mutable("deactivated")?;
        }
        let name = match patch.name {
            Some(raw) => {
                let name = normalize_action_name(&raw)?;
                if self.is_static && name != self.name {
                    return Err(DomainError::invariant(format!(
                        "static action '{}' cannot be renamed",
                        self.name
                    )));
                }
                Some(name)
            }
            None => None,
        };

        if let Some(name) = name {
            self.name = name;
        }
        if let Some(description) = patch.description {
            self.description = description;
        }
        if let Some(category) = patch.category {
            self.category = category;
        }
        if let Some(active) = patch.is_active {
            self.is_active = active;
        }
        self.updated_at = now;
        Ok(())
    }

    /// Guard for delete paths.
    pub fn ensure_deletable(&self) -> DomainResult<()> {
        self.ensure_mutable("deleted")
    }

    fn ensure_mutable(&self, verb: &str) -> DomainResult<()> {
        if self.is_static {
            return Err(DomainError::invariant(format!(
                "static action '{}' cannot be {verb}",
                self.name
            )));
        }
        Ok(())
    }
}

impl Entity for Action {
    type Id = ActionId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl Named for Action {
    fn name(&self) -> &str {
        &self.name
    }
}
