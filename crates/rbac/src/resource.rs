//! Resource: a protected object family named `db_<namespace>_<table>`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use warden_core::{DomainError, DomainResult, Entity, Named, ResourceId};

use crate::names::normalize_resource_name;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub name: String,
    pub description: String,
    pub resource_type: Option<String>,
    pub parent_id: Option<ResourceId>,
    pub owner: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewResource {
    pub name: String,
    pub description: String,
    pub resource_type: Option<String>,
    pub parent_id: Option<ResourceId>,
    pub owner: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub resource_type: Option<Option<String>>,
    pub parent_id: Option<Option<ResourceId>>,
    pub owner: Option<Option<String>>,
    pub is_active: Option<bool>,
}

impl Resource {
    pub fn create(input: NewResource, now: DateTime<Utc>) -> DomainResult<Self> {
        Ok(Self {
            id: ResourceId::new(),
            name: normalize_resource_name(&input.name)?,
            description: input.description,
            resource_type: input.resource_type,
            parent_id: input.parent_id,
            owner: input.owner,
            is_active: true,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn apply(&mut self, patch: ResourcePatch, now: DateTime<Utc>) -> DomainResult<()> {
        let name = match patch.name {
            Some(raw) => Some(normalize_resource_name(&raw)?),
            None => None,
        };
        if let Some(Some(parent)) = patch.parent_id {
            if parent == self.id {
                return Err(DomainError::invariant("a resource cannot be its own parent"));
            }
        }

        if let Some(name) = name {
            self.name = name;
        }
        if let Some(description) = patch.description {
            self.description = description;
        }
        if let Some(resource_type) = patch.resource_type {
            self.resource_type = resource_type;
        }
        if let Some(parent_id) = patch.parent_id {
            self.parent_id = parent_id;
        }
        if let Some(owner) = patch.owner {
            self.owner = owner;
        }
        if let Some(active) = patch.is_active {
            self.is_active = active;
        }
        self.updated_at = now;
        Ok(())
    }
}

impl Entity for Resource {
    type Id = ResourceId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl Named for Resource {
    fn name(&self) -> &str {
        &self.name
    }
}
