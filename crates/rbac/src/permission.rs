//! Permission: a set of actions on one resource.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use warden_core::{DomainError, DomainResult, Entity, Named, PermissionId};

use crate::names::{normalize_action_name, normalize_name, normalize_resource_name};

/// Whether a permission grants or denies its actions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    #[default]
    Allow,
    Deny,
}

impl Effect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Effect::Allow => "allow",
            Effect::Deny => "deny",
        }
    }

    pub fn parse(raw: &str) -> DomainResult<Self> {
        match raw.trim().to_lowercase().as_str() {
            "allow" => Ok(Effect::Allow),
            "deny" => Ok(Effect::Deny),
            other => Err(DomainError::validation(format!("unknown effect '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub id: PermissionId,
    pub name: String,
    pub description: String,
    /// Normalized `db_<namespace>_<table>` resource name.
    pub resource: String,
    pub effect: Effect,
    /// Sorted, deduplicated, lower-case action names. Never empty.
    pub actions: Vec<String>,
    pub source: String,
    pub valid_start: Option<DateTime<Utc>>,
    pub valid_end: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPermission {
    pub name: String,
    pub description: String,
    pub resource: String,
    pub effect: Effect,
    pub actions: Vec<String>,
    pub source: String,
    pub valid_start: Option<DateTime<Utc>>,
    pub valid_end: Option<DateTime<Utc>>,
}

impl NewPermission {
    pub fn new(
        name: impl Into<String>,
        resource: impl Into<String>,
        actions: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            resource: resource.into(),
            actions: actions.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

/// Partial update; the nested options on the validity window allow clearing it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub resource: Option<String>,
    pub effect: Option<Effect>,
    pub actions: Option<Vec<String>>,
    pub source: Option<String>,
    pub valid_start: Option<Option<DateTime<Utc>>>,
    pub valid_end: Option<Option<DateTime<Utc>>>,
    pub is_active: Option<bool>,
}

fn normalize_actions(raw: &[String]) -> DomainResult<Vec<String>> {
    let mut actions = raw
        .iter()
        .map(|a| normalize_action_name(a))
        .collect::<DomainResult<Vec<_>>>()?;
    actions.sort();
    actions.dedup();
    if actions.is_empty() {
        return Err(DomainError::validation("a permission needs at least one action"));
    }
    Ok(actions)
}

fn check_window(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> DomainResult<()> {
    match (start, end) {
        (Some(s), Some(e)) if e < s => Err(DomainError::validation(
            "valid_end must not precede valid_start",
        )),
        _ => Ok(()),
    }
}

impl Permission {
    pub fn create(input: NewPermission, now: DateTime<Utc>) -> DomainResult<Self> {
        let name = normalize_name("permission name", &input.name)?;
        let resource = normalize_resource_name(&input.resource)?;
        let actions = normalize_actions(&input.actions)?;
        check_window(input.valid_start, input.valid_end)?;

        Ok(Self {
            id: PermissionId::new(),
            name,
            description: input.description,
            resource,
            effect: input.effect,
            actions,
            source: input.source,
            valid_start: input.valid_start,
            valid_end: input.valid_end,
            is_active: true,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn apply(&mut self, patch: PermissionPatch, now: DateTime<Utc>) -> DomainResult<()> {
        let mut next = self.clone();

        if let Some(raw) = patch.name {
            next.name = normalize_name("permission name", &raw)?;
        }
        if let Some(raw) = patch.resource {
            next.resource = normalize_resource_name(&raw)?;
        }
        if let Some(raw) = patch.actions {
            next.actions = normalize_actions(&raw)?;
        }
        if let Some(description) = patch.description {
            next.description = description;
        }
        if let Some(effect) = patch.effect {
            next.effect = effect;
        }
        if let Some(source) = patch.source {
            next.source = source;
        }
        if let Some(start) = patch.valid_start {
            next.valid_start = start;
        }
        if let Some(end) = patch.valid_end {
            next.valid_end = end;
        }
        if let Some(active) = patch.is_active {
            next.is_active = active;
        }
        check_window(next.valid_start, next.valid_end)?;

        next.updated_at = now;
        *self = next;
        Ok(())
    }

    /// Active and inside its validity window (open ends are unbounded).
    pub fn is_effective_at(&self, at: DateTime<Utc>) -> bool {
        self.is_active
            && self.valid_start.is_none_or(|s| s <= at)
            && self.valid_end.is_none_or(|e| at <= e)
    }

    pub fn deactivate(&mut self, now: DateTime<Utc>) {
        self.is_active = false;
        self.updated_at = now;
    }
}

impl Entity for Permission {
    type Id = PermissionId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl Named for Permission {
    fn name(&self) -> &str {
        &self.name
    }
}
