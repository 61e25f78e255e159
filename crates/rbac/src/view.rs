//! Role-with-permissions view returned by assignment operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use warden_core::{PermissionId, RoleId, RolePermissionId};

use crate::permission::Permission;
use crate::role::Role;
use crate::role_permission::RolePermissionRecord;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSummary {
    pub id: RoleId,
    pub name: String,
    pub description: String,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionView {
    pub id: PermissionId,
    pub name: String,
    pub description: String,
    pub actions: Vec<String>,
    pub resource: String,
    pub source: String,
    pub valid_start: Option<DateTime<Utc>>,
    pub valid_end: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl From<&Permission> for PermissionView {
    fn from(p: &Permission) -> Self {
        Self {
            id: p.id,
            name: p.name.clone(),
            description: p.description.clone(),
            actions: p.actions.clone(),
            resource: p.resource.clone(),
            source: p.source.clone(),
            valid_start: p.valid_start,
            valid_end: p.valid_end,
            is_active: p.is_active,
        }
    }
}

/// A role and every active permission linked to it.
///
/// `id`, `created_at` and `updated_at` come from the oldest link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolePermissionsView {
    pub id: RolePermissionId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub role: RoleSummary,
    pub permissions: Vec<PermissionView>,
    pub is_active: bool,
}

impl RolePermissionsView {
    /// Build the view from joined link records.
    ///
    /// Links without a loaded, active permission are skipped. Returns `None`
    /// when nothing is left.
    pub fn build(role: &Role, records: &[RolePermissionRecord]) -> Option<Self> {
        let mut populated: Vec<_> = records
            .iter()
            .filter_map(|r| r.active_permission().map(|p| (&r.link, p)))
            .collect();
        populated.sort_by(|(a, _), (b, _)| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let (first, _) = populated.first()?;
        Some(Self {
            id: first.id,
            created_at: first.created_at,
            updated_at: first.updated_at,
            role: RoleSummary {
                id: role.id,
                name: role.name.clone(),
                description: role.description.clone(),
                source: role.source.clone(),
            },
            permissions: populated.iter().map(|(_, p)| PermissionView::from(*p)).collect(),
            is_active: role.is_active,
        })
    }

    pub fn permission_names(&self) -> Vec<&str> {
        self.permissions.iter().map(|p| p.name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::NewPermission;
    use crate::role::NewRole;
    use crate::role_permission::RolePermission;

    fn record(role: &Role, name: &str, loaded: bool, minute: i64) -> RolePermissionRecord {
        let at = Utc::now() + chrono::Duration::minutes(minute);
        let p = Permission::create(NewPermission::new(name, "db_farm_crops", ["read"]), at).unwrap();
        RolePermissionRecord {
            link: RolePermission::link(role.id, p.id, at),
            permission: loaded.then_some(p),
        }
    }

    #[test]
    fn view_skips_unpopulated_links() {
        let role = Role::create(NewRole::named("agronomist"), Utc::now()).unwrap();
        let records = vec![
            record(&role, "read_crop_data", true, 0),
            record(&role, "ghost", false, 1),
            record(&role, "write_crop_data", true, 2),
        ];
        let view = RolePermissionsView::build(&role, &records).unwrap();
        assert_eq!(view.permission_names(), vec!["read_crop_data", "write_crop_data"]);
        assert_eq!(view.id, records[0].link.id);
        assert_eq!(view.role.name, "agronomist");
    }

    #[test]
    fn view_is_none_without_permissions() {
        let role = Role::create(NewRole::named("empty"), Utc::now()).unwrap();
        assert!(RolePermissionsView::build(&role, &[]).is_none());
        assert!(RolePermissionsView::build(&role, &[record(&role, "ghost", false, 0)]).is_none());
    }
}
