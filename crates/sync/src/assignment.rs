//! Permission-to-role and role-to-user assignment.
//!
//! Relational writes happen first and are the source of truth. Downstream
//! synchronization runs afterwards and never turns a committed write into an
//! error; what it did is returned alongside the result.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, warn};

use warden_core::{RoleId, RolePermissionId};
use warden_infra::{
    PermissionRepository, RbacStore, RepoResult, RepositoryError, RolePermissionRepository,
    RoleRepository, UserRepository, UserRoleRepository,
};
use warden_policy::PolicyEngine;
use warden_rbac::{
    Permission, Role, RolePermission, RolePermissionsView, User, UserRole,
};

use crate::config::SyncSettings;
use crate::error::{ServiceError, ServiceResult};
use crate::pipeline::{ResyncResult, SyncPipeline};
use crate::relationship_sync::ReconciliationReport;
use crate::schema_sync::SchemaSyncOutcome;

/// Successful assignment plus what happened downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentResult {
    pub view: RolePermissionsView,
    pub schema: SchemaSyncOutcome,
    pub report: ReconciliationReport,
}

pub struct AssignmentService<S, P> {
    store: Arc<S>,
    sync: SyncPipeline<S, P>,
}

impl<S, P> AssignmentService<S, P>
where
    S: RbacStore + 'static,
    P: PolicyEngine + 'static,
{
    pub fn new(store: Arc<S>, engine: Arc<P>, settings: SyncSettings) -> Self {
        let sync = SyncPipeline::new(Arc::clone(&store), engine, settings);
        Self { store, sync }
    }

    pub fn with_pipeline(store: Arc<S>, sync: SyncPipeline<S, P>) -> Self {
        Self { store, sync }
    }

    pub fn pipeline(&self) -> &SyncPipeline<S, P> {
        &self.sync
    }

    /// Link `permission_names` to the role named `role_name`.
    ///
    /// All-or-nothing: if any permission is unknown or already linked, no
    /// link is written. Repeated names in one request count once.
    #[instrument(skip(self, permission_names), fields(permissions = permission_names.len()))]
    pub async fn assign_permissions_to_role(
        &self,
        role_name: &str,
        permission_names: &[impl AsRef<str> + Sync],
    ) -> ServiceResult<AssignmentResult> {
        let role_name = required("role name", role_name)?;
        if permission_names.is_empty() {
            return Err(ServiceError::invalid_argument(
                "at least one permission is required",
            ));
        }
        let mut names: Vec<&str> = Vec::with_capacity(permission_names.len());
        for raw in permission_names {
            let name = required("permission name", raw.as_ref())?;
            if !names.contains(&name) {
                names.push(name);
            }
        }

        let role = self.role_by_name(role_name).await?;

        let now = Utc::now();
        let mut links = Vec::with_capacity(names.len());
        for name in &names {
            let permission = self.permission_by_name(name).await?;
            if self
                .store
                .find_active_role_permission(role.id, permission.id)
                .await?
                .is_some()
            {
                return Err(already_assigned(&permission, &role));
            }
            links.push(RolePermission::link(role.id, permission.id, now));
        }

        // The store enforces pair uniqueness atomically; a concurrent
        // identical request loses here even if it passed the check above.
        match self.store.create_role_permissions(links).await {
            Ok(created) => {
                info!(role = %role.name, links = created.len(), "permissions assigned to role")
            }
            Err(RepositoryError::Conflict(msg)) => {
                return Err(ServiceError::already_exists(msg));
            }
            Err(e) => return Err(e.into()),
        }

        let ResyncResult { schema, report } = self.sync.resync_roles(&[role.id]).await;

        let records = self.store.list_role_permissions(role.id).await?;
        let view = RolePermissionsView::build(&role, &records).ok_or_else(|| {
            ServiceError::not_found(format!("no permissions found for role '{}'", role.name))
        })?;

        Ok(AssignmentResult {
            view,
            schema,
            report,
        })
    }

    /// Remove one link and re-synchronize the role's holders.
    #[instrument(skip(self))]
    pub async fn revoke_permission_from_role(
        &self,
        role_name: &str,
        permission_name: &str,
    ) -> ServiceResult<ResyncResult> {
        let role = self.role_by_name(required("role name", role_name)?).await?;
        let permission = self
            .permission_by_name(required("permission name", permission_name)?)
            .await?;

        match self
            .store
            .delete_role_permission_link(role.id, permission.id)
            .await
        {
            Ok(()) => {}
            Err(RepositoryError::NotFound { .. }) => {
                return Err(ServiceError::not_found(format!(
                    "permission '{}' is not assigned to role '{}'",
                    permission.name, role.name
                )));
            }
            Err(e) => return Err(e.into()),
        }
        info!(role = %role.name, permission = %permission.name, "permission revoked from role");

        Ok(self.sync.resync_roles(&[role.id]).await)
    }

    /// Remove every link of a role. Does not touch the policy engine; call
    /// [`resync_role`](Self::resync_role) afterwards.
    #[instrument(skip(self))]
    pub async fn delete_role_permission_by_role_id(&self, role_id: RoleId) -> ServiceResult<u64> {
        self.store.get_role(role_id).await?;
        let removed = self.store.delete_role_permissions_by_role(role_id).await?;
        warn!(%role_id, removed, "role links removed without policy engine resync");
        Ok(removed)
    }

    /// Remove one link by id and return it. Does not touch the policy engine.
    #[instrument(skip(self))]
    pub async fn delete_role_permission_by_id(
        &self,
        link_id: RolePermissionId,
    ) -> ServiceResult<RolePermission> {
        let link = self.store.get_role_permission(link_id).await?;
        self.store.delete_role_permission(link_id).await?;
        warn!(%link_id, role_id = %link.role_id, "role link removed without policy engine resync");
        Ok(link)
    }

    /// Push the schema and rebuild every holder of `role_id`.
    #[instrument(skip(self))]
    pub async fn resync_role(&self, role_id: RoleId) -> ServiceResult<ResyncResult> {
        self.store.get_role(role_id).await?;
        Ok(self.sync.resync_roles(&[role_id]).await)
    }

    /// The role with its active permissions.
    pub async fn get_role_permissions(&self, role_id: RoleId) -> ServiceResult<RolePermissionsView> {
        let role = self.store.get_role(role_id).await?;
        let records = self.store.list_role_permissions(role_id).await?;
        RolePermissionsView::build(&role, &records).ok_or_else(|| {
            ServiceError::not_found(format!("no permissions found for role '{}'", role.name))
        })
    }

    /// Give `username` the role `role_name` and rebuild that user's tuples.
    #[instrument(skip(self))]
    pub async fn assign_role_to_user(
        &self,
        username: &str,
        role_name: &str,
    ) -> ServiceResult<ReconciliationReport> {
        let user = self.user_by_name(required("username", username)?).await?;
        let role = self.role_by_name(required("role name", role_name)?).await?;

        match self
            .store
            .create_user_role(UserRole::link(user.id, role.id, Utc::now()))
            .await
        {
            Ok(_) => info!(user = %user.username, role = %role.name, "role assigned to user"),
            Err(RepositoryError::Conflict(_)) => {
                return Err(ServiceError::already_exists(format!(
                    "user '{}' already holds role '{}'",
                    user.username, role.name
                )));
            }
            Err(e) => return Err(e.into()),
        }

        Ok(self.sync.resync_user_tuples(&user).await)
    }

    /// Take the role away from `username` and rebuild that user's tuples.
    #[instrument(skip(self))]
    pub async fn revoke_role_from_user(
        &self,
        username: &str,
        role_name: &str,
    ) -> ServiceResult<ReconciliationReport> {
        let user = self.user_by_name(required("username", username)?).await?;
        let role = self.role_by_name(required("role name", role_name)?).await?;

        match self.store.delete_user_role(user.id, role.id).await {
            Ok(()) => info!(user = %user.username, role = %role.name, "role revoked from user"),
            Err(RepositoryError::NotFound { .. }) => {
                return Err(ServiceError::not_found(format!(
                    "user '{}' does not hold role '{}'",
                    user.username, role.name
                )));
            }
            Err(e) => return Err(e.into()),
        }

        Ok(self.sync.resync_user_tuples(&user).await)
    }

    /// Push the schema and rebuild every user's tuples from scratch.
    #[instrument(skip(self))]
    pub async fn full_resync(&self) -> ServiceResult<ResyncResult> {
        self.sync.full_resync().await
    }

    async fn role_by_name(&self, name: &str) -> ServiceResult<Role> {
        named("role", name, self.store.get_role_by_name(name).await)
    }

    async fn permission_by_name(&self, name: &str) -> ServiceResult<Permission> {
        named("permission", name, self.store.get_permission_by_name(name).await)
    }

    async fn user_by_name(&self, name: &str) -> ServiceResult<User> {
        named("user", name, self.store.get_user_by_username(name).await)
    }
}

/// Trimmed `value`, or `InvalidArgument` when blank.
pub(crate) fn required<'a>(field: &str, value: &'a str) -> ServiceResult<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ServiceError::invalid_argument(format!("{field} is required")));
    }
    Ok(trimmed)
}

/// Name lookups report the name rather than the storage key.
pub(crate) fn named<T>(entity: &str, name: &str, found: RepoResult<T>) -> ServiceResult<T> {
    found.map_err(|e| match e {
        RepositoryError::NotFound { .. } => {
            ServiceError::not_found(format!("{entity} '{name}' not found"))
        }
        other => other.into(),
    })
}

fn already_assigned(permission: &Permission, role: &Role) -> ServiceError {
    ServiceError::already_exists(format!(
        "permission '{}' is already assigned to role '{}'",
        permission.name, role.name
    ))
}
