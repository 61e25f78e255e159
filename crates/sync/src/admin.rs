//! Administrative CRUD over the RBAC graph.
//!
//! Every mutation writes the relational store first, then pushes the schema
//! and, where grants of existing users change, reconciles those users.
//! Deleting a parent removes its links explicitly before the parent itself.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument};

use warden_core::{ActionId, ListFilter, Pagination, PermissionId, ResourceId, RoleId, UserId};
use warden_infra::{
    ActionRepository, PermissionRepository, RbacStore, ResourceRepository,
    RolePermissionRepository, RoleRepository, UserRepository, UserRoleRepository,
};
use warden_policy::{ObjectRef, PolicyEngine, resource_identifier};
use warden_rbac::names::policy_identifier;
use warden_rbac::{
    Action, ActionPatch, NewAction, NewPermission, NewResource, NewRole, Permission,
    PermissionPatch, Resource, ResourcePatch, Role, RolePatch, User,
};

use crate::assignment::{named, required};
use crate::config::SyncSettings;
use crate::deadline::with_deadline;
use crate::error::{ServiceError, ServiceResult};
use crate::pipeline::{ResyncResult, SyncPipeline};
use crate::relationship_sync::ReconciliationReport;
use crate::response::Page;

/// A mutated entity and the synchronization it triggered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Synced<T> {
    pub value: T,
    pub sync: ResyncResult,
}

pub struct RbacAdminService<S, P> {
    store: Arc<S>,
    engine: Arc<P>,
    sync: SyncPipeline<S, P>,
}

impl<S, P> RbacAdminService<S, P>
where
    S: RbacStore + 'static,
    P: PolicyEngine + 'static,
{
    pub fn new(store: Arc<S>, engine: Arc<P>, settings: SyncSettings) -> Self {
        let sync = SyncPipeline::new(Arc::clone(&store), Arc::clone(&engine), settings);
        Self { store, engine, sync }
    }

    pub fn with_pipeline(store: Arc<S>, engine: Arc<P>, sync: SyncPipeline<S, P>) -> Self {
        Self { store, engine, sync }
    }

    // ── roles ──────────────────────────────────────────────────────────────

    #[instrument(skip(self, input), fields(name = %input.name))]
    pub async fn create_role(&self, input: NewRole) -> ServiceResult<Synced<Role>> {
        let role = Role::create(input, Utc::now())?;
        self.store.check_role_exists(&role.name).await?;
        if let Some(parent) = role.parent_id {
            self.store.get_role(parent).await?;
        }
        let role = self.store.create_role(role).await?;
        info!(role = %role.name, "role created");
        Ok(self.schema_only(role).await)
    }

    pub async fn get_role(&self, id: RoleId) -> ServiceResult<Role> {
        Ok(self.store.get_role(id).await?)
    }

    pub async fn list_roles(&self, filter: &ListFilter, page: Pagination) -> ServiceResult<Page<Role>> {
        Ok(Page {
            items: self.store.list_roles(filter, page).await?,
            total: self.store.count_roles(filter).await?,
        })
    }

    /// Renames and (de)activation change relation names, so holders are
    /// reconciled.
    #[instrument(skip(self, patch))]
    pub async fn update_role(&self, id: RoleId, patch: RolePatch) -> ServiceResult<Synced<Role>> {
        let role = self.store.update_role(id, patch).await?;
        let sync = self.sync.resync_roles(&[role.id]).await;
        Ok(Synced { value: role, sync })
    }

    #[instrument(skip(self))]
    pub async fn delete_role(&self, id: RoleId) -> ServiceResult<ResyncResult> {
        let role = self.store.get_role(id).await?;
        let holders = self.holders_of(id).await?;

        let links = self.store.delete_role_permissions_by_role(id).await?;
        let memberships = self.store.delete_user_roles_by_role(id).await?;
        self.store.soft_delete_role(id).await?;
        info!(role = %role.name, links, memberships, "role deleted");

        Ok(self.sync.resync_users(&holders).await)
    }

    // ── permissions ────────────────────────────────────────────────────────

    #[instrument(skip(self, input), fields(name = %input.name))]
    pub async fn create_permission(&self, input: NewPermission) -> ServiceResult<Synced<Permission>> {
        let permission = Permission::create(input, Utc::now())?;
        self.store.check_permission_exists(&permission.name).await?;
        let permission = self.store.create_permission(permission).await?;
        info!(permission = %permission.name, "permission created");
        Ok(self.schema_only(permission).await)
    }

    pub async fn get_permission(&self, id: PermissionId) -> ServiceResult<Permission> {
        Ok(self.store.get_permission(id).await?)
    }

    pub async fn list_permissions(
        &self,
        filter: &ListFilter,
        page: Pagination,
    ) -> ServiceResult<Page<Permission>> {
        Ok(Page {
            items: self.store.list_permissions(filter, page).await?,
            total: self.store.count_permissions(filter).await?,
        })
    }

    #[instrument(skip(self, patch))]
    pub async fn update_permission(
        &self,
        id: PermissionId,
        patch: PermissionPatch,
    ) -> ServiceResult<Synced<Permission>> {
        let permission = self.store.update_permission(id, patch).await?;
        let roles = self.store.list_roles_by_permission(id).await?;
        let sync = self.sync.resync_roles(&roles).await;
        Ok(Synced {
            value: permission,
            sync,
        })
    }

    #[instrument(skip(self))]
    pub async fn delete_permission(&self, id: PermissionId) -> ServiceResult<ResyncResult> {
        let permission = self.store.get_permission(id).await?;
        let roles = self.store.list_roles_by_permission(id).await?;

        let links = self.store.delete_role_permissions_by_permission(id).await?;
        self.store.soft_delete_permission(id).await?;
        info!(permission = %permission.name, links, "permission deleted");

        Ok(self.sync.resync_roles(&roles).await)
    }

    // ── actions ────────────────────────────────────────────────────────────

    #[instrument(skip(self, input), fields(name = %input.name))]
    pub async fn create_action(&self, input: NewAction) -> ServiceResult<Synced<Action>> {
        let action = Action::create(input, Utc::now())?;
        self.store.check_action_exists(&action.name).await?;
        let action = self.store.create_action(action).await?;
        info!(action = %action.name, category = action.category.as_str(), "action created");
        Ok(self.schema_only(action).await)
    }

    pub async fn get_action(&self, id: ActionId) -> ServiceResult<Action> {
        Ok(self.store.get_action(id).await?)
    }

    pub async fn list_actions(
        &self,
        filter: &ListFilter,
        page: Pagination,
    ) -> ServiceResult<Page<Action>> {
        Ok(Page {
            items: self.store.list_actions(filter, page).await?,
            total: self.store.count_actions(filter).await?,
        })
    }

    /// Static actions reject renames and deactivation.
    #[instrument(skip(self, patch))]
    pub async fn update_action(&self, id: ActionId, patch: ActionPatch) -> ServiceResult<Synced<Action>> {
        let action = self.store.update_action(id, patch).await?;
        Ok(self.schema_only(action).await)
    }

    #[instrument(skip(self))]
    pub async fn delete_action(&self, id: ActionId) -> ServiceResult<ResyncResult> {
        let action = self.store.get_action(id).await?;
        action.ensure_deletable()?;
        self.store.soft_delete_action(id).await?;
        info!(action = %action.name, "action deleted");
        Ok(self.schema_only(()).await.sync)
    }

    // ── resources ──────────────────────────────────────────────────────────

    #[instrument(skip(self, input), fields(name = %input.name))]
    pub async fn create_resource(&self, input: NewResource) -> ServiceResult<Synced<Resource>> {
        let resource = Resource::create(input, Utc::now())?;
        self.store.check_resource_exists(&resource.name).await?;
        if let Some(parent) = resource.parent_id {
            self.store.get_resource(parent).await?;
        }
        let resource = self.store.create_resource(resource).await?;
        info!(resource = %resource.name, "resource created");
        Ok(self.schema_only(resource).await)
    }

    pub async fn get_resource(&self, id: ResourceId) -> ServiceResult<Resource> {
        Ok(self.store.get_resource(id).await?)
    }

    pub async fn list_resources(
        &self,
        filter: &ListFilter,
        page: Pagination,
    ) -> ServiceResult<Page<Resource>> {
        Ok(Page {
            items: self.store.list_resources(filter, page).await?,
            total: self.store.count_resources(filter).await?,
        })
    }

    #[instrument(skip(self, patch))]
    pub async fn update_resource(
        &self,
        id: ResourceId,
        patch: ResourcePatch,
    ) -> ServiceResult<Synced<Resource>> {
        let resource = self.store.update_resource(id, patch).await?;
        Ok(self.schema_only(resource).await)
    }

    #[instrument(skip(self))]
    pub async fn delete_resource(&self, id: ResourceId) -> ServiceResult<ResyncResult> {
        let resource = self.store.get_resource(id).await?;
        self.store.soft_delete_resource(id).await?;
        info!(resource = %resource.name, "resource deleted");
        Ok(self.schema_only(()).await.sync)
    }

    // ── users ──────────────────────────────────────────────────────────────

    #[instrument(skip(self))]
    pub async fn create_user(&self, username: &str) -> ServiceResult<User> {
        let user = User::create(username, Utc::now())?;
        self.store.check_user_exists(&user.username).await?;
        Ok(self.store.create_user(user).await?)
    }

    /// Drop the user's memberships, deactivate it and purge its tuples.
    #[instrument(skip(self))]
    pub async fn delete_user(&self, id: UserId) -> ServiceResult<ReconciliationReport> {
        for link in self.store.list_user_roles_by_user(id).await? {
            self.store.delete_user_role(id, link.role_id).await?;
        }
        self.store.soft_delete_user(id).await?;
        let user = self.store.get_user(id).await?;
        info!(user = %user.username, "user deleted");
        Ok(self.sync.resync_user_tuples(&user).await)
    }

    // ── decisions ──────────────────────────────────────────────────────────

    /// Ask the engine whether `username` may `action` on the object
    /// `resource_type:resource_id`. `resource_type` is a resource name
    /// (`db_farm_crops`) or a category (`role`).
    #[instrument(skip(self))]
    pub async fn check_permission(
        &self,
        username: &str,
        action: &str,
        resource_type: &str,
        resource_id: &str,
    ) -> ServiceResult<bool> {
        let username = required("username", username)?;
        let action = required("action", action)?;
        let resource_type = required("resource type", resource_type)?;
        let resource_id = required("resource id", resource_id)?;

        let settings = self.sync.relationships.settings();
        let definition = resource_identifier(resource_type).ok_or_else(|| {
            ServiceError::invalid_argument(format!("invalid resource type '{resource_type}'"))
        })?;
        let subject = ObjectRef::new(format!("{}/user", settings.namespace), username);
        let object = ObjectRef::new(format!("{}/{definition}", settings.namespace), resource_id);

        let allowed = with_deadline(
            settings.call_timeout,
            self.engine
                .check_permission(&subject, &policy_identifier(action), &object),
        )
        .await
        .map_err(|e| ServiceError::internal(e.to_string()))?;

        info!(user = %username, action, object = %object, allowed, "permission checked");
        Ok(allowed)
    }

    // ── helpers ────────────────────────────────────────────────────────────

    async fn schema_only<T>(&self, value: T) -> Synced<T> {
        let schema = self.sync.schema.sync_best_effort().await;
        Synced {
            value,
            sync: ResyncResult {
                schema,
                report: ReconciliationReport::default(),
            },
        }
    }

    /// Active users currently holding `role_id`.
    async fn holders_of(&self, role_id: RoleId) -> ServiceResult<Vec<User>> {
        let ids: BTreeSet<UserId> = self
            .store
            .list_user_roles_by_role(role_id)
            .await?
            .into_iter()
            .filter(|l| l.is_active)
            .map(|l| l.user_id)
            .collect();
        let mut users = Vec::with_capacity(ids.len());
        for id in ids {
            users.push(named("user", &id.to_string(), self.store.get_user(id).await)?);
        }
        Ok(users)
    }
}
