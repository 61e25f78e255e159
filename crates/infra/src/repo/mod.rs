//! Persistence repositories for the RBAC graph.
//!
//! One trait per entity, combined into [`RbacStore`]. Method names carry the
//! entity so a single store type can implement all of them without call-site
//! ambiguity.
//!
//! Conventions shared by every backend:
//! - `get_*` by id returns soft-deleted rows too; `get_*_by_name` only sees
//!   active rows.
//! - Soft delete clears `is_active`. Name uniqueness only applies to active
//!   rows, so a deleted name can be reused.
//! - `check_*_exists` fails with `Conflict` when an active row has the name.

use async_trait::async_trait;

use warden_core::{
    ActionId, ListFilter, Pagination, PermissionId, ResourceId, RoleId, RolePermissionId, UserId,
};
use warden_rbac::{
    Action, ActionPatch, Permission, PermissionPatch, Resource, ResourcePatch, Role, RolePatch,
    RolePermission, RolePermissionRecord, User, UserPatch, UserRole,
};

mod error;

pub use error::{RepoResult, RepositoryError};

#[async_trait]
pub trait RoleRepository: Send + Sync {
    async fn create_role(&self, role: Role) -> RepoResult<Role>;
    async fn get_role(&self, id: RoleId) -> RepoResult<Role>;
    async fn get_role_by_name(&self, name: &str) -> RepoResult<Role>;
    async fn update_role(&self, id: RoleId, patch: RolePatch) -> RepoResult<Role>;
    async fn soft_delete_role(&self, id: RoleId) -> RepoResult<()>;
    async fn list_roles(&self, filter: &ListFilter, page: Pagination) -> RepoResult<Vec<Role>>;
    async fn count_roles(&self, filter: &ListFilter) -> RepoResult<u64>;
    async fn check_role_exists(&self, name: &str) -> RepoResult<()>;
}

#[async_trait]
pub trait PermissionRepository: Send + Sync {
    async fn create_permission(&self, permission: Permission) -> RepoResult<Permission>;
    async fn get_permission(&self, id: PermissionId) -> RepoResult<Permission>;
    async fn get_permission_by_name(&self, name: &str) -> RepoResult<Permission>;
    async fn update_permission(
        &self,
        id: PermissionId,
        patch: PermissionPatch,
    ) -> RepoResult<Permission>;
    async fn soft_delete_permission(&self, id: PermissionId) -> RepoResult<()>;
    async fn list_permissions(
        &self,
        filter: &ListFilter,
        page: Pagination,
    ) -> RepoResult<Vec<Permission>>;
    async fn count_permissions(&self, filter: &ListFilter) -> RepoResult<u64>;
    async fn check_permission_exists(&self, name: &str) -> RepoResult<()>;
}

#[async_trait]
pub trait ActionRepository: Send + Sync {
    async fn create_action(&self, action: Action) -> RepoResult<Action>;
    async fn get_action(&self, id: ActionId) -> RepoResult<Action>;
    async fn get_action_by_name(&self, name: &str) -> RepoResult<Action>;
    async fn update_action(&self, id: ActionId, patch: ActionPatch) -> RepoResult<Action>;
    async fn soft_delete_action(&self, id: ActionId) -> RepoResult<()>;
    async fn list_actions(&self, filter: &ListFilter, page: Pagination) -> RepoResult<Vec<Action>>;
    async fn count_actions(&self, filter: &ListFilter) -> RepoResult<u64>;
    async fn check_action_exists(&self, name: &str) -> RepoResult<()>;
}

#[async_trait]
pub trait ResourceRepository: Send + Sync {
    async fn create_resource(&self, resource: Resource) -> RepoResult<Resource>;
    async fn get_resource(&self, id: ResourceId) -> RepoResult<Resource>;
    async fn get_resource_by_name(&self, name: &str) -> RepoResult<Resource>;
    async fn update_resource(&self, id: ResourceId, patch: ResourcePatch) -> RepoResult<Resource>;
    async fn soft_delete_resource(&self, id: ResourceId) -> RepoResult<()>;
    async fn list_resources(
        &self,
        filter: &ListFilter,
        page: Pagination,
    ) -> RepoResult<Vec<Resource>>;
    async fn count_resources(&self, filter: &ListFilter) -> RepoResult<u64>;
    async fn check_resource_exists(&self, name: &str) -> RepoResult<()>;
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn create_user(&self, user: User) -> RepoResult<User>;
    async fn get_user(&self, id: UserId) -> RepoResult<User>;
    async fn get_user_by_username(&self, username: &str) -> RepoResult<User>;
    async fn update_user(&self, id: UserId, patch: UserPatch) -> RepoResult<User>;
    async fn soft_delete_user(&self, id: UserId) -> RepoResult<()>;
    async fn list_users(&self, filter: &ListFilter, page: Pagination) -> RepoResult<Vec<User>>;
    async fn count_users(&self, filter: &ListFilter) -> RepoResult<u64>;
    async fn check_user_exists(&self, username: &str) -> RepoResult<()>;
}

#[async_trait]
pub trait RolePermissionRepository: Send + Sync {
    /// Insert all links or none. A `(role, permission)` pair that already has
    /// a link, or appears twice in `links`, fails the batch with `Conflict`.
    async fn create_role_permissions(
        &self,
        links: Vec<RolePermission>,
    ) -> RepoResult<Vec<RolePermission>>;

    async fn get_role_permission(&self, id: RolePermissionId) -> RepoResult<RolePermission>;

    async fn find_active_role_permission(
        &self,
        role_id: RoleId,
        permission_id: PermissionId,
    ) -> RepoResult<Option<RolePermission>>;

    /// Links of a role joined with their permissions, oldest first.
    async fn list_role_permissions(&self, role_id: RoleId) -> RepoResult<Vec<RolePermissionRecord>>;

    async fn count_role_permissions(&self, role_id: RoleId) -> RepoResult<u64>;

    /// Roles with an active link to the permission.
    async fn list_roles_by_permission(&self, permission_id: PermissionId) -> RepoResult<Vec<RoleId>>;

    /// Returns the number of deleted links.
    async fn delete_role_permissions_by_role(&self, role_id: RoleId) -> RepoResult<u64>;

    async fn delete_role_permissions_by_permission(
        &self,
        permission_id: PermissionId,
    ) -> RepoResult<u64>;

    async fn delete_role_permission(&self, id: RolePermissionId) -> RepoResult<()>;

    async fn delete_role_permission_link(
        &self,
        role_id: RoleId,
        permission_id: PermissionId,
    ) -> RepoResult<()>;
}

#[async_trait]
pub trait UserRoleRepository: Send + Sync {
    /// `Conflict` if the user already holds the role.
    async fn create_user_role(&self, link: UserRole) -> RepoResult<UserRole>;

    async fn list_user_roles_by_role(&self, role_id: RoleId) -> RepoResult<Vec<UserRole>>;

    async fn list_user_roles_by_user(&self, user_id: UserId) -> RepoResult<Vec<UserRole>>;

    async fn delete_user_roles_by_role(&self, role_id: RoleId) -> RepoResult<u64>;

    async fn delete_user_role(&self, user_id: UserId, role_id: RoleId) -> RepoResult<()>;
}

/// Everything the synchronizers and services need from storage.
pub trait RbacStore:
    RoleRepository
    + PermissionRepository
    + ActionRepository
    + ResourceRepository
    + UserRepository
    + RolePermissionRepository
    + UserRoleRepository
{
}

impl<T> RbacStore for T where
    T: RoleRepository
        + PermissionRepository
        + ActionRepository
        + ResourceRepository
        + UserRepository
        + RolePermissionRepository
        + UserRoleRepository
{
}
