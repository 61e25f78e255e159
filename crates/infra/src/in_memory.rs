//! In-memory RBAC store for tests/dev.
//!
//! All tables sit behind one lock so multi-row operations (batch link
//! inserts, cascades) are atomic, matching what the Postgres store gets from
//! a transaction.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use warden_core::{
    ActionId, DomainResult, Entity, ListFilter, Named, Pagination, PermissionId, ResourceId,
    RoleId, RolePermissionId, UserId, UserRoleId,
};
use warden_rbac::names::policy_identifier;
use warden_rbac::{
    Action, ActionPatch, Permission, PermissionPatch, Resource, ResourcePatch, Role, RolePatch,
    RolePermission, RolePermissionRecord, User, UserPatch, UserRole,
};

use crate::repo::{
    ActionRepository, PermissionRepository, RepoResult, RepositoryError, ResourceRepository,
    RolePermissionRepository, RoleRepository, UserRepository, UserRoleRepository,
};

/// Row behaviour shared by the named, soft-deletable tables.
trait Stored: Entity + Named + Clone
where
    Self::Id: core::fmt::Display,
{
    const ENTITY: &'static str;

    fn active(&self) -> bool;
    fn created(&self) -> DateTime<Utc>;
    fn mark_inactive(&mut self, now: DateTime<Utc>);

    /// Uniqueness key among active rows.
    fn key(name: &str) -> String {
        name.to_string()
    }
}

macro_rules! stored {
    ($t:ty, $entity:literal $(, key = $key:path)?) => {
        impl Stored for $t {
            const ENTITY: &'static str = $entity;

            fn active(&self) -> bool {
                self.is_active
            }

            fn created(&self) -> DateTime<Utc> {
                self.created_at
            }

            fn mark_inactive(&mut self, now: DateTime<Utc>) {
                self.is_active = false;
                self.updated_at = now;
            }

            $(
                fn key(name: &str) -> String {
                    $key(name)
                }
            )?
        }
    };
}

// Names that become engine relations must not share an identifier.
stored!(Role, "role", key = policy_identifier);
stored!(Permission, "permission", key = policy_identifier);
stored!(Action, "action", key = policy_identifier);
stored!(Resource, "resource");
stored!(User, "user");

type Table<T> = HashMap<<T as Entity>::Id, T>;

/// Active row other than `except` holding the key of `name`.
fn key_holder<'t, T>(table: &'t Table<T>, name: &str, except: Option<&T::Id>) -> Option<&'t T>
where
    T: Stored,
    T::Id: core::fmt::Display,
{
    let key = T::key(name);
    table
        .values()
        .find(|row| row.active() && Some(row.id()) != except && T::key(row.name()) == key)
}

fn name_conflict<T>(name: &str, holder: &T) -> RepositoryError
where
    T: Stored,
    T::Id: core::fmt::Display,
{
    if holder.name() == name {
        RepositoryError::Conflict(format!("{} '{}' already exists", T::ENTITY, name))
    } else {
        RepositoryError::Conflict(format!(
            "{} '{}' maps to the same policy identifier as '{}'",
            T::ENTITY,
            name,
            holder.name()
        ))
    }
}

fn insert<T>(table: &mut Table<T>, row: T) -> RepoResult<T>
where
    T: Stored,
    T::Id: core::fmt::Display,
{
    if table.contains_key(row.id()) {
        return Err(RepositoryError::Conflict(format!(
            "{} {} already exists",
            T::ENTITY,
            row.id()
        )));
    }
    if let Some(holder) = key_holder(table, row.name(), None) {
        return Err(name_conflict(row.name(), holder));
    }
    table.insert(row.id().clone(), row.clone());
    Ok(row)
}

fn get<T>(table: &Table<T>, id: &T::Id) -> RepoResult<T>
where
    T: Stored,
    T::Id: core::fmt::Display,
{
    table
        .get(id)
        .cloned()
        .ok_or_else(|| RepositoryError::not_found(T::ENTITY, id))
}

fn get_by_name<T>(table: &Table<T>, name: &str) -> RepoResult<T>
where
    T: Stored,
    T::Id: core::fmt::Display,
{
    table
        .values()
        .find(|row| row.active() && row.name() == name)
        .cloned()
        .ok_or_else(|| RepositoryError::not_found(T::ENTITY, name))
}

fn update<T>(
    table: &mut Table<T>,
    id: &T::Id,
    apply: impl FnOnce(&mut T) -> DomainResult<()>,
) -> RepoResult<T>
where
    T: Stored,
    T::Id: core::fmt::Display,
{
    let mut row = get(table, id)?;
    apply(&mut row)?;
    if row.active() {
        if let Some(holder) = key_holder(table, row.name(), Some(id)) {
            return Err(name_conflict(row.name(), holder));
        }
    }
    table.insert(id.clone(), row.clone());
    Ok(row)
}

fn soft_delete<T>(table: &mut Table<T>, id: &T::Id) -> RepoResult<()>
where
    T: Stored,
    T::Id: core::fmt::Display,
{
    let row = table
        .get_mut(id)
        .ok_or_else(|| RepositoryError::not_found(T::ENTITY, id))?;
    row.mark_inactive(Utc::now());
    Ok(())
}

fn filtered<T>(table: &Table<T>, filter: &ListFilter) -> Vec<T>
where
    T: Stored,
    T::Id: core::fmt::Display + Ord,
{
    let mut rows: Vec<T> = table
        .values()
        .filter(|row| filter.matches(row.name(), row.active()))
        .cloned()
        .collect();
    rows.sort_by(|a, b| a.created().cmp(&b.created()).then_with(|| a.id().cmp(b.id())));
    rows
}

fn check_exists<T>(table: &Table<T>, name: &str) -> RepoResult<()>
where
    T: Stored,
    T::Id: core::fmt::Display,
{
    match key_holder(table, name.trim(), None) {
        Some(holder) => Err(name_conflict(name.trim(), holder)),
        None => Ok(()),
    }
}

fn poisoned() -> RepositoryError {
    RepositoryError::Storage("lock poisoned".to_string())
}

#[derive(Debug, Default)]
struct State {
    roles: Table<Role>,
    permissions: Table<Permission>,
    actions: Table<Action>,
    resources: Table<Resource>,
    users: Table<User>,
    role_permissions: HashMap<RolePermissionId, RolePermission>,
    user_roles: HashMap<UserRoleId, UserRole>,
}

impl State {
    fn links_of_role(&self, role_id: RoleId) -> impl Iterator<Item = &RolePermission> {
        self.role_permissions
            .values()
            .filter(move |l| l.role_id == role_id)
    }

    fn retain_role_permissions(&mut self, keep: impl Fn(&RolePermission) -> bool) -> u64 {
        let before = self.role_permissions.len();
        self.role_permissions.retain(|_, l| keep(l));
        (before - self.role_permissions.len()) as u64
    }
}

/// In-memory implementation of every RBAC repository.
#[derive(Debug, Default)]
pub struct InMemoryRbacStore {
    state: RwLock<State>,
}

impl InMemoryRbacStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> RepoResult<RwLockReadGuard<'_, State>> {
        self.state.read().map_err(|_| poisoned())
    }

    fn write(&self) -> RepoResult<RwLockWriteGuard<'_, State>> {
        self.state.write().map_err(|_| poisoned())
    }

    /// Number of link rows, active or not. Used by tests to assert that no
    /// duplicate rows slipped in.
    pub fn role_permission_row_count(&self) -> usize {
        self.state
            .read()
            .map(|s| s.role_permissions.len())
            .unwrap_or_default()
    }
}

fn page_of<T>(rows: Vec<T>, page: Pagination) -> Vec<T> {
    page.apply(rows)
}

#[async_trait]
impl RoleRepository for InMemoryRbacStore {
    async fn create_role(&self, role: Role) -> RepoResult<Role> {
        insert(&mut self.write()?.roles, role)
    }

    async fn get_role(&self, id: RoleId) -> RepoResult<Role> {
        get(&self.read()?.roles, &id)
    }

    async fn get_role_by_name(&self, name: &str) -> RepoResult<Role> {
        get_by_name(&self.read()?.roles, name)
    }

    async fn update_role(&self, id: RoleId, patch: RolePatch) -> RepoResult<Role> {
        let mut state = self.write()?;
        if let Some(Some(parent)) = patch.parent_id {
            get(&state.roles, &parent)?;
        }
        update(&mut state.roles, &id, |r| r.apply(patch, Utc::now()))
    }

    async fn soft_delete_role(&self, id: RoleId) -> RepoResult<()> {
        soft_delete(&mut self.write()?.roles, &id)
    }

    async fn list_roles(&self, filter: &ListFilter, page: Pagination) -> RepoResult<Vec<Role>> {
        Ok(page_of(filtered(&self.read()?.roles, filter), page))
    }

    async fn count_roles(&self, filter: &ListFilter) -> RepoResult<u64> {
        Ok(filtered(&self.read()?.roles, filter).len() as u64)
    }

    async fn check_role_exists(&self, name: &str) -> RepoResult<()> {
        check_exists(&self.read()?.roles, name)
    }
}

#[async_trait]
impl PermissionRepository for InMemoryRbacStore {
    async fn create_permission(&self, permission: Permission) -> RepoResult<Permission> {
        insert(&mut self.write()?.permissions, permission)
    }

    async fn get_permission(&self, id: PermissionId) -> RepoResult<Permission> {
        get(&self.read()?.permissions, &id)
    }

    async fn get_permission_by_name(&self, name: &str) -> RepoResult<Permission> {
        get_by_name(&self.read()?.permissions, name)
    }

    async fn update_permission(
        &self,
        id: PermissionId,
        patch: PermissionPatch,
    ) -> RepoResult<Permission> {
        update(&mut self.write()?.permissions, &id, |p| {
            p.apply(patch, Utc::now())
        })
    }

    async fn soft_delete_permission(&self, id: PermissionId) -> RepoResult<()> {
        soft_delete(&mut self.write()?.permissions, &id)
    }

    async fn list_permissions(
        &self,
        filter: &ListFilter,
        page: Pagination,
    ) -> RepoResult<Vec<Permission>> {
        Ok(page_of(filtered(&self.read()?.permissions, filter), page))
    }

    async fn count_permissions(&self, filter: &ListFilter) -> RepoResult<u64> {
        Ok(filtered(&self.read()?.permissions, filter).len() as u64)
    }

    async fn check_permission_exists(&self, name: &str) -> RepoResult<()> {
        check_exists(&self.read()?.permissions, name)
    }
}

#[async_trait]
impl ActionRepository for InMemoryRbacStore {
    async fn create_action(&self, action: Action) -> RepoResult<Action> {
        insert(&mut self.write()?.actions, action)
    }

    async fn get_action(&self, id: ActionId) -> RepoResult<Action> {
        get(&self.read()?.actions, &id)
    }

    async fn get_action_by_name(&self, name: &str) -> RepoResult<Action> {
        get_by_name(&self.read()?.actions, name)
    }

    async fn update_action(&self, id: ActionId, patch: ActionPatch) -> RepoResult<Action> {
        update(&mut self.write()?.actions, &id, |a| a.apply(patch, Utc::now()))
    }

    async fn soft_delete_action(&self, id: ActionId) -> RepoResult<()> {
        soft_delete(&mut self.write()?.actions, &id)
    }

    async fn list_actions(&self, filter: &ListFilter, page: Pagination) -> RepoResult<Vec<Action>> {
        Ok(page_of(filtered(&self.read()?.actions, filter), page))
    }

    async fn count_actions(&self, filter: &ListFilter) -> RepoResult<u64> {
        Ok(filtered(&self.read()?.actions, filter).len() as u64)
    }

    async fn check_action_exists(&self, name: &str) -> RepoResult<()> {
        check_exists(&self.read()?.actions, &name.trim().to_lowercase())
    }
}

#[async_trait]
impl ResourceRepository for InMemoryRbacStore {
    async fn create_resource(&self, resource: Resource) -> RepoResult<Resource> {
        insert(&mut self.write()?.resources, resource)
    }

    async fn get_resource(&self, id: ResourceId) -> RepoResult<Resource> {
        get(&self.read()?.resources, &id)
    }

    async fn get_resource_by_name(&self, name: &str) -> RepoResult<Resource> {
        get_by_name(&self.read()?.resources, name)
    }

    async fn update_resource(&self, id: ResourceId, patch: ResourcePatch) -> RepoResult<Resource> {
        update(&mut self.write()?.resources, &id, |r| {
            r.apply(patch, Utc::now())
        })
    }

    async fn soft_delete_resource(&self, id: ResourceId) -> RepoResult<()> {
        soft_delete(&mut self.write()?.resources, &id)
    }

    async fn list_resources(
        &self,
        filter: &ListFilter,
        page: Pagination,
    ) -> RepoResult<Vec<Resource>> {
        Ok(page_of(filtered(&self.read()?.resources, filter), page))
    }

    async fn count_resources(&self, filter: &ListFilter) -> RepoResult<u64> {
        Ok(filtered(&self.read()?.resources, filter).len() as u64)
    }

    async fn check_resource_exists(&self, name: &str) -> RepoResult<()> {
        check_exists(&self.read()?.resources, name)
    }
}

#[async_trait]
impl UserRepository for InMemoryRbacStore {
    async fn create_user(&self, user: User) -> RepoResult<User> {
        insert(&mut self.write()?.users, user)
    }

    async fn get_user(&self, id: UserId) -> RepoResult<User> {
        get(&self.read()?.users, &id)
    }

    async fn get_user_by_username(&self, username: &str) -> RepoResult<User> {
        get_by_name(&self.read()?.users, username)
    }

    async fn update_user(&self, id: UserId, patch: UserPatch) -> RepoResult<User> {
        update(&mut self.write()?.users, &id, |u| u.apply(patch, Utc::now()))
    }

    async fn soft_delete_user(&self, id: UserId) -> RepoResult<()> {
        soft_delete(&mut self.write()?.users, &id)
    }

    async fn list_users(&self, filter: &ListFilter, page: Pagination) -> RepoResult<Vec<User>> {
        Ok(page_of(filtered(&self.read()?.users, filter), page))
    }

    async fn count_users(&self, filter: &ListFilter) -> RepoResult<u64> {
        Ok(filtered(&self.read()?.users, filter).len() as u64)
    }

    async fn check_user_exists(&self, username: &str) -> RepoResult<()> {
        check_exists(&self.read()?.users, username)
    }
}

#[async_trait]
impl RolePermissionRepository for InMemoryRbacStore {
    async fn create_role_permissions(
        &self,
        links: Vec<RolePermission>,
    ) -> RepoResult<Vec<RolePermission>> {
        let mut state = self.write()?;

        let mut seen: HashSet<(RoleId, PermissionId)> = state
            .role_permissions
            .values()
            .map(|l| (l.role_id, l.permission_id))
            .collect();
        for link in &links {
            get(&state.roles, &link.role_id)?;
            get(&state.permissions, &link.permission_id)?;
            if !seen.insert((link.role_id, link.permission_id)) {
                return Err(RepositoryError::Conflict(format!(
                    "permission {} is already assigned to role {}",
                    link.permission_id, link.role_id
                )));
            }
        }

        for link in &links {
            state.role_permissions.insert(link.id, link.clone());
        }
        Ok(links)
    }

    async fn get_role_permission(&self, id: RolePermissionId) -> RepoResult<RolePermission> {
        self.read()?
            .role_permissions
            .get(&id)
            .cloned()
            .ok_or_else(|| RepositoryError::not_found("role_permission", id))
    }

    async fn find_active_role_permission(
        &self,
        role_id: RoleId,
        permission_id: PermissionId,
    ) -> RepoResult<Option<RolePermission>> {
        Ok(self
            .read()?
            .links_of_role(role_id)
            .find(|l| l.permission_id == permission_id && l.is_active)
            .cloned())
    }

    async fn list_role_permissions(&self, role_id: RoleId) -> RepoResult<Vec<RolePermissionRecord>> {
        let state = self.read()?;
        let mut records: Vec<RolePermissionRecord> = state
            .links_of_role(role_id)
            .map(|link| RolePermissionRecord {
                link: link.clone(),
                permission: state
                    .permissions
                    .get(&link.permission_id)
                    .filter(|p| p.is_active)
                    .cloned(),
            })
            .collect();
        records.sort_by(|a, b| {
            a.link
                .created_at
                .cmp(&b.link.created_at)
                .then_with(|| a.link.id.cmp(&b.link.id))
        });
        Ok(records)
    }

    async fn count_role_permissions(&self, role_id: RoleId) -> RepoResult<u64> {
        Ok(self.read()?.links_of_role(role_id).count() as u64)
    }

    async fn list_roles_by_permission(&self, permission_id: PermissionId) -> RepoResult<Vec<RoleId>> {
        let state = self.read()?;
        let mut roles: Vec<RoleId> = state
            .role_permissions
            .values()
            .filter(|l| l.permission_id == permission_id && l.is_active)
            .map(|l| l.role_id)
            .collect();
        roles.sort();
        roles.dedup();
        Ok(roles)
    }

    async fn delete_role_permissions_by_role(&self, role_id: RoleId) -> RepoResult<u64> {
        Ok(self.write()?.retain_role_permissions(|l| l.role_id != role_id))
    }

    async fn delete_role_permissions_by_permission(
        &self,
        permission_id: PermissionId,
    ) -> RepoResult<u64> {
        Ok(self
            .write()?
            .retain_role_permissions(|l| l.permission_id != permission_id))
    }

    async fn delete_role_permission(&self, id: RolePermissionId) -> RepoResult<()> {
        self.write()?
            .role_permissions
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| RepositoryError::not_found("role_permission", id))
    }

    async fn delete_role_permission_link(
        &self,
        role_id: RoleId,
        permission_id: PermissionId,
    ) -> RepoResult<()> {
        let removed = self
            .write()?
            .retain_role_permissions(|l| !(l.role_id == role_id && l.permission_id == permission_id));
        if removed == 0 {
            return Err(RepositoryError::not_found(
                "role_permission",
                format!("{role_id}/{permission_id}"),
            ));
        }
        Ok(())
    }
}

fn sorted_user_roles<'a>(links: impl Iterator<Item = &'a UserRole>) -> Vec<UserRole> {
    let mut out: Vec<UserRole> = links.cloned().collect();
    out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    out
}

#[async_trait]
impl UserRoleRepository for InMemoryRbacStore {
    async fn create_user_role(&self, link: UserRole) -> RepoResult<UserRole> {
        let mut state = self.write()?;
        get(&state.users, &link.user_id)?;
        get(&state.roles, &link.role_id)?;
        if state
            .user_roles
            .values()
            .any(|l| l.user_id == link.user_id && l.role_id == link.role_id)
        {
            return Err(RepositoryError::Conflict(format!(
                "user {} already holds role {}",
                link.user_id, link.role_id
            )));
        }
        state.user_roles.insert(link.id, link.clone());
        Ok(link)
    }

    async fn list_user_roles_by_role(&self, role_id: RoleId) -> RepoResult<Vec<UserRole>> {
        let state = self.read()?;
        Ok(sorted_user_roles(
            state.user_roles.values().filter(|l| l.role_id == role_id),
        ))
    }

    async fn list_user_roles_by_user(&self, user_id: UserId) -> RepoResult<Vec<UserRole>> {
        let state = self.read()?;
        Ok(sorted_user_roles(
            state.user_roles.values().filter(|l| l.user_id == user_id),
        ))
    }

    async fn delete_user_roles_by_role(&self, role_id: RoleId) -> RepoResult<u64> {
        let mut state = self.write()?;
        let before = state.user_roles.len();
        state.user_roles.retain(|_, l| l.role_id != role_id);
        Ok((before - state.user_roles.len()) as u64)
    }

    async fn delete_user_role(&self, user_id: UserId, role_id: RoleId) -> RepoResult<()> {
        let mut state = self.write()?;
        let before = state.user_roles.len();
        state
            .user_roles
            .retain(|_, l| !(l.user_id == user_id && l.role_id == role_id));
        if state.user_roles.len() == before {
            return Err(RepositoryError::not_found(
                "user_role",
                format!("{user_id}/{role_id}"),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_rbac::{NewPermission, NewRole};

    fn role(name: &str) -> Role {
        Role::create(NewRole::named(name), Utc::now()).unwrap()
    }

    fn permission(name: &str) -> Permission {
        Permission::create(NewPermission::new(name, "db_farm_crops", ["read"]), Utc::now()).unwrap()
    }

    #[tokio::test]
    async fn duplicate_active_name_conflicts() {
        let store = InMemoryRbacStore::new();
        store.create_role(role("agronomist")).await.unwrap();
        let err = store.create_role(role("agronomist")).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(store.check_role_exists("agronomist").await.unwrap_err().is_conflict());
        assert!(store.check_role_exists("viewer").await.is_ok());
    }

    #[tokio::test]
    async fn soft_deleted_rows_hide_from_name_lookup() {
        let store = InMemoryRbacStore::new();
        let r = store.create_role(role("temp")).await.unwrap();
        store.soft_delete_role(r.id).await.unwrap();

        assert!(store.get_role_by_name("temp").await.unwrap_err().is_not_found());
        assert!(!store.get_role(r.id).await.unwrap().is_active);
        assert_eq!(store.count_roles(&ListFilter::active()).await.unwrap(), 0);
        assert_eq!(store.count_roles(&ListFilter::with_inactive()).await.unwrap(), 1);

        // name is free again
        store.create_role(role("temp")).await.unwrap();
    }

    #[tokio::test]
    async fn rename_into_existing_name_conflicts() {
        let store = InMemoryRbacStore::new();
        store.create_role(role("a")).await.unwrap();
        let b = store.create_role(role("b")).await.unwrap();
        let patch = RolePatch {
            name: Some("a".into()),
            ..RolePatch::default()
        };
        assert!(store.update_role(b.id, patch).await.unwrap_err().is_conflict());
        assert_eq!(store.get_role(b.id).await.unwrap().name, "b");
    }

    #[tokio::test]
    async fn names_with_one_policy_identifier_conflict() {
        let store = InMemoryRbacStore::new();
        store.create_role(role("Admin")).await.unwrap();

        let err = store.create_role(role("admin")).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(err.to_string().contains("'Admin'"), "{err}");
        assert!(store.check_role_exists("ADMIN").await.unwrap_err().is_conflict());

        store.create_permission(permission("read crops")).await.unwrap();
        let err = store.create_permission(permission("Read-Crops")).await.unwrap_err();
        assert!(err.is_conflict());

        let viewer = store.create_role(role("viewer")).await.unwrap();
        let patch = RolePatch {
            name: Some("admin".into()),
            ..RolePatch::default()
        };
        assert!(store.update_role(viewer.id, patch).await.unwrap_err().is_conflict());

        // Respelling a row's own name is fine.
        let patch = RolePatch {
            name: Some("Viewer".into()),
            ..RolePatch::default()
        };
        assert_eq!(store.update_role(viewer.id, patch).await.unwrap().name, "Viewer");
    }

    #[tokio::test]
    async fn list_pages_in_creation_order() {
        let store = InMemoryRbacStore::new();
        for (i, name) in ["one", "two", "three"].into_iter().enumerate() {
            let mut r = role(name);
            r.created_at = Utc::now() + chrono::Duration::seconds(i as i64);
            store.create_role(r).await.unwrap();
        }
        let page = store
            .list_roles(&ListFilter::active(), Pagination::new(1, 1))
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].name, "two");
    }

    #[tokio::test]
    async fn batch_link_insert_is_all_or_nothing() {
        let store = InMemoryRbacStore::new();
        let r = store.create_role(role("agronomist")).await.unwrap();
        let p1 = store.create_permission(permission("read_crop_data")).await.unwrap();
        let p2 = store.create_permission(permission("write_crop_data")).await.unwrap();

        store
            .create_role_permissions(vec![RolePermission::link(r.id, p1.id, Utc::now())])
            .await
            .unwrap();

        let err = store
            .create_role_permissions(vec![
                RolePermission::link(r.id, p2.id, Utc::now()),
                RolePermission::link(r.id, p1.id, Utc::now()),
            ])
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.role_permission_row_count(), 1);
        assert!(store.find_active_role_permission(r.id, p2.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_pair_within_batch_conflicts() {
        let store = InMemoryRbacStore::new();
        let r = store.create_role(role("agronomist")).await.unwrap();
        let p = store.create_permission(permission("read_crop_data")).await.unwrap();
        let err = store
            .create_role_permissions(vec![
                RolePermission::link(r.id, p.id, Utc::now()),
                RolePermission::link(r.id, p.id, Utc::now()),
            ])
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.role_permission_row_count(), 0);
    }

    #[tokio::test]
    async fn records_drop_soft_deleted_permissions() {
        let store = InMemoryRbacStore::new();
        let r = store.create_role(role("agronomist")).await.unwrap();
        let p = store.create_permission(permission("read_crop_data")).await.unwrap();
        store
            .create_role_permissions(vec![RolePermission::link(r.id, p.id, Utc::now())])
            .await
            .unwrap();
        store.soft_delete_permission(p.id).await.unwrap();

        let records = store.list_role_permissions(r.id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].permission.is_none());
    }

    #[tokio::test]
    async fn link_deletes_report_counts() {
        let store = InMemoryRbacStore::new();
        let r = store.create_role(role("agronomist")).await.unwrap();
        let p1 = store.create_permission(permission("p1")).await.unwrap();
        let p2 = store.create_permission(permission("p2")).await.unwrap();
        store
            .create_role_permissions(vec![
                RolePermission::link(r.id, p1.id, Utc::now()),
                RolePermission::link(r.id, p2.id, Utc::now()),
            ])
            .await
            .unwrap();

        assert_eq!(store.list_roles_by_permission(p1.id).await.unwrap(), vec![r.id]);
        store.delete_role_permission_link(r.id, p1.id).await.unwrap();
        assert!(store
            .delete_role_permission_link(r.id, p1.id)
            .await
            .unwrap_err()
            .is_not_found());
        assert_eq!(store.delete_role_permissions_by_role(r.id).await.unwrap(), 1);
        assert_eq!(store.count_role_permissions(r.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn user_role_pairs_are_unique() {
        let store = InMemoryRbacStore::new();
        let r = store.create_role(role("agronomist")).await.unwrap();
        let u = store.create_user(User::create("alice", Utc::now()).unwrap()).await.unwrap();
        store.create_user_role(UserRole::link(u.id, r.id, Utc::now())).await.unwrap();
        assert!(store
            .create_user_role(UserRole::link(u.id, r.id, Utc::now()))
            .await
            .unwrap_err()
            .is_conflict());
        assert_eq!(store.list_user_roles_by_user(u.id).await.unwrap().len(), 1);
        store.delete_user_role(u.id, r.id).await.unwrap();
        assert!(store.list_user_roles_by_role(r.id).await.unwrap().is_empty());
    }
}
