//! Projection of the RBAC graph onto per-user grants.
//!
//! A user's grants are the union over all of their active roles, so changing
//! one role re-derives everything the affected users hold, not just the
//! changed role's share.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use warden_core::{ListFilter, RoleId, UserId};
use warden_infra::{
    PermissionRepository, RbacStore, RepositoryError, ResourceRepository,
    RolePermissionRepository, RoleRepository, UserRepository, UserRoleRepository,
};
use warden_policy::resource_identifier;
use warden_rbac::{Permission, User};

use crate::error::ServiceResult;
use crate::listing::{drain_pages, grants_access};
use crate::relationship_sync::UserGrants;

/// What one role contributes to its holders.
#[derive(Debug, Clone)]
struct RoleShare {
    name: String,
    permissions: Vec<Permission>,
}

pub struct RoleProjector<S> {
    store: Arc<S>,
}

impl<S> Clone for RoleProjector<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: RbacStore> RoleProjector<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Effective grants of one user. Inactive users have none.
    pub async fn user_grants(&self, user: &User) -> ServiceResult<UserGrants> {
        let mut shares = HashMap::new();
        self.grants_with(user, &mut shares, Utc::now()).await
    }

    /// Grants of every user holding `role_id`.
    pub async fn users_of_role(&self, role_id: RoleId) -> ServiceResult<Vec<UserGrants>> {
        self.users_of_roles(&[role_id]).await
    }

    /// Grants of every user holding any of `role_ids`, one entry per user.
    pub async fn users_of_roles(&self, role_ids: &[RoleId]) -> ServiceResult<Vec<UserGrants>> {
        let mut user_ids = BTreeSet::new();
        for role_id in role_ids {
            for link in self.store.list_user_roles_by_role(*role_id).await? {
                if link.is_active {
                    user_ids.insert(link.user_id);
                }
            }
        }
        self.grants_of(user_ids).await
    }

    /// Grants of every known user, including deactivated ones (which come
    /// back empty so their tuples get purged).
    pub async fn all_users(&self) -> ServiceResult<Vec<UserGrants>> {
        let store = &*self.store;
        let filter = ListFilter::with_inactive();
        let users = drain_pages(|page| store.list_users(&filter, page)).await?;

        let now = Utc::now();
        let mut shares = HashMap::new();
        let mut out = Vec::with_capacity(users.len());
        for user in &users {
            out.push(self.grants_with(user, &mut shares, now).await?);
        }
        Ok(out)
    }

    /// Every resource definition name the graph has ever referenced,
    /// including deleted resources, so stale tuples on them can be purged.
    pub async fn known_resources(&self) -> ServiceResult<BTreeSet<String>> {
        let store = &*self.store;
        let filter = ListFilter::with_inactive();
        let resources = drain_pages(|page| store.list_resources(&filter, page)).await?;
        let permissions = drain_pages(|page| store.list_permissions(&filter, page)).await?;

        Ok(resources
            .iter()
            .map(|r| r.name.as_str())
            .chain(permissions.iter().map(|p| p.resource.as_str()))
            .filter_map(resource_identifier)
            .collect())
    }

    async fn grants_of(&self, user_ids: BTreeSet<UserId>) -> ServiceResult<Vec<UserGrants>> {
        let now = Utc::now();
        let mut shares = HashMap::new();
        let mut out = Vec::with_capacity(user_ids.len());
        for user_id in user_ids {
            let user = match self.store.get_user(user_id).await {
                Ok(user) => user,
                Err(RepositoryError::NotFound { .. }) => continue,
                Err(e) => return Err(e.into()),
            };
            out.push(self.grants_with(&user, &mut shares, now).await?);
        }
        Ok(out)
    }

    async fn grants_with(
        &self,
        user: &User,
        shares: &mut HashMap<RoleId, Option<RoleShare>>,
        now: DateTime<Utc>,
    ) -> ServiceResult<UserGrants> {
        let mut grants = UserGrants::new(&user.username);
        if !user.is_active {
            return Ok(grants);
        }

        for link in self.store.list_user_roles_by_user(user.id).await? {
            if !link.is_active {
                continue;
            }
            if !shares.contains_key(&link.role_id) {
                let share = self.role_share(link.role_id, now).await?;
                shares.insert(link.role_id, share);
            }
            let Some(Some(share)) = shares.get(&link.role_id) else {
                continue;
            };

            grants.roles.insert(&share.name);
            for permission in &share.permissions {
                grants.permissions.insert(&permission.name);
                for action in &permission.actions {
                    grants.actions.insert(action);
                }
                if let Some(resource) = resource_identifier(&permission.resource) {
                    grants.resources.entry(resource).or_default().insert(&share.name);
                }
            }
        }
        Ok(grants)
    }

    /// `None` for a missing or inactive role.
    async fn role_share(&self, role_id: RoleId, now: DateTime<Utc>) -> ServiceResult<Option<RoleShare>> {
        let role = match self.store.get_role(role_id).await {
            Ok(role) if role.is_active => role,
            Ok(_) | Err(RepositoryError::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let permissions = self
            .store
            .list_role_permissions(role.id)
            .await?
            .iter()
            .filter_map(|r| r.active_permission())
            .filter(|p| grants_access(p, now))
            .cloned()
            .collect();
        Ok(Some(RoleShare {
            name: role.name,
            permissions,
        }))
    }
}
