//! Postgres-backed RBAC store.
//!
//! ## Uniqueness
//!
//! Name uniqueness (active rows) and link-pair uniqueness are enforced by the
//! unique indexes in `migrations/0001_rbac.sql`. Roles, permissions and
//! actions are unique by `policy_key`, the engine identifier of their name. A `23505` from an insert or
//! update is reported as [`RepositoryError::Conflict`], which makes the
//! database the single authority on duplicates even under concurrent
//! requests.
//!
//! ## Updates
//!
//! Patches are applied in domain code: the row is locked with `FOR UPDATE`,
//! mapped, patched, validated, and written back in the same transaction.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};
use uuid::Uuid;

use warden_core::{
    ActionId, DomainResult, ListFilter, Pagination, PermissionId, ResourceId, RoleId,
    RolePermissionId, UserId, UserRoleId,
};
use warden_rbac::names::policy_identifier;
use warden_rbac::{
    Action, ActionCategory, ActionPatch, Effect, Permission, PermissionPatch, Resource,
    ResourcePatch, Role, RolePatch, RolePermission, RolePermissionRecord, User, UserPatch,
    UserRole,
};

use crate::repo::{
    ActionRepository, PermissionRepository, RepoResult, RepositoryError, ResourceRepository,
    RolePermissionRepository, RoleRepository, UserRepository, UserRoleRepository,
};

/// Embedded migrations (`crates/infra/migrations`).
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Clone)]
pub struct PostgresRbacStore {
    pool: Arc<PgPool>,
}

impl PostgresRbacStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect a pool of `max_connections` to `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> RepoResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Apply pending migrations.
    pub async fn migrate(&self) -> RepoResult<()> {
        MIGRATOR
            .run(&*self.pool)
            .await
            .map_err(|e| RepositoryError::Storage(format!("migration failed: {e}")))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn begin(&self) -> RepoResult<Transaction<'static, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Error mapping
// ─────────────────────────────────────────────────────────────────────────────

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => RepositoryError::Conflict(msg),
                // foreign key / check violations
                Some("23503") | Some("23514") => RepositoryError::Storage(msg),
                _ => RepositoryError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            RepositoryError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => RepositoryError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some("23505");
    }
    false
}

fn row_error(entity: &str, err: impl core::fmt::Display) -> RepositoryError {
    RepositoryError::Storage(format!("failed to decode {entity} row: {err}"))
}

fn domain_error(entity: &str, err: warden_core::DomainError) -> RepositoryError {
    RepositoryError::Storage(format!("stored {entity} is invalid: {err}"))
}

/// `%needle%` with LIKE metacharacters escaped.
fn like_pattern(needle: &str) -> String {
    let escaped = needle
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

// ─────────────────────────────────────────────────────────────────────────────
// Row mapping
// ─────────────────────────────────────────────────────────────────────────────

const ROLE_COLUMNS: &str =
    "id, name, description, source, parent_id, is_active, created_at, updated_at";
const PERMISSION_COLUMNS: &str = "id, name, description, resource, effect, actions, source, \
     valid_start, valid_end, is_active, created_at, updated_at";
const ACTION_COLUMNS: &str =
    "id, name, description, category, is_static, is_active, created_at, updated_at";
const RESOURCE_COLUMNS: &str = "id, name, description, resource_type, parent_id, owner, \
     is_active, created_at, updated_at";
const USER_COLUMNS: &str = "id, username AS name, is_active, created_at, updated_at";
const LINK_COLUMNS: &str = "id, role_id, permission_id, is_active, created_at, updated_at";
const USER_ROLE_COLUMNS: &str = "id, user_id, role_id, is_active, created_at, updated_at";

fn role_from_row(row: &PgRow) -> Result<Role, sqlx::Error> {
    Ok(Role {
        id: RoleId::from_uuid(row.try_get("id")?),
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        source: row.try_get("source")?,
        parent_id: row.try_get::<Option<Uuid>, _>("parent_id")?.map(RoleId::from_uuid),
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn permission_from_row(row: &PgRow) -> Result<Permission, sqlx::Error> {
    let effect: String = row.try_get("effect")?;
    Ok(Permission {
        id: PermissionId::from_uuid(row.try_get("id")?),
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        resource: row.try_get("resource")?,
        effect: Effect::parse(&effect).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        actions: row.try_get("actions")?,
        source: row.try_get("source")?,
        valid_start: row.try_get("valid_start")?,
        valid_end: row.try_get("valid_end")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn action_from_row(row: &PgRow) -> Result<Action, sqlx::Error> {
    let category: String = row.try_get("category")?;
    Ok(Action {
        id: ActionId::from_uuid(row.try_get("id")?),
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        category: ActionCategory::parse(&category)
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        is_static: row.try_get("is_static")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn resource_from_row(row: &PgRow) -> Result<Resource, sqlx::Error> {
    Ok(Resource {
        id: ResourceId::from_uuid(row.try_get("id")?),
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        resource_type: row.try_get("resource_type")?,
        parent_id: row.try_get::<Option<Uuid>, _>("parent_id")?.map(ResourceId::from_uuid),
        owner: row.try_get("owner")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn user_from_row(row: &PgRow) -> Result<User, sqlx::Error> {
    Ok(User {
        id: UserId::from_uuid(row.try_get("id")?),
        username: row.try_get("name")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn link_from_row(row: &PgRow) -> Result<RolePermission, sqlx::Error> {
    Ok(RolePermission {
        id: RolePermissionId::from_uuid(row.try_get("id")?),
        role_id: RoleId::from_uuid(row.try_get("role_id")?),
        permission_id: PermissionId::from_uuid(row.try_get("permission_id")?),
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn user_role_from_row(row: &PgRow) -> Result<UserRole, sqlx::Error> {
    Ok(UserRole {
        id: UserRoleId::from_uuid(row.try_get("id")?),
        user_id: UserId::from_uuid(row.try_get("user_id")?),
        role_id: RoleId::from_uuid(row.try_get("role_id")?),
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared queries over the named tables
// ─────────────────────────────────────────────────────────────────────────────

/// Static description of a named, soft-deletable table.
struct Table<T> {
    entity: &'static str,
    table: &'static str,
    name_column: &'static str,
    /// Column that must be unique among active rows.
    key_column: &'static str,
    key_of: fn(&str) -> String,
    columns: &'static str,
    from_row: fn(&PgRow) -> Result<T, sqlx::Error>,
}

const ROLES: Table<Role> = Table {
    entity: "role",
    table: "roles",
    name_column: "name",
    key_column: "policy_key",
    key_of: policy_identifier,
    columns: ROLE_COLUMNS,
    from_row: role_from_row,
};

const PERMISSIONS: Table<Permission> = Table {
    entity: "permission",
    table: "permissions",
    name_column: "name",
    key_column: "policy_key",
    key_of: policy_identifier,
    columns: PERMISSION_COLUMNS,
    from_row: permission_from_row,
};

const ACTIONS: Table<Action> = Table {
    entity: "action",
    table: "actions",
    name_column: "name",
    key_column: "policy_key",
    key_of: policy_identifier,
    columns: ACTION_COLUMNS,
    from_row: action_from_row,
};

const RESOURCES: Table<Resource> = Table {
    entity: "resource",
    table: "resources",
    name_column: "name",
    key_column: "name",
    key_of: exact_name,
    columns: RESOURCE_COLUMNS,
    from_row: resource_from_row,
};

const USERS: Table<User> = Table {
    entity: "user",
    table: "users",
    name_column: "username",
    key_column: "username",
    key_of: exact_name,
    columns: USER_COLUMNS,
    from_row: user_from_row,
};

fn exact_name(name: &str) -> String {
    name.to_string()
}

impl<T> Table<T> {
    fn map(&self, row: &PgRow) -> RepoResult<T> {
        (self.from_row)(row).map_err(|e| row_error(self.entity, e))
    }

    fn conflict(&self, name: &str) -> RepositoryError {
        RepositoryError::Conflict(format!("{} '{}' already exists", self.entity, name))
    }

    fn conflict_with(&self, name: &str, holder: &str) -> RepositoryError {
        if holder == name {
            return self.conflict(name);
        }
        RepositoryError::Conflict(format!(
            "{} '{}' maps to the same policy identifier as '{}'",
            self.entity, name, holder
        ))
    }
}

impl PostgresRbacStore {
    async fn fetch_by_id<T>(&self, table: &Table<T>, id: Uuid) -> RepoResult<T> {
        let sql = format!("SELECT {} FROM {} WHERE id = $1", table.columns, table.table);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_by_id", e))?
            .ok_or_else(|| RepositoryError::not_found(table.entity, id))?;
        table.map(&row)
    }

    async fn fetch_by_id_for_update<T>(
        &self,
        tx: &mut PgConnection,
        table: &Table<T>,
        id: Uuid,
    ) -> RepoResult<T> {
        let sql = format!(
            "SELECT {} FROM {} WHERE id = $1 FOR UPDATE",
            table.columns, table.table
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(tx)
            .await
            .map_err(|e| map_sqlx_error("fetch_for_update", e))?
            .ok_or_else(|| RepositoryError::not_found(table.entity, id))?;
        table.map(&row)
    }

    async fn fetch_by_name<T>(&self, table: &Table<T>, name: &str) -> RepoResult<T> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = $1 AND is_active",
            table.columns, table.table, table.name_column
        );
        let row = sqlx::query(&sql)
            .bind(name)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_by_name", e))?
            .ok_or_else(|| RepositoryError::not_found(table.entity, name))?;
        table.map(&row)
    }

    async fn fetch_list<T>(
        &self,
        table: &Table<T>,
        filter: &ListFilter,
        page: Pagination,
    ) -> RepoResult<Vec<T>> {
        let sql = format!(
            r#"
            SELECT {} FROM {}
            WHERE ($1 OR is_active)
              AND ($2::TEXT IS NULL OR {} ILIKE $2)
            ORDER BY created_at ASC, id ASC
            OFFSET $3 LIMIT $4
            "#,
            table.columns, table.table, table.name_column
        );
        let rows = sqlx::query(&sql)
            .bind(filter.include_inactive)
            .bind(filter.name_contains.as_deref().map(like_pattern))
            .bind(page.offset as i64)
            .bind(page.limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list", e))?;

        Span::current().record("rows", rows.len());
        rows.iter().map(|row| table.map(row)).collect()
    }

    async fn count_rows<T>(&self, table: &Table<T>, filter: &ListFilter) -> RepoResult<u64> {
        let sql = format!(
            r#"
            SELECT COUNT(*) AS total FROM {}
            WHERE ($1 OR is_active)
              AND ($2::TEXT IS NULL OR {} ILIKE $2)
            "#,
            table.table, table.name_column
        );
        let row = sqlx::query(&sql)
            .bind(filter.include_inactive)
            .bind(filter.name_contains.as_deref().map(like_pattern))
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count", e))?;
        let total: i64 = row.try_get("total").map_err(|e| row_error(table.entity, e))?;
        Ok(total.max(0) as u64)
    }

    async fn ensure_name_free<T>(&self, table: &Table<T>, name: &str) -> RepoResult<()> {
        let name = name.trim();
        let sql = format!(
            "SELECT {} AS holder FROM {} WHERE {} = $1 AND is_active LIMIT 1",
            table.name_column, table.table, table.key_column
        );
        let row = sqlx::query(&sql)
            .bind((table.key_of)(name))
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("check_exists", e))?;
        let Some(row) = row else {
            return Ok(());
        };
        let holder: String = row.try_get("holder").map_err(|e| row_error(table.entity, e))?;
        Err(table.conflict_with(name, &holder))
    }

    async fn deactivate<T>(&self, table: &Table<T>, id: Uuid) -> RepoResult<()> {
        let sql = format!(
            "UPDATE {} SET is_active = FALSE, updated_at = NOW() WHERE id = $1",
            table.table
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("soft_delete", e))?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::not_found(table.entity, id));
        }
        Ok(())
    }

    /// Lock the row, apply `patch` in domain code and return the open
    /// transaction. Dropping the transaction without commit rolls it back.
    async fn lock_and_patch<T, F>(
        &self,
        table: &Table<T>,
        id: Uuid,
        patch: F,
    ) -> RepoResult<(Transaction<'static, Postgres>, T)>
    where
        F: FnOnce(&mut T) -> DomainResult<()> + Send,
    {
        let mut tx = self.begin().await?;
        let mut row = self.fetch_by_id_for_update(&mut *tx, table, id).await?;
        if let Err(e) = patch(&mut row) {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(e.into());
        }
        Ok((tx, row))
    }
}

async fn commit(tx: Transaction<'static, Postgres>) -> RepoResult<()> {
    tx.commit()
        .await
        .map_err(|e| map_sqlx_error("commit_transaction", e))
}

fn map_write_error<T>(table: &Table<T>, name: &str, e: sqlx::Error) -> RepositoryError {
    if is_unique_violation(&e) {
        table.conflict(name)
    } else {
        map_sqlx_error("write", e)
    }
}

async fn write_role(conn: &mut PgConnection, r: &Role) -> RepoResult<()> {
    sqlx::query(
        r#"
        UPDATE roles
        SET name = $2, description = $3, source = $4, parent_id = $5,
            is_active = $6, updated_at = $7, policy_key = $8
        WHERE id = $1
        "#,
    )
    .bind(r.id.as_uuid())
    .bind(&r.name)
    .bind(&r.description)
    .bind(&r.source)
    .bind(r.parent_id.map(Uuid::from))
    .bind(r.is_active)
    .bind(r.updated_at)
    .bind(policy_identifier(&r.name))
    .execute(conn)
    .await
    .map_err(|e| map_write_error(&ROLES, &r.name, e))?;
    Ok(())
}

async fn write_permission(conn: &mut PgConnection, p: &Permission) -> RepoResult<()> {
    sqlx::query(
        r#"
        UPDATE permissions
        SET name = $2, description = $3, resource = $4, effect = $5, actions = $6,
            source = $7, valid_start = $8, valid_end = $9, is_active = $10,
            updated_at = $11, policy_key = $12
        WHERE id = $1
        "#,
    )
    .bind(p.id.as_uuid())
    .bind(&p.name)
    .bind(&p.description)
    .bind(&p.resource)
    .bind(p.effect.as_str())
    .bind(&p.actions)
    .bind(&p.source)
    .bind(p.valid_start)
    .bind(p.valid_end)
    .bind(p.is_active)
    .bind(p.updated_at)
    .bind(policy_identifier(&p.name))
    .execute(conn)
    .await
    .map_err(|e| map_write_error(&PERMISSIONS, &p.name, e))?;
    Ok(())
}

async fn write_action(conn: &mut PgConnection, a: &Action) -> RepoResult<()> {
    sqlx::query(
        r#"
        UPDATE actions
        SET name = $2, description = $3, category = $4, is_active = $5, updated_at = $6,
            policy_key = $7
        WHERE id = $1
        "#,
    )
    .bind(a.id.as_uuid())
    .bind(&a.name)
    .bind(&a.description)
    .bind(a.category.as_str())
    .bind(a.is_active)
    .bind(a.updated_at)
    .bind(policy_identifier(&a.name))
    .execute(conn)
    .await
    .map_err(|e| map_write_error(&ACTIONS, &a.name, e))?;
    Ok(())
}

async fn write_resource(conn: &mut PgConnection, r: &Resource) -> RepoResult<()> {
    sqlx::query(
        r#"
        UPDATE resources
        SET name = $2, description = $3, resource_type = $4, parent_id = $5, owner = $6,
            is_active = $7, updated_at = $8
        WHERE id = $1
        "#,
    )
    .bind(r.id.as_uuid())
    .bind(&r.name)
    .bind(&r.description)
    .bind(&r.resource_type)
    .bind(r.parent_id.map(Uuid::from))
    .bind(&r.owner)
    .bind(r.is_active)
    .bind(r.updated_at)
    .execute(conn)
    .await
    .map_err(|e| map_write_error(&RESOURCES, &r.name, e))?;
    Ok(())
}

async fn write_user(conn: &mut PgConnection, u: &User) -> RepoResult<()> {
    sqlx::query("UPDATE users SET username = $2, is_active = $3, updated_at = $4 WHERE id = $1")
        .bind(u.id.as_uuid())
        .bind(&u.username)
        .bind(u.is_active)
        .bind(u.updated_at)
        .execute(conn)
        .await
        .map_err(|e| map_write_error(&USERS, &u.username, e))?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Named entities
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
impl RoleRepository for PostgresRbacStore {
    #[instrument(skip(self, role), fields(name = %role.name), err)]
    async fn create_role(&self, role: Role) -> RepoResult<Role> {
        sqlx::query(
            r#"
            INSERT INTO roles (
                id, name, description, source, parent_id, is_active, created_at, updated_at,
                policy_key
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(role.id.as_uuid())
        .bind(&role.name)
        .bind(&role.description)
        .bind(&role.source)
        .bind(role.parent_id.map(Uuid::from))
        .bind(role.is_active)
        .bind(role.created_at)
        .bind(role.updated_at)
        .bind(policy_identifier(&role.name))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_write_error(&ROLES, &role.name, e))?;
        Ok(role)
    }

    #[instrument(skip(self), err)]
    async fn get_role(&self, id: RoleId) -> RepoResult<Role> {
        self.fetch_by_id(&ROLES, id.into()).await
    }

    #[instrument(skip(self), err)]
    async fn get_role_by_name(&self, name: &str) -> RepoResult<Role> {
        self.fetch_by_name(&ROLES, name).await
    }

    #[instrument(skip(self, patch), err)]
    async fn update_role(&self, id: RoleId, patch: RolePatch) -> RepoResult<Role> {
        if let Some(Some(parent)) = patch.parent_id {
            self.fetch_by_id(&ROLES, parent.into()).await?;
        }
        let now = chrono::Utc::now();
        let (mut tx, row) = self
            .lock_and_patch(&ROLES, id.into(), |r| r.apply(patch, now))
            .await?;
        write_role(&mut tx, &row).await?;
        commit(tx).await?;
        Ok(row)
    }

    #[instrument(skip(self), err)]
    async fn soft_delete_role(&self, id: RoleId) -> RepoResult<()> {
        self.deactivate(&ROLES, id.into()).await
    }

    #[instrument(skip(self), fields(rows), err)]
    async fn list_roles(&self, filter: &ListFilter, page: Pagination) -> RepoResult<Vec<Role>> {
        self.fetch_list(&ROLES, filter, page).await
    }

    #[instrument(skip(self), err)]
    async fn count_roles(&self, filter: &ListFilter) -> RepoResult<u64> {
        self.count_rows(&ROLES, filter).await
    }

    #[instrument(skip(self), err)]
    async fn check_role_exists(&self, name: &str) -> RepoResult<()> {
        self.ensure_name_free(&ROLES, name).await
    }
}

#[async_trait]
impl PermissionRepository for PostgresRbacStore {
    #[instrument(skip(self, permission), fields(name = %permission.name), err)]
    async fn create_permission(&self, permission: Permission) -> RepoResult<Permission> {
        sqlx::query(
            r#"
            INSERT INTO permissions (
                id, name, description, resource, effect, actions, source,
                valid_start, valid_end, is_active, created_at, updated_at, policy_key
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(permission.id.as_uuid())
        .bind(&permission.name)
        .bind(&permission.description)
        .bind(&permission.resource)
        .bind(permission.effect.as_str())
        .bind(&permission.actions)
        .bind(&permission.source)
        .bind(permission.valid_start)
        .bind(permission.valid_end)
        .bind(permission.is_active)
        .bind(permission.created_at)
        .bind(permission.updated_at)
        .bind(policy_identifier(&permission.name))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_write_error(&PERMISSIONS, &permission.name, e))?;
        Ok(permission)
    }

    #[instrument(skip(self), err)]
    async fn get_permission(&self, id: PermissionId) -> RepoResult<Permission> {
        self.fetch_by_id(&PERMISSIONS, id.into()).await
    }

    #[instrument(skip(self), err)]
    async fn get_permission_by_name(&self, name: &str) -> RepoResult<Permission> {
        self.fetch_by_name(&PERMISSIONS, name).await
    }

    #[instrument(skip(self, patch), err)]
    async fn update_permission(
        &self,
        id: PermissionId,
        patch: PermissionPatch,
    ) -> RepoResult<Permission> {
        let now = chrono::Utc::now();
        let (mut tx, row) = self
            .lock_and_patch(&PERMISSIONS, id.into(), |p| p.apply(patch, now))
            .await?;
        write_permission(&mut tx, &row).await?;
        commit(tx).await?;
        Ok(row)
    }

    #[instrument(skip(self), err)]
    async fn soft_delete_permission(&self, id: PermissionId) -> RepoResult<()> {
        self.deactivate(&PERMISSIONS, id.into()).await
    }

    #[instrument(skip(self), fields(rows), err)]
    async fn list_permissions(
        &self,
        filter: &ListFilter,
        page: Pagination,
    ) -> RepoResult<Vec<Permission>> {
        self.fetch_list(&PERMISSIONS, filter, page).await
    }

    #[instrument(skip(self), err)]
    async fn count_permissions(&self, filter: &ListFilter) -> RepoResult<u64> {
        self.count_rows(&PERMISSIONS, filter).await
    }

    #[instrument(skip(self), err)]
    async fn check_permission_exists(&self, name: &str) -> RepoResult<()> {
        self.ensure_name_free(&PERMISSIONS, name).await
    }
}

#[async_trait]
impl ActionRepository for PostgresRbacStore {
    #[instrument(skip(self, action), fields(name = %action.name), err)]
    async fn create_action(&self, action: Action) -> RepoResult<Action> {
        sqlx::query(
            r#"
            INSERT INTO actions (
                id, name, description, category, is_static, is_active, created_at, updated_at,
                policy_key
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(action.id.as_uuid())
        .bind(&action.name)
        .bind(&action.description)
        .bind(action.category.as_str())
        .bind(action.is_static)
        .bind(action.is_active)
        .bind(action.created_at)
        .bind(action.updated_at)
        .bind(policy_identifier(&action.name))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_write_error(&ACTIONS, &action.name, e))?;
        Ok(action)
    }

    #[instrument(skip(self), err)]
    async fn get_action(&self, id: ActionId) -> RepoResult<Action> {
        self.fetch_by_id(&ACTIONS, id.into()).await
    }

    #[instrument(skip(self), err)]
    async fn get_action_by_name(&self, name: &str) -> RepoResult<Action> {
        self.fetch_by_name(&ACTIONS, name).await
    }

    #[instrument(skip(self, patch), err)]
    async fn update_action(&self, id: ActionId, patch: ActionPatch) -> RepoResult<Action> {
        let now = chrono::Utc::now();
        let (mut tx, row) = self
            .lock_and_patch(&ACTIONS, id.into(), |a| a.apply(patch, now))
            .await?;
        write_action(&mut tx, &row).await?;
        commit(tx).await?;
        Ok(row)
    }

    #[instrument(skip(self), err)]
    async fn soft_delete_action(&self, id: ActionId) -> RepoResult<()> {
        self.deactivate(&ACTIONS, id.into()).await
    }

    #[instrument(skip(self), fields(rows), err)]
    async fn list_actions(&self, filter: &ListFilter, page: Pagination) -> RepoResult<Vec<Action>> {
        self.fetch_list(&ACTIONS, filter, page).await
    }

    #[instrument(skip(self), err)]
    async fn count_actions(&self, filter: &ListFilter) -> RepoResult<u64> {
        self.count_rows(&ACTIONS, filter).await
    }

    #[instrument(skip(self), err)]
    async fn check_action_exists(&self, name: &str) -> RepoResult<()> {
        self.ensure_name_free(&ACTIONS, &name.trim().to_lowercase())
            .await
    }
}

#[async_trait]
impl ResourceRepository for PostgresRbacStore {
    #[instrument(skip(self, resource), fields(name = %resource.name), err)]
    async fn create_resource(&self, resource: Resource) -> RepoResult<Resource> {
        sqlx::query(
            r#"
            INSERT INTO resources (
                id, name, description, resource_type, parent_id, owner,
                is_active, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(resource.id.as_uuid())
        .bind(&resource.name)
        .bind(&resource.description)
        .bind(&resource.resource_type)
        .bind(resource.parent_id.map(Uuid::from))
        .bind(&resource.owner)
        .bind(resource.is_active)
        .bind(resource.created_at)
        .bind(resource.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_write_error(&RESOURCES, &resource.name, e))?;
        Ok(resource)
    }

    #[instrument(skip(self), err)]
    async fn get_resource(&self, id: ResourceId) -> RepoResult<Resource> {
        self.fetch_by_id(&RESOURCES, id.into()).await
    }

    #[instrument(skip(self), err)]
    async fn get_resource_by_name(&self, name: &str) -> RepoResult<Resource> {
        self.fetch_by_name(&RESOURCES, name).await
    }

    #[instrument(skip(self, patch), err)]
    async fn update_resource(&self, id: ResourceId, patch: ResourcePatch) -> RepoResult<Resource> {
        let now = chrono::Utc::now();
        let (mut tx, row) = self
            .lock_and_patch(&RESOURCES, id.into(), |r| r.apply(patch, now))
            .await?;
        write_resource(&mut tx, &row).await?;
        commit(tx).await?;
        Ok(row)
    }

    #[instrument(skip(self), err)]
    async fn soft_delete_resource(&self, id: ResourceId) -> RepoResult<()> {
        self.deactivate(&RESOURCES, id.into()).await
    }

    #[instrument(skip(self), fields(rows), err)]
    async fn list_resources(
        &self,
        filter: &ListFilter,
        page: Pagination,
    ) -> RepoResult<Vec<Resource>> {
        self.fetch_list(&RESOURCES, filter, page).await
    }

    #[instrument(skip(self), err)]
    async fn count_resources(&self, filter: &ListFilter) -> RepoResult<u64> {
        self.count_rows(&RESOURCES, filter).await
    }

    #[instrument(skip(self), err)]
    async fn check_resource_exists(&self, name: &str) -> RepoResult<()> {
        self.ensure_name_free(&RESOURCES, name).await
    }
}

#[async_trait]
impl UserRepository for PostgresRbacStore {
    #[instrument(skip(self, user), fields(username = %user.username), err)]
    async fn create_user(&self, user: User) -> RepoResult<User> {
        sqlx::query(
            r#"
            INSERT INTO users (id, username, is_active, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(user.id.as_uuid())
        .bind(&user.username)
        .bind(user.is_active)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_write_error(&USERS, &user.username, e))?;
        Ok(user)
    }

    #[instrument(skip(self), err)]
    async fn get_user(&self, id: UserId) -> RepoResult<User> {
        self.fetch_by_id(&USERS, id.into()).await
    }

    #[instrument(skip(self), err)]
    async fn get_user_by_username(&self, username: &str) -> RepoResult<User> {
        self.fetch_by_name(&USERS, username).await
    }

    #[instrument(skip(self, patch), err)]
    async fn update_user(&self, id: UserId, patch: UserPatch) -> RepoResult<User> {
        let now = chrono::Utc::now();
        let (mut tx, row) = self
            .lock_and_patch(&USERS, id.into(), |u| u.apply(patch, now))
            .await?;
        write_user(&mut tx, &row).await?;
        commit(tx).await?;
        Ok(row)
    }

    #[instrument(skip(self), err)]
    async fn soft_delete_user(&self, id: UserId) -> RepoResult<()> {
        self.deactivate(&USERS, id.into()).await
    }

    #[instrument(skip(self), fields(rows), err)]
    async fn list_users(&self, filter: &ListFilter, page: Pagination) -> RepoResult<Vec<User>> {
        self.fetch_list(&USERS, filter, page).await
    }

    #[instrument(skip(self), err)]
    async fn count_users(&self, filter: &ListFilter) -> RepoResult<u64> {
        self.count_rows(&USERS, filter).await
    }

    #[instrument(skip(self), err)]
    async fn check_user_exists(&self, username: &str) -> RepoResult<()> {
        self.ensure_name_free(&USERS, username).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Links
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
impl RolePermissionRepository for PostgresRbacStore {
    #[instrument(skip(self, links), fields(count = links.len()), err)]
    async fn create_role_permissions(
        &self,
        links: Vec<RolePermission>,
    ) -> RepoResult<Vec<RolePermission>> {
        if links.is_empty() {
            return Ok(links);
        }

        let mut tx = self.begin().await?;
        for link in &links {
            let inserted = sqlx::query(
                r#"
                INSERT INTO role_permissions (id, role_id, permission_id, is_active, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(link.id.as_uuid())
            .bind(link.role_id.as_uuid())
            .bind(link.permission_id.as_uuid())
            .bind(link.is_active)
            .bind(link.created_at)
            .bind(link.updated_at)
            .execute(&mut *tx)
            .await;

            if let Err(e) = inserted {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(if is_unique_violation(&e) {
                    RepositoryError::Conflict(format!(
                        "permission {} is already assigned to role {}",
                        link.permission_id, link.role_id
                    ))
                } else {
                    map_sqlx_error("insert_role_permission", e)
                });
            }
        }
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(links)
    }

    #[instrument(skip(self), err)]
    async fn get_role_permission(&self, id: RolePermissionId) -> RepoResult<RolePermission> {
        let sql = format!("SELECT {LINK_COLUMNS} FROM role_permissions WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_role_permission", e))?
            .ok_or_else(|| RepositoryError::not_found("role_permission", id))?;
        link_from_row(&row).map_err(|e| row_error("role_permission", e))
    }

    #[instrument(skip(self), err)]
    async fn find_active_role_permission(
        &self,
        role_id: RoleId,
        permission_id: PermissionId,
    ) -> RepoResult<Option<RolePermission>> {
        let sql = format!(
            "SELECT {LINK_COLUMNS} FROM role_permissions \
             WHERE role_id = $1 AND permission_id = $2 AND is_active"
        );
        let row = sqlx::query(&sql)
            .bind(role_id.as_uuid())
            .bind(permission_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_active_role_permission", e))?;
        row.map(|r| link_from_row(&r).map_err(|e| row_error("role_permission", e)))
            .transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_role_permissions(&self, role_id: RoleId) -> RepoResult<Vec<RolePermissionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT
                rp.id AS link_id,
                rp.role_id AS link_role_id,
                rp.permission_id AS link_permission_id,
                rp.is_active AS link_is_active,
                rp.created_at AS link_created_at,
                rp.updated_at AS link_updated_at,
                p.id, p.name, p.description, p.resource, p.effect, p.actions, p.source,
                p.valid_start, p.valid_end, p.is_active, p.created_at, p.updated_at
            FROM role_permissions rp
            LEFT JOIN permissions p ON p.id = rp.permission_id AND p.is_active
            WHERE rp.role_id = $1
            ORDER BY rp.created_at ASC, rp.id ASC
            "#,
        )
        .bind(role_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_role_permissions", e))?;

        rows.iter()
            .map(|row| -> Result<RolePermissionRecord, sqlx::Error> {
                let link = RolePermission {
                    id: RolePermissionId::from_uuid(row.try_get("link_id")?),
                    role_id: RoleId::from_uuid(row.try_get("link_role_id")?),
                    permission_id: PermissionId::from_uuid(row.try_get("link_permission_id")?),
                    is_active: row.try_get("link_is_active")?,
                    created_at: row.try_get("link_created_at")?,
                    updated_at: row.try_get("link_updated_at")?,
                };
                let joined: Option<Uuid> = row.try_get("id")?;
                let permission = match joined {
                    Some(_) => Some(permission_from_row(row)?),
                    None => None,
                };
                Ok(RolePermissionRecord { link, permission })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| row_error("role_permission", e))
    }

    #[instrument(skip(self), err)]
    async fn count_role_permissions(&self, role_id: RoleId) -> RepoResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM role_permissions WHERE role_id = $1")
            .bind(role_id.as_uuid())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_role_permissions", e))?;
        let total: i64 = row.try_get("total").map_err(|e| row_error("role_permission", e))?;
        Ok(total.max(0) as u64)
    }

    #[instrument(skip(self), err)]
    async fn list_roles_by_permission(&self, permission_id: PermissionId) -> RepoResult<Vec<RoleId>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT role_id FROM role_permissions
            WHERE permission_id = $1 AND is_active
            ORDER BY role_id
            "#,
        )
        .bind(permission_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_roles_by_permission", e))?;
        rows.iter()
            .map(|row| row.try_get::<Uuid, _>("role_id").map(RoleId::from_uuid))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| row_error("role_permission", e))
    }

    #[instrument(skip(self), err)]
    async fn delete_role_permissions_by_role(&self, role_id: RoleId) -> RepoResult<u64> {
        let result = sqlx::query("DELETE FROM role_permissions WHERE role_id = $1")
            .bind(role_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_role_permissions_by_role", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn delete_role_permissions_by_permission(
        &self,
        permission_id: PermissionId,
    ) -> RepoResult<u64> {
        let result = sqlx::query("DELETE FROM role_permissions WHERE permission_id = $1")
            .bind(permission_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_role_permissions_by_permission", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn delete_role_permission(&self, id: RolePermissionId) -> RepoResult<()> {
        let result = sqlx::query("DELETE FROM role_permissions WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_role_permission", e))?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::not_found("role_permission", id));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn delete_role_permission_link(
        &self,
        role_id: RoleId,
        permission_id: PermissionId,
    ) -> RepoResult<()> {
        let result =
            sqlx::query("DELETE FROM role_permissions WHERE role_id = $1 AND permission_id = $2")
                .bind(role_id.as_uuid())
                .bind(permission_id.as_uuid())
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("delete_role_permission_link", e))?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::not_found(
                "role_permission",
                format!("{role_id}/{permission_id}"),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl UserRoleRepository for PostgresRbacStore {
    #[instrument(skip(self, link), fields(user_id = %link.user_id, role_id = %link.role_id), err)]
    async fn create_user_role(&self, link: UserRole) -> RepoResult<UserRole> {
        sqlx::query(
            r#"
            INSERT INTO user_roles (id, user_id, role_id, is_active, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(link.id.as_uuid())
        .bind(link.user_id.as_uuid())
        .bind(link.role_id.as_uuid())
        .bind(link.is_active)
        .bind(link.created_at)
        .bind(link.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                RepositoryError::Conflict(format!(
                    "user {} already holds role {}",
                    link.user_id, link.role_id
                ))
            } else {
                map_sqlx_error("create_user_role", e)
            }
        })?;
        Ok(link)
    }

    #[instrument(skip(self), err)]
    async fn list_user_roles_by_role(&self, role_id: RoleId) -> RepoResult<Vec<UserRole>> {
        let sql = format!(
            "SELECT {USER_ROLE_COLUMNS} FROM user_roles WHERE role_id = $1 ORDER BY created_at, id"
        );
        let rows = sqlx::query(&sql)
            .bind(role_id.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_user_roles_by_role", e))?;
        rows.iter()
            .map(|r| user_role_from_row(r).map_err(|e| row_error("user_role", e)))
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn list_user_roles_by_user(&self, user_id: UserId) -> RepoResult<Vec<UserRole>> {
        let sql = format!(
            "SELECT {USER_ROLE_COLUMNS} FROM user_roles WHERE user_id = $1 ORDER BY created_at, id"
        );
        let rows = sqlx::query(&sql)
            .bind(user_id.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_user_roles_by_user", e))?;
        rows.iter()
            .map(|r| user_role_from_row(r).map_err(|e| row_error("user_role", e)))
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn delete_user_roles_by_role(&self, role_id: RoleId) -> RepoResult<u64> {
        let result = sqlx::query("DELETE FROM user_roles WHERE role_id = $1")
            .bind(role_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_user_roles_by_role", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn delete_user_role(&self, user_id: UserId, role_id: RoleId) -> RepoResult<()> {
        let result = sqlx::query("DELETE FROM user_roles WHERE user_id = $1 AND role_id = $2")
            .bind(user_id.as_uuid())
            .bind(role_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_user_role", e))?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::not_found(
                "user_role",
                format!("{user_id}/{role_id}"),
            ));
        }
        Ok(())
    }
}
