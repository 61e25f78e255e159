//! Persistence for the RBAC graph: repository traits, the in-memory and
//! Postgres stores, and the TTL cache abstraction.

pub mod cache;
pub mod in_memory;
pub mod postgres;
pub mod repo;

pub use cache::{InMemoryTtlCache, KeyValueCache};
pub use in_memory::InMemoryRbacStore;
pub use postgres::{MIGRATOR, PostgresRbacStore};
pub use repo::{
    ActionRepository, PermissionRepository, RbacStore, RepoResult, RepositoryError,
    ResourceRepository, RolePermissionRepository, RoleRepository, UserRepository,
    UserRoleRepository,
};
