//! `warden-core`: shared primitives for the authorization workspace.
//!
//! Identifiers, the domain error model, the entity trait and list paging.
//! No IO lives here.

pub mod entity;
pub mod error;
pub mod id;
pub mod pagination;

pub use entity::{Entity, Named};
pub use error::{DomainError, DomainResult};
pub use id::{ActionId, PermissionId, ResourceId, RoleId, RolePermissionId, UserId, UserRoleId};
pub use pagination::{ListFilter, Pagination};
