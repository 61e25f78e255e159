//! RBAC domain model.
//!
//! Roles, permissions, actions and resources plus the link entities that tie
//! them to each other and to users. Pure domain logic: validation and
//! invariants only, no IO.

pub mod action;
pub mod names;
pub mod permission;
pub mod resource;
pub mod role;
pub mod role_permission;
pub mod user;
pub mod user_role;
pub mod view;

pub use action::{Action, ActionCategory, ActionPatch, NewAction};
pub use names::NameSet;
pub use permission::{Effect, NewPermission, Permission, PermissionPatch};
pub use resource::{NewResource, Resource, ResourcePatch};
pub use role::{NewRole, Role, RolePatch};
pub use role_permission::{RolePermission, RolePermissionRecord};
pub use user::{User, UserPatch};
pub use user_role::UserRole;
pub use view::{PermissionView, RolePermissionsView, RoleSummary};
