//! Keeps the external policy engine in step with the relational RBAC graph.
//!
//! - [`schema_sync`] derives the engine schema and pushes it.
//! - [`relationship_sync`] rebuilds per-user relationship tuples.
//! - [`projection`] works out which users a change affects and what they hold.
//! - [`assignment`] and [`admin`] are the mutating entry points; both write
//!   the relational store first and synchronize afterwards.

pub mod admin;
pub mod assignment;
pub mod config;
mod deadline;
pub mod error;
mod listing;
pub mod pipeline;
pub mod projection;
pub mod relationship_sync;
pub mod response;
pub mod schema_sync;

pub use admin::{RbacAdminService, Synced};
pub use assignment::{AssignmentResult, AssignmentService};
pub use config::{ConfigError, SyncConfig, SyncSettings};
pub use error::{ServiceError, ServiceResult, StatusCode};
pub use pipeline::{ResyncResult, SyncPipeline};
pub use projection::RoleProjector;
pub use relationship_sync::{
    ReconciliationReport, RelationshipSynchronizer, UserGrants, UserSyncOutcome,
};
pub use response::{AdminResponse, Page};
pub use schema_sync::{
    FALLBACK_ACTION, FALLBACK_PERMISSION, FALLBACK_ROLE, SchemaPushStatus, SchemaSyncOutcome,
    SchemaSynchronizer,
};
