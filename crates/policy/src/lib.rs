//! Policy engine boundary.
//!
//! The access-decision engine is external; this crate owns what we send it:
//! the schema document derived from the RBAC graph, relationship tuples, and
//! the client trait with an in-memory and an HTTP implementation.

pub mod client;
pub mod error;
pub mod http;
pub mod in_memory;
pub mod relationship;
pub mod schema;

pub use client::PolicyEngine;
pub use error::{PolicyEngineError, PolicyResult};
pub use http::SpiceDbHttpClient;
pub use in_memory::InMemoryPolicyEngine;
pub use relationship::{ObjectRef, Relationship, SubjectRef};
pub use schema::{
    ResourceGrant, ResourceSchema, SchemaDefinition, build_resource_schemas, resource_identifier,
};
