//! Policy engine client boundary.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::PolicyResult;
use crate::relationship::{ObjectRef, Relationship, SubjectRef};
use crate::schema::SchemaDefinition;

/// Operations the synchronizers need from the external policy engine.
///
/// Relationship creation is idempotent (touch semantics): writing a tuple
/// that already exists is not an error.
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    /// Replace the engine's schema wholesale.
    async fn update_schema(&self, schema: &SchemaDefinition) -> PolicyResult<()>;

    /// Current schema document as text.
    async fn read_schema(&self) -> PolicyResult<String>;

    async fn create_relationship(&self, relationship: &Relationship) -> PolicyResult<()> {
        self.create_relationships(std::slice::from_ref(relationship)).await
    }

    /// Write all tuples in one request; either all are written or none.
    async fn create_relationships(&self, relationships: &[Relationship]) -> PolicyResult<()>;

    async fn delete_relationship(&self, relationship: &Relationship) -> PolicyResult<()> {
        self.delete_relationships(std::slice::from_ref(relationship)).await
    }

    /// Delete exactly these tuples. Missing tuples are ignored.
    async fn delete_relationships(&self, relationships: &[Relationship]) -> PolicyResult<()>;

    /// Delete every tuple on `resource_type` whose subject is `subject`.
    async fn delete_subject_relationships(
        &self,
        resource_type: &str,
        subject: &SubjectRef,
    ) -> PolicyResult<()>;

    async fn check_permission(
        &self,
        subject: &SubjectRef,
        permission: &str,
        resource: &ObjectRef,
    ) -> PolicyResult<bool>;
}

#[async_trait]
impl<P> PolicyEngine for Arc<P>
where
    P: PolicyEngine + ?Sized,
{
    async fn update_schema(&self, schema: &SchemaDefinition) -> PolicyResult<()> {
        (**self).update_schema(schema).await
    }

    async fn read_schema(&self) -> PolicyResult<String> {
        (**self).read_schema().await
    }

    async fn create_relationship(&self, relationship: &Relationship) -> PolicyResult<()> {
        (**self).create_relationship(relationship).await
    }

    async fn create_relationships(&self, relationships: &[Relationship]) -> PolicyResult<()> {
        (**self).create_relationships(relationships).await
    }

    async fn delete_relationship(&self, relationship: &Relationship) -> PolicyResult<()> {
        (**self).delete_relationship(relationship).await
    }

    async fn delete_relationships(&self, relationships: &[Relationship]) -> PolicyResult<()> {
        (**self).delete_relationships(relationships).await
    }

    async fn delete_subject_relationships(
        &self,
        resource_type: &str,
        subject: &SubjectRef,
    ) -> PolicyResult<()> {
        (**self).delete_subject_relationships(resource_type, subject).await
    }

    async fn check_permission(
        &self,
        subject: &SubjectRef,
        permission: &str,
        resource: &ObjectRef,
    ) -> PolicyResult<bool> {
        (**self).check_permission(subject, permission, resource).await
    }
}
