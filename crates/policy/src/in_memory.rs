//! In-memory policy engine for tests and local runs.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::client::PolicyEngine;
use crate::error::{PolicyEngineError, PolicyResult};
use crate::relationship::{ObjectRef, Relationship, SubjectRef};
use crate::schema::SchemaDefinition;

/// Keeps the last written schema and a set of tuples.
///
/// Writes are validated against the current schema the way a real engine
/// would: a tuple whose relation is not declared is rejected, and a schema
/// that drops a relation still used by a tuple is refused.
#[derive(Debug, Default)]
pub struct InMemoryPolicyEngine {
    schema: RwLock<Option<SchemaDefinition>>,
    tuples: RwLock<BTreeSet<Relationship>>,
    schema_writes: AtomicUsize,
}

fn poisoned() -> PolicyEngineError {
    PolicyEngineError::State("lock poisoned".to_string())
}

impl InMemoryPolicyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of successful `update_schema` calls.
    pub fn schema_writes(&self) -> usize {
        self.schema_writes.load(Ordering::SeqCst)
    }

    pub fn current_schema(&self) -> Option<SchemaDefinition> {
        self.schema.read().ok().and_then(|s| s.clone())
    }

    pub fn relationships(&self) -> Vec<Relationship> {
        self.tuples
            .read()
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn relationships_of(&self, subject: &SubjectRef) -> Vec<Relationship> {
        self.tuples
            .read()
            .map(|t| t.iter().filter(|r| &r.subject == subject).cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PolicyEngine for InMemoryPolicyEngine {
    async fn update_schema(&self, schema: &SchemaDefinition) -> PolicyResult<()> {
        schema.validate()?;
        let tuples = self.tuples.read().map_err(|_| poisoned())?;
        if let Some(orphan) = tuples
            .iter()
            .find(|r| schema.ensure_relation(&r.resource.object_type, &r.relation).is_err())
        {
            return Err(PolicyEngineError::InvalidSchema(format!(
                "relation '{}' on '{}' still has relationships",
                orphan.relation, orphan.resource.object_type
            )));
        }
        let mut current = self.schema.write().map_err(|_| poisoned())?;
        *current = Some(schema.clone());
        self.schema_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_schema(&self) -> PolicyResult<String> {
        let current = self.schema.read().map_err(|_| poisoned())?;
        current
            .as_ref()
            .map(SchemaDefinition::render)
            .ok_or(PolicyEngineError::NoSchema)
    }

    async fn create_relationships(&self, relationships: &[Relationship]) -> PolicyResult<()> {
        // Lock order is tuples, then schema, everywhere.
        let mut tuples = self.tuples.write().map_err(|_| poisoned())?;
        {
            let schema = self.schema.read().map_err(|_| poisoned())?;
            let schema = schema.as_ref().ok_or(PolicyEngineError::NoSchema)?;
            for rel in relationships {
                schema.ensure_relation(&rel.resource.object_type, &rel.relation)?;
            }
        }
        tuples.extend(relationships.iter().cloned());
        Ok(())
    }

    async fn delete_relationships(&self, relationships: &[Relationship]) -> PolicyResult<()> {
        let mut tuples = self.tuples.write().map_err(|_| poisoned())?;
        for rel in relationships {
            tuples.remove(rel);
        }
        Ok(())
    }

    async fn delete_subject_relationships(
        &self,
        resource_type: &str,
        subject: &SubjectRef,
    ) -> PolicyResult<()> {
        let mut tuples = self.tuples.write().map_err(|_| poisoned())?;
        tuples.retain(|r| !(r.resource.object_type == resource_type && &r.subject == subject));
        Ok(())
    }

    async fn check_permission(
        &self,
        subject: &SubjectRef,
        permission: &str,
        resource: &ObjectRef,
    ) -> PolicyResult<bool> {
        let tuples = self.tuples.read().map_err(|_| poisoned())?;
        let holds = |relation: &str| {
            tuples.contains(&Relationship::new(resource.clone(), relation, subject.clone()))
        };
        if holds(permission) {
            return Ok(true);
        }

        let schema = self.schema.read().map_err(|_| poisoned())?;
        let granted_by = schema
            .as_ref()
            .and_then(|s| s.resource(&resource.object_type))
            .and_then(|r| r.permissions.get(permission));
        Ok(granted_by.is_some_and(|roles| roles.iter().any(|role| holds(role))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ResourceGrant, build_resource_schemas};
    use warden_rbac::NameSet;

    fn schema() -> SchemaDefinition {
        let roles: NameSet = ["agronomist"].into_iter().collect();
        let perms: NameSet = ["read_crop_data"].into_iter().collect();
        let actions: NameSet = ["read"].into_iter().collect();
        let grants = [ResourceGrant {
            role: "agronomist".into(),
            resource: "db_farm_crops".into(),
            actions: vec!["read".into()],
        }];
        SchemaDefinition::new("aaa", roles, perms, actions)
            .with_resources(build_resource_schemas(["db_farm_crops"], &grants))
    }

    fn alice() -> SubjectRef {
        ObjectRef::new("aaa/user", "alice")
    }

    #[tokio::test]
    async fn writes_require_a_schema() {
        let engine = InMemoryPolicyEngine::new();
        let rel = Relationship::new(ObjectRef::new("aaa/role", "global"), "agronomist", alice());
        assert_eq!(
            engine.create_relationship(&rel).await,
            Err(PolicyEngineError::NoSchema)
        );
    }

    #[tokio::test]
    async fn unknown_relations_are_rejected_atomically() {
        let engine = InMemoryPolicyEngine::new();
        engine.update_schema(&schema()).await.unwrap();
        let good = Relationship::new(ObjectRef::new("aaa/role", "global"), "agronomist", alice());
        let bad = Relationship::new(ObjectRef::new("aaa/role", "global"), "ghost", alice());
        assert!(engine.create_relationships(&[good, bad]).await.is_err());
        assert!(engine.relationships().is_empty());
    }

    #[tokio::test]
    async fn touch_is_idempotent() {
        let engine = InMemoryPolicyEngine::new();
        engine.update_schema(&schema()).await.unwrap();
        let rel = Relationship::new(ObjectRef::new("aaa/role", "global"), "agronomist", alice());
        engine.create_relationship(&rel).await.unwrap();
        engine.create_relationship(&rel).await.unwrap();
        assert_eq!(engine.relationships().len(), 1);
    }

    #[tokio::test]
    async fn check_follows_role_relations_on_resources() {
        let engine = InMemoryPolicyEngine::new();
        engine.update_schema(&schema()).await.unwrap();
        let crops = ObjectRef::new("aaa/db_farm_crops", "field_7");
        assert!(!engine.check_permission(&alice(), "read", &crops).await.unwrap());

        let rel = Relationship::new(crops.clone(), "agronomist", alice());
        engine.create_relationship(&rel).await.unwrap();
        assert!(engine.check_permission(&alice(), "read", &crops).await.unwrap());
        assert!(!engine.check_permission(&alice(), "write", &crops).await.unwrap());
    }

    #[tokio::test]
    async fn schema_with_invalid_identifier_is_rejected() {
        let engine = InMemoryPolicyEngine::new();
        let bad = SchemaDefinition::new("a", NameSet::new(), NameSet::new(), NameSet::new());
        assert!(matches!(
            engine.update_schema(&bad).await,
            Err(PolicyEngineError::InvalidSchema(_))
        ));
        assert_eq!(engine.schema_writes(), 0);
    }

    #[tokio::test]
    async fn schema_cannot_drop_a_relation_in_use() {
        let engine = InMemoryPolicyEngine::new();
        engine.update_schema(&schema()).await.unwrap();
        let rel = Relationship::new(ObjectRef::new("aaa/role", "global"), "agronomist", alice());
        engine.create_relationship(&rel).await.unwrap();

        let without_role = SchemaDefinition::new(
            "aaa",
            ["test role"].into_iter().collect(),
            ["read_crop_data"].into_iter().collect(),
            ["read"].into_iter().collect(),
        );
        assert!(matches!(
            engine.update_schema(&without_role).await,
            Err(PolicyEngineError::InvalidSchema(_))
        ));

        engine.delete_relationship(&rel).await.unwrap();
        engine.update_schema(&without_role).await.unwrap();
        assert_eq!(engine.schema_writes(), 2);
    }

    #[tokio::test]
    async fn subject_purge_is_scoped_to_type() {
        let engine = InMemoryPolicyEngine::new();
        engine.update_schema(&schema()).await.unwrap();
        let role = Relationship::new(ObjectRef::new("aaa/role", "global"), "agronomist", alice());
        let action = Relationship::new(ObjectRef::new("aaa/action", "global"), "read", alice());
        engine.create_relationships(&[role, action.clone()]).await.unwrap();

        engine.delete_subject_relationships("aaa/role", &alice()).await.unwrap();
        assert_eq!(engine.relationships_of(&alice()), vec![action]);
    }
}
