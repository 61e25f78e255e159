//! Derives the engine schema from the RBAC graph and pushes it.
//!
//! Every push is a complete replacement. Empty categories are filled with a
//! fixed placeholder so the engine never receives an empty definition.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use warden_core::ListFilter;
use warden_infra::{
    ActionRepository, InMemoryTtlCache, KeyValueCache, PermissionRepository, RbacStore,
    ResourceRepository, RolePermissionRepository, RoleRepository,
};
use warden_policy::{PolicyEngine, ResourceGrant, SchemaDefinition, build_resource_schemas};
use warden_rbac::NameSet;

use crate::config::SyncSettings;
use crate::deadline::with_deadline;
use crate::error::{ServiceError, ServiceResult};
use crate::listing::{drain_pages, grants_access};

pub const FALLBACK_ROLE: &str = "test role";
pub const FALLBACK_PERMISSION: &str = "test permission";
pub const FALLBACK_ACTION: &str = "test action";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaPushStatus {
    Pushed,
    /// An identical schema was pushed within the dedupe window.
    Skipped,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaSyncOutcome {
    /// `None` only when the RBAC graph could not be read.
    pub definition: Option<SchemaDefinition>,
    pub status: SchemaPushStatus,
}

impl SchemaSyncOutcome {
    pub fn is_pushed(&self) -> bool {
        self.status == SchemaPushStatus::Pushed
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, SchemaPushStatus::Failed(_))
    }
}

pub struct SchemaSynchronizer<S, P> {
    store: Arc<S>,
    engine: Arc<P>,
    settings: SyncSettings,
    cache: Arc<dyn KeyValueCache>,
}

impl<S, P> Clone for SchemaSynchronizer<S, P> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            engine: Arc::clone(&self.engine),
            settings: self.settings.clone(),
            cache: Arc::clone(&self.cache),
        }
    }
}

impl<S, P> SchemaSynchronizer<S, P>
where
    S: RbacStore,
    P: PolicyEngine,
{
    pub fn new(store: Arc<S>, engine: Arc<P>, settings: SyncSettings) -> Self {
        Self {
            store,
            engine,
            settings,
            cache: Arc::new(InMemoryTtlCache::new()),
        }
    }

    /// Use `cache` for push dedupe instead of a private one.
    pub fn with_cache(mut self, cache: Arc<dyn KeyValueCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Build the schema from the current active roles, permissions, actions
    /// and resources.
    pub async fn derive(&self) -> ServiceResult<SchemaDefinition> {
        let store = &*self.store;
        let filter = ListFilter::active();
        let now = Utc::now();

        let roles = drain_pages(|page| store.list_roles(&filter, page)).await?;
        let permissions = drain_pages(|page| store.list_permissions(&filter, page)).await?;
        let actions = drain_pages(|page| store.list_actions(&filter, page)).await?;
        let resources = drain_pages(|page| store.list_resources(&filter, page)).await?;

        let mut action_names: NameSet = actions.iter().map(|a| a.name.as_str()).collect();
        for permission in &permissions {
            for action in &permission.actions {
                action_names.insert(action);
            }
        }

        let mut grants = Vec::new();
        for role in &roles {
            for record in store.list_role_permissions(role.id).await? {
                let Some(permission) = record.active_permission() else {
                    continue;
                };
                if grants_access(permission, now) {
                    grants.push(ResourceGrant {
                        role: role.name.clone(),
                        resource: permission.resource.clone(),
                        actions: permission.actions.clone(),
                    });
                }
            }
        }

        let role_names: NameSet = roles.iter().map(|r| r.name.as_str()).collect();
        let permission_names: NameSet = permissions.iter().map(|p| p.name.as_str()).collect();

        Ok(SchemaDefinition::new(
            self.settings.namespace.clone(),
            role_names.or_fallback(FALLBACK_ROLE),
            permission_names.or_fallback(FALLBACK_PERMISSION),
            action_names.or_fallback(FALLBACK_ACTION),
        )
        .with_resources(build_resource_schemas(
            resources.iter().map(|r| r.name.as_str()),
            &grants,
        )))
    }

    /// Push `definition`, unless the same document was pushed within the
    /// dedupe window. Never fails; the status says what happened.
    pub async fn push(&self, definition: SchemaDefinition) -> SchemaSyncOutcome {
        let document = definition.render();
        let cache_key = format!("schema:{}", self.settings.namespace);
        let dedupe = !self.settings.schema_dedupe_ttl.is_zero();

        if dedupe {
            match self.cache.get(&cache_key) {
                Ok(Some(previous)) if previous == document => {
                    info!(namespace = %self.settings.namespace, "schema unchanged; push skipped");
                    return SchemaSyncOutcome {
                        definition: Some(definition),
                        status: SchemaPushStatus::Skipped,
                    };
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "schema dedupe cache unavailable"),
            }
        }

        let pushed = with_deadline(
            self.settings.call_timeout,
            self.engine.update_schema(&definition),
        )
        .await;

        let status = match pushed {
            Ok(()) => {
                info!(
                    namespace = %self.settings.namespace,
                    roles = definition.roles.len(),
                    permissions = definition.permissions.len(),
                    actions = definition.actions.len(),
                    resources = definition.resources.len(),
                    "schema pushed"
                );
                if dedupe {
                    if let Err(e) =
                        self.cache
                            .put(&cache_key, document, self.settings.schema_dedupe_ttl)
                    {
                        warn!(error = %e, "failed to remember pushed schema");
                    }
                }
                SchemaPushStatus::Pushed
            }
            Err(e) => {
                warn!(operation = "update_schema", error = %e, "policy engine call failed");
                // The engine state is unknown now; do not let the cache skip
                // the next attempt.
                if dedupe {
                    if let Err(e) = self.cache.remove(&cache_key) {
                        warn!(error = %e, "failed to forget pushed schema");
                    }
                }
                SchemaPushStatus::Failed(e.to_string())
            }
        };

        SchemaSyncOutcome {
            definition: Some(definition),
            status,
        }
    }

    /// Derive and push. Reading the graph is the only failure surfaced.
    pub async fn sync(&self) -> ServiceResult<SchemaSyncOutcome> {
        let definition = self.derive().await?;
        Ok(self.push(definition).await)
    }

    /// [`sync`](Self::sync) for paths where the relational write already
    /// succeeded: a read failure becomes a `Failed` status.
    pub async fn sync_best_effort(&self) -> SchemaSyncOutcome {
        match self.sync().await {
            Ok(outcome) => outcome,
            Err(ServiceError { message, .. }) => {
                warn!(operation = "derive_schema", error = %message, "schema sync skipped");
                SchemaSyncOutcome {
                    definition: None,
                    status: SchemaPushStatus::Failed(message),
                }
            }
        }
    }
}
