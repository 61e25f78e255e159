//! Schema push followed by relationship reconciliation, shared by the
//! services.
//!
//! The schema goes first: relations introduced by a change must be declared
//! before tuples using them are written. A push that removes a relation is
//! refused while tuples still use it, so a failed first push is retried once
//! the holders have been reconciled.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::warn;

use warden_core::RoleId;
use warden_infra::{KeyValueCache, RbacStore};
use warden_policy::PolicyEngine;
use warden_rbac::User;

use crate::config::SyncSettings;
use crate::error::ServiceResult;
use crate::projection::RoleProjector;
use crate::relationship_sync::{ReconciliationReport, RelationshipSynchronizer, UserGrants};
use crate::schema_sync::{SchemaSyncOutcome, SchemaSynchronizer};

/// What a synchronization pass did downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResyncResult {
    pub schema: SchemaSyncOutcome,
    pub report: ReconciliationReport,
}

impl ResyncResult {
    pub fn is_clean(&self) -> bool {
        !self.schema.is_failed() && self.report.is_clean()
    }
}

pub struct SyncPipeline<S, P> {
    pub schema: SchemaSynchronizer<S, P>,
    pub relationships: RelationshipSynchronizer<P>,
    pub projector: RoleProjector<S>,
}

impl<S, P> Clone for SyncPipeline<S, P> {
    fn clone(&self) -> Self {
        Self {
            schema: self.schema.clone(),
            relationships: self.relationships.clone(),
            projector: self.projector.clone(),
        }
    }
}

impl<S, P> SyncPipeline<S, P>
where
    S: RbacStore + 'static,
    P: PolicyEngine + 'static,
{
    pub fn new(store: Arc<S>, engine: Arc<P>, settings: SyncSettings) -> Self {
        Self {
            schema: SchemaSynchronizer::new(Arc::clone(&store), Arc::clone(&engine), settings.clone()),
            relationships: RelationshipSynchronizer::new(engine, settings),
            projector: RoleProjector::new(store),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn KeyValueCache>) -> Self {
        self.schema = self.schema.with_cache(cache);
        self
    }

    /// Push the schema and rebuild every holder of `role_ids`. Never fails:
    /// a relational write has already happened when this runs.
    pub async fn resync_roles(&self, role_ids: &[RoleId]) -> ResyncResult {
        let schema = self.schema.sync_best_effort().await;
        match self.projector.users_of_roles(role_ids).await {
            Ok(users) => self.reconcile_then_retry(schema, users).await,
            Err(e) => {
                warn!(operation = "project_role_users", error = %e, "reconciliation skipped");
                ResyncResult {
                    schema,
                    report: ReconciliationReport::projection_failed(e.message),
                }
            }
        }
    }

    /// Push the schema and rebuild exactly these users.
    pub async fn resync_users(&self, users: &[User]) -> ResyncResult {
        let schema = self.schema.sync_best_effort().await;
        let mut grants = Vec::with_capacity(users.len());
        for user in users {
            match self.projector.user_grants(user).await {
                Ok(g) => grants.push(g),
                Err(e) => {
                    warn!(user = %user.username, error = %e, "reconciliation skipped");
                    return ResyncResult {
                        schema,
                        report: ReconciliationReport::projection_failed(e.message),
                    };
                }
            }
        }
        self.reconcile_then_retry(schema, grants).await
    }

    /// Rebuild only the tuples of `user` (schema unchanged).
    pub async fn resync_user_tuples(&self, user: &User) -> ReconciliationReport {
        match self.projector.user_grants(user).await {
            Ok(grants) => self.reconcile(vec![grants]).await,
            Err(e) => {
                warn!(user = %user.username, error = %e, "reconciliation skipped");
                ReconciliationReport::projection_failed(e.message)
            }
        }
    }

    /// Schema push plus reconciliation of every user. Failing to read the
    /// graph is an error here since nothing was written yet.
    pub async fn full_resync(&self) -> ServiceResult<ResyncResult> {
        let schema = self.schema.sync().await?;
        let users = self.projector.all_users().await?;
        let resources = self.projector.known_resources().await?;
        let retry = schema.is_failed().then(|| users.clone());
        let mut report = self.relationships.reconcile(users, &resources).await;

        let Some(users) = retry else {
            return Ok(ResyncResult { schema, report });
        };
        let schema = self.schema.sync_best_effort().await;
        if schema.is_pushed() && !report.is_clean() {
            report = self.relationships.reconcile(users, &resources).await;
        }
        Ok(ResyncResult { schema, report })
    }

    /// Reconcile `users`; if `first` failed, push again now that stale
    /// tuples are gone, and rerun whatever the old schema rejected.
    async fn reconcile_then_retry(
        &self,
        first: SchemaSyncOutcome,
        users: Vec<UserGrants>,
    ) -> ResyncResult {
        if !first.is_failed() {
            let report = self.reconcile(users).await;
            return ResyncResult { schema: first, report };
        }

        let report = self.reconcile(users.clone()).await;
        let schema = self.schema.sync_best_effort().await;
        if schema.is_failed() {
            warn!(status = ?schema.status, "schema push failed after reconciliation");
            return ResyncResult { schema, report };
        }
        let report = if report.is_clean() {
            report
        } else {
            self.reconcile(users).await
        };
        ResyncResult { schema, report }
    }

    async fn reconcile(&self, users: Vec<UserGrants>) -> ReconciliationReport {
        if users.is_empty() {
            return ReconciliationReport::default();
        }
        let resources = match self.projector.known_resources().await {
            Ok(resources) => resources,
            Err(e) => {
                // Purging still covers the categories and the users' own
                // resources.
                warn!(error = %e, "could not list resources; purge narrowed");
                BTreeSet::new()
            }
        };
        self.relationships.reconcile(users, &resources).await
    }
}
