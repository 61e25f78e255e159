//! Per-user reconciliation of relationship tuples.
//!
//! For each user the synchronizer purges every tuple the subject holds on the
//! category definitions (and on the known resource definitions), then writes
//! the tuples derived from the user's current grants. There is no engine-side
//! transaction; creation is idempotent, so a failed purge followed by a
//! successful create still converges.
//!
//! Failures never abort the batch. Each user gets a [`UserSyncOutcome`] in the
//! returned [`ReconciliationReport`], and every failure is also logged.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use warden_policy::{ObjectRef, PolicyEngine, PolicyEngineError, Relationship, SubjectRef};
use warden_rbac::NameSet;
use warden_rbac::names::policy_identifier;

use crate::config::SyncSettings;
use crate::deadline::with_deadline;

/// Everything one user is currently entitled to, lower-cased.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UserGrants {
    pub username: String,
    pub roles: NameSet,
    pub permissions: NameSet,
    pub actions: NameSet,
    /// resource definition -> roles of this user granted on it
    pub resources: BTreeMap<String, NameSet>,
}

impl UserGrants {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
            && self.permissions.is_empty()
            && self.actions.is_empty()
            && self.resources.is_empty()
    }

    pub fn subject(&self, settings: &SyncSettings) -> SubjectRef {
        ObjectRef::new(qualify(settings, "user"), &self.username)
    }

    /// Tuples that should exist for this user.
    pub fn relationships(&self, settings: &SyncSettings) -> Vec<Relationship> {
        let subject = self.subject(settings);
        let object = |kind: &str| ObjectRef::new(qualify(settings, kind), &settings.grant_object_id);

        let mut out = Vec::new();
        for (kind, names) in [
            ("role", &self.roles),
            ("permission", &self.permissions),
            ("action", &self.actions),
        ] {
            let target = object(kind);
            out.extend(names.iter().map(|name| {
                Relationship::new(target.clone(), policy_identifier(name), subject.clone())
            }));
        }
        for (resource, roles) in &self.resources {
            let target = object(resource);
            out.extend(roles.iter().map(|role| {
                Relationship::new(target.clone(), policy_identifier(role), subject.clone())
            }));
        }
        out.sort();
        out.dedup();
        out
    }
}

fn qualify(settings: &SyncSettings, name: &str) -> String {
    format!("{}/{}", settings.namespace, name)
}

/// Result of reconciling one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSyncOutcome {
    pub username: String,
    /// Tuples written by the create phase (0 if it failed).
    pub written: usize,
    pub delete_error: Option<PolicyEngineError>,
    pub create_error: Option<PolicyEngineError>,
}

impl UserSyncOutcome {
    fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            written: 0,
            delete_error: None,
            create_error: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.delete_error.is_none() && self.create_error.is_none()
    }
}

/// Per-user outcomes of one reconciliation pass, sorted by username.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationReport {
    pub outcomes: Vec<UserSyncOutcome>,
    /// Set when the affected users could not be determined, in which case
    /// nobody was reconciled.
    pub projection_error: Option<String>,
}

impl ReconciliationReport {
    pub fn projection_failed(message: impl Into<String>) -> Self {
        Self {
            outcomes: Vec::new(),
            projection_error: Some(message.into()),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.projection_error.is_none() && self.outcomes.iter().all(UserSyncOutcome::is_ok)
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn failures(&self) -> impl Iterator<Item = &UserSyncOutcome> {
        self.outcomes.iter().filter(|o| !o.is_ok())
    }

    pub fn failed_count(&self) -> usize {
        self.failures().count()
    }

    pub fn outcome_for(&self, username: &str) -> Option<&UserSyncOutcome> {
        self.outcomes.iter().find(|o| o.username == username)
    }
}

impl From<UserSyncOutcome> for ReconciliationReport {
    fn from(outcome: UserSyncOutcome) -> Self {
        Self {
            outcomes: vec![outcome],
            projection_error: None,
        }
    }
}

pub struct RelationshipSynchronizer<P> {
    engine: Arc<P>,
    settings: SyncSettings,
}

impl<P> Clone for RelationshipSynchronizer<P> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            settings: self.settings.clone(),
        }
    }
}

impl<P> RelationshipSynchronizer<P>
where
    P: PolicyEngine + 'static,
{
    pub fn new(engine: Arc<P>, settings: SyncSettings) -> Self {
        Self { engine, settings }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Purge and rebuild one user's tuples.
    ///
    /// `resources` lists resource definitions whose tuples are purged in
    /// addition to the categories and the user's own granted resources.
    pub async fn reconcile_user(
        &self,
        grants: &UserGrants,
        resources: &BTreeSet<String>,
    ) -> UserSyncOutcome {
        reconcile_one(&*self.engine, &self.settings, grants, resources).await
    }

    /// Reconcile many users with at most `settings.concurrency` in flight.
    pub async fn reconcile(
        &self,
        users: Vec<UserGrants>,
        resources: &BTreeSet<String>,
    ) -> ReconciliationReport {
        if users.is_empty() {
            return ReconciliationReport::default();
        }

        let expected: BTreeSet<String> = users.iter().map(|u| u.username.clone()).collect();
        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let resources = Arc::new(resources.clone());
        let mut tasks = JoinSet::new();

        for grants in users {
            let engine = Arc::clone(&self.engine);
            let settings = self.settings.clone();
            let semaphore = Arc::clone(&semaphore);
            let resources = Arc::clone(&resources);
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    let mut outcome = UserSyncOutcome::new(&grants.username);
                    outcome.create_error =
                        Some(PolicyEngineError::State("worker pool closed".to_string()));
                    return outcome;
                };
                reconcile_one(&*engine, &settings, &grants, &resources).await
            });
        }

        let mut outcomes = Vec::with_capacity(expected.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!(error = %e, "reconciliation task failed"),
            }
        }

        // A task that panicked produced no outcome; report it as failed.
        let finished: BTreeSet<String> = outcomes.iter().map(|o| o.username.clone()).collect();
        for missing in expected.difference(&finished) {
            let mut outcome = UserSyncOutcome::new(missing);
            outcome.create_error = Some(PolicyEngineError::State(
                "reconciliation task aborted".to_string(),
            ));
            outcomes.push(outcome);
        }

        outcomes.sort_by(|a, b| a.username.cmp(&b.username));
        let report = ReconciliationReport {
            outcomes,
            projection_error: None,
        };
        info!(
            users = report.len(),
            failed = report.failed_count(),
            "relationship reconciliation finished"
        );
        report
    }
}

async fn reconcile_one<P: PolicyEngine + ?Sized>(
    engine: &P,
    settings: &SyncSettings,
    grants: &UserGrants,
    resources: &BTreeSet<String>,
) -> UserSyncOutcome {
    let mut outcome = UserSyncOutcome::new(&grants.username);
    let subject = grants.subject(settings);

    let mut purge: BTreeSet<String> = ["role", "permission", "action"]
        .into_iter()
        .map(|kind| qualify(settings, kind))
        .collect();
    purge.extend(
        resources
            .iter()
            .chain(grants.resources.keys())
            .map(|r| qualify(settings, r)),
    );

    for object_type in &purge {
        let deleted = with_deadline(
            settings.call_timeout,
            engine.delete_subject_relationships(object_type, &subject),
        )
        .await;
        if let Err(e) = deleted {
            warn!(
                user = %grants.username,
                operation = "delete_relationships",
                object_type = %object_type,
                error = %e,
                "policy engine call failed"
            );
            if outcome.delete_error.is_none() {
                outcome.delete_error = Some(e);
            }
        }
    }

    let tuples = grants.relationships(settings);
    if tuples.is_empty() {
        debug!(user = %grants.username, "no grants left; purge only");
        return outcome;
    }

    match with_deadline(settings.call_timeout, engine.create_relationships(&tuples)).await {
        Ok(()) => outcome.written = tuples.len(),
        Err(e) => {
            warn!(
                user = %grants.username,
                operation = "create_relationships",
                tuples = tuples.len(),
                error = %e,
                "policy engine call failed"
            );
            outcome.create_error = Some(e);
        }
    }
    outcome
}
