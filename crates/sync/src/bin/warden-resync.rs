//! One-shot full resynchronization: pushes the schema derived from Postgres
//! and rebuilds every user's relationship tuples.
//!
//! Exits non-zero only when the relational graph cannot be read; policy
//! engine failures are logged and summarized.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use warden_infra::PostgresRbacStore;
use warden_policy::SpiceDbHttpClient;
use warden_sync::{AssignmentService, SchemaPushStatus, SyncConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    warden_observability::init();

    let config = SyncConfig::from_env().context("invalid configuration")?;
    let database_url = config.require_database_url()?;

    let store = PostgresRbacStore::connect(database_url, config.db_max_connections)
        .await
        .context("failed to connect to postgres")?;
    store.migrate().await.context("failed to run migrations")?;

    let engine = SpiceDbHttpClient::new(
        config.policy_endpoint.clone(),
        config.policy_token.clone(),
        config.sync.call_timeout,
    )
    .context("failed to build policy engine client")?;

    info!(
        endpoint = %config.policy_endpoint,
        namespace = %config.sync.namespace,
        concurrency = config.sync.concurrency,
        "starting full resync"
    );

    let service = AssignmentService::new(Arc::new(store), Arc::new(engine), config.sync.clone());
    let result = service.full_resync().await.context("full resync failed")?;

    match &result.schema.status {
        SchemaPushStatus::Pushed => info!("schema pushed"),
        SchemaPushStatus::Skipped => info!("schema unchanged"),
        SchemaPushStatus::Failed(reason) => warn!(%reason, "schema push failed"),
    }
    for failed in result.report.failures() {
        warn!(
            user = %failed.username,
            delete_error = ?failed.delete_error,
            create_error = ?failed.create_error,
            "user not reconciled"
        );
    }
    info!(
        users = result.report.len(),
        failed = result.report.failed_count(),
        "full resync finished"
    );
    Ok(())
}
