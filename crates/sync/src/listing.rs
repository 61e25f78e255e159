//! Reads shared by the synchronizers.

use std::future::Future;

use chrono::{DateTime, Utc};

use warden_core::Pagination;
use warden_core::pagination::MAX_LIMIT;
use warden_infra::RepoResult;
use warden_rbac::{Effect, Permission};

/// Fetch every page of a listing.
pub(crate) async fn drain_pages<T, F, Fut>(mut fetch: F) -> RepoResult<Vec<T>>
where
    F: FnMut(Pagination) -> Fut,
    Fut: Future<Output = RepoResult<Vec<T>>>,
{
    let mut out = Vec::new();
    loop {
        let batch = fetch(Pagination::new(out.len(), MAX_LIMIT)).await?;
        let full = batch.len() == MAX_LIMIT;
        out.extend(batch);
        if !full {
            return Ok(out);
        }
    }
}

/// Whether `permission` currently lets its roles act on its resource.
/// Deny permissions and permissions outside their validity window do not.
pub(crate) fn grants_access(permission: &Permission, at: DateTime<Utc>) -> bool {
    permission.effect == Effect::Allow && permission.is_effective_at(at)
}
