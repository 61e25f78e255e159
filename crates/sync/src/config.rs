//! Environment configuration.
//!
//! Every variable has a default except `WARDEN_DATABASE_URL`, which only the
//! binary needs. A value that is present but unparsable is an error rather
//! than a silent fallback.

use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use warden_rbac::names::is_policy_identifier;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid value for {var}: '{value}' ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Knobs the synchronizers and services read at runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// Prefix of every definition in the engine schema (`aaa/user`, ...).
    pub namespace: String,
    /// Object id of the category-level tuples (`aaa/role:global#...`).
    pub grant_object_id: String,
    /// Deadline for each individual policy-engine call.
    pub call_timeout: Duration,
    /// How many users are reconciled at once. 1 is strictly sequential.
    pub concurrency: usize,
    /// Identical schemas are not re-pushed within this window. Zero disables.
    pub schema_dedupe_ttl: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            namespace: "aaa".to_string(),
            grant_object_id: "global".to_string(),
            call_timeout: Duration::from_millis(5000),
            concurrency: 1,
            schema_dedupe_ttl: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub policy_endpoint: String,
    pub policy_token: String,
    pub sync: SyncSettings,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            db_max_connections: 5,
            policy_endpoint: "http://localhost:8443".to_string(),
            policy_token: "dev-token".to_string(),
            sync: SyncSettings::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let policy_token = get("WARDEN_POLICY_TOKEN").unwrap_or_else(|| {
            warn!("WARDEN_POLICY_TOKEN not set; using insecure dev default");
            defaults.policy_token.clone()
        });

        let concurrency = parse_or(
            "WARDEN_SYNC_CONCURRENCY",
            get("WARDEN_SYNC_CONCURRENCY"),
            defaults.sync.concurrency,
        )?;
        if concurrency == 0 {
            return Err(ConfigError::Invalid {
                var: "WARDEN_SYNC_CONCURRENCY",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let db_max_connections = parse_or(
            "WARDEN_DB_MAX_CONNECTIONS",
            get("WARDEN_DB_MAX_CONNECTIONS"),
            defaults.db_max_connections,
        )?;

        let timeout_ms: u64 = parse_or(
            "WARDEN_POLICY_TIMEOUT_MS",
            get("WARDEN_POLICY_TIMEOUT_MS"),
            defaults.sync.call_timeout.as_millis() as u64,
        )?;

        let dedupe_secs: u64 = parse_or(
            "WARDEN_SCHEMA_DEDUPE_TTL_SECS",
            get("WARDEN_SCHEMA_DEDUPE_TTL_SECS"),
            0,
        )?;

        let namespace = get("WARDEN_SCHEMA_NAMESPACE").unwrap_or(defaults.sync.namespace);
        if !is_policy_identifier(&namespace) {
            return Err(ConfigError::Invalid {
                var: "WARDEN_SCHEMA_NAMESPACE",
                value: namespace,
                reason: "must match [a-z][a-z0-9_]{1,62}[a-z0-9]".to_string(),
            });
        }

        Ok(Self {
            database_url: get("WARDEN_DATABASE_URL"),
            db_max_connections,
            policy_endpoint: get("WARDEN_POLICY_ENDPOINT").unwrap_or(defaults.policy_endpoint),
            policy_token,
            sync: SyncSettings {
                namespace,
                grant_object_id: get("WARDEN_GRANT_OBJECT_ID")
                    .unwrap_or(defaults.sync.grant_object_id),
                call_timeout: Duration::from_millis(timeout_ms),
                concurrency,
                schema_dedupe_ttl: Duration::from_secs(dedupe_secs),
            },
        })
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing("WARDEN_DATABASE_URL"))
    }
}

fn parse_or<T>(var: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: core::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let cfg = SyncConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg, SyncConfig::default());
        assert_eq!(
            cfg.require_database_url().unwrap_err(),
            ConfigError::Missing("WARDEN_DATABASE_URL")
        );
    }

    #[test]
    fn reads_every_variable() {
        let cfg = SyncConfig::from_lookup(lookup(&[
            ("WARDEN_DATABASE_URL", "postgres://warden@db/warden"),
            ("WARDEN_DB_MAX_CONNECTIONS", "12"),
            ("WARDEN_POLICY_ENDPOINT", "https://authz.internal:8443"),
            ("WARDEN_POLICY_TOKEN", "s3cret"),
            ("WARDEN_POLICY_TIMEOUT_MS", "250"),
            ("WARDEN_SYNC_CONCURRENCY", "8"),
            ("WARDEN_SCHEMA_NAMESPACE", "farm"),
            ("WARDEN_GRANT_OBJECT_ID", "all"),
            ("WARDEN_SCHEMA_DEDUPE_TTL_SECS", "30"),
        ]))
        .unwrap();

        assert_eq!(cfg.require_database_url().unwrap(), "postgres://warden@db/warden");
        assert_eq!(cfg.db_max_connections, 12);
        assert_eq!(cfg.policy_endpoint, "https://authz.internal:8443");
        assert_eq!(cfg.policy_token, "s3cret");
        assert_eq!(cfg.sync.call_timeout, Duration::from_millis(250));
        assert_eq!(cfg.sync.concurrency, 8);
        assert_eq!(cfg.sync.namespace, "farm");
        assert_eq!(cfg.sync.grant_object_id, "all");
        assert_eq!(cfg.sync.schema_dedupe_ttl, Duration::from_secs(30));
    }

    #[test]
    fn bad_numbers_are_errors() {
        let err = SyncConfig::from_lookup(lookup(&[("WARDEN_POLICY_TIMEOUT_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { var: "WARDEN_POLICY_TIMEOUT_MS", .. }
        ));

        let err =
            SyncConfig::from_lookup(lookup(&[("WARDEN_SYNC_CONCURRENCY", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "WARDEN_SYNC_CONCURRENCY", .. }));
    }

    #[test]
    fn namespace_must_be_an_engine_identifier() {
        for bad in ["Farm", "ab", "farm-ops", "9farm"] {
            let err = SyncConfig::from_lookup(lookup(&[("WARDEN_SCHEMA_NAMESPACE", bad)]))
                .unwrap_err();
            assert!(
                matches!(err, ConfigError::Invalid { var: "WARDEN_SCHEMA_NAMESPACE", .. }),
                "{bad}"
            );
        }
    }
}
