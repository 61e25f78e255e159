//! Name rules for everything that ends up in the policy engine.
//!
//! The policy engine addresses relations and definitions by identifier, so
//! every role, permission, action and resource name is normalized here before
//! it is stored or projected.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use warden_core::{DomainError, DomainResult};

/// Returned by [`sanitize_db_name`] when nothing usable survives.
pub const INVALID_NAME: &str = "invalid_name";

/// Required first segment of a resource name.
pub const RESOURCE_PREFIX: &str = "db";

/// Length bounds of an engine identifier (`[a-z][a-z0-9_]{1,62}[a-z0-9]`).
pub const MIN_IDENTIFIER_LEN: usize = 3;
pub const MAX_IDENTIFIER_LEN: usize = 64;

/// Trim and require a non-empty display name (roles, permissions).
pub fn normalize_name(field: &str, raw: &str) -> DomainResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(DomainError::validation(format!("{field} cannot be empty")));
    }
    Ok(trimmed.to_string())
}

/// Lower-case action identifier: `[a-z][a-z0-9_]*`.
pub fn normalize_action_name(raw: &str) -> DomainResult<String> {
    let name = raw.trim().to_lowercase();
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => {
            return Err(DomainError::validation(format!(
                "action name '{raw}' must start with a letter"
            )));
        }
    }
    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
        return Err(DomainError::validation(format!(
            "action name '{raw}' may only contain a-z, 0-9 and '_'"
        )));
    }
    Ok(name)
}

/// Collapse separators into `_` and drop everything else that is not
/// alphanumeric.
///
/// Runs of `/`, `-` and whitespace become a single `_`, existing `_` are kept,
/// leading/trailing `_` are trimmed. Never returns an empty string.
pub fn sanitize_db_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_separator = false;

    for c in raw.trim().chars() {
        if c == '/' || c == '-' || c.is_whitespace() {
            if !last_was_separator {
                out.push('_');
                last_was_separator = true;
            }
        } else if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c);
            last_was_separator = false;
        }
    }

    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        INVALID_NAME.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Sanitize, lower-case and validate a resource name.
///
/// Accepts `db_<namespace>_<table>[_...]` and the namespace-wide
/// `db_<namespace>`, which acts as parent of every table in that namespace.
pub fn normalize_resource_name(raw: &str) -> DomainResult<String> {
    if raw.trim().is_empty() {
        return Err(DomainError::validation("resource name cannot be empty"));
    }
    let name = sanitize_db_name(raw).to_lowercase();
    let parts: Vec<&str> = name.split('_').collect();
    if parts.len() < 2 || parts[0] != RESOURCE_PREFIX || parts.iter().any(|p| p.is_empty()) {
        return Err(DomainError::validation(format!(
            "resource name '{raw}' must follow db_<namespace>[_<table>]"
        )));
    }
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(DomainError::validation(format!(
            "resource name '{raw}' is longer than {MAX_IDENTIFIER_LEN} characters"
        )));
    }
    Ok(name)
}

/// Two-part parent of a resource (`db_farm_crops_2024` -> `db_farm`).
///
/// Only resources with more than two segments have a parent.
pub fn resource_parent(resource: &str) -> Option<String> {
    let parts: Vec<&str> = resource.split('_').collect();
    if parts.len() <= 2 {
        return None;
    }
    Some(parts[..2].join("_"))
}

/// Turn any name into a relation/permission identifier the engine accepts.
///
/// `"test role"` becomes `"test_role"`. Identifiers must start with a letter,
/// so a leading digit gets an `n_` prefix. Short results are padded with `0`
/// and long ones cut at [`MAX_IDENTIFIER_LEN`].
///
/// Distinct names can share an identifier (`Admin`, `admin`); the stores use
/// the identifier as the uniqueness key so only one of them can be active.
pub fn policy_identifier(name: &str) -> String {
    let mut ident = sanitize_db_name(name).to_lowercase();
    if !ident.starts_with(|c: char| c.is_ascii_lowercase()) {
        ident.insert_str(0, "n_");
    }
    if ident.len() > MAX_IDENTIFIER_LEN {
        ident.truncate(MAX_IDENTIFIER_LEN);
        let end = ident.trim_end_matches('_').len();
        ident.truncate(end);
    }
    while ident.len() < MIN_IDENTIFIER_LEN {
        ident.push('0');
    }
    ident
}

/// Whether `ident` matches `[a-z][a-z0-9_]{1,62}[a-z0-9]`.
pub fn is_policy_identifier(ident: &str) -> bool {
    let bytes = ident.as_bytes();
    let (Some(first), Some(last)) = (bytes.first(), bytes.last()) else {
        return false;
    };
    (MIN_IDENTIFIER_LEN..=MAX_IDENTIFIER_LEN).contains(&bytes.len())
        && first.is_ascii_lowercase()
        && (last.is_ascii_lowercase() || last.is_ascii_digit())
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'_')
}

/// Ordered set of normalized (trimmed, lower-cased) names.
///
/// Empty and whitespace-only inputs are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NameSet(BTreeSet<String>);

impl NameSet {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// Insert a name; returns `false` if it was empty or already present.
    pub fn insert(&mut self, raw: &str) -> bool {
        let name = raw.trim().to_lowercase();
        if name.is_empty() {
            return false;
        }
        self.0.insert(name)
    }

    pub fn contains(&self, raw: &str) -> bool {
        self.0.contains(&raw.trim().to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn extend_from(&mut self, other: &NameSet) {
        self.0.extend(other.0.iter().cloned());
    }

    /// Replace an empty set with a single placeholder name.
    pub fn or_fallback(self, placeholder: &str) -> Self {
        if self.is_empty() {
            let mut set = Self::new();
            set.insert(placeholder);
            set
        } else {
            self
        }
    }

    pub fn into_vec(self) -> Vec<String> {
        self.0.into_iter().collect()
    }
}

impl<S: AsRef<str>> FromIterator<S> for NameSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = Self::new();
        for name in iter {
            set.insert(name.as_ref());
        }
        set
    }
}

impl<'a> IntoIterator for &'a NameSet {
    type Item = &'a String;
    type IntoIter = std::collections::btree_set::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn sanitize_collapses_separators() {
        assert_eq!(sanitize_db_name("db/aaa/users"), "db_aaa_users");
        assert_eq!(sanitize_db_name("  spaces  /front/back  "), "spaces_front_back");
        assert_eq!(sanitize_db_name("my@database/name"), "mydatabase_name");
        assert_eq!(sanitize_db_name("special!chars#here"), "specialcharshere");
    }

    #[test]
    fn sanitize_never_returns_empty() {
        assert_eq!(sanitize_db_name(""), INVALID_NAME);
        assert_eq!(sanitize_db_name("///"), INVALID_NAME);
        assert_eq!(sanitize_db_name("!!"), INVALID_NAME);
    }

    #[test]
    fn resource_names_follow_convention() {
        assert_eq!(normalize_resource_name("DB/Farm/Crops").unwrap(), "db_farm_crops");
        assert!(normalize_resource_name("farm_crops_x").is_err());
        assert_eq!(normalize_resource_name("db_farm").unwrap(), "db_farm");
        assert!(normalize_resource_name("db").is_err());
        assert!(normalize_resource_name("db__crops").is_err());
        assert!(normalize_resource_name("   ").is_err());
    }

    #[test]
    fn resource_parent_uses_first_two_segments() {
        assert_eq!(resource_parent("db_farm_crops_2024").as_deref(), Some("db_farm"));
        assert_eq!(resource_parent("db_farm_crops").as_deref(), Some("db_farm"));
        assert_eq!(resource_parent("db_farm"), None);
    }

    #[test]
    fn action_names_are_lowercase_identifiers() {
        assert_eq!(normalize_action_name(" Read ").unwrap(), "read");
        assert_eq!(normalize_action_name("bulk_export2").unwrap(), "bulk_export2");
        assert!(normalize_action_name("2fa").is_err());
        assert!(normalize_action_name("read data").is_err());
        assert!(normalize_action_name("").is_err());
    }

    #[test]
    fn policy_identifiers() {
        assert_eq!(policy_identifier("test role"), "test_role");
        assert_eq!(policy_identifier("Read Crop-Data"), "read_crop_data");
        assert_eq!(policy_identifier("2024 admins"), "n_2024_admins");
    }

    #[test]
    fn policy_identifiers_fit_engine_length_bounds() {
        assert_eq!(policy_identifier("qa"), "qa0");
        assert_eq!(policy_identifier("x"), "x00");
        assert_eq!(policy_identifier("7"), "n_7");

        let long = format!("{}_tail", "a".repeat(70));
        let ident = policy_identifier(&long);
        assert_eq!(ident.len(), MAX_IDENTIFIER_LEN);
        assert!(is_policy_identifier(&ident));

        let underscores = format!("a{}b", "_".repeat(70));
        assert_eq!(policy_identifier(&underscores), "a00");
    }

    #[test]
    fn identifier_grammar() {
        assert!(is_policy_identifier("read"));
        assert!(is_policy_identifier("n_2024_admins"));
        assert!(!is_policy_identifier("qa"));
        assert!(!is_policy_identifier("read_"));
        assert!(!is_policy_identifier("Read"));
        assert!(!is_policy_identifier("1read"));
        assert!(!is_policy_identifier(&"a".repeat(65)));
    }

    #[test]
    fn case_and_separator_variants_share_an_identifier() {
        let ident = policy_identifier("field viewer");
        assert_eq!(policy_identifier("Field-Viewer"), ident);
        assert_eq!(policy_identifier("field_viewer"), ident);
        assert_eq!(policy_identifier("Admin"), policy_identifier("admin"));
    }

    #[test]
    fn long_resource_names_are_rejected() {
        let name = format!("db_farm_{}", "c".repeat(60));
        assert!(normalize_resource_name(&name).is_err());
    }

    #[test]
    fn name_set_normalizes_and_dedupes() {
        let set: NameSet = ["Read", "read", " WRITE ", "", "delete"].into_iter().collect();
        assert_eq!(set.into_vec(), vec!["delete", "read", "write"]);
    }

    #[test]
    fn name_set_fallback_only_when_empty() {
        let empty = NameSet::new().or_fallback("test action");
        assert_eq!(empty.into_vec(), vec!["test action"]);

        let full: NameSet = ["read"].into_iter().collect();
        assert_eq!(full.or_fallback("test action").into_vec(), vec!["read"]);
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, ..ProptestConfig::default() })]

        #[test]
        fn sanitize_is_idempotent(raw in ".{0,40}") {
            let once = sanitize_db_name(&raw);
            prop_assert_eq!(sanitize_db_name(&once), once);
        }

        #[test]
        fn sanitize_output_is_identifier_safe(raw in ".{0,40}") {
            let out = sanitize_db_name(&raw);
            prop_assert!(!out.is_empty());
            prop_assert!(!out.starts_with('_') && !out.ends_with('_'));
            prop_assert!(out.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
        }

        #[test]
        fn policy_identifier_matches_engine_grammar(raw in ".{0,100}") {
            let ident = policy_identifier(&raw);
            prop_assert!(is_policy_identifier(&ident), "{:?} -> {:?}", raw, ident);
        }

        #[test]
        fn name_set_members_are_lowercase(names in proptest::collection::vec("[A-Za-z ]{0,12}", 0..20)) {
            let set: NameSet = names.iter().collect();
            for name in set.iter() {
                prop_assert_eq!(name.to_lowercase(), name);
                prop_assert_eq!(name.trim(), name);
            }
        }
    }
}
