//! Schema definition derived from the RBAC graph, and its rendering in the
//! engine's schema language.
//!
//! Four category definitions carry one relation per known name:
//!
//! ```text
//! definition <ns>/user {}
//! definition <ns>/role       { relation <role>: <ns>/user ... }
//! definition <ns>/permission { relation <permission>: <ns>/user ... }
//! definition <ns>/action     { relation <action>: <ns>/user ... }
//! ```
//!
//! Each resource gets its own definition with one relation per role granted
//! on it and one permission per action (`permission read = r1 + r2`). A
//! resource with more than two `_` segments also inherits everything its
//! two-segment parent declares.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use warden_rbac::NameSet;
use warden_rbac::names::{
    INVALID_NAME, is_policy_identifier, policy_identifier, resource_parent, sanitize_db_name,
};

use crate::error::{PolicyEngineError, PolicyResult};

/// One role's grant of some actions on one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGrant {
    pub role: String,
    pub resource: String,
    pub actions: Vec<String>,
}

/// Relations and permissions declared on one resource definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSchema {
    pub name: String,
    pub relations: BTreeSet<String>,
    /// action -> roles that grant it
    pub permissions: BTreeMap<String, BTreeSet<String>>,
}

impl ResourceSchema {
    fn merge_from(&mut self, parent: &ResourceSchema) {
        self.relations.extend(parent.relations.iter().cloned());
        for (action, roles) in &parent.permissions {
            self.permissions
                .entry(action.clone())
                .or_default()
                .extend(roles.iter().cloned());
        }
    }
}

/// Build resource definitions from known resources and role grants.
///
/// Names are sanitized; anything that sanitizes to nothing is skipped.
/// Output is sorted by resource name.
pub fn build_resource_schemas<'a>(
    resources: impl IntoIterator<Item = &'a str>,
    grants: &[ResourceGrant],
) -> Vec<ResourceSchema> {
    let mut map: BTreeMap<String, ResourceSchema> = BTreeMap::new();

    for raw in resources {
        if let Some(name) = resource_identifier(raw) {
            map.entry(name.clone()).or_insert_with(|| ResourceSchema {
                name,
                ..ResourceSchema::default()
            });
        }
    }

    for grant in grants {
        let Some(resource) = resource_identifier(&grant.resource) else {
            continue;
        };
        let role = policy_identifier(&grant.role);
        let entry = map.entry(resource.clone()).or_insert_with(|| ResourceSchema {
            name: resource,
            ..ResourceSchema::default()
        });
        entry.relations.insert(role.clone());
        for action in &grant.actions {
            if action.trim().is_empty() {
                continue;
            }
            entry
                .permissions
                .entry(policy_identifier(action))
                .or_default()
                .insert(role.clone());
        }
    }

    // Parents have at most two segments, so they are never children here and
    // reading them while children are updated is order-independent.
    let children: Vec<(String, String)> = map
        .keys()
        .filter_map(|name| resource_parent(name).map(|parent| (name.clone(), parent)))
        .collect();
    for (child, parent) in children {
        let Some(parent_schema) = map.get(&parent).cloned() else {
            continue;
        };
        if let Some(child_schema) = map.get_mut(&child) {
            child_schema.merge_from(&parent_schema);
        }
    }

    map.into_values().collect()
}

/// Definition name of a resource (`db-Farm/Crops` -> `db_farm_crops`), or
/// `None` when the sanitized name is not a valid engine identifier.
pub fn resource_identifier(raw: &str) -> Option<String> {
    let name = sanitize_db_name(raw).to_lowercase();
    if name == INVALID_NAME || name == "db" || !is_policy_identifier(&name) {
        None
    } else {
        Some(name)
    }
}

/// Complete schema pushed to the engine in one `update_schema` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub namespace: String,
    pub roles: NameSet,
    pub permissions: NameSet,
    pub actions: NameSet,
    pub resources: Vec<ResourceSchema>,
}

impl SchemaDefinition {
    pub fn new(namespace: impl Into<String>, roles: NameSet, permissions: NameSet, actions: NameSet) -> Self {
        Self {
            namespace: namespace.into(),
            roles,
            permissions,
            actions,
            resources: Vec::new(),
        }
    }

    pub fn with_resources(mut self, resources: Vec<ResourceSchema>) -> Self {
        self.resources = resources;
        self
    }

    pub fn user_type(&self) -> String {
        self.qualify("user")
    }

    pub fn role_type(&self) -> String {
        self.qualify("role")
    }

    pub fn permission_type(&self) -> String {
        self.qualify("permission")
    }

    pub fn action_type(&self) -> String {
        self.qualify("action")
    }

    pub fn resource_type(&self, resource: &str) -> String {
        self.qualify(resource)
    }

    fn qualify(&self, name: &str) -> String {
        format!("{}/{}", self.namespace, name)
    }

    /// Relations declared on `object_type`, or `None` if no such definition.
    pub fn relations_of(&self, object_type: &str) -> Option<BTreeSet<String>> {
        let category = |names: &NameSet| -> BTreeSet<String> { names.iter().map(policy_identifier).collect() };
        if object_type == self.user_type() {
            return Some(BTreeSet::new());
        }
        if object_type == self.role_type() {
            return Some(category(&self.roles));
        }
        if object_type == self.permission_type() {
            return Some(category(&self.permissions));
        }
        if object_type == self.action_type() {
            return Some(category(&self.actions));
        }
        self.resource(object_type).map(|r| r.relations.clone())
    }

    /// Resource definition addressed by its qualified type.
    pub fn resource(&self, object_type: &str) -> Option<&ResourceSchema> {
        let name = object_type.strip_prefix(&format!("{}/", self.namespace))?;
        self.resources.iter().find(|r| r.name == name)
    }

    /// Check every definition, relation and permission name against the
    /// engine's identifier grammar.
    pub fn validate(&self) -> PolicyResult<()> {
        let invalid = |what: &str, name: &str| {
            PolicyEngineError::InvalidSchema(format!("{what} '{name}' is not a valid identifier"))
        };
        if !is_policy_identifier(&self.namespace) {
            return Err(invalid("namespace", &self.namespace));
        }
        for names in [&self.roles, &self.permissions, &self.actions] {
            for name in names.iter() {
                let ident = policy_identifier(name);
                if !is_policy_identifier(&ident) {
                    return Err(invalid("relation", &ident));
                }
            }
        }
        for resource in &self.resources {
            if !is_policy_identifier(&resource.name) {
                return Err(invalid("definition", &resource.name));
            }
            if let Some(bad) = resource
                .relations
                .iter()
                .chain(resource.permissions.keys())
                .find(|name| !is_policy_identifier(name))
            {
                return Err(invalid("relation", bad));
            }
        }
        Ok(())
    }

    /// Fail unless `relation` is declared on `object_type`.
    pub fn ensure_relation(&self, object_type: &str, relation: &str) -> PolicyResult<()> {
        let relations = self
            .relations_of(object_type)
            .ok_or_else(|| PolicyEngineError::UnknownDefinition(object_type.to_string()))?;
        if relations.contains(relation) {
            Ok(())
        } else {
            Err(PolicyEngineError::UnknownRelation {
                definition: object_type.to_string(),
                relation: relation.to_string(),
            })
        }
    }

    /// Render the schema document. Deterministic for equal definitions.
    pub fn render(&self) -> String {
        let user = self.user_type();
        let mut out = String::new();

        out.push_str(&format!("definition {user} {{}}\n"));
        for (kind, names) in [
            (self.role_type(), &self.roles),
            (self.permission_type(), &self.permissions),
            (self.action_type(), &self.actions),
        ] {
            let relations: BTreeSet<String> = names.iter().map(policy_identifier).collect();
            out.push('\n');
            render_definition(&mut out, &kind, &user, &relations, &BTreeMap::new());
        }
        for resource in &self.resources {
            out.push('\n');
            render_definition(
                &mut out,
                &self.resource_type(&resource.name),
                &user,
                &resource.relations,
                &resource.permissions,
            );
        }
        out
    }
}

fn render_definition(
    out: &mut String,
    name: &str,
    user_type: &str,
    relations: &BTreeSet<String>,
    permissions: &BTreeMap<String, BTreeSet<String>>,
) {
    // Relations and permissions share one namespace per definition.
    let permissions: Vec<_> = permissions
        .iter()
        .filter(|(action, roles)| !relations.contains(*action) && !roles.is_empty())
        .collect();

    if relations.is_empty() && permissions.is_empty() {
        out.push_str(&format!("definition {name} {{}}\n"));
        return;
    }

    out.push_str(&format!("definition {name} {{\n"));
    for relation in relations {
        out.push_str(&format!("\trelation {relation}: {user_type}\n"));
    }
    if !permissions.is_empty() {
        if !relations.is_empty() {
            out.push('\n');
        }
        for (action, roles) in permissions {
            let expr: Vec<&str> = roles.iter().map(String::as_str).collect();
            out.push_str(&format!("\tpermission {action} = {}\n", expr.join(" + ")));
        }
    }
    out.push_str("}\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(items: &[&str]) -> NameSet {
        items.iter().collect()
    }

    fn grant(role: &str, resource: &str, actions: &[&str]) -> ResourceGrant {
        ResourceGrant {
            role: role.into(),
            resource: resource.into(),
            actions: actions.iter().map(|a| a.to_string()).collect(),
        }
    }

    #[test]
    fn renders_category_definitions() {
        let schema = SchemaDefinition::new(
            "aaa",
            names(&["test role"]),
            names(&["read_crop_data"]),
            names(&["read"]),
        );
        let text = schema.render();
        assert!(text.starts_with("definition aaa/user {}\n"));
        assert!(text.contains("definition aaa/role {\n\trelation test_role: aaa/user\n}"));
        assert!(text.contains("definition aaa/permission {\n\trelation read_crop_data: aaa/user\n}"));
        assert!(text.contains("definition aaa/action {\n\trelation read: aaa/user\n}"));
    }

    #[test]
    fn resource_permissions_list_granting_roles() {
        let resources = build_resource_schemas(
            ["db_farm_crops"],
            &[
                grant("agronomist", "db_farm_crops", &["read", "write"]),
                grant("Field Viewer", "db_farm_crops", &["read"]),
            ],
        );
        assert_eq!(resources.len(), 1);
        let crops = &resources[0];
        assert_eq!(
            crops.relations.iter().collect::<Vec<_>>(),
            vec!["agronomist", "field_viewer"]
        );
        let schema = SchemaDefinition::new("aaa", NameSet::new(), NameSet::new(), NameSet::new())
            .with_resources(resources);
        let text = schema.render();
        assert!(text.contains("\tpermission read = agronomist + field_viewer\n"));
        assert!(text.contains("\tpermission write = agronomist\n"));
    }

    #[test]
    fn deep_resources_inherit_from_two_part_parent() {
        let resources = build_resource_schemas(
            ["db_farm", "db_farm_crops_2024", "db_zoo_animals"],
            &[
                grant("owner", "db_farm", &["delete"]),
                grant("agronomist", "db_farm_crops_2024", &["read"]),
            ],
        );
        let by_name: BTreeMap<_, _> = resources.iter().map(|r| (r.name.as_str(), r)).collect();
        let crops = by_name["db_farm_crops_2024"];
        assert!(crops.relations.contains("owner"));
        assert!(crops.relations.contains("agronomist"));
        assert!(crops.permissions["delete"].contains("owner"));
        assert!(by_name["db_zoo_animals"].relations.is_empty());
        assert!(!by_name["db_farm"].relations.contains("agronomist"));
    }

    #[test]
    fn render_is_deterministic_regardless_of_input_order() {
        let a = build_resource_schemas(
            ["db_b_x", "db_a_y"],
            &[grant("r2", "db_a_y", &["w", "r"]), grant("r1", "db_a_y", &["r"])],
        );
        let b = build_resource_schemas(
            ["db_a_y", "db_b_x"],
            &[grant("r1", "db_a_y", &["r"]), grant("r2", "db_a_y", &["r", "w"])],
        );
        let mk = |r| SchemaDefinition::new("aaa", names(&["r2", "r1"]), NameSet::new(), NameSet::new()).with_resources(r);
        assert_eq!(mk(a).render(), mk(b).render());
    }

    #[test]
    fn short_and_long_names_render_valid_identifiers() {
        let long_role = "r".repeat(80);
        let resources = build_resource_schemas(
            ["db_farm_crops"],
            &[grant("qa", "db_farm_crops", &["go"]), grant(&long_role, "db_farm_crops", &["read"])],
        );
        let schema = SchemaDefinition::new("aaa", names(&["qa", long_role.as_str()]), names(&["x"]), names(&["go"]))
            .with_resources(resources);
        assert!(schema.validate().is_ok());

        let text = schema.render();
        assert!(text.contains("\trelation qa0: aaa/user\n"));
        assert!(text.contains("\tpermission go0 = qa0\n"));
        assert!(text.contains(&format!("\trelation {}: aaa/user\n", "r".repeat(64))));
    }

    #[test]
    fn validate_rejects_hand_built_bad_identifiers() {
        let mut bad = ResourceSchema {
            name: "db_farm_crops".into(),
            ..ResourceSchema::default()
        };
        bad.relations.insert("qa".into());
        let schema = SchemaDefinition::new("aaa", NameSet::new(), NameSet::new(), NameSet::new())
            .with_resources(vec![bad]);
        assert!(matches!(schema.validate(), Err(PolicyEngineError::InvalidSchema(_))));

        let schema = SchemaDefinition::new("a", NameSet::new(), NameSet::new(), NameSet::new());
        assert!(schema.validate().is_err());
    }

    #[test]
    fn resource_identifier_rejects_overlong_names() {
        assert_eq!(resource_identifier("db_farm_crops").as_deref(), Some("db_farm_crops"));
        assert_eq!(resource_identifier(&format!("db_farm_{}", "c".repeat(60))), None);
    }

    #[test]
    fn ensure_relation_checks_declarations() {
        let schema = SchemaDefinition::new("aaa", names(&["agronomist"]), names(&["p"]), names(&["read"]))
            .with_resources(build_resource_schemas([], &[grant("agronomist", "db_farm_crops", &["read"])]));
        assert!(schema.ensure_relation("aaa/role", "agronomist").is_ok());
        assert!(schema.ensure_relation("aaa/db_farm_crops", "agronomist").is_ok());
        assert_eq!(
            schema.ensure_relation("aaa/role", "ghost"),
            Err(PolicyEngineError::UnknownRelation {
                definition: "aaa/role".into(),
                relation: "ghost".into()
            })
        );
        assert_eq!(
            schema.ensure_relation("aaa/nothing", "x"),
            Err(PolicyEngineError::UnknownDefinition("aaa/nothing".into()))
        );
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig { cases: 128, ..proptest::prelude::ProptestConfig::default() })]

        #[test]
        fn render_ignores_grant_order(
            picks in proptest::collection::vec((0..4usize, 0..3usize, proptest::collection::vec(0..3usize, 1..3)), 0..12)
        ) {
            const ROLES: [&str; 4] = ["agronomist", "viewer", "Field Lead", "admin"];
            const RESOURCES: [&str; 3] = ["db_farm", "db_farm_crops", "db_farm_crops_2024"];
            const ACTIONS: [&str; 3] = ["read", "write", "delete"];

            let grants: Vec<ResourceGrant> = picks
                .iter()
                .map(|(r, res, acts)| grant(ROLES[*r], RESOURCES[*res], &acts.iter().map(|a| ACTIONS[*a]).collect::<Vec<_>>()))
                .collect();
            let mut reversed = grants.clone();
            reversed.reverse();

            let mk = |g: &[ResourceGrant]| {
                SchemaDefinition::new("aaa", names(&ROLES), NameSet::new(), names(&ACTIONS))
                    .with_resources(build_resource_schemas(RESOURCES, g))
                    .render()
            };
            proptest::prop_assert_eq!(mk(&grants), mk(&reversed));
        }
    }
}
