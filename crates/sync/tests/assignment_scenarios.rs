//! End-to-end assignment scenarios against the in-memory store and engine.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use warden_infra::{
    InMemoryRbacStore, PermissionRepository, RoleRepository, UserRepository, UserRoleRepository,
};
use warden_policy::{
    InMemoryPolicyEngine, ObjectRef, PolicyEngine, PolicyEngineError, PolicyResult, Relationship,
    SchemaDefinition, SubjectRef,
};
use warden_rbac::{NewPermission, NewRole, Permission, Role, RolePatch, User, UserRole};
use warden_sync::{
    AssignmentService, RbacAdminService, SchemaPushStatus, StatusCode, SyncSettings,
};

/// Delegates to an in-memory engine and records every write.
#[derive(Default)]
struct RecordingEngine {
    inner: InMemoryPolicyEngine,
    log: Mutex<Vec<String>>,
    /// Subjects whose writes fail.
    failing: Mutex<Vec<String>>,
    fail_schema: Mutex<bool>,
}

impl RecordingEngine {
    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn clear_log(&self) {
        self.log.lock().unwrap().clear();
    }

    fn fail_for(&self, username: &str) {
        self.failing.lock().unwrap().push(username.to_string());
    }

    fn fails(&self, subject: &SubjectRef) -> bool {
        self.failing.lock().unwrap().contains(&subject.object_id)
    }
}

#[async_trait]
impl PolicyEngine for RecordingEngine {
    async fn update_schema(&self, schema: &SchemaDefinition) -> PolicyResult<()> {
        if *self.fail_schema.lock().unwrap() {
            self.record("schema failed".into());
            return Err(PolicyEngineError::Status {
                status: 500,
                message: "schema rejected".into(),
            });
        }
        self.record("schema".into());
        self.inner.update_schema(schema).await
    }

    async fn read_schema(&self) -> PolicyResult<String> {
        self.inner.read_schema().await
    }

    async fn create_relationships(&self, relationships: &[Relationship]) -> PolicyResult<()> {
        if let Some(first) = relationships.first() {
            if self.fails(&first.subject) {
                self.record(format!("create failed {}", first.subject.object_id));
                return Err(PolicyEngineError::Transport("connection reset".into()));
            }
            self.record(format!(
                "create {} x{}",
                first.subject.object_id,
                relationships.len()
            ));
        }
        self.inner.create_relationships(relationships).await
    }

    async fn delete_relationships(&self, relationships: &[Relationship]) -> PolicyResult<()> {
        self.inner.delete_relationships(relationships).await
    }

    async fn delete_subject_relationships(
        &self,
        resource_type: &str,
        subject: &SubjectRef,
    ) -> PolicyResult<()> {
        self.record(format!("delete {} {}", subject.object_id, resource_type));
        self.inner
            .delete_subject_relationships(resource_type, subject)
            .await
    }

    async fn check_permission(
        &self,
        subject: &SubjectRef,
        permission: &str,
        resource: &ObjectRef,
    ) -> PolicyResult<bool> {
        self.inner.check_permission(subject, permission, resource).await
    }
}

struct World {
    store: Arc<InMemoryRbacStore>,
    engine: Arc<RecordingEngine>,
    service: AssignmentService<InMemoryRbacStore, RecordingEngine>,
    admin: RbacAdminService<InMemoryRbacStore, RecordingEngine>,
}

impl World {
    fn new() -> Self {
        Self::with_settings(SyncSettings::default())
    }

    fn with_settings(settings: SyncSettings) -> Self {
        let store = InMemoryRbacStore::arc();
        let engine = Arc::new(RecordingEngine::default());
        Self {
            service: AssignmentService::new(Arc::clone(&store), Arc::clone(&engine), settings.clone()),
            admin: RbacAdminService::new(Arc::clone(&store), Arc::clone(&engine), settings),
            store,
            engine,
        }
    }

    async fn role(&self, name: &str) -> Role {
        self.store
            .create_role(Role::create(NewRole::named(name), Utc::now()).unwrap())
            .await
            .unwrap()
    }

    async fn permission(&self, name: &str, resource: &str, actions: &[&str]) -> Permission {
        self.store
            .create_permission(
                Permission::create(
                    NewPermission::new(name, resource, actions.iter().copied()),
                    Utc::now(),
                )
                .unwrap(),
            )
            .await
            .unwrap()
    }

    async fn user_with(&self, username: &str, role: &Role) -> User {
        let user = self
            .store
            .create_user(User::create(username, Utc::now()).unwrap())
            .await
            .unwrap();
        self.store
            .create_user_role(UserRole::link(user.id, role.id, Utc::now()))
            .await
            .unwrap();
        user
    }

    async fn crops_world() -> (Self, Role) {
        let world = Self::new();
        let role = world.role("agronomist").await;
        world
            .permission("read_crop_data", "db_farm_crops", &["READ"])
            .await;
        world
            .permission("write_crop_data", "db_farm_crops", &["write", "read"])
            .await;
        world.user_with("alice", &role).await;
        world.user_with("bob", &role).await;
        (world, role)
    }

    async fn allowed(&self, username: &str, action: &str) -> bool {
        self.admin
            .check_permission(username, action, "db_farm_crops", "global")
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn agronomist_gets_crop_permissions() {
    let (world, role) = World::crops_world().await;

    let result = world
        .service
        .assign_permissions_to_role("agronomist", &["read_crop_data", "write_crop_data"])
        .await
        .unwrap();

    // Two new links, both visible in the returned view.
    assert_eq!(world.store.role_permission_row_count(), 2);
    assert_eq!(result.view.role.id, role.id);
    let mut names: Vec<&str> = result.view.permissions.iter().map(|p| p.name.as_str()).collect();
    names.sort();
    assert_eq!(names, ["read_crop_data", "write_crop_data"]);
    assert!(result.view.is_active);

    // Schema carries both permissions and their lower-cased actions.
    assert_eq!(result.schema.status, SchemaPushStatus::Pushed);
    let schema = world.engine.inner.current_schema().unwrap();
    assert!(schema.permissions.contains("read_crop_data"));
    assert!(schema.permissions.contains("write_crop_data"));
    assert_eq!(schema.actions.clone().into_vec(), vec!["read", "write"]);

    // Every holder went through a purge then a create, schema first.
    assert!(result.report.is_clean());
    assert_eq!(result.report.len(), 2);
    let log = world.engine.log();
    assert_eq!(log[0], "schema");
    for user in ["alice", "bob"] {
        let first_delete = log
            .iter()
            .position(|e| e.starts_with(&format!("delete {user} ")))
            .unwrap();
        let create = log
            .iter()
            .position(|e| e.starts_with(&format!("create {user} ")))
            .unwrap();
        assert!(first_delete < create, "{user}: {log:?}");
    }

    assert!(world.allowed("alice", "read").await);
    assert!(world.allowed("bob", "write").await);
    assert!(!world.allowed("carol", "read").await);
}

#[tokio::test]
async fn unknown_permission_changes_nothing() {
    let (world, _) = World::crops_world().await;

    let err = world
        .service
        .assign_permissions_to_role("agronomist", &["read_crop_data", "nonexistent_permission"])
        .await
        .unwrap_err();

    assert_eq!(err.status, StatusCode::NotFound);
    assert!(err.message.contains("nonexistent_permission"));
    assert_eq!(world.store.role_permission_row_count(), 0);
    assert!(world.engine.log().is_empty());
    assert!(world.engine.inner.relationships().is_empty());
}

#[tokio::test]
async fn second_identical_assignment_is_already_exists() {
    let (world, _) = World::crops_world().await;

    world
        .service
        .assign_permissions_to_role("agronomist", &["read_crop_data"])
        .await
        .unwrap();
    let err = world
        .service
        .assign_permissions_to_role("agronomist", &["read_crop_data"])
        .await
        .unwrap_err();

    assert_eq!(err.status, StatusCode::AlreadyExists);
    assert_eq!(world.store.role_permission_row_count(), 1);
}

#[tokio::test]
async fn conflict_later_in_batch_writes_nothing() {
    let (world, _) = World::crops_world().await;
    world
        .service
        .assign_permissions_to_role("agronomist", &["write_crop_data"])
        .await
        .unwrap();

    let err = world
        .service
        .assign_permissions_to_role("agronomist", &["read_crop_data", "write_crop_data"])
        .await
        .unwrap_err();

    assert_eq!(err.status, StatusCode::AlreadyExists);
    assert_eq!(world.store.role_permission_row_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identical_assignments_link_once() {
    let (world, _) = World::crops_world().await;
    let world = Arc::new(world);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let world = Arc::clone(&world);
        handles.push(tokio::spawn(async move {
            world
                .service
                .assign_permissions_to_role("agronomist", &["read_crop_data"])
                .await
        }));
    }

    let mut succeeded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(e) => assert_eq!(e.status, StatusCode::AlreadyExists),
        }
    }
    assert_eq!(succeeded, 1);
    assert_eq!(world.store.role_permission_row_count(), 1);
}

#[tokio::test]
async fn round_trip_lists_new_and_previous_permissions() {
    let (world, role) = World::crops_world().await;
    world
        .service
        .assign_permissions_to_role("agronomist", &["read_crop_data"])
        .await
        .unwrap();
    world
        .service
        .assign_permissions_to_role("agronomist", &["write_crop_data"])
        .await
        .unwrap();

    let view = world.service.get_role_permissions(role.id).await.unwrap();
    let mut names: Vec<&str> = view.permissions.iter().map(|p| p.name.as_str()).collect();
    names.sort();
    assert_eq!(names, ["read_crop_data", "write_crop_data"]);
    assert!(view.is_active);
}

#[tokio::test]
async fn engine_failure_for_one_user_is_reported_not_raised() {
    let (world, _) = World::crops_world().await;
    world.engine.fail_for("bob");

    let result = world
        .service
        .assign_permissions_to_role("agronomist", &["read_crop_data"])
        .await
        .unwrap();

    assert_eq!(world.store.role_permission_row_count(), 1);
    assert!(!result.report.is_clean());
    assert_eq!(result.report.failed_count(), 1);
    let bob = result.report.outcome_for("bob").unwrap();
    assert!(matches!(bob.create_error, Some(PolicyEngineError::Transport(_))));
    assert!(result.report.outcome_for("alice").unwrap().is_ok());

    assert!(world.allowed("alice", "read").await);
    assert!(!world.allowed("bob", "read").await);
}

#[tokio::test]
async fn schema_push_failure_is_non_fatal() {
    let (world, _) = World::crops_world().await;
    *world.engine.fail_schema.lock().unwrap() = true;

    let result = world
        .service
        .assign_permissions_to_role("agronomist", &["read_crop_data"])
        .await
        .unwrap();

    assert!(matches!(result.schema.status, SchemaPushStatus::Failed(_)));
    assert_eq!(result.view.permissions.len(), 1);
    // Without a schema the engine rejects every tuple; each user says so.
    assert_eq!(result.report.failed_count(), 2);
    assert!(
        result
            .report
            .failures()
            .all(|o| o.create_error == Some(PolicyEngineError::NoSchema))
    );
}

#[tokio::test]
async fn reconciling_twice_leaves_the_same_state() {
    let (world, role) = World::crops_world().await;
    world
        .service
        .assign_permissions_to_role("agronomist", &["read_crop_data", "write_crop_data"])
        .await
        .unwrap();
    let before = world.engine.inner.relationships();

    let again = world.service.resync_role(role.id).await.unwrap();

    assert!(again.is_clean());
    assert_eq!(world.engine.inner.relationships(), before);
    assert!(world.allowed("alice", "write").await);
}

#[tokio::test]
async fn revoking_removes_the_grant_downstream() {
    let (world, _) = World::crops_world().await;
    world
        .service
        .assign_permissions_to_role("agronomist", &["read_crop_data", "write_crop_data"])
        .await
        .unwrap();
    assert!(world.allowed("alice", "write").await);

    let result = world
        .service
        .revoke_permission_from_role("agronomist", "write_crop_data")
        .await
        .unwrap();

    assert!(result.is_clean());
    assert!(!world.allowed("alice", "write").await);
    assert!(world.allowed("alice", "read").await);
    let alice = ObjectRef::new("aaa/user", "alice");
    assert!(
        world
            .engine
            .inner
            .relationships_of(&alice)
            .iter()
            .all(|r| r.relation != "write_crop_data")
    );
}

#[tokio::test]
async fn raw_link_removal_needs_an_explicit_resync() {
    let (world, role) = World::crops_world().await;
    world
        .service
        .assign_permissions_to_role("agronomist", &["read_crop_data"])
        .await
        .unwrap();
    world.engine.clear_log();

    let removed = world
        .service
        .delete_role_permission_by_role_id(role.id)
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(world.engine.log().is_empty());
    let alice = ObjectRef::new("aaa/user", "alice");
    assert!(!world.engine.inner.relationships_of(&alice).is_empty());

    world.service.resync_role(role.id).await.unwrap();
    let left: Vec<String> = world
        .engine
        .inner
        .relationships_of(&alice)
        .iter()
        .map(ToString::to_string)
        .collect();
    assert_eq!(left, vec!["aaa/role:global#agronomist@aaa/user:alice"]);
}

#[tokio::test]
async fn role_membership_changes_resync_the_user() {
    let world = World::new();
    let role = world.role("agronomist").await;
    world
        .permission("read_crop_data", "db_farm_crops", &["read"])
        .await;
    world
        .store
        .create_user(User::create("carol", Utc::now()).unwrap())
        .await
        .unwrap();
    world
        .service
        .assign_permissions_to_role("agronomist", &["read_crop_data"])
        .await
        .unwrap();
    assert!(!world.allowed("carol", "read").await);

    let report = world
        .service
        .assign_role_to_user("carol", "agronomist")
        .await
        .unwrap();
    assert!(report.is_clean());
    assert!(world.allowed("carol", "read").await);

    let err = world
        .service
        .assign_role_to_user("carol", "agronomist")
        .await
        .unwrap_err();
    assert_eq!(err.status, StatusCode::AlreadyExists);

    world
        .service
        .revoke_role_from_user("carol", "agronomist")
        .await
        .unwrap();
    assert!(!world.allowed("carol", "read").await);
    assert_eq!(world.store.list_user_roles_by_role(role.id).await.unwrap().len(), 0);
}

#[tokio::test]
async fn full_resync_rebuilds_everything_with_bounded_fan_out() {
    let world = World::with_settings(SyncSettings {
        concurrency: 3,
        ..SyncSettings::default()
    });
    let role = world.role("agronomist").await;
    world
        .permission("read_crop_data", "db_farm_crops", &["read"])
        .await;
    for name in ["u1", "u2", "u3", "u4", "u5"] {
        world.user_with(name, &role).await;
    }
    world
        .service
        .assign_permissions_to_role("agronomist", &["read_crop_data"])
        .await
        .unwrap();

    let result = world.service.full_resync().await.unwrap();

    assert!(result.is_clean());
    assert_eq!(result.report.len(), 5);
    for name in ["u1", "u2", "u3", "u4", "u5"] {
        assert!(world.allowed(name, "read").await, "{name}");
    }
}

#[tokio::test]
async fn deleting_a_permission_unlinks_and_resyncs_holders() {
    let (world, _) = World::crops_world().await;
    world
        .service
        .assign_permissions_to_role("agronomist", &["read_crop_data", "write_crop_data"])
        .await
        .unwrap();
    let write = world
        .store
        .get_permission_by_name("write_crop_data")
        .await
        .unwrap();

    let result = world.admin.delete_permission(write.id).await.unwrap();

    assert!(result.is_clean());
    assert_eq!(result.report.len(), 2);
    assert_eq!(world.store.role_permission_row_count(), 1);
    assert!(!world.allowed("bob", "write").await);
    assert!(world.allowed("bob", "read").await);
}

#[tokio::test]
async fn deleting_a_held_role_pushes_the_schema_after_purging() {
    let (world, role) = World::crops_world().await;
    world
        .service
        .assign_permissions_to_role("agronomist", &["read_crop_data"])
        .await
        .unwrap();
    world.engine.clear_log();

    let result = world.admin.delete_role(role.id).await.unwrap();

    // The first push still sees alice and bob on `agronomist` and is refused.
    let pushes = world.engine.log().iter().filter(|e| *e == "schema").count();
    assert_eq!(pushes, 2);
    assert_eq!(result.schema.status, SchemaPushStatus::Pushed);
    assert!(result.is_clean());
    let schema = world.engine.inner.current_schema().unwrap();
    assert!(!schema.roles.contains("agronomist"));
    assert!(!world.allowed("alice", "read").await);
}

#[tokio::test]
async fn renaming_a_held_role_moves_its_relationships() {
    let (world, role) = World::crops_world().await;
    world
        .service
        .assign_permissions_to_role("agronomist", &["read_crop_data"])
        .await
        .unwrap();

    let renamed = world
        .admin
        .update_role(
            role.id,
            RolePatch {
                name: Some("field_agronomist".into()),
                ..RolePatch::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(renamed.sync.schema.status, SchemaPushStatus::Pushed);
    assert!(renamed.sync.is_clean());
    assert!(world.allowed("alice", "read").await);
    let alice = ObjectRef::new("aaa/user", "alice");
    let relations: Vec<String> = world
        .engine
        .inner
        .relationships_of(&alice)
        .iter()
        .map(|r| r.relation.clone())
        .collect();
    assert!(relations.contains(&"field_agronomist".to_string()));
    assert!(!relations.contains(&"agronomist".to_string()));
}

#[tokio::test]
async fn names_sharing_an_identifier_cannot_split_grants() {
    let world = World::new();
    world.role("admin").await;
    world
        .permission("read_crop_data", "db_farm_crops", &["read"])
        .await;

    let err = world
        .admin
        .create_role(NewRole::named("Admin"))
        .await
        .unwrap_err();
    assert_eq!(err.status, StatusCode::AlreadyExists);

    let err = world
        .admin
        .create_permission(NewPermission::new("Read-Crop Data", "db_farm_crops", ["read"]))
        .await
        .unwrap_err();
    assert_eq!(err.status, StatusCode::AlreadyExists);

    let other = world.role("auditor").await;
    let err = world
        .admin
        .update_role(
            other.id,
            RolePatch {
                name: Some("ADMIN".into()),
                ..RolePatch::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.status, StatusCode::AlreadyExists);

    // A role may still be renamed to another spelling of its own identifier.
    world
        .admin
        .update_role(
            other.id,
            RolePatch {
                name: Some("Auditor".into()),
                ..RolePatch::default()
            },
        )
        .await
        .unwrap();
}
