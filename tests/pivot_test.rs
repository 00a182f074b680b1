mod common;

use common::{attrs, create_all, ids, open, TestResult};
use hybrid_model::engine::relations::{BelongsToMany, Pairing, Relation};
use hybrid_model::{CastKind, HybridDb, ModelDef, RelationDecl, RelationKind, RelationQueryable, Schema, StorageBackend};
use serde_json::json;

const DDL: &str = "
    CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);
    CREATE TABLE roles (id INTEGER PRIMARY KEY, name TEXT, pivot_note TEXT);
    CREATE TABLE role_user (
        id INTEGER PRIMARY KEY,
        user_id INTEGER NOT NULL,
        role_id INTEGER NOT NULL,
        level TEXT,
        created_at TEXT,
        updated_at TEXT
    );
";

fn schema(user: StorageBackend, role: StorageBackend) -> Schema {
    Schema::new()
        .register(
            ModelDef::new("user", "users", user)
                .cast("id", CastKind::Integer)
                .relation(
                    "roles",
                    RelationDecl::belongs_to_many("role")
                        .with_pivot(["level"])
                        .with_timestamps(),
                )
                .relation(
                    "memberships",
                    RelationDecl::belongs_to_many("role")
                        .as_accessor("membership")
                        .using("role_assignment"),
                ),
        )
        .register(
            ModelDef::new("role", "roles", role)
                .cast("id", CastKind::Integer)
                .relation("users", RelationDecl::belongs_to_many("user")),
        )
}

fn pivot_relation(db: &HybridDb, model: &str, name: &str) -> TestResult<BelongsToMany> {
    match db.relation(model, name)? {
        Relation::BelongsToMany(relation) => Ok(relation),
        _ => Err(format!("{model}::{name} is not a pivot relation").into()),
    }
}

fn seeded(user: StorageBackend, role: StorageBackend) -> TestResult<HybridDb> {
    let db = open(schema(user, role), DDL)?;
    create_all(
        &db,
        "user",
        &[
            json!({"id": 1, "name": "ann"}),
            json!({"id": 2, "name": "bo"}),
            json!({"id": 3, "name": "cy"}),
        ],
    )?;
    create_all(
        &db,
        "role",
        &[
            json!({"id": 1, "name": "admin", "pivot_note": "ops"}),
            json!({"id": 2, "name": "editor"}),
            json!({"id": 3, "name": "viewer"}),
        ],
    )?;

    let roles = pivot_relation(&db, "user", "roles")?;
    let users = db.query("user")?.get()?;
    let by_id = |id: &str| users.iter().find(|u| u.id().as_deref() == Some(id)).ok_or("user missing");

    roles.attach(by_id("1")?, &[json!(1), json!(2)], &attrs(json!({"level": "full"})))?;
    roles.attach(by_id("2")?, &[json!(2)], &attrs(json!({"level": "read"})))?;
    Ok(db)
}

fn pairs() -> Vec<(StorageBackend, StorageBackend)> {
    use StorageBackend::{KeyValue, Relational};
    vec![
        (Relational, Relational),
        (Relational, KeyValue),
        (KeyValue, Relational),
        (KeyValue, KeyValue),
    ]
}

#[test]
fn test_pivot_lazy_and_eager_agree_for_every_pairing() -> TestResult {
    for (user, role) in pairs() {
        let db = seeded(user, role)?;
        let label = format!("{:?}/{:?}", user, role);
        let roles = db.relation("user", "roles")?;
        assert_eq!(roles.kind(), RelationKind::ManyToManyPivot, "{}", label);
        assert_eq!(roles.pairing(), Pairing::of(user, role), "{}", label);

        let users = db.query("user")?.with("roles").get()?;
        assert_eq!(users.len(), 3, "{}", label);
        for u in &users {
            let lazy = ids(&roles.get(u)?);
            assert_eq!(lazy, ids(u.related_many("roles")), "{}", label);

            let expected: Vec<String> = match u.id().as_deref() {
                Some("1") => vec!["1".into(), "2".into()],
                Some("2") => vec!["2".into()],
                _ => Vec::new(),
            };
            assert_eq!(lazy, expected, "{}", label);
        }
    }
    Ok(())
}

#[test]
fn test_pivot_columns_and_timestamps() -> TestResult {
    for (user, role) in pairs() {
        let db = seeded(user, role)?;
        let label = format!("{:?}/{:?}", user, role);
        let ann = db.query("user")?.find(1)?.ok_or("user 1 missing")?;

        let roles = db.relation("user", "roles")?.get(&ann)?;
        assert_eq!(roles.len(), 2, "{}", label);
        for role in &roles {
            let pivot = role.related_one("pivot").ok_or("pivot missing")?;
            assert_eq!(pivot.get("level"), Some(&json!("full")), "{}", label);
            assert_eq!(pivot.key_string("user_id").as_deref(), Some("1"), "{}", label);
            assert!(pivot.get("created_at").is_some_and(|v| v.is_string()), "{}", label);
            assert!(pivot.get("updated_at").is_some_and(|v| v.is_string()), "{}", label);
        }
    }
    Ok(())
}

#[test]
fn test_related_columns_named_like_pivot_stay_on_related() -> TestResult {
    for (user, role) in pairs() {
        let db = seeded(user, role)?;
        let label = format!("{:?}/{:?}", user, role);
        let ann = db.query("user")?.find(1)?.ok_or("user 1 missing")?;

        let roles = db.relation("user", "roles")?.get(&ann)?;
        let admin = roles
            .iter()
            .find(|r| r.id().as_deref() == Some("1"))
            .ok_or("admin role missing")?;
        assert_eq!(admin.get("pivot_note"), Some(&json!("ops")), "{}", label);
        assert_eq!(admin.get("name"), Some(&json!("admin")), "{}", label);

        let pivot = admin.related_one("pivot").ok_or("pivot missing")?;
        assert!(pivot.get("pivot_note").is_none(), "{}", label);
        assert!(pivot.get("note").is_none(), "{}", label);
        assert_eq!(pivot.get("level"), Some(&json!("full")), "{}", label);
    }
    Ok(())
}

#[test]
fn test_custom_accessor_and_pivot_model() -> TestResult {
    for (user, role) in pairs() {
        let db = seeded(user, role)?;
        let users = db.query("user")?.with("memberships").get()?;
        let ann = users
            .iter()
            .find(|u| u.id().as_deref() == Some("1"))
            .ok_or("user 1 missing")?;

        let memberships = ann.related_many("memberships");
        assert_eq!(memberships.len(), 2);
        for role in memberships {
            assert!(role.related_one("pivot").is_none());
            let pivot = role.related_one("membership").ok_or("membership missing")?;
            assert_eq!(pivot.name(), "role_assignment");
            assert!(pivot.get("level").is_none());
        }
    }
    Ok(())
}

#[test]
fn test_inverse_side_reads_same_pivot() -> TestResult {
    for (user, role) in pairs() {
        let db = seeded(user, role)?;
        let editor = db.query("role")?.find(2)?.ok_or("role 2 missing")?;
        let users = db.relation("role", "users")?.get(&editor)?;
        assert_eq!(ids(&users), vec!["1", "2"]);
    }
    Ok(())
}

#[test]
fn test_attach_models_and_pivot_rows() -> TestResult {
    let db = seeded(StorageBackend::KeyValue, StorageBackend::Relational)?;
    let roles = pivot_relation(&db, "user", "roles")?;
    let cy = db.query("user")?.find(3)?.ok_or("user 3 missing")?;
    let viewer = db.query("role")?.where_eq("name", "viewer").get()?;

    roles.attach_models(&cy, &viewer, &attrs(json!({"level": "read"})))?;

    let rows = roles.pivot_rows(&cy)?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].key_string("role_id").as_deref(), Some("3"));
    assert_eq!(ids(&roles.get(&cy)?), vec!["3"]);
    assert_eq!(db.table("role_user").count()?, 4);
    Ok(())
}

#[test]
fn test_attach_nothing_is_noop() -> TestResult {
    let db = seeded(StorageBackend::Relational, StorageBackend::Relational)?;
    let roles = pivot_relation(&db, "user", "roles")?;
    let cy = db.query("user")?.find(3)?.ok_or("user 3 missing")?;
    roles.attach(&cy, &[], &serde_json::Map::new())?;
    assert_eq!(db.table("role_user").count()?, 3);
    Ok(())
}
