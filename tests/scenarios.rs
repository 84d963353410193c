//! End-to-end reconciliation scenarios on in-memory cluster state.

use pgldapsync::postgres::{Database, Schema};
use pgldapsync::privileges::{diff, grant, Grant};
use pgldapsync::role::{self, options::all_columns, Role, RoleOptions};
use std::collections::BTreeMap;

fn login_role(name: &str) -> Role {
    Role {
        name: name.to_string(),
        options: RoleOptions::parse("LOGIN").unwrap(),
        ..Default::default()
    }
}

fn database(name: &str, owner: &str, schemas: &[(&str, &[&str])]) -> Database {
    Database {
        name: name.to_string(),
        owner: owner.to_string(),
        schemas: schemas
            .iter()
            .map(|(schema, creators)| {
                (
                    schema.to_string(),
                    Schema {
                        name: schema.to_string(),
                        creators: creators.iter().map(|c| c.to_string()).collect(),
                    },
                )
            })
            .collect(),
    }
}

/// Static role creation against an empty cluster.
#[test]
fn static_role_creation() {
    let wanted = BTreeMap::from([("alice".to_string(), login_role("alice"))]);
    let mut databases = BTreeMap::new();
    let queries = role::diff(
        &BTreeMap::new(),
        &BTreeMap::new(),
        &wanted,
        "admin",
        "postgres",
        &mut databases,
        &all_columns(),
    );
    let sql: Vec<&str> = queries.iter().map(|q| q.sql.as_str()).collect();
    assert_eq!(
        sql,
        vec![
            "CREATE ROLE \"alice\" WITH LOGIN;",
            "COMMENT ON ROLE \"alice\" IS '';",
        ]
    );
}

/// Dropping a role that owns a database reassigns before dropping.
#[test]
fn role_drop_with_reassign() {
    let managed = BTreeMap::from([("bob".to_string(), login_role("bob"))]);
    let mut databases = BTreeMap::from([("app".to_string(), database("app", "bob", &[]))]);
    let queries = role::diff(
        &managed.clone(),
        &managed,
        &BTreeMap::new(),
        "admin",
        "postgres",
        &mut databases,
        &all_columns(),
    );
    let sql: Vec<&str> = queries.iter().map(|q| q.sql.as_str()).collect();
    assert_eq!(sql.len(), 4);
    assert!(sql[0].contains("pg_terminate_backend"));
    assert!(sql[0].contains("'bob'"));
    assert_eq!(sql[1], "ALTER DATABASE \"app\" OWNER TO \"postgres\";");
    assert_eq!(
        sql[2],
        "REASSIGN OWNED BY \"bob\" TO \"postgres\"; DROP OWNED BY \"bob\";"
    );
    assert_eq!(queries[2].database, "app");
    assert_eq!(sql[3], "DROP ROLE \"bob\";");
}

/// `__all__` schemas expand to one grant per schema of the database.
#[test]
fn grant_expansion_all_schemas() {
    let db = database("db1", "postgres", &[("s1", &[]), ("s2", &[])]);
    let wanted = vec![Grant {
        grantee: "analyst".to_string(),
        acl: "SCHEMAS".to_string(),
        type_: "USAGE".to_string(),
        database: "db1".to_string(),
        schema: "__all__".to_string(),
        ..Default::default()
    }];
    let expanded = grant::expand(&wanted, &db, &["db1".to_string()]).unwrap();
    let queries = diff::diff(&[], &expanded).unwrap();
    let sql: Vec<&str> = queries.iter().map(|q| q.sql.as_str()).collect();
    assert_eq!(
        sql,
        vec![
            "GRANT USAGE ON SCHEMA \"s1\" TO \"analyst\";",
            "GRANT USAGE ON SCHEMA \"s2\" TO \"analyst\";",
        ]
    );
}

/// `__auto__` owners become the schema creators, never the grantee.
#[test]
fn default_privilege_auto_owner() {
    let db = database("db1", "postgres", &[("public", &["alice", "bob", "reader"])]);
    let wanted = vec![Grant {
        owner: "__auto__".to_string(),
        grantee: "reader".to_string(),
        acl: "SCHEMA DEFAULT".to_string(),
        type_: "SELECT".to_string(),
        database: "db1".to_string(),
        schema: "public".to_string(),
        object: "TABLES".to_string(),
        ..Default::default()
    }];
    let expanded = grant::expand(&wanted, &db, &["db1".to_string()]).unwrap();
    let owners: Vec<&str> = expanded.iter().map(|g| g.owner.as_str()).collect();
    assert_eq!(owners, vec!["alice", "bob"]);

    let queries = diff::diff(&[], &expanded).unwrap();
    assert_eq!(
        queries[0].sql,
        "ALTER DEFAULT PRIVILEGES FOR ROLE \"alice\" IN SCHEMA \"public\" GRANT SELECT ON TABLES TO \"reader\";"
    );
}

/// A partial ALL-tables grant is regranted, not revoked.
#[test]
fn partial_grant_triggers_regrant() {
    let grant = Grant {
        grantee: "alice".to_string(),
        acl: "TABLES".to_string(),
        type_: "SELECT".to_string(),
        database: "db1".to_string(),
        schema: "s".to_string(),
        ..Default::default()
    };
    let mut partial = grant.clone();
    partial.partial = true;

    let queries = diff::diff(&[partial], &[grant]).unwrap();
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].description, "Grant privileges.");
    assert_eq!(
        queries[0].sql,
        "GRANT SELECT ON ALL TABLES IN SCHEMA \"s\" TO \"alice\";"
    );
}

/// A type-less wildcard to public covers wanted grants and is never
/// revoked itself.
#[test]
fn wildcard_public_pruning() {
    let wildcard = Grant {
        grantee: "public".to_string(),
        acl: "TABLES".to_string(),
        type_: String::new(),
        database: "db1".to_string(),
        schema: "s".to_string(),
        ..Default::default()
    };
    let wanted = Grant {
        grantee: "alice".to_string(),
        acl: "TABLES".to_string(),
        type_: "SELECT".to_string(),
        database: "db1".to_string(),
        schema: "s".to_string(),
        ..Default::default()
    };
    assert!(diff::diff(&[wildcard], &[wanted]).unwrap().is_empty());
}

/// Reconciling a cluster already in the wanted state yields nothing.
#[test]
fn reconcile_is_idempotent() {
    let roles = BTreeMap::from([("alice".to_string(), login_role("alice"))]);
    let mut databases = BTreeMap::new();
    let queries = role::diff(
        &roles.clone(),
        &roles.clone(),
        &roles,
        "admin",
        "postgres",
        &mut databases,
        &all_columns(),
    );
    assert!(queries.is_empty());

    let grants = vec![Grant {
        grantee: "alice".to_string(),
        acl: "DATABASE".to_string(),
        type_: "CONNECT".to_string(),
        database: "db1".to_string(),
        ..Default::default()
    }];
    assert!(diff::diff(&grants, &grants).unwrap().is_empty());
}
