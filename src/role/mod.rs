//! Role model and the ordered role reconciliation.
//!
//! Roles are built either from cluster inspection or from rule generation.
//! `diff` turns the current/wanted sets into the statement stream: drops,
//! then creates, then alters, each phase in role name order.

pub mod options;

pub use options::RoleOptions;

use crate::postgres::{quote_ident, quote_literal, Database, SyncQuery};
use indoc::formatdoc;
use log::warn;
use std::collections::BTreeMap;

/// A membership in a parent role, remembering who granted it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub name: String,
    pub grantor: String,
}

#[derive(Debug, Clone, Default)]
pub struct Role {
    pub name: String,
    pub comment: String,
    pub options: RoleOptions,
    pub parents: Vec<Membership>,
    pub config: Option<BTreeMap<String, String>>,
    pub before_create: String,
    pub after_create: String,
}

impl Role {
    pub fn member_of(&self, name: &str) -> bool {
        self.parents.iter().any(|m| m.name == name)
    }

    /// Merge a same-named role produced by another rule. Options and
    /// comment stay with the first producer; parent sets are unioned.
    pub fn merge(&mut self, other: Role) {
        for membership in other.parents {
            if !self.member_of(&membership.name) {
                self.parents.push(membership);
            }
        }
    }

    /// Memberships of `wanted` missing from this role's parents.
    fn missing_parents<'a>(&self, wanted: &'a [Membership]) -> Vec<&'a Membership> {
        wanted
            .iter()
            .filter(|m| !self.member_of(&m.name))
            .collect()
    }

    pub fn create(&self, columns: &[String]) -> Vec<SyncQuery> {
        let identifier = quote_ident(&self.name);
        let mut out = Vec::new();

        if !self.before_create.is_empty() {
            out.push(SyncQuery {
                description: "Run before-create hook.",
                database: String::new(),
                sql: self.before_create.clone(),
                tags: vec![("role", self.name.clone())],
            });
        }

        let options = self.options.format(columns);
        let mut sql = format!("CREATE ROLE {}", identifier);
        if !options.is_empty() {
            sql.push_str(" WITH ");
            sql.push_str(&options);
        }
        if !self.parents.is_empty() {
            let parents: Vec<String> =
                self.parents.iter().map(|m| quote_ident(&m.name)).collect();
            sql.push_str(" IN ROLE ");
            sql.push_str(&parents.join(", "));
        }
        sql.push(';');
        out.push(SyncQuery {
            description: "Create role.",
            database: String::new(),
            sql,
            tags: vec![("role", self.name.clone())],
        });

        out.push(SyncQuery {
            description: "Set role comment.",
            database: String::new(),
            sql: format!(
                "COMMENT ON ROLE {} IS {};",
                identifier,
                quote_literal(&self.comment)
            ),
            tags: vec![("role", self.name.clone())],
        });

        if let Some(config) = &self.config {
            for (key, value) in config {
                out.push(SyncQuery {
                    description: "Set role config.",
                    database: String::new(),
                    sql: format!(
                        "ALTER ROLE {} SET {} TO {};",
                        identifier,
                        quote_ident(key),
                        quote_literal(value)
                    ),
                    tags: vec![("role", self.name.clone()), ("config", key.clone())],
                });
            }
        }

        if !self.after_create.is_empty() {
            out.push(SyncQuery {
                description: "Run after-create hook.",
                database: String::new(),
                sql: self.after_create.clone(),
                tags: vec![("role", self.name.clone())],
            });
        }

        out
    }

    /// Statements aligning this (current) role on `wanted`.
    pub fn alter(&self, wanted: &Role, columns: &[String]) -> Vec<SyncQuery> {
        let identifier = quote_ident(&self.name);
        let mut out = Vec::new();

        let changes = self.options.diff(&wanted.options, columns);
        if !changes.is_empty() {
            out.push(SyncQuery {
                description: "Alter role options.",
                database: String::new(),
                sql: format!("ALTER ROLE {} WITH {};", identifier, changes),
                tags: vec![("role", self.name.clone()), ("options", changes.clone())],
            });
        }

        let missing = self.missing_parents(&wanted.parents);
        if !missing.is_empty() {
            let parents: Vec<String> = missing.iter().map(|m| quote_ident(&m.name)).collect();
            out.push(SyncQuery {
                description: "Grant missing parents.",
                database: String::new(),
                sql: format!("GRANT {} TO {};", parents.join(", "), identifier),
                tags: vec![
                    ("role", self.name.clone()),
                    (
                        "parents",
                        missing
                            .iter()
                            .map(|m| m.name.as_str())
                            .collect::<Vec<_>>()
                            .join(","),
                    ),
                ],
            });
        }

        for membership in wanted.missing_parents(&self.parents) {
            // Force an error rather than a warning when the running user
            // lacks admin option on the grantor of this membership.
            out.push(SyncQuery {
                description: "Revoke spurious parent.",
                database: String::new(),
                sql: format!(
                    "REVOKE {} FROM {} GRANTED BY {};",
                    quote_ident(&membership.name),
                    identifier,
                    quote_ident(&membership.grantor)
                ),
                tags: vec![
                    ("role", self.name.clone()),
                    ("parent", membership.name.clone()),
                ],
            });
        }

        if wanted.comment != self.comment {
            out.push(SyncQuery {
                description: "Set role comment.",
                database: String::new(),
                sql: format!(
                    "COMMENT ON ROLE {} IS {};",
                    identifier,
                    quote_literal(&wanted.comment)
                ),
                tags: vec![("role", self.name.clone())],
            });
        }

        if let Some(wanted_config) = &wanted.config {
            let empty = BTreeMap::new();
            let current_config = self.config.as_ref().unwrap_or(&empty);
            for key in current_config.keys() {
                if !wanted_config.contains_key(key) {
                    out.push(SyncQuery {
                        description: "Reset role config.",
                        database: String::new(),
                        sql: format!("ALTER ROLE {} RESET {};", identifier, quote_ident(key)),
                        tags: vec![("role", self.name.clone()), ("config", key.clone())],
                    });
                }
            }
            for (key, value) in wanted_config {
                if current_config.get(key) == Some(value) {
                    continue;
                }
                out.push(SyncQuery {
                    description: "Set role config.",
                    database: String::new(),
                    sql: format!(
                        "ALTER ROLE {} SET {} TO {};",
                        identifier,
                        quote_ident(key),
                        quote_literal(value)
                    ),
                    tags: vec![("role", self.name.clone()), ("config", key.clone())],
                });
            }
        }

        out
    }

    /// Statements preparing and executing the drop of this role.
    ///
    /// Databases owned by the role are reassigned to `fallback_owner`;
    /// owned objects are reassigned per database before `DROP OWNED`
    /// purges remaining ACLs.
    pub fn drop(
        &self,
        fallback_owner: &str,
        databases: &mut BTreeMap<String, Database>,
    ) -> Vec<SyncQuery> {
        let identifier = quote_ident(&self.name);
        let mut out = Vec::new();

        if self.options.can_login {
            out.push(SyncQuery {
                description: "Terminate running sessions.",
                database: String::new(),
                sql: formatdoc! {"
                    SELECT pg_terminate_backend(pid)
                    FROM pg_catalog.pg_stat_activity
                    WHERE usename = {};",
                    quote_literal(&self.name)
                },
                tags: vec![("role", self.name.clone())],
            });
        }

        for database in databases.values_mut() {
            if database.owner == self.name {
                out.push(SyncQuery {
                    description: "Reassign database.",
                    database: String::new(),
                    sql: format!(
                        "ALTER DATABASE {} OWNER TO {};",
                        quote_ident(&database.name),
                        quote_ident(fallback_owner)
                    ),
                    tags: vec![
                        ("database", database.name.clone()),
                        ("old", self.name.clone()),
                        ("new", fallback_owner.to_string()),
                    ],
                });
                // Keep the model in line so the next statements pick the
                // new owner.
                database.owner = fallback_owner.to_string();
            }
            out.push(SyncQuery {
                description: "Reassign objects and purge ACL.",
                database: database.name.clone(),
                sql: format!(
                    "REASSIGN OWNED BY {} TO {}; DROP OWNED BY {};",
                    identifier,
                    quote_ident(&database.owner),
                    identifier
                ),
                tags: vec![("role", self.name.clone()), ("owner", database.owner.clone())],
            });
        }

        out.push(SyncQuery {
            description: "Drop role.",
            database: String::new(),
            sql: format!("DROP ROLE {};", identifier),
            tags: vec![("role", self.name.clone())],
        });
        out
    }
}

/// Ordered role reconciliation: drops, creates, alters.
pub fn diff(
    all_roles: &BTreeMap<String, Role>,
    managed_roles: &BTreeMap<String, Role>,
    wanted_roles: &BTreeMap<String, Role>,
    me: &str,
    fallback_owner: &str,
    databases: &mut BTreeMap<String, Database>,
    columns: &[String],
) -> Vec<SyncQuery> {
    let mut out = Vec::new();

    // Drop managed roles not wanted anymore. BTreeMap iteration gives the
    // name order.
    for (name, role) in managed_roles {
        if wanted_roles.contains_key(name) {
            continue;
        }
        if name == me {
            warn!("Not dropping current user. role={}", name);
            continue;
        }
        if name == "public" {
            continue;
        }
        out.extend(role.drop(fallback_owner, databases));
    }

    for (name, role) in wanted_roles {
        if !all_roles.contains_key(name) {
            out.extend(role.create(columns));
        }
    }

    for (name, wanted) in wanted_roles {
        if let Some(current) = all_roles.get(name) {
            out.extend(current.alter(wanted, columns));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::role::options::all_columns;

    fn named(name: &str) -> Role {
        Role {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn membership(name: &str) -> Membership {
        Membership {
            name: name.to_string(),
            grantor: "postgres".to_string(),
        }
    }

    #[test]
    fn test_create_static_login_role() {
        let mut role = named("alice");
        role.options = RoleOptions::parse("LOGIN").unwrap();
        let queries = role.create(&all_columns());
        let sql: Vec<&str> = queries.iter().map(|q| q.sql.as_str()).collect();
        assert_eq!(
            sql,
            vec![
                "CREATE ROLE \"alice\" WITH LOGIN;",
                "COMMENT ON ROLE \"alice\" IS '';",
            ]
        );
    }

    #[test]
    fn test_create_with_parents_and_hooks() {
        let mut role = named("writer");
        role.parents = vec![membership("readers"), membership("writers")];
        role.before_create = "SELECT 1;".to_string();
        role.after_create = "SELECT 2;".to_string();
        let queries = role.create(&all_columns());
        assert_eq!(queries[0].sql, "SELECT 1;");
        assert_eq!(
            queries[1].sql,
            "CREATE ROLE \"writer\" IN ROLE \"readers\", \"writers\";"
        );
        assert_eq!(queries.last().unwrap().sql, "SELECT 2;");
    }

    #[test]
    fn test_alter_options_single_statement() {
        let current = named("alice");
        let mut wanted = named("alice");
        wanted.options = RoleOptions::parse("LOGIN CREATEDB").unwrap();
        let queries = current.alter(&wanted, &all_columns());
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].sql, "ALTER ROLE \"alice\" WITH CREATEDB LOGIN;");
    }

    #[test]
    fn test_alter_parents() {
        let mut current = named("alice");
        current.parents = vec![Membership {
            name: "old".to_string(),
            grantor: "admin".to_string(),
        }];
        let mut wanted = named("alice");
        wanted.parents = vec![membership("new")];
        let queries = current.alter(&wanted, &all_columns());
        let sql: Vec<&str> = queries.iter().map(|q| q.sql.as_str()).collect();
        assert_eq!(
            sql,
            vec![
                "GRANT \"new\" TO \"alice\";",
                "REVOKE \"old\" FROM \"alice\" GRANTED BY \"admin\";",
            ]
        );
    }

    #[test]
    fn test_alter_config_reset_update_set() {
        let mut current = named("alice");
        current.config = Some(BTreeMap::from([
            ("search_path".to_string(), "public".to_string()),
            ("statement_timeout".to_string(), "10s".to_string()),
        ]));
        let mut wanted = named("alice");
        wanted.config = Some(BTreeMap::from([
            ("statement_timeout".to_string(), "20s".to_string()),
            ("work_mem".to_string(), "64MB".to_string()),
        ]));
        let queries = current.alter(&wanted, &all_columns());
        let sql: Vec<&str> = queries.iter().map(|q| q.sql.as_str()).collect();
        assert_eq!(
            sql,
            vec![
                "ALTER ROLE \"alice\" RESET \"search_path\";",
                "ALTER ROLE \"alice\" SET \"statement_timeout\" TO '20s';",
                "ALTER ROLE \"alice\" SET \"work_mem\" TO '64MB';",
            ]
        );
    }

    #[test]
    fn test_drop_with_owned_database() {
        let mut bob = named("bob");
        bob.options = RoleOptions::parse("LOGIN").unwrap();
        let mut databases = BTreeMap::from([(
            "app".to_string(),
            Database {
                name: "app".to_string(),
                owner: "bob".to_string(),
                schemas: BTreeMap::new(),
            },
        )]);
        let queries = bob.drop("postgres", &mut databases);
        let descriptions: Vec<&str> = queries.iter().map(|q| q.description).collect();
        assert_eq!(
            descriptions,
            vec![
                "Terminate running sessions.",
                "Reassign database.",
                "Reassign objects and purge ACL.",
                "Drop role.",
            ]
        );
        assert_eq!(
            queries[1].sql,
            "ALTER DATABASE \"app\" OWNER TO \"postgres\";"
        );
        assert_eq!(
            queries[2].sql,
            "REASSIGN OWNED BY \"bob\" TO \"postgres\"; DROP OWNED BY \"bob\";"
        );
        assert_eq!(queries[2].database, "app");
        assert_eq!(queries[3].sql, "DROP ROLE \"bob\";");
        assert_eq!(databases["app"].owner, "postgres");
    }

    #[test]
    fn test_merge_unions_parents_keeps_first_options() {
        let mut first = named("dev");
        first.options = RoleOptions::parse("LOGIN").unwrap();
        first.parents = vec![membership("a")];
        let mut second = named("dev");
        second.options = RoleOptions::parse("SUPERUSER").unwrap();
        second.parents = vec![membership("a"), membership("b")];
        first.merge(second);
        assert!(first.options.can_login);
        assert!(!first.options.superuser);
        let parents: Vec<&str> = first.parents.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(parents, vec!["a", "b"]);
    }

    #[test]
    fn test_diff_never_drops_self() {
        let me = named("admin");
        let managed = BTreeMap::from([("admin".to_string(), me)]);
        let mut databases = BTreeMap::new();
        let queries = diff(
            &managed.clone(),
            &managed,
            &BTreeMap::new(),
            "admin",
            "postgres",
            &mut databases,
            &all_columns(),
        );
        assert!(queries.is_empty());
    }
}
