//! Privilege profiles and the ACL catalog.
//!
//! An ACL is a kind of grantable thing (DATABASE, TABLES, ...) with a fixed
//! scope and slot set. Profiles are named bundles of privileges that rules
//! reference; the union of registered profiles defines which privilege
//! types are managed per ACL, which bounds both inspection and revocation.

pub mod diff;
pub mod grant;

pub use grant::Grant;

use crate::errors::{Error, Result};
use indoc::indoc;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Instance,
    Database,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Owner,
    Database,
    Schema,
    Object,
}

/// One ACL category: scope, used slots, statement templates and the
/// inspection query yielding current grants as
/// (owner, grantee, type, database, schema, object, partial) rows.
#[derive(Debug)]
pub struct Acl {
    pub name: &'static str,
    pub scope: Scope,
    slots: &'static [Slot],
    pub grant_sql: &'static str,
    pub revoke_sql: &'static str,
    pub inspect_sql: &'static str,
}

impl Acl {
    pub fn uses(&self, slot: Slot) -> bool {
        self.slots.contains(&slot)
    }

    /// Default-privilege ACLs govern future objects of an owner.
    pub fn is_default(&self) -> bool {
        self.uses(Slot::Owner)
    }

    pub fn lookup(name: &str) -> Result<&'static Acl> {
        ACLS.iter()
            .find(|acl| acl.name == name)
            .ok_or_else(|| Error::Internal(format!("unknown ACL category: {}", name)))
    }
}

static ACLS: [Acl; 7] = [
    Acl {
        name: "DATABASE",
        scope: Scope::Instance,
        slots: &[Slot::Database],
        grant_sql: "GRANT <privilege> ON DATABASE <database> TO <grantee>;",
        revoke_sql: "REVOKE <privilege> ON DATABASE <database> FROM <grantee>;",
        inspect_sql: indoc! {r#"
            WITH grants AS (
                SELECT datname, (aclexplode(datacl)).grantee AS grantee,
                       (aclexplode(datacl)).privilege_type AS priv
                FROM pg_catalog.pg_database
            )
            SELECT '' AS owner, COALESCE(rolname, 'public') AS grantee,
                   priv AS "type", datname AS "database",
                   '' AS "schema", '' AS object, FALSE AS "partial"
            FROM grants
            LEFT OUTER JOIN pg_catalog.pg_roles ON pg_roles.oid = grants.grantee
            WHERE priv = ANY($1) AND COALESCE(rolname, 'public') = ANY($2)
            ORDER BY 2, 4, 3;"#},
    },
    Acl {
        name: "SCHEMAS",
        scope: Scope::Database,
        slots: &[Slot::Database, Slot::Schema],
        grant_sql: "GRANT <privilege> ON SCHEMA <schema> TO <grantee>;",
        revoke_sql: "REVOKE <privilege> ON SCHEMA <schema> FROM <grantee>;",
        inspect_sql: indoc! {r#"
            SELECT '' AS owner, COALESCE(rolname, 'public') AS grantee,
                   privilege_type AS "type", current_database() AS "database",
                   nspname AS "schema", '' AS object, FALSE AS "partial"
            FROM pg_catalog.pg_namespace
            CROSS JOIN LATERAL aclexplode(nspacl) AS acl
            LEFT OUTER JOIN pg_catalog.pg_roles ON pg_roles.oid = acl.grantee
            WHERE nspname NOT LIKE 'pg\_%' AND nspname <> 'information_schema'
              AND privilege_type = ANY($1)
              AND COALESCE(rolname, 'public') = ANY($2)
            ORDER BY 2, 5, 3;"#},
    },
    Acl {
        name: "TABLES",
        scope: Scope::Database,
        slots: &[Slot::Database, Slot::Schema],
        grant_sql: "GRANT <privilege> ON ALL <acl> IN SCHEMA <schema> TO <grantee>;",
        revoke_sql: "REVOKE <privilege> ON ALL <acl> IN SCHEMA <schema> FROM <grantee>;",
        inspect_sql: indoc! {r#"
            WITH namespace_rels AS (
                SELECT nsp.oid, nsp.nspname,
                       array_remove(array_agg(rel.relname ORDER BY rel.relname), NULL) AS rels
                FROM pg_catalog.pg_namespace AS nsp
                LEFT OUTER JOIN pg_catalog.pg_class AS rel
                  ON rel.relnamespace = nsp.oid AND relkind IN ('r', 'v', 'm', 'f', 'p')
                WHERE nspname NOT LIKE 'pg\_%' AND nspname <> 'information_schema'
                GROUP BY 1, 2
            ), all_grants AS (
                SELECT relnamespace,
                       (aclexplode(relacl)).privilege_type AS priv,
                       (aclexplode(relacl)).grantee AS grantee,
                       array_agg(relname ORDER BY relname) AS rels
                FROM pg_catalog.pg_class
                WHERE relkind IN ('r', 'v', 'm', 'f', 'p')
                GROUP BY 1, 2, 3
            )
            SELECT '' AS owner, COALESCE(rolname, 'public') AS grantee,
                   COALESCE(priv, '') AS "type", current_database() AS "database",
                   nspname AS "schema", '' AS object,
                   NOT (nsp.rels <@ COALESCE(grants.rels, ARRAY[]::name[])) AS "partial"
            FROM namespace_rels AS nsp
            LEFT OUTER JOIN all_grants AS grants ON grants.relnamespace = nsp.oid
            LEFT OUTER JOIN pg_catalog.pg_roles ON pg_roles.oid = grants.grantee
            WHERE (grants.relnamespace IS NOT NULL OR array_length(nsp.rels, 1) IS NULL)
              AND (priv IS NULL OR priv = ANY($1))
              AND (grants.grantee IS NULL OR COALESCE(rolname, 'public') = ANY($2))
            ORDER BY 2, 5, 3;"#},
    },
    Acl {
        name: "SEQUENCES",
        scope: Scope::Database,
        slots: &[Slot::Database, Slot::Schema],
        grant_sql: "GRANT <privilege> ON ALL <acl> IN SCHEMA <schema> TO <grantee>;",
        revoke_sql: "REVOKE <privilege> ON ALL <acl> IN SCHEMA <schema> FROM <grantee>;",
        inspect_sql: indoc! {r#"
            WITH namespace_rels AS (
                SELECT nsp.oid, nsp.nspname,
                       array_remove(array_agg(rel.relname ORDER BY rel.relname), NULL) AS rels
                FROM pg_catalog.pg_namespace AS nsp
                LEFT OUTER JOIN pg_catalog.pg_class AS rel
                  ON rel.relnamespace = nsp.oid AND relkind IN ('S')
                WHERE nspname NOT LIKE 'pg\_%' AND nspname <> 'information_schema'
                GROUP BY 1, 2
            ), all_grants AS (
                SELECT relnamespace,
                       (aclexplode(relacl)).privilege_type AS priv,
                       (aclexplode(relacl)).grantee AS grantee,
                       array_agg(relname ORDER BY relname) AS rels
                FROM pg_catalog.pg_class
                WHERE relkind IN ('S')
                GROUP BY 1, 2, 3
            )
            SELECT '' AS owner, COALESCE(rolname, 'public') AS grantee,
                   COALESCE(priv, '') AS "type", current_database() AS "database",
                   nspname AS "schema", '' AS object,
                   NOT (nsp.rels <@ COALESCE(grants.rels, ARRAY[]::name[])) AS "partial"
            FROM namespace_rels AS nsp
            LEFT OUTER JOIN all_grants AS grants ON grants.relnamespace = nsp.oid
            LEFT OUTER JOIN pg_catalog.pg_roles ON pg_roles.oid = grants.grantee
            WHERE (grants.relnamespace IS NOT NULL OR array_length(nsp.rels, 1) IS NULL)
              AND (priv IS NULL OR priv = ANY($1))
              AND (grants.grantee IS NULL OR COALESCE(rolname, 'public') = ANY($2))
            ORDER BY 2, 5, 3;"#},
    },
    Acl {
        name: "FUNCTIONS",
        scope: Scope::Database,
        slots: &[Slot::Database, Slot::Schema],
        grant_sql: "GRANT <privilege> ON ALL <acl> IN SCHEMA <schema> TO <grantee>;",
        revoke_sql: "REVOKE <privilege> ON ALL <acl> IN SCHEMA <schema> FROM <grantee>;",
        inspect_sql: indoc! {r#"
            WITH namespace_procs AS (
                SELECT nsp.oid, nsp.nspname,
                       array_remove(array_agg(pro.proname ORDER BY pro.proname), NULL) AS procs
                FROM pg_catalog.pg_namespace AS nsp
                LEFT OUTER JOIN pg_catalog.pg_proc AS pro
                  ON pro.pronamespace = nsp.oid
                WHERE nspname NOT LIKE 'pg\_%' AND nspname <> 'information_schema'
                GROUP BY 1, 2
            ), all_grants AS (
                SELECT pronamespace,
                       (aclexplode(proacl)).privilege_type AS priv,
                       (aclexplode(proacl)).grantee AS grantee,
                       array_agg(proname ORDER BY proname) AS procs
                FROM pg_catalog.pg_proc
                GROUP BY 1, 2, 3
            )
            SELECT '' AS owner, COALESCE(rolname, 'public') AS grantee,
                   COALESCE(priv, '') AS "type", current_database() AS "database",
                   nspname AS "schema", '' AS object,
                   NOT (nsp.procs <@ COALESCE(grants.procs, ARRAY[]::name[])) AS "partial"
            FROM namespace_procs AS nsp
            LEFT OUTER JOIN all_grants AS grants ON grants.pronamespace = nsp.oid
            LEFT OUTER JOIN pg_catalog.pg_roles ON pg_roles.oid = grants.grantee
            WHERE (grants.pronamespace IS NOT NULL OR array_length(nsp.procs, 1) IS NULL)
              AND (priv IS NULL OR priv = ANY($1))
              AND (grants.grantee IS NULL OR COALESCE(rolname, 'public') = ANY($2))
            ORDER BY 2, 5, 3;"#},
    },
    Acl {
        name: "GLOBAL DEFAULT",
        scope: Scope::Database,
        slots: &[Slot::Database, Slot::Owner, Slot::Object],
        grant_sql: "ALTER DEFAULT PRIVILEGES FOR ROLE <owner> GRANT <privilege> ON <object> TO <grantee>;",
        revoke_sql: "ALTER DEFAULT PRIVILEGES FOR ROLE <owner> REVOKE <privilege> ON <object> FROM <grantee>;",
        inspect_sql: indoc! {r#"
            SELECT pg_catalog.pg_get_userbyid(defaclrole) AS owner,
                   COALESCE(rolname, 'public') AS grantee,
                   privilege_type AS "type", current_database() AS "database",
                   '' AS "schema", c.class AS object, FALSE AS "partial"
            FROM pg_catalog.pg_default_acl AS def
            CROSS JOIN LATERAL aclexplode(def.defaclacl) AS acl
            JOIN (VALUES ('r', 'TABLES'), ('S', 'SEQUENCES'), ('f', 'FUNCTIONS'))
              AS c(obj, class) ON c.obj = def.defaclobjtype
            LEFT OUTER JOIN pg_catalog.pg_roles ON pg_roles.oid = acl.grantee
            WHERE defaclnamespace = 0
              AND privilege_type || ' ON ' || c.class = ANY($1)
              AND pg_catalog.pg_get_userbyid(defaclrole) = ANY($2)
              AND COALESCE(rolname, 'public') = ANY($2)
            ORDER BY 1, 2, 3;"#},
    },
    Acl {
        name: "SCHEMA DEFAULT",
        scope: Scope::Database,
        slots: &[Slot::Database, Slot::Owner, Slot::Schema, Slot::Object],
        grant_sql: "ALTER DEFAULT PRIVILEGES FOR ROLE <owner> IN SCHEMA <schema> GRANT <privilege> ON <object> TO <grantee>;",
        revoke_sql: "ALTER DEFAULT PRIVILEGES FOR ROLE <owner> IN SCHEMA <schema> REVOKE <privilege> ON <object> FROM <grantee>;",
        inspect_sql: indoc! {r#"
            SELECT pg_catalog.pg_get_userbyid(defaclrole) AS owner,
                   COALESCE(rolname, 'public') AS grantee,
                   privilege_type AS "type", current_database() AS "database",
                   nspname AS "schema", c.class AS object, FALSE AS "partial"
            FROM pg_catalog.pg_default_acl AS def
            JOIN pg_catalog.pg_namespace AS nsp ON nsp.oid = def.defaclnamespace
            CROSS JOIN LATERAL aclexplode(def.defaclacl) AS acl
            JOIN (VALUES ('r', 'TABLES'), ('S', 'SEQUENCES'), ('f', 'FUNCTIONS'))
              AS c(obj, class) ON c.obj = def.defaclobjtype
            LEFT OUTER JOIN pg_catalog.pg_roles ON pg_roles.oid = acl.grantee
            WHERE privilege_type || ' ON ' || c.class = ANY($1)
              AND pg_catalog.pg_get_userbyid(defaclrole) = ANY($2)
              AND COALESCE(rolname, 'public') = ANY($2)
            ORDER BY 1, 2, 5, 3;"#},
    },
];

/// One profile entry: a privilege type on an ACL, with the object class
/// for default-privilege ACLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Privilege {
    pub type_: String,
    pub on: String,
    pub object: String,
}

pub type Profile = Vec<Privilege>;

/// An unflattened profile entry: either a privilege or a reference to
/// another profile by name.
#[derive(Debug, Clone)]
pub enum ProfileEntry {
    Ref(String),
    Privilege(Privilege),
}

fn privilege(type_: &str, on: &str, object: &str) -> ProfileEntry {
    ProfileEntry::Privilege(Privilege {
        type_: type_.to_string(),
        on: on.to_string(),
        object: object.to_string(),
    })
}

fn reference(name: &str) -> ProfileEntry {
    ProfileEntry::Ref(name.to_string())
}

/// Built-in profiles. `__`-prefixed profiles are internal building blocks
/// and are hidden from the exposed profile map after flattening.
pub fn builtins() -> BTreeMap<String, Vec<ProfileEntry>> {
    let mut map = BTreeMap::new();
    let mut add = |name: &str, entries: Vec<ProfileEntry>| {
        map.insert(name.to_string(), entries);
    };

    add("__connect__", vec![privilege("CONNECT", "DATABASE", "")]);
    add("__temporary__", vec![privilege("TEMPORARY", "DATABASE", "")]);
    add("__create_on_schemas__", vec![privilege("CREATE", "SCHEMAS", "")]);
    add("__usage_on_schemas__", vec![privilege("USAGE", "SCHEMAS", "")]);

    for type_ in ["SELECT", "INSERT", "UPDATE", "DELETE", "TRUNCATE", "REFERENCES", "TRIGGER"] {
        add(
            &format!("__{}_on_tables__", type_.to_lowercase()),
            vec![
                privilege(type_, "TABLES", ""),
                privilege(type_, "GLOBAL DEFAULT", "TABLES"),
                privilege(type_, "SCHEMA DEFAULT", "TABLES"),
            ],
        );
    }
    add(
        "__all_on_tables__",
        vec![
            reference("__delete_on_tables__"),
            reference("__insert_on_tables__"),
            reference("__references_on_tables__"),
            reference("__select_on_tables__"),
            reference("__trigger_on_tables__"),
            reference("__truncate_on_tables__"),
            reference("__update_on_tables__"),
        ],
    );

    for type_ in ["SELECT", "UPDATE", "USAGE"] {
        add(
            &format!("__{}_on_sequences__", type_.to_lowercase()),
            vec![
                privilege(type_, "SEQUENCES", ""),
                privilege(type_, "GLOBAL DEFAULT", "SEQUENCES"),
                privilege(type_, "SCHEMA DEFAULT", "SEQUENCES"),
            ],
        );
    }
    add(
        "__all_on_sequences__",
        vec![
            reference("__select_on_sequences__"),
            reference("__update_on_sequences__"),
            reference("__usage_on_sequences__"),
        ],
    );

    add(
        "__execute_on_functions__",
        vec![
            privilege("EXECUTE", "FUNCTIONS", ""),
            privilege("EXECUTE", "GLOBAL DEFAULT", "FUNCTIONS"),
            privilege("EXECUTE", "SCHEMA DEFAULT", "FUNCTIONS"),
        ],
    );

    add(
        "ro",
        vec![
            reference("__connect__"),
            reference("__usage_on_schemas__"),
            reference("__select_on_tables__"),
            reference("__select_on_sequences__"),
        ],
    );
    add(
        "rw",
        vec![
            reference("ro"),
            reference("__temporary__"),
            reference("__insert_on_tables__"),
            reference("__update_on_tables__"),
            reference("__delete_on_tables__"),
            reference("__usage_on_sequences__"),
            reference("__update_on_sequences__"),
        ],
    );
    add(
        "ddl",
        vec![
            reference("rw"),
            reference("__create_on_schemas__"),
            reference("__execute_on_functions__"),
        ],
    );

    map
}

/// Replace profile references by the referenced entries, in topological
/// order. Rejects unknown references and inheritance cycles. Internal
/// `__` profiles are removed from the output.
pub fn flatten(profiles: &BTreeMap<String, Vec<ProfileEntry>>) -> Result<BTreeMap<String, Profile>> {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();
    for name in profiles.keys() {
        nodes.insert(name.as_str(), graph.add_node(name.as_str()));
    }
    for (name, entries) in profiles {
        for entry in entries {
            if let ProfileEntry::Ref(target) = entry {
                let to = *nodes.get(target.as_str()).ok_or_else(|| {
                    Error::Config(format!(
                        "privileges: {}: unknown profile reference: {}",
                        name, target
                    ))
                })?;
                graph.add_edge(to, nodes[name.as_str()], ());
            }
        }
    }

    let order = toposort(&graph, None).map_err(|cycle| {
        Error::Config(format!(
            "privileges: inheritance cycle through profile {}",
            graph[cycle.node_id()]
        ))
    })?;

    // Parents resolve before children, so a single pass suffices.
    let mut flat: BTreeMap<String, Profile> = BTreeMap::new();
    for index in order {
        let name = graph[index];
        let mut resolved = Vec::new();
        for entry in &profiles[name] {
            match entry {
                ProfileEntry::Privilege(p) => resolved.push(p.clone()),
                ProfileEntry::Ref(target) => resolved.extend(flat[target.as_str()].iter().cloned()),
            }
        }
        flat.insert(name.to_string(), resolved);
    }

    flat.retain(|name, _| !name.starts_with("__"));
    Ok(flat)
}

/// Immutable post-configuration registry: exposed profiles and, per ACL,
/// the managed privilege types. Built once, then only read.
#[derive(Debug, Default)]
pub struct Registry {
    profiles: BTreeMap<String, Profile>,
    managed: BTreeMap<String, Vec<String>>,
}

impl Registry {
    pub fn build(profiles: BTreeMap<String, Profile>) -> Result<Self> {
        let mut managed: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, profile) in &profiles {
            for priv_ in profile {
                let acl = Acl::lookup(&priv_.on).map_err(|_| {
                    Error::Config(format!(
                        "privileges: {}: unknown ACL: {}",
                        name, priv_.on
                    ))
                })?;
                // Default-privilege types carry their object class so one
                // ACL can manage TABLES and SEQUENCES defaults apart.
                let type_ = if acl.is_default() {
                    format!("{} ON {}", priv_.type_, priv_.object)
                } else {
                    priv_.type_.clone()
                };
                let types = managed.entry(acl.name.to_string()).or_default();
                if !types.contains(&type_) {
                    types.push(type_);
                }
            }
        }
        Ok(Registry { profiles, managed })
    }

    pub fn profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.get(name)
    }

    /// Managed privilege types for one ACL. Empty when the ACL is not
    /// referenced by any profile.
    pub fn managed_types(&self, acl: &str) -> &[String] {
        self.managed.get(acl).map(Vec::as_slice).unwrap_or(&[])
    }

    /// ACL names with at least one managed type, in catalog order,
    /// filtered by `pred`.
    pub fn managed_acls(&self, pred: impl Fn(&Acl) -> bool) -> Vec<&'static Acl> {
        ACLS.iter()
            .filter(|acl| !self.managed_types(acl.name).is_empty() && pred(acl))
            .collect()
    }

    /// Whether any privilege is under management at all.
    pub fn is_empty(&self) -> bool {
        self.managed.is_empty()
    }

    /// Forget all managed privileges (--skip-privileges).
    pub fn drop_privileges(&mut self) {
        self.profiles.clear();
        self.managed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acl_catalog() {
        let database = Acl::lookup("DATABASE").unwrap();
        assert_eq!(database.scope, Scope::Instance);
        assert!(database.uses(Slot::Database));
        assert!(!database.is_default());

        let global = Acl::lookup("GLOBAL DEFAULT").unwrap();
        assert!(global.is_default());
        assert!(!global.uses(Slot::Schema));

        assert!(Acl::lookup("NOPE").is_err());
    }

    #[test]
    fn test_flatten_builtins() {
        let flat = flatten(&builtins()).unwrap();
        // Internal profiles are hidden.
        assert!(flat.keys().all(|name| !name.starts_with("__")));
        let ro = &flat["ro"];
        assert!(ro
            .iter()
            .any(|p| p.type_ == "CONNECT" && p.on == "DATABASE"));
        assert!(ro.iter().any(|p| p.type_ == "SELECT" && p.on == "TABLES"));
    }

    #[test]
    fn test_flatten_unknown_reference() {
        let mut profiles = builtins();
        profiles.insert("broken".to_string(), vec![reference("__nope__")]);
        assert!(flatten(&profiles).is_err());
    }

    #[test]
    fn test_flatten_cycle() {
        let mut profiles = BTreeMap::new();
        profiles.insert("a".to_string(), vec![reference("b")]);
        profiles.insert("b".to_string(), vec![reference("a")]);
        let err = flatten(&profiles).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_registry_managed_types() {
        let flat = flatten(&builtins()).unwrap();
        let registry = Registry::build(flat).unwrap();
        assert!(registry
            .managed_types("DATABASE")
            .contains(&"CONNECT".to_string()));
        assert!(registry
            .managed_types("GLOBAL DEFAULT")
            .contains(&"SELECT ON TABLES".to_string()));
        assert!(!registry.is_empty());
    }
}

