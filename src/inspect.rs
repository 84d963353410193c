//! Staged cluster inspection.
//!
//! Stage 0 bootstraps session facts before any rule runs. Stage 1 reads
//! instance-wide state: databases, roles, memberships, the managed
//! subset. Stage 2 reads per-database schemas and creators. Current
//! grants are inspected per ACL with the managed types and roles as
//! filters.

use crate::config::{InspectQuery, PostgresSection};
use crate::errors::{Error, Result};
use crate::perf::StopWatch;
use crate::postgres::{ConnectionCache, Database, Schema};
use crate::privileges::{Acl, Grant};
use crate::role::{options, Membership, Role};
use indoc::{formatdoc, indoc};
use log::debug;
use std::collections::BTreeMap;

const DEFAULT_DATABASES_QUERY: &str = indoc! {r#"
    SELECT datname FROM pg_catalog.pg_database
    WHERE datallowconn AND NOT datistemplate
    ORDER BY 1;"#};

const DATABASES_OWNERS_QUERY: &str = indoc! {r#"
    SELECT datname, pg_catalog.pg_get_userbyid(datdba) AS owner
    FROM pg_catalog.pg_database
    WHERE datallowconn AND NOT datistemplate
    ORDER BY 1;"#};

const ROLE_COLUMNS_QUERY: &str = indoc! {r#"
    SELECT attname FROM pg_catalog.pg_attribute
    WHERE attrelid = 'pg_catalog.pg_roles'::regclass AND attnum > 0
    ORDER BY attnum;"#};

const MEMBERSHIPS_QUERY: &str = indoc! {r#"
    SELECT member.rolname AS member, parent.rolname AS parent,
           grantor.rolname AS grantor
    FROM pg_catalog.pg_auth_members AS am
    JOIN pg_catalog.pg_roles AS member ON member.oid = am.member
    JOIN pg_catalog.pg_roles AS parent ON parent.oid = am.roleid
    LEFT OUTER JOIN pg_catalog.pg_roles AS grantor ON grantor.oid = am.grantor
    ORDER BY 1, 2;"#};

const DEFAULT_SCHEMAS_QUERY: &str = indoc! {r#"
    SELECT nspname FROM pg_catalog.pg_namespace
    WHERE nspname NOT LIKE 'pg\_%' AND nspname <> 'information_schema'
    ORDER BY 1;"#};

const CREATORS_QUERY: &str = indoc! {r#"
    SELECT nsp.nspname,
           array_remove(array_agg(DISTINCT rol.rolname ORDER BY rol.rolname)
             FILTER (WHERE pg_catalog.has_schema_privilege(rol.rolname, nsp.nspname, 'CREATE')),
             NULL) AS creators
    FROM pg_catalog.pg_namespace AS nsp
    CROSS JOIN pg_catalog.pg_roles AS rol
    WHERE nsp.nspname = ANY($1)
    GROUP BY 1
    ORDER BY 1;"#};

/// Default exclusion when roles_blacklist_query is unset.
const DEFAULT_ROLES_BLACKLIST: [&str; 2] = ["postgres", "pg_*"];

/// Ordered list of glob patterns; first match wins.
#[derive(Debug, Default)]
pub struct Blacklist(Vec<glob::Pattern>);

impl Blacklist {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut compiled = Vec::new();
        for pattern in patterns {
            compiled.push(
                glob::Pattern::new(pattern)
                    .map_err(|e| Error::Config(format!("roles_blacklist: {}: {}", pattern, e)))?,
            );
        }
        Ok(Blacklist(compiled))
    }

    /// The first matching pattern, if any.
    pub fn match_string(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|pattern| pattern.matches(name))
            .map(|pattern| pattern.as_str())
    }
}

/// Everything known about the target cluster during one run.
#[derive(Debug, Default)]
pub struct Instance {
    pub version_num: i32,
    pub me: String,
    pub default_database: String,
    pub fallback_owner: String,
    pub roles_blacklist: Blacklist,
    pub role_columns: Vec<String>,
    pub all_roles: BTreeMap<String, Role>,
    pub managed_roles: BTreeMap<String, Role>,
    pub databases: BTreeMap<String, Database>,
}

/// Run an inspect query returning one text column, or splice a static
/// list from the configuration.
fn query_strings(
    cache: &mut ConnectionCache,
    watch: &mut StopWatch,
    dbname: &str,
    query: &InspectQuery,
) -> Result<Vec<String>> {
    match query {
        InspectQuery::Static(values) => Ok(values.clone()),
        InspectQuery::Sql(sql) => {
            let client = cache.get(dbname)?;
            let rows = watch
                .time_it(|| client.query(sql.as_str(), &[]))
                .map_err(Error::Inspect)?;
            Ok(rows.iter().map(|row| row.get(0)).collect())
        }
    }
}

impl Instance {
    /// Stage 0: session facts and the roles blacklist.
    pub fn stage0(
        cache: &mut ConnectionCache,
        watch: &mut StopWatch,
        section: &PostgresSection,
        default_database: &str,
    ) -> Result<Instance> {
        let mut instance = Instance {
            default_database: default_database.to_string(),
            ..Default::default()
        };

        let client = cache.get(default_database)?;
        let row = watch
            .time_it(|| {
                client.query_one(
                    "SELECT current_setting('server_version_num')::int, current_user::text, current_database()::text;",
                    &[],
                )
            })
            .map_err(Error::Inspect)?;
        instance.version_num = row.get(0);
        instance.me = row.get(1);
        instance.default_database = row.get(2);
        debug!(
            "Inspected session. version={} me={} database={}",
            instance.version_num, instance.me, instance.default_database
        );

        instance.fallback_owner = section
            .fallback_owner
            .clone()
            .unwrap_or_else(|| instance.me.clone());

        let patterns = match &section.roles_blacklist_query {
            Some(query) => query_strings(cache, watch, default_database, query)?,
            None => DEFAULT_ROLES_BLACKLIST
                .iter()
                .map(|s| s.to_string())
                .collect(),
        };
        instance.roles_blacklist = Blacklist::new(&patterns)?;
        debug!("Roles blacklist loaded. patterns={:?}", patterns);

        Ok(instance)
    }

    /// Stage 1: databases, roles with options and memberships, the
    /// managed subset.
    pub fn stage1(
        &mut self,
        cache: &mut ConnectionCache,
        watch: &mut StopWatch,
        section: &PostgresSection,
    ) -> Result<()> {
        self.inspect_databases(cache, watch, section)?;
        self.inspect_roles(cache, watch)?;
        self.inspect_managed_roles(cache, watch, section)?;
        Ok(())
    }

    fn inspect_databases(
        &mut self,
        cache: &mut ConnectionCache,
        watch: &mut StopWatch,
        section: &PostgresSection,
    ) -> Result<()> {
        debug!("Inspecting managed databases.");
        let query = section
            .databases_query
            .clone()
            .unwrap_or_else(|| InspectQuery::Sql(DEFAULT_DATABASES_QUERY.to_string()));
        let managed = query_strings(cache, watch, &self.default_database, &query)?;

        let client = cache.get(&self.default_database)?;
        let rows = watch
            .time_it(|| client.query(DATABASES_OWNERS_QUERY, &[]))
            .map_err(Error::Inspect)?;
        for row in rows {
            let name: String = row.get(0);
            if !managed.contains(&name) {
                continue;
            }
            debug!("Found database. name={}", name);
            self.databases.insert(
                name.clone(),
                Database {
                    name,
                    owner: row.get(1),
                    schemas: BTreeMap::new(),
                },
            );
        }
        Ok(())
    }

    fn inspect_roles(&mut self, cache: &mut ConnectionCache, watch: &mut StopWatch) -> Result<()> {
        let client = cache.get(&self.default_database)?;

        debug!("Inspecting role option columns.");
        let rows = watch
            .time_it(|| client.query(ROLE_COLUMNS_QUERY, &[]))
            .map_err(Error::Inspect)?;
        let available: Vec<String> = rows.iter().map(|row| row.get(0)).collect();
        self.role_columns = options::COLUMNS
            .iter()
            .map(|(column, _)| column.to_string())
            .filter(|column| available.contains(column))
            .collect();
        debug!("Effective role options. columns={:?}", self.role_columns);

        debug!("Inspecting all roles.");
        let sql = formatdoc! {r#"
            SELECT rol.rolname::text,
                   pg_catalog.shobj_description(rol.oid, 'pg_authid') AS comment,
                   COALESCE(rol.rolconfig, '{{}}'::text[]) AS config,
                   rol.{}
            FROM pg_catalog.pg_roles AS rol
            ORDER BY 1;"#,
            self.role_columns.join(", rol.")
        };
        let rows = watch
            .time_it(|| client.query(sql.as_str(), &[]))
            .map_err(Error::Inspect)?;
        for row in rows {
            let mut role = Role {
                name: row.get(0),
                comment: row.get::<_, Option<String>>(1).unwrap_or_default(),
                ..Default::default()
            };
            let settings: Vec<String> = row.get(2);
            if !settings.is_empty() {
                let mut config = BTreeMap::new();
                for setting in settings {
                    if let Some((name, value)) = setting.split_once('=') {
                        config.insert(name.to_string(), value.to_string());
                    }
                }
                role.config = Some(config);
            }
            for (offset, column) in self.role_columns.iter().enumerate() {
                let index = 3 + offset;
                if column == "rolconnlimit" {
                    role.options.conn_limit = row.get(index);
                } else {
                    role.options.set_bool(column, row.get(index));
                }
            }

            if let Some(pattern) = self.roles_blacklist.match_string(&role.name) {
                debug!(
                    "Ignoring blacklisted role. name={} pattern={}",
                    role.name, pattern
                );
                continue;
            }
            self.all_roles.insert(role.name.clone(), role);
        }

        debug!("Inspecting role memberships.");
        let rows = watch
            .time_it(|| client.query(MEMBERSHIPS_QUERY, &[]))
            .map_err(Error::Inspect)?;
        for row in rows {
            let member: String = row.get(0);
            if let Some(role) = self.all_roles.get_mut(&member) {
                role.parents.push(Membership {
                    name: row.get(1),
                    grantor: row.get::<_, Option<String>>(2).unwrap_or_default(),
                });
            }
        }
        Ok(())
    }

    fn inspect_managed_roles(
        &mut self,
        cache: &mut ConnectionCache,
        watch: &mut StopWatch,
        section: &PostgresSection,
    ) -> Result<()> {
        match &section.managed_roles_query {
            None => {
                debug!("Managing all roles.");
                self.managed_roles = self.all_roles.clone();
            }
            Some(query) => {
                debug!("Inspecting managed roles.");
                for name in query_strings(cache, watch, &self.default_database, query)? {
                    if let Some(pattern) = self.roles_blacklist.match_string(&name) {
                        debug!(
                            "Ignoring blacklisted role. name={} pattern={}",
                            name, pattern
                        );
                        continue;
                    }
                    if name == "public" {
                        // Pseudo-role, relevant for privileges only.
                        self.managed_roles.insert(name, Role::default());
                        continue;
                    }
                    if let Some(role) = self.all_roles.get(&name) {
                        self.managed_roles.insert(name, role.clone());
                    }
                }
            }
        }
        Ok(())
    }

    /// Stage 2: schemas and creator sets for one database.
    pub fn stage2(
        &mut self,
        cache: &mut ConnectionCache,
        watch: &mut StopWatch,
        dbname: &str,
        schemas_query: &Option<InspectQuery>,
    ) -> Result<()> {
        debug!("Inspecting schemas. database={}", dbname);
        let query = schemas_query
            .clone()
            .unwrap_or_else(|| InspectQuery::Sql(DEFAULT_SCHEMAS_QUERY.to_string()));
        let names = query_strings(cache, watch, dbname, &query)?;

        let client = cache.get(dbname)?;
        let rows = watch
            .time_it(|| client.query(CREATORS_QUERY, &[&names]))
            .map_err(Error::Inspect)?;
        let database = self
            .databases
            .get_mut(dbname)
            .ok_or_else(|| Error::Internal(format!("unknown database: {}", dbname)))?;
        database.schemas.clear();
        for row in rows {
            let name: String = row.get(0);
            let creators: Vec<String> = row.get::<_, Option<Vec<String>>>(1).unwrap_or_default();
            let creators: Vec<String> = creators
                .into_iter()
                .filter(|role| self.roles_blacklist.match_string(role).is_none())
                .collect();
            debug!(
                "Found schema. database={} schema={} creators={:?}",
                dbname, name, creators
            );
            database
                .schemas
                .insert(name.clone(), Schema { name, creators });
        }
        Ok(())
    }

    /// Current grants for one ACL in one database, restricted to managed
    /// privilege types and managed roles. Stage 2 inspects object ACLs,
    /// stage 3 the default-privilege ACLs.
    pub fn inspect_grants(
        &self,
        cache: &mut ConnectionCache,
        watch: &mut StopWatch,
        dbname: &str,
        acl: &Acl,
        types: &[String],
        roles: &[String],
    ) -> Result<Vec<Grant>> {
        debug!(
            "Inspecting grants. database={} acl={} types={:?}",
            dbname, acl.name, types
        );
        let types: Vec<String> = types.to_vec();
        let roles: Vec<String> = roles.to_vec();
        let client = cache.get(dbname)?;
        let rows = watch
            .time_it(|| client.query(acl.inspect_sql, &[&types, &roles]))
            .map_err(Error::Inspect)?;

        let mut grants = Vec::new();
        for row in rows {
            let grant = Grant {
                owner: row.get(0),
                grantee: row.get(1),
                type_: row.get(2),
                database: row.get(3),
                schema: row.get(4),
                object: row.get(5),
                partial: row.get(6),
                acl: acl.name.to_string(),
            };
            // Unmanaged databases are invisible to the diff.
            if !grant.database.is_empty() && !self.databases.contains_key(&grant.database) {
                continue;
            }
            grants.push(grant);
        }
        debug!(
            "Inspected grants. database={} acl={} count={}",
            dbname,
            acl.name,
            grants.len()
        );
        Ok(grants)
    }

    /// Databases in sync order: the default database first, the rest in
    /// name order.
    pub fn sync_order(&self) -> Vec<String> {
        let mut order = Vec::new();
        if self.databases.contains_key(&self.default_database) {
            order.push(self.default_database.clone());
        }
        for name in self.databases.keys() {
            if *name != self.default_database {
                order.push(name.clone());
            }
        }
        order
    }
}
