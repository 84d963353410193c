//! One reconcile pass: rules to wanted state, inspection, diffs, and the
//! applier loop.

use crate::config::{self, Config};
use crate::errors::Result;
use crate::inspect::Instance;
use crate::ldap;
use crate::perf::{self, StopWatch};
use crate::postgres::{self, ConnectionCache};
use crate::privileges::{self, Acl, Grant, Scope};
use crate::role::{self, Role};
use crate::rules;
use ascii_table::AsciiTable;
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

/// Run-wide switches from the command line.
#[derive(Debug, Default)]
pub struct Controller {
    pub config: Option<PathBuf>,
    pub real: bool,
    pub check: bool,
    pub skip_privileges: bool,
    pub color: bool,
}

/// Execute a full reconciliation and return the number of statements
/// emitted (executed in real mode, logged in dry-run).
pub fn run(controller: &Controller) -> Result<u64> {
    let start = Instant::now();

    let path = config::find_file(controller.config.as_deref())?;
    let mut config = Config::load(&path)?;
    if controller.skip_privileges {
        config.drop_privileges();
    }

    let mut cache = ConnectionCache::new();
    let mut pg_watch = StopWatch::default();
    let mut ldap_watch = StopWatch::default();

    let default_database = postgres::default_database();
    let mut instance = Instance::stage0(
        &mut cache,
        &mut pg_watch,
        &config.postgres,
        &default_database,
    )?;

    if controller.real {
        info!("Real mode. Postgres instance will be modified.");
    } else {
        warn!("Dry run. Postgres instance will be untouched.");
    }

    let (wanted_roles, wanted_grants) =
        generate_wanted(&config, &instance, &mut ldap_watch)?;
    debug!(
        "Generated wanted state. roles={} grants={}",
        wanted_roles.len(),
        wanted_grants.len()
    );

    instance.stage1(&mut cache, &mut pg_watch, &config.postgres)?;

    let mut summary = vec![
        vec!["Step".to_string(), "Queries".to_string()],
        vec!["---".to_string(), "---".to_string()],
    ];

    // Roles first: privileges reference roles that must exist.
    let mut databases = instance.databases.clone();
    let queries = role::diff(
        &instance.all_roles,
        &instance.managed_roles,
        &wanted_roles,
        &instance.me,
        &instance.fallback_owner,
        &mut databases,
        &instance.role_columns,
    );
    instance.databases = databases;
    let queries = postgres::group_by_database(queries, &instance.default_database);
    let count = postgres::apply(
        &mut cache,
        &mut pg_watch,
        queries,
        &instance.default_database,
        controller.real,
        controller.color,
    )?;
    if count == 0 {
        info!("All roles synchronized.");
    }
    summary.push(vec!["roles".to_string(), count.to_string()]);
    let mut query_count = count;

    if config.are_privileges_managed() {
        debug!("Synchronizing privileges.");
        // The effective role set for ACL comparison: wanted roles, plus
        // the public pseudo-role when it is managed.
        let mut privilege_roles: Vec<String> = wanted_roles.keys().cloned().collect();
        if instance.managed_roles.contains_key("public") {
            privilege_roles.push("public".to_string());
        }
        let all_databases: Vec<String> = instance.databases.keys().cloned().collect();

        for dbname in instance.sync_order() {
            debug!("Stage 2: privileges. database={}", dbname);
            instance.stage2(&mut cache, &mut pg_watch, &dbname, &config.postgres.schemas_query)?;

            // Instance-wide ACLs are synchronized once, on the default
            // database pass.
            let instance_pass = dbname == instance.default_database;
            let acls = config.registry.managed_acls(|acl| {
                !acl.is_default() && (acl.scope == Scope::Database || instance_pass)
            });
            let count = sync_privileges(
                &mut cache,
                &mut pg_watch,
                &instance,
                &config,
                &wanted_grants,
                &dbname,
                &acls,
                &privilege_roles,
                &all_databases,
                controller,
            )?;
            if count == 0 {
                info!("All privileges configured. database={}", dbname);
            }
            summary.push(vec![format!("privileges on {}", dbname), count.to_string()]);
            query_count += count;

            debug!("Stage 3: default privileges. database={}", dbname);
            let acls = config.registry.managed_acls(|acl| acl.is_default());
            let count = sync_privileges(
                &mut cache,
                &mut pg_watch,
                &instance,
                &config,
                &wanted_grants,
                &dbname,
                &acls,
                &privilege_roles,
                &all_databases,
                controller,
            )?;
            if count == 0 {
                info!("All default privileges configured. database={}", dbname);
            }
            summary.push(vec![
                format!("default privileges on {}", dbname),
                count.to_string(),
            ]);
            query_count += count;
        }
    } else {
        info!("Not synchronizing privileges.");
    }

    print_summary(summary);
    let elapsed = start.elapsed();
    let line = format!(
        "elapsed={:?} mempeak={} postgres={:?} queries={} ldap={:?} searches={}",
        elapsed,
        perf::format_bytes(perf::read_vm_peak()),
        pg_watch.total,
        query_count,
        ldap_watch.total,
        ldap_watch.count,
    );
    if query_count > 0 {
        info!("Comparison complete. {}", line);
    } else {
        info!("Nothing to do. {}", line);
    }

    Ok(query_count)
}

/// Run every rule and merge the produced roles and grants. The LDAP
/// connection opens lazily, on the first dynamic rule, and roles or
/// grantees matching the blacklist never enter the wanted state.
fn generate_wanted(
    config: &Config,
    instance: &Instance,
    ldap_watch: &mut StopWatch,
) -> Result<(BTreeMap<String, Role>, Vec<Grant>)> {
    let mut wanted_roles = BTreeMap::new();
    let mut wanted_grants = Vec::new();
    let mut directory: Option<ldap::Client> = None;

    for rule in &config.rules {
        debug!("Processing rule. description={:?}", rule.description);
        let results = if rule.is_static() {
            None
        } else {
            if directory.is_none() {
                directory = Some(ldap::Client::connect_from_env()?);
            }
            match directory.as_mut() {
                Some(client) => Some(client.run(ldap_watch, &rule.ldap_search, &rule.fields())?),
                None => None,
            }
        };

        for role_rule in &rule.roles {
            let mut roles = role_rule.generate(results.as_ref());
            roles.retain(|role| {
                match instance.roles_blacklist.match_string(&role.name) {
                    Some(pattern) => {
                        warn!(
                            "Ignoring blacklisted wanted role. role={} pattern={}",
                            role.name, pattern
                        );
                        false
                    }
                    None => true,
                }
            });
            rules::merge_roles(&mut wanted_roles, roles);
        }

        for grant_rule in &rule.grants {
            let mut grants = grant_rule.generate(results.as_ref(), &config.registry)?;
            grants.retain(|grant| {
                instance.roles_blacklist.match_string(&grant.grantee).is_none()
            });
            wanted_grants.extend(grants);
        }
    }
    Ok((wanted_roles, wanted_grants))
}

/// Expand, inspect and diff one database for a set of ACLs, applying the
/// resulting statements as they come.
#[allow(clippy::too_many_arguments)]
fn sync_privileges(
    cache: &mut ConnectionCache,
    pg_watch: &mut StopWatch,
    instance: &Instance,
    config: &Config,
    wanted_grants: &[Grant],
    dbname: &str,
    acls: &[&'static Acl],
    roles: &[String],
    all_databases: &[String],
    controller: &Controller,
) -> Result<u64> {
    let database = match instance.databases.get(dbname) {
        Some(database) => database,
        None => return Ok(0),
    };

    let mut count = 0;
    for acl in acls {
        let wanted: Vec<Grant> = wanted_grants
            .iter()
            .filter(|grant| grant.acl == acl.name)
            .cloned()
            .collect();
        let expanded = privileges::grant::expand(&wanted, database, all_databases)?;
        let current = instance.inspect_grants(
            cache,
            pg_watch,
            dbname,
            acl,
            config.registry.managed_types(acl.name),
            roles,
        )?;
        let queries = privileges::diff::diff(&current, &expanded)?;
        count += postgres::apply(
            cache,
            pg_watch,
            queries,
            &instance.default_database,
            controller.real,
            controller.color,
        )?;
        debug!("Privileges synchronized. acl={} database={}", acl.name, dbname);
    }
    Ok(count)
}

fn print_summary(summary: Vec<Vec<String>>) {
    let term_width = term_size::dimensions().map(|(w, _)| w).unwrap_or(120);
    let mut table = AsciiTable::default();
    table.set_max_width(term_width);
    info!("Summary:\n{}", table.format(summary));
}
