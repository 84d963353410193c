//! PostgreSQL side: connection cache, statement model and applier.
//!
//! One connection per database, opened on first use and kept for the whole
//! run. Connection parameters come from the standard PG* environment
//! variables; only the database name is set by the engine.

use crate::errors::{Error, Result};
use crate::perf::StopWatch;
use ansi_term::Colour::{Green, Purple};
use log::{debug, info};
use postgres::{Client, NoTls};
use std::collections::{BTreeMap, HashMap};

/// An inspected database: owner and known schemas.
#[derive(Debug, Clone, Default)]
pub struct Database {
    pub name: String,
    pub owner: String,
    pub schemas: BTreeMap<String, Schema>,
}

/// An inspected schema and the roles allowed to create objects in it.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    pub name: String,
    pub creators: Vec<String>,
}

/// Quote an SQL identifier, doubling embedded double quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote an SQL string literal, doubling embedded single quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// One reconciliation statement, fully formatted, routed to a database.
///
/// An empty `database` targets the default database.
#[derive(Debug, Clone)]
pub struct SyncQuery {
    pub description: &'static str,
    pub database: String,
    pub sql: String,
    pub tags: Vec<(&'static str, String)>,
}

impl SyncQuery {
    /// One line: description, key-value tags, then the SQL.
    pub fn log_line(&self) -> String {
        let mut line = String::from(self.description);
        for (key, value) in &self.tags {
            line.push_str(&format!(" {}={}", key, value));
        }
        line.push_str(&format!(" | {}", self.sql.trim()));
        line
    }
}

fn env_or(name: &str, fallback: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| fallback.to_string())
}

/// Default database for this run: PGDATABASE, then the connection user.
pub fn default_database() -> String {
    let user = env_or("PGUSER", &env_or("USER", "postgres"));
    env_or("PGDATABASE", &user)
}

fn connect(dbname: &str) -> std::result::Result<Client, postgres::Error> {
    let mut config = postgres::Config::new();
    config.host(&env_or("PGHOST", "localhost"));
    config.port(
        std::env::var("PGPORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(5432),
    );
    config.user(&env_or("PGUSER", &env_or("USER", "postgres")));
    if let Ok(password) = std::env::var("PGPASSWORD") {
        config.password(&password);
    }
    config.dbname(dbname);
    config.connect(NoTls)
}

/// Process-wide cache: one connection per database name.
#[derive(Default)]
pub struct ConnectionCache {
    conns: HashMap<String, Client>,
}

impl ConnectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, dbname: &str) -> Result<&mut Client> {
        if !self.conns.contains_key(dbname) {
            debug!("Opening Postgres connection. database={}", dbname);
            let client = connect(dbname).map_err(Error::Inspect)?;
            self.conns.insert(dbname.to_string(), client);
        }
        Ok(self.conns.get_mut(dbname).unwrap())
    }
}

/// Regroup statements per target database, default database first, to
/// minimize connection switches. Statements without an explicit database
/// are routed to the default database. Intra-database order is preserved.
pub fn group_by_database(
    queries: Vec<SyncQuery>,
    default_database: &str,
) -> Vec<SyncQuery> {
    let mut order: Vec<String> = vec![default_database.to_string()];
    let mut groups: HashMap<String, Vec<SyncQuery>> = HashMap::new();
    for mut query in queries {
        if query.database.is_empty() {
            query.database = default_database.to_string();
        }
        if !order.contains(&query.database) {
            order.push(query.database.clone());
        }
        groups.entry(query.database.clone()).or_default().push(query);
    }

    let mut out = Vec::new();
    for dbname in order {
        if let Some(group) = groups.remove(&dbname) {
            out.extend(group);
        }
    }
    out
}

/// Serialize statements to the cluster, or echo them in dry-run mode.
///
/// Returns the number of statements handled. The first execution failure
/// aborts the run.
pub fn apply(
    cache: &mut ConnectionCache,
    watch: &mut StopWatch,
    queries: impl IntoIterator<Item = SyncQuery>,
    default_database: &str,
    real: bool,
    color: bool,
) -> Result<u64> {
    let mut count = 0;
    for mut query in queries {
        if query.database.is_empty() {
            query.database = default_database.to_string();
        }
        query.tags.push(("database", query.database.clone()));
        count += 1;

        if !real {
            let prefix = if color {
                Purple.paint("Would").to_string()
            } else {
                "Would".to_string()
            };
            info!("{} {}", prefix, query.log_line());
            continue;
        }

        let prefix = if color {
            Green.paint("Apply").to_string()
        } else {
            "Apply".to_string()
        };
        info!("{} {}", prefix, query.log_line());

        let client = cache.get(&query.database)?;
        let result = watch.time_it(|| client.batch_execute(&query.sql));
        if let Err(source) = result {
            return Err(Error::Apply {
                query: query.sql.clone(),
                source,
            });
        }
        debug!("Query terminated. database={}", query.database);
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(database: &str, sql: &str) -> SyncQuery {
        SyncQuery {
            description: "Test.",
            database: database.to_string(),
            sql: sql.to_string(),
            tags: vec![],
        }
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("alice"), "\"alice\"");
        assert_eq!(quote_ident("wei\"rd"), "\"wei\"\"rd\"");
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("it's"), "'it''s'");
    }

    #[test]
    fn test_group_by_database_default_first() {
        let queries = vec![
            query("extra", "SELECT 1;"),
            query("", "SELECT 2;"),
            query("extra", "SELECT 3;"),
            query("postgres", "SELECT 4;"),
        ];
        let grouped = group_by_database(queries, "postgres");
        let databases: Vec<&str> = grouped.iter().map(|q| q.database.as_str()).collect();
        assert_eq!(databases, vec!["postgres", "postgres", "extra", "extra"]);
        // Intra-database order is stable.
        assert_eq!(grouped[0].sql, "SELECT 2;");
        assert_eq!(grouped[1].sql, "SELECT 4;");
        assert_eq!(grouped[2].sql, "SELECT 1;");
        assert_eq!(grouped[3].sql, "SELECT 3;");
    }

    #[test]
    fn test_log_line_format() {
        let mut q = query("app", "GRANT CONNECT ON DATABASE \"app\" TO \"alice\";");
        q.tags.push(("grant", "CONNECT ON DATABASE app".to_string()));
        assert_eq!(
            q.log_line(),
            "Test. grant=CONNECT ON DATABASE app | GRANT CONNECT ON DATABASE \"app\" TO \"alice\";"
        );
    }
}
