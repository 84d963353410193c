//! Configuration loading: file discovery, environment expansion, YAML
//! normalization and the typed model build.

pub mod normalize;
pub mod rules;

use crate::errors::{Error, Result};
use crate::fmt::Format;
use crate::ldap::{OnUnexpectedDn, Search, SubSearch};
use crate::privileges::{Privilege, Profile, Registry};
use crate::role::RoleOptions;
use crate::rules::{GrantRule, Rule, RoleRule};
use envmnt::{ExpandOptions, ExpansionType};
use log::{debug, info};
use normalize::{get_string, into_mapping, key, type_name, yaml_to_string};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A user-supplied inspection query: either SQL returning a single text
/// column, or a literal list of values.
#[derive(Debug, Clone)]
pub enum InspectQuery {
    Sql(String),
    Static(Vec<String>),
}

impl InspectQuery {
    fn from_yaml(value: &Value, path: &str) -> Result<Self> {
        match value {
            Value::String(sql) => Ok(InspectQuery::Sql(sql.clone())),
            Value::Sequence(items) => {
                let mut values = Vec::new();
                for item in items {
                    values.push(yaml_to_string(item).map_err(|e| e.in_path(path))?);
                }
                Ok(InspectQuery::Static(values))
            }
            other => Err(Error::Config(format!(
                "{}: must be a SQL string or a list, got {}",
                path,
                type_name(other)
            ))),
        }
    }
}

/// The `postgres` section: inspection knobs.
#[derive(Debug, Default)]
pub struct PostgresSection {
    pub fallback_owner: Option<String>,
    pub databases_query: Option<InspectQuery>,
    pub managed_roles_query: Option<InspectQuery>,
    pub roles_blacklist_query: Option<InspectQuery>,
    pub schemas_query: Option<InspectQuery>,
}

/// The canonical configuration: inspection knobs, privilege registry and
/// rules. Immutable once built.
#[derive(Debug, Default)]
pub struct Config {
    pub postgres: PostgresSection,
    pub registry: Registry,
    pub rules: Vec<Rule>,
}

/// Search order for the configuration file when --config is not given.
pub fn find_file(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    let mut candidates = vec![
        PathBuf::from("./pgldapsync.yml"),
        PathBuf::from("./pgldapsync.yaml"),
    ];
    if let Ok(home) = std::env::var("HOME") {
        candidates.push(PathBuf::from(home).join(".config/pgldapsync.yml"));
    }
    candidates.push(PathBuf::from("/etc/pgldapsync.yml"));
    for candidate in &candidates {
        if candidate.exists() {
            return Ok(candidate.clone());
        }
    }
    Err(Error::Config(
        "no configuration file found, use --config".to_string(),
    ))
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        info!("Using YAML configuration file. path={:?}", path);
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{:?}: {}", path, e)))?;
        Self::from_yaml_str(&text)
    }

    /// Parse and build from YAML text. Environment variables in the text
    /// are expanded first, `${VAR}` and `${VAR:default}` forms.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let mut options = ExpandOptions::new();
        options.expansion_type = Some(ExpansionType::UnixBracketsWithDefaults);
        let text = envmnt::expand(text, Some(options));

        let value: Value =
            serde_yaml::from_str(&text).map_err(|e| Error::Config(e.to_string()))?;
        let canonical = rules::normalize(value)?;
        Self::from_normalized(canonical)
    }

    /// Decode the canonical tree produced by `rules::normalize`.
    pub fn from_normalized(value: Value) -> Result<Self> {
        let mut root = into_mapping(value, "configuration")?;

        let postgres = match root.remove(&key("postgres")) {
            Some(section) => build_postgres(section)?,
            None => PostgresSection::default(),
        };

        let registry = match root.remove(&key("privileges")) {
            Some(section) => Registry::build(build_profiles(section)?)?,
            None => Registry::default(),
        };

        let mut config = Config {
            postgres,
            registry,
            rules: Vec::new(),
        };
        if let Some(Value::Sequence(items)) = root.remove(&key("rules")) {
            for (index, item) in items.into_iter().enumerate() {
                let rule =
                    build_rule(item).map_err(|e| e.in_path(&format!("rules[{}]", index)))?;
                config.validate_rule(&rule)?;
                config.rules.push(rule);
            }
        }
        debug!("Configuration loaded. rules={}", config.rules.len());
        Ok(config)
    }

    /// Static profile references must resolve at load time; dynamic ones
    /// are checked against the registry at generation time.
    fn validate_rule(&self, rule: &Rule) -> Result<()> {
        for grant in &rule.grants {
            if grant.privilege.is_static() {
                let name = grant.privilege.to_string();
                if self.registry.profile(&name).is_none() {
                    return Err(Error::Config(format!(
                        "unknown privilege profile: {}",
                        name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Forget privileges entirely (--skip-privileges).
    pub fn drop_privileges(&mut self) {
        self.registry.drop_privileges();
        for rule in &mut self.rules {
            rule.grants.clear();
        }
    }

    /// Whether any privilege is under management.
    pub fn are_privileges_managed(&self) -> bool {
        !self.registry.is_empty()
    }
}

fn build_postgres(value: Value) -> Result<PostgresSection> {
    let map = into_mapping(value, "postgres")?;
    let query = |name: &str| -> Result<Option<InspectQuery>> {
        match map.get(&key(name)) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => {
                InspectQuery::from_yaml(value, &format!("postgres: {}", name)).map(Some)
            }
        }
    };
    Ok(PostgresSection {
        fallback_owner: get_string(&map, "fallback_owner", "postgres: ")?,
        databases_query: query("databases_query")?,
        managed_roles_query: query("managed_roles_query")?,
        roles_blacklist_query: query("roles_blacklist_query")?,
        schemas_query: query("schemas_query")?,
    })
}

fn build_profiles(value: Value) -> Result<BTreeMap<String, Profile>> {
    let map = into_mapping(value, "privileges")?;
    let mut profiles = BTreeMap::new();
    for (name, entries) in map {
        let name = yaml_to_string(&name)?;
        let mut profile = Vec::new();
        for entry in normalize::list(entries) {
            let entry = into_mapping(entry, "privilege")?;
            profile.push(Privilege {
                type_: get_string(&entry, "type", "privilege: ")?.unwrap_or_default(),
                on: get_string(&entry, "on", "privilege: ")?.unwrap_or_default(),
                object: get_string(&entry, "object", "privilege: ")?.unwrap_or_default(),
            });
        }
        profiles.insert(name, profile);
    }
    Ok(profiles)
}

fn template(map: &Mapping, name: &str, fallback: &str) -> Result<Format> {
    let spec = get_string(map, name, "")?.unwrap_or_else(|| fallback.to_string());
    Format::parse(&spec).map_err(|e| e.in_path(name))
}

fn build_rule(value: Value) -> Result<Rule> {
    let map = into_mapping(value, "rule")?;
    let mut rule = Rule {
        description: get_string(&map, "description", "")?.unwrap_or_default(),
        ..Default::default()
    };

    if let Some(search) = map.get(&key("ldapsearch")) {
        rule.ldap_search = build_search(search.clone())?;
    }
    if let Some(Value::Sequence(items)) = map.get(&key("roles")) {
        for item in items {
            rule.roles.push(build_role_rule(item.clone())?);
        }
    }
    if let Some(Value::Sequence(items)) = map.get(&key("grants")) {
        for item in items {
            rule.grants.push(build_grant_rule(item.clone())?);
        }
    }
    Ok(rule)
}

fn build_search(value: Value) -> Result<Search> {
    let map = into_mapping(value, "ldapsearch")?;
    let mut search = Search {
        base: get_string(&map, "base", "ldapsearch: ")?.unwrap_or_default(),
        ..Default::default()
    };
    if let Some(filter) = get_string(&map, "filter", "ldapsearch: ")? {
        search.filter = filter;
    }
    if let Some(scope) = get_string(&map, "scope", "ldapsearch: ")? {
        search.scope = scope;
    }
    if let Some(mode) = get_string(&map, "on_unexpected_dn", "ldapsearch: ")? {
        search.on_unexpected_dn = OnUnexpectedDn::parse(&mode)?;
    }
    if let Some(Value::Mapping(subsearches)) = map.get(&key("subsearches")) {
        for (attribute, subsearch) in subsearches {
            let attribute = yaml_to_string(attribute)?;
            let subsearch = into_mapping(subsearch.clone(), "subsearch")?;
            search.subsearches.insert(
                attribute,
                SubSearch {
                    filter: get_string(&subsearch, "filter", "subsearch: ")?
                        .unwrap_or_else(|| "(objectClass=*)".to_string()),
                    scope: get_string(&subsearch, "scope", "subsearch: ")?
                        .unwrap_or_else(|| "sub".to_string()),
                },
            );
        }
    }
    Ok(search)
}

fn build_role_rule(value: Value) -> Result<RoleRule> {
    let map = into_mapping(value, "role rule")?;
    let mut rule = RoleRule {
        name: template(&map, "name", "")?,
        comment: template(&map, "comment", "")?,
        before_create: get_string(&map, "before_create", "")?.unwrap_or_default(),
        after_create: get_string(&map, "after_create", "")?.unwrap_or_default(),
        ..Default::default()
    };
    if rule.name.is_empty() {
        return Err(Error::Config("role rule requires a name".to_string()));
    }
    if let Some(options) = get_string(&map, "options", "")? {
        rule.options = RoleOptions::parse(&options)?;
    }
    if let Some(Value::Sequence(parents)) = map.get(&key("parents")) {
        for parent in parents {
            let spec = yaml_to_string(parent).map_err(|e| e.in_path("parents"))?;
            rule.parents.push(Format::parse(&spec)?);
        }
    }
    if let Some(Value::Mapping(config)) = map.get(&key("config")) {
        let mut settings = BTreeMap::new();
        for (name, value) in config {
            settings.insert(yaml_to_string(name)?, yaml_to_string(value)?);
        }
        rule.config = Some(settings);
    }
    Ok(rule)
}

fn build_grant_rule(value: Value) -> Result<GrantRule> {
    let map = into_mapping(value, "grant rule")?;
    let rule = GrantRule {
        owner: template(&map, "owner", "__auto__")?,
        privilege: template(&map, "privilege", "")?,
        database: template(&map, "database", "__all__")?,
        schema: template(&map, "schema", "__all__")?,
        to: template(&map, "role", "")?,
    };
    if rule.privilege.is_empty() {
        return Err(Error::Config("grant rule requires a privilege".to_string()));
    }
    if rule.to.is_empty() {
        return Err(Error::Config(
            "grant rule requires a grantee (role/to/grantee)".to_string(),
        ));
    }
    Ok(rule)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_minimal_config() {
        let text = indoc! {r#"
            rules:
            - roles:
                name: alice
                options: LOGIN
        "#};
        let mut file = NamedTempFile::new().expect("failed to create temp file");
        file.write_all(text.as_bytes())
            .expect("failed to write to temp file");
        let config = Config::load(file.path()).expect("failed to load config");
        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.rules[0].roles[0].name.to_string(), "alice");
        assert!(config.rules[0].roles[0].options.can_login);
        assert!(!config.are_privileges_managed());
    }

    #[test]
    fn test_env_expansion_in_yaml() {
        envmnt::set("PGLDAPSYNC_TEST_OWNER", "dba");
        let config = Config::from_yaml_str(indoc! {r#"
            postgres:
              fallback_owner: ${PGLDAPSYNC_TEST_OWNER}
            rules: []
        "#})
        .unwrap();
        assert_eq!(config.postgres.fallback_owner.as_deref(), Some("dba"));
        envmnt::remove("PGLDAPSYNC_TEST_OWNER");
    }

    #[test]
    fn test_env_expansion_default_value() {
        let config = Config::from_yaml_str(indoc! {r#"
            postgres:
              fallback_owner: ${PGLDAPSYNC_TEST_MISSING:postgres}
            rules: []
        "#})
        .unwrap();
        assert_eq!(config.postgres.fallback_owner.as_deref(), Some("postgres"));
    }

    #[test]
    fn test_inspect_query_forms() {
        let config = Config::from_yaml_str(indoc! {r#"
            postgres:
              managed_roles_query: SELECT rolname FROM pg_roles
              roles_blacklist_query: [postgres, "pg_*"]
            rules: []
        "#})
        .unwrap();
        assert!(matches!(
            config.postgres.managed_roles_query,
            Some(InspectQuery::Sql(_))
        ));
        match &config.postgres.roles_blacklist_query {
            Some(InspectQuery::Static(patterns)) => {
                assert_eq!(patterns, &["postgres", "pg_*"]);
            }
            other => panic!("expected static list, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_profile_reference_fails() {
        let err = Config::from_yaml_str(indoc! {r#"
            rules:
            - grants:
                privileges: missing_profile
                roles: alice
        "#})
        .unwrap_err();
        assert!(err.to_string().contains("unknown privilege profile"));
    }

    #[test]
    fn test_builtin_profiles_always_available() {
        let config = Config::from_yaml_str(indoc! {r#"
            privileges:
              reading: [ro]
            rules:
            - grants:
                privileges: reading
                roles: alice
        "#})
        .unwrap();
        assert!(config.registry.profile("reading").is_some());
        assert!(config.registry.profile("ro").is_some());
        assert!(config.are_privileges_managed());
    }

    #[test]
    fn test_grant_rule_requires_grantee() {
        let err = Config::from_yaml_str(indoc! {r#"
            privileges:
              reading: [ro]
            rules:
            - grants:
                privileges: reading
        "#})
        .unwrap_err();
        assert!(err.to_string().contains("grantee"));
    }

    #[test]
    fn test_bad_template_is_config_error() {
        let err = Config::from_yaml_str(indoc! {r#"
            rules:
            - roles:
                name: "{cn"
        "#})
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_skip_privileges_drops_grants() {
        let mut config = Config::from_yaml_str(indoc! {r#"
            privileges:
              reading: [ro]
            rules:
            - roles:
                name: alice
              grants:
                privileges: reading
                roles: alice
        "#})
        .unwrap();
        config.drop_privileges();
        assert!(!config.are_privileges_managed());
        assert!(config.rules[0].grants.is_empty());
        assert_eq!(config.rules[0].roles.len(), 1);
    }

    #[test]
    fn test_find_file_explicit() {
        let path = find_file(Some(Path::new("/tmp/whatever.yml"))).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/whatever.yml"));
    }
}
