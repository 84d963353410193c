//! Section normalizers: rewrite the loose YAML tree into the canonical
//! shape. Normalization is idempotent: running it on its own output is a
//! no-op.

use crate::config::normalize::{
    alias, default_key, into_mapping, key, list, spurious_keys, string_list, type_name,
    yaml_to_string,
};
use crate::errors::{Error, Result};
use crate::ldap;
use crate::privileges::{self, Privilege, ProfileEntry};
use itertools::Itertools;
use log::warn;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;

/// Normalize the configuration root.
pub fn normalize(value: Value) -> Result<Value> {
    let mut root = into_mapping(value, "configuration")?;
    alias(&mut root, "rules", "sync_map")?;
    spurious_keys(&root, &["version", "postgres", "privileges", "rules"], "configuration")?;

    if let Some(section) = root.remove(&key("postgres")) {
        root.insert(key("postgres"), normalize_postgres(section)?);
    }
    if let Some(section) = root.remove(&key("privileges")) {
        root.insert(key("privileges"), normalize_privileges(section)?);
    }
    let rules = root
        .remove(&key("rules"))
        .ok_or_else(|| Error::Config("missing rules".to_string()))?;
    root.insert(key("rules"), normalize_rules(rules)?);

    Ok(Value::Mapping(root))
}

fn normalize_postgres(value: Value) -> Result<Value> {
    let map = into_mapping(value, "postgres")?;
    spurious_keys(
        &map,
        &[
            "fallback_owner",
            "databases_query",
            "managed_roles_query",
            "roles_blacklist_query",
            "schemas_query",
        ],
        "postgres",
    )?;
    if let Some(owner) = map.get(&key("fallback_owner")) {
        if !owner.is_string() {
            return Err(Error::Config(format!(
                "postgres: fallback_owner: must be a string, got {}",
                type_name(owner)
            )));
        }
    }
    Ok(Value::Mapping(map))
}

fn normalize_rules(value: Value) -> Result<Value> {
    let items = match value {
        Value::Sequence(items) => items,
        other => {
            return Err(Error::Config(format!(
                "rules: must be a list, got {}",
                type_name(&other)
            )))
        }
    };
    let mut rules = Vec::new();
    for (index, item) in items.into_iter().enumerate() {
        rules.push(normalize_rule(item).map_err(|e| e.in_path(&format!("rules[{}]", index)))?);
    }
    Ok(Value::Sequence(rules))
}

fn normalize_rule(value: Value) -> Result<Value> {
    let mut rule = into_mapping(value, "rule")?;
    alias(&mut rule, "ldapsearch", "ldap")?;
    alias(&mut rule, "roles", "role")?;
    alias(&mut rule, "grants", "grant")?;
    spurious_keys(&rule, &["description", "ldapsearch", "roles", "grants"], "rule")?;
    default_key(&mut rule, "description", "");

    let search = rule.remove(&key("ldapsearch")).unwrap_or(Value::Null);
    rule.insert(key("ldapsearch"), normalize_ldapsearch(search)?);

    let mut roles = Vec::new();
    for (index, item) in list(rule.remove(&key("roles")).unwrap_or(Value::Null))
        .into_iter()
        .enumerate()
    {
        roles.extend(
            normalize_role_rule(item).map_err(|e| e.in_path(&format!("roles[{}]", index)))?,
        );
    }
    rule.insert(key("roles"), Value::Sequence(roles));

    let mut grants = Vec::new();
    for (index, item) in list(rule.remove(&key("grants")).unwrap_or(Value::Null))
        .into_iter()
        .enumerate()
    {
        grants.extend(
            normalize_grant_rule(item).map_err(|e| e.in_path(&format!("grants[{}]", index)))?,
        );
    }
    rule.insert(key("grants"), Value::Sequence(grants));

    Ok(Value::Mapping(rule))
}

fn normalize_ldapsearch(value: Value) -> Result<Value> {
    let mut search = into_mapping(value, "ldapsearch")?;
    alias(&mut search, "subsearches", "joins")?;
    spurious_keys(
        &search,
        &["base", "filter", "scope", "subsearches", "on_unexpected_dn"],
        "ldapsearch",
    )?;
    default_key(&mut search, "filter", "(objectClass=*)");
    default_key(&mut search, "scope", "sub");
    default_key(&mut search, "on_unexpected_dn", "fail");
    if let Some(Value::String(filter)) = search.get(&key("filter")) {
        let cleaned = ldap::clean_filter(filter);
        search.insert(key("filter"), Value::String(cleaned));
    }

    if let Some(subsearches) = search.remove(&key("subsearches")) {
        let mut normalized = Mapping::new();
        for (attribute, subsearch) in into_mapping(subsearches, "subsearches")? {
            let mut subsearch = into_mapping(subsearch, "subsearch")?;
            spurious_keys(&subsearch, &["filter", "scope"], "subsearch")?;
            default_key(&mut subsearch, "filter", "(objectClass=*)");
            default_key(&mut subsearch, "scope", "sub");
            if let Some(Value::String(filter)) = subsearch.get(&key("filter")) {
                let cleaned = ldap::clean_filter(filter);
                subsearch.insert(key("filter"), Value::String(cleaned));
            }
            normalized.insert(attribute, Value::Mapping(subsearch));
        }
        search.insert(key("subsearches"), Value::Mapping(normalized));
    }
    Ok(Value::Mapping(search))
}

fn normalize_role_rule(value: Value) -> Result<Vec<Value>> {
    let mut rule = match value {
        // A bare string is a role name.
        Value::String(name) => {
            let mut map = Mapping::new();
            map.insert(key("names"), Value::String(name));
            map
        }
        other => into_mapping(other, "role rule")?,
    };
    alias(&mut rule, "names", "name")?;
    alias(&mut rule, "parents", "parent")?;
    spurious_keys(
        &rule,
        &[
            "names",
            "comment",
            "options",
            "parents",
            "config",
            "before_create",
            "after_create",
        ],
        "role rule",
    )?;
    default_key(&mut rule, "comment", "");
    default_key(&mut rule, "before_create", "");
    default_key(&mut rule, "after_create", "");

    let names = string_list(rule.remove(&key("names")).unwrap_or(Value::Null), "names")?;
    if names.is_empty() {
        return Err(Error::Config("role rule requires a name".to_string()));
    }
    let parents = string_list(
        rule.remove(&key("parents")).unwrap_or(Value::Null),
        "parents",
    )?;
    rule.insert(
        key("parents"),
        Value::Sequence(parents.into_iter().map(Value::String).collect()),
    );

    let options = normalize_role_options(rule.remove(&key("options")).unwrap_or(Value::Null))?;
    rule.insert(key("options"), Value::String(options));

    if let Some(config) = rule.remove(&key("config")) {
        let mut normalized = Mapping::new();
        for (name, value) in into_mapping(config, "config")? {
            let value = yaml_to_string(&value).map_err(|e| e.in_path("config"))?;
            normalized.insert(name, Value::String(value));
        }
        rule.insert(key("config"), Value::Mapping(normalized));
    }

    // One canonical rule per name.
    Ok(names
        .into_iter()
        .map(|name| {
            let mut duplicated = rule.clone();
            duplicated.insert(key("name"), Value::String(name));
            Value::Mapping(duplicated)
        })
        .collect())
}

/// Canonicalize string, list and map forms to the non-default token
/// string, e.g. `{LOGIN: yes, CREATEDB: no}` becomes `"LOGIN"`.
fn normalize_role_options(value: Value) -> Result<String> {
    use crate::role::RoleOptions;
    let options = match value {
        Value::Null => RoleOptions::default(),
        Value::String(spec) => RoleOptions::parse(&spec)?,
        Value::Sequence(_) => {
            let tokens = string_list(value, "options")?;
            RoleOptions::parse(&tokens.join(" "))?
        }
        Value::Mapping(map) => {
            let mut options = RoleOptions::default();
            for (name, value) in &map {
                let name = yaml_to_string(name).map_err(|e| e.in_path("options"))?;
                if name.eq_ignore_ascii_case("CONNECTION LIMIT") {
                    options.conn_limit = yaml_to_string(value)?
                        .parse()
                        .map_err(|_| Error::Config("bad connection limit".to_string()))?;
                    continue;
                }
                let enabled = match value {
                    Value::Bool(b) => *b,
                    other => {
                        return Err(Error::Config(format!(
                            "options: {}: must be a boolean, got {}",
                            name,
                            type_name(other)
                        )))
                    }
                };
                options.apply_token(&name, enabled)?;
            }
            options
        }
        other => {
            return Err(Error::Config(format!(
                "options: must be a string, list or map, got {}",
                type_name(&other)
            )))
        }
    };
    Ok(options.format(&crate::role::options::all_columns()))
}

const GRANT_DIMENSIONS: [&str; 5] = ["owners", "databases", "schemas", "roles", "privileges"];

fn normalize_grant_rule(value: Value) -> Result<Vec<Value>> {
    let mut rule = into_mapping(value, "grant rule")?;
    alias(&mut rule, "owners", "owner")?;
    alias(&mut rule, "privileges", "privilege")?;
    alias(&mut rule, "databases", "database")?;
    alias(&mut rule, "schemas", "schema")?;
    alias(&mut rule, "roles", "to")?;
    alias(&mut rule, "roles", "grantee")?;
    alias(&mut rule, "roles", "role")?;
    spurious_keys(&rule, &GRANT_DIMENSIONS, "grant rule")?;
    default_key(&mut rule, "owners", "__auto__");
    default_key(&mut rule, "schemas", "__all__");
    default_key(&mut rule, "databases", "__all__");

    // Cartesian product over the non-empty dimensions, one canonical rule
    // per tuple.
    let mut dimensions: Vec<(&str, Vec<String>)> = Vec::new();
    for name in GRANT_DIMENSIONS {
        let values = string_list(rule.remove(&key(name)).unwrap_or(Value::Null), name)?;
        if !values.is_empty() {
            dimensions.push((name, values));
        }
    }

    let combinations = dimensions
        .iter()
        .map(|(_, values)| values.iter())
        .multi_cartesian_product();
    let mut out = Vec::new();
    for combination in combinations {
        let mut duplicated = Mapping::new();
        for ((name, _), value) in dimensions.iter().zip(combination) {
            duplicated.insert(
                key(name.trim_end_matches('s')),
                Value::String(value.clone()),
            );
        }
        out.push(Value::Mapping(duplicated));
    }
    Ok(out)
}

fn normalize_privileges(value: Value) -> Result<Value> {
    let map = into_mapping(value, "privileges")?;
    let mut profiles: BTreeMap<String, Vec<ProfileEntry>> = privileges::builtins();

    for (name, entries) in map {
        let name = yaml_to_string(&name).map_err(|e| e.in_path("privileges"))?;
        let mut parsed = Vec::new();
        for entry in list(entries) {
            parsed.extend(
                normalize_privilege_entry(entry)
                    .map_err(|e| e.in_path(&format!("privileges: {}", name)))?,
            );
        }
        profiles.insert(name, parsed);
    }

    let flattened = privileges::flatten(&profiles)?;
    let mut out = Mapping::new();
    for (name, profile) in flattened {
        let entries: Vec<Value> = profile
            .into_iter()
            .map(|privilege| {
                let mut entry = Mapping::new();
                entry.insert(key("type"), Value::String(privilege.type_));
                entry.insert(key("on"), Value::String(privilege.on));
                if !privilege.object.is_empty() {
                    entry.insert(key("object"), Value::String(privilege.object));
                }
                Value::Mapping(entry)
            })
            .collect();
        out.insert(Value::String(name), Value::Sequence(entries));
    }
    Ok(Value::Mapping(out))
}

fn normalize_privilege_entry(value: Value) -> Result<Vec<ProfileEntry>> {
    let mut entry = match value {
        // A bare string references another profile.
        Value::String(name) => return Ok(vec![ProfileEntry::Ref(name)]),
        other => into_mapping(other, "privilege")?,
    };

    // Legacy default scope form from older configurations.
    if let Some(default) = entry.remove(&key("default")) {
        let scope = yaml_to_string(&default)?.to_uppercase();
        let object = entry
            .get(&key("type"))
            .cloned()
            .ok_or_else(|| Error::Config("default privilege requires type".to_string()))?;
        entry.insert(key("object"), object);
        entry.insert(key("on"), Value::String(format!("{} DEFAULT", scope)));
        warn!("Deprecated default scope in privilege definition.");
        warn!("Use on: \"{} DEFAULT\" and object instead.", scope);
    }

    alias(&mut entry, "types", "type")?;
    spurious_keys(&entry, &["types", "on", "object"], "privilege")?;

    let types = string_list(entry.remove(&key("types")).unwrap_or(Value::Null), "types")?;
    if types.is_empty() {
        return Err(Error::Config("privilege requires a type".to_string()));
    }
    let on = match entry.get(&key("on")) {
        Some(Value::String(on)) => on.to_uppercase(),
        _ => return Err(Error::Config("privilege requires on".to_string())),
    };
    let object = match entry.get(&key("object")) {
        Some(Value::String(object)) => object.to_uppercase(),
        _ => String::new(),
    };

    Ok(types
        .into_iter()
        .map(|type_| {
            ProfileEntry::Privilege(Privilege {
                type_: type_.to_uppercase(),
                on: on.clone(),
                object: object.clone(),
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    fn normalized(yaml: &str) -> Value {
        normalize(serde_yaml::from_str(yaml).unwrap()).unwrap()
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let once = normalized(indoc! {r#"
            postgres:
              fallback_owner: postgres
            privileges:
              reading:
                - ro
                - types: [USAGE]
                  on: SCHEMAS
            rules:
            - description: Static team.
              role:
                names: [alice, bob]
                options: LOGIN
              grant:
                privileges: reading
                roles: [alice, bob]
                databases: [db1, db2]
        "#});
        let twice = normalize(once.clone()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_missing_rules_is_an_error() {
        let err = normalize(serde_yaml::from_str("postgres: {}").unwrap()).unwrap_err();
        assert!(err.to_string().contains("missing rules"));
    }

    #[test]
    fn test_unknown_key_names_path() {
        let result = normalize(
            serde_yaml::from_str(indoc! {r#"
                rules:
                - roles: {name: a, bogus: 1}
            "#})
            .unwrap(),
        );
        let err = result.unwrap_err();
        assert!(err.to_string().contains("unknown key: bogus"), "{}", err);
    }

    #[test]
    fn test_conflicting_aliases_rejected() {
        let result = normalize(
            serde_yaml::from_str(indoc! {r#"
                rules:
                - grants:
                    role: a
                    to: b
                    privileges: ro
            "#})
            .unwrap(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_grant_cartesian_product() {
        let root = normalized(indoc! {r#"
            rules:
            - grants:
                privileges: [ro, rw]
                databases: [db1, db2]
                roles: [alice, bob, carol]
        "#});
        let rules = root["rules"].as_sequence().unwrap();
        let grants = rules[0]["grants"].as_sequence().unwrap();
        // owners and schemas default to a single wildcard each.
        assert_eq!(grants.len(), 2 * 2 * 3);
        for grant in grants {
            let map = grant.as_mapping().unwrap();
            for dimension in ["owner", "database", "schema", "role", "privilege"] {
                assert!(
                    map.contains_key(&key(dimension)),
                    "missing {} in {:?}",
                    dimension,
                    map
                );
            }
        }
    }

    #[test]
    fn test_role_rule_duplicated_per_name() {
        let root = normalized(indoc! {r#"
            rules:
            - roles:
                names: [alice, bob]
                options: LOGIN
        "#});
        let roles = root["rules"][0]["roles"].as_sequence().unwrap();
        assert_eq!(roles.len(), 2);
        assert_eq!(roles[0]["name"], Value::String("alice".into()));
        assert_eq!(roles[0]["options"], Value::String("LOGIN".into()));
        assert_eq!(roles[1]["name"], Value::String("bob".into()));
    }

    #[test]
    fn test_ldapsearch_defaults_and_filter_cleaning() {
        let root = normalized(indoc! {r#"
            rules:
            - ldapsearch:
                base: ou=people,dc=acme
                filter: |
                  (&
                    (objectClass=person)
                    (cn=db-*)
                  )
              roles:
                name: "{cn}"
        "#});
        let search = &root["rules"][0]["ldapsearch"];
        assert_eq!(search["scope"], Value::String("sub".into()));
        assert_eq!(
            search["filter"],
            Value::String("(&(objectClass=person)(cn=db-*))".into())
        );
    }

    #[test]
    fn test_role_options_map_form() {
        let root = normalized(indoc! {r#"
            rules:
            - roles:
                name: alice
                options:
                  LOGIN: true
                  CREATEDB: false
        "#});
        assert_eq!(
            root["rules"][0]["roles"][0]["options"],
            Value::String("LOGIN".into())
        );
    }

    #[test]
    fn test_deprecated_default_scope_rewritten() {
        let root = normalized(indoc! {r#"
            privileges:
              legacy:
                - type: SELECT
                  default: global
            rules: []
        "#});
        let entry = &root["privileges"]["legacy"][0];
        assert_eq!(entry["on"], Value::String("GLOBAL DEFAULT".into()));
        assert_eq!(entry["object"], Value::String("SELECT".into()));
    }

    #[test]
    fn test_privileges_flattened_and_internals_hidden() {
        let root = normalized(indoc! {r#"
            privileges:
              reading:
                - __connect__
            rules: []
        "#});
        let privileges = root["privileges"].as_mapping().unwrap();
        assert!(privileges.contains_key(&key("reading")));
        assert!(privileges.contains_key(&key("ro")));
        assert!(!privileges
            .keys()
            .any(|k| k.as_str().unwrap().starts_with("__")));
        assert_eq!(
            root["privileges"]["reading"][0]["type"],
            Value::String("CONNECT".into())
        );
    }

    #[test]
    fn test_profile_cycle_rejected() {
        let result = normalize(
            serde_yaml::from_str(indoc! {r#"
                privileges:
                  a: [b]
                  b: [a]
                rules: []
            "#})
            .unwrap(),
        );
        assert!(result.unwrap_err().to_string().contains("cycle"));
    }
}
