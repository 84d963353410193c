//! Rule engine: turn LDAP bindings and templates into wanted roles and
//! grants.

use crate::errors::Result;
use crate::fmt::{list_fields, Format};
use crate::ldap::{Search, SearchResult};
use crate::privileges::{Grant, Registry, Slot};
use crate::role::{Membership, Role, RoleOptions};
use log::warn;
use std::collections::{BTreeMap, HashMap};

/// One canonical rule: a directory search and the role/grant templates it
/// feeds. The search only runs when some template references a field.
#[derive(Debug, Default)]
pub struct Rule {
    pub description: String,
    pub ldap_search: Search,
    pub roles: Vec<RoleRule>,
    pub grants: Vec<GrantRule>,
}

impl Rule {
    /// Union of the fields referenced by every template of this rule,
    /// driving what the search asks the directory for.
    pub fn fields(&self) -> Vec<String> {
        let mut formats: Vec<&Format> = Vec::new();
        for role in &self.roles {
            formats.extend(role.formats());
        }
        for grant in &self.grants {
            formats.extend(grant.formats());
        }
        list_fields(formats)
    }

    /// A rule without template fields needs no directory at all.
    pub fn is_static(&self) -> bool {
        self.fields().is_empty()
    }
}

/// Template producing wanted roles.
#[derive(Debug, Default)]
pub struct RoleRule {
    pub name: Format,
    pub comment: Format,
    pub options: RoleOptions,
    pub parents: Vec<Format>,
    pub config: Option<BTreeMap<String, String>>,
    pub before_create: String,
    pub after_create: String,
}

impl RoleRule {
    fn formats(&self) -> Vec<&Format> {
        let mut formats = vec![&self.name, &self.comment];
        formats.extend(self.parents.iter());
        formats
    }

    /// One role per distinct binding of the name/comment fields. Parents
    /// are the union of the formatted parent templates over the whole
    /// result set.
    pub fn generate(&self, results: Option<&SearchResult>) -> Vec<Role> {
        let mut parents: Vec<Membership> = Vec::new();
        let mut add_parent = |name: String| {
            if !name.is_empty() && !parents.iter().any(|m| m.name == name) {
                parents.push(Membership {
                    name,
                    grantor: String::new(),
                });
            }
        };
        for format in &self.parents {
            match results {
                Some(results) if !format.is_static() => {
                    let fields = list_fields([format]);
                    for bindings in results.generate_values(&fields) {
                        add_parent(format.format(&bindings));
                    }
                }
                _ => add_parent(format.format(&HashMap::new())),
            }
        }

        let make_role = |bindings: &HashMap<String, String>| Role {
            name: self.name.format(bindings),
            comment: self.comment.format(bindings),
            options: self.options.clone(),
            parents: parents.clone(),
            config: self.config.clone(),
            before_create: self.before_create.clone(),
            after_create: self.after_create.clone(),
        };

        match results {
            None => vec![make_role(&HashMap::new())],
            Some(results) => {
                let fields = list_fields([&self.name, &self.comment]);
                results
                    .generate_values(&fields)
                    .iter()
                    .map(|bindings| make_role(bindings))
                    .filter(|role| {
                        if role.name.is_empty() {
                            warn!("Skipping role with empty name. rule={}", self.name);
                            return false;
                        }
                        true
                    })
                    .collect()
            }
        }
    }
}

/// Template producing wanted grants through a privilege profile.
#[derive(Debug, Default)]
pub struct GrantRule {
    pub owner: Format,
    pub privilege: Format,
    pub database: Format,
    pub schema: Format,
    pub to: Format,
}

impl GrantRule {
    fn formats(&self) -> Vec<&Format> {
        vec![
            &self.owner,
            &self.privilege,
            &self.database,
            &self.schema,
            &self.to,
        ]
    }

    /// One grant per profile entry per distinct binding. Slots are
    /// populated only when the entry's ACL uses them.
    pub fn generate(&self, results: Option<&SearchResult>, registry: &Registry) -> Result<Vec<Grant>> {
        let bindings_list = match results {
            None => vec![HashMap::new()],
            Some(results) => results.generate_values(&list_fields(self.formats())),
        };

        let mut out = Vec::new();
        for bindings in &bindings_list {
            let profile_name = self.privilege.format(bindings);
            let profile = match registry.profile(&profile_name) {
                Some(profile) => profile,
                None => {
                    warn!("Unknown privilege profile, skipping. profile={}", profile_name);
                    continue;
                }
            };

            for privilege in profile {
                let acl = crate::privileges::Acl::lookup(&privilege.on)?;
                let mut grant = Grant {
                    acl: privilege.on.clone(),
                    type_: privilege.type_.clone(),
                    grantee: self.to.format(bindings),
                    ..Default::default()
                };
                if acl.uses(Slot::Owner) {
                    grant.owner = self.owner.format(bindings);
                }
                if acl.uses(Slot::Schema) {
                    grant.schema = self.schema.format(bindings);
                }
                if acl.uses(Slot::Object) {
                    grant.object = privilege.object.clone();
                }
                if acl.uses(Slot::Database) {
                    grant.database = self.database.format(bindings);
                }
                out.push(grant);
            }
        }
        Ok(out)
    }
}

/// Merge a batch of generated roles into the wanted set. First producer
/// wins options and comment; parent sets are unioned.
pub fn merge_roles(wanted: &mut BTreeMap<String, Role>, roles: Vec<Role>) {
    for role in roles {
        match wanted.get_mut(&role.name) {
            Some(existing) => existing.merge(role),
            None => {
                wanted.insert(role.name.clone(), role);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::privileges::{builtins, flatten};

    fn format(spec: &str) -> Format {
        Format::parse(spec).unwrap()
    }

    fn registry() -> Registry {
        Registry::build(flatten(&builtins()).unwrap()).unwrap()
    }

    fn static_grant_rule(profile: &str, grantee: &str) -> GrantRule {
        GrantRule {
            owner: format("__auto__"),
            privilege: format(profile),
            database: format("__all__"),
            schema: format("__all__"),
            to: format(grantee),
        }
    }

    #[test]
    fn test_static_role_rule_single_role() {
        let rule = RoleRule {
            name: format("alice"),
            options: RoleOptions::parse("LOGIN").unwrap(),
            parents: vec![format("readers")],
            ..Default::default()
        };
        let roles = rule.generate(None);
        assert_eq!(roles.len(), 1);
        assert_eq!(roles[0].name, "alice");
        assert!(roles[0].options.can_login);
        assert_eq!(roles[0].parents[0].name, "readers");
    }

    #[test]
    fn test_grant_rule_populates_used_slots_only() {
        let rule = static_grant_rule("ro", "analyst");
        let grants = rule.generate(None, &registry()).unwrap();

        let connect = grants.iter().find(|g| g.acl == "DATABASE").unwrap();
        assert_eq!(connect.type_, "CONNECT");
        assert_eq!(connect.database, "__all__");
        assert_eq!(connect.schema, "");
        assert_eq!(connect.owner, "");

        let usage = grants.iter().find(|g| g.acl == "SCHEMAS").unwrap();
        assert_eq!(usage.schema, "__all__");
        assert_eq!(usage.owner, "");

        let default = grants.iter().find(|g| g.acl == "GLOBAL DEFAULT").unwrap();
        assert_eq!(default.owner, "__auto__");
        assert_eq!(default.object, "TABLES");
        assert_eq!(default.schema, "");
    }

    #[test]
    fn test_grant_rule_unknown_profile_skips() {
        let rule = static_grant_rule("nope", "analyst");
        assert!(rule.generate(None, &registry()).unwrap().is_empty());
    }

    #[test]
    fn test_merge_roles_first_writer_options() {
        let mut wanted = BTreeMap::new();
        let mut first = Role {
            name: "dev".to_string(),
            ..Default::default()
        };
        first.options = RoleOptions::parse("LOGIN").unwrap();
        first.parents = vec![Membership {
            name: "a".to_string(),
            grantor: String::new(),
        }];
        let mut second = first.clone();
        second.options = RoleOptions::parse("SUPERUSER").unwrap();
        second.parents = vec![Membership {
            name: "b".to_string(),
            grantor: String::new(),
        }];

        merge_roles(&mut wanted, vec![first]);
        merge_roles(&mut wanted, vec![second]);

        let merged = &wanted["dev"];
        assert!(merged.options.can_login && !merged.options.superuser);
        let parents: Vec<&str> = merged.parents.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(parents, vec!["a", "b"]);
    }

    #[test]
    fn test_rule_fields_union() {
        let rule = Rule {
            roles: vec![RoleRule {
                name: format("{cn}"),
                comment: format("{dn}"),
                ..Default::default()
            }],
            grants: vec![GrantRule {
                owner: format("__auto__"),
                privilege: format("ro"),
                database: format("__all__"),
                schema: format("__all__"),
                to: format("{cn}"),
            }],
            ..Default::default()
        };
        assert_eq!(rule.fields(), vec!["cn", "dn"]);
    }
}
