//! Grant records and wildcard expansion.
//!
//! A Grant references a role, a privilege type and an object through its
//! ACL category, like an aclitem. When `owner` is non-empty the grant is a
//! default-privilege grant and `object` holds the object class (TABLES,
//! SEQUENCES, ...) instead of an object name.

use crate::errors::{Error, Result};
use crate::postgres::{quote_ident, Database};
use crate::privileges::{Acl, Scope, Slot};
use std::collections::BTreeSet;
use std::fmt;

/// Reserved wildcard for "every inspected database/schema".
pub const ALL: &str = "__all__";
/// Reserved wildcard for "every creator of the target schemas".
pub const AUTO: &str = "__auto__";

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Grant {
    pub owner: String,
    pub grantee: String,
    pub acl: String,
    pub type_: String,
    pub database: String,
    pub schema: String,
    pub object: String,
    pub partial: bool,
}

impl Grant {
    pub fn is_default(&self) -> bool {
        !self.owner.is_empty()
    }

    /// An empty type marks "any privilege in this category", as inspected
    /// for object-less schemas. Never revoked, never wanted.
    pub fn is_wildcard(&self) -> bool {
        self.type_.is_empty()
    }

    /// Resolve `__all__` on the database slot. Instance-scope ACLs fan out
    /// over every inspected database; database-scope ACLs restrict to the
    /// current pass so each database gets its own copy in its own pass.
    fn expand_database(&self, acl: &Acl, current: &str, all: &[String]) -> Vec<Grant> {
        let instance_wide = acl.scope == Scope::Instance;

        if self.database == ALL {
            let mut out = Vec::new();
            for name in all {
                if name != current && !instance_wide {
                    continue;
                }
                let mut grant = self.clone();
                grant.database = name.clone();
                out.push(grant);
            }
            return out;
        }

        if instance_wide || self.database == current {
            return vec![self.clone()];
        }
        Vec::new()
    }

    /// Resolve `__all__` on the schema slot against the current database.
    fn expand_schemas(&self, schemas: &[String]) -> Vec<Grant> {
        if self.schema != ALL {
            return vec![self.clone()];
        }
        schemas
            .iter()
            .map(|name| {
                let mut grant = self.clone();
                grant.schema = name.clone();
                grant
            })
            .collect()
    }

    /// Resolve `__auto__` on the owner slot: one grant per creator of the
    /// target schemas, never granting default privileges on oneself.
    fn expand_owners(&self, database: &Database) -> Vec<Grant> {
        if self.owner != AUTO {
            return vec![self.clone()];
        }
        if database.name != self.database {
            return Vec::new();
        }

        let mut creators: BTreeSet<&str> = BTreeSet::new();
        if self.schema.is_empty() {
            for schema in database.schemas.values() {
                creators.extend(schema.creators.iter().map(String::as_str));
            }
        } else if let Some(schema) = database.schemas.get(&self.schema) {
            creators.extend(schema.creators.iter().map(String::as_str));
        }

        creators
            .into_iter()
            .filter(|creator| *creator != self.grantee)
            .map(|creator| {
                let mut grant = self.clone();
                grant.owner = creator.to_string();
                grant
            })
            .collect()
    }

    /// Format a grant or revoke statement from an ACL template.
    ///
    /// Two-stage substitution: keyword placeholders (`<privilege>`,
    /// `<acl>`, and `<object>` next to `<owner>`) are validated and
    /// substituted literally; the remaining placeholders are quoted as
    /// identifiers.
    pub fn format_query(&self, template: &str) -> Result<String> {
        validate_keyword("privilege type", &self.type_)?;
        let mut sql = template.replace("<privilege>", &self.type_);
        sql = sql.replace("<acl>", &self.acl);
        if sql.contains("<owner>") {
            // Default privileges target object classes like TABLES, by
            // keyword rather than by identifier.
            validate_keyword("object class", &self.object)?;
            sql = sql.replace("<object>", &self.object);
        }

        let mut out = String::new();
        let mut rest = sql.as_str();
        while let Some(start) = rest.find('<') {
            let end = rest[start..]
                .find('>')
                .map(|i| start + i)
                .ok_or_else(|| Error::Internal(format!("bad placeholder in {:?}", template)))?;
            out.push_str(&rest[..start]);
            let value = match &rest[start + 1..end] {
                "database" => &self.database,
                "grantee" => &self.grantee,
                "object" => &self.object,
                "owner" => &self.owner,
                "schema" => &self.schema,
                other => {
                    return Err(Error::Internal(format!(
                        "unknown placeholder <{}> in {:?}",
                        other, template
                    )))
                }
            };
            out.push_str(&quote_ident(value));
            rest = &rest[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    /// Parse the display form back into a grant. Inverse of `Display`,
    /// modulo `partial`.
    pub fn parse(input: &str) -> Result<Self> {
        let mut grant = Grant::default();
        let mut tokens = input.split_whitespace().peekable();

        let mut token = take(&mut tokens, input, "privilege")?;
        if token == "PARTIAL" {
            grant.partial = true;
            token = take(&mut tokens, input, "privilege")?;
        }
        if token == "GLOBAL" || token == "DEFAULT" {
            let global = token == "GLOBAL";
            if global {
                expect(&mut tokens, input, "DEFAULT")?;
            }
            expect(&mut tokens, input, "FOR")?;
            grant.owner = take(&mut tokens, input, "owner")?;
            if global {
                grant.acl = "GLOBAL DEFAULT".to_string();
            } else {
                grant.acl = "SCHEMA DEFAULT".to_string();
                expect(&mut tokens, input, "IN")?;
                expect(&mut tokens, input, "SCHEMA")?;
                grant.schema = take(&mut tokens, input, "schema")?;
            }
            token = take(&mut tokens, input, "privilege")?;
        }
        grant.type_ = if token == "ANY" { String::new() } else { token };
        expect(&mut tokens, input, "ON")?;

        if grant.is_default() {
            grant.object = take(&mut tokens, input, "object class")?;
        } else {
            grant.acl = take(&mut tokens, input, "acl")?;
            if let Some(token) = tokens.peek() {
                if *token != "TO" {
                    let target = tokens.next().unwrap();
                    if Acl::lookup(&grant.acl)?.scope == Scope::Instance {
                        grant.database = target.to_string();
                    } else {
                        match target.split_once('.') {
                            Some((schema, object)) => {
                                grant.schema = schema.to_string();
                                grant.object = object.to_string();
                            }
                            None => grant.schema = target.to_string(),
                        }
                    }
                }
            }
        }

        if tokens.peek().is_some() {
            expect(&mut tokens, input, "TO")?;
            grant.grantee = take(&mut tokens, input, "grantee")?;
        }
        Ok(grant)
    }
}

fn take<'a>(
    tokens: &mut std::iter::Peekable<impl Iterator<Item = &'a str>>,
    input: &str,
    expected: &str,
) -> Result<String> {
    tokens
        .next()
        .map(str::to_string)
        .ok_or_else(|| Error::Internal(format!("grant {:?}: expected {}", input, expected)))
}

fn expect<'a>(
    tokens: &mut std::iter::Peekable<impl Iterator<Item = &'a str>>,
    input: &str,
    keyword: &str,
) -> Result<()> {
    match tokens.next() {
        Some(token) if token == keyword => Ok(()),
        _ => Err(Error::Internal(format!(
            "grant {:?}: expected {}",
            input, keyword
        ))),
    }
}

fn validate_keyword(what: &str, value: &str) -> Result<()> {
    if value.is_empty()
        || !value
            .chars()
            .all(|c| c.is_ascii_uppercase() || c == ' ' || c == '_')
    {
        return Err(Error::Internal(format!("bad {} keyword: {:?}", what, value)));
    }
    Ok(())
}

impl fmt::Display for Grant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.partial {
            write!(f, "PARTIAL ")?;
        }
        if self.is_default() {
            if self.schema.is_empty() {
                write!(f, "GLOBAL ")?;
            }
            write!(f, "DEFAULT FOR {}", self.owner)?;
            if !self.schema.is_empty() {
                write!(f, " IN SCHEMA {}", self.schema)?;
            }
            write!(f, " ")?;
        }
        if self.type_.is_empty() {
            write!(f, "ANY")?;
        } else {
            write!(f, "{}", self.type_)?;
        }
        write!(f, " ON ")?;
        if self.is_default() {
            write!(f, "{}", self.object)?;
        } else {
            write!(f, "{}", self.acl)?;
            let mut target = String::new();
            if !self.database.is_empty() && self.schema.is_empty() && self.object.is_empty() {
                target.push_str(&self.database);
            } else {
                target.push_str(&self.schema);
                if !self.object.is_empty() {
                    if !target.is_empty() {
                        target.push('.');
                    }
                    target.push_str(&self.object);
                }
            }
            if !target.is_empty() {
                write!(f, " {}", target)?;
            }
        }
        if !self.grantee.is_empty() {
            write!(f, " TO {}", self.grantee)?;
        }
        Ok(())
    }
}

/// Resolve every wildcard in `grants` against the inspected state of one
/// database. Expansion order is deterministic: databases, then schemas,
/// then owners.
pub fn expand(
    grants: &[Grant],
    database: &Database,
    all_databases: &[String],
) -> Result<Vec<Grant>> {
    let mut out = Vec::new();
    for grant in grants {
        let acl = Acl::lookup(&grant.acl)?;
        out.extend(grant.expand_database(acl, &database.name, all_databases));
    }

    let schemas: Vec<String> = database.schemas.keys().cloned().collect();
    let mut next = Vec::new();
    for grant in &out {
        next.extend(grant.expand_schemas(&schemas));
    }

    let mut expanded = Vec::new();
    for grant in &next {
        for grant in grant.expand_owners(database) {
            log::debug!("Wants grant. grant={} database={}", grant, grant.database);
            expanded.push(grant);
        }
    }
    Ok(expanded)
}
