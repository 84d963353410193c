//! LDAP searches and projection of entries into template bindings.
//!
//! A rule's search runs once; sub-searches expand DN-valued attributes
//! into their own entries. The projector then emits one binding map per
//! distinct tuple of the referenced attribute values, preserving the
//! directory-returned order.

use crate::errors::{Error, Result};
use crate::perf::StopWatch;
use itertools::Itertools;
use ldap3::{LdapConn, Scope, SearchEntry};
use log::{debug, warn};
use std::collections::{BTreeMap, HashMap, HashSet};

/// What to do with a sub-search attribute value that is not a usable DN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnUnexpectedDn {
    #[default]
    Fail,
    Warn,
    Silent,
}

impl OnUnexpectedDn {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "fail" => Ok(OnUnexpectedDn::Fail),
            "warn" => Ok(OnUnexpectedDn::Warn),
            "silent" => Ok(OnUnexpectedDn::Silent),
            other => Err(Error::Config(format!(
                "on_unexpected_dn: unknown value: {}",
                other
            ))),
        }
    }
}

/// Secondary search keyed on an attribute: for each DN value of the
/// attribute, search with that DN as base and merge the results.
#[derive(Debug, Clone)]
pub struct SubSearch {
    pub filter: String,
    pub scope: String,
}

#[derive(Debug, Clone)]
pub struct Search {
    pub base: String,
    pub filter: String,
    pub scope: String,
    pub subsearches: BTreeMap<String, SubSearch>,
    pub on_unexpected_dn: OnUnexpectedDn,
}

impl Default for Search {
    fn default() -> Self {
        Search {
            base: String::new(),
            filter: "(objectClass=*)".to_string(),
            scope: "sub".to_string(),
            subsearches: BTreeMap::new(),
            on_unexpected_dn: OnUnexpectedDn::default(),
        }
    }
}

fn parse_scope(scope: &str) -> Result<Scope> {
    match scope {
        "sub" => Ok(Scope::Subtree),
        "one" => Ok(Scope::OneLevel),
        "base" => Ok(Scope::Base),
        other => Err(Error::Config(format!("ldapsearch: unknown scope: {}", other))),
    }
}

/// Strip indentation and newlines from a multi-line filter so YAML block
/// scalars stay readable.
pub fn clean_filter(filter: &str) -> String {
    filter.split_whitespace().collect::<Vec<_>>().join("")
}

/// Extract the first RDN of the given type from a DN, e.g.
/// `rdn("cn=alice,ou=people,dc=acme", "cn")` is `alice`.
fn rdn(dn: &str, type_: &str) -> Option<String> {
    for component in dn.split(',') {
        let (key, value) = component.split_once('=')?;
        if key.trim().eq_ignore_ascii_case(type_) {
            return Some(value.trim().to_string());
        }
    }
    None
}

/// One directory entry with the attribute values the rule references.
/// Sub-field values (`member.cn`) are stored under their full path.
#[derive(Debug, Clone, Default)]
pub struct Entry {
    pub dn: String,
    attributes: HashMap<String, Vec<String>>,
}

impl Entry {
    fn values(&self, field: &str) -> Option<&[String]> {
        self.attributes.get(field).map(Vec::as_slice)
    }
}

/// The expanded result of one rule search.
#[derive(Debug, Clone, Default)]
pub struct SearchResult {
    pub entries: Vec<Entry>,
}

impl SearchResult {
    /// One binding map per distinct tuple of `fields` values, in entry
    /// order. A field absent from an entry stays absent from the binding
    /// map, so template formatting warns and substitutes empty.
    pub fn generate_values(&self, fields: &[String]) -> Vec<HashMap<String, String>> {
        if fields.is_empty() {
            // Zero fields project every entry onto the same empty tuple.
            return if self.entries.is_empty() {
                Vec::new()
            } else {
                vec![HashMap::new()]
            };
        }

        let mut seen: HashSet<Vec<Option<String>>> = HashSet::new();
        let mut out = Vec::new();

        for entry in &self.entries {
            let dimensions: Vec<Vec<Option<String>>> = fields
                .iter()
                .map(|field| match entry.values(field) {
                    Some(values) if !values.is_empty() => {
                        values.iter().map(|v| Some(v.clone())).collect()
                    }
                    _ => vec![None],
                })
                .collect();

            for tuple in dimensions.into_iter().multi_cartesian_product() {
                if !seen.insert(tuple.clone()) {
                    continue;
                }
                let mut bindings = HashMap::new();
                for (field, value) in fields.iter().zip(tuple) {
                    if let Some(value) = value {
                        bindings.insert(field.clone(), value);
                    }
                }
                out.push(bindings);
            }
        }
        out
    }
}

/// Thin synchronous client over `ldap3`, configured from the standard
/// LDAP* environment variables.
pub struct Client {
    conn: LdapConn,
    base: String,
}

impl Client {
    pub fn connect_from_env() -> Result<Self> {
        let uri = std::env::var("LDAPURI").unwrap_or_else(|_| "ldap://localhost".to_string());
        debug!("Connecting to LDAP directory. uri={}", uri);
        let mut conn = LdapConn::new(&uri)?;
        if let Ok(binddn) = std::env::var("LDAPBINDDN") {
            let password = std::env::var("LDAPPASSWORD").unwrap_or_default();
            conn.simple_bind(&binddn, &password)?.success()?;
            debug!("Bound to LDAP directory. binddn={}", binddn);
        }
        let base = std::env::var("LDAPBASE").unwrap_or_default();
        Ok(Client { conn, base })
    }

    /// Run the rule search and resolve the referenced `fields`.
    pub fn run(
        &mut self,
        watch: &mut StopWatch,
        search: &Search,
        fields: &[String],
    ) -> Result<SearchResult> {
        let base = if search.base.is_empty() {
            self.base.clone()
        } else {
            search.base.clone()
        };
        let scope = parse_scope(&search.scope)?;

        // Ask the directory only for the attributes the templates use.
        let mut attributes: Vec<String> = Vec::new();
        for field in fields {
            let attribute = field.split('.').next().unwrap().to_string();
            if !attributes.contains(&attribute) {
                attributes.push(attribute);
            }
        }

        debug!(
            "Searching directory. base={} filter={} scope={}",
            base, search.filter, search.scope
        );
        let (raw_entries, _) = watch
            .time_it(|| {
                self.conn
                    .search(&base, scope, &search.filter, attributes.clone())
            })?
            .success()?;

        let mut entries = Vec::new();
        for raw in raw_entries {
            let source = SearchEntry::construct(raw);
            let mut entry = Entry {
                dn: source.dn.clone(),
                ..Default::default()
            };
            for (attribute, values) in source.attrs {
                entry
                    .attributes
                    .insert(attribute.to_lowercase(), values);
            }
            entry
                .attributes
                .insert("dn".to_string(), vec![source.dn]);

            self.resolve_subfields(watch, search, fields, &mut entry)?;
            entries.push(entry);
        }
        debug!("Search done. entries={}", entries.len());
        Ok(SearchResult { entries })
    }

    /// Populate `attr.sub` fields, through a sub-search when one is
    /// declared for the attribute, by direct RDN extraction otherwise.
    fn resolve_subfields(
        &mut self,
        watch: &mut StopWatch,
        search: &Search,
        fields: &[String],
        entry: &mut Entry,
    ) -> Result<()> {
        for field in fields {
            let (attribute, sub) = match field.split_once('.') {
                Some(parts) => parts,
                None => continue,
            };
            let dns = match entry.values(attribute) {
                Some(values) => values.to_vec(),
                None => continue,
            };

            let mut resolved = Vec::new();
            for dn in &dns {
                match search.subsearches.get(attribute) {
                    Some(subsearch) => {
                        match self.subsearch_values(watch, subsearch, dn, sub) {
                            Ok(values) => resolved.extend(values),
                            Err(err) => {
                                handle_unexpected_dn(search.on_unexpected_dn, dn, &err)?
                            }
                        }
                    }
                    None => match rdn(dn, sub) {
                        Some(value) => resolved.push(value),
                        None => {
                            let err = Error::Ldap(format!("no {} RDN in {:?}", sub, dn));
                            handle_unexpected_dn(search.on_unexpected_dn, dn, &err)?;
                        }
                    },
                }
            }
            entry.attributes.insert(field.clone(), resolved);
        }
        Ok(())
    }

    fn subsearch_values(
        &mut self,
        watch: &mut StopWatch,
        subsearch: &SubSearch,
        base: &str,
        attribute: &str,
    ) -> Result<Vec<String>> {
        let scope = parse_scope(&subsearch.scope)?;
        debug!(
            "Sub-searching directory. base={} filter={}",
            base, subsearch.filter
        );
        let (raw_entries, _) = watch
            .time_it(|| {
                self.conn
                    .search(base, scope, &subsearch.filter, vec![attribute.to_string()])
            })?
            .success()?;

        let mut values = Vec::new();
        for raw in raw_entries {
            let source = SearchEntry::construct(raw);
            for (name, attr_values) in source.attrs {
                if name.eq_ignore_ascii_case(attribute) {
                    values.extend(attr_values);
                }
            }
        }
        Ok(values)
    }
}

fn handle_unexpected_dn(mode: OnUnexpectedDn, dn: &str, err: &Error) -> Result<()> {
    match mode {
        OnUnexpectedDn::Fail => Err(Error::Ldap(format!("unexpected DN {:?}: {}", dn, err))),
        OnUnexpectedDn::Warn => {
            warn!("Unexpected DN. dn={:?} err={}", dn, err);
            Ok(())
        }
        OnUnexpectedDn::Silent => Ok(()),
    }
}
