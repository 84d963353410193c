//! Diff current against wanted grants for one database and one ACL.

use crate::errors::Result;
use crate::postgres::SyncQuery;
use crate::privileges::{Acl, Grant};
use std::collections::HashSet;

/// Revokes first, then grants, each in grant display order.
///
/// A current grant flagged `partial` covers only part of an ALL-style
/// target: it is matched against wanted with `partial` cleared (so it is
/// not revoked) but stays unequal in the grant pass (so it is regranted).
pub fn diff(current: &[Grant], wanted: &[Grant]) -> Result<Vec<SyncQuery>> {
    let mut current: Vec<&Grant> = current.iter().collect();
    current.sort_by_key(|g| (g.grantee.clone(), g.to_string()));
    let mut wanted: Vec<&Grant> = wanted.iter().collect();
    wanted.sort_by_key(|g| (g.grantee.clone(), g.to_string()));

    let wanted_set: HashSet<&Grant> = wanted.iter().copied().collect();
    let mut out = Vec::new();

    for grant in &current {
        // An "ANY ... IN SCHEMA" marker is informational and never revoked.
        if grant.is_wildcard() {
            continue;
        }
        let mut key = (*grant).clone();
        key.partial = false;
        if wanted_set.contains(&key) {
            continue;
        }

        let acl = Acl::lookup(&grant.acl)?;
        out.push(SyncQuery {
            description: "Revoke privileges.",
            database: grant.database.clone(),
            sql: grant.format_query(acl.revoke_sql)?,
            tags: vec![("grant", grant.to_string())],
        });
    }

    let current_set: HashSet<&Grant> = current.iter().copied().collect();
    for grant in &wanted {
        if current_set.contains(grant) {
            continue;
        }
        // A wildcard grant to public on the same target already covers
        // this grant; skip to avoid regranting every run.
        let mut wildcard = (*grant).clone();
        wildcard.grantee = "public".to_string();
        wildcard.type_ = String::new();
        if current_set.contains(&wildcard) {
            continue;
        }

        let acl = Acl::lookup(&grant.acl)?;
        out.push(SyncQuery {
            description: "Grant privileges.",
            database: grant.database.clone(),
            sql: grant.format_query(acl.grant_sql)?,
            tags: vec![("grant", grant.to_string())],
        });
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_grant(schema: &str, type_: &str, grantee: &str) -> Grant {
        Grant {
            grantee: grantee.to_string(),
            acl: "TABLES".to_string(),
            type_: type_.to_string(),
            database: "db1".to_string(),
            schema: schema.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_in_sync_yields_nothing() {
        let grants = vec![table_grant("s", "SELECT", "alice")];
        assert!(diff(&grants, &grants).unwrap().is_empty());
    }

    #[test]
    fn test_revoke_spurious() {
        let current = vec![table_grant("s", "SELECT", "alice")];
        let queries = diff(&current, &[]).unwrap();
        assert_eq!(queries.len(), 1);
        assert_eq!(
            queries[0].sql,
            "REVOKE SELECT ON ALL TABLES IN SCHEMA \"s\" FROM \"alice\";"
        );
        assert_eq!(queries[0].database, "db1");
    }

    #[test]
    fn test_grant_missing() {
        let wanted = vec![table_grant("s", "SELECT", "alice")];
        let queries = diff(&[], &wanted).unwrap();
        assert_eq!(queries.len(), 1);
        assert_eq!(
            queries[0].sql,
            "GRANT SELECT ON ALL TABLES IN SCHEMA \"s\" TO \"alice\";"
        );
    }

    #[test]
    fn test_partial_triggers_regrant_without_revoke() {
        let mut partial = table_grant("s", "SELECT", "alice");
        partial.partial = true;
        let wanted = vec![table_grant("s", "SELECT", "alice")];
        let queries = diff(&[partial], &wanted).unwrap();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].description, "Grant privileges.");
    }

    #[test]
    fn test_public_wildcard_covers_wanted() {
        let mut wildcard = table_grant("s", "", "public");
        wildcard.type_ = String::new();
        let wanted = vec![table_grant("s", "SELECT", "alice")];
        // No grant: the public wildcard covers alice. No revoke: wildcards
        // are never revoked.
        assert!(diff(&[wildcard], &wanted).unwrap().is_empty());
    }

    #[test]
    fn test_ordering_revokes_before_grants() {
        let current = vec![table_grant("s", "INSERT", "bob")];
        let wanted = vec![table_grant("s", "SELECT", "alice")];
        let queries = diff(&current, &wanted).unwrap();
        let descriptions: Vec<&str> = queries.iter().map(|q| q.description).collect();
        assert_eq!(descriptions, vec!["Revoke privileges.", "Grant privileges."]);
    }
}
