//! Per-role boolean options and connection limit.
//!
//! The effective option set depends on the cluster version: the inspector
//! reports the `pg_roles` columns it found, and rendering/diffing is
//! restricted to those columns.

use crate::errors::{Error, Result};

/// Option columns in rendering order, paired with their SQL keyword.
pub const COLUMNS: [(&str, &str); 8] = [
    ("rolsuper", "SUPERUSER"),
    ("rolinherit", "INHERIT"),
    ("rolcreaterole", "CREATEROLE"),
    ("rolcreatedb", "CREATEDB"),
    ("rolcanlogin", "LOGIN"),
    ("rolreplication", "REPLICATION"),
    ("rolbypassrls", "BYPASSRLS"),
    ("rolconnlimit", "CONNECTION LIMIT"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleOptions {
    pub superuser: bool,
    pub inherit: bool,
    pub create_role: bool,
    pub create_db: bool,
    pub can_login: bool,
    pub replication: bool,
    pub bypass_rls: bool,
    pub conn_limit: i32,
}

impl Default for RoleOptions {
    fn default() -> Self {
        RoleOptions {
            superuser: false,
            inherit: true,
            create_role: false,
            create_db: false,
            can_login: false,
            replication: false,
            bypass_rls: false,
            conn_limit: -1,
        }
    }
}

impl RoleOptions {
    fn get_bool(&self, column: &str) -> Option<bool> {
        match column {
            "rolsuper" => Some(self.superuser),
            "rolinherit" => Some(self.inherit),
            "rolcreaterole" => Some(self.create_role),
            "rolcreatedb" => Some(self.create_db),
            "rolcanlogin" => Some(self.can_login),
            "rolreplication" => Some(self.replication),
            "rolbypassrls" => Some(self.bypass_rls),
            _ => None,
        }
    }

    /// Load one inspected column value.
    pub fn set_bool(&mut self, column: &str, value: bool) {
        match column {
            "rolsuper" => self.superuser = value,
            "rolinherit" => self.inherit = value,
            "rolcreaterole" => self.create_role = value,
            "rolcreatedb" => self.create_db = value,
            "rolcanlogin" => self.can_login = value,
            "rolreplication" => self.replication = value,
            "rolbypassrls" => self.bypass_rls = value,
            _ => {}
        }
    }

    fn apply_keyword(&mut self, keyword: &str, value: bool) -> Result<()> {
        match keyword {
            "SUPERUSER" => self.superuser = value,
            "INHERIT" => self.inherit = value,
            "CREATEROLE" => self.create_role = value,
            "CREATEDB" => self.create_db = value,
            "LOGIN" => self.can_login = value,
            "REPLICATION" => self.replication = value,
            "BYPASSRLS" => self.bypass_rls = value,
            _ => {
                return Err(Error::Config(format!(
                    "unknown role option: {}",
                    keyword
                )))
            }
        }
        Ok(())
    }

    fn is_keyword(keyword: &str) -> bool {
        COLUMNS
            .iter()
            .any(|(column, k)| *k == keyword && *column != "rolconnlimit")
    }

    /// Apply one option token: `LOGIN`, `NOLOGIN`, `SUPERUSER`, ...
    pub fn apply_token(&mut self, token: &str, value: bool) -> Result<()> {
        let upper = token.to_uppercase();
        if let Some(rest) = upper.strip_prefix("NO") {
            // NOINHERIT and friends flip the value.
            if Self::is_keyword(rest) {
                return self.apply_keyword(rest, !value);
            }
        }
        self.apply_keyword(&upper, value)
    }

    /// Parse a whitespace-separated option string such as
    /// `LOGIN CREATEDB CONNECTION LIMIT 10`.
    pub fn parse(spec: &str) -> Result<Self> {
        let mut options = RoleOptions::default();
        let mut tokens = spec.split_whitespace().peekable();
        while let Some(token) = tokens.next() {
            if token.eq_ignore_ascii_case("CONNECTION") {
                match (tokens.next(), tokens.next()) {
                    (Some(limit), Some(value)) if limit.eq_ignore_ascii_case("LIMIT") => {
                        options.conn_limit = value.parse().map_err(|_| {
                            Error::Config(format!("bad connection limit: {}", value))
                        })?;
                    }
                    _ => return Err(Error::Config("bad CONNECTION LIMIT clause".to_string())),
                }
                continue;
            }
            options.apply_token(token, true)?;
        }
        Ok(options)
    }

    /// Render the options differing from role defaults, restricted to the
    /// columns the inspected cluster supports.
    pub fn format(&self, columns: &[String]) -> String {
        let defaults = RoleOptions::default();
        let mut parts = Vec::new();
        for (column, keyword) in COLUMNS {
            if !columns.iter().any(|c| c == column) {
                continue;
            }
            if column == "rolconnlimit" {
                if self.conn_limit != defaults.conn_limit {
                    parts.push(format!("{} {}", keyword, self.conn_limit));
                }
                continue;
            }
            let value = self.get_bool(column).unwrap();
            if value != defaults.get_bool(column).unwrap() {
                parts.push(if value {
                    keyword.to_string()
                } else {
                    format!("NO{}", keyword)
                });
            }
        }
        parts.join(" ")
    }

    /// Render only the options that differ between `self` (current) and
    /// `wanted`, for a single `ALTER ROLE ... WITH` statement.
    pub fn diff(&self, wanted: &RoleOptions, columns: &[String]) -> String {
        let mut parts = Vec::new();
        for (column, keyword) in COLUMNS {
            if !columns.iter().any(|c| c == column) {
                continue;
            }
            if column == "rolconnlimit" {
                if self.conn_limit != wanted.conn_limit {
                    parts.push(format!("{} {}", keyword, wanted.conn_limit));
                }
                continue;
            }
            let current = self.get_bool(column).unwrap();
            let target = wanted.get_bool(column).unwrap();
            if current != target {
                parts.push(if target {
                    keyword.to_string()
                } else {
                    format!("NO{}", keyword)
                });
            }
        }
        parts.join(" ")
    }
}

/// All known option columns, used when the inspector has not constrained
/// the set (tests, mostly).
pub fn all_columns() -> Vec<String> {
    COLUMNS.iter().map(|(c, _)| c.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tokens() {
        let options = RoleOptions::parse("LOGIN CREATEDB NOINHERIT").unwrap();
        assert!(options.can_login);
        assert!(options.create_db);
        assert!(!options.inherit);
    }

    #[test]
    fn test_parse_connection_limit() {
        let options = RoleOptions::parse("LOGIN CONNECTION LIMIT 10").unwrap();
        assert_eq!(options.conn_limit, 10);
    }

    #[test]
    fn test_parse_unknown_token() {
        assert!(RoleOptions::parse("WIZARD").is_err());
    }

    #[test]
    fn test_format_renders_non_defaults_only() {
        let options = RoleOptions::parse("LOGIN").unwrap();
        assert_eq!(options.format(&all_columns()), "LOGIN");

        let defaults = RoleOptions::default();
        assert_eq!(defaults.format(&all_columns()), "");
    }

    #[test]
    fn test_format_respects_columns() {
        let mut options = RoleOptions::default();
        options.bypass_rls = true;
        options.can_login = true;
        // Pretend an old cluster without rolbypassrls.
        let columns: Vec<String> = ["rolsuper", "rolcanlogin"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(options.format(&columns), "LOGIN");
    }

    #[test]
    fn test_diff_changed_only() {
        let current = RoleOptions::parse("LOGIN").unwrap();
        let wanted = RoleOptions::parse("LOGIN CREATEDB CONNECTION LIMIT 5").unwrap();
        assert_eq!(
            current.diff(&wanted, &all_columns()),
            "CREATEDB CONNECTION LIMIT 5"
        );
        assert_eq!(current.diff(&current, &all_columns()), "");
    }
}
