//! Reconcile a PostgreSQL cluster's roles, memberships and privileges
//! against a declarative YAML specification fed by an LDAP directory.
//!
//! A run is a single reconcile pass:
//!
//! 1. Load and normalize the YAML configuration into rules, privilege
//!    profiles and inspection knobs.
//! 2. Execute each rule: run its LDAP search, project attribute values
//!    into role and grant templates.
//! 3. Inspect the cluster: databases, schemas, roles, memberships and
//!    current grants, restricted to what the configuration manages.
//! 4. Diff wanted against current state and emit an ordered stream of
//!    statements: role drops, creates and alters first, then per-database
//!    revokes and grants.
//! 5. Apply the statements, or log them in dry-run mode.
//!
//! ## Example
//!
//! ```yaml
//! postgres:
//!   fallback_owner: postgres
//!   managed_roles_query: |
//!     SELECT 'public' UNION
//!     SELECT rolname FROM pg_roles WHERE rolname LIKE 'ext_%'
//!
//! privileges:
//!   reading: [ro]
//!
//! rules:
//! - description: Mirror directory groups as reader roles.
//!   ldapsearch:
//!     base: ou=groups,dc=acme,dc=tld
//!     filter: (objectClass=groupOfNames)
//!   roles:
//!     name: "ext_{cn}"
//!     options: LOGIN
//!   grants:
//!     privileges: reading
//!     roles: "ext_{cn}"
//! ```
//!
//! ```bash
//! $ pgldapsync --config acme.yml          # dry run
//! $ pgldapsync --config acme.yml --real   # apply
//! $ pgldapsync --config acme.yml --check  # exit 1 when out of sync
//! ```
//!
//! Cluster and directory connections are configured through the standard
//! `PGHOST`/`PGUSER`/... and `LDAPURI`/`LDAPBINDDN`/... environment
//! variables.

pub mod apply;
pub mod cli;
pub mod config;
pub mod errors;
pub mod fmt;
pub mod inspect;
pub mod ldap;
pub mod perf;
pub mod postgres;
pub mod privileges;
pub mod role;
pub mod rules;
