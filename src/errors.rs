use thiserror::Error;

/// Error kinds surfaced by the reconciliation pipeline.
///
/// `Config` and `Ldap` happen before the cluster is touched. `Inspect` and
/// `Apply` abort the run; statements already executed are not rolled back.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid YAML shape, unknown key, conflicting alias, bad template or
    /// unresolvable profile reference.
    #[error("configuration: {0}")]
    Config(String),

    /// LDAP bind or search failure, or an unexpected DN in a sub-search.
    #[error("ldap: {0}")]
    Ldap(String),

    /// Cluster inspection query failure.
    #[error("inspect: {0}")]
    Inspect(#[source] postgres::Error),

    /// Statement execution failure. Carries the offending SQL.
    #[error("apply: {query}: {source}")]
    Apply {
        query: String,
        #[source]
        source: postgres::Error,
    },

    /// Invariant violation. Indicates a bug, not an input problem.
    #[error("internal: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Prefix a config error with the YAML path of the offending node.
    pub fn in_path(self, path: &str) -> Self {
        match self {
            Error::Config(msg) => Error::Config(format!("{}: {}", path, msg)),
            other => other,
        }
    }
}

impl From<ldap3::LdapError> for Error {
    fn from(err: ldap3::LdapError) -> Self {
        Error::Ldap(err.to_string())
    }
}
