use std::path::PathBuf;
use structopt::StructOpt;

/// Reconcile PostgreSQL roles and privileges against an LDAP directory
///
/// Connection parameters come from the standard PG* and LDAP* environment
/// variables.
#[derive(Debug, StructOpt)]
#[structopt(name = "pgldapsync")]
pub struct Cli {
    /// Path to the YAML configuration file
    #[structopt(short = "c", long, parse(from_os_str))]
    pub config: Option<PathBuf>,

    /// Check mode: exit non-zero when changes are pending
    #[structopt(short = "C", long)]
    pub check: bool,

    /// Real mode: apply changes to the Postgres instance
    #[structopt(short = "N", long, conflicts_with = "dry")]
    pub real: bool,

    /// Dry run: don't touch Postgres, just log what would be done (default)
    #[structopt(short = "n", long)]
    pub dry: bool,

    /// Increase log verbosity (repeatable)
    #[structopt(short = "v", long, parse(from_occurrences))]
    pub verbose: u8,

    /// Decrease log verbosity (repeatable)
    #[structopt(short = "q", long, parse(from_occurrences))]
    pub quiet: u8,

    /// Force colored output
    #[structopt(long, conflicts_with = "no_color")]
    pub color: bool,

    /// Disable colored output
    #[structopt(long = "no-color")]
    pub no_color: bool,

    /// Don't synchronize privileges, only roles
    #[structopt(short = "P", long = "skip-privileges")]
    pub skip_privileges: bool,
}

const LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

impl Cli {
    /// Log filter from -v/-q counts, starting at info.
    pub fn log_filter(&self) -> &'static str {
        let index = (2 + self.verbose as i32 - self.quiet as i32)
            .clamp(0, LEVELS.len() as i32 - 1);
        LEVELS[index as usize]
    }

    /// Colors: forced on/off by flags, otherwise follow the terminal.
    pub fn color(&self) -> bool {
        if self.no_color {
            false
        } else if self.color {
            true
        } else {
            term_size::dimensions().is_some()
        }
    }
}

// Parse the command line arguments
pub fn parse() -> Cli {
    Cli::from_args()
}
