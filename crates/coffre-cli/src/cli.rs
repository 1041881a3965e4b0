use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "coffre",
    version,
    about = "Deduplicating, content-addressed backups",
    after_help = "\
Configuration file lookup order:
  1. --config <path>             (explicit flag)
  2. $COFFRE_CONFIG              (environment variable)
  3. $XDG_CONFIG_HOME/coffre/config.yaml or ~/.config/coffre/config.yaml

Environment variables:
  COFFRE_CONFIG     Path to configuration file (overrides default search)
  COFFRE_AGENTLESS  When set, the cached daemon refuses to start"
)]
pub(crate) struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    pub config: Option<String>,

    /// Suppress informational output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Suppress all non-error output
    #[arg(short, long, global = true)]
    pub silent: bool,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the state-coalescing daemon
    Cached {
        /// Run in the foreground instead of daemonizing
        #[arg(long)]
        foreground: bool,

        /// Log file
        #[arg(long)]
        log: Option<String>,

        /// Delay before tearing down an idle daemon
        #[arg(long, default_value = "5s")]
        teardown: String,
    },

    /// Run the configured task set until interrupted
    Scheduler {
        /// File whose contents unlock encrypted repositories
        #[arg(long)]
        key_file: Option<String>,
    },

    /// Rebuild missing remote states from packfiles
    Repair {
        /// Select repository by @alias or location
        #[arg(short = 'R', long = "repo")]
        repo: String,

        /// Actually write the reconstructed states (dry-run otherwise)
        #[arg(long)]
        apply: bool,
    },

    /// Serve snapshots as a read-only filesystem
    Mount {
        /// Select repository by @alias or location
        #[arg(short = 'R', long = "repo")]
        repo: String,

        /// Mount target: http://addr:port
        #[arg(long)]
        to: String,
    },

    /// Initialize a new repository
    Init {
        /// Repository @alias or location
        #[arg(short = 'R', long = "repo")]
        repo: String,
    },

    /// Back up a directory into a new snapshot
    Backup {
        /// Select repository by @alias or location
        #[arg(short = 'R', long = "repo")]
        repo: String,

        /// Job name recorded in the snapshot
        #[arg(long, default_value = "")]
        job: String,

        /// Tags recorded in the snapshot
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Exclude patterns (glob)
        #[arg(long = "exclude")]
        excludes: Vec<String>,

        /// Directory to back up
        path: String,
    },
}
