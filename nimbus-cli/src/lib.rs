//! # Nimbus CLI
//!
//! Command-line front end of the nimbus cluster lifecycle engine.
//! Argument definitions live here; `commands` runs them.

#![warn(missing_docs)]

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use clap::{ArgAction, Args, Parser, Subcommand};
use env_logger::Env;
use nimbus_cluster::ClusterError;
use regex::Regex;

pub mod commands;

/// Version of the CLI
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit code when no active configuration exists for a cluster (`EX_NOINPUT`)
pub const EX_NOINPUT: i32 = 66;

/// Message printed when the user interrupts an operation
pub const INTERRUPTED: &str =
    "WARNING: execution interrupted by the user! Your clusters may be in inconsistent state!";

/// Nimbus: start, resize and stop clusters of cloud machines
#[derive(Debug, Parser)]
#[command(name = "nimbus", version = VERSION, about = "Create, manage and set up compute clusters")]
pub struct Cli {
    /// Increase verbosity (repeat for more)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Directory holding cluster state files
    #[arg(short, long, env = "NIMBUS_STORAGE", global = true)]
    pub storage: Option<PathBuf>,

    /// Configuration file
    #[arg(short, long, env = "NIMBUS_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create a cluster from a template
    Start(StartArgs),

    /// Destroy every node of a cluster
    Stop {
        /// Cluster name
        cluster: String,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Add or remove nodes
    Resize(ResizeArgs),

    /// Destroy a single node
    RemoveNode {
        /// Cluster name
        cluster: String,

        /// Node name
        node: String,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// List started clusters
    List,

    /// List cluster templates, optionally filtered by glob patterns
    ListTemplates {
        /// Glob patterns on template names
        patterns: Vec<String>,
    },

    /// Show the nodes of a cluster
    ListNodes {
        /// Cluster name
        cluster: String,

        /// Print JSON
        #[arg(long, conflicts_with = "pretty_json")]
        json: bool,

        /// Print indented JSON
        #[arg(long)]
        pretty_json: bool,
    },

    /// Run the configuration tool on a cluster
    Setup {
        /// Cluster name
        cluster: String,

        /// Arguments appended to the configuration tool command line
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        extra: Vec<String>,
    },

    /// Open an SSH session on a node
    Ssh(RemoteArgs),

    /// Open an SFTP session on a node
    Sftp(RemoteArgs),
}

/// Arguments of `start`
#[derive(Debug, Args)]
pub struct StartArgs {
    /// Template to create the cluster from
    pub template: String,

    /// Cluster name; defaults to the template name
    #[arg(short, long)]
    pub name: Option<String>,

    /// Node counts overriding the template, as N:GROUP[,N:GROUP...]
    #[arg(long, value_delimiter = ',')]
    pub nodes: Vec<GroupCount>,

    /// Do not configure the cluster once started
    #[arg(long)]
    pub no_setup: bool,
}

/// Arguments of `resize`
#[derive(Debug, Args)]
pub struct ResizeArgs {
    /// Cluster name
    pub cluster: String,

    /// Nodes to add, as N:GROUP[,N:GROUP...]
    #[arg(short, long, value_delimiter = ',')]
    pub add: Vec<GroupCount>,

    /// Nodes to remove, as N:GROUP[,N:GROUP...]
    #[arg(short, long, value_delimiter = ',')]
    pub remove: Vec<GroupCount>,

    /// Do not configure the cluster after adding nodes
    #[arg(long)]
    pub no_setup: bool,

    /// Do not ask for confirmation
    #[arg(short, long)]
    pub yes: bool,
}

/// Arguments of `ssh` and `sftp`
#[derive(Debug, Args)]
pub struct RemoteArgs {
    /// Cluster name
    pub cluster: String,

    /// Node to connect to; defaults to the cluster's `ssh_to` node
    #[arg(short, long)]
    pub node: Option<String>,

    /// Arguments passed to the client
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

/// A node count for one group, written `N:GROUP`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupCount {
    /// Number of nodes
    pub count: u32,
    /// Group name
    pub group: String,
}

impl FromStr for GroupCount {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (count, group) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| format!("`{}` is not of the form N:GROUP", s))?;
        let count = count
            .trim()
            .parse()
            .map_err(|_| format!("`{}` is not a valid node count", count.trim()))?;
        let group = group.trim();
        if group.is_empty() {
            return Err(format!("`{}` has no group name", s));
        }
        Ok(GroupCount { count, group: group.to_string() })
    }
}

impl fmt::Display for GroupCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.count, self.group)
    }
}

/// Errors raised by the CLI itself
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// A child process exited unsuccessfully
    #[error("{program} exited with status {code}")]
    ChildFailed {
        /// Program name
        program: String,
        /// Its exit code
        code: i32,
    },

    /// The user declined a confirmation
    #[error("aborted by the user")]
    Aborted,
}

/// Translate a glob pattern (`*`, `?`, `[...]`) into an anchored regex
pub fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            '[' => {
                re.push('[');
                if chars.peek() == Some(&'!') {
                    chars.next();
                    re.push('^');
                }
                for c in chars.by_ref() {
                    if c == ']' {
                        break;
                    }
                    if c == '\\' {
                        re.push('\\');
                    }
                    re.push(c);
                }
                re.push(']');
            }
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re)
}

/// Log level for a `-v` count
pub fn log_level(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Initialise logging; `RUST_LOG` takes precedence over `-v`
pub fn init_logging(verbosity: u8) {
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or(log_level(verbosity))).try_init();
}

/// Process exit code for a failed command
pub fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(CliError::ChildFailed { code, .. }) = err.downcast_ref::<CliError>() {
        return *code;
    }
    match err.downcast_ref::<ClusterError>() {
        Some(ClusterError::ClusterNotFound(_)) => EX_NOINPUT,
        _ => 1,
    }
}
