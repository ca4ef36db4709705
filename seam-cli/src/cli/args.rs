use std::path::PathBuf;

use clap::{ArgAction, ArgGroup, Args as ClapArgs, Parser, Subcommand};

/// Atomic merge, rebase, and status across a meta-repository and its
/// sub-repositories.
#[derive(Parser, Debug)]
#[command(
    name = "seam",
    version,
    about,
    disable_help_subcommand = true,
    arg_required_else_help = true,
    propagate_version = true
)]
pub(crate) struct Cli {
    #[command(flatten)]
    pub(crate) global: GlobalOpts,

    #[command(subcommand)]
    pub(crate) command: Commands,
}

#[derive(ClapArgs, Debug, Default)]
pub(crate) struct GlobalOpts {
    /// Run as if started from this directory instead of the CWD
    #[arg(short = 'C', long = "directory", global = true)]
    pub(crate) directory: Option<PathBuf>,

    /// Increase stderr verbosity (`-v` = info, `-vv` = debug)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub(crate) verbose: u8,

    /// Only errors on stderr
    #[arg(short = 'q', long, global = true)]
    pub(crate) quiet: bool,

    /// Bound for parallel sub-repository work (default 20)
    #[arg(short = 'j', long = "jobs", global = true)]
    pub(crate) jobs: Option<usize>,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Commands {
    /// Merge a commit into the current head across meta and subs
    Merge(MergeArgs),
    /// Replay the current branch onto an upstream, sub pins included
    Rebase(RebaseArgs),
    /// Apply existing commits on top of the current head
    #[command(name = "cherry-pick")]
    CherryPick(CherryPickArgs),
    /// Save and restore uncommitted state across meta and subs
    Stash(StashArgs),
    /// Index, workdir, and per-sub state
    Status(StatusArgs),
    /// Switch the meta head and realign opened subs
    Checkout(CheckoutArgs),
    /// Move the meta head; --hard realigns opened subs
    Reset(ResetArgs),
    /// Instantiate a sub-repository working directory
    Open(OpenArgs),
    /// Remove a clean sub-repository working directory
    Close(CloseArgs),
    /// Reconstruct meta + sub commits from a flat stitched commit
    Destitch(DestitchArgs),
}

#[derive(ClapArgs, Debug)]
#[command(group(ArgGroup::new("ff-mode").args(["ff", "ff_only", "no_ff"])))]
#[command(group(ArgGroup::new("resume").args(["cont", "abort"])))]
pub(crate) struct MergeArgs {
    /// Commit-ish to merge
    pub(crate) target: Option<String>,

    /// Merge commit message (required unless fast-forwarding)
    #[arg(short, long)]
    pub(crate) message: Option<String>,

    /// Fast-forward when possible (default)
    #[arg(long)]
    pub(crate) ff: bool,

    /// Refuse anything that is not a fast-forward
    #[arg(long = "ff-only")]
    pub(crate) ff_only: bool,

    /// Always create a merge commit
    #[arg(long = "no-ff")]
    pub(crate) no_ff: bool,

    /// Resume after resolving conflicts
    #[arg(long = "continue")]
    pub(crate) cont: bool,

    /// Abandon the in-progress merge
    #[arg(long)]
    pub(crate) abort: bool,
}

#[derive(ClapArgs, Debug)]
#[command(group(ArgGroup::new("resume").args(["cont", "abort"])))]
pub(crate) struct RebaseArgs {
    /// Upstream to replay onto
    pub(crate) upstream: Option<String>,

    #[arg(long = "continue")]
    pub(crate) cont: bool,

    #[arg(long)]
    pub(crate) abort: bool,
}

#[derive(ClapArgs, Debug)]
#[command(group(ArgGroup::new("resume").args(["cont", "abort"])))]
pub(crate) struct CherryPickArgs {
    /// Commits to apply, in order
    pub(crate) commits: Vec<String>,

    #[arg(long = "continue")]
    pub(crate) cont: bool,

    #[arg(long)]
    pub(crate) abort: bool,
}

#[derive(ClapArgs, Debug)]
pub(crate) struct StashArgs {
    #[command(subcommand)]
    pub(crate) command: Option<StashCommand>,
}

#[derive(Subcommand, Debug)]
pub(crate) enum StashCommand {
    /// Capture index + workdir state and clean the working copies (default)
    Push {
        /// Capture untracked files too
        #[arg(long = "include-untracked")]
        include_untracked: bool,

        #[arg(short, long)]
        message: Option<String>,
    },
    /// Apply an entry and drop it on success
    Pop {
        n: Option<usize>,
    },
    /// Apply an entry, keeping it in the log
    Apply {
        n: Option<usize>,

        /// Reinstate staged state as well
        #[arg(long)]
        index: bool,
    },
    /// Remove an entry without applying it
    Drop {
        n: Option<usize>,
    },
    List,
}

#[derive(ClapArgs, Debug)]
pub(crate) struct StatusArgs {
    /// Restrict to these path prefixes
    pub(crate) paths: Vec<String>,

    /// Expand untracked directories into individual files
    #[arg(long)]
    pub(crate) all: bool,

    /// Machine-readable output
    #[arg(long)]
    pub(crate) json: bool,
}

#[derive(ClapArgs, Debug)]
pub(crate) struct CheckoutArgs {
    /// Branch or commit to switch to
    pub(crate) target: String,

    /// Create this branch at the target first
    #[arg(short = 'b')]
    pub(crate) new_branch: Option<String>,

    /// Track the start point when branching from a remote ref
    #[arg(short = 't', long = "track")]
    pub(crate) track: bool,

    /// Discard local changes instead of failing
    #[arg(short = 'f', long)]
    pub(crate) force: bool,
}

#[derive(ClapArgs, Debug)]
#[command(group(ArgGroup::new("mode").args(["soft", "mixed", "hard"])))]
pub(crate) struct ResetArgs {
    /// Commit to reset to
    pub(crate) commit: String,

    #[arg(long)]
    pub(crate) soft: bool,

    /// Reset index but not workdir (default)
    #[arg(long)]
    pub(crate) mixed: bool,

    /// Reset index and workdir; opened subs follow their pins
    #[arg(long)]
    pub(crate) hard: bool,
}

#[derive(ClapArgs, Debug)]
pub(crate) struct OpenArgs {
    /// Sub-repository path
    pub(crate) path: String,
}

#[derive(ClapArgs, Debug)]
pub(crate) struct CloseArgs {
    /// Sub-repository path
    pub(crate) path: String,
}

#[derive(ClapArgs, Debug)]
pub(crate) struct DestitchArgs {
    /// Flat commit to reconstruct
    pub(crate) commitish: String,
}
