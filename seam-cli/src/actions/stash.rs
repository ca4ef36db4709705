use seam_core::repo::short_oid;
use seam_core::stash;
use seam_core::{MetaRepo, Result};

use crate::cli::args::{StashArgs, StashCommand};

pub(crate) fn run(meta: &MetaRepo, args: StashArgs) -> Result<()> {
    match args.command.unwrap_or(StashCommand::Push {
        include_untracked: false,
        message: None,
    }) {
        StashCommand::Push {
            include_untracked,
            message,
        } => {
            let entry = stash::push(meta, include_untracked, message.as_deref())?;
            println!("Saved working state as {}.", short_oid(entry));
        }
        StashCommand::Pop { n } => {
            stash::pop(meta, n.unwrap_or(0))?;
            println!("Applied and dropped stash entry.");
        }
        StashCommand::Apply { n, index } => {
            stash::apply(meta, n.unwrap_or(0), index)?;
            println!("Applied stash entry.");
        }
        StashCommand::Drop { n } => {
            stash::drop(meta, n.unwrap_or(0))?;
            println!("Dropped stash entry.");
        }
        StashCommand::List => {
            for entry in stash::list(meta)? {
                println!(
                    "stash@{{{}}}: {} ({}, {})",
                    entry.index,
                    entry.message,
                    short_oid(entry.oid),
                    entry.when.format("%Y-%m-%d %H:%M")
                );
            }
        }
    }
    Ok(())
}
