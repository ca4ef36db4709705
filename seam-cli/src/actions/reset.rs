use seam_core::workdir::{self, ResetMode};
use seam_core::{MetaRepo, Result};

use crate::cli::args::ResetArgs;

pub(crate) fn run(meta: &MetaRepo, args: ResetArgs) -> Result<()> {
    let mode = if args.soft {
        ResetMode::Soft
    } else if args.hard {
        ResetMode::Hard
    } else {
        ResetMode::Mixed
    };
    workdir::reset(meta, &args.commit, mode)?;
    println!("Reset to {}.", args.commit);
    Ok(())
}
