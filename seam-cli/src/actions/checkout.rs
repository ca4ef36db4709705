use seam_core::workdir::{self, CheckoutRequest};
use seam_core::{MetaRepo, Result};

use crate::cli::args::CheckoutArgs;

pub(crate) fn run(meta: &MetaRepo, args: CheckoutArgs) -> Result<()> {
    let request = CheckoutRequest {
        target: args.target.clone(),
        new_branch: args.new_branch,
        track: args.track,
        force: args.force,
    };
    workdir::checkout(meta, &request)?;
    println!("Switched to {}.", args.target);
    Ok(())
}
