use seam_core::repo::{self, short_oid};
use seam_core::{destitch, MetaRepo, Result};

use crate::cli::args::DestitchArgs;

pub(crate) fn run(meta: &MetaRepo, args: DestitchArgs) -> Result<()> {
    let stitched = repo::require_commitish(meta.repo(), &args.commitish)?;
    let rebuilt = destitch::destitch(meta, stitched)?;
    println!("Destitched {} into {}.", short_oid(stitched), short_oid(rebuilt));
    Ok(())
}
