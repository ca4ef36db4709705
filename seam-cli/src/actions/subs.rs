use seam_core::workdir;
use seam_core::{MetaRepo, Result};

use crate::cli::args::{CloseArgs, OpenArgs};

pub(crate) fn open(meta: &MetaRepo, args: OpenArgs) -> Result<()> {
    workdir::open_sub(meta, &args.path, None)?;
    println!("Opened {}.", args.path);
    Ok(())
}

pub(crate) fn close(meta: &MetaRepo, args: CloseArgs) -> Result<()> {
    workdir::close_sub(meta, &args.path)?;
    println!("Closed {}.", args.path);
    Ok(())
}
