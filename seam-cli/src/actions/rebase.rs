use seam_core::pool::Pool;
use seam_core::rebase::{self, RebaseOutcome};
use seam_core::repo::short_oid;
use seam_core::{Error, MetaRepo, Result};

use crate::cli::args::RebaseArgs;

pub(crate) async fn run(meta: &MetaRepo, args: RebaseArgs, pool: Pool) -> Result<()> {
    if args.cont {
        let outcome = rebase::rebase_continue(meta, pool).await?;
        print_outcome(&outcome);
        return Ok(());
    }
    if args.abort {
        rebase::rebase_abort(meta)?;
        println!("Rebase aborted.");
        return Ok(());
    }
    let upstream = args
        .upstream
        .ok_or_else(|| Error::usage("rebase needs an upstream commit-ish"))?;
    let outcome = rebase::rebase(meta, &upstream, pool).await?;
    print_outcome(&outcome);
    Ok(())
}

fn print_outcome(outcome: &RebaseOutcome) {
    match outcome {
        RebaseOutcome::UpToDate => println!("Already up to date."),
        RebaseOutcome::FastForwarded(oid) => println!("Fast-forwarded to {}.", short_oid(*oid)),
        RebaseOutcome::Completed { new_head, created } => println!(
            "Rebase complete: {} commit(s) replayed, head at {}.",
            created.len(),
            short_oid(*new_head)
        ),
    }
}
