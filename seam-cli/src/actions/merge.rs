use seam_core::merge::{self, MergeMode, MergeOutcome, MergeRequest, OpenPolicy};
use seam_core::pool::Pool;
use seam_core::repo::short_oid;
use seam_core::{Error, MetaRepo, Result};

use crate::cli::args::MergeArgs;

pub(crate) async fn run(meta: &MetaRepo, args: MergeArgs, pool: &Pool) -> Result<()> {
    if args.cont {
        let outcome = merge::merge_continue(meta).await?;
        print_outcome(&outcome);
        return Ok(());
    }
    if args.abort {
        merge::merge_abort(meta)?;
        println!("Merge aborted.");
        return Ok(());
    }

    let target = args
        .target
        .ok_or_else(|| Error::usage("merge needs a target commit-ish"))?;
    let mode = if args.no_ff {
        MergeMode::ForceCommit
    } else if args.ff_only {
        MergeMode::FfOnly
    } else {
        MergeMode::Normal
    };
    if mode == MergeMode::ForceCommit && args.message.is_none() {
        return Err(Error::usage("--no-ff requires --message"));
    }

    let request = MergeRequest {
        target,
        mode,
        message: args.message,
        open_policy: OpenPolicy::AllowOpen,
    };
    let outcome = merge::merge(meta, &request, pool).await?;
    print_outcome(&outcome);
    Ok(())
}

fn print_outcome(outcome: &MergeOutcome) {
    match outcome {
        MergeOutcome::UpToDate => println!("Already up to date."),
        MergeOutcome::FastForwarded(oid) => println!("Fast-forwarded to {}.", short_oid(*oid)),
        MergeOutcome::Committed(oid) => println!("Merge committed as {}.", short_oid(*oid)),
    }
}
