use seam_core::cherry::{self, CherryPickOutcome};
use seam_core::pool::Pool;
use seam_core::repo::short_oid;
use seam_core::{Error, MetaRepo, Result};

use crate::cli::args::CherryPickArgs;

pub(crate) async fn run(meta: &MetaRepo, args: CherryPickArgs, pool: Pool) -> Result<()> {
    if args.cont {
        let outcome = cherry::cherry_pick_continue(meta, pool).await?;
        print_outcome(&outcome);
        return Ok(());
    }
    if args.abort {
        cherry::cherry_pick_abort(meta)?;
        println!("Cherry-pick aborted.");
        return Ok(());
    }
    if args.commits.is_empty() {
        return Err(Error::usage("cherry-pick needs at least one commit"));
    }
    let outcome = cherry::cherry_pick(meta, &args.commits, pool).await?;
    print_outcome(&outcome);
    Ok(())
}

fn print_outcome(outcome: &CherryPickOutcome) {
    println!(
        "Picked {} commit(s), head at {}.",
        outcome.created.len(),
        short_oid(outcome.new_head)
    );
}
