use seam_core::status::{self, StatusQuery, UntrackedPolicy};
use seam_core::{Error, MetaRepo, Result};

use crate::cli::args::StatusArgs;

pub(crate) fn run(meta: &MetaRepo, args: StatusArgs) -> Result<()> {
    let query = StatusQuery {
        paths: args.paths,
        untracked: if args.all {
            UntrackedPolicy::All
        } else {
            UntrackedPolicy::Normal
        },
        ..StatusQuery::default()
    };
    let snapshot = status::meta_status(meta, &query)?;
    if args.json {
        let rendered = serde_json::to_string_pretty(&snapshot)
            .map_err(|err| Error::internal(format!("status serialisation failed: {err}")))?;
        println!("{rendered}");
    } else {
        print!("{}", status::render(&snapshot));
    }
    Ok(())
}
