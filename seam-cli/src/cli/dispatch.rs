use std::path::PathBuf;

use clap::Parser;
use seam_core::pool::Pool;
use seam_core::{Error, MetaRepo};
use tracing_subscriber::EnvFilter;

use crate::actions;
use crate::cli::args::{Cli, Commands, GlobalOpts};

pub(crate) async fn run() -> i32 {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() { 2 } else { 0 };
        }
    };
    init_tracing(&cli.global);

    let start = cli
        .global
        .directory
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));
    let meta = match MetaRepo::discover(&start) {
        Ok(meta) => meta,
        Err(_) => {
            eprintln!(
                "seam: no meta-repository found at or above {}",
                start.display()
            );
            return Error::NotFound(String::new()).exit_code();
        }
    };
    let pool = cli.global.jobs.map(Pool::new).unwrap_or_default();

    let result = match cli.command {
        Commands::Merge(args) => actions::merge::run(&meta, args, &pool).await,
        Commands::Rebase(args) => actions::rebase::run(&meta, args, pool).await,
        Commands::CherryPick(args) => actions::cherry_pick::run(&meta, args, pool).await,
        Commands::Stash(args) => actions::stash::run(&meta, args),
        Commands::Status(args) => actions::status::run(&meta, args),
        Commands::Checkout(args) => actions::checkout::run(&meta, args),
        Commands::Reset(args) => actions::reset::run(&meta, args),
        Commands::Open(args) => actions::subs::open(&meta, args),
        Commands::Close(args) => actions::subs::close(&meta, args),
        Commands::Destitch(args) => actions::destitch::run(&meta, args),
    };

    match result {
        Ok(()) => 0,
        Err(err) => report(&err),
    }
}

/// User errors get one line; conflicts add resume guidance; bugs dump the
/// full chain.
fn report(err: &Error) -> i32 {
    if err.is_user_error() {
        eprintln!("seam: {err}");
        if err.is_resumable() {
            eprintln!("hint: fix conflicts, stage the results, then run `--continue` (or `--abort` to give up)");
        }
    } else {
        eprintln!("seam: internal failure: {err:?}");
    }
    err.exit_code()
}

fn init_tracing(global: &GlobalOpts) {
    let default = if global.quiet {
        "error"
    } else {
        match global.verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        }
    };
    let filter = EnvFilter::try_from_env("SEAM_LOG")
        .unwrap_or_else(|_| EnvFilter::new(format!("seam={default},seam_core={default}")));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}
