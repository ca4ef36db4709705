//! Cherry-pick: replays an explicit list of meta commits onto the current
//! head, reusing the meta replay loop (sub pins included). The checked-out
//! branch advances commit by commit, so an abort has to rewind it.

use git2::Oid;
use tracing::{info, instrument};

use crate::error::{Error, Result};
use crate::pool::Pool;
use crate::rebase::{resume_open_sub_sequencers, restore_sub_heads, MetaReplay};
use crate::repo::{self, MetaRepo};
use crate::sequencer::{PinnedRef, Sequencer, SequencerKind, SubHeads};
use crate::status::{self, StatusQuery};

#[derive(Debug)]
pub struct CherryPickOutcome {
    pub new_head: Oid,
    pub created: Vec<Oid>,
}

#[instrument(skip(meta, pool))]
pub async fn cherry_pick(
    meta: &MetaRepo,
    commitishes: &[String],
    pool: Pool,
) -> Result<CherryPickOutcome> {
    if commitishes.is_empty() {
        return Err(Error::usage("cherry-pick needs at least one commit"));
    }
    let state_dir = meta.state_dir()?;
    if let Some(seq) = Sequencer::load(&state_dir)? {
        return Err(Error::usage(format!(
            "a {} is already in progress; run `{} --continue` or `{} --abort`",
            seq.kind.command(),
            seq.kind.command(),
            seq.kind.command()
        )));
    }
    let snapshot = status::meta_status(meta, &StatusQuery::default())?;
    status::ensure_clean(&snapshot)?;

    let repo = meta.repo();
    let mut commits = Vec::with_capacity(commitishes.len());
    for spec in commitishes {
        let oid = repo::require_commitish(repo, spec)?;
        let commit = repo.find_commit(oid)?;
        if commit.parent_count() > 1 {
            return Err(Error::usage(format!(
                "cannot cherry-pick merge commit {}",
                repo::short_oid(oid)
            )));
        }
        commits.push(oid);
    }

    let head = meta.head_commit()?.id();
    let target = *commits.last().expect("checked non-empty");
    let sequencer = Sequencer {
        kind: SequencerKind::CherryPick,
        original_head: PinnedRef {
            oid: head,
            refname: meta.head_refname(),
        },
        target: PinnedRef::detached(target),
        commits,
        current: 0,
        message: None,
    };

    let replay = MetaReplay { meta, pool };
    let outcome = replay.run(sequencer, Vec::new()).await?;
    SubHeads::clear(&state_dir)?;
    info!(new_head = %outcome.new_head, picked = outcome.created.len(), "cherry-pick complete");
    Ok(CherryPickOutcome {
        new_head: outcome.new_head,
        created: outcome.created,
    })
}

/// Resume after resolving conflicts: finish sub replays, commit the stopped
/// step from the staged index, then pick the remaining commits.
pub async fn cherry_pick_continue(meta: &MetaRepo, pool: Pool) -> Result<CherryPickOutcome> {
    let state_dir = meta.state_dir()?;
    let sequencer = Sequencer::load(&state_dir)?
        .ok_or_else(|| Error::usage("no cherry-pick in progress"))?;
    if sequencer.kind != SequencerKind::CherryPick {
        return Err(Error::usage(format!(
            "a {} is in progress, not a cherry-pick",
            sequencer.kind.command()
        )));
    }

    resume_open_sub_sequencers(meta, SequencerKind::Rebase)?;

    let repo = meta.repo();
    let mut index = repo.index()?;
    if index.has_conflicts() {
        return Err(Error::Conflict(
            "unresolved conflicts remain; resolve and stage them first".into(),
        ));
    }

    let cursor = meta.head_commit()?.id();
    let stopped_oid = sequencer
        .commits
        .get(sequencer.current)
        .copied()
        .ok_or_else(|| Error::internal("sequencer index out of range"))?;
    let stopped = repo.find_commit(stopped_oid)?;
    let tree_id = index.write_tree()?;
    let cursor_tree = repo::commit_tree(repo, cursor)?;

    let mut created = Vec::new();
    if tree_id != cursor_tree.id() {
        let tree = repo.find_tree(tree_id)?;
        let new_oid = repo::create_commit(
            repo,
            Some("HEAD"),
            &stopped.author(),
            &stopped.committer(),
            stopped.message().unwrap_or_default(),
            &tree,
            &[cursor],
        )?;
        let mut cb = git2::build::CheckoutBuilder::new();
        cb.force();
        repo.checkout_head(Some(&mut cb))?;
        created.push(new_oid);
    }

    let mut sequencer = sequencer;
    sequencer.current += 1;
    let replay = MetaReplay { meta, pool };
    let outcome = replay.run(sequencer, created).await?;
    SubHeads::clear(&state_dir)?;
    Ok(CherryPickOutcome {
        new_head: outcome.new_head,
        created: outcome.created,
    })
}

/// Abort: rewind the branch to where the cherry-pick started and restore
/// every touched sub.
pub fn cherry_pick_abort(meta: &MetaRepo) -> Result<()> {
    let state_dir = meta.state_dir()?;
    let sequencer = Sequencer::load(&state_dir)?
        .ok_or_else(|| Error::usage("no cherry-pick in progress"))?;
    if sequencer.kind != SequencerKind::CherryPick {
        return Err(Error::usage(format!(
            "a {} is in progress, not a cherry-pick",
            sequencer.kind.command()
        )));
    }
    restore_sub_heads(meta, &state_dir)?;

    let repo = meta.repo();
    if let Some(refname) = &sequencer.original_head.refname {
        repo.reference(refname, sequencer.original_head.oid, true, "cherry-pick aborted")?;
        repo.set_head(refname)?;
    }
    let object = repo.find_object(sequencer.original_head.oid, None)?;
    repo.reset(&object, git2::ResetType::Hard, None)?;
    Sequencer::clear(&state_dir)?;
    SubHeads::clear(&state_dir)?;
    Ok(())
}
