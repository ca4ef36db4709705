//! Replay engine: re-applies a linear range of commits onto a target,
//! per-repository, with fast-forward detection, empty-step skipping, and a
//! resumable conflict stop. The meta-level driver layers sub-repository pin
//! resolution on top of the same per-commit loop.

use std::path::PathBuf;

use git2::build::CheckoutBuilder;
use git2::{ErrorCode, Oid, Repository, Sort};
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::fetcher::Fetcher;
use crate::pins::{self, PinResolution};
use crate::pool::Pool;
use crate::registry::Registry;
use crate::repo::{self, MetaRepo};
use crate::sequencer::{PinnedRef, Sequencer, SequencerKind, SubHeads};
use crate::status::{self, StatusQuery};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayResult {
    /// The source already contains the target; the result is the source.
    UpToDate(Oid),
    /// The target already contains the source; the result is the target.
    FastForwarded(Oid),
    Completed { new_head: Oid, created: Vec<Oid> },
}

/// Safe checkout of `to`'s tree followed by a HEAD move. A checkout conflict
/// from local modifications maps to `DIRTY`.
pub fn fast_forward_checkout(repo: &Repository, to: Oid) -> Result<()> {
    let object = repo.find_object(to, None)?;
    let mut cb = CheckoutBuilder::new();
    cb.safe();
    repo.checkout_tree(&object, Some(&mut cb))
        .map_err(|err| map_checkout_dirty(repo, err))?;
    match repo.head() {
        Ok(head) if head.is_branch() => {
            let name = head
                .name()
                .ok_or_else(|| Error::internal("branch ref has non-utf8 name"))?
                .to_string();
            repo.reference(&name, to, true, "fast-forward")?;
        }
        _ => repo.set_head_detached(to)?,
    }
    Ok(())
}

pub(crate) fn map_checkout_dirty(repo: &Repository, err: git2::Error) -> Error {
    if err.code() == ErrorCode::Conflict {
        let workdir = repo
            .workdir()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        Error::dirty(format!(
            "local changes in {workdir} would be overwritten; commit or stash them first"
        ))
    } else {
        err.into()
    }
}

/// Detach HEAD at `oid`, bringing the working directory along.
pub fn checkout_detached(repo: &Repository, oid: Oid) -> Result<()> {
    let object = repo.find_object(oid, None)?;
    let mut cb = CheckoutBuilder::new();
    cb.safe();
    repo.checkout_tree(&object, Some(&mut cb))
        .map_err(|err| map_checkout_dirty(repo, err))?;
    repo.set_head_detached(oid)?;
    Ok(())
}

/// Linear range `base..tip`, oldest first, merge commits dropped.
pub fn linear_range(repo: &Repository, base: Oid, tip: Oid) -> Result<Vec<Oid>> {
    let mut walk = repo.revwalk()?;
    walk.set_sorting(Sort::TOPOLOGICAL | Sort::REVERSE)?;
    walk.push(tip)?;
    walk.hide(base)?;
    let mut commits = Vec::new();
    for oid in walk {
        let oid = oid?;
        if repo.find_commit(oid)?.parent_count() <= 1 {
            commits.push(oid);
        }
    }
    Ok(commits)
}

/// Replays commits in a single repository. Used directly for sub-repository
/// rebases; the meta driver has its own loop with pin resolution.
pub struct Replayer<'r> {
    repo: &'r Repository,
    state_dir: PathBuf,
}

impl<'r> Replayer<'r> {
    pub fn new(repo: &'r Repository) -> Result<Self> {
        let state_dir = repo::state_dir_of(repo)?;
        Ok(Replayer { repo, state_dir })
    }

    /// Rebase `source` onto `onto`. On a conflict, a REBASE sequencer is
    /// written, conflict markers land in the working directory, and
    /// `Error::Conflict` is returned; `resume`/`abort` pick up from there.
    #[instrument(skip(self), fields(source = %source, onto = %onto))]
    pub fn replay(&self, source: Oid, onto: Oid, refname: Option<String>) -> Result<ReplayResult> {
        if repo::descendant_of(self.repo, source, onto)? {
            return Ok(ReplayResult::UpToDate(source));
        }
        if repo::descendant_of(self.repo, onto, source)? {
            fast_forward_checkout(self.repo, onto)?;
            return Ok(ReplayResult::FastForwarded(onto));
        }
        let base = repo::merge_base(self.repo, source, onto)?.ok_or(Error::NoMergeBase {
            ours: source.to_string(),
            theirs: onto.to_string(),
        })?;
        let commits = linear_range(self.repo, base, source)?;

        checkout_detached(self.repo, onto)?;
        let sequencer = Sequencer {
            kind: SequencerKind::Rebase,
            original_head: PinnedRef {
                oid: source,
                refname,
            },
            target: PinnedRef::detached(onto),
            commits,
            current: 0,
            message: None,
        };
        self.run_steps(onto, sequencer, Vec::new())
    }

    fn run_steps(
        &self,
        mut cursor: Oid,
        mut sequencer: Sequencer,
        mut created: Vec<Oid>,
    ) -> Result<ReplayResult> {
        let commits = sequencer.commits.clone();
        for (idx, oid) in commits.iter().enumerate().skip(sequencer.current) {
            let oid = *oid;
            if repo::descendant_of(self.repo, cursor, oid)? {
                debug!(commit = %oid, "skipping commit already reachable from target");
                continue;
            }
            let commit = self.repo.find_commit(oid)?;
            let parent_tree = match commit.parent_count() {
                0 => None,
                _ => Some(commit.parent(0)?.tree()?),
            };
            let cursor_tree = repo::commit_tree(self.repo, cursor)?;
            let commit_tree = commit.tree()?;
            let merged =
                repo::merge_trees(self.repo, parent_tree.as_ref(), &cursor_tree, &commit_tree)?;

            if merged.has_conflicts() {
                let files = repo::conflicted_paths(&merged);
                repo::install_index(self.repo, &merged, true)?;
                sequencer.current = idx;
                sequencer.save(&self.state_dir)?;
                return Err(Error::Conflict(format!(
                    "could not apply {}: conflicts in {}",
                    repo::short_oid(oid),
                    files.join(", ")
                )));
            }

            let mut merged = merged;
            let tree_id = merged.write_tree_to(self.repo)?;
            if tree_id == cursor_tree.id() {
                debug!(commit = %oid, "skipping empty step");
                continue;
            }
            repo::install_index(self.repo, &merged, false)?;
            let tree = self.repo.find_tree(tree_id)?;
            let new_oid = repo::create_commit(
                self.repo,
                Some("HEAD"),
                &commit.author(),
                &commit.committer(),
                commit.message().unwrap_or_default(),
                &tree,
                &[cursor],
            )?;
            let mut cb = CheckoutBuilder::new();
            cb.force();
            self.repo.checkout_head(Some(&mut cb))?;
            created.push(new_oid);
            cursor = new_oid;
        }

        self.finish(cursor, &sequencer)?;
        Ok(ReplayResult::Completed {
            new_head: cursor,
            created,
        })
    }

    fn finish(&self, new_head: Oid, sequencer: &Sequencer) -> Result<()> {
        if let Some(refname) = &sequencer.original_head.refname {
            self.repo
                .reference(refname, new_head, true, "rebase finished")?;
            self.repo.set_head(refname)?;
            let mut cb = CheckoutBuilder::new();
            cb.force();
            self.repo.checkout_head(Some(&mut cb))?;
        }
        Sequencer::clear(&self.state_dir)?;
        Ok(())
    }

    /// Resume after conflict resolution: commits the staged index as the
    /// stopped step, then replays the remainder.
    pub fn resume(&self) -> Result<ReplayResult> {
        let sequencer = Sequencer::load(&self.state_dir)?
            .ok_or_else(|| Error::usage("no rebase in progress"))?;
        if sequencer.kind != SequencerKind::Rebase {
            return Err(Error::usage(format!(
                "a {} is in progress; run `{} --continue` instead",
                sequencer.kind.command(),
                sequencer.kind.command()
            )));
        }
        let mut index = self.repo.index()?;
        if index.has_conflicts() {
            return Err(Error::Conflict(
                "unresolved conflicts remain; resolve and stage them first".into(),
            ));
        }
        let cursor = self.repo.head()?.peel_to_commit()?.id();
        let stopped_oid = sequencer
            .commits
            .get(sequencer.current)
            .copied()
            .ok_or_else(|| Error::internal("sequencer index out of range"))?;
        let stopped = self.repo.find_commit(stopped_oid)?;
        let tree_id = index.write_tree()?;
        let cursor_tree = repo::commit_tree(self.repo, cursor)?;

        let mut created = Vec::new();
        let mut new_cursor = cursor;
        if tree_id != cursor_tree.id() {
            let tree = self.repo.find_tree(tree_id)?;
            let new_oid = repo::create_commit(
                self.repo,
                Some("HEAD"),
                &stopped.author(),
                &stopped.committer(),
                stopped.message().unwrap_or_default(),
                &tree,
                &[cursor],
            )?;
            let mut cb = CheckoutBuilder::new();
            cb.force();
            self.repo.checkout_head(Some(&mut cb))?;
            created.push(new_oid);
            new_cursor = new_oid;
        }

        let mut sequencer = sequencer;
        sequencer.current += 1;
        if sequencer.current >= sequencer.commits.len() {
            self.finish(new_cursor, &sequencer)?;
            return Ok(ReplayResult::Completed {
                new_head: new_cursor,
                created,
            });
        }
        self.run_steps(new_cursor, sequencer, created)
    }

    /// Throw away all replay progress and restore the original head.
    pub fn abort(&self) -> Result<()> {
        let sequencer = Sequencer::load(&self.state_dir)?
            .ok_or_else(|| Error::usage("no rebase in progress"))?;
        let object = self.repo.find_object(sequencer.original_head.oid, None)?;
        self.repo.reset(&object, git2::ResetType::Hard, None)?;
        if let Some(refname) = &sequencer.original_head.refname {
            self.repo
                .reference(refname, sequencer.original_head.oid, true, "rebase aborted")?;
            self.repo.set_head(refname)?;
            let mut cb = CheckoutBuilder::new();
            cb.force();
            self.repo.checkout_head(Some(&mut cb))?;
        }
        Sequencer::clear(&self.state_dir)?;
        Ok(())
    }
}

// --- meta-level replay ---------------------------------------------------

#[derive(Debug)]
pub struct MetaReplayOutcome {
    pub new_head: Oid,
    pub created: Vec<Oid>,
}

/// Per-commit replay across the meta-repository, resolving sub-repository
/// pin conflicts through classification and sub rebases. Shared by the
/// rebase and cherry-pick drivers.
pub(crate) struct MetaReplay<'m> {
    pub meta: &'m MetaRepo,
    pub pool: Pool,
}

impl<'m> MetaReplay<'m> {
    /// Drive `sequencer.commits[sequencer.current..]` onto the current HEAD.
    /// `attached` commits advance the checked-out branch directly
    /// (cherry-pick); detached replay reattaches in the driver afterwards.
    pub async fn run(
        &self,
        mut sequencer: Sequencer,
        mut created: Vec<Oid>,
    ) -> Result<MetaReplayOutcome> {
        let state_dir = self.meta.state_dir()?;
        let commits = sequencer.commits.clone();
        let mut cursor = self.meta.head_commit()?.id();

        for (idx, oid) in commits.iter().enumerate().skip(sequencer.current) {
            let oid = *oid;
            if repo::descendant_of(self.meta.repo(), cursor, oid)? {
                debug!(commit = %oid, "skipping commit already reachable from target");
                continue;
            }
            let step = self.apply_one(cursor, oid, &mut sequencer, idx, &state_dir).await?;
            if let Some(new_oid) = step {
                created.push(new_oid);
                cursor = new_oid;
            }
        }

        Sequencer::clear(&state_dir)?;
        Ok(MetaReplayOutcome {
            new_head: cursor,
            created,
        })
    }

    /// Apply a single commit on top of `cursor`. Returns the created commit,
    /// or `None` for a skipped empty step. On conflict the sequencer is
    /// saved and `Error::Conflict` propagates.
    async fn apply_one(
        &self,
        cursor: Oid,
        oid: Oid,
        sequencer: &mut Sequencer,
        idx: usize,
        state_dir: &std::path::Path,
    ) -> Result<Option<Oid>> {
        let repo = self.meta.repo();
        let commit = repo.find_commit(oid)?;
        let parent_tree = match commit.parent_count() {
            0 => None,
            _ => Some(commit.parent(0)?.tree()?),
        };
        let cursor_tree = repo::commit_tree(repo, cursor)?;
        let commit_tree = commit.tree()?;
        let mut merged =
            repo::merge_trees(repo, parent_tree.as_ref(), &cursor_tree, &commit_tree)?;

        if merged.has_conflicts() {
            let registry = Registry::from_commit(repo, oid)?;
            let outcome = resolve_pin_conflicts(
                self.meta,
                &registry,
                &mut merged,
                parent_tree.as_ref(),
                &cursor_tree,
                &commit_tree,
                &self.pool,
            )
            .await?;
            if !outcome.conflicted.is_empty() || merged.has_conflicts() {
                let mut files = repo::conflicted_paths(&merged);
                files.extend(outcome.conflicted.iter().cloned());
                files.sort();
                files.dedup();
                repo::install_index(repo, &merged, true)?;
                sequencer.current = idx;
                sequencer.save(state_dir)?;
                return Err(Error::Conflict(format!(
                    "could not apply {}: conflicts in {}",
                    repo::short_oid(oid),
                    files.join(", ")
                )));
            }
        }

        let tree_id = merged.write_tree_to(repo)?;
        if tree_id == cursor_tree.id() {
            debug!(commit = %oid, "skipping empty step");
            return Ok(None);
        }

        // move opened subs whose pins change in this step before the meta
        // commit lands
        let new_tree = repo.find_tree(tree_id)?;
        self.update_open_subs(&cursor_tree, &new_tree, state_dir)?;

        repo::install_index(repo, &merged, false)?;
        let new_oid = repo::create_commit(
            repo,
            Some("HEAD"),
            &commit.author(),
            &commit.committer(),
            commit.message().unwrap_or_default(),
            &new_tree,
            &[cursor],
        )?;
        let mut cb = CheckoutBuilder::new();
        cb.force();
        repo.checkout_head(Some(&mut cb))?;
        Ok(Some(new_oid))
    }

    fn update_open_subs(
        &self,
        old_tree: &git2::Tree<'_>,
        new_tree: &git2::Tree<'_>,
        state_dir: &std::path::Path,
    ) -> Result<()> {
        let registry = Registry::from_tree(self.meta.repo(), new_tree)?;
        for entry in registry.entries() {
            if !self.meta.sub_is_open(&entry.path) {
                continue;
            }
            let old_pin = repo::gitlink_at(old_tree, &entry.path);
            let new_pin = repo::gitlink_at(new_tree, &entry.path);
            let (Some(new_pin), changed) = (new_pin, old_pin != new_pin) else {
                continue;
            };
            if !changed {
                continue;
            }
            let sub = self.meta.open_sub(&entry.path)?;
            record_sub_head(&sub, &entry.path, state_dir)?;
            if sub.head().ok().and_then(|h| h.target()) == Some(new_pin) {
                continue; // a sub rebase already moved it
            }
            move_head_to(&sub, new_pin)?;
        }
        Ok(())
    }
}

/// Move a repository's HEAD (branch tip or detached) to `oid`, updating the
/// working directory safely.
pub fn move_head_to(repo: &Repository, oid: Oid) -> Result<()> {
    let object = repo.find_object(oid, None)?;
    let mut cb = CheckoutBuilder::new();
    cb.safe();
    repo.checkout_tree(&object, Some(&mut cb))
        .map_err(|err| map_checkout_dirty(repo, err))?;
    match repo.head() {
        Ok(head) if head.is_branch() => {
            let name = head
                .name()
                .ok_or_else(|| Error::internal("branch ref has non-utf8 name"))?
                .to_string();
            repo.reference(&name, oid, true, "seam update")?;
        }
        _ => repo.set_head_detached(oid)?,
    }
    Ok(())
}

pub(crate) fn record_sub_head(
    sub: &Repository,
    path: &str,
    state_dir: &std::path::Path,
) -> Result<()> {
    let mut heads = SubHeads::load(state_dir)?;
    if heads.entries.iter().any(|e| e.path == path) {
        return Ok(());
    }
    if let Ok(head) = sub.head()
        && let Some(oid) = head.target()
    {
        let refname = if head.is_branch() {
            head.name().map(str::to_string)
        } else {
            None
        };
        heads.record(path, oid, refname);
        heads.save(state_dir)?;
    }
    Ok(())
}

pub(crate) struct PinConflictOutcome {
    /// Sub paths whose own rebase/merge stopped on conflicts.
    pub conflicted: Vec<String>,
}

/// Resolve gitlink conflict entries in `merged` in place: trivial pin moves
/// are written back as stage-0 entries, diverged pins replay in their sub
/// repositories through the pool, and irreconcilable shapes stay conflicted.
pub(crate) async fn resolve_pin_conflicts(
    meta: &MetaRepo,
    registry: &Registry,
    merged: &mut git2::Index,
    base_tree: Option<&git2::Tree<'_>>,
    ours_tree: &git2::Tree<'_>,
    theirs_tree: &git2::Tree<'_>,
    pool: &Pool,
) -> Result<PinConflictOutcome> {
    let conflict_paths = repo::conflicted_paths(merged);
    let state_dir = meta.state_dir()?;
    let fetcher = Fetcher::new(meta);

    struct SubTask {
        path: String,
        ours: Oid,
        theirs: Oid,
    }

    let mut tasks: Vec<SubTask> = Vec::new();
    let mut conflicted: Vec<String> = Vec::new();

    for path in &conflict_paths {
        let base = base_tree.and_then(|t| repo::gitlink_at(t, path));
        let ours = repo::gitlink_at(ours_tree, path);
        let theirs = repo::gitlink_at(theirs_tree, path);
        let is_sub = registry.by_path(path).is_some()
            || base.is_some()
            || ours.is_some()
            || theirs.is_some();
        if !is_sub {
            continue; // textual conflict, stays in the index
        }
        let sub_repo = meta.open_sub(path).ok();
        match pins::classify(sub_repo.as_ref(), path, base, ours, theirs)? {
            PinResolution::Take(pin) => {
                set_gitlink_entry(merged, path, pin)?;
            }
            PinResolution::Conflict(_) => {
                conflicted.push(path.clone());
            }
            PinResolution::NeedsMerge { ours, theirs, .. } => {
                if !meta.sub_is_open(path) {
                    return Err(Error::SubUnresolved(path.clone()));
                }
                tasks.push(SubTask {
                    path: path.clone(),
                    ours,
                    theirs,
                });
            }
        }
    }

    // fetch whatever the sub replays will need before fanning out
    for task in &tasks {
        let sub = meta.open_sub(&task.path)?;
        record_sub_head(&sub, &task.path, &state_dir)?;
        fetcher.ensure_commit(registry, &task.path, &sub, task.ours)?;
        fetcher.ensure_commit(registry, &task.path, &sub, task.theirs)?;
    }

    enum SubReplayed {
        Done { path: String, new_pin: Oid },
        Stopped { path: String },
    }

    let roots: Vec<(PathBuf, SubTask)> = tasks
        .into_iter()
        .map(|t| (meta.sub_workdir(&t.path), t))
        .collect();
    let labels: Vec<String> = roots.iter().map(|(_, t)| t.path.clone()).collect();
    let outcomes = pool
        .run_labeled(roots, Some(labels), |_, (workdir, task)| {
            let sub = Repository::open(&workdir)?;
            let replayer = Replayer::new(&sub)?;
            let refname = sub
                .head()
                .ok()
                .filter(git2::Reference::is_branch)
                .and_then(|h| h.name().map(str::to_string));
            match replayer.replay(task.theirs, task.ours, refname) {
                Ok(result) => {
                    let new_pin = match result {
                        ReplayResult::UpToDate(oid)
                        | ReplayResult::FastForwarded(oid)
                        | ReplayResult::Completed { new_head: oid, .. } => oid,
                    };
                    Ok(SubReplayed::Done {
                        path: task.path,
                        new_pin,
                    })
                }
                Err(Error::Conflict(_)) => Ok(SubReplayed::Stopped { path: task.path }),
                Err(err) => Err(err),
            }
        })
        .await?;

    for outcome in outcomes {
        match outcome {
            SubReplayed::Done { path, new_pin } => {
                set_gitlink_entry(merged, &path, Some(new_pin))?;
            }
            SubReplayed::Stopped { path } => conflicted.push(path),
        }
    }
    conflicted.sort();
    Ok(PinConflictOutcome { conflicted })
}

/// Replace any conflict stages for `path` with a single stage-0 gitlink
/// entry (or remove the path entirely).
pub(crate) fn set_gitlink_entry(index: &mut git2::Index, path: &str, pin: Option<Oid>) -> Result<()> {
    let p = std::path::Path::new(path);
    for stage in 1..=3 {
        match index.remove(p, stage) {
            Ok(()) => {}
            Err(err) if err.code() == ErrorCode::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    match index.remove(p, 0) {
        Ok(()) => {}
        Err(err) if err.code() == ErrorCode::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    if let Some(pin) = pin {
        let entry = git2::IndexEntry {
            ctime: git2::IndexTime::new(0, 0),
            mtime: git2::IndexTime::new(0, 0),
            dev: 0,
            ino: 0,
            mode: 0o160000,
            uid: 0,
            gid: 0,
            file_size: 0,
            id: pin,
            flags: 0,
            flags_extended: 0,
            path: path.as_bytes().to_vec(),
        };
        index.add(&entry)?;
    }
    Ok(())
}

// --- meta rebase driver --------------------------------------------------

#[derive(Debug)]
pub enum RebaseOutcome {
    UpToDate,
    FastForwarded(Oid),
    Completed { new_head: Oid, created: Vec<Oid> },
}

/// Rebase the current meta branch onto `upstream`, replaying sub pins as it
/// goes. Conflicts leave a REBASE sequencer behind.
pub async fn rebase(meta: &MetaRepo, upstream: &str, pool: Pool) -> Result<RebaseOutcome> {
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
    let onto = repo::require_commitish(repo, upstream)?;
    let head = meta.head_commit()?.id();
    let refname = meta.head_refname();

    if repo::descendant_of(repo, head, onto)? {
        return Ok(RebaseOutcome::UpToDate);
    }
    if repo::descendant_of(repo, onto, head)? {
        fast_forward_open_subs(meta, head, onto, &state_dir)?;
        fast_forward_checkout(repo, onto)?;
        SubHeads::clear(&state_dir)?;
        return Ok(RebaseOutcome::FastForwarded(onto));
    }

    let base = repo::merge_base(repo, head, onto)?.ok_or(Error::NoMergeBase {
        ours: head.to_string(),
        theirs: onto.to_string(),
    })?;
    let commits = linear_range(repo, base, head)?;

    // park HEAD (and opened subs) on the new base before replaying
    fast_forward_open_subs(meta, head, onto, &state_dir)?;
    checkout_detached(repo, onto)?;

    let sequencer = Sequencer {
        kind: SequencerKind::Rebase,
        original_head: PinnedRef { oid: head, refname },
        target: PinnedRef::detached(onto),
        commits,
        current: 0,
        message: None,
    };

    let replay = MetaReplay { meta, pool };
    let outcome = run_and_reattach(meta, &replay, sequencer, Vec::new()).await?;
    Ok(RebaseOutcome::Completed {
        new_head: outcome.new_head,
        created: outcome.created,
    })
}

/// Move every opened sub whose pin differs between two meta commits,
/// recording original heads for abort.
pub(crate) fn fast_forward_open_subs(
    meta: &MetaRepo,
    from: Oid,
    to: Oid,
    state_dir: &std::path::Path,
) -> Result<()> {
    let from_tree = repo::commit_tree(meta.repo(), from)?;
    let to_tree = repo::commit_tree(meta.repo(), to)?;
    let registry = Registry::from_tree(meta.repo(), &to_tree)?;
    let fetcher = Fetcher::new(meta);
    for entry in registry.entries() {
        if !meta.sub_is_open(&entry.path) {
            continue;
        }
        let old_pin = repo::gitlink_at(&from_tree, &entry.path);
        let new_pin = repo::gitlink_at(&to_tree, &entry.path);
        if old_pin == new_pin {
            continue;
        }
        let Some(new_pin) = new_pin else { continue };
        let sub = meta.open_sub(&entry.path)?;
        record_sub_head(&sub, &entry.path, state_dir)?;
        fetcher.ensure_commit(&registry, &entry.path, &sub, new_pin)?;
        move_head_to(&sub, new_pin)?;
    }
    Ok(())
}

async fn run_and_reattach(
    meta: &MetaRepo,
    replay: &MetaReplay<'_>,
    sequencer: Sequencer,
    created: Vec<Oid>,
) -> Result<MetaReplayOutcome> {
    let refname = sequencer.original_head.refname.clone();
    let outcome = replay.run(sequencer, created).await?;
    if let Some(refname) = refname {
        let repo = meta.repo();
        repo.reference(&refname, outcome.new_head, true, "rebase finished")?;
        repo.set_head(&refname)?;
        let mut cb = CheckoutBuilder::new();
        cb.force();
        repo.checkout_head(Some(&mut cb))?;
    }
    SubHeads::clear(&meta.state_dir()?)?;
    Ok(outcome)
}

/// Resume a conflicted meta rebase: sub sequencers first, then the stopped
/// meta step, then the rest of the range.
pub async fn rebase_continue(meta: &MetaRepo, pool: Pool) -> Result<RebaseOutcome> {
    let state_dir = meta.state_dir()?;
    let sequencer = Sequencer::load(&state_dir)?
        .ok_or_else(|| Error::usage("no rebase in progress"))?;
    if sequencer.kind != SequencerKind::Rebase {
        return Err(Error::usage(format!(
            "a {} is in progress, not a rebase",
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

    let replay = MetaReplay { meta, pool };
    let mut created = Vec::new();
    if tree_id != cursor_tree.id() {
        let tree = repo.find_tree(tree_id)?;
        replay.update_open_subs(&cursor_tree, &tree, &state_dir)?;
        let new_oid = repo::create_commit(
            repo,
            Some("HEAD"),
            &stopped.author(),
            &stopped.committer(),
            stopped.message().unwrap_or_default(),
            &tree,
            &[cursor],
        )?;
        let mut cb = CheckoutBuilder::new();
        cb.force();
        repo.checkout_head(Some(&mut cb))?;
        created.push(new_oid);
    }

    let mut sequencer = sequencer;
    sequencer.current += 1;
    let outcome = run_and_reattach(meta, &replay, sequencer, created).await?;
    Ok(RebaseOutcome::Completed {
        new_head: outcome.new_head,
        created: outcome.created,
    })
}

/// Resume every opened sub's sequencer of `kind`; trivial completions fix
/// the meta index pins in place.
pub(crate) fn resume_open_sub_sequencers(meta: &MetaRepo, kind: SequencerKind) -> Result<()> {
    let head = meta.head_commit()?.id();
    let registry = Registry::from_commit(meta.repo(), head)?;
    let mut index = meta.repo().index()?;
    let mut dirty = false;
    for entry in registry.entries() {
        if !meta.sub_is_open(&entry.path) {
            continue;
        }
        let sub = meta.open_sub(&entry.path)?;
        let sub_state = repo::state_dir_of(&sub)?;
        let Some(sub_seq) = Sequencer::load(&sub_state)? else {
            continue;
        };
        if sub_seq.kind != kind {
            continue;
        }
        match kind {
            SequencerKind::Rebase => {
                let replayer = Replayer::new(&sub)?;
                match replayer.resume() {
                    Ok(result) => {
                        let new_pin = match result {
                            ReplayResult::UpToDate(oid)
                            | ReplayResult::FastForwarded(oid)
                            | ReplayResult::Completed { new_head: oid, .. } => oid,
                        };
                        set_gitlink_entry(&mut index, &entry.path, Some(new_pin))?;
                        dirty = true;
                    }
                    Err(Error::Conflict(_)) => {}
                    Err(err) => return Err(err),
                }
            }
            _ => {}
        }
    }
    if dirty {
        index.write()?;
    }
    Ok(())
}

/// Abort: restore every touched sub and the original meta head.
pub fn rebase_abort(meta: &MetaRepo) -> Result<()> {
    let state_dir = meta.state_dir()?;
    let sequencer = Sequencer::load(&state_dir)?
        .ok_or_else(|| Error::usage("no rebase in progress"))?;
    if sequencer.kind != SequencerKind::Rebase {
        return Err(Error::usage(format!(
            "a {} is in progress, not a rebase",
            sequencer.kind.command()
        )));
    }
    restore_sub_heads(meta, &state_dir)?;

    let repo = meta.repo();
    let object = repo.find_object(sequencer.original_head.oid, None)?;
    repo.reset(&object, git2::ResetType::Hard, None)?;
    if let Some(refname) = &sequencer.original_head.refname {
        repo.set_head(refname)?;
        let mut cb = CheckoutBuilder::new();
        cb.force();
        repo.checkout_head(Some(&mut cb))?;
    }
    Sequencer::clear(&state_dir)?;
    SubHeads::clear(&state_dir)?;
    Ok(())
}

pub(crate) fn restore_sub_heads(meta: &MetaRepo, state_dir: &std::path::Path) -> Result<()> {
    let heads = SubHeads::load(state_dir)?;
    for entry in &heads.entries {
        if !meta.sub_is_open(&entry.path) {
            continue;
        }
        let sub = meta.open_sub(&entry.path)?;
        Sequencer::clear(&repo::state_dir_of(&sub)?)?;
        let object = sub.find_object(entry.oid, None)?;
        sub.reset(&object, git2::ResetType::Hard, None)?;
        if let Some(refname) = &entry.refname {
            sub.reference(refname, entry.oid, true, "seam abort")?;
            sub.set_head(refname)?;
            let mut cb = CheckoutBuilder::new();
            cb.force();
            sub.checkout_head(Some(&mut cb))?;
        }
        sub.cleanup_state().ok();
    }
    Ok(())
}
