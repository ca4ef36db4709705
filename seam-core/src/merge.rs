//! Three-way merge across the meta-repository and its sub-repositories.
//! Classifies every sub difference, drives per-sub merges in parallel,
//! assembles the final meta tree, and leaves a resumable sequencer behind
//! whenever anything conflicts.

use git2::build::CheckoutBuilder;
use git2::{Oid, Repository};
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::fetcher::Fetcher;
use crate::pins::{self, PinResolution};
use crate::pool::Pool;
use crate::rebase::{
    fast_forward_checkout, fast_forward_open_subs, move_head_to, record_sub_head,
    restore_sub_heads, set_gitlink_entry,
};
use crate::registry::{Registry, SubEntry, REGISTRY_FILE};
use crate::repo::{self, MetaRepo};
use crate::sequencer::{PinnedRef, Sequencer, SequencerKind, SubHeads};
use crate::status::{self, StatusQuery};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Fast-forward when possible, merge commit otherwise.
    Normal,
    /// Fail unless the merge is a fast-forward.
    FfOnly,
    /// Always create a merge commit.
    ForceCommit,
}

/// Whether the engine may instantiate sub-repositories it needs to touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenPolicy {
    /// Open (clone + checkout) any sub that needs merging.
    AllowOpen,
    /// Merge closed subs inside a bare object cache; conflicts that would
    /// need a working directory fail with `SUB_UNRESOLVED`.
    AllowBare,
    /// Never touch closed subs; any needed sub merge fails.
    Forbid,
}

pub struct MergeRequest {
    pub target: String,
    pub mode: MergeMode,
    pub message: Option<String>,
    pub open_policy: OpenPolicy,
}

impl MergeRequest {
    pub fn new(target: impl Into<String>) -> Self {
        MergeRequest {
            target: target.into(),
            mode: MergeMode::Normal,
            message: None,
            open_policy: OpenPolicy::AllowOpen,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// HEAD already contains the target.
    UpToDate,
    FastForwarded(Oid),
    Committed(Oid),
}

/// Pick the merged URL for one sub. Both-sides-changed resolves to ours.
fn merge_url(path: &str, base: Option<&str>, ours: Option<&str>, theirs: Option<&str>) -> String {
    match (ours, theirs) {
        (Some(o), Some(t)) if o == t => o.to_string(),
        (Some(o), Some(t)) => {
            if base == Some(o) {
                t.to_string()
            } else if base == Some(t) {
                o.to_string()
            } else {
                warn!(sub = path, ours = o, theirs = t, "both sides changed sub URL; keeping ours");
                o.to_string()
            }
        }
        (Some(o), None) => o.to_string(),
        (None, Some(t)) => t.to_string(),
        (None, None) => String::new(),
    }
}

struct SubMergeTask {
    path: String,
    name: String,
    base: Option<Oid>,
    ours: Oid,
    theirs: Oid,
    bare: bool,
}

enum SubMergeOutcome {
    Merged { path: String, new_pin: Oid },
    Conflicted { path: String, files: Vec<String> },
}

#[instrument(skip(meta, request, pool), fields(target = %request.target))]
pub async fn merge(meta: &MetaRepo, request: &MergeRequest, pool: &Pool) -> Result<MergeOutcome> {
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
    let target = repo::require_commitish(repo, &request.target)?;
    let target_refname = repo
        .find_reference(&format!("refs/heads/{}", request.target))
        .ok()
        .and_then(|r| r.name().map(str::to_string));
    let head = meta.head_commit()?.id();
    let head_refname = meta.head_refname();

    if repo::descendant_of(repo, head, target)? {
        info!(%head, %target, "already up to date");
        return Ok(MergeOutcome::UpToDate);
    }

    if repo::descendant_of(repo, target, head)? && request.mode != MergeMode::ForceCommit {
        fast_forward_open_subs(meta, head, target, &state_dir)?;
        fast_forward_checkout(repo, target)?;
        SubHeads::clear(&state_dir)?;
        info!(%target, "fast-forwarded");
        return Ok(MergeOutcome::FastForwarded(target));
    }
    if request.mode == MergeMode::FfOnly {
        return Err(Error::usage(format!(
            "cannot fast-forward to {}; rerun without --ff-only",
            request.target
        )));
    }

    let message = request
        .message
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::usage("aborting merge due to empty commit message"))?;

    let base = repo::merge_base(repo, head, target)?.ok_or(Error::NoMergeBase {
        ours: head.to_string(),
        theirs: target.to_string(),
    })?;

    debug!(%base, "computed meta merge base");
    let base_tree = repo::commit_tree(repo, base)?;
    let head_tree = repo::commit_tree(repo, head)?;
    let target_tree = repo::commit_tree(repo, target)?;
    let mut merged = repo::merge_trees(repo, Some(&base_tree), &head_tree, &target_tree)?;

    let head_registry = Registry::from_tree(repo, &head_tree)?;
    let target_registry = Registry::from_tree(repo, &target_tree)?;
    let base_registry = Registry::from_tree(repo, &base_tree)?;

    // The index merge takes "only theirs moved" pins wholesale, including
    // rewinds. When our pin already contains theirs, keep ours.
    for entry in head_registry.entries() {
        let path = entry.path.as_str();
        let base_pin = repo::gitlink_at(&base_tree, path);
        let ours_pin = repo::gitlink_at(&head_tree, path);
        let theirs_pin = repo::gitlink_at(&target_tree, path);
        if base_pin == ours_pin
            && ours_pin != theirs_pin
            && let (Some(ours_pin), Some(theirs_pin)) = (ours_pin, theirs_pin)
            && let Some(sub) = sub_repo_for_ancestry(meta, path)
            && sub.find_commit(ours_pin).is_ok()
            && sub.find_commit(theirs_pin).is_ok()
            && repo::descendant_of(&sub, ours_pin, theirs_pin)?
        {
            debug!(sub = path, "keeping our pin; theirs is behind");
            set_gitlink_entry(&mut merged, path, Some(ours_pin))?;
        }
    }

    let sequencer = Sequencer {
        kind: SequencerKind::Merge,
        original_head: PinnedRef {
            oid: head,
            refname: head_refname,
        },
        target: PinnedRef {
            oid: target,
            refname: target_refname,
        },
        commits: vec![target],
        current: 0,
        message: Some(message.clone()),
    };

    // Classify every conflicted entry: textual conflicts stop the walk
    // before any sub is touched.
    let conflict_paths = repo::conflicted_paths(&merged);
    let mut textual = Vec::new();
    let mut sub_conflicted = Vec::new();
    let mut tasks = Vec::new();

    for path in &conflict_paths {
        let base_pin = repo::gitlink_at(&base_tree, path);
        let ours_pin = repo::gitlink_at(&head_tree, path);
        let theirs_pin = repo::gitlink_at(&target_tree, path);
        let is_sub = head_registry.by_path(path).is_some()
            || target_registry.by_path(path).is_some()
            || base_pin.is_some()
            || ours_pin.is_some()
            || theirs_pin.is_some();
        if !is_sub {
            if path != REGISTRY_FILE {
                textual.push(path.clone());
            }
            continue;
        }
        let sub_repo = sub_repo_for_ancestry(meta, path);
        match pins::classify(sub_repo.as_ref(), path, base_pin, ours_pin, theirs_pin)? {
            PinResolution::Take(pin) => {
                debug!(sub = %path, ?pin, "pin resolved trivially");
                set_gitlink_entry(&mut merged, path, pin)?;
            }
            PinResolution::Conflict(msg) => {
                warn!(sub = %path, "{msg}");
                sub_conflicted.push(path.clone());
            }
            PinResolution::NeedsMerge { base, ours, theirs } => {
                let name = head_registry
                    .by_path(path)
                    .or_else(|| target_registry.by_path(path))
                    .map(|e| e.name.clone())
                    .unwrap_or_else(|| path.clone());
                tasks.push(SubMergeTask {
                    path: path.clone(),
                    name,
                    base,
                    ours,
                    theirs,
                    bare: false,
                });
            }
        }
    }

    if !textual.is_empty() {
        repo::install_index(repo, &merged, true)?;
        sequencer.save(&state_dir)?;
        return Err(Error::Conflict(format!(
            "merge conflicts in {}",
            textual.join(", ")
        )));
    }

    // Open (or cache) every sub that needs its own merge, per policy.
    let fetcher = Fetcher::new(meta);
    let effective_registry = if target_registry.is_empty() {
        &head_registry
    } else {
        &target_registry
    };
    for task in &mut tasks {
        if meta.sub_is_open(&task.path) {
            let sub = meta.open_sub(&task.path)?;
            let sub_head = sub.head().ok().and_then(|h| h.target());
            if sub_head != Some(task.ours) {
                return Err(Error::dirty(format!(
                    "sub-repository `{}` is not checked out at its recorded pin",
                    task.path
                )));
            }
            record_sub_head(&sub, &task.path, &state_dir)?;
            fetcher.ensure_commit(effective_registry, &task.path, &sub, task.theirs)?;
            if let Some(base) = task.base {
                fetcher.ensure_commit(effective_registry, &task.path, &sub, base).ok();
            }
        } else {
            match request.open_policy {
                OpenPolicy::Forbid => return Err(Error::SubUnresolved(task.path.clone())),
                OpenPolicy::AllowOpen => {
                    crate::workdir::open_sub(meta, &task.path, Some(task.ours))?;
                    let sub = meta.open_sub(&task.path)?;
                    record_sub_head(&sub, &task.path, &state_dir)?;
                    fetcher.ensure_commit(effective_registry, &task.path, &sub, task.theirs)?;
                }
                OpenPolicy::AllowBare => {
                    let cache = bare_cache(meta, &task.name)?;
                    fetcher.ensure_commit(effective_registry, &task.path, &cache, task.ours)?;
                    fetcher.ensure_commit(effective_registry, &task.path, &cache, task.theirs)?;
                    task.bare = true;
                }
            }
        }
    }

    // Fan the sub merges out; conflicts are results, not pool failures, so
    // sibling merges land even when one sub stops.
    let message_for_subs = message.clone();
    let roots: Vec<(std::path::PathBuf, SubMergeTask)> = tasks
        .into_iter()
        .map(|t| {
            let root = if t.bare {
                meta.sub_cache_path(&t.name).unwrap_or_default()
            } else {
                meta.sub_workdir(&t.path)
            };
            (root, t)
        })
        .collect();
    let labels: Vec<String> = roots.iter().map(|(_, t)| format!("sub {}", t.path)).collect();
    let outcomes = pool
        .run_labeled(roots, Some(labels), move |_, (root, task)| {
            merge_one_sub(&root, &task, &message_for_subs)
        })
        .await?;

    for outcome in outcomes {
        match outcome {
            SubMergeOutcome::Merged { path, new_pin } => {
                debug!(sub = %path, %new_pin, "sub merge committed");
                set_gitlink_entry(&mut merged, &path, Some(new_pin))?;
            }
            SubMergeOutcome::Conflicted { path, files } => {
                warn!(sub = %path, files = %files.join(", "), "sub merge conflicted");
                sub_conflicted.push(path);
            }
        }
    }

    if !sub_conflicted.is_empty() {
        sub_conflicted.sort();
        repo::install_index(repo, &merged, true)?;
        sequencer.save(&state_dir)?;
        return Err(Error::Conflict(format!(
            "sub-repository conflicts in {}; resolve them and run `merge --continue`",
            sub_conflicted.join(", ")
        )));
    }

    // Assemble the final tree: registry rewrite for URL changes, then the
    // merge commit with parents [head, target] in that order.
    rewrite_registry_if_needed(
        repo,
        &mut merged,
        &base_registry,
        &head_registry,
        &target_registry,
    )?;

    let tree_id = merged.write_tree_to(repo)?;
    let new_tree = repo.find_tree(tree_id)?;
    sync_open_subs_to_tree(meta, &head_tree, &new_tree, &state_dir)?;

    repo::install_index(repo, &merged, false)?;
    let sig = repo::signature(repo)?;
    let commit =
        repo::create_commit(repo, Some("HEAD"), &sig, &sig, &message, &new_tree, &[head, target])?;
    let mut cb = CheckoutBuilder::new();
    cb.force();
    repo.checkout_head(Some(&mut cb))?;
    SubHeads::clear(&state_dir)?;
    info!(%commit, "merge committed");
    Ok(MergeOutcome::Committed(commit))
}

/// Open sub when available so ancestry can shortcut classification; falls
/// back to the bare cache if one exists.
fn sub_repo_for_ancestry(meta: &MetaRepo, path: &str) -> Option<Repository> {
    if meta.sub_is_open(path) {
        return meta.open_sub(path).ok();
    }
    None
}

fn bare_cache(meta: &MetaRepo, name: &str) -> Result<Repository> {
    let path = meta.sub_cache_path(name)?;
    if path.exists() {
        return Repository::open_bare(&path).map_err(Error::from);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Repository::init_bare(&path).map_err(Error::from)
}

/// One sub-repository merge, run inside the pool. `root` is either the open
/// sub workdir or its bare cache.
fn merge_one_sub(
    root: &std::path::Path,
    task: &SubMergeTask,
    message: &str,
) -> Result<SubMergeOutcome> {
    let sub = Repository::open(root)?;
    let base = match repo::merge_base(&sub, task.ours, task.theirs)? {
        Some(oid) => Some(oid),
        None => task.base.filter(|oid| sub.find_commit(*oid).is_ok()),
    };
    let Some(base) = base else {
        return Err(Error::NoMergeBase {
            ours: task.ours.to_string(),
            theirs: task.theirs.to_string(),
        });
    };

    let base_tree = repo::commit_tree(&sub, base)?;
    let ours_tree = repo::commit_tree(&sub, task.ours)?;
    let theirs_tree = repo::commit_tree(&sub, task.theirs)?;
    let mut merged = repo::merge_trees(&sub, Some(&base_tree), &ours_tree, &theirs_tree)?;

    if merged.has_conflicts() {
        if task.bare {
            // no working directory to resolve in
            return Err(Error::SubUnresolved(task.path.clone()));
        }
        let files = repo::conflicted_paths(&merged);
        repo::install_index(&sub, &merged, true)?;
        let refname = sub
            .head()
            .ok()
            .filter(git2::Reference::is_branch)
            .and_then(|h| h.name().map(str::to_string));
        let sub_seq = Sequencer {
            kind: SequencerKind::Merge,
            original_head: PinnedRef {
                oid: task.ours,
                refname,
            },
            target: PinnedRef::detached(task.theirs),
            commits: vec![task.theirs],
            current: 0,
            message: Some(message.to_string()),
        };
        sub_seq.save(&repo::state_dir_of(&sub)?)?;
        return Ok(SubMergeOutcome::Conflicted {
            path: task.path.clone(),
            files,
        });
    }

    let tree_id = merged.write_tree_to(&sub)?;
    let tree = sub.find_tree(tree_id)?;
    let sig = repo::signature(&sub)?;
    // parents in [ours, theirs] order
    let new_pin = repo::create_commit(
        &sub,
        None,
        &sig,
        &sig,
        message,
        &tree,
        &[task.ours, task.theirs],
    )?;
    if !task.bare {
        // safe checkout first, from the still-clean ours state, then the
        // ref move; index and workdir both land on the merged tree
        move_head_to(&sub, new_pin)?;
    }
    Ok(SubMergeOutcome::Merged {
        path: task.path.clone(),
        new_pin,
    })
}

fn sync_open_subs_to_tree(
    meta: &MetaRepo,
    old_tree: &git2::Tree<'_>,
    new_tree: &git2::Tree<'_>,
    state_dir: &std::path::Path,
) -> Result<()> {
    let registry = Registry::from_tree(meta.repo(), new_tree)?;
    let fetcher = Fetcher::new(meta);
    for entry in registry.entries() {
        if !meta.sub_is_open(&entry.path) {
            continue;
        }
        let old_pin = repo::gitlink_at(old_tree, &entry.path);
        let new_pin = repo::gitlink_at(new_tree, &entry.path);
        if old_pin == new_pin {
            continue;
        }
        let Some(new_pin) = new_pin else { continue };
        let sub = meta.open_sub(&entry.path)?;
        if sub.head().ok().and_then(|h| h.target()) == Some(new_pin) {
            continue; // already advanced by its own merge
        }
        record_sub_head(&sub, &entry.path, state_dir)?;
        fetcher.ensure_commit(&registry, &entry.path, &sub, new_pin)?;
        move_head_to(&sub, new_pin)?;
    }
    Ok(())
}

/// Rewrite the registry file entry in `merged` when sub URLs changed on
/// either side, preserving unknown sections from our side of the file.
fn rewrite_registry_if_needed(
    repo: &Repository,
    merged: &mut git2::Index,
    base_registry: &Registry,
    head_registry: &Registry,
    target_registry: &Registry,
) -> Result<()> {
    let registry_conflicted = repo::conflicted_paths(merged)
        .iter()
        .any(|p| p == REGISTRY_FILE);

    let mut names: Vec<String> = head_registry
        .entries()
        .iter()
        .chain(target_registry.entries())
        .map(|e| e.name.clone())
        .collect();
    names.sort();
    names.dedup();

    let mut updates: Vec<SubEntry> = Vec::new();
    let mut removals: Vec<String> = Vec::new();
    let mut changed = false;
    for name in names {
        let base = base_registry.by_name(&name);
        let ours = head_registry.by_name(&name);
        let theirs = target_registry.by_name(&name);
        // membership resolves three-way: removal on one side wins unless the
        // other side changed the entry
        let survives = match (ours, theirs) {
            (Some(_), Some(_)) => true,
            (None, None) => false,
            (Some(o), None) => base.is_none() || base.map(|b| (&b.url, &b.path)) != Some((&o.url, &o.path)),
            (None, Some(t)) => base.is_none() || base.map(|b| (&b.url, &b.path)) != Some((&t.url, &t.path)),
        };
        if !survives {
            if base.is_some() {
                removals.push(name.clone());
                changed = true;
            }
            continue;
        }
        let path = ours
            .or(theirs)
            .map(|e| e.path.clone())
            .unwrap_or_else(|| name.clone());
        let url = merge_url(
            &path,
            base.map(|e| e.url.as_str()),
            ours.map(|e| e.url.as_str()),
            theirs.map(|e| e.url.as_str()),
        );
        if ours.map(|e| e.url.as_str()) != Some(url.as_str()) || ours.is_none() {
            changed = true;
        }
        updates.push(SubEntry {
            name,
            path,
            url,
            pin: None,
        });
    }
    if !changed && !registry_conflicted {
        return Ok(());
    }
    let text = head_registry.render_with(&updates, &removals);
    let blob = repo.blob(text.as_bytes())?;
    let entry = git2::IndexEntry {
        ctime: git2::IndexTime::new(0, 0),
        mtime: git2::IndexTime::new(0, 0),
        dev: 0,
        ino: 0,
        mode: 0o100644,
        uid: 0,
        gid: 0,
        file_size: text.len() as u32,
        id: blob,
        flags: 0,
        flags_extended: 0,
        path: REGISTRY_FILE.as_bytes().to_vec(),
    };
    for stage in 1..=3 {
        match merged.remove(std::path::Path::new(REGISTRY_FILE), stage) {
            Ok(()) => {}
            Err(err) if err.code() == git2::ErrorCode::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    merged.add(&entry)?;
    Ok(())
}

/// Finish an interrupted merge: sub sequencers first, then the meta commit.
pub async fn merge_continue(meta: &MetaRepo) -> Result<MergeOutcome> {
    let state_dir = meta.state_dir()?;
    let sequencer = Sequencer::load(&state_dir)?
        .ok_or_else(|| Error::usage("no merge in progress"))?;
    if sequencer.kind != SequencerKind::Merge {
        return Err(Error::usage(format!(
            "a {} is in progress, not a merge",
            sequencer.kind.command()
        )));
    }

    let repo = meta.repo();
    let head_tree = meta.head_commit()?.tree()?;
    let registry = Registry::from_tree(repo, &head_tree)?;
    let target_tree = repo::commit_tree(repo, sequencer.target.oid)?;
    let target_registry = Registry::from_tree(repo, &target_tree)?;

    let mut blocked = Vec::new();
    let mut index = repo.index()?;
    let mut paths: Vec<String> = registry
        .entries()
        .iter()
        .chain(target_registry.entries())
        .map(|e| e.path.clone())
        .collect();
    paths.sort();
    paths.dedup();
    for path in paths {
        if !meta.sub_is_open(&path) {
            continue;
        }
        let sub = meta.open_sub(&path)?;
        let sub_state = repo::state_dir_of(&sub)?;
        let Some(sub_seq) = Sequencer::load(&sub_state)? else {
            continue;
        };
        if sub_seq.kind != SequencerKind::Merge {
            continue;
        }
        match finalize_sub_merge(&sub, &sub_seq)? {
            Some(new_pin) => {
                set_gitlink_entry(&mut index, &path, Some(new_pin))?;
                Sequencer::clear(&sub_state)?;
            }
            None => blocked.push(path),
        }
    }
    index.write()?;

    if !blocked.is_empty() {
        blocked.sort();
        return Err(Error::Conflict(format!(
            "sub-repository conflicts remain in {}",
            blocked.join(", ")
        )));
    }
    let mut index = repo.index()?;
    if index.has_conflicts() {
        let files = repo::conflicted_paths(&index);
        return Err(Error::Conflict(format!(
            "unresolved conflicts remain in {}",
            files.join(", ")
        )));
    }

    let message = sequencer
        .message
        .clone()
        .ok_or_else(|| Error::usage("merge sequencer has no message; rerun with --message"))?;
    let tree_id = index.write_tree()?;
    let new_tree = repo.find_tree(tree_id)?;
    sync_open_subs_to_tree(meta, &head_tree, &new_tree, &state_dir)?;
    let sig = repo::signature(repo)?;
    let commit = repo::create_commit(
        repo,
        Some("HEAD"),
        &sig,
        &sig,
        &message,
        &new_tree,
        &[sequencer.original_head.oid, sequencer.target.oid],
    )?;
    let mut cb = CheckoutBuilder::new();
    cb.force();
    repo.checkout_head(Some(&mut cb))?;
    Sequencer::clear(&state_dir)?;
    SubHeads::clear(&state_dir)?;
    info!(%commit, "merge finalized");
    Ok(MergeOutcome::Committed(commit))
}

/// `Some(pin)` when the sub's conflicts are resolved and its merge commit
/// could be created; `None` while it is still blocked.
fn finalize_sub_merge(sub: &Repository, sub_seq: &Sequencer) -> Result<Option<Oid>> {
    let mut index = sub.index()?;
    if index.has_conflicts() {
        return Ok(None);
    }
    let tree_id = index.write_tree()?;
    let tree = sub.find_tree(tree_id)?;
    let sig = repo::signature(sub)?;
    let message = sub_seq.message.as_deref().unwrap_or("merge");
    let new_pin = repo::create_commit(
        sub,
        None,
        &sig,
        &sig,
        message,
        &tree,
        &[sub_seq.original_head.oid, sub_seq.target.oid],
    )?;
    move_head_to(sub, new_pin)?;
    let mut cb = CheckoutBuilder::new();
    cb.force();
    sub.checkout_head(Some(&mut cb))?;
    Ok(Some(new_pin))
}

/// Abandon an interrupted merge: restore every touched sub, clear the meta
/// index, delete the sequencer.
pub fn merge_abort(meta: &MetaRepo) -> Result<()> {
    let state_dir = meta.state_dir()?;
    let sequencer = Sequencer::load(&state_dir)?
        .ok_or_else(|| Error::usage("no merge in progress"))?;
    if sequencer.kind != SequencerKind::Merge {
        return Err(Error::usage(format!(
            "a {} is in progress, not a merge",
            sequencer.kind.command()
        )));
    }
    restore_sub_heads(meta, &state_dir)?;

    let repo = meta.repo();
    let head_tree = repo::commit_tree(repo, sequencer.original_head.oid)?;
    let mut index = repo.index()?;
    index.read_tree(&head_tree)?;
    index.write()?;
    let mut cb = CheckoutBuilder::new();
    cb.force();
    repo.checkout_head(Some(&mut cb))?;
    repo.cleanup_state().ok();
    Sequencer::clear(&state_dir)?;
    SubHeads::clear(&state_dir)?;
    Ok(())
}
