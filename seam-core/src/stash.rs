//! Shadow commits and the stash stack. A shadow commit captures index or
//! working-directory state as a synthetic commit parented on HEAD; a stash
//! entry ties the two together and lives in the reflog of `refs/seam/stash`.
//! For the meta-repository the shadows recursively pin per-sub shadows.

use chrono::{DateTime, TimeZone, Utc};
use git2::build::CheckoutBuilder;
use git2::{Delta, DiffOptions, Index, Oid, Repository, ResetType};
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::repo::{self, MetaRepo};

pub const STASH_REF: &str = "refs/seam/stash";

#[derive(Debug, Clone)]
pub struct StashEntry {
    pub index: usize,
    pub oid: Oid,
    pub message: String,
    pub when: DateTime<Utc>,
}

/// Index shadow and workdir shadow for one repository, both parented on the
/// repository's HEAD at capture time.
struct ShadowPair {
    index_shadow: Oid,
    workdir_shadow: Oid,
    /// Untracked paths captured into the workdir shadow; removed from disk
    /// after a successful push.
    captured_untracked: Vec<String>,
    /// Anything worth stashing at all?
    dirty: bool,
}

fn workdir_deltas(
    repo: &Repository,
    include_untracked: bool,
) -> Result<Vec<(Delta, String, u32)>> {
    let index = repo.index()?;
    let mut opts = DiffOptions::new();
    opts.ignore_submodules(true).include_typechange(true);
    if include_untracked {
        opts.include_untracked(true).recurse_untracked_dirs(true);
    }
    let diff = repo.diff_index_to_workdir(Some(&index), Some(&mut opts))?;
    let mut out = Vec::new();
    for delta in diff.deltas() {
        let Some(path) = delta
            .new_file()
            .path()
            .or_else(|| delta.old_file().path())
            .and_then(|p| p.to_str())
        else {
            continue;
        };
        let mode: u32 = match delta.new_file().mode() {
            git2::FileMode::BlobExecutable => 0o100755,
            git2::FileMode::Link => 0o120000,
            _ => 0o100644,
        };
        out.push((delta.status(), path.to_string(), mode));
    }
    Ok(out)
}

fn blank_entry(path: &str, mode: u32, id: Oid) -> git2::IndexEntry {
    git2::IndexEntry {
        ctime: git2::IndexTime::new(0, 0),
        mtime: git2::IndexTime::new(0, 0),
        dev: 0,
        ino: 0,
        mode,
        uid: 0,
        gid: 0,
        file_size: 0,
        id,
        flags: 0,
        flags_extended: 0,
        path: path.as_bytes().to_vec(),
    }
}

/// Capture one repository's state. `pin_overrides` lets the meta layer swap
/// sub gitlinks for sub shadow commits.
fn shadow_pair(
    repo: &Repository,
    include_untracked: bool,
    index_pin_overrides: &[(String, Oid)],
    workdir_pin_overrides: &[(String, Oid)],
) -> Result<ShadowPair> {
    let head = repo
        .head()
        .map_err(|_| Error::usage("cannot stash before the first commit"))?
        .peel_to_commit()?;
    let head_tree = head.tree()?;

    let mut index = repo.index()?;
    if index.has_conflicts() {
        return Err(Error::dirty(
            "cannot stash while conflicts are unresolved",
        ));
    }

    // index shadow
    let mut idx_clone = Index::new()?;
    let plain_index_tree = index.write_tree()?;
    idx_clone.read_tree(&repo.find_tree(plain_index_tree)?)?;
    for (path, pin) in index_pin_overrides {
        crate::rebase::set_gitlink_entry(&mut idx_clone, path, Some(*pin))?;
    }
    let idx_tree_id = idx_clone.write_tree_to(repo)?;

    // workdir shadow: index plus every working-directory delta
    let mut wd_index = Index::new()?;
    wd_index.read_tree(&repo.find_tree(idx_tree_id)?)?;
    let mut captured_untracked = Vec::new();
    let deltas = workdir_deltas(repo, include_untracked)?;
    let workdir_root = repo
        .workdir()
        .ok_or_else(|| Error::usage("cannot stash in a bare repository"))?
        .to_path_buf();
    for (status, path, mode) in &deltas {
        match status {
            Delta::Deleted => {
                let p = std::path::Path::new(path);
                match wd_index.remove_path(p) {
                    Ok(()) => {}
                    Err(err) if err.code() == git2::ErrorCode::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }
            Delta::Untracked => {
                let blob = repo.blob_path(&workdir_root.join(path))?;
                wd_index.add(&blank_entry(path, *mode, blob))?;
                captured_untracked.push(path.clone());
            }
            _ => {
                let blob = repo.blob_path(&workdir_root.join(path))?;
                wd_index.add(&blank_entry(path, *mode, blob))?;
            }
        }
    }
    for (path, pin) in workdir_pin_overrides {
        crate::rebase::set_gitlink_entry(&mut wd_index, path, Some(*pin))?;
    }
    let wd_tree_id = wd_index.write_tree_to(repo)?;

    // shadow pin overrides do not count as local changes; dirtiness is
    // judged on this repository's own content
    let dirty = plain_index_tree != head_tree.id() || !deltas.is_empty();

    let sig = repo::signature(repo)?;
    let idx_tree = repo.find_tree(idx_tree_id)?;
    let index_shadow = repo::create_commit(
        repo,
        None,
        &sig,
        &sig,
        "index shadow",
        &idx_tree,
        &[head.id()],
    )?;
    let wd_tree = repo.find_tree(wd_tree_id)?;
    let workdir_shadow = repo::create_commit(
        repo,
        None,
        &sig,
        &sig,
        "workdir shadow",
        &wd_tree,
        &[head.id()],
    )?;

    Ok(ShadowPair {
        index_shadow,
        workdir_shadow,
        captured_untracked,
        dirty,
    })
}

fn entry_commit(repo: &Repository, pair: &ShadowPair, message: &str) -> Result<Oid> {
    let sig = repo::signature(repo)?;
    let tree = repo.find_commit(pair.workdir_shadow)?.tree()?;
    repo::create_commit(
        repo,
        None,
        &sig,
        &sig,
        message,
        &tree,
        &[pair.index_shadow, pair.workdir_shadow],
    )
}

fn push_stash_ref(repo: &Repository, oid: Oid, message: &str) -> Result<()> {
    let sig = repo::signature(repo)?;
    let mut reflog = repo.reflog(STASH_REF)?;
    reflog.append(oid, &sig, Some(message))?;
    reflog.write()?;
    repo.reference(STASH_REF, oid, true, message)?;
    Ok(())
}

/// Clean a repository back to HEAD after its state was captured.
fn scrub_to_head(repo: &Repository, captured_untracked: &[String]) -> Result<()> {
    let head = repo.head()?.peel_to_commit()?;
    let object = repo.find_object(head.id(), None)?;
    repo.reset(&object, ResetType::Hard, None)?;
    if let Some(workdir) = repo.workdir() {
        for path in captured_untracked {
            let full = workdir.join(path);
            if full.is_file() {
                std::fs::remove_file(&full)?;
            }
        }
    }
    Ok(())
}

/// Capture index + workdir (+ untracked on request) of the meta-repository
/// and every opened sub, push an entry onto the stash log, and scrub the
/// working copies back to HEAD.
#[instrument(skip(meta, message))]
pub fn push(meta: &MetaRepo, include_untracked: bool, message: Option<&str>) -> Result<Oid> {
    let repo = meta.repo();
    let head = meta.head_commit()?.id();
    let registry = Registry::from_commit(repo, head)?;

    let mut index_overrides = Vec::new();
    let mut workdir_overrides = Vec::new();
    let mut sub_scrubs: Vec<(String, Vec<String>)> = Vec::new();
    let mut any_sub_dirty = false;
    for entry in registry.entries() {
        if !meta.sub_is_open(&entry.path) {
            continue;
        }
        let sub = meta.open_sub(&entry.path)?;
        let pair = shadow_pair(&sub, include_untracked, &[], &[])?;
        if pair.dirty {
            any_sub_dirty = true;
        }
        debug!(sub = %entry.path, "captured sub shadows");
        index_overrides.push((entry.path.clone(), pair.index_shadow));
        workdir_overrides.push((entry.path.clone(), pair.workdir_shadow));
        sub_scrubs.push((entry.path.clone(), pair.captured_untracked));
    }

    let pair = shadow_pair(repo, include_untracked, &index_overrides, &workdir_overrides)?;
    if !pair.dirty && !any_sub_dirty {
        return Err(Error::usage("no local changes to save"));
    }

    let label = message.unwrap_or("WIP");
    let text = format!("seam stash: {label}");
    let entry = entry_commit(repo, &pair, &text)?;
    push_stash_ref(repo, entry, &text)?;

    for (path, captured) in &sub_scrubs {
        let sub = meta.open_sub(path)?;
        scrub_to_head(&sub, captured)?;
    }
    scrub_to_head(repo, &pair.captured_untracked)?;
    info!(%entry, "stashed working state");
    Ok(entry)
}

pub fn list(meta: &MetaRepo) -> Result<Vec<StashEntry>> {
    let repo = meta.repo();
    if repo.find_reference(STASH_REF).is_err() {
        return Ok(Vec::new());
    }
    let reflog = repo.reflog(STASH_REF)?;
    let mut entries = Vec::new();
    for (index, entry) in reflog.iter().enumerate() {
        let when = Utc
            .timestamp_opt(entry.committer().when().seconds(), 0)
            .single()
            .unwrap_or_else(Utc::now);
        entries.push(StashEntry {
            index,
            oid: entry.id_new(),
            message: entry.message().unwrap_or("").to_string(),
            when,
        });
    }
    Ok(entries)
}

fn entry_at(meta: &MetaRepo, n: usize) -> Result<StashEntry> {
    let entries = list(meta)?;
    entries
        .into_iter()
        .find(|e| e.index == n)
        .ok_or_else(|| Error::usage(format!("no stash entry {n}")))
}

/// Three-way apply of one repository's shadows onto its current HEAD.
/// Returns false when conflicts were left in the working directory.
fn apply_shadows(
    repo: &Repository,
    index_shadow: Oid,
    workdir_shadow: Oid,
    reinstate_index: bool,
) -> Result<bool> {
    let base = repo.find_commit(workdir_shadow)?.parent(0)?;
    let base_tree = base.tree()?;
    let head = repo.head()?.peel_to_commit()?;
    let head_tree = head.tree()?;
    let wd_tree = repo.find_commit(workdir_shadow)?.tree()?;

    let mut merged = repo::merge_trees(repo, Some(&base_tree), &head_tree, &wd_tree)?;
    if merged.has_conflicts() {
        repo::install_index(repo, &merged, true)?;
        return Ok(false);
    }
    let merged_tree_id = merged.write_tree_to(repo)?;
    let merged_object = repo.find_object(merged_tree_id, None)?;
    let mut cb = CheckoutBuilder::new();
    cb.force();
    repo.checkout_tree(&merged_object, Some(&mut cb))?;

    let mut index = repo.index()?;
    if reinstate_index {
        let idx_tree = repo.find_commit(index_shadow)?.tree()?;
        let mut merged_idx = repo::merge_trees(repo, Some(&base_tree), &head_tree, &idx_tree)?;
        if merged_idx.has_conflicts() {
            // workdir is already updated; fall back to an unstaged apply
            warn!("index state could not be reinstated cleanly; leaving changes unstaged");
            index.read_tree(&head_tree)?;
        } else {
            let merged_idx_tree = repo.find_tree(merged_idx.write_tree_to(repo)?)?;
            index.read_tree(&merged_idx_tree)?;
        }
    } else {
        index.read_tree(&head_tree)?;
    }
    index.write()?;
    Ok(true)
}

/// Extract the sub shadow pins recorded in a meta shadow tree that differ
/// from the sub's currently pinned state.
fn sub_shadow_pins(
    meta: &MetaRepo,
    registry: &Registry,
    index_shadow: Oid,
    workdir_shadow: Oid,
) -> Result<Vec<(String, Oid, Oid)>> {
    let repo = meta.repo();
    let idx_tree = repo.find_commit(index_shadow)?.tree()?;
    let wd_tree = repo.find_commit(workdir_shadow)?.tree()?;
    let mut out = Vec::new();
    for entry in registry.entries() {
        let idx_pin = repo::gitlink_at(&idx_tree, &entry.path);
        let wd_pin = repo::gitlink_at(&wd_tree, &entry.path);
        if let (Some(idx_pin), Some(wd_pin)) = (idx_pin, wd_pin) {
            out.push((entry.path.clone(), idx_pin, wd_pin));
        }
    }
    Ok(out)
}

/// Apply stash entry `n`. Conflicts leave the working directory modified
/// and keep the entry in the log.
#[instrument(skip(meta))]
pub fn apply(meta: &MetaRepo, n: usize, reinstate_index: bool) -> Result<()> {
    let repo = meta.repo();
    let entry = entry_at(meta, n)?;
    let commit = repo.find_commit(entry.oid)?;
    if commit.parent_count() != 2 {
        return Err(Error::internal("stash entry is not a two-parent commit"));
    }
    let index_shadow = commit.parent_id(0)?;
    let workdir_shadow = commit.parent_id(1)?;

    let head = meta.head_commit()?.id();
    let registry = Registry::from_commit(repo, head)?;

    // subs first, so a meta conflict still leaves sub state applied
    let mut conflicted = Vec::new();
    let pins = sub_shadow_pins(meta, &registry, index_shadow, workdir_shadow)?;
    for (path, sub_idx_shadow, sub_wd_shadow) in &pins {
        if !meta.sub_is_open(path) {
            warn!(sub = %path, "skipping stashed state for closed sub-repository");
            continue;
        }
        let sub = meta.open_sub(path)?;
        // shadows recorded for this sub only if they exist in its store
        if sub.find_commit(*sub_wd_shadow).is_err() {
            continue;
        }
        if !apply_shadows(&sub, *sub_idx_shadow, *sub_wd_shadow, reinstate_index)? {
            conflicted.push(path.clone());
        }
    }

    if !apply_shadows(repo, index_shadow, workdir_shadow, reinstate_index)? {
        conflicted.push(".".to_string());
    }

    // the shadow pins were only a recursion vehicle: the meta index keeps
    // pinning the real sub commits from HEAD
    let head_tree = repo.find_commit(head)?.tree()?;
    let mut index = repo.index()?;
    for (path, _, _) in &pins {
        let pin = repo::gitlink_at(&head_tree, path);
        crate::rebase::set_gitlink_entry(&mut index, path, pin)?;
    }
    index.write()?;
    if !conflicted.is_empty() {
        return Err(Error::Conflict(format!(
            "stash apply conflicted in {}; entry kept in the log",
            conflicted.join(", ")
        )));
    }
    info!(entry = %entry.oid, "stash applied");
    Ok(())
}

pub fn drop(meta: &MetaRepo, n: usize) -> Result<()> {
    let repo = meta.repo();
    let _ = entry_at(meta, n)?;
    let mut reflog = repo.reflog(STASH_REF)?;
    reflog.remove(n, true)?;
    reflog.write()?;

    let remaining = repo.reflog(STASH_REF)?;
    match remaining.iter().next().map(|e| e.id_new()) {
        Some(top) => {
            repo.reference(STASH_REF, top, true, "stash drop")?;
        }
        None => {
            let mut reference = repo.find_reference(STASH_REF)?;
            reference.delete()?;
        }
    }
    Ok(())
}

/// `apply` followed, on success, by removal from the log. The shadows carry
/// the staged/unstaged split, so pop reinstates the index too.
pub fn pop(meta: &MetaRepo, n: usize) -> Result<()> {
    apply(meta, n, true)?;
    drop(meta, n)
}
