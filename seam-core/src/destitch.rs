//! Meta reconstruction: given a flat ("stitched") commit whose tree mixes
//! registry state with sub-repository contents under each sub's path,
//! rebuild the equivalent meta + per-sub commit graph. Results are memoised
//! in the stitched notes namespaces so repeated destitches are cheap.

use git2::{FileMode, Oid, Repository, Tree};
use tracing::{debug, info, instrument};

use crate::error::{Error, Result};
use crate::registry::{Registry, REGISTRY_FILE};
use crate::repo::{self, MetaRepo, NotesRef};

/// Destitch `stitched` (and, recursively, its ancestors) into meta + sub
/// commits. Returns the reconstructed meta commit id.
#[instrument(skip(meta), fields(stitched = %stitched))]
pub fn destitch(meta: &MetaRepo, stitched: Oid) -> Result<Oid> {
    if let Some(found) = lookup(meta.repo(), stitched)? {
        debug!(%found, "destitch memo hit");
        return Ok(found);
    }
    let repo = meta.repo();
    let commit = repo.find_commit(stitched)?;
    let flat_tree = commit.tree()?;
    let registry = Registry::from_tree(repo, &flat_tree)?;

    // ancestors first; every parent must itself be destitchable
    let mut meta_parents = Vec::new();
    for parent in commit.parents() {
        meta_parents.push(destitch(meta, parent.id())?);
    }

    let first_parent_flat = commit.parents().next().map(|p| p.tree()).transpose()?;
    let parent_meta_tree = match meta_parents.first() {
        Some(oid) => Some(repo::commit_tree(repo, *oid)?),
        None => None,
    };

    let deltas = repo::diff_trees(repo, first_parent_flat.as_ref(), Some(&flat_tree))?;

    // group changed files by longest matching sub path prefix
    struct SubGroup {
        changes: Vec<(String, Option<(Oid, FileMode)>)>,
    }
    let mut groups: std::collections::BTreeMap<String, SubGroup> = Default::default();
    let mut meta_changes: Vec<(String, Option<(Oid, FileMode)>)> = Vec::new();

    for delta in &deltas {
        let path = delta
            .new_path
            .clone()
            .or_else(|| delta.old_path.clone())
            .ok_or_else(|| Error::internal("delta without a path"))?;
        let entry = repo::tree_entry_id(&flat_tree, &path);
        match registry.owning_sub(&path) {
            Some(sub) => {
                let rel = path[sub.path.len()..].trim_start_matches('/').to_string();
                if rel.is_empty() {
                    continue;
                }
                groups
                    .entry(sub.path.clone())
                    .or_insert_with(|| SubGroup { changes: Vec::new() })
                    .changes
                    .push((rel, entry));
            }
            None if path == REGISTRY_FILE => {
                meta_changes.push((path, entry));
            }
            None => {
                // a meta-level file must already exist at the parent meta
                // commit; anything else was misattributed by the stitch
                let known = parent_meta_tree
                    .as_ref()
                    .map(|t| t.get_path(std::path::Path::new(&path)).is_ok())
                    .unwrap_or(false);
                if known || entry.is_none() {
                    meta_changes.push((path, entry));
                } else {
                    return Err(Error::NotInSubmodule(path));
                }
            }
        }
    }

    // rebuild each touched sub
    let mut new_pins: Vec<(String, Oid)> = Vec::new();
    for (sub_path, group) in groups {
        let parent_pin = parent_meta_tree
            .as_ref()
            .and_then(|t| repo::gitlink_at(t, &sub_path));
        let sub_repo = sub_handle(meta, &registry, &sub_path)?;
        let new_pin = build_sub_commit(repo, &sub_repo, &commit, parent_pin, &group.changes)?;
        new_pins.push((sub_path, new_pin));
    }

    // rebuild the meta tree: parent meta tree + meta file changes + pins
    let mut meta_tree_id = match &parent_meta_tree {
        Some(tree) => tree.id(),
        None => repo::empty_tree(repo)?.id(),
    };
    for (path, entry) in &meta_changes {
        let root = repo.find_tree(meta_tree_id)?;
        meta_tree_id = repo::update_tree_path(repo, &root, path, *entry)?;
    }
    for (path, pin) in &new_pins {
        let root = repo.find_tree(meta_tree_id)?;
        meta_tree_id =
            repo::update_tree_path(repo, &root, path, Some((*pin, FileMode::Commit)))?;
    }

    let meta_tree = repo.find_tree(meta_tree_id)?;
    let meta_commit = repo::create_commit(
        repo,
        None,
        &commit.author(),
        &commit.committer(),
        commit.message().unwrap_or_default(),
        &meta_tree,
        &meta_parents,
    )?;

    repo::note_write(
        repo,
        &NotesRef::StitchedLocal,
        stitched,
        &meta_commit.to_string(),
    )?;
    info!(%meta_commit, "destitched");
    Ok(meta_commit)
}

/// Memoised mapping: the shared authoritative namespace wins, then the
/// local cache.
fn lookup(repo: &Repository, stitched: Oid) -> Result<Option<Oid>> {
    for ns in [NotesRef::StitchedReference, NotesRef::StitchedLocal] {
        if let Some(text) = repo::note_read(repo, &ns, stitched)? {
            let hex = text.trim();
            let oid = Oid::from_str(hex)
                .map_err(|_| Error::internal(format!("malformed destitch note `{hex}`")))?;
            if repo.find_commit(oid).is_ok() {
                return Ok(Some(oid));
            }
        }
    }
    Ok(None)
}

/// Repository to create sub commits in: the open working copy when there is
/// one, otherwise a bare cache under the private state area.
fn sub_handle(meta: &MetaRepo, registry: &Registry, sub_path: &str) -> Result<Repository> {
    if meta.sub_is_open(sub_path) {
        return meta.open_sub(sub_path);
    }
    let entry = registry
        .by_path(sub_path)
        .ok_or_else(|| Error::internal(format!("no registry entry for `{sub_path}`")))?;
    let cache = meta.sub_cache_path(&entry.name)?;
    if cache.exists() {
        return Repository::open_bare(&cache).map_err(Error::from);
    }
    if let Some(parent) = cache.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Repository::init_bare(&cache).map_err(Error::from)
}

/// Apply one sub's grouped changes to its parent tree and commit the
/// result with the flat commit's identity and message. Blob content crosses
/// object databases by value.
fn build_sub_commit(
    meta_repo: &Repository,
    sub_repo: &Repository,
    flat_commit: &git2::Commit<'_>,
    parent_pin: Option<Oid>,
    changes: &[(String, Option<(Oid, FileMode)>)],
) -> Result<Oid> {
    let parent_tree: Option<Tree<'_>> = match parent_pin {
        Some(pin) => Some(repo::commit_tree(sub_repo, pin)?),
        None => None,
    };
    let mut tree_id = match &parent_tree {
        Some(tree) => tree.id(),
        None => repo::empty_tree(sub_repo)?.id(),
    };
    for (rel, entry) in changes {
        let new_entry = match entry {
            Some((blob_id, mode)) => {
                let blob = meta_repo.find_blob(*blob_id)?;
                let copied = sub_repo.blob(blob.content())?;
                Some((copied, *mode))
            }
            None => None,
        };
        let root = sub_repo.find_tree(tree_id)?;
        tree_id = repo::update_tree_path(sub_repo, &root, rel, new_entry)?;
    }
    let tree = sub_repo.find_tree(tree_id)?;
    let parents: Vec<Oid> = parent_pin.into_iter().collect();
    repo::create_commit(
        sub_repo,
        None,
        &flat_commit.author(),
        &flat_commit.committer(),
        flat_commit.message().unwrap_or_default(),
        &tree,
        &parents,
    )
}
