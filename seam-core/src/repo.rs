//! Thin capability surface over the storage engine. Everything the engines
//! need from git lives here: commit-ish resolution, tree plumbing, three-way
//! index merges, ancestry queries, notes, fetch and push.

use std::path::{Path, PathBuf};

use git2::build::CheckoutBuilder;
use git2::{
    Commit, Delta, Diff, DiffOptions, ErrorCode, FetchOptions, FileMode, Index, MergeOptions,
    ObjectType, Oid, PushOptions, Repository, Signature, Tree, TreeBuilder,
};
use tracing::debug;

use crate::error::{Error, Result};

pub const STATE_DIR: &str = "seam";

/// Handle on a meta-repository working copy. The engines never discover a
/// repository from the process CWD; the front-end resolves one of these and
/// passes it down.
pub struct MetaRepo {
    repo: Repository,
}

impl MetaRepo {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let repo = Repository::open(path)?;
        Self::from_repo(repo)
    }

    pub fn discover<P: AsRef<Path>>(path: P) -> Result<Self> {
        let repo = Repository::discover(path)?;
        Self::from_repo(repo)
    }

    fn from_repo(repo: Repository) -> Result<Self> {
        if repo.workdir().is_none() {
            return Err(Error::usage(
                "meta-repository must have a working directory (bare repositories are not supported)",
            ));
        }
        Ok(MetaRepo { repo })
    }

    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    pub fn workdir(&self) -> &Path {
        self.repo.workdir().expect("checked non-bare on open")
    }

    /// Private state area: `.git/seam/`, created on first use.
    pub fn state_dir(&self) -> Result<PathBuf> {
        state_dir_of(&self.repo)
    }

    pub fn origin_url(&self) -> Option<String> {
        self.repo
            .find_remote("origin")
            .ok()
            .and_then(|remote| remote.url().map(str::to_string))
    }

    pub fn head_commit(&self) -> Result<Commit<'_>> {
        let head = self
            .repo
            .head()
            .map_err(|_| Error::NotFound("HEAD".into()))?;
        Ok(head.peel_to_commit()?)
    }

    /// Branch ref name HEAD points at, if not detached.
    pub fn head_refname(&self) -> Option<String> {
        let head = self.repo.head().ok()?;
        if head.is_branch() {
            head.name().map(str::to_string)
        } else {
            None
        }
    }

    pub fn sub_workdir(&self, sub_path: &str) -> PathBuf {
        self.workdir().join(sub_path)
    }

    /// A sub-repository is open when its working directory is instantiated.
    pub fn sub_is_open(&self, sub_path: &str) -> bool {
        self.sub_workdir(sub_path).join(".git").exists()
    }

    pub fn open_sub(&self, sub_path: &str) -> Result<Repository> {
        Repository::open(self.sub_workdir(sub_path)).map_err(Error::from)
    }

    /// Bare object cache for a closed sub, under the private state area.
    pub fn sub_cache_path(&self, name: &str) -> Result<PathBuf> {
        Ok(self.state_dir()?.join("subs").join(format!("{name}.git")))
    }
}

/// Private state area of any repository (`<gitdir>/seam/`), created on
/// first use. Sub-repositories carry their own sequencers here.
pub fn state_dir_of(repo: &Repository) -> Result<PathBuf> {
    let dir = repo.path().join(STATE_DIR);
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
    }
    Ok(dir)
}

/// Resolve a commit-ish to a commit id. `Ok(None)` means the name does not
/// resolve; other failures propagate.
pub fn resolve_commitish(repo: &Repository, spec: &str) -> Result<Option<Oid>> {
    match repo.revparse_single(spec) {
        Ok(object) => match object.peel_to_commit() {
            Ok(commit) => Ok(Some(commit.id())),
            Err(_) => Ok(None),
        },
        Err(err) if err.code() == ErrorCode::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

pub fn require_commitish(repo: &Repository, spec: &str) -> Result<Oid> {
    resolve_commitish(repo, spec)?.ok_or_else(|| Error::NotFound(spec.to_string()))
}

pub fn commit_tree<'r>(repo: &'r Repository, oid: Oid) -> Result<Tree<'r>> {
    Ok(repo.find_commit(oid)?.tree()?)
}

/// `true` when `commit` is `ancestor` or descends from it.
pub fn descendant_of(repo: &Repository, commit: Oid, ancestor: Oid) -> Result<bool> {
    if commit == ancestor {
        return Ok(true);
    }
    Ok(repo.graph_descendant_of(commit, ancestor)?)
}

/// First merge base the storage engine yields, or `None` when the histories
/// are unrelated. Ties between multiple candidates resolve to libgit2's
/// first answer; callers rely on that ordering being stable.
pub fn merge_base(repo: &Repository, a: Oid, b: Oid) -> Result<Option<Oid>> {
    match repo.merge_base(a, b) {
        Ok(oid) => Ok(Some(oid)),
        Err(err) if err.code() == ErrorCode::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeDelta {
    pub old_path: Option<String>,
    pub new_path: Option<String>,
    pub kind: Delta,
}

fn delta_path(file: git2::DiffFile<'_>) -> Option<String> {
    file.path().and_then(|p| p.to_str()).map(str::to_string)
}

/// Tree-to-tree diff as a plain delta list. `None` trees mean "empty".
pub fn diff_trees(
    repo: &Repository,
    old: Option<&Tree<'_>>,
    new: Option<&Tree<'_>>,
) -> Result<Vec<TreeDelta>> {
    let mut opts = DiffOptions::new();
    opts.include_typechange(true);
    let diff = repo.diff_tree_to_tree(old, new, Some(&mut opts))?;
    Ok(collect_deltas(&diff))
}

pub fn collect_deltas(diff: &Diff<'_>) -> Vec<TreeDelta> {
    diff.deltas()
        .map(|delta| TreeDelta {
            old_path: delta_path(delta.old_file()),
            new_path: delta_path(delta.new_file()),
            kind: delta.status(),
        })
        .collect()
}

/// Three-way tree merge producing an in-memory index; conflict entries are
/// preserved rather than failing.
pub fn merge_trees(
    repo: &Repository,
    base: Option<&Tree<'_>>,
    ours: &Tree<'_>,
    theirs: &Tree<'_>,
) -> Result<Index> {
    let mut opts = MergeOptions::new();
    opts.fail_on_conflict(false);
    let empty;
    let base = match base {
        Some(tree) => tree,
        None => {
            empty = empty_tree(repo)?;
            &empty
        }
    };
    Ok(repo.merge_trees(base, ours, theirs, Some(&opts))?)
}

pub fn empty_tree(repo: &Repository) -> Result<Tree<'_>> {
    let builder = repo.treebuilder(None)?;
    let oid = builder.write()?;
    Ok(repo.find_tree(oid)?)
}

/// Replace the repository's on-disk index with `merged` (conflict stages
/// included) and optionally materialise it into the working directory with
/// conflict markers.
pub fn install_index(repo: &Repository, merged: &Index, checkout: bool) -> Result<()> {
    let mut real = repo.index()?;
    real.clear()?;
    for entry in merged.iter() {
        real.add(&entry)?;
    }
    real.write()?;
    if checkout {
        let mut cb = CheckoutBuilder::new();
        cb.allow_conflicts(true).conflict_style_merge(true).force();
        repo.checkout_index(Some(&mut real), Some(&mut cb))?;
    }
    Ok(())
}

pub fn conflicted_paths(index: &Index) -> Vec<String> {
    let mut files = Vec::new();
    if let Ok(conflicts) = index.conflicts() {
        for conflict in conflicts.flatten() {
            let bytes = conflict
                .our
                .as_ref()
                .or(conflict.their.as_ref())
                .or(conflict.ancestor.as_ref())
                .map(|entry| entry.path.clone());
            if let Some(bytes) = bytes {
                files.push(String::from_utf8_lossy(&bytes).to_string());
            }
        }
    }
    files.sort();
    files.dedup();
    files
}

pub fn signature(repo: &Repository) -> Result<Signature<'static>> {
    match repo.signature() {
        Ok(sig) => Ok(sig),
        Err(_) => Ok(Signature::now("seam", "seam@localhost")?),
    }
}

/// Create a commit object. `update_ref` follows git semantics (`Some("HEAD")`
/// advances the checked-out branch); parents are recorded in argument order.
pub fn create_commit(
    repo: &Repository,
    update_ref: Option<&str>,
    author: &Signature<'_>,
    committer: &Signature<'_>,
    message: &str,
    tree: &Tree<'_>,
    parents: &[Oid],
) -> Result<Oid> {
    let parent_commits: Vec<Commit<'_>> = parents
        .iter()
        .map(|oid| repo.find_commit(*oid))
        .collect::<std::result::Result<_, _>>()?;
    let parent_refs: Vec<&Commit<'_>> = parent_commits.iter().collect();
    Ok(repo.commit(update_ref, author, committer, message, tree, &parent_refs)?)
}

/// Rewrite one path in a tree, returning the new root tree id. `entry` is
/// `(oid, filemode)`; `None` removes the path. Handles nested paths by
/// rebuilding each tree level; gitlink entries (`FileMode::Commit`) may
/// reference commits absent from this repository's object database.
pub fn update_tree_path(
    repo: &Repository,
    root: &Tree<'_>,
    path: &str,
    entry: Option<(Oid, FileMode)>,
) -> Result<Oid> {
    fn recurse(
        repo: &Repository,
        tree: Option<&Tree<'_>>,
        segments: &[&str],
        entry: Option<(Oid, i32)>,
    ) -> Result<Option<Oid>> {
        let mut builder: TreeBuilder<'_> = repo.treebuilder(tree)?;
        let name = segments[0];
        if segments.len() == 1 {
            match entry {
                Some((oid, mode)) => {
                    builder.insert(name, oid, mode)?;
                }
                None => {
                    if builder.get(name)?.is_some() {
                        builder.remove(name)?;
                    }
                }
            }
        } else {
            let child = match builder.get(name)? {
                Some(existing) if existing.kind() == Some(ObjectType::Tree) => {
                    Some(repo.find_tree(existing.id())?)
                }
                _ => None,
            };
            match recurse(repo, child.as_ref(), &segments[1..], entry)? {
                Some(child_oid) => {
                    builder.insert(name, child_oid, FileMode::Tree.into())?;
                }
                None => {
                    if builder.get(name)?.is_some() {
                        builder.remove(name)?;
                    }
                }
            }
        }
        if builder.len() == 0 && tree.is_none() {
            return Ok(None);
        }
        Ok(Some(builder.write()?))
    }

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return Err(Error::internal("empty path in tree update"));
    }
    let new_root = recurse(
        repo,
        Some(root),
        &segments,
        entry.map(|(oid, mode)| (oid, mode.into())),
    )?
    .ok_or_else(|| Error::internal("tree update produced no root"))?;
    Ok(new_root)
}

/// Read the entry at `path` in `tree`, if any.
pub fn tree_entry_id(tree: &Tree<'_>, path: &str) -> Option<(Oid, FileMode)> {
    let entry = tree.get_path(Path::new(path)).ok()?;
    let mode = match entry.filemode() {
        m if m == i32::from(FileMode::Commit) => FileMode::Commit,
        m if m == i32::from(FileMode::Tree) => FileMode::Tree,
        m if m == i32::from(FileMode::Link) => FileMode::Link,
        m if m == i32::from(FileMode::BlobExecutable) => FileMode::BlobExecutable,
        _ => FileMode::Blob,
    };
    Some((entry.id(), mode))
}

/// Gitlink pin at `path` in `tree`. Zero oid means "uninitialised".
pub fn gitlink_at(tree: &Tree<'_>, path: &str) -> Option<Oid> {
    match tree_entry_id(tree, path) {
        Some((oid, FileMode::Commit)) => Some(oid),
        _ => None,
    }
}

pub fn read_blob(repo: &Repository, tree: &Tree<'_>, path: &str) -> Result<Option<Vec<u8>>> {
    match tree.get_path(Path::new(path)) {
        Ok(entry) if entry.kind() == Some(ObjectType::Blob) => {
            let blob = repo.find_blob(entry.id())?;
            Ok(Some(blob.content().to_vec()))
        }
        Ok(_) => Ok(None),
        Err(err) if err.code() == ErrorCode::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

// --- notes ---------------------------------------------------------------

/// Notes namespaces used by the engine. Arbitrary namespaces shard by the
/// first two hex byte pairs of the annotated commit so no single notes tree
/// grows unbounded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotesRef {
    /// Authoritative stitched<->destitched mapping; never written by seam.
    StitchedReference,
    /// Local destitch cache.
    StitchedLocal,
    /// Arbitrary per-commit message namespace, sharded.
    Sharded(String),
}

impl NotesRef {
    pub fn refname(&self, annotated: Oid) -> String {
        match self {
            NotesRef::StitchedReference => "refs/notes/stitched/reference".to_string(),
            NotesRef::StitchedLocal => "refs/notes/stitched/local-reference".to_string(),
            NotesRef::Sharded(ns) => {
                let hex = annotated.to_string();
                format!("refs/notes/{}/{}/{}", ns, &hex[0..2], &hex[2..4])
            }
        }
    }
}

pub fn note_read(repo: &Repository, ns: &NotesRef, annotated: Oid) -> Result<Option<String>> {
    let refname = ns.refname(annotated);
    match repo.find_note(Some(&refname), annotated) {
        Ok(note) => Ok(note.message().map(str::to_string)),
        Err(err) if err.code() == ErrorCode::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

pub fn note_write(repo: &Repository, ns: &NotesRef, annotated: Oid, message: &str) -> Result<()> {
    if matches!(ns, NotesRef::StitchedReference) {
        return Err(Error::internal(
            "refs/notes/stitched/reference is read-only for the engine",
        ));
    }
    let refname = ns.refname(annotated);
    let sig = signature(repo)?;
    repo.note(&sig, &sig, Some(&refname), annotated, message, true)?;
    Ok(())
}

// --- fetch / push --------------------------------------------------------

/// Make `oid` present in `repo`, fetching from `url` when missing. Tries the
/// exact-sha refspec first (servers with any-sha upload enabled), then falls
/// back to fetching branch heads.
pub fn fetch_commit(repo: &Repository, url: &str, oid: Oid) -> Result<()> {
    if repo.find_commit(oid).is_ok() {
        return Ok(());
    }
    debug!(url, oid = %oid, "fetching commit");
    let mut remote = repo
        .remote_anonymous(url)
        .map_err(|err| Error::FetchFailed(format!("{url}: {err}")))?;

    let hex = oid.to_string();
    let direct = remote.fetch(&[hex.as_str()], Some(&mut FetchOptions::new()), None);
    if direct.is_err() {
        remote
            .fetch(
                &["+refs/heads/*:refs/seam/fetch/heads/*"],
                Some(&mut FetchOptions::new()),
                None,
            )
            .map_err(|err| Error::FetchFailed(format!("{url}: {err}")))?;
    }

    repo.find_commit(oid)
        .map_err(|_| Error::FetchFailed(format!("{url}: commit {oid} not found on remote")))?;
    Ok(())
}

/// Push `refname` (pointing at `oid`) to `url`. `force` selects a
/// leading-`+` refspec; `include_tags` also pushes all local tags.
pub fn push_ref(
    repo: &Repository,
    url: &str,
    refname: &str,
    force: bool,
    include_tags: bool,
) -> Result<()> {
    let mut remote = repo.remote_anonymous(url)?;
    let prefix = if force { "+" } else { "" };
    let mut refspecs = vec![format!("{prefix}{refname}:{refname}")];
    if include_tags {
        let tags = repo.tag_names(None)?;
        for tag in tags.iter().flatten() {
            refspecs.push(format!("{prefix}refs/tags/{tag}:refs/tags/{tag}"));
        }
    }
    let specs: Vec<&str> = refspecs.iter().map(String::as_str).collect();
    remote.push(&specs, Some(&mut PushOptions::new()))?;
    Ok(())
}

pub fn short_oid(oid: Oid) -> String {
    let text = oid.to_string();
    text.chars().take(7).collect()
}
