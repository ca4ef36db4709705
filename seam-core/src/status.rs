//! Canonical snapshot of index and working-directory deltas for the
//! meta-repository and every opened sub-repository, including conflict
//! entries and per-sub commit relations.

use std::path::Path;

use git2::{Delta, Diff, DiffFindOptions, DiffOptions, Oid, Repository, RepositoryState, Tree};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::repo::{self, MetaRepo};
use crate::sequencer::{Sequencer, SequencerKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
    Renamed,
    TypeChanged,
    Conflicted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileChange {
    pub path: String,
    pub kind: ChangeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renamed_from: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RepoStatus {
    pub staged: Vec<FileChange>,
    pub workdir: Vec<FileChange>,
    pub rebase_in_progress: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequencer: Option<SequencerKind>,
}

impl RepoStatus {
    pub fn is_clean(&self) -> bool {
        self.staged.is_empty()
            && self.workdir.is_empty()
            && !self.rebase_in_progress
            && self.sequencer.is_none()
    }

    pub fn has_conflicts(&self) -> bool {
        self.staged
            .iter()
            .chain(self.workdir.iter())
            .any(|c| c.kind == ChangeKind::Conflicted)
    }
}

/// Relation of the staged (index) pin to the committed (HEAD) pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitRelation {
    Same,
    Ahead,
    Behind,
    Unrelated,
    Unknown,
}

mod oid_opt {
    use git2::Oid;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(oid: &Option<Oid>, ser: S) -> Result<S::Ok, S::Error> {
        match oid {
            Some(oid) => ser.serialize_some(&oid.to_string()),
            None => ser.serialize_none(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubStatus {
    pub name: String,
    pub path: String,
    pub url: String,
    #[serde(serialize_with = "oid_opt::serialize")]
    pub commit_pin: Option<Oid>,
    #[serde(serialize_with = "oid_opt::serialize")]
    pub index_pin: Option<Oid>,
    pub relation: CommitRelation,
    pub open: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workdir: Option<RepoStatus>,
}

#[derive(Debug, Serialize)]
pub struct MetaStatus {
    #[serde(serialize_with = "oid_opt::serialize")]
    pub head: Option<Oid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub files: RepoStatus,
    pub subs: Vec<SubStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UntrackedPolicy {
    /// Untracked files are not part of the snapshot.
    Ignore,
    /// An untracked directory collapses into one entry with a trailing `/`.
    Normal,
    /// Every untracked file is listed individually.
    All,
}

/// Tree the index/workdir are compared against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseTree {
    Head,
    Empty,
    Commit(Oid),
}

#[derive(Debug, Clone)]
pub struct StatusQuery {
    pub base: BaseTree,
    /// Prefix filters over slash-separated segments; empty selects all.
    pub paths: Vec<String>,
    /// Compare the working directory to the base tree instead of the index.
    pub workdir_to_base: bool,
    pub untracked: UntrackedPolicy,
}

impl Default for StatusQuery {
    fn default() -> Self {
        StatusQuery {
            base: BaseTree::Head,
            paths: Vec::new(),
            workdir_to_base: false,
            untracked: UntrackedPolicy::Ignore,
        }
    }
}

impl StatusQuery {
    pub fn with_untracked(untracked: UntrackedPolicy) -> Self {
        StatusQuery {
            untracked,
            ..StatusQuery::default()
        }
    }
}

/// Prefix selection over slash-separated segments: `src` selects `src` and
/// `src/...` but not `srcx`.
pub fn path_selected(path: &str, filters: &[String]) -> bool {
    if filters.is_empty() {
        return true;
    }
    let normalized = path.trim_end_matches('/');
    filters.iter().any(|filter| {
        let filter = filter.trim_end_matches('/');
        normalized == filter
            || (normalized.starts_with(filter)
                && normalized.as_bytes().get(filter.len()) == Some(&b'/'))
    })
}

fn change_from_delta(delta: git2::DiffDelta<'_>) -> Option<FileChange> {
    let kind = match delta.status() {
        Delta::Added | Delta::Untracked => ChangeKind::Added,
        Delta::Deleted => ChangeKind::Removed,
        Delta::Modified => ChangeKind::Modified,
        Delta::Renamed => ChangeKind::Renamed,
        Delta::Typechange => ChangeKind::TypeChanged,
        Delta::Conflicted => ChangeKind::Conflicted,
        Delta::Unmodified | Delta::Ignored | Delta::Unreadable | Delta::Copied => return None,
    };
    let new_path = delta
        .new_file()
        .path()
        .or_else(|| delta.old_file().path())
        .and_then(Path::to_str)?
        .to_string();
    let renamed_from = if kind == ChangeKind::Renamed {
        delta
            .old_file()
            .path()
            .and_then(Path::to_str)
            .map(str::to_string)
    } else {
        None
    };
    Some(FileChange {
        path: new_path,
        kind,
        renamed_from,
    })
}

fn collect_changes(diff: &Diff<'_>, filters: &[String], skip: &dyn Fn(&str) -> bool) -> Vec<FileChange> {
    let mut changes: Vec<FileChange> = diff
        .deltas()
        .filter_map(change_from_delta)
        .filter(|c| path_selected(&c.path, filters))
        .filter(|c| !skip(&c.path))
        .collect();
    changes.sort_by(|a, b| a.path.cmp(&b.path));
    changes.dedup();
    changes
}

fn base_tree<'r>(repo: &'r Repository, base: BaseTree) -> Result<Option<Tree<'r>>> {
    match base {
        BaseTree::Empty => Ok(None),
        BaseTree::Head => Ok(repo.head().ok().and_then(|h| h.peel_to_tree().ok())),
        BaseTree::Commit(oid) => Ok(Some(repo::commit_tree(repo, oid)?)),
    }
}

fn diff_options(untracked: UntrackedPolicy) -> DiffOptions {
    let mut opts = DiffOptions::new();
    opts.ignore_submodules(true).include_typechange(true);
    match untracked {
        UntrackedPolicy::Ignore => {}
        UntrackedPolicy::Normal => {
            opts.include_untracked(true);
        }
        UntrackedPolicy::All => {
            opts.include_untracked(true).recurse_untracked_dirs(true);
        }
    }
    opts
}

fn repo_state_is_rebase(repo: &Repository) -> bool {
    matches!(
        repo.state(),
        RepositoryState::Rebase
            | RepositoryState::RebaseInteractive
            | RepositoryState::RebaseMerge
    )
}

/// Snapshot one repository. `skip` hides paths owned by sub-repositories
/// when the caller is the meta layer.
fn repo_status_filtered(
    repo: &Repository,
    query: &StatusQuery,
    skip: &dyn Fn(&str) -> bool,
) -> Result<RepoStatus> {
    let base = base_tree(repo, query.base)?;
    let index = repo.index()?;

    let mut staged_opts = diff_options(UntrackedPolicy::Ignore);
    let mut staged_diff = repo.diff_tree_to_index(base.as_ref(), Some(&index), Some(&mut staged_opts))?;
    staged_diff.find_similar(Some(&mut DiffFindOptions::new()))?;
    let mut staged = collect_changes(&staged_diff, &query.paths, skip);

    let mut workdir_opts = diff_options(query.untracked);
    let workdir_diff = if query.workdir_to_base {
        repo.diff_tree_to_workdir(base.as_ref(), Some(&mut workdir_opts))?
    } else {
        repo.diff_index_to_workdir(Some(&index), Some(&mut workdir_opts))?
    };
    let mut workdir = collect_changes(&workdir_diff, &query.paths, skip);

    // Conflict entries own their paths: one CONFLICTED record replaces any
    // clean-looking delta on either side.
    let conflicted = repo::conflicted_paths(&index);
    if !conflicted.is_empty() {
        staged.retain(|c| !conflicted.contains(&c.path));
        workdir.retain(|c| !conflicted.contains(&c.path));
        for path in conflicted
            .into_iter()
            .filter(|p| path_selected(p, &query.paths) && !skip(p))
        {
            staged.push(FileChange {
                path,
                kind: ChangeKind::Conflicted,
                renamed_from: None,
            });
        }
        staged.sort_by(|a, b| a.path.cmp(&b.path));
    }

    let sequencer = match repo::state_dir_of(repo) {
        Ok(dir) => Sequencer::load(&dir)?.map(|s| s.kind),
        Err(_) => None,
    };

    Ok(RepoStatus {
        staged,
        workdir,
        rebase_in_progress: repo_state_is_rebase(repo),
        sequencer,
    })
}

pub fn repo_status(repo: &Repository, query: &StatusQuery) -> Result<RepoStatus> {
    repo_status_filtered(repo, query, &|_| false)
}

fn sub_relation(
    meta: &MetaRepo,
    path: &str,
    commit_pin: Option<Oid>,
    index_pin: Option<Oid>,
) -> CommitRelation {
    if commit_pin == index_pin {
        return CommitRelation::Same;
    }
    let (Some(commit_pin), Some(index_pin)) = (commit_pin, index_pin) else {
        return CommitRelation::Unknown;
    };
    if !meta.sub_is_open(path) {
        return CommitRelation::Unknown;
    }
    let Ok(sub) = meta.open_sub(path) else {
        return CommitRelation::Unknown;
    };
    if sub.find_commit(commit_pin).is_err() || sub.find_commit(index_pin).is_err() {
        return CommitRelation::Unknown;
    }
    match (
        repo::descendant_of(&sub, index_pin, commit_pin),
        repo::descendant_of(&sub, commit_pin, index_pin),
    ) {
        (Ok(true), _) => CommitRelation::Ahead,
        (_, Ok(true)) => CommitRelation::Behind,
        (Ok(false), Ok(false)) => CommitRelation::Unrelated,
        _ => CommitRelation::Unknown,
    }
}

fn index_gitlink(repo: &Repository, path: &str) -> Result<Option<Oid>> {
    let index = repo.index()?;
    Ok(index
        .get_path(Path::new(path), 0)
        .filter(|entry| entry.mode == 0o160000)
        .map(|entry| entry.id)
        .filter(|oid| !oid.is_zero()))
}

/// Full snapshot of the meta-repository and every opened sub selected by the
/// query's path filters.
pub fn meta_status(meta: &MetaRepo, query: &StatusQuery) -> Result<MetaStatus> {
    let head = meta.repo().head().ok().and_then(|h| h.target());
    let branch = meta
        .repo()
        .head()
        .ok()
        .filter(git2::Reference::is_branch)
        .and_then(|h| h.shorthand().map(str::to_string));

    let registry = match head {
        Some(oid) => Registry::from_commit(meta.repo(), oid)?,
        None => Registry::default(),
    };

    let sub_paths: Vec<String> = registry.entries().iter().map(|e| e.path.clone()).collect();
    let skip = move |path: &str| {
        let trimmed = path.trim_end_matches('/');
        sub_paths.iter().any(|sub| {
            trimmed == sub
                || (trimmed.starts_with(sub.as_str())
                    && trimmed.as_bytes().get(sub.len()) == Some(&b'/'))
        })
    };
    let files = repo_status_filtered(meta.repo(), query, &skip)?;

    let mut subs = Vec::new();
    for entry in registry.entries() {
        if !path_selected(&entry.path, &query.paths) {
            continue;
        }
        let index_pin = index_gitlink(meta.repo(), &entry.path)?;
        let open = meta.sub_is_open(&entry.path);
        let workdir = if open {
            let sub_repo = meta.open_sub(&entry.path)?;
            let sub_query = StatusQuery {
                base: BaseTree::Head,
                paths: Vec::new(),
                workdir_to_base: query.workdir_to_base,
                untracked: query.untracked,
            };
            Some(repo_status(&sub_repo, &sub_query)?)
        } else {
            None
        };
        subs.push(SubStatus {
            name: entry.name.clone(),
            path: entry.path.clone(),
            url: entry.url.clone(),
            commit_pin: entry.pin,
            index_pin,
            relation: sub_relation(meta, &entry.path, entry.pin, index_pin),
            open,
            workdir,
        });
    }

    Ok(MetaStatus {
        head,
        branch,
        files,
        subs,
    })
}

/// Fail with `DIRTY` unless every staged, workdir, and sub bucket is empty,
/// no pin is staged, and no sequencer is active anywhere.
pub fn ensure_clean(status: &MetaStatus) -> Result<()> {
    let mut dirt = Vec::new();
    for change in &status.files.staged {
        dirt.push(format!("staged: {}", change.path));
    }
    for change in &status.files.workdir {
        dirt.push(format!("workdir: {}", change.path));
    }
    if status.files.rebase_in_progress {
        dirt.push("rebase in progress".to_string());
    }
    if let Some(kind) = status.files.sequencer {
        dirt.push(format!("{} in progress", kind.command()));
    }
    for sub in &status.subs {
        if sub.index_pin != sub.commit_pin {
            dirt.push(format!("sub {}: staged pin change", sub.path));
        }
        if let Some(workdir) = &sub.workdir {
            if !workdir.staged.is_empty() || !workdir.workdir.is_empty() {
                dirt.push(format!("sub {}: uncommitted changes", sub.path));
            }
            if workdir.rebase_in_progress {
                dirt.push(format!("sub {}: rebase in progress", sub.path));
            }
            if let Some(kind) = workdir.sequencer {
                dirt.push(format!("sub {}: {} in progress", sub.path, kind.command()));
            }
        }
    }
    if dirt.is_empty() {
        Ok(())
    } else {
        Err(Error::dirty(format!(
            "working copy is not clean:\n  {}",
            dirt.join("\n  ")
        )))
    }
}

fn short_code(kind: ChangeKind) -> char {
    match kind {
        ChangeKind::Added => 'A',
        ChangeKind::Modified => 'M',
        ChangeKind::Removed => 'D',
        ChangeKind::Renamed => 'R',
        ChangeKind::TypeChanged => 'T',
        ChangeKind::Conflicted => 'U',
    }
}

fn render_repo_lines(out: &mut String, status: &RepoStatus, indent: &str) {
    for change in &status.staged {
        if change.kind == ChangeKind::Conflicted {
            out.push_str(&format!("{indent}UU {}\n", change.path));
        } else if let Some(from) = &change.renamed_from {
            out.push_str(&format!(
                "{indent}{}  {} -> {}\n",
                short_code(change.kind),
                from,
                change.path
            ));
        } else {
            out.push_str(&format!(
                "{indent}{}  {}\n",
                short_code(change.kind),
                change.path
            ));
        }
    }
    for change in &status.workdir {
        if change.kind == ChangeKind::Added {
            out.push_str(&format!("{indent}?? {}\n", change.path));
        } else {
            out.push_str(&format!(
                "{indent} {} {}\n",
                short_code(change.kind),
                change.path
            ));
        }
    }
}

fn relation_suffix(relation: CommitRelation) -> Option<&'static str> {
    match relation {
        CommitRelation::Same => None,
        CommitRelation::Ahead => Some("ahead"),
        CommitRelation::Behind => Some("behind"),
        CommitRelation::Unrelated => Some("unrelated"),
        CommitRelation::Unknown => Some("unfetched"),
    }
}

/// `git status --short --branch`-style rendering with per-sub sections.
pub fn render(status: &MetaStatus) -> String {
    let mut out = String::new();
    let header = match (&status.branch, status.head) {
        (Some(branch), _) => format!("## {branch}"),
        (None, Some(oid)) => format!("## HEAD (detached {})", repo::short_oid(oid)),
        (None, None) => "## HEAD (no branch)".to_string(),
    };
    out.push_str(&header);
    if let Some(kind) = status.files.sequencer {
        out.push_str(&format!(" ({} in progress)", kind.command()));
    }
    out.push('\n');
    render_repo_lines(&mut out, &status.files, "");

    for sub in &status.subs {
        let dirty = sub
            .workdir
            .as_ref()
            .map(|w| !w.is_clean())
            .unwrap_or(false);
        let pin_changed = sub.index_pin != sub.commit_pin;
        if !dirty && !pin_changed && relation_suffix(sub.relation).is_none() {
            continue;
        }
        out.push_str(&format!("sub: {}", sub.path));
        if let Some(suffix) = relation_suffix(sub.relation) {
            out.push_str(&format!(" ({suffix})"));
        }
        if !sub.open {
            out.push_str(" [closed]");
        }
        out.push('\n');
        if let Some(workdir) = &sub.workdir {
            render_repo_lines(&mut out, workdir, "  ");
        }
    }
    out
}
