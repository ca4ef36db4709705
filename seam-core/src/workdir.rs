//! Working-directory lifecycle: opening and closing sub-repositories, and
//! meta-wide checkout/reset that keep opened subs on their pins.

use git2::build::CheckoutBuilder;
use git2::{Oid, Repository, ResetType};
use tracing::{debug, info, instrument};

use crate::error::{Error, Result};
use crate::fetcher::Fetcher;
use crate::rebase::{checkout_detached, map_checkout_dirty, move_head_to};
use crate::registry::Registry;
use crate::repo::{self, MetaRepo};
use crate::status::{self, BaseTree, StatusQuery, UntrackedPolicy};

/// Instantiate a closed sub-repository at `pin` (default: its recorded
/// pin). A sub with no pin opens with an unborn HEAD.
#[instrument(skip(meta))]
pub fn open_sub(meta: &MetaRepo, path: &str, pin: Option<Oid>) -> Result<Repository> {
    if meta.sub_is_open(path) {
        return meta.open_sub(path);
    }
    let head = meta.head_commit()?.id();
    let registry = Registry::from_commit(meta.repo(), head)?;
    let entry = registry
        .by_path(path)
        .ok_or_else(|| Error::NotFound(format!("sub-repository `{path}`")))?;
    let pin = pin.or(entry.pin);

    let workdir = meta.sub_workdir(path);
    std::fs::create_dir_all(&workdir)?;
    let sub = Repository::init(&workdir)?;

    let fetcher = Fetcher::new(meta);
    let url = fetcher.effective_url(&registry, path)?;
    if sub.find_remote("origin").is_err() {
        sub.remote("origin", &url)?;
    }

    if let Some(pin) = pin {
        // a bare cache built by an earlier policy-restricted merge may
        // already hold the commit
        let cache = meta.sub_cache_path(&entry.name)?;
        if sub.find_commit(pin).is_err() && cache.exists() {
            let cache_url = cache.display().to_string();
            repo::fetch_commit(&sub, &cache_url, pin).ok();
        }
        fetcher.ensure_commit(&registry, path, &sub, pin)?;
        checkout_detached(&sub, pin)?;
        info!(sub = path, %pin, "opened sub-repository");
    } else {
        info!(sub = path, "opened uninitialised sub-repository");
    }
    Ok(sub)
}

/// Remove an open sub-repository's working directory. Refuses while the sub
/// has uncommitted work, untracked files, or commits the meta tree does not
/// pin.
#[instrument(skip(meta))]
pub fn close_sub(meta: &MetaRepo, path: &str) -> Result<()> {
    if !meta.sub_is_open(path) {
        return Err(Error::usage(format!("sub-repository `{path}` is not open")));
    }
    let sub = meta.open_sub(path)?;
    let snapshot = status::repo_status(
        &sub,
        &StatusQuery {
            base: BaseTree::Head,
            paths: Vec::new(),
            workdir_to_base: false,
            untracked: UntrackedPolicy::All,
        },
    )?;
    if !snapshot.is_clean() {
        return Err(Error::dirty(format!(
            "sub-repository `{path}` has local changes; commit or discard them before closing"
        )));
    }

    let head = meta.head_commit()?.id();
    let registry = Registry::from_commit(meta.repo(), head)?;
    let recorded = registry.by_path(path).and_then(|e| e.pin);
    let sub_head = sub.head().ok().and_then(|h| h.target());
    if let Some(sub_head) = sub_head
        && recorded != Some(sub_head)
    {
        return Err(Error::dirty(format!(
            "sub-repository `{path}` is at {} but the meta tree pins {}; commit the pin first",
            repo::short_oid(sub_head),
            recorded.map(repo::short_oid).unwrap_or_else(|| "nothing".into())
        )));
    }

    drop(sub);
    std::fs::remove_dir_all(meta.sub_workdir(path))?;
    info!(sub = path, "closed sub-repository");
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct CheckoutRequest {
    pub target: String,
    /// Create this branch at the target before switching.
    pub new_branch: Option<String>,
    /// Set up upstream tracking when branching from a remote ref.
    pub track: bool,
    /// Discard local modifications instead of failing with `DIRTY`.
    pub force: bool,
}

/// Move meta HEAD to a branch or commit and bring every opened sub to the
/// pins of the new meta tree.
#[instrument(skip(meta, request), fields(target = %request.target))]
pub fn checkout(meta: &MetaRepo, request: &CheckoutRequest) -> Result<()> {
    let repo = meta.repo();
    let target = repo::require_commitish(repo, &request.target)?;

    if !request.force {
        let snapshot = status::meta_status(meta, &StatusQuery::default())?;
        status::ensure_clean(&snapshot)?;
    }

    let refname = if let Some(new_branch) = &request.new_branch {
        let commit = repo.find_commit(target)?;
        let branch = repo.branch(new_branch, &commit, false)?;
        if request.track
            && let Ok(remote_ref) = repo.find_reference(&format!("refs/remotes/{}", request.target))
            && remote_ref.is_remote()
        {
            let mut branch = branch;
            branch
                .set_upstream(Some(&request.target))
                .map_err(Error::from)?;
        }
        Some(format!("refs/heads/{new_branch}"))
    } else {
        repo.find_reference(&format!("refs/heads/{}", request.target))
            .ok()
            .and_then(|r| r.name().map(str::to_string))
    };

    let head = meta.head_commit()?.id();
    let object = repo.find_object(target, None)?;
    let mut cb = CheckoutBuilder::new();
    if request.force {
        cb.force();
    } else {
        cb.safe();
    }
    repo.checkout_tree(&object, Some(&mut cb))
        .map_err(|err| map_checkout_dirty(repo, err))?;
    match refname {
        Some(refname) => repo.set_head(&refname)?,
        None => repo.set_head_detached(target)?,
    }

    sync_subs_to_commit(meta, head, target, request.force)?;
    debug!(%target, "checkout complete");
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMode {
    Soft,
    Mixed,
    Hard,
}

/// Meta reset; `--hard` also resets every opened sub to the pins of the
/// target commit.
#[instrument(skip(meta))]
pub fn reset(meta: &MetaRepo, commitish: &str, mode: ResetMode) -> Result<()> {
    let repo = meta.repo();
    let target = repo::require_commitish(repo, commitish)?;
    let head = meta.head_commit()?.id();
    let object = repo.find_object(target, None)?;
    let kind = match mode {
        ResetMode::Soft => ResetType::Soft,
        ResetMode::Mixed => ResetType::Mixed,
        ResetMode::Hard => ResetType::Hard,
    };
    repo.reset(&object, kind, None)?;
    if mode == ResetMode::Hard {
        sync_subs_to_commit(meta, head, target, true)?;
    }
    Ok(())
}

/// Bring every opened sub to the pins recorded in `to`'s tree.
fn sync_subs_to_commit(meta: &MetaRepo, from: Oid, to: Oid, force: bool) -> Result<()> {
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
        // a forced sync still scrubs subs whose pin did not move
        if old_pin == new_pin && !force {
            continue;
        }
        let Some(new_pin) = new_pin else { continue };
        let sub = meta.open_sub(&entry.path)?;
        fetcher.ensure_commit(&registry, &entry.path, &sub, new_pin)?;
        if force {
            let object = sub.find_object(new_pin, None)?;
            sub.reset(&object, ResetType::Hard, None)?;
            if sub.head().ok().and_then(|h| h.target()) != Some(new_pin) {
                sub.set_head_detached(new_pin)?;
                let mut cb = CheckoutBuilder::new();
                cb.force();
                sub.checkout_head(Some(&mut cb))?;
            }
        } else {
            move_head_to(&sub, new_pin)?;
        }
    }
    Ok(())
}
