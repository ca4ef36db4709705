//! Demand-driven retrieval of sub-repository commits. Higher-level engines
//! ask for "commit X in sub S"; the fetcher resolves the effective remote
//! URL once per meta-commit and pulls objects only when they are missing.

use git2::{Oid, Repository};
use tracing::debug;

use crate::error::{Error, Result};
use crate::registry::{Registry, resolve_url};
use crate::repo::{self, MetaRepo};

pub struct Fetcher<'m> {
    meta: &'m MetaRepo,
    /// Meta origin, resolved once; relative sub URLs are anchored here.
    origin: Option<String>,
}

impl<'m> Fetcher<'m> {
    pub fn new(meta: &'m MetaRepo) -> Self {
        let origin = meta.origin_url();
        Fetcher { meta, origin }
    }

    /// Effective remote URL for the sub at `path` in `registry`.
    pub fn effective_url(&self, registry: &Registry, path: &str) -> Result<String> {
        registry
            .effective_url(self.origin.as_deref(), path)
            .ok_or_else(|| Error::internal(format!("no registry entry for sub `{path}`")))
    }

    /// Make `oid` available in `sub_repo`, fetching from the sub's remote
    /// when the object store does not already have it.
    pub fn ensure_commit(
        &self,
        registry: &Registry,
        path: &str,
        sub_repo: &Repository,
        oid: Oid,
    ) -> Result<()> {
        if sub_repo.find_commit(oid).is_ok() {
            return Ok(());
        }
        let url = self.effective_url(registry, path)?;
        debug!(sub = path, %oid, %url, "sub commit missing locally, fetching");
        repo::fetch_commit(sub_repo, &url, oid)
    }

    /// Convenience for pins that may be absent (uninitialised subs).
    pub fn ensure_pin(
        &self,
        registry: &Registry,
        path: &str,
        sub_repo: &Repository,
        pin: Option<Oid>,
    ) -> Result<()> {
        match pin {
            Some(oid) => self.ensure_commit(registry, path, sub_repo, oid),
            None => Ok(()),
        }
    }

    pub fn meta(&self) -> &MetaRepo {
        self.meta
    }
}
