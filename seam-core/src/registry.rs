//! Sub-repository registry: the mapping from a meta-commit to its named
//! sub-repositories, each a `(name, path, url)` triple in the registry file
//! plus a gitlink pin in the meta tree.

use git2::{Oid, Repository, Tree};

use crate::config::ConfigFile;
use crate::error::{Error, Result};
use crate::repo::{self, gitlink_at};

pub const REGISTRY_FILE: &str = ".gitmodules";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubEntry {
    pub name: String,
    pub path: String,
    pub url: String,
    /// Pinned commit; `None` for an uninitialised sub-repository (registered
    /// but never given a commit, or pinned to the zero id).
    pub pin: Option<Oid>,
}

/// Registry parsed from one meta-commit, entries in file order.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    entries: Vec<SubEntry>,
    file: ConfigFile,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubChangeKind {
    Added,
    Removed,
    UrlChanged { old: String, new: String },
    CommitChanged { old: Option<Oid>, new: Option<Oid> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubChange {
    pub name: String,
    pub path: String,
    pub kind: SubChangeKind,
}

/// Resolve a possibly-relative sub-repository URL against the meta
/// repository's origin. One leading `../` segment is stripped when a base is
/// known; everything else passes through verbatim.
pub fn resolve_url(base: Option<&str>, url: &str) -> String {
    let Some(rest) = url.strip_prefix("../") else {
        return url.to_string();
    };
    let Some(base) = base else {
        return url.to_string();
    };
    let trimmed = base.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => format!("{}/{}", &trimmed[..idx], rest),
        None => url.to_string(),
    }
}

impl Registry {
    pub fn from_commit(repo: &Repository, commit: Oid) -> Result<Registry> {
        let tree = repo::commit_tree(repo, commit)?;
        Registry::from_tree(repo, &tree)
    }

    pub fn from_tree(repo: &Repository, tree: &Tree<'_>) -> Result<Registry> {
        let Some(bytes) = repo::read_blob(repo, tree, REGISTRY_FILE)? else {
            return Ok(Registry::default());
        };
        let text = String::from_utf8_lossy(&bytes);
        let file = ConfigFile::parse(&text)?;

        let mut entries = Vec::new();
        for section in file.sections() {
            if section.name != "submodule" {
                continue;
            }
            let Some(name) = section.subsection.clone() else {
                continue;
            };
            let Some(path) = section.get("path").map(str::to_string) else {
                return Err(Error::internal(format!(
                    "registry entry `{name}` has no path"
                )));
            };
            let url = section.get("url").unwrap_or_default().to_string();
            let pin = gitlink_at(tree, &path).filter(|oid| !oid.is_zero());
            entries.push(SubEntry { name, path, url, pin });
        }
        Ok(Registry { entries, file })
    }

    pub fn entries(&self) -> &[SubEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn by_path(&self, path: &str) -> Option<&SubEntry> {
        self.entries.iter().find(|e| e.path == path)
    }

    pub fn by_name(&self, name: &str) -> Option<&SubEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// The sub-repository whose path is a slash-segment prefix of `file`, if
    /// any. Longest match wins so nested sub paths shadow their parents.
    pub fn owning_sub(&self, file: &str) -> Option<&SubEntry> {
        self.entries
            .iter()
            .filter(|e| {
                file == e.path
                    || (file.starts_with(&e.path) && file.as_bytes().get(e.path.len()) == Some(&b'/'))
            })
            .max_by_key(|e| e.path.len())
    }

    pub fn is_sub_path(&self, path: &str) -> bool {
        self.by_path(path).is_some()
    }

    /// Effective remote URL for one sub, resolved once against the meta
    /// origin.
    pub fn effective_url(&self, meta_origin: Option<&str>, path: &str) -> Option<String> {
        self.by_path(path)
            .map(|entry| resolve_url(meta_origin, &entry.url))
    }

    /// Re-serialise the registry file after mutating entries, preserving
    /// sections the engine does not understand.
    pub fn render_with(&self, updates: &[SubEntry], removals: &[String]) -> String {
        let mut file = self.file.clone();
        for name in removals {
            file.remove_section("submodule", Some(name));
        }
        for entry in updates {
            let section = file.section_mut("submodule", Some(&entry.name));
            section.set("path", &entry.path);
            section.set("url", &entry.url);
        }
        file.render()
    }

    /// Per-sub delta between two meta-commits, at most one kind per sub.
    pub fn changes(repo: &Repository, old: Oid, new: Oid) -> Result<Vec<SubChange>> {
        let old_reg = Registry::from_commit(repo, old)?;
        let new_reg = Registry::from_commit(repo, new)?;
        Ok(old_reg.diff(&new_reg))
    }

    pub fn diff(&self, new: &Registry) -> Vec<SubChange> {
        let mut changes = Vec::new();
        for entry in &self.entries {
            match new.by_name(&entry.name) {
                None => changes.push(SubChange {
                    name: entry.name.clone(),
                    path: entry.path.clone(),
                    kind: SubChangeKind::Removed,
                }),
                Some(other) if other.url != entry.url => changes.push(SubChange {
                    name: entry.name.clone(),
                    path: other.path.clone(),
                    kind: SubChangeKind::UrlChanged {
                        old: entry.url.clone(),
                        new: other.url.clone(),
                    },
                }),
                Some(other) if other.pin != entry.pin => changes.push(SubChange {
                    name: entry.name.clone(),
                    path: other.path.clone(),
                    kind: SubChangeKind::CommitChanged {
                        old: entry.pin,
                        new: other.pin,
                    },
                }),
                Some(_) => {}
            }
        }
        for entry in &new.entries {
            if self.by_name(&entry.name).is_none() {
                changes.push(SubChange {
                    name: entry.name.clone(),
                    path: entry.path.clone(),
                    kind: SubChangeKind::Added,
                });
            }
        }
        changes
    }
}
