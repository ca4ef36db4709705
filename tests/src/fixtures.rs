//! Shared fixture: a meta-repository plus sub-repository upstreams laid out
//! in one tempdir, with explicit staging helpers so every test controls its
//! pins exactly.

use std::path::{Path, PathBuf};

use git2::build::CheckoutBuilder;
use git2::{IndexAddOption, Oid, Repository, Signature};
use seam_core::MetaRepo;

pub fn init_repo(path: &Path) -> Repository {
    std::fs::create_dir_all(path).unwrap();
    let repo = Repository::init(path).unwrap();
    let _ = repo.config().and_then(|mut c| {
        c.set_str("user.name", "Tester")?;
        c.set_str("user.email", "tester@example.com")
    });
    // pin the unborn branch name so tests can assume `master` regardless of
    // host-level init.defaultBranch configuration
    repo.set_head("refs/heads/master").unwrap();
    repo
}

pub fn write_file(repo: &Repository, rel: &str, contents: &str) {
    let path = repo.workdir().unwrap().join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, contents).unwrap();
}

pub fn read_file(repo: &Repository, rel: &str) -> String {
    std::fs::read_to_string(repo.workdir().unwrap().join(rel)).unwrap()
}

fn sig() -> Signature<'static> {
    Signature::now("Tester", "tester@example.com").unwrap()
}

/// Stage everything (tracked + untracked + deletions) and commit.
pub fn commit_all(repo: &Repository, msg: &str) -> Oid {
    let mut idx = repo.index().unwrap();
    idx.add_all(["."], IndexAddOption::DEFAULT, None).unwrap();
    idx.update_all(["."], None).unwrap();
    idx.write().unwrap();
    let tree_id = idx.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let sig = sig();
    let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
    let parents: Vec<&git2::Commit> = parent.iter().collect();
    repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &parents)
        .unwrap()
}

pub fn branch_at(repo: &Repository, name: &str, oid: Oid) {
    let commit = repo.find_commit(oid).unwrap();
    repo.branch(name, &commit, true).unwrap();
}

pub fn checkout_branch(repo: &Repository, name: &str) {
    repo.set_head(&format!("refs/heads/{name}")).unwrap();
    let mut cb = CheckoutBuilder::new();
    repo.checkout_head(Some(&mut cb.force())).unwrap();
}

pub fn gitlink_entry(path: &str, oid: Oid) -> git2::IndexEntry {
    git2::IndexEntry {
        ctime: git2::IndexTime::new(0, 0),
        mtime: git2::IndexTime::new(0, 0),
        dev: 0,
        ino: 0,
        mode: 0o160000,
        uid: 0,
        gid: 0,
        file_size: 0,
        id: oid,
        flags: 0,
        flags_extended: 0,
        path: path.as_bytes().to_vec(),
    }
}

/// One tempdir holding the meta-repository at `meta/` and each sub upstream
/// at `<name>.git/` beside it.
pub struct MetaWorld {
    pub tempdir: tempfile::TempDir,
    sub_names: Vec<String>,
}

impl MetaWorld {
    /// Create the world: sub upstreams exist but have no commits yet; the
    /// meta has no commits either. Tests build history explicitly.
    pub fn new(sub_names: &[&str]) -> Self {
        let tempdir = tempfile::TempDir::new().unwrap();
        for name in sub_names {
            init_repo(&tempdir.path().join(format!("{name}.git")));
        }
        init_repo(&tempdir.path().join("meta"));
        MetaWorld {
            tempdir,
            sub_names: sub_names.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn upstream_path(&self, name: &str) -> PathBuf {
        self.tempdir.path().join(format!("{name}.git"))
    }

    pub fn upstream(&self, name: &str) -> Repository {
        Repository::open(self.upstream_path(name)).unwrap()
    }

    pub fn meta(&self) -> MetaRepo {
        MetaRepo::open(self.tempdir.path().join("meta")).unwrap()
    }

    pub fn meta_repo(&self) -> Repository {
        Repository::open(self.tempdir.path().join("meta")).unwrap()
    }

    /// The registry file text pointing every named sub at its upstream,
    /// path == name.
    pub fn gitmodules(&self) -> String {
        let mut out = String::new();
        for name in &self.sub_names {
            out.push_str(&format!(
                "[submodule \"{name}\"]\n\tpath = {name}\n\turl = {}\n",
                self.upstream_path(name).display()
            ));
        }
        out
    }

    /// Stage exactly `files` (from the meta workdir) and `pins`, then
    /// commit. Never uses add-all, so open sub directories cannot leak
    /// stray entries into meta trees.
    pub fn commit_meta(&self, files: &[&str], pins: &[(&str, Oid)], msg: &str) -> Oid {
        let repo = self.meta_repo();
        let mut index = repo.index().unwrap();
        for file in files {
            index.add_path(Path::new(file)).unwrap();
        }
        for (path, oid) in pins {
            index.add(&gitlink_entry(path, *oid)).unwrap();
        }
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = sig();
        let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &parents)
            .unwrap()
    }

    /// First meta commit: registry file plus the given pins.
    pub fn seed_meta(&self, pins: &[(&str, Oid)], msg: &str) -> Oid {
        let repo = self.meta_repo();
        write_file(&repo, ".gitmodules", &self.gitmodules());
        self.commit_meta(&[".gitmodules"], pins, msg)
    }

    pub fn open_sub(&self, path: &str) -> Repository {
        let meta = self.meta();
        seam_core::workdir::open_sub(&meta, path, None).unwrap()
    }

    pub fn sub_workdir_repo(&self, path: &str) -> Repository {
        Repository::open(self.tempdir.path().join("meta").join(path)).unwrap()
    }

    pub fn meta_state_dir(&self) -> PathBuf {
        self.tempdir.path().join("meta/.git/seam")
    }
}
