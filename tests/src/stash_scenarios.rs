use std::path::Path;

use seam_core::stash;
use seam_core::Error;

use crate::fixtures::*;

/// Staged meta change + untracked meta file + dirty open sub, captured and
/// restored byte for byte.
#[test]
fn stash_roundtrip_across_meta_and_sub() {
    let world = MetaWorld::new(&["s"]);
    let sub_up = world.upstream("s");
    write_file(&sub_up, "lib.rs", "mod lib;\n");
    let s1 = commit_all(&sub_up, "sub base");
    world.seed_meta(&[("s", s1)], "meta base");
    world.open_sub("s");

    let meta = world.meta();
    let repo = world.meta_repo();

    // meta: staged g=v, untracked f=u
    write_file(&repo, "g.txt", "v\n");
    let mut idx = repo.index().unwrap();
    idx.add_path(Path::new("g.txt")).unwrap();
    idx.write().unwrap();
    write_file(&repo, "f.txt", "u\n");

    // sub: tracked modification + untracked file
    let sub_wd = world.sub_workdir_repo("s");
    write_file(&sub_wd, "lib.rs", "mod lib; // edited\n");
    write_file(&sub_wd, "scratch.rs", "mod scratch;\n");

    stash::push(&meta, true, Some("wip")).unwrap();

    // everything scrubbed back to HEAD
    assert!(!repo.workdir().unwrap().join("g.txt").exists());
    assert!(!repo.workdir().unwrap().join("f.txt").exists());
    assert_eq!(read_file(&sub_wd, "lib.rs"), "mod lib;\n");
    assert!(!sub_wd.workdir().unwrap().join("scratch.rs").exists());
    assert_eq!(stash::list(&meta).unwrap().len(), 1);

    stash::pop(&meta, 0).unwrap();

    assert_eq!(read_file(&repo, "g.txt"), "v\n");
    assert_eq!(read_file(&repo, "f.txt"), "u\n");
    // staged/untracked split restored
    let idx = repo.index().unwrap();
    assert!(idx.get_path(Path::new("g.txt"), 0).is_some());
    assert!(idx.get_path(Path::new("f.txt"), 0).is_none());

    assert_eq!(read_file(&sub_wd, "lib.rs"), "mod lib; // edited\n");
    assert_eq!(read_file(&sub_wd, "scratch.rs"), "mod scratch;\n");

    assert!(stash::list(&meta).unwrap().is_empty(), "log drained by pop");
}

#[test]
fn stash_without_untracked_leaves_untracked_in_place() {
    let world = MetaWorld::new(&[]);
    let repo = world.meta_repo();
    world.seed_meta(&[], "base");

    write_file(&repo, "tracked.txt", "x\n");
    let mut idx = repo.index().unwrap();
    idx.add_path(Path::new("tracked.txt")).unwrap();
    idx.write().unwrap();
    write_file(&repo, "loose.txt", "keep me\n");

    let meta = world.meta();
    stash::push(&meta, false, None).unwrap();

    assert!(!repo.workdir().unwrap().join("tracked.txt").exists());
    assert_eq!(read_file(&repo, "loose.txt"), "keep me\n");
}

#[test]
fn apply_keeps_entry_and_pop_on_clean_head_works_after_moves() {
    let world = MetaWorld::new(&[]);
    let repo = world.meta_repo();
    world.seed_meta(&[], "base");
    write_file(&repo, "w.txt", "work\n");

    let meta = world.meta();
    stash::push(&meta, true, Some("carry")).unwrap();

    // unrelated clean commit in between
    write_file(&repo, "other.txt", "o\n");
    world.commit_meta(&["other.txt"], &[], "unrelated");

    stash::apply(&meta, 0, false).unwrap();
    assert_eq!(read_file(&repo, "w.txt"), "work\n");
    assert_eq!(stash::list(&meta).unwrap().len(), 1, "apply keeps the entry");

    // drop it explicitly
    stash::drop(&meta, 0).unwrap();
    assert!(stash::list(&meta).unwrap().is_empty());
}

#[test]
fn stash_with_nothing_to_save_is_a_usage_error() {
    let world = MetaWorld::new(&[]);
    world.seed_meta(&[], "base");
    let meta = world.meta();
    assert!(matches!(
        stash::push(&meta, true, None),
        Err(Error::Usage(_))
    ));
}
