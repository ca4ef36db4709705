use std::path::Path;

use seam_core::status::{self, CommitRelation, StatusQuery, UntrackedPolicy};
use seam_core::Error;

use crate::fixtures::*;

#[test]
fn closed_sub_reports_same_relation_and_no_workdir() {
    let world = MetaWorld::new(&["s"]);
    let sub_up = world.upstream("s");
    write_file(&sub_up, "lib.rs", "mod lib;\n");
    let s1 = commit_all(&sub_up, "sub base");
    world.seed_meta(&[("s", s1)], "meta base");

    let meta = world.meta();
    let snapshot = status::meta_status(&meta, &StatusQuery::default()).unwrap();
    assert_eq!(snapshot.subs.len(), 1);
    let sub = &snapshot.subs[0];
    assert_eq!(sub.path, "s");
    assert!(!sub.open);
    assert!(sub.workdir.is_none());
    assert_eq!(sub.relation, CommitRelation::Same);
    status::ensure_clean(&snapshot).unwrap();
}

#[test]
fn staged_pin_change_is_dirty_and_unknown_while_closed() {
    let world = MetaWorld::new(&["s"]);
    let sub_up = world.upstream("s");
    write_file(&sub_up, "lib.rs", "v1\n");
    let s1 = commit_all(&sub_up, "s1");
    write_file(&sub_up, "lib.rs", "v2\n");
    let s2 = commit_all(&sub_up, "s2");
    world.seed_meta(&[("s", s1)], "meta base");

    // stage a pin move without committing
    let repo = world.meta_repo();
    let mut idx = repo.index().unwrap();
    idx.add(&gitlink_entry("s", s2)).unwrap();
    idx.write().unwrap();

    let meta = world.meta();
    let snapshot = status::meta_status(&meta, &StatusQuery::default()).unwrap();
    let sub = &snapshot.subs[0];
    assert_eq!(sub.commit_pin, Some(s1));
    assert_eq!(sub.index_pin, Some(s2));
    assert_eq!(
        sub.relation,
        CommitRelation::Unknown,
        "closed sub cannot answer ancestry"
    );
    let err = status::ensure_clean(&snapshot).unwrap_err();
    assert!(matches!(err, Error::Dirty(_)), "{err:?}");
}

#[test]
fn open_sub_relation_tracks_ancestry() {
    let world = MetaWorld::new(&["s"]);
    let sub_up = world.upstream("s");
    write_file(&sub_up, "lib.rs", "v1\n");
    let s1 = commit_all(&sub_up, "s1");
    write_file(&sub_up, "lib.rs", "v2\n");
    let s2 = commit_all(&sub_up, "s2");
    world.seed_meta(&[("s", s1)], "meta base");
    world.open_sub("s");

    // staged pin move to a descendant, sub open: AHEAD
    let repo = world.meta_repo();
    let mut idx = repo.index().unwrap();
    idx.add(&gitlink_entry("s", s2)).unwrap();
    idx.write().unwrap();

    let meta = world.meta();
    let snapshot = status::meta_status(&meta, &StatusQuery::default()).unwrap();
    assert_eq!(snapshot.subs[0].relation, CommitRelation::Ahead);
}

#[test]
fn dirty_open_sub_shows_in_meta_status_and_render() {
    let world = MetaWorld::new(&["s"]);
    let sub_up = world.upstream("s");
    write_file(&sub_up, "lib.rs", "mod lib;\n");
    let s1 = commit_all(&sub_up, "sub base");
    world.seed_meta(&[("s", s1)], "meta base");
    world.open_sub("s");

    let sub_wd = world.sub_workdir_repo("s");
    write_file(&sub_wd, "lib.rs", "changed\n");

    let meta = world.meta();
    let snapshot =
        status::meta_status(&meta, &StatusQuery::with_untracked(UntrackedPolicy::Normal)).unwrap();
    let sub = &snapshot.subs[0];
    let workdir = sub.workdir.as_ref().expect("open sub has workdir status");
    assert_eq!(workdir.workdir.len(), 1);
    assert_eq!(workdir.workdir[0].path, "lib.rs");

    let rendered = status::render(&snapshot);
    assert!(rendered.contains("sub: s"), "{rendered}");
    assert!(rendered.contains(" M lib.rs"), "{rendered}");

    let err = status::ensure_clean(&snapshot).unwrap_err();
    match err {
        Error::Dirty(msg) => assert!(msg.contains("sub s"), "{msg}"),
        other => panic!("expected DIRTY, got {other:?}"),
    }
}

#[test]
fn sub_directories_are_not_meta_files() {
    let world = MetaWorld::new(&["s"]);
    let sub_up = world.upstream("s");
    write_file(&sub_up, "lib.rs", "mod lib;\n");
    let s1 = commit_all(&sub_up, "sub base");
    world.seed_meta(&[("s", s1)], "meta base");
    world.open_sub("s");

    // dirt inside the sub must not surface as meta workdir entries
    let sub_wd = world.sub_workdir_repo("s");
    write_file(&sub_wd, "junk.rs", "x\n");

    let meta = world.meta();
    let snapshot =
        status::meta_status(&meta, &StatusQuery::with_untracked(UntrackedPolicy::All)).unwrap();
    assert!(
        snapshot.files.workdir.iter().all(|c| !c.path.starts_with("s/")),
        "meta bucket leaked sub paths: {:?}",
        snapshot.files.workdir
    );
}

#[test]
fn status_snapshot_serialises_to_json() {
    let world = MetaWorld::new(&["s"]);
    let sub_up = world.upstream("s");
    write_file(&sub_up, "lib.rs", "mod lib;\n");
    let s1 = commit_all(&sub_up, "sub base");
    world.seed_meta(&[("s", s1)], "meta base");

    let meta = world.meta();
    let snapshot = status::meta_status(&meta, &StatusQuery::default()).unwrap();
    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json["subs"][0]["path"], "s");
    assert_eq!(json["subs"][0]["commit_pin"], s1.to_string());
    assert_eq!(json["subs"][0]["relation"], "same");
}

#[test]
fn path_filters_restrict_subs_and_files() {
    let world = MetaWorld::new(&["s"]);
    let sub_up = world.upstream("s");
    write_file(&sub_up, "lib.rs", "mod lib;\n");
    let s1 = commit_all(&sub_up, "sub base");
    let repo = world.meta_repo();
    write_file(&repo, "docs/readme.md", "hi\n");
    let seed_files: &[&str] = &[".gitmodules", "docs/readme.md"];
    {
        write_file(&repo, ".gitmodules", &world.gitmodules());
        world.commit_meta(seed_files, &[("s", s1)], "meta base");
    }
    write_file(&repo, "docs/readme.md", "changed\n");
    write_file(&repo, "top.txt", "new\n");

    let meta = world.meta();
    let query = StatusQuery {
        paths: vec!["docs".into()],
        untracked: UntrackedPolicy::All,
        ..StatusQuery::default()
    };
    let snapshot = status::meta_status(&meta, &query).unwrap();
    let paths: Vec<&str> = snapshot
        .files
        .workdir
        .iter()
        .map(|c| c.path.as_str())
        .collect();
    assert_eq!(paths, vec!["docs/readme.md"]);
    assert!(snapshot.subs.is_empty(), "sub `s` is outside the filter");
}

#[test]
fn compare_workdir_to_base_skips_the_index() {
    let world = MetaWorld::new(&[]);
    let repo = world.meta_repo();
    world.seed_meta(&[], "base");
    write_file(&repo, "f.txt", "one\n");
    world.commit_meta(&["f.txt"], &[], "add f");

    // stage one content, put another in the workdir
    write_file(&repo, "f.txt", "staged\n");
    let mut idx = repo.index().unwrap();
    idx.add_path(Path::new("f.txt")).unwrap();
    idx.write().unwrap();
    write_file(&repo, "f.txt", "workdir\n");

    let meta = world.meta();
    let query = StatusQuery {
        workdir_to_base: true,
        ..StatusQuery::default()
    };
    let snapshot = status::meta_status(&meta, &query).unwrap();
    // workdir compared straight to HEAD: one modified entry regardless of
    // what the index says
    assert_eq!(snapshot.files.workdir.len(), 1);
    assert_eq!(snapshot.files.workdir[0].path, "f.txt");
}
