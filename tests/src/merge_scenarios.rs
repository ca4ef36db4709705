use std::path::Path;

use seam_core::merge::{self, MergeMode, MergeOutcome, MergeRequest, OpenPolicy};
use seam_core::pool::Pool;
use seam_core::sequencer::{Sequencer, SequencerKind};
use seam_core::{repo, Error};

use crate::fixtures::*;

fn request(target: &str, message: &str) -> MergeRequest {
    MergeRequest {
        target: target.into(),
        mode: MergeMode::Normal,
        message: Some(message.into()),
        open_policy: OpenPolicy::AllowOpen,
    }
}

fn pool() -> Pool {
    Pool::new(4)
}

#[tokio::test]
async fn fast_forward_merge_meta_only() {
    let world = MetaWorld::new(&[]);
    let repo = world.meta_repo();
    let a = world.seed_meta(&[], "A");
    write_file(&repo, "f.txt", "b\n");
    let b = world.commit_meta(&["f.txt"], &[], "B");
    branch_at(&repo, "feature", b);
    // rewind the current branch to A
    let branch = repo.head().unwrap().name().unwrap().to_string();
    repo.reference(&branch, a, true, "rewind").unwrap();
    checkout_branch(&repo, branch.rsplit('/').next().unwrap());

    let meta = world.meta();
    let outcome = merge::merge(&meta, &request("feature", "unused"), &pool())
        .await
        .unwrap();
    assert_eq!(outcome, MergeOutcome::FastForwarded(b));
    assert_eq!(meta.head_commit().unwrap().id(), b, "no new commit");
    assert_eq!(read_file(&world.meta_repo(), "f.txt"), "b\n");
}

#[tokio::test]
async fn merge_is_a_noop_when_already_up_to_date() {
    let world = MetaWorld::new(&[]);
    let repo = world.meta_repo();
    let a = world.seed_meta(&[], "A");
    write_file(&repo, "f.txt", "b\n");
    let b = world.commit_meta(&["f.txt"], &[], "B");

    let meta = world.meta();
    let outcome = merge::merge(&meta, &request(&a.to_string(), "unused"), &pool())
        .await
        .unwrap();
    assert_eq!(outcome, MergeOutcome::UpToDate);
    assert_eq!(meta.head_commit().unwrap().id(), b, "head untouched");
}

#[tokio::test]
async fn ff_only_rejects_divergent_histories() {
    let world = MetaWorld::new(&[]);
    let repo = world.meta_repo();
    let a = world.seed_meta(&[], "A");
    write_file(&repo, "ours.txt", "o\n");
    world.commit_meta(&["ours.txt"], &[], "ours");
    branch_at(&repo, "other", a);
    checkout_branch(&repo, "other");
    write_file(&repo, "theirs.txt", "t\n");
    world.commit_meta(&["theirs.txt"], &[], "theirs");
    checkout_branch(&repo, "master");

    let meta = world.meta();
    let mut req = request("other", "m");
    req.mode = MergeMode::FfOnly;
    let err = merge::merge(&meta, &req, &pool()).await.unwrap_err();
    assert!(matches!(err, Error::Usage(_)), "{err:?}");
}

/// Sub diverged but trivially fast-forwardable: the merge accepts the newer
/// pin without opening anything, and an open sub moves with it.
#[tokio::test]
async fn three_way_merge_with_ff_able_sub() {
    let world = MetaWorld::new(&["s"]);
    let sub = world.upstream("s");
    write_file(&sub, "lib.rs", "v1\n");
    let s1 = commit_all(&sub, "s1");
    write_file(&sub, "lib.rs", "v2\n");
    let s2 = commit_all(&sub, "s2");

    let repo = world.meta_repo();
    let m_base = world.seed_meta(&[("s", s1)], "meta base");
    write_file(&repo, "meta.txt", "ours\n");
    let m1 = world.commit_meta(&["meta.txt"], &[], "M1");
    branch_at(&repo, "other", m_base);
    checkout_branch(&repo, "other");
    let m2 = world.commit_meta(&[], &[("s", s2)], "M2: bump sub");
    checkout_branch(&repo, "master");

    world.open_sub("s");

    let meta = world.meta();
    let outcome = merge::merge(&meta, &request("other", "merge other"), &pool())
        .await
        .unwrap();
    let MergeOutcome::Committed(m3) = outcome else {
        panic!("expected a merge commit, got {outcome:?}");
    };

    let commit = repo.find_commit(m3).unwrap();
    assert_eq!(commit.parent_id(0).unwrap(), m1);
    assert_eq!(commit.parent_id(1).unwrap(), m2);
    let tree = commit.tree().unwrap();
    let entry = tree.get_path(Path::new("s")).unwrap();
    assert_eq!(entry.id(), s2, "pin must land on the descendant");

    let sub_wd = world.sub_workdir_repo("s");
    assert_eq!(sub_wd.head().unwrap().target(), Some(s2));
    assert_eq!(read_file(&sub_wd, "lib.rs"), "v2\n");
}

/// Both sides moved the sub: the sub gets its own merge commit with parents
/// [ours, theirs], and the meta commit pins it.
#[tokio::test]
async fn three_way_merge_with_real_sub_merge() {
    let world = MetaWorld::new(&["s"]);
    let sub = world.upstream("s");
    write_file(&sub, "base.rs", "base\n");
    let sb = commit_all(&sub, "sub base");
    write_file(&sub, "ours.rs", "ours\n");
    let s1 = commit_all(&sub, "sub ours");
    branch_at(&sub, "feature", sb);
    checkout_branch(&sub, "feature");
    write_file(&sub, "theirs.rs", "theirs\n");
    let s2 = commit_all(&sub, "sub theirs");
    checkout_branch(&sub, "master");

    let repo = world.meta_repo();
    let m_base = world.seed_meta(&[("s", sb)], "meta base");
    let m1 = world.commit_meta(&[], &[("s", s1)], "M1: ours");
    branch_at(&repo, "other", m_base);
    checkout_branch(&repo, "other");
    let m2 = world.commit_meta(&[], &[("s", s2)], "M2: theirs");
    checkout_branch(&repo, "master");

    world.open_sub("s");

    let meta = world.meta();
    let outcome = merge::merge(&meta, &request("other", "merge other"), &pool())
        .await
        .unwrap();
    let MergeOutcome::Committed(m3) = outcome else {
        panic!("expected a merge commit, got {outcome:?}");
    };

    let commit = repo.find_commit(m3).unwrap();
    assert_eq!(commit.parent_id(0).unwrap(), m1);
    assert_eq!(commit.parent_id(1).unwrap(), m2);

    let s3 = repo::gitlink_at(&commit.tree().unwrap(), "s").expect("pin present");
    assert!(s3 != s1 && s3 != s2, "a new sub commit must be created");

    let sub_wd = world.sub_workdir_repo("s");
    let sub_commit = sub_wd.find_commit(s3).unwrap();
    assert_eq!(sub_commit.parent_id(0).unwrap(), s1, "first parent = ours");
    assert_eq!(sub_commit.parent_id(1).unwrap(), s2, "second parent = theirs");
    assert_eq!(sub_wd.head().unwrap().target(), Some(s3));
    assert!(sub_wd.workdir().unwrap().join("ours.rs").exists());
    assert!(sub_wd.workdir().unwrap().join("theirs.rs").exists());

    // no sequencer survives a clean merge
    assert!(!Sequencer::exists(&world.meta_state_dir()));
}

/// Textual conflict inside the sub: the merge stops resumable, and
/// `continue` finalises both commits after resolution.
#[tokio::test]
async fn sub_conflict_stops_then_continue_finalises() {
    let world = MetaWorld::new(&["s"]);
    let sub = world.upstream("s");
    write_file(&sub, "file.txt", "base\n");
    let sb = commit_all(&sub, "sub base");
    write_file(&sub, "file.txt", "ours\n");
    let s1 = commit_all(&sub, "sub ours");
    branch_at(&sub, "feature", sb);
    checkout_branch(&sub, "feature");
    write_file(&sub, "file.txt", "theirs\n");
    let s2 = commit_all(&sub, "sub theirs");
    checkout_branch(&sub, "master");

    let repo = world.meta_repo();
    let m_base = world.seed_meta(&[("s", sb)], "meta base");
    let m1 = world.commit_meta(&[], &[("s", s1)], "M1");
    branch_at(&repo, "other", m_base);
    checkout_branch(&repo, "other");
    let m2 = world.commit_meta(&[], &[("s", s2)], "M2");
    checkout_branch(&repo, "master");

    world.open_sub("s");

    let meta = world.meta();
    let err = merge::merge(&meta, &request("other", "merge other"), &pool())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)), "{err:?}");

    // meta sequencer captures the operation
    let seq = Sequencer::load(&world.meta_state_dir()).unwrap().unwrap();
    assert_eq!(seq.kind, SequencerKind::Merge);
    assert_eq!(seq.original_head.oid, m1);
    assert_eq!(seq.target.oid, m2);

    // the sub carries its own sequencer and materialised markers
    let sub_wd = world.sub_workdir_repo("s");
    let sub_state = sub_wd.path().join("seam");
    let sub_seq = Sequencer::load(&sub_state).unwrap().unwrap();
    assert_eq!(sub_seq.kind, SequencerKind::Merge);
    assert_eq!(sub_seq.original_head.oid, s1);
    assert_eq!(sub_seq.target.oid, s2);
    let text = read_file(&sub_wd, "file.txt");
    assert!(text.contains("<<<<<<<"), "{text}");

    // no meta commit yet
    assert_eq!(meta.head_commit().unwrap().id(), m1);

    // resolve inside the sub and stage
    write_file(&sub_wd, "file.txt", "resolved\n");
    let mut idx = sub_wd.index().unwrap();
    idx.add_path(Path::new("file.txt")).unwrap();
    idx.write().unwrap();

    let outcome = merge::merge_continue(&meta).await.unwrap();
    let MergeOutcome::Committed(m3) = outcome else {
        panic!("expected a merge commit, got {outcome:?}");
    };
    let commit = repo.find_commit(m3).unwrap();
    assert_eq!(commit.parent_id(0).unwrap(), m1);
    assert_eq!(commit.parent_id(1).unwrap(), m2);

    let s3 = repo::gitlink_at(&commit.tree().unwrap(), "s").unwrap();
    let sub_commit = sub_wd.find_commit(s3).unwrap();
    assert_eq!(sub_commit.parent_id(0).unwrap(), s1);
    assert_eq!(sub_commit.parent_id(1).unwrap(), s2);
    assert_eq!(read_file(&sub_wd, "file.txt"), "resolved\n");

    // both sequencers are gone; continue again is a usage error
    assert!(!Sequencer::exists(&world.meta_state_dir()));
    assert!(!Sequencer::exists(&sub_state));
    let err = merge::merge_continue(&meta).await.unwrap_err();
    assert!(matches!(err, Error::Usage(_)), "{err:?}");
    assert_eq!(meta.head_commit().unwrap().id(), m3, "idempotent");
}

#[tokio::test]
async fn abort_restores_sub_heads_and_clears_state() {
    let world = MetaWorld::new(&["s"]);
    let sub = world.upstream("s");
    write_file(&sub, "file.txt", "base\n");
    let sb = commit_all(&sub, "sub base");
    write_file(&sub, "file.txt", "ours\n");
    let s1 = commit_all(&sub, "sub ours");
    branch_at(&sub, "feature", sb);
    checkout_branch(&sub, "feature");
    write_file(&sub, "file.txt", "theirs\n");
    let s2 = commit_all(&sub, "sub theirs");
    checkout_branch(&sub, "master");

    let repo = world.meta_repo();
    let m_base = world.seed_meta(&[("s", sb)], "meta base");
    let m1 = world.commit_meta(&[], &[("s", s1)], "M1");
    branch_at(&repo, "other", m_base);
    checkout_branch(&repo, "other");
    let _m2 = world.commit_meta(&[], &[("s", s2)], "M2");
    checkout_branch(&repo, "master");

    world.open_sub("s");

    let meta = world.meta();
    merge::merge(&meta, &request("other", "merge other"), &pool())
        .await
        .unwrap_err();

    merge::merge_abort(&meta).unwrap();

    let sub_wd = world.sub_workdir_repo("s");
    assert_eq!(
        sub_wd.head().unwrap().target(),
        Some(s1),
        "sub restored to its original head"
    );
    assert_eq!(read_file(&sub_wd, "file.txt"), "ours\n");
    assert!(!sub_wd.index().unwrap().has_conflicts());
    assert!(!Sequencer::exists(&world.meta_state_dir()));
    assert!(!Sequencer::exists(&sub_wd.path().join("seam")));
    assert!(!meta.repo().index().unwrap().has_conflicts());
    assert_eq!(meta.head_commit().unwrap().id(), m1);
}

/// Criss-cross history: two merge bases. The engine takes the storage
/// engine's first candidate and still produces parents [head, target].
#[tokio::test]
async fn multiple_merge_bases_resolve_deterministically() {
    let world = MetaWorld::new(&[]);
    let repo = world.meta_repo();
    let a = world.seed_meta(&[], "A");
    write_file(&repo, "b1.txt", "b1\n");
    let b1 = world.commit_meta(&["b1.txt"], &[], "B1");
    branch_at(&repo, "two", a);
    checkout_branch(&repo, "two");
    write_file(&repo, "b2.txt", "b2\n");
    let b2 = world.commit_meta(&["b2.txt"], &[], "B2");

    // criss-cross merge commits on both branches
    let union_tree = {
        let mut merged = repo
            .merge_commits(
                &repo.find_commit(b1).unwrap(),
                &repo.find_commit(b2).unwrap(),
                None,
            )
            .unwrap();
        assert!(!merged.has_conflicts());
        repo.find_tree(merged.write_tree_to(&repo).unwrap()).unwrap()
    };
    let sig = git2::Signature::now("Tester", "tester@example.com").unwrap();
    let c2 = repo
        .commit(
            Some("refs/heads/two"),
            &sig,
            &sig,
            "C2",
            &union_tree,
            &[&repo.find_commit(b2).unwrap(), &repo.find_commit(b1).unwrap()],
        )
        .unwrap();
    checkout_branch(&repo, "master");
    let c1 = repo
        .commit(
            Some("refs/heads/master"),
            &sig,
            &sig,
            "C1",
            &union_tree,
            &[&repo.find_commit(b1).unwrap(), &repo.find_commit(b2).unwrap()],
        )
        .unwrap();
    checkout_branch(&repo, "master");

    let meta = world.meta();
    let outcome = merge::merge(&meta, &request("two", "criss-cross"), &pool())
        .await
        .unwrap();
    let MergeOutcome::Committed(m) = outcome else {
        panic!("expected a merge commit, got {outcome:?}");
    };
    let commit = repo.find_commit(m).unwrap();
    assert_eq!(commit.parent_id(0).unwrap(), c1);
    assert_eq!(commit.parent_id(1).unwrap(), c2);
}

#[tokio::test]
async fn unrelated_histories_fail_with_no_merge_base() {
    let world = MetaWorld::new(&[]);
    let repo = world.meta_repo();
    world.seed_meta(&[], "A");

    // an orphan commit with no relation to HEAD
    let sig = git2::Signature::now("Tester", "tester@example.com").unwrap();
    let tree_id = {
        let mut builder = repo.treebuilder(None).unwrap();
        let blob = repo.blob(b"orphan\n").unwrap();
        builder.insert("orphan.txt", blob, 0o100644).unwrap();
        builder.write().unwrap()
    };
    let orphan = repo
        .commit(None, &sig, &sig, "orphan", &repo.find_tree(tree_id).unwrap(), &[])
        .unwrap();

    let meta = world.meta();
    let err = merge::merge(&meta, &request(&orphan.to_string(), "m"), &pool())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoMergeBase { .. }), "{err:?}");
}

#[tokio::test]
async fn dirty_meta_blocks_merge() {
    let world = MetaWorld::new(&[]);
    let repo = world.meta_repo();
    let a = world.seed_meta(&[], "A");
    write_file(&repo, "f.txt", "b\n");
    let b = world.commit_meta(&["f.txt"], &[], "B");
    branch_at(&repo, "feature", b);
    let branch = repo.head().unwrap().name().unwrap().to_string();
    repo.reference(&branch, a, true, "rewind").unwrap();
    checkout_branch(&repo, "master");

    write_file(&repo, "dirty.txt", "x\n");
    let mut idx = repo.index().unwrap();
    idx.add_path(Path::new("dirty.txt")).unwrap();
    idx.write().unwrap();

    let meta = world.meta();
    let err = merge::merge(&meta, &request("feature", "m"), &pool())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Dirty(_)), "{err:?}");
}

#[tokio::test]
async fn forbid_policy_surfaces_sub_unresolved() {
    let world = MetaWorld::new(&["s"]);
    let sub = world.upstream("s");
    write_file(&sub, "file.txt", "base\n");
    let sb = commit_all(&sub, "sub base");
    write_file(&sub, "a.txt", "a\n");
    let s1 = commit_all(&sub, "sub ours");
    branch_at(&sub, "feature", sb);
    checkout_branch(&sub, "feature");
    write_file(&sub, "b.txt", "b\n");
    let s2 = commit_all(&sub, "sub theirs");
    checkout_branch(&sub, "master");

    let repo = world.meta_repo();
    let m_base = world.seed_meta(&[("s", sb)], "meta base");
    world.commit_meta(&[], &[("s", s1)], "M1");
    branch_at(&repo, "other", m_base);
    checkout_branch(&repo, "other");
    world.commit_meta(&[], &[("s", s2)], "M2");
    checkout_branch(&repo, "master");

    // sub stays closed and the policy refuses to open it
    let meta = world.meta();
    let mut req = request("other", "m");
    req.open_policy = OpenPolicy::Forbid;
    let err = merge::merge(&meta, &req, &pool()).await.unwrap_err();
    match err {
        Error::SubUnresolved(path) => assert_eq!(path, "s"),
        other => panic!("expected SUB_UNRESOLVED, got {other:?}"),
    }
}

#[tokio::test]
async fn merge_without_message_is_a_usage_error() {
    let world = MetaWorld::new(&[]);
    let repo = world.meta_repo();
    let a = world.seed_meta(&[], "A");
    write_file(&repo, "ours.txt", "o\n");
    world.commit_meta(&["ours.txt"], &[], "ours");
    branch_at(&repo, "other", a);
    checkout_branch(&repo, "other");
    write_file(&repo, "theirs.txt", "t\n");
    world.commit_meta(&["theirs.txt"], &[], "theirs");
    checkout_branch(&repo, "master");

    let meta = world.meta();
    let req = MergeRequest {
        target: "other".into(),
        mode: MergeMode::Normal,
        message: None,
        open_policy: OpenPolicy::AllowOpen,
    };
    let err = merge::merge(&meta, &req, &pool()).await.unwrap_err();
    assert!(matches!(err, Error::Usage(_)), "{err:?}");
}
