use std::path::Path;

use seam_core::pool::Pool;
use seam_core::rebase::{self, RebaseOutcome};
use seam_core::sequencer::{Sequencer, SequencerKind};
use seam_core::{repo, Error};

use crate::fixtures::*;

fn pool() -> Pool {
    Pool::new(4)
}

/// A step whose changes already exist on the target is skipped entirely;
/// only the genuinely new commit is replayed.
#[tokio::test]
async fn rebase_skips_empty_steps() {
    let world = MetaWorld::new(&[]);
    let repo = world.meta_repo();
    let a = world.seed_meta(&[], "A");
    write_file(&repo, "f.txt", "shared change\n");
    world.commit_meta(&["f.txt"], &[], "X: shared change");
    write_file(&repo, "g.txt", "unique\n");
    world.commit_meta(&["g.txt"], &[], "Y: unique change");

    branch_at(&repo, "target", a);
    checkout_branch(&repo, "target");
    write_file(&repo, "f.txt", "shared change\n");
    let b = world.commit_meta(&["f.txt"], &[], "B: same content, different commit");
    checkout_branch(&repo, "master");

    let meta = world.meta();
    let outcome = rebase::rebase(&meta, "target", pool()).await.unwrap();
    let RebaseOutcome::Completed { new_head, created } = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(created.len(), 1, "X must be dropped as an empty step");
    let only = repo.find_commit(created[0]).unwrap();
    assert_eq!(only.message().unwrap(), "Y: unique change");
    assert_eq!(only.parent_id(0).unwrap(), b);

    // branch reattached at the new head
    assert_eq!(repo.head().unwrap().name(), Some("refs/heads/master"));
    assert_eq!(repo.head().unwrap().target(), Some(new_head));
    assert!(!Sequencer::exists(&world.meta_state_dir()));
}

/// A meta commit that moved a sub pin replays by rebasing the sub commits
/// onto the upstream's pin.
#[tokio::test]
async fn rebase_replays_sub_pins() {
    let world = MetaWorld::new(&["s"]);
    let sub = world.upstream("s");
    write_file(&sub, "base.rs", "base\n");
    let sb = commit_all(&sub, "sub base");
    write_file(&sub, "ours.rs", "ours\n");
    let s_ours = commit_all(&sub, "sub ours");
    branch_at(&sub, "feature", sb);
    checkout_branch(&sub, "feature");
    write_file(&sub, "theirs.rs", "theirs\n");
    let s_theirs = commit_all(&sub, "sub theirs");
    checkout_branch(&sub, "master");

    let repo = world.meta_repo();
    let m_base = world.seed_meta(&[("s", sb)], "meta base");
    world.commit_meta(&[], &[("s", s_ours)], "M: our sub work");
    branch_at(&repo, "up", m_base);
    checkout_branch(&repo, "up");
    world.commit_meta(&[], &[("s", s_theirs)], "U: upstream sub work");
    checkout_branch(&repo, "master");

    world.open_sub("s");

    let meta = world.meta();
    let outcome = rebase::rebase(&meta, "up", pool()).await.unwrap();
    let RebaseOutcome::Completed { new_head, created } = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(created.len(), 1);

    let tree = repo::commit_tree(&repo, new_head).unwrap();
    let new_pin = repo::gitlink_at(&tree, "s").expect("pin present");
    assert!(new_pin != s_ours && new_pin != s_theirs);

    let sub_wd = world.sub_workdir_repo("s");
    let replayed = sub_wd.find_commit(new_pin).unwrap();
    assert_eq!(replayed.message().unwrap(), "sub ours");
    assert_eq!(replayed.parent_id(0).unwrap(), s_theirs, "rebased onto theirs");
    assert_eq!(sub_wd.head().unwrap().target(), Some(new_pin));
    assert!(sub_wd.workdir().unwrap().join("ours.rs").exists());
    assert!(sub_wd.workdir().unwrap().join("theirs.rs").exists());
}

#[tokio::test]
async fn rebase_conflict_in_sub_stops_and_continues() {
    let world = MetaWorld::new(&["s"]);
    let sub = world.upstream("s");
    write_file(&sub, "file.txt", "base\n");
    let sb = commit_all(&sub, "sub base");
    write_file(&sub, "file.txt", "ours\n");
    let s_ours = commit_all(&sub, "sub ours");
    branch_at(&sub, "feature", sb);
    checkout_branch(&sub, "feature");
    write_file(&sub, "file.txt", "theirs\n");
    let s_theirs = commit_all(&sub, "sub theirs");
    checkout_branch(&sub, "master");

    let repo = world.meta_repo();
    let m_base = world.seed_meta(&[("s", sb)], "meta base");
    let m_ours = world.commit_meta(&[], &[("s", s_ours)], "M: our sub work");
    branch_at(&repo, "up", m_base);
    checkout_branch(&repo, "up");
    world.commit_meta(&[], &[("s", s_theirs)], "U: upstream sub work");
    checkout_branch(&repo, "master");

    world.open_sub("s");

    let meta = world.meta();
    let err = rebase::rebase(&meta, "up", pool()).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)), "{err:?}");

    let seq = Sequencer::load(&world.meta_state_dir()).unwrap().unwrap();
    assert_eq!(seq.kind, SequencerKind::Rebase);
    assert_eq!(seq.original_head.oid, m_ours);

    let sub_wd = world.sub_workdir_repo("s");
    let sub_seq = Sequencer::load(&sub_wd.path().join("seam")).unwrap().unwrap();
    assert_eq!(sub_seq.kind, SequencerKind::Rebase);
    let text = read_file(&sub_wd, "file.txt");
    assert!(text.contains("<<<<<<<"), "{text}");

    // resolve in the sub and resume
    write_file(&sub_wd, "file.txt", "resolved\n");
    let mut idx = sub_wd.index().unwrap();
    idx.add_path(Path::new("file.txt")).unwrap();
    idx.write().unwrap();

    let outcome = rebase::rebase_continue(&meta, pool()).await.unwrap();
    let RebaseOutcome::Completed { new_head, .. } = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    let tree = repo::commit_tree(&repo, new_head).unwrap();
    let new_pin = repo::gitlink_at(&tree, "s").unwrap();
    assert_eq!(read_file(&sub_wd, "file.txt"), "resolved\n");
    assert_eq!(sub_wd.head().unwrap().target(), Some(new_pin));
    assert_eq!(repo.head().unwrap().name(), Some("refs/heads/master"));
    assert!(!Sequencer::exists(&world.meta_state_dir()));
    assert!(!Sequencer::exists(&sub_wd.path().join("seam")));
}

#[tokio::test]
async fn rebase_abort_restores_everything() {
    let world = MetaWorld::new(&["s"]);
    let sub = world.upstream("s");
    write_file(&sub, "file.txt", "base\n");
    let sb = commit_all(&sub, "sub base");
    write_file(&sub, "file.txt", "ours\n");
    let s_ours = commit_all(&sub, "sub ours");
    branch_at(&sub, "feature", sb);
    checkout_branch(&sub, "feature");
    write_file(&sub, "file.txt", "theirs\n");
    let s_theirs = commit_all(&sub, "sub theirs");
    checkout_branch(&sub, "master");

    let repo = world.meta_repo();
    let m_base = world.seed_meta(&[("s", sb)], "meta base");
    let m_ours = world.commit_meta(&[], &[("s", s_ours)], "M: our sub work");
    branch_at(&repo, "up", m_base);
    checkout_branch(&repo, "up");
    world.commit_meta(&[], &[("s", s_theirs)], "U: upstream");
    checkout_branch(&repo, "master");

    world.open_sub("s");

    let meta = world.meta();
    rebase::rebase(&meta, "up", pool()).await.unwrap_err();
    rebase::rebase_abort(&meta).unwrap();

    assert_eq!(repo.head().unwrap().name(), Some("refs/heads/master"));
    assert_eq!(repo.head().unwrap().target(), Some(m_ours));
    let sub_wd = world.sub_workdir_repo("s");
    assert_eq!(sub_wd.head().unwrap().target(), Some(s_ours));
    assert_eq!(read_file(&sub_wd, "file.txt"), "ours\n");
    assert!(!Sequencer::exists(&world.meta_state_dir()));
}

#[tokio::test]
async fn rebase_onto_descendant_fast_forwards() {
    let world = MetaWorld::new(&[]);
    let repo = world.meta_repo();
    let a = world.seed_meta(&[], "A");
    write_file(&repo, "f.txt", "b\n");
    let b = world.commit_meta(&["f.txt"], &[], "B");
    repo.reference("refs/heads/master", a, true, "rewind").unwrap();
    branch_at(&repo, "upstream", b);
    checkout_branch(&repo, "master");

    let meta = world.meta();
    let outcome = rebase::rebase(&meta, "upstream", pool()).await.unwrap();
    assert!(matches!(outcome, RebaseOutcome::FastForwarded(oid) if oid == b));
    assert_eq!(repo.head().unwrap().target(), Some(b));
}

#[tokio::test]
async fn rebase_onto_ancestor_is_up_to_date() {
    let world = MetaWorld::new(&[]);
    let repo = world.meta_repo();
    let a = world.seed_meta(&[], "A");
    write_file(&repo, "f.txt", "b\n");
    let b = world.commit_meta(&["f.txt"], &[], "B");

    let meta = world.meta();
    let outcome = rebase::rebase(&meta, &a.to_string(), pool()).await.unwrap();
    assert!(matches!(outcome, RebaseOutcome::UpToDate));
    assert_eq!(repo.head().unwrap().target(), Some(b), "nothing moved");
}

#[tokio::test]
async fn cherry_pick_applies_commits_onto_head() {
    use seam_core::cherry;

    let world = MetaWorld::new(&[]);
    let repo = world.meta_repo();
    let a = world.seed_meta(&[], "A");
    write_file(&repo, "picked.txt", "p\n");
    let picked = world.commit_meta(&["picked.txt"], &[], "picked change");
    repo.reference("refs/heads/master", a, true, "rewind").unwrap();
    checkout_branch(&repo, "master");

    let meta = world.meta();
    let outcome = cherry::cherry_pick(&meta, &[picked.to_string()], pool())
        .await
        .unwrap();
    assert_eq!(outcome.created.len(), 1);
    let new = repo.find_commit(outcome.created[0]).unwrap();
    assert_eq!(new.message().unwrap(), "picked change");
    assert_eq!(new.parent_id(0).unwrap(), a);
    // branch advanced in place
    assert_eq!(repo.head().unwrap().name(), Some("refs/heads/master"));
    assert_eq!(repo.head().unwrap().target(), Some(outcome.new_head));
    assert_eq!(read_file(&repo, "picked.txt"), "p\n");
}
