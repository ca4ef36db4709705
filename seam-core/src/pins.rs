//! Three-way classification of sub-repository pins. Merge and rebase both
//! reduce every sub difference to one of these resolutions before any sub
//! repository is touched.

use git2::{Oid, Repository};

use crate::error::Result;
use crate::repo;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinResolution {
    /// The merged pin value; `None` removes the sub.
    Take(Option<Oid>),
    /// Both sides moved; the sub needs its own three-way merge.
    NeedsMerge {
        base: Option<Oid>,
        ours: Oid,
        theirs: Oid,
    },
    /// Irreconcilable pin shapes (delete on one side, change on the other).
    Conflict(String),
}

fn known(repo: Option<&Repository>, oid: Oid) -> bool {
    repo.is_some_and(|r| r.find_commit(oid).is_ok())
}

fn is_descendant(repo: Option<&Repository>, commit: Oid, ancestor: Oid) -> Result<bool> {
    match repo {
        Some(repo) if known(Some(repo), commit) && known(Some(repo), ancestor) => {
            repo::descendant_of(repo, commit, ancestor)
        }
        _ => Ok(false),
    }
}

/// Classify one sub's pins across a three-way operation. `sub_repo`, when
/// available, sharpens the answer with ancestry queries; without it the
/// classification stays conservative and defers to a sub merge.
pub fn classify(
    sub_repo: Option<&Repository>,
    path: &str,
    base: Option<Oid>,
    ours: Option<Oid>,
    theirs: Option<Oid>,
) -> Result<PinResolution> {
    if ours == theirs {
        return Ok(PinResolution::Take(ours));
    }
    if base == ours {
        // only their side moved; resist moving backwards when ours already
        // contains their pin
        if let (Some(o), Some(t)) = (ours, theirs)
            && is_descendant(sub_repo, o, t)?
        {
            return Ok(PinResolution::Take(Some(o)));
        }
        return Ok(PinResolution::Take(theirs));
    }
    if base == theirs {
        return Ok(PinResolution::Take(ours));
    }

    match (ours, theirs) {
        (Some(o), Some(t)) => {
            if is_descendant(sub_repo, t, o)? {
                return Ok(PinResolution::Take(Some(t)));
            }
            if is_descendant(sub_repo, o, t)? {
                return Ok(PinResolution::Take(Some(o)));
            }
            Ok(PinResolution::NeedsMerge {
                base,
                ours: o,
                theirs: t,
            })
        }
        // base differs from both and one side dropped the sub entirely
        _ => Ok(PinResolution::Conflict(format!(
            "sub-repository `{path}` was removed on one side and changed on the other"
        ))),
    }
}
