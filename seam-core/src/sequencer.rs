//! Persistent record of an in-progress merge/rebase/cherry-pick. One file in
//! the repository's private state area, written atomically; absence means no
//! operation is in progress.

use std::fs;
use std::path::{Path, PathBuf};

use git2::Oid;
use serde::Serialize;

use crate::error::{Error, Result};

pub const SEQUENCER_FILE: &str = "SEQUENCER";
pub const ORIG_SUB_HEADS_FILE: &str = "ORIG_SUB_HEADS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SequencerKind {
    Merge,
    Rebase,
    CherryPick,
}

impl SequencerKind {
    pub fn label(self) -> &'static str {
        match self {
            SequencerKind::Merge => "MERGE",
            SequencerKind::Rebase => "REBASE",
            SequencerKind::CherryPick => "CHERRY_PICK",
        }
    }

    fn parse(text: &str) -> Option<Self> {
        match text {
            "MERGE" => Some(SequencerKind::Merge),
            "REBASE" => Some(SequencerKind::Rebase),
            "CHERRY_PICK" => Some(SequencerKind::CherryPick),
            _ => None,
        }
    }

    /// The command a user resumes with, for diagnostics.
    pub fn command(self) -> &'static str {
        match self {
            SequencerKind::Merge => "merge",
            SequencerKind::Rebase => "rebase",
            SequencerKind::CherryPick => "cherry-pick",
        }
    }
}

/// A commit with the ref name it was reached through, when any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinnedRef {
    pub oid: Oid,
    pub refname: Option<String>,
}

impl PinnedRef {
    pub fn detached(oid: Oid) -> Self {
        PinnedRef { oid, refname: None }
    }

    fn render(&self) -> String {
        format!("{}:{}", self.oid, self.refname.as_deref().unwrap_or("-"))
    }

    fn parse(text: &str) -> Result<Self> {
        let (oid, refname) = text
            .split_once(':')
            .ok_or_else(|| Error::internal(format!("malformed sequencer ref `{text}`")))?;
        let oid = Oid::from_str(oid)
            .map_err(|_| Error::internal(format!("malformed sequencer oid `{oid}`")))?;
        let refname = match refname {
            "-" => None,
            name => Some(name.to_string()),
        };
        Ok(PinnedRef { oid, refname })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sequencer {
    pub kind: SequencerKind,
    pub original_head: PinnedRef,
    pub target: PinnedRef,
    pub commits: Vec<Oid>,
    pub current: usize,
    pub message: Option<String>,
}

fn escape_message(message: &str) -> String {
    message.replace('\\', "\\\\").replace('\n', "\\n")
}

fn unescape_message(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

impl Sequencer {
    pub fn new(kind: SequencerKind, original_head: PinnedRef, target: PinnedRef) -> Self {
        Sequencer {
            kind,
            original_head,
            target,
            commits: Vec::new(),
            current: 0,
            message: None,
        }
    }

    pub fn file_path(state_dir: &Path) -> PathBuf {
        state_dir.join(SEQUENCER_FILE)
    }

    pub fn exists(state_dir: &Path) -> bool {
        Self::file_path(state_dir).exists()
    }

    pub fn load(state_dir: &Path) -> Result<Option<Sequencer>> {
        let path = Self::file_path(state_dir);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Self::parse(&text).map(Some)
    }

    /// Atomic write: temp file in the same directory, then rename. Refuses
    /// to overwrite a sequencer of a different kind; two in-progress
    /// operations can never coexist.
    pub fn save(&self, state_dir: &Path) -> Result<()> {
        if let Some(existing) = Self::load(state_dir)?
            && existing.kind != self.kind
        {
            return Err(Error::internal(format!(
                "refusing to write {} sequencer over in-progress {}",
                self.kind.label(),
                existing.kind.label()
            )));
        }
        let path = Self::file_path(state_dir);
        let tmp = state_dir.join(format!("{SEQUENCER_FILE}.tmp"));
        fs::write(&tmp, self.render())?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn clear(state_dir: &Path) -> Result<()> {
        let path = Self::file_path(state_dir);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn render(&self) -> String {
        let mut out = String::new();
        if let Some(message) = &self.message {
            out.push_str("MESSAGE#");
            out.push_str(&escape_message(message));
            out.push('\n');
        }
        let commits = if self.commits.is_empty() {
            "-".to_string()
        } else {
            self.commits
                .iter()
                .map(Oid::to_string)
                .collect::<Vec<_>>()
                .join(",")
        };
        out.push_str(&format!(
            "{} {} {} {} {}\n",
            self.kind.label(),
            self.original_head.render(),
            self.target.render(),
            self.current,
            commits
        ));
        out
    }

    fn parse(text: &str) -> Result<Sequencer> {
        let mut lines = text.lines();
        let mut first = lines
            .next()
            .ok_or_else(|| Error::internal("empty sequencer file"))?;
        let message = match first.strip_prefix("MESSAGE#") {
            Some(escaped) => {
                let message = unescape_message(escaped);
                first = lines
                    .next()
                    .ok_or_else(|| Error::internal("sequencer file missing header"))?;
                Some(message)
            }
            None => None,
        };
        let fields: Vec<&str> = first.split(' ').collect();
        if fields.len() != 5 {
            return Err(Error::internal(format!(
                "malformed sequencer header `{first}`"
            )));
        }
        let kind = SequencerKind::parse(fields[0])
            .ok_or_else(|| Error::internal(format!("unknown sequencer kind `{}`", fields[0])))?;
        let original_head = PinnedRef::parse(fields[1])?;
        let target = PinnedRef::parse(fields[2])?;
        let current: usize = fields[3]
            .parse()
            .map_err(|_| Error::internal(format!("malformed sequencer index `{}`", fields[3])))?;
        let commits = if fields[4] == "-" {
            Vec::new()
        } else {
            fields[4]
                .split(',')
                .map(|hex| {
                    Oid::from_str(hex).map_err(|_| {
                        Error::internal(format!("malformed sequencer commit `{hex}`"))
                    })
                })
                .collect::<Result<Vec<_>>>()?
        };
        if !commits.is_empty() && current >= commits.len() {
            return Err(Error::internal(format!(
                "sequencer index {current} out of range for {} commits",
                commits.len()
            )));
        }
        Ok(Sequencer {
            kind,
            original_head,
            target,
            commits,
            current,
            message,
        })
    }
}

/// Original sub-repository heads recorded alongside a sequencer so `abort`
/// can restore every touched sub.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubHeads {
    pub entries: Vec<SubHead>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubHead {
    pub path: String,
    pub oid: Oid,
    pub refname: Option<String>,
}

impl SubHeads {
    pub fn file_path(state_dir: &Path) -> PathBuf {
        state_dir.join(ORIG_SUB_HEADS_FILE)
    }

    pub fn record(&mut self, path: &str, oid: Oid, refname: Option<String>) {
        if self.entries.iter().any(|e| e.path == path) {
            return;
        }
        self.entries.push(SubHead {
            path: path.to_string(),
            oid,
            refname,
        });
    }

    pub fn load(state_dir: &Path) -> Result<SubHeads> {
        let path = Self::file_path(state_dir);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(SubHeads::default());
            }
            Err(err) => return Err(err.into()),
        };
        let mut entries = Vec::new();
        for line in text.lines().filter(|l| !l.is_empty()) {
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() != 3 {
                return Err(Error::internal(format!("malformed sub-head line `{line}`")));
            }
            entries.push(SubHead {
                path: fields[0].to_string(),
                oid: Oid::from_str(fields[1])
                    .map_err(|_| Error::internal(format!("malformed sub-head oid `{line}`")))?,
                refname: match fields[2] {
                    "-" => None,
                    name => Some(name.to_string()),
                },
            });
        }
        Ok(SubHeads { entries })
    }

    pub fn save(&self, state_dir: &Path) -> Result<()> {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&format!(
                "{}\t{}\t{}\n",
                entry.path,
                entry.oid,
                entry.refname.as_deref().unwrap_or("-")
            ));
        }
        let tmp = state_dir.join(format!("{ORIG_SUB_HEADS_FILE}.tmp"));
        fs::write(&tmp, out)?;
        fs::rename(&tmp, Self::file_path(state_dir))?;
        Ok(())
    }

    pub fn clear(state_dir: &Path) -> Result<()> {
        match fs::remove_file(Self::file_path(state_dir)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
