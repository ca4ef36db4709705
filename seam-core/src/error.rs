use thiserror::Error;

/// Engine-wide error taxonomy. Every public operation returns one of these;
/// the CLI maps each variant to a stable exit code so front-ends can tell
/// outcomes apart without parsing messages.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid arguments or mutually exclusive flags.
    #[error("{0}")]
    Usage(String),

    /// Preconditions not met: staged, workdir, or sub-repository changes.
    #[error("{0}")]
    Dirty(String),

    /// A commit-ish could not be resolved.
    #[error("cannot resolve `{0}`")]
    NotFound(String),

    /// Merge/rebase operands share no common ancestor.
    #[error("no merge base between {ours} and {theirs}")]
    NoMergeBase { ours: String, theirs: String },

    /// A three-way merge produced textual or sub-repository conflicts.
    /// The sequencer is on disk; the operation is resumable.
    #[error("{0}")]
    Conflict(String),

    /// A sub-repository would have to be opened but policy forbids it.
    #[error("sub-repository `{0}` must be opened to complete this operation")]
    SubUnresolved(String),

    /// The storage engine could not retrieve a required commit.
    #[error("fetch failed: {0}")]
    FetchFailed(String),

    /// A destitched path maps to no registered sub-repository.
    #[error("path `{0}` does not belong to any sub-repository")]
    NotInSubmodule(String),

    /// Low-level storage engine failure.
    #[error(transparent)]
    Git(#[from] git2::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Invariant violation. Always a bug.
    #[error("internal: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn usage(msg: impl Into<String>) -> Self {
        Error::Usage(msg.into())
    }

    pub fn dirty(msg: impl Into<String>) -> Self {
        Error::Dirty(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Distinct, stable process exit code for this error kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Usage(_) => 2,
            Error::Dirty(_) => 3,
            Error::NotFound(_) => 4,
            Error::NoMergeBase { .. } => 5,
            Error::Conflict(_) => 6,
            Error::SubUnresolved(_) => 7,
            Error::FetchFailed(_) => 8,
            Error::Git(_) | Error::Io(_) => 9,
            Error::Internal(_) => 10,
            Error::NotInSubmodule(_) => 11,
        }
    }

    /// User errors get a one-line diagnostic; bugs get the full chain.
    pub fn is_user_error(&self) -> bool {
        !matches!(self, Error::Git(_) | Error::Io(_) | Error::Internal(_))
    }

    /// Whether a sequencer remains on disk and `continue`/`abort` apply.
    pub fn is_resumable(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }
}
