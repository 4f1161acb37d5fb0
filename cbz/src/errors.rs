use std::{fmt::Display, io, path::PathBuf, result, time::Duration};

use zip::result::ZipError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Precondition failed: {0}")]
    Precondition(#[from] PreconditionError),

    #[error("Extraction failed: {0}")]
    Extract(#[from] ExtractError),

    #[error("Page filter failed: {0}")]
    Filter(#[from] FilterError),

    #[error("Shrink failed: {0}")]
    Shrink(#[from] ShrinkError),

    #[error("Archive write failed: {0}")]
    Write(#[from] WriteError),

    #[error("Workspace {path} could not be emptied")]
    WorkspaceIntegrity {
        path: PathBuf,
        #[source]
        source: Option<io::Error>,
    },

    #[error("Invalid source {path}: {reason}")]
    InvalidSource { path: PathBuf, reason: &'static str },

    #[error("Invalid pattern {0}")]
    Pattern(#[from] regex::Error),

    #[error("Walk error {0}")]
    Walk(#[from] walkdir::Error),

    #[error("IO error {0}")]
    IO(#[from] io::Error),
}

impl Error {
    /// Fatal errors mean the shared scratch area can't be trusted anymore,
    /// every other error only concerns the current file.
    #[must_use]
    pub fn severity(&self) -> Severity {
        match self {
            Self::WorkspaceIntegrity { .. } => Severity::Fatal,
            _ => Severity::Recoverable,
        }
    }

    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }

    /// The conversion stage this error comes from, if any
    #[must_use]
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Precondition(_) | Self::WorkspaceIntegrity { .. } => Some(Stage::Prepare),
            Self::Extract(_) => Some(Stage::Extract),
            Self::Filter(_) => Some(Stage::Filter),
            Self::Shrink(_) => Some(Stage::Shrink),
            Self::Write(_) => Some(Stage::Write),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Recoverable,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Prepare,
    Extract,
    Filter,
    Shrink,
    Write,
}

impl Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Prepare => "prepare",
                Self::Extract => "extract",
                Self::Filter => "filter",
                Self::Shrink => "shrink",
                Self::Write => "write",
            }
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PreconditionError {
    #[error("input {0} doesn't exist or is not a file")]
    MissingInput(PathBuf),

    #[error("output {0} already exists")]
    OutputExists(PathBuf),
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("corrupt zip archive (entry {entry:?}): {source}")]
    ZipCorrupt {
        entry: Option<String>,
        source: ZipError,
    },

    #[error("entry {0:?} would be extracted outside of the workspace")]
    UnsafeEntryPath(String),

    #[error("{program} failed ({status}): {output}")]
    UnpackFailed {
        program: String,
        status: String,
        output: String,
    },

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("IO error {0}")]
    IO(#[from] io::Error),
}

impl From<ZipError> for ExtractError {
    fn from(source: ZipError) -> Self {
        Self::ZipCorrupt {
            entry: None,
            source,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("couldn't remove excluded page {path}: {source}")]
    Remove { path: PathBuf, source: io::Error },
}

#[derive(Debug, thiserror::Error)]
pub enum ShrinkError {
    #[error("probe failed on {path}: {output}")]
    Probe { path: PathBuf, output: String },

    #[error("probe output couldn't be parsed: {0:?}")]
    ProbeParse(String),

    #[error("transform failed on {path}: {output}")]
    Transform { path: PathBuf, output: String },

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("couldn't clean up {path}: {source}")]
    Cleanup { path: PathBuf, source: io::Error },

    #[error("IO error {0}")]
    IO(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("output {0} already exists")]
    AlreadyExists(PathBuf),

    #[error("Zip error {0}")]
    Zip(#[from] ZipError),

    #[error("failed to add {name}: {source}")]
    Entry { name: String, source: io::Error },

    #[error("IO error {0}")]
    IO(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("couldn't run {program}: {source}")]
    Spawn { program: String, source: io::Error },

    #[error("{program} timed out after {after:?} and was killed")]
    TimedOut { program: String, after: Duration },

    #[error("failed waiting on {program}: {source}")]
    Wait { program: String, source: io::Error },
}

pub type Result<T, E = Error> = result::Result<T, E>;
