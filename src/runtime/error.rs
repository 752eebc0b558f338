//! Runtime errors.

use thiserror::Error;

use crate::build::BuildError;
use crate::translator::TranslatorError;

/// Failure to fetch one fact. Captured per need and handed back to the
/// translator as that need's answer.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("cannot read '{url}': {source}")]
    Io {
        url: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported url '{0}'")]
    UnsupportedUrl(String),

    #[error("no document at '{0}'")]
    NotFound(String),

    #[error("unknown connection '{0}'")]
    UnknownConnection(String),

    #[error("table '{0}' does not exist")]
    TableNotFound(String),

    #[error("no schema for SQL block: {0}")]
    SqlSchema(String),

    #[error("connection '{0}' cannot run queries")]
    RunUnsupported(String),
}

pub type FetchResult<T> = Result<T, FetchError>;

/// Fatal runtime failures. Problems in the documents are not errors; they
/// come back as [`super::CompileOutcome::Failed`].
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Translator(#[from] TranslatorError),

    /// The fetcher returned a batch without answering every need.
    #[error("needs left unanswered: {0}")]
    UnansweredNeeds(String),

    #[error(transparent)]
    Run(#[from] FetchError),

    #[error(transparent)]
    Build(#[from] BuildError),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
