//! Compiler errors.

use thiserror::Error;

use crate::model::time::TimeError;
use crate::model::ShapeError;
use crate::sql::dialect::DialectError;

/// Errors raised while compiling a query to SQL.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error("unknown source '{0}'")]
    UnknownSource(String),

    #[error("unknown query '{0}'")]
    UnknownQuery(String),

    #[error("unknown dialect '{0}'")]
    UnknownDialect(String),

    #[error("'{0}' is not defined")]
    UnknownField(String),

    #[error("'{name}' is a {kind}, not a value")]
    NotAValue { name: String, kind: &'static str },

    #[error("no member of composite source '{0}' has every field the query uses")]
    NoCoveringSource(String),

    #[error("query has an empty pipeline")]
    EmptyPipeline,

    /// An expression that cannot appear where it was used. `code` is the
    /// source text it was written as, when known.
    #[error("{message}")]
    Invalid {
        message: String,
        code: Option<String>,
    },

    #[error(transparent)]
    Unsupported(#[from] DialectError),

    #[error(transparent)]
    Shape(#[from] ShapeError),

    #[error(transparent)]
    Time(#[from] TimeError),
}

impl CompileError {
    pub fn invalid(message: impl Into<String>) -> Self {
        CompileError::Invalid {
            message: message.into(),
            code: None,
        }
    }

    /// Attach source text to an `Invalid` error.
    pub fn with_code(self, text: &str) -> Self {
        match self {
            CompileError::Invalid { message, code: None } if !text.is_empty() => {
                CompileError::Invalid {
                    message,
                    code: Some(text.to_string()),
                }
            }
            other => other,
        }
    }

    /// Source text the error refers to.
    pub fn code(&self) -> Option<&str> {
        match self {
            CompileError::Invalid { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

pub type CompileResult<T> = Result<T, CompileError>;
