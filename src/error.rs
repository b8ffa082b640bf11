use std::path::PathBuf;

use thiserror::Error;

/// Malformed controller log content. Fatal for the session being parsed.
#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("on line {line}: unable to parse timestamp {token:?} as integer milliseconds")]
    Timestamp {
        line: usize,
        token: String,
    },
    #[error("on line {line}: unable to parse {field} from {token:?}")]
    Field {
        line: usize,
        field: &'static str,
        token: String,
    },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
    #[error("{path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: ParseError,
    },
    #[error("{path}: missing column {column:?}")]
    MissingColumn {
        path: PathBuf,
        column: String,
    },
    #[error("{path}: row {row}: unable to parse {column} value {value:?}")]
    BadValue {
        path: PathBuf,
        row: usize,
        column: String,
        value: String,
    },
    #[error("no calcium recording found for session {session} (looked for {path})")]
    MissingCalcium {
        session: String,
        path: PathBuf,
    },
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }
}
