//! Domain error conditions.
//!
//! Everything in the crate propagates [`anyhow::Error`]; the variants below
//! are the conditions callers need to tell apart (the HTTP layer maps them
//! to status codes by downcasting, see [`Error::classify`]).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Unknown provider, invalid parameter, unknown parser override.
    #[error("configuration error: {0}")]
    Config(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Missing directory, unreachable remote source.
    #[error("data source unavailable: {0}")]
    SourceUnavailable(String),
    /// Another run already holds the `(collection, data source)` target.
    #[error("an ingestion run is already in progress for {collection} <- {data_source_fqn}")]
    RunInProgress {
        collection: String,
        data_source_fqn: String,
    },
    #[error("{count} data point(s) failed to ingest")]
    IngestionFailed { count: usize },
}

/// Coarse classes used by the HTTP and CLI surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    BadRequest,
    Conflict,
    Internal,
}

impl Error {
    pub fn config(msg: impl Into<String>) -> anyhow::Error {
        Error::Config(msg.into()).into()
    }

    pub fn not_found(msg: impl Into<String>) -> anyhow::Error {
        Error::NotFound(msg.into()).into()
    }

    pub fn bad_request(msg: impl Into<String>) -> anyhow::Error {
        Error::BadRequest(msg.into()).into()
    }

    /// Finds the first domain error in the chain and returns its class.
    pub fn classify(err: &anyhow::Error) -> ErrorKind {
        for cause in err.chain() {
            if let Some(e) = cause.downcast_ref::<Error>() {
                return match e {
                    Error::NotFound(_) => ErrorKind::NotFound,
                    Error::Config(_) | Error::AlreadyExists(_) | Error::BadRequest(_) => {
                        ErrorKind::BadRequest
                    }
                    Error::RunInProgress { .. } => ErrorKind::Conflict,
                    Error::SourceUnavailable(_) | Error::IngestionFailed { .. } => {
                        ErrorKind::Internal
                    }
                };
            }
        }
        ErrorKind::Internal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn classify_sees_through_context() {
        let err: anyhow::Result<()> = Err(Error::not_found("collection 'docs'"));
        let err = err.context("loading collection").unwrap_err();
        assert_eq!(Error::classify(&err), ErrorKind::NotFound);
    }

    #[test]
    fn classify_plain_errors_as_internal() {
        let err = anyhow::anyhow!("disk on fire");
        assert_eq!(Error::classify(&err), ErrorKind::Internal);
    }

    #[test]
    fn run_in_progress_is_conflict() {
        let err: anyhow::Error = Error::RunInProgress {
            collection: "docs".into(),
            data_source_fqn: "localdir::/data".into(),
        }
        .into();
        assert_eq!(Error::classify(&err), ErrorKind::Conflict);
        assert!(err.to_string().contains("localdir::/data"));
    }
}
