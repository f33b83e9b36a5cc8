//! # Pipeline Errors
//!
//! A single error type flows through every layer of the core: handlers, DAG
//! nodes, state actions and storage backends all return [`Result<T>`]. Keeping
//! one enum lets the orchestration code decide uniformly whether a failure is
//! worth retrying.

use crate::domain::Uid;
use futures::future::join_all;
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur within the orchestration core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failure reported by application logic.
    #[error("{0}")]
    Domain(Box<dyn std::error::Error + Send + Sync>),
    /// A conditional save found a different version (or a newer timestamp) in storage.
    #[error("wrong version {collection}.{uid}")]
    VersionConflict { collection: String, uid: Uid },
    #[error("storage error: {0}")]
    Storage(Box<dyn std::error::Error + Send + Sync>),
    #[error("can't convert {collection}.{uid}: {source}")]
    Codec {
        collection: String,
        uid: Uid,
        #[source]
        source: serde_json::Error,
    },
    /// The identity map already holds a different Rust type under the same key.
    #[error("type mismatch in identity map for {collection}.{uid}")]
    TypeMismatch { collection: String, uid: Uid },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("no handler for request {0}")]
    NoRequestHandler(&'static str),
    #[error("cancelled")]
    Cancelled,
    #[error("task failed: {0}")]
    Panicked(String),
    #[error("{0}")]
    Group(ErrorGroup),
}

impl Error {
    /// Wraps any application error (or plain message) as [`Error::Domain`].
    pub fn domain(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::Domain(err.into())
    }

    pub fn storage(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::Storage(err.into())
    }

    /// Whether repeating the failed operation may succeed.
    ///
    /// Wiring mistakes, panics and cancellation are final; everything else,
    /// including version conflicts, is considered transient.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Config(_)
            | Error::NoRequestHandler(_)
            | Error::TypeMismatch { .. }
            | Error::Panicked(_)
            | Error::Cancelled => false,
            Error::Group(group) => group.errors().iter().all(Error::is_recoverable),
            _ => true,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs `future` and turns a panic inside it into [`Error::Panicked`].
pub(crate) async fn catch_panic<T>(future: impl Future<Output = Result<T>>) -> Result<T> {
    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| Err(Error::Panicked(panic_message(payload.as_ref()))))
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            Error::Cancelled
        } else {
            Error::Panicked(err.to_string())
        }
    }
}

/// Several independent failures collected from concurrently awaited work.
#[derive(Debug)]
pub struct ErrorGroup(Vec<Error>);

impl ErrorGroup {
    pub fn new(errors: Vec<Error>) -> Self {
        Self(errors)
    }

    pub fn errors(&self) -> &[Error] {
        &self.0
    }
}

impl fmt::Display for ErrorGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors: ", self.0.len())?;
        for (n, err) in self.0.iter().enumerate() {
            if n > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

/// Awaits all futures concurrently and collects their outputs in order.
///
/// Every future runs to completion even when some fail. A single failure is
/// returned as is, several are wrapped into [`Error::Group`].
pub async fn gather<T, I>(futures: I) -> Result<Vec<T>>
where
    I: IntoIterator,
    I::Item: Future<Output = Result<T>>,
{
    let mut values = Vec::new();
    let mut errors = Vec::new();

    for result in join_all(futures).await {
        match result {
            Ok(value) => values.push(value),
            Err(err) => errors.push(err),
        }
    }

    match errors.len() {
        0 => Ok(values),
        1 => Err(errors.remove(0)),
        _ => Err(Error::Group(ErrorGroup::new(errors))),
    }
}
