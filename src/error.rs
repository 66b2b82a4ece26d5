use thiserror::Error;

use std::io;

/// boxed error returned by user supplied work
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// result alias used by gates and workers
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// the gate or worker is torn down (or tearing down)
    #[error("object is disposed")]
    Disposed,

    /// the wait was aborted by its cancel token
    #[error("wait cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn is_disposed(&self) -> bool {
        matches!(self, Error::Disposed)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// failure captured from a unit of work
#[derive(Debug, Error)]
pub enum WorkError {
    #[error("work failed: {0}")]
    Failed(BoxError),

    #[error("work panicked: {0}")]
    Panicked(String),
}

impl WorkError {
    /// convert a panic payload into a `WorkError`
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_owned()
        };
        WorkError::Panicked(msg)
    }
}

impl From<io::Error> for WorkError {
    fn from(e: io::Error) -> Self {
        WorkError::Failed(Box::new(e))
    }
}
