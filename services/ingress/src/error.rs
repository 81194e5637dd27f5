//! Listener error types.

use std::io;

use thiserror::Error;

/// Errors surfaced by a sniffing listener.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The listener has been closed.
    #[error("use of closed listener")]
    Closed,

    /// Underlying I/O failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ListenerError {
    /// Returns true if this error means the listener is closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, ListenerError::Closed)
    }
}

impl From<ListenerError> for io::Error {
    fn from(err: ListenerError) -> Self {
        match err {
            ListenerError::Closed => io::Error::new(io::ErrorKind::NotConnected, ListenerError::Closed),
            ListenerError::Io(e) => e,
        }
    }
}

/// Returns true if `err` carries [`ListenerError::Closed`].
pub fn is_closed_error(err: &io::Error) -> bool {
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<ListenerError>())
        .is_some_and(ListenerError::is_closed)
}
