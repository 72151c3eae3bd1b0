//! Errors produced by the connection multiplexer.

use std::fmt;
use std::io;
use thiserror::Error;

/// Errors reported by [`Mux`](crate::mux::Mux) and its sub-listeners.
///
/// Only [`MuxError::Accept`] ends the accept loop abnormally. The
/// per-connection kinds are sent on the error channel and logged, and the
/// offending connection is closed.
#[derive(Error, Debug)]
pub enum MuxError {
    /// The multiplexer or sub-listener was closed on purpose.
    #[error("mux: listener closed")]
    Closed,

    /// The base listener failed to accept.
    #[error("mux: accept failed: {0}")]
    Accept(#[source] io::Error),

    /// No registered rule claimed the connection.
    #[error("mux: no rule matched connection from {peer} ({reason})")]
    NoMatch { peer: String, reason: Unmatched },

    /// Reading the initial bytes failed.
    #[error("mux: read from {peer} failed: {source}")]
    Io {
        peer: String,
        #[source]
        source: io::Error,
    },

    /// The winning rule's sub-listener is gone.
    #[error("mux: sub-listener {rule} closed, dropping connection from {peer}")]
    QueueClosed { rule: usize, peer: String },
}

/// Why a connection ended up unmatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unmatched {
    /// Every rule rejected the sniffed bytes.
    Rejected,
    /// The rules could not decide before the peek deadline.
    TimedOut,
    /// The peer closed without sending anything.
    Empty,
}

impl fmt::Display for Unmatched {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unmatched::Rejected => write!(f, "rejected by every rule"),
            Unmatched::TimedOut => write!(f, "timed out"),
            Unmatched::Empty => write!(f, "closed before sending data"),
        }
    }
}

impl MuxError {
    /// True for the shutdown signal, which callers treat as a normal exit.
    pub fn is_closed(&self) -> bool {
        matches!(self, MuxError::Closed)
    }

    /// True for errors that concern a single connection only.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            MuxError::NoMatch { .. }
                | MuxError::Io { .. }
                | MuxError::QueueClosed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_is_not_a_connection_error() {
        assert!(MuxError::Closed.is_closed());
        assert!(!MuxError::Closed.is_connection_error());
    }

    #[test]
    fn test_connection_errors() {
        let err = MuxError::NoMatch {
            peer: "127.0.0.1:5000".to_string(),
            reason: Unmatched::TimedOut,
        };
        assert!(err.is_connection_error());
        assert!(!err.is_closed());
        assert_eq!(
            err.to_string(),
            "mux: no rule matched connection from 127.0.0.1:5000 (timed out)"
        );

        let accept = MuxError::Accept(io::Error::new(io::ErrorKind::Other, "boom"));
        assert!(!accept.is_connection_error());
    }
}
