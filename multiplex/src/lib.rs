//! Serve HTTP and HTTPS on one TCP port.
//!
//! The [`mux`] module sniffs the first bytes of every accepted connection
//! and hands it to the sub-listener whose matcher claims it. The rest of the
//! crate is the demo around it: a ping server that answers plain HTTP and
//! TLS on the same port, and an mTLS client.

pub mod certs;
pub mod client;
pub mod config;
pub mod conn;
pub mod error;
pub mod matchers;
pub mod mux;
pub mod server;

pub use conn::MuxStream;
pub use error::{MuxError, Unmatched};
pub use matchers::{MatchResult, Matcher};
pub use mux::{Listener, Mux, MuxCloser, SubListener};
