//! Frontend edge-connection core for a graph-relational database server.
//!
//! This crate implements the network-facing half of a session: the binary
//! wire protocol codec, the bind-argument recoder, the compiled-query
//! cache, the per-session transactional view (dbview), and the protocol
//! engine that ties them together. The compiler and the storage backend
//! are external collaborators, represented here only by their trait
//! contracts ([`compiler::CompilerClient`], [`backend::BackendClient`]).

pub mod backend;
pub mod cache;
pub mod codec;
pub mod compiler;
pub mod dbview;
pub mod error;
pub mod recoder;
pub mod session;
pub mod types;

pub use error::EdgeError;
pub use session::Session;
