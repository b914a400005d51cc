//! commit_searcher: per-commit code search over cached archive snapshots.
//!
//! A request names a repository and a resolved commit. The archive for that
//! commit is fetched once, re-encoded as an uncompressed zip, cached on disk
//! and memory-mapped; searches then run regex or structural matchers over it
//! and stream chunked matches back. When an external index already covers an
//! older commit of the repository, only the changed paths are searched live.

pub mod config;
pub mod context;
pub mod error;
pub mod index;
pub mod metrics;
pub mod protocol;
pub mod search;
pub mod service;
pub mod source;
pub mod store;
pub mod telemetry;
pub mod utils;
pub mod web;

pub use context::SearchContext;
pub use error::{Result, SearchError};
pub use service::Service;
