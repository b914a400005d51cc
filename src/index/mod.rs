//! Boundary to the external trigram index used by hybrid search.

pub mod memory;
pub mod query;

use crate::context::SearchContext;
use crate::error::Result;
use crate::protocol::ChunkMatch;
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};

pub use memory::MemoryIndex;
pub use query::IndexQuery;

/// One file returned by the index, stamped with the commit it was indexed at.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexFileMatch {
    pub repository: String,
    pub version: String,
    pub path: String,
    pub chunk_matches: Vec<ChunkMatch>,
    /// Whole file content, when requested.
    pub content: Option<Vec<u8>>,
}

/// A batch of results. `crashes` counts index shards that failed while
/// producing it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexEvent {
    pub files: Vec<IndexFileMatch>,
    pub crashes: usize,
}

#[derive(Debug, Clone, Default)]
pub struct IndexSearchOptions {
    /// Stop after this many matches (0 = unlimited).
    pub max_matches: usize,
    pub context_lines: u32,
    /// Return whole file contents instead of chunks.
    pub whole_file: bool,
}

pub type IndexStream = BoxStream<'static, Result<IndexEvent>>;

#[async_trait]
pub trait IndexBackend: Send + Sync {
    /// Commit currently indexed for `repo`, if any.
    async fn indexed_commit(&self, repo: &str) -> Result<Option<String>>;

    /// Evaluate `query`, streaming results as they are found.
    async fn stream_search(
        &self,
        ctx: &SearchContext,
        query: IndexQuery,
        opts: IndexSearchOptions,
    ) -> Result<IndexStream>;
}

/// Backend for deployments without an index: nothing is ever indexed.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoIndex;

#[async_trait]
impl IndexBackend for NoIndex {
    async fn indexed_commit(&self, _repo: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn stream_search(
        &self,
        _ctx: &SearchContext,
        _query: IndexQuery,
        _opts: IndexSearchOptions,
    ) -> Result<IndexStream> {
        Ok(stream::empty().boxed())
    }
}
