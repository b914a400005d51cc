pub mod chunk;
pub mod engine;
pub mod hybrid;
pub mod match_tree;
pub mod path_filter;
pub mod regex_search;
pub mod sink;
pub mod structural;

pub use engine::{search_zip, Matcher};
pub use hybrid::{HybridResult, HybridSearcher};
pub use sink::{LimitedStream, MatchCallback};
pub use structural::StructuralSearcher;
