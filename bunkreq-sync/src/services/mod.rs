//! Service modules for request synchronization
//!
//! Sync flow: `sync_pipeline` drives `request_deduplicator`, the `parser`
//! boundary, `placeholder_expander` (over `lookups`) and
//! `partial_invalidation`. `merge_split` is the staff-facing side.

pub mod lookups;
pub mod merge_split;
pub mod parser;
pub mod partial_invalidation;
pub mod placeholder_expander;
pub mod request_deduplicator;
pub mod sync_pipeline;

pub use lookups::{HistoricalLookup, PriorBunkmates, StoreHistoricalLookup};
pub use merge_split::{
    MergeOutcome, MergeRequest, MergeSplitCoordinator, SplitOutcome, SplitSource,
    SynthesizedRequest,
};
pub use parser::{ParsedText, RequestParser, StaticRequestParser, SyncInput};
pub use partial_invalidation::{InvalidationResult, PartialInvalidationHandler};
pub use placeholder_expander::PlaceholderExpander;
pub use request_deduplicator::{DeduplicationOutcome, DeduplicationStats, RequestDeduplicator};
pub use sync_pipeline::{SyncPipeline, SyncReport};
