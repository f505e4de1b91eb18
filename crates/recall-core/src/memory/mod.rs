//! Memory subsystem: classification, the local cache, and the tiered store
//! that syncs it to the backing store.

pub mod cache;
pub mod classify;
pub mod consolidate;
pub mod error;
pub mod relate;
pub mod store;

pub use cache::{CacheStats, CachedRecord, LocalCache};
pub use classify::{
    base_score, classify, decayed_importance, extract_keywords, infer_type, score_importance,
    Classification, DecayPolicy,
};
pub use consolidate::{ConsolidationPolicy, ConsolidationReport};
pub use error::{MemoryError, MemoryResult};
pub use relate::{detect_relationships, keyword_similarity, rank_relationships, RelationshipConfig};
pub use store::{MemoryStats, MemoryStoreConfig, SyncFailure, SyncReport, TieredMemoryStore};
