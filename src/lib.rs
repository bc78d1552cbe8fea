//! # multibit-search — Tanimoto similarity search over binary fingerprints
//!
//! An in-memory search engine for fixed-width bit vectors under the
//! Tanimoto (Jaccard) coefficient. Given a loaded collection of
//! fingerprints and a query plus a threshold `t`, the engine returns every
//! stored fingerprint `P` with `Tanimoto(Q, P) >= t`.
//!
//! ## Design Principles
//!
//! 1. **Two-level acceleration**: a [`grid::CardinalityGrid`] restricts a
//!    query to popcount buckets that can possibly satisfy the threshold;
//!    each bucket is a [`tree::MultibitTree`] that prunes whole subtrees
//!    via a provable lower bound on the Tanimoto distance.
//! 2. **Cheap before exact**: candidates are filtered by a folded 128-bit
//!    XOR-hash upper bound before the exact Tanimoto coefficient is ever
//!    computed.
//! 3. **Parallel by construction, immutable after build**: tree build and
//!    search are dispatched onto a fixed [`pool::WorkerPool`]; once built,
//!    trees are read-only and safe for concurrent queries.
//!
//! ## Quick Start
//!
//! ```rust
//! use multibit_search::{Engine, EngineConfig, InMemoryRecord};
//!
//! let records = vec![
//!     InMemoryRecord::new(Some("a".into()), "11110000".into()),
//!     InMemoryRecord::new(Some("b".into()), "11111111".into()),
//! ];
//!
//! let mut engine = Engine::new(EngineConfig::default());
//! engine.load_records(records).unwrap();
//!
//! let result = engine.search("11110000", 0.5, None, true).unwrap();
//! assert!(result.ids.contains(&"a".to_string()));
//! ```
//!
//! ## Modules
//!
//! | Module | Responsibility |
//! |--------|-----------------|
//! | [`fingerprint`] | Packed bit vector, popcount, Tanimoto, folded XOR-hash |
//! | [`tree`] | `MultibitTree` build + match-bit-pruned search |
//! | [`grid`] | `CardinalityGrid` bucketing and bucket-range search |
//! | [`sink`] | Thread-safe result collection (unsorted / sorted / streaming) |
//! | [`pool`] | Fixed worker pool for parallel build and search |
//! | [`loader`] | Default tokenizing loader + `RecordSource` contract |
//! | [`engine`] | Lifecycle façade: `load` / `search` / `search_file` / `unload` / `statistics` |

pub mod engine;
pub mod fingerprint;
pub mod global;
pub mod grid;
pub mod loader;
pub mod pool;
pub mod sink;
pub mod tree;

pub use engine::{Engine, EngineConfig, SearchResult, Statistics};
pub use fingerprint::Fingerprint;
pub use loader::{InMemoryRecord, RecordSource};
pub use sink::{ResultSink, SinkMode};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("input unreadable: {0}")]
    InputUnreadable(String),

    #[error("stream write failure: {0}")]
    StreamWriteFailure(#[from] std::io::Error),

    #[error("no engine loaded")]
    NotLoaded,
}

pub type Result<T> = std::result::Result<T, Error>;
