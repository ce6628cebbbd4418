pub mod core;
pub mod mapper;
pub mod protocol;
pub mod query;
pub mod rank;
pub mod search;
pub mod storage;

/*
┌──────────────────────────────────────────────────────────────────────────┐
│                        STREAMDEX ARCHITECTURE                            │
└──────────────────────────────────────────────────────────────────────────┘

One worker per storage bucket. Each worker streams the bucket's documents
out of a slot file, evaluates the query against every document, ranks the
matches, keeps the top-K and emits a single result message at end of
stream.

          documents                         query blob
              │                                 │
              ▼                                 ▼
   storage::SlotFile  ◄── verify/repair   query::builder  ◄── protocol::DocumentProtocol
    (slot file v1:                              │               (codec registry,
     header/meta/blocks,                        ▼                v6 + v8 framings,
     partial write,          mapper::DocumentMapper              reply merger)
     full rewrite)            (field searchers fill
              │                per-term hit lists)
              │                                 │
              └────────────►  query::QueryNode  ◄───────────────┐
                               evaluate() / evaluate_hits()     │
                                                │               │
                                                ▼               │
                              rank::RankProcessor               │
                               (match-data unpack,              │
                                rank programs)                  │
                                                │               │
                                                ▼               │
                              search::HitCollector              │
                               (bounded heap: rank              │
                                score or sort key)              │
                                                │               │
                                                ▼               │
                              search::SearchVisitor ────────────┘
                               (one SearchResult +
                                DocumentSummary per stream)
*/

pub use crate::core::config::{EngineConfig, SlotFileConfig};
pub use crate::core::error::{Error, ErrorKind, Result};
pub use crate::core::types::{BucketId, DocId, Document, DocumentId, FieldValue, GlobalId, Timestamp};
pub use crate::mapper::searchers::DocumentMapper;
pub use crate::mapper::spec::{FieldSearchSpecMap, MatchType};
pub use crate::protocol::DocumentProtocol;
pub use crate::query::builder::build_query;
pub use crate::query::node::QueryNode;
pub use crate::rank::processor::RankProcessor;
pub use crate::search::collector::HitCollector;
pub use crate::search::result::{DocumentSummary, SearchResult};
pub use crate::search::visitor::{SearchVisitor, VisitorParams};
pub use crate::storage::slotfile::SlotFile;
