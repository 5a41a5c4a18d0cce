use std::collections::BTreeMap;
use std::sync::Arc;

/// A unit of data flowing along a graph edge.
///
/// Kept as a small closed sum rather than a generic `T` so a `Graph` can hold
/// heterogeneous nodes behind one object-safe [`crate::node::NodeLogic`]
/// trait. `Bytes` is the common case (source adapters, encoders, decoders);
/// the others cover the typed values this crate's reference nodes and tests
/// produce directly (counts, running totals, decoded JSON).
#[derive(Clone, Debug, PartialEq)]
pub enum Chunk {
    Bytes(Arc<[u8]>),
    Text(Arc<str>),
    Counts(BTreeMap<String, u64>),
    Number(i64),
    Json(serde_json::Value),
    /// No payload; used as the dequeue signal for aggregator-style nodes
    /// whose real output comes from `process_final`, not per-chunk `process`.
    Unit,
}

impl Chunk {
    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        Chunk::Bytes(Arc::from(data.into()))
    }

    pub fn text(data: impl Into<String>) -> Self {
        Chunk::Text(Arc::from(data.into().into_boxed_str()))
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Chunk::Bytes(b) => Some(b),
            Chunk::Text(t) => Some(t.as_bytes()),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Chunk::Text(t) => Some(t),
            Chunk::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }
}
