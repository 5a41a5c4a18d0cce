use thiserror::Error;

use crate::chunk::Chunk;

/// Stable index of a node within a [`crate::graph::Graph`], assigned at
/// registration. Replaces the reference implementation's reliance on
/// `id(self)` for subscription bookkeeping.
pub type NodeHandle = usize;

/// Stable index identifying one particular upstream of a node, assigned at
/// graph construction (the position of that upstream in the node's `needs`
/// list). Multi-input nodes key their internal per-upstream state by this
/// handle instead of upstream object identity.
pub type UpstreamHandle = usize;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0:?} does not declare a well-formed process implementation")]
    InvalidProcessMethod(String),
    #[error("{0:?} does not have enough data to dequeue yet")]
    NotEnoughData(String),
    #[error("process() is missing source(s) for root node(s): {0:?}")]
    MissingRoots(Vec<String>),
    #[error("source produced zero bytes")]
    EmptyStream,
    #[error("node {node:?} failed")]
    Extraction {
        node: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("pending envelope stack exceeded its bound of {0}; graph is likely runaway")]
    PendingEnvelopeOverflow(usize),
}

/// One step of a root-level source's production, polled once per scheduler
/// round. Stands in for the reference implementation's true generator
/// laziness, which only exists at root nodes (every non-root node fully
/// drains in a single dispatch regardless of whether `_process` is written
/// as a generator).
#[derive(Debug)]
pub enum Advance {
    Emit(Chunk),
    Pending,
    Done,
}

/// The contract every non-root node in the graph implements.
///
/// Corresponds to the reference implementation's `Node`: `process` replaces
/// the generator-based `_process` (this crate's nodes fully drain their
/// input in one call, so an eager `Vec` and a lazy generator are
/// behaviorally identical downstream of a root), `enqueue`/`dequeue` replace
/// the single-slot cache and its `Aggregator` override, and `finalize`
/// replaces the per-upstream end-of-stream signal.
pub trait NodeLogic: Send {
    fn name(&self) -> &str;

    /// One-shot hook applied to the first datum only; used for format
    /// sniffing. Default: identity.
    fn first_chunk(&mut self, data: Chunk) -> Chunk {
        data
    }

    /// Merges an upstream chunk into this node's internal state.
    fn enqueue(&mut self, data: Chunk, from: UpstreamHandle);

    /// Extracts the next ready datum, or signals `NotEnoughData` if this
    /// node isn't ready to produce one yet. `finalized` is true once every
    /// upstream has both enqueued at least one chunk and finalized.
    fn dequeue(&mut self, finalized: bool) -> Result<Chunk, EngineError>;

    /// Transforms one dequeued datum into zero or more output chunks.
    fn process(&mut self, data: Chunk) -> Result<Vec<Chunk>, Box<dyn std::error::Error + Send + Sync>>;

    /// Produces a finite trailing sequence once every upstream has
    /// finalized. Default: nothing.
    fn process_final(&mut self) -> Result<Vec<Chunk>, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Vec::new())
    }

    /// Signals that the given upstream will send no more data.
    fn finalize(&mut self, from: UpstreamHandle) {
        let _ = from;
    }

    /// Called once per run before any data flows.
    fn open(&mut self) {}

    /// Called once per run after the node has finished, even on error.
    fn close(&mut self) {}
}

/// Builds a [`NodeLogic`] from a plain closure for nodes whose entire
/// behavior is a stateless (or simply-stated) one-input, single-slot chunk
/// transform. Mirrors the construction-time validation the reference
/// implementation placed on `_process` (`inspect.isgeneratorfunction`): a
/// `ClosureNode` must be explicitly declared as the streaming kind, and
/// declaring it otherwise is always a caller mistake, failing fast with
/// [`EngineError::InvalidProcessMethod`].
pub struct ClosureNode<F> {
    name: String,
    cache: Option<Chunk>,
    func: F,
}

impl<F> ClosureNode<F>
where
    F: FnMut(Chunk) -> Vec<Chunk> + Send,
{
    pub fn new(name: impl Into<String>, is_generator: bool, func: F) -> Result<Self, EngineError> {
        let name = name.into();
        if !is_generator {
            return Err(EngineError::InvalidProcessMethod(name));
        }
        Ok(Self {
            name,
            cache: None,
            func,
        })
    }
}

impl<F> NodeLogic for ClosureNode<F>
where
    F: FnMut(Chunk) -> Vec<Chunk> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn enqueue(&mut self, data: Chunk, _from: UpstreamHandle) {
        self.cache = Some(data);
    }

    fn dequeue(&mut self, _finalized: bool) -> Result<Chunk, EngineError> {
        self.cache
            .take()
            .ok_or_else(|| EngineError::NotEnoughData(self.name.clone()))
    }

    fn process(&mut self, data: Chunk) -> Result<Vec<Chunk>, Box<dyn std::error::Error + Send + Sync>> {
        Ok((self.func)(data))
    }
}

/// Builds an Aggregator-style [`NodeLogic`]: accumulates every chunk it is
/// handed and refuses to `dequeue` until every upstream has finalized,
/// forcing it to consume the entire upstream before producing anything.
/// Once finalized, `dequeue` yields a single `Chunk::Unit` signal and the
/// real computation happens in `process`, which reads the accumulated
/// buffer rather than the (unused) dequeued datum.
pub struct AggregatorClosureNode<F> {
    name: String,
    items: Vec<Chunk>,
    drained: bool,
    func: F,
}

impl<F> AggregatorClosureNode<F>
where
    F: FnMut(&[Chunk]) -> Vec<Chunk> + Send,
{
    pub fn new(name: impl Into<String>, is_generator: bool, func: F) -> Result<Self, EngineError> {
        let name = name.into();
        if !is_generator {
            return Err(EngineError::InvalidProcessMethod(name));
        }
        Ok(Self {
            name,
            items: Vec::new(),
            drained: false,
            func,
        })
    }
}

impl<F> NodeLogic for AggregatorClosureNode<F>
where
    F: FnMut(&[Chunk]) -> Vec<Chunk> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn enqueue(&mut self, data: Chunk, _from: UpstreamHandle) {
        self.items.push(data);
    }

    fn dequeue(&mut self, finalized: bool) -> Result<Chunk, EngineError> {
        if !finalized || self.drained {
            return Err(EngineError::NotEnoughData(self.name.clone()));
        }
        self.drained = true;
        Ok(Chunk::Unit)
    }

    fn process(&mut self, _data: Chunk) -> Result<Vec<Chunk>, Box<dyn std::error::Error + Send + Sync>> {
        Ok((self.func)(&self.items))
    }
}

/// Keys its internal cache by the stable [`UpstreamHandle`] assigned to each
/// upstream at graph construction, rather than upstream object identity
/// (Design Note on identity-keyed caches). Emits once every upstream has
/// delivered a value for the current "tick", then clears the slots for the
/// next one; on finalize, flushes whatever partial row remains.
pub struct ZipNode<F> {
    name: String,
    arity: usize,
    slots: std::collections::BTreeMap<UpstreamHandle, Chunk>,
    func: F,
}

impl<F> ZipNode<F>
where
    F: FnMut(&std::collections::BTreeMap<UpstreamHandle, Chunk>) -> Chunk + Send,
{
    pub fn new(name: impl Into<String>, arity: usize, func: F) -> Self {
        Self {
            name: name.into(),
            arity,
            slots: std::collections::BTreeMap::new(),
            func,
        }
    }
}

impl<F> NodeLogic for ZipNode<F>
where
    F: FnMut(&std::collections::BTreeMap<UpstreamHandle, Chunk>) -> Chunk + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn enqueue(&mut self, data: Chunk, from: UpstreamHandle) {
        self.slots.insert(from, data);
    }

    fn dequeue(&mut self, _finalized: bool) -> Result<Chunk, EngineError> {
        if self.slots.len() < self.arity {
            return Err(EngineError::NotEnoughData(self.name.clone()));
        }
        Ok(Chunk::Unit)
    }

    fn process(&mut self, _data: Chunk) -> Result<Vec<Chunk>, Box<dyn std::error::Error + Send + Sync>> {
        let out = (self.func)(&self.slots);
        self.slots.clear();
        Ok(vec![out])
    }
}
