use std::collections::{HashMap, HashSet};

use log::trace;

use crate::chunk::Chunk;
use crate::node::{Advance, EngineError, NodeHandle, NodeLogic, UpstreamHandle};
use crate::source::Source;

enum NodeKind {
    Root(Option<Box<dyn Source>>),
    Logic(Box<dyn NodeLogic>),
}

struct GraphNode {
    key: String,
    kind: NodeKind,
    needs: Vec<NodeHandle>,
    /// (listener handle, the `UpstreamHandle` this node occupies in that
    /// listener's `needs` list).
    listeners: Vec<(NodeHandle, UpstreamHandle)>,
    enqueued: HashSet<UpstreamHandle>,
    finalized: HashSet<UpstreamHandle>,
    finished: bool,
    removed: bool,
}

impl GraphNode {
    fn is_root(&self) -> bool {
        self.needs.is_empty()
    }

    fn is_leaf(&self) -> bool {
        self.listeners.is_empty()
    }

    fn dependency_count(&self) -> usize {
        self.needs.len()
    }

    fn is_finalized(&self) -> bool {
        self.finalized.len() >= self.dependency_count() && self.enqueued.len() >= self.dependency_count()
    }
}

enum Envelope {
    Deliver {
        target: NodeHandle,
        from: UpstreamHandle,
        data: Chunk,
    },
    Finish {
        target: NodeHandle,
        from: UpstreamHandle,
    },
}

/// Holds nodes by key, pulls from roots, routes chunks to listeners, and
/// finalizes in topological order.
///
/// Construction is bottom-up: register dependencies before the nodes that
/// need them, since `register_node` wires up the `needs`/`listeners`
/// bookkeeping (and each node's `UpstreamHandle`) at call time.
#[derive(Default)]
pub struct Graph {
    nodes: Vec<GraphNode>,
    keys: HashMap<String, NodeHandle>,
    /// Bound on the pending-envelope stack before a run is considered a
    /// runaway graph. `0` means unbounded.
    max_pending_envelopes: usize,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the bound checked on every envelope push during `process()`.
    /// `0` (the default) means unbounded.
    pub fn with_max_pending_envelopes(mut self, max: usize) -> Self {
        self.max_pending_envelopes = max;
        self
    }

    pub fn handle_for(&self, key: &str) -> Option<NodeHandle> {
        self.keys.get(key).copied()
    }

    fn push(&self, stack: &mut Vec<Envelope>, envelope: Envelope) -> Result<(), EngineError> {
        if self.max_pending_envelopes != 0 && stack.len() >= self.max_pending_envelopes {
            return Err(EngineError::PendingEnvelopeOverflow(self.max_pending_envelopes));
        }
        stack.push(envelope);
        Ok(())
    }

    /// Registers a root node: one that produces data rather than consuming
    /// it. Its `Source` is supplied later, at [`Graph::process`] time.
    pub fn register_root(&mut self, key: impl Into<String>) -> NodeHandle {
        let key = key.into();
        let handle = self.nodes.len();
        self.nodes.push(GraphNode {
            key: key.clone(),
            kind: NodeKind::Root(None),
            needs: Vec::new(),
            listeners: Vec::new(),
            enqueued: HashSet::new(),
            finalized: HashSet::new(),
            finished: false,
            removed: false,
        });
        self.keys.insert(key, handle);
        handle
    }

    /// Registers a non-root node. `needs[i]` becomes `UpstreamHandle i` from
    /// this node's point of view.
    pub fn register_node(
        &mut self,
        key: impl Into<String>,
        needs: &[NodeHandle],
        logic: Box<dyn NodeLogic>,
    ) -> NodeHandle {
        let key = key.into();
        let handle = self.nodes.len();
        for (upstream_handle, &need) in needs.iter().enumerate() {
            self.nodes[need].listeners.push((handle, upstream_handle));
        }
        self.nodes.push(GraphNode {
            key: key.clone(),
            kind: NodeKind::Logic(logic),
            needs: needs.to_vec(),
            listeners: Vec::new(),
            enqueued: HashSet::new(),
            finalized: HashSet::new(),
            finished: false,
            removed: false,
        });
        self.keys.insert(key, handle);
        handle
    }

    pub fn roots(&self) -> Vec<NodeHandle> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| !n.removed && n.is_root())
            .map(|(h, _)| h)
            .collect()
    }

    pub fn leaves(&self) -> Vec<NodeHandle> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| !n.removed && n.is_leaf())
            .map(|(h, _)| h)
            .collect()
    }

    /// Removes, transitively, any leaf node that is not in `keep`. Applied
    /// before execution so unstored leaf computations are skipped entirely.
    pub fn prune_dead_leaves(&mut self, keep: &HashSet<NodeHandle>) {
        loop {
            let candidates: Vec<NodeHandle> = self
                .nodes
                .iter()
                .enumerate()
                .filter(|(h, n)| !n.removed && n.is_leaf() && !keep.contains(h))
                .map(|(h, _)| h)
                .collect();
            if candidates.is_empty() {
                break;
            }
            for handle in candidates {
                self.disconnect(handle);
            }
        }
    }

    fn disconnect(&mut self, handle: NodeHandle) {
        let needs = self.nodes[handle].needs.clone();
        for need in needs {
            self.nodes[need].listeners.retain(|(h, _)| *h != handle);
        }
        self.nodes[handle].removed = true;
        trace!("pruned dead node: {}", self.nodes[handle].key);
    }

    fn open_all(&mut self) {
        for node in &mut self.nodes {
            if let NodeKind::Logic(logic) = &mut node.kind {
                logic.open();
            }
        }
    }

    fn close_all(&mut self) {
        for node in &mut self.nodes {
            if let NodeKind::Logic(logic) = &mut node.kind {
                logic.close();
            }
        }
    }

    /// Runs the graph to completion. `sources` must supply one `Source` per
    /// registered root key; a root with no matching entry fails the whole
    /// run with [`EngineError::MissingRoots`] before anything executes.
    pub fn process(&mut self, mut sources: HashMap<String, Box<dyn Source>>) -> Result<(), EngineError> {
        let root_handles = self.roots();
        let missing: Vec<String> = root_handles
            .iter()
            .filter(|&&h| !sources.contains_key(&self.nodes[h].key))
            .map(|&h| self.nodes[h].key.clone())
            .collect();
        if !missing.is_empty() {
            return Err(EngineError::MissingRoots(missing));
        }

        for &handle in &root_handles {
            let key = self.nodes[handle].key.clone();
            if let Some(source) = sources.remove(&key) {
                self.nodes[handle].kind = NodeKind::Root(Some(source));
            }
        }

        self.open_all();
        let result = self.run(&root_handles);
        self.close_all();
        result
    }

    fn run(&mut self, root_handles: &[NodeHandle]) -> Result<(), EngineError> {
        let mut stack: Vec<Envelope> = Vec::new();
        let mut exhausted: HashSet<NodeHandle> = HashSet::new();

        loop {
            let mut advanced_any = false;
            for &root in root_handles {
                if exhausted.contains(&root) {
                    continue;
                }
                advanced_any = true;
                let advance = match &mut self.nodes[root].kind {
                    NodeKind::Root(Some(source)) => source.advance()?,
                    _ => unreachable!("root handle must carry a Source after process() installs it"),
                };
                match advance {
                    Advance::Emit(data) => {
                        for &(listener, upstream) in &self.nodes[root].listeners {
                            self.push(
                                &mut stack,
                                Envelope::Deliver {
                                    target: listener,
                                    from: upstream,
                                    data: data.clone(),
                                },
                            )?;
                        }
                    }
                    Advance::Pending => {}
                    Advance::Done => {
                        exhausted.insert(root);
                        for &(listener, upstream) in &self.nodes[root].listeners {
                            self.push(&mut stack, Envelope::Finish { target: listener, from: upstream })?;
                        }
                    }
                }

                // Drain fully between root steps rather than batching every
                // root's step together, so a fast-finishing root's chunks
                // reach sinks before a slower root even takes its turn.
                self.drain(&mut stack)?;
            }

            if !advanced_any {
                break;
            }
        }

        Ok(())
    }

    /// Pops the newest envelope first (a LIFO stack): depth-first delivery
    /// keeps chunks moving all the way to sinks before the next root step,
    /// rather than breadth-first fanning out across every node at once.
    fn drain(&mut self, stack: &mut Vec<Envelope>) -> Result<(), EngineError> {
        while let Some(envelope) = stack.pop() {
            match envelope {
                Envelope::Deliver { target, from, data } => self.deliver(target, from, data, stack)?,
                Envelope::Finish { target, from } => self.finish(target, from, stack)?,
            }
        }
        Ok(())
    }

    fn deliver(
        &mut self,
        target: NodeHandle,
        from: UpstreamHandle,
        data: Chunk,
        stack: &mut Vec<Envelope>,
    ) -> Result<(), EngineError> {
        if self.nodes[target].removed || self.nodes[target].finished {
            return Ok(());
        }
        let logic = match &mut self.nodes[target].kind {
            NodeKind::Logic(logic) => logic,
            NodeKind::Root(_) => return Ok(()),
        };
        logic.enqueue(data, from);
        self.nodes[target].enqueued.insert(from);

        self.try_process(target, stack)?;
        self.maybe_finish(target, stack)
    }

    fn finish(&mut self, target: NodeHandle, from: UpstreamHandle, stack: &mut Vec<Envelope>) -> Result<(), EngineError> {
        if self.nodes[target].removed || self.nodes[target].finished {
            return Ok(());
        }
        if let NodeKind::Logic(logic) = &mut self.nodes[target].kind {
            logic.finalize(from);
        }
        self.nodes[target].finalized.insert(from);

        self.try_process(target, stack)?;
        self.maybe_finish(target, stack)
    }

    fn try_process(&mut self, target: NodeHandle, stack: &mut Vec<Envelope>) -> Result<(), EngineError> {
        let finalized = self.nodes[target].is_finalized();
        let node_key = self.nodes[target].key.clone();
        let logic = match &mut self.nodes[target].kind {
            NodeKind::Logic(logic) => logic,
            NodeKind::Root(_) => return Ok(()),
        };
        let dequeued = match logic.dequeue(finalized) {
            Ok(data) => data,
            Err(EngineError::NotEnoughData(_)) => return Ok(()),
            Err(other) => return Err(other),
        };
        let first = logic.first_chunk(dequeued);
        let outputs = logic.process(first).map_err(|source| EngineError::Extraction {
            node: node_key,
            source,
        })?;
        for out in outputs {
            for &(listener, upstream) in &self.nodes[target].listeners {
                self.push(
                    stack,
                    Envelope::Deliver {
                        target: listener,
                        from: upstream,
                        data: out.clone(),
                    },
                )?;
            }
        }
        Ok(())
    }

    fn maybe_finish(&mut self, target: NodeHandle, stack: &mut Vec<Envelope>) -> Result<(), EngineError> {
        if self.nodes[target].finished || !self.nodes[target].is_finalized() {
            return Ok(());
        }
        let node_key = self.nodes[target].key.clone();
        let outputs = match &mut self.nodes[target].kind {
            NodeKind::Logic(logic) => logic.process_final().map_err(|source| EngineError::Extraction {
                node: node_key,
                source,
            })?,
            NodeKind::Root(_) => Vec::new(),
        };
        self.nodes[target].finished = true;
        for out in outputs {
            for &(listener, upstream) in &self.nodes[target].listeners {
                self.push(
                    stack,
                    Envelope::Deliver {
                        target: listener,
                        from: upstream,
                        data: out.clone(),
                    },
                )?;
            }
        }
        for &(listener, upstream) in &self.nodes[target].listeners {
            self.push(stack, Envelope::Finish { target: listener, from: upstream })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{AggregatorClosureNode, ClosureNode, ZipNode};
    use crate::source::ByteStreamSource;
    use std::sync::{Arc, Mutex};

    fn run_with_bytes(graph: &mut Graph, root_key: &str, data: &[u8], chunk_size: usize) {
        let mut sources: HashMap<String, Box<dyn Source>> = HashMap::new();
        sources.insert(root_key.to_string(), Box::new(ByteStreamSource::new(data.to_vec(), chunk_size)));
        graph.process(sources).unwrap();
    }

    #[test]
    fn missing_roots_is_rejected_before_running() {
        let mut graph = Graph::new();
        graph.register_root("text");
        let result = graph.process(HashMap::new());
        assert!(matches!(result, Err(EngineError::MissingRoots(_))));
    }

    /// Splits incoming byte chunks on whitespace, holding back whatever
    /// trails the last whitespace seen so far (it might still be a partial
    /// word) until either more data arrives or the upstream finalizes.
    struct WordTokenizer {
        cache: Option<Chunk>,
        buffer: String,
    }

    impl NodeLogic for WordTokenizer {
        fn name(&self) -> &str {
            "tokenizer"
        }

        fn enqueue(&mut self, data: Chunk, _from: UpstreamHandle) {
            self.cache = Some(data);
        }

        fn dequeue(&mut self, _finalized: bool) -> Result<Chunk, EngineError> {
            self.cache
                .take()
                .ok_or_else(|| EngineError::NotEnoughData(self.name().to_owned()))
        }

        fn process(&mut self, data: Chunk) -> Result<Vec<Chunk>, Box<dyn std::error::Error + Send + Sync>> {
            self.buffer.push_str(data.as_text().unwrap_or(""));
            let mut out = Vec::new();
            if let Some(last_space) = self.buffer.rfind(char::is_whitespace) {
                let complete = self.buffer[..last_space].to_string();
                for word in complete.split_whitespace() {
                    out.push(Chunk::text(word.to_string()));
                }
                self.buffer = self.buffer[last_space + 1..].to_string();
            }
            Ok(out)
        }

        fn process_final(&mut self) -> Result<Vec<Chunk>, Box<dyn std::error::Error + Send + Sync>> {
            let out = self.buffer.split_whitespace().map(Chunk::text).collect();
            self.buffer.clear();
            Ok(out)
        }
    }

    #[test]
    fn word_count_aggregates_tokens() {
        let mut graph = Graph::new();
        let root = graph.register_root("text");

        let tokenizer = WordTokenizer {
            cache: None,
            buffer: String::new(),
        };
        let tokenizer_handle = graph.register_node("tokenizer", &[root], Box::new(tokenizer));

        let counter = AggregatorClosureNode::new("wordcount", true, |items: &[Chunk]| {
            let mut counts = std::collections::BTreeMap::new();
            for item in items {
                if let Some(word) = item.as_text() {
                    *counts.entry(word.to_string()).or_insert(0u64) += 1;
                }
            }
            vec![Chunk::Counts(counts)]
        })
        .unwrap();
        let counter_handle = graph.register_node("wordcount", &[tokenizer_handle], Box::new(counter));

        let captured: Arc<Mutex<Option<Chunk>>> = Arc::new(Mutex::new(None));
        let capture_slot = Arc::clone(&captured);
        let sink = ClosureNode::new("sink", true, move |chunk| {
            *capture_slot.lock().unwrap() = Some(chunk);
            Vec::new()
        })
        .unwrap();
        graph.register_node("sink", &[counter_handle], Box::new(sink));

        run_with_bytes(
            &mut graph,
            "text",
            b"mary had a little lamb little lamb little lamb",
            6,
        );

        let result = captured.lock().unwrap().clone().unwrap();
        match result {
            Chunk::Counts(counts) => {
                assert_eq!(counts["lamb"], 3);
                assert_eq!(counts["a"], 1);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn multi_root_concatenate_preserves_prefixes() {
        let mut graph = Graph::new();
        let left = graph.register_root("left");
        let right = graph.register_root("right");

        let captured: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let zip_capture = Arc::clone(&captured);
        let concat = ZipNode::new("concat", 2, move |slots| {
            let mut out = Vec::new();
            if let Some(c) = slots.get(&0) {
                out.extend_from_slice(c.as_bytes().unwrap_or(&[]));
            }
            if let Some(c) = slots.get(&1) {
                out.extend_from_slice(c.as_bytes().unwrap_or(&[]));
            }
            zip_capture.lock().unwrap().extend_from_slice(&out);
            Chunk::bytes(out)
        });
        graph.register_node("concat", &[left, right], Box::new(concat));

        let mut sources: HashMap<String, Box<dyn Source>> = HashMap::new();
        sources.insert("left".to_string(), Box::new(ByteStreamSource::new(b"mary".to_vec(), 64)));
        sources.insert("right".to_string(), Box::new(ByteStreamSource::new(b"humpty fall".to_vec(), 64)));
        graph.process(sources).unwrap();

        let out = captured.lock().unwrap().clone();
        // Left is registered before right, and the scheduler drains fully
        // between root steps, so "mary" lands before "humpty fall".
        assert_eq!(&out[..6], b"maryhu");
        assert!(out.ends_with(b"fall"));
    }

    #[test]
    fn sum_up_with_rhs_added_on_two_edges() {
        let mut graph = Graph::new();
        let root = graph.register_root("numbers");

        let to_number_plus_one = |c: Chunk| -> Vec<Chunk> {
            match c {
                Chunk::Number(n) => vec![Chunk::Number(n + 1)],
                Chunk::Bytes(b) if b.len() == 1 => vec![Chunk::Number(b[0] as i64 + 1)],
                other => vec![other],
            }
        };
        let left = ClosureNode::new("left_plus_one", true, to_number_plus_one).unwrap();
        let right = ClosureNode::new("right_plus_one", true, to_number_plus_one).unwrap();
        let left_handle = graph.register_node("left_plus_one", &[root], Box::new(left));
        let right_handle = graph.register_node("right_plus_one", &[root], Box::new(right));

        let captured: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
        let sum_capture = Arc::clone(&captured);
        let sum = ZipNode::new("sum", 2, move |slots| {
            let total: i64 = slots
                .values()
                .map(|c| match c {
                    Chunk::Number(n) => *n,
                    _ => 0,
                })
                .sum();
            sum_capture.lock().unwrap().push(total);
            Chunk::Number(total)
        });
        graph.register_node("sum", &[left_handle, right_handle], Box::new(sum));

        let numbers: Vec<u8> = (0..10).collect();
        run_with_bytes(&mut graph, "numbers", &numbers, 1);

        // Each byte 0..9 flows through both +1 edges and is summed; the
        // concatenated digits of the per-tick sums spell "2468101214161820".
        let totals = captured.lock().unwrap().clone();
        let joined: String = totals.iter().map(|n| n.to_string()).collect();
        assert_eq!(joined, "2468101214161820");
    }

    #[test]
    fn dead_leaf_without_a_stored_consumer_is_pruned() {
        let mut graph = Graph::new();
        let root = graph.register_root("text");
        let unused = ClosureNode::new("unused", true, |c| vec![c]).unwrap();
        let unused_handle = graph.register_node("unused", &[root], Box::new(unused));

        let keep = HashSet::new();
        graph.prune_dead_leaves(&keep);

        assert!(graph.nodes[unused_handle].removed);
        assert!(graph.nodes[root].listeners.is_empty());
    }
}
