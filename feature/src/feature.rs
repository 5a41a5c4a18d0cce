use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use common::{DocId, FeatureName, FeatureVersion};
use engine::{
    BincodeDecoder, BincodeEncoder, Chunk, Decoder, EngineError, Graph, GzipDecoder, GzipEncoder, IdentityEncoder,
    JsonDecoder, JsonEncoder, NodeHandle, NodeLogic, RawDecoder, Source, TextDecoder,
};
use log::debug;
use thiserror::Error;

use crate::persistence::PersistenceSettings;
use crate::writer::{CaptureWriter, DecoderNode, PendingWrite, StagingWriter};

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("feature {0:?} cannot be computed: it is not stored and its dependency chain is not fully computable")]
    NotComputable(String),
    #[error(transparent)]
    Key(#[from] common::KeyError),
    #[error(transparent)]
    Store(#[from] store::DataStoreError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("I/O error staging a feature write: {0}")]
    Io(#[from] std::io::Error),
}

type BuildFn = dyn Fn() -> Box<dyn NodeLogic> + Send + Sync;
type EncoderFn = dyn Fn() -> Box<dyn NodeLogic> + Send + Sync;

/// An immutable declaration of one processing step in an extraction graph:
/// an extractor node, its upstream dependencies, whether its result is
/// persisted, and how it is encoded/decoded when it is.
///
/// A `Feature` with no `needs` is a root: its data comes from an external
/// [`Source`] supplied at `process()` time rather than from `build`.
pub struct Feature {
    pub key: FeatureName,
    extractor_type: String,
    extractor_args: Vec<u8>,
    needs: Vec<Arc<Feature>>,
    store: bool,
    persistence: Option<PersistenceSettings>,
    build: Option<Arc<BuildFn>>,
    encoder_factory: Arc<EncoderFn>,
    content_type: &'static str,
    decoder: Arc<dyn Decoder>,
}

impl Feature {
    /// General constructor, equivalent to the reference implementation's
    /// base `Feature.__init__`. `build` is the extractor's `NodeLogic`
    /// factory; leave `needs` empty and `build` unused (pass any factory,
    /// it is never called) to declare a root via [`Feature::root`] instead.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: impl Into<FeatureName>,
        extractor_type: impl Into<String>,
        extractor_args: Vec<u8>,
        needs: Vec<Arc<Feature>>,
        store: bool,
        persistence: Option<PersistenceSettings>,
        build: Arc<BuildFn>,
        encoder_factory: Arc<EncoderFn>,
        content_type: &'static str,
        decoder: Arc<dyn Decoder>,
    ) -> Self {
        Self {
            key: key.into(),
            extractor_type: extractor_type.into(),
            extractor_args,
            needs,
            store,
            persistence,
            build: Some(build),
            encoder_factory,
            content_type,
            decoder,
        }
    }

    /// A root feature: no dependencies, fed by an external `Source` supplied
    /// at `process()` time under its own key.
    pub fn root(
        key: impl Into<FeatureName>,
        store: bool,
        persistence: Option<PersistenceSettings>,
        encoder_factory: Arc<EncoderFn>,
        content_type: &'static str,
        decoder: Arc<dyn Decoder>,
    ) -> Self {
        Self {
            key: key.into(),
            extractor_type: "root".to_string(),
            extractor_args: Vec::new(),
            needs: Vec::new(),
            store,
            persistence,
            build: None,
            encoder_factory,
            content_type,
            decoder,
        }
    }

    /// Stores raw bytes unchanged; the reference `CompressedFeature`'s
    /// un-compressed sibling in this crate's encoder set.
    #[allow(clippy::too_many_arguments)]
    pub fn raw(
        key: impl Into<FeatureName>,
        extractor_type: impl Into<String>,
        extractor_args: Vec<u8>,
        needs: Vec<Arc<Feature>>,
        store: bool,
        persistence: Option<PersistenceSettings>,
        build: Arc<BuildFn>,
    ) -> Self {
        Self::new(
            key,
            extractor_type,
            extractor_args,
            needs,
            store,
            persistence,
            build,
            Arc::new(|| Box::new(IdentityEncoder::default())),
            "application/octet-stream",
            Arc::new(RawDecoder),
        )
    }

    /// Gzip-compresses the stored bytes; substitutes for the reference
    /// implementation's `CompressedFeature` (bzip2).
    #[allow(clippy::too_many_arguments)]
    pub fn compressed(
        key: impl Into<FeatureName>,
        extractor_type: impl Into<String>,
        extractor_args: Vec<u8>,
        needs: Vec<Arc<Feature>>,
        store: bool,
        persistence: Option<PersistenceSettings>,
        build: Arc<BuildFn>,
    ) -> Self {
        Self::new(
            key,
            extractor_type,
            extractor_args,
            needs,
            store,
            persistence,
            build,
            Arc::new(|| Box::new(GzipEncoder::default())),
            "application/gzip",
            Arc::new(GzipDecoder),
        )
    }

    /// Stores a JSON document; corresponds to the reference implementation's
    /// `JSONFeature`.
    #[allow(clippy::too_many_arguments)]
    pub fn json(
        key: impl Into<FeatureName>,
        extractor_type: impl Into<String>,
        extractor_args: Vec<u8>,
        needs: Vec<Arc<Feature>>,
        store: bool,
        persistence: Option<PersistenceSettings>,
        build: Arc<BuildFn>,
    ) -> Self {
        Self::new(
            key,
            extractor_type,
            extractor_args,
            needs,
            store,
            persistence,
            build,
            Arc::new(|| Box::new(JsonEncoder::default())),
            "application/json",
            Arc::new(JsonDecoder),
        )
    }

    /// Binary-codec feature, substituting `bincode` for the reference
    /// implementation's `PickleFeature`.
    #[allow(clippy::too_many_arguments)]
    pub fn bincode(
        key: impl Into<FeatureName>,
        extractor_type: impl Into<String>,
        extractor_args: Vec<u8>,
        needs: Vec<Arc<Feature>>,
        store: bool,
        persistence: Option<PersistenceSettings>,
        build: Arc<BuildFn>,
    ) -> Self {
        Self::new(
            key,
            extractor_type,
            extractor_args,
            needs,
            store,
            persistence,
            build,
            Arc::new(|| Box::new(BincodeEncoder::default())),
            "application/x-bincode",
            Arc::new(BincodeDecoder),
        )
    }

    /// Stores raw bytes, decoded back as UTF-8 text; corresponds to the
    /// reference implementation's `TextFeature`.
    #[allow(clippy::too_many_arguments)]
    pub fn text(
        key: impl Into<FeatureName>,
        extractor_type: impl Into<String>,
        extractor_args: Vec<u8>,
        needs: Vec<Arc<Feature>>,
        store: bool,
        persistence: Option<PersistenceSettings>,
        build: Arc<BuildFn>,
    ) -> Self {
        Self::new(
            key,
            extractor_type,
            extractor_args,
            needs,
            store,
            persistence,
            build,
            Arc::new(|| Box::new(IdentityEncoder::default())),
            "text/plain",
            Arc::new(TextDecoder),
        )
    }

    pub fn is_root(&self) -> bool {
        self.needs.is_empty()
    }

    /// `self.store`, or (not a root, and every dependency can compute).
    /// A root that isn't stored can never be recomputed later: its bytes
    /// came from an external `Source` that existed only for one run.
    pub fn can_compute(&self) -> bool {
        self.store || (!self.is_root() && self.needs.iter().all(|dep| dep.can_compute()))
    }

    pub fn version(&self) -> FeatureVersion {
        FeatureVersion::derive(&self.extractor_type, &self.extractor_args)
    }

    fn effective_persistence<'a>(&'a self, fallback: &'a PersistenceSettings) -> &'a PersistenceSettings {
        self.persistence.as_ref().unwrap_or(fallback)
    }

    /// Idempotently compiles this feature and its dependencies into `graph`.
    /// Used to build the *full* extraction graph for a model's `process()`
    /// run: every root's data comes from the caller-supplied `Source`, not
    /// from the database, so there is no cache check here (see
    /// [`Feature::build_partial`] for that).
    pub fn build_extractor(
        &self,
        graph: &mut Graph,
        doc_id: &DocId,
        fallback: &PersistenceSettings,
        pending: &mut Vec<PendingWrite>,
        keep: &mut std::collections::HashSet<NodeHandle>,
    ) -> Result<NodeHandle, FeatureError> {
        if let Some(handle) = graph.handle_for(&self.key) {
            return Ok(handle);
        }

        let handle = if self.is_root() {
            graph.register_root(self.key.clone())
        } else {
            let mut need_handles = Vec::with_capacity(self.needs.len());
            for dep in &self.needs {
                need_handles.push(dep.build_extractor(graph, doc_id, fallback, pending, keep)?);
            }
            let build = self.build.as_ref().expect("non-root feature must declare a build factory");
            graph.register_node(self.key.clone(), &need_handles, (build)())
        };

        if self.store {
            let writer_handle = self.attach_writer(graph, doc_id, fallback, handle, pending)?;
            keep.insert(writer_handle);
        }

        Ok(handle)
    }

    fn attach_writer(
        &self,
        graph: &mut Graph,
        doc_id: &DocId,
        fallback: &PersistenceSettings,
        handle: NodeHandle,
        pending: &mut Vec<PendingWrite>,
    ) -> Result<NodeHandle, FeatureError> {
        let persistence = self.effective_persistence(fallback);
        let key = persistence.key_builder.build(doc_id, &self.key, &self.version())?;
        let (writer, stage) = StagingWriter::new()?;
        let encoder_handle = graph.register_node(format!("{}_encoder", self.key), &[handle], (self.encoder_factory)());
        let writer_handle = graph.register_node(format!("{}_writer", self.key), &[encoder_handle], Box::new(writer));
        pending.push(PendingWrite {
            key,
            content_type: self.content_type.to_string(),
            database: Arc::clone(&persistence.database),
            stage,
        });
        Ok(writer_handle)
    }

    /// Builds the minimal sub-graph needed to produce this feature's value
    /// given the current cache state. Returns the graph, the sources its
    /// `DecoderNode` roots need, the pending writes for anything newly
    /// computed and stored along the way, and, if this feature itself is
    /// unstored, the in-memory capture buffer its result will land in.
    pub async fn build_partial(
        &self,
        doc_id: &DocId,
        fallback: &PersistenceSettings,
        chunk_size: usize,
    ) -> Result<PartialGraph, FeatureError> {
        let mut graph = Graph::new();
        let mut sources: HashMap<String, Box<dyn Source>> = HashMap::new();
        let mut pending = Vec::new();
        let mut capture = None;

        compile_partial(
            self,
            doc_id,
            fallback,
            &self.key,
            &mut graph,
            &mut sources,
            &mut pending,
            &mut capture,
            chunk_size,
        )
        .await?;

        Ok(PartialGraph {
            graph,
            sources,
            pending,
            capture,
        })
    }

    /// Fetches this feature's value for `doc_id`: a cache hit decodes the
    /// stored bytes directly; a miss builds and runs the partial graph,
    /// persisting anything it newly computes that is marked `store`.
    pub async fn fetch(
        &self,
        doc_id: &DocId,
        fallback: &PersistenceSettings,
        decoder_override: Option<&dyn Decoder>,
        chunk_size: usize,
    ) -> Result<Chunk, FeatureError> {
        let persistence = self.effective_persistence(fallback);
        let key = persistence.key_builder.build(doc_id, &self.key, &self.version())?;

        match persistence.database.read_stream(&key).await {
            Ok(mut stream) => {
                let bytes = stream.read_all().await?;
                debug!("feature {:?} cache hit for doc {}", self.key, doc_id);
                let decoder = decoder_override.unwrap_or(self.decoder.as_ref());
                return Ok(decoder.decode(&bytes)?);
            }
            Err(store::DataStoreError::NotFound(_)) => {}
            Err(other) => return Err(other.into()),
        }

        if !self.can_compute() {
            return Err(FeatureError::NotComputable(self.key.clone()));
        }

        debug!("feature {:?} cache miss for doc {}; building partial graph", self.key, doc_id);
        let PartialGraph {
            mut graph,
            sources,
            pending,
            capture,
        } = self.build_partial(doc_id, fallback, chunk_size).await?;

        if let Err(err) = graph.process(sources) {
            crate::writer::rollback_writes(&pending).await;
            return Err(err.into());
        }
        crate::writer::commit_writes(&pending).await?;

        let bytes = match capture {
            Some(buffer) => buffer.lock().unwrap().clone(),
            None => {
                let mut stream = persistence.database.read_stream(&key).await?;
                stream.read_all().await?
            }
        };
        let decoder = decoder_override.unwrap_or(self.decoder.as_ref());
        Ok(decoder.decode(&bytes)?)
    }
}

/// The compiled output of [`Feature::build_partial`].
pub struct PartialGraph {
    pub graph: Graph,
    pub sources: HashMap<String, Box<dyn Source>>,
    pub pending: Vec<PendingWrite>,
    pub capture: Option<Arc<std::sync::Mutex<Vec<u8>>>>,
}

#[allow(clippy::too_many_arguments)]
fn compile_partial<'a>(
    feature: &'a Feature,
    doc_id: &'a DocId,
    fallback: &'a PersistenceSettings,
    root_of_partial: &'a str,
    graph: &'a mut Graph,
    sources: &'a mut HashMap<String, Box<dyn Source>>,
    pending: &'a mut Vec<PendingWrite>,
    capture: &'a mut Option<Arc<std::sync::Mutex<Vec<u8>>>>,
    chunk_size: usize,
) -> Pin<Box<dyn Future<Output = Result<NodeHandle, FeatureError>> + Send + 'a>> {
    Box::pin(async move {
        if let Some(handle) = graph.handle_for(&feature.key) {
            return Ok(handle);
        }

        let persistence = feature.effective_persistence(fallback);
        let key = persistence.key_builder.build(doc_id, &feature.key, &feature.version())?;
        let stored = persistence.database.exists(&key).await?;
        let is_cached = feature.store && stored;

        if is_cached {
            let mut stream = persistence.database.read_stream(&key).await?;
            let bytes = stream.read_all().await?;
            let handle = graph.register_root(feature.key.clone());
            sources.insert(feature.key.clone(), Box::new(DecoderNode::from_bytes(bytes, chunk_size)));
            return Ok(handle);
        }

        let handle = if feature.is_root() {
            // Only reachable if `can_compute()` was bypassed: an unstored
            // root supplies no bytes here and the caller must have already
            // refused to fetch it.
            graph.register_root(feature.key.clone())
        } else {
            let mut need_handles = Vec::with_capacity(feature.needs.len());
            for dep in &feature.needs {
                need_handles.push(
                    compile_partial(dep, doc_id, fallback, root_of_partial, graph, sources, pending, capture, chunk_size)
                        .await?,
                );
            }
            let build = feature.build.as_ref().expect("non-root feature must declare a build factory");
            graph.register_node(feature.key.clone(), &need_handles, (build)())
        };

        if feature.store {
            let (writer, stage) = StagingWriter::new()?;
            let encoder_handle =
                graph.register_node(format!("{}_encoder", feature.key), &[handle], (feature.encoder_factory)());
            graph.register_node(format!("{}_writer", feature.key), &[encoder_handle], Box::new(writer));
            pending.push(PendingWrite {
                key,
                content_type: feature.content_type.to_string(),
                database: Arc::clone(&persistence.database),
                stage,
            });
        } else if feature.key == root_of_partial {
            let (writer, buffer) = CaptureWriter::new();
            let encoder_handle =
                graph.register_node(format!("{}_encoder", feature.key), &[handle], (feature.encoder_factory)());
            graph.register_node(format!("{}_writer", feature.key), &[encoder_handle], Box::new(writer));
            *capture = Some(buffer);
        }

        Ok(handle)
    })
}
