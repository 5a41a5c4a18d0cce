use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use common::{DocId, FeatureName, IdContext};
use engine::{Chunk, Graph, Source};
use feature::{Feature, FeatureError, PersistenceSettings};
use log::{info, warn};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model has no feature named {0:?}")]
    UnknownFeature(String),
    #[error(transparent)]
    Id(#[from] common::IdProviderError),
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error(transparent)]
    Engine(#[from] engine::EngineError),
    #[error(transparent)]
    Store(#[from] store::DataStoreError),
}

/// A named bundle of [`Feature`] declarations bound to a single
/// [`PersistenceSettings`] carrier. Corresponds to the reference
/// implementation's `BaseModel` + `MetaModel`, with the class-body feature
/// collection replaced by an explicit, ordered registry built at
/// construction (composition of lists stands in for inheritance).
#[derive(Clone)]
pub struct Model {
    features: Arc<Vec<(FeatureName, Arc<Feature>)>>,
    persistence: PersistenceSettings,
    chunk_size: usize,
}

impl Model {
    pub fn new(
        features: Vec<(FeatureName, Arc<Feature>)>,
        persistence: PersistenceSettings,
        chunk_size: usize,
    ) -> Self {
        Self {
            features: Arc::new(features),
            persistence,
            chunk_size,
        }
    }

    pub fn feature(&self, key: &str) -> Option<&Arc<Feature>> {
        self.features.iter().find(|(name, _)| name == key).map(|(_, f)| f)
    }

    /// Mints a `DocId`, compiles the full extraction graph for every
    /// declared feature, prunes unstored leaves, runs it against the
    /// supplied root sources, and persists every stored feature's result.
    /// Any failure rolls back whatever was written for this `docId` and
    /// propagates the error.
    pub async fn process(&self, context: &IdContext, sources: HashMap<String, Box<dyn Source>>) -> Result<DocId, ModelError> {
        let doc_id = self.persistence.id_provider.new_id(context)?;

        let mut graph = Graph::new();
        let mut pending = Vec::new();
        let mut keep = HashSet::new();
        for (_, feature) in self.features.iter() {
            feature.build_extractor(&mut graph, &doc_id, &self.persistence, &mut pending, &mut keep)?;
        }
        graph.prune_dead_leaves(&keep);

        if let Err(err) = graph.process(sources) {
            warn!("process() failed for doc {}: {}; rolling back", doc_id, err);
            feature::rollback_writes(&pending).await;
            return Err(err.into());
        }

        if let Err(err) = feature::commit_writes(&pending).await {
            warn!("commit failed for doc {}: {}; rolling back", doc_id, err);
            feature::rollback_writes(&pending).await;
            return Err(err.into());
        }

        info!("process() committed doc {}", doc_id);
        Ok(doc_id)
    }

    /// Binds an already-known `DocId` to this model, returning an accessor
    /// for its features.
    pub fn document(&self, doc_id: DocId) -> Document {
        Document {
            model: self.clone(),
            doc_id,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Streams every distinct `DocId` this model's database currently holds
    /// at least one stored feature for.
    pub async fn iterate(&self) -> Result<Vec<Document>, ModelError> {
        let ids = self
            .persistence
            .database
            .iter_ids(self.persistence.key_builder.as_ref())
            .await?;
        Ok(ids.into_iter().map(|id| self.document(id)).collect())
    }
}

/// One instance of a `Model`, bound to a `DocId`. Feature access is an
/// explicit, memoized accessor rather than attribute-access magic (Design
/// Note: `__getattribute__` lazy fetch → explicit methods + explicit map).
pub struct Document {
    model: Model,
    doc_id: DocId,
    cache: Mutex<HashMap<FeatureName, Chunk>>,
}

impl Document {
    pub fn id(&self) -> &DocId {
        &self.doc_id
    }

    /// Fetches and memoizes the named feature's value, computing it (and
    /// persisting it, if stored) on first access.
    pub async fn get(&self, key: &str) -> Result<Chunk, ModelError> {
        if let Some(cached) = self.cache.lock().unwrap().get(key) {
            return Ok(cached.clone());
        }
        let feature = self
            .model
            .feature(key)
            .ok_or_else(|| ModelError::UnknownFeature(key.to_string()))?;
        let value = feature
            .fetch(&self.doc_id, &self.model.persistence, None, self.model.chunk_size)
            .await?;
        self.cache.lock().unwrap().insert(key.to_string(), value.clone());
        Ok(value)
    }
}
