use std::sync::Arc;

use common::{IdProvider, KeyBuilder};
use store::Database;

/// The `(id_provider, key_builder, database)` bundle a [`crate::Feature`] or a
/// model is bound to. Cloning is cheap (every field is an `Arc`); `with_*`
/// produces a variant with one field replaced, the way the reference
/// implementation's `clone(**overrides)` lets a feature point at an
/// alternate database while inheriting the rest.
#[derive(Clone)]
pub struct PersistenceSettings {
    pub id_provider: Arc<dyn IdProvider>,
    pub key_builder: Arc<dyn KeyBuilder>,
    pub database: Arc<dyn Database>,
}

impl PersistenceSettings {
    pub fn new(
        id_provider: Arc<dyn IdProvider>,
        key_builder: Arc<dyn KeyBuilder>,
        database: Arc<dyn Database>,
    ) -> Self {
        Self {
            id_provider,
            key_builder,
            database,
        }
    }

    pub fn with_database(&self, database: Arc<dyn Database>) -> Self {
        Self {
            database,
            ..self.clone()
        }
    }
}
