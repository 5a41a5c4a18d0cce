use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use uuid::Uuid;

use crate::DocId;

/// The `kwargs` a model's `process()` call was invoked with, made available
/// to the `IdProvider` so that caller-supplied and user-specified strategies
/// can read a value out of it.
pub type IdContext = HashMap<String, String>;

#[derive(Debug, Error)]
pub enum IdProviderError {
    #[error("id provider expected context key {0:?}, but it was not supplied")]
    MissingContextKey(String),
}

/// Mints a fresh [`DocId`] for a `process()` run. `process()` captures the id
/// once and uses it as the `DocId` for every stored feature produced by that
/// run.
pub trait IdProvider: Send + Sync {
    fn new_id(&self, context: &IdContext) -> Result<DocId, IdProviderError>;
}

/// Mints a random v4 UUID per call.
#[derive(Default)]
pub struct UuidProvider;

impl IdProvider for UuidProvider {
    fn new_id(&self, _context: &IdContext) -> Result<DocId, IdProviderError> {
        Ok(DocId::from(Uuid::new_v4()))
    }
}

/// Hands out a monotonically increasing, process-local integer.
pub struct CounterProvider {
    next: AtomicU64,
}

impl Default for CounterProvider {
    fn default() -> Self {
        Self::new(0)
    }
}

impl CounterProvider {
    pub fn new(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }
}

impl IdProvider for CounterProvider {
    fn new_id(&self, _context: &IdContext) -> Result<DocId, IdProviderError> {
        let value = self.next.fetch_add(1, Ordering::SeqCst);
        Ok(DocId::new(value.to_string()))
    }
}

/// Reads the id straight out of the caller-supplied `process()` kwargs under
/// a fixed key.
pub struct CallerSuppliedProvider {
    context_key: String,
}

impl CallerSuppliedProvider {
    pub fn new(context_key: impl Into<String>) -> Self {
        Self {
            context_key: context_key.into(),
        }
    }
}

impl IdProvider for CallerSuppliedProvider {
    fn new_id(&self, context: &IdContext) -> Result<DocId, IdProviderError> {
        context
            .get(&self.context_key)
            .map(|v| DocId::new(v.clone()))
            .ok_or_else(|| IdProviderError::MissingContextKey(self.context_key.clone()))
    }
}

/// Always returns the same, pre-configured id. Useful for tests and for
/// models that only ever track a single document.
pub struct ConstantProvider {
    id: DocId,
}

impl ConstantProvider {
    pub fn new(id: impl Into<DocId>) -> Self {
        Self { id: id.into() }
    }
}

impl IdProvider for ConstantProvider {
    fn new_id(&self, _context: &IdContext) -> Result<DocId, IdProviderError> {
        Ok(self.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_provider_increments() {
        let p = CounterProvider::new(1);
        let ctx = IdContext::new();
        assert_eq!(p.new_id(&ctx).unwrap().as_str(), "1");
        assert_eq!(p.new_id(&ctx).unwrap().as_str(), "2");
    }

    #[test]
    fn caller_supplied_reads_context() {
        let p = CallerSuppliedProvider::new("doc_id");
        let mut ctx = IdContext::new();
        ctx.insert("doc_id".to_string(), "explicit-id".to_string());
        assert_eq!(p.new_id(&ctx).unwrap().as_str(), "explicit-id");
    }

    #[test]
    fn caller_supplied_missing_key_errors() {
        let p = CallerSuppliedProvider::new("doc_id");
        let ctx = IdContext::new();
        assert!(matches!(
            p.new_id(&ctx),
            Err(IdProviderError::MissingContextKey(_))
        ));
    }

    #[test]
    fn constant_provider_is_constant() {
        let p = ConstantProvider::new("fixed");
        let ctx = IdContext::new();
        assert_eq!(p.new_id(&ctx).unwrap().as_str(), "fixed");
        assert_eq!(p.new_id(&ctx).unwrap().as_str(), "fixed");
    }
}
