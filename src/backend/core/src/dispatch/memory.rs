//! In-process index backend.
//!
//! Documents are built by a [`DocumentMapper`] supplied by the embedding
//! application; the relay itself never looks inside entities.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use super::{IndexError, IndexWriter};
use crate::coalesce::{CoalescedOperation, IndexAction};
use crate::outbox::EntityRef;

/// Maps an entity to its current indexable document.
pub type DocumentMapper =
    Arc<dyn Fn(&EntityRef) -> Result<serde_json::Value, IndexError> + Send + Sync>;

/// Mapper producing `{"type": .., "id": ..}`.
pub fn default_mapper() -> DocumentMapper {
    Arc::new(|entity: &EntityRef| {
        Ok(serde_json::json!({
            "type": entity.entity_type,
            "id": entity.entity_id,
        }))
    })
}

/// A stored document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedDocument {
    pub entity: EntityRef,
    pub body: serde_json::Value,
    pub routing_key: Option<String>,
    /// Number of writes applied to this document.
    pub version: u64,
}

/// Document map held in memory.
pub struct InMemoryIndex {
    name: String,
    mapper: DocumentMapper,
    documents: RwLock<HashMap<EntityRef, IndexedDocument>>,
    injected: Mutex<VecDeque<IndexError>>,
    applied: Mutex<Vec<(EntityRef, IndexAction)>>,
}

impl InMemoryIndex {
    pub fn new(name: impl Into<String>, mapper: DocumentMapper) -> Self {
        Self {
            name: name.into(),
            mapper,
            documents: RwLock::new(HashMap::new()),
            injected: Mutex::new(VecDeque::new()),
            applied: Mutex::new(Vec::new()),
        }
    }

    /// Make the next `apply` calls fail with these errors, in order.
    pub fn inject_failures(&self, errors: impl IntoIterator<Item = IndexError>) {
        self.injected.lock().extend(errors);
    }

    pub fn get(&self, entity: &EntityRef) -> Option<IndexedDocument> {
        self.documents.read().get(entity).cloned()
    }

    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }

    /// Every successfully applied operation, in application order.
    pub fn applied(&self) -> Vec<(EntityRef, IndexAction)> {
        self.applied.lock().clone()
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new("memory", default_mapper())
    }
}

#[async_trait]
impl IndexWriter for InMemoryIndex {
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, operation: &CoalescedOperation) -> Result<(), IndexError> {
        if let Some(error) = self.injected.lock().pop_front() {
            return Err(error);
        }

        match operation.action {
            IndexAction::Delete => {
                self.documents.write().remove(&operation.entity);
            }
            IndexAction::Add | IndexAction::Update => {
                let body = (self.mapper)(&operation.entity)?;
                let mut documents = self.documents.write();
                let version = documents.get(&operation.entity).map_or(0, |d| d.version) + 1;
                documents.insert(
                    operation.entity.clone(),
                    IndexedDocument {
                        entity: operation.entity.clone(),
                        body,
                        routing_key: operation.routing_key.clone(),
                        version,
                    },
                );
            }
        }

        self.applied
            .lock()
            .push((operation.entity.clone(), operation.action));
        Ok(())
    }
}
