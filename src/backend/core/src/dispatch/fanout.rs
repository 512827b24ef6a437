//! Apply each operation to several index backends.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;

use super::{IndexError, IndexWriter};
use crate::coalesce::CoalescedOperation;

/// Writes to every backend concurrently. An operation succeeds only if all
/// backends accept it; otherwise the most severe error is reported.
///
/// Backends must tolerate re-delivery, since a failure on one backend causes
/// the operation to be retried on all of them.
pub struct FanoutIndexWriter {
    name: String,
    backends: Vec<Arc<dyn IndexWriter>>,
}

impl FanoutIndexWriter {
    pub fn new(backends: Vec<Arc<dyn IndexWriter>>) -> Self {
        let name = backends
            .iter()
            .map(|b| b.name())
            .collect::<Vec<_>>()
            .join("+");
        Self { name, backends }
    }

    pub fn backends(&self) -> &[Arc<dyn IndexWriter>] {
        &self.backends
    }
}

#[async_trait]
impl IndexWriter for FanoutIndexWriter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, operation: &CoalescedOperation) -> Result<(), IndexError> {
        let results = join_all(self.backends.iter().map(|b| b.apply(operation))).await;

        let worst = results
            .into_iter()
            .zip(&self.backends)
            .filter_map(|(result, backend)| {
                result.err().map(|e| {
                    IndexError::new(e.kind, format!("{}: {}", backend.name(), e.message))
                })
            })
            .max_by_key(|e| e.kind.severity());

        match worst {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn health_check(&self) -> bool {
        join_all(self.backends.iter().map(|b| b.health_check()))
            .await
            .into_iter()
            .all(|healthy| healthy)
    }
}
