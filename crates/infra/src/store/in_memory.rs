use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use docpipe_core::{DocumentId, IndexName, Pipeline};

use super::{JobStateStore, StoreError};

type Key = (IndexName, DocumentId);

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    pipelines: RwLock<HashMap<Key, Pipeline>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.pipelines.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> StoreError {
    StoreError::Storage("lock poisoned".to_string())
}

#[async_trait]
impl JobStateStore for InMemoryJobStore {
    async fn create(&self, pipeline: &Pipeline) -> Result<u64, StoreError> {
        let key = (pipeline.index.clone(), pipeline.document_id.clone());
        let mut pipelines = self.pipelines.write().map_err(|_| poisoned())?;
        if pipelines.contains_key(&key) {
            return Err(StoreError::already_exists(&key.0, &key.1));
        }
        let mut stored = pipeline.clone();
        stored.revision = 1;
        pipelines.insert(key, stored);
        Ok(1)
    }

    async fn load(
        &self,
        index: &IndexName,
        document_id: &DocumentId,
    ) -> Result<Pipeline, StoreError> {
        let pipelines = self.pipelines.read().map_err(|_| poisoned())?;
        pipelines
            .get(&(index.clone(), document_id.clone()))
            .cloned()
            .ok_or_else(|| StoreError::not_found(index, document_id))
    }

    async fn compare_and_swap(
        &self,
        pipeline: &Pipeline,
        expected: u64,
    ) -> Result<u64, StoreError> {
        let key = (pipeline.index.clone(), pipeline.document_id.clone());
        let mut pipelines = self.pipelines.write().map_err(|_| poisoned())?;
        let current = pipelines
            .get_mut(&key)
            .ok_or_else(|| StoreError::not_found(&key.0, &key.1))?;

        if current.revision != expected {
            return Err(StoreError::Conflict {
                expected,
                actual: current.revision,
            });
        }

        let mut next = pipeline.clone();
        next.revision = expected + 1;
        *current = next;
        Ok(expected + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;

    #[tokio::test]
    async fn satisfies_store_contract() {
        let store = InMemoryJobStore::new();
        contract::run_all(&store).await;
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn concurrent_cas_has_exactly_one_winner() {
        let store = InMemoryJobStore::arc();
        let p = contract::sample("race");
        store.create(&p).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let mut p = p.clone();
            tasks.push(tokio::spawn(async move {
                p.mark_running().unwrap();
                store.compare_and_swap(&p, 1).await
            }));
        }

        let mut wins = 0;
        for t in tasks {
            if t.await.unwrap().is_ok() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }
}
