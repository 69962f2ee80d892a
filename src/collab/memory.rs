//! Keyword memory backed by the runtime database

use async_trait::async_trait;
use std::sync::Arc;

use super::{Memory, MemoryRecord, Passage};
use crate::error::CollabError;
use crate::store::Store;

pub struct SqliteMemory {
    store: Arc<Store>,
}

impl SqliteMemory {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

fn store_err(e: crate::error::StoreError) -> CollabError {
    CollabError::Transient(format!("memory store: {}", e))
}

#[async_trait]
impl Memory for SqliteMemory {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<Passage>, CollabError> {
        self.store.search_memories(query, k).map_err(store_err)
    }

    async fn store(&self, record: MemoryRecord) -> Result<(), CollabError> {
        self.store.insert_memory(&record).map_err(store_err)
    }

    async fn maintain(&self) -> Result<usize, CollabError> {
        self.store.dedupe_memories().map_err(store_err)
    }
}
