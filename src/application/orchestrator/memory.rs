//! Loads past lessons relevant to the ticker/tags under analysis.
//! Grounded on `engine/memory.py`'s `MemoryRetriever`: a thin wrapper
//! over the store's memory index that bounds both recency and count.

use std::sync::Arc;

use chrono::{Duration, Utc};

use crate::domain::memory::Memory;
use crate::infrastructure::store::Store;

pub struct MemoryRetriever {
    store: Arc<Store>,
    max_memories: i64,
    relevance_window: std::time::Duration,
}

impl MemoryRetriever {
    pub fn new(store: Arc<Store>, max_memories: u32, relevance_window: std::time::Duration) -> Self {
        Self {
            store,
            max_memories: max_memories as i64,
            relevance_window,
        }
    }

    pub async fn retrieve(&self, ticker: Option<&str>, tags: Option<&[String]>) -> anyhow::Result<Vec<Memory>> {
        let window = Duration::from_std(self.relevance_window).unwrap_or(Duration::days(90));
        let since = Utc::now() - window;

        let ids = self.store.search_memories(ticker, tags, Some(since), self.max_memories).await?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(memory) = self.store.read_json::<Memory>("memories", &id).await? {
                out.push(memory);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::memory::{DivergenceType, WhoWasRight};
    use tempfile::tempdir;

    #[tokio::test]
    async fn retrieve_returns_empty_with_no_memories() {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.keep()).await.unwrap());
        let retriever = MemoryRetriever::new(store, 10, std::time::Duration::from_secs(90 * 86400));
        let memories = retriever.retrieve(Some("NVDA"), None).await.unwrap();
        assert!(memories.is_empty());
    }

    #[tokio::test]
    async fn retrieve_finds_indexed_memory_by_ticker() {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.keep()).await.unwrap());
        let memory = Memory::new(
            None,
            DivergenceType::HumanInitiated,
            "none",
            "bought anyway",
            WhoWasRight::Human,
            "human conviction outperformed a cautious AI read",
            vec!["NVDA".to_string()],
            0.05,
        );
        store.write_json("memories", &memory.id, &memory).await.unwrap();
        store
            .index_memory(&memory.id, Some("NVDA"), &memory.tags, memory.created_at)
            .await
            .unwrap();

        let retriever = MemoryRetriever::new(store, 10, std::time::Duration::from_secs(90 * 86400));
        let memories = retriever.retrieve(Some("NVDA"), None).await.unwrap();
        assert_eq!(memories.len(), 1);
        assert_eq!(memories[0].id, memory.id);
    }
}
