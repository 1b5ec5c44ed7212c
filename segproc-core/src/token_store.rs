use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{claim_contention, ProcessorError};
use crate::token::GlobalSequenceToken;

/// Durable per-`(processorName, segmentId)` token with an exclusive claim.
///
/// The claim is the only mutual-exclusion mechanism across processes: a
/// segment's Work Package exists in a Coordinator only while that
/// Coordinator holds the claim returned by `fetch_token`.
#[async_trait]
pub trait TokenStore: Send + Sync {
    // ── Bootstrap ──
    async fn initialize_token_segments(
        &self,
        name: &str,
        count: u32,
        initial_token: GlobalSequenceToken,
    ) -> Result<(), ProcessorError>;

    // ── Segment enumeration ──
    async fn fetch_segments(&self, name: &str) -> Result<Vec<u32>, ProcessorError>;

    // ── Claim lifecycle ──
    async fn fetch_token(
        &self,
        name: &str,
        segment_id: u32,
    ) -> Result<GlobalSequenceToken, ProcessorError>;

    async fn store_token(
        &self,
        token: GlobalSequenceToken,
        name: &str,
        segment_id: u32,
    ) -> Result<(), ProcessorError>;

    async fn extend_claim(&self, name: &str, segment_id: u32) -> Result<(), ProcessorError>;

    async fn release_claim(&self, name: &str, segment_id: u32) -> Result<(), ProcessorError>;

    // ── Diagnostics ──
    async fn retrieve_storage_identifier(&self) -> Option<String>;
}

#[derive(Default, Clone)]
struct Entry {
    token: GlobalSequenceToken,
    claimed: bool,
}

#[derive(Default)]
struct Inner {
    segments: HashMap<(String, u32), Entry>,
}

/// In-memory `TokenStore`, the only backend this crate ships — claims are
/// just a boolean per entry, since there is a single process to contend
/// with in-process.
#[derive(Default)]
pub struct InMemoryTokenStore {
    inner: RwLock<Inner>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        InMemoryTokenStore::default()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn initialize_token_segments(
        &self,
        name: &str,
        count: u32,
        initial_token: GlobalSequenceToken,
    ) -> Result<(), ProcessorError> {
        let mut w = self.inner.write().await;
        for segment_id in 0..count {
            w.segments
                .entry((name.to_string(), segment_id))
                .or_insert(Entry {
                    token: initial_token,
                    claimed: false,
                });
        }
        Ok(())
    }

    async fn fetch_segments(&self, name: &str) -> Result<Vec<u32>, ProcessorError> {
        let r = self.inner.read().await;
        let mut ids: Vec<u32> = r
            .segments
            .keys()
            .filter(|(n, _)| n == name)
            .map(|(_, id)| *id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn fetch_token(
        &self,
        name: &str,
        segment_id: u32,
    ) -> Result<GlobalSequenceToken, ProcessorError> {
        let mut w = self.inner.write().await;
        let entry = w
            .segments
            .get_mut(&(name.to_string(), segment_id))
            .ok_or_else(|| ProcessorError::StoreTransient(format!(
                "no such segment {segment_id} for {name}"
            )))?;
        if entry.claimed {
            return Err(claim_contention(name, segment_id));
        }
        entry.claimed = true;
        Ok(entry.token)
    }

    async fn store_token(
        &self,
        token: GlobalSequenceToken,
        name: &str,
        segment_id: u32,
    ) -> Result<(), ProcessorError> {
        let mut w = self.inner.write().await;
        let entry = w
            .segments
            .get_mut(&(name.to_string(), segment_id))
            .ok_or_else(|| ProcessorError::StoreTransient(format!(
                "no such segment {segment_id} for {name}"
            )))?;
        entry.token = token;
        entry.claimed = true;
        Ok(())
    }

    async fn extend_claim(&self, name: &str, segment_id: u32) -> Result<(), ProcessorError> {
        let r = self.inner.read().await;
        match r.segments.get(&(name.to_string(), segment_id)) {
            Some(entry) if entry.claimed => Ok(()),
            Some(_) => Err(claim_contention(name, segment_id)),
            None => Err(ProcessorError::StoreTransient(format!(
                "no such segment {segment_id} for {name}"
            ))),
        }
    }

    async fn release_claim(&self, name: &str, segment_id: u32) -> Result<(), ProcessorError> {
        let mut w = self.inner.write().await;
        if let Some(entry) = w.segments.get_mut(&(name.to_string(), segment_id)) {
            entry.claimed = false;
        }
        Ok(())
    }

    async fn retrieve_storage_identifier(&self) -> Option<String> {
        Some("in-memory".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetch_token_claims_exclusively() {
        let store = InMemoryTokenStore::new();
        store
            .initialize_token_segments("proc", 1, GlobalSequenceToken::ZERO)
            .await
            .unwrap();
        assert!(store.fetch_token("proc", 0).await.is_ok());
        assert!(matches!(
            store.fetch_token("proc", 0).await,
            Err(ProcessorError::ClaimContention { .. })
        ));
        store.release_claim("proc", 0).await.unwrap();
        assert!(store.fetch_token("proc", 0).await.is_ok());
    }

    #[tokio::test]
    async fn store_token_advances_position() {
        let store = InMemoryTokenStore::new();
        store
            .initialize_token_segments("proc", 1, GlobalSequenceToken::ZERO)
            .await
            .unwrap();
        store.fetch_token("proc", 0).await.unwrap();
        store
            .store_token(GlobalSequenceToken::new(5), "proc", 0)
            .await
            .unwrap();
        assert_eq!(store.fetch_segments("proc").await.unwrap(), vec![0]);
    }
}
