//! Record source contract + mock marketplace + chunked batch fetcher.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dealwatch_core::DiscountRecord;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::debug;

pub const CRATE_NAME: &str = "dealwatch-source";

/// Chunk size the original demo used; one concurrent worker per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 10;
pub const DEFAULT_MAX_WORKERS: usize = 8;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source unreachable for product {id}: {reason}")]
    Unreachable { id: i64, reason: String },
    #[error("malformed record for product {id}: {reason}")]
    Malformed { id: i64, reason: String },
    #[error("fetch worker panicked")]
    WorkerPanicked,
}

/// The external-collaborator seam: a real marketplace client plugs in here.
///
/// Implementations must be treated as fallible even though [`MockMarketplace`]
/// never fails; callers may not assume success.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch(&self, id: i64) -> Result<DiscountRecord, SourceError>;
}

/// Mock source that synthesizes a record arithmetically from the id.
///
/// `price = 100 - id`, `discount = id mod 20`. Optional per-record latency
/// stands in for network delay; off by default.
#[derive(Debug, Clone, Default)]
pub struct MockMarketplace {
    latency: Duration,
}

impl MockMarketplace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self { latency }
    }
}

#[async_trait]
impl RecordSource for MockMarketplace {
    async fn fetch(&self, id: i64) -> Result<DiscountRecord, SourceError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(DiscountRecord {
            id,
            name: format!("Product {id}"),
            price: (100 - id) as f64,
            discount: (id % 20) as f64,
            last_updated: Utc::now(),
        })
    }
}

/// Retrieves a batch of records: fixed-size chunks, one worker per chunk,
/// bounded by a semaphore, results concatenated in chunk order.
#[derive(Debug, Clone, Copy)]
pub struct BatchFetcher {
    chunk_size: usize,
    max_workers: usize,
}

impl Default for BatchFetcher {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_workers: DEFAULT_MAX_WORKERS,
        }
    }
}

impl BatchFetcher {
    pub fn new(chunk_size: usize, max_workers: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            max_workers: max_workers.max(1),
        }
    }

    /// Fetch every id, preserving input order in the output.
    ///
    /// Within a chunk records are fetched sequentially; chunks run
    /// concurrently. The first failing chunk aborts the whole batch; no
    /// retry, the next scheduled cycle is the recovery mechanism.
    pub async fn fetch_all(
        &self,
        source: &Arc<dyn RecordSource>,
        ids: &[i64],
    ) -> Result<Vec<DiscountRecord>, SourceError> {
        let limit = Arc::new(Semaphore::new(self.max_workers));
        let mut workers = Vec::new();

        for chunk in ids.chunks(self.chunk_size) {
            let chunk = chunk.to_vec();
            let source = Arc::clone(source);
            let limit = Arc::clone(&limit);
            workers.push(tokio::spawn(async move {
                let _permit = limit.acquire_owned().await.expect("semaphore not closed");
                let mut records = Vec::with_capacity(chunk.len());
                for id in chunk {
                    records.push(source.fetch(id).await?);
                }
                Ok::<_, SourceError>(records)
            }));
        }

        // Join in spawn order so order across chunks is preserved.
        let mut out = Vec::with_capacity(ids.len());
        for worker in workers {
            let chunk = worker.await.map_err(|_| SourceError::WorkerPanicked)??;
            out.extend(chunk);
        }
        debug!(requested = ids.len(), fetched = out.len(), "batch fetch complete");
        Ok(out)
    }
}
