//! Batched upserts into the base tables
//!
//! The record stream is cut into fixed-size batches. Each batch is
//! de-duplicated by natural key and written with retry. A batch that still
//! fails ends the load with [`EtlError::LoadFailure`] carrying the offset of
//! its first record; batches already written stay written.

use crate::config::EtlConfig;
use crate::error::{EtlError, EtlResult};
use crate::models::{Dataset, Record};
use crate::store::{RecordBatch, Store, StoreResult};
use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct BulkLoader {
    store: Arc<dyn Store>,
    batch_size: usize,
    max_retries: u32,
    retry_backoff: Duration,
}

impl BulkLoader {
    pub fn new(store: Arc<dyn Store>, config: &EtlConfig) -> Self {
        Self {
            store,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries.max(1),
            retry_backoff: config.retry_backoff(),
        }
    }

    /// Write every record of `records` into the table of `dataset`.
    /// Returns the number of rows written.
    pub async fn load<S>(
        &self,
        dataset: Dataset,
        records: S,
        cancel: &CancellationToken,
    ) -> EtlResult<u64>
    where
        S: Stream<Item = Record> + Send,
    {
        let started = Instant::now();
        let mut batches = std::pin::pin!(records.chunks(self.batch_size));
        let mut offset: u64 = 0;
        let mut written: u64 = 0;
        let mut batch_count: u64 = 0;

        while let Some(chunk) = batches.next().await {
            if cancel.is_cancelled() {
                info!(dataset = %dataset, offset, "Load cancelled");
                return Err(EtlError::Cancelled);
            }

            let consumed = chunk.len() as u64;
            let batch = RecordBatch::from_records(dataset, chunk).dedup_by_key();

            written += self
                .write_with_retry(&batch)
                .await
                .map_err(|source| EtlError::LoadFailure {
                    dataset,
                    offset,
                    source,
                })?;

            offset += consumed;
            batch_count += 1;
            debug!(dataset = %dataset, batch = batch_count, offset, "Batch written");
        }

        info!(
            dataset = %dataset,
            records = offset,
            written,
            batches = batch_count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Dataset loaded"
        );
        Ok(written)
    }

    async fn write_with_retry(&self, batch: &RecordBatch) -> StoreResult<u64> {
        let mut attempt = 1;
        loop {
            match self.store.upsert(batch).await {
                Ok(written) => return Ok(written.min(batch.len() as u64)),
                Err(e) if attempt < self.max_retries => {
                    warn!(
                        dataset = %batch.dataset(),
                        attempt,
                        max_retries = self.max_retries,
                        error = %e,
                        "Batch upsert failed, retrying"
                    );
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                    attempt += 1;
                },
                Err(e) => return Err(e),
            }
        }
    }
}
