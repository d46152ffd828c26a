//! Chunked batch execution shared by batch save, read and delete.
//!
//! Items of one chunk run concurrently; the next chunk starts only after the
//! previous one settled. One item's failure never aborts the others.

use std::future::Future;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::error::{Failure, StorageError};
use crate::events::{EventBus, EventKind, StorageEvent};

/// A failed batch item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub key: String,
    #[serde(flatten)]
    pub failure: Failure,
}

/// Per-item outcomes of a batch, in completion order within each chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport<T> {
    pub success: Vec<T>,
    pub failed: Vec<BatchFailure>,
}

impl<T> Default for BatchReport<T> {
    fn default() -> Self {
        Self { success: Vec::new(), failed: Vec::new() }
    }
}

impl<T> BatchReport<T> {
    #[must_use]
    pub fn total(&self) -> usize {
        self.success.len() + self.failed.len()
    }

    /// Emit the aggregate `batch_completed` event for `operation`.
    pub fn announce(&self, events: &EventBus, operation: &str) {
        events.emit(
            StorageEvent::new(EventKind::BatchCompleted)
                .with_data("operation", operation)
                .with_data("totalOperations", self.total())
                .with_data("successCount", self.success.len())
                .with_data("failureCount", self.failed.len()),
        );
    }
}

/// Run `op` over `items` in chunks of `chunk_size`, pausing between chunks.
pub async fn run_chunked<I, T, F, Fut>(
    items: Vec<I>,
    chunk_size: usize,
    pause: Option<Duration>,
    op: F,
) -> BatchReport<T>
where
    F: Fn(I) -> Fut,
    Fut: Future<Output = (String, Result<T, StorageError>)>,
{
    let mut report = BatchReport::default();
    let mut items = items.into_iter().peekable();

    while items.peek().is_some() {
        let chunk: Vec<I> = items.by_ref().take(chunk_size.max(1)).collect();
        for (key, outcome) in join_all(chunk.into_iter().map(&op)).await {
            match outcome {
                Ok(value) => report.success.push(value),
                Err(e) => report.failed.push(BatchFailure { key, failure: Failure::from_error(&e) }),
            }
        }
        if let Some(pause) = pause {
            if items.peek().is_some() {
                tokio::time::sleep(pause).await;
            }
        }
    }

    report
}

#[cfg(test)]
#[path = "batch_test.rs"]
mod tests;
