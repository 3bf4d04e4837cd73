//! Journal
//!
//! Append-only sink for per-request records. Writers never block the
//! response path: records go onto a bounded queue drained by one background
//! task. Backpressure is absorbed by waiting off-path, not by dropping —
//! losing a record is not acceptable, delaying one is.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::storage::Store;

/// One completed (or rejected) request. Created once, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRecord {
    pub request_id: Uuid,
    pub user_id: Uuid,
    pub agent_id: Option<Uuid>,
    pub provider: String,
    pub model_original: String,
    pub model_effective: String,
    pub endpoint: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub cost_usd: Decimal,
    pub latency_ms: u64,
    pub status_code: u16,
    pub streaming: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Journal {
    tx: mpsc::Sender<JournalRecord>,
}

impl Journal {
    /// Spawn the writer task and return the handle used by the pipeline.
    pub fn new(store: Arc<Store>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<JournalRecord>(capacity);

        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                tracing::debug!(
                    request_id = %record.request_id,
                    model = %record.model_effective,
                    cost_usd = %record.cost_usd,
                    status = record.status_code,
                    "journal write"
                );
                store.append_journal(record);
            }
        });

        Self { tx }
    }

    /// Enqueue a record from async context. Waits when the queue is full;
    /// a send failure (writer gone) is logged and swallowed — journal
    /// failure never surfaces to the client.
    pub async fn append(&self, record: JournalRecord) {
        if let Err(e) = self.tx.send(record).await {
            tracing::error!(error = %e, "journal writer unavailable, record lost");
        }
    }

    /// Enqueue without awaiting: the happy path is a lock-free push, and a
    /// full queue falls back to an off-path task that waits for space.
    pub fn append_detached(&self, record: JournalRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(record)) => {
                tracing::warn!("journal queue full, deferring write");
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = tx.send(record).await {
                        tracing::error!(error = %e, "journal writer unavailable, record lost");
                    }
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::error!("journal writer unavailable, record lost");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn record(user_id: Uuid) -> JournalRecord {
        JournalRecord {
            request_id: Uuid::new_v4(),
            user_id,
            agent_id: None,
            provider: "anthropic".into(),
            model_original: "claude-opus-4".into(),
            model_effective: "claude-sonnet-4-5".into(),
            endpoint: "/v1/messages".into(),
            input_tokens: 1000,
            output_tokens: 500,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
            cost_usd: dec!(0.0105),
            latency_ms: 420,
            status_code: 200,
            streaming: false,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn records_reach_the_store() {
        let store = Arc::new(Store::new());
        let journal = Journal::new(store.clone(), 16);
        let user = Uuid::new_v4();

        journal.append(record(user)).await;
        journal.append_detached(record(user));

        // Writer task drains asynchronously.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(store.journal_len(), 2);
    }

    #[tokio::test]
    async fn queue_overflow_defers_instead_of_dropping() {
        let store = Arc::new(Store::new());
        let journal = Journal::new(store.clone(), 1);
        let user = Uuid::new_v4();

        for _ in 0..20 {
            journal.append_detached(record(user));
        }

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(store.journal_len(), 20);
    }
}
