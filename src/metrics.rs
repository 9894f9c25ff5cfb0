use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters describing ingestion and chat activity.
#[derive(Default)]
pub struct CodeMetrics {
    documents_indexed: AtomicU64,
    empty_documents: AtomicU64,
    chunks_indexed: AtomicU64,
    chunks_skipped: AtomicU64,
    answers: AtomicU64,
    not_ready_answers: AtomicU64,
}

impl CodeMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an ingested document with the number of chunks indexed and skipped for it.
    pub fn record_document(&self, chunk_count: u64, skipped: u64) {
        self.documents_indexed.fetch_add(1, Ordering::Relaxed);
        if chunk_count == 0 {
            self.empty_documents.fetch_add(1, Ordering::Relaxed);
        }
        self.chunks_indexed.fetch_add(chunk_count, Ordering::Relaxed);
        self.chunks_skipped.fetch_add(skipped, Ordering::Relaxed);
    }

    /// Record a grounded answer returned by the chat model.
    pub fn record_answer(&self) {
        self.answers.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a question answered with the not-ready message.
    pub fn record_not_ready(&self) {
        self.not_ready_answers.fetch_add(1, Ordering::Relaxed);
    }

    /// Chat counters only.
    ///
    /// Ingestion runs in the worker process, so a server's own ingestion counters never move.
    pub fn chat_snapshot(&self) -> ChatSnapshot {
        ChatSnapshot {
            answers: self.answers.load(Ordering::Relaxed),
            not_ready_answers: self.not_ready_answers.load(Ordering::Relaxed),
        }
    }

    /// Emit the ingestion counters as one structured log event.
    pub fn log_ingestion(&self, reason: &str) {
        let snapshot = self.snapshot();
        tracing::info!(
            reason,
            documents_indexed = snapshot.documents_indexed,
            empty_documents = snapshot.empty_documents,
            chunks_indexed = snapshot.chunks_indexed,
            chunks_skipped = snapshot.chunks_skipped,
            "Ingestion metrics"
        );
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            documents_indexed: self.documents_indexed.load(Ordering::Relaxed),
            empty_documents: self.empty_documents.load(Ordering::Relaxed),
            chunks_indexed: self.chunks_indexed.load(Ordering::Relaxed),
            chunks_skipped: self.chunks_skipped.load(Ordering::Relaxed),
            answers: self.answers.load(Ordering::Relaxed),
            not_ready_answers: self.not_ready_answers.load(Ordering::Relaxed),
        }
    }
}

/// Chat counters served by `GET /metrics`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSnapshot {
    /// Questions answered by the chat model.
    pub answers: u64,
    /// Questions answered with the not-ready message.
    pub not_ready_answers: u64,
}

/// Immutable view of the counters used for reporting.
#[derive(Debug, Clone, Copy, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// Documents whose ingestion job completed since startup.
    pub documents_indexed: u64,
    /// Completed documents that produced no chunks.
    pub empty_documents: u64,
    /// Chunks written to the vector index.
    pub chunks_indexed: u64,
    /// Chunks dropped because their embedding failed.
    pub chunks_skipped: u64,
    /// Questions answered by the chat model.
    pub answers: u64,
    /// Questions answered with the not-ready message.
    pub not_ready_answers: u64,
}
