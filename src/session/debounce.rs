//! Debounced persistence of content changes.
//!
//! Rapid successive edits to one document coalesce into a single store
//! write after a quiet period, bounding write amplification. Only the
//! most recent snapshot in a window is ever persisted; the timer is a
//! cancellable task handle keyed by document id, replaced on every
//! reschedule so no timers leak across document lifecycles.
//!
//! A failed flush is logged and dropped; the write is retried only when
//! a subsequent edit schedules the document again.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::DocumentId;
use crate::store::{DocumentPatch, DocumentStore, StoreResult};

/// The latest unsaved snapshot for one document, plus its quiet-period
/// timer. Superseded (not queued) by each new change in the window.
struct PendingWrite {
    content: String,
    modified_by: String,
    seq: u64,
    timer: JoinHandle<()>,
}

/// Coalesces content changes per document into debounced store writes.
pub struct ChangeDebouncer {
    store: Arc<dyn DocumentStore>,
    pending: Arc<DashMap<DocumentId, PendingWrite>>,
    quiet_period: Duration,
    seq: AtomicU64,
}

impl ChangeDebouncer {
    pub fn new(store: Arc<dyn DocumentStore>, quiet_period: Duration) -> Self {
        Self {
            store,
            pending: Arc::new(DashMap::new()),
            quiet_period,
            seq: AtomicU64::new(0),
        }
    }

    /// Record `(content, modified_by)` as the pending write for the
    /// document, restarting the quiet-period timer.
    pub fn schedule(
        &self,
        document_id: &str,
        content: impl Into<String>,
        modified_by: impl Into<String>,
    ) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let content = content.into();
        let modified_by = modified_by.into();

        let timer = {
            let store = self.store.clone();
            let pending = self.pending.clone();
            let document_id = document_id.to_string();
            let quiet_period = self.quiet_period;

            tokio::spawn(async move {
                tokio::time::sleep(quiet_period).await;

                // A newer schedule or a forced flush may have taken the
                // slot; only this timer's own snapshot is written.
                let taken = pending.remove_if(&document_id, |_, write| write.seq == seq);
                if let Some((_, write)) = taken {
                    write_snapshot(&store, &document_id, write.content, &write.modified_by).await;
                }
            })
        };

        let replaced = self.pending.insert(
            document_id.to_string(),
            PendingWrite {
                content,
                modified_by,
                seq,
                timer,
            },
        );

        if let Some(old) = replaced {
            old.timer.abort();
        }
    }

    /// Persist the pending write immediately, outside the debounce window.
    /// Returns false when nothing was pending.
    pub async fn flush(&self, document_id: &str) -> StoreResult<bool> {
        let Some((_, write)) = self.pending.remove(document_id) else {
            return Ok(false);
        };
        write.timer.abort();

        self.store
            .update(
                document_id,
                DocumentPatch::content(write.content),
                &write.modified_by,
            )
            .await?;

        debug!("Flushed pending write for document {}", document_id);
        Ok(true)
    }

    /// Remove the pending write without persisting it, returning the
    /// `(content, modified_by)` snapshot for the caller to handle.
    pub fn take(&self, document_id: &str) -> Option<(String, String)> {
        let (_, write) = self.pending.remove(document_id)?;
        write.timer.abort();
        Some((write.content, write.modified_by))
    }

    /// Drop the pending write without persisting it.
    pub fn cancel(&self, document_id: &str) -> bool {
        self.take(document_id).is_some()
    }

    /// The not-yet-persisted content for a document, if any. Joiners read
    /// through this overlay so their initial load is never staler than
    /// the newest broadcast edit.
    pub fn pending_content(&self, document_id: &str) -> Option<String> {
        self.pending.get(document_id).map(|w| w.content.clone())
    }

    pub fn has_pending(&self, document_id: &str) -> bool {
        self.pending.contains_key(document_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Flush every pending write; clean-shutdown hook. Returns the number
    /// of documents persisted.
    pub async fn flush_all(&self) -> usize {
        let ids: Vec<DocumentId> = self.pending.iter().map(|e| e.key().clone()).collect();

        let mut flushed = 0;
        for id in ids {
            match self.flush(&id).await {
                Ok(true) => flushed += 1,
                Ok(false) => {}
                Err(e) => error!("Failed to flush document {}: {}", id, e),
            }
        }
        flushed
    }
}

async fn write_snapshot(
    store: &Arc<dyn DocumentStore>,
    document_id: &str,
    content: String,
    modified_by: &str,
) {
    match store
        .update(document_id, DocumentPatch::content(content), modified_by)
        .await
    {
        Ok(_) => debug!("Persisted debounced write for document {}", document_id),
        Err(e) => error!("Failed to persist document {}: {}", document_id, e),
    }
}
