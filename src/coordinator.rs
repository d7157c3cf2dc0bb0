//! Processing coordinator — the top-level orchestrator.
//!
//! Pulls newly captured entries off the inbound queue (and, on startup,
//! out of the journal), bounds concurrency, and drives each entry
//! through extract → decide → execute → record. Per-entry state machine:
//! `unprocessed → processing → {processed | failed}`.
//!
//! Failure policy: extraction is best-effort (empty facts on failure),
//! action failures are isolated from siblings and from the entry, and
//! only the inability to write any processing record at all marks the
//! entry `failed`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::decision;
use crate::executor::ActionExecutor;
use crate::extractor::{fallback_facts, TextExtractor};
use crate::store::{StateStore, StoreError};
use crate::types::{Action, Entry, EntryStatus, ExtractedFacts, ProcessingRecord};

/// Cap on simultaneously processing entries; bounds both outbound
/// extraction calls and permission-prompt contention.
pub const MAX_CONCURRENT_ENTRIES: usize = 5;

/// Version tag stamped into each processing record.
pub const PIPELINE_VERSION: &str = "extract-v1";

/// Errors that mark an entry `failed` rather than `processed`.
#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    /// The state store refused or vanished before a record was written.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Owns the pipeline components and drives entries through them.
///
/// Constructed once at startup with its collaborators injected; clones
/// of the store handle are the only shared state it hands out.
pub struct ProcessingCoordinator {
    extractor: TextExtractor,
    executor: Arc<ActionExecutor>,
    store: StateStore,
    limiter: Arc<Semaphore>,
    in_flight: Mutex<HashSet<Uuid>>,
}

impl ProcessingCoordinator {
    /// Create a coordinator over the injected components.
    pub fn new(extractor: TextExtractor, executor: Arc<ActionExecutor>, store: StateStore) -> Self {
        Self {
            extractor,
            executor,
            store,
            limiter: Arc::new(Semaphore::new(MAX_CONCURRENT_ENTRIES)),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Re-enqueue entries that were captured but never processed
    /// (startup recovery). Processes them to completion.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError`] when the store is unreachable.
    pub async fn recover(self: Arc<Self>) -> Result<(), CoordinationError> {
        let pending = self.store.unprocessed_entries().await?;
        if pending.is_empty() {
            return Ok(());
        }
        info!(count = pending.len(), "recovering unprocessed entries");
        let mut handles = Vec::with_capacity(pending.len());
        for entry in pending {
            let coordinator = Arc::clone(&self);
            handles.push(tokio::spawn(async move {
                coordinator.process_entry(entry.id).await
            }));
        }
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "recovered entry failed"),
                Err(e) => warn!(error = %e, "recovery task panicked"),
            }
        }
        Ok(())
    }

    /// Run the processing loop over the inbound entry queue until the
    /// capture side closes it. Each entry is registered with the store
    /// and processed on its own task, capped by the concurrency limit.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<Entry>) {
        while let Some(entry) = inbound.recv().await {
            let entry_id = entry.id;
            if let Err(e) = self.store.insert_entry(entry).await {
                warn!(entry_id = %entry_id, error = %e, "could not register entry");
                continue;
            }
            let coordinator = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = coordinator.process_entry(entry_id).await {
                    warn!(entry_id = %entry_id, error = %e, "entry processing failed");
                }
            });
        }
        debug!("inbound queue closed, coordinator stopping");
    }

    /// Drive one entry through the full pipeline.
    ///
    /// Entries already `processing` or `processed` are skipped: an entry
    /// enters `processing` exactly once per attempt, and re-submitting a
    /// processed entry creates neither a second record nor duplicate
    /// actions.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError`] only when no processing record
    /// could be written (the entry is then `failed`).
    pub async fn process_entry(&self, entry_id: Uuid) -> Result<(), CoordinationError> {
        // Duplicate-attempt guard across concurrent submissions.
        if !self
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(entry_id)
        {
            debug!(entry_id = %entry_id, "entry already in flight, skipping");
            return Ok(());
        }
        let result = self.process_inner(entry_id).await;
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&entry_id);
        result
    }

    async fn process_inner(&self, entry_id: Uuid) -> Result<(), CoordinationError> {
        let (entry, _) = self.store.snapshot(entry_id).await?;
        if entry.status != EntryStatus::Unprocessed {
            debug!(entry_id = %entry_id, status = ?entry.status, "entry not unprocessed, skipping");
            return Ok(());
        }

        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| StoreError::Unreachable)?;

        let started = Instant::now();
        self.mark_or_fail(entry_id, EntryStatus::Processing).await?;
        info!(entry_id = %entry_id, kind = ?entry.kind, "processing entry");

        // Extraction is best-effort: any failure degrades to empty facts
        // rather than abandoning the entry.
        let (mut facts, tokens_used) = match self.extractor.extract(&entry.content).await {
            Ok(output) => (output.facts, output.tokens_used),
            Err(e) => {
                warn!(entry_id = %entry_id, error = %e, "extraction failed, proceeding with empty facts");
                (ExtractedFacts::default(), None)
            }
        };
        facts.merge_missing(fallback_facts(&entry.content));

        let specs = decision::decide(entry.kind, &entry.content, &facts);
        let actions: Vec<Action> = specs.into_iter().map(Action::from_spec).collect();
        debug!(entry_id = %entry_id, count = actions.len(), "actions decided");

        if let Err(e) = self.store.set_actions(entry_id, actions.clone()).await {
            return self.fail_entry(entry_id, e).await;
        }

        // Every action runs on its own task; one failure cancels nothing.
        let mut handles = Vec::with_capacity(actions.len());
        for action in actions {
            let executor = Arc::clone(&self.executor);
            handles.push(tokio::spawn(async move {
                executor.execute(entry_id, &action).await
            }));
        }
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(entry_id = %entry_id, error = %e, "action task panicked; siblings unaffected");
            }
        }

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let record = ProcessingRecord {
            timestamp: Utc::now(),
            pipeline_version: PIPELINE_VERSION.to_owned(),
            tokens_used,
            duration_ms,
        };
        if let Err(e) = self.store.set_record(entry_id, record).await {
            return self.fail_entry(entry_id, e).await;
        }

        self.mark_or_fail(entry_id, EntryStatus::Processed).await?;
        info!(entry_id = %entry_id, duration_ms, "entry processed");
        Ok(())
    }

    async fn mark_or_fail(
        &self,
        entry_id: Uuid,
        status: EntryStatus,
    ) -> Result<(), CoordinationError> {
        if let Err(e) = self.store.update_entry_status(entry_id, status).await {
            // Best effort; if the store is gone this fails too.
            let _ = self
                .store
                .update_entry_status(entry_id, EntryStatus::Failed)
                .await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn fail_entry(
        &self,
        entry_id: Uuid,
        error: StoreError,
    ) -> Result<(), CoordinationError> {
        warn!(entry_id = %entry_id, error = %error, "marking entry failed");
        let _ = self
            .store
            .update_entry_status(entry_id, EntryStatus::Failed)
            .await;
        Err(error.into())
    }
}
