//! State store — the single point of mutation for entry and action
//! state.
//!
//! Every mutation is a message to one serialized actor loop; no caller
//! ever touches shared state in place. That gives each entry a total
//! order over its writes regardless of which concurrent action finished
//! first, and guarantees a write is observable by every subscriber
//! within one scheduling tick of being applied. The defect this design
//! exists to kill: a write applied off the serialization point that is
//! durably persisted but never becomes visible until restart.
//!
//! Observers subscribe per entry and receive metadata snapshots over a
//! `watch` channel; the SQLite [`journal`] hangs behind the actor for
//! durability.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::{
    Action, ActionPayload, ActionStatus, Entry, EntryMetadata, EntryStatus, ProcessingRecord,
};

pub mod journal;

use journal::Journal;

/// Command queue depth before senders back-pressure.
const COMMAND_BUFFER: usize = 256;

/// Errors surfaced by store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The actor loop is gone; nothing can be recorded.
    #[error("state store unreachable")]
    Unreachable,
    /// No such entry.
    #[error("unknown entry {0}")]
    UnknownEntry(Uuid),
    /// No such action within the entry.
    #[error("unknown action {0}")]
    UnknownAction(Uuid),
    /// The requested status change is not a legal transition.
    #[error("illegal status transition {from:?} → {to:?}")]
    IllegalTransition {
        /// Current status.
        from: ActionStatus,
        /// Requested status.
        to: ActionStatus,
    },
    /// A reversible action reached `executed` without reverse data.
    #[error("reversible action {0} missing reverse data")]
    MissingReverseData(Uuid),
    /// Journal failure during startup restore.
    #[error("journal error: {0}")]
    Journal(#[from] journal::JournalError),
}

/// One status write for an action, applied atomically by the actor.
#[derive(Debug, Default)]
pub struct ActionUpdate {
    /// New status; validated against the transition table.
    pub status: Option<ActionStatus>,
    /// Replacement payload (e.g. with resolved timestamps).
    pub data: Option<ActionPayload>,
    /// Execution timestamp.
    pub executed_at: Option<DateTime<Utc>>,
    /// External object id returned by the adapter.
    pub external_id: Option<String>,
    /// Captured undo payload.
    pub reverse_data: Option<serde_json::Value>,
    /// Failure reason.
    pub error: Option<String>,
}

impl ActionUpdate {
    /// An update that only moves the status.
    pub fn to_status(status: ActionStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

enum Command {
    InsertEntry {
        entry: Entry,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    UpdateEntryStatus {
        entry_id: Uuid,
        status: EntryStatus,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    SetActions {
        entry_id: Uuid,
        actions: Vec<Action>,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    ApplyAction {
        entry_id: Uuid,
        action_id: Uuid,
        update: ActionUpdate,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    SetRecord {
        entry_id: Uuid,
        record: ProcessingRecord,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    SetResearch {
        entry_id: Uuid,
        research: String,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    Observe {
        entry_id: Uuid,
        reply: oneshot::Sender<Result<watch::Receiver<EntryMetadata>, StoreError>>,
    },
    Snapshot {
        entry_id: Uuid,
        reply: oneshot::Sender<Result<(Entry, EntryMetadata), StoreError>>,
    },
    ListUnprocessed {
        reply: oneshot::Sender<Vec<Entry>>,
    },
}

/// Cloneable handle to the store actor.
///
/// All methods hand their mutation to the serialized loop; a
/// [`StoreError::Unreachable`] from any of them means the loop is dead,
/// which is the one condition that escalates to entry-level failure.
#[derive(Clone)]
pub struct StateStore {
    tx: mpsc::Sender<Command>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").finish()
    }
}

impl StateStore {
    /// Spawn the store actor, restoring persisted entries from `journal`
    /// when one is given.
    ///
    /// Entries found mid-`processing` (a previous process crashed) are
    /// reset to `unprocessed` so the next pull retries them.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Journal`] when the restore query fails.
    pub async fn spawn(journal: Option<Journal>) -> Result<Self, StoreError> {
        let mut entries = HashMap::new();

        if let Some(ref j) = journal {
            let mut restored = 0_usize;
            for (mut entry, metadata) in j.load_entries().await? {
                if entry.status == EntryStatus::Processing {
                    entry.status = EntryStatus::Unprocessed;
                }
                let (watch_tx, _) = watch::channel(metadata.clone());
                entries.insert(
                    entry.id,
                    EntryRecord {
                        entry,
                        metadata,
                        watch_tx,
                    },
                );
                restored = restored.saturating_add(1);
            }
            if restored > 0 {
                debug!(count = restored, "restored entries from journal");
            }
        }

        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let actor = Actor {
            entries,
            journal,
            rx,
        };
        tokio::spawn(actor.run());
        Ok(Self { tx })
    }

    async fn send<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, StoreError>>) -> Command,
    ) -> Result<T, StoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| StoreError::Unreachable)?;
        reply_rx.await.map_err(|_| StoreError::Unreachable)?
    }

    /// Register a new entry. Idempotent: an id already present is left
    /// untouched.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unreachable`] when the actor is gone.
    pub async fn insert_entry(&self, entry: Entry) -> Result<(), StoreError> {
        self.send(|reply| Command::InsertEntry { entry, reply }).await
    }

    /// Move an entry to `status`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] for unknown entries or a dead actor.
    pub async fn update_entry_status(
        &self,
        entry_id: Uuid,
        status: EntryStatus,
    ) -> Result<(), StoreError> {
        self.send(|reply| Command::UpdateEntryStatus {
            entry_id,
            status,
            reply,
        })
        .await
    }

    /// Record the proposed actions for an entry, in decision order. The
    /// stored order is what observers and the wire format see, whatever
    /// order the actions later complete in.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] for unknown entries or a dead actor.
    pub async fn set_actions(&self, entry_id: Uuid, actions: Vec<Action>) -> Result<(), StoreError> {
        self.send(|reply| Command::SetActions {
            entry_id,
            actions,
            reply,
        })
        .await
    }

    /// Apply one action status write.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::IllegalTransition`] when the status change
    /// violates the transition table, [`StoreError::MissingReverseData`]
    /// when a reversible action would reach `executed` without undo
    /// data, and the usual unknown/unreachable variants.
    pub async fn apply_action(
        &self,
        entry_id: Uuid,
        action_id: Uuid,
        update: ActionUpdate,
    ) -> Result<(), StoreError> {
        self.send(|reply| Command::ApplyAction {
            entry_id,
            action_id,
            update,
            reply,
        })
        .await
    }

    /// Attach the processing record for a completed attempt.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] for unknown entries or a dead actor.
    pub async fn set_record(
        &self,
        entry_id: Uuid,
        record: ProcessingRecord,
    ) -> Result<(), StoreError> {
        self.send(|reply| Command::SetRecord {
            entry_id,
            record,
            reply,
        })
        .await
    }

    /// Attach free-text research content (external collaborator surface;
    /// round-trips through metadata untouched).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] for unknown entries or a dead actor.
    pub async fn set_research(&self, entry_id: Uuid, research: String) -> Result<(), StoreError> {
        self.send(|reply| Command::SetResearch {
            entry_id,
            research,
            reply,
        })
        .await
    }

    /// Subscribe to metadata snapshots for an entry. The stream yields
    /// the current snapshot immediately, then one snapshot per applied
    /// write.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] for unknown entries or a dead actor.
    pub async fn observe(&self, entry_id: Uuid) -> Result<WatchStream<EntryMetadata>, StoreError> {
        let rx = self
            .send(|reply| Command::Observe { entry_id, reply })
            .await?;
        Ok(WatchStream::new(rx))
    }

    /// Current entry + metadata snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] for unknown entries or a dead actor.
    pub async fn snapshot(&self, entry_id: Uuid) -> Result<(Entry, EntryMetadata), StoreError> {
        self.send(|reply| Command::Snapshot { entry_id, reply }).await
    }

    /// Entries currently in `unprocessed` status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unreachable`] when the actor is gone.
    pub async fn unprocessed_entries(&self) -> Result<Vec<Entry>, StoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::ListUnprocessed { reply: reply_tx })
            .await
            .map_err(|_| StoreError::Unreachable)?;
        reply_rx.await.map_err(|_| StoreError::Unreachable)
    }
}

struct EntryRecord {
    entry: Entry,
    metadata: EntryMetadata,
    watch_tx: watch::Sender<EntryMetadata>,
}

struct Actor {
    entries: HashMap<Uuid, EntryRecord>,
    journal: Option<Journal>,
    rx: mpsc::Receiver<Command>,
}

impl Actor {
    async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            self.handle(command).await;
        }
        debug!("state store actor shutting down");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::InsertEntry { entry, reply } => {
                let result = self.insert_entry(entry).await;
                let _ = reply.send(result);
            }
            Command::UpdateEntryStatus {
                entry_id,
                status,
                reply,
            } => {
                let result = self
                    .mutate(entry_id, |record| {
                        record.entry.status = status;
                        Ok(())
                    })
                    .await;
                let _ = reply.send(result);
            }
            Command::SetActions {
                entry_id,
                actions,
                reply,
            } => {
                let result = self
                    .mutate(entry_id, |record| {
                        record.metadata.actions = actions;
                        Ok(())
                    })
                    .await;
                let _ = reply.send(result);
            }
            Command::ApplyAction {
                entry_id,
                action_id,
                update,
                reply,
            } => {
                let result = self
                    .mutate(entry_id, |record| apply_action(record, action_id, update))
                    .await;
                let _ = reply.send(result);
            }
            Command::SetRecord {
                entry_id,
                record,
                reply,
            } => {
                let result = self
                    .mutate(entry_id, |entry_record| {
                        entry_record.metadata.processing_meta = Some(record);
                        Ok(())
                    })
                    .await;
                let _ = reply.send(result);
            }
            Command::SetResearch {
                entry_id,
                research,
                reply,
            } => {
                let result = self
                    .mutate(entry_id, |record| {
                        record.metadata.research = Some(research);
                        Ok(())
                    })
                    .await;
                let _ = reply.send(result);
            }
            Command::Observe { entry_id, reply } => {
                let result = self
                    .entries
                    .get(&entry_id)
                    .map(|record| record.watch_tx.subscribe())
                    .ok_or(StoreError::UnknownEntry(entry_id));
                let _ = reply.send(result);
            }
            Command::Snapshot { entry_id, reply } => {
                let result = self
                    .entries
                    .get(&entry_id)
                    .map(|record| (record.entry.clone(), record.metadata.clone()))
                    .ok_or(StoreError::UnknownEntry(entry_id));
                let _ = reply.send(result);
            }
            Command::ListUnprocessed { reply } => {
                let mut unprocessed: Vec<Entry> = self
                    .entries
                    .values()
                    .filter(|r| r.entry.status == EntryStatus::Unprocessed)
                    .map(|r| r.entry.clone())
                    .collect();
                unprocessed.sort_by_key(|e| e.created_at);
                let _ = reply.send(unprocessed);
            }
        }
    }

    async fn insert_entry(&mut self, entry: Entry) -> Result<(), StoreError> {
        if self.entries.contains_key(&entry.id) {
            debug!(entry_id = %entry.id, "entry already registered, ignoring");
            return Ok(());
        }
        let metadata = EntryMetadata::default();
        let (watch_tx, _) = watch::channel(metadata.clone());
        let entry_id = entry.id;
        self.entries.insert(
            entry_id,
            EntryRecord {
                entry,
                metadata,
                watch_tx,
            },
        );
        self.persist(entry_id).await;
        Ok(())
    }

    /// Apply `f` to an entry record, then publish the new snapshot to
    /// observers and persist. The publish happens on every successful
    /// mutation, before the reply lands, so a subscriber sees the write
    /// within one scheduling tick.
    async fn mutate(
        &mut self,
        entry_id: Uuid,
        f: impl FnOnce(&mut EntryRecord) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let record = self
            .entries
            .get_mut(&entry_id)
            .ok_or(StoreError::UnknownEntry(entry_id))?;
        f(record)?;
        let _ = record.watch_tx.send(record.metadata.clone());
        self.persist(entry_id).await;
        Ok(())
    }

    async fn persist(&self, entry_id: Uuid) {
        let (Some(journal), Some(record)) = (self.journal.as_ref(), self.entries.get(&entry_id))
        else {
            return;
        };
        if let Err(e) = journal.upsert_entry(&record.entry, &record.metadata).await {
            warn!(entry_id = %entry_id, error = %e, "journal write failed (state remains visible)");
        }
    }
}

fn apply_action(
    record: &mut EntryRecord,
    action_id: Uuid,
    update: ActionUpdate,
) -> Result<(), StoreError> {
    let action = record
        .metadata
        .actions
        .iter_mut()
        .find(|a| a.id == action_id)
        .ok_or(StoreError::UnknownAction(action_id))?;

    if let Some(next) = update.status {
        if !action.status.can_transition_to(next) {
            return Err(StoreError::IllegalTransition {
                from: action.status,
                to: next,
            });
        }
        // Reversible actions may not reach `executed` without undo data.
        if next == ActionStatus::Executed && action.reversible {
            let has_reverse = update
                .reverse_data
                .as_ref()
                .or(action.reverse_data.as_ref())
                .is_some_and(|v| !v.is_null());
            if !has_reverse {
                return Err(StoreError::MissingReverseData(action_id));
            }
        }
        action.status = next;
    }
    if let Some(data) = update.data {
        action.data = data;
    }
    if update.executed_at.is_some() {
        action.executed_at = update.executed_at;
    }
    if update.external_id.is_some() {
        action.external_id = update.external_id;
    }
    if update.reverse_data.is_some() {
        action.reverse_data = update.reverse_data;
    }
    if update.error.is_some() {
        action.error = update.error;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActionSpec, EntryKind, ReminderPayload};
    use tokio_stream::StreamExt;

    fn reminder_action() -> Action {
        Action::from_spec(ActionSpec {
            payload: ActionPayload::Reminder(ReminderPayload {
                title: "call Jane".to_owned(),
                notes: None,
                time_expression: None,
                due: None,
            }),
            reversible: true,
        })
    }

    async fn store_with_entry() -> (StateStore, Entry) {
        let store = StateStore::spawn(None).await.expect("spawn");
        let entry = Entry::new(EntryKind::Task, "call Jane");
        store.insert_entry(entry.clone()).await.expect("insert");
        (store, entry)
    }

    #[tokio::test]
    async fn insert_is_idempotent() {
        let (store, entry) = store_with_entry().await;
        store.insert_entry(entry.clone()).await.expect("re-insert");
        let (loaded, _) = store.snapshot(entry.id).await.expect("snapshot");
        assert_eq!(loaded.status, EntryStatus::Unprocessed);
    }

    #[tokio::test]
    async fn action_transitions_enforced() {
        let (store, entry) = store_with_entry().await;
        let action = reminder_action();
        let action_id = action.id;
        store
            .set_actions(entry.id, vec![action])
            .await
            .expect("set actions");

        // Pending → Executed skips a state.
        let err = store
            .apply_action(
                entry.id,
                action_id,
                ActionUpdate::to_status(ActionStatus::Executed),
            )
            .await
            .expect_err("must reject skipped state");
        assert!(matches!(err, StoreError::IllegalTransition { .. }));

        store
            .apply_action(
                entry.id,
                action_id,
                ActionUpdate::to_status(ActionStatus::Executing),
            )
            .await
            .expect("pending → executing");
    }

    #[tokio::test]
    async fn reversible_execute_requires_reverse_data() {
        let (store, entry) = store_with_entry().await;
        let action = reminder_action();
        let action_id = action.id;
        store
            .set_actions(entry.id, vec![action])
            .await
            .expect("set actions");
        store
            .apply_action(
                entry.id,
                action_id,
                ActionUpdate::to_status(ActionStatus::Executing),
            )
            .await
            .expect("executing");

        let err = store
            .apply_action(
                entry.id,
                action_id,
                ActionUpdate::to_status(ActionStatus::Executed),
            )
            .await
            .expect_err("executed without reverse data must fail");
        assert!(matches!(err, StoreError::MissingReverseData(_)));

        let update = ActionUpdate {
            status: Some(ActionStatus::Executed),
            reverse_data: Some(serde_json::json!({"externalId": "rem-1"})),
            executed_at: Some(Utc::now()),
            external_id: Some("rem-1".to_owned()),
            ..ActionUpdate::default()
        };
        store
            .apply_action(entry.id, action_id, update)
            .await
            .expect("executed with reverse data");
    }

    #[tokio::test]
    async fn observer_sees_writes_from_other_tasks() {
        let (store, entry) = store_with_entry().await;
        let action = reminder_action();
        let action_id = action.id;
        store
            .set_actions(entry.id, vec![action])
            .await
            .expect("set actions");

        let mut stream = store.observe(entry.id).await.expect("observe");
        // Initial snapshot.
        let first = stream.next().await.expect("snapshot");
        assert_eq!(first.actions[0].status, ActionStatus::Pending);

        // Write from a different task.
        let writer = {
            let store = store.clone();
            let entry_id = entry.id;
            tokio::spawn(async move {
                store
                    .apply_action(
                        entry_id,
                        action_id,
                        ActionUpdate::to_status(ActionStatus::Executing),
                    )
                    .await
            })
        };
        writer.await.expect("join").expect("apply");

        let next = stream.next().await.expect("snapshot");
        assert_eq!(next.actions[0].status, ActionStatus::Executing);
    }

    #[tokio::test]
    async fn unknown_entry_and_action_are_rejected() {
        let (store, entry) = store_with_entry().await;
        let missing = Uuid::new_v4();

        let err = store.snapshot(missing).await.expect_err("unknown entry");
        assert!(matches!(err, StoreError::UnknownEntry(_)));

        let err = store
            .apply_action(
                entry.id,
                missing,
                ActionUpdate::to_status(ActionStatus::Executing),
            )
            .await
            .expect_err("unknown action");
        assert!(matches!(err, StoreError::UnknownAction(_)));
    }

    #[tokio::test]
    async fn unprocessed_listing_filters_by_status() {
        let (store, entry) = store_with_entry().await;
        let second = Entry::new(EntryKind::Note, "done already");
        store.insert_entry(second.clone()).await.expect("insert");
        store
            .update_entry_status(second.id, EntryStatus::Processed)
            .await
            .expect("status");

        let unprocessed = store.unprocessed_entries().await.expect("list");
        assert_eq!(unprocessed.len(), 1);
        assert_eq!(unprocessed[0].id, entry.id);
    }

    #[tokio::test]
    async fn restore_resets_stale_processing() {
        let journal = Journal::open_in_memory().await.expect("journal");
        let mut entry = Entry::new(EntryKind::Task, "interrupted");
        entry.status = EntryStatus::Processing;
        journal
            .upsert_entry(&entry, &EntryMetadata::default())
            .await
            .expect("seed");

        let store = StateStore::spawn(Some(journal)).await.expect("spawn");
        let (loaded, _) = store.snapshot(entry.id).await.expect("snapshot");
        assert_eq!(
            loaded.status,
            EntryStatus::Unprocessed,
            "stale processing entries are retried"
        );
    }

    #[tokio::test]
    async fn research_roundtrips_through_metadata() {
        let (store, entry) = store_with_entry().await;
        store
            .set_research(entry.id, "briefing text".to_owned())
            .await
            .expect("research");
        let (_, metadata) = store.snapshot(entry.id).await.expect("snapshot");
        assert_eq!(metadata.research.as_deref(), Some("briefing text"));
    }
}
