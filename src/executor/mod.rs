//! Action executor — drives one proposed action to a terminal status.
//!
//! Ordering per action: publish `executing` through the store before any
//! external call, gate on permission, resolve free-text time fields,
//! capture the reverse payload, dispatch to the adapter, then publish
//! the terminal status. Failures stay on the action: nothing here ever
//! escalates to the entry.

use std::sync::Arc;

use chrono::{DateTime, Local, NaiveDateTime, TimeDelta, TimeZone, Utc};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapters::{AdapterError, AdapterRegistry};
use crate::permission::{Grant, PermissionGate};
use crate::store::{ActionUpdate, StateStore, StoreError};
use crate::types::{Action, ActionPayload, ActionStatus};

pub mod timeparse;

/// Why an action failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    /// The capability's access grant is denied or restricted.
    PermissionDenied,
    /// A search-style operation resolved nothing.
    NotFound,
    /// The adapter or store broke.
    SystemError,
    /// The payload did not fit the adapter.
    InvalidInput,
}

impl std::fmt::Display for FailReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PermissionDenied => "permission denied",
            Self::NotFound => "not found",
            Self::SystemError => "system error",
            Self::InvalidInput => "invalid input",
        };
        f.write_str(s)
    }
}

/// Terminal outcome of one action execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The external object exists.
    Succeeded {
        /// Identifier of the created external object.
        external_id: String,
    },
    /// The action failed; siblings are unaffected.
    Failed {
        /// Why.
        reason: FailReason,
    },
}

/// Errors from [`ActionExecutor::reverse`].
#[derive(Debug, thiserror::Error)]
pub enum ReverseError {
    /// Only `executed` actions can be reversed.
    #[error("action {0} is not in executed status")]
    NotExecuted(Uuid),
    /// The action carries no reverse payload.
    #[error("action {0} has no reverse data")]
    MissingReverseData(Uuid),
    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Dispatches action specs to capability adapters through the permission
/// gate, reporting a per-action outcome.
pub struct ActionExecutor {
    adapters: AdapterRegistry,
    gate: Arc<PermissionGate>,
    store: StateStore,
}

impl ActionExecutor {
    /// Create an executor over the given adapters, gate, and store.
    pub fn new(adapters: AdapterRegistry, gate: Arc<PermissionGate>, store: StateStore) -> Self {
        Self {
            adapters,
            gate,
            store,
        }
    }

    /// Execute one action, publishing status transitions through the
    /// store as they happen. The side effect is real — there is no
    /// dry-run mode.
    pub async fn execute(&self, entry_id: Uuid, action: &Action) -> ExecutionOutcome {
        debug!(entry_id = %entry_id, action_id = %action.id, capability = %action.capability, "executing action");

        // Partial progress must be observable before any external call.
        if let Err(e) = self
            .store
            .apply_action(
                entry_id,
                action.id,
                ActionUpdate::to_status(ActionStatus::Executing),
            )
            .await
        {
            warn!(action_id = %action.id, error = %e, "could not mark action executing");
            return ExecutionOutcome::Failed {
                reason: FailReason::SystemError,
            };
        }

        if self.gate.ensure(action.capability).await == Grant::Denied {
            return self
                .fail(entry_id, action.id, FailReason::PermissionDenied)
                .await;
        }

        let Some(adapter) = self.adapters.get(action.capability) else {
            warn!(capability = %action.capability, "no adapter registered");
            return self.fail(entry_id, action.id, FailReason::SystemError).await;
        };

        let payload = resolve_payload(&action.data, Local::now().naive_local());

        // Capture pre-state before touching the external system, so the
        // reverse payload can say whether we created or merely touched.
        let preexisting = if action.reversible {
            adapter.lookup(&payload).await.ok().flatten()
        } else {
            None
        };

        match adapter.create(&payload).await {
            Ok(external_id) => {
                info!(
                    entry_id = %entry_id,
                    action_id = %action.id,
                    capability = %action.capability,
                    external_id = %external_id,
                    "action executed"
                );
                let payload = finalize_payload(payload, &external_id);
                let reverse_data = action.reversible.then(|| {
                    json!({
                        "externalId": external_id,
                        "preexisting": preexisting,
                    })
                });
                let update = ActionUpdate {
                    status: Some(ActionStatus::Executed),
                    data: Some(payload),
                    executed_at: Some(Utc::now()),
                    external_id: Some(external_id.clone()),
                    reverse_data,
                    error: None,
                };
                if let Err(e) = self.store.apply_action(entry_id, action.id, update).await {
                    warn!(action_id = %action.id, error = %e, "could not record executed status");
                    return ExecutionOutcome::Failed {
                        reason: FailReason::SystemError,
                    };
                }
                ExecutionOutcome::Succeeded { external_id }
            }
            Err(e) => {
                let reason = match e {
                    AdapterError::NotFound(_) => FailReason::NotFound,
                    AdapterError::InvalidInput(_) => FailReason::InvalidInput,
                    AdapterError::System(_) => FailReason::SystemError,
                };
                info!(
                    entry_id = %entry_id,
                    action_id = %action.id,
                    capability = %action.capability,
                    error = %e,
                    "action failed"
                );
                self.fail(entry_id, action.id, reason).await
            }
        }
    }

    /// Reverse an executed action: validates the reverse payload and
    /// flips status to `reversed`.
    ///
    /// The captured reverse payload carries what an adapter-side undo
    /// would need (external id, pre-existence), but no adapter call is
    /// made here; the external object is left in place.
    ///
    /// # Errors
    ///
    /// Returns [`ReverseError`] when the action is not `executed`,
    /// carries no reverse data, or the store refuses the write.
    pub async fn reverse(&self, entry_id: Uuid, action_id: Uuid) -> Result<(), ReverseError> {
        let (_, metadata) = self.store.snapshot(entry_id).await?;
        let action = metadata
            .actions
            .iter()
            .find(|a| a.id == action_id)
            .ok_or(StoreError::UnknownAction(action_id))?;

        if action.status != ActionStatus::Executed {
            return Err(ReverseError::NotExecuted(action_id));
        }
        if !action.reverse_data.as_ref().is_some_and(|v| !v.is_null()) {
            return Err(ReverseError::MissingReverseData(action_id));
        }

        self.store
            .apply_action(
                entry_id,
                action_id,
                ActionUpdate::to_status(ActionStatus::Reversed),
            )
            .await?;
        info!(entry_id = %entry_id, action_id = %action_id, "action reversed");
        Ok(())
    }

    async fn fail(&self, entry_id: Uuid, action_id: Uuid, reason: FailReason) -> ExecutionOutcome {
        let update = ActionUpdate {
            status: Some(ActionStatus::Failed),
            error: Some(reason.to_string()),
            ..ActionUpdate::default()
        };
        if let Err(e) = self.store.apply_action(entry_id, action_id, update).await {
            warn!(action_id = %action_id, error = %e, "could not record failed status");
        }
        ExecutionOutcome::Failed { reason }
    }
}

/// Resolve free-text time expressions in a payload to concrete
/// timestamps against `now`.
fn resolve_payload(payload: &ActionPayload, now: NaiveDateTime) -> ActionPayload {
    let mut payload = payload.clone();
    match &mut payload {
        ActionPayload::Reminder(reminder) => {
            let expression = reminder.time_expression.clone().unwrap_or_default();
            reminder.due = Some(local_to_utc(timeparse::resolve(&expression, now)));
        }
        ActionPayload::Calendar(event) => {
            let expression = event.time_expression.clone().unwrap_or_default();
            let start = timeparse::resolve(&expression, now);
            // Events default to one hour when the text names only a start.
            let end = start
                .checked_add_signed(TimeDelta::hours(1))
                .unwrap_or(start);
            event.start = Some(local_to_utc(start));
            event.end = Some(local_to_utc(end));
        }
        ActionPayload::Contact(_) | ActionPayload::Map(_) => {}
    }
    payload
}

/// Fold the adapter result back into the payload where the type carries
/// a resolution slot.
fn finalize_payload(payload: ActionPayload, external_id: &str) -> ActionPayload {
    match payload {
        ActionPayload::Map(mut map) => {
            map.resolved_place = Some(external_id.to_owned());
            ActionPayload::Map(map)
        }
        other => other,
    }
}

fn local_to_utc(naive: NaiveDateTime) -> DateTime<Utc> {
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map_or_else(Utc::now, |dt| dt.with_timezone(&Utc))
}
