//! Core types for the entry-processing pipeline.

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// What kind of snippet the capture surface produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// Something the user intends to do.
    Task,
    /// Free-form information with no implied action.
    Note,
}

/// Lifecycle of an entry through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    /// Captured, not yet picked up.
    Unprocessed,
    /// An attempt is in flight. At most one at a time per entry.
    Processing,
    /// The attempt reached the executor stage and a record was written,
    /// even if some actions failed.
    Processed,
    /// No processing record could be written at all.
    Failed,
}

/// A captured snippet awaiting or having undergone processing.
///
/// Created by the capture collaborator; the pipeline owns `status` and
/// the metadata attached through the state store. Entries are never
/// deleted by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    /// Unique identifier.
    pub id: Uuid,
    /// Task or note.
    pub kind: EntryKind,
    /// Raw captured text.
    pub content: String,
    /// Capture time.
    pub created_at: DateTime<Utc>,
    /// Processing lifecycle state.
    pub status: EntryStatus,
}

impl Entry {
    /// Build a freshly captured, unprocessed entry.
    pub fn new(kind: EntryKind, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            content: content.into(),
            created_at: Utc::now(),
            status: EntryStatus::Unprocessed,
        }
    }
}

/// Structured facts pulled out of one entry's text.
///
/// Ephemeral: produced once per processing attempt and folded into
/// metadata only through the actions it yields. Every field is optional;
/// an all-`None` value is a valid (and common) outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractedFacts {
    /// Phone number, as written.
    pub phone: Option<String>,
    /// Email address, as written.
    pub email: Option<String>,
    /// Person name associated with the entry.
    pub person_name: Option<String>,
    /// Free-text time expression ("tomorrow 3pm").
    pub time_expression: Option<String>,
    /// Free-text location expression.
    pub location: Option<String>,
    /// Short phrase naming what the user wants to do.
    pub action_intent: Option<String>,
}

impl ExtractedFacts {
    /// True when no field was extracted.
    pub fn is_empty(&self) -> bool {
        self.phone.is_none()
            && self.email.is_none()
            && self.person_name.is_none()
            && self.time_expression.is_none()
            && self.location.is_none()
            && self.action_intent.is_none()
    }

    /// Fill fields this value is missing from `other`, keeping existing
    /// fields untouched. Used to merge the deterministic fallback
    /// extraction under LLM output.
    pub fn merge_missing(&mut self, other: ExtractedFacts) {
        if self.phone.is_none() {
            self.phone = other.phone;
        }
        if self.email.is_none() {
            self.email = other.email;
        }
        if self.person_name.is_none() {
            self.person_name = other.person_name;
        }
        if self.time_expression.is_none() {
            self.time_expression = other.time_expression;
        }
        if self.location.is_none() {
            self.location = other.location;
        }
        if self.action_intent.is_none() {
            self.action_intent = other.action_intent;
        }
    }
}

/// Which external capability an action targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityType {
    /// Reminders list.
    Reminder,
    /// Calendar events.
    Calendar,
    /// Contact records.
    Contact,
    /// Map search / navigation.
    Map,
}

impl std::fmt::Display for CapabilityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Reminder => "reminder",
            Self::Calendar => "calendar",
            Self::Contact => "contact",
            Self::Map => "map",
        };
        f.write_str(s)
    }
}

/// Lifecycle of a single action.
///
/// Transitions are monotonic: `pending → executing → {executed |
/// failed}`, with the single backward edge `executed → reversed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    /// Proposed by the decision engine, not yet started.
    Pending,
    /// Handed to an adapter; partial progress is observable.
    Executing,
    /// The external side effect exists.
    Executed,
    /// The adapter or permission gate refused.
    Failed,
    /// The executed action was undone (status-level).
    Reversed,
}

impl ActionStatus {
    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: ActionStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Executing)
                | (Self::Executing, Self::Executed)
                | (Self::Executing, Self::Failed)
                | (Self::Executed, Self::Reversed)
        )
    }
}

/// Payload for a reminder action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderPayload {
    /// Reminder title.
    pub title: String,
    /// Longer notes, usually the full entry text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Free-text time expression awaiting resolution.
    #[serde(rename = "timeExpression", skip_serializing_if = "Option::is_none")]
    pub time_expression: Option<String>,
    /// Resolved due time, set by the executor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due: Option<DateTime<Utc>>,
}

/// Payload for a calendar-event action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarPayload {
    /// Event title.
    pub title: String,
    /// Longer notes, usually the full entry text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Free-text time expression awaiting resolution.
    #[serde(rename = "timeExpression", skip_serializing_if = "Option::is_none")]
    pub time_expression: Option<String>,
    /// Resolved start time, set by the executor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    /// Resolved end time, set by the executor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

/// Payload for a contact-record action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactPayload {
    /// Contact display name ("Unknown Contact" when none was extracted).
    pub name: String,
    /// Phone number.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    /// Email address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Payload for a map-lookup action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapPayload {
    /// Free-text location query.
    pub query: String,
    /// Place the query resolved to, set by the executor.
    #[serde(rename = "resolvedPlace", skip_serializing_if = "Option::is_none")]
    pub resolved_place: Option<String>,
}

/// Typed action payload — one fixed struct per capability type.
///
/// Serializes untagged (a flat key/value object) so the persisted shape
/// stays `data: {key: value}`; deserialization is routed by the sibling
/// `type` field via [`ActionPayload::from_value`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ActionPayload {
    /// Reminder fields.
    Reminder(ReminderPayload),
    /// Calendar-event fields.
    Calendar(CalendarPayload),
    /// Contact fields.
    Contact(ContactPayload),
    /// Map-lookup fields.
    Map(MapPayload),
}

impl ActionPayload {
    /// The capability type this payload belongs to.
    pub fn capability(&self) -> CapabilityType {
        match self {
            Self::Reminder(_) => CapabilityType::Reminder,
            Self::Calendar(_) => CapabilityType::Calendar,
            Self::Contact(_) => CapabilityType::Contact,
            Self::Map(_) => CapabilityType::Map,
        }
    }

    /// Deserialize a payload value for a known capability type.
    ///
    /// # Errors
    ///
    /// Returns a serde error when the value does not match the payload
    /// struct for `capability`.
    pub fn from_value(
        capability: CapabilityType,
        value: serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        match capability {
            CapabilityType::Reminder => serde_json::from_value(value).map(Self::Reminder),
            CapabilityType::Calendar => serde_json::from_value(value).map(Self::Calendar),
            CapabilityType::Contact => serde_json::from_value(value).map(Self::Contact),
            CapabilityType::Map => serde_json::from_value(value).map(Self::Map),
        }
    }
}

/// A proposed side effect, as emitted by the decision engine.
///
/// Becomes an [`Action`] once the coordinator assigns an id and registers
/// it with the state store.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionSpec {
    /// Typed payload; determines the capability type.
    pub payload: ActionPayload,
    /// Whether the effect can in principle be undone.
    pub reversible: bool,
}

/// One proposed or executed side effect tied to an entry.
#[derive(Debug, Clone, Serialize)]
pub struct Action {
    /// Unique within the owning entry.
    pub id: Uuid,
    /// Capability type, serialized as `type`.
    #[serde(rename = "type")]
    pub capability: CapabilityType,
    /// Current lifecycle state.
    pub status: ActionStatus,
    /// Typed payload, serialized as a flat `data` object.
    pub data: ActionPayload,
    /// When the action reached `executed`.
    #[serde(rename = "executedAt")]
    pub executed_at: Option<DateTime<Utc>>,
    /// Whether the effect can in principle be undone.
    pub reversible: bool,
    /// How to undo, captured before `executed`. Required non-empty for
    /// reversible actions at the moment they execute.
    #[serde(rename = "reverseData")]
    pub reverse_data: Option<serde_json::Value>,
    /// Identifier of the created external object.
    #[serde(rename = "externalId", skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    /// Failure reason for `failed` actions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Action {
    /// Materialize a pending action from a decision-engine spec.
    pub fn from_spec(spec: ActionSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            capability: spec.payload.capability(),
            status: ActionStatus::Pending,
            data: spec.payload,
            executed_at: None,
            reversible: spec.reversible,
            reverse_data: None,
            external_id: None,
            error: None,
        }
    }
}

// The payload variant is picked by the sibling `type` field, which an
// untagged derive cannot see. Unknown extra keys are tolerated.
impl<'de> Deserialize<'de> for Action {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct RawAction {
            id: Uuid,
            #[serde(rename = "type")]
            capability: CapabilityType,
            status: ActionStatus,
            data: serde_json::Value,
            #[serde(rename = "executedAt", default)]
            executed_at: Option<DateTime<Utc>>,
            reversible: bool,
            #[serde(rename = "reverseData", default)]
            reverse_data: Option<serde_json::Value>,
            #[serde(rename = "externalId", default)]
            external_id: Option<String>,
            #[serde(default)]
            error: Option<String>,
        }

        let raw = RawAction::deserialize(deserializer)?;
        let data = ActionPayload::from_value(raw.capability, raw.data).map_err(D::Error::custom)?;
        Ok(Action {
            id: raw.id,
            capability: raw.capability,
            status: raw.status,
            data,
            executed_at: raw.executed_at,
            reversible: raw.reversible,
            reverse_data: raw.reverse_data,
            external_id: raw.external_id,
            error: raw.error,
        })
    }
}

/// One completed processing attempt on an entry. Written once, never
/// mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    /// When the attempt completed.
    pub timestamp: DateTime<Utc>,
    /// Extractor/decision version tag.
    #[serde(rename = "pipelineVersion")]
    pub pipeline_version: String,
    /// Cumulative external-call token usage, when the provider bills.
    #[serde(rename = "tokensUsed", skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u32>,
    /// Wall-clock duration of the attempt.
    #[serde(rename = "durationMs")]
    pub duration_ms: u64,
}

/// The pipeline-owned aggregate attached to an entry.
///
/// Persisted shape is a bit-exact contract with downstream readers:
/// `actions`, `processingMeta`, optional `research`. Unknown additional
/// keys must be tolerated on read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Actions in decision order, not completion order.
    #[serde(default)]
    pub actions: Vec<Action>,
    /// Most recent processing record.
    #[serde(rename = "processingMeta", skip_serializing_if = "Option::is_none")]
    pub processing_meta: Option<ProcessingRecord>,
    /// Free-text research/briefing content written by an external
    /// collaborator. Round-trips untouched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub research: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_action(capability: CapabilityType, data: ActionPayload) -> Action {
        Action {
            id: Uuid::new_v4(),
            capability,
            status: ActionStatus::Pending,
            data,
            executed_at: None,
            reversible: true,
            reverse_data: None,
            external_id: None,
            error: None,
        }
    }

    // -- status transitions --

    #[test]
    fn legal_transitions() {
        assert!(ActionStatus::Pending.can_transition_to(ActionStatus::Executing));
        assert!(ActionStatus::Executing.can_transition_to(ActionStatus::Executed));
        assert!(ActionStatus::Executing.can_transition_to(ActionStatus::Failed));
        assert!(ActionStatus::Executed.can_transition_to(ActionStatus::Reversed));
    }

    #[test]
    fn illegal_transitions() {
        assert!(!ActionStatus::Pending.can_transition_to(ActionStatus::Executed));
        assert!(!ActionStatus::Failed.can_transition_to(ActionStatus::Executing));
        assert!(!ActionStatus::Executed.can_transition_to(ActionStatus::Pending));
        assert!(!ActionStatus::Failed.can_transition_to(ActionStatus::Reversed));
        assert!(!ActionStatus::Reversed.can_transition_to(ActionStatus::Executed));
    }

    // -- wire shape --

    #[test]
    fn action_serializes_with_contract_keys() {
        let action = make_action(
            CapabilityType::Contact,
            ActionPayload::Contact(ContactPayload {
                name: "Jane".to_owned(),
                phone: Some("555-123-4567".to_owned()),
                email: None,
            }),
        );
        let json = serde_json::to_value(&action).expect("serialize");

        assert_eq!(json["type"], "contact");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["data"]["name"], "Jane");
        assert_eq!(json["data"]["phone"], "555-123-4567");
        assert!(json["executedAt"].is_null());
        assert_eq!(json["reversible"], true);
        assert!(json.get("externalId").is_none(), "None keys are omitted");
    }

    #[test]
    fn action_roundtrip_routes_payload_by_type() {
        let action = make_action(
            CapabilityType::Calendar,
            ActionPayload::Calendar(CalendarPayload {
                title: "standup".to_owned(),
                notes: None,
                time_expression: Some("tomorrow 9am".to_owned()),
                start: None,
                end: None,
            }),
        );
        let json = serde_json::to_string(&action).expect("serialize");
        let back: Action = serde_json::from_str(&json).expect("deserialize");

        assert_eq!(back.capability, CapabilityType::Calendar);
        match back.data {
            ActionPayload::Calendar(p) => {
                assert_eq!(p.title, "standup");
                assert_eq!(p.time_expression.as_deref(), Some("tomorrow 9am"));
            }
            other => panic!("expected calendar payload, got {other:?}"),
        }
    }

    #[test]
    fn action_deserialize_tolerates_unknown_keys() {
        let json = r#"{
            "id": "550e8400-e29b-41d4-a716-446655440000",
            "type": "reminder",
            "status": "executed",
            "data": {"title": "call Jane", "futureField": 1},
            "executedAt": "2024-01-16T14:30:00Z",
            "reversible": true,
            "reverseData": {"externalId": "rem-1"},
            "someNewKey": "ignored"
        }"#;
        let action: Action = serde_json::from_str(json).expect("deserialize");
        assert_eq!(action.status, ActionStatus::Executed);
        match action.data {
            ActionPayload::Reminder(p) => assert_eq!(p.title, "call Jane"),
            other => panic!("expected reminder payload, got {other:?}"),
        }
    }

    #[test]
    fn metadata_roundtrip_preserves_research() {
        let meta = EntryMetadata {
            actions: vec![],
            processing_meta: Some(ProcessingRecord {
                timestamp: Utc::now(),
                pipeline_version: "extract-v1".to_owned(),
                tokens_used: Some(312),
                duration_ms: 840,
            }),
            research: Some("background briefing".to_owned()),
        };
        let json = serde_json::to_string(&meta).expect("serialize");
        assert!(json.contains("processingMeta"));
        let back: EntryMetadata = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.research.as_deref(), Some("background briefing"));
        assert_eq!(
            back.processing_meta.expect("record").pipeline_version,
            "extract-v1"
        );
    }

    // -- facts --

    #[test]
    fn merge_missing_keeps_existing_fields() {
        let mut facts = ExtractedFacts {
            phone: Some("555-123-4567".to_owned()),
            ..ExtractedFacts::default()
        };
        facts.merge_missing(ExtractedFacts {
            phone: Some("999-999-9999".to_owned()),
            email: Some("jane@example.com".to_owned()),
            ..ExtractedFacts::default()
        });
        assert_eq!(facts.phone.as_deref(), Some("555-123-4567"));
        assert_eq!(facts.email.as_deref(), Some("jane@example.com"));
    }

    #[test]
    fn empty_facts() {
        assert!(ExtractedFacts::default().is_empty());
        let facts = ExtractedFacts {
            location: Some("Pike Place".to_owned()),
            ..ExtractedFacts::default()
        };
        assert!(!facts.is_empty());
    }
}
