//! Decision engine — extracted facts to proposed actions.
//!
//! A pure table over (entry kind, facts): no I/O, no errors, fully
//! deterministic. Rules are evaluated independently, so one entry can
//! propose several actions; the returned order is the persisted order.

use crate::types::{
    ActionPayload, ActionSpec, CalendarPayload, ContactPayload, EntryKind, ExtractedFacts,
    MapPayload, ReminderPayload,
};

/// Contact name used when no person name was extracted.
pub const UNKNOWN_CONTACT_NAME: &str = "Unknown Contact";

/// Character cap for titles derived from raw content.
const TITLE_MAX_CHARS: usize = 60;

/// Decide which side effects `facts` warrant for an entry of `kind`.
///
/// Rules, each evaluated independently:
/// 1. task ⇒ reminder (always, while the entry has any text)
/// 2. task + time expression ⇒ calendar event
/// 3. phone or email ⇒ contact record (any kind)
/// 4. location expression ⇒ map lookup (any kind)
///
/// Bare-data entries (a pasted number, an address fragment) get exactly
/// the actions their facts warrant and nothing speculative; narrative
/// research is an external collaborator's concern, never proposed here.
pub fn decide(kind: EntryKind, content: &str, facts: &ExtractedFacts) -> Vec<ActionSpec> {
    let mut specs = Vec::new();
    let title = derive_title(content, facts);

    // 1. Every task becomes a reminder.
    if kind == EntryKind::Task && !content.trim().is_empty() {
        specs.push(ActionSpec {
            payload: ActionPayload::Reminder(ReminderPayload {
                title: title.clone(),
                notes: Some(content.to_owned()),
                time_expression: facts.time_expression.clone(),
                due: None,
            }),
            reversible: true,
        });
    }

    // 2. A task with a time expression also becomes a calendar event.
    if kind == EntryKind::Task && facts.time_expression.is_some() {
        specs.push(ActionSpec {
            payload: ActionPayload::Calendar(CalendarPayload {
                title,
                notes: Some(content.to_owned()),
                time_expression: facts.time_expression.clone(),
                start: None,
                end: None,
            }),
            reversible: true,
        });
    }

    // 3. Reachable people become contacts, whatever the entry kind.
    if facts.phone.is_some() || facts.email.is_some() {
        specs.push(ActionSpec {
            payload: ActionPayload::Contact(ContactPayload {
                name: facts
                    .person_name
                    .clone()
                    .unwrap_or_else(|| UNKNOWN_CONTACT_NAME.to_owned()),
                phone: facts.phone.clone(),
                email: facts.email.clone(),
            }),
            reversible: true,
        });
    }

    // 4. Mentioned places become map lookups. Navigation cannot be
    // undone, so these are not reversible.
    if let Some(ref location) = facts.location {
        specs.push(ActionSpec {
            payload: ActionPayload::Map(MapPayload {
                query: location.clone(),
                resolved_place: None,
            }),
            reversible: false,
        });
    }

    specs
}

/// Derive an action title: the extracted intent when present, otherwise
/// a truncated slice of the content.
fn derive_title(content: &str, facts: &ExtractedFacts) -> String {
    if let Some(ref intent) = facts.action_intent {
        return intent.clone();
    }
    let trimmed = content.trim();
    if trimmed.chars().count() <= TITLE_MAX_CHARS {
        trimmed.to_owned()
    } else {
        let head: String = trimmed.chars().take(TITLE_MAX_CHARS).collect();
        format!("{}…", head.trim_end())
    }
}
