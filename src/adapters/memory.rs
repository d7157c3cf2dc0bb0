//! In-memory capability adapters.
//!
//! Back the pipeline in local runs and tests: created objects land in
//! process memory, permission prompts resolve according to a configured
//! policy instead of a real OS dialog. Behavior at the trait boundary
//! (ids returned, permission state machine, not-found semantics) matches
//! what an OS-native adapter would do.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{AdapterError, CapabilityAdapter, PermissionStatus};
use crate::types::{
    ActionPayload, CalendarPayload, CapabilityType, ContactPayload, ReminderPayload,
};

/// Simulated permission prompt: holds the grant state and resolves
/// requests according to a fixed policy.
#[derive(Debug)]
pub struct PermissionSim {
    status: Mutex<PermissionStatus>,
    grant_on_request: bool,
    requests: AtomicUsize,
}

impl PermissionSim {
    /// Start in `initial`; requests resolve to granted iff
    /// `grant_on_request`.
    pub fn new(initial: PermissionStatus, grant_on_request: bool) -> Self {
        Self {
            status: Mutex::new(initial),
            grant_on_request,
            requests: AtomicUsize::new(0),
        }
    }

    /// Undetermined, and the user will accept when asked.
    pub fn accepting() -> Self {
        Self::new(PermissionStatus::NotDetermined, true)
    }

    fn check(&self) -> PermissionStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn request(&self) -> bool {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        *status = if self.grant_on_request {
            PermissionStatus::Granted
        } else {
            PermissionStatus::Denied
        };
        self.grant_on_request
    }

    /// How many prompts have been shown. The gate's single-flight
    /// contract says this never exceeds one per process lifetime.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

fn wrong_payload(expected: CapabilityType, got: &ActionPayload) -> AdapterError {
    AdapterError::InvalidInput(format!(
        "{expected} adapter received a {} payload",
        got.capability()
    ))
}

// ---------------------------------------------------------------------------
// Reminders
// ---------------------------------------------------------------------------

/// In-memory reminders list.
pub struct InMemoryReminders {
    permission: PermissionSim,
    items: Mutex<Vec<(String, ReminderPayload)>>,
    next_id: AtomicU64,
}

impl InMemoryReminders {
    /// Adapter with an accepting permission policy.
    pub fn new() -> Self {
        Self::with_permission(PermissionSim::accepting())
    }

    /// Adapter with an explicit permission policy.
    pub fn with_permission(permission: PermissionSim) -> Self {
        Self {
            permission,
            items: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Snapshot of created reminders, in creation order.
    pub fn created(&self) -> Vec<(String, ReminderPayload)> {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// The simulated permission prompt.
    pub fn permission(&self) -> &PermissionSim {
        &self.permission
    }
}

impl Default for InMemoryReminders {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CapabilityAdapter for InMemoryReminders {
    fn capability(&self) -> CapabilityType {
        CapabilityType::Reminder
    }

    async fn check_permission(&self) -> PermissionStatus {
        self.permission.check()
    }

    async fn request_permission(&self) -> bool {
        self.permission.request()
    }

    async fn create(&self, payload: &ActionPayload) -> Result<String, AdapterError> {
        let ActionPayload::Reminder(reminder) = payload else {
            return Err(wrong_payload(CapabilityType::Reminder, payload));
        };
        if reminder.title.trim().is_empty() {
            return Err(AdapterError::InvalidInput(
                "reminder title must be non-empty".to_owned(),
            ));
        }
        let id = format!("rem-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id.clone(), reminder.clone()));
        Ok(id)
    }
}

// ---------------------------------------------------------------------------
// Calendar
// ---------------------------------------------------------------------------

/// In-memory calendar.
pub struct InMemoryCalendar {
    permission: PermissionSim,
    events: Mutex<Vec<(String, CalendarPayload)>>,
    next_id: AtomicU64,
}

impl InMemoryCalendar {
    /// Adapter with an accepting permission policy.
    pub fn new() -> Self {
        Self::with_permission(PermissionSim::accepting())
    }

    /// Adapter with an explicit permission policy.
    pub fn with_permission(permission: PermissionSim) -> Self {
        Self {
            permission,
            events: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Snapshot of created events, in creation order.
    pub fn created(&self) -> Vec<(String, CalendarPayload)> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The simulated permission prompt.
    pub fn permission(&self) -> &PermissionSim {
        &self.permission
    }
}

impl Default for InMemoryCalendar {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CapabilityAdapter for InMemoryCalendar {
    fn capability(&self) -> CapabilityType {
        CapabilityType::Calendar
    }

    async fn check_permission(&self) -> PermissionStatus {
        self.permission.check()
    }

    async fn request_permission(&self) -> bool {
        self.permission.request()
    }

    async fn create(&self, payload: &ActionPayload) -> Result<String, AdapterError> {
        let ActionPayload::Calendar(event) = payload else {
            return Err(wrong_payload(CapabilityType::Calendar, payload));
        };
        if event.start.is_none() {
            return Err(AdapterError::InvalidInput(
                "calendar payload missing resolved start time".to_owned(),
            ));
        }
        let id = format!("evt-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id.clone(), event.clone()));
        Ok(id)
    }
}

// ---------------------------------------------------------------------------
// Contacts
// ---------------------------------------------------------------------------

/// In-memory address book.
pub struct InMemoryContacts {
    permission: PermissionSim,
    contacts: Mutex<Vec<(String, ContactPayload)>>,
    next_id: AtomicU64,
}

impl InMemoryContacts {
    /// Adapter with an accepting permission policy.
    pub fn new() -> Self {
        Self::with_permission(PermissionSim::accepting())
    }

    /// Adapter with an explicit permission policy.
    pub fn with_permission(permission: PermissionSim) -> Self {
        Self {
            permission,
            contacts: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Seed the address book with an existing contact, returning its id.
    pub fn seed(&self, contact: ContactPayload) -> String {
        let id = format!("ctc-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.contacts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id.clone(), contact));
        id
    }

    /// Snapshot of the address book, in creation order.
    pub fn created(&self) -> Vec<(String, ContactPayload)> {
        self.contacts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The simulated permission prompt.
    pub fn permission(&self) -> &PermissionSim {
        &self.permission
    }
}

impl Default for InMemoryContacts {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CapabilityAdapter for InMemoryContacts {
    fn capability(&self) -> CapabilityType {
        CapabilityType::Contact
    }

    async fn check_permission(&self) -> PermissionStatus {
        self.permission.check()
    }

    async fn request_permission(&self) -> bool {
        self.permission.request()
    }

    // A contact "already exists" when any entry shares a phone number or
    // email address with the payload.
    async fn lookup(&self, payload: &ActionPayload) -> Result<Option<String>, AdapterError> {
        let ActionPayload::Contact(contact) = payload else {
            return Err(wrong_payload(CapabilityType::Contact, payload));
        };
        let book = self.contacts.lock().unwrap_or_else(|e| e.into_inner());
        let existing = book.iter().find(|(_, c)| {
            (contact.phone.is_some() && c.phone == contact.phone)
                || (contact.email.is_some() && c.email == contact.email)
        });
        Ok(existing.map(|(id, _)| id.clone()))
    }

    async fn create(&self, payload: &ActionPayload) -> Result<String, AdapterError> {
        let ActionPayload::Contact(contact) = payload else {
            return Err(wrong_payload(CapabilityType::Contact, payload));
        };
        if contact.phone.is_none() && contact.email.is_none() {
            return Err(AdapterError::InvalidInput(
                "contact needs a phone or email".to_owned(),
            ));
        }
        let id = format!("ctc-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.contacts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id.clone(), contact.clone()));
        Ok(id)
    }
}

// ---------------------------------------------------------------------------
// Maps
// ---------------------------------------------------------------------------

/// In-memory map search.
///
/// With no place index, any non-empty query resolves to a slug (an open
/// geocoder). [`InMemoryMaps::with_places`] restricts resolution to a
/// fixed index, which is how tests exercise the zero-results path.
pub struct InMemoryMaps {
    permission: PermissionSim,
    places: Option<Vec<String>>,
    visits: Mutex<Vec<String>>,
}

impl InMemoryMaps {
    /// Open geocoder with an accepting permission policy.
    pub fn new() -> Self {
        Self {
            permission: PermissionSim::accepting(),
            places: None,
            visits: Mutex::new(Vec::new()),
        }
    }

    /// Geocoder restricted to the given place index.
    pub fn with_places(places: Vec<String>) -> Self {
        Self {
            permission: PermissionSim::accepting(),
            places: Some(places),
            visits: Mutex::new(Vec::new()),
        }
    }

    /// Places navigated to, in order.
    pub fn visits(&self) -> Vec<String> {
        self.visits
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The simulated permission prompt.
    pub fn permission(&self) -> &PermissionSim {
        &self.permission
    }

    fn resolve(&self, query: &str) -> Option<String> {
        let trimmed = query.trim();
        if trimmed.is_empty() {
            return None;
        }
        match &self.places {
            None => Some(slugify(trimmed)),
            Some(index) => {
                let lower = trimmed.to_lowercase();
                index
                    .iter()
                    .find(|p| p.to_lowercase().contains(&lower))
                    .map(|p| slugify(p))
            }
        }
    }
}

impl Default for InMemoryMaps {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CapabilityAdapter for InMemoryMaps {
    fn capability(&self) -> CapabilityType {
        CapabilityType::Map
    }

    async fn check_permission(&self) -> PermissionStatus {
        self.permission.check()
    }

    async fn request_permission(&self) -> bool {
        self.permission.request()
    }

    async fn create(&self, payload: &ActionPayload) -> Result<String, AdapterError> {
        let ActionPayload::Map(map) = payload else {
            return Err(wrong_payload(CapabilityType::Map, payload));
        };
        let place = self
            .resolve(&map.query)
            .ok_or_else(|| AdapterError::NotFound(format!("no places match {:?}", map.query)))?;
        self.visits
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(place.clone());
        Ok(place)
    }
}

fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_alphanumeric() {
            slug.extend(c.to_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MapPayload;

    fn reminder_payload(title: &str) -> ActionPayload {
        ActionPayload::Reminder(ReminderPayload {
            title: title.to_owned(),
            notes: None,
            time_expression: None,
            due: None,
        })
    }

    #[tokio::test]
    async fn reminders_create_assigns_sequential_ids() {
        let adapter = InMemoryReminders::new();
        let a = adapter.create(&reminder_payload("one")).await.expect("ok");
        let b = adapter.create(&reminder_payload("two")).await.expect("ok");
        assert_eq!(a, "rem-1");
        assert_eq!(b, "rem-2");
        assert_eq!(adapter.created().len(), 2);
    }

    #[tokio::test]
    async fn reminders_reject_wrong_payload() {
        let adapter = InMemoryReminders::new();
        let err = adapter
            .create(&ActionPayload::Map(MapPayload {
                query: "x".to_owned(),
                resolved_place: None,
            }))
            .await
            .expect_err("should reject");
        assert!(matches!(err, AdapterError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn calendar_requires_resolved_start() {
        let adapter = InMemoryCalendar::new();
        let err = adapter
            .create(&ActionPayload::Calendar(CalendarPayload {
                title: "standup".to_owned(),
                notes: None,
                time_expression: Some("tomorrow".to_owned()),
                start: None,
                end: None,
            }))
            .await
            .expect_err("should reject");
        assert!(matches!(err, AdapterError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn contacts_lookup_matches_by_phone() {
        let adapter = InMemoryContacts::new();
        let existing = adapter.seed(ContactPayload {
            name: "Jane".to_owned(),
            phone: Some("555-123-4567".to_owned()),
            email: None,
        });

        let probe = ActionPayload::Contact(ContactPayload {
            name: "Unknown Contact".to_owned(),
            phone: Some("555-123-4567".to_owned()),
            email: None,
        });
        let found = adapter.lookup(&probe).await.expect("lookup");
        assert_eq!(found, Some(existing));
    }

    #[tokio::test]
    async fn contacts_lookup_misses_new_identity() {
        let adapter = InMemoryContacts::new();
        let probe = ActionPayload::Contact(ContactPayload {
            name: "Jane".to_owned(),
            phone: Some("555-123-4567".to_owned()),
            email: None,
        });
        assert_eq!(adapter.lookup(&probe).await.expect("lookup"), None);
    }

    #[tokio::test]
    async fn maps_open_geocoder_resolves_anything() {
        let adapter = InMemoryMaps::new();
        let place = adapter
            .create(&ActionPayload::Map(MapPayload {
                query: "Pike Place Market".to_owned(),
                resolved_place: None,
            }))
            .await
            .expect("resolve");
        assert_eq!(place, "pike-place-market");
        assert_eq!(adapter.visits(), vec!["pike-place-market"]);
    }

    #[tokio::test]
    async fn maps_indexed_geocoder_misses() {
        let adapter = InMemoryMaps::with_places(vec!["Fremont Troll".to_owned()]);
        let err = adapter
            .create(&ActionPayload::Map(MapPayload {
                query: "Pike Place".to_owned(),
                resolved_place: None,
            }))
            .await
            .expect_err("should miss");
        assert!(matches!(err, AdapterError::NotFound(_)));
    }

    #[test]
    fn permission_sim_counts_requests() {
        let sim = PermissionSim::new(PermissionStatus::NotDetermined, false);
        assert_eq!(sim.check(), PermissionStatus::NotDetermined);
        assert!(!sim.request());
        assert_eq!(sim.check(), PermissionStatus::Denied);
        assert_eq!(sim.request_count(), 1);
    }
}
