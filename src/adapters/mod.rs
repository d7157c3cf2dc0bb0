//! Capability adapters — the boundary objects wrapping external systems.
//!
//! Each adapter implements the uniform [`CapabilityAdapter`] trait:
//! permission probe/request plus the type-specific create operation. The
//! executor reaches adapters only through the [`AdapterRegistry`] and the
//! permission gate; nothing else in the pipeline touches them.
//!
//! In-memory implementations live in [`memory`] for local runs and
//! tests; OS-native integrations are external collaborators that slot in
//! behind the same trait.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::types::{ActionPayload, CapabilityType};

pub mod memory;

/// OS-level grant state for one capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    /// Never asked.
    NotDetermined,
    /// Granted by the user.
    Granted,
    /// Refused by the user.
    Denied,
    /// Blocked by policy; the user cannot grant it.
    Restricted,
}

/// Errors from adapter operations.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// A search-style operation yielded zero results.
    #[error("not found: {0}")]
    NotFound(String),
    /// The payload does not fit this adapter's capability.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The external system refused or broke.
    #[error("system error: {0}")]
    System(String),
}

/// Uniform create/permission interface over one external capability.
///
/// `create` performs the real, externally visible side effect (a
/// reminder, event, contact, or map navigation in the user's
/// environment). There is no dry-run mode.
#[async_trait]
pub trait CapabilityAdapter: Send + Sync {
    /// The capability this adapter wraps.
    fn capability(&self) -> CapabilityType;

    /// Current grant state without prompting.
    async fn check_permission(&self) -> PermissionStatus;

    /// Request the grant from the user. May suspend for a long time
    /// awaiting a response. Returns whether access was granted.
    async fn request_permission(&self) -> bool;

    /// Probe pre-existing state for reverse-payload capture (e.g. "did a
    /// contact with this identity already exist?"). Returns the external
    /// id of the pre-existing object, if any.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError`] when the probe itself fails.
    async fn lookup(&self, _payload: &ActionPayload) -> Result<Option<String>, AdapterError> {
        Ok(None)
    }

    /// Create the external object described by `payload` and return its
    /// external identifier.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::InvalidInput`] for a payload of the wrong
    /// capability, [`AdapterError::NotFound`] when a search-style create
    /// resolves nothing, [`AdapterError::System`] otherwise.
    async fn create(&self, payload: &ActionPayload) -> Result<String, AdapterError>;
}

/// Lookup table from capability type to its adapter.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<CapabilityType, Arc<dyn CapabilityAdapter>>,
}

impl AdapterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own capability type, replacing any
    /// previous registration.
    pub fn register(&mut self, adapter: Arc<dyn CapabilityAdapter>) {
        self.adapters.insert(adapter.capability(), adapter);
    }

    /// The adapter for `capability`, if registered.
    pub fn get(&self, capability: CapabilityType) -> Option<Arc<dyn CapabilityAdapter>> {
        self.adapters.get(&capability).cloned()
    }

    /// Registry preloaded with all four in-memory adapters.
    pub fn in_memory() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(memory::InMemoryReminders::new()));
        registry.register(Arc::new(memory::InMemoryCalendar::new()));
        registry.register(Arc::new(memory::InMemoryContacts::new()));
        registry.register(Arc::new(memory::InMemoryMaps::new()));
        registry
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("capabilities", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}
