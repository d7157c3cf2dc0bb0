//! Permission gate — request-once, fan-out access control.
//!
//! Every adapter call goes through [`PermissionGate::ensure`]. The first
//! caller for a capability performs the (possibly long-suspending)
//! permission request; concurrent callers observe a `Requesting` state
//! and fan in on the same resolved outcome, so the user is never shown
//! duplicate prompts. Outcomes are cached for the process lifetime:
//! denied stays denied until the process restarts or the grant changes
//! out-of-band.

use std::collections::HashMap;

use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::adapters::{AdapterRegistry, PermissionStatus};
use crate::types::CapabilityType;

/// Resolved access decision for one capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    /// Access granted; adapter calls may proceed.
    Granted,
    /// Access denied or restricted; terminal for this process run.
    Denied,
}

/// Gate state visible to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateView {
    /// No caller has needed this capability yet.
    Unrequested,
    /// A permission request is in flight.
    Requesting,
    /// Cached: granted.
    Granted,
    /// Cached: denied.
    Denied,
}

enum Slot {
    Requesting(watch::Receiver<Option<Grant>>),
    Resolved(Grant),
}

/// Serializes first-use permission requests per capability and caches
/// their outcomes.
pub struct PermissionGate {
    adapters: AdapterRegistry,
    slots: Mutex<HashMap<CapabilityType, Slot>>,
}

impl PermissionGate {
    /// Create a gate over the given adapter registry.
    pub fn new(adapters: AdapterRegistry) -> Self {
        Self {
            adapters,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Ensure access to `capability`, requesting it on first use.
    ///
    /// May suspend while the user responds to a prompt. Concurrent
    /// callers for the same capability trigger exactly one underlying
    /// request and all observe its outcome.
    pub async fn ensure(&self, capability: CapabilityType) -> Grant {
        loop {
            let mut rx = {
                let mut slots = self.slots.lock().await;
                match slots.get(&capability) {
                    Some(Slot::Resolved(grant)) => return *grant,
                    Some(Slot::Requesting(rx)) => rx.clone(),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        slots.insert(capability, Slot::Requesting(rx));
                        drop(slots);
                        return self.request_and_publish(capability, tx).await;
                    }
                }
            };

            // Follower: wait for the in-flight request to resolve.
            loop {
                if let Some(grant) = *rx.borrow() {
                    return grant;
                }
                if rx.changed().await.is_err() {
                    // The requesting task died without publishing. Clear
                    // the stale slot and take over on the next pass.
                    warn!(%capability, "permission request abandoned, retrying");
                    let mut slots = self.slots.lock().await;
                    if matches!(slots.get(&capability), Some(Slot::Requesting(_))) {
                        slots.remove(&capability);
                    }
                    break;
                }
            }
        }
    }

    /// Gate state for `capability` without side effects.
    pub async fn view(&self, capability: CapabilityType) -> GateView {
        let slots = self.slots.lock().await;
        match slots.get(&capability) {
            None => GateView::Unrequested,
            Some(Slot::Requesting(_)) => GateView::Requesting,
            Some(Slot::Resolved(Grant::Granted)) => GateView::Granted,
            Some(Slot::Resolved(Grant::Denied)) => GateView::Denied,
        }
    }

    async fn request_and_publish(
        &self,
        capability: CapabilityType,
        tx: watch::Sender<Option<Grant>>,
    ) -> Grant {
        let grant = self.resolve(capability).await;
        let mut slots = self.slots.lock().await;
        slots.insert(capability, Slot::Resolved(grant));
        drop(slots);
        let _ = tx.send(Some(grant));
        grant
    }

    async fn resolve(&self, capability: CapabilityType) -> Grant {
        let Some(adapter) = self.adapters.get(capability) else {
            warn!(%capability, "no adapter registered, treating as denied");
            return Grant::Denied;
        };

        match adapter.check_permission().await {
            PermissionStatus::Granted => {
                debug!(%capability, "permission already granted");
                Grant::Granted
            }
            PermissionStatus::Denied | PermissionStatus::Restricted => {
                info!(%capability, "permission denied or restricted");
                Grant::Denied
            }
            PermissionStatus::NotDetermined => {
                info!(%capability, "requesting permission");
                if adapter.request_permission().await {
                    info!(%capability, "permission granted");
                    Grant::Granted
                } else {
                    info!(%capability, "permission refused");
                    Grant::Denied
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{AdapterError, CapabilityAdapter};
    use crate::types::ActionPayload;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Adapter whose permission request suspends, for racing callers.
    struct SlowPromptAdapter {
        capability: CapabilityType,
        initial: PermissionStatus,
        grant: bool,
        requests: AtomicUsize,
    }

    impl SlowPromptAdapter {
        fn new(capability: CapabilityType, initial: PermissionStatus, grant: bool) -> Self {
            Self {
                capability,
                initial,
                grant,
                requests: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CapabilityAdapter for SlowPromptAdapter {
        fn capability(&self) -> CapabilityType {
            self.capability
        }

        async fn check_permission(&self) -> PermissionStatus {
            self.initial
        }

        async fn request_permission(&self) -> bool {
            self.requests.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.grant
        }

        async fn create(&self, _payload: &ActionPayload) -> Result<String, AdapterError> {
            Ok("unused".to_owned())
        }
    }

    fn gate_with(adapter: Arc<SlowPromptAdapter>) -> Arc<PermissionGate> {
        let mut registry = AdapterRegistry::new();
        registry.register(adapter);
        Arc::new(PermissionGate::new(registry))
    }

    #[tokio::test]
    async fn concurrent_callers_trigger_one_request() {
        let adapter = Arc::new(SlowPromptAdapter::new(
            CapabilityType::Contact,
            PermissionStatus::NotDetermined,
            true,
        ));
        let gate = gate_with(Arc::clone(&adapter));

        let a = tokio::spawn({
            let gate = Arc::clone(&gate);
            async move { gate.ensure(CapabilityType::Contact).await }
        });
        let b = tokio::spawn({
            let gate = Arc::clone(&gate);
            async move { gate.ensure(CapabilityType::Contact).await }
        });

        let (a, b) = (a.await.expect("join"), b.await.expect("join"));
        assert_eq!(a, Grant::Granted);
        assert_eq!(b, Grant::Granted);
        assert_eq!(
            adapter.requests.load(Ordering::SeqCst),
            1,
            "single-flight: exactly one prompt"
        );
    }

    #[tokio::test]
    async fn denied_is_terminal_and_cached() {
        let adapter = Arc::new(SlowPromptAdapter::new(
            CapabilityType::Calendar,
            PermissionStatus::NotDetermined,
            false,
        ));
        let gate = gate_with(Arc::clone(&adapter));

        assert_eq!(gate.ensure(CapabilityType::Calendar).await, Grant::Denied);
        assert_eq!(gate.ensure(CapabilityType::Calendar).await, Grant::Denied);
        assert_eq!(
            adapter.requests.load(Ordering::SeqCst),
            1,
            "denied outcome must not re-prompt"
        );
        assert_eq!(gate.view(CapabilityType::Calendar).await, GateView::Denied);
    }

    #[tokio::test]
    async fn already_granted_never_prompts() {
        let adapter = Arc::new(SlowPromptAdapter::new(
            CapabilityType::Reminder,
            PermissionStatus::Granted,
            false,
        ));
        let gate = gate_with(Arc::clone(&adapter));

        assert_eq!(gate.ensure(CapabilityType::Reminder).await, Grant::Granted);
        assert_eq!(adapter.requests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn restricted_maps_to_denied() {
        let adapter = Arc::new(SlowPromptAdapter::new(
            CapabilityType::Map,
            PermissionStatus::Restricted,
            true,
        ));
        let gate = gate_with(Arc::clone(&adapter));

        assert_eq!(gate.ensure(CapabilityType::Map).await, Grant::Denied);
        assert_eq!(adapter.requests.load(Ordering::SeqCst), 0, "no prompt");
    }

    #[tokio::test]
    async fn missing_adapter_is_denied() {
        let gate = PermissionGate::new(AdapterRegistry::new());
        assert_eq!(gate.ensure(CapabilityType::Map).await, Grant::Denied);
    }

    #[tokio::test]
    async fn requesting_state_is_visible_mid_flight() {
        let adapter = Arc::new(SlowPromptAdapter::new(
            CapabilityType::Contact,
            PermissionStatus::NotDetermined,
            true,
        ));
        let gate = gate_with(adapter);

        let task = tokio::spawn({
            let gate = Arc::clone(&gate);
            async move { gate.ensure(CapabilityType::Contact).await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            gate.view(CapabilityType::Contact).await,
            GateView::Requesting
        );

        assert_eq!(task.await.expect("join"), Grant::Granted);
        assert_eq!(gate.view(CapabilityType::Contact).await, GateView::Granted);
    }
}
