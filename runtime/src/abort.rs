//! Single-slot cancellation register.
//!
//! Each endpoint name holds at most one registered token: a newer call
//! replaces an older call's registration (last registered wins). Release is
//! keyed by call id, so a call that finishes late never removes the
//! registration of a newer call on the same endpoint.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct Registration {
    call_id: u64,
    token: CancellationToken,
    tags: Vec<String>,
}

/// Endpoint name to in-flight cancellation token.
#[derive(Debug, Default)]
pub struct AbortRegistry {
    slots: Mutex<HashMap<String, Registration>>,
}

impl AbortRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh token for `call_id`, replacing any older registration.
    ///
    /// `tags` are handed back on cancellation.
    #[must_use]
    pub fn register(&self, endpoint_name: &str, call_id: u64, tags: &[String]) -> CancellationToken {
        let token = CancellationToken::new();
        let previous = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                endpoint_name.to_string(),
                Registration {
                    call_id,
                    token: token.clone(),
                    tags: tags.to_vec(),
                },
            );
        if let Some(previous) = previous {
            tracing::debug!(
                endpoint = endpoint_name,
                replaced_call = previous.call_id,
                call_id,
                "Replacing in-flight registration"
            );
        }
        token
    }

    /// Remove the registration if it still belongs to `call_id`.
    pub fn release(&self, endpoint_name: &str, call_id: u64) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots
            .get(endpoint_name)
            .is_some_and(|registration| registration.call_id == call_id)
        {
            slots.remove(endpoint_name);
        }
    }

    /// Cancel and remove the registration.
    ///
    /// Returns the cancelled call's tags, or `None` when nothing was registered.
    pub fn cancel(&self, endpoint_name: &str) -> Option<Vec<String>> {
        let registration = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(endpoint_name)?;
        registration.token.cancel();
        Some(registration.tags)
    }

    /// Cancel everything. Returns the cancelled endpoint names with their tags.
    pub fn cancel_all(&self) -> Vec<(String, Vec<String>)> {
        let drained: Vec<(String, Registration)> = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        drained
            .into_iter()
            .map(|(name, registration)| {
                registration.token.cancel();
                (name, registration.tags)
            })
            .collect()
    }

    /// Whether a call is registered for `endpoint_name`.
    #[must_use]
    pub fn is_registered(&self, endpoint_name: &str) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(endpoint_name)
    }
}
