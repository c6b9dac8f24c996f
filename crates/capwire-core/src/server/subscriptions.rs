//! Per-connection event forwarding.
//!
//! A `sub` binds one forwarder per `(scope, event)` onto the handler's
//! [`EventSource`](super::event::EventSource); every firing is packaged as a
//! `send-event` envelope on the connection's outbound queue. Re-subscribing is
//! idempotent and `unsub` detaches the forwarder by dropping its handle.
//!
//! Firings never wait for the queue: when it is full the notification is
//! dropped with a warning, so a peer that stops reading cannot hold up the
//! emitter.

use super::event::EventSubscription;
use super::registry::Services;
use crate::protocol::Envelope;
use crate::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

type BindingKey = (String, String);

/// Forwarder bindings of one connection.
pub struct SubscriptionRouter {
    services: Arc<Services>,
    outbound: mpsc::Sender<Envelope>,
    bindings: Mutex<HashMap<BindingKey, EventSubscription>>,
}

impl SubscriptionRouter {
    pub fn new(services: Arc<Services>, outbound: mpsc::Sender<Envelope>) -> Self {
        Self {
            services,
            outbound,
            bindings: Mutex::new(HashMap::new()),
        }
    }

    /// Bind a forwarder for `event_name`. Returns `false` if one was already bound.
    pub fn subscribe(&self, scope: &str, event_name: &str) -> Result<bool> {
        let source = self.services.get(scope)?.event(event_name)?;

        let mut bindings = self.bindings.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (scope.to_string(), event_name.to_string());
        if bindings.contains_key(&key) {
            debug!("'{}/{}' already forwarded on this connection", scope, event_name);
            return Ok(false);
        }

        let outbound = self.outbound.clone();
        let forward_scope = scope.to_string();
        let forward_event = event_name.to_string();
        let subscription = source.attach(move |data: &Value| {
            let envelope = Envelope::notify(&forward_scope, &forward_event, data.clone());
            match outbound.try_send(envelope) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => warn!(
                    "Outbound queue full; dropping '{}/{}' notification",
                    forward_scope, forward_event
                ),
                Err(TrySendError::Closed(_)) => debug!(
                    "Connection closed; dropping '{}/{}' notification",
                    forward_scope, forward_event
                ),
            }
        });

        bindings.insert(key, subscription);
        debug!("Forwarding '{}/{}'", scope, event_name);
        Ok(true)
    }

    /// Detach the forwarder for `event_name`. Returns `false` if none was bound.
    pub fn unsubscribe(&self, scope: &str, event_name: &str) -> Result<bool> {
        self.services.get(scope)?.event(event_name)?;

        let removed = self
            .bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(scope.to_string(), event_name.to_string()));

        match removed {
            Some(subscription) => {
                subscription.cancel();
                debug!("Stopped forwarding '{}/{}'", scope, event_name);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn is_bound(&self, scope: &str, event_name: &str) -> bool {
        self.bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&(scope.to_string(), event_name.to_string()))
    }

    pub fn binding_count(&self) -> usize {
        self.bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Detach every forwarder (connection teardown).
    pub fn clear(&self) {
        let drained: Vec<EventSubscription> = self
            .bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, subscription)| subscription)
            .collect();
        if !drained.is_empty() {
            debug!("Detaching {} forwarder(s)", drained.len());
        }
    }
}

impl Drop for SubscriptionRouter {
    fn drop(&mut self) {
        self.clear();
    }
}
