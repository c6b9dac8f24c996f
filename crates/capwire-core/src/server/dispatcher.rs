//! Inbound envelope dispatch for one connection.
//!
//! Each `call`/`get` is resolved against the target scope's registry and then
//! run as its own task, so a slow capability never stalls the receive loop.
//! Every outcome, success or failure, is answered with a `set-promise` envelope
//! tagged with the request's scope. `sub`/`unsub` go to the
//! [`SubscriptionRouter`] and are never answered.
//!
//! Invocation tasks belong to the dispatcher: dropping it aborts whatever is
//! still running, so a closed connection never keeps capabilities busy.

use super::registry::{InvokeFuture, Services};
use super::subscriptions::SubscriptionRouter;
use crate::protocol::{CallPayload, Channel, Envelope, GetPayload, SubscriptionPayload};
use crate::{CapwireError, Result};
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Routes one connection's inbound envelopes.
pub struct Dispatcher {
    services: Arc<Services>,
    outbound: mpsc::Sender<Envelope>,
    router: SubscriptionRouter,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(services: Arc<Services>, outbound: mpsc::Sender<Envelope>) -> Self {
        let router = SubscriptionRouter::new(services.clone(), outbound.clone());
        Self {
            services,
            outbound,
            router,
            in_flight: Mutex::new(Vec::new()),
        }
    }

    pub fn router(&self) -> &SubscriptionRouter {
        &self.router
    }

    /// Number of invocations that have not finished yet.
    pub fn in_flight(&self) -> usize {
        let mut tasks = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|task| !task.is_finished());
        tasks.len()
    }

    /// Abort every invocation still running. Their responses are never sent.
    pub fn abort_in_flight(&self) {
        let tasks: Vec<JoinHandle<()>> = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .filter(|task| !task.is_finished())
            .collect();
        if !tasks.is_empty() {
            debug!("Aborting {} in-flight invocation(s)", tasks.len());
        }
        for task in tasks {
            task.abort();
        }
    }

    /// Decode one raw frame and dispatch it.
    ///
    /// Frames that are JSON but not a valid envelope are still answered with a
    /// ProtocolError when a promise id can be recovered.
    pub fn dispatch_frame(&self, frame: &[u8]) {
        let raw: Value = match serde_json::from_slice(frame) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Discarding undecodable frame ({} bytes): {}", frame.len(), e);
                return;
            }
        };

        match serde_json::from_value::<Envelope>(raw.clone()) {
            Ok(envelope) => self.dispatch(envelope),
            Err(e) => {
                let salvaged = Envelope {
                    scope: raw
                        .get("scope")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    channel: String::new(),
                    message: raw.get("message").cloned().unwrap_or(Value::Null),
                };
                self.reject_uncorrelated(
                    &salvaged,
                    CapwireError::protocol(format!("malformed envelope: {}", e)),
                );
            }
        }
    }

    /// Dispatch one decoded envelope.
    pub fn dispatch(&self, envelope: Envelope) {
        match envelope.channel() {
            Ok(Channel::Call) => self.handle_call(envelope),
            Ok(Channel::Get) => self.handle_get(envelope),
            Ok(Channel::Sub) => self.handle_subscription(envelope, true),
            Ok(Channel::Unsub) => self.handle_subscription(envelope, false),
            Ok(channel @ (Channel::SetPromise | Channel::SendEvent)) => {
                warn!(
                    "Ignoring client-bound '{}' envelope received for scope '{}'",
                    channel, envelope.scope
                );
            }
            Err(e) => self.reject_uncorrelated(&envelope, e),
        }
    }

    fn handle_call(&self, envelope: Envelope) {
        let call: CallPayload = match envelope.payload() {
            Ok(call) => call,
            Err(e) => return self.reject_uncorrelated(&envelope, e),
        };

        debug!(
            "call {}.{} ({} params) [{}]",
            envelope.scope,
            call.method_name,
            call.parameters.len(),
            call.promise_id
        );

        let prepared = self
            .services
            .get(&envelope.scope)
            .and_then(|registry| registry.prepare_call(&call.method_name, call.parameters));
        self.settle(envelope.scope, call.promise_id, call.method_name, prepared);
    }

    fn handle_get(&self, envelope: Envelope) {
        let get: GetPayload = match envelope.payload() {
            Ok(get) => get,
            Err(e) => return self.reject_uncorrelated(&envelope, e),
        };

        debug!("get {}.{} [{}]", envelope.scope, get.property_name, get.promise_id);

        let prepared = self
            .services
            .get(&envelope.scope)
            .and_then(|registry| registry.prepare_get(&get.property_name));
        self.settle(envelope.scope, get.promise_id, get.property_name, prepared);
    }

    /// Administrative channels never answer; failures are only logged.
    fn handle_subscription(&self, envelope: Envelope, subscribe: bool) {
        let payload: SubscriptionPayload = match envelope.payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Ignoring malformed '{}' for scope '{}': {}", envelope.channel, envelope.scope, e);
                return;
            }
        };

        let result = if subscribe {
            self.router.subscribe(&envelope.scope, &payload.event_name)
        } else {
            self.router.unsubscribe(&envelope.scope, &payload.event_name)
        };

        match result {
            Ok(true) => {}
            Ok(false) => debug!(
                "'{}' of {}.{} had no effect",
                envelope.channel, envelope.scope, payload.event_name
            ),
            Err(e) => warn!(
                "'{}' of {}.{} failed: {}",
                envelope.channel, envelope.scope, payload.event_name, e
            ),
        }
    }

    /// Run a prepared invocation in its own task and answer with its outcome.
    fn settle(
        &self,
        scope: String,
        promise_id: String,
        target: String,
        prepared: Result<InvokeFuture>,
    ) {
        let outbound = self.outbound.clone();

        let task = tokio::spawn(async move {
            let outcome = match prepared {
                Ok(invocation) => AssertUnwindSafe(invocation)
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        Err(CapwireError::fault(format!(
                            "'{}' panicked: {}",
                            target,
                            panic_message(panic.as_ref())
                        )))
                    }),
                Err(e) => Err(e),
            };

            let response = match outcome {
                Ok(value) => Envelope::resolve(&scope, &promise_id, value),
                Err(e) => {
                    warn!("{}.{} failed [{}]: {}", scope, target, promise_id, e);
                    Envelope::reject(&scope, &promise_id, &e.to_error_info())
                }
            };

            if outbound.send(response).await.is_err() {
                debug!("Connection closed before response to [{}] was sent", promise_id);
            }
        });

        let mut tasks = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }

    /// Answer a request that could not be decoded, if it can be correlated.
    fn reject_uncorrelated(&self, envelope: &Envelope, error: CapwireError) {
        match envelope.salvage_promise_id() {
            Some(promise_id) => {
                warn!("Rejecting [{}] on scope '{}': {}", promise_id, envelope.scope, error);
                let response = Envelope::reject(&envelope.scope, &promise_id, &error.to_error_info());
                match self.outbound.try_send(response) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!("Outbound queue full; protocol error for [{}] dropped", promise_id)
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!("Connection closed before protocol error was sent")
                    }
                }
            }
            None => warn!(
                "Uncorrelatable '{}' envelope on scope '{}': {}",
                envelope.channel, envelope.scope, error
            ),
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.abort_in_flight();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
