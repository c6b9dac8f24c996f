//! Client connection to a capwire server.
//!
//! One receive loop per connection settles promises and fans out event
//! notifications; one writer task drains the outbound queue. Any number of
//! tasks may issue requests concurrently through a shared `&Client`.

use super::promise_store::PromiseStore;
use crate::config::ProtocolConfig;
use crate::protocol::{
    decode_envelope, read_frame, write_envelope, CallPayload, Channel, Envelope, GetPayload,
    NotifyPayload, PromisePayload,
};
use crate::{CapwireError, ErrorInfo, ErrorKind, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Event notification pushed by the server for a subscribed event.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub scope: String,
    pub event_name: String,
    pub data: Value,
}

impl Notification {
    /// Decode the event data as `T`.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        T::deserialize(&self.data).map_err(|e| {
            CapwireError::protocol(format!(
                "data of event '{}' does not match the expected type: {}",
                self.event_name, e
            ))
        })
    }
}

/// Connection to a capwire server.
pub struct Client {
    outbound: mpsc::UnboundedSender<Envelope>,
    promises: PromiseStore,
    notifications: broadcast::Sender<Notification>,
    peer_addr: Option<SocketAddr>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl Client {
    /// Connect over TCP, giving up after `ProtocolConfig::CONNECT_TIMEOUT`.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = tokio::time::timeout(ProtocolConfig::CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| CapwireError::connection_closed("connect timed out"))??;

        let peer_addr = stream.peer_addr()?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY: {}", e);
        }
        debug!("Client connected to {}", peer_addr);

        let mut client = Self::from_stream(stream);
        client.peer_addr = Some(peer_addr);
        Ok(client)
    }

    /// Run the protocol over an already connected byte stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();
        let (notifications, _) = broadcast::channel(ProtocolConfig::NOTIFICATION_BUFFER);
        let promises = PromiseStore::new();

        let writer_promises = promises.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(envelope) = outbound_rx.recv().await {
                if let Err(e) = write_envelope(&mut writer, &envelope).await {
                    debug!("Client writer stopped: {}", e);
                    writer_promises.cancel_all(&format!("write failed: {}", e));
                    break;
                }
            }
        });

        let reader_promises = promises.clone();
        let reader_notifications = notifications.clone();
        let reader_task = tokio::spawn(async move {
            let reason = loop {
                match read_frame(&mut reader).await {
                    Ok(Some(frame)) => {
                        handle_frame(&frame, &reader_promises, &reader_notifications)
                    }
                    Ok(None) => break "connection closed by peer".to_string(),
                    Err(e) => break e.to_string(),
                }
            };
            debug!("Client receive loop ended: {}", reason);
            reader_promises.cancel_all(&reason);
        });

        Self {
            outbound,
            promises,
            notifications,
            peer_addr: None,
            reader_task,
            writer_task,
        }
    }

    fn send(&self, envelope: Envelope) -> Result<()> {
        self.outbound
            .send(envelope)
            .map_err(|_| CapwireError::connection_closed("connection writer stopped"))
    }

    /// Invoke `method` on `scope` and decode its return value as `T`.
    pub async fn call<T: DeserializeOwned>(
        &self,
        scope: &str,
        method: &str,
        parameters: Vec<Value>,
    ) -> Result<T> {
        let pending = self.promises.create()?;
        let envelope = Envelope::call(
            scope,
            &CallPayload {
                promise_id: pending.id().to_string(),
                method_name: method.to_string(),
                parameters,
            },
        )?;
        debug!("call {}.{} [{}]", scope, method, pending.id());
        self.send(envelope)?;
        pending.await_result().await
    }

    /// Read `property` on `scope` and decode it as `T`.
    pub async fn get<T: DeserializeOwned>(&self, scope: &str, property: &str) -> Result<T> {
        let pending = self.promises.create()?;
        let envelope = Envelope::get(
            scope,
            &GetPayload {
                promise_id: pending.id().to_string(),
                property_name: property.to_string(),
            },
        )?;
        debug!("get {}.{} [{}]", scope, property, pending.id());
        self.send(envelope)?;
        pending.await_result().await
    }

    /// Ask the server to forward `event` of `scope` to this connection.
    ///
    /// Fire-and-forget: the server sends no reply, and an unknown event is
    /// only logged on the server side.
    pub fn subscribe(&self, scope: &str, event: &str) -> Result<()> {
        self.ensure_open()?;
        self.send(Envelope::subscribe(scope, event)?)
    }

    /// Stop forwarding `event` of `scope`. Fire-and-forget like [`subscribe`](Self::subscribe).
    pub fn unsubscribe(&self, scope: &str, event: &str) -> Result<()> {
        self.ensure_open()?;
        self.send(Envelope::unsubscribe(scope, event)?)
    }

    /// New receiver of event notifications arriving after this call.
    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    /// Close the connection. Every outstanding request fails with
    /// `ConnectionClosed` and no new request can be issued.
    pub fn disconnect(&self) {
        let cancelled = self.promises.cancel_all("disconnected by client");
        debug!("Client disconnecting ({} request(s) cancelled)", cancelled);
        self.reader_task.abort();
        self.writer_task.abort();
    }

    pub fn pending_requests(&self) -> usize {
        self.promises.pending_count()
    }

    pub fn is_connected(&self) -> bool {
        !self.promises.is_closed()
    }

    /// Remote address when connected over TCP.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// View of this connection bound to one scope.
    pub fn scope(&self, scope: impl Into<String>) -> ScopeClient<'_> {
        ScopeClient {
            client: self,
            scope: scope.into(),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.promises.is_closed() {
            return Err(CapwireError::connection_closed("connection is closed"));
        }
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("peer_addr", &self.peer_addr)
            .field("pending_requests", &self.pending_requests())
            .finish()
    }
}

/// Route one inbound frame.
fn handle_frame(
    frame: &[u8],
    promises: &PromiseStore,
    notifications: &broadcast::Sender<Notification>,
) {
    let envelope = match decode_envelope(frame) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("Dropping inbound frame: {}", e);
            return;
        }
    };

    match envelope.channel() {
        Ok(Channel::SetPromise) => match envelope.payload::<PromisePayload>() {
            Ok(payload) => {
                let promise_id = payload.promise_id.clone();
                match payload.into_outcome() {
                    Ok(value) => promises.complete(&promise_id, value),
                    Err(error_info) => promises.fail(&promise_id, error_info),
                };
            }
            Err(e) => match envelope.salvage_promise_id() {
                Some(promise_id) => {
                    promises.fail(
                        &promise_id,
                        ErrorInfo::new(ErrorKind::ProtocolError, e.to_string()),
                    );
                }
                None => warn!("Dropping uncorrelated set-promise: {}", e),
            },
        },
        Ok(Channel::SendEvent) => match envelope.payload::<NotifyPayload>() {
            Ok(payload) => {
                let notification = Notification {
                    scope: envelope.scope,
                    event_name: payload.event_name,
                    data: payload.data,
                };
                if let Err(broadcast::error::SendError(dropped)) = notifications.send(notification) {
                    debug!(
                        "No listener for '{}' notification of scope '{}'",
                        dropped.event_name, dropped.scope
                    );
                }
            }
            Err(e) => warn!("Dropping notification: {}", e),
        },
        Ok(channel) => warn!("Unexpected '{}' envelope from server", channel),
        Err(e) => warn!("Dropping inbound envelope: {}", e),
    }
}

/// [`Client`] view bound to a single scope.
#[derive(Debug)]
pub struct ScopeClient<'a> {
    client: &'a Client,
    scope: String,
}

impl ScopeClient<'_> {
    pub fn name(&self) -> &str {
        &self.scope
    }

    pub async fn call<T: DeserializeOwned>(&self, method: &str, parameters: Vec<Value>) -> Result<T> {
        self.client.call(&self.scope, method, parameters).await
    }

    pub async fn get<T: DeserializeOwned>(&self, property: &str) -> Result<T> {
        self.client.get(&self.scope, property).await
    }

    pub fn subscribe(&self, event: &str) -> Result<()> {
        self.client.subscribe(&self.scope, event)
    }

    pub fn unsubscribe(&self, event: &str) -> Result<()> {
        self.client.unsubscribe(&self.scope, event)
    }
}
