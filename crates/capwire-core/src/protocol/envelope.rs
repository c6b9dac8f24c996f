//! Envelope shape and channel vocabulary shared by client and server.
//!
//! ```text
//! { "scope": "account-api", "channel": "call",
//!   "message": { "promiseId": "...", "methodName": "getAccounts", "parameters": [] } }
//! ```

use crate::error::{CapwireError, ErrorInfo, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Protocol action carried by an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Invoke a method (client → server, correlated).
    Call,
    /// Read a property (client → server, correlated).
    Get,
    /// Bind an event forwarder (client → server, fire-and-forget).
    Sub,
    /// Unbind an event forwarder (client → server, fire-and-forget).
    Unsub,
    /// Settle a promise (server → client).
    SetPromise,
    /// Event notification (server → client, uncorrelated).
    SendEvent,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Call => "call",
            Channel::Get => "get",
            Channel::Sub => "sub",
            Channel::Unsub => "unsub",
            Channel::SetPromise => "set-promise",
            Channel::SendEvent => "send-event",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "call" => Some(Channel::Call),
            "get" => Some(Channel::Get),
            "sub" => Some(Channel::Sub),
            "unsub" => Some(Channel::Unsub),
            "set-promise" => Some(Channel::SetPromise),
            "send-event" => Some(Channel::SendEvent),
            _ => None,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One discrete message exchanged over a connection.
///
/// `channel` is kept as the raw string so an unknown channel still decodes
/// and can be answered or logged; use [`Envelope::channel`] to classify it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub scope: String,
    pub channel: String,
    #[serde(default)]
    pub message: Value,
}

impl Envelope {
    pub fn new(scope: impl Into<String>, channel: Channel, message: Value) -> Self {
        Self {
            scope: scope.into(),
            channel: channel.as_str().to_string(),
            message,
        }
    }

    /// Classify the channel string.
    pub fn channel(&self) -> Result<Channel> {
        Channel::from_str(&self.channel)
            .ok_or_else(|| CapwireError::protocol(format!("unknown channel '{}'", self.channel)))
    }

    /// Decode the channel-specific payload.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        T::deserialize(&self.message).map_err(|e| {
            CapwireError::protocol(format!("malformed '{}' payload: {}", self.channel, e))
        })
    }

    /// Best-effort recovery of the promise id from a payload that failed to
    /// decode, so the sender can still be answered.
    pub fn salvage_promise_id(&self) -> Option<String> {
        self.message
            .get("promiseId")
            .and_then(|v| v.as_str())
            .map(String::from)
    }

    pub fn call(scope: impl Into<String>, payload: &CallPayload) -> Result<Self> {
        Ok(Self::new(scope, Channel::Call, serde_json::to_value(payload)?))
    }

    pub fn get(scope: impl Into<String>, payload: &GetPayload) -> Result<Self> {
        Ok(Self::new(scope, Channel::Get, serde_json::to_value(payload)?))
    }

    pub fn subscribe(scope: impl Into<String>, event_name: impl Into<String>) -> Result<Self> {
        let payload = SubscriptionPayload {
            event_name: event_name.into(),
        };
        Ok(Self::new(scope, Channel::Sub, serde_json::to_value(payload)?))
    }

    pub fn unsubscribe(scope: impl Into<String>, event_name: impl Into<String>) -> Result<Self> {
        let payload = SubscriptionPayload {
            event_name: event_name.into(),
        };
        Ok(Self::new(scope, Channel::Unsub, serde_json::to_value(payload)?))
    }

    /// Successful `set-promise` response.
    pub fn resolve(scope: impl Into<String>, promise_id: impl Into<String>, value: Value) -> Self {
        let message = serde_json::json!({
            "promiseId": promise_id.into(),
            "success": true,
            "value": value,
        });
        Self::new(scope, Channel::SetPromise, message)
    }

    /// Failed `set-promise` response.
    pub fn reject(
        scope: impl Into<String>,
        promise_id: impl Into<String>,
        error_info: &ErrorInfo,
    ) -> Self {
        let message = serde_json::json!({
            "promiseId": promise_id.into(),
            "success": false,
            "errorInfo": error_info,
        });
        Self::new(scope, Channel::SetPromise, message)
    }

    /// `send-event` notification.
    pub fn notify(scope: impl Into<String>, event_name: impl Into<String>, data: Value) -> Self {
        let message = serde_json::json!({
            "eventName": event_name.into(),
            "data": data,
        });
        Self::new(scope, Channel::SendEvent, message)
    }
}

/// Treats an absent or `null` parameter list as empty.
fn nullable_parameters<'de, D>(deserializer: D) -> std::result::Result<Vec<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default())
}

/// `call` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallPayload {
    pub promise_id: String,
    pub method_name: String,
    #[serde(default, deserialize_with = "nullable_parameters")]
    pub parameters: Vec<Value>,
}

/// `get` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPayload {
    pub promise_id: String,
    pub property_name: String,
}

/// `sub` / `unsub` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionPayload {
    pub event_name: String,
}

/// `set-promise` payload, either outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromisePayload {
    pub promise_id: String,
    pub success: bool,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_info: Option<ErrorInfo>,
}

impl PromisePayload {
    /// Collapse into the settled outcome; a failure without `errorInfo` is
    /// itself a protocol violation.
    pub fn into_outcome(self) -> std::result::Result<Value, ErrorInfo> {
        if self.success {
            return Ok(self.value);
        }
        Err(self.error_info.unwrap_or_else(|| {
            ErrorInfo::new(
                crate::error::ErrorKind::ProtocolError,
                "failed promise carried no errorInfo",
            )
        }))
    }
}

/// `send-event` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyPayload {
    pub event_name: String,
    #[serde(default)]
    pub data: Value,
}
