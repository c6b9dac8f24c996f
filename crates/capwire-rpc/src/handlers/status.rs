//! `status-api`: server information, a few utility methods and a heartbeat event.

use capwire_core::{ApiHandler, EventSource, RegistryBuilder};
use serde::Serialize;
use serde_json::Value;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;

pub const SCOPE: &str = "status-api";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct Heartbeat {
    sequence: u64,
    uptime_seconds: u64,
}

pub struct StatusApi {
    started: Instant,
    heartbeat: EventSource,
}

impl StatusApi {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            heartbeat: EventSource::new("heartbeat"),
        }
    }

    fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn info(&self) -> ServerInfo {
        ServerInfo {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            uptime_seconds: self.uptime_seconds(),
        }
    }

    /// Fire `heartbeat` every `interval` for as long as the runtime lives.
    pub fn spawn_heartbeat(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut sequence = 0u64;
            loop {
                ticker.tick().await;
                sequence += 1;
                let beat = Heartbeat {
                    sequence,
                    uptime_seconds: this.uptime_seconds(),
                };
                match this.heartbeat.emit(&beat) {
                    Ok(0) => {}
                    Ok(n) => debug!("Heartbeat {} sent to {} subscriber(s)", sequence, n),
                    Err(e) => debug!("Heartbeat {} not sent: {}", sequence, e),
                }
            }
        })
    }
}

impl Default for StatusApi {
    fn default() -> Self {
        Self::new()
    }
}

impl ApiHandler for StatusApi {
    fn scope(&self) -> &str {
        SCOPE
    }

    fn expose(self: Arc<Self>, registry: &mut RegistryBuilder) {
        let this = self.clone();
        registry
            .method("getServerInfo", move |()| {
                let info = this.info();
                async move { Ok::<_, Infallible>(info) }
            })
            .method("echo", |(value,): (Value,)| async move {
                Ok::<_, Infallible>(value)
            })
            .method("add", |(a, b): (i64, i64)| async move {
                a.checked_add(b)
                    .ok_or_else(|| format!("{} + {} overflows", a, b))
            })
            .method_with_optional(
                "greet",
                1,
                |(name, greeting): (String, Option<String>)| async move {
                    let greeting = greeting.unwrap_or_else(|| "Hello".to_string());
                    Ok::<_, Infallible>(format!("{}, {}!", greeting, name))
                },
            );

        let this = self.clone();
        registry
            .property("uptimeSeconds", move || {
                let this = this.clone();
                async move { Ok::<_, Infallible>(this.uptime_seconds()) }
            })
            .event(&self.heartbeat);
    }
}
