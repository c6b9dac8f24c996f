//! Wires the handlers into a capwire server.

use crate::handlers::StatusApi;
use capwire_core::{Server, ServerHandle, Services};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Start serving every handler on `host:port`.
///
/// `heartbeat` is the interval of the status-api heartbeat event; `None`
/// never fires it. The returned handle stops the server when dropped.
pub async fn start_server(
    host: &str,
    port: u16,
    heartbeat: Option<Duration>,
) -> anyhow::Result<ServerHandle> {
    let status = Arc::new(StatusApi::new());

    let mut services = Services::new();
    services.add_handler(status.clone())?;

    let handle = Server::bind((host, port), services).await?;

    if let Some(interval) = heartbeat {
        info!("Heartbeat every {:?}", interval);
        status.spawn_heartbeat(interval);
    }

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use capwire_core::Client;
    use serde_json::json;

    #[tokio::test]
    async fn test_start_server_serves_status_api() {
        let mut handle = start_server("127.0.0.1", 0, None).await.unwrap();
        assert!(handle.port() > 0);

        let client = Client::connect(handle.addr()).await.unwrap();
        let echoed: serde_json::Value = client
            .call("status-api", "echo", vec![json!({"ping": true})])
            .await
            .unwrap();
        assert_eq!(echoed, json!({"ping": true}));

        handle.shutdown();
    }
}
