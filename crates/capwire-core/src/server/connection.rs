//! One server-side connection: a receive loop feeding the [`Dispatcher`] and a
//! writer task draining the connection's outbound queue.

use super::dispatcher::Dispatcher;
use super::registry::Services;
use crate::config::ProtocolConfig;
use crate::protocol::{read_frame, write_envelope, Envelope};
use crate::Result;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Serve one connected byte stream until the peer closes it or `shutdown`
/// flips to `true`.
///
/// Responses and event notifications share the outbound queue, so they reach
/// the peer in the order they were produced. When the connection ends every
/// forwarder it bound is detached and every invocation still running is
/// aborted.
pub async fn serve_connection<S>(
    stream: S,
    services: Arc<Services>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (outbound_tx, mut outbound_rx) =
        mpsc::channel::<Envelope>(ProtocolConfig::OUTBOUND_BUFFER);

    let writer_task = tokio::spawn(async move {
        while let Some(envelope) = outbound_rx.recv().await {
            if let Err(e) = write_envelope(&mut writer, &envelope).await {
                debug!("Connection writer stopped: {}", e);
                break;
            }
        }
    });

    let dispatcher = Dispatcher::new(services, outbound_tx);

    let result = loop {
        if *shutdown.borrow() {
            break Ok(());
        }
        tokio::select! {
            frame = read_frame(&mut reader) => {
                match frame {
                    Ok(Some(frame)) => dispatcher.dispatch_frame(&frame),
                    Ok(None) => break Ok(()), // Clean disconnect
                    Err(e) => break Err(e),
                }
            }
            _ = shutdown.changed() => {
                break Ok(()); // Server shutting down
            }
        }
    };

    // Aborted invocations release their queue handles, so the writer flushes
    // what is already queued and stops. On shutdown it is cut short.
    drop(dispatcher);
    if *shutdown.borrow() {
        writer_task.abort();
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{read_envelope, CallPayload, Channel, PromisePayload};
    use crate::server::registry::CapabilityRegistry;
    use serde_json::{json, Value};
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    struct ReleaseOnDrop(Arc<AtomicBool>);

    impl Drop for ReleaseOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    struct Fixture {
        services: Arc<Services>,
        started: Arc<Notify>,
        released: Arc<AtomicBool>,
    }

    fn fixture() -> Fixture {
        let started = Arc::new(Notify::new());
        let released = Arc::new(AtomicBool::new(false));
        let (on_start, on_release) = (started.clone(), released.clone());

        let mut builder = CapabilityRegistry::builder("test-api");
        builder
            .method("echo", |(value,): (Value,)| async move { Ok::<_, Infallible>(value) })
            .method("wait", move |()| {
                let on_start = on_start.clone();
                let guard = ReleaseOnDrop(on_release.clone());
                async move {
                    let _guard = guard;
                    on_start.notify_one();
                    std::future::pending::<()>().await;
                    Ok::<_, Infallible>(())
                }
            });
        let mut services = Services::new();
        services.add(builder.build().unwrap()).unwrap();

        Fixture {
            services: Arc::new(services),
            started,
            released,
        }
    }

    fn call(promise_id: &str, method: &str, parameters: Vec<Value>) -> Envelope {
        Envelope::call(
            "test-api",
            &CallPayload {
                promise_id: promise_id.into(),
                method_name: method.into(),
                parameters,
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_answers_calls_over_stream() {
        let f = fixture();
        let (mut peer, stream) = tokio::io::duplex(64 * 1024);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let served = tokio::spawn(serve_connection(stream, f.services, shutdown_rx));

        write_envelope(&mut peer, &call("c1", "echo", vec![json!("hi")]))
            .await
            .unwrap();
        let response = tokio::time::timeout(Duration::from_secs(2), read_envelope(&mut peer))
            .await
            .expect("response in time")
            .unwrap()
            .expect("frame");
        assert_eq!(response.channel().unwrap(), Channel::SetPromise);
        let payload: PromisePayload = response.payload().unwrap();
        assert_eq!(payload.promise_id, "c1");
        assert_eq!(payload.into_outcome(), Ok(json!("hi")));

        drop(peer);
        let result = tokio::time::timeout(Duration::from_secs(2), served)
            .await
            .expect("connection ends")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_peer_close_aborts_running_invocations() {
        let f = fixture();
        let (mut peer, stream) = tokio::io::duplex(64 * 1024);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let served = tokio::spawn(serve_connection(stream, f.services, shutdown_rx));

        write_envelope(&mut peer, &call("w1", "wait", vec![])).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), f.started.notified())
            .await
            .expect("invocation started");
        assert!(!f.released.load(Ordering::SeqCst));

        drop(peer);
        tokio::time::timeout(Duration::from_secs(2), served)
            .await
            .expect("connection ends")
            .unwrap()
            .unwrap();

        for _ in 0..100 {
            if f.released.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(f.released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_shutdown_ends_connection() {
        let f = fixture();
        let (_peer, stream) = tokio::io::duplex(1024);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let served = tokio::spawn(serve_connection(stream, f.services, shutdown_rx));

        shutdown_tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), served)
            .await
            .expect("connection ends")
            .unwrap();
        assert!(result.is_ok());
    }
}

#[cfg(test)]
mod stream_tests {
    use super::*;
    use crate::protocol::{
        decode_envelope, write_envelope, CallPayload, Channel, NotifyPayload, PromisePayload,
    };
    use crate::server::event::EventSource;
    use crate::server::registry::CapabilityRegistry;
    use serde_json::json;
    use std::convert::Infallible;
    use std::time::Duration;

    async fn read_envelope<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Envelope {
        let frame = tokio::time::timeout(Duration::from_secs(2), read_frame(reader))
            .await
            .expect("frame in time")
            .unwrap()
            .expect("stream open");
        decode_envelope(&frame).unwrap()
    }

    #[tokio::test]
    async fn test_call_and_event_over_duplex() {
        let source = EventSource::new("tick");
        let mut builder = CapabilityRegistry::builder("clock-api");
        builder
            .method("double", |(x,): (i64,)| async move { Ok::<_, Infallible>(x * 2) })
            .event(&source);
        let mut services = Services::new();
        services.add(builder.build().unwrap()).unwrap();

        let (client, server) = tokio::io::duplex(64 * 1024);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let serving = tokio::spawn(serve_connection(server, Arc::new(services), shutdown_rx));

        let (mut reader, mut writer) = tokio::io::split(client);

        let call = Envelope::call(
            "clock-api",
            &CallPayload {
                promise_id: "c1".into(),
                method_name: "double".into(),
                parameters: vec![json!(21)],
            },
        )
        .unwrap();
        write_envelope(&mut writer, &call).await.unwrap();

        let response = read_envelope(&mut reader).await;
        let payload: PromisePayload = response.payload().unwrap();
        assert_eq!(payload.into_outcome(), Ok(json!(42)));

        write_envelope(&mut writer, &Envelope::subscribe("clock-api", "tick").unwrap())
            .await
            .unwrap();
        // Round-trip a call so the subscription is known to be processed.
        write_envelope(&mut writer, &call).await.unwrap();
        read_envelope(&mut reader).await;

        source.emit(&7).unwrap();
        let notification = read_envelope(&mut reader).await;
        assert_eq!(notification.channel().unwrap(), Channel::SendEvent);
        let payload: NotifyPayload = notification.payload().unwrap();
        assert_eq!(payload.event_name, "tick");
        assert_eq!(payload.data, json!(7));

        drop(writer);
        drop(reader);
        serving.await.unwrap().unwrap();
        assert_eq!(source.observer_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_ends_connection() {
        let (_client, server) = tokio::io::duplex(1024);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let serving = tokio::spawn(serve_connection(
            server,
            Arc::new(Services::new()),
            shutdown_rx,
        ));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), serving)
            .await
            .expect("connection closed in time")
            .unwrap()
            .unwrap();
    }
}
