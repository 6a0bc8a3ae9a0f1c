//! Client-side transport to the scheduler.
//!
//! A [`Transport`] owns one persistent connection. Calls are correlated by
//! id and bounded by a timeout; push events and connection state changes
//! arrive on the event channel returned by [`Transport::spawn`]. When
//! `auto_reconnect` is set the transport redials after a drop and re-issues
//! every `listen_to_taskset` it has made before reporting `Connected`.
//! `Connected` is reported even when a resubscription fails, so owners
//! always get the chance to re-query. Events missed while disconnected are
//! not replayed.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleetspec_core::{PushEvent, Reference};

use crate::error::TransportError;
use crate::frame::{Frame, Outcome, ReplyFrame};
use crate::message::Command;

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Scheduler address, `host:port`.
    pub addr: String,

    /// Redial after the connection drops.
    pub auto_reconnect: bool,

    /// Delay between dial attempts.
    pub reconnect_delay: Duration,

    /// Upper bound on one call's round trip.
    pub call_timeout: Duration,

    /// Longest accepted line, in bytes.
    pub max_frame_length: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:9999".to_string(),
            auto_reconnect: true,
            reconnect_delay: Duration::from_secs(5),
            call_timeout: Duration::from_secs(30),
            max_frame_length: 16 * 1024 * 1024,
        }
    }
}

/// What the transport reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Connected, with resubscription attempted. State may have moved while
    /// disconnected and subscriptions may have been rejected; re-query
    /// anything you depend on.
    Connected,
    Push(PushEvent),
    /// Connection dropped. Calls in flight failed with `ConnectionLost`.
    Disconnected,
}

struct Inner {
    config: TransportConfig,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Outcome>>>,
    subscriptions: Mutex<HashSet<Reference>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

/// Handle to a persistent scheduler connection. Cheap to clone.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    /// Start dialing in the background.
    ///
    /// The event channel closes once the transport stops for good: after
    /// [`Transport::close`], or after a drop when `auto_reconnect` is off.
    pub fn spawn(config: TransportConfig) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let transport = Self {
            inner: Arc::new(Inner {
                config,
                outbound: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                subscriptions: Mutex::new(HashSet::new()),
                next_id: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
            }),
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let runner = transport.clone();
        tokio::spawn(async move {
            runner.run(events_tx).await;
        });

        (transport, events_rx)
    }

    /// Issue a call and wait for its reply.
    pub async fn call(&self, command: Command) -> Result<Value, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let method = command.method();
        let line = Frame::call(id, command).to_line()?;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(id, tx);

        let sent = match self.inner.outbound.lock().await.as_ref() {
            Some(outbound) => outbound.send(line).is_ok(),
            None => false,
        };
        if !sent {
            self.inner.pending.lock().await.remove(&id);
            return Err(TransportError::ConnectionLost);
        }

        debug!(id, method, "Call sent");

        match tokio::time::timeout(self.inner.config.call_timeout, rx).await {
            Ok(Ok(Outcome::Ok(value))) => Ok(value),
            Ok(Ok(Outcome::Err(e))) => Err(TransportError::Remote(e)),
            Ok(Err(_)) => Err(TransportError::ConnectionLost),
            Err(_) => {
                self.inner.pending.lock().await.remove(&id);
                warn!(id, method, "Call timed out");
                Err(TransportError::Timeout)
            }
        }
    }

    /// Issue a call and decode the reply payload.
    pub async fn call_as<T: DeserializeOwned>(&self, command: Command) -> Result<T, TransportError> {
        let value = self.call(command).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Subscribe to a taskset's pushes; remembered across reconnects.
    pub async fn listen_to_taskset(&self, taskset: Reference) -> Result<(), TransportError> {
        self.call(Command::ListenToTaskset { taskset }).await?;
        self.inner.subscriptions.lock().await.insert(taskset);
        Ok(())
    }

    /// Stop for good and drop the connection.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    async fn run(self, events: mpsc::UnboundedSender<TransportEvent>) {
        let addr = self.inner.config.addr.clone();

        loop {
            if self.is_closed() {
                break;
            }

            info!(addr = %addr, "Connecting to scheduler");
            let dialed = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                dialed = TcpStream::connect(&addr) => dialed,
            };

            match dialed {
                Ok(stream) => {
                    self.drive(stream, &events).await;
                    if events.send(TransportEvent::Disconnected).is_err() {
                        break;
                    }
                    info!(addr = %addr, "Disconnected from scheduler");
                }
                Err(e) => {
                    warn!(addr = %addr, error = %e, "Failed to connect");
                }
            }

            if !self.inner.config.auto_reconnect || self.is_closed() {
                break;
            }

            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.inner.config.reconnect_delay) => {}
            }
        }

        debug!("Transport stopped");
    }

    /// Pump one connection until it drops or the transport closes.
    async fn drive<S>(&self, stream: S, events: &mpsc::UnboundedSender<TransportEvent>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let codec = LinesCodec::new_with_max_length(self.inner.config.max_frame_length);
        let mut framed = Framed::new(stream, codec);

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        *self.inner.outbound.lock().await = Some(tx);

        // Resubscribe off the read loop; replies arrive through it.
        let resubscriber = {
            let transport = self.clone();
            let events = events.clone();
            tokio::spawn(async move {
                transport.resubscribe().await;
                let _ = events.send(TransportEvent::Connected);
            })
        };

        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                line = rx.recv() => match line {
                    Some(line) => {
                        if let Err(e) = framed.send(line).await {
                            warn!(error = %e, "Write failed");
                            break;
                        }
                    }
                    None => break,
                },
                frame = framed.next() => match frame {
                    Some(Ok(line)) => self.dispatch(&line, events).await,
                    Some(Err(e)) => {
                        warn!(error = %e, "Read failed");
                        break;
                    }
                    None => break,
                },
            }
        }

        resubscriber.abort();
        *self.inner.outbound.lock().await = None;
        // Dropping the senders wakes every waiting caller with ConnectionLost.
        self.inner.pending.lock().await.clear();
    }

    /// Re-issue every remembered listen. Subscriptions the scheduler rejects
    /// are forgotten.
    async fn resubscribe(&self) {
        let subscriptions: Vec<Reference> =
            self.inner.subscriptions.lock().await.iter().copied().collect();
        for taskset in subscriptions {
            debug!(taskset = %taskset, "Resubscribing");
            match self.call(Command::ListenToTaskset { taskset }).await {
                Ok(_) => {}
                Err(TransportError::Remote(e)) => {
                    warn!(taskset = %taskset, error = %e, "Scheduler rejected resubscription");
                    self.inner.subscriptions.lock().await.remove(&taskset);
                }
                Err(e) => {
                    warn!(taskset = %taskset, error = %e, "Resubscription failed");
                    return;
                }
            }
        }
    }

    async fn dispatch(&self, line: &str, events: &mpsc::UnboundedSender<TransportEvent>) {
        match Frame::from_line(line) {
            Ok(Frame::Reply(ReplyFrame { id: Some(id), outcome })) => {
                match self.inner.pending.lock().await.remove(&id) {
                    Some(waiter) => {
                        let _ = waiter.send(outcome);
                    }
                    None => debug!(id, "Reply for unknown or expired call"),
                }
            }
            Ok(Frame::Reply(ReplyFrame { id: None, outcome })) => {
                warn!(outcome = ?outcome, "Scheduler rejected an unidentifiable frame");
            }
            Ok(Frame::Push(event)) => {
                let _ = events.send(TransportEvent::Push(event));
            }
            Ok(Frame::Call(call)) => {
                warn!(id = call.id, "Ignoring call from scheduler");
            }
            Err(malformed) => {
                warn!(reason = %malformed.reason, "Malformed frame from scheduler");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ErrorCode, RpcError};
    use fleetspec_core::{Referable, TasksetId};
    use serde_json::json;
    use tokio::net::TcpListener;

    /// Answers every call with its own method name and counts listens.
    async fn echo_server(listener: TcpListener, listens: mpsc::UnboundedSender<()>) {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let listens = listens.clone();
            tokio::spawn(async move {
                let mut framed = Framed::new(stream, LinesCodec::new());
                while let Some(Ok(line)) = framed.next().await {
                    if let Ok(Frame::Call(call)) = Frame::from_line(&line) {
                        if matches!(call.command, Command::ListenToTaskset { .. }) {
                            let _ = listens.send(());
                        }
                        let reply =
                            Frame::reply(call.id, Outcome::Ok(json!(call.command.method())));
                        let _ = framed.send(reply.to_line().unwrap()).await;
                    }
                }
            });
        }
    }

    fn config(addr: String) -> TransportConfig {
        TransportConfig {
            addr,
            reconnect_delay: Duration::from_millis(20),
            call_timeout: Duration::from_secs(5),
            ..TransportConfig::default()
        }
    }

    #[tokio::test]
    async fn test_call_is_correlated() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (listens_tx, _listens_rx) = mpsc::unbounded_channel();
        tokio::spawn(echo_server(listener, listens_tx));

        let (transport, mut events) = Transport::spawn(config(addr));
        assert_eq!(events.recv().await, Some(TransportEvent::Connected));

        let method: String = transport
            .call_as(Command::QueryTasksetStatus {
                taskset: TasksetId::new(1).to_ref(),
            })
            .await
            .unwrap();
        assert_eq!(method, "query_taskset_status");

        transport.close();
        assert!(matches!(
            transport.call(Command::ListWorkers).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_call_without_connection_fails_fast() {
        // Nothing listens on this port once the listener is dropped.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mut cfg = config(addr);
        cfg.auto_reconnect = false;
        let (transport, mut events) = Transport::spawn(cfg);

        let result = transport.call(Command::ListWorkers).await;
        assert!(matches!(result, Err(TransportError::ConnectionLost)));
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn test_reconnect_resubscribes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // First server: accept one connection, answer one listen, then hang up.
        let first = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, LinesCodec::new());
            let line = framed.next().await.unwrap().unwrap();
            let Ok(Frame::Call(call)) = Frame::from_line(&line) else {
                panic!("expected a call");
            };
            framed
                .send(Frame::reply(call.id, Outcome::Ok(Value::Null)).to_line().unwrap())
                .await
                .unwrap();
            listener
        });

        let (transport, mut events) = Transport::spawn(config(addr.to_string()));
        assert_eq!(events.recv().await, Some(TransportEvent::Connected));
        transport
            .listen_to_taskset(TasksetId::new(9).to_ref())
            .await
            .unwrap();

        let listener = first.await.unwrap();
        assert_eq!(events.recv().await, Some(TransportEvent::Disconnected));

        // Second server on the same port sees the resubscription.
        let (listens_tx, mut listens_rx) = mpsc::unbounded_channel();
        tokio::spawn(echo_server(listener, listens_tx));

        assert_eq!(events.recv().await, Some(TransportEvent::Connected));
        assert!(listens_rx.recv().await.is_some());

        transport.close();
    }

    /// Answers `listen_to_taskset` with an error and everything else with null.
    async fn forgetful_server(listener: TcpListener) {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let mut framed = Framed::new(stream, LinesCodec::new());
        while let Some(Ok(line)) = framed.next().await {
            if let Ok(Frame::Call(call)) = Frame::from_line(&line) {
                let outcome = match call.command {
                    Command::ListenToTaskset { taskset } => Outcome::Err(RpcError::new(
                        ErrorCode::InvalidReference,
                        format!("Not found: {}", taskset),
                    )),
                    _ => Outcome::Ok(Value::Null),
                };
                let reply = Frame::reply(call.id, outcome);
                let _ = framed.send(reply.to_line().unwrap()).await;
            }
        }
    }

    #[tokio::test]
    async fn test_rejected_resubscription_still_reports_connected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let first = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, LinesCodec::new());
            let line = framed.next().await.unwrap().unwrap();
            let Ok(Frame::Call(call)) = Frame::from_line(&line) else {
                panic!("expected a call");
            };
            framed
                .send(Frame::reply(call.id, Outcome::Ok(Value::Null)).to_line().unwrap())
                .await
                .unwrap();
            listener
        });

        let (transport, mut events) = Transport::spawn(config(addr.to_string()));
        assert_eq!(events.recv().await, Some(TransportEvent::Connected));
        let taskset = TasksetId::new(9).to_ref();
        transport.listen_to_taskset(taskset).await.unwrap();

        let listener = first.await.unwrap();
        assert_eq!(events.recv().await, Some(TransportEvent::Disconnected));

        // A restarted scheduler no longer knows the taskset.
        tokio::spawn(forgetful_server(listener));
        let event = tokio::time::timeout(Duration::from_secs(3), events.recv()).await;
        assert_eq!(event.unwrap(), Some(TransportEvent::Connected));
        assert!(transport.inner.subscriptions.lock().await.is_empty());

        // The owner's re-query surfaces the rejection instead of hanging.
        let err = transport.listen_to_taskset(taskset).await.unwrap_err();
        assert!(matches!(err, TransportError::Remote(ref e) if e.code == ErrorCode::InvalidReference));

        transport.close();
    }
}
