//! Per-connection protocol handling.
//!
//! Each peer gets one reader loop and one writer task. Calls are handled
//! concurrently, each bounded by the configured call timeout, and answered
//! exactly once. Pushes for the tasksets the peer listens to are interleaved
//! with replies on the same connection.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use fleetspec_proto::{CallFrame, ErrorCode, Frame, MalformedFrame, Outcome, RpcError};

use crate::bus::SubscriberId;
use crate::scheduler::Scheduler;
use crate::service::dispatch;

/// Accept peers until the listener fails.
pub async fn serve(listener: TcpListener, scheduler: Arc<Scheduler>) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            handle_connection(stream, peer.to_string(), scheduler).await;
        });
    }
}

/// Drive one peer connection until it closes.
pub async fn handle_connection<S>(stream: S, peer: String, scheduler: Arc<Scheduler>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let connection_id = Uuid::new_v4();
    let state = scheduler.state().clone();
    let (subscriber, mut pushes) = state.bus.register().await;

    info!(connection_id = %connection_id, peer = %peer, "Peer connected");

    let codec = LinesCodec::new_with_max_length(state.config.max_frame_length);
    let (mut sink, mut lines) = Framed::new(stream, codec).split();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Frame>();

    let writer = tokio::spawn(async move {
        let mut pushes_open = true;
        loop {
            let frame = tokio::select! {
                frame = reply_rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
                event = pushes.recv(), if pushes_open => match event {
                    Some(event) => Frame::Push(event),
                    None => {
                        pushes_open = false;
                        continue;
                    }
                },
            };

            let line = match frame.to_line() {
                Ok(line) => line,
                Err(e) => {
                    error!(connection_id = %connection_id, error = %e, "Failed to encode frame");
                    continue;
                }
            };
            if let Err(e) = sink.send(line).await {
                warn!(connection_id = %connection_id, error = %e, "Write failed");
                break;
            }
        }
    });

    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                warn!(connection_id = %connection_id, "Frame exceeds maximum length");
                let malformed = MalformedFrame {
                    id: None,
                    reason: "frame exceeds maximum length".to_string(),
                };
                let _ = reply_tx.send(malformed.into_reply());
                continue;
            }
            Err(LinesCodecError::Io(e)) => {
                warn!(connection_id = %connection_id, error = %e, "Read failed");
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        match Frame::from_line(&line) {
            Ok(Frame::Call(call)) => {
                spawn_call(&scheduler, subscriber, call, reply_tx.clone());
            }
            Ok(other) => {
                warn!(connection_id = %connection_id, frame = ?other, "Peer sent a non-call frame");
                let malformed = MalformedFrame {
                    id: None,
                    reason: "peers may only send calls".to_string(),
                };
                let _ = reply_tx.send(malformed.into_reply());
            }
            Err(malformed) => {
                warn!(
                    connection_id = %connection_id,
                    id = ?malformed.id,
                    reason = %malformed.reason,
                    "Malformed frame"
                );
                let _ = reply_tx.send(malformed.into_reply());
            }
        }
    }

    // The writer drains replies of calls still in flight, then stops.
    drop(reply_tx);
    state.bus.unregister(subscriber).await;
    if let Err(e) = writer.await {
        error!(connection_id = %connection_id, error = %e, "Writer task failed");
    }

    info!(connection_id = %connection_id, peer = %peer, "Peer disconnected");
}

fn spawn_call(
    scheduler: &Arc<Scheduler>,
    subscriber: SubscriberId,
    call: CallFrame,
    replies: mpsc::UnboundedSender<Frame>,
) {
    let scheduler = scheduler.clone();
    let timeout = scheduler.state().config.call_timeout();

    tokio::spawn(async move {
        let CallFrame { id, command } = call;
        let method = command.method();
        debug!(id, method, "Call received");

        let work = tokio::spawn(async move {
            dispatch::handle_call(&scheduler, subscriber, command).await
        });

        let outcome = match tokio::time::timeout(timeout, work).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                error!(id, method, error = %e, "Call handler failed");
                Outcome::Err(RpcError::new(ErrorCode::Internal, "call handler failed"))
            }
            Err(_) => {
                warn!(id, method, "Call timed out");
                Outcome::Err(RpcError::new(
                    ErrorCode::Timeout,
                    format!("{} did not complete in time", method),
                ))
            }
        };

        let _ = replies.send(Frame::reply(id, outcome));
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use fleetspec_core::{
        NewTask, NewTaskset, PushEvent, Reference, TasksetStatus, TimeoutPolicy,
    };
    use fleetspec_proto::{
        wait_for, Command, ReplyFrame, Transport, TransportConfig, TransportEvent,
    };
    use serde_json::json;
    use tokio::io::DuplexStream;

    use crate::config::Config;
    use crate::state::AppState;

    fn scheduler() -> Arc<Scheduler> {
        Arc::new(Scheduler::new(AppState::new(Config::default())))
    }

    fn spec() -> NewTaskset {
        NewTaskset {
            rsync_name: "alice".into(),
            setup_command: String::new(),
            slave_command: String::new(),
            worker_type: "default".into(),
            max_workers: 1,
            max_trials: 1,
            taskset_class: "app".into(),
            timeout_policy: TimeoutPolicy::default(),
            tasks: vec![NewTask::new("a_spec.rb", "abc")],
        }
    }

    fn connect(scheduler: Arc<Scheduler>) -> Framed<DuplexStream, LinesCodec> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(handle_connection(server, "duplex".to_string(), scheduler));
        Framed::new(client, LinesCodec::new())
    }

    async fn next_reply(peer: &mut Framed<DuplexStream, LinesCodec>) -> ReplyFrame {
        loop {
            let line = peer.next().await.unwrap().unwrap();
            if let Frame::Reply(reply) = Frame::from_line(&line).unwrap() {
                return reply;
            }
        }
    }

    #[tokio::test]
    async fn test_call_is_answered_with_its_id() {
        let mut peer = connect(scheduler());

        let line = Frame::call(41, Command::CreateTaskset(spec())).to_line().unwrap();
        peer.send(line).await.unwrap();

        let reply = next_reply(&mut peer).await;
        assert_eq!(reply.id, Some(41));
        assert_eq!(reply.outcome, Outcome::Ok(json!(["taskset", 1])));
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection_alive() {
        let mut peer = connect(scheduler());

        peer.send("{this is not json".to_string()).await.unwrap();
        let reply = next_reply(&mut peer).await;
        assert_eq!(reply.id, None);
        assert!(matches!(reply.outcome, Outcome::Err(ref e) if e.code == ErrorCode::Malformed));

        let unknown = json!({"type": "call", "id": 5, "command": {"method": "explode"}});
        peer.send(unknown.to_string()).await.unwrap();
        let reply = next_reply(&mut peer).await;
        assert_eq!(reply.id, Some(5));
        assert!(matches!(reply.outcome, Outcome::Err(ref e) if e.code == ErrorCode::Malformed));

        let line = Frame::call(6, Command::ListWorkers).to_line().unwrap();
        peer.send(line).await.unwrap();
        let reply = next_reply(&mut peer).await;
        assert_eq!(reply.id, Some(6));
        assert_eq!(reply.outcome, Outcome::Ok(json!([])));
    }

    #[tokio::test]
    async fn test_listener_receives_pushes() {
        let scheduler = scheduler();
        let taskset = scheduler.create_taskset(spec()).await.unwrap();
        let mut peer = connect(scheduler.clone());

        let listen = Frame::call(
            1,
            Command::ListenToTaskset {
                taskset: Reference::Taskset(taskset.id),
            },
        );
        peer.send(listen.to_line().unwrap()).await.unwrap();
        let reply = next_reply(&mut peer).await;
        assert_eq!(reply.outcome, Outcome::Ok(json!("rsync_waiting")));

        scheduler.start_taskset(taskset.id).await.unwrap();

        let line = peer.next().await.unwrap().unwrap();
        match Frame::from_line(&line).unwrap() {
            Frame::Push(PushEvent::TasksetUpdated { changes, .. }) => {
                assert_eq!(changes.status, Some(TasksetStatus::Waiting));
                assert!(!changes.is_terminal_finish());
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_reaches_waiting_client_over_tcp() {
        let scheduler = scheduler();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, scheduler.clone()));

        let config = TransportConfig {
            addr: addr.to_string(),
            auto_reconnect: false,
            call_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let (client, mut events) = Transport::spawn(config.clone());
        assert_eq!(events.recv().await, Some(TransportEvent::Connected));

        let taskset: Reference = client.call_as(Command::CreateTaskset(spec())).await.unwrap();
        client.call(Command::StartTaskset { taskset }).await.unwrap();
        let taskset_id = taskset.decode().unwrap();
        assert!(scheduler.dequeue_task(taskset_id).await.unwrap().is_some());
        assert_eq!(
            scheduler.query_taskset_status(taskset_id).await.unwrap(),
            TasksetStatus::Running
        );

        // Subscribed before the waiter starts, so the finish push cannot be
        // missed whichever way the cancel races the status query.
        client.listen_to_taskset(taskset).await.unwrap();
        let waiter = {
            let client = client.clone();
            tokio::spawn(async move { wait_for(&client, &mut events, taskset).await })
        };

        // A second peer, e.g. `cancel` from another terminal.
        let (other, mut other_events) = Transport::spawn(config);
        assert_eq!(other_events.recv().await, Some(TransportEvent::Connected));
        let status: TasksetStatus = other
            .call_as(Command::CancelTaskset { taskset })
            .await
            .unwrap();
        assert_eq!(status, TasksetStatus::Cancelled);

        let waited = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiting client never saw the finish")
            .unwrap();
        assert_eq!(waited.unwrap(), TasksetStatus::Cancelled);
        assert!(client.is_closed());
        assert_eq!(scheduler.state().queue(taskset_id).size().await.unwrap(), 0);

        // The scheduler sees the waiting client hang up; only `other` remains.
        let bus = &scheduler.state().bus;
        tokio::time::timeout(Duration::from_secs(5), async {
            while bus.subscriber_count().await > 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("waiting client stayed connected");

        other.close();
    }
}
