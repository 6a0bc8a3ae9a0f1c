//! Wait-for-completion observer.
//!
//! `Subscribing -> Active -> Done`. A (re)connection puts an unfinished
//! observer back into `Subscribing` until the current status has been
//! re-queried; only a terminal status, either queried or pushed with a
//! finish timestamp, moves it to `Done`. [`wait_for`] runs the observer
//! against a [`Transport`]'s events.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use fleetspec_core::{PushEvent, Reference, TasksetStatus};

use crate::client::{Transport, TransportEvent};
use crate::error::TransportError;
use crate::message::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    /// Waiting for the subscription and the status re-query.
    Subscribing,
    /// Subscribed; waiting for the finish push.
    Active,
    /// The taskset finished with this status.
    Done(TasksetStatus),
}

#[derive(Debug)]
pub struct WaitObserver {
    taskset: Reference,
    state: WaitState,
}

impl WaitObserver {
    pub fn new(taskset: Reference) -> Self {
        Self {
            taskset,
            state: WaitState::Subscribing,
        }
    }

    pub fn taskset(&self) -> Reference {
        self.taskset
    }

    pub fn state(&self) -> WaitState {
        self.state
    }

    /// Terminal status, once done.
    pub fn finished(&self) -> Option<TasksetStatus> {
        match self.state {
            WaitState::Done(status) => Some(status),
            WaitState::Subscribing | WaitState::Active => None,
        }
    }

    /// A connection (re)opened. Pushes may have been missed.
    pub fn on_connected(&mut self) {
        if self.finished().is_none() {
            self.state = WaitState::Subscribing;
        }
    }

    /// Subscription confirmed and the current status queried.
    pub fn on_status(&mut self, status: TasksetStatus) {
        if self.finished().is_some() {
            return;
        }
        self.state = if status.is_terminal() {
            WaitState::Done(status)
        } else {
            WaitState::Active
        };
    }

    pub fn on_push(&mut self, event: &PushEvent) {
        if self.finished().is_some() {
            return;
        }
        if let PushEvent::TasksetUpdated {
            taskset, changes, ..
        } = event
        {
            if *taskset != self.taskset || !changes.is_terminal_finish() {
                return;
            }
            if let Some(status) = changes.status {
                self.state = WaitState::Done(status);
            }
        }
    }

    pub fn on_disconnected(&mut self) {
        if self.state == WaitState::Active {
            self.state = WaitState::Subscribing;
        }
    }
}

/// Follow a taskset until it finishes, surviving reconnects.
///
/// The caller has already consumed the first `Connected` event. Closes the
/// transport once the taskset is done. A subscription or status query the
/// scheduler rejects, e.g. an unknown taskset after a scheduler restart,
/// ends the wait with that error.
pub async fn wait_for(
    transport: &Transport,
    events: &mut mpsc::UnboundedReceiver<TransportEvent>,
    taskset: Reference,
) -> Result<TasksetStatus, TransportError> {
    let mut observer = WaitObserver::new(taskset);
    let mut event = Some(TransportEvent::Connected);

    loop {
        match event {
            Some(TransportEvent::Connected) => {
                observer.on_connected();
                match subscribe(transport, taskset).await {
                    Ok(status) => observer.on_status(status),
                    Err(TransportError::ConnectionLost | TransportError::Timeout) => {
                        warn!(taskset = %taskset, "Lost the scheduler while subscribing");
                    }
                    Err(e) => return Err(e),
                }
            }
            Some(TransportEvent::Push(ref push)) => observer.on_push(push),
            Some(TransportEvent::Disconnected) => observer.on_disconnected(),
            None => return Err(TransportError::Closed),
        }

        debug!(taskset = %taskset, state = ?observer.state(), "Wait state");
        if let Some(status) = observer.finished() {
            transport.close();
            return Ok(status);
        }
        event = events.recv().await;
    }
}

async fn subscribe(transport: &Transport, taskset: Reference) -> Result<TasksetStatus, TransportError> {
    transport.listen_to_taskset(taskset).await?;
    transport
        .call_as(Command::QueryTasksetStatus { taskset })
        .await
}
