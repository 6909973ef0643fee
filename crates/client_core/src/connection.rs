//! Connection lifecycle: owns the transport, performs the handshake, retries
//! with backoff, and delivers decoded host messages in sequence order.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use shared::{
    domain::SessionId,
    error::ProtocolError,
    protocol::{
        decode_host_frame, encode_client_frame, ClientMessage, HostBody, HostEnvelope,
        HostMessage,
    },
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    config::ClientConfig,
    error::ConnectionError,
    transport::{Connector, FrameSink, FrameStream},
    widget_state::Outbox,
};

const STATE_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Initial,
    Connecting,
    Connected,
    /// Transport lost; another attempt is scheduled.
    DisconnectedRecoverable,
    /// Terminal: host shut the session down, the retry budget ran out, or the
    /// client closed the connection.
    DisconnectedForever,
    /// Replaying a saved session with no live host.
    Static,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Initial, Connecting)
                | (Initial, Static)
                | (Initial, DisconnectedForever)
                | (Connecting, Connected)
                | (Connecting, DisconnectedRecoverable)
                | (Connecting, DisconnectedForever)
                | (Connected, DisconnectedRecoverable)
                | (Connected, DisconnectedForever)
                | (DisconnectedRecoverable, Connecting)
                | (DisconnectedRecoverable, DisconnectedForever)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::DisconnectedForever | ConnectionState::Static
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal connection transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

#[derive(Debug)]
pub struct StateMachine {
    current: ConnectionState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            current: ConnectionState::Initial,
        }
    }

    pub fn current(&self) -> ConnectionState {
        self.current
    }

    pub fn transition(&mut self, next: ConnectionState) -> Result<(), InvalidTransition> {
        if !self.current.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.current,
                to: next,
            });
        }
        self.current = next;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            initial_delay: config.retry_initial_delay(),
            max_delay: config.retry_max_delay(),
            max_retries: config.max_retries,
        }
    }

    /// Delay before the attempt that follows `failures` consecutive failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    pub fn is_exhausted(&self, failures: u32) -> bool {
        failures > self.max_retries
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: SessionId,
    /// False when the host resumed the session this client was attached to.
    pub is_new_session: bool,
    pub widget_states_invalid: bool,
    pub max_cached_message_age: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    SessionStarted(SessionInfo),
    Message(HostEnvelope),
    DecodeFailed { seq: Option<u64>, reason: String },
}

struct Shared {
    machine: Mutex<StateMachine>,
    state_events: broadcast::Sender<ConnectionState>,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn new() -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<ClientMessage>,
        watch::Receiver<bool>,
    ) {
        let (state_events, _) = broadcast::channel(STATE_EVENT_CAPACITY);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Self {
            machine: Mutex::new(StateMachine::new()),
            state_events,
            outbound,
            shutdown,
        });
        (shared, outbound_rx, shutdown_rx)
    }

    fn state(&self) -> ConnectionState {
        self.machine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .current()
    }

    fn transition(&self, next: ConnectionState) -> bool {
        let mut machine = self.machine.lock().unwrap_or_else(PoisonError::into_inner);
        match machine.transition(next) {
            Ok(()) => {
                // Published under the lock so subscribers observe transitions in order.
                let _ = self.state_events.send(next);
                match next {
                    ConnectionState::DisconnectedRecoverable => {
                        warn!(state = ?next, "connection: state changed")
                    }
                    ConnectionState::DisconnectedForever => {
                        error!(state = ?next, "connection: state changed")
                    }
                    _ => info!(state = ?next, "connection: state changed"),
                }
                true
            }
            Err(err) => {
                debug!("connection: {err}");
                false
            }
        }
    }
}

/// Cloneable access to a running connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<ConnectionState> {
        self.shared.state_events.subscribe()
    }

    /// Queues `message` for the host. Only legal while connected.
    pub fn send(&self, message: ClientMessage) -> Result<(), ConnectionError> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(ConnectionError::NotConnected(state));
        }
        self.shared
            .outbound
            .send(message)
            .map_err(|_| ConnectionError::DriverStopped)
    }

    pub fn close(&self) {
        self.shared.shutdown.send_replace(true);
    }
}

impl Outbox for ConnectionHandle {
    fn deliver(&self, message: ClientMessage) -> Result<(), ConnectionError> {
        self.send(message)
    }
}

pub struct Connection {
    pub handle: ConnectionHandle,
    pub inbound: mpsc::Receiver<Inbound>,
    /// Subscribed before the driver starts, so no transition is missed.
    pub states: broadcast::Receiver<ConnectionState>,
    pub task: JoinHandle<()>,
}

impl Connection {
    pub fn start(connector: Arc<dyn Connector>, config: &ClientConfig) -> Self {
        let (shared, outbound_rx, shutdown_rx) = Shared::new();
        let states = shared.state_events.subscribe();
        let (inbound_tx, inbound) = mpsc::channel(config.inbound_queue_capacity.max(1));

        let driver = Driver {
            connector,
            shared: Arc::clone(&shared),
            policy: RetryPolicy::from_config(config),
            connect_timeout: config.connect_timeout(),
            max_consecutive_decode_errors: config.max_consecutive_decode_errors.max(1),
            max_reorder_window: config.max_reorder_window.max(1),
            inbound: inbound_tx,
            outbound: outbound_rx,
            shutdown: shutdown_rx,
            session_id: None,
        };
        let task = tokio::spawn(driver.run());

        Self {
            handle: ConnectionHandle { shared },
            inbound,
            states,
            task,
        }
    }

    /// Serves a recorded session: enters `Static` and delivers `envelopes` in
    /// sequence order. Nothing can be sent.
    pub fn replay(mut envelopes: Vec<HostEnvelope>, config: &ClientConfig) -> Self {
        let (shared, _outbound_rx, _shutdown_rx) = Shared::new();
        let states = shared.state_events.subscribe();
        shared.transition(ConnectionState::Static);
        let (inbound_tx, inbound) = mpsc::channel(config.inbound_queue_capacity.max(1));

        envelopes.sort_by_key(|envelope| envelope.seq);
        let task = tokio::spawn(async move {
            info!(count = envelopes.len(), "connection: replaying static session");
            for envelope in envelopes {
                if matches!(
                    envelope.body,
                    HostBody::Message(HostMessage::SessionShutdown { .. })
                ) {
                    continue;
                }
                if inbound_tx.send(Inbound::Message(envelope)).await.is_err() {
                    break;
                }
            }
        });

        Self {
            handle: ConnectionHandle { shared },
            inbound,
            states,
            task,
        }
    }
}

/// Restores host order from per-connection sequence numbers.
#[derive(Debug)]
pub(crate) struct Resequencer {
    next: u64,
    pending: BTreeMap<u64, Option<HostEnvelope>>,
    window: usize,
}

impl Resequencer {
    pub(crate) fn new(next: u64, window: usize) -> Self {
        Self {
            next,
            pending: BTreeMap::new(),
            window,
        }
    }

    /// Files `slot` under `seq` and returns every envelope now deliverable.
    /// A `None` slot marks a frame that was dropped.
    pub(crate) fn push(
        &mut self,
        seq: u64,
        slot: Option<HostEnvelope>,
    ) -> Result<Vec<HostEnvelope>, ConnectionError> {
        if seq < self.next || self.pending.contains_key(&seq) {
            debug!(seq, next = self.next, "connection: dropping duplicate frame");
            return Ok(Vec::new());
        }
        self.pending.insert(seq, slot);
        if self.pending.len() > self.window {
            return Err(ConnectionError::ReorderWindowExceeded {
                expected: self.next,
                buffered: self.pending.len(),
            });
        }

        Ok(self.drain())
    }

    /// Marks the lowest missing slot as dropped. Used for frames whose
    /// sequence number could not be read.
    pub(crate) fn skip_next(&mut self) -> Vec<HostEnvelope> {
        debug!(seq = self.next, "connection: skipping unreadable slot");
        self.pending.insert(self.next, None);
        self.drain()
    }

    fn drain(&mut self) -> Vec<HostEnvelope> {
        let mut ready = Vec::new();
        while let Some(slot) = self.pending.remove(&self.next) {
            self.next += 1;
            if let Some(envelope) = slot {
                ready.push(envelope);
            }
        }
        ready
    }
}

struct Link {
    sink: FrameSink,
    stream: FrameStream,
    resequencer: Resequencer,
}

enum Attempt {
    Ready(Link, SessionInfo),
    Terminated(Option<String>),
}

enum LinkOutcome {
    Dropped(ConnectionError),
    Terminated(Option<String>),
    Closed,
}

enum Flow {
    Continue,
    Terminated(Option<String>),
    ConsumerGone,
}

struct Driver {
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    policy: RetryPolicy,
    connect_timeout: Duration,
    max_consecutive_decode_errors: u32,
    max_reorder_window: usize,
    inbound: mpsc::Sender<Inbound>,
    outbound: mpsc::UnboundedReceiver<ClientMessage>,
    shutdown: watch::Receiver<bool>,
    session_id: Option<SessionId>,
}

impl Driver {
    async fn run(mut self) {
        if !self.shared.transition(ConnectionState::Connecting) {
            return;
        }

        let mut failures: u32 = 0;
        loop {
            let mut shutdown = self.shutdown.clone();
            let attempt = tokio::select! {
                attempt = self.open_link() => attempt,
                _ = wait_for_shutdown(&mut shutdown) => {
                    self.shared.transition(ConnectionState::DisconnectedForever);
                    return;
                }
            };

            let failure = match attempt {
                Ok(Attempt::Ready(link, info)) => {
                    failures = 0;
                    if info.is_new_session {
                        let stale = discard_queued(&mut self.outbound);
                        if stale > 0 {
                            warn!(
                                stale,
                                "connection: discarding messages queued for the previous session"
                            );
                        }
                    }
                    self.session_id = Some(info.session_id.clone());
                    if !self.shared.transition(ConnectionState::Connected) {
                        return;
                    }
                    info!(
                        session_id = %info.session_id,
                        new_session = info.is_new_session,
                        "connection: session ready"
                    );
                    if self.inbound.send(Inbound::SessionStarted(info)).await.is_err() {
                        self.shared.transition(ConnectionState::DisconnectedForever);
                        return;
                    }
                    match self.pump(link).await {
                        LinkOutcome::Dropped(err) => err,
                        LinkOutcome::Terminated(reason) => {
                            self.terminate(reason);
                            return;
                        }
                        LinkOutcome::Closed => {
                            self.shared.transition(ConnectionState::DisconnectedForever);
                            return;
                        }
                    }
                }
                Ok(Attempt::Terminated(reason)) => {
                    self.terminate(reason);
                    return;
                }
                Err(err) => err,
            };

            failures = failures.saturating_add(1);
            if self.policy.is_exhausted(failures) {
                error!(
                    failures,
                    "connection: retry budget exhausted, last error: {failure}"
                );
                self.shared.transition(ConnectionState::DisconnectedForever);
                return;
            }
            warn!(failures, "connection: attempt failed: {failure}");
            self.shared
                .transition(ConnectionState::DisconnectedRecoverable);

            let delay = self.policy.delay_for(failures);
            debug!(delay_ms = delay.as_millis() as u64, "connection: scheduling retry");
            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_shutdown(&mut shutdown) => {
                    self.shared.transition(ConnectionState::DisconnectedForever);
                    return;
                }
            }
            if !self.shared.transition(ConnectionState::Connecting) {
                return;
            }
        }
    }

    fn terminate(&self, reason: Option<String>) {
        info!(
            reason = reason.as_deref().unwrap_or("unspecified"),
            "connection: host terminated the session"
        );
        self.shared.transition(ConnectionState::DisconnectedForever);
    }

    async fn open_link(&self) -> Result<Attempt, ConnectionError> {
        let timeout_ms = self.connect_timeout.as_millis() as u64;
        tokio::time::timeout(self.connect_timeout, self.handshake())
            .await
            .map_err(|_| ConnectionError::Timeout(timeout_ms))?
    }

    async fn handshake(&self) -> Result<Attempt, ConnectionError> {
        let (mut sink, mut stream) = self.connector.connect().await?;
        let hello = encode_client_frame(&ClientMessage::Hello {
            resume_session_id: self.session_id.clone(),
        })?;
        sink.send(hello).await?;

        let frame = match stream.next().await {
            Some(frame) => frame?,
            None => {
                return Err(ConnectionError::Handshake(
                    "transport closed before the session was ready".into(),
                ))
            }
        };
        let envelope = decode_host_frame(&frame)?;
        match envelope.body {
            HostBody::Message(HostMessage::SessionReady {
                session_id,
                widget_states_invalid,
                max_cached_message_age,
            }) => {
                let info = SessionInfo {
                    is_new_session: self.session_id.as_ref() != Some(&session_id),
                    session_id,
                    widget_states_invalid,
                    max_cached_message_age,
                };
                let link = Link {
                    sink,
                    stream,
                    resequencer: Resequencer::new(
                        envelope.seq.saturating_add(1),
                        self.max_reorder_window,
                    ),
                };
                Ok(Attempt::Ready(link, info))
            }
            HostBody::Message(HostMessage::SessionShutdown { reason }) => {
                Ok(Attempt::Terminated(reason))
            }
            other => Err(ConnectionError::Handshake(format!(
                "expected session_ready, got {other:?}"
            ))),
        }
    }

    async fn pump(&mut self, link: Link) -> LinkOutcome {
        let Link {
            mut sink,
            mut stream,
            mut resequencer,
        } = link;
        let mut shutdown = self.shutdown.clone();
        let mut decode_failures: u32 = 0;

        loop {
            tokio::select! {
                frame = stream.next() => {
                    let bytes = match frame {
                        Some(Ok(bytes)) => bytes,
                        Some(Err(err)) => return LinkOutcome::Dropped(err.into()),
                        None => {
                            return LinkOutcome::Dropped(ConnectionError::Transport(
                                "stream ended".into(),
                            ))
                        }
                    };
                    match self
                        .accept_frame(&bytes, &mut resequencer, &mut decode_failures)
                        .await
                    {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Terminated(reason)) => return LinkOutcome::Terminated(reason),
                        Ok(Flow::ConsumerGone) => return LinkOutcome::Closed,
                        Err(err) => return LinkOutcome::Dropped(err),
                    }
                }
                outbound = self.outbound.recv() => {
                    let Some(message) = outbound else {
                        return LinkOutcome::Closed;
                    };
                    match encode_client_frame(&message) {
                        Ok(bytes) => {
                            if let Err(err) = sink.send(bytes).await {
                                return LinkOutcome::Dropped(err.into());
                            }
                        }
                        Err(err) => warn!("connection: dropping unencodable outbound message: {err}"),
                    }
                }
                _ = wait_for_shutdown(&mut shutdown) => {
                    let _ = sink.close().await;
                    return LinkOutcome::Closed;
                }
            }
        }
    }

    async fn accept_frame(
        &self,
        bytes: &[u8],
        resequencer: &mut Resequencer,
        decode_failures: &mut u32,
    ) -> Result<Flow, ConnectionError> {
        let ready = match decode_host_frame(bytes) {
            Ok(envelope) => {
                *decode_failures = 0;
                resequencer.push(envelope.seq, Some(envelope))?
            }
            Err(ProtocolError::Decode { seq, reason }) => {
                *decode_failures += 1;
                warn!(
                    seq,
                    consecutive = *decode_failures,
                    "connection: dropping undecodable frame: {reason}"
                );
                if self
                    .inbound
                    .send(Inbound::DecodeFailed { seq, reason })
                    .await
                    .is_err()
                {
                    return Ok(Flow::ConsumerGone);
                }
                if *decode_failures >= self.max_consecutive_decode_errors {
                    return Err(ConnectionError::RepeatedDecodeFailures(*decode_failures));
                }
                match seq {
                    Some(seq) => resequencer.push(seq, None)?,
                    None => resequencer.skip_next(),
                }
            }
            Err(err) => return Err(err.into()),
        };

        for envelope in ready {
            if let HostBody::Message(HostMessage::SessionShutdown { reason }) = &envelope.body {
                return Ok(Flow::Terminated(reason.clone()));
            }
            if self.inbound.send(Inbound::Message(envelope)).await.is_err() {
                return Ok(Flow::ConsumerGone);
            }
        }
        Ok(Flow::Continue)
    }
}

/// Empties the outbound queue and returns how many messages were dropped.
fn discard_queued(outbound: &mut mpsc::UnboundedReceiver<ClientMessage>) -> usize {
    let mut discarded = 0;
    while outbound.try_recv().is_ok() {
        discarded += 1;
    }
    discarded
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            // Sender gone: nobody can request shutdown any more.
            futures::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
