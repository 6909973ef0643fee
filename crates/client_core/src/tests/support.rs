//! In-memory host and outbox doubles shared by the unit tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{channel::mpsc as frame_mpsc, SinkExt, StreamExt};
use shared::{
    domain::{MessageHash, SessionId},
    protocol::{
        decode_client_frame, encode_host_frame, ClientMessage, HostEnvelope, HostMessage,
    },
};
use tokio::sync::{broadcast, mpsc};

use crate::{
    config::ClientConfig,
    connection::ConnectionState,
    error::{ConnectionError, TransportError},
    message_cache::MessageFetcher,
    transport::{Connector, FrameSink, FrameStream},
    widget_state::Outbox,
};

pub(crate) const STEP: Duration = Duration::from_secs(2);

pub(crate) fn fast_config() -> ClientConfig {
    ClientConfig {
        retry_initial_delay_ms: 10,
        retry_max_delay_ms: 40,
        max_retries: 3,
        connect_timeout_ms: 300,
        fetch_timeout_ms: 300,
        inbound_queue_capacity: 16,
        event_queue_capacity: 256,
        ..ClientConfig::default()
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Plan {
    Refuse,
    Accept,
    Hang,
}

/// Connector whose attempts follow a script of plans. Once the script runs
/// out every further attempt is refused.
pub(crate) struct MemoryConnector {
    plans: Mutex<VecDeque<Plan>>,
    links: mpsc::UnboundedSender<HostLink>,
    attempts: AtomicUsize,
}

impl MemoryConnector {
    pub(crate) fn new(plans: impl IntoIterator<Item = Plan>) -> (Arc<Self>, mpsc::UnboundedReceiver<HostLink>) {
        let (links, links_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            plans: Mutex::new(plans.into_iter().collect()),
            links,
            attempts: AtomicUsize::new(0),
        });
        (connector, links_rx)
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<(FrameSink, FrameStream), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let plan = self
            .plans
            .lock()
            .expect("plans lock")
            .pop_front()
            .unwrap_or(Plan::Refuse);

        match plan {
            Plan::Refuse => Err(TransportError::Other("connection refused".into())),
            Plan::Hang => futures::future::pending().await,
            Plan::Accept => {
                let (to_client, client_rx) = frame_mpsc::unbounded();
                let (client_tx, from_client) = frame_mpsc::unbounded();
                let _ = self.links.send(HostLink {
                    to_client,
                    from_client,
                });
                let sink: FrameSink = Box::pin(client_tx.sink_map_err(|_| TransportError::Closed));
                let stream: FrameStream = Box::pin(client_rx);
                Ok((sink, stream))
            }
        }
    }
}

/// Host end of one accepted in-memory connection. Dropping it ends the
/// client's frame stream.
pub(crate) struct HostLink {
    to_client: frame_mpsc::UnboundedSender<Result<Vec<u8>, TransportError>>,
    from_client: frame_mpsc::UnboundedReceiver<Vec<u8>>,
}

impl HostLink {
    pub(crate) fn send(&self, envelope: &HostEnvelope) {
        let frame = encode_host_frame(envelope).expect("encode host frame");
        self.send_raw(frame);
    }

    pub(crate) fn send_message(&self, seq: u64, message: HostMessage) {
        self.send(&HostEnvelope::message(seq, message));
    }

    pub(crate) fn send_raw(&self, frame: impl Into<Vec<u8>>) {
        let _ = self.to_client.unbounded_send(Ok(frame.into()));
    }

    pub(crate) async fn recv(&mut self) -> ClientMessage {
        let frame = tokio::time::timeout(STEP, self.from_client.next())
            .await
            .expect("client frame in time")
            .expect("client link open");
        decode_client_frame(&frame).expect("decode client frame")
    }

    pub(crate) async fn expect_silence(&mut self, window: Duration) {
        if let Ok(Some(frame)) = tokio::time::timeout(window, self.from_client.next()).await {
            panic!(
                "unexpected client frame: {:?}",
                decode_client_frame(&frame)
            );
        }
    }

    /// Reads the client's hello and answers with `session_ready` at seq 0.
    /// Returns the session id the client asked to resume.
    pub(crate) async fn accept(&mut self, session_id: &str) -> Option<SessionId> {
        self.accept_with(session_id, false, None).await
    }

    pub(crate) async fn accept_with(
        &mut self,
        session_id: &str,
        widget_states_invalid: bool,
        max_cached_message_age: Option<u32>,
    ) -> Option<SessionId> {
        let resume_session_id = match self.recv().await {
            ClientMessage::Hello { resume_session_id } => resume_session_id,
            other => panic!("expected hello, got {other:?}"),
        };
        self.send_message(
            0,
            HostMessage::SessionReady {
                session_id: SessionId::from(session_id),
                widget_states_invalid,
                max_cached_message_age,
            },
        );
        resume_session_id
    }
}

pub(crate) async fn next_link(links: &mut mpsc::UnboundedReceiver<HostLink>) -> HostLink {
    tokio::time::timeout(STEP, links.recv())
        .await
        .expect("connection attempt in time")
        .expect("connector alive")
}

/// Drains state events until `target` is seen and returns everything observed.
pub(crate) async fn states_until(
    states: &mut broadcast::Receiver<ConnectionState>,
    target: ConnectionState,
) -> Vec<ConnectionState> {
    let mut seen = Vec::new();
    loop {
        let state = tokio::time::timeout(STEP, states.recv())
            .await
            .expect("state change in time")
            .expect("state channel open");
        seen.push(state);
        if state == target {
            return seen;
        }
    }
}

/// Outbox that records what it is handed and can be switched to refuse.
#[derive(Default)]
pub(crate) struct RecordingOutbox {
    sent: Mutex<Vec<ClientMessage>>,
    offline: AtomicBool,
}

impl RecordingOutbox {
    pub(crate) fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub(crate) fn sent(&self) -> Vec<ClientMessage> {
        self.sent.lock().expect("sent lock").clone()
    }

    pub(crate) fn take(&self) -> Vec<ClientMessage> {
        std::mem::take(&mut *self.sent.lock().expect("sent lock"))
    }
}

impl Outbox for RecordingOutbox {
    fn deliver(&self, message: ClientMessage) -> Result<(), ConnectionError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ConnectionError::NotConnected(
                ConnectionState::DisconnectedRecoverable,
            ));
        }
        self.sent.lock().expect("sent lock").push(message);
        Ok(())
    }
}

/// Fetcher answering from a fixed map of payloads and counting requests.
#[derive(Default)]
pub(crate) struct MapFetcher {
    payloads: Mutex<HashMap<MessageHash, HostMessage>>,
    calls: AtomicUsize,
}

impl MapFetcher {
    pub(crate) fn with(hash: MessageHash, payload: HostMessage) -> Self {
        let fetcher = Self::default();
        fetcher
            .payloads
            .lock()
            .expect("payloads lock")
            .insert(hash, payload);
        fetcher
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageFetcher for MapFetcher {
    async fn fetch_by_hash(&self, hash: &MessageHash) -> anyhow::Result<HostMessage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.payloads
            .lock()
            .expect("payloads lock")
            .get(hash)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("host no longer has {hash}"))
    }
}
