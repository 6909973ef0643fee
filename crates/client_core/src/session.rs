//! Session controller: one owned context per host session that wires the
//! connection, the message cache and the widget store together.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use shared::{
    domain::{FormId, WidgetId},
    protocol::{ClientMessage, HostEnvelope, HostMessage, ScriptFinishStatus},
    widget::WidgetValue,
};
use tokio::{
    sync::{broadcast, broadcast::error::RecvError, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    config::ClientConfig,
    connection::{Connection, ConnectionHandle, ConnectionState, Inbound, SessionInfo},
    error::{Diagnostic, WidgetStateError},
    message_cache::{
        HttpMessageFetcher, MessageCache, MessageFetcher, MissingMessageFetcher, ResolvedMessage,
    },
    transport::{Connector, WebSocketConnector},
    widget_state::{Delivery, FormClearedSubscription, ValueSource, WidgetStateStore},
};

#[derive(Debug, Clone)]
pub enum SessionEvent {
    ConnectionChanged(ConnectionState),
    SessionStarted(SessionInfo),
    /// De-referenced host message, in host order.
    Message(ResolvedMessage),
    ScriptFinished {
        status: ScriptFinishStatus,
        generation: u64,
    },
    Diagnostic(Diagnostic),
    /// The connection delivered its last item; no further events follow.
    Ended,
}

pub struct Session {
    connection: ConnectionHandle,
    widgets: Arc<Mutex<WidgetStateStore>>,
    events: broadcast::Sender<SessionEvent>,
    driver: JoinHandle<()>,
    controller: JoinHandle<()>,
}

impl Session {
    /// Connects to the host named by `config` over WebSocket, fetching evicted
    /// messages over HTTP.
    pub fn connect(config: &ClientConfig) -> Result<Self> {
        let connector = Arc::new(WebSocketConnector::new(config.stream_url()?));
        let fetcher = Arc::new(HttpMessageFetcher::new(config.message_url()?));
        info!(host = %config.host_url, "session: connecting");
        Ok(Self::start(connector, fetcher, config))
    }

    pub fn start(
        connector: Arc<dyn Connector>,
        fetcher: Arc<dyn MessageFetcher>,
        config: &ClientConfig,
    ) -> Self {
        Self::with_connection(Connection::start(connector, config), fetcher, config)
    }

    /// Replays a recorded session with no live host.
    pub fn replay(envelopes: Vec<HostEnvelope>, config: &ClientConfig) -> Self {
        Self::with_connection(
            Connection::replay(envelopes, config),
            Arc::new(MissingMessageFetcher),
            config,
        )
    }

    fn with_connection(
        connection: Connection,
        fetcher: Arc<dyn MessageFetcher>,
        config: &ClientConfig,
    ) -> Self {
        let Connection {
            handle,
            inbound,
            states,
            task: driver,
        } = connection;
        let (events, _) = broadcast::channel(config.event_queue_capacity.max(1));
        let widgets = Arc::new(Mutex::new(WidgetStateStore::new(Arc::new(handle.clone()))));

        let controller = Controller {
            connection: handle.clone(),
            cache: MessageCache::new(),
            fetcher,
            widgets: Arc::clone(&widgets),
            events: events.clone(),
            fetch_timeout: config.fetch_timeout(),
            max_cached_message_age: config.max_cached_message_age,
        };
        let controller = tokio::spawn(controller.run(inbound, states));

        Self {
            connection: handle,
            widgets,
            events,
            driver,
            controller,
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn subscribe_connection(&self) -> broadcast::Receiver<ConnectionState> {
        self.connection.subscribe_state()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn get_value(&self, widget_id: &WidgetId) -> Option<WidgetValue> {
        lock_store(&self.widgets).get_value(widget_id).cloned()
    }

    pub fn is_dirty(&self, widget_id: &WidgetId) -> bool {
        lock_store(&self.widgets).is_dirty(widget_id)
    }

    /// Read access to the whole store for rendering passes.
    pub fn with_widgets<R>(&self, read: impl FnOnce(&WidgetStateStore) -> R) -> R {
        read(&lock_store(&self.widgets))
    }

    pub fn set_value(
        &self,
        widget_id: &WidgetId,
        value: WidgetValue,
        source: ValueSource,
        form_id: Option<&FormId>,
    ) -> Result<Delivery, WidgetStateError> {
        let result = lock_store(&self.widgets).set_value(widget_id, value, source, form_id);
        match &result {
            Ok(Delivery::Deferred) => self.emit(SessionEvent::Diagnostic(Diagnostic::SendFailed {
                reason: format!("change to widget {widget_id} is waiting for the connection"),
            })),
            Ok(_) => {}
            Err(err) => self.emit(SessionEvent::Diagnostic(err.into())),
        }
        result
    }

    pub fn submit_form(&self, form_id: &FormId) -> Result<usize, WidgetStateError> {
        let result = lock_store(&self.widgets).submit_form(form_id);
        if let Err(err) = &result {
            self.emit(SessionEvent::Diagnostic(err.into()));
        }
        result
    }

    pub fn add_form_cleared_listener(
        &self,
        form_id: &FormId,
        owner: impl Into<String>,
        callback: impl FnMut(&FormId) + Send + 'static,
    ) -> FormClearedSubscription {
        lock_store(&self.widgets).add_form_cleared_listener(form_id, owner, callback)
    }

    pub fn remove_form_cleared_listener(&self, subscription: &FormClearedSubscription) -> bool {
        lock_store(&self.widgets).remove_form_cleared_listener(subscription)
    }

    /// Closes the connection and waits for the driver and controller to stop.
    pub async fn shutdown(self) {
        self.connection.close();
        if let Err(err) = self.driver.await {
            warn!("session: connection driver ended abnormally: {err}");
        }
        if let Err(err) = self.controller.await {
            warn!("session: controller ended abnormally: {err}");
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

fn lock_store(widgets: &Mutex<WidgetStateStore>) -> MutexGuard<'_, WidgetStateStore> {
    widgets.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Controller {
    connection: ConnectionHandle,
    cache: MessageCache,
    fetcher: Arc<dyn MessageFetcher>,
    widgets: Arc<Mutex<WidgetStateStore>>,
    events: broadcast::Sender<SessionEvent>,
    fetch_timeout: std::time::Duration,
    max_cached_message_age: u32,
}

impl Controller {
    async fn run(
        mut self,
        mut inbound: mpsc::Receiver<Inbound>,
        mut states: broadcast::Receiver<ConnectionState>,
    ) {
        let mut states_open = true;
        loop {
            tokio::select! {
                // State changes first, so consumers see `Connected` before the
                // session it carries and the final state before shutdown.
                biased;
                state = states.recv(), if states_open => match state {
                    Ok(state) => self.emit(SessionEvent::ConnectionChanged(state)),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "session: connection state events lagged");
                    }
                    Err(RecvError::Closed) => states_open = false,
                },
                item = inbound.recv() => match item {
                    Some(item) => self.handle_inbound(item).await,
                    None => break,
                },
            }
        }
        debug!("session: inbound stream ended");
        self.emit(SessionEvent::Ended);
    }

    async fn handle_inbound(&mut self, item: Inbound) {
        match item {
            Inbound::SessionStarted(info) => self.on_session_started(info),
            Inbound::DecodeFailed { reason, .. } => {
                self.emit(SessionEvent::Diagnostic(Diagnostic::DecodeFailed { reason }));
            }
            Inbound::Message(envelope) => {
                match self
                    .cache
                    .process(envelope, self.fetcher.as_ref(), self.fetch_timeout)
                    .await
                {
                    Ok(resolved) => self.on_message(resolved),
                    Err(err) => {
                        warn!("session: dropping unresolved message: {err}");
                        self.emit(SessionEvent::Diagnostic((&err).into()));
                    }
                }
            }
        }
    }

    fn on_session_started(&mut self, info: SessionInfo) {
        if let Some(max_age) = info.max_cached_message_age {
            self.max_cached_message_age = max_age;
        }
        if info.is_new_session {
            self.cache.reset_generation();
        }

        let hashes = self.cache.hashes();
        if !hashes.is_empty() {
            if let Err(err) = self
                .connection
                .send(ClientMessage::CachedHashes { hashes })
            {
                warn!("session: could not report cached hashes: {err}");
            }
        }

        {
            let mut widgets = lock_store(&self.widgets);
            if info.is_new_session {
                widgets.begin_session();
            }
            if info.widget_states_invalid {
                widgets.resync_from_defaults();
            } else {
                widgets.flush_dirty();
            }
        }

        self.emit(SessionEvent::SessionStarted(info));
    }

    fn on_message(&mut self, resolved: ResolvedMessage) {
        let mut follow_up = Vec::new();
        {
            let mut widgets = lock_store(&self.widgets);
            match &resolved.message {
                HostMessage::ScriptStarted { .. } => widgets.begin_script_run(),
                HostMessage::WidgetDeclared(declaration) => {
                    if let Err(err) = widgets.declare_widget(declaration.clone()) {
                        warn!("session: rejected widget declaration: {err}");
                        follow_up.push(SessionEvent::Diagnostic((&err).into()));
                    }
                }
                HostMessage::FormDeclared {
                    form_id,
                    clear_on_submit,
                    has_submit_button,
                } => widgets.declare_form(form_id, *clear_on_submit, *has_submit_button),
                HostMessage::ScriptFinished { status } => {
                    if status.is_completed() {
                        self.cache.advance_generation(self.max_cached_message_age);
                    }
                    follow_up.extend(
                        widgets
                            .end_script_run(*status)
                            .into_iter()
                            .map(SessionEvent::Diagnostic),
                    );
                    follow_up.push(SessionEvent::ScriptFinished {
                        status: *status,
                        generation: self.cache.generation(),
                    });
                }
                HostMessage::SessionReady { .. } => {
                    debug!("session: ignoring session_ready outside the handshake");
                }
                HostMessage::Render { .. } | HostMessage::SessionShutdown { .. } => {}
            }
        }

        self.emit(SessionEvent::Message(resolved));
        for event in follow_up {
            self.emit(event);
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
