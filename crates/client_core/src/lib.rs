//! Client-side session engine: keeps a live view synchronized with a remote
//! script host over a single framed connection.

pub mod config;
pub mod connection;
pub mod error;
pub mod message_cache;
pub mod session;
pub mod transport;
pub mod widget_state;

pub use config::{load_config, load_config_from, ClientConfig};
pub use connection::{
    Connection, ConnectionHandle, ConnectionState, Inbound, RetryPolicy, SessionInfo,
    StateMachine,
};
pub use error::{CacheError, ConnectionError, Diagnostic, TransportError, WidgetStateError};
pub use message_cache::{
    CachedMessage, HttpMessageFetcher, Lookup, MessageCache, MessageFetcher,
    MissingMessageFetcher, ResolvedMessage,
};
pub use session::{Session, SessionEvent};
pub use transport::{Connector, FrameSink, FrameStream, WebSocketConnector};
pub use widget_state::{
    Delivery, FormClearedSubscription, Outbox, ValueSource, WidgetRecord, WidgetStateStore,
};

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
