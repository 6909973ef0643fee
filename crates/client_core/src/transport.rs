//! Framed binary transport between the client and the host.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;
use url::Url;

use crate::error::TransportError;

pub type FrameSink = Pin<Box<dyn Sink<Vec<u8>, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, TransportError>> + Send>>;

/// Opens one physical connection to the host. Each call is an independent
/// attempt; the caller owns retry policy.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<(FrameSink, FrameStream), TransportError>;
}

pub struct WebSocketConnector {
    url: Url,
}

impl WebSocketConnector {
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<(FrameSink, FrameStream), TransportError> {
        let (ws_stream, _) = connect_async(self.url.as_str()).await?;
        debug!(url = %self.url, "transport: websocket opened");
        let (ws_writer, ws_reader) = ws_stream.split();

        let sink = ws_writer.with(|bytes: Vec<u8>| {
            future::ready(Ok::<_, TransportError>(Message::Binary(bytes)))
        });
        let stream = ws_reader.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Binary(bytes)) => Some(Ok(bytes)),
                Ok(Message::Text(text)) => Some(Ok(text.into_bytes())),
                Ok(Message::Close(_)) => Some(Err(TransportError::Closed)),
                Ok(_) => None,
                Err(err) => Some(Err(TransportError::from(err))),
            })
        });

        let sink: FrameSink = Box::pin(sink);
        let stream: FrameStream = Box::pin(stream);
        Ok((sink, stream))
    }
}
