//! Transport seam: anything that can carry binary frames both ways.
//!
//! Axum WebSockets adapt through [`Transport::from_websocket`]; tests and custom
//! embeddings can build one from any `Sink`/`Stream` pair with [`Transport::new`].

use std::borrow::Cow;
use std::pin::Pin;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    pub code: u16,
    pub reason: Cow<'static, str>,
}

impl CloseEvent {
    pub const NORMAL: Self = Self::from_static(1000, "provider_initiated");
    pub const RESET_CONNECTION: Self = Self::from_static(4205, "Reset Connection");
    pub const UNAUTHORIZED: Self = Self::from_static(4401, "Unauthorized");
    pub const FORBIDDEN: Self = Self::from_static(4403, "Forbidden");
    pub const CONNECTION_TIMEOUT: Self = Self::from_static(4408, "Connection Timeout");

    pub const fn from_static(code: u16, reason: &'static str) -> Self {
        Self { code, reason: Cow::Borrowed(reason) }
    }

    pub fn new(code: u16, reason: impl Into<Cow<'static, str>>) -> Self {
        Self { code, reason: reason.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<CloseEvent>),
}

#[derive(Debug, thiserror::Error)]
#[error("transport error: {0}")]
pub struct TransportError(String);

impl TransportError {
    pub fn new(err: impl std::fmt::Display) -> Self {
        Self(err.to_string())
    }
}

impl From<axum::Error> for TransportError {
    fn from(err: axum::Error) -> Self {
        Self::new(err)
    }
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TransportError>> + Send>>;

pub struct Transport {
    sink: FrameSink,
    stream: FrameStream,
}

impl Transport {
    pub fn new<Si, St>(sink: Si, stream: St) -> Self
    where
        Si: Sink<Frame, Error = TransportError> + Send + 'static,
        St: Stream<Item = Result<Frame, TransportError>> + Send + 'static,
    {
        Self { sink: Box::pin(sink), stream: Box::pin(stream) }
    }

    pub fn from_websocket(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        let sink = sink.with(|frame: Frame| async move { Ok::<_, axum::Error>(to_ws(frame)) }).sink_map_err(TransportError::from);
        let stream = stream.filter_map(|message| async move {
            match message {
                Ok(WsMessage::Binary(data)) => Some(Ok(Frame::Binary(data))),
                Ok(WsMessage::Ping(data)) => Some(Ok(Frame::Ping(data))),
                Ok(WsMessage::Pong(data)) => Some(Ok(Frame::Pong(data))),
                Ok(WsMessage::Close(frame)) => Some(Ok(Frame::Close(frame.map(|f| CloseEvent::new(f.code, f.reason.as_str().to_owned()))))),
                Ok(WsMessage::Text(_)) => {
                    debug!("ignoring text frame");
                    None
                }
                Err(e) => Some(Err(TransportError::from(e))),
            }
        });
        Self::new(sink, stream)
    }

    pub(crate) fn into_parts(self) -> (FrameSink, FrameStream) {
        (self.sink, self.stream)
    }
}

fn to_ws(frame: Frame) -> WsMessage {
    match frame {
        Frame::Binary(data) => WsMessage::Binary(data),
        Frame::Ping(data) => WsMessage::Ping(data),
        Frame::Pong(data) => WsMessage::Pong(data),
        Frame::Close(event) => WsMessage::Close(event.map(|e| CloseFrame { code: e.code, reason: e.reason.into_owned().into() })),
    }
}

/// Ordered, non-blocking send side of a transport.
///
/// Frames are drained by a writer task; each is flushed before the next is sent,
/// and a close frame ends the writer.
#[derive(Debug, Clone)]
pub(crate) struct Outbox(mpsc::UnboundedSender<Frame>);

impl Outbox {
    pub(crate) fn spawn(mut sink: FrameSink) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let last = matches!(frame, Frame::Close(_));
                if let Err(e) = sink.send(frame).await {
                    debug!("transport write failed: {e}");
                    break;
                }
                if last {
                    break;
                }
            }
            let _ = sink.close().await;
        });
        Self(tx)
    }

    /// Returns false when the transport is already gone.
    pub(crate) fn send(&self, data: Bytes) -> bool {
        self.0.send(Frame::Binary(data)).is_ok()
    }

    pub(crate) fn ping(&self) -> bool {
        self.0.send(Frame::Ping(Bytes::new())).is_ok()
    }

    pub(crate) fn pong(&self, data: Bytes) -> bool {
        self.0.send(Frame::Pong(data)).is_ok()
    }

    pub(crate) fn close(&self, event: Option<CloseEvent>) {
        let _ = self.0.send(Frame::Close(event));
    }

    #[cfg(test)]
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }
}
