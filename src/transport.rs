//! The multiplexing boundary (spec §4.2 "Transport contract"): turns a byte
//! pipe into many ordered, independently terminable logical streams.
//!
//! This mirrors the shape of `hotaru_core::connection::protocol::{Transport,
//! Stream, Message}` — small, id-bearing traits the rest of the crate is
//! generic over — generalized from "one connection, HTTP/2-shaped streams"
//! to "any framed byte pipe, caller-defined stream ids".

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures_core::Stream;

use crate::error::TransportError;
use crate::metadata::Metadata;

/// Identifies one logical call on a transport. Odd ids are allocated by the
/// initiating side, even ids by the accepting side (spec §3 "Stream");
/// nothing requires this particular partition beyond the two peers agreeing
/// on it, but it is what [`Side`] encodes.
pub type StreamId = u64;

/// Which half of the id space a transport endpoint allocates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Allocates odd stream ids (1, 3, 5, ...).
    Initiator,
    /// Allocates even stream ids (2, 4, 6, ...).
    Acceptor,
}

impl Side {
    pub(crate) fn first_id(self) -> StreamId {
        match self {
            Side::Initiator => 1,
            Side::Acceptor => 2,
        }
    }
}

/// The payload carried by one [`TransportMessage`].
#[derive(Debug, Clone)]
pub enum TransportMessageKind {
    /// A metadata event: request-initial, response-initial, or a trailer
    /// (identified by the presence of `grpc-status`, see
    /// [`Metadata::is_trailer`]).
    Metadata(Metadata),
    /// A raw, possibly-partial chunk of framed application bytes. The
    /// receiver feeds this through its own [`crate::frame::Parser`] to
    /// recover whole messages.
    Data(Bytes),
}

/// One tagged event flowing on a transport's receive side (spec §3
/// "TransportMessage").
#[derive(Debug, Clone)]
pub struct TransportMessage {
    pub stream_id: StreamId,
    pub kind: TransportMessageKind,
    pub end_of_stream: bool,
    /// Cached `:path` of the stream's initial metadata, set once that
    /// metadata event has been observed — a responder convenience so data
    /// events don't need to carry it.
    pub method_path: Option<String>,
}

impl TransportMessage {
    pub fn metadata(&self) -> Option<&Metadata> {
        match &self.kind {
            TransportMessageKind::Metadata(metadata) => Some(metadata),
            TransportMessageKind::Data(_) => None,
        }
    }

    pub fn data(&self) -> Option<&Bytes> {
        match &self.kind {
            TransportMessageKind::Data(payload) => Some(payload),
            TransportMessageKind::Metadata(_) => None,
        }
    }
}

/// A boxed stream of [`TransportMessage`], returned by
/// [`Transport::incoming`] and [`Transport::messages_for_stream`].
pub struct MessageStream {
    inner: Pin<Box<dyn Stream<Item = TransportMessage> + Send>>,
}

impl MessageStream {
    pub fn new(inner: impl Stream<Item = TransportMessage> + Send + 'static) -> Self {
        Self { inner: Box::pin(inner) }
    }
}

impl Stream for MessageStream {
    type Item = TransportMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// The abstract multiplexing boundary every concrete transport (in-memory,
/// WebSocket, HTTP/2, an OS message port, ...) must satisfy.
///
/// Send-path operations take `&self`: implementations serialize concurrent
/// senders internally (spec §5 "the transport's send path as a serial
/// shared resource"), so callers never need `&mut`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Returns a currently-unused id from this side's partition.
    fn allocate_stream(&self) -> Result<StreamId, TransportError>;

    /// Delivers a metadata event. No further send is legal on this stream
    /// from this side once `end_of_stream` is `true`.
    async fn send_metadata(
        &self,
        stream_id: StreamId,
        metadata: Metadata,
        end_of_stream: bool,
    ) -> Result<(), TransportError>;

    /// Delivers a (pre-framed) payload event.
    async fn send_message(
        &self,
        stream_id: StreamId,
        payload: Bytes,
        end_of_stream: bool,
    ) -> Result<(), TransportError>;

    /// Sends an empty data event with `end_of_stream=true`. Idempotent.
    async fn finish_sending(&self, stream_id: StreamId) -> Result<(), TransportError>;

    /// Every [`TransportMessage`] across every stream, in the order this
    /// transport observed them. A responder's dispatch loop is the typical
    /// sole consumer.
    fn incoming(&self) -> MessageStream;

    /// A view filtered to just `stream_id` — the typical way a caller call
    /// primitive consumes its own call.
    fn messages_for_stream(&self, stream_id: StreamId) -> MessageStream;

    /// Marks `stream_id` free for reuse. Called automatically once both
    /// sides have observed EOS on it; exposed so a caller can release early
    /// after a local cancellation is acknowledged.
    fn release_stream_id(&self, stream_id: StreamId);

    /// Closes both directions, completes `incoming()`, and fails every
    /// in-flight call with `UNAVAILABLE`.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}
