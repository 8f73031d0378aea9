//! Shared prologue for the four call primitives: opening a stream, sending
//! request-initial metadata and framed request messages, and decoding a
//! responder's framed output back into typed values (spec §4.3 "Caller").

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::{self, StreamExt};

use crate::codec::Codec;
use crate::contract::BoxStream;
use crate::error::{ProtocolError, StatusError};
use crate::frame::{self, Parser};
use crate::metadata::Metadata;
use crate::status::Code;
use crate::transport::{MessageStream, StreamId, Transport, TransportMessageKind};

pub(crate) fn open_call(transport: &dyn Transport) -> Result<StreamId, StatusError> {
    Ok(transport.allocate_stream()?)
}

pub(crate) async fn send_request_initial(
    transport: &dyn Transport,
    stream_id: StreamId,
    service_name: &str,
    method_name: &str,
    authority: &str,
) -> Result<(), StatusError> {
    transport
        .send_metadata(stream_id, Metadata::request_initial(service_name, method_name, authority), false)
        .await?;
    Ok(())
}

pub(crate) async fn send_request_message<Req>(
    transport: &dyn Transport,
    stream_id: StreamId,
    codec: &impl Codec<Req>,
    request: &Req,
    end_of_stream: bool,
) -> Result<(), StatusError> {
    let payload = codec.serialize(request)?;
    let framed = frame::encode(&payload, false)?;
    transport.send_message(stream_id, framed, end_of_stream).await?;
    Ok(())
}

pub(crate) async fn finish_request(transport: &dyn Transport, stream_id: StreamId) -> Result<(), StatusError> {
    transport.finish_sending(stream_id).await?;
    Ok(())
}

/// Reads `messages_for_stream(stream_id)` until the trailer, expecting
/// exactly one response payload along the way (unary and client-streaming
/// calls, spec §1).
pub(crate) async fn read_single_response<Resp>(
    transport: Arc<dyn Transport>,
    stream_id: StreamId,
    codec: &impl Codec<Resp>,
) -> Result<Resp, StatusError> {
    let mut messages = transport.messages_for_stream(stream_id);
    let mut parser = Parser::new();
    let mut payload: Option<Bytes> = None;

    while let Some(event) = messages.next().await {
        match event.kind {
            TransportMessageKind::Metadata(metadata) => {
                if let Some(code) = metadata.grpc_status() {
                    transport.release_stream_id(stream_id);
                    if code != Code::Ok {
                        let message = metadata.grpc_message().unwrap_or_default().to_string();
                        return Err(StatusError::new(code, message));
                    }
                    return match payload {
                        Some(bytes) => Ok(codec.deserialize(&bytes)?),
                        None => Err(StatusError::new(Code::Internal, "response completed with no message")),
                    };
                }
                // response-initial metadata; keep reading for the payload.
            }
            TransportMessageKind::Data(bytes) => {
                for frame in parser.feed(&bytes) {
                    if payload.is_some() {
                        transport.release_stream_id(stream_id);
                        return Err(ProtocolError::MultiplePayloadsForUnary { stream_id }.into());
                    }
                    payload = Some(frame.payload);
                }
            }
        }
    }

    Err(StatusError::new(Code::Unavailable, "transport ended before a trailer"))
}

struct ResponseStreamState<Resp> {
    transport: Arc<dyn Transport>,
    stream_id: StreamId,
    messages: MessageStream,
    parser: Parser,
    codec: Arc<dyn Codec<Resp> + Send + Sync>,
    pending: VecDeque<Bytes>,
    done: bool,
}

impl<Resp> Drop for ResponseStreamState<Resp> {
    /// A server-stream or bidi caller dropping the response sequence before
    /// the trailer is a cancellation (spec §4.3 "Server-stream caller" #2):
    /// send `trailer(CANCELLED)` with `endOfStream=true` and release the
    /// stream id. `done` is only ever set once the trailer (or a transport
    /// failure standing in for one) has already been observed, so this is a
    /// no-op on the ordinary completion path.
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let transport = Arc::clone(&self.transport);
        let stream_id = self.stream_id;
        tokio::spawn(async move {
            let trailer = Metadata::trailer(Code::Cancelled, None);
            let _ = transport.send_metadata(stream_id, trailer, true).await;
            transport.release_stream_id(stream_id);
        });
    }
}

/// Builds a lazily-decoded stream of `Resp` from a stream's raw events,
/// ending the stream at `Ok` and yielding exactly one `Err` item for any
/// other terminal status (server-streaming and bidirectional calls).
pub(crate) fn decode_response_stream<Resp>(
    transport: Arc<dyn Transport>,
    stream_id: StreamId,
    codec: Arc<dyn Codec<Resp> + Send + Sync>,
) -> BoxStream<Result<Resp, StatusError>>
where
    Resp: Send + 'static,
{
    let state = ResponseStreamState {
        messages: transport.messages_for_stream(stream_id),
        transport,
        stream_id,
        parser: Parser::new(),
        codec,
        pending: VecDeque::new(),
        done: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }
        loop {
            if let Some(payload) = state.pending.pop_front() {
                let item = state.codec.deserialize(&payload).map_err(StatusError::from);
                return Some((item, state));
            }

            match state.messages.next().await {
                None => {
                    state.done = true;
                    return Some((
                        Err(StatusError::new(Code::Unavailable, "transport ended before a trailer")),
                        state,
                    ));
                }
                Some(event) => match event.kind {
                    TransportMessageKind::Metadata(metadata) => {
                        if let Some(code) = metadata.grpc_status() {
                            state.done = true;
                            state.transport.release_stream_id(state.stream_id);
                            if code == Code::Ok {
                                return None;
                            }
                            let message = metadata.grpc_message().unwrap_or_default().to_string();
                            return Some((Err(StatusError::new(code, message)), state));
                        }
                    }
                    TransportMessageKind::Data(bytes) => {
                        for frame in state.parser.feed(&bytes) {
                            state.pending.push_back(frame.payload);
                        }
                    }
                },
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::StringCodec;
    use crate::memory_transport::{memory_transport_pair, FlowControlConfig};
    use crate::transport::Transport;
    use std::time::Duration;

    #[tokio::test]
    async fn extra_payload_on_a_single_response_call_is_a_protocol_error() {
        let (caller, responder) = memory_transport_pair(FlowControlConfig::default());
        let caller: Arc<dyn Transport> = Arc::new(caller);
        let stream_id = caller.allocate_stream().unwrap();

        responder
            .send_metadata(stream_id, Metadata::request_initial("Echo", "Say", "test"), false)
            .await
            .unwrap();
        responder.send_message(stream_id, frame::encode(b"first", false).unwrap(), false).await.unwrap();
        responder.send_message(stream_id, frame::encode(b"second", false).unwrap(), true).await.unwrap();

        let err = read_single_response::<String>(caller, stream_id, &StringCodec).await.unwrap_err();
        assert_eq!(err.code(), Code::Internal);
    }

    #[tokio::test]
    async fn dropping_a_response_stream_early_sends_a_cancelled_trailer() {
        let (caller, responder) = memory_transport_pair(FlowControlConfig::default());
        let caller: Arc<dyn Transport> = Arc::new(caller);
        let stream_id = caller.allocate_stream().unwrap();

        responder
            .send_metadata(stream_id, Metadata::request_initial("Count", "Up", "test"), false)
            .await
            .unwrap();
        responder.send_message(stream_id, frame::encode(b"1", false).unwrap(), false).await.unwrap();

        let mut on_responder = responder.messages_for_stream(stream_id);

        {
            let mut responses = decode_response_stream::<String>(caller, stream_id, Arc::new(StringCodec));
            let _ = responses.next().await;
        } // dropped before a trailer arrived

        let mut saw_cancelled = false;
        while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(200), on_responder.next()).await {
            if let TransportMessageKind::Metadata(metadata) = &event.kind {
                if metadata.grpc_status() == Some(Code::Cancelled) {
                    saw_cancelled = true;
                }
            }
            if event.end_of_stream {
                break;
            }
        }
        assert!(saw_cancelled, "expected a CANCELLED trailer after an early drop");
    }
}
