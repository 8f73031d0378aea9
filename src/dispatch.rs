//! The responder dispatch engine (spec §4.5 "Responder"): demultiplexes a
//! transport's `incoming()` events by stream id, resolves each stream's
//! method against a [`Registry`], and drives the matching [`Handler`] to
//! completion.
//!
//! Structurally this plays the role `GrpcContext::from_hyper_context` plus
//! `GrpcService::handle_request` play in the teacher: parse one request into
//! a typed context, find the matching service, invoke it. The difference is
//! that a stream's lifetime here is independent of any single transport
//! read, so each stream gets its own small state machine instead of one
//! request/response pair per function call.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use crate::contract::{BoxStream, Contract, Handler, MethodRegistration};
use crate::error::{RegistrationError, StatusError};
use crate::frame::{self, Parser};
use crate::metadata::Metadata;
use crate::status::Code;
use crate::transport::{StreamId, Transport, TransportMessageKind};

/// The merged, immutable method table a responder dispatches against.
///
/// Built once from one or more [`Contract`]s before `serve` starts; there is
/// deliberately no way to add a contract to an `Arc<Registry>` already
/// handed to `serve` (spec §4.4: "setup() hook invoked exactly once").
#[derive(Debug, Default)]
pub struct Registry {
    methods: HashMap<String, MethodRegistration>,
}

impl Registry {
    pub fn new() -> Self {
        Self { methods: HashMap::new() }
    }

    /// Folds one contract's methods in, recursing into its subcontracts
    /// first (spec §4.4 "register(contract) recursively registers
    /// subcontracts first, then the parent's own methods"). Fails if a key
    /// collides with one already present, whether from an earlier contract,
    /// a sibling subcontract, or the same one.
    pub fn add_contract(&mut self, contract: Contract) -> Result<(), RegistrationError> {
        let (methods, subcontracts) = contract.into_parts();
        for subcontract in subcontracts {
            self.add_contract(subcontract)?;
        }
        for method in methods {
            let key = method.key();
            if self.methods.contains_key(&key) {
                return Err(RegistrationError::DuplicateMethod { key });
            }
            self.methods.insert(key, method);
        }
        Ok(())
    }

    pub fn lookup(&self, service: &str, method: &str) -> Option<&MethodRegistration> {
        self.methods.get(&format!("{service}/{method}"))
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

enum KindState {
    /// Unary or server-streaming: exactly one request payload is expected;
    /// the handler only runs once end-of-stream confirms no more are
    /// coming.
    SingleRequest { handler: Handler, payload: Option<Bytes> },
    /// Client-streaming or bidirectional: the handler task is already
    /// running (spawned when the initial metadata resolved), consuming
    /// decoded frames pushed through `inbound_tx`.
    Streaming { inbound_tx: mpsc::UnboundedSender<Bytes> },
}

struct StreamState {
    parser: Parser,
    kind_state: KindState,
}

/// Runs the responder loop until `transport.incoming()` ends (the transport
/// closed). Meant to be spawned as its own task.
pub async fn serve(transport: Arc<dyn Transport>, registry: Arc<Registry>) {
    let mut incoming = transport.incoming();
    let mut streams: HashMap<StreamId, StreamState> = HashMap::new();

    while let Some(message) = incoming.next().await {
        let stream_id = message.stream_id;
        let end_of_stream = message.end_of_stream;

        match message.kind {
            TransportMessageKind::Metadata(metadata) if !streams.contains_key(&stream_id) => {
                if metadata.is_trailer() {
                    // A trailer with no preceding request-initial: nothing to
                    // dispatch, and not this side's place to originate one.
                    continue;
                }
                start_stream(&transport, &registry, &mut streams, stream_id, metadata).await;
            }
            TransportMessageKind::Metadata(_) => {
                // Already resolved; a responder has no use for further
                // metadata events on the same stream.
            }
            TransportMessageKind::Data(chunk) => {
                on_data(&transport, &mut streams, stream_id, &chunk).await;
            }
        }

        if end_of_stream {
            on_end_of_stream(&transport, &mut streams, stream_id).await;
        }
    }
}

async fn start_stream(
    transport: &Arc<dyn Transport>,
    registry: &Arc<Registry>,
    streams: &mut HashMap<StreamId, StreamState>,
    stream_id: StreamId,
    metadata: Metadata,
) {
    let path = match metadata.get(crate::metadata::header::PATH) {
        Some(path) => path,
        None => {
            warn!(stream_id, "request-initial metadata carried no :path header");
            return;
        }
    };
    let Some((service, method)) = Metadata::parse_path(path) else {
        warn!(stream_id, path, "malformed method path, dropping stream");
        return;
    };

    let Some(registration) = registry.lookup(service, method) else {
        debug!(stream_id, service, method, "no such method");
        let mut writer = ResponseWriter::new(Arc::clone(transport), stream_id);
        writer
            .finish(StatusError::new(Code::Unimplemented, format!("unknown method {service}/{method}")))
            .await;
        return;
    };

    let kind_state = match &registration.handler {
        Handler::Unary(_) | Handler::ServerStream(_) => {
            KindState::SingleRequest { handler: registration.handler.clone(), payload: None }
        }
        Handler::ClientStream(_) | Handler::BiDi(_) => {
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Bytes>();
            let inbound: BoxStream<Bytes> = Box::pin(UnboundedReceiverStream::new(inbound_rx));
            tokio::spawn(run_streaming_handler(
                Arc::clone(transport),
                stream_id,
                registration.handler.clone(),
                inbound,
            ));
            KindState::Streaming { inbound_tx }
        }
    };

    streams.insert(stream_id, StreamState { parser: Parser::new(), kind_state });
}

async fn on_data(transport: &Arc<dyn Transport>, streams: &mut HashMap<StreamId, StreamState>, stream_id: StreamId, chunk: &[u8]) {
    let Some(state) = streams.get_mut(&stream_id) else {
        // No metadata has resolved a method for this stream yet: there is no
        // handler to feed (spec §4.4 rule 2, "if no handler is running...
        // respond INTERNAL and release").
        warn!(stream_id, "data event with no resolved method, dropping stream");
        let mut writer = ResponseWriter::new(Arc::clone(transport), stream_id);
        writer.finish(StatusError::new(Code::Internal, "data received before a resolved method")).await;
        return;
    };
    let frames = state.parser.feed(chunk);
    let mut duplicate_payload = false;
    for frame in frames {
        match &mut state.kind_state {
            KindState::SingleRequest { payload, .. } if payload.is_some() => {
                duplicate_payload = true;
                break;
            }
            KindState::SingleRequest { payload, .. } => {
                *payload = Some(frame.payload);
            }
            KindState::Streaming { inbound_tx } => {
                let _ = inbound_tx.send(frame.payload);
            }
        }
    }

    if duplicate_payload {
        warn!(stream_id, "more than one payload for a single-request call");
        streams.remove(&stream_id);
        let mut writer = ResponseWriter::new(Arc::clone(transport), stream_id);
        writer.finish(StatusError::new(Code::Internal, "more than one payload for a unary call")).await;
    }
}

async fn on_end_of_stream(transport: &Arc<dyn Transport>, streams: &mut HashMap<StreamId, StreamState>, stream_id: StreamId) {
    let Some(state) = streams.remove(&stream_id) else { return };
    match state.kind_state {
        KindState::SingleRequest { handler, payload } => {
            let Some(payload) = payload else {
                let mut writer = ResponseWriter::new(Arc::clone(transport), stream_id);
                writer.finish(StatusError::new(Code::InvalidArgument, "no request message received")).await;
                return;
            };
            tokio::spawn(run_single_request_handler(Arc::clone(transport), stream_id, handler, payload));
        }
        KindState::Streaming { inbound_tx } => {
            // Dropping the sender ends the handler's inbound stream.
            drop(inbound_tx);
        }
    }
}

async fn run_single_request_handler(transport: Arc<dyn Transport>, stream_id: StreamId, handler: Handler, payload: Bytes) {
    let mut writer = ResponseWriter::new(Arc::clone(&transport), stream_id);
    match handler {
        Handler::Unary(call) => match call(payload).await {
            Ok(response) => {
                if let Err(err) = writer.send_message(response).await {
                    writer.finish(err).await;
                    return;
                }
                writer.finish(StatusError::new(Code::Ok, "")).await;
            }
            Err(status) => writer.finish(status).await,
        },
        Handler::ServerStream(call) => match call(payload).await {
            Ok(mut responses) => {
                while let Some(item) = responses.next().await {
                    match item {
                        Ok(bytes) => {
                            if let Err(err) = writer.send_message(bytes).await {
                                writer.finish(err).await;
                                return;
                            }
                        }
                        Err(status) => {
                            writer.finish(status).await;
                            return;
                        }
                    }
                }
                writer.finish(StatusError::new(Code::Ok, "")).await;
            }
            Err(status) => writer.finish(status).await,
        },
        Handler::ClientStream(_) | Handler::BiDi(_) => {
            unreachable!("single-request stream state never holds a streaming handler")
        }
    }
}

async fn run_streaming_handler(transport: Arc<dyn Transport>, stream_id: StreamId, handler: Handler, inbound: BoxStream<Bytes>) {
    let mut writer = ResponseWriter::new(Arc::clone(&transport), stream_id);
    match handler {
        Handler::ClientStream(call) => match call(inbound).await {
            Ok(response) => {
                if let Err(err) = writer.send_message(response).await {
                    writer.finish(err).await;
                    return;
                }
                writer.finish(StatusError::new(Code::Ok, "")).await;
            }
            Err(status) => writer.finish(status).await,
        },
        Handler::BiDi(call) => match call(inbound).await {
            Ok(mut responses) => {
                while let Some(item) = responses.next().await {
                    match item {
                        Ok(bytes) => {
                            if let Err(err) = writer.send_message(bytes).await {
                                writer.finish(err).await;
                                return;
                            }
                        }
                        Err(status) => {
                            writer.finish(status).await;
                            return;
                        }
                    }
                }
                writer.finish(StatusError::new(Code::Ok, "")).await;
            }
            Err(status) => writer.finish(status).await,
        },
        Handler::Unary(_) | Handler::ServerStream(_) => {
            unreachable!("streaming stream state never holds a single-request handler")
        }
    }
}

/// Sequences one stream's response-initial metadata, zero or more framed
/// messages, and a closing trailer — enforcing the invariant that a trailer
/// never precedes response-initial (spec §3).
struct ResponseWriter {
    transport: Arc<dyn Transport>,
    stream_id: StreamId,
    initial_sent: bool,
}

impl ResponseWriter {
    fn new(transport: Arc<dyn Transport>, stream_id: StreamId) -> Self {
        Self { transport, stream_id, initial_sent: false }
    }

    async fn ensure_initial(&mut self) {
        if !self.initial_sent {
            self.initial_sent = true;
            let _ = self.transport.send_metadata(self.stream_id, Metadata::response_initial(), false).await;
        }
    }

    async fn send_message(&mut self, payload: Bytes) -> Result<(), StatusError> {
        self.ensure_initial().await;
        let framed = frame::encode(&payload, false)?;
        self.transport.send_message(self.stream_id, framed, false).await?;
        Ok(())
    }

    async fn finish(mut self, status: StatusError) {
        self.ensure_initial().await;
        let trailer = Metadata::trailer(
            status.code(),
            if status.message().is_empty() { None } else { Some(status.message()) },
        );
        let _ = self.transport.send_metadata(self.stream_id, trailer, true).await;
        self.transport.release_stream_id(self.stream_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::StringCodec;
    use crate::memory_transport::{memory_transport_pair, FlowControlConfig};
    use crate::transport::TransportMessageKind;

    fn build_registry() -> Arc<Registry> {
        let mut registry = Registry::new();
        let contract = Contract::define("Echo", |c| {
            c.add_unary("Say", StringCodec, StringCodec, |req: String| async move { Ok(req) });
        })
        .unwrap();
        registry.add_contract(contract).unwrap();
        Arc::new(registry)
    }

    #[tokio::test]
    async fn registry_registers_subcontracts_transitively() {
        let health = Contract::define("Health", |c| {
            c.add_unary("Check", StringCodec, StringCodec, |_: String| async move { Ok("ok".to_string()) });
        })
        .unwrap();
        let parent = Contract::define("Echo", |c| {
            c.add_unary("Say", StringCodec, StringCodec, |req: String| async move { Ok(req) });
            c.add_subcontract(health);
        })
        .unwrap();

        let mut registry = Registry::new();
        registry.add_contract(parent).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.lookup("Echo", "Say").is_some());
        assert!(registry.lookup("Health", "Check").is_some());
    }

    #[tokio::test]
    async fn registry_rejects_key_collision_between_subcontract_and_parent() {
        let clashing_child = Contract::define("Echo", |c| {
            c.add_unary("Say", StringCodec, StringCodec, |req: String| async move { Ok(req) });
        })
        .unwrap();
        let parent = Contract::define("Echo", |c| {
            c.add_unary("Say", StringCodec, StringCodec, |req: String| async move { Ok(req) });
            c.add_subcontract(clashing_child);
        })
        .unwrap();

        let mut registry = Registry::new();
        assert!(matches!(registry.add_contract(parent), Err(RegistrationError::DuplicateMethod { .. })));
    }

    #[tokio::test]
    async fn unknown_method_gets_unimplemented_trailer() {
        let (caller, responder) = memory_transport_pair(FlowControlConfig::default());
        let responder: Arc<dyn Transport> = Arc::new(responder);
        tokio::spawn(serve(Arc::clone(&responder), build_registry()));

        let stream_id = caller.allocate_stream().unwrap();
        let mut events = caller.messages_for_stream(stream_id);
        caller
            .send_metadata(stream_id, Metadata::request_initial("Nope", "Missing", "test"), true)
            .await
            .unwrap();

        let mut status = None;
        while let Some(event) = events.next().await {
            if let TransportMessageKind::Metadata(metadata) = event.kind {
                if let Some(code) = metadata.grpc_status() {
                    status = Some(code);
                }
            }
            if event.end_of_stream {
                break;
            }
        }
        assert_eq!(status, Some(Code::Unimplemented));
    }

    #[tokio::test]
    async fn unary_echo_round_trips() {
        let (caller, responder) = memory_transport_pair(FlowControlConfig::default());
        let responder: Arc<dyn Transport> = Arc::new(responder);
        tokio::spawn(serve(Arc::clone(&responder), build_registry()));

        let stream_id = caller.allocate_stream().unwrap();
        let mut events = caller.messages_for_stream(stream_id);
        caller
            .send_metadata(stream_id, Metadata::request_initial("Echo", "Say", "test"), false)
            .await
            .unwrap();
        let framed = frame::encode(b"hello", false).unwrap();
        caller.send_message(stream_id, framed, true).await.unwrap();

        let mut parser = Parser::new();
        let mut decoded = Vec::new();
        let mut status = None;
        while let Some(event) = events.next().await {
            match event.kind {
                TransportMessageKind::Data(bytes) => decoded.extend(parser.feed(&bytes)),
                TransportMessageKind::Metadata(metadata) => {
                    if let Some(code) = metadata.grpc_status() {
                        status = Some(code);
                    }
                }
            }
            if event.end_of_stream {
                break;
            }
        }
        assert_eq!(status, Some(Code::Ok));
        assert_eq!(decoded.len(), 1);
        assert_eq!(&decoded[0].payload[..], b"hello");
    }
}
