//! Reference in-memory transport: two [`MemoryTransport`]s cross-wired by
//! queues, satisfying the abstract [`Transport`] contract (spec §4.2
//! "Reference in-memory transport").
//!
//! This is the multiplexed-byte-pipe equivalent of
//! `hotaru_core::connection::TcpConnectionStream` — except instead of
//! wrapping a socket, the two halves of the pair feed each other directly,
//! which is what makes it useful as a test fixture and as documentation for
//! what a real transport needs to do.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, UnboundedReceiverStream};

use crate::error::TransportError;
use crate::metadata::{header, Metadata};
use crate::transport::{MessageStream, Side, StreamId, Transport, TransportMessage, TransportMessageKind};

/// Flow-control window configuration (spec §4.2): purely a local memory
/// bound on buffered-but-unconsumed payload bytes, not a credit protocol
/// exchanged with the peer (see SPEC_FULL.md §4.2 on the Open Question this
/// resolves).
#[derive(Debug, Clone, Copy)]
pub struct FlowControlConfig {
    pub initial_window: u64,
    pub max_window: u64,
}

const MIB: u64 = 1024 * 1024;

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self { initial_window: 10 * MIB, max_window: 100 * MIB }
    }
}

#[derive(Debug)]
struct FlowWindow {
    max: u64,
    remaining: u64,
}

impl FlowWindow {
    fn new(config: FlowControlConfig) -> Self {
        Self { max: config.max_window, remaining: config.initial_window.min(config.max_window) }
    }

    /// Accounts for `consumed` bytes of incoming payload, growing the
    /// window by half the max (capped) once remaining capacity drops below
    /// 20% of the max.
    fn consume(&mut self, consumed: u64) {
        self.remaining = self.remaining.saturating_sub(consumed);
        if self.remaining < self.max / 5 {
            let grown = self.remaining.saturating_add(self.max / 2);
            self.remaining = grown.min(self.max);
        }
    }
}

/// A single queue entry moving from one [`MemoryTransport`] to its peer.
type WireEvent = TransportMessage;

#[derive(Default)]
struct StreamSlot {
    buffered: VecDeque<TransportMessage>,
    subscriber: Option<mpsc::UnboundedSender<TransportMessage>>,
    remote_eos: bool,
    local_eos_acked: bool,
}

struct Shared {
    side: Side,
    next_id: AtomicU64,
    outbound: mpsc::UnboundedSender<WireEvent>,
    streams: Mutex<HashMap<StreamId, StreamSlot>>,
    stream_paths: Mutex<HashMap<StreamId, String>>,
    local_half_closed: Mutex<HashSet<StreamId>>,
    closed: AtomicBool,
    // `None` once `close()` has run: dropping the sender is what lets every
    // live `incoming()` subscriber observe completion (spec §4.2 "close()
    // ... completes incoming()").
    all_tx: Mutex<Option<broadcast::Sender<TransportMessage>>>,
    window: Mutex<FlowWindow>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

/// One half of an in-memory transport pair.
///
/// Construct a connected pair with [`memory_transport_pair`]; there is no
/// standalone constructor because a transport with nothing on the other end
/// of its queues cannot usefully implement the contract.
#[derive(Clone)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

impl MemoryTransport {
    fn new(
        side: Side,
        outbound: mpsc::UnboundedSender<WireEvent>,
        mut inbound: mpsc::UnboundedReceiver<WireEvent>,
        config: FlowControlConfig,
    ) -> Self {
        let (all_tx, _) = broadcast::channel(1024);
        let shared = Arc::new(Shared {
            side,
            next_id: AtomicU64::new(side.first_id()),
            outbound,
            streams: Mutex::new(HashMap::new()),
            stream_paths: Mutex::new(HashMap::new()),
            local_half_closed: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
            all_tx: Mutex::new(Some(all_tx)),
            window: Mutex::new(FlowWindow::new(config)),
            reader_task: Mutex::new(None),
        });

        let task_shared = Arc::clone(&shared);
        let handle = tokio::spawn(async move {
            while let Some(mut event) = inbound.recv().await {
                if let TransportMessageKind::Data(ref payload) = event.kind {
                    task_shared.window.lock().consume(payload.len() as u64);
                }

                // Cache `:path` from the stream's first metadata event, and
                // stamp it onto every message for that stream from here on
                // (spec §3 "TransportMessage.methodPath").
                if let TransportMessageKind::Metadata(ref metadata) = event.kind {
                    if let Some(path) = metadata.get(header::PATH) {
                        task_shared.stream_paths.lock().insert(event.stream_id, path.to_string());
                    }
                }
                if event.method_path.is_none() {
                    event.method_path = task_shared.stream_paths.lock().get(&event.stream_id).cloned();
                }

                if let Some(all_tx) = task_shared.all_tx.lock().as_ref() {
                    let _ = all_tx.send(event.clone());
                }

                let mut streams = task_shared.streams.lock();
                let slot = streams.entry(event.stream_id).or_default();
                if event.end_of_stream {
                    slot.remote_eos = true;
                }
                if let Some(tx) = &slot.subscriber {
                    if tx.send(event).is_err() {
                        slot.subscriber = None;
                    }
                } else {
                    slot.buffered.push_back(event);
                }
            }
            task_shared.closed.store(true, Ordering::SeqCst);
        });
        *shared.reader_task.lock() = Some(handle);

        Self { shared }
    }

    fn check_sendable(&self, stream_id: StreamId) -> Result<(), TransportError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.shared.local_half_closed.lock().contains(&stream_id) {
            return Err(TransportError::HalfClosed);
        }
        Ok(())
    }

    fn send(&self, event: WireEvent, stream_id: StreamId, end_of_stream: bool) -> Result<(), TransportError> {
        self.check_sendable(stream_id)?;
        if end_of_stream {
            self.shared.local_half_closed.lock().insert(stream_id);
        }
        // The receiver is a background task on the peer; a closed peer
        // manifests as a send error, which we fold into `Closed` — from
        // this side's perspective the distinction isn't actionable.
        self.shared.outbound.send(event).map_err(|_| TransportError::Closed)
    }
}

/// Builds a connected pair of in-memory transports: `initiator` allocates
/// odd stream ids, `acceptor` allocates even ids, and each side's sends
/// become the other's `incoming()`/`messages_for_stream()` events.
pub fn memory_transport_pair(config: FlowControlConfig) -> (MemoryTransport, MemoryTransport) {
    let (a_to_b_tx, a_to_b_rx) = mpsc::unbounded_channel();
    let (b_to_a_tx, b_to_a_rx) = mpsc::unbounded_channel();

    let initiator = MemoryTransport::new(Side::Initiator, a_to_b_tx, b_to_a_rx, config);
    let acceptor = MemoryTransport::new(Side::Acceptor, b_to_a_tx, a_to_b_rx, config);
    (initiator, acceptor)
}

#[async_trait]
impl Transport for MemoryTransport {
    fn allocate_stream(&self) -> Result<StreamId, TransportError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(self.shared.next_id.fetch_add(2, Ordering::SeqCst))
    }

    async fn send_metadata(
        &self,
        stream_id: StreamId,
        metadata: Metadata,
        end_of_stream: bool,
    ) -> Result<(), TransportError> {
        let event = TransportMessage {
            stream_id,
            kind: TransportMessageKind::Metadata(metadata),
            end_of_stream,
            method_path: None,
        };
        self.send(event, stream_id, end_of_stream)
    }

    async fn send_message(
        &self,
        stream_id: StreamId,
        payload: Bytes,
        end_of_stream: bool,
    ) -> Result<(), TransportError> {
        let event = TransportMessage {
            stream_id,
            kind: TransportMessageKind::Data(payload),
            end_of_stream,
            method_path: None,
        };
        self.send(event, stream_id, end_of_stream)
    }

    async fn finish_sending(&self, stream_id: StreamId) -> Result<(), TransportError> {
        if self.shared.local_half_closed.lock().contains(&stream_id) {
            return Ok(());
        }
        self.send_message(stream_id, Bytes::new(), true).await
    }

    fn incoming(&self) -> MessageStream {
        use futures_util::StreamExt;

        match self.shared.all_tx.lock().as_ref() {
            Some(all_tx) => {
                let stream = BroadcastStream::new(all_tx.subscribe())
                    .filter_map(|item| futures_util::future::ready(item.ok()));
                MessageStream::new(stream)
            }
            // Already closed: a subscriber arriving after close() sees a
            // stream that completes immediately, same as one that was
            // subscribed before close() and drained the close-out events.
            None => MessageStream::new(futures_util::stream::empty()),
        }
    }

    fn messages_for_stream(&self, stream_id: StreamId) -> MessageStream {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut streams = self.shared.streams.lock();
            let slot = streams.entry(stream_id).or_default();
            for buffered in slot.buffered.drain(..) {
                // Subscriber just registered; forward synchronously since
                // an unbounded channel never blocks.
                let _ = tx.send(buffered);
            }
            slot.subscriber = Some(tx);
        }
        MessageStream::new(UnboundedReceiverStream::new(rx))
    }

    fn release_stream_id(&self, stream_id: StreamId) {
        self.shared.streams.lock().remove(&stream_id);
        self.shared.stream_paths.lock().remove(&stream_id);
        self.shared.local_half_closed.lock().remove(&stream_id);
    }

    async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.shared.reader_task.lock().take() {
            handle.abort();
        }
        let mut streams = self.shared.streams.lock();
        for (stream_id, slot) in streams.drain() {
            let unavailable = TransportMessage {
                stream_id,
                kind: TransportMessageKind::Metadata(Metadata::trailer(
                    crate::status::Code::Unavailable,
                    Some("transport closed"),
                )),
                end_of_stream: true,
                method_path: None,
            };
            if let Some(tx) = slot.subscriber {
                let _ = tx.send(unavailable);
            }
        }
        drop(streams);
        // Dropping the broadcast sender is what makes every live and future
        // `incoming()` subscriber observe completion rather than hang.
        self.shared.all_tx.lock().take();
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame;
    use futures_util::StreamExt;
    use std::time::Duration;

    #[tokio::test]
    async fn odd_and_even_partitions_never_collide() {
        let (a, b) = memory_transport_pair(FlowControlConfig::default());
        for _ in 0..5 {
            assert_eq!(a.allocate_stream().unwrap() % 2, 1);
            assert_eq!(b.allocate_stream().unwrap() % 2, 0);
        }
    }

    #[tokio::test]
    async fn send_metadata_is_observed_by_the_peer() {
        let (a, b) = memory_transport_pair(FlowControlConfig::default());
        let stream_id = a.allocate_stream().unwrap();
        let mut incoming = b.messages_for_stream(stream_id);

        a.send_metadata(stream_id, Metadata::request_initial("Echo", "Say", "test"), false)
            .await
            .unwrap();

        let msg = incoming.next().await.unwrap();
        assert_eq!(msg.stream_id, stream_id);
        assert_eq!(msg.metadata().unwrap().get(header::PATH), Some("/Echo/Say"));
    }

    #[tokio::test]
    async fn half_close_rejects_further_sends() {
        let (a, _b) = memory_transport_pair(FlowControlConfig::default());
        let stream_id = a.allocate_stream().unwrap();
        a.finish_sending(stream_id).await.unwrap();
        let err = a
            .send_metadata(stream_id, Metadata::new(), false)
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::HalfClosed);
    }

    #[tokio::test]
    async fn fragmented_frames_are_delivered_whole() {
        let (a, b) = memory_transport_pair(FlowControlConfig::default());
        let stream_id = a.allocate_stream().unwrap();
        let mut incoming = b.messages_for_stream(stream_id);

        let framed = frame::encode(b"hello world", false).unwrap();
        for byte in framed.iter() {
            a.send_message(stream_id, Bytes::copy_from_slice(&[*byte]), false).await.unwrap();
        }
        a.finish_sending(stream_id).await.unwrap();

        let mut parser = frame::Parser::new();
        let mut decoded = Vec::new();
        loop {
            let msg = incoming.next().await.unwrap();
            if let Some(payload) = msg.data() {
                decoded.extend(parser.feed(payload));
            }
            if msg.end_of_stream {
                break;
            }
        }
        assert_eq!(decoded.len(), 1);
        assert_eq!(&decoded[0].payload[..], b"hello world");
    }

    #[tokio::test]
    async fn close_fails_in_flight_streams_with_unavailable() {
        let (a, b) = memory_transport_pair(FlowControlConfig::default());
        let stream_id = a.allocate_stream().unwrap();
        let mut incoming = b.messages_for_stream(stream_id);
        a.send_metadata(stream_id, Metadata::request_initial("Echo", "Say", "test"), false)
            .await
            .unwrap();
        let _ = incoming.next().await.unwrap();

        b.close().await;
        assert!(b.is_closed());
    }

    #[tokio::test]
    async fn close_completes_incoming_for_existing_and_new_subscribers() {
        let (_a, b) = memory_transport_pair(FlowControlConfig::default());
        let mut already_subscribed = b.incoming();

        b.close().await;

        let timed_out = tokio::time::timeout(Duration::from_millis(200), already_subscribed.next()).await;
        assert!(timed_out.unwrap().is_none(), "a pre-existing incoming() subscriber must see completion");

        let mut after_close = b.incoming();
        let timed_out = tokio::time::timeout(Duration::from_millis(200), after_close.next()).await;
        assert!(timed_out.unwrap().is_none(), "a post-close incoming() subscriber must start already completed");
    }
}
