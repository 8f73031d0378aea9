//! `callmux` — a transport-agnostic RPC runtime reproducing gRPC's four
//! call semantics (unary, server-streaming, client-streaming,
//! bidirectional) over arbitrary framed byte transports.
//!
//! A [`Codec<T>`](codec::Codec) is the only place application types appear;
//! everything below it — framing, metadata, the [`Transport`](transport::Transport)
//! contract, the dispatch engine — operates on raw bytes. This mirrors how
//! `hotaru_grpc` sits on top of `hotaru_core::connection`: a small set of
//! abstract, id-bearing traits the rest of the crate is generic over, with
//! the protocol-specific pieces (here, gRPC's call semantics; there,
//! gRPC-over-HTTP/2) layered on top.

pub mod call;
pub mod codec;
pub mod contract;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod memory_transport;
pub mod metadata;
pub mod status;
pub mod transport;


/// The common entry points most applications need.
pub mod prelude {
    pub use crate::codec::{BytesCodec, Codec, StringCodec};
    pub use crate::contract::{BoxStream, Contract, ContractBuilder, MethodKind};
    pub use crate::endpoint::{CallerEndpoint, ResponderEndpoint};
    pub use crate::error::StatusError;
    pub use crate::memory_transport::{memory_transport_pair, FlowControlConfig, MemoryTransport};
    pub use crate::metadata::Metadata;
    pub use crate::status::Code;
    pub use crate::transport::Transport;
}
