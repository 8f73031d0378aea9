//! Caller and responder endpoint facades (spec §2 "Endpoint facades"): the
//! small surface application code actually touches, sitting on top of the
//! [`Transport`] contract, the [`call`] primitives, and the [`dispatch`]
//! engine.
//!
//! These two types play the role `hotaru_core::connection::Connection` and
//! `hotaru_grpc::GrpcService` play together in the teacher: one typed handle
//! around a live transport for the side that issues calls, one typed handle
//! around a method registry for the side that answers them.

use std::sync::Arc;

use futures_core::Stream;
use parking_lot::Mutex;

use crate::call::{bidi, client_stream, server_stream, unary};
use crate::codec::Codec;
use crate::contract::{BoxStream, Contract};
use crate::dispatch::{self, Registry};
use crate::error::{RegistrationError, StatusError};
use crate::transport::Transport;

/// The caller side of a transport: issues one of the four call kinds against
/// a `service_name.method_name` and decodes the result (spec §4.3).
///
/// Cheaply `Clone`: every call opens its own stream id, so endpoints have no
/// per-call state of their own beyond the transport handle and the
/// `:authority` header value every request carries.
#[derive(Clone)]
pub struct CallerEndpoint {
    transport: Arc<dyn Transport>,
    authority: String,
}

impl CallerEndpoint {
    /// Wraps `transport`; `authority` is sent as the `:authority` header on
    /// every request-initial metadata event (spec §3 "Request initial").
    pub fn new(transport: Arc<dyn Transport>, authority: impl Into<String>) -> Self {
        Self { transport, authority: authority.into() }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// One request, one response.
    pub async fn unary<Req, Resp>(
        &self,
        service_name: &str,
        method_name: &str,
        req_codec: impl Codec<Req>,
        resp_codec: impl Codec<Resp>,
        request: Req,
    ) -> Result<Resp, StatusError> {
        unary::call(
            Arc::clone(&self.transport),
            service_name,
            method_name,
            &self.authority,
            req_codec,
            resp_codec,
            request,
        )
        .await
    }

    /// One request, a stream of responses.
    pub async fn server_stream<Req, Resp>(
        &self,
        service_name: &str,
        method_name: &str,
        req_codec: impl Codec<Req>,
        resp_codec: impl Codec<Resp>,
        request: Req,
    ) -> Result<BoxStream<Result<Resp, StatusError>>, StatusError>
    where
        Resp: Send + 'static,
    {
        server_stream::call(
            Arc::clone(&self.transport),
            service_name,
            method_name,
            &self.authority,
            req_codec,
            resp_codec,
            request,
        )
        .await
    }

    /// A stream of requests, one response.
    pub async fn client_stream<Req, Resp, Reqs>(
        &self,
        service_name: &str,
        method_name: &str,
        req_codec: impl Codec<Req>,
        resp_codec: impl Codec<Resp>,
        requests: Reqs,
    ) -> Result<Resp, StatusError>
    where
        Reqs: Stream<Item = Req> + Send + 'static,
    {
        client_stream::call(
            Arc::clone(&self.transport),
            service_name,
            method_name,
            &self.authority,
            req_codec,
            resp_codec,
            requests,
        )
        .await
    }

    /// A stream of requests and a stream of responses, read and written
    /// independently on the same call.
    pub async fn bidirectional<Req, Resp, Reqs>(
        &self,
        service_name: &str,
        method_name: &str,
        req_codec: impl Codec<Req>,
        resp_codec: impl Codec<Resp>,
        requests: Reqs,
    ) -> Result<BoxStream<Result<Resp, StatusError>>, StatusError>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        Reqs: Stream<Item = Req> + Send + 'static,
    {
        bidi::call(
            Arc::clone(&self.transport),
            service_name,
            method_name,
            &self.authority,
            req_codec,
            resp_codec,
            requests,
        )
        .await
    }
}

enum EndpointState {
    /// Accumulating contracts; the dispatch loop has not started.
    Building(Registry),
    /// The dispatch loop is running against an immutable registry (spec §5
    /// "the method registry is immutable after `start()` observes the first
    /// registration").
    Started,
}

/// The responder side of a transport: accumulates [`Contract`]s and, on the
/// first successful registration, spawns the dispatch loop (spec §4.4
/// "Registering the first contract auto-starts the dispatch loop").
pub struct ResponderEndpoint {
    transport: Arc<dyn Transport>,
    state: Mutex<EndpointState>,
}

impl ResponderEndpoint {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport, state: Mutex::new(EndpointState::Building(Registry::new())) }
    }

    /// Registers `contract` (and, transitively, its subcontracts). The first
    /// call to succeed also starts the dispatch loop as a background task;
    /// every call after that fails with [`RegistrationError::AlreadyStarted`]
    /// since the registry is immutable once serving begins.
    pub fn register(&self, contract: Contract) -> Result<(), RegistrationError> {
        let mut state = self.state.lock();
        let EndpointState::Building(registry) = &mut *state else {
            return Err(RegistrationError::AlreadyStarted);
        };
        registry.add_contract(contract)?;

        let EndpointState::Building(registry) = std::mem::replace(&mut *state, EndpointState::Started) else {
            unreachable!("just matched Building above")
        };
        let registry = Arc::new(registry);
        tokio::spawn(dispatch::serve(Arc::clone(&self.transport), registry));
        Ok(())
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn is_started(&self) -> bool {
        matches!(&*self.state.lock(), EndpointState::Started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::StringCodec;
    use crate::memory_transport::{memory_transport_pair, FlowControlConfig};
    use crate::status::Code;

    fn echo_contract() -> Contract {
        Contract::define("Echo", |c| {
            c.add_unary("Say", StringCodec, StringCodec, |req: String| async move {
                Ok(format!("hi {req}"))
            });
        })
        .unwrap()
    }

    #[tokio::test]
    async fn register_then_route() {
        let (caller_transport, responder_transport) = memory_transport_pair(FlowControlConfig::default());
        let caller = CallerEndpoint::new(Arc::new(caller_transport), "test");
        let responder = ResponderEndpoint::new(Arc::new(responder_transport));

        responder.register(echo_contract()).unwrap();
        assert!(responder.is_started());

        // A registered path routes to its handler.
        let after = caller
            .unary::<String, String>("Echo", "Say", StringCodec, StringCodec, "world".to_string())
            .await
            .unwrap();
        assert_eq!(after, "hi world");

        // A path that was never registered yields UNIMPLEMENTED.
        let missing = caller
            .unary::<String, String>("Missing", "Nope", StringCodec, StringCodec, "world".to_string())
            .await
            .unwrap_err();
        assert_eq!(missing.code(), Code::Unimplemented);
    }

    #[tokio::test]
    async fn second_registration_after_start_fails() {
        let (_caller_transport, responder_transport) = memory_transport_pair(FlowControlConfig::default());
        let responder = ResponderEndpoint::new(Arc::new(responder_transport));
        responder.register(echo_contract()).unwrap();
        let err = responder.register(echo_contract()).unwrap_err();
        assert!(matches!(err, RegistrationError::AlreadyStarted));
    }
}
