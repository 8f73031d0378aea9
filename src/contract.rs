//! Typed method registration (spec §4.4 "Contract"): the builder surface
//! application code uses to describe a service, and the raw-bytes
//! [`Handler`] it compiles down to for the dispatch engine.
//!
//! The builder pattern here — consuming setter calls threaded through a
//! closure invoked exactly once — follows
//! `hotaru_core::connection::builder::ConnectionBuilder`, generalized from
//! "configure a connection" to "register a service's methods".

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures_core::Stream;
use futures_util::StreamExt;

use crate::codec::Codec;
use crate::error::{RegistrationError, StatusError};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

/// Which of the four call shapes a method implements (spec §1 "four call
/// kinds").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Unary,
    ServerStream,
    ClientStream,
    BiDi,
}

/// A method handler erased to operate on framed-but-undecoded bytes. This
/// is the only shape the dispatch engine ever touches — typed `Codec<T>`
/// conversion happens once, when a [`ContractBuilder::add_unary`] (or
/// sibling) call closes over the caller's codecs and handler (spec §4.1:
/// `Codec<T>` is the sole typed boundary).
#[derive(Clone)]
pub enum Handler {
    Unary(Arc<dyn Fn(Bytes) -> BoxFuture<Result<Bytes, StatusError>> + Send + Sync>),
    ServerStream(
        Arc<dyn Fn(Bytes) -> BoxFuture<Result<BoxStream<Result<Bytes, StatusError>>, StatusError>> + Send + Sync>,
    ),
    ClientStream(Arc<dyn Fn(BoxStream<Bytes>) -> BoxFuture<Result<Bytes, StatusError>> + Send + Sync>),
    BiDi(
        Arc<
            dyn Fn(BoxStream<Bytes>) -> BoxFuture<Result<BoxStream<Result<Bytes, StatusError>>, StatusError>>
                + Send
                + Sync,
        >,
    ),
}

impl Handler {
    pub fn kind(&self) -> MethodKind {
        match self {
            Handler::Unary(_) => MethodKind::Unary,
            Handler::ServerStream(_) => MethodKind::ServerStream,
            Handler::ClientStream(_) => MethodKind::ClientStream,
            Handler::BiDi(_) => MethodKind::BiDi,
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handler").field(&self.kind()).finish()
    }
}

/// One registered method: its dispatch key (`service/method`) and the
/// handler invoked for it.
#[derive(Clone, Debug)]
pub struct MethodRegistration {
    pub service_name: String,
    pub method_name: String,
    pub handler: Handler,
}

impl MethodRegistration {
    /// The key [`Metadata::parse_path`](crate::metadata::Metadata::parse_path)
    /// is matched against.
    pub fn key(&self) -> String {
        format!("{}/{}", self.service_name, self.method_name)
    }
}

/// A fully built service definition: a name plus the methods registered
/// against it during [`Contract::define`], plus any subcontracts attached
/// via [`ContractBuilder::add_subcontract`].
///
/// A subcontract is an independent `serviceName` root nested under its
/// parent only for registration convenience (spec §3 "Contract", §4.5):
/// registering the parent registers every subcontract too, each asserting
/// uniqueness of its own `serviceName.methodName` keys against the whole
/// registry, not just against its parent.
#[derive(Debug, Clone)]
pub struct Contract {
    service_name: String,
    methods: Vec<MethodRegistration>,
    subcontracts: Vec<Contract>,
}

impl Contract {
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn methods(&self) -> &[MethodRegistration] {
        &self.methods
    }

    pub fn subcontracts(&self) -> &[Contract] {
        &self.subcontracts
    }

    pub fn into_methods(self) -> Vec<MethodRegistration> {
        self.methods
    }

    /// Splits a contract into its own methods and its subcontracts, for a
    /// registry to fold in recursively (subcontracts first, spec §4.4).
    pub fn into_parts(self) -> (Vec<MethodRegistration>, Vec<Contract>) {
        (self.methods, self.subcontracts)
    }

    /// Builds a contract by invoking `setup` exactly once with a fresh
    /// builder. Registering the same method name twice fails the whole
    /// definition rather than silently keeping the last registration.
    pub fn define(
        service_name: impl Into<String>,
        setup: impl FnOnce(&mut ContractBuilder),
    ) -> Result<Self, RegistrationError> {
        let mut builder = ContractBuilder {
            service_name: service_name.into(),
            methods: Vec::new(),
            subcontracts: Vec::new(),
            error: None,
        };
        setup(&mut builder);
        if let Some(error) = builder.error {
            return Err(error);
        }
        Ok(Contract { service_name: builder.service_name, methods: builder.methods, subcontracts: builder.subcontracts })
    }
}

/// Accumulates one service's method registrations. Only reachable from
/// inside the `setup` closure passed to [`Contract::define`].
pub struct ContractBuilder {
    service_name: String,
    methods: Vec<MethodRegistration>,
    subcontracts: Vec<Contract>,
    error: Option<RegistrationError>,
}

impl ContractBuilder {
    fn push(&mut self, method_name: String, handler: Handler) {
        let key = format!("{}/{}", self.service_name, method_name);
        if self.methods.iter().any(|m| m.key() == key) {
            self.error.get_or_insert(RegistrationError::DuplicateMethod { key });
            return;
        }
        self.methods.push(MethodRegistration { service_name: self.service_name.clone(), method_name, handler });
    }

    /// Attaches `child` as an independent `serviceName` root, registered
    /// transitively whenever this contract is.
    pub fn add_subcontract(&mut self, child: Contract) -> &mut Self {
        self.subcontracts.push(child);
        self
    }

    /// Registers a unary method: one request, one response.
    pub fn add_unary<Req, Resp, C1, C2, F, Fut>(
        &mut self,
        method_name: impl Into<String>,
        req_codec: C1,
        resp_codec: C2,
        handler: F,
    ) -> &mut Self
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        C1: Codec<Req>,
        C2: Codec<Resp>,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, StatusError>> + Send + 'static,
    {
        let req_codec = Arc::new(req_codec);
        let resp_codec = Arc::new(resp_codec);
        let handler = Arc::new(handler);
        let raw: Arc<dyn Fn(Bytes) -> BoxFuture<Result<Bytes, StatusError>> + Send + Sync> =
            Arc::new(move |bytes| {
                let req_codec = Arc::clone(&req_codec);
                let resp_codec = Arc::clone(&resp_codec);
                let handler = Arc::clone(&handler);
                Box::pin(async move {
                    let req = req_codec.deserialize(&bytes)?;
                    let resp = handler(req).await?;
                    Ok(resp_codec.serialize(&resp)?)
                })
            });
        self.push(method_name.into(), Handler::Unary(raw));
        self
    }

    /// Registers a server-streaming method: one request, a stream of
    /// responses.
    pub fn add_server_stream<Req, Resp, C1, C2, F, Fut, S>(
        &mut self,
        method_name: impl Into<String>,
        req_codec: C1,
        resp_codec: C2,
        handler: F,
    ) -> &mut Self
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        C1: Codec<Req>,
        C2: Codec<Resp>,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, StatusError>> + Send + 'static,
        S: Stream<Item = Result<Resp, StatusError>> + Send + 'static,
    {
        let req_codec = Arc::new(req_codec);
        let resp_codec = Arc::new(resp_codec);
        let handler = Arc::new(handler);
        let raw: Arc<
            dyn Fn(Bytes) -> BoxFuture<Result<BoxStream<Result<Bytes, StatusError>>, StatusError>> + Send + Sync,
        > = Arc::new(move |bytes| {
            let req_codec = Arc::clone(&req_codec);
            let resp_codec = Arc::clone(&resp_codec);
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let req = req_codec.deserialize(&bytes)?;
                let responses = handler(req).await?;
                let encoded = responses.map(move |item| {
                    let resp_codec = Arc::clone(&resp_codec);
                    item.and_then(|resp| resp_codec.serialize(&resp).map_err(StatusError::from))
                });
                Ok(Box::pin(encoded) as BoxStream<Result<Bytes, StatusError>>)
            })
        });
        self.push(method_name.into(), Handler::ServerStream(raw));
        self
    }

    /// Registers a client-streaming method: a stream of requests, one
    /// response.
    pub fn add_client_stream<Req, Resp, C1, C2, F, Fut>(
        &mut self,
        method_name: impl Into<String>,
        req_codec: C1,
        resp_codec: C2,
        handler: F,
    ) -> &mut Self
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        C1: Codec<Req>,
        C2: Codec<Resp>,
        F: Fn(BoxStream<Result<Req, StatusError>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, StatusError>> + Send + 'static,
    {
        let req_codec = Arc::new(req_codec);
        let resp_codec = Arc::new(resp_codec);
        let handler = Arc::new(handler);
        let raw: Arc<dyn Fn(BoxStream<Bytes>) -> BoxFuture<Result<Bytes, StatusError>> + Send + Sync> =
            Arc::new(move |inbound| {
                let req_codec = Arc::clone(&req_codec);
                let resp_codec = Arc::clone(&resp_codec);
                let handler = Arc::clone(&handler);
                let decoded = inbound.map(move |bytes| req_codec.deserialize(&bytes).map_err(StatusError::from));
                Box::pin(async move {
                    let resp = handler(Box::pin(decoded)).await?;
                    Ok(resp_codec.serialize(&resp)?)
                })
            });
        self.push(method_name.into(), Handler::ClientStream(raw));
        self
    }

    /// Registers a bidirectional-streaming method: a stream of requests
    /// and a stream of responses, read and written independently.
    pub fn add_bidirectional<Req, Resp, C1, C2, F, Fut, S>(
        &mut self,
        method_name: impl Into<String>,
        req_codec: C1,
        resp_codec: C2,
        handler: F,
    ) -> &mut Self
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        C1: Codec<Req>,
        C2: Codec<Resp>,
        F: Fn(BoxStream<Result<Req, StatusError>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, StatusError>> + Send + 'static,
        S: Stream<Item = Result<Resp, StatusError>> + Send + 'static,
    {
        let req_codec = Arc::new(req_codec);
        let resp_codec = Arc::new(resp_codec);
        let handler = Arc::new(handler);
        let raw: Arc<
            dyn Fn(BoxStream<Bytes>) -> BoxFuture<Result<BoxStream<Result<Bytes, StatusError>>, StatusError>>
                + Send
                + Sync,
        > = Arc::new(move |inbound| {
            let req_codec = Arc::clone(&req_codec);
            let resp_codec = Arc::clone(&resp_codec);
            let handler = Arc::clone(&handler);
            let decoded = inbound.map(move |bytes| req_codec.deserialize(&bytes).map_err(StatusError::from));
            Box::pin(async move {
                let responses = handler(Box::pin(decoded)).await?;
                let encoded = responses.map(move |item| {
                    let resp_codec = Arc::clone(&resp_codec);
                    item.and_then(|resp| resp_codec.serialize(&resp).map_err(StatusError::from))
                });
                Ok(Box::pin(encoded) as BoxStream<Result<Bytes, StatusError>>)
            })
        });
        self.push(method_name.into(), Handler::BiDi(raw));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::StringCodec;
    use crate::status::Code;
    use futures_util::stream;

    #[tokio::test]
    async fn unary_handler_round_trips_through_codecs() {
        let contract = Contract::define("Echo", |c| {
            c.add_unary("Say", StringCodec, StringCodec, |req: String| async move { Ok(req.to_uppercase()) });
        })
        .unwrap();

        assert_eq!(contract.methods().len(), 1);
        let Handler::Unary(handler) = &contract.methods()[0].handler else { panic!("expected unary handler") };
        let result = handler(Bytes::from_static(b"hi")).await.unwrap();
        assert_eq!(&result[..], b"HI");
    }

    #[tokio::test]
    async fn duplicate_method_names_fail_the_whole_definition() {
        let result = Contract::define("Echo", |c| {
            c.add_unary("Say", StringCodec, StringCodec, |req: String| async move { Ok(req) });
            c.add_unary("Say", StringCodec, StringCodec, |req: String| async move { Ok(req) });
        });
        assert!(matches!(result, Err(RegistrationError::DuplicateMethod { .. })));
    }

    #[tokio::test]
    async fn server_stream_handler_encodes_each_item() {
        let contract = Contract::define("Counter", |c| {
            c.add_server_stream("Count", StringCodec, StringCodec, |req: String| async move {
                let n: u32 = req.parse().unwrap_or(0);
                Ok(stream::iter((0..n).map(|i| Ok::<_, StatusError>(i.to_string()))))
            });
        })
        .unwrap();

        let Handler::ServerStream(handler) = &contract.methods()[0].handler else {
            panic!("expected server-stream handler")
        };
        let mut out = handler(Bytes::from_static(b"3")).await.unwrap();
        let mut collected = Vec::new();
        while let Some(item) = out.next().await {
            collected.push(item.unwrap());
        }
        assert_eq!(collected, vec![Bytes::from_static(b"0"), Bytes::from_static(b"1"), Bytes::from_static(b"2")]);
    }

    #[tokio::test]
    async fn client_stream_handler_sees_decode_errors_inline() {
        let contract = Contract::define("Sum", |c| {
            c.add_client_stream("Sum", StringCodec, StringCodec, |mut inbound: BoxStream<Result<String, StatusError>>| async move {
                let mut total = 0i64;
                while let Some(item) = inbound.next().await {
                    match item {
                        Ok(s) => total += s.parse::<i64>().unwrap_or(0),
                        Err(err) => return Err(err),
                    }
                }
                Ok(total.to_string())
            });
        })
        .unwrap();

        let Handler::ClientStream(handler) = &contract.methods()[0].handler else {
            panic!("expected client-stream handler")
        };
        let inbound: BoxStream<Bytes> =
            Box::pin(stream::iter(vec![Bytes::from_static(b"1"), Bytes::from_static(b"2"), Bytes::from_static(b"3")]));
        let result = handler(inbound).await.unwrap();
        assert_eq!(&result[..], b"6");
    }

    #[test]
    fn subcontracts_are_visible_on_the_built_contract() {
        let child = Contract::define("Health", |c| {
            c.add_unary("Check", StringCodec, StringCodec, |_: String| async move { Ok("ok".to_string()) });
        })
        .unwrap();
        let parent = Contract::define("Echo", |c| {
            c.add_unary("Say", StringCodec, StringCodec, |req: String| async move { Ok(req) });
            c.add_subcontract(child);
        })
        .unwrap();
        assert_eq!(parent.subcontracts().len(), 1);
        assert_eq!(parent.subcontracts()[0].service_name(), "Health");
    }

    #[test]
    fn registration_key_combines_service_and_method() {
        let registration =
            MethodRegistration { service_name: "Echo".into(), method_name: "Say".into(), handler: Handler::Unary(Arc::new(|b| Box::pin(async move { Ok(b) }))) };
        assert_eq!(registration.key(), "Echo/Say");
        let _ = Code::Ok;
    }
}
