//! A stream of requests and a stream of responses, read and written
//! independently (spec §1 "Bidirectional").

use std::sync::Arc;

use futures_util::StreamExt;
use futures_core::Stream;

use crate::codec::Codec;
use crate::contract::BoxStream;
use crate::error::StatusError;
use crate::transport::Transport;

use super::common;

/// Starts sending `requests` in the background and returns a stream of
/// decoded responses immediately — the two directions are independent, so
/// the caller can interleave reading and writing however the method's
/// semantics call for.
pub async fn call<Req, Resp, Reqs>(
    transport: Arc<dyn Transport>,
    service_name: &str,
    method_name: &str,
    authority: &str,
    req_codec: impl Codec<Req>,
    resp_codec: impl Codec<Resp>,
    requests: Reqs,
) -> Result<BoxStream<Result<Resp, StatusError>>, StatusError>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    Reqs: Stream<Item = Req> + Send + 'static,
{
    let stream_id = common::open_call(&*transport)?;
    common::send_request_initial(&*transport, stream_id, service_name, method_name, authority).await?;

    let send_transport = Arc::clone(&transport);
    tokio::spawn(async move {
        tokio::pin!(requests);
        while let Some(request) = requests.next().await {
            if common::send_request_message(&*send_transport, stream_id, &req_codec, &request, false).await.is_err() {
                return;
            }
        }
        let _ = common::finish_request(&*send_transport, stream_id).await;
    });

    Ok(common::decode_response_stream(transport, stream_id, Arc::new(resp_codec)))
}
