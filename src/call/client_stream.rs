//! A stream of requests, one response (spec §1 "Client-streaming").

use std::sync::Arc;

use futures_util::StreamExt;
use futures_core::Stream;

use crate::codec::Codec;
use crate::error::StatusError;
use crate::transport::Transport;

use super::common;

/// Sends every item of `requests` (in order), then waits for the
/// responder's single reply. Sending and receiving run concurrently so a
/// responder that replies before the caller finishes sending is not a
/// protocol violation — only a race the caller wins.
pub async fn call<Req, Resp, Reqs>(
    transport: Arc<dyn Transport>,
    service_name: &str,
    method_name: &str,
    authority: &str,
    req_codec: impl Codec<Req>,
    resp_codec: impl Codec<Resp>,
    requests: Reqs,
) -> Result<Resp, StatusError>
where
    Reqs: Stream<Item = Req> + Send + 'static,
{
    let stream_id = common::open_call(&*transport)?;
    common::send_request_initial(&*transport, stream_id, service_name, method_name, authority).await?;

    let send = async {
        tokio::pin!(requests);
        while let Some(request) = requests.next().await {
            common::send_request_message(&*transport, stream_id, &req_codec, &request, false).await?;
        }
        common::finish_request(&*transport, stream_id).await
    };
    let recv = common::read_single_response(Arc::clone(&transport), stream_id, &resp_codec);

    let (send_result, recv_result) = tokio::join!(send, recv);
    send_result?;
    recv_result
}
