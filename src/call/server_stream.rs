//! One request, a stream of responses (spec §1 "Server-streaming").

use std::sync::Arc;

use crate::codec::Codec;
use crate::contract::BoxStream;
use crate::error::StatusError;
use crate::transport::Transport;

use super::common;

/// Sends `request`, then returns a stream of decoded responses. The stream
/// ends after an `OK` trailer, or yields exactly one `Err` item for any
/// other terminal status.
pub async fn call<Req, Resp>(
    transport: Arc<dyn Transport>,
    service_name: &str,
    method_name: &str,
    authority: &str,
    req_codec: impl Codec<Req>,
    resp_codec: impl Codec<Resp>,
    request: Req,
) -> Result<BoxStream<Result<Resp, StatusError>>, StatusError>
where
    Resp: Send + 'static,
{
    let stream_id = common::open_call(&*transport)?;
    common::send_request_initial(&*transport, stream_id, service_name, method_name, authority).await?;
    common::send_request_message(&*transport, stream_id, &req_codec, &request, true).await?;
    Ok(common::decode_response_stream(transport, stream_id, Arc::new(resp_codec)))
}
