//! One request, one response (spec §1 "Unary").

use std::sync::Arc;

use crate::codec::Codec;
use crate::error::StatusError;
use crate::transport::Transport;

use super::common;

/// Sends `request`, then waits for the responder's single reply and
/// terminal status.
pub async fn call<Req, Resp>(
    transport: Arc<dyn Transport>,
    service_name: &str,
    method_name: &str,
    authority: &str,
    req_codec: impl Codec<Req>,
    resp_codec: impl Codec<Resp>,
    request: Req,
) -> Result<Resp, StatusError> {
    let stream_id = common::open_call(&*transport)?;
    common::send_request_initial(&*transport, stream_id, service_name, method_name, authority).await?;
    common::send_request_message(&*transport, stream_id, &req_codec, &request, true).await?;
    common::read_single_response(transport, stream_id, &resp_codec).await
}
