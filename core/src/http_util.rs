//! Shared HTTP plumbing: capped body reads.

use bytes::Bytes;
use futures::StreamExt;

use crate::error::GatewayErr;
use crate::error::Result;

/// Upper bound on any response body the proxy reads into memory.
pub const MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

/// Read a response body, failing once it exceeds [`MAX_RESPONSE_BYTES`].
pub async fn read_body_capped(response: reqwest::Response) -> Result<Bytes> {
    let mut stream = response.bytes_stream();
    let mut buf: Vec<u8> = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| GatewayErr::Transport(e.to_string()))?;
        if buf.len() + chunk.len() > MAX_RESPONSE_BYTES {
            return Err(GatewayErr::Transport(format!(
                "response body exceeds {MAX_RESPONSE_BYTES} byte cap"
            )));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(buf))
}
