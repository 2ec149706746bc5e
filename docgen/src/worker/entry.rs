//! Child side of the worker protocol.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use super::{WorkerReply, WorkerRequest};
use crate::render::Renderer;

/// Render one request and produce the reply; never fails.
pub async fn handle_request<R>(renderer: &R, input: &[u8]) -> WorkerReply
where
    R: Renderer + ?Sized,
{
    let request: WorkerRequest = match serde_json::from_slice(input) {
        Ok(request) => request,
        Err(e) => {
            warn!("Rejecting unparsable worker request: {}", e);
            return WorkerReply::Failure(format!("invalid worker request: {}", e));
        }
    };

    match renderer.render(&request.record).await {
        Ok(bytes) => {
            debug!(bytes = bytes.len(), "Rendered document");
            WorkerReply::Success(bytes)
        }
        Err(e) => WorkerReply::Failure(e.to_string()),
    }
}

/// Serve a single request from `input` and write exactly one reply line to
/// `output`.
pub async fn serve<R, I, O>(renderer: &R, mut input: I, mut output: O) -> crate::Result<()>
where
    R: Renderer + ?Sized,
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let mut request = Vec::new();
    input.read_to_end(&mut request).await?;

    let reply = handle_request(renderer, &request).await;

    output.write_all(reply.to_line()?.as_bytes()).await?;
    output.flush().await?;
    Ok(())
}

/// Worker process entry routine: one request on stdin, one reply on stdout.
pub async fn serve_stdio<R>(renderer: &R) -> crate::Result<()>
where
    R: Renderer + ?Sized,
{
    serve(renderer, tokio::io::stdin(), tokio::io::stdout()).await
}
