use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use recall_core::ipc::{RecallRequest, RecallResponse};
use recall_core::ErrorKind;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixListener;
use tokio::sync::broadcast;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::{router, AppState};

/// 4-byte little-endian length prefix, MessagePack payload.
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder().little_endian().new_codec()
}

pub async fn run_unix_server(
    socket_path: &str,
    state: Arc<AppState>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    if Path::new(socket_path).exists() {
        std::fs::remove_file(socket_path)?;
    }

    let listener = UnixListener::bind(socket_path)?;
    tracing::info!("IPC Server listening on {}", socket_path);

    loop {
        tokio::select! {
            res = listener.accept() => {
                let (stream, _) = res?;
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let (read, write) = stream.into_split();
                    serve_connection(read, write, &state).await;
                });
            }
            _ = shutdown.recv() => {
                tracing::info!("Shutting down IPC server...");
                break;
            }
        }
    }

    if Path::new(socket_path).exists() {
        std::fs::remove_file(socket_path)?;
    }

    Ok(())
}

/// Answer framed requests on one connection until the peer hangs up.
pub async fn serve_connection<R, W>(read: R, write: W, state: &AppState)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut framed_read = FramedRead::new(read, frame_codec());
    let mut framed_write = FramedWrite::new(write, frame_codec());

    while let Some(frame) = framed_read.next().await {
        let bytes_mut = match frame {
            Ok(b) => b,
            Err(e) => {
                tracing::error!("Frame error: {}", e);
                break;
            }
        };

        let response = match rmp_serde::from_slice::<RecallRequest>(&bytes_mut) {
            Ok(request) => router::handle_request(request, state).await,
            Err(e) => RecallResponse::err(
                ErrorKind::InvalidArgument,
                format!("Deserialization error: {}", e),
            ),
        };

        match rmp_serde::to_vec_named(&response) {
            Ok(resp_bytes) => {
                if let Err(e) = framed_write.send(Bytes::from(resp_bytes)).await {
                    tracing::error!("Failed to send response: {}", e);
                    break;
                }
            }
            Err(e) => {
                tracing::error!("Failed to serialize response: {}", e);
                break;
            }
        }
    }
}
