//! Bidirectional copy between a downstream call and the upstream call
//! dialled on its behalf, oblivious to the opaque bytes it is shuttling.
//!
//! [`pipe`] never closes the downstream stream itself; ending that stream is
//! the caller's responsibility once both directions have drained. This
//! mirrors the half-duplex semantics gRPC servers expose: a client may keep
//! sending after the server half-closes, and a server may keep sending
//! after the client half-closes.

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::{Stream, StreamExt};
use tonic::metadata::MetadataMap;
use tonic::{Code, Status};

/// Message/byte counters collected while piping a single call, handed back
/// to the logging middleware.
#[derive(Debug, Default, Clone, Copy)]
pub struct PipeStats {
    pub sent_messages: u64,
    pub sent_bytes: u64,
    pub received_messages: u64,
    pub received_bytes: u64,
}

/// An upstream response body the pipe can drain and then ask for trailers,
/// matching `tonic::codec::Streaming<T>`'s own shape (its `trailers()`
/// method only returns a useful answer once the stream has yielded `None`).
#[async_trait::async_trait]
pub trait UpstreamBody: Stream<Item = Result<Bytes, Status>> + Unpin + Send {
    async fn trailers(&mut self) -> Result<Option<MetadataMap>, Status>;
}

#[async_trait::async_trait]
impl UpstreamBody for tonic::Streaming<Bytes> {
    async fn trailers(&mut self) -> Result<Option<MetadataMap>, Status> {
        tonic::Streaming::trailers(self).await
    }
}

/// Pump `downstream` into `upstream_tx` and `upstream_rx` into
/// `downstream_tx` concurrently, returning once both directions have
/// drained (or one side errors).
///
/// A upstream stream that ends abruptly (no trailers observed) after at
/// least one message was already forwarded downstream is treated as a clean
/// end rather than an error: some servers close the stream without sending
/// a final status once they've said everything they have to say, and that
/// is not a protocol violation worth surfacing to the caller.
pub async fn pipe<DS, US>(
    mut downstream: DS,
    upstream_tx: mpsc::Sender<Bytes>,
    mut upstream_rx: US,
    downstream_tx: mpsc::Sender<Result<Bytes, Status>>,
) -> Result<(PipeStats, MetadataMap), Status>
where
    DS: Stream<Item = Result<Bytes, Status>> + Unpin + Send,
    US: UpstreamBody,
{
    let upload = async {
        let mut sent_messages = 0u64;
        let mut sent_bytes = 0u64;
        loop {
            match downstream.next().await {
                Some(Ok(msg)) => {
                    sent_bytes += msg.len() as u64;
                    sent_messages += 1;
                    if upstream_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                None => break,
                Some(Err(status)) => return Err(status),
            }
        }
        // Downstream end-of-stream half-closes the upstream send side by
        // dropping `upstream_tx` here.
        Ok((sent_messages, sent_bytes))
    };

    let download = async {
        let mut received_messages = 0u64;
        let mut received_bytes = 0u64;
        loop {
            match upstream_rx.next().await {
                Some(Ok(msg)) => {
                    received_bytes += msg.len() as u64;
                    received_messages += 1;
                    if downstream_tx.send(Ok(msg)).await.is_err() {
                        break;
                    }
                }
                None => break,
                Some(Err(status)) if received_messages > 0 && looks_like_missing_trailers(&status) => break,
                Some(Err(status)) => {
                    let _ = downstream_tx.send(Err(status.clone())).await;
                    return Err(status);
                }
            }
        }
        let trailers = upstream_rx.trailers().await?.unwrap_or_default();
        Ok((received_messages, received_bytes, trailers))
    };

    let (upload, download) = tokio::join!(upload, download);
    let (sent_messages, sent_bytes) = upload?;
    let (received_messages, received_bytes, trailers) = download?;

    let stats = PipeStats {
        sent_messages,
        sent_bytes,
        received_messages,
        received_bytes,
    };
    Ok((stats, trailers))
}

fn looks_like_missing_trailers(status: &Status) -> bool {
    status.code() == Code::Unknown && status.message().is_empty()
}

/// Whether `code` is one of the client-class codes the reflection merger
/// marks as upstream-sourced when forwarding it to the caller, rather than
/// surfacing it verbatim.
pub fn is_client_code(code: Code) -> bool {
    matches!(
        code,
        Code::Cancelled
            | Code::DeadlineExceeded
            | Code::PermissionDenied
            | Code::Unavailable
            | Code::Unauthenticated
            | Code::Unimplemented
            | Code::Aborted
            | Code::ResourceExhausted
            | Code::Unknown
    )
}
