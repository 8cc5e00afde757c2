//! The receive loop: one long-lived task per connection generation.
//!
//! Drains the transport, extracts MessagePack frames, and resolves the
//! correlation table entry each response names. Whether the loop exits on
//! orderly peer close, a read error, or a corrupt stream, the generation's
//! teardown runs exactly once (the manager's closed signal guarantees the
//! once-ness even when dispose and the loop race).

use std::sync::Arc;

use rmpv::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace, warn};

use crate::connection::ConnectionManager;
use crate::correlation::CorrelationTable;
use crate::wire::{CallId, FrameBuffer, ResponseEnvelope};

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Read frames until the transport ends, the stream corrupts, or the task is
/// aborted (the aborter then runs teardown itself).
pub(crate) async fn run(
    manager: Arc<ConnectionManager>,
    pending: Arc<CorrelationTable>,
    generation: u64,
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
) {
    let mut frames = FrameBuffer::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    'recv: loop {
        match reader.read(&mut chunk).await {
            // Orderly close from the peer.
            Ok(0) => {
                trace!(generation, "transport closed by peer");
                break 'recv;
            }
            Ok(n) => {
                frames.extend(&chunk[..n]);
                loop {
                    match frames.next_frame() {
                        Ok(Some(value)) => handle_frame(&pending, value),
                        Ok(None) => break,
                        Err(e) => {
                            // Self-delimiting frames leave no way to find the
                            // next boundary once the stream stops parsing.
                            warn!(generation, error = %e, "corrupt frame stream, closing connection");
                            break 'recv;
                        }
                    }
                }
            }
            // Aborted or disposed sockets surface here; expected end-of-life,
            // not a bug.
            Err(e) => {
                trace!(generation, error = %e, "transport read failed");
                break 'recv;
            }
        }
    }

    manager.teardown(generation, &pending).await;
}

/// Decode one frame and resolve the call it correlates to.
///
/// A malformed frame must not strand unrelated calls: if its identifier is
/// recoverable only that call fails, otherwise the frame is logged and
/// skipped and the loop keeps running.
fn handle_frame(pending: &CorrelationTable, value: Value) {
    match ResponseEnvelope::from_value(value.clone()) {
        Ok(envelope) => {
            let id = envelope.msg_id;
            if !pending.resolve(id, envelope) {
                debug!(%id, "response for unknown or already-completed call, ignoring");
            }
        }
        Err(e) => match extract_msg_id(&value) {
            Some(id) => {
                warn!(%id, error = %e, "malformed response frame, failing its call");
                let failure = ResponseEnvelope {
                    msg_id: id,
                    result: None,
                    error: Some(Value::from(format!("malformed response frame: {e}"))),
                };
                pending.resolve(id, failure);
            }
            None => {
                warn!(error = %e, "undecodable frame without a call id, skipping");
            }
        },
    }
}

/// Best-effort recovery of the `msgId` field from a frame that did not parse
/// as a response envelope.
fn extract_msg_id(value: &Value) -> Option<CallId> {
    let map = value.as_map()?;
    let (_, id) = map.iter().find(|(k, _)| k.as_str() == Some("msgId"))?;
    let id = u32::try_from(id.as_u64()?).ok()?;
    Some(CallId::new(id))
}
