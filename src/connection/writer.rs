//! Writer task - the only code that writes to the socket
//!
//! Batches arrive on an unbounded queue and are written back-to-back, then
//! flushed, so frames of one batch are never interleaved with anything else.

use std::time::Duration;

use futures::SinkExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::LinkError;
use crate::codec::{CipCodec, CipMessage, CodecError};

pub(super) type FrameSink = FramedWrite<OwnedWriteHalf, CipCodec>;

/// Upper bound on sending queued batches after a stop request
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Drain `rx` into `sink` until the session is cancelled or the queue closes
///
/// A write failure cancels `session` so the reader side stops too. When the
/// session ends because `shutdown` fired, batches already queued are still
/// written before the socket is closed. On link loss they are dropped.
pub(super) async fn run(
    mut sink: FrameSink,
    mut rx: UnboundedReceiver<Vec<CipMessage>>,
    session: CancellationToken,
    shutdown: CancellationToken,
) -> Result<(), LinkError> {
    loop {
        tokio::select! {
            biased;
            _ = session.cancelled() => break,
            batch = rx.recv() => match batch {
                Some(batch) => {
                    if let Err(e) = write_batch(&mut sink, batch).await {
                        session.cancel();
                        return Err(LinkError::Write(e));
                    }
                }
                None => break,
            },
        }
    }

    if shutdown.is_cancelled() {
        return match timeout(DRAIN_TIMEOUT, drain(&mut sink, &mut rx)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(LinkError::Write(e)),
            Err(_) => {
                warn!("⚠️ Gave up sending queued CIP frames after {:?}", DRAIN_TIMEOUT);
                Ok(())
            }
        };
    }

    // Flushes anything buffered, then shuts the write side down
    if let Err(e) = sink.close().await {
        debug!("Closing CIP socket: {}", e);
    }
    Ok(())
}

/// Write every batch left in `rx` until all senders are gone, then close
async fn drain(
    sink: &mut FrameSink,
    rx: &mut UnboundedReceiver<Vec<CipMessage>>,
) -> Result<(), CodecError> {
    let mut drained = 0usize;
    while let Some(batch) = rx.recv().await {
        drained += 1;
        write_batch(sink, batch).await?;
    }
    if drained > 0 {
        debug!("Sent {} queued batch(es) before closing", drained);
    }
    sink.close().await
}

async fn write_batch(sink: &mut FrameSink, batch: Vec<CipMessage>) -> Result<(), CodecError> {
    for message in batch {
        sink.feed(message).await?;
    }
    sink.flush().await
}
