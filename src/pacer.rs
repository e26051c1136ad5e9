//! Outbound stream pacing.
//!
//! [`pace`] reads a byte source sequentially, chunks it into payloads of at
//! most MTU − header bytes, and feeds them to the connection engine through
//! a bounded channel.  The engine only pulls from that channel while the
//! flow-control window has room, so a full window propagates back here as
//! channel backpressure — the pacer blocks cooperatively instead of
//! busy-polling.
//!
//! Exhausting the source drops the channel sender; the engine takes that as
//! the end-of-data signal, waits for the in-flight window to drain, and
//! sends FIN.  The pacer performs no inbound processing — all
//! acknowledgment handling belongs to the engine.

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

/// Stream `source` into `outbound` in chunks of at most `segment_size`
/// bytes.  Returns the total number of bytes read from the source.
///
/// A closed channel means the engine is gone (connection aborted); the
/// pacer stops quietly and leaves error reporting to the engine.  Source
/// read errors are returned to the caller; the dropped sender still lets
/// the engine drain in-flight segments and close cleanly.
pub async fn pace<R>(
    mut source: R,
    segment_size: usize,
    outbound: mpsc::Sender<Vec<u8>>,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    assert!(segment_size > 0, "segment size must be positive");

    let mut total = 0u64;
    loop {
        let mut chunk = vec![0u8; segment_size];
        let n = source.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        chunk.truncate(n);
        total += n as u64;
        if outbound.send(chunk).await.is_err() {
            log::debug!("[pacer] engine closed the channel; stopping at {total} bytes");
            return Ok(total);
        }
    }
    log::debug!("[pacer] source drained after {total} bytes");
    Ok(total)
}
