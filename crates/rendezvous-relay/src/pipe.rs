//! Forwarding pump driven while a session is streaming.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::task::JoinHandle;

use crate::error::TransferError;
use crate::stream::{DestinationSignal, DestinationStream, SourceFrame, SourceStream};

/// How one pairing ended, as observed by the pump.
#[derive(Debug)]
pub(crate) enum PipeOutcome {
    /// The source signaled end-of-stream and the destination drained.
    Finished,
    Failed(TransferError),
}

/// Forward blocks from `source` to `destination` until a terminal outcome.
///
/// Every block accepted into the destination's outbound channel advances
/// `transferred`; the consumer may still be draining those blocks, so the
/// count can lead actual delivery until the drain signal comes back. The
/// first classified outcome wins; the caller suppresses whatever signals
/// straggle in afterwards.
pub(crate) async fn run(
    mut source: SourceStream,
    mut destination: DestinationStream,
    transferred: &AtomicU64,
) -> PipeOutcome {
    trace!("Forwarding started");

    loop {
        tokio::select! {
            frame = source.recv() => match frame {
                Some(SourceFrame::Data(block)) => {
                    let len = block.len() as u64;
                    if destination.send(block).await.is_err() {
                        return PipeOutcome::Failed(destination.close_reason());
                    }
                    transferred.fetch_add(len, Ordering::SeqCst);
                }
                Some(SourceFrame::Eof) => break,
                Some(SourceFrame::Error(error)) => {
                    return PipeOutcome::Failed(TransferError::Source(error.to_string()));
                }
                None => return PipeOutcome::Failed(TransferError::SourceDisconnected),
            },
            signal = destination.signal() => {
                return PipeOutcome::Failed(match signal {
                    Some(DestinationSignal::Error(error)) => TransferError::Destination(error.to_string()),
                    // Drained before end-of-stream, or receiver dropped: the
                    // consumer went away while bytes were still expected.
                    _ => TransferError::DestinationDisconnected,
                });
            }
        }
    }

    trace!("Source ended; waiting for destination drain");

    match destination.finish().await {
        Ok(()) => PipeOutcome::Finished,
        Err(error) => PipeOutcome::Failed(error),
    }
}

/// Join handle that aborts the task when dropped, so a released session
/// cannot leave a pump running behind it.
#[must_use]
pub(crate) struct ChildTask<T>(JoinHandle<T>);

impl<T> ChildTask<T> {
    pub(crate) fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        ChildTask(tokio::spawn(future))
    }
}

impl<T> Drop for ChildTask<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}
