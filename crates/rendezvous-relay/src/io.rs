//! Adapters bridging `AsyncRead`/`AsyncWrite` byte streams into the relay's
//! stream contract.
//!
//! A front-end that owns real sockets (or framework body streams) adapts
//! them here; the spawned tasks live until their stream ends or the session
//! releases its half of the channel.

use std::io;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use crate::stream::{DestinationReceiver, DestinationStream, SourceSender, SourceStream};

/// Default number of in-flight blocks for adapter channels.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

const READ_BUFFER_SIZE: usize = 8 * 1024;

impl SourceStream {
    /// Adapt `reader` into a source by spawning a detached read task.
    ///
    /// End-of-input is reported as end-of-stream; connection-teardown error
    /// kinds are reported as a premature disconnect, anything else as a
    /// source error. Must be called within a Tokio runtime.
    pub fn from_reader<R>(reader: R, capacity: usize) -> SourceStream
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (sender, stream) = SourceStream::channel(capacity);
        tokio::spawn(read_task(reader, sender));
        stream
    }
}

impl DestinationStream {
    /// Adapt `writer` into a destination by spawning a detached write task.
    ///
    /// The writer is shut down and drain-complete reported once the source
    /// ends. Must be called within a Tokio runtime.
    pub fn from_writer<W>(writer: W, capacity: usize) -> DestinationStream
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (stream, receiver) = DestinationStream::channel(capacity);
        tokio::spawn(write_task(writer, receiver));
        stream
    }
}

async fn read_task<R>(mut reader: R, sender: SourceSender)
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

    loop {
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                let _ = sender.eof().await;
                return;
            }
            Ok(_) => {
                if sender.data(buf.split().freeze()).await.is_err() {
                    // Session released the source; nothing left to feed.
                    return;
                }
                buf.reserve(READ_BUFFER_SIZE);
            }
            Err(error) if is_disconnect(&error) => {
                // No end-of-stream seen: observed as a premature disconnect
                // when the sender drops.
                debug!(%error, "Source reader closed abruptly");
                return;
            }
            Err(error) => {
                debug!(%error, "Source reader failed");
                let _ = sender.error(error).await;
                return;
            }
        }
    }
}

async fn write_task<W>(mut writer: W, mut receiver: DestinationReceiver)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let Some(block) = receiver.recv().await else {
            break;
        };

        if let Err(error) = writer.write_all(&block).await {
            if is_disconnect(&error) {
                debug!(%error, "Destination writer closed abruptly");
            } else {
                debug!(%error, "Destination writer failed");
                receiver.error(error);
            }
            return;
        }
    }

    match writer.shutdown().await {
        Ok(()) => receiver.drained(),
        Err(error) if is_disconnect(&error) => debug!(%error, "Destination writer closed during shutdown"),
        Err(error) => {
            debug!(%error, "Destination writer failed to flush");
            receiver.error(error);
        }
    }
}

/// Kinds meaning the peer went away, rather than the stream failing.
fn is_disconnect(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}
