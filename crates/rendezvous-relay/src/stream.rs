//! Byte-stream contract consumed by the relay.
//!
//! Endpoints are rendered as bounded channels: the producing peer pushes
//! [`SourceFrame`]s through a [`SourceSender`], the consuming peer drains
//! blocks from a [`DestinationReceiver`] and reports a single
//! [`DestinationSignal`] once it can accept no more. Channel closure is
//! itself a signal: a side that goes away without its end-of-stream marker is
//! observed as a premature disconnect.

use std::io;

use bytes::Bytes;
use tap::prelude::*;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::error::TransferError;

/// One frame observed on the producing side of a session.
#[derive(Debug)]
pub enum SourceFrame {
    /// A block of bytes produced by the source.
    Data(Bytes),
    /// End-of-stream: the source finished producing.
    Eof,
    /// The source failed mid-production.
    Error(io::Error),
}

/// The session released its end of the stream; no more frames are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("stream released by the session")]
pub struct StreamReleased;

/// Producing half, handed to the peer that supplies bytes.
#[derive(Debug, Clone)]
pub struct SourceSender {
    tx: mpsc::Sender<SourceFrame>,
}

impl SourceSender {
    /// Queue a block of bytes.
    ///
    /// Suspends while the relay has no capacity left, which is how
    /// destination backpressure pauses the source.
    pub async fn data(&self, block: impl Into<Bytes>) -> Result<(), StreamReleased> {
        self.tx
            .send(SourceFrame::Data(block.into()))
            .await
            .map_err(|_| StreamReleased)
    }

    /// Signal end-of-stream. No more frames may follow.
    pub async fn eof(self) -> Result<(), StreamReleased> {
        self.tx.send(SourceFrame::Eof).await.map_err(|_| StreamReleased)
    }

    /// Report a failure of the producing stream. No more frames may follow.
    pub async fn error(self, error: io::Error) -> Result<(), StreamReleased> {
        self.tx.send(SourceFrame::Error(error)).await.map_err(|_| StreamReleased)
    }
}

/// Relay-side handle to the producing byte stream.
#[derive(Debug)]
pub struct SourceStream {
    rx: mpsc::Receiver<SourceFrame>,
}

impl SourceStream {
    /// Bounded producer/stream pair holding up to `capacity` in-flight
    /// frames. `capacity` must be non-zero.
    pub fn channel(capacity: usize) -> (SourceSender, SourceStream) {
        mpsc::channel(capacity).pipe(|(tx, rx)| (SourceSender { tx }, SourceStream { rx }))
    }

    /// `None` once the producing side went away.
    pub(crate) async fn recv(&mut self) -> Option<SourceFrame> {
        self.rx.recv().await
    }
}

/// Signal reported by the consuming side once it can accept no more bytes.
#[derive(Debug)]
pub enum DestinationSignal {
    /// Every block accepted before the data channel closed was delivered.
    Drained,
    /// The destination failed while accepting or flushing.
    Error(io::Error),
}

/// Relay-side handle to the consuming byte stream.
#[derive(Debug)]
pub struct DestinationStream {
    data_tx: mpsc::Sender<Bytes>,
    signal_rx: oneshot::Receiver<DestinationSignal>,
}

impl DestinationStream {
    /// Bounded stream/consumer pair holding up to `capacity` in-flight
    /// blocks. `capacity` must be non-zero.
    pub fn channel(capacity: usize) -> (DestinationStream, DestinationReceiver) {
        let (data_tx, data_rx) = mpsc::channel(capacity);
        let (signal_tx, signal_rx) = oneshot::channel();

        let stream = DestinationStream { data_tx, signal_rx };
        let receiver = DestinationReceiver { data_rx, signal_tx };

        (stream, receiver)
    }

    /// Push one block to the consumer, suspending while it has no capacity.
    pub(crate) async fn send(&self, block: Bytes) -> Result<(), Bytes> {
        self.data_tx.send(block).await.map_err(|rejected| rejected.0)
    }

    /// Resolves once the destination reports its signal, or `None` when it
    /// went away without one. Must not be polled again after resolving.
    pub(crate) async fn signal(&mut self) -> Option<DestinationSignal> {
        (&mut self.signal_rx).await.ok()
    }

    /// Classify why a `send` was rejected.
    pub(crate) fn close_reason(&mut self) -> TransferError {
        match self.signal_rx.try_recv() {
            Ok(DestinationSignal::Error(error)) => TransferError::Destination(error.to_string()),
            // Drained early or simply gone: the consumer went away while the
            // source still had bytes to move.
            _ => TransferError::DestinationDisconnected,
        }
    }

    /// Close the data channel and wait for the destination to finish
    /// flushing what it accepted.
    pub(crate) async fn finish(self) -> Result<(), TransferError> {
        let DestinationStream { data_tx, signal_rx } = self;
        drop(data_tx);

        match signal_rx.await {
            Ok(DestinationSignal::Drained) => Ok(()),
            Ok(DestinationSignal::Error(error)) => Err(TransferError::Destination(error.to_string())),
            Err(_) => Err(TransferError::DestinationDisconnected),
        }
    }
}

/// Consuming half, handed to the peer that accepts bytes.
#[derive(Debug)]
pub struct DestinationReceiver {
    data_rx: mpsc::Receiver<Bytes>,
    signal_tx: oneshot::Sender<DestinationSignal>,
}

impl DestinationReceiver {
    /// Next block to deliver. `None` once the source ended and every
    /// accepted block was handed out.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.data_rx.recv().await
    }

    /// Report that every accepted block was delivered and flushed.
    pub fn drained(self) {
        let _ = self.signal_tx.send(DestinationSignal::Drained);
    }

    /// Report a delivery failure.
    pub fn error(self, error: io::Error) {
        let _ = self.signal_tx.send(DestinationSignal::Error(error));
    }
}
