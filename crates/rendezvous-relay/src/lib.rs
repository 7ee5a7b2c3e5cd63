//! Core of a streaming rendezvous relay.
//!
//! A [`Session`] pairs a producing byte source with a consuming destination
//! that arrive independently (typically as two separate requests carrying the
//! same session id), pipes blocks across with backpressure, counts what the
//! destination accepts, and guarantees exactly one classified terminal
//! outcome per pairing: success, one of three timeout verdicts, a stream
//! error or premature disconnect on either side, or a client-reported error.
//! The [`SessionManager`] mints sessions, indexes them by id, and evicts
//! them a TTL after they go inactive.
//!
//! Peers are bridged in either through the bounded-channel stream contract
//! ([`SourceStream::channel`], [`DestinationStream::channel`]) or by
//! adapting any `AsyncRead`/`AsyncWrite` pair
//! ([`SourceStream::from_reader`], [`DestinationStream::from_writer`]).
//! This crate is the library core only: no HTTP front-end, no byte
//! inspection, no multiplexing, no persistence.

#[macro_use]
extern crate tracing;

mod error;
mod io;
mod manager;
mod pipe;
mod session;
mod stream;

pub use self::error::{ClientError, EndpointKind, RegisterError, TransferError};
pub use self::io::DEFAULT_CHANNEL_CAPACITY;
pub use self::manager::{SessionManager, SessionManagerConfig};
pub use self::session::{EventKind, Session, SessionEvent, SessionSnapshot, SessionState};
pub use self::stream::{
    DestinationReceiver, DestinationSignal, DestinationStream, SourceFrame, SourceSender, SourceStream, StreamReleased,
};
