use core::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Which endpoint slot of a session a registration targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Source,
    Destination,
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointKind::Source => write!(f, "Source"),
            EndpointKind::Destination => write!(f, "Destination"),
        }
    }
}

/// Synchronous failure of a registration call.
///
/// The session state is unchanged and no event fires.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegisterError {
    /// An endpoint of this kind is already attached to the session.
    #[error("{0} already registered")]
    DuplicateEndpoint(EndpointKind),
    /// The session reached a terminal state or was deactivated.
    #[error("session {0} is no longer active")]
    Inactive(Uuid),
}

/// Failure observed while bytes were flowing, delivered through the `error`
/// event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    /// The source stream failed before signaling end-of-stream.
    #[error("Source error: {0}")]
    Source(String),
    /// The destination stream failed while accepting or flushing bytes.
    #[error("Destination error: {0}")]
    Destination(String),
    /// The source went away without signaling end-of-stream.
    #[error("Source disconnected before end")]
    SourceDisconnected,
    /// The destination went away before draining.
    #[error("Destination disconnected before end")]
    DestinationDisconnected,
}

/// Out-of-band error reported by a client against a session.
///
/// Recorded verbatim and handed back through the `client_error` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientError {
    pub http_status: u16,
    pub name: String,
    pub message: String,
}
