use core::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{ClientError, EndpointKind, RegisterError, TransferError};
use crate::pipe::{self, ChildTask, PipeOutcome};
use crate::stream::{DestinationStream, SourceStream};

/// Where a session stands in its lifecycle.
///
/// The labels ([`SessionState::as_str`], `Display`, serde) are the
/// observable surface for logs and management APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Initial; neither endpoint attached.
    Created,
    /// Source attached, destination not.
    SourceConnected,
    /// Destination attached, source not.
    DestinationConnected,
    /// Both attached; bytes may be flowing.
    Streaming,
    /// Source signaled end-of-stream and the destination drained.
    Finished,
    /// Deadline elapsed with neither endpoint attached.
    TimeoutNoSourceNoDestination,
    /// Deadline elapsed with only the source attached.
    TimeoutNoDestination,
    /// Deadline elapsed with only the destination attached.
    TimeoutNoSource,
    /// The source stream failed while streaming.
    SourceError,
    /// The destination stream failed while streaming.
    DestinationError,
    /// The source went away before signaling end-of-stream.
    SourceDisconnected,
    /// The destination went away before draining.
    DestinationDisconnected,
    /// An out-of-band client error was registered.
    ClientError,
}

impl SessionState {
    /// Terminal states admit no further transitions and no further events.
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            SessionState::Created
                | SessionState::SourceConnected
                | SessionState::DestinationConnected
                | SessionState::Streaming
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Created => "CREATED",
            SessionState::SourceConnected => "SRC_CONNECTED",
            SessionState::DestinationConnected => "DST_CONNECTED",
            SessionState::Streaming => "STREAMING",
            SessionState::Finished => "FINISHED",
            SessionState::TimeoutNoSourceNoDestination => "TIMEOUT_NO_SRC_NO_DST",
            SessionState::TimeoutNoDestination => "TIMEOUT_NO_DST",
            SessionState::TimeoutNoSource => "TIMEOUT_NO_SRC",
            SessionState::SourceError => "SRC_ERROR",
            SessionState::DestinationError => "DST_ERROR",
            SessionState::SourceDisconnected => "SRC_DISCONNECTED",
            SessionState::DestinationDisconnected => "DST_DISCONNECTED",
            SessionState::ClientError => "CLIENT_ERROR",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for SessionState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

/// Terminal lifecycle event delivered to subscribed observers.
///
/// Each session delivers at most one of these, ever.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// End-of-stream reached and the destination drained.
    Finished,
    /// Deadline elapsed before streaming began.
    Timeout,
    /// The transfer failed; the payload carries the classification.
    Error(TransferError),
    /// An out-of-band client error was registered.
    ClientError(ClientError),
}

impl SessionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SessionEvent::Finished => EventKind::Finished,
            SessionEvent::Timeout => EventKind::Timeout,
            SessionEvent::Error(_) => EventKind::Error,
            SessionEvent::ClientError(_) => EventKind::ClientError,
        }
    }
}

/// Event families observers may subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Finished,
    Timeout,
    Error,
    ClientError,
}

enum Handler {
    Every(Box<dyn FnMut(&SessionEvent) + Send>),
    Once(Box<dyn FnOnce(&SessionEvent) + Send>),
}

impl Handler {
    fn invoke(self, event: &SessionEvent) {
        match self {
            Handler::Every(mut handler) => handler(event),
            Handler::Once(handler) => handler(event),
        }
    }
}

struct Subscription {
    kind: EventKind,
    handler: Handler,
}

/// One source↔destination pairing tracked through its state machine.
///
/// Cheap to clone; all clones observe the same session. Every state
/// transition is serialized behind one lock, so concurrent signals (a
/// deadline firing against a registration, racing stream failures) can never
/// interleave half a transition: the first terminal signal wins and all
/// later ones are suppressed.
pub struct Session {
    shared: Arc<Shared>,
}

struct Shared {
    id: Uuid,
    created_at: OffsetDateTime,
    deadline: Instant,
    bytes_transferred: AtomicU64,
    active: AtomicBool,
    disarm: Notify,
    lifecycle: Mutex<Lifecycle>,
}

struct Lifecycle {
    state: SessionState,
    source: Option<SourceStream>,
    destination: Option<DestinationStream>,
    client_error: Option<ClientError>,
    subscriptions: Vec<Subscription>,
    pump: Option<ChildTask<()>>,
    released: bool,
    on_inactive: Option<Box<dyn FnOnce(Uuid) + Send>>,
}

impl Clone for Session {
    fn clone(&self) -> Self {
        Session {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Mint a session whose deadline elapses after `ttl`.
    ///
    /// `on_inactive` fires exactly once, when the session releases its
    /// resources. Must be called within a Tokio runtime: the deadline timer
    /// is spawned immediately.
    pub(crate) fn new(ttl: Duration, on_inactive: Box<dyn FnOnce(Uuid) + Send>) -> Session {
        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            created_at: OffsetDateTime::now_utc(),
            deadline: Instant::now() + ttl,
            bytes_transferred: AtomicU64::new(0),
            active: AtomicBool::new(true),
            disarm: Notify::new(),
            lifecycle: Mutex::new(Lifecycle {
                state: SessionState::Created,
                source: None,
                destination: None,
                client_error: None,
                subscriptions: Vec::new(),
                pump: None,
                released: false,
                on_inactive: Some(on_inactive),
            }),
        });

        let session = Session { shared };
        session.arm_deadline();
        session
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn state(&self) -> SessionState {
        self.shared.lifecycle.lock().state
    }

    /// Bytes accepted into the destination's outbound channel so far.
    ///
    /// Non-decreasing; advances only while streaming. Once the session is
    /// `FINISHED` this equals the bytes the destination consumed, but while
    /// blocks are still buffered (or after a failure) the count can lead
    /// what the consumer actually took.
    pub fn bytes_transferred(&self) -> u64 {
        self.shared.bytes_transferred.load(Ordering::SeqCst)
    }

    /// `false` once the session released its resources.
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    pub fn client_error(&self) -> Option<ClientError> {
        self.shared.lifecycle.lock().client_error.clone()
    }

    pub fn created_at(&self) -> OffsetDateTime {
        self.shared.created_at
    }

    /// Subscribe `handler` to every future event of `kind`.
    ///
    /// Handlers run synchronously in the thread driving the terminal
    /// transition, before the session releases its resources. Subscribing to
    /// an already-released session is a no-op.
    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: FnMut(&SessionEvent) + Send + 'static,
    {
        self.subscribe(kind, Handler::Every(Box::new(handler)));
    }

    /// Subscribe `handler` to the next event of `kind` only.
    pub fn once<F>(&self, kind: EventKind, handler: F)
    where
        F: FnOnce(&SessionEvent) + Send + 'static,
    {
        self.subscribe(kind, Handler::Once(Box::new(handler)));
    }

    fn subscribe(&self, kind: EventKind, handler: Handler) {
        let mut lifecycle = self.shared.lifecycle.lock();

        if lifecycle.released {
            // The terminal event already fired (or the session was
            // deactivated); nothing will ever be delivered.
            return;
        }

        lifecycle.subscriptions.push(Subscription { kind, handler });
    }

    /// Attach the producing stream.
    ///
    /// When this completes the pairing, the forwarding pump starts and the
    /// deadline timer is disarmed.
    pub fn register_source(&self, stream: SourceStream) -> Result<(), RegisterError> {
        let mut lifecycle = self.shared.lifecycle.lock();

        if lifecycle.released || lifecycle.state.is_terminal() {
            return Err(RegisterError::Inactive(self.shared.id));
        }

        match lifecycle.state {
            SessionState::Created => {
                lifecycle.source = Some(stream);
                lifecycle.state = SessionState::SourceConnected;
                debug!(session.id = %self.shared.id, "Source attached");
                Ok(())
            }
            SessionState::DestinationConnected => {
                lifecycle.source = Some(stream);
                self.start_streaming(&mut lifecycle);
                Ok(())
            }
            _ => Err(RegisterError::DuplicateEndpoint(EndpointKind::Source)),
        }
    }

    /// Attach the consuming stream. Symmetric to [`Session::register_source`].
    pub fn register_destination(&self, stream: DestinationStream) -> Result<(), RegisterError> {
        let mut lifecycle = self.shared.lifecycle.lock();

        if lifecycle.released || lifecycle.state.is_terminal() {
            return Err(RegisterError::Inactive(self.shared.id));
        }

        match lifecycle.state {
            SessionState::Created => {
                lifecycle.destination = Some(stream);
                lifecycle.state = SessionState::DestinationConnected;
                debug!(session.id = %self.shared.id, "Destination attached");
                Ok(())
            }
            SessionState::SourceConnected => {
                lifecycle.destination = Some(stream);
                self.start_streaming(&mut lifecycle);
                Ok(())
            }
            _ => Err(RegisterError::DuplicateEndpoint(EndpointKind::Destination)),
        }
    }

    /// Register an out-of-band error reported by the client.
    ///
    /// Valid in any non-terminal state: records the payload, fires
    /// `client_error` synchronously (every subscribed handler runs to
    /// completion before resources are released), and the session is
    /// inactive by the time this returns. Suppressed once a terminal state
    /// was reached.
    pub fn register_client_error(&self, error: ClientError) {
        self.emit_terminal(move |_| Some((SessionState::ClientError, SessionEvent::ClientError(error))));
    }

    /// Forcibly release the session's resources without emitting events.
    ///
    /// Safe from any state and idempotent. Races safely with the deadline
    /// timer and with stream signals: whichever reaches the state machine
    /// first wins.
    pub fn deactivate(&self) {
        trace!(session.id = %self.shared.id, "Deactivate requested");
        self.release();
    }

    /// Serializable view of the session for a management surface.
    pub fn snapshot(&self) -> SessionSnapshot {
        let lifecycle = self.shared.lifecycle.lock();

        SessionSnapshot {
            id: self.shared.id,
            state: lifecycle.state,
            bytes_transferred: self.bytes_transferred(),
            active: self.is_active(),
            created_at: self.shared.created_at,
            client_error: lifecycle.client_error.clone(),
        }
    }

    fn arm_deadline(&self) {
        let session = self.clone();

        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep_until(session.shared.deadline) => session.on_deadline(),
                () = session.shared.disarm.notified() => {}
            }
        });
    }

    fn on_deadline(&self) {
        self.emit_terminal(|state| {
            let verdict = match state {
                SessionState::Created => SessionState::TimeoutNoSourceNoDestination,
                SessionState::SourceConnected => SessionState::TimeoutNoDestination,
                SessionState::DestinationConnected => SessionState::TimeoutNoSource,
                // The disarm raced with the deadline; the session moved on.
                _ => return None,
            };
            Some((verdict, SessionEvent::Timeout))
        });
    }

    /// Wire the pump. Caller holds the lifecycle lock and both endpoints are
    /// parked.
    fn start_streaming(&self, lifecycle: &mut Lifecycle) {
        lifecycle.state = SessionState::Streaming;

        let source = lifecycle
            .source
            .take()
            .expect("both endpoints are parked on entry to streaming");
        let destination = lifecycle
            .destination
            .take()
            .expect("both endpoints are parked on entry to streaming");

        self.shared.disarm.notify_one();

        let session = self.clone();
        lifecycle.pump = Some(ChildTask::spawn(async move {
            let outcome = pipe::run(source, destination, &session.shared.bytes_transferred).await;
            session.complete(outcome);
        }));

        debug!(session.id = %self.shared.id, "Both endpoints attached; streaming");
    }

    fn complete(&self, outcome: PipeOutcome) {
        match outcome {
            PipeOutcome::Finished => {
                self.emit_terminal(|_| Some((SessionState::Finished, SessionEvent::Finished)));
            }
            PipeOutcome::Failed(error) => {
                let state = match &error {
                    TransferError::Source(_) => SessionState::SourceError,
                    TransferError::Destination(_) => SessionState::DestinationError,
                    TransferError::SourceDisconnected => SessionState::SourceDisconnected,
                    TransferError::DestinationDisconnected => SessionState::DestinationDisconnected,
                };
                self.emit_terminal(move |_| Some((state, SessionEvent::Error(error))));
            }
        }
    }

    /// Apply a terminal transition decided under the lifecycle lock, run the
    /// matching handlers, then release resources.
    ///
    /// At most one caller ever gets past the terminal check, which is what
    /// makes the terminal event unique.
    fn emit_terminal<F>(&self, decide: F)
    where
        F: FnOnce(SessionState) -> Option<(SessionState, SessionEvent)>,
    {
        let (state, event, handlers) = {
            let mut lifecycle = self.shared.lifecycle.lock();

            if lifecycle.released || lifecycle.state.is_terminal() {
                return;
            }

            let Some((state, event)) = decide(lifecycle.state) else {
                return;
            };
            debug_assert!(state.is_terminal());

            lifecycle.state = state;

            if let SessionEvent::ClientError(payload) = &event {
                lifecycle.client_error = Some(payload.clone());
            }

            let kind = event.kind();
            let (matching, remaining) = lifecycle
                .subscriptions
                .drain(..)
                .partition::<Vec<_>, _>(|subscription| subscription.kind == kind);
            lifecycle.subscriptions = remaining;

            (state, event, matching)
        };

        info!(session.id = %self.shared.id, %state, "Session reached terminal state");

        // Outside the lock, so handlers may query the session.
        for subscription in handlers {
            subscription.handler.invoke(&event);
        }

        self.release();
    }

    fn release(&self) {
        let (pump, source, destination, subscriptions, on_inactive) = {
            let mut lifecycle = self.shared.lifecycle.lock();

            if lifecycle.released {
                return;
            }
            lifecycle.released = true;

            (
                lifecycle.pump.take(),
                lifecycle.source.take(),
                lifecycle.destination.take(),
                std::mem::take(&mut lifecycle.subscriptions),
                lifecycle.on_inactive.take(),
            )
        };

        self.shared.disarm.notify_one();
        self.shared.active.store(false, Ordering::SeqCst);

        // Dropping the stream handles is the teardown signal for both peers,
        // and dropping the pump aborts any forwarding still in flight.
        drop((pump, source, destination, subscriptions));

        if let Some(notify) = on_inactive {
            notify(self.shared.id);
        }

        debug!(session.id = %self.shared.id, "Session resources released");
    }
}

/// Serializable view of a session, for surfacing over a management API.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub state: SessionState,
    pub bytes_transferred: u64,
    pub active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_error: Option<ClientError>,
}
