use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::session::{Session, SessionSnapshot};

const DEFAULT_SESSION_TTL: Duration = Duration::from_millis(30_000);

/// Session manager configuration.
#[derive(Debug, Clone, TypedBuilder)]
pub struct SessionManagerConfig {
    /// How long a session may wait for its missing endpoint(s) before timing
    /// out, and how long an inactive session stays indexed before
    /// destruction.
    #[builder(default = DEFAULT_SESSION_TTL)]
    pub session_ttl: Duration,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        SessionManagerConfig::builder().build()
    }
}

/// Registry that mints sessions, indexes them by id, and garbage-collects
/// them once they go inactive.
#[derive(Debug)]
pub struct SessionManager {
    shared: Arc<ManagerShared>,
}

#[derive(Debug)]
struct ManagerShared {
    config: SessionManagerConfig,
    sessions: Mutex<HashMap<Uuid, Session>>,
}

impl Clone for SessionManager {
    fn clone(&self) -> Self {
        SessionManager {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl SessionManager {
    pub fn new(config: SessionManagerConfig) -> Self {
        SessionManager {
            shared: Arc::new(ManagerShared {
                config,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Mint a session bound to this manager's TTL and index it.
    ///
    /// Must be called within a Tokio runtime: the session arms its deadline
    /// timer immediately.
    pub fn create_session(&self) -> Session {
        let shared = Arc::downgrade(&self.shared);
        let session = Session::new(
            self.shared.config.session_ttl,
            Box::new(move |id| schedule_removal(&shared, id)),
        );

        self.shared.sessions.lock().insert(session.id(), session.clone());
        debug!(session.id = %session.id(), "Session created");

        session
    }

    /// Live session for `id`.
    ///
    /// Inactive sessions are invisible immediately, even while still indexed
    /// awaiting destruction.
    pub fn get_session(&self, id: Uuid) -> Option<Session> {
        self.shared
            .sessions
            .lock()
            .get(&id)
            .filter(|session| session.is_active())
            .cloned()
    }

    /// Number of indexed sessions, including inactive ones whose destruction
    /// is still pending.
    pub fn session_count(&self) -> usize {
        self.shared.sessions.lock().len()
    }

    /// Snapshots of every active session.
    pub fn active_sessions(&self) -> Vec<SessionSnapshot> {
        self.shared
            .sessions
            .lock()
            .values()
            .filter(|session| session.is_active())
            .map(Session::snapshot)
            .collect()
    }
}

/// Evict `id` from the index once the TTL elapses.
///
/// Lookup visibility is not affected: the session is already invisible by
/// the time this is scheduled. Outside a runtime the eviction is skipped;
/// the index entry then lives as long as the manager.
fn schedule_removal(shared: &Weak<ManagerShared>, id: Uuid) {
    let Some(shared) = shared.upgrade() else {
        return;
    };

    let ttl = shared.config.session_ttl;

    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
        runtime.spawn(async move {
            tokio::time::sleep(ttl).await;

            if shared.sessions.lock().remove(&id).is_some() {
                debug!(session.id = %id, "Inactive session removed from the index");
            }
        });
    }
}
