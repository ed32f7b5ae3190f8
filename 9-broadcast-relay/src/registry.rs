use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tracing::debug;

use crate::{
    codec::Message,
    session::{SessionHandle, SessionId},
};

/// Outcome of one fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

/// The set of currently connected sessions.
///
/// Every operation holds one lock for its whole duration. Broadcasting only
/// queues frames, so holding the lock while visiting every recipient is cheap
/// and a session is never half-visited.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<SessionId, SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, SessionHandle>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a session. Returns `false` if it was already registered.
    pub fn register(&self, session: SessionHandle) -> bool {
        self.lock().insert(session.id(), session).is_none()
    }

    /// Removes a session. Safe to call for a session that is already gone.
    pub fn unregister(&self, id: SessionId) -> Option<SessionHandle> {
        self.lock().remove(&id)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Sends `message` to every registered session except `sender`.
    ///
    /// A recipient whose transport is already gone is skipped; its own
    /// teardown is responsible for unregistering it.
    pub fn broadcast_except(&self, sender: SessionId, message: &Message) -> BroadcastReport {
        let frame = message.encode();
        let sessions = self.lock();
        let mut report = BroadcastReport::default();

        for (id, session) in sessions.iter().filter(|(id, _)| **id != sender) {
            match session.send_frame(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(error) => {
                    debug!(session = %id, ?error, "skipping recipient during broadcast");
                    report.failed += 1;
                }
            }
        }

        report
    }

    /// Asks every registered session to close. Sessions unregister themselves
    /// as their connections wind down.
    pub fn close_all(&self) -> usize {
        let sessions = self.lock();
        for session in sessions.values() {
            session.close();
        }
        sessions.len()
    }
}
