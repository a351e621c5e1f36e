//! Registry of live terminal sessions.
//!
//! The registry is the only state shared between sessions. Each bridge
//! inserts its own handle once the shell is running and removes it during
//! teardown; everything else only reads.

use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::time::SystemTime;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use nexus_protocol::TerminalSize;
use thiserror::Error;
use uuid::Uuid;

use super::state::SessionState;

/// Unique identifier for a session.
pub type SessionId = String;

/// Generates a fresh session identifier.
pub fn new_session_id() -> SessionId {
    Uuid::new_v4().to_string()
}

/// Errors returned by registry operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    /// A session with this id is already registered.
    #[error("session id already registered: {0}")]
    Duplicate(SessionId),
}

/// Error returned when a lifecycle transition is not allowed.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid session state transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub to: SessionState,
}

/// Shared view of one live session.
///
/// Owned by the session's bridge; the registry holds a second reference for
/// lookups. Only the owning bridge mutates it.
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    pid: OnceLock<u32>,
    shell: String,
    created_at: SystemTime,
    size: RwLock<TerminalSize>,
    state: RwLock<SessionState>,
}

impl SessionHandle {
    /// Creates a handle in the `Starting` state.
    pub fn new(
        id: SessionId,
        pid: Option<u32>,
        shell: impl Into<String>,
        size: TerminalSize,
    ) -> Self {
        let cell = OnceLock::new();
        if let Some(pid) = pid {
            let _ = cell.set(pid);
        }
        Self {
            id,
            pid: cell,
            shell: shell.into(),
            created_at: SystemTime::now(),
            size: RwLock::new(size),
            state: RwLock::new(SessionState::Starting),
        }
    }

    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the process ID of the shell, if the platform reported one.
    pub fn pid(&self) -> Option<u32> {
        self.pid.get().copied()
    }

    /// Records the shell's process id once it has been spawned. Later calls
    /// are ignored.
    pub fn set_pid(&self, pid: u32) {
        let _ = self.pid.set(pid);
    }

    /// Returns the shell executable.
    pub fn shell(&self) -> &str {
        &self.shell
    }

    /// Returns the current terminal size.
    pub fn size(&self) -> TerminalSize {
        *self.size.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a new terminal size.
    pub fn set_size(&self, size: TerminalSize) {
        *self.size.write().unwrap_or_else(PoisonError::into_inner) = size;
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves the session to `next`, rejecting illegal transitions.
    pub fn transition(&self, next: SessionState) -> Result<(), InvalidTransition> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let from = *state;
        if !from.can_transition_to(next) {
            return Err(InvalidTransition { from, to: next });
        }

        tracing::debug!(session_id = %self.id, from = %from, to = %next, "Session state change");
        *state = next;
        Ok(())
    }

    /// Takes a point-in-time snapshot.
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            pid: self.pid(),
            shell: self.shell.clone(),
            created_at: self.created_at,
            size: self.size(),
            state: self.state(),
        }
    }
}

/// Information about a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Unique session identifier.
    pub id: SessionId,
    /// Process ID of the shell.
    pub pid: Option<u32>,
    /// Shell executable.
    pub shell: String,
    /// When the session was created.
    pub created_at: SystemTime,
    /// Current terminal size.
    pub size: TerminalSize,
    /// Current lifecycle state.
    pub state: SessionState,
}

/// Thread-safe session registry using DashMap.
///
/// Register and unregister on the same id are serialized by the map's shard
/// lock; reads never block each other.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<SessionHandle>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a session. Never overwrites an existing entry.
    pub fn register(&self, handle: Arc<SessionHandle>) -> Result<(), RegistryError> {
        match self.sessions.entry(handle.id().clone()) {
            Entry::Occupied(entry) => Err(RegistryError::Duplicate(entry.key().clone())),
            Entry::Vacant(entry) => {
                tracing::debug!(session_id = %handle.id(), "Registered session");
                entry.insert(handle);
                Ok(())
            }
        }
    }

    /// Removes a session. Returns whether an entry was removed.
    pub fn unregister(&self, id: &str) -> bool {
        let removed = self.sessions.remove(id).is_some();
        if removed {
            tracing::debug!(session_id = %id, "Unregistered session");
        }
        removed
    }

    /// Returns a snapshot of one session.
    pub fn get(&self, id: &str) -> Option<SessionInfo> {
        self.sessions.get(id).map(|entry| entry.value().info())
    }

    /// Returns whether a session is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Lists all registered sessions, in no particular order.
    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions.iter().map(|entry| entry.value().info()).collect()
    }

    /// Returns the number of registered sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn handle(id: &str) -> Arc<SessionHandle> {
        Arc::new(SessionHandle::new(
            id.to_string(),
            Some(42),
            "bash",
            TerminalSize::default(),
        ))
    }

    #[test]
    fn test_session_id_generation() {
        let ids: HashSet<_> = (0..100).map(|_| new_session_id()).collect();
        assert_eq!(ids.len(), 100);
        assert!(ids.iter().all(|id| id.len() == 36));
    }

    #[test]
    fn test_register_and_get() {
        let registry = SessionRegistry::new();
        registry.register(handle("a")).unwrap();

        let info = registry.get("a").unwrap();
        assert_eq!(info.id, "a");
        assert_eq!(info.pid, Some(42));
        assert_eq!(info.shell, "bash");
        assert_eq!(info.size, TerminalSize::default());
        assert_eq!(info.state, SessionState::Starting);
        assert!(registry.contains("a"));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_set_pid_once() {
        let handle = SessionHandle::new("p".to_string(), None, "sh", TerminalSize::default());
        assert_eq!(handle.pid(), None);

        handle.set_pid(100);
        handle.set_pid(200);
        assert_eq!(handle.pid(), Some(100));
        assert_eq!(handle.info().pid, Some(100));
    }

    #[test]
    fn test_register_duplicate_rejected() {
        let registry = SessionRegistry::new();
        let first = handle("dup");
        registry.register(Arc::clone(&first)).unwrap();

        let second = Arc::new(SessionHandle::new(
            "dup".to_string(),
            Some(7),
            "sh",
            TerminalSize::default(),
        ));
        assert_eq!(
            registry.register(second),
            Err(RegistryError::Duplicate("dup".to_string()))
        );

        // Original entry untouched
        assert_eq!(registry.get("dup").unwrap().pid, Some(42));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_unregister_idempotent() {
        let registry = SessionRegistry::new();
        registry.register(handle("a")).unwrap();

        assert!(registry.unregister("a"));
        assert!(!registry.unregister("a"));
        assert!(!registry.unregister("never-existed"));
        assert!(registry.get("a").is_none());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_list() {
        let registry = SessionRegistry::new();
        registry.register(handle("a")).unwrap();
        registry.register(handle("b")).unwrap();

        let mut ids: Vec<_> = registry.list().into_iter().map(|info| info.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_handle_updates_visible_through_registry() {
        let registry = SessionRegistry::new();
        let h = handle("a");
        registry.register(Arc::clone(&h)).unwrap();

        h.transition(SessionState::Active).unwrap();
        h.set_size(TerminalSize { cols: 120, rows: 40 });

        let info = registry.get("a").unwrap();
        assert_eq!(info.state, SessionState::Active);
        assert_eq!(info.size, TerminalSize { cols: 120, rows: 40 });
    }

    #[test]
    fn test_handle_rejects_invalid_transition() {
        let h = handle("a");
        assert_eq!(
            h.transition(SessionState::Closed),
            Err(InvalidTransition {
                from: SessionState::Starting,
                to: SessionState::Closed,
            })
        );
        assert_eq!(h.state(), SessionState::Starting);
    }

    #[test]
    fn test_concurrent_register() {
        let registry = Arc::new(SessionRegistry::new());
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for j in 0..50 {
                        registry.register(handle(&format!("{i}-{j}"))).unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(registry.count(), 400);
    }
}
