//! Registry of in-flight connections that may be interrupted
//!
//! An orchestrator racing several establishment attempts closes every
//! pending connection once it has the tunnel it needs. Only direct dials
//! are registered here.

use super::CloseHandle;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct PendingState {
    closed: bool,
    conns: Vec<CloseHandle>,
}

/// Interruptible pending connections
#[derive(Default)]
pub struct PendingConns {
    state: Mutex<PendingState>,
}

impl PendingConns {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a connection
    ///
    /// Returns `false` once [`close_all`](Self::close_all) has run; the
    /// caller must then abandon the connection.
    pub fn add(&self, handle: &CloseHandle) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.conns.push(handle.clone());
        true
    }

    pub fn remove(&self, handle: &CloseHandle) {
        self.lock().conns.retain(|c| !c.same_as(handle));
    }

    /// Interrupt every pending connection and refuse new ones
    pub fn close_all(&self) {
        let conns = {
            let mut state = self.lock();
            state.closed = true;
            std::mem::take(&mut state.conns)
        };
        for conn in conns {
            conn.close();
        }
    }

    /// Accept registrations again after [`close_all`](Self::close_all)
    pub fn reset(&self) {
        self.lock().closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, PendingState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Removes a connection from the registry when dropped
pub struct PendingRemoval {
    registry: Arc<PendingConns>,
    handle: CloseHandle,
}

impl PendingRemoval {
    pub fn new(registry: Arc<PendingConns>, handle: CloseHandle) -> Self {
        Self { registry, handle }
    }
}

impl Drop for PendingRemoval {
    fn drop(&mut self) {
        self.registry.remove(&self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_all_interrupts() {
        let pending = PendingConns::new();
        let a = CloseHandle::new();
        let b = CloseHandle::new();
        assert!(pending.add(&a));
        assert!(pending.add(&b));
        assert_eq!(pending.len(), 2);

        pending.close_all();
        assert!(a.is_closed());
        assert!(b.is_closed());
        assert!(pending.is_empty());

        // refused until reset
        let c = CloseHandle::new();
        assert!(!pending.add(&c));
        pending.reset();
        assert!(pending.add(&c));
    }

    #[test]
    fn test_removal_guard() {
        let pending = PendingConns::new();
        let handle = CloseHandle::new();
        pending.add(&handle);
        drop(PendingRemoval::new(pending.clone(), handle.clone()));
        assert!(pending.is_empty());
        assert!(!handle.is_closed());
    }
}
