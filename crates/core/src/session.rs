//! Viewer session tracking.
//!
//! A [`ViewerSession`] is created when the transport layer reports a
//! connect and removed on disconnect or by the periodic inactivity sweep.
//! The sweep exists because transport-level disconnect notifications are
//! not guaranteed for all failure modes (a silent network partition never
//! produces one). Every live session references exactly one mount and the
//! pipeline instance it attached to.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Default inactivity timeout before the sweep reclaims a session.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(10);

/// One connected viewer's attachment to a mount.
#[derive(Debug)]
pub struct ViewerSession {
    /// Unique session identifier (16-char hex string).
    pub id: String,
    /// Viewer's remote address.
    pub ip: IpAddr,
    /// Mount path this session is attached to.
    pub mount_path: String,
    /// Pipeline instance this session holds a reference on.
    pub instance_id: String,
    /// When the viewer attached.
    pub attached_at: Instant,
    /// Last time any activity was seen from the viewer.
    last_activity: RwLock<Instant>,
}

impl ViewerSession {
    fn new(mount_path: &str, ip: IpAddr, instance_id: &str, now: Instant) -> Self {
        let id = SESSION_COUNTER.fetch_add(1, Ordering::SeqCst);
        Self {
            id: format!("{id:016X}"),
            ip,
            mount_path: mount_path.to_string(),
            instance_id: instance_id.to_string(),
            attached_at: now,
            last_activity: RwLock::new(now),
        }
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.read()
    }

    fn set_last_activity(&self, now: Instant) {
        *self.last_activity.write() = now;
    }
}

/// Registry of live viewer sessions.
#[derive(Clone)]
pub struct SessionTable {
    sessions: Arc<RwLock<HashMap<String, Arc<ViewerSession>>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a session for a viewer attached to `instance_id` on
    /// `mount_path`.
    pub fn create(&self, mount_path: &str, ip: IpAddr, instance_id: &str) -> Arc<ViewerSession> {
        self.create_at(mount_path, ip, instance_id, Instant::now())
    }

    pub fn create_at(
        &self,
        mount_path: &str,
        ip: IpAddr,
        instance_id: &str,
        now: Instant,
    ) -> Arc<ViewerSession> {
        let session = Arc::new(ViewerSession::new(mount_path, ip, instance_id, now));
        self.sessions
            .write()
            .insert(session.id.clone(), session.clone());

        let total = self.sessions.read().len();
        tracing::debug!(
            session_id = %session.id,
            mount = mount_path,
            ip = %ip,
            total_sessions = total,
            "session created"
        );
        session
    }

    pub fn get(&self, id: &str) -> Option<Arc<ViewerSession>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Record viewer activity, deferring the inactivity sweep.
    pub fn touch(&self, id: &str) {
        self.touch_at(id, Instant::now());
    }

    pub fn touch_at(&self, id: &str, now: Instant) {
        if let Some(session) = self.get(id) {
            session.set_last_activity(now);
        }
    }

    /// Remove a session. Idempotent: removing an unknown or already-removed
    /// session returns `None` and is not an error.
    pub fn remove(&self, id: &str) -> Option<Arc<ViewerSession>> {
        let removed = self.sessions.write().remove(id);
        if let Some(session) = &removed {
            tracing::debug!(session_id = %session.id, "session removed");
        }
        removed
    }

    /// Remove every session referencing a pipeline instance (force
    /// disconnect after an engine failure).
    pub fn remove_by_instance(&self, instance_id: &str) -> Vec<Arc<ViewerSession>> {
        let mut sessions = self.sessions.write();
        let victims: Vec<String> = sessions
            .values()
            .filter(|s| s.instance_id == instance_id)
            .map(|s| s.id.clone())
            .collect();
        let removed: Vec<_> = victims.iter().filter_map(|id| sessions.remove(id)).collect();
        if !removed.is_empty() {
            tracing::info!(
                instance_id,
                removed = removed.len(),
                "sessions force-disconnected"
            );
        }
        removed
    }

    /// Reclaim sessions idle for longer than `timeout`.
    ///
    /// Each expired session is removed exactly once; the caller emits the
    /// matching disconnect event and releases the instance reference.
    pub fn sweep(&self, now: Instant, timeout: Duration) -> Vec<Arc<ViewerSession>> {
        let expired: Vec<String> = self
            .sessions
            .read()
            .values()
            .filter(|s| now.saturating_duration_since(s.last_activity()) > timeout)
            .map(|s| s.id.clone())
            .collect();

        let mut sessions = self.sessions.write();
        let reclaimed: Vec<_> = expired.iter().filter_map(|id| sessions.remove(id)).collect();
        if !reclaimed.is_empty() {
            tracing::info!(
                reclaimed = reclaimed.len(),
                remaining = sessions.len(),
                "expired sessions reclaimed"
            );
        }
        reclaimed
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}
