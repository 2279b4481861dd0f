// Persistence port: append + range query keyed by session
//
// The core only needs append semantics for sessions, artifacts, and points,
// plus session-scoped reads. The concrete durable store is out of scope; the
// in-memory implementation below backs tests and single-run deployments.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::api::{Artifact, Point, Session};

/// Narrow storage port for telemetry records
pub trait TelemetryStore: Send + Sync {
    /// Record a newly created session.
    fn append_session(&self, session: &Session);

    /// Replace the stored record after a status change.
    fn update_session(&self, session: &Session);

    /// Record a finalized artifact.
    fn append_artifact(&self, artifact: &Artifact);

    /// Append one ingested point for a session.
    fn append_point(&self, session_id: u64, point: &Point);

    fn session(&self, session_id: u64) -> Option<Session>;

    /// Most recent sessions, newest first.
    fn recent_sessions(&self, limit: usize) -> Vec<Session>;

    /// All points recorded for a session, in ingestion order.
    fn points(&self, session_id: u64) -> Vec<Point>;
}

/// In-memory reference implementation of the persistence port
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<u64, Session>,
    order: Vec<u64>,
    artifacts: Vec<Artifact>,
    points: HashMap<u64, Vec<Point>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn artifacts(&self, session_id: u64) -> Vec<Artifact> {
        let inner = self.inner.lock().expect("store poisoned");
        inner
            .artifacts
            .iter()
            .filter(|a| a.session_id == session_id)
            .cloned()
            .collect()
    }
}

impl TelemetryStore for InMemoryStore {
    fn append_session(&self, session: &Session) {
        let mut inner = self.inner.lock().expect("store poisoned");
        if inner.sessions.insert(session.id, session.clone()).is_none() {
            inner.order.push(session.id);
        }
    }

    fn update_session(&self, session: &Session) {
        let mut inner = self.inner.lock().expect("store poisoned");
        inner.sessions.insert(session.id, session.clone());
    }

    fn append_artifact(&self, artifact: &Artifact) {
        let mut inner = self.inner.lock().expect("store poisoned");
        inner.artifacts.push(artifact.clone());
    }

    fn append_point(&self, session_id: u64, point: &Point) {
        let mut inner = self.inner.lock().expect("store poisoned");
        inner.points.entry(session_id).or_default().push(*point);
    }

    fn session(&self, session_id: u64) -> Option<Session> {
        let inner = self.inner.lock().expect("store poisoned");
        inner.sessions.get(&session_id).cloned()
    }

    fn recent_sessions(&self, limit: usize) -> Vec<Session> {
        let inner = self.inner.lock().expect("store poisoned");
        inner
            .order
            .iter()
            .rev()
            .take(limit)
            .filter_map(|id| inner.sessions.get(id).cloned())
            .collect()
    }

    fn points(&self, session_id: u64) -> Vec<Point> {
        let inner = self.inner.lock().expect("store poisoned");
        inner.points.get(&session_id).cloned().unwrap_or_default()
    }
}
