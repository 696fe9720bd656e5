//! Registry of live local sessions
//!
//! Teardown joins a worker thread and may wait on a peer connection close,
//! so every removal here hands the runner to the blocking pool.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::events::{EventBus, SystemEvent};
use crate::webrtc::{SessionInfo, SessionRunner};

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionRunner>>>,
    /// Slots held by sessions still negotiating; only raised under the write lock
    reserved: AtomicUsize,
    max_sessions: usize,
    events: Option<Arc<EventBus>>,
}

/// A session slot held while a session negotiates
///
/// Dropping the slot without inserting a runner frees it again.
pub struct SessionSlot<'a> {
    registry: &'a SessionRegistry,
}

impl Drop for SessionSlot<'_> {
    fn drop(&mut self) {
        self.registry.reserved.fetch_sub(1, Ordering::AcqRel);
    }
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            reserved: AtomicUsize::new(0),
            max_sessions: max_sessions.max(1),
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Claim a slot for a new session, failing fast when none is free
    ///
    /// Live sessions and outstanding slots are counted under one write lock,
    /// so concurrent requests can never claim more than `max_sessions`.
    pub fn reserve(&self) -> Result<SessionSlot<'_>> {
        let sessions = self.sessions.write();
        let live = sessions.values().filter(|s| !s.is_terminal()).count();
        if live + self.reserved.load(Ordering::Acquire) >= self.max_sessions {
            return Err(AppError::ServiceUnavailable(format!(
                "session limit reached ({})",
                self.max_sessions
            )));
        }
        self.reserved.fetch_add(1, Ordering::AcqRel);
        drop(sessions);
        Ok(SessionSlot { registry: self })
    }

    /// Register a negotiated session in the slot it reserved
    pub fn insert(&self, runner: Arc<SessionRunner>, slot: SessionSlot<'_>) {
        debug!("Registered session {}", runner.session_id());
        let mut sessions = self.sessions.write();
        sessions.insert(runner.session_id().to_string(), runner);
        drop(slot);
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<SessionRunner>> {
        self.sessions.read().get(session_id).cloned()
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut list: Vec<SessionInfo> = self.sessions.read().values().map(|s| s.info()).collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    fn remove(&self, session_id: &str) -> Option<Arc<SessionRunner>> {
        let removed = self.sessions.write().remove(session_id);
        if removed.is_some() {
            if let Some(events) = &self.events {
                events.publish(SystemEvent::SessionRemoved {
                    session_id: session_id.to_string(),
                });
            }
        }
        removed
    }

    /// Close and forget one session
    pub async fn close(&self, session_id: &str) -> Result<()> {
        let runner = self
            .remove(session_id)
            .ok_or_else(|| AppError::NotFound(format!("session '{}'", session_id)))?;
        teardown_blocking(vec![runner]).await;
        info!("Session {} closed on request", session_id);
        Ok(())
    }

    /// Forget every session in a terminal state; returns how many
    pub async fn reap(&self) -> usize {
        let terminal: Vec<String> = self
            .sessions
            .read()
            .iter()
            .filter(|(_, s)| s.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();

        let runners: Vec<_> = terminal.iter().filter_map(|id| self.remove(id)).collect();
        let count = runners.len();
        if count > 0 {
            teardown_blocking(runners).await;
            debug!("Reaped {} terminal sessions", count);
        }
        count
    }

    /// Close all sessions, used on shutdown
    pub async fn close_all(&self) {
        let runners: Vec<_> = self.sessions.write().drain().map(|(_, s)| s).collect();
        if runners.is_empty() {
            return;
        }
        info!("Closing {} sessions", runners.len());
        teardown_blocking(runners).await;
    }
}

async fn teardown_blocking(runners: Vec<Arc<SessionRunner>>) {
    let closed = tokio::task::spawn_blocking(move || {
        for runner in &runners {
            runner.teardown();
        }
        // Last references drop here, off the async workers
        drop(runners);
    })
    .await;
    if let Err(e) = closed {
        warn!("Session teardown task failed: {}", e);
    }
}

/// Remove sessions as soon as they end, plus a periodic sweep
pub async fn run_reaper(
    registry: Arc<SessionRegistry>,
    events: Arc<EventBus>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut rx = events.subscribe();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                registry.reap().await;
            }
            event = rx.recv() => match event {
                Ok(event) => {
                    if event.terminal_session().is_some() {
                        registry.reap().await;
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    debug!("Reaper lagged by {} events, sweeping", n);
                    registry.reap().await;
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    debug!("Session reaper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::source::testing::{source, FakeOpener};
    use crate::webrtc::{SessionContext, SessionState, WebRtcConfig};
    use tokio_test::{assert_err, assert_ok};

    fn runner() -> Arc<SessionRunner> {
        let ctx = SessionContext::new(
            source(Arc::new(FakeOpener::new(vec![]))),
            WebRtcConfig::default(),
        );
        Arc::new(SessionRunner::new("cam", ctx))
    }

    fn add(registry: &SessionRegistry, runner: Arc<SessionRunner>) {
        let slot = assert_ok!(registry.reserve());
        registry.insert(runner, slot);
    }

    #[tokio::test]
    async fn test_capacity_counts_live_sessions() {
        let registry = SessionRegistry::new(1);
        let first = runner();
        add(&registry, first.clone());
        assert!(matches!(
            registry.reserve(),
            Err(AppError::ServiceUnavailable(_))
        ));

        let closing = first.clone();
        tokio::task::spawn_blocking(move || closing.teardown())
            .await
            .unwrap();
        assert_ok!(registry.reserve());
    }

    #[tokio::test]
    async fn test_pending_slots_count_against_limit() {
        let registry = SessionRegistry::new(2);
        let first = assert_ok!(registry.reserve());
        let second = assert_ok!(registry.reserve());
        // Neither has a runner yet, the limit still holds
        assert!(matches!(
            registry.reserve(),
            Err(AppError::ServiceUnavailable(_))
        ));

        // A failed negotiation gives its slot back
        drop(first);
        registry.insert(runner(), second);
        let third = assert_ok!(registry.reserve());
        assert!(registry.reserve().is_err());
        drop(third);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reservations_respect_limit() {
        let registry = Arc::new(SessionRegistry::new(3));
        let barrier = Arc::new(std::sync::Barrier::new(16));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                tokio::task::spawn_blocking(move || {
                    barrier.wait();
                    match registry.reserve() {
                        Ok(slot) => {
                            std::thread::sleep(Duration::from_millis(50));
                            registry.insert(runner(), slot);
                            true
                        }
                        Err(_) => false,
                    }
                })
            })
            .collect();

        let mut granted = 0;
        for task in tasks {
            if task.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 3);
        assert_eq!(registry.len(), 3);
        registry.close_all().await;
    }

    #[tokio::test]
    async fn test_reap_removes_terminal_sessions() {
        let events = Arc::new(EventBus::new());
        let registry = SessionRegistry::new(4).with_events(events.clone());
        let mut rx = events.subscribe();

        let live = runner();
        let dead = runner();
        add(&registry, live.clone());
        add(&registry, dead.clone());

        let closing = dead.clone();
        tokio::task::spawn_blocking(move || closing.teardown())
            .await
            .unwrap();
        assert_eq!(dead.state(), SessionState::Closed);

        assert_eq!(registry.reap().await, 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(live.session_id()).is_some());
        assert!(matches!(
            rx.recv().await.unwrap(),
            SystemEvent::SessionRemoved { .. }
        ));
    }

    #[tokio::test]
    async fn test_close_unknown_session() {
        let registry = SessionRegistry::new(4);
        let err = assert_err!(registry.close("nope").await);
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = SessionRegistry::new(4);
        let a = runner();
        add(&registry, a.clone());
        add(&registry, runner());
        registry.close_all().await;
        assert!(registry.is_empty());
        assert_eq!(a.state(), SessionState::Closed);
        assert_eq!(registry.list().len(), 0);
    }

    #[tokio::test]
    async fn test_reaper_reacts_to_terminal_events() {
        let events = Arc::new(EventBus::new());
        let registry = Arc::new(SessionRegistry::new(4));
        let shutdown = CancellationToken::new();
        let reaper = tokio::spawn(run_reaper(
            registry.clone(),
            events.clone(),
            Duration::from_secs(3600),
            shutdown.clone(),
        ));

        let ctx = SessionContext::new(
            source(Arc::new(FakeOpener::new(vec![]))),
            WebRtcConfig::default(),
        )
        .with_events(events.clone());
        let session = Arc::new(SessionRunner::new("cam", ctx));
        add(&registry, session.clone());
        // Let the reaper finish its first sweep
        tokio::time::sleep(Duration::from_millis(50)).await;

        let closing = session.clone();
        tokio::task::spawn_blocking(move || closing.teardown())
            .await
            .unwrap();

        for _ in 0..100 {
            if registry.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(registry.is_empty());

        shutdown.cancel();
        reaper.await.unwrap();
    }
}
