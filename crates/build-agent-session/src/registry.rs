//! Context name to session map.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use build_agent_pty::Spawner;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{
    config::SessionConfig,
    event::{EventFeed, SessionEvent},
    session::Session,
};

struct Inner {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    config: Arc<SessionConfig>,
    spawner: Arc<dyn Spawner>,
    feed: Option<EventFeed>,
}

impl Inner {
    fn remove_if_same(&self, context: &str, session: &Session) {
        let mut sessions = self.sessions.lock();
        if sessions
            .get(context)
            .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), session))
        {
            sessions.remove(context);
            tracing::debug!(context, remaining = sessions.len(), "Session unregistered");
        }
    }
}

/// Registry of live sessions.
///
/// At most one session exists per context. A destroyed session removes
/// itself, so the next lookup of its context creates a fresh one.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new(config: SessionConfig, spawner: Arc<dyn Spawner>) -> Self {
        Self::build(config, spawner, None)
    }

    /// Registry that also reports every status transition of every session
    /// on the returned feed.
    #[must_use]
    pub fn with_event_feed(
        config: SessionConfig,
        spawner: Arc<dyn Spawner>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (feed, events) = EventFeed::channel(capacity);
        (Self::build(config, spawner, Some(feed)), events)
    }

    fn build(config: SessionConfig, spawner: Arc<dyn Spawner>, feed: Option<EventFeed>) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: Mutex::new(HashMap::new()),
                config: Arc::new(config),
                spawner,
                feed,
            }),
        }
    }

    /// Settings applied to every session.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Session for `context`, created on first use.
    ///
    /// Concurrent callers for the same context get the same session.
    #[must_use]
    pub fn get_or_create(&self, context: &str) -> Arc<Session> {
        let mut sessions = self.inner.sessions.lock();
        let session = sessions.entry(context.to_string()).or_insert_with(|| {
            let registry = Arc::downgrade(&self.inner);
            let owned_context = context.to_string();
            Session::new(
                context,
                Arc::clone(&self.inner.config),
                Arc::clone(&self.inner.spawner),
                self.inner.feed.clone(),
                Some(Box::new(move |session: &Session| {
                    if let Some(registry) = Weak::upgrade(&registry) {
                        registry.remove_if_same(&owned_context, session);
                    }
                })),
            )
        });
        Arc::clone(session)
    }

    #[must_use]
    pub fn get(&self, context: &str) -> Option<Arc<Session>> {
        self.inner.sessions.lock().get(context).cloned()
    }

    /// Forget the session for `context` without destroying it. Safe to call
    /// for unknown contexts.
    pub fn remove(&self, context: &str) -> Option<Arc<Session>> {
        self.inner.sessions.lock().remove(context)
    }

    /// Known contexts, sorted.
    #[must_use]
    pub fn contexts(&self) -> Vec<String> {
        let mut contexts: Vec<String> = self.inner.sessions.lock().keys().cloned().collect();
        contexts.sort();
        contexts
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Kill every running task and destroy every session.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self.inner.sessions.lock().values().cloned().collect();
        tracing::info!(sessions = sessions.len(), "Shutting down sessions");
        for session in sessions {
            session.terminate();
            session.destroy().await;
        }
    }
}
