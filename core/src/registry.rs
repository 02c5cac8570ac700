//! Process-wide mapping from puzzle name to its live session.
//!
//! Entries are created only by the connection path and removed only after
//! the last disconnect, once the final write has completed. Lock order is
//! always registry before session state, and the registry lock is never
//! held across disk IO, so unrelated puzzles proceed independently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::info;

use crate::session::{OutboundSink, Session};
use crate::store::PuzzleStore;

pub struct SessionRegistry {
    store: PuzzleStore,
    debounce: Duration,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new(store: PuzzleStore, debounce: Duration) -> Self {
        Self {
            store,
            debounce,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &PuzzleStore {
        &self.store
    }

    /// Look up or create the session for a puzzle name and register one
    /// participant on it. Returns `None` when the name is invalid or the
    /// backing document cannot be loaded; the caller rejects the
    /// connection.
    ///
    /// Registration happens under the registry lock, so a session handed
    /// out here always carries the new participant by the time
    /// [`SessionRegistry::disconnect`] can re-check emptiness. Without
    /// that, a connection arriving during the last disconnect's final
    /// write could register on a session already removed from the map and
    /// end up on an orphaned coordinator while a later connection creates
    /// a second one for the same puzzle.
    pub async fn join(&self, name: &str, outbound: OutboundSink) -> Option<(Arc<Session>, u64)> {
        if !PuzzleStore::valid_name(name) {
            return None;
        }
        {
            let sessions = self.sessions.lock().await;
            if let Some(session) = sessions.get(name) {
                let id = session.register(outbound).await;
                return Some((session.clone(), id));
            }
        }

        // Load outside the registry lock; on a creation race the first
        // insert wins and the extra document is discarded
        let doc = match self.store.read(name).await {
            Ok(doc) => doc,
            Err(e) => {
                info!(puzzle = %name, "refusing connection: {e}");
                return None;
            }
        };
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .entry(name.to_string())
            .or_insert_with(|| {
                info!(puzzle = %name, "session created");
                Session::spawn(name, doc, self.store.clone(), self.debounce)
            })
            .clone();
        let id = session.register(outbound).await;
        Some((session, id))
    }

    /// Drop one participant. The last disconnect triggers the final write
    /// and then removes the session, unless a new connection arrived in
    /// the meantime (the session stays registered until removal, so such
    /// a connection reuses the live document).
    pub async fn disconnect(&self, session: &Arc<Session>, id: u64) {
        if !session.remove_participant(id).await {
            return;
        }
        session.final_save().await;

        let mut sessions = self.sessions.lock().await;
        if session.is_empty().await {
            sessions.remove(session.name());
            info!(puzzle = %session.name(), "session destroyed");
        }
    }

    pub async fn active_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }
}
