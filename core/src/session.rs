//! Session coordinator: the in-memory authority for one puzzle's live state.
//!
//! All mutations of one session go through its state mutex, so merge,
//! broadcast, and participant bookkeeping are serialized per puzzle while
//! unrelated puzzles proceed independently. Persistence runs on a
//! dedicated background task per session (debounced, atomic replace) which
//! awaits each write before selecting again, so writes never overlap.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::model::{merge_grid, parse_proposals, truncate_name, PuzzleDocument};
use crate::protocol::{ClientCommand, View};
use crate::store::PuzzleStore;

/// Outbound sink for one connection: serialized server messages, consumed
/// by the connection's writer loop
pub type OutboundSink = mpsc::UnboundedSender<String>;

struct Participant {
    display_name: String,
    outbound: OutboundSink,
}

struct SessionState {
    doc: Option<PuzzleDocument>,
    /// Keyed by connection id; ids are monotonically increasing and never
    /// reused, so iteration order is registration order
    participants: BTreeMap<u64, Participant>,
    next_id: u64,
    writeback_failed: bool,
}

enum SaveRequest {
    /// Latest dirty snapshot; (re)starts the trailing-edge debounce
    Debounced(PuzzleDocument),
    /// Teardown write: performed immediately, never retried, acknowledged
    Final(Option<PuzzleDocument>, oneshot::Sender<()>),
}

/// Live coordinator for one puzzle
pub struct Session {
    name: String,
    state: Mutex<SessionState>,
    save_tx: mpsc::UnboundedSender<SaveRequest>,
}

impl Session {
    /// Create the session and spawn its persistence task
    pub fn spawn(
        name: &str,
        doc: PuzzleDocument,
        store: PuzzleStore,
        debounce: Duration,
    ) -> Arc<Self> {
        let (save_tx, save_rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            name: name.to_string(),
            state: Mutex::new(SessionState {
                doc: Some(doc),
                participants: BTreeMap::new(),
                next_id: 0,
                writeback_failed: false,
            }),
            save_tx,
        });
        tokio::spawn(save_task(
            Arc::downgrade(&session),
            store,
            session.name.clone(),
            save_rx,
            debounce,
        ));
        session
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a connection; the caller sends the initial view explicitly
    /// via [`Session::notify_single`]
    pub async fn register(&self, outbound: OutboundSink) -> u64 {
        let mut st = self.state.lock().await;
        let id = st.next_id;
        st.next_id += 1;
        st.participants.insert(
            id,
            Participant {
                display_name: String::new(),
                outbound,
            },
        );
        id
    }

    /// Send the current canonical view to one participant
    pub async fn notify_single(&self, id: u64) {
        let st = self.state.lock().await;
        send_to(&st, id, &render_view(&st));
    }

    /// Route one parsed client command
    pub async fn handle(&self, id: u64, cmd: ClientCommand) {
        match cmd {
            ClientCommand::Name { name } => self.update_name(id, &name).await,
            ClientCommand::Update { data } => self.update_grid(id, &data).await,
        }
    }

    /// Change a participant's display name; no-op if unchanged, otherwise
    /// rebroadcast (names feed the online/author lists)
    pub async fn update_name(&self, id: u64, name: &str) {
        let mut st = self.state.lock().await;
        let name = truncate_name(name);
        let Some(participant) = st.participants.get_mut(&id) else {
            return;
        };
        if participant.display_name == name {
            return;
        }
        participant.display_name = name;
        broadcast(&st);
    }

    /// Merge a proposed grid. Rejected or no-op updates resynchronize the
    /// caller with current truth and touch nothing else.
    pub async fn update_grid(&self, id: u64, data: &[serde_json::Value]) {
        let mut st = self.state.lock().await;

        let merged = match &st.doc {
            None => {
                debug!(puzzle = %self.name, "update while document not loaded");
                None
            }
            Some(doc) if data.len() != doc.grid.len() => {
                debug!(
                    puzzle = %self.name,
                    got = data.len(),
                    want = doc.grid.len(),
                    "rejecting update with wrong grid length"
                );
                None
            }
            Some(doc) => match parse_proposals(data) {
                Ok(proposals) => merge_grid(&doc.grid, &proposals),
                Err(e) => {
                    debug!(puzzle = %self.name, "rejecting update: {e}");
                    None
                }
            },
        };

        let Some(grid) = merged else {
            send_to(&st, id, &render_view(&st));
            return;
        };

        if let Some(doc) = st.doc.as_mut() {
            doc.grid = grid;
        }
        broadcast(&st);
        if let Some(doc) = &st.doc {
            let _ = self.save_tx.send(SaveRequest::Debounced(doc.clone()));
        }
    }

    /// Remove a participant. Returns true when the session is now empty
    /// and the registry should finalize it.
    pub(crate) async fn remove_participant(&self, id: u64) -> bool {
        let mut st = self.state.lock().await;
        let Some(participant) = st.participants.remove(&id) else {
            return st.participants.is_empty();
        };
        if st.participants.is_empty() {
            return true;
        }
        // Departure of a named participant changes the online list
        if !participant.display_name.is_empty() {
            broadcast(&st);
        }
        false
    }

    pub(crate) async fn is_empty(&self) -> bool {
        self.state.lock().await.participants.is_empty()
    }

    /// One last persistence attempt, awaited, never retried
    pub(crate) async fn final_save(&self) {
        let doc = self.state.lock().await.doc.clone();
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.save_tx.send(SaveRequest::Final(doc, ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    async fn set_writeback_failed(&self, failed: bool) {
        let mut st = self.state.lock().await;
        if st.writeback_failed == failed {
            return;
        }
        st.writeback_failed = failed;
        // Participants learn of a newly failed write immediately; a
        // cleared flag rides along with the next regular broadcast
        if failed {
            broadcast(&st);
        }
    }
}

fn render_view(st: &SessionState) -> View {
    let (grid, width, height) = match &st.doc {
        Some(doc) => (doc.grid.clone(), doc.width, doc.height),
        None => (Vec::new(), 0, 0),
    };

    let mut online: Vec<String> = Vec::new();
    for participant in st.participants.values() {
        if !participant.display_name.is_empty() && !online.contains(&participant.display_name) {
            online.push(participant.display_name.clone());
        }
    }

    let mut names = online.clone();
    for cell in &grid {
        if !cell.author.is_empty() && !names.contains(&cell.author) {
            names.push(cell.author.clone());
        }
    }

    View {
        failed: st.writeback_failed,
        grid,
        width,
        height,
        names,
        online,
    }
}

fn send_to(st: &SessionState, id: u64, view: &View) {
    let Some(participant) = st.participants.get(&id) else {
        return;
    };
    match serde_json::to_string(view) {
        Ok(text) => {
            let _ = participant.outbound.send(text);
        }
        Err(e) => error!("failed to serialize view: {e}"),
    }
}

/// Send the current view to every participant. The state lock is held, so
/// the participant set cannot change mid-iteration; a connection that died
/// concurrently just has a closed sink and its send is dropped.
fn broadcast(st: &SessionState) {
    let text = match serde_json::to_string(&render_view(st)) {
        Ok(text) => text,
        Err(e) => {
            error!("failed to serialize view: {e}");
            return;
        }
    };
    for participant in st.participants.values() {
        let _ = participant.outbound.send(text.clone());
    }
}

/// Per-session persistence task.
///
/// Keeps only the newest pending snapshot and writes it once the debounce
/// window has been quiet. A failed write re-arms the same debounce and
/// flips the session's failed flag; a final write is performed at once,
/// acknowledged, and never retried. The task exits when the session is
/// dropped (channel closed).
async fn save_task(
    session: Weak<Session>,
    store: PuzzleStore,
    name: String,
    mut rx: mpsc::UnboundedReceiver<SaveRequest>,
    debounce: Duration,
) {
    let mut pending: Option<PuzzleDocument> = None;
    let mut deadline: Option<Instant> = None;

    loop {
        let request = if let Some(at) = deadline {
            tokio::select! {
                request = rx.recv() => Some(request),
                _ = tokio::time::sleep_until(at) => None,
            }
        } else {
            Some(rx.recv().await)
        };

        match request {
            Some(None) => break,
            Some(Some(SaveRequest::Debounced(doc))) => {
                pending = Some(doc);
                deadline = Some(Instant::now() + debounce);
            }
            Some(Some(SaveRequest::Final(doc, ack))) => {
                pending = None;
                deadline = None;
                if let Some(doc) = doc {
                    match store.write_atomic(&name, &doc).await {
                        Ok(()) => info!(puzzle = %name, "final write complete"),
                        Err(e) => {
                            error!(puzzle = %name, "final write failed, changes lost: {e}");
                        }
                    }
                }
                let _ = ack.send(());
            }
            None => {
                // Debounce fired
                deadline = None;
                let Some(doc) = pending.take() else { continue };
                match store.write_atomic(&name, &doc).await {
                    Ok(()) => {
                        debug!(puzzle = %name, "persisted");
                        if let Some(session) = session.upgrade() {
                            session.set_writeback_failed(false).await;
                        }
                    }
                    Err(e) => {
                        warn!(puzzle = %name, "write failed, retrying after debounce: {e}");
                        pending = Some(doc);
                        deadline = Some(Instant::now() + debounce);
                        if let Some(session) = session.upgrade() {
                            session.set_writeback_failed(true).await;
                        }
                    }
                }
            }
        }
    }
}
