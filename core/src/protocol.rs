//! Wire protocol between the session coordinator and its channels.
//!
//! All messages are JSON text frames. Client commands are a closed tagged
//! enum keyed by `cmd`; the cells inside an `update` stay raw
//! [`serde_json::Value`]s so the coordinator can revalidate every field
//! explicitly and resynchronize the caller instead of dropping the
//! connection on a type mismatch.

use serde::{Deserialize, Serialize};

use crate::model::Cell;

/// Text frame sent (followed by a close) when the requested puzzle name
/// is unrecognized
pub const UNKNOWN_GAME: &str = "unknown-game";

/// Client → server command
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum ClientCommand {
    /// Set or change the participant's display name
    Name { name: String },
    /// Propose a full-grid update, one raw cell per index
    Update { data: Vec<serde_json::Value> },
}

/// Server → client canonical view of the session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct View {
    /// True while the last persistence attempt failed
    pub failed: bool,
    pub grid: Vec<Cell>,
    pub width: u32,
    pub height: u32,
    /// Online display names plus every distinct author present in the grid
    pub names: Vec<String>,
    /// Distinct display names of currently-connected participants
    pub online: Vec<String>,
}
