//! Puzzle document model and the per-cell merge algorithm.
//!
//! A document is a fixed-size row-major grid of cells. Conflict resolution
//! is per-cell last-writer-wins by logical timestamp: a proposed cell is
//! only considered when its `time` is strictly greater than the stored
//! cell's, and even then authorship is retained when the letter does not
//! actually change.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{GridfillError, Result};

/// Maximum length of a participant display name (and cell author)
pub const MAX_DISPLAY_NAME: usize = 32;

/// Maximum grid width/height
pub const MAX_DIMENSION: u32 = 64;

/// One square of the puzzle grid.
///
/// Invariants: a `solid` cell always has empty `char`/`author` and
/// `certain == false`; `time` never decreases across accepted updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub solid: bool,
    #[serde(rename = "char")]
    pub ch: String,
    pub certain: bool,
    pub author: String,
    pub time: u64,
}

impl Cell {
    /// A fresh cell, open or blocked, with all other fields at defaults
    pub fn new(solid: bool) -> Self {
        Self {
            solid,
            ch: String::new(),
            certain: false,
            author: String::new(),
            time: 0,
        }
    }
}

/// The canonical state of one puzzle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PuzzleDocument {
    pub width: u32,
    pub height: u32,
    pub grid: Vec<Cell>,
}

impl PuzzleDocument {
    /// Check dimensions and grid length. Dimensions are fixed for the
    /// document's lifetime, so this only runs at load and upload time.
    pub fn validate(&self) -> Result<()> {
        if self.width < 1
            || self.width > MAX_DIMENSION
            || self.height < 1
            || self.height > MAX_DIMENSION
        {
            return Err(GridfillError::InvalidDocument(format!(
                "dimensions {}x{} out of range 1..={}",
                self.width, self.height, MAX_DIMENSION
            )));
        }
        let expected = (self.width * self.height) as usize;
        if self.grid.len() != expected {
            return Err(GridfillError::InvalidDocument(format!(
                "grid length {} != {}x{}",
                self.grid.len(),
                self.width,
                self.height
            )));
        }
        Ok(())
    }
}

/// Upload format for creating a puzzle: each boolean marks a blocked square
/// and is expanded into a full default [`Cell`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PuzzleUpload {
    pub width: u32,
    pub height: u32,
    pub grid: Vec<bool>,
}

impl PuzzleUpload {
    pub fn into_document(self) -> Result<PuzzleDocument> {
        let doc = PuzzleDocument {
            width: self.width,
            height: self.height,
            grid: self.grid.into_iter().map(Cell::new).collect(),
        };
        doc.validate()?;
        Ok(doc)
    }
}

/// One cell of a proposed grid update, after type validation
#[derive(Debug, Clone)]
pub struct CellProposal {
    pub ch: String,
    pub certain: bool,
    pub author: String,
    pub time: u64,
}

/// Validate the raw cells of an `update` command.
///
/// Every field's type is checked explicitly before anything is trusted;
/// a single bad cell rejects the whole update (all-or-nothing).
pub fn parse_proposals(values: &[Value]) -> Result<Vec<CellProposal>> {
    let mut proposals = Vec::with_capacity(values.len());
    for (i, value) in values.iter().enumerate() {
        let obj = value
            .as_object()
            .ok_or_else(|| GridfillError::MalformedUpdate(format!("cell {i}: not an object")))?;
        let ch = obj
            .get("char")
            .and_then(Value::as_str)
            .ok_or_else(|| GridfillError::MalformedUpdate(format!("cell {i}: char is not text")))?;
        let certain = obj.get("certain").and_then(Value::as_bool).ok_or_else(|| {
            GridfillError::MalformedUpdate(format!("cell {i}: certain is not a boolean"))
        })?;
        let author = obj.get("author").and_then(Value::as_str).ok_or_else(|| {
            GridfillError::MalformedUpdate(format!("cell {i}: author is not text"))
        })?;
        let time = obj.get("time").and_then(Value::as_u64).ok_or_else(|| {
            GridfillError::MalformedUpdate(format!(
                "cell {i}: time is not a non-negative integer"
            ))
        })?;
        proposals.push(CellProposal {
            ch: ch.to_string(),
            certain,
            author: author.to_string(),
            time,
        });
    }
    Ok(proposals)
}

/// Truncate a display name or author to [`MAX_DISPLAY_NAME`] characters
pub fn truncate_name(name: &str) -> String {
    name.chars().take(MAX_DISPLAY_NAME).collect()
}

fn is_grid_letter(ch: &str) -> bool {
    let mut chars = ch.chars();
    matches!((chars.next(), chars.next()), (Some('A'..='Z'), None))
}

/// Merge a proposed grid into the stored grid, per-cell last-writer-wins.
///
/// Returns the merged grid, or `None` if no cell actually changed (stale
/// timestamps and value-identical proposals are dropped silently).
/// Callers must have already checked that the lengths match.
pub fn merge_grid(stored: &[Cell], proposals: &[CellProposal]) -> Option<Vec<Cell>> {
    debug_assert_eq!(stored.len(), proposals.len());

    let mut merged = Vec::with_capacity(stored.len());
    let mut dirty = false;

    for (cur, prop) in stored.iter().zip(proposals) {
        // Stale or duplicate write for this cell
        if prop.time <= cur.time {
            merged.push(cur.clone());
            continue;
        }

        let mut ch: String = prop
            .ch
            .chars()
            .next()
            .map(|c| c.to_ascii_uppercase().to_string())
            .unwrap_or_default();
        let mut author = truncate_name(&prop.author);
        let mut certain = prop.certain;

        if cur.solid || !is_grid_letter(&ch) {
            ch.clear();
            author.clear();
            certain = false;
        } else if ch == cur.ch {
            // Retyping the current letter must not reassign authorship
            author = cur.author.clone();
        }

        if ch == cur.ch && certain == cur.certain && author == cur.author {
            merged.push(cur.clone());
            continue;
        }

        merged.push(Cell {
            solid: cur.solid,
            ch,
            certain,
            author,
            time: prop.time,
        });
        dirty = true;
    }

    if dirty {
        Some(merged)
    } else {
        None
    }
}
