//! CLI argument parsing using clap 4.x derive macros

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Collaborative real-time puzzle grid server
///
/// Serves puzzles over WebSocket so multiple participants can fill the
/// same grid together, and manages the puzzle files on disk.
#[derive(Parser, Debug)]
#[command(name = "gridfill")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// The command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path (overrides the default location)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Puzzle data directory (overrides the config)
    #[arg(short, long)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the WebSocket server
    Serve {
        /// Listen address (overrides the config)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// List stored puzzles
    List,

    /// Create a puzzle from an upload file: {"width", "height", "grid": [bool, ...]}
    Upload {
        /// Puzzle name
        name: String,

        /// Path to the upload JSON file
        file: PathBuf,
    },

    /// Delete a stored puzzle
    Delete {
        /// Puzzle name
        name: String,
    },
}
