//! Durable puzzle storage: one JSON file per puzzle name.
//!
//! Writes are atomic replaces: serialize to a create-only `.tmp` sibling,
//! then rename over the canonical path so readers never observe a partial
//! file. The temp file is removed best-effort when either step fails.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::error::{GridfillError, Result};
use crate::model::PuzzleDocument;

/// Maximum length of a puzzle name
pub const MAX_PUZZLE_NAME: usize = 255;

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9]([-_.]?[a-zA-Z0-9])*$").expect("valid puzzle name pattern")
    })
}

/// File-backed key-value store of puzzle documents
#[derive(Debug, Clone)]
pub struct PuzzleStore {
    root: PathBuf,
}

impl PuzzleStore {
    /// Open a store rooted at `root`, creating the directory if needed
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Check a puzzle name against the allowed pattern
    pub fn valid_name(name: &str) -> bool {
        name.len() <= MAX_PUZZLE_NAME && name_pattern().is_match(name)
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        if !Self::valid_name(name) {
            return Err(GridfillError::InvalidName(name.to_string()));
        }
        Ok(self.root.join(name))
    }

    pub async fn exists(&self, name: &str) -> bool {
        match self.path_for(name) {
            Ok(path) => tokio::fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Read and validate a stored document
    pub async fn read(&self, name: &str) -> Result<PuzzleDocument> {
        let path = self.path_for(name)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(GridfillError::PuzzleNotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let doc: PuzzleDocument = serde_json::from_slice(&bytes)?;
        doc.validate()?;
        Ok(doc)
    }

    /// Atomically replace the stored document: create-only temp write,
    /// then rename over the canonical path
    pub async fn write_atomic(&self, name: &str, doc: &PuzzleDocument) -> Result<()> {
        let path = self.path_for(name)?;
        let temp_path = self.root.join(format!("{name}.tmp"));
        let json = serde_json::to_vec(doc)?;

        let write_result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&temp_path)
                .await?;
            file.write_all(&json).await?;
            file.flush().await?;
            drop(file);
            tokio::fs::rename(&temp_path, &path).await
        }
        .await;

        if let Err(source) = write_result {
            if let Err(e) = tokio::fs::remove_file(&temp_path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove temp file {}: {}", temp_path.display(), e);
                }
            }
            return Err(GridfillError::Persistence { path, source });
        }
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        let path = self.path_for(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(GridfillError::PuzzleNotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// List stored puzzle names, sorted. Temp files and entries that do
    /// not match the name pattern are skipped.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Ok(file_name) = entry.file_name().into_string() else {
                continue;
            };
            if file_name.ends_with(".tmp") || !Self::valid_name(&file_name) {
                continue;
            }
            names.push(file_name);
        }
        names.sort();
        Ok(names)
    }
}
