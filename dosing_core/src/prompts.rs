//! Persisted counters behind the post-result prompts.
//!
//! Orientation and survey prompts are rate-limited across sessions, so the
//! counters live in a small JSON file saved with locking and atomic rename.

use crate::{Error, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// The orientation prompt is shown at most this many times
pub const ORIENTATION_MAX_SHOWS: u32 = 2;

/// The product-market-fit survey is offered once this many doses completed
pub const PMF_SURVEY_SESSION_TRIGGER: u32 = 4;

/// Cross-session prompt bookkeeping
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct PromptState {
    #[serde(default)]
    pub completed_sessions: u32,
    #[serde(default)]
    pub orientation_shown: u32,
    #[serde(default)]
    pub orientation_suppressed: bool,
    #[serde(default)]
    pub pmf_survey_shown: bool,
}

impl PromptState {
    pub fn should_show_orientation(&self) -> bool {
        !self.orientation_suppressed && self.orientation_shown < ORIENTATION_MAX_SHOWS
    }

    pub fn should_show_pmf_survey(&self) -> bool {
        !self.pmf_survey_shown && self.completed_sessions >= PMF_SURVEY_SESSION_TRIGGER
    }

    /// Load prompt state from a file with shared locking
    ///
    /// Returns default state if the file doesn't exist or can't be parsed;
    /// a lost counter only means a prompt may be shown again.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("No prompt state file found, using defaults");
            return Ok(Self::default());
        }

        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(
                    "Unable to open prompt state {:?}: {}. Using defaults.",
                    path,
                    e
                );
                return Ok(Self::default());
            }
        };

        if let Err(e) = file.lock_shared() {
            tracing::warn!(
                "Unable to lock prompt state {:?}: {}. Using defaults.",
                path,
                e
            );
            return Ok(Self::default());
        }

        let mut contents = String::new();
        let mut reader = std::io::BufReader::new(&file);
        if let Err(e) = reader.read_to_string(&mut contents) {
            let _ = file.unlock();
            tracing::warn!(
                "Failed to read prompt state {:?}: {}. Using defaults.",
                path,
                e
            );
            return Ok(Self::default());
        }

        file.unlock()?;

        match serde_json::from_str::<PromptState>(&contents) {
            Ok(state) => {
                tracing::debug!("Loaded prompt state from {:?}", path);
                Ok(state)
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to parse prompt state {:?}: {}. Using defaults.",
                    path,
                    e
                );
                Ok(Self::default())
            }
        }
    }

    /// Save prompt state atomically (temp file, fsync, rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let temp = NamedTempFile::new_in(
            path.parent()
                .ok_or_else(|| Error::Other("prompt state path missing parent".into()))?,
        )?;

        temp.as_file().lock_exclusive()?;

        {
            let mut writer = std::io::BufWriter::new(temp.as_file());
            let contents = serde_json::to_string(self)?;
            writer.write_all(contents.as_bytes())?;
            writer.flush()?;
        }

        temp.as_file().sync_all()?;
        temp.as_file().unlock()?;

        temp.persist(path).map_err(|e| Error::Io(e.error))?;

        tracing::debug!("Saved prompt state to {:?}", path);
        Ok(())
    }
}
