//! Dose history persistence.
//!
//! The workflow only talks to [`DoseStore`]. The bundled implementation
//! appends doses to a JSONL (JSON Lines) file with file locking so several
//! processes can share one history.

use crate::{DoseRecord, DoseSummary, Error, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use uuid::Uuid;

/// Result of asking the store to log a finalized dose
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogOutcome {
    Logged,
    /// The history is full; the dose was not written
    LimitReached,
    Failed,
}

/// Persistence collaborator for finalized doses
pub trait DoseStore {
    /// Record a dose. Never panics or errors; failures are reported in the
    /// outcome so the caller can carry on.
    fn log_dose(&mut self, summary: &DoseSummary) -> LogOutcome;

    /// All logged doses, oldest first
    fn list_prior_doses(&self) -> Result<Vec<DoseRecord>>;

    /// Remove a dose, returning whether it existed
    fn delete_dose(&mut self, id: Uuid) -> Result<bool>;
}

/// JSONL-based dose store with file locking
pub struct JsonlDoseStore {
    path: PathBuf,
    max_records: usize,
}

impl JsonlDoseStore {
    /// Create a store for the given path. `max_records == 0` disables the cap.
    pub fn new(path: impl Into<PathBuf>, max_records: usize) -> Self {
        Self {
            path: path.into(),
            max_records,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Ensure the parent directory exists
    fn ensure_parent_dir(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    fn append(&self, summary: &DoseSummary) -> Result<()> {
        self.ensure_parent_dir()?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        file.lock_exclusive()?;

        let mut writer = std::io::BufWriter::new(&file);
        let line = serde_json::to_string(summary)?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        drop(writer);

        file.unlock()?;
        Ok(())
    }
}

impl DoseStore for JsonlDoseStore {
    fn log_dose(&mut self, summary: &DoseSummary) -> LogOutcome {
        if self.max_records > 0 {
            match read_doses(&self.path) {
                Ok(existing) if existing.len() >= self.max_records => {
                    tracing::warn!(
                        "Dose history holds {} entries (limit {}), not logging {}",
                        existing.len(),
                        self.max_records,
                        summary.id
                    );
                    return LogOutcome::LimitReached;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("Unable to read dose history before logging: {}", e);
                    return LogOutcome::Failed;
                }
            }
        }

        match self.append(summary) {
            Ok(()) => {
                tracing::debug!("Appended dose {} to {:?}", summary.id, self.path);
                LogOutcome::Logged
            }
            Err(e) => {
                tracing::warn!("Failed to log dose {}: {}", summary.id, e);
                LogOutcome::Failed
            }
        }
    }

    fn list_prior_doses(&self) -> Result<Vec<DoseRecord>> {
        read_doses(&self.path)
    }

    fn delete_dose(&mut self, id: Uuid) -> Result<bool> {
        let doses = read_doses(&self.path)?;
        let before = doses.len();
        let kept: Vec<_> = doses.into_iter().filter(|d| d.id != id).collect();

        if kept.len() == before {
            return Ok(false);
        }

        // Rewrite through a temp file in the same directory for atomic rename
        let parent = self
            .path
            .parent()
            .ok_or_else(|| Error::Store("dose history path missing parent".into()))?;
        let temp = NamedTempFile::new_in(parent)?;
        temp.as_file().lock_exclusive()?;

        {
            let mut writer = std::io::BufWriter::new(temp.as_file());
            for dose in &kept {
                serde_json::to_writer(&mut writer, dose)?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
        }

        temp.as_file().sync_all()?;
        temp.as_file().unlock()?;
        temp.persist(&self.path).map_err(|e| Error::Io(e.error))?;

        tracing::info!("Deleted dose {}", id);
        Ok(true)
    }
}

/// Read all doses from a JSONL file, skipping lines that fail to parse
pub fn read_doses(path: &Path) -> Result<Vec<DoseRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path)?;
    file.lock_shared()?;

    let reader = BufReader::new(&file);
    let mut doses = Vec::new();

    for (line_num, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<DoseRecord>(&line) {
            Ok(dose) => doses.push(dose),
            Err(e) => {
                tracing::warn!("Failed to parse dose at line {}: {}", line_num + 1, e);
            }
        }
    }

    file.unlock()?;
    tracing::debug!("Read {} doses from {:?}", doses.len(), path);
    Ok(doses)
}

/// Volatile store for embedding the workflow without a data directory
#[derive(Debug, Default)]
pub struct MemoryDoseStore {
    doses: Vec<DoseRecord>,
}

impl MemoryDoseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DoseStore for MemoryDoseStore {
    fn log_dose(&mut self, summary: &DoseSummary) -> LogOutcome {
        self.doses.push(summary.clone());
        LogOutcome::Logged
    }

    fn list_prior_doses(&self) -> Result<Vec<DoseRecord>> {
        Ok(self.doses.clone())
    }

    fn delete_dose(&mut self, id: Uuid) -> Result<bool> {
        let before = self.doses.len();
        self.doses.retain(|d| d.id != id);
        Ok(self.doses.len() != before)
    }
}
