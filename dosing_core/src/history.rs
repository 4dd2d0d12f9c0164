//! Dose history helpers: injection-site rotation and CSV export.

use crate::{DoseRecord, InjectionSite, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;

/// A row in the CSV export
#[derive(Debug, serde::Serialize)]
struct CsvRow {
    id: String,
    recorded_at: String,
    dose: f64,
    dose_unit: String,
    concentration: Option<f64>,
    concentration_unit: Option<String>,
    volume_ml: f64,
    marking: f64,
    syringe: String,
    injection_site: Option<String>,
    outcome_note: Option<String>,
}

impl From<&DoseRecord> for CsvRow {
    fn from(record: &DoseRecord) -> Self {
        CsvRow {
            id: record.id.to_string(),
            recorded_at: record.recorded_at.to_rfc3339(),
            dose: record.dose_value,
            dose_unit: record.dose_unit.to_string(),
            concentration: record.concentration,
            concentration_unit: record.concentration_unit.map(|u| u.to_string()),
            volume_ml: record.volume_ml,
            marking: record.recommended_marking,
            syringe: record.instrument.to_string(),
            injection_site: record.injection_site.map(|s| s.to_string()),
            outcome_note: record.outcome_note.clone(),
        }
    }
}

/// Suggest where to inject next
///
/// Picks the first site in rotation order that has never been used, else the
/// site whose most recent use is the oldest.
pub fn suggest_injection_site(records: &[DoseRecord]) -> InjectionSite {
    let mut last_used: HashMap<InjectionSite, DateTime<Utc>> = HashMap::new();
    for record in records {
        if let Some(site) = record.injection_site {
            let entry = last_used.entry(site).or_insert(record.recorded_at);
            if record.recorded_at > *entry {
                *entry = record.recorded_at;
            }
        }
    }

    let mut best = InjectionSite::ROTATION[0];
    let mut best_time: Option<DateTime<Utc>> = last_used.get(&best).copied();
    for site in InjectionSite::ROTATION {
        match last_used.get(&site) {
            None => return site,
            Some(used) if best_time.map_or(false, |t| *used < t) => {
                best = site;
                best_time = Some(*used);
            }
            Some(_) => {}
        }
    }
    best
}

/// Write dose history to a CSV file (with headers), replacing any existing
/// file. Returns the number of rows written.
pub fn export_csv(records: &[DoseRecord], path: &Path) -> Result<usize> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut writer = csv::WriterBuilder::new().has_headers(true).from_path(path)?;
    for record in records {
        writer.serialize(CsvRow::from(record))?;
    }
    writer.flush()?;

    tracing::info!("Exported {} doses to {:?}", records.len(), path);
    Ok(records.len())
}
