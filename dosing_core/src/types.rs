//! Core domain types for the dose calculation system.
//!
//! This module defines the fundamental types used throughout the system:
//! - Dose and concentration units
//! - Instruments (syringes) and their marking scales
//! - Calculation requests, results and the failure taxonomy
//! - Finalized dose summaries handed to persistence

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Unit Types
// ============================================================================

/// Unit the user expresses the dose in
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DoseUnit {
    Mg,
    Mcg,
    Units,
    Ml,
}

impl DoseUnit {
    pub fn label(&self) -> &'static str {
        match self {
            DoseUnit::Mg => "mg",
            DoseUnit::Mcg => "mcg",
            DoseUnit::Units => "units",
            DoseUnit::Ml => "ml",
        }
    }

    /// Concentration unit with this dose unit as numerator (`None` for ml)
    pub fn per_ml(&self) -> Option<ConcentrationUnit> {
        match self {
            DoseUnit::Mg => Some(ConcentrationUnit::MgPerMl),
            DoseUnit::Mcg => Some(ConcentrationUnit::McgPerMl),
            DoseUnit::Units => Some(ConcentrationUnit::UnitsPerMl),
            DoseUnit::Ml => None,
        }
    }
}

impl fmt::Display for DoseUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for DoseUnit {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mg" => Ok(DoseUnit::Mg),
            "mcg" | "ug" | "µg" => Ok(DoseUnit::Mcg),
            "units" | "unit" | "u" | "iu" => Ok(DoseUnit::Units),
            "ml" | "cc" => Ok(DoseUnit::Ml),
            other => Err(format!("Unknown dose unit: {}", other)),
        }
    }
}

/// Unit a vial's concentration is labelled in
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ConcentrationUnit {
    #[serde(rename = "mg/ml")]
    MgPerMl,
    #[serde(rename = "mcg/ml")]
    McgPerMl,
    #[serde(rename = "units/ml")]
    UnitsPerMl,
}

impl ConcentrationUnit {
    pub fn label(&self) -> &'static str {
        match self {
            ConcentrationUnit::MgPerMl => "mg/ml",
            ConcentrationUnit::McgPerMl => "mcg/ml",
            ConcentrationUnit::UnitsPerMl => "units/ml",
        }
    }

    /// The mass/count unit this concentration is expressed per ml of
    pub fn numerator(&self) -> DoseUnit {
        match self {
            ConcentrationUnit::MgPerMl => DoseUnit::Mg,
            ConcentrationUnit::McgPerMl => DoseUnit::Mcg,
            ConcentrationUnit::UnitsPerMl => DoseUnit::Units,
        }
    }
}

impl fmt::Display for ConcentrationUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ConcentrationUnit {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mg/ml" => Ok(ConcentrationUnit::MgPerMl),
            "mcg/ml" | "ug/ml" | "µg/ml" => Ok(ConcentrationUnit::McgPerMl),
            "units/ml" | "u/ml" | "iu/ml" => Ok(ConcentrationUnit::UnitsPerMl),
            other => Err(format!("Unknown concentration unit: {}", other)),
        }
    }
}

// ============================================================================
// Instrument Types
// ============================================================================

/// How a syringe's barrel is printed
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentFamily {
    /// Printed in ml
    GraduatedVolume,
    /// Printed in U-100 insulin units
    GraduatedCount,
}

impl InstrumentFamily {
    /// Native scale units per ml of liquid.
    ///
    /// Capacities are converted with this factor rather than by parsing
    /// labels like "100 units" or "1 ml".
    pub fn units_per_ml(&self) -> f64 {
        match self {
            InstrumentFamily::GraduatedVolume => 1.0,
            InstrumentFamily::GraduatedCount => 100.0,
        }
    }

    pub fn native_unit(&self) -> &'static str {
        match self {
            InstrumentFamily::GraduatedVolume => "ml",
            InstrumentFamily::GraduatedCount => "units",
        }
    }
}

impl FromStr for InstrumentFamily {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "volume" | "ml" | "graduated_volume" => Ok(InstrumentFamily::GraduatedVolume),
            "units" | "count" | "insulin" | "graduated_count" => {
                Ok(InstrumentFamily::GraduatedCount)
            }
            other => Err(format!("Unknown syringe type: {}", other)),
        }
    }
}

/// Typed lookup key for the instrument table.
///
/// Capacity is held in thousandths of the native unit so the key can be
/// hashed and ordered.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrumentKey {
    pub family: InstrumentFamily,
    capacity_milli: u64,
}

impl InstrumentKey {
    pub fn new(family: InstrumentFamily, capacity: f64) -> Self {
        Self {
            family,
            capacity_milli: (capacity.max(0.0) * 1000.0).round() as u64,
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity_milli as f64 / 1000.0
    }
}

impl fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} syringe", self.capacity(), self.family.native_unit())
    }
}

/// A syringe with its readable gradations
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct Instrument {
    family: InstrumentFamily,
    capacity: f64,
    markings: Vec<f64>,
}

impl Instrument {
    /// Build an instrument, sorting and deduplicating its markings.
    ///
    /// Rejects non-positive capacity, empty marking lists, and markings that
    /// are negative, non-finite or beyond capacity.
    pub fn new(
        family: InstrumentFamily,
        capacity: f64,
        markings: impl IntoIterator<Item = f64>,
    ) -> crate::Result<Self> {
        if !capacity.is_finite() || capacity <= 0.0 {
            return Err(crate::Error::InstrumentValidation(format!(
                "capacity must be positive, got {}",
                capacity
            )));
        }

        let mut markings: Vec<f64> = markings.into_iter().collect();
        if let Some(bad) = markings
            .iter()
            .find(|m| !m.is_finite() || **m < 0.0 || **m > capacity)
        {
            return Err(crate::Error::InstrumentValidation(format!(
                "marking {} outside 0..={} {}",
                bad,
                capacity,
                family.native_unit()
            )));
        }

        markings.sort_by(|a, b| a.total_cmp(b));
        markings.dedup();

        if markings.is_empty() {
            return Err(crate::Error::InstrumentValidation(
                "instrument has no markings".into(),
            ));
        }

        Ok(Self {
            family,
            capacity,
            markings,
        })
    }

    /// Evenly spaced markings from `increment` up to `capacity`
    pub fn with_increment(
        family: InstrumentFamily,
        capacity: f64,
        increment: f64,
    ) -> crate::Result<Self> {
        if !increment.is_finite() || increment <= 0.0 || increment > capacity {
            return Err(crate::Error::InstrumentValidation(format!(
                "increment {} invalid for capacity {}",
                increment, capacity
            )));
        }

        let steps = (capacity / increment + 1e-9).floor() as usize;
        // Snap to 6 decimals so 0.1 * 3 lands on 0.3
        let marks = (1..=steps).map(|i| round_decimals(i as f64 * increment));
        Self::new(family, capacity, marks)
    }

    pub fn family(&self) -> InstrumentFamily {
        self.family
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Ascending, deduplicated gradations in the native unit
    pub fn markings(&self) -> &[f64] {
        &self.markings
    }

    /// Capacity expressed in ml
    pub fn capacity_ml(&self) -> f64 {
        self.capacity / self.family.units_per_ml()
    }

    pub fn key(&self) -> InstrumentKey {
        InstrumentKey::new(self.family, self.capacity)
    }
}

fn round_decimals(value: f64) -> f64 {
    (value * 1e6).round() / 1e6
}

// ============================================================================
// Calculation Types
// ============================================================================

/// Immutable input to a single calculation attempt
#[derive(Clone, Debug, PartialEq)]
pub struct DoseRequest {
    pub dose_value: f64,
    pub dose_unit: DoseUnit,
    pub concentration: Option<f64>,
    pub concentration_unit: Option<ConcentrationUnit>,
    /// Vial contents, in the concentration's numerator unit
    pub total_amount_in_vial: Option<f64>,
    pub instrument: Option<Instrument>,
}

/// Closed set of calculation outcomes other than a clean success
#[derive(Clone, Debug, PartialEq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CalculationError {
    #[error("Dose must be a positive number")]
    InvalidDose,

    #[error("Concentration must be a positive number")]
    InvalidConcentration,

    #[error("{message}")]
    UnitMismatch { message: String },

    #[error("No markings available for the selected syringe")]
    NoMarkingsAvailable,

    #[error("Volume of {volume:.4} ml is too small to measure")]
    VolumeTooSmall { volume: f64 },

    #[error("Dose of {dose} exceeds the {available} available in the vial")]
    DoseExceedsAvailable { dose: f64, available: f64 },

    #[error("Volume of {volume:.2} ml exceeds the {available_volume:.2} ml in the vial")]
    VolumeExceedsAvailable { volume: f64, available_volume: f64 },

    #[error("Volume of {volume:.2} ml exceeds the syringe capacity of {capacity_ml:.2} ml")]
    ExceedsInstrumentCapacity { volume: f64, capacity_ml: f64 },

    /// Non-fatal: the result still carries a volume and marking
    #[error("Rounded {scale_value:.3} to the nearest marking {marking}")]
    PrecisionAdvisory { scale_value: f64, marking: f64 },
}

impl CalculationError {
    /// Everything except the precision advisory invalidates the result
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CalculationError::PrecisionAdvisory { .. })
    }
}

/// Output of a calculation attempt
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CalculationResult {
    /// Volume to draw, in ml
    pub computed_volume: Option<f64>,
    /// Gradation to draw to, in the instrument's native unit
    pub recommended_marking: Option<f64>,
    /// Concentration used, in the request's concentration unit
    pub computed_concentration: Option<f64>,
    pub error: Option<CalculationError>,
}

impl CalculationResult {
    pub fn failure(error: CalculationError) -> Self {
        Self {
            computed_volume: None,
            recommended_marking: None,
            computed_concentration: None,
            error: Some(error),
        }
    }

    /// True for clean results and results carrying only an advisory
    pub fn is_success(&self) -> bool {
        self.error.as_ref().map_or(true, |e| !e.is_fatal())
    }
}

// ============================================================================
// Dose Summary Types
// ============================================================================

/// Body site for subcutaneous injection rotation
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InjectionSite {
    AbdomenLeft,
    AbdomenRight,
    ThighLeft,
    ThighRight,
    ArmLeft,
    ArmRight,
    GluteLeft,
    GluteRight,
}

impl InjectionSite {
    /// Fixed rotation order used for suggestions
    pub const ROTATION: [InjectionSite; 8] = [
        InjectionSite::AbdomenLeft,
        InjectionSite::AbdomenRight,
        InjectionSite::ThighLeft,
        InjectionSite::ThighRight,
        InjectionSite::ArmLeft,
        InjectionSite::ArmRight,
        InjectionSite::GluteLeft,
        InjectionSite::GluteRight,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            InjectionSite::AbdomenLeft => "abdomen_left",
            InjectionSite::AbdomenRight => "abdomen_right",
            InjectionSite::ThighLeft => "thigh_left",
            InjectionSite::ThighRight => "thigh_right",
            InjectionSite::ArmLeft => "arm_left",
            InjectionSite::ArmRight => "arm_right",
            InjectionSite::GluteLeft => "glute_left",
            InjectionSite::GluteRight => "glute_right",
        }
    }
}

impl fmt::Display for InjectionSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for InjectionSite {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace([' ', '-'], "_");
        InjectionSite::ROTATION
            .iter()
            .copied()
            .find(|site| site.label() == normalized)
            .ok_or_else(|| format!("Unknown injection site: {}", s))
    }
}

/// A finalized dose, ready to be logged
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DoseSummary {
    pub id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub dose_value: f64,
    pub dose_unit: DoseUnit,
    pub concentration: Option<f64>,
    pub concentration_unit: Option<ConcentrationUnit>,
    pub volume_ml: f64,
    pub recommended_marking: f64,
    pub instrument: InstrumentKey,
    pub injection_site: Option<InjectionSite>,
    pub outcome_note: Option<String>,
}

/// A dose as read back from history
pub type DoseRecord = DoseSummary;
