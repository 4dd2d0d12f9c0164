//! Manual-entry steps and the rules that connect them.
//!
//! Everything here is a pure function of [`WorkflowState`]: which step comes
//! next, which came before, and whether a step's input is complete. The
//! coordinator applies the rules; it never hard-codes a path.

use crate::engine::validate_unit_compatibility;
use crate::instruments::InstrumentCatalog;
use crate::workflow::WorkflowState;
use crate::{ConcentrationUnit, DoseUnit, InstrumentFamily, InstrumentKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Steps of the manual-entry branch, in forward order
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Dose,
    MedicationSource,
    ConcentrationInput,
    TotalAmountInput,
    Reconstitution,
    Instrument,
    PreConfirmation,
    Result,
}

/// What the user knows about the vial
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MedicationSource {
    /// Labelled concentration, e.g. 25 mg/ml
    ConcentrationKnown,
    /// Total contents, e.g. a 5 mg vial of powder to reconstitute
    TotalAmountKnown,
}

impl FromStr for MedicationSource {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "concentration" | "c" | "concentration_known" => {
                Ok(MedicationSource::ConcentrationKnown)
            }
            "total" | "t" | "total_amount" | "total_amount_known" => {
                Ok(MedicationSource::TotalAmountKnown)
            }
            other => Err(format!("Unknown medication source: {}", other)),
        }
    }
}

/// Editable inputs, addressed by the presentation layer
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    DoseValue,
    DoseUnit,
    MedicationSource,
    Concentration,
    ConcentrationUnit,
    TotalAmount,
    TotalAmountUnit,
    SolutionVolume,
    InstrumentFamily,
    InstrumentCapacity,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Field::DoseValue => "dose",
            Field::DoseUnit => "dose unit",
            Field::MedicationSource => "medication source",
            Field::Concentration => "concentration",
            Field::ConcentrationUnit => "concentration unit",
            Field::TotalAmount => "total amount",
            Field::TotalAmountUnit => "total amount unit",
            Field::SolutionVolume => "solution volume",
            Field::InstrumentFamily => "syringe type",
            Field::InstrumentCapacity => "syringe size",
        };
        f.write_str(name)
    }
}

/// Raw, unparsed field values exactly as entered
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntryFields {
    pub dose_value: String,
    pub dose_unit: String,
    pub medication_source: String,
    pub concentration: String,
    pub concentration_unit: String,
    pub total_amount: String,
    pub total_amount_unit: String,
    pub solution_volume: String,
    pub instrument_family: String,
    pub instrument_capacity: String,
}

impl EntryFields {
    pub fn get(&self, field: Field) -> &str {
        match field {
            Field::DoseValue => &self.dose_value,
            Field::DoseUnit => &self.dose_unit,
            Field::MedicationSource => &self.medication_source,
            Field::Concentration => &self.concentration,
            Field::ConcentrationUnit => &self.concentration_unit,
            Field::TotalAmount => &self.total_amount,
            Field::TotalAmountUnit => &self.total_amount_unit,
            Field::SolutionVolume => &self.solution_volume,
            Field::InstrumentFamily => &self.instrument_family,
            Field::InstrumentCapacity => &self.instrument_capacity,
        }
    }

    pub fn set(&mut self, field: Field, value: &str) {
        let slot = match field {
            Field::DoseValue => &mut self.dose_value,
            Field::DoseUnit => &mut self.dose_unit,
            Field::MedicationSource => &mut self.medication_source,
            Field::Concentration => &mut self.concentration,
            Field::ConcentrationUnit => &mut self.concentration_unit,
            Field::TotalAmount => &mut self.total_amount,
            Field::TotalAmountUnit => &mut self.total_amount_unit,
            Field::SolutionVolume => &mut self.solution_volume,
            Field::InstrumentFamily => &mut self.instrument_family,
            Field::InstrumentCapacity => &mut self.instrument_capacity,
        };
        *slot = value.trim().to_string();
    }
}

/// Typed view of [`EntryFields`]; `None` wherever a field is blank or
/// unparseable
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct ParsedEntry {
    pub dose_value: Option<f64>,
    pub dose_unit: Option<DoseUnit>,
    pub source: Option<MedicationSource>,
    pub concentration: Option<f64>,
    pub concentration_unit: Option<ConcentrationUnit>,
    pub total_amount: Option<f64>,
    pub total_amount_unit: Option<DoseUnit>,
    pub solution_volume: Option<f64>,
    pub instrument: Option<InstrumentKey>,
}

impl ParsedEntry {
    pub fn from_fields(fields: &EntryFields) -> Self {
        let family = fields.instrument_family.parse::<InstrumentFamily>().ok();
        let capacity = parse_positive(&fields.instrument_capacity);

        Self {
            dose_value: parse_positive(&fields.dose_value),
            dose_unit: fields.dose_unit.parse().ok(),
            source: fields.medication_source.parse().ok(),
            concentration: parse_positive(&fields.concentration),
            concentration_unit: fields.concentration_unit.parse().ok(),
            total_amount: parse_positive(&fields.total_amount),
            total_amount_unit: fields.total_amount_unit.parse().ok(),
            solution_volume: parse_positive(&fields.solution_volume),
            instrument: family
                .zip(capacity)
                .map(|(family, capacity)| InstrumentKey::new(family, capacity)),
        }
    }

    /// Concentration unit implied by the chosen source, if any
    pub fn chosen_concentration_unit(&self) -> Option<ConcentrationUnit> {
        match self.source {
            Some(MedicationSource::TotalAmountKnown) => {
                self.total_amount_unit.and_then(|u| u.per_ml())
            }
            _ => self.concentration_unit,
        }
    }

    /// Concentration to calculate with: as labelled, or total amount over
    /// reconstitution volume
    pub fn effective_concentration(&self) -> (Option<f64>, Option<ConcentrationUnit>) {
        match self.source {
            Some(MedicationSource::TotalAmountKnown) => (
                self.total_amount
                    .zip(self.solution_volume)
                    .map(|(total, volume)| total / volume),
                self.total_amount_unit.and_then(|u| u.per_ml()),
            ),
            _ => (self.concentration, self.concentration_unit),
        }
    }

    /// Vial contents, only known on the total-amount branch
    pub fn vial_total(&self) -> Option<f64> {
        match self.source {
            Some(MedicationSource::TotalAmountKnown) => self.total_amount,
            _ => None,
        }
    }
}

/// Positive finite number, or `None`
pub fn parse_positive(raw: &str) -> Option<f64> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v > 0.0)
}

/// Why a step cannot be left forward
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepProblem {
    pub field: Option<Field>,
    pub message: String,
}

impl StepProblem {
    fn on(field: Field, message: impl Into<String>) -> Self {
        Self {
            field: Some(field),
            message: message.into(),
        }
    }

    fn general(message: impl Into<String>) -> Self {
        Self {
            field: None,
            message: message.into(),
        }
    }
}

/// Check that `step` has everything it needs to move forward
pub fn validate_step(
    step: Step,
    state: &WorkflowState,
    catalog: &InstrumentCatalog,
) -> std::result::Result<(), StepProblem> {
    let parsed = ParsedEntry::from_fields(&state.fields);

    match step {
        Step::Dose => {
            if parsed.dose_value.is_none() {
                return Err(StepProblem::on(Field::DoseValue, "Enter a dose greater than zero"));
            }
            let Some(dose_unit) = parsed.dose_unit else {
                return Err(StepProblem::on(Field::DoseUnit, "Choose a dose unit"));
            };
            if let Some(conc_unit) = parsed.chosen_concentration_unit() {
                check_compatible(dose_unit, conc_unit, Field::DoseUnit)?;
            }
            Ok(())
        }
        Step::MedicationSource => parsed.source.map(|_| ()).ok_or_else(|| {
            StepProblem::on(
                Field::MedicationSource,
                "Choose whether you know the concentration or the total amount",
            )
        }),
        Step::ConcentrationInput => {
            if parsed.concentration.is_none() {
                return Err(StepProblem::on(
                    Field::Concentration,
                    "Enter a concentration greater than zero",
                ));
            }
            let Some(conc_unit) = parsed.concentration_unit else {
                return Err(StepProblem::on(
                    Field::ConcentrationUnit,
                    "Choose a concentration unit",
                ));
            };
            match parsed.dose_unit {
                Some(dose_unit) => check_compatible(dose_unit, conc_unit, Field::ConcentrationUnit),
                None => Err(StepProblem::on(Field::DoseUnit, "Choose a dose unit first")),
            }
        }
        Step::TotalAmountInput => {
            if parsed.total_amount.is_none() {
                return Err(StepProblem::on(
                    Field::TotalAmount,
                    "Enter the amount in the vial",
                ));
            }
            let Some(conc_unit) = parsed.total_amount_unit.and_then(|u| u.per_ml()) else {
                return Err(StepProblem::on(
                    Field::TotalAmountUnit,
                    "Choose mg, mcg or units for the vial amount",
                ));
            };
            match parsed.dose_unit {
                Some(dose_unit) => check_compatible(dose_unit, conc_unit, Field::TotalAmountUnit),
                None => Err(StepProblem::on(Field::DoseUnit, "Choose a dose unit first")),
            }
        }
        Step::Reconstitution => parsed.solution_volume.map(|_| ()).ok_or_else(|| {
            StepProblem::on(
                Field::SolutionVolume,
                "Enter the ml of diluent added to the vial",
            )
        }),
        Step::Instrument => {
            let Some(key) = parsed.instrument else {
                return Err(StepProblem::on(Field::InstrumentFamily, "Choose a syringe"));
            };
            match catalog.get(&key) {
                Some(instrument) if !instrument.markings().is_empty() => Ok(()),
                _ => Err(StepProblem::on(
                    Field::InstrumentCapacity,
                    format!("No markings known for a {}", key),
                )),
            }
        }
        Step::PreConfirmation => state
            .last_result
            .as_ref()
            .map(|_| ())
            .ok_or_else(|| StepProblem::general("No calculation to confirm yet")),
        Step::Result => Err(StepProblem::general(
            "Choose what to do next instead of advancing",
        )),
    }
}

pub fn is_valid(step: Step, state: &WorkflowState, catalog: &InstrumentCatalog) -> bool {
    validate_step(step, state, catalog).is_ok()
}

fn check_compatible(
    dose_unit: DoseUnit,
    conc_unit: ConcentrationUnit,
    field: Field,
) -> std::result::Result<(), StepProblem> {
    let check = validate_unit_compatibility(dose_unit, conc_unit);
    if check.compatible {
        Ok(())
    } else {
        Err(StepProblem::on(
            field,
            check.message.unwrap_or_else(|| "unit mismatch".into()),
        ))
    }
}

/// The step after `step`, given current answers. `None` at `Result`.
pub fn next_step(step: Step, state: &WorkflowState) -> Option<Step> {
    let parsed = ParsedEntry::from_fields(&state.fields);

    match step {
        Step::Dose => Some(Step::MedicationSource),
        Step::MedicationSource => match parsed.source {
            Some(MedicationSource::TotalAmountKnown) => Some(Step::TotalAmountInput),
            _ => Some(Step::ConcentrationInput),
        },
        Step::ConcentrationInput => Some(Step::Instrument),
        Step::TotalAmountInput => {
            // A powder vial needs reconstituting unless the volume is known
            if parsed.source == Some(MedicationSource::TotalAmountKnown)
                && parsed.solution_volume.is_none()
            {
                Some(Step::Reconstitution)
            } else {
                Some(Step::Instrument)
            }
        }
        Step::Reconstitution => Some(Step::Instrument),
        Step::Instrument => Some(Step::PreConfirmation),
        Step::PreConfirmation => Some(Step::Result),
        Step::Result => None,
    }
}

/// The step before `step`, recomputed from current answers rather than from
/// the path actually taken. `None` means leaving the manual-entry branch.
pub fn previous_step(step: Step, state: &WorkflowState) -> Option<Step> {
    let parsed = ParsedEntry::from_fields(&state.fields);

    match step {
        Step::Dose => None,
        Step::MedicationSource => Some(Step::Dose),
        Step::ConcentrationInput | Step::TotalAmountInput => Some(Step::MedicationSource),
        Step::Reconstitution => Some(Step::TotalAmountInput),
        Step::Instrument => match parsed.source {
            Some(MedicationSource::TotalAmountKnown) if parsed.solution_volume.is_some() => {
                Some(Step::Reconstitution)
            }
            Some(MedicationSource::TotalAmountKnown) => Some(Step::TotalAmountInput),
            _ => Some(Step::ConcentrationInput),
        },
        Step::PreConfirmation => Some(Step::Instrument),
        Step::Result => Some(Step::PreConfirmation),
    }
}

/// Steps whose answers `step` depends on, in order.
///
/// Returns `None` when `step` is not on the branch selected by the current
/// medication source.
pub fn prerequisites(step: Step, state: &WorkflowState) -> Option<Vec<Step>> {
    let parsed = ParsedEntry::from_fields(&state.fields);

    let mut path = vec![Step::Dose, Step::MedicationSource];
    match parsed.source {
        Some(MedicationSource::TotalAmountKnown) => {
            path.extend([Step::TotalAmountInput, Step::Reconstitution])
        }
        Some(MedicationSource::ConcentrationKnown) => path.push(Step::ConcentrationInput),
        None => {}
    }
    path.extend([Step::Instrument, Step::PreConfirmation, Step::Result]);

    path.iter()
        .position(|s| *s == step)
        .map(|index| path[..index].to_vec())
}
