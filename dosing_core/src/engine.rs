//! Dose calculation engine.
//!
//! Pure functions that reconcile dose and concentration units, compute the
//! volume to draw, and snap it onto a syringe's printed scale:
//! - Unit compatibility (mass ↔ mass with ×/÷1000, count only with count)
//! - Vial and syringe capacity checks
//! - Nearest-marking selection with a precision advisory

use crate::{
    CalculationError, CalculationResult, ConcentrationUnit, DoseRequest, DoseUnit, Instrument,
};

/// Tolerance for "close enough to a marking" and the smallest drawable volume
pub const MARKING_EPSILON: f64 = 0.01;

/// Outcome of a unit compatibility check
#[derive(Clone, Debug, PartialEq)]
pub struct UnitCompatibility {
    pub compatible: bool,
    /// Mismatch explanation, or a note about the conversion applied
    pub message: Option<String>,
}

/// Check whether a dose unit can be drawn from a vial labelled in
/// `concentration_unit`
///
/// | dose  | mg/ml  | mcg/ml | units/ml |
/// |-------|--------|--------|----------|
/// | ml    | yes    | yes    | yes      |
/// | mg    | direct | ×1000  | no       |
/// | mcg   | ÷1000  | direct | no       |
/// | units | no     | no     | direct   |
pub fn validate_unit_compatibility(
    dose_unit: DoseUnit,
    concentration_unit: ConcentrationUnit,
) -> UnitCompatibility {
    use ConcentrationUnit::*;

    match (dose_unit, concentration_unit) {
        (DoseUnit::Ml, _)
        | (DoseUnit::Mg, MgPerMl)
        | (DoseUnit::Mcg, McgPerMl)
        | (DoseUnit::Units, UnitsPerMl) => UnitCompatibility {
            compatible: true,
            message: None,
        },
        (DoseUnit::Mg, McgPerMl) => UnitCompatibility {
            compatible: true,
            message: Some("Converting mg dose to mcg (×1000) for a mcg/ml vial".into()),
        },
        (DoseUnit::Mcg, MgPerMl) => UnitCompatibility {
            compatible: true,
            message: Some("Converting mcg dose to mg (÷1000) for a mg/ml vial".into()),
        },
        (dose, conc) => UnitCompatibility {
            compatible: false,
            message: Some(format!(
                "Dose in {} cannot be drawn from a {} vial: unit mismatch",
                dose, conc
            )),
        },
    }
}

/// Express `amount` (in `dose_unit`) in the numerator unit of
/// `concentration_unit`. `None` when no conversion exists.
fn convert_to_vial_unit(
    amount: f64,
    dose_unit: DoseUnit,
    concentration_unit: ConcentrationUnit,
) -> Option<f64> {
    match (dose_unit, concentration_unit.numerator()) {
        (from, to) if from == to => Some(amount),
        (DoseUnit::Mg, DoseUnit::Mcg) => Some(amount * 1000.0),
        (DoseUnit::Mcg, DoseUnit::Mg) => Some(amount / 1000.0),
        _ => None,
    }
}

/// Rough volume in ml for `dose`, used to preselect a syringe before the
/// real calculation. `None` when the inputs do not give a volume yet.
pub fn estimate_volume(
    dose: f64,
    dose_unit: DoseUnit,
    concentration: Option<f64>,
    concentration_unit: Option<ConcentrationUnit>,
) -> Option<f64> {
    if dose_unit == DoseUnit::Ml {
        return Some(dose);
    }
    let concentration = positive(concentration)?;
    let amount = convert_to_vial_unit(dose, dose_unit, concentration_unit?)?;
    Some(amount / concentration)
}

/// Calculate the volume to draw and the marking to draw it to
///
/// Failures are returned inside the result, never as `Err`, so callers can
/// always display them. Checks short-circuit in this order:
///
/// 1. dose positive
/// 2. concentration positive and unit-compatible (skipped for ml doses)
/// 3. instrument present with markings
/// 4. volume computed, and at least [`MARKING_EPSILON`] ml
/// 5. vial contents sufficient
/// 6. syringe capacity sufficient
/// 7. nearest marking chosen, advisory attached if off by more than epsilon
pub fn calculate_dose(request: &DoseRequest) -> CalculationResult {
    if !request.dose_value.is_finite() || request.dose_value <= 0.0 {
        return CalculationResult::failure(CalculationError::InvalidDose);
    }

    // Resolve the concentration and the dose expressed in its numerator unit
    let (concentration, dose_in_vial_unit) = if request.dose_unit == DoseUnit::Ml {
        (positive(request.concentration), None)
    } else {
        let Some(concentration) = positive(request.concentration) else {
            return CalculationResult::failure(CalculationError::InvalidConcentration);
        };
        let Some(concentration_unit) = request.concentration_unit else {
            return CalculationResult::failure(CalculationError::UnitMismatch {
                message: format!(
                    "Dose in {} needs a concentration unit: unit mismatch",
                    request.dose_unit
                ),
            });
        };
        let check = validate_unit_compatibility(request.dose_unit, concentration_unit);
        let converted =
            convert_to_vial_unit(request.dose_value, request.dose_unit, concentration_unit);
        let dose_in_vial_unit = match converted {
            Some(amount) if check.compatible => amount,
            _ => {
                return CalculationResult::failure(CalculationError::UnitMismatch {
                    message: check.message.unwrap_or_else(|| "unit mismatch".into()),
                })
            }
        };
        (Some(concentration), Some(dose_in_vial_unit))
    };

    let instrument = match request.instrument.as_ref() {
        Some(instrument) if !instrument.markings().is_empty() => instrument,
        _ => return CalculationResult::failure(CalculationError::NoMarkingsAvailable),
    };

    let required_volume = match (dose_in_vial_unit, concentration) {
        (Some(amount), Some(concentration)) => amount / concentration,
        _ => request.dose_value,
    };

    if required_volume < MARKING_EPSILON {
        return CalculationResult::failure(CalculationError::VolumeTooSmall {
            volume: required_volume,
        });
    }

    if let Some(available) = positive(request.total_amount_in_vial) {
        if let Some(dose) = dose_in_vial_unit {
            if dose > available {
                return CalculationResult::failure(CalculationError::DoseExceedsAvailable {
                    dose,
                    available,
                });
            }
        }
        if let Some(concentration) = concentration {
            let available_volume = available / concentration;
            if required_volume > available_volume {
                return CalculationResult::failure(CalculationError::VolumeExceedsAvailable {
                    volume: required_volume,
                    available_volume,
                });
            }
        }
    }

    if required_volume > instrument.capacity_ml() {
        return CalculationResult::failure(CalculationError::ExceedsInstrumentCapacity {
            volume: required_volume,
            capacity_ml: instrument.capacity_ml(),
        });
    }

    let scale_value = to_native_scale(required_volume, instrument);
    let Some(marking) = nearest_marking(instrument.markings(), scale_value) else {
        return CalculationResult::failure(CalculationError::NoMarkingsAvailable);
    };

    let advisory = ((marking - scale_value).abs() > MARKING_EPSILON).then(|| {
        tracing::debug!(
            "Rounded {:.4} {} to marking {}",
            scale_value,
            instrument.family().native_unit(),
            marking
        );
        CalculationError::PrecisionAdvisory {
            scale_value,
            marking,
        }
    });

    CalculationResult {
        computed_volume: Some(required_volume),
        recommended_marking: Some(marking),
        computed_concentration: concentration,
        error: advisory,
    }
}

/// Express a volume in ml on the instrument's printed scale
pub fn to_native_scale(volume_ml: f64, instrument: &Instrument) -> f64 {
    volume_ml * instrument.family().units_per_ml()
}

/// Marking closest to `scale_value`; on a tie the lower marking wins
///
/// Expects `markings` in ascending order, as [`Instrument`] guarantees.
pub fn nearest_marking(markings: &[f64], scale_value: f64) -> Option<f64> {
    let mut best: Option<(f64, f64)> = None;
    for &marking in markings {
        let distance = (marking - scale_value).abs();
        match best {
            Some((_, best_distance)) if distance >= best_distance => {}
            _ => best = Some((marking, distance)),
        }
    }
    best.map(|(marking, _)| marking)
}

fn positive(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v > 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InstrumentFamily;

    fn volume_syringe(capacity: f64, increment: f64) -> Instrument {
        Instrument::with_increment(InstrumentFamily::GraduatedVolume, capacity, increment).unwrap()
    }

    fn insulin_syringe(capacity: f64) -> Instrument {
        Instrument::with_increment(InstrumentFamily::GraduatedCount, capacity, 1.0).unwrap()
    }

    fn request(dose: f64, unit: DoseUnit, conc: f64, conc_unit: ConcentrationUnit) -> DoseRequest {
        DoseRequest {
            dose_value: dose,
            dose_unit: unit,
            concentration: Some(conc),
            concentration_unit: Some(conc_unit),
            total_amount_in_vial: None,
            instrument: Some(volume_syringe(3.0, 0.1)),
        }
    }

    #[test]
    fn test_compatibility_table() {
        use ConcentrationUnit::*;

        assert!(!validate_unit_compatibility(DoseUnit::Units, MgPerMl).compatible);
        assert!(!validate_unit_compatibility(DoseUnit::Units, McgPerMl).compatible);
        assert!(validate_unit_compatibility(DoseUnit::Units, UnitsPerMl).compatible);
        assert!(validate_unit_compatibility(DoseUnit::Mg, McgPerMl).compatible);
        assert!(validate_unit_compatibility(DoseUnit::Mg, MgPerMl).compatible);
        assert!(validate_unit_compatibility(DoseUnit::Mcg, MgPerMl).compatible);
        assert!(!validate_unit_compatibility(DoseUnit::Mcg, UnitsPerMl).compatible);

        for conc in [MgPerMl, McgPerMl, UnitsPerMl] {
            assert!(validate_unit_compatibility(DoseUnit::Ml, conc).compatible);
        }
    }

    #[test]
    fn test_mismatch_message_names_both_units() {
        let check = validate_unit_compatibility(DoseUnit::Units, ConcentrationUnit::MgPerMl);
        let message = check.message.unwrap();

        assert!(message.contains("units"));
        assert!(message.contains("mg/ml"));
        assert!(message.contains("unit mismatch"));
    }

    #[test]
    fn test_same_family_direct() {
        let result = calculate_dose(&request(50.0, DoseUnit::Mg, 25.0, ConcentrationUnit::MgPerMl));

        assert_eq!(result.computed_volume, Some(2.0));
        assert_eq!(result.recommended_marking, Some(2.0));
        assert_eq!(result.computed_concentration, Some(25.0));
        assert!(result.error.is_none());
    }

    #[test]
    fn test_mcg_dose_from_mg_vial() {
        let result = calculate_dose(&request(2000.0, DoseUnit::Mcg, 2.0, ConcentrationUnit::MgPerMl));

        assert_eq!(result.computed_volume, Some(1.0));
        assert!(result.is_success());
    }

    #[test]
    fn test_mg_dose_from_mcg_vial() {
        let result = calculate_dose(&request(1.0, DoseUnit::Mg, 500.0, ConcentrationUnit::McgPerMl));

        assert_eq!(result.computed_volume, Some(2.0));
    }

    #[test]
    fn test_volume_too_small_to_measure() {
        let result = calculate_dose(&request(500.0, DoseUnit::Mcg, 3000.0, ConcentrationUnit::MgPerMl));

        assert!(matches!(
            result.error,
            Some(CalculationError::VolumeTooSmall { volume }) if volume < MARKING_EPSILON
        ));
        assert!(result.computed_volume.is_none());
        assert!(!result.is_success());
    }

    #[test]
    fn test_calculation_is_pure() {
        let req = request(0.25, DoseUnit::Mg, 1.0, ConcentrationUnit::MgPerMl);

        assert_eq!(calculate_dose(&req), calculate_dose(&req));
    }

    #[test]
    fn test_invalid_dose() {
        for dose in [0.0, -1.0, f64::NAN] {
            let result = calculate_dose(&request(dose, DoseUnit::Mg, 10.0, ConcentrationUnit::MgPerMl));
            assert_eq!(result.error, Some(CalculationError::InvalidDose));
        }
    }

    #[test]
    fn test_missing_concentration() {
        let mut req = request(5.0, DoseUnit::Mg, 10.0, ConcentrationUnit::MgPerMl);
        req.concentration = None;

        assert_eq!(
            calculate_dose(&req).error,
            Some(CalculationError::InvalidConcentration)
        );
    }

    #[test]
    fn test_unit_mismatch_is_reported() {
        let result = calculate_dose(&request(10.0, DoseUnit::Units, 10.0, ConcentrationUnit::MgPerMl));

        assert!(matches!(result.error, Some(CalculationError::UnitMismatch { .. })));
        assert!(result.recommended_marking.is_none());
    }

    #[test]
    fn test_volume_dose_ignores_concentration() {
        let req = DoseRequest {
            dose_value: 1.5,
            dose_unit: DoseUnit::Ml,
            concentration: None,
            concentration_unit: None,
            total_amount_in_vial: None,
            instrument: Some(volume_syringe(3.0, 0.1)),
        };
        let result = calculate_dose(&req);

        assert_eq!(result.computed_volume, Some(1.5));
        assert_eq!(result.recommended_marking, Some(1.5));
    }

    #[test]
    fn test_missing_instrument() {
        let mut req = request(5.0, DoseUnit::Mg, 10.0, ConcentrationUnit::MgPerMl);
        req.instrument = None;

        assert_eq!(
            calculate_dose(&req).error,
            Some(CalculationError::NoMarkingsAvailable)
        );
    }

    #[test]
    fn test_dose_exceeds_vial() {
        let mut req = request(60.0, DoseUnit::Mg, 25.0, ConcentrationUnit::MgPerMl);
        req.total_amount_in_vial = Some(50.0);

        assert!(matches!(
            calculate_dose(&req).error,
            Some(CalculationError::DoseExceedsAvailable { .. })
        ));
    }

    #[test]
    fn test_volume_dose_exceeds_vial() {
        let req = DoseRequest {
            dose_value: 2.5,
            dose_unit: DoseUnit::Ml,
            concentration: Some(10.0),
            concentration_unit: Some(ConcentrationUnit::MgPerMl),
            total_amount_in_vial: Some(20.0),
            instrument: Some(volume_syringe(3.0, 0.1)),
        };

        assert!(matches!(
            calculate_dose(&req).error,
            Some(CalculationError::VolumeExceedsAvailable { .. })
        ));
    }

    #[test]
    fn test_exceeds_syringe_capacity() {
        let mut req = request(100.0, DoseUnit::Mg, 25.0, ConcentrationUnit::MgPerMl);
        req.instrument = Some(volume_syringe(3.0, 0.1));

        assert!(matches!(
            calculate_dose(&req).error,
            Some(CalculationError::ExceedsInstrumentCapacity { volume, .. }) if volume == 4.0
        ));
    }

    #[test]
    fn test_insulin_syringe_uses_unit_scale() {
        // 10 units from a U-100 vial is 0.1 ml, drawn to the 10 unit line
        let mut req = request(10.0, DoseUnit::Units, 100.0, ConcentrationUnit::UnitsPerMl);
        req.instrument = Some(insulin_syringe(50.0));
        let result = calculate_dose(&req);

        assert_eq!(result.computed_volume, Some(0.1));
        assert_eq!(result.recommended_marking, Some(10.0));
        assert!(result.error.is_none());
    }

    #[test]
    fn test_insulin_syringe_capacity_in_ml() {
        // 0.6 ml does not fit a 50 unit (0.5 ml) syringe
        let mut req = request(60.0, DoseUnit::Units, 100.0, ConcentrationUnit::UnitsPerMl);
        req.instrument = Some(insulin_syringe(50.0));

        assert!(matches!(
            calculate_dose(&req).error,
            Some(CalculationError::ExceedsInstrumentCapacity { .. })
        ));
    }

    #[test]
    fn test_precision_advisory_keeps_result() {
        // 0.25 ml on a syringe marked every 0.1 ml
        let req = request(0.25, DoseUnit::Mg, 1.0, ConcentrationUnit::MgPerMl);
        let result = calculate_dose(&req);

        assert_eq!(result.computed_volume, Some(0.25));
        assert_eq!(result.recommended_marking, Some(0.2));
        assert!(matches!(
            result.error,
            Some(CalculationError::PrecisionAdvisory { marking, .. }) if marking == 0.2
        ));
        assert!(result.is_success());
    }

    #[test]
    fn test_nearest_marking_tie_prefers_lower() {
        assert_eq!(nearest_marking(&[0.2, 0.3], 0.25), Some(0.2));
        assert_eq!(nearest_marking(&[1.0, 3.0], 2.0), Some(1.0));
        assert_eq!(nearest_marking(&[1.0, 2.0, 3.0], 2.6), Some(3.0));
        assert_eq!(nearest_marking(&[], 1.0), None);
    }
}
