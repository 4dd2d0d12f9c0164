//! Syringe catalog: typed marking tables keyed by family and capacity.
//!
//! Tables are validated when the catalog is built, so lookups at calculation
//! time never see an instrument without markings.

use crate::types::*;
use crate::{Error, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Declarative instrument definition, as written in config files
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct InstrumentSpec {
    pub family: InstrumentFamily,
    /// Capacity in the family's native unit
    pub capacity: f64,
    /// Spacing between printed gradations, native unit
    pub increment: f64,
}

impl InstrumentSpec {
    pub fn build(&self) -> Result<Instrument> {
        Instrument::with_increment(self.family, self.capacity, self.increment)
    }
}

/// Syringes shipped with the application
const DEFAULT_SPECS: &[InstrumentSpec] = &[
    InstrumentSpec {
        family: InstrumentFamily::GraduatedCount,
        capacity: 30.0,
        increment: 0.5,
    },
    InstrumentSpec {
        family: InstrumentFamily::GraduatedCount,
        capacity: 50.0,
        increment: 1.0,
    },
    InstrumentSpec {
        family: InstrumentFamily::GraduatedCount,
        capacity: 100.0,
        increment: 2.0,
    },
    InstrumentSpec {
        family: InstrumentFamily::GraduatedVolume,
        capacity: 1.0,
        increment: 0.01,
    },
    InstrumentSpec {
        family: InstrumentFamily::GraduatedVolume,
        capacity: 3.0,
        increment: 0.1,
    },
    InstrumentSpec {
        family: InstrumentFamily::GraduatedVolume,
        capacity: 5.0,
        increment: 0.2,
    },
    InstrumentSpec {
        family: InstrumentFamily::GraduatedVolume,
        capacity: 10.0,
        increment: 0.2,
    },
];

/// Cached default catalog - built once and reused
static DEFAULT_CATALOG: Lazy<InstrumentCatalog> = Lazy::new(build_default_catalog);

/// Get a reference to the cached default catalog
pub fn get_default_catalog() -> &'static InstrumentCatalog {
    &DEFAULT_CATALOG
}

/// Builds the default catalog from the built-in syringe table
///
/// **Note**: prefer `get_default_catalog()` unless custom instruments need
/// to be merged in.
pub fn build_default_catalog() -> InstrumentCatalog {
    let mut catalog = InstrumentCatalog::default();
    for spec in DEFAULT_SPECS {
        match spec.build() {
            Ok(instrument) => catalog.insert(instrument),
            Err(e) => tracing::error!("Skipping built-in syringe {:?}: {}", spec, e),
        }
    }
    catalog
}

/// All known syringes, ordered by family then capacity
#[derive(Clone, Debug, Default)]
pub struct InstrumentCatalog {
    instruments: BTreeMap<InstrumentKey, Instrument>,
}

impl InstrumentCatalog {
    /// Add or replace an instrument
    pub fn insert(&mut self, instrument: Instrument) {
        self.instruments.insert(instrument.key(), instrument);
    }

    /// Build and add config-declared instruments, failing on the first
    /// invalid definition
    pub fn merge_specs(&mut self, specs: &[InstrumentSpec]) -> Result<()> {
        for spec in specs {
            let instrument = spec.build().map_err(|e| {
                Error::InstrumentValidation(format!(
                    "custom {} syringe of capacity {}: {}",
                    spec.family.native_unit(),
                    spec.capacity,
                    e
                ))
            })?;
            tracing::debug!("Registered custom syringe {}", instrument.key());
            self.insert(instrument);
        }
        Ok(())
    }

    pub fn get(&self, key: &InstrumentKey) -> Option<&Instrument> {
        self.instruments.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instrument> {
        self.instruments.values()
    }

    /// Instruments of one family, smallest first
    pub fn by_family(&self, family: InstrumentFamily) -> impl Iterator<Item = &Instrument> {
        self.instruments
            .values()
            .filter(move |instrument| instrument.family() == family)
    }

    /// Smallest syringe of `family` that holds `volume_ml`.
    ///
    /// Falls back to the largest syringe of the family when nothing holds the
    /// volume or no estimate is available.
    pub fn smallest_fitting(
        &self,
        family: InstrumentFamily,
        volume_ml: Option<f64>,
    ) -> Option<&Instrument> {
        let fitting = volume_ml.and_then(|volume| {
            self.by_family(family)
                .find(|instrument| instrument.capacity_ml() >= volume)
        });
        fitting.or_else(|| self.by_family(family).last())
    }

    /// Check catalog invariants, returning human-readable problems
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        for (key, instrument) in &self.instruments {
            if instrument.markings().is_empty() {
                errors.push(format!("{} has no markings", key));
            }
            if instrument
                .markings()
                .last()
                .is_some_and(|max| *max > instrument.capacity())
            {
                errors.push(format!("{} has markings beyond capacity", key));
            }
        }

        for family in [InstrumentFamily::GraduatedVolume, InstrumentFamily::GraduatedCount] {
            if self.by_family(family).next().is_none() {
                errors.push(format!("No {} syringes defined", family.native_unit()));
            }
        }

        errors
    }
}

/// Syringe family suited to a dose unit: insulin syringes for unit doses
pub fn preferred_family(dose_unit: DoseUnit) -> InstrumentFamily {
    match dose_unit {
        DoseUnit::Units => InstrumentFamily::GraduatedCount,
        _ => InstrumentFamily::GraduatedVolume,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_catalog_validates() {
        let catalog = build_default_catalog();
        let errors = catalog.validate();
        assert!(
            errors.is_empty(),
            "Default catalog has validation errors: {:?}",
            errors
        );
        assert_eq!(catalog.iter().count(), DEFAULT_SPECS.len());
    }

    #[test]
    fn test_lookup_by_key() {
        let catalog = get_default_catalog();
        let key = InstrumentKey::new(InstrumentFamily::GraduatedCount, 50.0);

        let syringe = catalog.get(&key).unwrap();
        assert_eq!(syringe.markings().len(), 50);
        assert_eq!(syringe.capacity_ml(), 0.5);
    }

    #[test]
    fn test_markings_are_clean_decimals() {
        let catalog = get_default_catalog();
        let key = InstrumentKey::new(InstrumentFamily::GraduatedVolume, 3.0);
        let markings = catalog.get(&key).unwrap().markings();

        assert_eq!(markings[0], 0.1);
        assert_eq!(markings[2], 0.3);
        assert_eq!(*markings.last().unwrap(), 3.0);
    }

    #[test]
    fn test_smallest_fitting() {
        let catalog = get_default_catalog();

        let pick = catalog
            .smallest_fitting(InstrumentFamily::GraduatedVolume, Some(2.0))
            .unwrap();
        assert_eq!(pick.capacity(), 3.0);

        let pick = catalog
            .smallest_fitting(InstrumentFamily::GraduatedCount, Some(0.2))
            .unwrap();
        assert_eq!(pick.capacity(), 30.0);

        // Nothing holds 50 ml, fall back to the largest
        let pick = catalog
            .smallest_fitting(InstrumentFamily::GraduatedVolume, Some(50.0))
            .unwrap();
        assert_eq!(pick.capacity(), 10.0);

        let pick = catalog
            .smallest_fitting(InstrumentFamily::GraduatedCount, None)
            .unwrap();
        assert_eq!(pick.capacity(), 100.0);
    }

    #[test]
    fn test_merge_custom_specs() {
        let mut catalog = build_default_catalog();
        catalog
            .merge_specs(&[InstrumentSpec {
                family: InstrumentFamily::GraduatedVolume,
                capacity: 0.5,
                increment: 0.01,
            }])
            .unwrap();

        let key = InstrumentKey::new(InstrumentFamily::GraduatedVolume, 0.5);
        assert!(catalog.get(&key).is_some());
    }

    #[test]
    fn test_merge_rejects_bad_spec() {
        let mut catalog = build_default_catalog();
        let result = catalog.merge_specs(&[InstrumentSpec {
            family: InstrumentFamily::GraduatedCount,
            capacity: 0.0,
            increment: 1.0,
        }]);

        assert!(matches!(result, Err(Error::InstrumentValidation(_))));
    }

    #[test]
    fn test_instrument_new_normalizes_markings() {
        let syringe =
            Instrument::new(InstrumentFamily::GraduatedVolume, 1.0, [0.5, 0.1, 0.5, 1.0]).unwrap();
        assert_eq!(syringe.markings(), &[0.1, 0.5, 1.0]);

        assert!(Instrument::new(InstrumentFamily::GraduatedVolume, 1.0, Vec::new()).is_err());
        assert!(Instrument::new(InstrumentFamily::GraduatedVolume, 1.0, [1.5]).is_err());
    }
}
