#![forbid(unsafe_code)]

//! Core domain model and business logic for the dose calculator.
//!
//! This crate provides:
//! - Domain types (units, syringes, requests, results, dose records)
//! - Calculation engine
//! - Syringe catalog
//! - Entry workflow (steps, coordinator, feedback sequence)
//! - Persistence (JSONL dose log, prompt counters, CSV export)

pub mod types;
pub mod error;
pub mod config;
pub mod logging;
pub mod engine;
pub mod instruments;
pub mod steps;
pub mod workflow;
pub mod feedback;
pub mod store;
pub mod prompts;
pub mod analytics;
pub mod history;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;
pub use config::Config;
pub use engine::{calculate_dose, validate_unit_compatibility, UnitCompatibility};
pub use instruments::{build_default_catalog, InstrumentCatalog, InstrumentSpec};
pub use steps::{Field, MedicationSource, Step};
pub use workflow::{Coordinator, Screen, Transition, WorkflowState};
pub use feedback::{FeedbackAnswer, FeedbackResponse, FeedbackStage, NextAction};
pub use store::{DoseStore, JsonlDoseStore, LogOutcome};
pub use prompts::PromptState;
pub use analytics::{AnalyticsSink, TracingAnalytics};
pub use history::{export_csv, suggest_injection_site};
