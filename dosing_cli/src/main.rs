use chrono::Utc;
use clap::{Parser, Subcommand};
use dosing_core::feedback::PmfAnswer;
use dosing_core::store::read_doses;
use dosing_core::workflow::Screen;
use dosing_core::*;
use std::io::{self, Write};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "dosecalc")]
#[command(about = "Syringe dose calculator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Override data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Walk through a dose step by step (default)
    Entry {
        /// Log the dose without asking the follow-up questions
        #[arg(long)]
        skip_feedback: bool,
    },

    /// Calculate a single dose from flags
    Calc {
        /// Dose amount
        #[arg(long)]
        dose: f64,

        /// Dose unit (mg, mcg, units, ml)
        #[arg(long)]
        unit: String,

        /// Vial concentration
        #[arg(long)]
        concentration: Option<f64>,

        /// Concentration unit (mg/ml, mcg/ml, units/ml)
        #[arg(long)]
        concentration_unit: Option<String>,

        /// Total amount left in the vial, in the concentration's unit
        #[arg(long)]
        total_amount: Option<f64>,

        /// Syringe as <volume|units>:<capacity>, e.g. volume:3 or units:50
        #[arg(long)]
        syringe: String,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// List logged doses
    History {
        /// Export the history to this CSV file instead of listing it
        #[arg(long)]
        csv: Option<PathBuf>,
    },

    /// Delete a logged dose by id
    Delete {
        /// Dose id, as shown by `history`
        id: String,
    },

    /// List known syringes
    Instruments,
}

fn main() -> Result<()> {
    // Initialize logging
    dosing_core::logging::init();

    let cli = Cli::parse();

    let mut config = Config::load()?;
    if let Some(data_dir) = cli.data_dir {
        config.data.data_dir = data_dir;
    }
    tracing::debug!("Using data directory {:?}", config.data.data_dir);

    match cli.command {
        Some(Commands::Entry { skip_feedback }) => cmd_entry(&config, skip_feedback),
        Some(Commands::Calc {
            dose,
            unit,
            concentration,
            concentration_unit,
            total_amount,
            syringe,
            json,
        }) => cmd_calc(
            &config,
            dose,
            &unit,
            concentration,
            concentration_unit.as_deref(),
            total_amount,
            &syringe,
            json,
        ),
        Some(Commands::History { csv }) => cmd_history(&config, csv),
        Some(Commands::Delete { id }) => cmd_delete(&config, &id),
        Some(Commands::Instruments) => cmd_instruments(&config),
        None => cmd_entry(&config, false),
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_calc(
    config: &Config,
    dose: f64,
    unit: &str,
    concentration: Option<f64>,
    concentration_unit: Option<&str>,
    total_amount: Option<f64>,
    syringe: &str,
    json: bool,
) -> Result<()> {
    let catalog = config.instrument_catalog()?;

    let dose_unit: DoseUnit = unit.parse().map_err(Error::Other)?;
    let concentration_unit = concentration_unit
        .map(|u| u.parse::<ConcentrationUnit>())
        .transpose()
        .map_err(Error::Other)?;
    let key = parse_syringe(syringe)?;
    let instrument = catalog
        .get(&key)
        .cloned()
        .ok_or_else(|| Error::Other(format!("Unknown syringe: {} (see `dosecalc instruments`)", key)))?;

    let request = DoseRequest {
        dose_value: dose,
        dose_unit,
        concentration,
        concentration_unit,
        total_amount_in_vial: total_amount,
        instrument: Some(instrument),
    };
    let result = calculate_dose(&request);

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        display_result(&result, &key);
    }

    match result.error {
        Some(error) if error.is_fatal() => Err(Error::Other(error.to_string())),
        _ => Ok(()),
    }
}

fn parse_syringe(raw: &str) -> Result<InstrumentKey> {
    let (family, capacity) = raw
        .split_once(':')
        .ok_or_else(|| Error::Other(format!("Syringe must look like volume:3, got {}", raw)))?;
    let family: InstrumentFamily = family.parse().map_err(Error::Other)?;
    let capacity: f64 = capacity
        .trim()
        .parse()
        .map_err(|_| Error::Other(format!("Invalid syringe capacity: {}", capacity)))?;
    Ok(InstrumentKey::new(family, capacity))
}

fn cmd_history(config: &Config, csv: Option<PathBuf>) -> Result<()> {
    let records = read_doses(&config.doses_path())?;

    if let Some(csv_path) = csv {
        let count = export_csv(&records, &csv_path)?;
        println!("✓ Exported {} doses", count);
        println!("  CSV: {}", csv_path.display());
        return Ok(());
    }

    if records.is_empty() {
        println!("No doses logged yet.");
        return Ok(());
    }

    for record in &records {
        let site = record
            .injection_site
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".into());
        println!(
            "{}  {}  {} {} -> {:.2} ml at {} on {}  site: {}",
            record.id,
            record.recorded_at.format("%Y-%m-%d %H:%M"),
            record.dose_value,
            record.dose_unit,
            record.volume_ml,
            record.recommended_marking,
            record.instrument,
            site
        );
        if let Some(note) = &record.outcome_note {
            println!("    note: {}", note);
        }
    }
    println!("\nNext suggested site: {}", suggest_injection_site(&records));

    Ok(())
}

fn cmd_delete(config: &Config, id: &str) -> Result<()> {
    let id = uuid::Uuid::parse_str(id.trim())
        .map_err(|e| Error::Other(format!("Invalid dose id {}: {}", id, e)))?;

    let mut store = JsonlDoseStore::new(config.doses_path(), config.history.max_logged_doses);
    if store.delete_dose(id)? {
        println!("✓ Deleted dose {}", id);
    } else {
        println!("No dose with id {}", id);
    }
    Ok(())
}

fn cmd_instruments(config: &Config) -> Result<()> {
    let catalog = config.instrument_catalog()?;

    for instrument in catalog.iter() {
        let markings = instrument.markings();
        let first = markings.first().copied().unwrap_or_default();
        println!(
            "  {:<18} {}:{}  ({} markings from {} to {} {})",
            instrument.key().to_string(),
            match instrument.family() {
                InstrumentFamily::GraduatedVolume => "volume",
                InstrumentFamily::GraduatedCount => "units",
            },
            instrument.capacity(),
            markings.len(),
            first,
            instrument.capacity(),
            instrument.family().native_unit()
        );
    }
    Ok(())
}

// ----------------------------------------------------------------------
// Interactive entry
// ----------------------------------------------------------------------

fn cmd_entry(config: &Config, skip_feedback: bool) -> Result<()> {
    let catalog = config.instrument_catalog()?;
    let store = JsonlDoseStore::new(config.doses_path(), config.history.max_logged_doses);
    let prompts_path = config.prompts_path();
    let prompts = PromptState::load(&prompts_path)?;

    let mut coordinator = Coordinator::new(catalog, store, TracingAnalytics, Utc::now())
        .with_prompts(prompts, Some(prompts_path));

    println!("Type 'b' at any prompt to go back.\n");
    coordinator.begin_manual_entry(Utc::now());

    loop {
        let transition = match coordinator.state().screen {
            Screen::Intro => return Ok(()),
            Screen::Capture => {
                println!("Label capture is not available in the terminal.");
                return Ok(());
            }
            Screen::ManualEntry => match entry_step(&mut coordinator, skip_feedback)? {
                Some(transition) => transition,
                None => return abandon(),
            },
            Screen::Feedback => match feedback_stage(&mut coordinator)? {
                Some(transition) => transition,
                None => return abandon(),
            },
        };

        if let Some(action) = report(&transition) {
            if action == NextAction::StartOver {
                return Ok(());
            }
            println!();
        }
    }
}

fn abandon() -> Result<()> {
    println!("\nEntry abandoned.");
    Ok(())
}

type EntryCoordinator = Coordinator<JsonlDoseStore, TracingAnalytics>;

/// Print what happened; returns the action when a dose was completed
fn report(transition: &Transition) -> Option<NextAction> {
    match transition {
        Transition::Refused { reason, .. } => println!("  ! {}", reason),
        Transition::Rewound { reason, .. } => println!("  ! {}", reason),
        Transition::Recovered => println!("Session expired after inactivity; starting over."),
        Transition::Completed { action, logged } => {
            match logged {
                Some(LogOutcome::Logged) => println!("✓ Dose logged!"),
                Some(LogOutcome::LimitReached) => {
                    println!("! Dose history is full; this dose was not saved.")
                }
                Some(LogOutcome::Failed) => println!("! This dose could not be saved."),
                None => {}
            }
            return Some(*action);
        }
        Transition::Moved { .. } | Transition::Updated | Transition::Prompted { .. } => {}
    }
    None
}

/// Fields asked for on each input step
fn step_fields(step: Step) -> &'static [(Field, &'static str)] {
    match step {
        Step::Dose => &[
            (Field::DoseValue, "Dose"),
            (Field::DoseUnit, "Unit (mg, mcg, units, ml)"),
        ],
        Step::MedicationSource => &[(
            Field::MedicationSource,
            "Do you know the [c]oncentration or the [t]otal amount in the vial?",
        )],
        Step::ConcentrationInput => &[
            (Field::Concentration, "Concentration"),
            (Field::ConcentrationUnit, "Concentration unit (mg/ml, mcg/ml, units/ml)"),
        ],
        Step::TotalAmountInput => &[
            (Field::TotalAmount, "Total amount in the vial"),
            (Field::TotalAmountUnit, "Unit (mg, mcg, units)"),
        ],
        Step::Reconstitution => &[(Field::SolutionVolume, "Diluent added (ml)")],
        Step::Instrument | Step::PreConfirmation | Step::Result => &[],
    }
}

/// Drive one manual-entry step. `None` when input ran out.
fn entry_step(
    coordinator: &mut EntryCoordinator,
    skip_feedback: bool,
) -> Result<Option<Transition>> {
    let step = coordinator.state().step;

    match step {
        Step::Instrument => {
            let fields = &coordinator.state().fields;
            let current = format!("{}:{}", fields.instrument_family, fields.instrument_capacity);
            let Some(input) = prompt(&format!("Syringe [{}]", current))? else {
                return Ok(None);
            };
            if input == "b" {
                return Ok(Some(coordinator.back(Utc::now())));
            }
            if !input.is_empty() {
                let (family, capacity) = input.split_once(':').unwrap_or(("", input.as_str()));
                if !family.is_empty() {
                    coordinator.edit_field(Field::InstrumentFamily, family, Utc::now());
                }
                coordinator.edit_field(Field::InstrumentCapacity, capacity, Utc::now());
            }
            Ok(Some(coordinator.advance(Utc::now())))
        }
        Step::PreConfirmation => {
            display_confirmation(coordinator.state());
            let Some(input) = prompt("Press Enter to see the result")? else {
                return Ok(None);
            };
            if input == "b" {
                return Ok(Some(coordinator.back(Utc::now())));
            }
            Ok(Some(coordinator.advance(Utc::now())))
        }
        Step::Result => {
            if let (Some(result), Some(key)) = (
                coordinator.state().last_result.as_ref(),
                coordinator.state().parsed.instrument,
            ) {
                display_result(result, &key);
            }
            let Some(input) = prompt("Enter to finish, 'n' + Enter for another dose")? else {
                return Ok(None);
            };
            if input == "b" {
                return Ok(Some(coordinator.back(Utc::now())));
            }
            let action = if input == "n" {
                NextAction::NewDose
            } else {
                NextAction::StartOver
            };

            let transition = coordinator.finish(action, Utc::now());
            if skip_feedback && coordinator.state().screen == Screen::Feedback {
                return Ok(Some(coordinator.skip_feedback(Utc::now())));
            }
            Ok(Some(transition))
        }
        _ => {
            for (field, label) in step_fields(step) {
                let current = coordinator.state().fields.get(*field).to_string();
                let question = if current.is_empty() {
                    label.to_string()
                } else {
                    format!("{} [{}]", label, current)
                };
                let Some(input) = prompt(&question)? else {
                    return Ok(None);
                };
                if input == "b" {
                    return Ok(Some(coordinator.back(Utc::now())));
                }
                if !input.is_empty() {
                    coordinator.edit_field(*field, &input, Utc::now());
                }
            }
            Ok(Some(coordinator.advance(Utc::now())))
        }
    }
}

/// Drive one feedback stage. `None` when input ran out.
fn feedback_stage(coordinator: &mut EntryCoordinator) -> Result<Option<Transition>> {
    let Some((stage, suggested)) = coordinator
        .state()
        .feedback
        .as_ref()
        .map(|context| (context.stage, context.suggested_site))
    else {
        return Ok(Some(coordinator.skip_feedback(Utc::now())));
    };

    let response = match stage {
        FeedbackStage::InjectionSite => {
            let question = match suggested {
                Some(site) => format!("Injection site [{}] ('s' to skip, 'b' for result)", site),
                None => "Injection site ('s' to skip, 'b' for result)".to_string(),
            };
            let Some(input) = prompt(&question)? else {
                return Ok(None);
            };
            match input.as_str() {
                "s" => FeedbackResponse::Skip,
                "b" => FeedbackResponse::Cancel,
                "" => match suggested {
                    Some(site) => FeedbackResponse::Submit(FeedbackAnswer::Site(site)),
                    None => FeedbackResponse::Skip,
                },
                other => match other.parse::<InjectionSite>() {
                    Ok(site) => FeedbackResponse::Submit(FeedbackAnswer::Site(site)),
                    Err(e) => {
                        println!("  ! {}", e);
                        return Ok(Some(Transition::Updated));
                    }
                },
            }
        }
        FeedbackStage::Orientation => {
            println!("Tip: always check the marking against the syringe barrel before drawing.");
            let Some(input) = prompt("Enter to continue, 'x' to stop showing tips")? else {
                return Ok(None);
            };
            match input.as_str() {
                "s" => FeedbackResponse::Skip,
                other => FeedbackResponse::Submit(FeedbackAnswer::Orientation {
                    suppress: other == "x",
                }),
            }
        }
        FeedbackStage::PmfSurvey => {
            println!("How would you feel if you could no longer use this calculator?");
            println!("  1) Very disappointed  2) Somewhat disappointed  3) Not disappointed");
            let Some(input) = prompt("Answer ('s' to skip)")? else {
                return Ok(None);
            };
            let answer = match input.as_str() {
                "1" => Some(PmfAnswer::VeryDisappointed),
                "2" => Some(PmfAnswer::SomewhatDisappointed),
                "3" => Some(PmfAnswer::NotDisappointed),
                _ => None,
            };
            match answer {
                Some(disappointment) => {
                    FeedbackResponse::Submit(FeedbackAnswer::PmfSurvey { disappointment })
                }
                None => FeedbackResponse::Skip,
            }
        }
        FeedbackStage::OutcomeFeedback => {
            let Some(input) = prompt("Any notes on this dose? (Enter to skip)")? else {
                return Ok(None);
            };
            if input.is_empty() {
                FeedbackResponse::Skip
            } else {
                FeedbackResponse::Submit(FeedbackAnswer::Outcome { note: input })
            }
        }
    };

    Ok(Some(coordinator.respond_feedback(response, Utc::now())))
}

/// Ask a question and read one trimmed line. `None` on end of input.
fn prompt(question: &str) -> Result<Option<String>> {
    print!("{}\n> ", question);
    io::stdout().flush()?;

    let mut input = String::new();
    if io::stdin().read_line(&mut input)? == 0 {
        return Ok(None);
    }
    Ok(Some(input.trim().to_string()))
}

fn display_confirmation(state: &WorkflowState) {
    let parsed = &state.parsed;
    println!("\n─────────────────────────────────────────");
    if let (Some(dose), Some(unit)) = (parsed.dose_value, parsed.dose_unit) {
        println!("  Dose:      {} {}", dose, unit);
    }
    if let (Some(concentration), Some(unit)) = parsed.effective_concentration() {
        println!("  Vial:      {} {}", concentration, unit);
    }
    if let Some(total) = parsed.vial_total() {
        println!("  In vial:   {}", total);
    }
    if let Some(key) = parsed.instrument {
        println!("  Syringe:   {}", key);
    }
    println!("─────────────────────────────────────────");
}

fn display_result(result: &CalculationResult, key: &InstrumentKey) {
    println!("\n╭─────────────────────────────────────────╮");
    match (result.computed_volume, result.recommended_marking) {
        (Some(volume), Some(marking)) => {
            println!("│  Draw {:.2} ml", volume);
            println!("╰─────────────────────────────────────────╯");
            println!();
            println!(
                "  → Fill the {} to the {} {} mark",
                key,
                marking,
                key.family.native_unit()
            );
            if let Some(concentration) = result.computed_concentration {
                println!("  → Concentration used: {}", concentration);
            }
            if let Some(advisory) = &result.error {
                println!("  ℹ {}", advisory);
            }
        }
        _ => {
            println!("│  Cannot calculate this dose");
            println!("╰─────────────────────────────────────────╯");
            if let Some(error) = &result.error {
                println!();
                println!("  ✗ {}", error);
            }
        }
    }
    println!();
}
