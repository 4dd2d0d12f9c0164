//! Entry workflow coordinator.
//!
//! Owns the [`WorkflowState`] for one entry session and mutates it only
//! through the operations below. Every operation:
//!
//! 1. Resets the session if it has been idle past [`IDLE_TIMEOUT_MINUTES`]
//! 2. Records activity
//! 3. Applies the step rules from [`crate::steps`] and reports a
//!    [`Transition`]
//!
//! Persistence and analytics are best-effort: their failures are logged and
//! never stop the workflow.

use crate::analytics::{AnalyticsEvent, AnalyticsSink, Survey};
use crate::engine::{calculate_dose, estimate_volume};
use crate::feedback::{
    FeedbackAnswer, FeedbackContext, FeedbackResponse, FeedbackStage, NextAction,
};
use crate::history::suggest_injection_site;
use crate::instruments::{preferred_family, InstrumentCatalog};
use crate::prompts::PromptState;
use crate::steps::{self, EntryFields, Field, MedicationSource, ParsedEntry, Step};
use crate::store::{DoseStore, LogOutcome};
use crate::{CalculationResult, DoseRequest, DoseSummary, InstrumentFamily};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

/// Idle time after which an in-progress session is discarded
pub const IDLE_TIMEOUT_MINUTES: i64 = 15;

/// Top-level screens; manual entry is the only one with inner steps
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Screen {
    Intro,
    Capture,
    ManualEntry,
    Feedback,
}

/// How the current dose was started, for "new dose" to repeat it
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EntryMode {
    #[default]
    Manual,
    Capture,
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    /// The last session was discarded for inactivity
    Recovering,
}

/// Everything the coordinator knows about the session in progress
#[derive(Clone, Debug, Serialize)]
pub struct WorkflowState {
    pub screen: Screen,
    pub step: Step,
    pub entry_mode: EntryMode,
    pub fields: EntryFields,
    /// Typed snapshot taken at the last successful forward transition
    pub parsed: ParsedEntry,
    pub last_result: Option<CalculationResult>,
    /// Advisory text per field, for the presentation layer
    pub hints: BTreeMap<Field, String>,
    /// Advisory text not tied to a field
    pub notice: Option<String>,
    pub health: Health,
    pub last_activity: DateTime<Utc>,
    pub feedback: Option<FeedbackContext>,
}

impl WorkflowState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            screen: Screen::Intro,
            step: Step::Dose,
            entry_mode: EntryMode::default(),
            fields: EntryFields::default(),
            parsed: ParsedEntry::default(),
            last_result: None,
            hints: BTreeMap::new(),
            notice: None,
            health: Health::Healthy,
            last_activity: now,
            feedback: None,
        }
    }

    /// Nothing entered and nothing in flight
    fn is_pristine(&self) -> bool {
        self.screen == Screen::Intro
            && self.fields == EntryFields::default()
            && self.last_result.is_none()
            && self.feedback.is_none()
    }

    /// Record activity; never moves the clock backwards
    fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_activity {
            self.last_activity = now;
        }
    }

    fn clear_hints(&mut self) {
        self.hints.clear();
        self.notice = None;
    }
}

/// Outcome of a coordinator operation
#[derive(Clone, Debug, PartialEq)]
pub enum Transition {
    /// Now on this screen (and step, for manual entry)
    Moved { screen: Screen, step: Step },
    /// A field was stored; position unchanged
    Updated,
    /// Nothing changed; see the hint
    Refused {
        field: Option<Field>,
        reason: String,
    },
    /// An earlier answer became invalid, so the workflow moved back to it
    Rewound { step: Step, reason: String },
    /// The session had gone stale and was reset; the call was not applied
    Recovered,
    /// Now showing this feedback stage
    Prompted { stage: FeedbackStage },
    /// The requested next action has run
    Completed {
        action: NextAction,
        logged: Option<LogOutcome>,
    },
}

/// Drives one entry session at a time
pub struct Coordinator<S: DoseStore, A: AnalyticsSink> {
    state: WorkflowState,
    catalog: InstrumentCatalog,
    store: S,
    analytics: A,
    prompts: PromptState,
    prompts_path: Option<PathBuf>,
}

impl<S: DoseStore, A: AnalyticsSink> Coordinator<S, A> {
    pub fn new(catalog: InstrumentCatalog, store: S, analytics: A, now: DateTime<Utc>) -> Self {
        Self {
            state: WorkflowState::new(now),
            catalog,
            store,
            analytics,
            prompts: PromptState::default(),
            prompts_path: None,
        }
    }

    /// Use persisted prompt counters, saving changes back to `path`
    pub fn with_prompts(mut self, prompts: PromptState, path: Option<PathBuf>) -> Self {
        self.prompts = prompts;
        self.prompts_path = path;
        self
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    pub fn catalog(&self) -> &InstrumentCatalog {
        &self.catalog
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn analytics(&self) -> &A {
        &self.analytics
    }

    pub fn prompts(&self) -> &PromptState {
        &self.prompts
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    /// Timer hook: discard the session if it has gone stale.
    ///
    /// Returns whether a reset happened. Does not count as activity.
    pub fn tick(&mut self, now: DateTime<Utc>) -> bool {
        self.check_staleness(now)
    }

    /// Discard everything and return to the intro screen
    pub fn reset(&mut self, now: DateTime<Utc>) {
        let entry_mode = self.state.entry_mode;
        self.state = WorkflowState::new(now);
        self.state.entry_mode = entry_mode;
        tracing::debug!("Workflow reset");
    }

    fn check_staleness(&mut self, now: DateTime<Utc>) -> bool {
        if self.state.is_pristine() {
            return false;
        }

        let idle = now - self.state.last_activity;
        if idle <= Duration::minutes(IDLE_TIMEOUT_MINUTES) {
            return false;
        }

        tracing::warn!(
            "Session idle for {} minutes on {:?}/{:?}, resetting",
            idle.num_minutes(),
            self.state.screen,
            self.state.step
        );
        self.analytics.record(AnalyticsEvent::SessionRecovered {
            idle_minutes: idle.num_minutes(),
        });

        self.state = WorkflowState::new(now);
        self.state.health = Health::Recovering;
        true
    }

    /// Common prologue: staleness check, then record activity
    fn begin_call(&mut self, now: DateTime<Utc>) -> bool {
        if self.check_staleness(now) {
            return false;
        }
        self.state.touch(now);
        true
    }

    fn refuse(&mut self, field: Option<Field>, reason: impl Into<String>) -> Transition {
        let reason = reason.into();
        match field {
            Some(field) => {
                self.state.hints.insert(field, reason.clone());
            }
            None => self.state.notice = Some(reason.clone()),
        }
        tracing::debug!("Refused on {:?}/{:?}: {}", self.state.screen, self.state.step, reason);
        Transition::Refused { field, reason }
    }

    fn moved(&self) -> Transition {
        Transition::Moved {
            screen: self.state.screen,
            step: self.state.step,
        }
    }

    /// Start a fresh manual entry at the dose step
    pub fn begin_manual_entry(&mut self, now: DateTime<Utc>) -> Transition {
        if !self.begin_call(now) {
            return Transition::Recovered;
        }
        if self.state.screen == Screen::Feedback {
            return self.refuse(None, "Finish or skip the feedback first");
        }

        self.reset(now);
        self.state.entry_mode = EntryMode::Manual;
        self.state.screen = Screen::ManualEntry;
        tracing::info!("Manual entry started");
        self.moved()
    }

    /// Start a fresh label capture; fields may be prefilled while capturing
    pub fn begin_capture(&mut self, now: DateTime<Utc>) -> Transition {
        if !self.begin_call(now) {
            return Transition::Recovered;
        }
        if self.state.screen == Screen::Feedback {
            return self.refuse(None, "Finish or skip the feedback first");
        }

        self.reset(now);
        self.state.entry_mode = EntryMode::Capture;
        self.state.screen = Screen::Capture;
        self.moved()
    }

    /// Hand a capture over to manual entry, keeping prefilled fields
    pub fn accept_capture(&mut self, now: DateTime<Utc>) -> Transition {
        if !self.begin_call(now) {
            return Transition::Recovered;
        }
        if self.state.screen != Screen::Capture {
            return self.refuse(None, "Nothing captured to review");
        }

        self.state.screen = Screen::ManualEntry;
        self.state.step = Step::Dose;
        self.moved()
    }

    // ------------------------------------------------------------------
    // Manual entry
    // ------------------------------------------------------------------

    /// Store a raw field value.
    ///
    /// Allowed while capturing and on manual-entry steps before
    /// confirmation.
    pub fn edit_field(&mut self, field: Field, raw: &str, now: DateTime<Utc>) -> Transition {
        if !self.begin_call(now) {
            return Transition::Recovered;
        }

        let editable = match self.state.screen {
            Screen::Capture => true,
            Screen::ManualEntry => self.state.step < Step::PreConfirmation,
            Screen::Intro | Screen::Feedback => false,
        };
        if !editable {
            return self.refuse(Some(field), format!("Go back to change the {}", field));
        }

        self.state.fields.set(field, raw);
        self.state.hints.remove(&field);
        self.state.notice = None;

        if field == Field::DoseUnit {
            self.drop_incompatible_concentration_unit();
        }

        Transition::Updated
    }

    /// A new dose unit invalidates a previously chosen concentration unit
    /// from another family; clear it rather than trap the dose step.
    fn drop_incompatible_concentration_unit(&mut self) {
        let parsed = ParsedEntry::from_fields(&self.state.fields);
        let (Some(dose_unit), Some(conc_unit)) =
            (parsed.dose_unit, parsed.chosen_concentration_unit())
        else {
            return;
        };

        let check = crate::engine::validate_unit_compatibility(dose_unit, conc_unit);
        if check.compatible {
            return;
        }

        let field = match parsed.source {
            Some(MedicationSource::TotalAmountKnown) => Field::TotalAmountUnit,
            _ => Field::ConcentrationUnit,
        };
        self.state.fields.set(field, "");
        self.state.hints.insert(
            field,
            format!("Cleared {}: {} doses need a different unit", conc_unit, dose_unit),
        );
    }

    /// Move forward if the current step is complete
    pub fn advance(&mut self, now: DateTime<Utc>) -> Transition {
        if !self.begin_call(now) {
            return Transition::Recovered;
        }

        match self.state.screen {
            Screen::ManualEntry => {}
            Screen::Feedback => return self.refuse(None, "Answer or skip the current question"),
            Screen::Intro | Screen::Capture => {
                return self.refuse(None, "Start an entry first");
            }
        }

        let step = self.state.step;
        if let Err(problem) = steps::validate_step(step, &self.state, &self.catalog) {
            return self.refuse(problem.field, problem.message);
        }

        if let Some(target) = self.first_inconsistent_step() {
            return self.rewind(target);
        }

        let Some(next) = steps::next_step(step, &self.state) else {
            return self.refuse(None, "Nothing after this step");
        };

        self.state.parsed = ParsedEntry::from_fields(&self.state.fields);
        self.state.clear_hints();

        if step == Step::Instrument {
            self.run_calculation();
        }

        self.enter_step(next);
        tracing::debug!("Advanced {:?} -> {:?}", step, next);
        self.moved()
    }

    /// Move back to the step implied by the current answers
    pub fn back(&mut self, now: DateTime<Utc>) -> Transition {
        if !self.begin_call(now) {
            return Transition::Recovered;
        }

        match self.state.screen {
            Screen::ManualEntry => {
                self.state.clear_hints();
                match steps::previous_step(self.state.step, &self.state) {
                    Some(previous) => self.enter_step(previous),
                    None => {
                        self.state.screen = match self.state.entry_mode {
                            EntryMode::Manual => Screen::Intro,
                            EntryMode::Capture => Screen::Capture,
                        };
                    }
                }
                self.moved()
            }
            Screen::Feedback => {
                let on_first_stage = self
                    .state
                    .feedback
                    .as_ref()
                    .is_some_and(|ctx| ctx.stage == FeedbackStage::InjectionSite);
                if on_first_stage {
                    self.cancel_feedback()
                } else {
                    self.refuse(None, "Answer or skip the current question")
                }
            }
            Screen::Capture => {
                self.state.screen = Screen::Intro;
                self.moved()
            }
            Screen::Intro => self.refuse(None, "Already at the start"),
        }
    }

    /// Earliest step on the active path, before the current one, whose
    /// answers no longer hold
    fn first_inconsistent_step(&self) -> Option<Step> {
        match steps::prerequisites(self.state.step, &self.state) {
            Some(prerequisites) => prerequisites
                .into_iter()
                .find(|step| !steps::is_valid(*step, &self.state, &self.catalog)),
            // Current step belongs to the other medication-source branch
            None if !steps::is_valid(Step::Dose, &self.state, &self.catalog) => Some(Step::Dose),
            None => Some(Step::MedicationSource),
        }
    }

    fn rewind(&mut self, target: Step) -> Transition {
        let reason = match steps::validate_step(target, &self.state, &self.catalog) {
            Err(problem) => {
                if let Some(field) = problem.field {
                    self.state.hints.insert(field, problem.message.clone());
                }
                problem.message
            }
            Ok(()) => "Answers changed; please review this step".to_string(),
        };

        tracing::warn!(
            "Inconsistent entry at {:?}, rewinding to {:?}: {}",
            self.state.step,
            target,
            reason
        );
        self.state.last_result = None;
        self.enter_step(target);
        self.state.notice = Some(reason.clone());
        Transition::Rewound {
            step: target,
            reason,
        }
    }

    fn enter_step(&mut self, step: Step) {
        self.state.screen = Screen::ManualEntry;
        self.state.step = step;
        if step == Step::Instrument {
            self.derive_default_instrument();
        }
    }

    /// Preselect the smallest suitable syringe unless a known one is chosen
    fn derive_default_instrument(&mut self) {
        let parsed = ParsedEntry::from_fields(&self.state.fields);
        if parsed
            .instrument
            .is_some_and(|key| self.catalog.get(&key).is_some())
        {
            return;
        }
        let Some(dose_unit) = parsed.dose_unit else {
            return;
        };

        let (concentration, concentration_unit) = parsed.effective_concentration();
        let estimate = parsed
            .dose_value
            .and_then(|dose| estimate_volume(dose, dose_unit, concentration, concentration_unit));

        let family = preferred_family(dose_unit);
        let Some(instrument) = self.catalog.smallest_fitting(family, estimate) else {
            return;
        };

        let family_label = match instrument.family() {
            InstrumentFamily::GraduatedVolume => "volume",
            InstrumentFamily::GraduatedCount => "units",
        };
        self.state.fields.set(Field::InstrumentFamily, family_label);
        self.state
            .fields
            .set(Field::InstrumentCapacity, &instrument.capacity().to_string());
        tracing::debug!("Preselected {} for estimate {:?} ml", instrument.key(), estimate);
    }

    /// Run the engine once from the current snapshot and keep the result,
    /// whatever it is
    fn run_calculation(&mut self) {
        let parsed = &self.state.parsed;

        let result = match parsed.dose_unit {
            Some(dose_unit) => {
                let (concentration, concentration_unit) = parsed.effective_concentration();
                let request = DoseRequest {
                    dose_value: parsed.dose_value.unwrap_or(f64::NAN),
                    dose_unit,
                    concentration,
                    concentration_unit,
                    total_amount_in_vial: parsed.vial_total(),
                    instrument: parsed
                        .instrument
                        .and_then(|key| self.catalog.get(&key))
                        .cloned(),
                };
                calculate_dose(&request)
            }
            None => CalculationResult::failure(crate::CalculationError::InvalidDose),
        };

        match &result.error {
            Some(error) => tracing::info!("Calculation finished with {:?}: {}", error, error),
            None => tracing::info!(
                "Calculated {:?} ml at marking {:?}",
                result.computed_volume,
                result.recommended_marking
            ),
        }
        self.analytics.record(AnalyticsEvent::CalculationCompleted {
            success: result.is_success(),
        });
        self.state.last_result = Some(result);
    }

    // ------------------------------------------------------------------
    // Result and feedback
    // ------------------------------------------------------------------

    /// Leave the result with a chosen next action.
    ///
    /// After a successful calculation the feedback sequence runs first;
    /// otherwise the action runs immediately.
    pub fn finish(&mut self, action: NextAction, now: DateTime<Utc>) -> Transition {
        if !self.begin_call(now) {
            return Transition::Recovered;
        }
        if self.state.screen != Screen::ManualEntry || self.state.step != Step::Result {
            return self.refuse(None, "No result to finish");
        }

        let Some(summary) = self.build_summary(now) else {
            tracing::info!("Finishing without a dose to log");
            self.execute(action, now);
            return Transition::Completed {
                action,
                logged: None,
            };
        };

        let suggested_site = match self.store.list_prior_doses() {
            Ok(records) => Some(suggest_injection_site(&records)),
            Err(e) => {
                tracing::warn!("Unable to read dose history for site rotation: {}", e);
                None
            }
        };

        let context = FeedbackContext::open(summary, action, &self.prompts, suggested_site);
        tracing::debug!("Opened feedback sequence {:?}", context.plan());
        self.state.feedback = Some(context);
        self.state.screen = Screen::Feedback;
        Transition::Prompted {
            stage: FeedbackStage::InjectionSite,
        }
    }

    fn build_summary(&self, now: DateTime<Utc>) -> Option<DoseSummary> {
        let result = self.state.last_result.as_ref().filter(|r| r.is_success())?;
        let parsed = &self.state.parsed;
        let (concentration, concentration_unit) = parsed.effective_concentration();

        Some(DoseSummary {
            id: Uuid::new_v4(),
            recorded_at: now,
            dose_value: parsed.dose_value?,
            dose_unit: parsed.dose_unit?,
            concentration,
            concentration_unit,
            volume_ml: result.computed_volume?,
            recommended_marking: result.recommended_marking?,
            instrument: parsed.instrument?,
            injection_site: None,
            outcome_note: None,
        })
    }

    /// Answer, skip or cancel the current feedback stage
    pub fn respond_feedback(
        &mut self,
        response: FeedbackResponse,
        now: DateTime<Utc>,
    ) -> Transition {
        if !self.begin_call(now) {
            return Transition::Recovered;
        }
        let Some(stage) = self.state.feedback.as_ref().map(|ctx| ctx.stage) else {
            return self.refuse(None, "No feedback in progress");
        };

        match response {
            FeedbackResponse::Cancel if stage == FeedbackStage::InjectionSite => {
                return self.cancel_feedback();
            }
            FeedbackResponse::Cancel | FeedbackResponse::Skip => {
                if let Some(survey) = survey_for(stage) {
                    self.analytics
                        .record(AnalyticsEvent::SurveySkipped { survey });
                }
            }
            FeedbackResponse::Submit(answer) => {
                if answer.stage() != stage {
                    return self.refuse(None, format!("Expected an answer for {:?}", stage));
                }
                self.record_answer(&answer);
                if let Some(ctx) = self.state.feedback.as_mut() {
                    ctx.apply(&answer);
                }
            }
        }

        self.continue_feedback(now)
    }

    /// Skip whatever remains of the feedback sequence
    pub fn skip_feedback(&mut self, now: DateTime<Utc>) -> Transition {
        if !self.begin_call(now) {
            return Transition::Recovered;
        }
        if self.state.feedback.is_none() {
            return self.refuse(None, "No feedback in progress");
        }
        self.complete_feedback(now)
    }

    fn record_answer(&mut self, answer: &FeedbackAnswer) {
        let event = match answer {
            FeedbackAnswer::Site(site) => AnalyticsEvent::InjectionSiteSelected { site: *site },
            FeedbackAnswer::Orientation { suppress } => {
                if *suppress {
                    self.prompts.orientation_suppressed = true;
                    self.save_prompts();
                }
                AnalyticsEvent::SurveyAnswered {
                    survey: Survey::Orientation,
                    pmf_answer: None,
                }
            }
            FeedbackAnswer::PmfSurvey { disappointment } => AnalyticsEvent::SurveyAnswered {
                survey: Survey::ProductMarketFit,
                pmf_answer: Some(*disappointment),
            },
            FeedbackAnswer::Outcome { .. } => AnalyticsEvent::SurveyAnswered {
                survey: Survey::Outcome,
                pmf_answer: None,
            },
        };
        self.analytics.record(event);
    }

    fn continue_feedback(&mut self, now: DateTime<Utc>) -> Transition {
        let next = self.state.feedback.as_mut().and_then(|ctx| ctx.advance());
        match next {
            Some(stage) => {
                self.on_stage_shown(stage);
                Transition::Prompted { stage }
            }
            None => self.complete_feedback(now),
        }
    }

    fn on_stage_shown(&mut self, stage: FeedbackStage) {
        match stage {
            FeedbackStage::Orientation => {
                self.prompts.orientation_shown += 1;
                self.save_prompts();
            }
            FeedbackStage::PmfSurvey => {
                self.prompts.pmf_survey_shown = true;
                self.save_prompts();
            }
            FeedbackStage::InjectionSite | FeedbackStage::OutcomeFeedback => {}
        }
        if let Some(survey) = survey_for(stage) {
            self.analytics.record(AnalyticsEvent::SurveyShown { survey });
        }
    }

    fn cancel_feedback(&mut self) -> Transition {
        self.state.feedback = None;
        self.state.screen = Screen::ManualEntry;
        self.state.step = Step::Result;
        tracing::debug!("Feedback cancelled, back to result");
        self.moved()
    }

    /// Log the dose and run the parked action. Taking the context out of the
    /// state makes this run at most once per sequence.
    fn complete_feedback(&mut self, now: DateTime<Utc>) -> Transition {
        let Some(context) = self.state.feedback.take() else {
            return self.refuse(None, "No feedback in progress");
        };

        let outcome = self.store.log_dose(&context.summary);
        match outcome {
            LogOutcome::Logged => tracing::info!("Logged dose {}", context.summary.id),
            LogOutcome::LimitReached => {
                tracing::warn!("Dose history is full; dose {} not saved", context.summary.id)
            }
            LogOutcome::Failed => {
                tracing::warn!("Dose {} could not be saved", context.summary.id)
            }
        }

        self.analytics.record(AnalyticsEvent::DoseCompleted {
            dose_unit: context.summary.dose_unit,
            volume_ml: context.summary.volume_ml,
        });
        self.prompts.completed_sessions += 1;
        self.save_prompts();

        self.execute(context.next_action, now);
        Transition::Completed {
            action: context.next_action,
            logged: Some(outcome),
        }
    }

    fn execute(&mut self, action: NextAction, now: DateTime<Utc>) {
        let mode = self.state.entry_mode;
        self.reset(now);

        match action {
            NextAction::StartOver => {}
            NextAction::NewDose => match mode {
                EntryMode::Manual => self.state.screen = Screen::ManualEntry,
                EntryMode::Capture => self.state.screen = Screen::Capture,
            },
            NextAction::ScanAgain => {
                self.state.entry_mode = EntryMode::Capture;
                self.state.screen = Screen::Capture;
            }
        }
        tracing::info!("Next action {:?} -> {:?}", action, self.state.screen);
    }

    fn save_prompts(&self) {
        if let Some(path) = &self.prompts_path {
            if let Err(e) = self.prompts.save(path) {
                tracing::warn!("Failed to save prompt state: {}", e);
            }
        }
    }
}

fn survey_for(stage: FeedbackStage) -> Option<Survey> {
    match stage {
        FeedbackStage::InjectionSite => None,
        FeedbackStage::Orientation => Some(Survey::Orientation),
        FeedbackStage::PmfSurvey => Some(Survey::ProductMarketFit),
        FeedbackStage::OutcomeFeedback => Some(Survey::Outcome),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::RecordingAnalytics;
    use crate::feedback::PmfAnswer;
    use crate::instruments::build_default_catalog;
    use crate::prompts::PMF_SURVEY_SESSION_TRIGGER;
    use crate::store::MemoryDoseStore;
    use crate::{CalculationError, InjectionSite};

    type TestCoordinator = Coordinator<MemoryDoseStore, RecordingAnalytics>;

    fn coordinator(now: DateTime<Utc>) -> TestCoordinator {
        crate::logging::init_test();
        Coordinator::new(
            build_default_catalog(),
            MemoryDoseStore::new(),
            RecordingAnalytics::new(),
            now,
        )
    }

    fn edit(c: &mut TestCoordinator, field: Field, value: &str, now: DateTime<Utc>) {
        assert_eq!(c.edit_field(field, value, now), Transition::Updated);
    }

    fn step_to(step: Step) -> Transition {
        Transition::Moved {
            screen: Screen::ManualEntry,
            step,
        }
    }

    /// Walk 50 mg from a 25 mg/ml vial up to the syringe step
    fn to_instrument_step(c: &mut TestCoordinator, now: DateTime<Utc>) {
        c.begin_manual_entry(now);
        edit(c, Field::DoseValue, "50", now);
        edit(c, Field::DoseUnit, "mg", now);
        assert_eq!(c.advance(now), step_to(Step::MedicationSource));
        edit(c, Field::MedicationSource, "concentration", now);
        assert_eq!(c.advance(now), step_to(Step::ConcentrationInput));
        edit(c, Field::Concentration, "25", now);
        edit(c, Field::ConcentrationUnit, "mg/ml", now);
        assert_eq!(c.advance(now), step_to(Step::Instrument));
    }

    fn to_result_step(c: &mut TestCoordinator, now: DateTime<Utc>) {
        to_instrument_step(c, now);
        assert_eq!(c.advance(now), step_to(Step::PreConfirmation));
        assert_eq!(c.advance(now), step_to(Step::Result));
    }

    #[test]
    fn test_invalid_dose_never_advances() {
        let now = Utc::now();
        let mut c = coordinator(now);
        c.begin_manual_entry(now);
        edit(&mut c, Field::DoseUnit, "mg", now);

        for raw in ["0", "-2", "abc", ""] {
            edit(&mut c, Field::DoseValue, raw, now);
            let transition = c.advance(now);

            assert!(matches!(
                transition,
                Transition::Refused {
                    field: Some(Field::DoseValue),
                    ..
                }
            ));
            assert_eq!(c.state().step, Step::Dose);
            assert!(c.state().hints.contains_key(&Field::DoseValue));
        }
    }

    #[test]
    fn test_unit_mismatch_refused_at_concentration() {
        let now = Utc::now();
        let mut c = coordinator(now);
        c.begin_manual_entry(now);
        edit(&mut c, Field::DoseValue, "10", now);
        edit(&mut c, Field::DoseUnit, "units", now);
        c.advance(now);
        edit(&mut c, Field::MedicationSource, "c", now);
        c.advance(now);
        edit(&mut c, Field::Concentration, "100", now);
        edit(&mut c, Field::ConcentrationUnit, "mg/ml", now);

        let transition = c.advance(now);
        assert!(matches!(
            transition,
            Transition::Refused { field: Some(Field::ConcentrationUnit), ref reason }
                if reason.contains("unit mismatch")
        ));
        assert_eq!(c.state().step, Step::ConcentrationInput);
    }

    #[test]
    fn test_entering_instrument_preselects_syringe() {
        let now = Utc::now();
        let mut c = coordinator(now);
        to_instrument_step(&mut c, now);

        // 2 ml fits the 3 ml syringe first
        assert_eq!(c.state().fields.instrument_family, "volume");
        assert_eq!(c.state().fields.instrument_capacity, "3");
    }

    #[test]
    fn test_leaving_instrument_always_stores_result() {
        let now = Utc::now();
        let mut c = coordinator(now);
        to_instrument_step(&mut c, now);
        assert!(c.state().last_result.is_none());

        assert_eq!(c.advance(now), step_to(Step::PreConfirmation));
        let result = c.state().last_result.clone().unwrap();
        assert_eq!(result.computed_volume, Some(2.0));
        assert_eq!(result.recommended_marking, Some(2.0));

        // Back, pick a syringe that is too small, and go again
        assert_eq!(c.back(now), step_to(Step::Instrument));
        edit(&mut c, Field::InstrumentCapacity, "1", now);
        assert_eq!(c.advance(now), step_to(Step::PreConfirmation));

        let result = c.state().last_result.clone().unwrap();
        assert!(matches!(
            result.error,
            Some(CalculationError::ExceedsInstrumentCapacity { .. })
        ));
        assert!(result.computed_volume.is_none());
    }

    #[test]
    fn test_total_amount_path_with_reconstitution() {
        let now = Utc::now();
        let mut c = coordinator(now);
        c.begin_manual_entry(now);
        edit(&mut c, Field::DoseValue, "2.5", now);
        edit(&mut c, Field::DoseUnit, "mg", now);
        c.advance(now);
        edit(&mut c, Field::MedicationSource, "total", now);
        assert_eq!(c.advance(now), step_to(Step::TotalAmountInput));
        edit(&mut c, Field::TotalAmount, "5", now);
        edit(&mut c, Field::TotalAmountUnit, "mg", now);
        assert_eq!(c.advance(now), step_to(Step::Reconstitution));
        edit(&mut c, Field::SolutionVolume, "2", now);
        assert_eq!(c.advance(now), step_to(Step::Instrument));

        // 5 mg in 2 ml is 2.5 mg/ml, so 2.5 mg is exactly 1 ml
        assert_eq!(c.state().fields.instrument_capacity, "1");
        assert_eq!(c.advance(now), step_to(Step::PreConfirmation));

        let result = c.state().last_result.clone().unwrap();
        assert_eq!(result.computed_volume, Some(1.0));
        assert_eq!(result.recommended_marking, Some(1.0));
        assert_eq!(result.computed_concentration, Some(2.5));

        // Back from the syringe goes through reconstitution on this branch
        assert_eq!(c.back(now), step_to(Step::Instrument));
        assert_eq!(c.back(now), step_to(Step::Reconstitution));
        assert_eq!(c.back(now), step_to(Step::TotalAmountInput));
    }

    #[test]
    fn test_back_recomputes_after_changed_answer() {
        let now = Utc::now();
        let mut c = coordinator(now);
        to_instrument_step(&mut c, now);

        assert_eq!(c.back(now), step_to(Step::ConcentrationInput));
        assert_eq!(c.back(now), step_to(Step::MedicationSource));
        edit(&mut c, Field::MedicationSource, "total", now);
        assert_eq!(c.advance(now), step_to(Step::TotalAmountInput));
        assert_eq!(c.back(now), step_to(Step::MedicationSource));
        assert_eq!(c.back(now), step_to(Step::Dose));

        assert_eq!(
            c.back(now),
            Transition::Moved {
                screen: Screen::Intro,
                step: Step::Dose
            }
        );
    }

    #[test]
    fn test_dose_unit_change_clears_incompatible_concentration_unit() {
        let now = Utc::now();
        let mut c = coordinator(now);
        to_instrument_step(&mut c, now);
        c.back(now);
        c.back(now);
        c.back(now);
        assert_eq!(c.state().step, Step::Dose);

        edit(&mut c, Field::DoseUnit, "units", now);
        assert_eq!(c.state().fields.concentration_unit, "");
        assert!(c.state().hints.contains_key(&Field::ConcentrationUnit));
        assert_eq!(c.advance(now), step_to(Step::MedicationSource));
    }

    #[test]
    fn test_idle_timeout_resets_from_any_step() {
        let start = Utc::now();
        let mut c = coordinator(start);
        to_instrument_step(&mut c, start);

        let later = start + Duration::minutes(IDLE_TIMEOUT_MINUTES + 1);
        assert_eq!(c.advance(later), Transition::Recovered);

        let state = c.state();
        assert_eq!(state.screen, Screen::Intro);
        assert_eq!(state.step, Step::Dose);
        assert_eq!(state.fields, EntryFields::default());
        assert!(state.last_result.is_none());
        assert_eq!(state.health, Health::Recovering);
        assert!(c
            .analytics()
            .events()
            .iter()
            .any(|e| matches!(e, AnalyticsEvent::SessionRecovered { .. })));

        // Starting again clears the recovery flag
        c.begin_manual_entry(later);
        assert_eq!(c.state().health, Health::Healthy);
    }

    #[test]
    fn test_activity_keeps_session_alive() {
        let start = Utc::now();
        let mut c = coordinator(start);
        to_instrument_step(&mut c, start);

        let mut now = start;
        for _ in 0..4 {
            now += Duration::minutes(IDLE_TIMEOUT_MINUTES - 1);
            assert!(!c.tick(now));
            edit(&mut c, Field::InstrumentCapacity, "3", now);
        }
        assert_eq!(c.state().step, Step::Instrument);
    }

    #[test]
    fn test_tick_resets_stale_session() {
        let start = Utc::now();
        let mut c = coordinator(start);
        to_result_step(&mut c, start);

        assert!(c.tick(start + Duration::minutes(IDLE_TIMEOUT_MINUTES + 5)));
        assert_eq!(c.state().screen, Screen::Intro);
        assert_eq!(c.state().health, Health::Recovering);
    }

    #[test]
    fn test_tick_ignores_pristine_session() {
        let start = Utc::now();
        let mut c = coordinator(start);

        assert!(!c.tick(start + Duration::hours(5)));
        assert_eq!(c.state().health, Health::Healthy);
    }

    #[test]
    fn test_inconsistent_earlier_answer_rewinds() {
        let now = Utc::now();
        let mut c = coordinator(now);
        to_instrument_step(&mut c, now);

        // Mutated behind the coordinator's back
        c.state.fields.dose_value = "oops".into();

        let transition = c.advance(now);
        assert!(matches!(
            transition,
            Transition::Rewound {
                step: Step::Dose,
                ..
            }
        ));
        assert_eq!(c.state().step, Step::Dose);
        assert!(c.state().last_result.is_none());
        assert!(c.state().hints.contains_key(&Field::DoseValue));
    }

    #[test]
    fn test_edit_refused_after_calculation() {
        let now = Utc::now();
        let mut c = coordinator(now);
        to_result_step(&mut c, now);

        let transition = c.edit_field(Field::DoseValue, "60", now);
        assert!(matches!(transition, Transition::Refused { .. }));
        assert_eq!(c.state().fields.dose_value, "50");
    }

    #[test]
    fn test_skipping_all_stages_runs_action_once() {
        let now = Utc::now();
        let mut c = coordinator(now);
        to_result_step(&mut c, now);

        assert_eq!(
            c.finish(NextAction::NewDose, now),
            Transition::Prompted {
                stage: FeedbackStage::InjectionSite
            }
        );

        let mut completions = 0;
        for _ in 0..10 {
            match c.respond_feedback(FeedbackResponse::Skip, now) {
                Transition::Prompted { .. } => {}
                Transition::Completed { action, logged } => {
                    assert_eq!(action, NextAction::NewDose);
                    assert_eq!(logged, Some(LogOutcome::Logged));
                    completions += 1;
                }
                Transition::Refused { .. } => break,
                other => panic!("unexpected transition {:?}", other),
            }
        }

        assert_eq!(completions, 1);
        assert_eq!(c.store().list_prior_doses().unwrap().len(), 1);
        assert_eq!(c.state().screen, Screen::ManualEntry);
        assert_eq!(c.state().step, Step::Dose);
        assert!(c.state().feedback.is_none());
        assert_eq!(c.state().fields, EntryFields::default());
    }

    #[test]
    fn test_skip_feedback_end_to_end() {
        let now = Utc::now();
        let mut c = coordinator(now);
        to_result_step(&mut c, now);
        c.finish(NextAction::StartOver, now);

        assert_eq!(
            c.skip_feedback(now),
            Transition::Completed {
                action: NextAction::StartOver,
                logged: Some(LogOutcome::Logged)
            }
        );
        assert!(matches!(c.skip_feedback(now), Transition::Refused { .. }));
        assert_eq!(c.store().list_prior_doses().unwrap().len(), 1);
        assert_eq!(c.state().screen, Screen::Intro);
        // Skipped end to end, so the orientation prompt was never shown
        assert_eq!(c.prompts().orientation_shown, 0);
        assert_eq!(c.prompts().completed_sessions, 1);
    }

    #[test]
    fn test_cancel_site_returns_to_result_unchanged() {
        let now = Utc::now();
        let mut c = coordinator(now);
        to_result_step(&mut c, now);
        let result_before = c.state().last_result.clone();

        c.finish(NextAction::NewDose, now);
        assert_eq!(
            c.respond_feedback(FeedbackResponse::Cancel, now),
            step_to(Step::Result)
        );
        assert_eq!(c.state().last_result, result_before);
        assert!(c.state().feedback.is_none());
        assert!(c.store().list_prior_doses().unwrap().is_empty());

        // Can finish again
        assert!(matches!(
            c.finish(NextAction::NewDose, now),
            Transition::Prompted { .. }
        ));
    }

    #[test]
    fn test_submitted_answers_reach_the_log() {
        let now = Utc::now();
        let mut c = coordinator(now);
        to_result_step(&mut c, now);
        c.finish(NextAction::ScanAgain, now);

        assert_eq!(
            c.state().feedback.as_ref().unwrap().suggested_site,
            Some(InjectionSite::AbdomenLeft)
        );

        let site = FeedbackAnswer::Site(InjectionSite::ThighLeft);
        assert_eq!(
            c.respond_feedback(FeedbackResponse::Submit(site), now),
            Transition::Prompted {
                stage: FeedbackStage::Orientation
            }
        );

        // Wrong answer for the stage is refused
        let outcome = FeedbackAnswer::Outcome {
            note: "fine".into(),
        };
        assert!(matches!(
            c.respond_feedback(FeedbackResponse::Submit(outcome.clone()), now),
            Transition::Refused { .. }
        ));

        c.respond_feedback(
            FeedbackResponse::Submit(FeedbackAnswer::Orientation { suppress: true }),
            now,
        );
        let transition = c.respond_feedback(FeedbackResponse::Submit(outcome), now);
        assert!(matches!(
            transition,
            Transition::Completed {
                action: NextAction::ScanAgain,
                ..
            }
        ));
        assert_eq!(c.state().screen, Screen::Capture);

        let doses = c.store().list_prior_doses().unwrap();
        assert_eq!(doses[0].injection_site, Some(InjectionSite::ThighLeft));
        assert_eq!(doses[0].outcome_note.as_deref(), Some("fine"));
        assert_eq!(doses[0].volume_ml, 2.0);
        assert!(c.prompts().orientation_suppressed);
    }

    #[test]
    fn test_orientation_shown_at_most_twice() {
        let mut now = Utc::now();
        let mut c = coordinator(now);

        for _ in 0..3 {
            to_result_step(&mut c, now);
            c.finish(NextAction::StartOver, now);
            while let Transition::Prompted { .. } = c.respond_feedback(FeedbackResponse::Skip, now)
            {
            }
            now += Duration::minutes(1);
        }

        let shown = c
            .analytics()
            .events()
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    AnalyticsEvent::SurveyShown {
                        survey: Survey::Orientation
                    }
                )
            })
            .count();
        assert_eq!(shown, 2);
        assert_eq!(c.store().list_prior_doses().unwrap().len(), 3);
    }

    #[test]
    fn test_pmf_survey_shown_exactly_once() {
        let now = Utc::now();
        let prompts = PromptState {
            completed_sessions: PMF_SURVEY_SESSION_TRIGGER,
            orientation_suppressed: true,
            ..PromptState::default()
        };
        let mut c = coordinator(now).with_prompts(prompts, None);

        to_result_step(&mut c, now);
        c.finish(NextAction::StartOver, now);
        assert_eq!(
            c.respond_feedback(FeedbackResponse::Skip, now),
            Transition::Prompted {
                stage: FeedbackStage::PmfSurvey
            }
        );
        c.respond_feedback(
            FeedbackResponse::Submit(FeedbackAnswer::PmfSurvey {
                disappointment: PmfAnswer::VeryDisappointed,
            }),
            now,
        );
        c.respond_feedback(FeedbackResponse::Skip, now);
        assert!(c.prompts().pmf_survey_shown);

        to_result_step(&mut c, now);
        c.finish(NextAction::StartOver, now);
        assert_eq!(
            c.respond_feedback(FeedbackResponse::Skip, now),
            Transition::Prompted {
                stage: FeedbackStage::OutcomeFeedback
            }
        );
    }

    #[test]
    fn test_failed_calculation_skips_feedback() {
        let now = Utc::now();
        let mut c = coordinator(now);
        to_instrument_step(&mut c, now);
        edit(&mut c, Field::InstrumentCapacity, "1", now);
        c.advance(now);
        assert_eq!(c.advance(now), step_to(Step::Result));

        assert_eq!(
            c.finish(NextAction::NewDose, now),
            Transition::Completed {
                action: NextAction::NewDose,
                logged: None
            }
        );
        assert!(c.store().list_prior_doses().unwrap().is_empty());
        assert_eq!(c.state().step, Step::Dose);
    }

    struct FailingStore;

    impl DoseStore for FailingStore {
        fn log_dose(&mut self, _summary: &DoseSummary) -> LogOutcome {
            LogOutcome::Failed
        }

        fn list_prior_doses(&self) -> crate::Result<Vec<crate::DoseRecord>> {
            Err(crate::Error::Store("offline".into()))
        }

        fn delete_dose(&mut self, _id: Uuid) -> crate::Result<bool> {
            Err(crate::Error::Store("offline".into()))
        }
    }

    #[test]
    fn test_store_failure_does_not_block() {
        let now = Utc::now();
        let mut c = Coordinator::new(
            build_default_catalog(),
            FailingStore,
            RecordingAnalytics::new(),
            now,
        );

        c.begin_manual_entry(now);
        c.edit_field(Field::DoseValue, "1", now);
        c.edit_field(Field::DoseUnit, "ml", now);
        c.advance(now);
        c.edit_field(Field::MedicationSource, "concentration", now);
        c.advance(now);
        c.edit_field(Field::Concentration, "10", now);
        c.edit_field(Field::ConcentrationUnit, "mg/ml", now);
        c.advance(now);
        c.advance(now);
        c.advance(now);

        assert!(matches!(
            c.finish(NextAction::StartOver, now),
            Transition::Prompted { .. }
        ));
        assert!(c.state().feedback.as_ref().unwrap().suggested_site.is_none());
        assert_eq!(
            c.skip_feedback(now),
            Transition::Completed {
                action: NextAction::StartOver,
                logged: Some(LogOutcome::Failed)
            }
        );
        assert_eq!(c.state().screen, Screen::Intro);
    }

    #[test]
    fn test_capture_flow_repeats_capture() {
        let now = Utc::now();
        let mut c = coordinator(now);

        assert_eq!(
            c.begin_capture(now),
            Transition::Moved {
                screen: Screen::Capture,
                step: Step::Dose
            }
        );
        edit(&mut c, Field::DoseValue, "50", now);
        edit(&mut c, Field::DoseUnit, "mg", now);
        assert_eq!(c.accept_capture(now), step_to(Step::Dose));
        assert_eq!(c.state().fields.dose_value, "50");

        c.advance(now);
        edit(&mut c, Field::MedicationSource, "concentration", now);
        c.advance(now);
        edit(&mut c, Field::Concentration, "25", now);
        edit(&mut c, Field::ConcentrationUnit, "mg/ml", now);
        c.advance(now);
        c.advance(now);
        c.advance(now);
        c.finish(NextAction::NewDose, now);
        c.skip_feedback(now);

        assert_eq!(c.state().screen, Screen::Capture);
    }
}
