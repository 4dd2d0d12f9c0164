//! Post-result feedback sequence.
//!
//! After a successful calculation the chosen next action is parked in a
//! [`FeedbackContext`] while the user walks through a short series of
//! optional stages. Skip and submit on every stage lead to the same
//! continuation, so the sequence always reaches its end.

use crate::prompts::PromptState;
use crate::{DoseSummary, InjectionSite};
use serde::Serialize;

/// What to do once the feedback sequence is over
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NextAction {
    /// Reset and go idle on the intro screen
    StartOver,
    /// Reset and enter a new dose the same way as the last one
    NewDose,
    /// Reset and go back to label capture
    ScanAgain,
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackStage {
    InjectionSite,
    Orientation,
    PmfSurvey,
    OutcomeFeedback,
}

/// Payload of a submitted stage
#[derive(Clone, Debug, PartialEq)]
pub enum FeedbackAnswer {
    Site(InjectionSite),
    Orientation { suppress: bool },
    PmfSurvey { disappointment: PmfAnswer },
    Outcome { note: String },
}

impl FeedbackAnswer {
    pub fn stage(&self) -> FeedbackStage {
        match self {
            FeedbackAnswer::Site(_) => FeedbackStage::InjectionSite,
            FeedbackAnswer::Orientation { .. } => FeedbackStage::Orientation,
            FeedbackAnswer::PmfSurvey { .. } => FeedbackStage::PmfSurvey,
            FeedbackAnswer::Outcome { .. } => FeedbackStage::OutcomeFeedback,
        }
    }
}

/// "How would you feel if you could no longer use this app?"
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PmfAnswer {
    VeryDisappointed,
    SomewhatDisappointed,
    NotDisappointed,
}

/// User reply to the current stage
#[derive(Clone, Debug, PartialEq)]
pub enum FeedbackResponse {
    Submit(FeedbackAnswer),
    Skip,
    /// Only meaningful on the injection-site stage: back to the result
    Cancel,
}

/// State of an open feedback sequence
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct FeedbackContext {
    pub summary: DoseSummary,
    pub next_action: NextAction,
    pub stage: FeedbackStage,
    pub suggested_site: Option<InjectionSite>,
    plan: Vec<FeedbackStage>,
}

impl FeedbackContext {
    /// Open a sequence, deciding up front which rate-limited prompts appear
    pub fn open(
        summary: DoseSummary,
        next_action: NextAction,
        prompts: &PromptState,
        suggested_site: Option<InjectionSite>,
    ) -> Self {
        let mut plan = vec![FeedbackStage::InjectionSite];
        if prompts.should_show_orientation() {
            plan.push(FeedbackStage::Orientation);
        }
        if prompts.should_show_pmf_survey() {
            plan.push(FeedbackStage::PmfSurvey);
        }
        plan.push(FeedbackStage::OutcomeFeedback);

        Self {
            summary,
            next_action,
            stage: FeedbackStage::InjectionSite,
            suggested_site,
            plan,
        }
    }

    /// Stages this sequence will show, in order
    pub fn plan(&self) -> &[FeedbackStage] {
        &self.plan
    }

    /// Move past the current stage. Returns the new stage, or `None` when
    /// the sequence is finished.
    pub fn advance(&mut self) -> Option<FeedbackStage> {
        let index = self.plan.iter().position(|s| *s == self.stage)?;
        let next = self.plan.get(index + 1).copied()?;
        self.stage = next;
        Some(next)
    }

    /// Fold a submitted answer into the dose summary
    pub fn apply(&mut self, answer: &FeedbackAnswer) {
        match answer {
            FeedbackAnswer::Site(site) => self.summary.injection_site = Some(*site),
            FeedbackAnswer::Outcome { note } => {
                let note = note.trim();
                if !note.is_empty() {
                    self.summary.outcome_note = Some(note.to_string());
                }
            }
            FeedbackAnswer::Orientation { .. } | FeedbackAnswer::PmfSurvey { .. } => {}
        }
    }
}
