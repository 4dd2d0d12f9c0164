//! Analytics collaborator: named milestone events, fire-and-forget.

use crate::feedback::PmfAnswer;
use crate::{DoseUnit, InjectionSite};
use serde::Serialize;
use std::cell::RefCell;

/// Surveys the feedback sequence can show
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Survey {
    Orientation,
    ProductMarketFit,
    Outcome,
}

/// Milestones reported by the workflow
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AnalyticsEvent {
    CalculationCompleted { success: bool },
    DoseCompleted { dose_unit: DoseUnit, volume_ml: f64 },
    InjectionSiteSelected { site: InjectionSite },
    SurveyShown { survey: Survey },
    SurveyAnswered {
        survey: Survey,
        #[serde(skip_serializing_if = "Option::is_none")]
        pmf_answer: Option<PmfAnswer>,
    },
    SurveySkipped { survey: Survey },
    SessionRecovered { idle_minutes: i64 },
}

/// Receives analytics events; implementations must not block or fail loudly
pub trait AnalyticsSink {
    fn record(&self, event: AnalyticsEvent);
}

/// Emits each event as a structured tracing record under the `analytics`
/// target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAnalytics;

impl AnalyticsSink for TracingAnalytics {
    fn record(&self, event: AnalyticsEvent) {
        match serde_json::to_string(&event) {
            Ok(payload) => tracing::info!(target: "analytics", %payload, "event"),
            Err(e) => tracing::warn!(target: "analytics", "Unserializable event {:?}: {}", event, e),
        }
    }
}

/// Keeps events in memory, for tests and for presentation layers that
/// forward them later
#[derive(Debug, Default)]
pub struct RecordingAnalytics {
    events: RefCell<Vec<AnalyticsEvent>>,
}

impl RecordingAnalytics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AnalyticsEvent> {
        self.events.borrow().clone()
    }
}

impl AnalyticsSink for RecordingAnalytics {
    fn record(&self, event: AnalyticsEvent) {
        self.events.borrow_mut().push(event);
    }
}
