use std::fmt;
use std::time::Duration;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

use crate::error::PhaseFailure;

/// The two execution paths of a job. Cross always runs before Origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Cross,
    Origin,
}

impl Route {
    pub fn as_str(self) -> &'static str {
        match self {
            Route::Cross => "cross",
            Route::Origin => "origin",
        }
    }

    /// Provenance `source_mode` the ranking stage must report for this route.
    pub fn expected_source_mode(self) -> &'static str {
        match self {
            Route::Cross => "signature",
            Route::Origin => "ctgov",
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Route status. Only `NotRun` may change, and only once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStatus {
    NotRun,
    Success,
    Failed,
    Skipped,
}

impl fmt::Display for RouteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteStatus::NotRun => write!(f, "not_run"),
            RouteStatus::Success => write!(f, "success"),
            RouteStatus::Failed => write!(f, "failed"),
            RouteStatus::Skipped => write!(f, "skipped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("route {route}: cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub route: Route,
    pub from: RouteStatus,
    pub to: RouteStatus,
}

/// One timed step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepTiming {
    pub name: String,
    pub duration: Duration,
}

/// Step timings in execution order. Serializes as `{name: seconds}`
/// without reordering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepTimings(Vec<StepTiming>);

impl StepTimings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, duration: Duration) {
        self.0.push(StepTiming {
            name: name.into(),
            duration,
        });
    }

    pub fn extend(&mut self, other: &StepTimings) {
        self.0.extend(other.0.iter().cloned());
    }

    #[cfg(test)]
    pub fn names(&self) -> Vec<String> {
        self.0.iter().map(|t| t.name.clone()).collect()
    }
}

impl Serialize for StepTimings {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for timing in &self.0 {
            let secs = (timing.duration.as_secs_f64() * 1000.0).round() / 1000.0;
            map.serialize_entry(&timing.name, &secs)?;
        }
        map.end()
    }
}

/// Per-route sub-record of a run.
#[derive(Debug, Clone)]
pub struct RouteExecution {
    pub route: Route,
    status: RouteStatus,
    pub timings: StepTimings,
    pub failure: Option<PhaseFailure>,
}

impl RouteExecution {
    pub fn new(route: Route) -> Self {
        Self {
            route,
            status: RouteStatus::NotRun,
            timings: StepTimings::new(),
            failure: None,
        }
    }

    pub fn status(&self) -> RouteStatus {
        self.status
    }

    /// Apply a status change, refusing any backward or repeated transition.
    pub fn advance(&mut self, next: RouteStatus) -> Result<(), InvalidTransition> {
        if self.status != RouteStatus::NotRun || next == RouteStatus::NotRun {
            return Err(InvalidTransition {
                route: self.route,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Record a timed step under `<route>.<name>`.
    pub fn record_step(&mut self, name: &str, duration: Duration) {
        self.timings.push(format!("{}.{name}", self.route), duration);
    }

    pub fn succeed(&mut self) -> Result<(), InvalidTransition> {
        self.advance(RouteStatus::Success)
    }

    pub fn fail(&mut self, failure: PhaseFailure) -> Result<(), InvalidTransition> {
        self.advance(RouteStatus::Failed)?;
        self.failure = Some(failure);
        Ok(())
    }

    pub fn skip(&mut self, reason: PhaseFailure) -> Result<(), InvalidTransition> {
        self.advance(RouteStatus::Skipped)?;
        self.failure = Some(reason);
        Ok(())
    }
}
