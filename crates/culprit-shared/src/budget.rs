//! Stage-level latency budgets and timings for one diagnosis.
//!
//! Pure decision functions; `StageClock` wraps `Instant` for real timing.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Stages of a diagnosis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    EventHistory,
    RuleIndex,
    Detection,
    Aggregation,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EventHistory => write!(f, "event_history"),
            Self::RuleIndex => write!(f, "rule_index"),
            Self::Detection => write!(f, "detection"),
            Self::Aggregation => write!(f, "aggregation"),
        }
    }
}

/// Budgets per stage, in milliseconds.
///
/// The two fetch stages are hard timeouts. Detection and aggregation are
/// in-memory; their budgets only flag slow runs in metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageBudget {
    pub event_history_ms: u64,
    pub rule_index_ms: u64,
    pub detection_ms: u64,
    pub aggregation_ms: u64,
}

impl Default for StageBudget {
    fn default() -> Self {
        Self {
            event_history_ms: 5_000,
            rule_index_ms: 8_000,
            detection_ms: 250,
            aggregation_ms: 50,
        }
    }
}

impl StageBudget {
    pub fn get(&self, stage: Stage) -> u64 {
        match stage {
            Stage::EventHistory => self.event_history_ms,
            Stage::RuleIndex => self.rule_index_ms,
            Stage::Detection => self.detection_ms,
            Stage::Aggregation => self.aggregation_ms,
        }
    }

    pub fn duration(&self, stage: Stage) -> Duration {
        Duration::from_millis(self.get(stage))
    }
}

/// Budget check result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetCheck {
    Ok,
    StageExceeded {
        stage: Stage,
        budget_ms: u64,
        elapsed_ms: u64,
    },
}

impl BudgetCheck {
    pub fn is_exceeded(&self) -> bool {
        !matches!(self, Self::Ok)
    }
}

/// Pure function: check if stage elapsed time exceeds budget.
pub fn check_stage_budget(stage: Stage, elapsed_ms: u64, budget: &StageBudget) -> BudgetCheck {
    let stage_budget = budget.get(stage);
    if elapsed_ms > stage_budget {
        BudgetCheck::StageExceeded {
            stage,
            budget_ms: stage_budget,
            elapsed_ms,
        }
    } else {
        BudgetCheck::Ok
    }
}

/// Timing record for one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub elapsed_ms: u64,
    pub budget_ms: u64,
    pub exceeded: bool,
    /// Stage did not run (e.g. events were supplied by the caller)
    #[serde(default)]
    pub skipped: bool,
}

impl StageTiming {
    pub fn new(stage: Stage, elapsed_ms: u64, budget: &StageBudget) -> Self {
        let budget_ms = budget.get(stage);
        Self {
            stage,
            elapsed_ms,
            budget_ms,
            exceeded: check_stage_budget(stage, elapsed_ms, budget).is_exceeded(),
            skipped: false,
        }
    }

    pub fn skipped(stage: Stage, budget: &StageBudget) -> Self {
        Self {
            skipped: true,
            ..Self::new(stage, 0, budget)
        }
    }
}

/// Measures stages against a budget and collects their timings.
#[derive(Debug, Clone)]
pub struct StageClock {
    request_start: Instant,
    budget: StageBudget,
    timings: Vec<StageTiming>,
}

impl StageClock {
    pub fn new(budget: StageBudget) -> Self {
        Self {
            request_start: Instant::now(),
            budget,
            timings: Vec::new(),
        }
    }

    pub fn budget(&self) -> &StageBudget {
        &self.budget
    }

    /// Record a stage that started at `started`.
    pub fn record(&mut self, stage: Stage, started: Instant) -> &StageTiming {
        let elapsed = started.elapsed().as_millis() as u64;
        self.timings.push(StageTiming::new(stage, elapsed, &self.budget));
        &self.timings[self.timings.len() - 1]
    }

    /// Record a stage measured elsewhere (e.g. inside a concurrent fetch).
    pub fn record_elapsed(&mut self, stage: Stage, elapsed_ms: u64) {
        self.timings.push(StageTiming::new(stage, elapsed_ms, &self.budget));
    }

    pub fn record_skipped(&mut self, stage: Stage) {
        self.timings.push(StageTiming::skipped(stage, &self.budget));
    }

    pub fn total_elapsed_ms(&self) -> u64 {
        self.request_start.elapsed().as_millis() as u64
    }

    pub fn into_timings(self) -> Vec<StageTiming> {
        self.timings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_stage_budget() {
        let budget = StageBudget::default();
        assert_eq!(
            check_stage_budget(Stage::EventHistory, 4_000, &budget),
            BudgetCheck::Ok
        );
        assert!(matches!(
            check_stage_budget(Stage::EventHistory, 6_000, &budget),
            BudgetCheck::StageExceeded {
                stage: Stage::EventHistory,
                budget_ms: 5_000,
                elapsed_ms: 6_000,
            }
        ));
    }

    #[test]
    fn test_stage_timing_flags() {
        let budget = StageBudget::default();
        let timing = StageTiming::new(Stage::RuleIndex, 9_000, &budget);
        assert!(timing.exceeded);
        assert!(!timing.skipped);

        let skipped = StageTiming::skipped(Stage::EventHistory, &budget);
        assert!(skipped.skipped);
        assert!(!skipped.exceeded);
        assert_eq!(skipped.elapsed_ms, 0);
    }

    #[test]
    fn test_clock_collects_in_order() {
        let mut clock = StageClock::new(StageBudget::default());
        clock.record_skipped(Stage::EventHistory);
        clock.record(Stage::Detection, Instant::now());
        let timings = clock.into_timings();
        assert_eq!(timings.len(), 2);
        assert_eq!(timings[1].stage, Stage::Detection);
    }
}
