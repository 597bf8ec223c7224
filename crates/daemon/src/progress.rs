//! Weighted multi-stage progress aggregation.
//!
//! Engines report `(stage, fraction)` pairs; [`ProgressAggregator`] folds them
//! into one overall percentage that never goes down within a run, no matter
//! how out-of-order or repetitive the reports are.

/// Weight given to stages that were not declared up front.
pub const DEFAULT_STAGE_WEIGHT: f32 = 1.0;

/// A declared stage of a run with its relative weight.
#[derive(Debug, Clone, PartialEq)]
pub struct StagePlan {
    pub name: String,
    pub weight: f32,
}

impl StagePlan {
    pub fn new(name: impl Into<String>, weight: f32) -> Self {
        Self {
            name: name.into(),
            weight,
        }
    }
}

#[derive(Debug, Clone)]
struct StageSlot {
    name: String,
    weight: f32,
    completed: bool,
}

/// Folds stage updates into a monotonic 0-100 percentage.
#[derive(Debug, Clone)]
pub struct ProgressAggregator {
    stages: Vec<StageSlot>,
    current: Option<usize>,
    last_percent: f32,
}

fn sanitize_weight(weight: f32) -> f32 {
    if weight.is_finite() && weight > 0.0 {
        weight
    } else {
        DEFAULT_STAGE_WEIGHT
    }
}

impl ProgressAggregator {
    /// Start a run with the given stage plan.
    ///
    /// Non-positive or non-finite weights fall back to
    /// [`DEFAULT_STAGE_WEIGHT`], so the total is always positive.
    pub fn new(plan: impl IntoIterator<Item = StagePlan>) -> Self {
        let stages = plan
            .into_iter()
            .map(|stage| StageSlot {
                name: stage.name,
                weight: sanitize_weight(stage.weight),
                completed: false,
            })
            .collect();
        Self {
            stages,
            current: None,
            last_percent: 0.0,
        }
    }

    /// Name of the stage most recently reported.
    pub fn current_stage(&self) -> Option<&str> {
        self.current.map(|idx| self.stages[idx].name.as_str())
    }

    /// Last value returned.
    pub fn percent(&self) -> f32 {
        self.last_percent
    }

    /// Whether `stage` differs from the stage currently in progress.
    pub fn is_new_stage(&self, stage: &str) -> bool {
        self.current_stage() != Some(stage)
    }

    /// Record progress within `stage`, using [`DEFAULT_STAGE_WEIGHT`] when the
    /// stage was not declared.
    pub fn update(&mut self, stage: &str, fraction: f32) -> f32 {
        self.update_weighted(stage, None, fraction)
    }

    /// Record progress within `stage`. `weight` is only consulted when the
    /// stage is not part of the plan yet.
    pub fn update_weighted(&mut self, stage: &str, weight: Option<f32>, fraction: f32) -> f32 {
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };

        let idx = match self.stages.iter().position(|s| s.name == stage) {
            Some(idx) => idx,
            None => {
                self.stages.push(StageSlot {
                    name: stage.to_string(),
                    weight: sanitize_weight(weight.unwrap_or(DEFAULT_STAGE_WEIGHT)),
                    completed: false,
                });
                self.stages.len() - 1
            }
        };

        if self.current != Some(idx) {
            // Moving on closes the previous stage.
            if let Some(prev) = self.current {
                self.stages[prev].completed = true;
            }
            self.current = Some(idx);
        }

        let total: f32 = self.stages.iter().map(|s| s.weight).sum();
        let done: f32 = self
            .stages
            .iter()
            .enumerate()
            .filter(|(i, s)| s.completed && *i != idx)
            .map(|(_, s)| s.weight)
            .sum();
        let active = if self.stages[idx].completed {
            // Revisiting a finished stage adds nothing new.
            self.stages[idx].weight
        } else {
            self.stages[idx].weight * fraction
        };

        let raw = ((done + active) / total * 100.0).clamp(0.0, 100.0);
        if raw > self.last_percent {
            self.last_percent = raw;
        }
        self.last_percent
    }

    /// Mark the whole run finished.
    pub fn complete(&mut self) -> f32 {
        for stage in &mut self.stages {
            stage.completed = true;
        }
        self.last_percent = 100.0;
        self.last_percent
    }
}
