use crate::{config::ObjectiveConfig, executors::RunResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// `a / b`, where a zero denominator gives `a * inf` (so `0 / 0` is NaN)
pub fn ratio(a: f64, b: f64) -> f64 {
    if b == 0.0 {
        a * f64::INFINITY
    } else {
        a / b
    }
}

/// `|a - b| <= max(rel_tol * max(|a|, |b|), abs_tol)`. Infinities are never close.
pub fn is_close(a: f64, b: f64, rel_tol: f64, abs_tol: f64) -> bool {
    // a timed out run must never tie with a finished one
    if a.is_infinite() || b.is_infinite() {
        return false;
    }

    (a - b).abs() <= (rel_tol * a.abs().max(b.abs())).max(abs_tol)
}

/// Resource used to break ties between runs of similar time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecondaryMetric {
    /// megabyte-seconds
    #[default]
    Memory,
    /// vcore-seconds
    Vcores,
    /// ties stay ties
    None,
}

/// What the objective sees of a run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Score {
    pub time: f64,
    pub size: f64,
}

/// Minimize run time, and among runs whose times are close minimize the
/// secondary resource
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinimizeTimeAndResource {
    pub rel_tol: f64,
    pub abs_tol: f64,
    pub secondary: SecondaryMetric,
}

impl Default for MinimizeTimeAndResource {
    fn default() -> Self {
        Self {
            rel_tol: 1e-9,
            abs_tol: 0.0,
            secondary: SecondaryMetric::default(),
        }
    }
}

impl From<&ObjectiveConfig> for MinimizeTimeAndResource {
    fn from(config: &ObjectiveConfig) -> Self {
        Self {
            rel_tol: config.rel_tol,
            abs_tol: config.abs_tol,
            secondary: config.secondary,
        }
    }
}

impl MinimizeTimeAndResource {
    pub fn score(&self, result: &RunResult) -> Score {
        let size = match self.secondary {
            SecondaryMetric::Memory => result.metrics.memory_seconds,
            SecondaryMetric::Vcores => result.metrics.vcore_seconds,
            SecondaryMetric::None => 0.0,
        };

        Score {
            time: result.time,
            size,
        }
    }

    fn close(&self, a: &Score, b: &Score) -> bool {
        is_close(a.time, b.time, self.rel_tol, self.abs_tol)
    }

    /// `Less` means `a` is the better score. Incomparable (NaN) values are equal.
    pub fn compare_scores(&self, a: &Score, b: &Score) -> Ordering {
        let ordering = if self.close(a, b) {
            a.size.partial_cmp(&b.size)
        } else {
            a.time.partial_cmp(&b.time)
        };

        ordering.unwrap_or(Ordering::Equal)
    }

    /// how much worse `a` is than `b`, as a ratio of time or of size
    pub fn relative_scores(&self, a: &Score, b: &Score) -> f64 {
        if self.close(a, b) {
            ratio(a.size, b.size)
        } else {
            ratio(a.time, b.time)
        }
    }

    pub fn compare(&self, a: &RunResult, b: &RunResult) -> Ordering {
        self.compare_scores(&self.score(a), &self.score(b))
    }

    pub fn relative(&self, a: &RunResult, b: &RunResult) -> f64 {
        self.relative_scores(&self.score(a), &self.score(b))
    }

    pub fn display(&self, result: &RunResult) -> String {
        let score = self.score(result);

        format!("time={:.2}, size={:.2}", score.time, score.size)
    }
}
