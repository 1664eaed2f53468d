/// Iterative tie-point outlier rejection with adaptive threshold widening.
///
/// Removing too many points in a single pass degrades the alignment, so
/// when a selection would cut more than the guard fraction the threshold
/// is widened and the selection retried without removing anything. Not
/// part of the default run modes; kept available for manual refinement
/// after alignment.
use crate::console::banner;
use crate::engine::{FilterMetric, OptimizeParams, ReconstructionEngine};
use crate::error::Result;
use crate::project::Chunk;

/// Tuning for one metric: initial/target threshold, widening step and
/// ceiling, and the guard fraction (1/guard_divisor of all points).
#[derive(Debug, Clone)]
pub struct FilterProfile {
    pub metric: FilterMetric,
    pub init_threshold: f64,
    pub target: f64,
    pub widen_step: f64,
    pub widen_limit: Option<f64>,
    pub guard_divisor: usize,
}

impl FilterProfile {
    pub fn reconstruction_uncertainty() -> Self {
        Self {
            metric: FilterMetric::ReconstructionUncertainty,
            init_threshold: 15.0,
            target: 15.0,
            widen_step: 1.0,
            widen_limit: Some(50.0),
            guard_divisor: 2,
        }
    }

    pub fn projection_accuracy() -> Self {
        Self {
            metric: FilterMetric::ProjectionAccuracy,
            init_threshold: 2.0,
            target: 2.0,
            widen_step: 0.1,
            widen_limit: Some(3.0),
            guard_divisor: 2,
        }
    }

    pub fn reprojection_error() -> Self {
        Self {
            metric: FilterMetric::ReprojectionError,
            init_threshold: 0.3,
            target: 0.3,
            widen_step: 0.01,
            widen_limit: None,
            guard_divisor: 10,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReductionReport {
    /// Passes that removed points and re-optimized.
    pub passes: u32,
    /// Total points removed; non-decreasing across passes.
    pub removed: usize,
    pub final_max: f64,
    /// The metric stopped improving without reaching the target.
    pub stalled: bool,
}

fn max_value(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

/// Reduce tie-point outliers until the metric's maximum falls at or below
/// the profile target. Each removal pass re-optimizes the cameras and
/// re-estimates the metric before the threshold resets.
pub fn reduce_outliers(
    engine: &mut dyn ReconstructionEngine,
    chunk: &mut Chunk,
    profile: &FilterProfile,
) -> Result<ReductionReport> {
    banner(&format!(
        "RE-ALIGNING CAMERAS, REDUCING {}",
        profile.metric.label().to_uppercase()
    ));

    let mut report = ReductionReport::default();
    if chunk.tie_points.as_ref().is_none_or(|tp| tp.is_empty()) {
        println!("no tie points to refine; run alignment first");
        return Ok(report);
    }

    let mut values = engine.estimate_tie_point_metric(chunk, profile.metric)?;
    let mut threshold = profile.init_threshold;

    loop {
        let current_max = max_value(&values);
        if values.is_empty() || current_max <= profile.target {
            report.final_max = if values.is_empty() { 0.0 } else { current_max };
            break;
        }

        let selected: Vec<usize> = values
            .iter()
            .enumerate()
            .filter(|(_, value)| **value > threshold)
            .map(|(index, _)| index)
            .collect();

        // Guard: a cut this deep gets a wider threshold instead, as long
        // as the ceiling allows.
        let within_ceiling = profile.widen_limit.is_none_or(|limit| threshold <= limit);
        if selected.len() * profile.guard_divisor >= values.len() && within_ceiling {
            threshold += profile.widen_step;
            println!("threshold widened to {threshold:.3}");
            continue;
        }

        let removed_now = selected.len();
        chunk.remove_tie_points(&selected);
        engine.optimize_cameras(chunk, &OptimizeParams::standard())?;
        let new_values = engine.estimate_tie_point_metric(chunk, profile.metric)?;
        let new_max = max_value(&new_values);

        if removed_now == 0 && new_max >= current_max {
            println!(
                "metric stalled at {new_max:.3} (target {:.3}); stopping",
                profile.target
            );
            report.final_max = new_max;
            report.stalled = true;
            break;
        }

        values = new_values;
        report.removed += removed_now;
        report.passes += 1;
        threshold = profile.init_threshold;
    }

    // Tighten tie-point accuracy and fit the full lens model once the
    // projection-accuracy pass converges.
    if profile.metric == FilterMetric::ProjectionAccuracy && !report.stalled {
        chunk.tie_point_accuracy = 0.1;
        let params = OptimizeParams {
            tie_point_accuracy: Some(0.1),
            ..OptimizeParams::full()
        };
        engine.optimize_cameras(chunk, &params)?;
    }

    Ok(report)
}
