use crate::model::Sample;

// ═══════════════════════════════════════════════════════════════════
// Range functions
// ═══════════════════════════════════════════════════════════════════

/// A function evaluated per step over a matrix selector's sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeFunc {
    // Counter functions
    Rate,
    Irate,
    Increase,
    // Gauge functions
    Delta,
    Idelta,
    // Window statistics
    Changes,
    Resets,
    // Aggregation over time
    SumOverTime,
    AvgOverTime,
    MinOverTime,
    MaxOverTime,
    CountOverTime,
    StddevOverTime,
    StdvarOverTime,
    LastOverTime,
    PresentOverTime,
}

impl RangeFunc {
    pub fn from_name(name: &str) -> Option<RangeFunc> {
        match name {
            "rate" => Some(RangeFunc::Rate),
            "irate" => Some(RangeFunc::Irate),
            "increase" => Some(RangeFunc::Increase),
            "delta" => Some(RangeFunc::Delta),
            "idelta" => Some(RangeFunc::Idelta),
            "changes" => Some(RangeFunc::Changes),
            "resets" => Some(RangeFunc::Resets),
            "sum_over_time" => Some(RangeFunc::SumOverTime),
            "avg_over_time" => Some(RangeFunc::AvgOverTime),
            "min_over_time" => Some(RangeFunc::MinOverTime),
            "max_over_time" => Some(RangeFunc::MaxOverTime),
            "count_over_time" => Some(RangeFunc::CountOverTime),
            "stddev_over_time" => Some(RangeFunc::StddevOverTime),
            "stdvar_over_time" => Some(RangeFunc::StdvarOverTime),
            "last_over_time" => Some(RangeFunc::LastOverTime),
            "present_over_time" => Some(RangeFunc::PresentOverTime),
            _ => None,
        }
    }
}

/// Dispatch a range function over the window `[window_start, window_end]`.
/// `samples` holds exactly the samples inside that window, in timestamp
/// order. Returns `None` when the window yields no output sample.
pub fn evaluate_range_func(
    func: RangeFunc,
    samples: &[Sample],
    window_start: i64,
    window_end: i64,
) -> Option<f64> {
    match func {
        RangeFunc::Rate => extrapolated_delta(samples, window_start, window_end, true, true),
        RangeFunc::Increase => extrapolated_delta(samples, window_start, window_end, true, false),
        RangeFunc::Delta => extrapolated_delta(samples, window_start, window_end, false, false),
        RangeFunc::Irate => instant_delta(samples, true),
        RangeFunc::Idelta => instant_delta(samples, false),
        RangeFunc::Changes => compute_changes(samples),
        RangeFunc::Resets => compute_resets(samples),
        RangeFunc::SumOverTime => compute_sum_over_time(samples),
        RangeFunc::AvgOverTime => compute_avg_over_time(samples),
        RangeFunc::MinOverTime => compute_min_over_time(samples),
        RangeFunc::MaxOverTime => compute_max_over_time(samples),
        RangeFunc::CountOverTime => compute_count_over_time(samples),
        RangeFunc::StddevOverTime => compute_stdvar_over_time(samples).map(f64::sqrt),
        RangeFunc::StdvarOverTime => compute_stdvar_over_time(samples),
        RangeFunc::LastOverTime => samples.last().map(|s| s.v),
        RangeFunc::PresentOverTime => (!samples.is_empty()).then_some(1.0),
    }
}

/// Counter delta over the window. On a counter reset (`s[i].v < s[i-1].v`)
/// the pre-reset level `s[i-1].v` is added to the accumulated delta.
fn window_delta(samples: &[Sample], counter: bool) -> f64 {
    if !counter {
        return samples[samples.len() - 1].v - samples[0].v;
    }
    let mut delta = 0.0;
    for w in samples.windows(2) {
        if w[1].v >= w[0].v {
            delta += w[1].v - w[0].v;
        } else {
            delta += w[0].v;
        }
    }
    delta
}

/// `rate`/`increase`/`delta` with edge extrapolation: the sampled interval
/// is extended to a window edge when the edge sample lies within 1.1× the
/// average sample spacing of it, and by half an average spacing otherwise.
/// The extension never reaches past the window, so the result is capped at
/// `window_end`. Counter resets are folded in before extrapolation.
fn extrapolated_delta(
    samples: &[Sample],
    window_start: i64,
    window_end: i64,
    counter: bool,
    per_second: bool,
) -> Option<f64> {
    if samples.len() < 2 {
        return None;
    }
    let first = samples[0];
    let last = samples[samples.len() - 1];
    let sampled_s = (last.t - first.t) as f64 / 1000.0;
    let range_s = (window_end - window_start) as f64 / 1000.0;
    if sampled_s <= 0.0 || range_s <= 0.0 {
        return None;
    }

    let delta = window_delta(samples, counter);

    let avg_s = sampled_s / (samples.len() - 1) as f64;
    let threshold = avg_s * 1.1;
    let to_start = (first.t - window_start) as f64 / 1000.0;
    let to_end = (window_end - last.t) as f64 / 1000.0;

    let mut interval = sampled_s;
    interval += if to_start <= threshold { to_start } else { avg_s / 2.0 };
    interval += if to_end <= threshold { to_end } else { avg_s / 2.0 };

    let total = delta * (interval / sampled_s);
    Some(if per_second { total / range_s } else { total })
}

/// `irate`/`idelta`: delta between the last two samples, per second for
/// `irate` with the same reset rule as `rate`.
fn instant_delta(samples: &[Sample], counter: bool) -> Option<f64> {
    if samples.len() < 2 {
        return None;
    }
    let prev = samples[samples.len() - 2];
    let last = samples[samples.len() - 1];
    let dt_s = (last.t - prev.t) as f64 / 1000.0;
    if dt_s <= 0.0 {
        return None;
    }
    let delta = window_delta(&samples[samples.len() - 2..], counter);
    Some(if counter { delta / dt_s } else { delta })
}

fn compute_changes(samples: &[Sample]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let count = samples
        .windows(2)
        .filter(|w| w[1].v != w[0].v && !(w[1].v.is_nan() && w[0].v.is_nan()))
        .count();
    Some(count as f64)
}

fn compute_resets(samples: &[Sample]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    Some(samples.windows(2).filter(|w| w[1].v < w[0].v).count() as f64)
}

fn compute_sum_over_time(samples: &[Sample]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    Some(samples.iter().map(|s| s.v).sum())
}

fn compute_avg_over_time(samples: &[Sample]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    Some(samples.iter().map(|s| s.v).sum::<f64>() / samples.len() as f64)
}

fn compute_min_over_time(samples: &[Sample]) -> Option<f64> {
    samples.iter().map(|s| s.v).reduce(f64::min)
}

fn compute_max_over_time(samples: &[Sample]) -> Option<f64> {
    samples.iter().map(|s| s.v).reduce(f64::max)
}

fn compute_count_over_time(samples: &[Sample]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    Some(samples.len() as f64)
}

/// Population variance via Welford's algorithm, single pass.
fn compute_stdvar_over_time(samples: &[Sample]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let mut count = 0.0;
    let mut mean = 0.0;
    let mut m2 = 0.0;
    for s in samples {
        count += 1.0;
        let d = s.v - mean;
        mean += d / count;
        m2 += d * (s.v - mean);
    }
    Some(m2 / count)
}

// ═══════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(pairs: &[(i64, f64)]) -> Vec<Sample> {
        pairs.iter().map(|&(t, v)| Sample::new(t, v)).collect()
    }

    fn assert_approx(actual: f64, expected: f64, epsilon: f64) {
        assert!(
            (actual - expected).abs() < epsilon,
            "expected {expected}, got {actual} (diff: {})",
            (actual - expected).abs()
        );
    }

    #[test]
    fn test_rate_full_window_coverage() {
        // Samples cover the window end-to-end, so no extrapolation applies.
        let s = samples(&[(0, 0.0), (15_000, 5.0), (30_000, 10.0), (45_000, 15.0), (60_000, 20.0)]);
        let rate = evaluate_range_func(RangeFunc::Rate, &s, 0, 60_000).unwrap();
        assert_approx(rate, 20.0 / 60.0, 1e-9);
    }

    #[test]
    fn test_rate_counter_reset_adds_pre_reset_level() {
        let s = samples(&[(0, 5.0), (10_000, 7.0), (20_000, 3.0), (30_000, 4.0)]);
        // (7-5) + 7 + (4-3) = 10 over 30s.
        let rate = evaluate_range_func(RangeFunc::Rate, &s, 0, 30_000).unwrap();
        assert_approx(rate, 10.0 / 30.0, 1e-9);
    }

    #[test]
    fn test_rate_extrapolates_to_near_edges() {
        // Samples every 10s from 10s to 50s in a 60s window: both edges lie
        // within 1.1x the average spacing, so the interval extends to the
        // full window.
        let s = samples(&[
            (10_000, 0.0),
            (20_000, 10.0),
            (30_000, 20.0),
            (40_000, 30.0),
            (50_000, 40.0),
        ]);
        let rate = evaluate_range_func(RangeFunc::Rate, &s, 0, 60_000).unwrap();
        assert_approx(rate, 40.0 * (60.0 / 40.0) / 60.0, 1e-9);
    }

    #[test]
    fn test_rate_extrapolates_half_step_at_far_edges() {
        // First sample 25s from the window start, beyond 1.1 * 10s, so each
        // edge only contributes half an average interval.
        let s = samples(&[(25_000, 0.0), (35_000, 10.0), (45_000, 20.0)]);
        let rate = evaluate_range_func(RangeFunc::Rate, &s, 0, 60_000).unwrap();
        let interval = 20.0 + 5.0 + 5.0;
        assert_approx(rate, 20.0 * (interval / 20.0) / 60.0, 1e-9);
    }

    #[test]
    fn test_rate_requires_two_samples() {
        assert_eq!(evaluate_range_func(RangeFunc::Rate, &[], 0, 60_000), None);
        let one = samples(&[(10_000, 5.0)]);
        assert_eq!(evaluate_range_func(RangeFunc::Rate, &one, 0, 60_000), None);
    }

    #[test]
    fn test_increase_is_rate_times_range() {
        let s = samples(&[(10_000, 100.0), (20_000, 200.0)]);
        let rate = evaluate_range_func(RangeFunc::Rate, &s, 10_000, 20_000).unwrap();
        let inc = evaluate_range_func(RangeFunc::Increase, &s, 10_000, 20_000).unwrap();
        assert_approx(inc, rate * 10.0, 1e-9);
        assert_approx(inc, 100.0, 1e-9);
    }

    #[test]
    fn test_delta_is_not_reset_corrected() {
        let s = samples(&[(0, 100.0), (15_000, 50.0), (30_000, 75.0)]);
        let delta = evaluate_range_func(RangeFunc::Delta, &s, 0, 30_000).unwrap();
        assert_approx(delta, -25.0, 1e-9);
    }

    #[test]
    fn test_irate_uses_last_two_samples() {
        let s = samples(&[(0, 0.0), (10_000, 100.0), (20_000, 150.0)]);
        let irate = evaluate_range_func(RangeFunc::Irate, &s, 0, 20_000).unwrap();
        assert_approx(irate, 5.0, 1e-9);
    }

    #[test]
    fn test_irate_counter_reset() {
        let s = samples(&[(0, 10.0), (10_000, 3.0)]);
        let irate = evaluate_range_func(RangeFunc::Irate, &s, 0, 10_000).unwrap();
        assert_approx(irate, 1.0, 1e-9);
    }

    #[test]
    fn test_idelta() {
        let s = samples(&[(0, 1.0), (10_000, 5.0), (20_000, 2.0)]);
        let idelta = evaluate_range_func(RangeFunc::Idelta, &s, 0, 20_000).unwrap();
        assert_approx(idelta, -3.0, 1e-9);
    }

    #[test]
    fn test_changes_and_resets() {
        let s = samples(&[(0, 1.0), (1000, 1.0), (2000, 3.0), (3000, 2.0), (4000, 2.0)]);
        assert_approx(evaluate_range_func(RangeFunc::Changes, &s, 0, 4000).unwrap(), 2.0, 1e-9);
        assert_approx(evaluate_range_func(RangeFunc::Resets, &s, 0, 4000).unwrap(), 1.0, 1e-9);
    }

    #[test]
    fn test_over_time_family() {
        let s = samples(&[(0, 4.0), (1000, 1.0), (2000, 7.0)]);
        assert_approx(evaluate_range_func(RangeFunc::SumOverTime, &s, 0, 2000).unwrap(), 12.0, 1e-9);
        assert_approx(evaluate_range_func(RangeFunc::AvgOverTime, &s, 0, 2000).unwrap(), 4.0, 1e-9);
        assert_approx(evaluate_range_func(RangeFunc::MinOverTime, &s, 0, 2000).unwrap(), 1.0, 1e-9);
        assert_approx(evaluate_range_func(RangeFunc::MaxOverTime, &s, 0, 2000).unwrap(), 7.0, 1e-9);
        assert_approx(evaluate_range_func(RangeFunc::CountOverTime, &s, 0, 2000).unwrap(), 3.0, 1e-9);
        assert_approx(evaluate_range_func(RangeFunc::LastOverTime, &s, 0, 2000).unwrap(), 7.0, 1e-9);
        assert_approx(evaluate_range_func(RangeFunc::PresentOverTime, &s, 0, 2000).unwrap(), 1.0, 1e-9);
    }

    #[test]
    fn test_over_time_empty_window() {
        for func in [
            RangeFunc::SumOverTime,
            RangeFunc::AvgOverTime,
            RangeFunc::MinOverTime,
            RangeFunc::MaxOverTime,
            RangeFunc::CountOverTime,
            RangeFunc::StddevOverTime,
            RangeFunc::StdvarOverTime,
            RangeFunc::LastOverTime,
            RangeFunc::PresentOverTime,
        ] {
            assert_eq!(evaluate_range_func(func, &[], 0, 1000), None, "{func:?}");
        }
    }

    #[test]
    fn test_stdvar_welford() {
        let s = samples(&[(0, 1.0), (1000, 2.0), (2000, 3.0), (3000, 4.0)]);
        assert_approx(evaluate_range_func(RangeFunc::StdvarOverTime, &s, 0, 3000).unwrap(), 1.25, 1e-9);
        assert_approx(
            evaluate_range_func(RangeFunc::StddevOverTime, &s, 0, 3000).unwrap(),
            1.25f64.sqrt(),
            1e-9,
        );
    }

    #[test]
    fn test_stdvar_constant_series_is_zero() {
        let s = samples(&[(0, 42.0), (1000, 42.0), (2000, 42.0)]);
        assert_approx(evaluate_range_func(RangeFunc::StdvarOverTime, &s, 0, 2000).unwrap(), 0.0, 1e-12);
    }

    #[test]
    fn test_max_over_time_ignores_nan() {
        let s = samples(&[(0, f64::NAN), (1000, 3.0)]);
        assert_approx(evaluate_range_func(RangeFunc::MaxOverTime, &s, 0, 1000).unwrap(), 3.0, 1e-9);
    }

    #[test]
    fn test_from_name() {
        assert_eq!(RangeFunc::from_name("rate"), Some(RangeFunc::Rate));
        assert_eq!(RangeFunc::from_name("stddev_over_time"), Some(RangeFunc::StddevOverTime));
        assert_eq!(RangeFunc::from_name("histogram_quantile"), None);
    }
}
