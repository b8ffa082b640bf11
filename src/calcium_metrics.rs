use serde::Serialize;

use crate::calcium_sync::{BoutWindow, TrialMatrix};
use crate::config::CalciumConfig;
use crate::models::{Bout, CalciumTrace, TimeIndexed};
use crate::phase_utils::{filter_window, TimeRange};
use crate::signal::{
    fit_decay, fit_exponential, linear_fit, lowpass, nan_mean, nan_std, simpson, trapezoid,
};

/// Shape metrics of the calcium signal around one lick bout. NaN marks a
/// metric that could not be computed from the available samples.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoutMetrics {
    #[serde(rename = "Bout")]
    pub bout: usize,
    #[serde(rename = "Trial Number")]
    pub trial_number: u32,
    #[serde(rename = "AUC Metric")]
    pub auc: f64,
    #[serde(rename = "Pre-Bout Calcium Slope")]
    pub pre_bout_slope: f64,
    #[serde(rename = "Pre-Bout Calcium ExpRate")]
    pub pre_bout_exp_rate: f64,
    #[serde(rename = "t One-Half")]
    pub t_one_half: f64,
    #[serde(rename = "Max Calcium")]
    pub max_calcium: f64,
}

/// Filtered values shifted so their minimum is 0.
fn smoothed(trace: &CalciumTrace, cutoff_hz: f64) -> Option<Vec<f64>> {
    let mut filtered = lowpass(&trace.values, trace.duration(), cutoff_hz)?;
    let min = filtered.iter().copied().fold(f64::INFINITY, f64::min);
    filtered.iter_mut().for_each(|v| *v -= min);
    Some(filtered)
}

/// Area under the smoothed trace, one unit per sample.
pub fn bout_auc(trace: &CalciumTrace, cutoff_hz: f64) -> f64 {
    smoothed(trace, cutoff_hz).map_or(f64::NAN, |v| trapezoid(&v, 1.0))
}

fn pre_bout(trace: &CalciumTrace, bout: &Bout, pre_bout_ms: f64) -> CalciumTrace {
    filter_window(trace, &TimeRange::between(bout.start - pre_bout_ms / 1000.0, bout.start))
}

/// Rise per second between the first and last sample before the bout.
pub fn bout_slope(trace: &CalciumTrace, bout: &Bout, pre_bout_ms: f64) -> f64 {
    let pre = pre_bout(trace, bout, pre_bout_ms);
    let (Some(first), Some(last)) = (pre.values.first(), pre.values.last()) else {
        return f64::NAN;
    };
    let duration = pre.duration();
    if pre.len() < 2 || duration == 0.0 {
        return f64::NAN;
    }
    (last - first) / duration
}

/// Rate B of `A·e^(B·t) + C` fitted to the calcium before the bout.
pub fn bout_exp_rate(trace: &CalciumTrace, bout: &Bout, pre_bout_ms: f64) -> f64 {
    let pre = pre_bout(trace, bout, pre_bout_ms);
    let Some(&t0) = pre.time_index().first() else {
        return f64::NAN;
    };
    let t: Vec<f64> = pre.times.iter().map(|t| t - t0).collect();
    fit_exponential(&t, &pre.values).map_or(f64::NAN, |curve| curve.b)
}

/// Half-life (seconds) of the smoothed trace's decay after its peak.
pub fn bout_t_one_half(trace: &CalciumTrace, cutoff_hz: f64) -> f64 {
    let Some(values) = smoothed(trace, cutoff_hz) else {
        return f64::NAN;
    };
    let peak = values
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f64)>, (i, &v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((i, v)),
        });
    let Some((peak, amplitude)) = peak else {
        return f64::NAN;
    };
    let t0 = trace.times[peak];
    let t: Vec<f64> = trace.times[peak..].iter().map(|t| t - t0).collect();
    fit_decay(&t, &values[peak..], amplitude).map_or(f64::NAN, |k| std::f64::consts::LN_2 / k)
}

/// Largest rise above the first sample.
pub fn bout_max(trace: &CalciumTrace) -> f64 {
    let Some(&first) = trace.values.first() else {
        return f64::NAN;
    };
    trace.values.iter().map(|v| v - first).fold(f64::NEG_INFINITY, f64::max)
}

pub fn bout_metrics(window: &BoutWindow, bout: &Bout, config: &CalciumConfig) -> BoutMetrics {
    let trace = &window.trace;
    BoutMetrics {
        bout: window.bout,
        trial_number: window.trial,
        auc: bout_auc(trace, config.lowpass_cutoff_hz),
        pre_bout_slope: bout_slope(trace, bout, config.pre_bout_ms),
        pre_bout_exp_rate: bout_exp_rate(trace, bout, config.pre_bout_ms),
        t_one_half: bout_t_one_half(trace, config.lowpass_cutoff_hz),
        max_calcium: bout_max(trace),
    }
}

/// Trial-aligned response of one trial.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialMetrics {
    #[serde(rename = "Trial")]
    pub trial: String,
    #[serde(rename = "Amplitude")]
    pub amplitude: f64,
    #[serde(rename = "AUC")]
    pub auc: f64,
    #[serde(rename = "Rate of Increase")]
    pub rate_of_increase: f64,
    #[serde(rename = "Decay")]
    pub decay: f64,
    #[serde(rename = "Amplitude (Z-Score)")]
    pub amplitude_z_score: f64,
    #[serde(rename = "Amplitude (Normalized)")]
    pub amplitude_normalized: f64,
}

impl TrialMetrics {
    pub const NAMES: [&'static str; 6] = [
        "Amplitude",
        "AUC",
        "Rate of Increase",
        "Decay",
        "Amplitude (Z-Score)",
        "Amplitude (Normalized)",
    ];

    pub fn values(&self) -> [f64; 6] {
        [
            self.amplitude,
            self.auc,
            self.rate_of_increase,
            self.decay,
            self.amplitude_z_score,
            self.amplitude_normalized,
        ]
    }
}

fn finite_pairs(time: &[f64], values: &[f64]) -> (Vec<f64>, Vec<f64>) {
    time.iter()
        .zip(values)
        .filter(|(_, v)| v.is_finite())
        .map(|(t, v)| (*t, *v))
        .unzip()
}

fn column_metrics(label: String, time: &[f64], column: &[f64], onset: usize) -> TrialMetrics {
    let amplitude = column.get(onset).copied().unwrap_or(f64::NAN);
    let (pre_t, pre_v) = finite_pairs(&time[..onset], &column[..onset]);
    let (post_t, post_v) = finite_pairs(&time[onset..], &column[onset..]);

    let auc = if post_v.len() < 2 {
        f64::NAN
    } else {
        simpson(&post_v, &post_t)
    };

    let rate_of_increase = match (pre_t.first(), pre_t.last(), pre_v.first(), pre_v.last()) {
        (Some(t0), Some(t1), Some(v0), Some(v1)) if t1 > t0 => (v1 - v0) / (t1 - t0),
        _ => f64::NAN,
    };

    let decay = post_v.last().map_or(f64::NAN, |last| amplitude - last);

    let mean = nan_mean(&pre_v);
    let std = nan_std(&pre_v);
    let amplitude_z_score = if std.is_nan() || std == 0.0 {
        f64::NAN
    } else {
        (amplitude - mean) / std
    };

    let (min, max) = column
        .iter()
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let amplitude_normalized = if max > min {
        (amplitude - min) / (max - min)
    } else {
        f64::NAN
    };

    TrialMetrics {
        trial: label,
        amplitude,
        auc,
        rate_of_increase,
        decay,
        amplitude_z_score,
        amplitude_normalized,
    }
}

/// Metrics of every column of a trial matrix.
pub fn trial_metrics(matrix: &TrialMatrix) -> Vec<TrialMetrics> {
    matrix
        .labels
        .iter()
        .enumerate()
        .map(|(i, label)| {
            column_metrics(label.to_string(), &matrix.time, &matrix.column(i), matrix.onset_row)
        })
        .collect()
}

/// Per-session reduction of trial metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSummary {
    pub session: String,
    pub entries: Vec<(String, f64)>,
}

impl MetricSummary {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }
}

/// Means, spreads, first/last values and per-trial trends of `metrics`.
pub fn summarize_trials(session: &str, metrics: &[TrialMetrics]) -> MetricSummary {
    let columns: Vec<Vec<f64>> = (0..TrialMetrics::NAMES.len())
        .map(|k| metrics.iter().map(|m| m.values()[k]).collect())
        .collect();
    let mut entries = Vec::new();

    for (name, values) in TrialMetrics::NAMES.iter().zip(&columns) {
        entries.push((format!("Average {name}"), nan_mean(values)));
    }
    for (name, values) in TrialMetrics::NAMES.iter().zip(&columns) {
        entries.push((format!("Std {name}"), nan_std(values)));
    }
    for (name, values) in TrialMetrics::NAMES.iter().zip(&columns).take(4) {
        entries.push((format!("First {name}"), values.first().copied().unwrap_or(f64::NAN)));
        entries.push((format!("Last {name}"), values.last().copied().unwrap_or(f64::NAN)));
    }
    for (name, values) in TrialMetrics::NAMES.iter().zip(&columns) {
        let (trials, valid): (Vec<f64>, Vec<f64>) = values
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_nan())
            .map(|(i, v)| ((i + 1) as f64, *v))
            .unzip();
        let slope = linear_fit(&trials, &valid).map_or(f64::NAN, |fit| fit.slope);
        entries.push((format!("{name} Rate of Change"), slope));
    }

    MetricSummary {
        session: session.to_string(),
        entries,
    }
}
