use std::fmt;

use log::{debug, warn};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::models::{Bout, CalciumTrace, EventTable, TimeIndexed};
use crate::phase_utils::{
    downsample_to, filter_window, TimeRange, TrialWindow, TrialWindows, WindowEnd,
};

/// How the calcium trace is put on the event clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    /// Samples are matched by their own timestamps.
    #[default]
    TimeInterpolated,
    /// Samples are matched by position, assuming a constant rate from the
    /// first sample at session time 0.
    IndexAligned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SegmentLabel {
    PreTrial,
    Trial(u32),
}

impl SegmentLabel {
    pub fn for_trial(trial: u32) -> Self {
        match trial {
            0 => SegmentLabel::PreTrial,
            n => SegmentLabel::Trial(n),
        }
    }
}

impl fmt::Display for SegmentLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentLabel::PreTrial => write!(f, "Pre-Trial"),
            SegmentLabel::Trial(n) => write!(f, "Trial {n}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrialSegment {
    pub label: SegmentLabel,
    pub window: TrialWindow,
    pub trace: CalciumTrace,
}

/// A calcium trace cut along the trials of its session.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncedSession {
    pub strategy: SyncStrategy,
    pub windows: TrialWindows,
    pub segments: Vec<TrialSegment>,
    /// Calcium value at each event table row.
    pub aligned: Vec<f64>,
}

impl SyncedSession {
    pub fn segment(&self, label: SegmentLabel) -> Option<&TrialSegment> {
        self.segments.iter().find(|s| s.label == label)
    }

    /// Numbered trial segments, in order.
    pub fn trials(&self) -> impl Iterator<Item = &TrialSegment> + '_ {
        self.segments.iter().filter(|s| s.label != SegmentLabel::PreTrial)
    }
}

fn index_of(t: f64, sample_rate: f64, len: usize) -> usize {
    ((t * sample_rate).round().max(0.0) as usize).min(len)
}

fn slice_by_index(trace: &CalciumTrace, window: &TrialWindow, sample_rate: f64) -> CalciumTrace {
    let n = trace.len();
    let start = window.start.map_or(0, |s| index_of(s, sample_rate, n));
    let end = match window.end {
        WindowEnd::Open => n,
        WindowEnd::Before(e) => index_of(e, sample_rate, n),
        WindowEnd::Through(e) => (index_of(e, sample_rate, n) + 1).min(n),
    };
    let end = end.max(start);
    CalciumTrace::new(trace.times[start..end].to_vec(), trace.values[start..end].to_vec())
}

/// Cuts `trace` into a pre-trial segment and one segment per trial of
/// `windows`, the same windows the session's statistics were computed on.
pub fn segment_trace(
    events: &EventTable,
    windows: &TrialWindows,
    trace: &CalciumTrace,
    strategy: SyncStrategy,
) -> SyncedSession {
    if windows.is_empty() {
        warn!("no trials, the whole recording is pre-trial");
    }
    let event_times = events.time_index();

    let (segments, aligned) = match (strategy, trace.sample_rate()) {
        (SyncStrategy::IndexAligned, Some(rate)) => {
            let segments = windows
                .all()
                .map(|w| TrialSegment {
                    label: SegmentLabel::for_trial(w.trial),
                    window: w,
                    trace: slice_by_index(trace, &w, rate),
                })
                .collect();
            let aligned = event_times
                .iter()
                .map(|&t| {
                    let i = index_of(t, rate, trace.len());
                    trace
                        .values
                        .get(i)
                        .or(trace.values.last())
                        .copied()
                        .unwrap_or(f64::NAN)
                })
                .collect();
            (segments, aligned)
        }
        (strategy, _) => {
            if strategy == SyncStrategy::IndexAligned {
                debug!("index alignment needs a sample rate, falling back to timestamps");
            }
            let segments = windows
                .all()
                .map(|w| TrialSegment {
                    label: SegmentLabel::for_trial(w.trial),
                    window: w,
                    trace: filter_window(trace, &w),
                })
                .collect();
            (segments, downsample_to(event_times, &trace.times, &trace.values))
        }
    };

    SyncedSession {
        strategy,
        windows: windows.clone(),
        segments,
        aligned,
    }
}

/// Calcium around one lick bout.
#[derive(Debug, Clone, PartialEq)]
pub struct BoutWindow {
    /// 1-based position in the bout table.
    pub bout: usize,
    pub trial: u32,
    pub trace: CalciumTrace,
}

/// Calcium of each bout's trial segment within the bout, padded on both
/// sides by `padding_ms`.
pub fn bout_windows(session: &SyncedSession, bouts: &[Bout], padding_ms: f64) -> Vec<BoutWindow> {
    let padding = padding_ms / 1000.0;
    bouts
        .iter()
        .enumerate()
        .map(|(i, bout)| {
            let label = SegmentLabel::for_trial(bout.trial_number);
            let range = TimeRange::between(bout.start - padding, bout.end + padding);
            let trace = match session.segment(label) {
                Some(segment) => filter_window(&segment.trace, &range),
                None => {
                    debug!("bout {} refers to missing segment {label}", i + 1);
                    CalciumTrace::default()
                }
            };
            BoutWindow {
                bout: i + 1,
                trial: bout.trial_number,
                trace,
            }
        })
        .collect()
}

/// Trial-aligned calcium, one column per trial.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialMatrix {
    /// Seconds relative to the trial start, one per row.
    pub time: Vec<f64>,
    pub labels: Vec<SegmentLabel>,
    /// Rows are samples, columns are trials.
    pub values: Array2<f64>,
    /// Row of the trial's first sample.
    pub onset_row: usize,
}

impl TrialMatrix {
    pub fn column(&self, i: usize) -> Vec<f64> {
        self.values.column(i).to_vec()
    }
}

/// Stacks, for every trial, the last `pre` samples of the previous trial and
/// the first `post` samples of this one. Missing samples are NaN; the first
/// trial has no previous trial.
pub fn trial_matrix(
    session: &SyncedSession,
    sample_rate: Option<f64>,
    pre: usize,
    post: usize,
) -> TrialMatrix {
    let trials: Vec<&TrialSegment> = session.trials().collect();
    let rows = pre + post;
    let mut values = Array2::from_elem((rows, trials.len()), f64::NAN);

    for (col, segment) in trials.iter().enumerate() {
        if col > 0 {
            let previous = &trials[col - 1].trace.values;
            let tail = &previous[previous.len().saturating_sub(pre)..];
            let offset = pre - tail.len();
            for (k, v) in tail.iter().enumerate() {
                values[[offset + k, col]] = *v;
            }
        }
        for (k, v) in segment.trace.values.iter().take(post).enumerate() {
            values[[pre + k, col]] = *v;
        }
    }

    let time = (0..rows)
        .map(|row| {
            let offset = row as f64 - pre as f64;
            sample_rate.map_or(offset, |rate| offset / rate)
        })
        .collect();

    TrialMatrix {
        time,
        labels: trials.iter().map(|s| s.label).collect(),
        values,
        onset_row: pre,
    }
}
