use itertools::Itertools;
use log::warn;

use crate::models::{CueTag, Diagnostic, EventTable, Series, TimeIndexed};

/// Anything that can decide whether a time (seconds) belongs to it.
pub trait Window {
    fn contains(&self, t: f64) -> bool;
}

/// Inclusive time range, either bound may be open.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TimeRange {
    pub start: Option<f64>,
    pub end: Option<f64>,
}

impl TimeRange {
    pub const UNBOUNDED: TimeRange = TimeRange {
        start: None,
        end: None,
    };

    pub fn new(start: Option<f64>, end: Option<f64>) -> Self {
        TimeRange { start, end }
    }

    pub fn between(start: f64, end: f64) -> Self {
        TimeRange::new(Some(start), Some(end))
    }
}

impl Window for TimeRange {
    fn contains(&self, t: f64) -> bool {
        self.start.map_or(true, |s| t >= s) && self.end.map_or(true, |e| t <= e)
    }
}

/// Entries of `series` inside `window`.
pub fn filter_window<S: TimeIndexed, W: Window + ?Sized>(series: &S, window: &W) -> S {
    series.keep_where(|t| window.contains(t))
}

/// Entries of `series` inside the inclusive `range`; `None` keeps everything.
pub fn filter_range<S: TimeIndexed + Clone>(series: &S, range: Option<TimeRange>) -> S {
    match range {
        None => series.clone(),
        Some(range) => filter_window(series, &range),
    }
}

/// For every query time, the index in `reference` of the latest value at or
/// before it. When every reference value lies after the query, the nearest
/// one by absolute distance is used instead. Ties resolve to the first index.
pub fn find_closest(reference: &[f64], query: &[f64]) -> Vec<usize> {
    if reference.is_empty() {
        return Vec::new();
    }
    query
        .iter()
        .map(|&q| {
            let distance = |r: f64| (q - r).abs();
            reference
                .iter()
                .enumerate()
                .filter(|(_, r)| **r <= q)
                .min_by(|(_, a), (_, b)| distance(**a).total_cmp(&distance(**b)))
                .map(|(i, _)| i)
                .or_else(|| {
                    reference
                        .iter()
                        .position_min_by(|a, b| distance(**a).total_cmp(&distance(**b)))
                })
                .unwrap_or(0)
        })
        .collect()
}

/// Result of partitioning events by cue windows.
#[derive(Debug, Clone, PartialEq)]
pub struct CueSplit<S> {
    pub in_cue: S,
    pub out_cue: S,
    /// Cue onset times, for latencies measured from the cue.
    pub cue_on: Series<CueTag>,
    pub diagnostic: Option<Diagnostic>,
}

/// Partitions `data` into events inside a cue window and events outside.
///
/// Each event is matched to a cue onset with [`find_closest`]; the window of
/// the n-th onset closes at the n-th offset. Events matched to an onset that
/// has no offset are outside.
pub fn cue_split<S: TimeIndexed>(cues: &Series<CueTag>, data: &S) -> CueSplit<S> {
    let cue_on = Series::from_pairs(
        cues.iter()
            .filter(|(_, c)| c.is_on())
            .map(|(t, c)| (t, c.clone())),
    );
    let cue_off: Vec<f64> = cues
        .iter()
        .filter(|(_, c)| c.is_off())
        .map(|(t, _)| t)
        .collect();

    if cue_on.is_empty() || cue_off.is_empty() {
        warn!("{}", Diagnostic::NoCues);
        return CueSplit {
            in_cue: data.keep_where(|_| false),
            out_cue: data.keep_where(|_| true),
            cue_on,
            diagnostic: Some(Diagnostic::NoCues),
        };
    }

    let inside = |t: f64| {
        let Some(&on_idx) = find_closest(&cue_on.times, &[t]).first() else {
            return false;
        };
        let on_diff = t - cue_on.times[on_idx];
        let off_diff = cue_off.get(on_idx).map_or(f64::INFINITY, |off| t - off);
        on_diff >= 0.0 && off_diff <= 0.0
    };

    CueSplit {
        in_cue: data.keep_where(inside),
        out_cue: data.keep_where(|t| !inside(t)),
        cue_on,
        diagnostic: None,
    }
}

/// Linear interpolation of `source_values` (sampled at ascending
/// `source_times`) onto `reference`. Points outside the source domain take
/// the nearest boundary value; an empty source yields NaN.
pub fn downsample_to(reference: &[f64], source_times: &[f64], source_values: &[f64]) -> Vec<f64> {
    let n = source_times.len().min(source_values.len());
    if n == 0 {
        return vec![f64::NAN; reference.len()];
    }
    let (times, values) = (&source_times[..n], &source_values[..n]);

    reference
        .iter()
        .map(|&t| {
            if t <= times[0] {
                return values[0];
            }
            if t >= times[n - 1] {
                return values[n - 1];
            }
            let hi = times.partition_point(|&s| s < t);
            if times[hi] == t {
                return values[hi];
            }
            let lo = hi - 1;
            let frac = (t - times[lo]) / (times[hi] - times[lo]);
            values[lo] + (values[hi] - values[lo]) * frac
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WindowEnd {
    Open,
    /// Exclusive bound: the next trial starts here.
    Before(f64),
    /// Inclusive bound: end of the session.
    Through(f64),
}

/// One trial (or the pre-trial period, trial 0) as a time window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrialWindow {
    pub trial: u32,
    pub start: Option<f64>,
    pub end: WindowEnd,
}

impl TrialWindow {
    pub fn is_pre_trial(&self) -> bool {
        self.start.is_none()
    }

    pub fn end_time(&self) -> Option<f64> {
        match self.end {
            WindowEnd::Open => None,
            WindowEnd::Before(e) | WindowEnd::Through(e) => Some(e),
        }
    }
}

impl Window for TrialWindow {
    fn contains(&self, t: f64) -> bool {
        let after_start = self.start.map_or(true, |s| t >= s);
        let before_end = match self.end {
            WindowEnd::Open => true,
            WindowEnd::Before(e) => t < e,
            WindowEnd::Through(e) => t <= e,
        };
        after_start && before_end
    }
}

/// Trial boundaries of a session, derived once and shared by every
/// consumer. Windows are half-open `[start_i, start_{i+1})`; the last one is
/// open unless the windows were closed at the session end.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TrialWindows {
    starts: Vec<(u32, f64)>,
    session_end: Option<f64>,
}

impl TrialWindows {
    /// Trials start at the first occurrence of each distinct trial number.
    /// Number 0 is the pre-trial period and never starts a trial.
    pub fn from_trial_numbers(trials: &Series<u32>) -> Self {
        let starts = trials
            .iter()
            .filter(|(_, n)| **n != 0)
            .map(|(t, &n)| (n, t))
            .unique_by(|(n, _)| *n)
            .collect();
        TrialWindows {
            starts,
            session_end: None,
        }
    }

    /// Trials start at each cue onset, numbered from 1.
    pub fn from_cue_onsets(cues: &Series<CueTag>) -> Self {
        let starts = cues
            .iter()
            .filter(|(_, c)| c.is_on())
            .zip(1u32..)
            .map(|((t, _), n)| (n, t))
            .collect();
        TrialWindows {
            starts,
            session_end: None,
        }
    }

    pub fn closed_at(mut self, session_end: f64) -> Self {
        self.session_end = Some(session_end);
        self
    }

    pub fn len(&self) -> usize {
        self.starts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.starts.is_empty()
    }

    pub fn start_times(&self) -> Vec<f64> {
        self.starts.iter().map(|(_, t)| *t).collect()
    }

    pub fn first_start(&self) -> Option<f64> {
        self.starts.first().map(|(_, t)| *t)
    }

    fn end_after(&self, i: usize) -> WindowEnd {
        match (self.starts.get(i + 1), self.session_end) {
            (Some((_, next)), _) => WindowEnd::Before(*next),
            (None, Some(end)) => WindowEnd::Through(end),
            (None, None) => WindowEnd::Open,
        }
    }

    /// Everything before the first trial start.
    pub fn pre_trial(&self) -> TrialWindow {
        let end = match (self.first_start(), self.session_end) {
            (Some(first), _) => WindowEnd::Before(first),
            (None, Some(end)) => WindowEnd::Through(end),
            (None, None) => WindowEnd::Open,
        };
        TrialWindow {
            trial: 0,
            start: None,
            end,
        }
    }

    /// Windows of the numbered trials, in time order.
    pub fn trials(&self) -> impl Iterator<Item = TrialWindow> + '_ {
        self.starts
            .iter()
            .enumerate()
            .map(|(i, &(trial, start))| TrialWindow {
                trial,
                start: Some(start),
                end: self.end_after(i),
            })
    }

    /// Pre-trial window followed by every trial window.
    pub fn all(&self) -> impl Iterator<Item = TrialWindow> + '_ {
        std::iter::once(self.pre_trial()).chain(self.trials())
    }

    pub fn window(&self, trial: u32) -> Option<TrialWindow> {
        if trial == 0 {
            return Some(self.pre_trial());
        }
        self.trials().find(|w| w.trial == trial)
    }

    /// Trial holding time `t`, 0 before the first trial start.
    pub fn trial_of(&self, t: f64) -> u32 {
        match self.starts.partition_point(|(_, s)| *s <= t) {
            0 => 0,
            i => self.starts[i - 1].0,
        }
    }
}

/// The one trial partition of a session. Trials start at the first row of
/// each logged trial number; logs without trial numbers fall back to cue
/// onsets. The last trial is closed at the final event.
pub fn session_windows(events: &EventTable) -> TrialWindows {
    let mut windows = TrialWindows::from_trial_numbers(&events.trial_numbers());
    if windows.is_empty() {
        windows = TrialWindows::from_cue_onsets(&events.cues());
    }
    match events.end_time() {
        Some(end) => windows.closed_at(end),
        None => windows,
    }
}
