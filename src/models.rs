use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Event table columns, in export order.
pub const EVENT_COLUMNS: [&str; 10] = [
    "Time",
    "Force",
    "# of Licks",
    "Trial Number",
    "Port",
    "Cue",
    "Lever Press",
    "Syncs",
    "Servos",
    "Reward",
];

/// Bout table columns, in export order.
pub const BOUT_COLUMNS: [&str; 7] = [
    "Trial Number",
    "Start",
    "End",
    "# of Licks",
    "Rewarding",
    "Highly Rewarding",
    "Lick Efficiency",
];

/// Behavioral protocol of a session
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Phase {
    One,
    Two,
    Three,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::One, Phase::Two, Phase::Three];

    pub fn number(self) -> u8 {
        match self {
            Phase::One => 1,
            Phase::Two => 2,
            Phase::Three => 3,
        }
    }

    /// Directory name used for this phase in the data tree ("phase 2").
    pub fn dir_name(self) -> String {
        format!("phase {}", self.number())
    }
}

impl TryFrom<u8> for Phase {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Phase::One),
            2 => Ok(Phase::Two),
            3 => Ok(Phase::Three),
            other => Err(format!("unknown phase {other}, expected 1, 2 or 3")),
        }
    }
}

impl From<Phase> for u8 {
    fn from(phase: Phase) -> u8 {
        phase.number()
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim().trim_start_matches("phase").trim();
        let number: u8 = digits
            .parse()
            .map_err(|_| format!("unable to parse phase from {s:?}"))?;
        Phase::try_from(number)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "phase {}", self.number())
    }
}

/// Which columns an event table carries. Phase 1 sessions have no lever
/// and no force sensor, so those columns are dropped.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Deserialize, Serialize)]
pub enum ColumnLayout {
    #[default]
    Full,
    LickOnly,
}

impl ColumnLayout {
    pub fn for_phase(phase: Phase) -> Self {
        match phase {
            Phase::One => ColumnLayout::LickOnly,
            Phase::Two | Phase::Three => ColumnLayout::Full,
        }
    }

    pub fn columns(self) -> Vec<&'static str> {
        EVENT_COLUMNS
            .iter()
            .copied()
            .filter(|c| self == ColumnLayout::Full || (*c != "Force" && *c != "Lever Press"))
            .collect()
    }
}

/// How licks are attributed to rewards when computing statistics.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributionMode {
    /// Licks are matched against explicit REWARD events.
    Reward,
    /// Licks are matched against cue or lever-press windows.
    Time,
}

impl AttributionMode {
    pub const ALL: [AttributionMode; 2] = [AttributionMode::Reward, AttributionMode::Time];
}

impl FromStr for AttributionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reward" => Ok(AttributionMode::Reward),
            "time" | "cue" | "press" | "window" => Ok(AttributionMode::Time),
            other => Err(format!("unknown attribution mode {other:?}")),
        }
    }
}

impl fmt::Display for AttributionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributionMode::Reward => write!(f, "reward"),
            AttributionMode::Time => write!(f, "time"),
        }
    }
}

/// Raw cue status as printed by the controller (suffix of the `cue` tag).
#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub struct CueTag(pub String);

impl CueTag {
    pub fn is_on(&self) -> bool {
        self.0.trim().eq_ignore_ascii_case("on")
    }

    pub fn is_off(&self) -> bool {
        self.0.trim().eq_ignore_ascii_case("off")
    }
}

impl fmt::Display for CueTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Anything keyed by an ascending time index (seconds).
pub trait TimeIndexed: Sized {
    fn time_index(&self) -> &[f64];

    /// Copy of `self` holding only the entries whose time satisfies `keep`.
    fn keep_where<F: Fn(f64) -> bool>(&self, keep: F) -> Self;
}

/// A single column of a table, with the rows where it is unset dropped.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct Series<T> {
    pub times: Vec<f64>,
    pub values: Vec<T>,
}

impl<T: Clone> Series<T> {
    pub fn new() -> Self {
        Series {
            times: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn from_pairs<I: IntoIterator<Item = (f64, T)>>(pairs: I) -> Self {
        let (times, values) = pairs.into_iter().unzip();
        Series { times, values }
    }

    pub fn push(&mut self, time: f64, value: T) {
        self.times.push(time);
        self.values.push(value);
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (f64, &T)> + '_ {
        self.times.iter().copied().zip(self.values.iter())
    }

    pub fn first_time(&self) -> Option<f64> {
        self.times.first().copied()
    }

    /// Entries at `indices`, in the given order (duplicates kept).
    pub fn select(&self, indices: &[usize]) -> Self {
        Series {
            times: indices.iter().map(|&i| self.times[i]).collect(),
            values: indices.iter().map(|&i| self.values[i].clone()).collect(),
        }
    }

    pub fn filter_mask(&self, mask: &[bool]) -> Self {
        Series::from_pairs(
            self.iter()
                .zip(mask.iter())
                .filter(|(_, keep)| **keep)
                .map(|((t, v), _)| (t, v.clone())),
        )
    }
}

impl Series<u32> {
    /// Sum of the values, i.e. the number of licks or presses represented.
    pub fn total(&self) -> u64 {
        self.values.iter().map(|&v| v as u64).sum()
    }
}

impl<T: Clone> TimeIndexed for Series<T> {
    fn time_index(&self) -> &[f64] {
        &self.times
    }

    fn keep_where<F: Fn(f64) -> bool>(&self, keep: F) -> Self {
        Series::from_pairs(
            self.iter()
                .filter(|(t, _)| keep(*t))
                .map(|(t, v)| (t, v.clone())),
        )
    }
}

/// One row of the event table. Unset fields are `None`/`false` and export
/// as empty cells.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct EventRow {
    /// Seconds since the first row of the session.
    pub time: f64,
    pub force: Option<f64>,
    pub licks: Option<u32>,
    pub trial_number: Option<u32>,
    pub port: Option<i64>,
    pub cue: Option<CueTag>,
    pub lever_press: Option<u32>,
    pub sync: bool,
    pub servo: bool,
    pub reward: bool,
}

fn flag(set: bool) -> String {
    if set {
        String::from("TRUE")
    } else {
        String::new()
    }
}

fn cell<T: ToString>(value: &Option<T>) -> String {
    value.as_ref().map(|v| v.to_string()).unwrap_or_default()
}

impl EventRow {
    /// Cells of this row for the given layout, in `EVENT_COLUMNS` order.
    pub fn record(&self, layout: ColumnLayout) -> Vec<String> {
        let mut cells = vec![self.time.to_string()];
        if layout == ColumnLayout::Full {
            cells.push(cell(&self.force));
        }
        cells.push(cell(&self.licks));
        cells.push(cell(&self.trial_number));
        cells.push(cell(&self.port));
        cells.push(cell(&self.cue));
        if layout == ColumnLayout::Full {
            cells.push(cell(&self.lever_press));
        }
        cells.push(flag(self.sync));
        cells.push(flag(self.servo));
        cells.push(flag(self.reward));
        cells
    }
}

/// Parsed controller log for one subject on one session.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct EventTable {
    pub layout: ColumnLayout,
    rows: Vec<EventRow>,
    times: Vec<f64>,
}

impl EventTable {
    pub fn new(layout: ColumnLayout, rows: Vec<EventRow>) -> Self {
        let times = rows.iter().map(|r| r.time).collect();
        EventTable { layout, rows, times }
    }

    pub fn rows(&self) -> &[EventRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn header(&self) -> Vec<&'static str> {
        self.layout.columns()
    }

    pub fn start_time(&self) -> Option<f64> {
        self.times.first().copied()
    }

    pub fn end_time(&self) -> Option<f64> {
        self.times.last().copied()
    }

    pub fn column<T: Clone, F: Fn(&EventRow) -> Option<T>>(&self, get: F) -> Series<T> {
        Series::from_pairs(self.rows.iter().filter_map(|r| get(r).map(|v| (r.time, v))))
    }

    pub fn licks(&self) -> Series<u32> {
        self.column(|r| r.licks)
    }

    pub fn trial_numbers(&self) -> Series<u32> {
        self.column(|r| r.trial_number)
    }

    pub fn cues(&self) -> Series<CueTag> {
        self.column(|r| r.cue.clone())
    }

    pub fn lever_presses(&self) -> Series<u32> {
        self.column(|r| r.lever_press)
    }

    pub fn rewards(&self) -> Series<bool> {
        self.column(|r| r.reward.then_some(true))
    }

    pub fn forces(&self) -> Series<f64> {
        self.column(|r| r.force)
    }
}

impl TimeIndexed for EventTable {
    fn time_index(&self) -> &[f64] {
        &self.times
    }

    fn keep_where<F: Fn(f64) -> bool>(&self, keep: F) -> Self {
        EventTable::new(
            self.layout,
            self.rows.iter().filter(|r| keep(r.time)).cloned().collect(),
        )
    }
}

/// Fluorescence samples on the session clock (seconds).
#[derive(Debug, PartialEq, Clone, Default)]
pub struct CalciumTrace {
    pub times: Vec<f64>,
    pub values: Vec<f64>,
}

impl CalciumTrace {
    pub fn new(times: Vec<f64>, values: Vec<f64>) -> Self {
        CalciumTrace { times, values }
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn duration(&self) -> f64 {
        match (self.times.first(), self.times.last()) {
            (Some(first), Some(last)) => last - first,
            _ => 0.0,
        }
    }

    /// Mean sampling rate in Hz, `None` with fewer than two samples.
    pub fn sample_rate(&self) -> Option<f64> {
        let duration = self.duration();
        if self.len() < 2 || duration <= 0.0 {
            return None;
        }
        Some((self.len() - 1) as f64 / duration)
    }
}

impl TimeIndexed for CalciumTrace {
    fn time_index(&self) -> &[f64] {
        &self.times
    }

    fn keep_where<F: Fn(f64) -> bool>(&self, keep: F) -> Self {
        let (times, values) = self
            .times
            .iter()
            .zip(self.values.iter())
            .filter(|(t, _)| keep(**t))
            .map(|(t, v)| (*t, *v))
            .unzip();
        CalciumTrace { times, values }
    }
}

/// A discrete cluster of licks within one trial.
#[derive(Debug, PartialEq, Clone, Deserialize, Serialize)]
pub struct Bout {
    #[serde(rename = "Trial Number")]
    pub trial_number: u32,
    #[serde(rename = "Start")]
    pub start: f64,
    #[serde(rename = "End")]
    pub end: f64,
    #[serde(rename = "# of Licks")]
    pub licks: u64,
    #[serde(rename = "Rewarding")]
    pub rewarding: bool,
    #[serde(rename = "Highly Rewarding")]
    pub highly_rewarding: bool,
    #[serde(rename = "Lick Efficiency")]
    pub lick_efficiency: f64,
}

#[derive(Debug, PartialEq, Clone, Default)]
pub struct BoutTable {
    pub bouts: Vec<Bout>,
    pub diagnostic: Option<Diagnostic>,
}

/// Suspicious-but-valid conditions surfaced alongside results.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Diagnostic {
    NoCues,
    AllBoutsRewarding,
    NoBoutsRewarding,
    LickTotalMismatch {
        counted: u64,
        expected: u64,
    },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::NoCues => write!(f, "no cues found in data"),
            Diagnostic::AllBoutsRewarding => write!(
                f,
                "all bouts were identified as REWARDING, double-check the controller log"
            ),
            Diagnostic::NoBoutsRewarding => write!(
                f,
                "all bouts were identified as NON-REWARDING, double-check the controller log"
            ),
            Diagnostic::LickTotalMismatch { counted, expected } => write!(
                f,
                "rewarded + non-rewarded licks ({counted}) differ from total licks ({expected})"
            ),
        }
    }
}

/// Elapsed time to a first qualifying event.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Latency {
    Millis(f64),
    NotApplicable,
}

impl Latency {
    pub fn between(reference: f64, event: f64) -> Self {
        Latency::Millis((event - reference) * 1000.0)
    }

    pub fn millis(self) -> Option<f64> {
        match self {
            Latency::Millis(ms) => Some(ms),
            Latency::NotApplicable => None,
        }
    }
}

impl fmt::Display for Latency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Latency::Millis(ms) => write!(f, "{}", (ms * 1000.0).round() / 1000.0),
            Latency::NotApplicable => write!(f, "N/A"),
        }
    }
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum StatValue {
    Count(u64),
    Latency(Latency),
    Difference(f64),
}

impl StatValue {
    /// Numeric view with "not applicable" read as zero.
    pub fn or_zero(self) -> f64 {
        match self {
            StatValue::Count(n) => n as f64,
            StatValue::Latency(l) => l.millis().unwrap_or(0.0),
            StatValue::Difference(d) => d,
        }
    }
}

impl fmt::Display for StatValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatValue::Count(n) => write!(f, "{n}"),
            StatValue::Latency(l) => write!(f, "{l}"),
            StatValue::Difference(d) => write!(f, "{d}"),
        }
    }
}

/// Named statistics over a whole session.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct AggregateStats {
    pub entries: Vec<(String, StatValue)>,
}

impl AggregateStats {
    pub fn get(&self, name: &str) -> Option<StatValue> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct StatRow {
    pub label: String,
    pub values: Vec<StatValue>,
}

/// Statistics with one row per trial.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct StatTable {
    pub columns: Vec<String>,
    pub rows: Vec<StatRow>,
}

impl StatTable {
    pub fn value(&self, row: &str, column: &str) -> Option<StatValue> {
        let col = self.columns.iter().position(|c| c == column)?;
        self.rows
            .iter()
            .find(|r| r.label == row)
            .and_then(|r| r.values.get(col).copied())
    }
}

/// Everything one phase reducer produces for a session.
#[derive(Debug, PartialEq, Clone)]
pub struct PhaseReport {
    pub phase: Phase,
    pub mode: AttributionMode,
    pub aggregate: AggregateStats,
    pub trials: StatTable,
    pub bouts: BoutTable,
    pub diagnostics: Vec<Diagnostic>,
}
