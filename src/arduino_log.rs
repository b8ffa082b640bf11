use log::{debug, warn};

use crate::error::ParseError;
use crate::models::{ColumnLayout, CueTag, EventRow, EventTable, Phase};

/// One tag of a controller log line.
#[derive(Debug, PartialEq, Clone)]
enum Tag {
    Sync,
    Force(f64),
    TrialNumber(u32),
    Port(i64),
    Cue(CueTag),
    LeverPress,
    Servo,
    LickBout(u32),
    Lick,
    Reward,
    Unknown,
}

/// Row under construction, still keyed by the raw millisecond timestamp.
#[derive(Debug, PartialEq, Clone, Default)]
struct PartialRow {
    time_ms: i64,
    force: Option<f64>,
    licks: Option<u32>,
    trial_number: Option<u32>,
    port: Option<i64>,
    cue: Option<CueTag>,
    lever_press: Option<u32>,
    sync: bool,
    servo: bool,
    reward: bool,
}

fn value_after_eq(token: &str) -> &str {
    token.rsplit('=').next().unwrap_or(token).trim()
}

fn field_error(line: usize, field: &'static str, token: &str) -> ParseError {
    ParseError::Field {
        line,
        field,
        token: token.to_string(),
    }
}

fn parse_timestamp(token: &str, line: usize) -> Result<i64, ParseError> {
    value_after_eq(token)
        .parse::<i64>()
        .map_err(|_| ParseError::Timestamp {
            line,
            token: token.to_string(),
        })
}

/// Grams of a `<float>g` reading, optionally after a `name=` prefix.
fn force_grams(token: &str) -> Option<f64> {
    value_after_eq(token).strip_suffix('g')?.trim().parse().ok()
}

fn classify(token: &str, line: usize) -> Result<Tag, ParseError> {
    let tag = if token == "syncOut" {
        Tag::Sync
    } else if let Some(grams) = force_grams(token) {
        Tag::Force((grams * 100.0).round() / 100.0)
    } else if token.contains("trialNum") {
        let n = value_after_eq(token)
            .parse()
            .map_err(|_| field_error(line, "trial number", token))?;
        Tag::TrialNumber(n)
    } else if token.contains("port") {
        let port = value_after_eq(token)
            .parse()
            .map_err(|_| field_error(line, "port", token))?;
        Tag::Port(port)
    } else if token.contains("cue") {
        Tag::Cue(CueTag(token.get(3..).unwrap_or_default().to_string()))
    } else if token == "levPress" {
        Tag::LeverPress
    } else if token == "moveServo" {
        Tag::Servo
    } else if token.contains("lick") {
        if token.contains("bout") {
            let count = token
                .split_whitespace()
                .next()
                .and_then(|n| n.parse().ok())
                .ok_or_else(|| field_error(line, "lick bout count", token))?;
            Tag::LickBout(count)
        } else {
            Tag::Lick
        }
    } else if token == "REWARD" {
        Tag::Reward
    } else {
        Tag::Unknown
    };
    Ok(tag)
}

/// Builds an event table from controller log lines, one line at a time.
///
/// A row is opened whenever a line carries a timestamp different from the
/// one of the open row; tags on lines sharing that timestamp fill the same
/// row. Each field is recorded at most once per row.
#[derive(Debug)]
pub struct LogParser {
    layout: ColumnLayout,
    rows: Vec<PartialRow>,
    current: Option<PartialRow>,
    latest_trial: u32,
    line: usize,
}

impl LogParser {
    pub fn new(layout: ColumnLayout) -> Self {
        LogParser {
            layout,
            rows: Vec::new(),
            current: None,
            latest_trial: 0,
            line: 0,
        }
    }

    pub fn feed(&mut self, raw: &str) -> Result<(), ParseError> {
        self.line += 1;
        let mut tokens: Vec<&str> = raw.split(',').map(str::trim).collect();

        match tokens.last() {
            Some(last) if last.contains("ms") => {
                let time_ms = parse_timestamp(last, self.line)?;
                tokens.pop();
                if self.current.as_ref().map(|r| r.time_ms) != Some(time_ms) {
                    self.open_row(time_ms);
                }
            }
            _ if !raw.contains("bout") => {
                debug!("line {}: no timestamp, skipped", self.line);
                return Ok(());
            }
            _ => {}
        }

        for token in tokens.into_iter().filter(|t| !t.is_empty()) {
            let tag = classify(token, self.line)?;
            self.apply(tag, token);
        }
        Ok(())
    }

    /// Closes the open row (if any) and starts a new one at `time_ms`.
    fn open_row(&mut self, time_ms: i64) {
        if let Some(done) = self.current.take() {
            self.rows.push(done);
        }
        self.current = Some(PartialRow {
            time_ms,
            ..Default::default()
        });
    }

    fn apply(&mut self, tag: Tag, token: &str) {
        if let Tag::LickBout(count) = tag {
            self.correct_lick_count(count);
            return;
        }
        if let Tag::TrialNumber(n) = tag {
            self.latest_trial = n;
        }
        let latest_trial = self.latest_trial;
        let line = self.line;
        let Some(row) = self.current.as_mut() else {
            warn!("line {line}: tag {token:?} before any timestamp, dropped");
            return;
        };

        let recorded = match tag {
            Tag::Sync => set_flag(&mut row.sync),
            Tag::Force(grams) => set_once(&mut row.force, grams),
            Tag::TrialNumber(n) => set_once(&mut row.trial_number, n),
            Tag::Port(port) => set_once(&mut row.port, port),
            Tag::Cue(cue) => {
                set_once(&mut row.trial_number, latest_trial);
                set_once(&mut row.cue, cue)
            }
            Tag::LeverPress => set_once(&mut row.lever_press, 1),
            Tag::Servo => set_flag(&mut row.servo),
            Tag::Lick => set_once(&mut row.licks, 1),
            Tag::Reward => set_flag(&mut row.reward),
            Tag::Unknown => {
                debug!("line {line}: unrecognised token {token:?}");
                true
            }
            // corrections, applied before a row is needed
            Tag::LickBout(_) => true,
        };
        if !recorded {
            debug!("line {line}: {token:?} repeats a field already set at this timestamp");
        }
    }

    /// A lick bout summary replaces the provisional count of the most
    /// recently recorded lick instead of adding an event.
    fn correct_lick_count(&mut self, count: u32) {
        if let Some(row) = self.current.as_mut().filter(|r| r.licks.is_some()) {
            row.licks = Some(count);
        } else if let Some(row) = self.rows.iter_mut().rev().find(|r| r.licks.is_some()) {
            row.licks = Some(count);
        } else if let Some(row) = self.current.as_mut() {
            row.licks = Some(count);
        } else {
            warn!("line {}: lick bout of {count} before any event, dropped", self.line);
        }
    }

    pub fn finish(mut self) -> EventTable {
        if let Some(done) = self.current.take() {
            self.rows.push(done);
        }
        let origin = self.rows.first().map(|r| r.time_ms).unwrap_or(0);
        let rows = self
            .rows
            .into_iter()
            .map(|r| EventRow {
                time: (r.time_ms - origin) as f64 / 1000.0,
                force: r.force.filter(|_| self.layout == ColumnLayout::Full),
                licks: r.licks,
                trial_number: r.trial_number,
                port: r.port,
                cue: r.cue,
                lever_press: r.lever_press.filter(|_| self.layout == ColumnLayout::Full),
                sync: r.sync,
                servo: r.servo,
                reward: r.reward,
            })
            .collect();
        EventTable::new(self.layout, rows)
    }
}

fn set_once<T>(slot: &mut Option<T>, value: T) -> bool {
    if slot.is_some() {
        return false;
    }
    *slot = Some(value);
    true
}

fn set_flag(slot: &mut bool) -> bool {
    !std::mem::replace(slot, true)
}

/// Parses raw controller log lines into an event table.
pub fn parse_log<I, S>(lines: I, layout: ColumnLayout) -> Result<EventTable, ParseError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut parser = LogParser::new(layout);
    for line in lines {
        parser.feed(line.as_ref())?;
    }
    let table = parser.finish();
    debug!("parsed {} event rows", table.len());
    Ok(table)
}

/// Parses a session log with the column layout of its phase.
pub fn parse_session_log<I, S>(lines: I, phase: Phase) -> Result<EventTable, ParseError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    parse_log(lines, ColumnLayout::for_phase(phase))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn parses_trial_lick_and_reward_lines() {
        let table = parse_log(
            ["trialNum=1,cue0N,ms=100", "1 lick bout,ms=150", "REWARD,ms=200"],
            ColumnLayout::Full,
        )
        .unwrap();

        assert_eq!(3, table.len());
        let rows = table.rows();
        assert_eq!(vec![0.0, 0.05, 0.1], rows.iter().map(|r| r.time).collect::<Vec<_>>());
        assert_eq!(Some(1), rows[0].trial_number);
        assert_eq!(Some(CueTag("0N".into())), rows[0].cue);
        assert_eq!(Some(1), rows[1].licks);
        assert_eq!(None, rows[0].licks);
        assert!(rows[2].reward);
        assert!(!rows[1].reward);
    }

    #[test]
    fn trial_number_is_restamped_on_later_cues() {
        let table = parse_log(
            ["trialNum=4,ms=10", "cueON,ms=20", "cueOFF,ms=30", "trialNum=5,ms=40", "cueON,ms=50"],
            ColumnLayout::Full,
        )
        .unwrap();
        let trials: Vec<_> = table.rows().iter().map(|r| r.trial_number).collect();
        assert_eq!(vec![Some(4), Some(4), Some(4), Some(5), Some(5)], trials);
    }

    #[test]
    fn one_row_per_distinct_timestamp() {
        let table = parse_log(
            [
                "lick,ms=1000",
                "REWARD,ms=1000",
                "syncOut,ms=1000",
                "lick,ms=1200",
                "levPress,moveServo,ms=1300",
                "port=2,ms=1300",
            ],
            ColumnLayout::Full,
        )
        .unwrap();
        assert_eq!(3, table.len());
        let rows = table.rows();
        assert!(rows[0].reward && rows[0].sync);
        assert_eq!(Some(1), rows[0].licks);
        assert_eq!(Some(1), rows[2].lever_press);
        assert!(rows[2].servo);
        assert_eq!(Some(2), rows[2].port);
    }

    #[test]
    fn lick_bout_corrects_the_last_recorded_lick() {
        let table = parse_log(
            ["lick,ms=100", "REWARD,ms=120", "6 lick bout", "lick,ms=900"],
            ColumnLayout::Full,
        )
        .unwrap();
        let licks: Vec<_> = table.rows().iter().map(|r| r.licks).collect();
        assert_eq!(vec![Some(6), None, Some(1)], licks);
    }

    #[test]
    fn lines_without_timestamp_or_bout_are_skipped() {
        let table = parse_log(
            ["Starting session", "lick,ms=5", "debug: servo calibrated", ""],
            ColumnLayout::Full,
        )
        .unwrap();
        assert_eq!(1, table.len());
        assert!(!table.rows()[0].servo);
    }

    #[test]
    fn force_is_rounded_and_dropped_for_lick_only_sessions() {
        let lines = ["12.3456g,ms=10", "force=3.001g,levPress,ms=20"];
        let full = parse_log(lines, ColumnLayout::Full).unwrap();
        assert_relative_eq!(12.35, full.rows()[0].force.unwrap());
        assert_relative_eq!(3.0, full.rows()[1].force.unwrap());

        let lick_only = parse_session_log(lines, Phase::One).unwrap();
        assert_eq!(ColumnLayout::LickOnly, lick_only.layout);
        assert!(lick_only.rows().iter().all(|r| r.force.is_none() && r.lever_press.is_none()));
        assert_eq!(2, lick_only.len());
    }

    #[test]
    fn repeated_field_at_one_timestamp_keeps_the_first_value() {
        let table = parse_log(["port=1,ms=10", "port=2,ms=10"], ColumnLayout::Full).unwrap();
        assert_eq!(1, table.len());
        assert_eq!(Some(1), table.rows()[0].port);
    }

    #[test]
    fn bad_timestamp_is_a_format_error() {
        let err = parse_log(["lick,ms=10", "lick,ms=1x0"], ColumnLayout::Full).unwrap_err();
        assert_eq!(
            ParseError::Timestamp {
                line: 2,
                token: "ms=1x0".into()
            },
            err
        );
        assert_eq!(
            "on line 2: unable to parse timestamp \"ms=1x0\" as integer milliseconds",
            err.to_string()
        );
    }

    #[test]
    fn text_with_a_g_is_not_force() {
        let table = parse_log(
            ["Starting program,ms=0", "abcg,lick,ms=10", "logging,2.5g,ms=20"],
            ColumnLayout::Full,
        )
        .unwrap();
        assert_eq!(3, table.len());
        let forces: Vec<_> = table.rows().iter().map(|r| r.force).collect();
        assert_eq!(vec![None, None, Some(2.5)], forces);
        assert_eq!(Some(1), table.rows()[1].licks);
    }

    #[test]
    fn empty_input_gives_empty_table() {
        let table = parse_log(Vec::<String>::new(), ColumnLayout::Full).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn times_are_seconds_from_first_row() {
        let lines = ["lick,ms=5000", "lick,ms=5250", "lick,ms=7000"];
        let table = parse_log(lines, ColumnLayout::Full).unwrap();
        let times: Vec<_> = table.rows().iter().map(|r| r.time).collect();
        assert_eq!(vec![0.0, 0.25, 2.0], times);
    }
}
