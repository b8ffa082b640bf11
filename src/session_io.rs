use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, StringRecord, Trim, Writer};
use log::debug;
use serde::Serialize;

use crate::calcium_metrics::{BoutMetrics, MetricSummary, TrialMetrics};
use crate::calcium_sync::{BoutWindow, SyncedSession, TrialMatrix};
use crate::config::CalciumConfig;
use crate::error::PipelineError;
use crate::models::{AggregateStats, Bout, CalciumTrace, EventTable, StatTable, BOUT_COLUMNS};

const METADATA_MARKERS: [&str; 2] = ["Animal ID", "Cage ID"];

/// What an input file holds, decided once when it is loaded.
#[derive(Debug, Clone, PartialEq)]
pub enum SheetKind {
    /// Subject bookkeeping, copied through untouched.
    Metadata {
        header: Vec<String>,
        records: Vec<Vec<String>>,
    },
    /// Raw controller log, one record per line.
    Session { lines: Vec<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sheet {
    /// File stem, used to name every derived output.
    pub name: String,
    pub path: PathBuf,
    pub kind: SheetKind,
}

fn is_metadata_header(line: &str) -> bool {
    line.split(',').any(|cell| METADATA_MARKERS.contains(&cell.trim()))
}

fn sheet_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub fn classify(text: &str) -> Result<SheetKind, csv::Error> {
    let is_metadata = text
        .lines()
        .find(|l| !l.trim().is_empty())
        .is_some_and(is_metadata_header);
    if !is_metadata {
        return Ok(SheetKind::Session {
            lines: text.lines().map(str::to_string).collect(),
        });
    }

    let mut reader = ReaderBuilder::new().flexible(true).from_reader(text.as_bytes());
    let header = reader.headers()?.iter().map(str::to_string).collect();
    let records = reader
        .records()
        .map(|r| r.map(|record| record.iter().map(str::to_string).collect()))
        .collect::<Result<_, _>>()?;
    Ok(SheetKind::Metadata { header, records })
}

pub fn load_sheet(path: &Path) -> Result<Sheet, PipelineError> {
    let text = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
    let kind = classify(&text)?;
    Ok(Sheet {
        name: sheet_name(path),
        path: path.to_path_buf(),
        kind,
    })
}

/// Regular, non-hidden files of `dir`, sorted by name.
pub fn list_files(dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| PipelineError::io(dir, e))? {
        let path = entry.map_err(|e| PipelineError::io(dir, e))?.path();
        let hidden = path
            .file_name()
            .is_some_and(|n| n.to_string_lossy().starts_with('.'));
        if path.is_file() && !hidden {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Whether `path` is a calcium recording: its first non-empty line names
/// both the configured time and value columns.
pub fn is_calcium_recording(path: &Path, config: &CalciumConfig) -> Result<bool, PipelineError> {
    let file = File::open(path).map_err(|e| PipelineError::io(path, e))?;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| PipelineError::io(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        let has = |name: &str| line.split(',').any(|cell| cell.trim() == name);
        return Ok(has(&config.time_column) && has(&config.value_column));
    }
    Ok(false)
}

fn column_index(headers: &StringRecord, name: &str, path: &Path) -> Result<usize, PipelineError> {
    headers
        .iter()
        .position(|h| h == name)
        .ok_or_else(|| PipelineError::MissingColumn {
            path: path.to_path_buf(),
            column: name.to_string(),
        })
}

fn parse_cell(
    record: &StringRecord,
    index: usize,
    row: usize,
    column: &str,
    path: &Path,
) -> Result<f64, PipelineError> {
    let raw = record.get(index).unwrap_or("");
    raw.parse::<f64>().map_err(|_| PipelineError::BadValue {
        path: path.to_path_buf(),
        row,
        column: column.to_string(),
        value: raw.to_string(),
    })
}

/// Reads the time and value columns named in `config`; times are converted
/// to seconds.
pub fn load_calcium(path: &Path, config: &CalciumConfig) -> Result<CalciumTrace, PipelineError> {
    let file = File::open(path).map_err(|e| PipelineError::io(path, e))?;
    let mut reader = ReaderBuilder::new().trim(Trim::All).from_reader(file);
    let headers = reader.headers()?.clone();
    let time_col = column_index(&headers, &config.time_column, path)?;
    let value_col = column_index(&headers, &config.value_column, path)?;

    let mut times = Vec::new();
    let mut values = Vec::new();
    for (i, result) in reader.records().enumerate() {
        let record = result?;
        let row = i + 1;
        let t = parse_cell(&record, time_col, row, &config.time_column, path)?;
        times.push(config.time_unit.to_seconds(t));
        values.push(parse_cell(&record, value_col, row, &config.value_column, path)?);
    }
    debug!("{}: {} calcium samples", path.display(), times.len());
    Ok(CalciumTrace::new(times, values))
}

fn create_writer(path: &Path) -> Result<Writer<File>, PipelineError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
    }
    Ok(Writer::from_path(path)?)
}

fn finish(mut writer: Writer<File>, path: &Path) -> Result<(), PipelineError> {
    writer.flush().map_err(|e| PipelineError::io(path, e))
}

fn write_serialized<T: Serialize>(path: &Path, items: &[T]) -> Result<(), PipelineError> {
    let mut writer = create_writer(path)?;
    for item in items {
        writer.serialize(item)?;
    }
    finish(writer, path)
}

pub fn write_metadata(
    path: &Path,
    header: &[String],
    records: &[Vec<String>],
) -> Result<(), PipelineError> {
    let mut writer = create_writer(path)?;
    writer.write_record(header)?;
    for record in records {
        writer.write_record(record)?;
    }
    finish(writer, path)
}

pub fn write_event_table(path: &Path, table: &EventTable) -> Result<(), PipelineError> {
    let mut writer = create_writer(path)?;
    writer.write_record(table.header())?;
    for row in table.rows() {
        writer.write_record(row.record(table.layout))?;
    }
    finish(writer, path)
}

/// Event times with the calcium value at each.
pub fn write_aligned(
    path: &Path,
    table: &EventTable,
    session: &SyncedSession,
) -> Result<(), PipelineError> {
    let mut writer = create_writer(path)?;
    writer.write_record(["Time", "Calcium"])?;
    for (row, value) in table.rows().iter().zip(&session.aligned) {
        writer.write_record([row.time.to_string(), value.to_string()])?;
    }
    finish(writer, path)
}

pub fn write_aggregate(path: &Path, stats: &AggregateStats) -> Result<(), PipelineError> {
    let mut writer = create_writer(path)?;
    writer.write_record(["Statistic", "Value"])?;
    for (name, value) in &stats.entries {
        writer.write_record([name.clone(), value.to_string()])?;
    }
    finish(writer, path)
}

pub fn write_stat_table(path: &Path, table: &StatTable) -> Result<(), PipelineError> {
    let mut writer = create_writer(path)?;
    writer.write_record(std::iter::once("Trial").chain(table.columns.iter().map(String::as_str)))?;
    for row in &table.rows {
        let values = row.values.iter().map(|v| v.to_string());
        let cells = std::iter::once(row.label.clone()).chain(values);
        writer.write_record(cells)?;
    }
    finish(writer, path)
}

pub fn write_bouts(path: &Path, bouts: &[Bout]) -> Result<(), PipelineError> {
    if bouts.is_empty() {
        // serde writes the header with the first record only
        let mut writer = create_writer(path)?;
        writer.write_record(BOUT_COLUMNS)?;
        return finish(writer, path);
    }
    write_serialized(path, bouts)
}

/// Long format: one line per calcium sample of each trial segment.
pub fn write_segments(path: &Path, session: &SyncedSession) -> Result<(), PipelineError> {
    let mut writer = create_writer(path)?;
    writer.write_record(["Segment", "Time", "Value"])?;
    for segment in &session.segments {
        let label = segment.label.to_string();
        for (t, v) in segment.trace.times.iter().zip(&segment.trace.values) {
            writer.write_record([label.clone(), t.to_string(), v.to_string()])?;
        }
    }
    finish(writer, path)
}

pub fn write_bout_windows(path: &Path, windows: &[BoutWindow]) -> Result<(), PipelineError> {
    let mut writer = create_writer(path)?;
    writer.write_record(["Bout", "Trial Number", "Time", "Value"])?;
    for window in windows {
        for (t, v) in window.trace.times.iter().zip(&window.trace.values) {
            writer.write_record([
                window.bout.to_string(),
                window.trial.to_string(),
                t.to_string(),
                v.to_string(),
            ])?;
        }
    }
    finish(writer, path)
}

pub fn write_bout_metrics(path: &Path, metrics: &[BoutMetrics]) -> Result<(), PipelineError> {
    write_serialized(path, metrics)
}

pub fn write_trial_matrix(path: &Path, matrix: &TrialMatrix) -> Result<(), PipelineError> {
    let mut writer = create_writer(path)?;
    let labels: Vec<String> = matrix.labels.iter().map(|l| l.to_string()).collect();
    writer.write_record(std::iter::once(String::from("Time")).chain(labels))?;
    for (t, row) in matrix.time.iter().zip(matrix.values.rows()) {
        let values = row.iter().map(|v| v.to_string());
        writer.write_record(std::iter::once(t.to_string()).chain(values))?;
    }
    finish(writer, path)
}

pub fn write_trial_metrics(path: &Path, metrics: &[TrialMetrics]) -> Result<(), PipelineError> {
    write_serialized(path, metrics)
}

/// One line per session; columns are the union of the summaries' entries.
pub fn write_summary(path: &Path, summaries: &[MetricSummary]) -> Result<(), PipelineError> {
    let mut names: Vec<&str> = Vec::new();
    for summary in summaries {
        for (name, _) in &summary.entries {
            if !names.contains(&name.as_str()) {
                names.push(name);
            }
        }
    }
    let mut writer = create_writer(path)?;
    writer.write_record(std::iter::once("Session").chain(names.iter().copied()))?;
    for summary in summaries {
        let cells = names
            .iter()
            .map(|n| summary.get(n).map_or(String::new(), |v| v.to_string()));
        writer.write_record(std::iter::once(summary.session.clone()).chain(cells))?;
    }
    finish(writer, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arduino_log::parse_log;
    use crate::config::TimeUnit;
    use crate::models::{ColumnLayout, StatRow, StatValue};
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn metadata_sheets_are_recognised() {
        let kind = classify("Animal ID,Sex,Weight\nM1,F,21.3\nM2,M,24.0\n").unwrap();
        match kind {
            SheetKind::Metadata { header, records } => {
                assert_eq!(vec!["Animal ID", "Sex", "Weight"], header);
                assert_eq!(2, records.len());
                assert_eq!("M2", records[1][0]);
            }
            other => panic!("expected metadata, got {other:?}"),
        }
        assert!(matches!(
            classify("\nNotes,Cage ID\n1,2\n").unwrap(),
            SheetKind::Metadata { .. }
        ));
    }

    #[test]
    fn logs_are_sessions() {
        let kind = classify("trialNum=1,cueOn,ms=100\nlick,ms=150\n").unwrap();
        assert_eq!(
            SheetKind::Session {
                lines: vec![String::from("trialNum=1,cueOn,ms=100"), String::from("lick,ms=150")]
            },
            kind
        );
    }

    #[test]
    fn sheet_name_is_file_stem() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("M7 day3.txt");
        fs::write(&path, "lick,ms=1\n").unwrap();
        let sheet = load_sheet(&path).unwrap();
        assert_eq!("M7 day3", sheet.name);
        assert!(matches!(sheet.kind, SheetKind::Session { .. }));
    }

    #[test]
    fn listing_skips_hidden_files_and_directories() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("b.txt"), "").unwrap();
        fs::write(dir.path().join("a.txt"), "").unwrap();
        fs::write(dir.path().join(".DS_Store"), "").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        let names: Vec<String> = list_files(dir.path())
            .unwrap()
            .iter()
            .map(|p| sheet_name(p))
            .collect();
        assert_eq!(vec!["a", "b"], names);
    }

    #[test]
    fn recordings_are_told_apart_from_logs() {
        let dir = tempdir().unwrap();
        let config = CalciumConfig::default();
        let recording = dir.path().join("M1.csv");
        fs::write(&recording, "\nTime, Values, AIN02\n0,1.5,9\n").unwrap();
        let log = dir.path().join("M1.txt");
        fs::write(&log, "trialNum=1,cueOn,ms=100\nTime,ms=150\n").unwrap();
        let metadata = dir.path().join("subjects.csv");
        fs::write(&metadata, "Animal ID,Time\nM1,10\n").unwrap();
        let empty = dir.path().join("empty.txt");
        fs::write(&empty, "").unwrap();

        assert!(is_calcium_recording(&recording, &config).unwrap());
        assert!(!is_calcium_recording(&log, &config).unwrap());
        assert!(!is_calcium_recording(&metadata, &config).unwrap());
        assert!(!is_calcium_recording(&empty, &config).unwrap());
    }

    #[test]
    fn calcium_is_read_in_seconds() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Time, Values, AIN02").unwrap();
        writeln!(file, "0, 1.5, 9").unwrap();
        writeln!(file, "250, 2.5, 9").unwrap();
        let trace = load_calcium(file.path(), &CalciumConfig::default()).unwrap();
        assert_eq!(vec![0.0, 0.25], trace.times);
        assert_eq!(vec![1.5, 2.5], trace.values);

        let config = CalciumConfig {
            time_unit: TimeUnit::Seconds,
            ..Default::default()
        };
        let trace = load_calcium(file.path(), &config).unwrap();
        assert_eq!(vec![0.0, 250.0], trace.times);
    }

    #[test]
    fn calcium_errors_name_the_problem() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Time,AIN01").unwrap();
        writeln!(file, "0,1").unwrap();
        let err = load_calcium(file.path(), &CalciumConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::MissingColumn { ref column, .. } if column == "Values"
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Time,Values").unwrap();
        writeln!(file, "0,1").unwrap();
        writeln!(file, "1,oops").unwrap();
        let err = load_calcium(file.path(), &CalciumConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::BadValue { row: 2, ref value, .. } if value == "oops"
        ));
    }

    #[test]
    fn event_table_export_follows_layout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("parsed").join("M1.csv");
        let lines = ["trialNum=1,cueOn,ms=100", "1 lick bout,ms=150", "REWARD,ms=200"];
        let table = parse_log(lines, ColumnLayout::LickOnly).unwrap();
        write_event_table(&path, &table).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!("Time,# of Licks,Trial Number,Port,Cue,Syncs,Servos,Reward", lines[0]);
        assert_eq!(4, lines.len());
        assert!(lines[3].ends_with("TRUE"));
    }

    #[test]
    fn stat_tables_render_not_applicable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trials.csv");
        let table = StatTable {
            columns: vec![String::from("Latency to First Lick (ms)")],
            rows: vec![StatRow {
                label: String::from("Trial 1"),
                values: vec![StatValue::Latency(crate::models::Latency::NotApplicable)],
            }],
        };
        write_stat_table(&path, &table).unwrap();
        assert_eq!(
            "Trial,Latency to First Lick (ms)\nTrial 1,N/A\n",
            fs::read_to_string(&path).unwrap()
        );
    }

    #[test]
    fn empty_bout_table_keeps_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bouts.csv");
        write_bouts(&path, &[]).unwrap();
        assert_eq!(
            "Trial Number,Start,End,# of Licks,Rewarding,Highly Rewarding,Lick Efficiency\n",
            fs::read_to_string(&path).unwrap()
        );
    }

    #[test]
    fn summary_columns_are_united() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("summary.csv");
        let summaries = vec![
            MetricSummary {
                session: String::from("M1"),
                entries: vec![(String::from("Average AUC"), 2.0)],
            },
            MetricSummary {
                session: String::from("M2"),
                entries: vec![
                    (String::from("Average AUC"), f64::NAN),
                    (String::from("Std AUC"), 1.0),
                ],
            },
        ];
        write_summary(&path, &summaries).unwrap();
        assert_eq!(
            "Session,Average AUC,Std AUC\nM1,2,\nM2,NaN,1\n",
            fs::read_to_string(&path).unwrap()
        );
    }
}
