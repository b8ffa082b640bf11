use std::ops::AddAssign;
use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};
use rayon::prelude::*;

use crate::arduino_log::parse_session_log;
use crate::calcium_metrics::{bout_metrics, summarize_trials, trial_metrics, MetricSummary};
use crate::calcium_sync::{bout_windows, segment_trace, trial_matrix};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::models::{AttributionMode, EventTable, Phase, PhaseReport};
use crate::phase_stats::{compare_modes, phase_report};
use crate::phase_utils::{session_windows, TrialWindows};
use crate::session_io::{
    is_calcium_recording, list_files, load_calcium, load_sheet, write_aggregate, write_aligned,
    write_bout_metrics, write_bout_windows, write_bouts, write_event_table, write_metadata,
    write_segments, write_stat_table, write_summary, write_trial_matrix, write_trial_metrics,
    SheetKind,
};

/// Which outputs a run produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stages {
    pub parse: bool,
    pub stats: bool,
    pub calcium: bool,
}

impl Stages {
    pub const ALL: Stages = Stages {
        parse: true,
        stats: true,
        calcium: true,
    };
    pub const PARSE: Stages = Stages {
        parse: true,
        stats: false,
        calcium: false,
    };
    pub const STATS: Stages = Stages {
        parse: false,
        stats: true,
        calcium: false,
    };
    pub const CALCIUM: Stages = Stages {
        parse: false,
        stats: false,
        calcium: true,
    };
}

/// Session counts of a batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchSummary {
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl BatchSummary {
    pub fn total(&self) -> usize {
        self.processed + self.skipped + self.failed
    }
}

impl AddAssign for BatchSummary {
    fn add_assign(&mut self, other: Self) {
        self.processed += other.processed;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

#[derive(Debug)]
enum SessionOutcome {
    Processed(Option<MetricSummary>),
    /// Behavior was processed but the calcium recording is missing.
    Skipped,
}

/// Input files of one phase, without the calcium recordings that may share
/// the directory. A missing phase directory yields nothing.
pub fn discover(config: &PipelineConfig, phase: Phase) -> Result<Vec<PathBuf>, PipelineError> {
    let dir = config.input_dir.join(phase.dir_name());
    if !dir.is_dir() {
        warn!("{} not found, skipping {phase}", dir.display());
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for path in list_files(&dir)? {
        match is_calcium_recording(&path, &config.calcium) {
            Ok(true) => debug!("{}: calcium recording, not a session", path.display()),
            // unreadable files fail later, as their own session
            Ok(false) | Err(_) => files.push(path),
        }
    }
    Ok(files)
}

fn stats_file(config: &PipelineConfig, phase: Phase, session: &str, kind: &str) -> PathBuf {
    config.stats_dir(phase).join(format!("{session}-{kind}.csv"))
}

fn calcium_output(config: &PipelineConfig, phase: Phase, session: &str, kind: &str) -> PathBuf {
    config.calcium_output_dir(phase).join(format!("{session}-{kind}.csv"))
}

fn write_reports(
    config: &PipelineConfig,
    phase: Phase,
    session: &str,
    reports: &[PhaseReport],
) -> Result<(), PipelineError> {
    let file = |kind: &str| stats_file(config, phase, session, kind);
    for report in reports {
        let mode = report.mode;
        write_aggregate(&file(&format!("{mode}-test")), &report.aggregate)?;
        write_stat_table(&file(&format!("{mode}-trials")), &report.trials)?;
        write_bouts(&file(&format!("{mode}-bouts")), &report.bouts.bouts)?;
    }

    let by_mode = |mode: AttributionMode| reports.iter().find(|r| r.mode == mode);
    if config.compare_modes {
        let both = (by_mode(AttributionMode::Reward), by_mode(AttributionMode::Time));
        if let (Some(reward), Some(time)) = both {
            let diff = compare_modes(reward, time);
            write_aggregate(&file("diff-test"), &diff.aggregate)?;
            write_stat_table(&file("diff-trials"), &diff.trials)?;
        }
    }
    Ok(())
}

/// Segments the session's calcium and writes every calcium artifact.
/// `Ok(None)` when the session has no recording.
fn process_calcium(
    config: &PipelineConfig,
    phase: Phase,
    session: &str,
    events: &EventTable,
    trials: &TrialWindows,
    report: &PhaseReport,
) -> Result<Option<MetricSummary>, PipelineError> {
    let path = config.calcium_file(phase, session);
    if !path.is_file() {
        let missing = PipelineError::MissingCalcium {
            session: session.to_string(),
            path,
        };
        warn!("{missing}");
        return Ok(None);
    }
    let calcium = &config.calcium;
    let trace = load_calcium(&path, calcium)?;
    let synced = segment_trace(events, trials, &trace, config.sync_strategy);
    write_segments(&calcium_output(config, phase, session, "segments"), &synced)?;
    write_aligned(&calcium_output(config, phase, session, "aligned"), events, &synced)?;

    let bouts = &report.bouts.bouts;
    let windows = bout_windows(&synced, bouts, calcium.bout_padding_ms);
    let metrics: Vec<_> = windows
        .iter()
        .zip(bouts)
        .map(|(window, bout)| bout_metrics(window, bout, calcium))
        .collect();
    write_bout_windows(&calcium_output(config, phase, session, "bout-windows"), &windows)?;
    write_bout_metrics(&calcium_output(config, phase, session, "bout-metrics"), &metrics)?;

    let matrix = trial_matrix(
        &synced,
        trace.sample_rate(),
        calcium.trial_pre_samples,
        calcium.trial_post_samples,
    );
    let per_trial = trial_metrics(&matrix);
    write_trial_matrix(&calcium_output(config, phase, session, "trial-matrix"), &matrix)?;
    write_trial_metrics(&calcium_output(config, phase, session, "trial-metrics"), &per_trial)?;
    debug!("{session}: {} bouts, {} calcium trials", metrics.len(), per_trial.len());

    Ok(Some(summarize_trials(session, &per_trial)))
}

fn process_file(
    config: &PipelineConfig,
    phase: Phase,
    path: &Path,
    stages: Stages,
) -> Result<SessionOutcome, PipelineError> {
    let sheet = load_sheet(path)?;
    let lines = match sheet.kind {
        SheetKind::Metadata { header, records } => {
            if stages.parse {
                let out = config.parsed_dir(phase).join(format!("{}.csv", sheet.name));
                write_metadata(&out, &header, &records)?;
            }
            debug!("{}: metadata sheet", path.display());
            return Ok(SessionOutcome::Processed(None));
        }
        SheetKind::Session { lines } => lines,
    };

    let session = sheet.name.as_str();
    let events = parse_session_log(&lines, phase).map_err(|source| PipelineError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    if stages.parse {
        write_event_table(&config.parsed_dir(phase).join(format!("{session}.csv")), &events)?;
    }
    if !stages.stats && !stages.calcium {
        return Ok(SessionOutcome::Processed(None));
    }

    let trials = session_windows(&events);
    let mut reports: Vec<PhaseReport> = config
        .modes
        .iter()
        .map(|&mode| phase_report(phase, &events, &trials, mode, &config.stats))
        .collect();
    if stages.stats {
        write_reports(config, phase, session, &reports)?;
    }
    if !stages.calcium {
        return Ok(SessionOutcome::Processed(None));
    }

    // bouts for calcium come from the first configured mode
    if reports.is_empty() {
        let report = phase_report(phase, &events, &trials, AttributionMode::Reward, &config.stats);
        reports.push(report);
    }
    match process_calcium(config, phase, session, &events, &trials, &reports[0])? {
        Some(summary) => Ok(SessionOutcome::Processed(Some(summary))),
        None => Ok(SessionOutcome::Skipped),
    }
}

/// Runs `stages` over every file of every configured phase. A session or
/// phase summary that fails is logged and counted; it never stops the batch.
pub fn run(config: &PipelineConfig, stages: Stages) -> Result<BatchSummary, PipelineError> {
    let mut total = BatchSummary::default();

    for &phase in &config.phases {
        let files = discover(config, phase)?;
        info!("{phase}: {} input files", files.len());

        let outcomes: Vec<(&PathBuf, Result<SessionOutcome, PipelineError>)> = files
            .par_iter()
            .map(|path| (path, process_file(config, phase, path, stages)))
            .collect();

        let mut counts = BatchSummary::default();
        let mut summaries = Vec::new();
        for (path, outcome) in outcomes {
            match outcome {
                Ok(SessionOutcome::Processed(summary)) => {
                    counts.processed += 1;
                    summaries.extend(summary);
                }
                Ok(SessionOutcome::Skipped) => counts.skipped += 1,
                Err(e) => {
                    error!("{}: {e}", path.display());
                    counts.failed += 1;
                }
            }
        }

        if !summaries.is_empty() {
            let path = config
                .output_dir
                .join("calcium")
                .join(format!("metrics_summary_phase_{}.csv", phase.number()));
            if let Err(e) = write_summary(&path, &summaries) {
                error!("{}: {e}", path.display());
                counts.failed += 1;
            }
        }
        info!(
            "{phase}: {} processed, {} skipped, {} failed",
            counts.processed, counts.skipped, counts.failed
        );
        total += counts;
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn config_in(root: &Path) -> PipelineConfig {
        PipelineConfig {
            input_dir: root.join("in"),
            calcium_dir: root.join("in"),
            output_dir: root.join("out"),
            ..Default::default()
        }
    }

    #[test]
    fn summaries_add_up() {
        let mut total = BatchSummary {
            processed: 2,
            skipped: 1,
            failed: 0,
        };
        total += BatchSummary {
            processed: 1,
            skipped: 0,
            failed: 3,
        };
        assert_eq!(3, total.processed);
        assert_eq!(7, total.total());
    }

    #[test]
    fn missing_phase_directory_is_empty() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        assert!(discover(&config, Phase::Two).unwrap().is_empty());
        assert_eq!(BatchSummary::default(), run(&config, Stages::ALL).unwrap());
    }

    #[test]
    fn malformed_log_fails_only_its_session() {
        let dir = tempdir().unwrap();
        let config = PipelineConfig {
            phases: vec![Phase::One],
            ..config_in(dir.path())
        };
        let phase_dir = dir.path().join("in").join("phase 1");
        fs::create_dir_all(&phase_dir).unwrap();
        fs::write(phase_dir.join("bad.txt"), "lick,ms=abc\n").unwrap();
        fs::write(phase_dir.join("good.txt"), "trialNum=1,cueOn,ms=100\nlick,ms=150\n").unwrap();

        let summary = run(&config, Stages::PARSE).unwrap();
        assert_eq!(1, summary.processed);
        assert_eq!(1, summary.failed);
        assert!(config.parsed_dir(Phase::One).join("good.csv").is_file());
        assert!(!config.parsed_dir(Phase::One).join("bad.csv").exists());
    }

    fn write_recording(path: &Path, samples: usize) {
        let mut text = String::from("Time,Values\n");
        for i in 0..samples {
            text.push_str(&format!("{},{}\n", i * 50, 1.0 + i as f64 / 10.0));
        }
        fs::write(path, text).unwrap();
    }

    #[test]
    fn summary_failure_is_counted_and_later_phases_run() {
        let dir = tempdir().unwrap();
        let config = PipelineConfig {
            phases: vec![Phase::One, Phase::Two],
            ..config_in(dir.path())
        };
        let one = dir.path().join("in").join("phase 1");
        fs::create_dir_all(&one).unwrap();
        let log = "trialNum=1,cueOn,ms=0\nlick,ms=500\nREWARD,ms=600\n\
                   trialNum=2,cueOn,ms=2000\nlick,ms=2500\n";
        fs::write(one.join("M1.txt"), log).unwrap();
        write_recording(&one.join("M1.csv"), 61);
        let two = dir.path().join("in").join("phase 2");
        fs::create_dir_all(&two).unwrap();
        fs::write(two.join("M2.txt"), "trialNum=1,cueOn,ms=0\nlick,ms=500\n").unwrap();

        // a directory where the phase 1 summary file should go
        let blocked = config.output_dir.join("calcium").join("metrics_summary_phase_1.csv");
        fs::create_dir_all(&blocked).unwrap();

        let summary = run(&config, Stages::ALL).unwrap();
        assert_eq!(
            BatchSummary {
                processed: 1,
                skipped: 1,
                failed: 1,
            },
            summary
        );
        assert!(config.calcium_output_dir(Phase::One).join("M1-segments.csv").is_file());
        assert!(config.parsed_dir(Phase::Two).join("M2.csv").is_file());
    }

    #[test]
    fn metadata_is_copied_through() {
        let dir = tempdir().unwrap();
        let config = PipelineConfig {
            phases: vec![Phase::Two],
            ..config_in(dir.path())
        };
        let phase_dir = dir.path().join("in").join("phase 2");
        fs::create_dir_all(&phase_dir).unwrap();
        fs::write(phase_dir.join("subjects.csv"), "Animal ID,Sex\nM1,F\n").unwrap();

        let summary = run(&config, Stages::ALL).unwrap();
        assert_eq!(1, summary.processed);
        let copied = config.parsed_dir(Phase::Two).join("subjects.csv");
        let copied = fs::read_to_string(copied).unwrap();
        assert_eq!("Animal ID,Sex\nM1,F\n", copied);
    }
}
