use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::from_reader;

use crate::calcium_sync::SyncStrategy;
use crate::error::PipelineError;
use crate::models::{AttributionMode, Phase};
use crate::phase_stats::StatsConfig;

/// Unit of the calcium recording's time column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    #[default]
    Milliseconds,
    Seconds,
}

impl TimeUnit {
    pub fn to_seconds(self, value: f64) -> f64 {
        match self {
            TimeUnit::Milliseconds => value / 1000.0,
            TimeUnit::Seconds => value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CalciumConfig {
    pub time_unit: TimeUnit,
    pub time_column: String,
    pub value_column: String,
    /// Calcium kept on each side of a lick bout.
    pub bout_padding_ms: f64,
    /// Window before a bout used for the pre-bout slope and rate.
    pub pre_bout_ms: f64,
    pub lowpass_cutoff_hz: f64,
    /// Samples before the trial start in the trial matrix.
    pub trial_pre_samples: usize,
    /// Samples from the trial start in the trial matrix.
    pub trial_post_samples: usize,
}

impl Default for CalciumConfig {
    fn default() -> Self {
        CalciumConfig {
            time_unit: TimeUnit::Milliseconds,
            time_column: String::from("Time"),
            value_column: String::from("Values"),
            bout_padding_ms: 500.0,
            pre_bout_ms: 500.0,
            lowpass_cutoff_hz: 2.0,
            trial_pre_samples: 244,
            trial_post_samples: 976,
        }
    }
}

/// Everything a batch run needs. Every field has a default so a config file
/// only lists what it changes.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Raw controller logs, one `phase N` directory per phase.
    pub input_dir: PathBuf,
    /// Calcium recordings, `phase N/<session>.csv`.
    pub calcium_dir: PathBuf,
    pub output_dir: PathBuf,
    pub phases: Vec<Phase>,
    pub modes: Vec<AttributionMode>,
    pub sync_strategy: SyncStrategy,
    /// Write reward-minus-time difference tables when both modes run.
    pub compare_modes: bool,
    #[serde(flatten)]
    pub stats: StatsConfig,
    pub calcium: CalciumConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            input_dir: PathBuf::from("raw_data"),
            calcium_dir: PathBuf::from("raw_data/calcium"),
            output_dir: PathBuf::from("output"),
            phases: Phase::ALL.to_vec(),
            modes: AttributionMode::ALL.to_vec(),
            sync_strategy: SyncStrategy::default(),
            compare_modes: true,
            stats: StatsConfig::default(),
            calcium: CalciumConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_file(path: &Path) -> Result<Self, PipelineError> {
        let file = File::open(path).map_err(|e| PipelineError::io(path, e))?;
        let config = from_reader(BufReader::new(file))?;
        Ok(config)
    }

    pub fn parsed_dir(&self, phase: Phase) -> PathBuf {
        self.output_dir.join("parsed_data").join(phase.dir_name())
    }

    pub fn stats_dir(&self, phase: Phase) -> PathBuf {
        self.output_dir.join("stats").join(phase.dir_name())
    }

    pub fn calcium_output_dir(&self, phase: Phase) -> PathBuf {
        self.output_dir.join("calcium").join(phase.dir_name())
    }

    pub fn calcium_file(&self, phase: Phase, session: &str) -> PathBuf {
        self.calcium_dir.join(phase.dir_name()).join(format!("{session}.csv"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = PipelineConfig::default();
        assert_eq!(500.0, config.stats.bouts.gap_ms);
        assert_eq!(150.0, config.stats.bouts.efficient_gap_ms);
        assert_eq!(5, config.stats.bouts.highly_rewarding_licks);
        assert_eq!(5000.0, config.stats.press_window_ms);
        assert!(!config.stats.allow_multi_claim);
        assert_eq!(244, config.calcium.trial_pre_samples);
        assert_eq!(976, config.calcium.trial_post_samples);
        assert_eq!(vec![Phase::One, Phase::Two, Phase::Three], config.phases);
        assert_eq!(
            Path::new("raw_data/calcium/phase 2/M1.csv"),
            config.calcium_file(Phase::Two, "M1")
        );
    }

    #[test]
    fn partial_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "phases": [3],
                "modes": ["reward"],
                "allow_multi_claim": true,
                "sync_strategy": "index_aligned",
                "bouts": {{ "gap_ms": 750 }},
                "calcium": {{ "time_unit": "seconds", "value_column": "AIN01" }}
            }}"#
        )
        .unwrap();

        let config = PipelineConfig::from_file(file.path()).unwrap();
        assert_eq!(vec![Phase::Three], config.phases);
        assert_eq!(vec![AttributionMode::Reward], config.modes);
        assert!(config.stats.allow_multi_claim);
        assert_eq!(SyncStrategy::IndexAligned, config.sync_strategy);
        assert_eq!(750.0, config.stats.bouts.gap_ms);
        assert_eq!(150.0, config.stats.bouts.efficient_gap_ms);
        assert_eq!(TimeUnit::Seconds, config.calcium.time_unit);
        assert_eq!("AIN01", config.calcium.value_column);
        assert_eq!("Time", config.calcium.time_column);
    }

    #[test]
    fn bad_phase_is_a_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "phases": [4] }}"#).unwrap();
        let err = PipelineConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn output_layout() {
        let config = PipelineConfig {
            output_dir: PathBuf::from("out"),
            calcium_dir: PathBuf::from("raw"),
            ..Default::default()
        };
        assert_eq!(PathBuf::from("out/stats/phase 2"), config.stats_dir(Phase::Two));
        assert_eq!(PathBuf::from("raw/phase 1/M12.csv"), config.calcium_file(Phase::One, "M12"));
        assert_eq!(1.5, TimeUnit::Milliseconds.to_seconds(1500.0));
    }
}
