use log::warn;
use serde::{Deserialize, Serialize};

use crate::models::{Bout, BoutTable, Diagnostic, Series};
use crate::phase_utils::{filter_window, find_closest, TrialWindows};

/// Licks partitioned by reward attribution.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LickSplit {
    pub rewarded: Series<u32>,
    pub not_rewarded: Series<u32>,
}

impl LickSplit {
    fn from_mask(licks: &Series<u32>, mask: &[bool]) -> Self {
        let inverted: Vec<bool> = mask.iter().map(|m| !m).collect();
        LickSplit {
            rewarded: licks.filter_mask(mask),
            not_rewarded: licks.filter_mask(&inverted),
        }
    }
}

/// Each reward claims the latest lick at or before it (see [`find_closest`]).
///
/// With `allow_multi_claim`, a lick claimed by several rewards appears once
/// per claim in the rewarded set; otherwise it is rewarded once.
pub fn lick_reward_split(
    reward_times: &[f64],
    licks: &Series<u32>,
    allow_multi_claim: bool,
) -> LickSplit {
    let mut claimed = find_closest(&licks.times, reward_times);
    if claimed.is_empty() {
        return LickSplit {
            rewarded: Series::new(),
            not_rewarded: licks.clone(),
        };
    }

    let mut mask = vec![false; licks.len()];
    for &i in &claimed {
        mask[i] = true;
    }
    let not_rewarded = licks.filter_mask(&mask.iter().map(|m| !m).collect::<Vec<_>>());

    if !allow_multi_claim {
        claimed.sort_unstable();
        claimed.dedup();
    }
    LickSplit {
        rewarded: licks.select(&claimed),
        not_rewarded,
    }
}

/// A lick is rewarded when it follows the latest press at or before it by at
/// most `threshold_ms`.
pub fn lick_press_split(press_times: &[f64], licks: &Series<u32>, threshold_ms: f64) -> LickSplit {
    if press_times.is_empty() {
        return LickSplit {
            rewarded: Series::new(),
            not_rewarded: licks.clone(),
        };
    }
    let threshold = threshold_ms / 1000.0 + 1e-9;
    let mask: Vec<bool> = find_closest(press_times, &licks.times)
        .into_iter()
        .zip(&licks.times)
        .map(|(i, t)| {
            let diff = t - press_times[i];
            diff >= 0.0 && diff <= threshold
        })
        .collect();
    LickSplit::from_mask(licks, &mask)
}

/// Thresholds of the bout segmentation, in milliseconds.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BoutConfig {
    /// A gap longer than this starts a new bout.
    pub gap_ms: f64,
    /// Inter-lick gaps up to this count as efficient.
    pub efficient_gap_ms: f64,
    /// A bout with more rewarded licks than this is highly rewarding.
    pub highly_rewarding_licks: u64,
}

impl Default for BoutConfig {
    fn default() -> Self {
        BoutConfig {
            gap_ms: 500.0,
            efficient_gap_ms: 150.0,
            highly_rewarding_licks: 5,
        }
    }
}

fn exceeds_ms(gap_s: f64, limit_ms: f64) -> bool {
    gap_s * 1000.0 > limit_ms + 1e-6
}

/// Splits the licks of every trial window into bouts.
///
/// Licks before the first trial start are grouped under trial 0.
pub fn lick_bouts(
    licks: &Series<u32>,
    rewarded: &Series<u32>,
    windows: &TrialWindows,
    config: &BoutConfig,
) -> BoutTable {
    let mut rewarded_times = rewarded.times.clone();
    rewarded_times.sort_by(f64::total_cmp);
    let is_rewarded = |t: f64| rewarded_times.binary_search_by(|r| r.total_cmp(&t)).is_ok();

    let mut bouts = Vec::new();
    for window in windows.all() {
        let trial_licks = filter_window(licks, &window);
        let mut run_start = 0;
        for end in 1..=trial_licks.len() {
            let split_here = end == trial_licks.len()
                || exceeds_ms(trial_licks.times[end] - trial_licks.times[end - 1], config.gap_ms);
            if !split_here {
                continue;
            }
            let times = &trial_licks.times[run_start..end];
            let counts = &trial_licks.values[run_start..end];
            bouts.push(summarize_bout(window.trial, times, counts, &is_rewarded, config));
            run_start = end;
        }
    }

    let rewarding = bouts.iter().filter(|b| b.rewarding).count();
    let diagnostic = match rewarding {
        _ if bouts.is_empty() => None,
        0 => Some(Diagnostic::NoBoutsRewarding),
        n if n == bouts.len() => Some(Diagnostic::AllBoutsRewarding),
        _ => None,
    };
    if let Some(d) = &diagnostic {
        warn!("{d}");
    }
    BoutTable { bouts, diagnostic }
}

fn summarize_bout<F: Fn(f64) -> bool>(
    trial: u32,
    times: &[f64],
    counts: &[u32],
    is_rewarded: F,
    config: &BoutConfig,
) -> Bout {
    let start = times[0];
    let end = times[times.len() - 1];
    let rewarded_licks = times.iter().filter(|t| is_rewarded(**t)).count() as u64;

    let lick_efficiency = if end - start > 0.0 {
        let gaps: Vec<f64> = times.windows(2).map(|w| w[1] - w[0]).collect();
        let efficient = gaps
            .iter()
            .filter(|g| !exceeds_ms(**g, config.efficient_gap_ms))
            .count();
        efficient as f64 / gaps.len() as f64
    } else {
        0.0
    };

    Bout {
        trial_number: trial,
        start,
        end,
        licks: counts.iter().map(|&c| c as u64).sum(),
        rewarding: rewarded_licks > 0,
        highly_rewarding: rewarded_licks > config.highly_rewarding_licks,
        lick_efficiency,
    }
}
