pub mod arduino_log;
pub mod calcium_metrics;
pub mod calcium_sync;
pub mod config;
pub mod error;
pub mod lick_rules;
pub mod models;
pub mod phase_stats;
pub mod phase_utils;
pub mod pipeline;
pub mod session_io;
pub mod signal;
