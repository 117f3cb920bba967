#![recursion_limit = "256"]

pub mod types;
pub mod data;
pub mod model;
pub mod metrics_log;
pub mod gps;

// 機械学習機能（Burn）
#[cfg(feature = "ml")]
pub mod ml;
#[cfg(feature = "ml")]
pub mod survey;
#[cfg(feature = "ml")]
pub mod cli;
#[cfg(feature = "ml")]
mod ml_commands;
