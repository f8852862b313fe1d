//! Measurement-sweep orchestration for laboratory instruments.
//!
//! A [`station::Station`] is a collection of instrument parameters and
//! traces that can be measured together. It drives 0D (single sample),
//! 1D, 2D, and frequency-trace sweeps, persisting every sample through an
//! append-only [`storage::RunWriter`] with provenance metadata while
//! streaming the same rows to a [`plot::LivePlotter`]. Runs are
//! interruptible with Ctrl-C at well-defined points, never mid-command,
//! and always leave a closed, readable dataset behind.

pub mod config;
pub mod error;
pub mod interrupt;
pub mod metadata;
pub mod parameter;
pub mod plot;
pub mod station;
pub mod storage;
pub mod trace;

pub use config::StationConfig;
pub use error::{AppResult, StationError};
pub use station::{RunResult, Station};
