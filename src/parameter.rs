//! Instrument parameter abstractions.
//!
//! A [`SweepParameter`] is a named accessor over one numeric quantity on
//! an external device: always readable, optionally writable when the
//! underlying quantity can be swept. Implementations speak whatever
//! command set their instrument requires; this layer adds no retries and
//! no timeouts, so any I/O failure propagates to the caller and aborts
//! the run in progress.
//!
//! Provenance capture uses capability traits instead of instrument-name
//! matching: an instrument that can report correction-calibration state
//! implements [`ProvenanceSource::calibration_snapshot`], a signal source
//! implements [`ProvenanceSource::source_snapshot`], and the station
//! queries both once per run while assembling metadata.

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::StationError;

// =============================================================================
// Provenance capability
// =============================================================================

/// Correction-calibration state of an impedance-analyzer-class instrument,
/// captured once at run start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSnapshot {
    /// Short correction state (e.g. "ON"/"OFF").
    pub short_correction: String,
    /// Open correction state.
    pub open_correction: String,
    /// Load correction state.
    pub load_correction: String,
    /// Active primary measurement variable (e.g. "CS").
    pub primary_variable: String,
    /// Active secondary measurement variable (e.g. "D").
    pub secondary_variable: String,
}

/// Output state of a source-class instrument (signal generator, lock-in
/// sine out), captured once at run start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSnapshot {
    /// Output frequency in Hz.
    pub frequency_hz: f64,
    /// Output amplitude, in the instrument's native unit.
    pub amplitude: f64,
}

/// Capability interface for instruments that can contribute provenance
/// metadata to a run.
///
/// Both snapshots default to `None`; concrete bindings override whichever
/// they support. Snapshot reads may touch the instrument, so errors
/// propagate like any other device error.
#[async_trait]
pub trait ProvenanceSource: Send + Sync {
    /// Instrument identifier used as the provenance metadata key.
    fn name(&self) -> &str;

    /// Correction-calibration state, for instruments that track one.
    async fn calibration_snapshot(&self) -> Result<Option<CalibrationSnapshot>> {
        Ok(None)
    }

    /// Frequency/amplitude output state, for source-class instruments.
    async fn source_snapshot(&self) -> Result<Option<SourceSnapshot>> {
        Ok(None)
    }
}

// =============================================================================
// SweepParameter
// =============================================================================

/// A named, numeric quantity on an external device.
#[async_trait]
pub trait SweepParameter: Send + Sync {
    /// Fully-qualified parameter name, unique within a run's schema.
    fn full_name(&self) -> &str;

    /// The owning instrument, when it can contribute provenance metadata.
    fn instrument(&self) -> Option<Arc<dyn ProvenanceSource>> {
        None
    }

    /// Whether [`write`](Self::write) is supported.
    fn is_writable(&self) -> bool {
        false
    }

    /// Read the current value from the device.
    async fn read(&self) -> Result<f64>;

    /// Write a setpoint to the device. Defined only for swept parameters.
    async fn write(&self, _setpoint: f64) -> Result<()> {
        Err(StationError::ReadOnlyParameter(self.full_name().to_string()).into())
    }
}

/// A followed parameter: the registration record pairing a
/// [`SweepParameter`] with the gain applied to every read.
#[derive(Clone)]
pub struct FollowedParam {
    param: Arc<dyn SweepParameter>,
    gain: f64,
}

impl FollowedParam {
    pub(crate) fn new(param: Arc<dyn SweepParameter>, gain: f64) -> Self {
        Self { param, gain }
    }

    /// Fully-qualified name of the wrapped parameter.
    pub fn full_name(&self) -> &str {
        self.param.full_name()
    }

    /// Gain divisor applied to every read.
    pub fn gain(&self) -> f64 {
        self.gain
    }

    /// The wrapped parameter's instrument, if any.
    pub fn instrument(&self) -> Option<Arc<dyn ProvenanceSource>> {
        self.param.instrument()
    }

    /// Read the parameter and apply the gain.
    pub async fn read(&self) -> Result<f64> {
        Ok(self.param.read().await? / self.gain)
    }
}

// =============================================================================
// Simulated implementations
// =============================================================================

/// In-memory instrument with canned provenance snapshots. Stands in for a
/// hardware binding in tests and examples.
#[derive(Debug, Default)]
pub struct SimulatedInstrument {
    name: String,
    calibration: Option<CalibrationSnapshot>,
    source: Option<SourceSnapshot>,
}

impl SimulatedInstrument {
    /// Create an instrument with no provenance capabilities.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            calibration: None,
            source: None,
        }
    }

    /// Report the given calibration snapshot.
    pub fn with_calibration(mut self, calibration: CalibrationSnapshot) -> Self {
        self.calibration = Some(calibration);
        self
    }

    /// Report the given source snapshot.
    pub fn with_source(mut self, source: SourceSnapshot) -> Self {
        self.source = Some(source);
        self
    }
}

#[async_trait]
impl ProvenanceSource for SimulatedInstrument {
    fn name(&self) -> &str {
        &self.name
    }

    async fn calibration_snapshot(&self) -> Result<Option<CalibrationSnapshot>> {
        Ok(self.calibration.clone())
    }

    async fn source_snapshot(&self) -> Result<Option<SourceSnapshot>> {
        Ok(self.source.clone())
    }
}

/// In-memory parameter with optional Gaussian-ish read noise. Useful for
/// dry runs of a measurement script with no hardware attached.
pub struct SimulatedParameter {
    full_name: String,
    instrument: Option<Arc<dyn ProvenanceSource>>,
    value: RwLock<f64>,
    noise: f64,
    writable: bool,
}

impl SimulatedParameter {
    /// Create a read-only parameter that reads back `initial`.
    pub fn new(full_name: impl Into<String>, initial: f64) -> Self {
        Self {
            full_name: full_name.into(),
            instrument: None,
            value: RwLock::new(initial),
            noise: 0.0,
            writable: false,
        }
    }

    /// Add uniform read noise of the given amplitude.
    pub fn with_noise(mut self, amplitude: f64) -> Self {
        self.noise = amplitude;
        self
    }

    /// Allow the parameter to be swept.
    pub fn writable(mut self) -> Self {
        self.writable = true;
        self
    }

    /// Attach an owning instrument for provenance capture.
    pub fn with_instrument(mut self, instrument: Arc<dyn ProvenanceSource>) -> Self {
        self.instrument = Some(instrument);
        self
    }
}

#[async_trait]
impl SweepParameter for SimulatedParameter {
    fn full_name(&self) -> &str {
        &self.full_name
    }

    fn instrument(&self) -> Option<Arc<dyn ProvenanceSource>> {
        self.instrument.clone()
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    async fn read(&self) -> Result<f64> {
        let value = *self.value.read().await;
        if self.noise == 0.0 {
            return Ok(value);
        }
        let jitter = rand::thread_rng().gen_range(-self.noise..=self.noise);
        Ok(value + jitter)
    }

    async fn write(&self, setpoint: f64) -> Result<()> {
        if !self.writable {
            return Err(StationError::ReadOnlyParameter(self.full_name.clone()).into());
        }
        *self.value.write().await = setpoint;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_followed_param_applies_gain() {
        let param = Arc::new(SimulatedParameter::new("lockin.x", 10.0));
        let followed = FollowedParam::new(param, 100.0);
        assert_eq!(followed.read().await.unwrap(), 0.1);
    }

    #[tokio::test]
    async fn test_read_only_write_rejected() {
        let param = SimulatedParameter::new("dmm.voltage", 1.5);
        assert!(!param.is_writable());
        assert!(param.write(2.0).await.is_err());
        assert_eq!(param.read().await.unwrap(), 1.5);
    }

    #[tokio::test]
    async fn test_writable_roundtrip() {
        let param = SimulatedParameter::new("gate.voltage", 0.0).writable();
        param.write(-0.25).await.unwrap();
        assert_eq!(param.read().await.unwrap(), -0.25);
    }

    #[tokio::test]
    async fn test_noise_bounded() {
        let param = SimulatedParameter::new("noisy", 5.0).with_noise(0.1);
        for _ in 0..100 {
            let v = param.read().await.unwrap();
            assert!((4.9..=5.1).contains(&v));
        }
    }

    #[tokio::test]
    async fn test_provenance_defaults() {
        let instrument = SimulatedInstrument::new("bare");
        assert!(instrument.calibration_snapshot().await.unwrap().is_none());
        assert!(instrument.source_snapshot().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_provenance_snapshots() {
        let instrument = SimulatedInstrument::new("zm2376").with_calibration(CalibrationSnapshot {
            short_correction: "ON".into(),
            open_correction: "ON".into(),
            load_correction: "OFF".into(),
            primary_variable: "CS".into(),
            secondary_variable: "D".into(),
        });
        let snap = instrument.calibration_snapshot().await.unwrap().unwrap();
        assert_eq!(snap.primary_variable, "CS");
    }
}
