//! Device-resident trace abstractions.
//!
//! Network analyzers and similar frequency-domain instruments hold whole
//! measurement traces on the device: one complex (in-phase/quadrature)
//! sample per point of a frequency grid the instrument itself defines. An
//! [`InstrumentTrace`] exposes one such trace; the station activates it,
//! reads the paired series in a single transfer, and derives three columns
//! per trace: raw I, raw Q, and the log-magnitude of the complex pair.

use anyhow::Result;
use async_trait::async_trait;
use num_complex::Complex64;
use std::sync::Arc;

/// One device-resident IQ trace on a measurement channel.
#[async_trait]
pub trait InstrumentTrace: Send + Sync {
    /// Owning instrument identifier (column name prefix).
    fn instrument_name(&self) -> &str;

    /// Owning measurement channel.
    fn channel_name(&self) -> &str;

    /// Trace identifier within the channel.
    fn trace_name(&self) -> &str;

    /// Declared physical quantity, e.g. a scattering parameter like "S21".
    fn quantity(&self) -> &str;

    /// Make this the instrument's active trace before a read.
    async fn activate(&self) -> Result<()>;

    /// Transfer the trace's paired series, one complex sample per
    /// frequency point. Raw and unscaled.
    async fn read_iq(&self) -> Result<Vec<Complex64>>;

    /// The frequency grid the instrument sweeps, in Hz.
    async fn frequency_setpoints(&self) -> Result<Vec<f64>>;
}

/// Per-point derived scalar: `10 * log10(i^2 + q^2)`.
pub fn log_magnitude(sample: Complex64) -> f64 {
    10.0 * sample.norm_sqr().log10()
}

/// A followed trace: the registration record over an [`InstrumentTrace`].
#[derive(Clone)]
pub struct FollowedTrace {
    trace: Arc<dyn InstrumentTrace>,
}

impl FollowedTrace {
    pub(crate) fn new(trace: Arc<dyn InstrumentTrace>) -> Self {
        Self { trace }
    }

    /// Instrument name as the driver reports it.
    pub fn instrument_name(&self) -> &str {
        self.trace.instrument_name()
    }

    /// Trace identifier within its channel.
    pub fn trace_name(&self) -> &str {
        self.trace.trace_name()
    }

    /// Declared physical quantity of the trace.
    pub fn quantity(&self) -> &str {
        self.trace.quantity()
    }

    /// Dotted `instrument.channel.trace` base for the column names.
    pub fn qualified_name(&self) -> String {
        format!(
            "{}.{}.{}",
            self.trace.instrument_name().to_lowercase(),
            self.trace.channel_name().to_lowercase(),
            self.trace.trace_name().to_lowercase()
        )
    }

    /// The three derived column names, in row order: raw I, raw Q,
    /// log-magnitude.
    pub fn column_names(&self) -> [String; 3] {
        let base = self.qualified_name();
        [format!("{base}_i"), format!("{base}_q"), base]
    }

    /// The instrument's frequency grid, in Hz.
    pub async fn frequency_setpoints(&self) -> Result<Vec<f64>> {
        self.trace.frequency_setpoints().await
    }

    /// Activate and read the trace, returning the three derived values per
    /// frequency point.
    pub async fn read_points(&self) -> Result<Vec<[f64; 3]>> {
        self.trace.activate().await?;
        let samples = self.trace.read_iq().await?;
        Ok(samples
            .into_iter()
            .map(|s| [s.re, s.im, log_magnitude(s)])
            .collect())
    }
}

/// In-memory trace with a fixed grid and canned IQ data, for tests and
/// dry runs.
pub struct SimulatedTrace {
    instrument_name: String,
    channel_name: String,
    trace_name: String,
    quantity: String,
    frequencies: Vec<f64>,
    samples: Vec<Complex64>,
}

impl SimulatedTrace {
    /// Create a trace returning `samples` over `frequencies`.
    pub fn new(
        instrument_name: impl Into<String>,
        channel_name: impl Into<String>,
        trace_name: impl Into<String>,
        quantity: impl Into<String>,
        frequencies: Vec<f64>,
        samples: Vec<Complex64>,
    ) -> Self {
        Self {
            instrument_name: instrument_name.into(),
            channel_name: channel_name.into(),
            trace_name: trace_name.into(),
            quantity: quantity.into(),
            frequencies,
            samples,
        }
    }
}

#[async_trait]
impl InstrumentTrace for SimulatedTrace {
    fn instrument_name(&self) -> &str {
        &self.instrument_name
    }

    fn channel_name(&self) -> &str {
        &self.channel_name
    }

    fn trace_name(&self) -> &str {
        &self.trace_name
    }

    fn quantity(&self) -> &str {
        &self.quantity
    }

    async fn activate(&self) -> Result<()> {
        Ok(())
    }

    async fn read_iq(&self) -> Result<Vec<Complex64>> {
        Ok(self.samples.clone())
    }

    async fn frequency_setpoints(&self) -> Result<Vec<f64>> {
        Ok(self.frequencies.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_trace() -> FollowedTrace {
        FollowedTrace::new(Arc::new(SimulatedTrace::new(
            "VNA",
            "Ch1",
            "Trc1",
            "S21",
            vec![1e9, 2e9],
            vec![Complex64::new(3.0, 4.0), Complex64::new(1.0, 0.0)],
        )))
    }

    #[test]
    fn test_log_magnitude() {
        // |3 + 4i|^2 = 25 -> 10 * log10(25)
        let got = log_magnitude(Complex64::new(3.0, 4.0));
        assert!((got - 10.0 * 25.0_f64.log10()).abs() < 1e-12);
    }

    #[test]
    fn test_column_names_lowercased() {
        let cols = test_trace().column_names();
        assert_eq!(cols[0], "vna.ch1.trc1_i");
        assert_eq!(cols[1], "vna.ch1.trc1_q");
        assert_eq!(cols[2], "vna.ch1.trc1");
    }

    #[tokio::test]
    async fn test_read_points_derives_columns() {
        let points = test_trace().read_points().await.unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0][0], 3.0);
        assert_eq!(points[0][1], 4.0);
        assert!((points[0][2] - 10.0 * 25.0_f64.log10()).abs() < 1e-12);
        assert_eq!(points[1][2], 0.0); // |1|^2 = 1 -> 0 dB
    }
}
