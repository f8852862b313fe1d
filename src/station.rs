//! The sweep orchestration engine.
//!
//! A [`Station`] is a collection of followed parameters and traces that
//! are measured together. Six entry points drive the four sweep
//! topologies: [`measure`](Station::measure) (single sample),
//! [`watch`](Station::watch) and [`sweep`](Station::sweep) (1-D),
//! [`megasweep`](Station::megasweep) (2-D), and
//! [`sweep_traces`](Station::sweep_traces) /
//! [`megasweep_traces`](Station::megasweep_traces) (frequency-domain
//! instrument sweeps).
//!
//! Every entry point runs the same skeleton: open a [`RunWriter`], install
//! a scoped Ctrl-C listener, assemble provenance metadata and the column
//! schema before the first row, execute the topology's setpoint loop with
//! rows handed to the writer before the plotter, then finalize and close
//! the writer on every exit path. Interruption is checked once per
//! iteration, after the measurement and before the next setpoint write,
//! and ends the run gracefully with all collected rows intact.

use anyhow::Result;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;

use crate::config::StationConfig;
use crate::error::{AppResult, StationError};
use crate::interrupt::{InterruptFlag, InterruptGuard};
use crate::metadata::{fmt_elapsed, unix_time, utc_now_string, RunMetadata};
use crate::parameter::{FollowedParam, ProvenanceSource, SweepParameter};
use crate::plot::{LivePlotter, NullPlotter};
use crate::storage::RunWriter;
use crate::trace::{FollowedTrace, InstrumentTrace};

/// Immutable record of a completed (or interrupted) run.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Storage root the run was written under.
    pub basedir: PathBuf,
    /// Run identifier assigned by the persistence layer.
    pub id: u32,
    /// Metadata snapshot taken at finalization.
    pub metadata: RunMetadata,
    /// Path of the run's row data file.
    pub datapath: PathBuf,
}

impl RunResult {
    /// Whether the run ended through a Ctrl-C request.
    pub fn interrupted(&self) -> bool {
        self.metadata.interrupted()
    }
}

/// A collection of parameters and traces that are measured together.
pub struct Station {
    config: StationConfig,
    params: Vec<FollowedParam>,
    traces: Vec<FollowedTrace>,
    plotter: Box<dyn LivePlotter>,
    notes: String,
    interrupt: InterruptFlag,
}

impl Station {
    /// Create a station writing runs under `config.data_dir`.
    pub fn new(config: StationConfig) -> Self {
        Self {
            config,
            params: Vec::new(),
            traces: Vec::new(),
            plotter: Box::new(NullPlotter),
            notes: String::new(),
            interrupt: InterruptFlag::new(),
        }
    }

    /// Replace the plotter rows are streamed to.
    pub fn with_plotter(mut self, plotter: Box<dyn LivePlotter>) -> Self {
        self.plotter = plotter;
        self
    }

    /// Follow a parameter: read it at every point of every run, dividing
    /// each reading by `gain`. The name must be unique within the
    /// station's column schema.
    pub fn follow_param(
        &mut self,
        param: Arc<dyn SweepParameter>,
        gain: f64,
    ) -> AppResult<&mut Self> {
        if self.column_taken(param.full_name()) {
            return Err(StationError::DuplicateParameter(
                param.full_name().to_string(),
            ));
        }
        self.params.push(FollowedParam::new(param, gain));
        Ok(self)
    }

    /// Follow a device-resident trace: read it once per (slow) setpoint of
    /// a trace sweep, contributing three columns per frequency point.
    pub fn follow_trace(&mut self, trace: Arc<dyn InstrumentTrace>) -> AppResult<&mut Self> {
        let followed = FollowedTrace::new(trace);
        if self.column_taken(&followed.qualified_name()) {
            return Err(StationError::DuplicateTrace(followed.qualified_name()));
        }
        self.traces.push(followed);
        Ok(self)
    }

    /// Attach free-text notes, recorded in the metadata of every
    /// subsequent run.
    pub fn add_notes(&mut self, notes: impl Into<String>) -> &mut Self {
        self.notes = notes.into();
        self
    }

    /// The cancellation flag run loops poll. Triggering it has the same
    /// effect as pressing Ctrl-C during a run.
    pub fn interrupt_flag(&self) -> InterruptFlag {
        self.interrupt.clone()
    }

    fn column_taken(&self, name: &str) -> bool {
        self.params.iter().any(|p| p.full_name() == name)
            || self.traces.iter().any(|t| t.qualified_name() == name)
    }

    /// Columns contributed by followed parameters, in registration order.
    fn param_columns(&self) -> Vec<String> {
        self.params.iter().map(|p| p.full_name().to_string()).collect()
    }

    /// Columns contributed by followed traces, three per trace.
    fn trace_columns(&self) -> Vec<String> {
        self.traces
            .iter()
            .flat_map(|t| t.column_names().into_iter())
            .collect()
    }

    /// Read every followed parameter, gain applied, in registration order.
    async fn read_all(&self) -> Result<Vec<f64>> {
        let mut values = Vec::with_capacity(self.params.len());
        for param in &self.params {
            values.push(param.read().await?);
        }
        Ok(values)
    }

    fn require_no_traces(&self, topology: &'static str) -> AppResult<()> {
        if self.traces.is_empty() {
            Ok(())
        } else {
            Err(StationError::TracesNotSupported(topology))
        }
    }

    fn require_writable(param: &Arc<dyn SweepParameter>) -> AppResult<()> {
        if param.is_writable() {
            Ok(())
        } else {
            Err(StationError::ReadOnlyParameter(
                param.full_name().to_string(),
            ))
        }
    }

    /// Distinct provenance-capable instruments, in registration order.
    fn distinct_instruments(&self) -> Vec<Arc<dyn ProvenanceSource>> {
        let mut seen: Vec<Arc<dyn ProvenanceSource>> = Vec::new();
        for param in &self.params {
            if let Some(instrument) = param.instrument() {
                if !seen.iter().any(|i| i.name() == instrument.name()) {
                    seen.push(instrument);
                }
            }
        }
        seen
    }

    /// Metadata shared by every topology: notes, host, source file, and
    /// the instruments in use.
    fn assemble_common(&self, writer: &mut RunWriter) {
        if !self.notes.is_empty() {
            writer.metadata.insert("notes", &self.notes);
        }
        if let Ok(host) = hostname::get() {
            writer
                .metadata
                .insert("host", host.to_string_lossy().into_owned());
        }
        if let Some(source_file) = &self.config.source_file {
            writer.metadata.insert("source_file", source_file);
        }

        let mut instruments: Vec<String> = Vec::new();
        for instrument in self.distinct_instruments() {
            instruments.push(instrument.name().to_string());
        }
        for trace in &self.traces {
            let instrument = trace.instrument_name().to_string();
            if !instruments.contains(&instrument) {
                instruments.push(instrument);
            }
        }
        writer.metadata.insert("instruments", instruments);
    }

    /// Snapshot instrument provenance through the capability interfaces,
    /// once per run, before any row is written.
    async fn assemble_provenance(&self, writer: &mut RunWriter) -> Result<()> {
        let mut provenance = Map::new();
        for instrument in self.distinct_instruments() {
            let mut block = Map::new();
            if let Some(calibration) = instrument.calibration_snapshot().await? {
                block.insert("calibration".to_string(), serde_json::to_value(calibration)?);
            }
            if let Some(source) = instrument.source_snapshot().await? {
                block.insert("source".to_string(), serde_json::to_value(source)?);
            }
            if !block.is_empty() {
                provenance.insert(instrument.name().to_string(), Value::Object(block));
            }
        }
        if !provenance.is_empty() {
            writer.metadata.insert("provenance", Value::Object(provenance));
        }
        Ok(())
    }

    /// Mark the transition into the running state: the interruption flag
    /// starts false and the start timestamps are pinned.
    fn begin_running(writer: &mut RunWriter) {
        writer.metadata.set_interrupted(false);
        writer.metadata.insert("start_time", unix_time());
        writer.metadata.insert("start_time_utc", utc_now_string());
    }

    /// End-of-run metadata and the final snapshot image. Runs on normal
    /// completion and on interruption, not after a device error.
    async fn finalize(&mut self, writer: &mut RunWriter) -> Result<()> {
        let end = unix_time();
        writer.metadata.insert("end_time", end);
        writer.metadata.insert("end_time_utc", utc_now_string());
        if let Some(start) = writer.metadata.get("start_time").and_then(Value::as_f64) {
            writer.metadata.insert("elapsed", fmt_elapsed(end - start));
        }
        if let Some(image) = self.plotter.render_snapshot().await? {
            writer.add_blob("plot.png", &image)?;
        }
        Ok(())
    }

    /// Shared exit path: finalize on success/interrupt, always close the
    /// writer, then propagate any loop error.
    async fn conclude(
        &mut self,
        mut writer: RunWriter,
        guard: InterruptGuard,
        outcome: Result<()>,
    ) -> Result<RunResult> {
        let finalized = match &outcome {
            Ok(()) => self.finalize(&mut writer).await,
            // Device error: rows stay on disk, metadata stays incomplete.
            Err(_) => Ok(()),
        };
        drop(guard);
        let closed = writer.close();
        outcome?;
        finalized?;
        closed?;

        if let Some(elapsed) = writer.metadata.get("elapsed").and_then(Value::as_str) {
            log::info!("Completed in {elapsed}");
        }
        log::info!("Data saved in {}", writer.datapath().display());

        Ok(RunResult {
            basedir: self.config.data_dir.clone(),
            id: writer.id(),
            metadata: writer.metadata.clone(),
            datapath: writer.datapath().to_path_buf(),
        })
    }

    fn open_writer(&self) -> Result<RunWriter> {
        let writer = RunWriter::open(&self.config.data_dir, self.config.fsync_every)?;
        log::info!("Starting run with ID {}", writer.id());
        Ok(writer)
    }

    // =========================================================================
    // 0D
    // =========================================================================

    /// Take a single sample: one row holding the time and one reading of
    /// every followed parameter.
    pub async fn measure(&mut self) -> Result<RunResult> {
        self.require_no_traces("0D")?;
        let mut writer = self.open_writer()?;
        let guard = InterruptGuard::install(self.interrupt.clone());
        let outcome = self.measure_run(&mut writer).await;
        self.conclude(writer, guard, outcome).await
    }

    async fn measure_run(&mut self, writer: &mut RunWriter) -> Result<()> {
        self.assemble_common(writer);
        writer.metadata.insert("type", "0D");
        let mut columns = vec!["time".to_string()];
        columns.extend(self.param_columns());
        writer.set_columns(&columns);
        self.assemble_provenance(writer).await?;
        Self::begin_running(writer);
        self.plotter.set_columns(&columns).await?;

        let mut row = vec![unix_time()];
        row.extend(self.read_all().await?);
        writer.add_row(&row)?;
        self.plotter.add_row(&row).await?;
        Ok(())
    }

    // =========================================================================
    // 1D
    // =========================================================================

    /// Measure repeatedly over time with a fixed inter-point delay, until
    /// interrupted or until `max_duration` elapses on a monotonic clock.
    pub async fn watch(
        &mut self,
        delay: Duration,
        max_duration: Option<Duration>,
    ) -> Result<RunResult> {
        self.require_no_traces("1D")?;
        let mut writer = self.open_writer()?;
        let guard = InterruptGuard::install(self.interrupt.clone());
        let outcome = self.watch_run(&mut writer, delay, max_duration).await;
        self.conclude(writer, guard, outcome).await
    }

    async fn watch_run(
        &mut self,
        writer: &mut RunWriter,
        delay: Duration,
        max_duration: Option<Duration>,
    ) -> Result<()> {
        self.assemble_common(writer);
        writer.metadata.insert("type", "1D");
        writer.metadata.insert("delay_s", delay.as_secs_f64());
        writer
            .metadata
            .insert("max_duration_s", max_duration.map(|d| d.as_secs_f64()));
        let mut columns = vec!["time".to_string()];
        columns.extend(self.param_columns());
        writer.set_columns(&columns);
        self.assemble_provenance(writer).await?;
        Self::begin_running(writer);
        self.plotter.set_columns(&columns).await?;

        // Monotonic, so the bound is immune to wall-clock adjustments.
        let t_start = Instant::now();
        loop {
            if let Some(max) = max_duration {
                if t_start.elapsed() >= max {
                    break;
                }
            }
            sleep(delay).await;
            let mut row = vec![unix_time()];
            row.extend(self.read_all().await?);
            writer.add_row(&row)?;
            self.plotter.add_row(&row).await?;
            if self.interrupt.is_set() {
                writer.metadata.set_interrupted(true);
                break;
            }
        }
        Ok(())
    }

    /// Sweep `param` over `setpoints`: write each setpoint, wait `delay`,
    /// read every followed parameter, and record one row per setpoint.
    pub async fn sweep(
        &mut self,
        param: Arc<dyn SweepParameter>,
        setpoints: &[f64],
        delay: Duration,
    ) -> Result<RunResult> {
        self.require_no_traces("1D")?;
        Self::require_writable(&param)?;
        let mut writer = self.open_writer()?;
        log::info!(
            "Minimum duration {}",
            fmt_elapsed(setpoints.len() as f64 * delay.as_secs_f64())
        );
        let guard = InterruptGuard::install(self.interrupt.clone());
        let outcome = self.sweep_run(&mut writer, &param, setpoints, delay).await;
        self.conclude(writer, guard, outcome).await
    }

    async fn sweep_run(
        &mut self,
        writer: &mut RunWriter,
        param: &Arc<dyn SweepParameter>,
        setpoints: &[f64],
        delay: Duration,
    ) -> Result<()> {
        self.assemble_common(writer);
        writer.metadata.insert("type", "1D");
        writer.metadata.insert("delay_s", delay.as_secs_f64());
        writer.metadata.insert("param", param.full_name());
        writer.metadata.insert("setpoints", setpoints);
        let mut columns = vec!["time".to_string(), param.full_name().to_string()];
        columns.extend(self.param_columns());
        writer.set_columns(&columns);
        self.assemble_provenance(writer).await?;
        Self::begin_running(writer);
        self.plotter.set_columns(&columns).await?;

        for &setpoint in setpoints {
            param.write(setpoint).await?;
            sleep(delay).await;
            let mut row = vec![unix_time(), setpoint];
            row.extend(self.read_all().await?);
            writer.add_row(&row)?;
            self.plotter.add_row(&row).await?;
            if self.interrupt.is_set() {
                writer.metadata.set_interrupted(true);
                break;
            }
        }
        Ok(())
    }

    // =========================================================================
    // 2D
    // =========================================================================

    /// Nested sweep over a slow and a fast axis. The plotter starts a new
    /// line at every fast-axis restart, so the data renders as a stack of
    /// 1-D traces.
    #[allow(clippy::too_many_arguments)]
    pub async fn megasweep(
        &mut self,
        slow: Arc<dyn SweepParameter>,
        slow_setpoints: &[f64],
        fast: Arc<dyn SweepParameter>,
        fast_setpoints: &[f64],
        slow_delay: Duration,
        fast_delay: Duration,
    ) -> Result<RunResult> {
        self.require_no_traces("2D")?;
        Self::require_writable(&slow)?;
        Self::require_writable(&fast)?;
        let mut writer = self.open_writer()?;
        let min_duration = slow_setpoints.len() as f64
            * (slow_delay.as_secs_f64() + fast_setpoints.len() as f64 * fast_delay.as_secs_f64());
        log::info!("Minimum duration {}", fmt_elapsed(min_duration));
        let guard = InterruptGuard::install(self.interrupt.clone());
        let outcome = self
            .megasweep_run(
                &mut writer,
                &slow,
                slow_setpoints,
                &fast,
                fast_setpoints,
                slow_delay,
                fast_delay,
            )
            .await;
        self.conclude(writer, guard, outcome).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn megasweep_run(
        &mut self,
        writer: &mut RunWriter,
        slow: &Arc<dyn SweepParameter>,
        slow_setpoints: &[f64],
        fast: &Arc<dyn SweepParameter>,
        fast_setpoints: &[f64],
        slow_delay: Duration,
        fast_delay: Duration,
    ) -> Result<()> {
        self.assemble_common(writer);
        writer.metadata.insert("type", "2D");
        writer
            .metadata
            .insert("slow_delay_s", slow_delay.as_secs_f64());
        writer
            .metadata
            .insert("fast_delay_s", fast_delay.as_secs_f64());
        writer.metadata.insert("slow_param", slow.full_name());
        writer.metadata.insert("fast_param", fast.full_name());
        writer.metadata.insert("slow_setpoints", slow_setpoints);
        writer.metadata.insert("fast_setpoints", fast_setpoints);
        let mut columns = vec![
            "time".to_string(),
            slow.full_name().to_string(),
            fast.full_name().to_string(),
        ];
        columns.extend(self.param_columns());
        writer.set_columns(&columns);
        self.assemble_provenance(writer).await?;
        Self::begin_running(writer);
        self.plotter.set_columns(&columns).await?;

        'slow: for &outer in slow_setpoints {
            slow.write(outer).await?;
            sleep(slow_delay).await;
            for (j, &inner) in fast_setpoints.iter().enumerate() {
                fast.write(inner).await?;
                sleep(fast_delay).await;
                let mut row = vec![unix_time(), outer, inner];
                row.extend(self.read_all().await?);
                writer.add_row(&row)?;
                if j == 0 {
                    self.plotter.add_row_new_line(&row).await?;
                } else {
                    self.plotter.add_row(&row).await?;
                }
                if self.interrupt.is_set() {
                    writer.metadata.set_interrupted(true);
                    break 'slow;
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Frequency-trace sweeps
    // =========================================================================

    /// Read every followed trace over the frequency grid reported by the
    /// instrument, one row per frequency point. `delay` is waited between
    /// trace reads.
    pub async fn sweep_traces(&mut self, delay: Duration) -> Result<RunResult> {
        if self.traces.is_empty() {
            return Err(StationError::NoTracesRegistered.into());
        }
        let mut writer = self.open_writer()?;
        log::info!(
            "Minimum duration {}",
            // Allows one second of instrument sweep time per trace.
            fmt_elapsed(self.traces.len() as f64 * (1.0 + delay.as_secs_f64()))
        );
        let guard = InterruptGuard::install(self.interrupt.clone());
        let outcome = self.sweep_traces_run(&mut writer, delay).await;
        self.conclude(writer, guard, outcome).await
    }

    /// Record the trace-topology metadata shared by both variants.
    fn assemble_trace_metadata(&self, writer: &mut RunWriter, frequencies: &[f64]) {
        let mut trace_info = Map::new();
        for trace in &self.traces {
            trace_info.insert(
                trace.trace_name().to_string(),
                Value::String(trace.quantity().to_string()),
            );
        }
        writer.metadata.insert("traces", Value::Object(trace_info));
        writer.metadata.insert("frequency_setpoints", frequencies);
    }

    /// Read every followed trace once, verifying each against the grid
    /// length. `delay` is waited after each trace read when non-zero.
    async fn read_traces(
        &self,
        grid_len: usize,
        delay: Duration,
    ) -> Result<Vec<Vec<[f64; 3]>>> {
        let mut all = Vec::with_capacity(self.traces.len());
        for trace in &self.traces {
            let points = trace.read_points().await?;
            if points.len() != grid_len {
                return Err(StationError::Instrument(format!(
                    "trace '{}' returned {} points for a {}-point frequency grid",
                    trace.qualified_name(),
                    points.len(),
                    grid_len
                ))
                .into());
            }
            all.push(points);
            if !delay.is_zero() {
                sleep(delay).await;
            }
        }
        Ok(all)
    }

    async fn sweep_traces_run(&mut self, writer: &mut RunWriter, delay: Duration) -> Result<()> {
        let frequencies = self.traces[0].frequency_setpoints().await?;

        self.assemble_common(writer);
        writer.metadata.insert("type", "1D_traces");
        writer.metadata.insert("delay_s", delay.as_secs_f64());
        self.assemble_trace_metadata(writer, &frequencies);
        let mut columns = vec!["time".to_string(), "frequency".to_string()];
        columns.extend(self.param_columns());
        columns.extend(self.trace_columns());
        writer.set_columns(&columns);
        self.assemble_provenance(writer).await?;
        Self::begin_running(writer);
        self.plotter.set_columns(&columns).await?;

        let traces = self.read_traces(frequencies.len(), delay).await?;

        for (j, &frequency) in frequencies.iter().enumerate() {
            let mut row = vec![unix_time(), frequency];
            row.extend(self.read_all().await?);
            for points in &traces {
                row.extend_from_slice(&points[j]);
            }
            writer.add_row(&row)?;
            self.plotter.add_row(&row).await?;
            if self.interrupt.is_set() {
                writer.metadata.set_interrupted(true);
                break;
            }
        }
        Ok(())
    }

    /// For each slow setpoint, re-read every followed trace over the
    /// instrument's frequency grid. Parameters are read once per slow
    /// setpoint; there is no per-frequency delay, the instrument's own
    /// sweep time bounds the inner pass.
    pub async fn megasweep_traces(
        &mut self,
        slow: Arc<dyn SweepParameter>,
        slow_setpoints: &[f64],
        slow_delay: Duration,
    ) -> Result<RunResult> {
        if self.traces.is_empty() {
            return Err(StationError::NoTracesRegistered.into());
        }
        Self::require_writable(&slow)?;
        let mut writer = self.open_writer()?;
        log::info!(
            "Minimum duration {}",
            fmt_elapsed(slow_setpoints.len() as f64 * slow_delay.as_secs_f64())
        );
        let guard = InterruptGuard::install(self.interrupt.clone());
        let outcome = self
            .megasweep_traces_run(&mut writer, &slow, slow_setpoints, slow_delay)
            .await;
        self.conclude(writer, guard, outcome).await
    }

    async fn megasweep_traces_run(
        &mut self,
        writer: &mut RunWriter,
        slow: &Arc<dyn SweepParameter>,
        slow_setpoints: &[f64],
        slow_delay: Duration,
    ) -> Result<()> {
        let frequencies = self.traces[0].frequency_setpoints().await?;

        self.assemble_common(writer);
        writer.metadata.insert("type", "2D_traces");
        writer
            .metadata
            .insert("slow_delay_s", slow_delay.as_secs_f64());
        writer.metadata.insert("slow_param", slow.full_name());
        writer.metadata.insert("fast_param", "frequency");
        writer.metadata.insert("slow_setpoints", slow_setpoints);
        self.assemble_trace_metadata(writer, &frequencies);
        let mut columns = vec![
            "time".to_string(),
            slow.full_name().to_string(),
            "frequency".to_string(),
        ];
        columns.extend(self.param_columns());
        columns.extend(self.trace_columns());
        writer.set_columns(&columns);
        self.assemble_provenance(writer).await?;
        Self::begin_running(writer);
        self.plotter.set_columns(&columns).await?;

        'slow: for &outer in slow_setpoints {
            slow.write(outer).await?;
            sleep(slow_delay).await;

            // One parameter reading per slow setpoint, repeated across
            // that setpoint's rows.
            let measurements = self.read_all().await?;
            let traces = self.read_traces(frequencies.len(), Duration::ZERO).await?;

            for (j, &frequency) in frequencies.iter().enumerate() {
                let mut row = vec![unix_time(), outer, frequency];
                row.extend_from_slice(&measurements);
                for points in &traces {
                    row.extend_from_slice(&points[j]);
                }
                writer.add_row(&row)?;
                if j == 0 {
                    self.plotter.add_row_new_line(&row).await?;
                } else {
                    self.plotter.add_row(&row).await?;
                }
                if self.interrupt.is_set() {
                    writer.metadata.set_interrupted(true);
                    break 'slow;
                }
            }
        }
        Ok(())
    }
}
