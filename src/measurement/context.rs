//! Execution context handed to a running measurement.
//!
//! The context owns the measurement's runtime data and is the measurement's only way
//! to talk to the outside: progress, messages, readings and instrument state go out as
//! events; the abort flag comes in.

use std::time::Duration;

use indexmap::IndexMap;
use serde_json::Value;
use tokio::time::{sleep, Instant};
use tracing::info;

use crate::abort::AbortHandle;
use crate::error::MeasurementResult;
use crate::events::{EventSender, ExecutorEvent};
use crate::hardware::{EnvironmentReading, Instruments};
use crate::measurement::data::MeasurementData;
use crate::sequence::{NodePath, SeriesPoints};

/// Runtime context of one measurement run.
#[derive(Debug)]
pub struct MeasurementContext {
    /// Data collected by the run
    pub data: MeasurementData,
    path: NodePath,
    events: EventSender,
    abort: AbortHandle,
    use_environ: bool,
    initial_meta: IndexMap<String, Value>,
    readings: IndexMap<String, SeriesPoints>,
}

impl MeasurementContext {
    /// Create a context for the node at `path`.
    pub fn new(path: NodePath, events: EventSender, abort: AbortHandle, use_environ: bool) -> Self {
        Self {
            data: MeasurementData::default(),
            path,
            events,
            abort,
            use_environ,
            initial_meta: IndexMap::new(),
            readings: IndexMap::new(),
        }
    }

    /// Meta data applied whenever the data is reset.
    pub fn with_initial_meta(mut self, meta: IndexMap<String, Value>) -> Self {
        self.initial_meta = meta;
        self
    }

    /// Clear data and apply the initial meta data.
    pub fn reset_data(&mut self) {
        self.data.clear();
        self.data.meta.extend(self.initial_meta.clone());
        self.readings.clear();
    }

    /// Address of the measurement node.
    pub fn path(&self) -> NodePath {
        self.path
    }

    /// False once an abort was requested.
    pub fn is_running(&self) -> bool {
        !self.abort.is_aborted()
    }

    /// True if environment sensors should be read.
    pub fn use_environ(&self) -> bool {
        self.use_environ
    }

    /// Report progress.
    pub fn progress(&self, value: usize, maximum: usize) {
        self.events.progress(value, maximum);
    }

    /// Report a status message.
    pub fn message(&self, text: impl Into<String>) {
        self.events.message(text);
    }

    /// Report a plotted point and keep it for the sequence tree.
    pub fn reading(&mut self, name: &str, x: f64, y: f64) {
        self.readings
            .entry(name.to_string())
            .or_default()
            .push((x, y));
        self.events.emit(ExecutorEvent::Reading {
            path: self.path,
            name: name.to_string(),
            x,
            y,
        });
    }

    /// Report a partial instrument status update.
    pub fn instrument_state<I, K>(&self, values: I)
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let update = values.into_iter().map(|(k, v)| (k.into(), v)).collect();
        self.events.emit(ExecutorEvent::InstrumentState(update));
    }

    /// Readings reported so far, by series name.
    pub fn readings(&self) -> &IndexMap<String, SeriesPoints> {
        &self.readings
    }

    /// Take the readings out of the context.
    pub fn take_readings(&mut self) -> IndexMap<String, SeriesPoints> {
        std::mem::take(&mut self.readings)
    }

    /// Read the environment box, or NaN values if monitoring is off.
    pub async fn read_environment(
        &self,
        instruments: &Instruments,
    ) -> MeasurementResult<EnvironmentReading> {
        if !self.use_environ {
            return Ok(EnvironmentReading::unavailable());
        }
        let reading = instruments.environ()?.read_environment().await?;
        info!("Box temperature: {:.2} degC", reading.box_temperature);
        info!("Chuck temperature: {:.2} degC", reading.chuck_temperature);
        info!("Box humidity: {:.2} %rH", reading.box_humidity);
        self.instrument_state([
            ("env_chuck_temperature", Value::from(reading.chuck_temperature)),
            ("env_box_temperature", Value::from(reading.box_temperature)),
            ("env_box_humidity", Value::from(reading.box_humidity)),
        ]);
        Ok(reading)
    }

    /// Sleep for `duration`, reporting progress every `interval`. Returns early on abort.
    pub async fn wait(&self, duration: Duration, interval: Duration) {
        if duration.is_zero() {
            return;
        }
        let interval = interval.max(Duration::from_millis(1));
        let start = Instant::now();
        let total = duration.as_secs().max(1) as usize;
        while self.is_running() {
            let elapsed = start.elapsed();
            if elapsed >= duration {
                break;
            }
            let remaining = duration - elapsed;
            self.message(format!("Waiting {}s...", remaining.as_secs()));
            self.progress(elapsed.as_secs() as usize, total);
            sleep(remaining.min(interval)).await;
        }
        self.message("");
        self.progress(total, total);
    }
}
