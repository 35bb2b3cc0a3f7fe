//! Mock Hardware Implementations
//!
//! Simulated station instruments for testing without physical hardware.
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Mocks
//!
//! - `MockSourceMeter` - HV/V source with an ohmic load and a scriptable compliance limit
//! - `MockElectrometer` - Electrometer returning a fixed leakage current
//! - `MockLcrMeter` - LCR meter with a depletion-like capacitance curve
//! - `MockSwitchMatrix` - Switching matrix with optionally stuck channels
//! - `MockEnvironmentBox` - Environment box with fixed sensor readings
//! - `MockTable` - Wafer table with configurable move time, or one that never finishes
//!
//! Every mock can be told to fail its next calls with a given [`InstrumentError`] so the
//! executor's classification and recovery paths can be exercised.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{oneshot, RwLock};
use tokio::time::{sleep, Duration};

use crate::error::{InstrumentError, InstrumentResult};
use crate::hardware::capabilities::{
    Electrometer, EnvironmentBox, EnvironmentReading, FilterSettings, Instrument, IntegrationTime,
    LcrMeter,
    MoveCompletion, RouteTerminal, SenseMode, SourceMeter, SwitchMatrix, TableController,
};
use crate::sequence::Position;

// =============================================================================
// MockSourceMeter - Simulated HV / V Source
// =============================================================================

#[derive(Debug)]
struct SourceState {
    voltage: f64,
    output: bool,
    compliance: f64,
    sense_mode: SenseMode,
    route_terminal: RouteTerminal,
    filter: FilterSettings,
    history: Vec<f64>,
    failure: Option<InstrumentError>,
}

/// Mock source meter driving an ohmic load.
///
/// - `current = voltage / resistance`
/// - Compliance trips once `|current|` exceeds the programmed limit
/// - Every programmed level is recorded in `history()`
/// - Sense, route and filter settings are kept for inspection and cleared by `reset()`
///
/// # Example
///
/// ```rust,ignore
/// let hvsrc = MockSourceMeter::new("hvsrc");
/// hvsrc.set_output_enabled(true).await?;
/// hvsrc.set_voltage_level(-10.0).await?;
/// assert_eq!(hvsrc.history().await, vec![-10.0]);
/// ```
pub struct MockSourceMeter {
    name: String,
    resistance: f64,
    state: Arc<RwLock<SourceState>>,
}

impl MockSourceMeter {
    /// Source at 0 V with output off and a 1 GOhm load.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_resistance(name, 1e9)
    }

    /// Source with a custom load resistance in ohm.
    pub fn with_resistance(name: impl Into<String>, resistance: f64) -> Self {
        Self {
            name: name.into(),
            resistance,
            state: Arc::new(RwLock::new(SourceState {
                voltage: 0.0,
                output: false,
                compliance: f64::INFINITY,
                sense_mode: SenseMode::default(),
                route_terminal: RouteTerminal::default(),
                filter: FilterSettings::default(),
                history: Vec::new(),
                failure: None,
            })),
        }
    }

    /// Put the source into a biased state, as if left on by a previous run.
    pub async fn force_output(&self, voltage: f64) {
        let mut state = self.state.write().await;
        state.voltage = voltage;
        state.output = true;
    }

    /// Fail every subsequent call with `error` (or stop failing with `None`).
    pub async fn set_failure(&self, error: Option<InstrumentError>) {
        self.state.write().await.failure = error;
    }

    /// Voltages programmed so far.
    pub async fn history(&self) -> Vec<f64> {
        self.state.read().await.history.clone()
    }

    /// Programmed sense mode.
    pub async fn sense_mode(&self) -> SenseMode {
        self.state.read().await.sense_mode
    }

    /// Programmed output terminals.
    pub async fn route_terminal(&self) -> RouteTerminal {
        self.state.read().await.route_terminal
    }

    /// Programmed reading filter.
    pub async fn filter(&self) -> FilterSettings {
        self.state.read().await.filter
    }

    async fn check(&self) -> InstrumentResult<()> {
        match &self.state.read().await.failure {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Instrument for MockSourceMeter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn identify(&self) -> InstrumentResult<String> {
        self.check().await?;
        Ok(format!("Mock Source Meter, model 2410, {}", self.name))
    }

    async fn reset(&self) -> InstrumentResult<()> {
        self.check().await?;
        let mut state = self.state.write().await;
        state.voltage = 0.0;
        state.output = false;
        state.compliance = f64::INFINITY;
        state.sense_mode = SenseMode::default();
        state.route_terminal = RouteTerminal::default();
        state.filter = FilterSettings::default();
        Ok(())
    }
}

#[async_trait]
impl SourceMeter for MockSourceMeter {
    async fn voltage_level(&self) -> InstrumentResult<f64> {
        self.check().await?;
        Ok(self.state.read().await.voltage)
    }

    async fn set_voltage_level(&self, voltage: f64) -> InstrumentResult<()> {
        self.check().await?;
        let mut state = self.state.write().await;
        state.voltage = voltage;
        state.history.push(voltage);
        Ok(())
    }

    async fn output_enabled(&self) -> InstrumentResult<bool> {
        self.check().await?;
        Ok(self.state.read().await.output)
    }

    async fn set_output_enabled(&self, enabled: bool) -> InstrumentResult<()> {
        self.check().await?;
        self.state.write().await.output = enabled;
        Ok(())
    }

    async fn set_current_compliance(&self, current: f64) -> InstrumentResult<()> {
        self.check().await?;
        self.state.write().await.compliance = current.abs();
        Ok(())
    }

    async fn compliance_tripped(&self) -> InstrumentResult<bool> {
        self.check().await?;
        let state = self.state.read().await;
        Ok(state.output && (state.voltage / self.resistance).abs() > state.compliance)
    }

    async fn read_current(&self) -> InstrumentResult<f64> {
        self.check().await?;
        let state = self.state.read().await;
        if !state.output {
            return Ok(0.0);
        }
        let current = state.voltage / self.resistance;
        Ok(current.clamp(-state.compliance, state.compliance))
    }

    async fn set_sense_mode(&self, mode: SenseMode) -> InstrumentResult<()> {
        self.check().await?;
        self.state.write().await.sense_mode = mode;
        Ok(())
    }

    async fn set_route_terminal(&self, terminal: RouteTerminal) -> InstrumentResult<()> {
        self.check().await?;
        self.state.write().await.route_terminal = terminal;
        Ok(())
    }

    async fn set_filter(&self, filter: FilterSettings) -> InstrumentResult<()> {
        self.check().await?;
        self.state.write().await.filter = filter;
        Ok(())
    }
}

// =============================================================================
// MockElectrometer
// =============================================================================

#[derive(Debug)]
struct ElectrometerState {
    zero_check: bool,
    nplc: f64,
    filter: FilterSettings,
}

impl Default for ElectrometerState {
    fn default() -> Self {
        Self {
            zero_check: true,
            nplc: 1.0,
            filter: FilterSettings::default(),
        }
    }
}

/// Mock electrometer returning a fixed current while zero check is off.
pub struct MockElectrometer {
    name: String,
    current: f64,
    state: Arc<RwLock<ElectrometerState>>,
}

impl MockElectrometer {
    /// Electrometer reading `current` amperes.
    pub fn new(name: impl Into<String>, current: f64) -> Self {
        Self {
            name: name.into(),
            current,
            state: Arc::new(RwLock::new(ElectrometerState::default())),
        }
    }

    /// Current zero-check state.
    pub async fn zero_check(&self) -> bool {
        self.state.read().await.zero_check
    }

    /// Programmed integration rate in power-line cycles.
    pub async fn nplc(&self) -> f64 {
        self.state.read().await.nplc
    }

    /// Programmed reading filter.
    pub async fn filter(&self) -> FilterSettings {
        self.state.read().await.filter
    }
}

#[async_trait]
impl Instrument for MockElectrometer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn identify(&self) -> InstrumentResult<String> {
        Ok(format!("Mock Electrometer, model 6517B, {}", self.name))
    }

    async fn reset(&self) -> InstrumentResult<()> {
        *self.state.write().await = ElectrometerState::default();
        Ok(())
    }
}

#[async_trait]
impl Electrometer for MockElectrometer {
    async fn set_zero_check(&self, enabled: bool) -> InstrumentResult<()> {
        self.state.write().await.zero_check = enabled;
        Ok(())
    }

    async fn zero_correct(&self) -> InstrumentResult<()> {
        Ok(())
    }

    async fn set_integration_rate(&self, nplc: f64) -> InstrumentResult<()> {
        self.state.write().await.nplc = nplc;
        Ok(())
    }

    async fn set_filter(&self, filter: FilterSettings) -> InstrumentResult<()> {
        self.state.write().await.filter = filter;
        Ok(())
    }

    async fn read_current(&self) -> InstrumentResult<f64> {
        if self.state.read().await.zero_check {
            return Ok(0.0);
        }
        Ok(self.current)
    }
}

// =============================================================================
// MockLcrMeter
// =============================================================================

#[derive(Debug, Default)]
struct LcrState {
    bias: f64,
    bias_enabled: bool,
    frequency: f64,
    amplitude: f64,
    aperture: (IntegrationTime, u32),
}

/// Mock LCR meter; capacitance falls with `1 / sqrt(1 + |V| / 10 V)` from `c0`.
pub struct MockLcrMeter {
    name: String,
    c0: f64,
    state: Arc<RwLock<LcrState>>,
}

impl MockLcrMeter {
    /// LCR meter with zero-bias capacitance `c0` in farad.
    pub fn new(name: impl Into<String>, c0: f64) -> Self {
        Self {
            name: name.into(),
            c0,
            state: Arc::new(RwLock::new(LcrState::default())),
        }
    }

    /// Programmed frequency in hertz.
    pub async fn frequency(&self) -> f64 {
        self.state.read().await.frequency
    }

    /// Programmed integration time and averaging rate.
    pub async fn aperture(&self) -> (IntegrationTime, u32) {
        self.state.read().await.aperture
    }
}

#[async_trait]
impl Instrument for MockLcrMeter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn identify(&self) -> InstrumentResult<String> {
        Ok(format!("Mock LCR Meter, model E4980A, {}", self.name))
    }

    async fn reset(&self) -> InstrumentResult<()> {
        *self.state.write().await = LcrState::default();
        Ok(())
    }
}

#[async_trait]
impl LcrMeter for MockLcrMeter {
    async fn set_amplitude(&self, voltage: f64) -> InstrumentResult<()> {
        self.state.write().await.amplitude = voltage;
        Ok(())
    }

    async fn set_frequency(&self, frequency: f64) -> InstrumentResult<()> {
        self.state.write().await.frequency = frequency;
        Ok(())
    }

    async fn set_aperture(&self, time: IntegrationTime, averaging_rate: u32) -> InstrumentResult<()> {
        self.state.write().await.aperture = (time, averaging_rate);
        Ok(())
    }

    async fn bias_voltage_level(&self) -> InstrumentResult<f64> {
        Ok(self.state.read().await.bias)
    }

    async fn set_bias_voltage_level(&self, voltage: f64) -> InstrumentResult<()> {
        self.state.write().await.bias = voltage;
        Ok(())
    }

    async fn bias_enabled(&self) -> InstrumentResult<bool> {
        Ok(self.state.read().await.bias_enabled)
    }

    async fn set_bias_enabled(&self, enabled: bool) -> InstrumentResult<()> {
        self.state.write().await.bias_enabled = enabled;
        Ok(())
    }

    async fn read_bias_current(&self) -> InstrumentResult<f64> {
        Ok(0.0)
    }

    async fn read_impedance(&self) -> InstrumentResult<(f64, f64)> {
        let bias = self.state.read().await.bias;
        let capacitance = self.c0 / (1.0 + bias.abs() / 10.0).sqrt();
        Ok((capacitance, 1e6))
    }
}

// =============================================================================
// MockSwitchMatrix
// =============================================================================

#[derive(Debug, Default)]
struct MatrixState {
    closed: Vec<String>,
    stuck: Vec<String>,
    open_calls: usize,
}

/// Mock switching matrix. Stuck channels stay closed after `open_all_channels`.
pub struct MockSwitchMatrix {
    name: String,
    state: Arc<RwLock<MatrixState>>,
}

impl MockSwitchMatrix {
    /// Matrix with all channels open.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(RwLock::new(MatrixState::default())),
        }
    }

    /// Mark channels as stuck closed.
    pub async fn set_stuck(&self, channels: &[&str]) {
        let mut state = self.state.write().await;
        state.stuck = channels.iter().map(|c| c.to_string()).collect();
        for channel in &state.stuck.clone() {
            if !state.closed.contains(channel) {
                state.closed.push(channel.clone());
            }
        }
    }

    /// Number of `open_all_channels` calls.
    pub async fn open_calls(&self) -> usize {
        self.state.read().await.open_calls
    }
}

#[async_trait]
impl Instrument for MockSwitchMatrix {
    fn name(&self) -> &str {
        &self.name
    }

    async fn identify(&self) -> InstrumentResult<String> {
        Ok(format!("Mock Switching Matrix, model 707B, {}", self.name))
    }

    async fn reset(&self) -> InstrumentResult<()> {
        self.open_all_channels().await
    }
}

#[async_trait]
impl SwitchMatrix for MockSwitchMatrix {
    async fn closed_channels(&self) -> InstrumentResult<Vec<String>> {
        Ok(self.state.read().await.closed.clone())
    }

    async fn close_channels(&self, channels: &[String]) -> InstrumentResult<()> {
        let mut state = self.state.write().await;
        for channel in channels {
            if !state.closed.contains(channel) {
                state.closed.push(channel.clone());
            }
        }
        Ok(())
    }

    async fn open_all_channels(&self) -> InstrumentResult<()> {
        let mut state = self.state.write().await;
        state.open_calls += 1;
        let stuck = state.stuck.clone();
        state.closed.retain(|channel| stuck.contains(channel));
        Ok(())
    }
}

// =============================================================================
// MockEnvironmentBox
// =============================================================================

#[derive(Debug, Default)]
struct EnvironState {
    test_led: bool,
    discharges: usize,
    led_failure: Option<InstrumentError>,
}

/// Mock environment box with fixed sensor values.
pub struct MockEnvironmentBox {
    name: String,
    reading: EnvironmentReading,
    state: Arc<RwLock<EnvironState>>,
}

impl MockEnvironmentBox {
    /// Box reporting 22.5 degC box, 21.0 degC chuck, 35 % humidity.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reading: EnvironmentReading {
                box_temperature: 22.5,
                chuck_temperature: 21.0,
                box_humidity: 35.0,
            },
            state: Arc::new(RwLock::new(EnvironState::default())),
        }
    }

    /// Make test LED calls fail.
    pub async fn set_led_failure(&self, error: Option<InstrumentError>) {
        self.state.write().await.led_failure = error;
    }

    /// Current test LED state.
    pub async fn test_led(&self) -> bool {
        self.state.read().await.test_led
    }

    /// Number of discharges triggered.
    pub async fn discharges(&self) -> usize {
        self.state.read().await.discharges
    }
}

#[async_trait]
impl Instrument for MockEnvironmentBox {
    fn name(&self) -> &str {
        &self.name
    }

    async fn identify(&self) -> InstrumentResult<String> {
        Ok(format!("Mock Environment Box, {}", self.name))
    }

    async fn reset(&self) -> InstrumentResult<()> {
        Ok(())
    }
}

#[async_trait]
impl EnvironmentBox for MockEnvironmentBox {
    async fn set_test_led(&self, enabled: bool) -> InstrumentResult<()> {
        let mut state = self.state.write().await;
        if let Some(err) = &state.led_failure {
            return Err(err.clone());
        }
        state.test_led = enabled;
        Ok(())
    }

    async fn discharge(&self) -> InstrumentResult<()> {
        self.state.write().await.discharges += 1;
        Ok(())
    }

    async fn read_environment(&self) -> InstrumentResult<EnvironmentReading> {
        Ok(self.reading)
    }
}

// =============================================================================
// MockTable - Simulated Wafer Table
// =============================================================================

struct TableState {
    position: Position,
    moves: Vec<Position>,
    stalled: bool,
    pending: Vec<oneshot::Sender<InstrumentResult<Position>>>,
}

/// Mock wafer table.
///
/// Moves complete after `move_time`. A stalled table accepts moves but never signals
/// completion, which exercises the move timeout.
pub struct MockTable {
    running: bool,
    enabled: bool,
    move_time: Duration,
    state: Arc<RwLock<TableState>>,
}

impl MockTable {
    /// Running, enabled table at the origin completing moves after 10 ms.
    pub fn new() -> Self {
        Self {
            running: true,
            enabled: true,
            move_time: Duration::from_millis(10),
            state: Arc::new(RwLock::new(TableState {
                position: Position::new(0.0, 0.0, 0.0),
                moves: Vec::new(),
                stalled: false,
                pending: Vec::new(),
            })),
        }
    }

    /// Table that reports itself as not enabled.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new()
        }
    }

    /// Never complete moves.
    pub async fn stall(&self) {
        self.state.write().await.stalled = true;
    }

    /// Targets of all moves started so far.
    pub async fn moves(&self) -> Vec<Position> {
        self.state.read().await.moves.clone()
    }
}

impl Default for MockTable {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TableController for MockTable {
    async fn is_running(&self) -> bool {
        self.running
    }

    async fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn absolute_move(&self, position: Position) -> InstrumentResult<MoveCompletion> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.write().await;
        state.moves.push(position);
        if state.stalled {
            // Keep the sender alive so the receiver never resolves.
            state.pending.push(tx);
            return Ok(rx);
        }
        drop(state);

        let shared = Arc::clone(&self.state);
        let move_time = self.move_time;
        tokio::spawn(async move {
            sleep(move_time).await;
            shared.write().await.position = position;
            let _ = tx.send(Ok(position));
        });
        Ok(rx)
    }

    async fn position(&self) -> InstrumentResult<Position> {
        Ok(self.state.read().await.position)
    }

    async fn caldone(&self) -> InstrumentResult<bool> {
        Ok(true)
    }
}
