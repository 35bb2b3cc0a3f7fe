//! Instrument capabilities of a PQC station.
//!
//! Each physical instrument is consumed through a small capability trait describing its
//! semantic operations (set a voltage, read a current, open matrix channels). Wire
//! protocols stay behind these traits.
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Takes `&self`; drivers keep state behind interior mutability
//! - Returns [`InstrumentResult`] so transport timeouts can be told apart from
//!   device errors
//!
//! # Example
//!
//! ```rust,ignore
//! async fn ramp_to_zero(source: &dyn SourceMeter, step: f64) -> InstrumentResult<()> {
//!     let level = source.voltage_level().await?;
//!     for voltage in LinearRange::new(level, 0.0, step) {
//!         source.set_voltage_level(voltage).await?;
//!     }
//!     source.set_output_enabled(false).await
//! }
//! ```

use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::InstrumentResult;
use crate::sequence::Position;

/// Operations shared by every instrument.
#[async_trait]
pub trait Instrument: Send + Sync {
    /// Short resource name used in logs and errors (e.g. `"hvsrc"`).
    fn name(&self) -> &str;

    /// Identification string (`*IDN?`).
    async fn identify(&self) -> InstrumentResult<String>;

    /// Reset to power-on defaults.
    async fn reset(&self) -> InstrumentResult<()>;
}

/// Voltage sense wiring of a source meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenseMode {
    /// Two-wire sensing at the output terminals
    #[default]
    Local,
    /// Four-wire sensing at the device
    Remote,
}

/// Output terminals of a source meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteTerminal {
    /// Front panel terminals
    Front,
    /// Rear panel terminals
    #[default]
    Rear,
}

/// Averaging mode of a reading filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterType {
    /// Take `count` fresh samples per reading
    #[default]
    Repeat,
    /// Sliding window over the last `count` samples
    Moving,
}

impl FromStr for SenseMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            other => Err(format!("Invalid sense mode '{other}'. Must be one of: local, remote")),
        }
    }
}

impl FromStr for RouteTerminal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "front" => Ok(Self::Front),
            "rear" => Ok(Self::Rear),
            other => Err(format!("Invalid route terminal '{other}'. Must be one of: front, rear")),
        }
    }
}

impl FromStr for FilterType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "repeat" => Ok(Self::Repeat),
            "moving" => Ok(Self::Moving),
            other => Err(format!("Invalid filter type '{other}'. Must be one of: repeat, moving")),
        }
    }
}

/// Measurement integration time of an LCR meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationTime {
    /// Fastest, noisiest
    Short,
    /// Default aperture
    #[default]
    Medium,
    /// Slowest, most accurate
    Long,
}

impl FromStr for IntegrationTime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "short" => Ok(Self::Short),
            "medium" => Ok(Self::Medium),
            "long" => Ok(Self::Long),
            other => Err(format!(
                "Invalid integration time '{other}'. Must be one of: short, medium, long"
            )),
        }
    }
}

/// Reading filter settings shared by source meters and electrometers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSettings {
    /// Filter active
    pub enabled: bool,
    /// Samples averaged per reading
    pub count: u32,
    /// Averaging mode
    pub kind: FilterType,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            count: 10,
            kind: FilterType::Repeat,
        }
    }
}

/// Capability: voltage source with current measurement (HV source, V source).
///
/// # Contract
/// - `set_voltage_level` changes the level immediately; ramping is the caller's job
/// - `compliance_tripped` reports whether the current limit clamped the output
#[async_trait]
pub trait SourceMeter: Instrument {
    /// Programmed source voltage in volts.
    async fn voltage_level(&self) -> InstrumentResult<f64>;

    /// Program the source voltage.
    async fn set_voltage_level(&self, voltage: f64) -> InstrumentResult<()>;

    /// Output relay state.
    async fn output_enabled(&self) -> InstrumentResult<bool>;

    /// Switch the output relay.
    async fn set_output_enabled(&self, enabled: bool) -> InstrumentResult<()>;

    /// Set the current compliance limit in amperes.
    async fn set_current_compliance(&self, current: f64) -> InstrumentResult<()>;

    /// True if the compliance limit is active.
    async fn compliance_tripped(&self) -> InstrumentResult<bool>;

    /// Measure the current in amperes.
    async fn read_current(&self) -> InstrumentResult<f64>;

    /// Select local or remote voltage sensing.
    async fn set_sense_mode(&self, mode: SenseMode) -> InstrumentResult<()>;

    /// Select the front or rear output terminals.
    async fn set_route_terminal(&self, terminal: RouteTerminal) -> InstrumentResult<()>;

    /// Configure the current reading filter.
    async fn set_filter(&self, filter: FilterSettings) -> InstrumentResult<()>;
}

/// Capability: electrometer for low-current readings.
#[async_trait]
pub trait Electrometer: Instrument {
    /// Enable or disable zero check.
    async fn set_zero_check(&self, enabled: bool) -> InstrumentResult<()>;

    /// Run zero correction.
    async fn zero_correct(&self) -> InstrumentResult<()>;

    /// Set integration rate in power-line cycles.
    async fn set_integration_rate(&self, nplc: f64) -> InstrumentResult<()>;

    /// Configure the current reading filter.
    async fn set_filter(&self, filter: FilterSettings) -> InstrumentResult<()>;

    /// Measure the current in amperes.
    async fn read_current(&self) -> InstrumentResult<f64>;
}

/// Capability: LCR meter with internal bias source.
#[async_trait]
pub trait LcrMeter: Instrument {
    /// Set the AC amplitude in volts.
    async fn set_amplitude(&self, voltage: f64) -> InstrumentResult<()>;

    /// Set the AC frequency in hertz.
    async fn set_frequency(&self, frequency: f64) -> InstrumentResult<()>;

    /// Set integration time and the number of readings averaged per result.
    async fn set_aperture(&self, time: IntegrationTime, averaging_rate: u32) -> InstrumentResult<()>;

    /// Programmed bias voltage.
    async fn bias_voltage_level(&self) -> InstrumentResult<f64>;

    /// Program the bias voltage.
    async fn set_bias_voltage_level(&self, voltage: f64) -> InstrumentResult<()>;

    /// Bias output state.
    async fn bias_enabled(&self) -> InstrumentResult<bool>;

    /// Switch the bias output.
    async fn set_bias_enabled(&self, enabled: bool) -> InstrumentResult<()>;

    /// Measure the bias current in amperes.
    async fn read_bias_current(&self) -> InstrumentResult<f64>;

    /// Primary and secondary reading (Cp, Rp).
    async fn read_impedance(&self) -> InstrumentResult<(f64, f64)>;
}

/// Capability: switching matrix.
#[async_trait]
pub trait SwitchMatrix: Instrument {
    /// Names of all closed channels.
    async fn closed_channels(&self) -> InstrumentResult<Vec<String>>;

    /// Close the given channels.
    async fn close_channels(&self, channels: &[String]) -> InstrumentResult<()>;

    /// Open every channel.
    async fn open_all_channels(&self) -> InstrumentResult<()>;
}

/// Environment sensor values. NaN when not measured.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentReading {
    /// Box temperature in degC
    pub box_temperature: f64,
    /// Chuck temperature in degC
    pub chuck_temperature: f64,
    /// Relative box humidity in %
    pub box_humidity: f64,
}

impl EnvironmentReading {
    /// Reading used when environment monitoring is off.
    pub const fn unavailable() -> Self {
        Self {
            box_temperature: f64::NAN,
            chuck_temperature: f64::NAN,
            box_humidity: f64::NAN,
        }
    }
}

impl Default for EnvironmentReading {
    fn default() -> Self {
        Self::unavailable()
    }
}

/// Capability: environment box with sensors and relays.
#[async_trait]
pub trait EnvironmentBox: Instrument {
    /// Switch the test LED.
    async fn set_test_led(&self, enabled: bool) -> InstrumentResult<()>;

    /// Discharge the decoupling box.
    async fn discharge(&self) -> InstrumentResult<()>;

    /// Read temperatures and humidity.
    async fn read_environment(&self) -> InstrumentResult<EnvironmentReading>;
}

/// Completion signal of a table move. Resolves with the reached position.
pub type MoveCompletion = oneshot::Receiver<InstrumentResult<Position>>;

/// Capability: motorized wafer table.
///
/// # Contract
/// - `absolute_move` only starts the motion; the returned receiver fires once the
///   controller reports completion
/// - A dropped sender counts as a failed move
#[async_trait]
pub trait TableController: Send + Sync {
    /// True if the table worker is running.
    async fn is_running(&self) -> bool;

    /// True if table control is enabled for this station.
    async fn is_enabled(&self) -> bool;

    /// Start an absolute move.
    async fn absolute_move(&self, position: Position) -> InstrumentResult<MoveCompletion>;

    /// Current position as reported by the controller.
    async fn position(&self) -> InstrumentResult<Position>;

    /// True if the table is calibrated.
    async fn caldone(&self) -> InstrumentResult<bool>;
}
