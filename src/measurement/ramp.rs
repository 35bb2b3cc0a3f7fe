//! Shared ramp parameters and stepping helpers for the IV and CV ramps.

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::{InstrumentResult, MeasurementError, MeasurementResult, ParameterError};
use crate::hardware::{
    Electrometer, FilterSettings, Instrument, RouteTerminal, SenseMode, SourceMeter,
};
use crate::measurement::context::MeasurementContext;
use crate::measurement::CompliancePolicy;
use crate::parameter::{ParameterSpec, ParameterStore};
use crate::utils::LinearRange;

/// Resolved ramp parameters. `prefix` selects the key family (`""` or `"bias_"`).
#[derive(Debug, Clone, PartialEq)]
pub struct RampParameters {
    /// First voltage of the measured ramp
    pub voltage_start: f64,
    /// Last voltage of the measured ramp
    pub voltage_stop: f64,
    /// Step of the measured ramp
    pub voltage_step: f64,
    /// Step of the ramp to the start voltage
    pub voltage_step_before: f64,
    /// Step of the ramp back to zero
    pub voltage_step_after: f64,
    /// Settle time after each measured step
    pub waiting_time: Duration,
    /// Settle time after each step towards the start voltage
    pub waiting_time_before: Duration,
    /// Settle time after each step back to zero
    pub waiting_time_after: Duration,
    /// Pause once the start voltage is reached
    pub waiting_time_start: Duration,
    /// Pause before ramping back to zero
    pub waiting_time_end: Duration,
}

impl RampParameters {
    /// Register the ramp parameters with `prefix` on the voltage keys.
    pub fn register(store: &mut ParameterStore, prefix: &str) -> Result<(), ParameterError> {
        for key in ["voltage_start", "voltage_stop", "voltage_step"] {
            store.register(ParameterSpec::new(format!("{prefix}{key}")).unit("V").required())?;
        }
        for key in ["voltage_step_before", "voltage_step_after"] {
            store.register(ParameterSpec::new(format!("{prefix}{key}")).default(0.0).unit("V"))?;
        }
        store.register(ParameterSpec::new("waiting_time").default("1 s").unit("s"))?;
        store.register(ParameterSpec::new("waiting_time_before").default("100 ms").unit("s"))?;
        store.register(ParameterSpec::new("waiting_time_after").default("100 ms").unit("s"))?;
        store.register(ParameterSpec::new("waiting_time_start").default("0 s").unit("s"))?;
        store.register(ParameterSpec::new("waiting_time_end").default("0 s").unit("s"))?;
        Ok(())
    }

    /// Resolve the values registered by [`RampParameters::register`].
    pub fn resolve(store: &ParameterStore, prefix: &str) -> Result<Self, ParameterError> {
        let volts = |key: &str| store.get_f64(&format!("{prefix}{key}"));
        let seconds = |key: &str| store.get_f64(key).map(seconds_to_duration);
        let voltage_step = volts("voltage_step")?.abs();
        let or_step = |value: f64| if value == 0.0 { voltage_step } else { value.abs() };
        Ok(Self {
            voltage_start: volts("voltage_start")?,
            voltage_stop: volts("voltage_stop")?,
            voltage_step,
            voltage_step_before: or_step(volts("voltage_step_before")?),
            voltage_step_after: or_step(volts("voltage_step_after")?),
            waiting_time: seconds("waiting_time")?,
            waiting_time_before: seconds("waiting_time_before")?,
            waiting_time_after: seconds("waiting_time_after")?,
            waiting_time_start: seconds("waiting_time_start")?,
            waiting_time_end: seconds("waiting_time_end")?,
        })
    }

    /// The measured ramp.
    pub fn ramp(&self) -> LinearRange {
        LinearRange::new(self.voltage_start, self.voltage_stop, self.voltage_step)
    }
}

/// Sense, route and filter settings of a source meter.
///
/// Registered under the role prefix (`hvsrc_sense_mode`, `vsrc_route_terminal`,
/// `hvsrc_filter_count`, ...) and programmed after the source was reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceSetup {
    /// Local or remote sensing
    pub sense_mode: SenseMode,
    /// Front or rear terminals
    pub route_terminal: RouteTerminal,
    /// Current reading filter
    pub filter: FilterSettings,
}

impl SourceSetup {
    /// Register the setup parameters for `role` (`"hvsrc"` or `"vsrc"`).
    pub fn register(store: &mut ParameterStore, role: &str) -> Result<(), ParameterError> {
        store.register(
            ParameterSpec::new(format!("{role}_sense_mode"))
                .default("local")
                .values(["local", "remote"]),
        )?;
        store.register(
            ParameterSpec::new(format!("{role}_route_terminal"))
                .default("rear")
                .values(["front", "rear"]),
        )?;
        register_filter(store, role)
    }

    /// Resolve the values registered by [`SourceSetup::register`].
    pub fn resolve(store: &ParameterStore, role: &str) -> Result<Self, ParameterError> {
        Ok(Self {
            sense_mode: resolve_choice(store, &format!("{role}_sense_mode"))?,
            route_terminal: resolve_choice(store, &format!("{role}_route_terminal"))?,
            filter: resolve_filter(store, role)?,
        })
    }

    /// Program terminals, sensing and filter.
    pub async fn apply(&self, source: &dyn SourceMeter) -> InstrumentResult<()> {
        info!(
            instrument = source.name(),
            route_terminal = ?self.route_terminal,
            sense_mode = ?self.sense_mode,
            filter_enable = self.filter.enabled,
            filter_count = self.filter.count,
            filter_type = ?self.filter.kind,
            "Source setup"
        );
        source.set_route_terminal(self.route_terminal).await?;
        source.set_sense_mode(self.sense_mode).await?;
        source.set_filter(self.filter).await
    }
}

/// Register `{role}_filter_enable`, `{role}_filter_count` and `{role}_filter_type`.
pub fn register_filter(store: &mut ParameterStore, role: &str) -> Result<(), ParameterError> {
    store.register(ParameterSpec::new(format!("{role}_filter_enable")).default(false))?;
    store.register(ParameterSpec::new(format!("{role}_filter_count")).default(10))?;
    store.register(
        ParameterSpec::new(format!("{role}_filter_type"))
            .default("repeat")
            .values(["repeat", "moving"]),
    )?;
    Ok(())
}

/// Resolve the filter registered by [`register_filter`]. The count must be 1 to 100.
pub fn resolve_filter(store: &ParameterStore, role: &str) -> Result<FilterSettings, ParameterError> {
    let count_key = format!("{role}_filter_count");
    let count = store.get_i64(&count_key)?;
    let count = u32::try_from(count)
        .ok()
        .filter(|count| (1..=100).contains(count))
        .ok_or_else(|| ParameterError::InvalidValue {
            key: count_key,
            value: count.to_string(),
            allowed: "1 to 100".to_string(),
        })?;
    Ok(FilterSettings {
        enabled: store.get_bool(&format!("{role}_filter_enable"))?,
        count,
        kind: resolve_choice(store, &format!("{role}_filter_type"))?,
    })
}

/// Resolve a string parameter into one of the capability enums.
pub fn resolve_choice<T: FromStr>(store: &ParameterStore, key: &str) -> Result<T, ParameterError> {
    let value = store.get_string(key)?;
    value.parse().map_err(|_| ParameterError::InvalidType {
        key: key.to_string(),
        expected: "enumeration value",
    })
}

/// Reset an electrometer and configure integration rate, filter and zero check.
///
/// Zero check is left enabled; release it once the source reached its start voltage.
pub async fn setup_electrometer(
    elm: &dyn Electrometer,
    nplc: f64,
    filter: FilterSettings,
    zero_correction: bool,
) -> MeasurementResult<()> {
    elm.reset().await?;
    elm.set_filter(filter).await?;
    elm.set_integration_rate(nplc).await?;
    elm.set_zero_check(true).await?;
    if zero_correction {
        elm.zero_correct().await?;
    }
    Ok(())
}

/// Negative and non-finite values become zero.
pub fn seconds_to_duration(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds).unwrap_or(Duration::ZERO)
}

/// X value for plots: falling ramps are drawn with absolute voltages.
pub fn plot_voltage(ramp: &LinearRange, voltage: f64) -> f64 {
    if ramp.step() < 0.0 {
        voltage.abs()
    } else {
        voltage
    }
}

/// Step a level from `begin` to `end`, settling `waiting_time` after each step.
///
/// Used for the ramps to the start voltage and back to zero; these always complete,
/// an abort request does not leave a source half way.
pub async fn ramp_to<F, Fut>(
    begin: f64,
    end: f64,
    step: f64,
    waiting_time: Duration,
    mut apply: F,
) -> MeasurementResult<()>
where
    F: FnMut(f64) -> Fut,
    Fut: Future<Output = InstrumentResult<()>>,
{
    for voltage in LinearRange::new(begin, end, step) {
        apply(voltage).await?;
        sleep(waiting_time).await;
    }
    Ok(())
}

/// Check a source for a compliance trip.
///
/// Returns `Ok(true)` if the ramp should stop gracefully.
pub async fn check_compliance(
    source: &dyn SourceMeter,
    policy: CompliancePolicy,
) -> MeasurementResult<bool> {
    if !source.compliance_tripped().await? {
        return Ok(false);
    }
    match policy {
        CompliancePolicy::Accept => {
            warn!(instrument = source.name(), "Compliance tripped, stopping ramp.");
            Ok(true)
        }
        CompliancePolicy::Fail => Err(MeasurementError::Compliance(source.name().to_string())),
    }
}

/// Ramp a source from its programmed level to zero and switch the output off.
pub async fn ramp_source_to_zero(
    ctx: &MeasurementContext,
    source: &dyn SourceMeter,
    step: f64,
    waiting_time: Duration,
) -> MeasurementResult<()> {
    let voltage = source.voltage_level().await?;
    ctx.message(format!("Ramping {} to zero...", source.name()));
    ramp_to(voltage, 0.0, step, waiting_time, |v| source.set_voltage_level(v)).await?;
    source.set_output_enabled(false).await?;
    ctx.message("");
    Ok(())
}

/// Current time as seconds since the Unix epoch.
pub fn timestamp() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Register the series of `layout` with their units.
pub fn register_series_layout(ctx: &mut MeasurementContext, layout: &[(&str, &str)]) {
    for (key, unit) in layout {
        ctx.data.register_series(*key);
        ctx.data.set_series_unit(*key, *unit);
    }
}

/// Switch a source on and bring it to the start voltage of the ramp.
pub async fn ramp_source_to_start(
    ctx: &MeasurementContext,
    source: &dyn SourceMeter,
    ramp: &RampParameters,
    compliance: f64,
) -> MeasurementResult<()> {
    source.set_current_compliance(compliance).await?;
    source.set_output_enabled(true).await?;
    let voltage = source.voltage_level().await?;
    ctx.message("Ramp to start...");
    ramp_to(
        voltage,
        ramp.voltage_start,
        ramp.voltage_step_before,
        ramp.waiting_time_before,
        |v| source.set_voltage_level(v),
    )
    .await?;
    check_compliance(source, CompliancePolicy::Fail).await?;
    ctx.wait(ramp.waiting_time_start, Duration::from_secs(1))
        .await;
    Ok(())
}
