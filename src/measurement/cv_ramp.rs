//! CV ramp on the LCR meter's internal bias source.
//!
//! At each bias step the LCR meter reads parallel capacitance and resistance. With
//! `lcr_soft_filter` enabled, readings are repeated until the last two agree within
//! 0.5 % (sample standard deviation over mean), at most 64 times.
//!
//! [`LcrSetup`] and the filtered acquisition are shared with `cv_ramp_vsrc`.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::{InstrumentResult, MeasurementResult, ParameterError};
use crate::hardware::{Instrument, InstrumentRole, Instruments, IntegrationTime, LcrMeter};
use crate::measurement::context::MeasurementContext;
use crate::measurement::ramp::{
    plot_voltage, ramp_to, register_series_layout, resolve_choice, timestamp, RampParameters,
};
use crate::measurement::{analyze_series, register_common, Measurement};
use crate::parameter::{ParameterMap, ParameterSpec, ParameterStore};
use crate::units::format_metric;
use crate::utils::{std_mean_filter, Benchmark, Estimate};

const SOFT_FILTER_MAXIMUM: usize = 64;
const SOFT_FILTER_THRESHOLD: f64 = 0.005;
const SOFT_FILTER_SIZE: usize = 2;

/// CV ramp measurement.
#[derive(Debug)]
pub struct CvRamp {
    params: ParameterStore,
}

impl CvRamp {
    /// Registered type name.
    pub const TYPE: &'static str = "cv_ramp";

    /// Series recorded per step.
    pub const SERIES: [(&'static str, &'static str); 9] = [
        ("timestamp", "s"),
        ("voltage_lcr", "V"),
        ("current_lcr", "A"),
        ("capacitance", "F"),
        ("capacitance2", "1/F^2"),
        ("resistance", "Ohm"),
        ("temperature_box", "degC"),
        ("temperature_chuck", "degC"),
        ("humidity_box", "%"),
    ];

    /// Create with the parameters supplied by the sequence.
    pub fn new(parameters: ParameterMap) -> MeasurementResult<Self> {
        let mut params = ParameterStore::new(parameters);
        register_common(&mut params)?;
        RampParameters::register(&mut params, "bias_")?;
        LcrSetup::register(&mut params)?;
        Ok(Self { params })
    }
}

/// LCR meter settings of the CV ramps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LcrSetup {
    /// AC frequency in Hz
    pub frequency: f64,
    /// AC amplitude in V
    pub amplitude: f64,
    /// Measurement aperture
    pub integration_time: IntegrationTime,
    /// Readings averaged per result
    pub averaging_rate: u32,
    /// Repeat readings until they settle
    pub soft_filter: bool,
}

impl LcrSetup {
    /// Register the `lcr_*` parameters.
    pub fn register(store: &mut ParameterStore) -> Result<(), ParameterError> {
        store.register(ParameterSpec::new("lcr_frequency").default("1 kHz").unit("Hz"))?;
        store.register(ParameterSpec::new("lcr_amplitude").default("250 mV").unit("V"))?;
        store.register(
            ParameterSpec::new("lcr_integration_time")
                .default("medium")
                .values(["short", "medium", "long"]),
        )?;
        store.register(ParameterSpec::new("lcr_averaging_rate").default(1))?;
        store.register(ParameterSpec::new("lcr_soft_filter").default(true))?;
        Ok(())
    }

    /// Resolve the values registered by [`LcrSetup::register`].
    pub fn resolve(store: &ParameterStore) -> Result<Self, ParameterError> {
        let rate = store.get_i64("lcr_averaging_rate")?;
        let averaging_rate = u32::try_from(rate)
            .ok()
            .filter(|rate| (1..=256).contains(rate))
            .ok_or_else(|| ParameterError::InvalidValue {
                key: "lcr_averaging_rate".to_string(),
                value: rate.to_string(),
                allowed: "1 to 256".to_string(),
            })?;
        Ok(Self {
            frequency: store.get_f64("lcr_frequency")?,
            amplitude: store.get_f64("lcr_amplitude")?,
            integration_time: resolve_choice(store, "lcr_integration_time")?,
            averaging_rate,
            soft_filter: store.get_bool("lcr_soft_filter")?,
        })
    }

    /// Program frequency, amplitude and aperture.
    pub async fn apply(&self, lcr: &dyn LcrMeter) -> InstrumentResult<()> {
        lcr.set_frequency(self.frequency).await?;
        lcr.set_amplitude(self.amplitude).await?;
        lcr.set_aperture(self.integration_time, self.averaging_rate).await
    }

    /// One reading, filtered if `lcr_soft_filter` is set.
    pub async fn acquire(&self, lcr: &dyn LcrMeter) -> InstrumentResult<(f64, f64)> {
        if self.soft_filter {
            acquire_filtered(lcr).await
        } else {
            lcr.read_impedance().await
        }
    }
}

/// Read until the primary value settles, see module docs.
async fn acquire_filtered(lcr: &dyn LcrMeter) -> InstrumentResult<(f64, f64)> {
    let mut samples: Vec<f64> = Vec::with_capacity(SOFT_FILTER_SIZE + 1);
    let mut reading = (f64::NAN, f64::NAN);
    for _ in 0..SOFT_FILTER_MAXIMUM {
        reading = lcr.read_impedance().await?;
        samples.push(reading.0);
        if samples.len() > SOFT_FILTER_SIZE {
            samples.remove(0);
        }
        if samples.len() >= SOFT_FILTER_SIZE && std_mean_filter(&samples, SOFT_FILTER_THRESHOLD) {
            return Ok(reading);
        }
    }
    warn!("Maximum sample count reached: {SOFT_FILTER_MAXIMUM}");
    Ok(reading)
}

/// `1 / C^2`, zero for a vanishing capacitance.
pub fn inverse_square(capacitance: f64) -> f64 {
    if capacitance == 0.0 {
        0.0
    } else {
        1.0 / (capacitance * capacitance)
    }
}

async fn ramp_bias_to_zero(lcr: &dyn LcrMeter, step: f64, waiting_time: Duration) -> MeasurementResult<()> {
    let level = lcr.bias_voltage_level().await?;
    ramp_to(level, 0.0, step, waiting_time, |v| lcr.set_bias_voltage_level(v)).await?;
    lcr.set_bias_enabled(false).await?;
    Ok(())
}

#[async_trait]
impl Measurement for CvRamp {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn parameters(&self) -> &ParameterStore {
        &self.params
    }

    fn required_instruments(&self) -> Vec<InstrumentRole> {
        vec![InstrumentRole::LcrMeter]
    }

    async fn initialize(
        &mut self,
        ctx: &mut MeasurementContext,
        instruments: &Instruments,
    ) -> MeasurementResult<()> {
        let ramp = RampParameters::resolve(&self.params, "bias_")?;
        let setup = LcrSetup::resolve(&self.params)?;
        register_series_layout(ctx, &Self::SERIES);

        let lcr = instruments.lcr()?;
        ctx.progress(0, 4);
        if lcr.bias_enabled().await? {
            ramp_bias_to_zero(lcr, ramp.voltage_step_after, ramp.waiting_time_after).await?;
        }
        ctx.progress(1, 4);

        lcr.reset().await?;
        setup.apply(lcr).await?;
        lcr.set_bias_voltage_level(0.0).await?;
        lcr.set_bias_enabled(true).await?;
        ctx.instrument_state([("lcr_voltage", Value::from(0.0)), ("lcr_output", Value::from(true))]);
        ctx.progress(2, 4);

        ctx.message("Ramp to start...");
        ramp_to(
            0.0,
            ramp.voltage_start,
            ramp.voltage_step_before,
            ramp.waiting_time_before,
            |v| lcr.set_bias_voltage_level(v),
        )
        .await?;
        ctx.instrument_state([("lcr_voltage", Value::from(ramp.voltage_start))]);
        ctx.progress(3, 4);

        ctx.wait(ramp.waiting_time_start, Duration::from_secs(1)).await;
        ctx.progress(4, 4);
        Ok(())
    }

    async fn measure(
        &mut self,
        ctx: &mut MeasurementContext,
        instruments: &Instruments,
    ) -> MeasurementResult<()> {
        let ramp_params = RampParameters::resolve(&self.params, "bias_")?;
        let setup = LcrSetup::resolve(&self.params)?;
        let lcr = instruments.lcr()?;
        let ramp = ramp_params.ramp();
        let mut estimate = Estimate::new(crate::utils::LinearRange::count(&ramp));
        let mut benchmark = Benchmark::new("Read_LCR");

        for voltage in ramp.clone() {
            if !ctx.is_running() {
                break;
            }
            lcr.set_bias_voltage_level(voltage).await?;
            sleep(ramp_params.waiting_time).await;

            let current = lcr.read_bias_current().await?;
            let (capacitance, resistance) = benchmark.measure_async(setup.acquire(lcr)).await?;
            let capacitance2 = inverse_square(capacitance);
            let env = ctx.read_environment(instruments).await?;

            let x = plot_voltage(&ramp, voltage);
            ctx.reading("lcr", x, capacitance);
            ctx.reading("lcr2", x, capacitance2);
            ctx.data.append_series(&[
                ("timestamp", timestamp()),
                ("voltage_lcr", voltage),
                ("current_lcr", current),
                ("capacitance", capacitance),
                ("capacitance2", capacitance2),
                ("resistance", resistance),
                ("temperature_box", env.box_temperature),
                ("temperature_chuck", env.chuck_temperature),
                ("humidity_box", env.box_humidity),
            ])?;
            ctx.instrument_state([
                ("lcr_voltage", Value::from(voltage)),
                ("lcr_current", Value::from(current)),
            ]);

            estimate.advance();
            let (value, maximum) = estimate.progress();
            ctx.progress(value, maximum);
            ctx.message(format!(
                "{} | LCR {} | {estimate}",
                format_metric(voltage, "V"),
                format_metric(capacitance, "F"),
            ));
        }
        info!("{benchmark}");
        Ok(())
    }

    async fn finalize(
        &mut self,
        ctx: &mut MeasurementContext,
        instruments: &Instruments,
    ) -> MeasurementResult<()> {
        let ramp = RampParameters::resolve(&self.params, "bias_")?;
        let lcr = instruments.lcr()?;
        ctx.wait(ramp.waiting_time_end, Duration::from_secs(1)).await;
        ctx.message("Ramp to zero...");
        ramp_bias_to_zero(lcr, ramp.voltage_step_after, ramp.waiting_time_after).await?;
        ctx.instrument_state([
            ("lcr_voltage", Value::Null),
            ("lcr_current", Value::Null),
            ("lcr_output", Value::from(false)),
        ]);
        ctx.message("");
        Ok(())
    }

    async fn analyze(&mut self, ctx: &mut MeasurementContext) -> MeasurementResult<()> {
        analyze_series(ctx, &self.params, "voltage_lcr", "capacitance")
    }
}
