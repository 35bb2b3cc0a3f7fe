//! LCR frequency sweep at a fixed HV source bias.
//!
//! A source left biased by an earlier run is ramped to zero before it is reset and set up.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::sleep;

use crate::error::MeasurementResult;
use crate::hardware::{Instrument, InstrumentRole, Instruments, LcrMeter, SourceMeter};
use crate::measurement::context::MeasurementContext;
use crate::measurement::ramp::{
    check_compliance, ramp_source_to_zero, ramp_to, register_series_layout, seconds_to_duration,
    timestamp, SourceSetup,
};
use crate::measurement::{analyze_series, register_common, CompliancePolicy, Measurement};
use crate::parameter::{ParameterMap, ParameterSpec, ParameterStore};
use crate::units::format_metric;
use crate::utils::ramp::safe_ramp_step;
use crate::utils::Estimate;

/// Frequency scan measurement.
#[derive(Debug)]
pub struct FrequencyScan {
    params: ParameterStore,
}

impl FrequencyScan {
    /// Registered type name.
    pub const TYPE: &'static str = "frequency_scan";

    /// Series recorded per frequency.
    pub const SERIES: [(&'static str, &'static str); 7] = [
        ("timestamp", "s"),
        ("frequency", "Hz"),
        ("capacitance", "F"),
        ("resistance", "Ohm"),
        ("temperature_box", "degC"),
        ("temperature_chuck", "degC"),
        ("humidity_box", "%"),
    ];

    /// Create with the parameters supplied by the sequence.
    pub fn new(parameters: ParameterMap) -> MeasurementResult<Self> {
        let mut params = ParameterStore::new(parameters);
        register_common(&mut params)?;
        params.register(ParameterSpec::new("bias_voltage").default(0.0).unit("V"))?;
        params.register(ParameterSpec::new("hvsrc_current_compliance").unit("A").required())?;
        SourceSetup::register(&mut params, "hvsrc")?;
        params.register(ParameterSpec::new("lcr_frequency_start").default("1 kHz").unit("Hz"))?;
        params.register(ParameterSpec::new("lcr_frequency_stop").default("1 MHz").unit("Hz"))?;
        params.register(ParameterSpec::new("lcr_frequency_steps").default(1))?;
        params.register(ParameterSpec::new("lcr_amplitude").default("250 mV").unit("V"))?;
        params.register(ParameterSpec::new("waiting_time").default("100 ms").unit("s"))?;
        Ok(Self { params })
    }

    /// Frequencies of the sweep, linearly spaced and including both ends.
    fn frequencies(&self) -> MeasurementResult<Vec<f64>> {
        let start = self.params.get_f64("lcr_frequency_start")?;
        let stop = self.params.get_f64("lcr_frequency_stop")?;
        let steps = self.params.get_i64("lcr_frequency_steps")?.max(1) as usize;
        Ok(frequency_points(start, stop, steps))
    }
}

fn frequency_points(start: f64, stop: f64, steps: usize) -> Vec<f64> {
    if steps == 1 {
        return vec![start];
    }
    let delta = (stop - start) / (steps - 1) as f64;
    (0..steps)
        .map(|i| if i == steps - 1 { stop } else { start + delta * i as f64 })
        .collect()
}

#[async_trait]
impl Measurement for FrequencyScan {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn parameters(&self) -> &ParameterStore {
        &self.params
    }

    fn required_instruments(&self) -> Vec<InstrumentRole> {
        vec![InstrumentRole::HvSource, InstrumentRole::LcrMeter]
    }

    async fn initialize(
        &mut self,
        ctx: &mut MeasurementContext,
        instruments: &Instruments,
    ) -> MeasurementResult<()> {
        let bias = self.params.get_f64("bias_voltage")?;
        let compliance = self.params.get_f64("hvsrc_current_compliance")?;
        let amplitude = self.params.get_f64("lcr_amplitude")?;
        let setup = SourceSetup::resolve(&self.params, "hvsrc")?;
        register_series_layout(ctx, &Self::SERIES);

        let hvsrc = instruments.hvsrc()?;
        let lcr = instruments.lcr()?;
        ctx.progress(0, 3);
        let output = hvsrc.output_enabled().await?;
        ctx.instrument_state([
            ("hvsrc_voltage", Value::from(hvsrc.voltage_level().await?)),
            ("hvsrc_current", Value::Null),
            ("hvsrc_output", Value::from(output)),
        ]);
        if output {
            let level = hvsrc.voltage_level().await?;
            ramp_source_to_zero(ctx, hvsrc, safe_ramp_step(level), Duration::from_millis(100))
                .await?;
        }
        hvsrc.reset().await?;
        setup.apply(hvsrc).await?;
        ctx.progress(1, 3);

        lcr.reset().await?;
        lcr.set_amplitude(amplitude).await?;
        ctx.progress(2, 3);

        hvsrc.set_current_compliance(compliance).await?;
        hvsrc.set_output_enabled(true).await?;
        let level = hvsrc.voltage_level().await?;
        ctx.message("Ramp to bias...");
        ramp_to(
            level,
            bias,
            safe_ramp_step(bias),
            Duration::from_millis(100),
            |v| hvsrc.set_voltage_level(v),
        )
        .await?;
        check_compliance(hvsrc, CompliancePolicy::Fail).await?;
        ctx.instrument_state([
            ("hvsrc_voltage", Value::from(bias)),
            ("hvsrc_output", Value::from(true)),
        ]);
        ctx.message("");
        ctx.progress(3, 3);
        Ok(())
    }

    async fn measure(
        &mut self,
        ctx: &mut MeasurementContext,
        instruments: &Instruments,
    ) -> MeasurementResult<()> {
        let frequencies = self.frequencies()?;
        let waiting_time = seconds_to_duration(self.params.get_f64("waiting_time")?);
        let hvsrc = instruments.hvsrc()?;
        let lcr = instruments.lcr()?;
        let mut estimate = Estimate::new(frequencies.len());

        for frequency in frequencies {
            if !ctx.is_running() {
                break;
            }
            lcr.set_frequency(frequency).await?;
            sleep(waiting_time).await;

            let (capacitance, resistance) = lcr.read_impedance().await?;
            let env = ctx.read_environment(instruments).await?;
            ctx.reading("lcr", frequency, capacitance);
            ctx.data.append_series(&[
                ("timestamp", timestamp()),
                ("frequency", frequency),
                ("capacitance", capacitance),
                ("resistance", resistance),
                ("temperature_box", env.box_temperature),
                ("temperature_chuck", env.chuck_temperature),
                ("humidity_box", env.box_humidity),
            ])?;

            estimate.advance();
            let (value, maximum) = estimate.progress();
            ctx.progress(value, maximum);
            ctx.message(format!(
                "{} | LCR {} | {estimate}",
                format_metric(frequency, "Hz"),
                format_metric(capacitance, "F"),
            ));

            check_compliance(hvsrc, CompliancePolicy::Fail).await?;
        }
        Ok(())
    }

    async fn finalize(
        &mut self,
        ctx: &mut MeasurementContext,
        instruments: &Instruments,
    ) -> MeasurementResult<()> {
        let hvsrc = instruments.hvsrc()?;
        ctx.progress(0, 1);
        let level = hvsrc.voltage_level().await?;
        ramp_source_to_zero(ctx, hvsrc, safe_ramp_step(level), Duration::from_millis(100)).await?;
        ctx.instrument_state([
            ("hvsrc_voltage", Value::from(0.0)),
            ("hvsrc_current", Value::Null),
            ("hvsrc_output", Value::from(false)),
        ]);
        ctx.progress(1, 1);
        Ok(())
    }

    async fn analyze(&mut self, ctx: &mut MeasurementContext) -> MeasurementResult<()> {
        analyze_series(ctx, &self.params, "frequency", "capacitance")
    }
}
