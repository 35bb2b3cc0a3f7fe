//! IV ramp on the HV source.
//!
//! Ramps the HV source from `voltage_start` to `voltage_stop` and reads the source
//! current at each step. The source is ramped to the start voltage with
//! `voltage_step_before` and back to zero with `voltage_step_after`. Sense mode, output
//! terminals and the reading filter are programmed right after the reset.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::info;

use crate::error::MeasurementResult;
use crate::hardware::{Instrument, InstrumentRole, Instruments, SourceMeter};
use crate::measurement::context::MeasurementContext;
use crate::measurement::ramp::{
    check_compliance, plot_voltage, ramp_source_to_start, ramp_source_to_zero,
    register_series_layout, timestamp, RampParameters, SourceSetup,
};
use crate::measurement::{analyze_series, register_common, CompliancePolicy, Measurement};
use crate::parameter::{ParameterMap, ParameterSpec, ParameterStore};
use crate::units::format_metric;
use crate::utils::Estimate;

/// IV ramp measurement.
#[derive(Debug)]
pub struct IvRamp {
    params: ParameterStore,
}

impl IvRamp {
    /// Registered type name.
    pub const TYPE: &'static str = "iv_ramp";

    /// Series recorded per step.
    pub const SERIES: [(&'static str, &'static str); 6] = [
        ("timestamp", "s"),
        ("voltage", "V"),
        ("current_hvsrc", "A"),
        ("temperature_box", "degC"),
        ("temperature_chuck", "degC"),
        ("humidity_box", "%"),
    ];

    /// Create with the parameters supplied by the sequence.
    pub fn new(parameters: ParameterMap) -> MeasurementResult<Self> {
        let mut params = ParameterStore::new(parameters);
        register_common(&mut params)?;
        RampParameters::register(&mut params, "")?;
        params.register(ParameterSpec::new("hvsrc_current_compliance").unit("A").required())?;
        params.register(ParameterSpec::new("hvsrc_accept_compliance").default(false))?;
        SourceSetup::register(&mut params, "hvsrc")?;
        Ok(Self { params })
    }

    fn policy(&self) -> MeasurementResult<CompliancePolicy> {
        Ok(CompliancePolicy::from_accept(
            self.params.get_bool("hvsrc_accept_compliance")?,
        ))
    }
}

#[async_trait]
impl Measurement for IvRamp {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn parameters(&self) -> &ParameterStore {
        &self.params
    }

    fn required_instruments(&self) -> Vec<InstrumentRole> {
        vec![InstrumentRole::HvSource]
    }

    async fn initialize(
        &mut self,
        ctx: &mut MeasurementContext,
        instruments: &Instruments,
    ) -> MeasurementResult<()> {
        let ramp = RampParameters::resolve(&self.params, "")?;
        let compliance = self.params.get_f64("hvsrc_current_compliance")?;
        let setup = SourceSetup::resolve(&self.params, "hvsrc")?;
        register_series_layout(ctx, &Self::SERIES);

        let hvsrc = instruments.hvsrc()?;
        ctx.progress(0, 3);
        hvsrc.reset().await?;
        setup.apply(hvsrc).await?;
        ctx.progress(1, 3);
        ramp_source_to_start(ctx, hvsrc, &ramp, compliance).await?;
        ctx.instrument_state([
            ("hvsrc_voltage", serde_json::Value::from(ramp.voltage_start)),
            ("hvsrc_output", serde_json::Value::from(true)),
        ]);
        ctx.progress(3, 3);
        Ok(())
    }

    async fn measure(
        &mut self,
        ctx: &mut MeasurementContext,
        instruments: &Instruments,
    ) -> MeasurementResult<()> {
        let ramp_params = RampParameters::resolve(&self.params, "")?;
        let policy = self.policy()?;
        let hvsrc = instruments.hvsrc()?;
        let ramp = ramp_params.ramp();
        let mut estimate = Estimate::new(crate::utils::LinearRange::count(&ramp));
        info!(
            start = ramp_params.voltage_start,
            stop = ramp_params.voltage_stop,
            step = ramp_params.voltage_step,
            "IV ramp"
        );

        for voltage in ramp.clone() {
            if !ctx.is_running() {
                break;
            }
            hvsrc.set_voltage_level(voltage).await?;
            sleep(ramp_params.waiting_time).await;

            let current = hvsrc.read_current().await?;
            let env = ctx.read_environment(instruments).await?;
            ctx.reading("hvsrc", plot_voltage(&ramp, voltage), current);
            ctx.data.append_series(&[
                ("timestamp", timestamp()),
                ("voltage", voltage),
                ("current_hvsrc", current),
                ("temperature_box", env.box_temperature),
                ("temperature_chuck", env.chuck_temperature),
                ("humidity_box", env.box_humidity),
            ])?;
            ctx.instrument_state([
                ("hvsrc_voltage", serde_json::Value::from(voltage)),
                ("hvsrc_current", serde_json::Value::from(current)),
            ]);

            estimate.advance();
            let (value, maximum) = estimate.progress();
            ctx.progress(value, maximum);
            ctx.message(format!(
                "{} | HV Source {} | {estimate}",
                format_metric(voltage, "V"),
                format_metric(current, "A"),
            ));

            if check_compliance(hvsrc, policy).await? {
                break;
            }
        }
        Ok(())
    }

    async fn finalize(
        &mut self,
        ctx: &mut MeasurementContext,
        instruments: &Instruments,
    ) -> MeasurementResult<()> {
        let ramp = RampParameters::resolve(&self.params, "")?;
        let hvsrc = instruments.hvsrc()?;
        ctx.wait(ramp.waiting_time_end, Duration::from_secs(1))
            .await;
        ramp_source_to_zero(ctx, hvsrc, ramp.voltage_step_after, ramp.waiting_time_after).await?;
        ctx.instrument_state([
            ("hvsrc_voltage", serde_json::Value::from(0.0)),
            ("hvsrc_output", serde_json::Value::from(false)),
        ]);
        Ok(())
    }

    async fn analyze(&mut self, ctx: &mut MeasurementContext) -> MeasurementResult<()> {
        analyze_series(ctx, &self.params, "voltage", "current_hvsrc")
    }
}
