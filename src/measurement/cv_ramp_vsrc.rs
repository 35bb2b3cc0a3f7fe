//! CV ramp with the bias supplied by the V source.
//!
//! Same acquisition as `cv_ramp`, but the LCR meter's internal bias stays off and the
//! V source steps `bias_voltage_start` to `bias_voltage_stop`. The V source current is
//! recorded next to capacitance and resistance.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::sleep;
use tracing::info;

use crate::error::MeasurementResult;
use crate::hardware::{Instrument, InstrumentRole, Instruments};
use crate::measurement::context::MeasurementContext;
use crate::measurement::cv_ramp::{inverse_square, LcrSetup};
use crate::measurement::ramp::{
    check_compliance, plot_voltage, ramp_source_to_start, ramp_source_to_zero,
    register_series_layout, timestamp, RampParameters, SourceSetup,
};
use crate::measurement::{analyze_series, register_common, CompliancePolicy, Measurement};
use crate::parameter::{ParameterMap, ParameterSpec, ParameterStore};
use crate::units::format_metric;
use crate::utils::{Benchmark, Estimate};

/// CV ramp biased by the V source.
#[derive(Debug)]
pub struct CvRampVsrc {
    params: ParameterStore,
}

impl CvRampVsrc {
    /// Registered type name.
    pub const TYPE: &'static str = "cv_ramp_vsrc";

    /// Series recorded per step.
    pub const SERIES: [(&'static str, &'static str); 9] = [
        ("timestamp", "s"),
        ("voltage_vsrc", "V"),
        ("current_vsrc", "A"),
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
        params.register(ParameterSpec::new("vsrc_current_compliance").unit("A").required())?;
        params.register(ParameterSpec::new("vsrc_accept_compliance").default(false))?;
        SourceSetup::register(&mut params, "vsrc")?;
        LcrSetup::register(&mut params)?;
        Ok(Self { params })
    }
}

#[async_trait]
impl Measurement for CvRampVsrc {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn parameters(&self) -> &ParameterStore {
        &self.params
    }

    fn required_instruments(&self) -> Vec<InstrumentRole> {
        vec![InstrumentRole::VSource, InstrumentRole::LcrMeter]
    }

    async fn initialize(
        &mut self,
        ctx: &mut MeasurementContext,
        instruments: &Instruments,
    ) -> MeasurementResult<()> {
        let ramp = RampParameters::resolve(&self.params, "bias_")?;
        let compliance = self.params.get_f64("vsrc_current_compliance")?;
        let vsrc_setup = SourceSetup::resolve(&self.params, "vsrc")?;
        let lcr_setup = LcrSetup::resolve(&self.params)?;
        register_series_layout(ctx, &Self::SERIES);

        let vsrc = instruments.vsrc()?;
        let lcr = instruments.lcr()?;
        ctx.progress(0, 4);
        if vsrc.output_enabled().await? {
            ramp_source_to_zero(ctx, vsrc, ramp.voltage_step_after, ramp.waiting_time_after)
                .await?;
        }
        vsrc.reset().await?;
        vsrc_setup.apply(vsrc).await?;
        ctx.progress(1, 4);

        lcr.reset().await?;
        lcr_setup.apply(lcr).await?;
        lcr.set_bias_enabled(false).await?;
        ctx.progress(2, 4);

        ramp_source_to_start(ctx, vsrc, &ramp, compliance).await?;
        ctx.instrument_state([
            ("vsrc_voltage", Value::from(ramp.voltage_start)),
            ("vsrc_output", Value::from(true)),
        ]);
        ctx.progress(4, 4);
        Ok(())
    }

    async fn measure(
        &mut self,
        ctx: &mut MeasurementContext,
        instruments: &Instruments,
    ) -> MeasurementResult<()> {
        let ramp_params = RampParameters::resolve(&self.params, "bias_")?;
        let lcr_setup = LcrSetup::resolve(&self.params)?;
        let policy = CompliancePolicy::from_accept(self.params.get_bool("vsrc_accept_compliance")?);
        let vsrc = instruments.vsrc()?;
        let lcr = instruments.lcr()?;
        let ramp = ramp_params.ramp();
        let mut estimate = Estimate::new(crate::utils::LinearRange::count(&ramp));
        let mut benchmark = Benchmark::new("Read_LCR");

        for voltage in ramp.clone() {
            if !ctx.is_running() {
                break;
            }
            vsrc.set_voltage_level(voltage).await?;
            sleep(ramp_params.waiting_time).await;

            let current = vsrc.read_current().await?;
            let (capacitance, resistance) =
                benchmark.measure_async(lcr_setup.acquire(lcr)).await?;
            let capacitance2 = inverse_square(capacitance);
            let env = ctx.read_environment(instruments).await?;

            let x = plot_voltage(&ramp, voltage);
            ctx.reading("lcr", x, capacitance);
            ctx.reading("lcr2", x, capacitance2);
            ctx.data.append_series(&[
                ("timestamp", timestamp()),
                ("voltage_vsrc", voltage),
                ("current_vsrc", current),
                ("capacitance", capacitance),
                ("capacitance2", capacitance2),
                ("resistance", resistance),
                ("temperature_box", env.box_temperature),
                ("temperature_chuck", env.chuck_temperature),
                ("humidity_box", env.box_humidity),
            ])?;
            ctx.instrument_state([
                ("vsrc_voltage", Value::from(voltage)),
                ("vsrc_current", Value::from(current)),
            ]);

            estimate.advance();
            let (value, maximum) = estimate.progress();
            ctx.progress(value, maximum);
            ctx.message(format!(
                "{} | V Source {} | LCR {} | {estimate}",
                format_metric(voltage, "V"),
                format_metric(current, "A"),
                format_metric(capacitance, "F"),
            ));

            if check_compliance(vsrc, policy).await? {
                break;
            }
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
        let vsrc = instruments.vsrc()?;
        ctx.wait(ramp.waiting_time_end, Duration::from_secs(1)).await;
        ramp_source_to_zero(ctx, vsrc, ramp.voltage_step_after, ramp.waiting_time_after).await?;
        ctx.instrument_state([
            ("vsrc_voltage", Value::Null),
            ("vsrc_current", Value::Null),
            ("vsrc_output", Value::from(false)),
        ]);
        Ok(())
    }

    async fn analyze(&mut self, ctx: &mut MeasurementContext) -> MeasurementResult<()> {
        analyze_series(ctx, &self.params, "voltage_vsrc", "capacitance")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abort::AbortHandle;
    use crate::events::EventSender;
    use crate::hardware::mock::{MockLcrMeter, MockSourceMeter};
    use crate::hardware::{IntegrationTime, LcrMeter, SourceMeter, Station};
    use crate::measurement::MeasurementRunner;
    use crate::parameter::ParameterValue;
    use crate::sequence::NodePath;
    use std::sync::Arc;

    fn params() -> ParameterMap {
        let mut map: ParameterMap = [
            ("bias_voltage_start", "0 V"),
            ("bias_voltage_stop", "-10 V"),
            ("bias_voltage_step", "5 V"),
            ("waiting_time", "0 s"),
            ("waiting_time_before", "0 s"),
            ("waiting_time_after", "0 s"),
            ("vsrc_current_compliance", "1 uA"),
            ("lcr_integration_time", "short"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), ParameterValue::from(v)))
        .collect();
        map.insert("lcr_soft_filter".into(), false.into());
        map
    }

    fn context() -> MeasurementContext {
        MeasurementContext::new(
            NodePath::Measurement(0, 0, 0),
            EventSender::disabled(),
            AbortHandle::new(),
            false,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn vsrc_supplies_the_bias() {
        let vsrc = Arc::new(MockSourceMeter::new("vsrc"));
        let lcr = Arc::new(MockLcrMeter::new("lcr", 100e-12));
        let runner =
            MeasurementRunner::new(Station::new().with_vsrc(vsrc.clone()).with_lcr(lcr.clone()));
        let mut m = CvRampVsrc::new(params()).unwrap();
        let mut ctx = context();
        runner.run(&mut m, &mut ctx).await.unwrap();

        assert_eq!(ctx.data.get_series("voltage_vsrc"), &[0.0, -5.0, -10.0]);
        assert_eq!(ctx.data.get_series("current_vsrc"), &[0.0, -5e-9, -10e-9]);
        // The LCR bias stays at 0 V, so the mock reports its zero-bias capacitance.
        assert!(ctx
            .data
            .get_series("capacitance")
            .iter()
            .all(|c| (c - 100e-12).abs() < 1e-18));
        assert_eq!(ctx.readings()["lcr2"].len(), 3);
        assert!(!lcr.bias_enabled().await.unwrap());
        assert_eq!(lcr.aperture().await, (IntegrationTime::Short, 1));
        assert!(!vsrc.output_enabled().await.unwrap());
        assert_eq!(vsrc.voltage_level().await.unwrap(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn accepted_compliance_keeps_the_data() {
        let vsrc = Arc::new(MockSourceMeter::with_resistance("vsrc", 1e3));
        let runner = MeasurementRunner::new(
            Station::new()
                .with_vsrc(vsrc.clone())
                .with_lcr(Arc::new(MockLcrMeter::new("lcr", 100e-12))),
        );
        let mut values = params();
        values.insert("bias_voltage_stop".into(), "-20 V".into());
        values.insert("vsrc_current_compliance".into(), "7 mA".into());
        values.insert("vsrc_accept_compliance".into(), true.into());
        let mut m = CvRampVsrc::new(values).unwrap();
        let mut ctx = context();
        runner.run(&mut m, &mut ctx).await.unwrap();

        assert_eq!(ctx.data.get_series("voltage_vsrc"), &[0.0, -5.0, -10.0]);
        assert!(!vsrc.output_enabled().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn biased_source_is_ramped_down_first() {
        let vsrc = Arc::new(MockSourceMeter::new("vsrc"));
        vsrc.force_output(-10.0).await;
        let runner = MeasurementRunner::new(
            Station::new()
                .with_vsrc(vsrc.clone())
                .with_lcr(Arc::new(MockLcrMeter::new("lcr", 100e-12))),
        );
        let mut m = CvRampVsrc::new(params()).unwrap();
        let mut ctx = context();
        runner.run(&mut m, &mut ctx).await.unwrap();

        assert_eq!(&vsrc.history().await[..3], &[-10.0, -5.0, 0.0]);
    }
}
