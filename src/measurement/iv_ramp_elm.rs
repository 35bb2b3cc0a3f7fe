//! IV ramp on the V source with electrometer readings.
//!
//! The electrometer is configured with zero check enabled, optionally zero corrected,
//! and zero check is released only after the source reached the start voltage.
//! Finalize enables zero check again before the source is ramped down.
//!
//! Older sequences name the V source terminals `vsrc_route_termination`; the key is
//! accepted and overrides `vsrc_route_terminal` when given.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::sleep;
use tracing::info;

use crate::error::MeasurementResult;
use crate::hardware::{Electrometer, Instrument, InstrumentRole, Instruments, SourceMeter};
use crate::measurement::context::MeasurementContext;
use crate::measurement::ramp::{
    check_compliance, plot_voltage, ramp_source_to_start, ramp_source_to_zero,
    register_filter, register_series_layout, resolve_choice, resolve_filter, setup_electrometer,
    timestamp, RampParameters, SourceSetup,
};
use crate::measurement::{analyze_series, register_common, CompliancePolicy, Measurement};
use crate::parameter::{ParameterMap, ParameterSpec, ParameterStore};
use crate::units::format_metric;
use crate::utils::Estimate;

/// IV ramp with electrometer.
#[derive(Debug)]
pub struct IvRampElm {
    params: ParameterStore,
}

impl IvRampElm {
    /// Registered type name.
    pub const TYPE: &'static str = "iv_ramp_elm";

    /// Series recorded per step.
    pub const SERIES: [(&'static str, &'static str); 7] = [
        ("timestamp", "s"),
        ("voltage", "V"),
        ("current_vsrc", "A"),
        ("current_elm", "A"),
        ("temperature_box", "degC"),
        ("temperature_chuck", "degC"),
        ("humidity_box", "%"),
    ];

    /// Create with the parameters supplied by the sequence.
    pub fn new(parameters: ParameterMap) -> MeasurementResult<Self> {
        let mut params = ParameterStore::new(parameters);
        register_common(&mut params)?;
        RampParameters::register(&mut params, "")?;
        params.register(ParameterSpec::new("vsrc_current_compliance").unit("A").required())?;
        params.register(ParameterSpec::new("vsrc_accept_compliance").default(false))?;
        SourceSetup::register(&mut params, "vsrc")?;
        params.register(
            ParameterSpec::new(LEGACY_ROUTE_KEY).values(["front", "rear"]),
        )?;
        register_filter(&mut params, "elm")?;
        params.register(ParameterSpec::new("elm_zero_correction").default(false))?;
        params.register(ParameterSpec::new("elm_integration_rate").default(50))?;
        Ok(Self { params })
    }

    /// Integration time in power line cycles.
    fn nplc(&self) -> MeasurementResult<f64> {
        Ok(self.params.get_i64("elm_integration_rate")? as f64 / 10.0)
    }

    fn vsrc_setup(&self) -> MeasurementResult<SourceSetup> {
        let mut setup = SourceSetup::resolve(&self.params, "vsrc")?;
        if self.params.supplied().contains_key(LEGACY_ROUTE_KEY) {
            setup.route_terminal = resolve_choice(&self.params, LEGACY_ROUTE_KEY)?;
        }
        Ok(setup)
    }
}

const LEGACY_ROUTE_KEY: &str = "vsrc_route_termination";

#[async_trait]
impl Measurement for IvRampElm {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn parameters(&self) -> &ParameterStore {
        &self.params
    }

    fn required_instruments(&self) -> Vec<InstrumentRole> {
        vec![InstrumentRole::VSource, InstrumentRole::Electrometer]
    }

    async fn initialize(
        &mut self,
        ctx: &mut MeasurementContext,
        instruments: &Instruments,
    ) -> MeasurementResult<()> {
        let ramp = RampParameters::resolve(&self.params, "")?;
        let compliance = self.params.get_f64("vsrc_current_compliance")?;
        let nplc = self.nplc()?;
        let zero_correction = self.params.get_bool("elm_zero_correction")?;
        let vsrc_setup = self.vsrc_setup()?;
        let elm_filter = resolve_filter(&self.params, "elm")?;
        register_series_layout(ctx, &Self::SERIES);

        let vsrc = instruments.vsrc()?;
        let elm = instruments.elm()?;
        ctx.progress(0, 5);

        let vsrc_idn = vsrc.identify().await?;
        let elm_idn = elm.identify().await?;
        info!(vsrc = %vsrc_idn, elm = %elm_idn, "Detected instruments");
        ctx.instrument_state([
            ("vsrc_model", Value::from(vsrc_idn)),
            ("elm_model", Value::from(elm_idn)),
        ]);
        ctx.progress(1, 5);

        if vsrc.output_enabled().await? {
            ramp_source_to_zero(ctx, vsrc, ramp.voltage_step, Duration::from_millis(100)).await?;
        }
        vsrc.reset().await?;
        vsrc_setup.apply(vsrc).await?;
        ctx.progress(2, 5);

        setup_electrometer(elm, nplc, elm_filter, zero_correction).await?;
        ctx.progress(3, 5);

        ramp_source_to_start(ctx, vsrc, &ramp, compliance).await?;
        ctx.instrument_state([
            ("vsrc_voltage", Value::from(ramp.voltage_start)),
            ("vsrc_output", Value::from(true)),
        ]);
        ctx.progress(4, 5);

        elm.set_zero_check(false).await?;
        ctx.progress(5, 5);
        Ok(())
    }

    async fn measure(
        &mut self,
        ctx: &mut MeasurementContext,
        instruments: &Instruments,
    ) -> MeasurementResult<()> {
        let ramp_params = RampParameters::resolve(&self.params, "")?;
        let policy = CompliancePolicy::from_accept(self.params.get_bool("vsrc_accept_compliance")?);
        let vsrc = instruments.vsrc()?;
        let elm = instruments.elm()?;
        let ramp = ramp_params.ramp();
        let mut estimate = Estimate::new(crate::utils::LinearRange::count(&ramp));

        for voltage in ramp.clone() {
            if !ctx.is_running() {
                break;
            }
            vsrc.set_voltage_level(voltage).await?;
            sleep(ramp_params.waiting_time).await;

            let current_vsrc = vsrc.read_current().await?;
            let current_elm = elm.read_current().await?;
            let env = ctx.read_environment(instruments).await?;
            let x = plot_voltage(&ramp, voltage);
            ctx.reading("vsrc", x, current_vsrc);
            ctx.reading("elm", x, current_elm);
            ctx.data.append_series(&[
                ("timestamp", timestamp()),
                ("voltage", voltage),
                ("current_vsrc", current_vsrc),
                ("current_elm", current_elm),
                ("temperature_box", env.box_temperature),
                ("temperature_chuck", env.chuck_temperature),
                ("humidity_box", env.box_humidity),
            ])?;
            ctx.instrument_state([
                ("vsrc_voltage", Value::from(voltage)),
                ("vsrc_current", Value::from(current_vsrc)),
                ("elm_current", Value::from(current_elm)),
            ]);

            estimate.advance();
            let (value, maximum) = estimate.progress();
            ctx.progress(value, maximum);
            ctx.message(format!(
                "{} | V Source {} | Electrometer {} | {estimate}",
                format_metric(voltage, "V"),
                format_metric(current_vsrc, "A"),
                format_metric(current_elm, "A"),
            ));

            if check_compliance(vsrc, policy).await? {
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
        let vsrc = instruments.vsrc()?;
        let elm = instruments.elm()?;
        ctx.wait(ramp.waiting_time_end, Duration::from_secs(1)).await;
        elm.set_zero_check(true).await?;
        ramp_source_to_zero(ctx, vsrc, ramp.voltage_step_after, ramp.waiting_time_after).await?;
        ctx.instrument_state([
            ("vsrc_voltage", Value::from(0.0)),
            ("vsrc_output", Value::from(false)),
        ]);
        Ok(())
    }

    async fn analyze(&mut self, ctx: &mut MeasurementContext) -> MeasurementResult<()> {
        analyze_series(ctx, &self.params, "voltage", "current_elm")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abort::AbortHandle;
    use crate::error::MeasurementError;
    use crate::events::EventSender;
    use crate::hardware::mock::{MockElectrometer, MockSourceMeter};
    use crate::hardware::{FilterType, RouteTerminal, SenseMode, Station};
    use crate::measurement::MeasurementRunner;
    use crate::parameter::ParameterValue;
    use crate::sequence::NodePath;
    use std::sync::Arc;

    fn params() -> ParameterMap {
        [
            ("voltage_start", "0 V"),
            ("voltage_stop", "-4 V"),
            ("voltage_step", "1 V"),
            ("waiting_time", "0 s"),
            ("waiting_time_before", "0 s"),
            ("waiting_time_after", "0 s"),
            ("vsrc_current_compliance", "10 uA"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), ParameterValue::from(v)))
        .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn electrometer_reads_with_zero_check_released() {
        let vsrc = Arc::new(MockSourceMeter::new("vsrc"));
        let elm = Arc::new(MockElectrometer::new("elm", 2e-12));
        let station = Station::new().with_vsrc(vsrc.clone()).with_elm(elm.clone());
        let runner = MeasurementRunner::new(station);
        let mut m = IvRampElm::new(params()).unwrap();
        let mut ctx = MeasurementContext::new(
            NodePath::Measurement(0, 0, 0),
            EventSender::disabled(),
            AbortHandle::new(),
            false,
        );
        runner.run(&mut m, &mut ctx).await.unwrap();

        assert_eq!(ctx.data.get_series("voltage"), &[0.0, -1.0, -2.0, -3.0, -4.0]);
        assert!(ctx.data.get_series("current_elm").iter().all(|i| *i == 2e-12));
        assert_eq!(ctx.readings()["elm"][4], (4.0, 2e-12));
        assert!(elm.zero_check().await);
        assert!(!vsrc.output_enabled().await.unwrap());
        assert_eq!(ctx.data.meta["elm_integration_rate"], serde_json::json!(50));
    }

    #[tokio::test(start_paused = true)]
    async fn source_and_electrometer_settings_are_programmed() {
        let mut values = params();
        values.insert("vsrc_sense_mode".into(), "remote".into());
        values.insert("vsrc_route_terminal".into(), "front".into());
        values.insert("vsrc_filter_enable".into(), true.into());
        values.insert("elm_filter_enable".into(), true.into());
        values.insert("elm_filter_count".into(), ParameterValue::Integer(5));
        values.insert("elm_filter_type".into(), "moving".into());
        values.insert("elm_integration_rate".into(), ParameterValue::Integer(20));
        let vsrc = Arc::new(MockSourceMeter::new("vsrc"));
        let elm = Arc::new(MockElectrometer::new("elm", 1e-12));
        let runner =
            MeasurementRunner::new(Station::new().with_vsrc(vsrc.clone()).with_elm(elm.clone()));
        let mut m = IvRampElm::new(values).unwrap();
        let mut ctx = MeasurementContext::new(
            NodePath::Measurement(0, 0, 0),
            EventSender::disabled(),
            AbortHandle::new(),
            false,
        );
        runner.run(&mut m, &mut ctx).await.unwrap();

        assert_eq!(vsrc.sense_mode().await, SenseMode::Remote);
        assert_eq!(vsrc.route_terminal().await, RouteTerminal::Front);
        assert!(vsrc.filter().await.enabled);
        assert_eq!(vsrc.filter().await.count, 10);
        let filter = elm.filter().await;
        assert!(filter.enabled);
        assert_eq!(filter.count, 5);
        assert_eq!(filter.kind, FilterType::Moving);
        assert_eq!(elm.nplc().await, 2.0);
    }

    #[test]
    fn legacy_route_key_overrides_terminal() {
        let mut values = params();
        values.insert("vsrc_route_termination".into(), "front".into());
        let m = IvRampElm::new(values).unwrap();
        assert_eq!(m.vsrc_setup().unwrap().route_terminal, RouteTerminal::Front);
        assert!(m.parameters().validate_parameters().is_empty());

        let m = IvRampElm::new(params()).unwrap();
        assert_eq!(m.vsrc_setup().unwrap().route_terminal, RouteTerminal::Rear);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_electrometer_is_resource_error() {
        let station = Station::new().with_vsrc(Arc::new(MockSourceMeter::new("vsrc")));
        let runner = MeasurementRunner::new(station);
        let mut m = IvRampElm::new(params()).unwrap();
        let mut ctx = MeasurementContext::new(
            NodePath::Measurement(0, 0, 0),
            EventSender::disabled(),
            AbortHandle::new(),
            false,
        );
        let err = runner.run(&mut m, &mut ctx).await.unwrap_err();
        assert!(matches!(err, MeasurementError::ResourceUnavailable(_)));
    }

    #[test]
    fn integration_rate_maps_to_nplc() {
        let mut values = params();
        values.insert("elm_integration_rate".into(), ParameterValue::Integer(10));
        let m = IvRampElm::new(values).unwrap();
        assert_eq!(m.nplc().unwrap(), 1.0);
    }
}
