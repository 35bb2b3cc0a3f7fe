//! IV ramp on the HV source with the V source holding a bias voltage.
//!
//! Before the HV ramp the V source is switched on and ramped to `bias_voltage` in 1 V
//! steps. With `bias_mode = "offset"` the bias follows the HV ramp, keeping
//! `bias_voltage + (voltage - voltage_start)` on the V source. The current is read from
//! the V source, or from the electrometer for `iv_ramp_bias_elm`.
//!
//! Finalize ramps the HV source first, then the bias, both to zero and both outputs off.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::sleep;
use tracing::info;

use crate::error::{MeasurementError, MeasurementResult};
use crate::hardware::{Electrometer, Instrument, InstrumentRole, Instruments, SourceMeter};
use crate::measurement::context::MeasurementContext;
use crate::measurement::ramp::{
    check_compliance, plot_voltage, ramp_source_to_start, ramp_source_to_zero, register_filter,
    register_series_layout, resolve_choice, resolve_filter, setup_electrometer, timestamp,
    RampParameters, SourceSetup,
};
use crate::measurement::{analyze_series, register_common, CompliancePolicy, Measurement};
use crate::parameter::{ParameterMap, ParameterSpec, ParameterStore};
use crate::units::format_metric;
use crate::utils::{Estimate, LinearRange};

/// Step of the ramps between zero and the bias voltage.
pub const BIAS_RAMP_STEP: f64 = 1.0;

const BIAS_RAMP_DELAY: Duration = Duration::from_millis(100);

/// How the bias voltage behaves during the HV ramp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BiasMode {
    /// Bias stays at `bias_voltage`
    #[default]
    Constant,
    /// Bias moves with the HV source
    Offset,
}

impl FromStr for BiasMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "constant" => Ok(Self::Constant),
            "offset" => Ok(Self::Offset),
            other => Err(format!("Invalid bias mode '{other}'")),
        }
    }
}

impl BiasMode {
    /// Bias for the HV `voltage` of a ramp starting at `voltage_start`.
    pub fn bias_at(&self, bias_voltage: f64, voltage_start: f64, voltage: f64) -> f64 {
        match self {
            BiasMode::Constant => bias_voltage,
            BiasMode::Offset => bias_voltage + (voltage - voltage_start),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readout {
    VSource,
    Electrometer,
}

/// Bias IV ramp, read by the V source or by the electrometer.
#[derive(Debug)]
pub struct IvRampBias {
    params: ParameterStore,
    readout: Readout,
}

impl IvRampBias {
    /// Registered type name of the V source variant.
    pub const TYPE: &'static str = "iv_ramp_bias";

    /// Registered type name of the electrometer variant.
    pub const ELM_TYPE: &'static str = "iv_ramp_bias_elm";

    /// Series recorded per step by `iv_ramp_bias`.
    pub const SERIES: [(&'static str, &'static str); 7] = [
        ("timestamp", "s"),
        ("voltage", "V"),
        ("current_vsrc", "A"),
        ("bias_voltage", "V"),
        ("temperature_box", "degC"),
        ("temperature_chuck", "degC"),
        ("humidity_box", "%"),
    ];

    /// Series recorded per step by `iv_ramp_bias_elm`.
    pub const ELM_SERIES: [(&'static str, &'static str); 9] = [
        ("timestamp", "s"),
        ("voltage", "V"),
        ("current_elm", "A"),
        ("current_vsrc", "A"),
        ("current_hvsrc", "A"),
        ("bias_voltage", "V"),
        ("temperature_box", "degC"),
        ("temperature_chuck", "degC"),
        ("humidity_box", "%"),
    ];

    /// Variant reading the V source current.
    pub fn new(parameters: ParameterMap) -> MeasurementResult<Self> {
        Self::create(parameters, Readout::VSource)
    }

    /// Variant reading the electrometer current.
    pub fn with_electrometer(parameters: ParameterMap) -> MeasurementResult<Self> {
        Self::create(parameters, Readout::Electrometer)
    }

    fn create(parameters: ParameterMap, readout: Readout) -> MeasurementResult<Self> {
        let mut params = ParameterStore::new(parameters);
        register_common(&mut params)?;
        RampParameters::register(&mut params, "")?;
        params.register(ParameterSpec::new("bias_voltage").unit("V").required())?;
        params.register(
            ParameterSpec::new("bias_mode")
                .default("constant")
                .values(["constant", "offset"]),
        )?;
        for role in ["hvsrc", "vsrc"] {
            params.register(
                ParameterSpec::new(format!("{role}_current_compliance"))
                    .unit("A")
                    .required(),
            )?;
            params.register(ParameterSpec::new(format!("{role}_accept_compliance")).default(false))?;
            SourceSetup::register(&mut params, role)?;
        }
        if readout == Readout::Electrometer {
            register_filter(&mut params, "elm")?;
            params.register(ParameterSpec::new("elm_zero_correction").default(false))?;
            params.register(ParameterSpec::new("elm_integration_rate").default(50))?;
        }
        Ok(Self { params, readout })
    }

    fn series(&self) -> &'static [(&'static str, &'static str)] {
        match self.readout {
            Readout::VSource => &Self::SERIES,
            Readout::Electrometer => &Self::ELM_SERIES,
        }
    }

    fn current_key(&self) -> &'static str {
        match self.readout {
            Readout::VSource => "current_vsrc",
            Readout::Electrometer => "current_elm",
        }
    }

    fn electrometer<'a>(
        &self,
        instruments: &'a Instruments,
    ) -> MeasurementResult<Option<&'a dyn Electrometer>> {
        match self.readout {
            Readout::VSource => Ok(None),
            Readout::Electrometer => Ok(Some(instruments.elm()?)),
        }
    }

    fn policy(&self, role: &str) -> MeasurementResult<CompliancePolicy> {
        Ok(CompliancePolicy::from_accept(
            self.params.get_bool(&format!("{role}_accept_compliance"))?,
        ))
    }
}

/// Ramp the programmed level of `source` to `voltage`, checking compliance at each step.
async fn ramp_bias(
    ctx: &MeasurementContext,
    source: &dyn SourceMeter,
    voltage: f64,
) -> MeasurementResult<()> {
    let level = source.voltage_level().await?;
    info!(from = level, to = voltage, step = BIAS_RAMP_STEP, "Ramp to bias voltage");
    for bias in LinearRange::new(level, voltage, BIAS_RAMP_STEP) {
        ctx.message(format!("Ramp to bias... {}", format_metric(bias, "V")));
        source.set_voltage_level(bias).await?;
        ctx.instrument_state([("vsrc_voltage", Value::from(bias))]);
        sleep(BIAS_RAMP_DELAY).await;
        check_compliance(source, CompliancePolicy::Fail).await?;
    }
    Ok(())
}

#[async_trait]
impl Measurement for IvRampBias {
    fn type_name(&self) -> &'static str {
        match self.readout {
            Readout::VSource => Self::TYPE,
            Readout::Electrometer => Self::ELM_TYPE,
        }
    }

    fn parameters(&self) -> &ParameterStore {
        &self.params
    }

    fn required_instruments(&self) -> Vec<InstrumentRole> {
        let mut roles = vec![InstrumentRole::HvSource, InstrumentRole::VSource];
        if self.readout == Readout::Electrometer {
            roles.push(InstrumentRole::Electrometer);
        }
        roles
    }

    async fn initialize(
        &mut self,
        ctx: &mut MeasurementContext,
        instruments: &Instruments,
    ) -> MeasurementResult<()> {
        let ramp = RampParameters::resolve(&self.params, "")?;
        let bias_voltage = self.params.get_f64("bias_voltage")?;
        let hvsrc_compliance = self.params.get_f64("hvsrc_current_compliance")?;
        let vsrc_compliance = self.params.get_f64("vsrc_current_compliance")?;
        let hvsrc_setup = SourceSetup::resolve(&self.params, "hvsrc")?;
        let vsrc_setup = SourceSetup::resolve(&self.params, "vsrc")?;
        register_series_layout(ctx, self.series());

        let hvsrc = instruments.hvsrc()?;
        let vsrc = instruments.vsrc()?;
        let elm = self.electrometer(instruments)?;
        ctx.progress(0, 5);

        hvsrc.reset().await?;
        hvsrc_setup.apply(hvsrc).await?;
        hvsrc.set_current_compliance(hvsrc_compliance).await?;
        ctx.progress(1, 5);

        vsrc.reset().await?;
        vsrc_setup.apply(vsrc).await?;
        vsrc.set_current_compliance(vsrc_compliance).await?;
        ctx.progress(2, 5);

        if let Some(elm) = elm {
            let nplc = self.params.get_i64("elm_integration_rate")? as f64 / 10.0;
            let filter = resolve_filter(&self.params, "elm")?;
            let zero_correction = self.params.get_bool("elm_zero_correction")?;
            setup_electrometer(elm, nplc, filter, zero_correction).await?;
        }
        ctx.progress(3, 5);

        vsrc.set_output_enabled(true).await?;
        ctx.instrument_state([("vsrc_output", Value::from(true))]);
        ramp_bias(ctx, vsrc, bias_voltage).await?;
        ctx.progress(4, 5);

        ramp_source_to_start(ctx, hvsrc, &ramp, hvsrc_compliance).await?;
        ctx.instrument_state([
            ("hvsrc_voltage", Value::from(ramp.voltage_start)),
            ("hvsrc_output", Value::from(true)),
        ]);
        if let Some(elm) = elm {
            elm.set_zero_check(false).await?;
        }
        ctx.progress(5, 5);
        Ok(())
    }

    async fn measure(
        &mut self,
        ctx: &mut MeasurementContext,
        instruments: &Instruments,
    ) -> MeasurementResult<()> {
        let ramp_params = RampParameters::resolve(&self.params, "")?;
        let bias_voltage = self.params.get_f64("bias_voltage")?;
        let bias_mode: BiasMode = resolve_choice(&self.params, "bias_mode")?;
        let hvsrc_policy = self.policy("hvsrc")?;
        let vsrc_policy = self.policy("vsrc")?;
        let hvsrc = instruments.hvsrc()?;
        let vsrc = instruments.vsrc()?;
        let elm = self.electrometer(instruments)?;
        let ramp = ramp_params.ramp();
        let mut estimate = Estimate::new(crate::utils::LinearRange::count(&ramp));
        info!(
            start = ramp_params.voltage_start,
            stop = ramp_params.voltage_stop,
            step = ramp_params.voltage_step,
            bias = bias_voltage,
            mode = ?bias_mode,
            "Bias IV ramp"
        );

        for voltage in ramp.clone() {
            if !ctx.is_running() {
                break;
            }
            hvsrc.set_voltage_level(voltage).await?;
            let bias = bias_mode.bias_at(bias_voltage, ramp_params.voltage_start, voltage);
            if bias_mode == BiasMode::Offset {
                vsrc.set_voltage_level(bias).await?;
            }
            ctx.instrument_state([
                ("hvsrc_voltage", Value::from(voltage)),
                ("vsrc_voltage", Value::from(bias)),
            ]);
            sleep(ramp_params.waiting_time).await;

            let current_vsrc = vsrc.read_current().await?;
            let current_hvsrc = hvsrc.read_current().await?;
            let env = ctx.read_environment(instruments).await?;
            let x = plot_voltage(&ramp, voltage);
            let mut row = vec![("timestamp", timestamp()), ("voltage", voltage)];
            let current = match elm {
                Some(elm) => {
                    let current_elm = elm.read_current().await?;
                    ctx.reading("elm", x, current_elm);
                    row.extend([
                        ("current_elm", current_elm),
                        ("current_vsrc", current_vsrc),
                        ("current_hvsrc", current_hvsrc),
                    ]);
                    current_elm
                }
                None => {
                    ctx.reading("vsrc", x, current_vsrc);
                    row.push(("current_vsrc", current_vsrc));
                    current_vsrc
                }
            };
            row.extend([
                ("bias_voltage", bias),
                ("temperature_box", env.box_temperature),
                ("temperature_chuck", env.chuck_temperature),
                ("humidity_box", env.box_humidity),
            ]);
            ctx.data.append_series(&row)?;
            ctx.instrument_state([
                ("hvsrc_current", Value::from(current_hvsrc)),
                ("vsrc_current", Value::from(current_vsrc)),
            ]);

            estimate.advance();
            let (value, maximum) = estimate.progress();
            ctx.progress(value, maximum);
            ctx.message(format!(
                "{} | Bias {} | {} | {estimate}",
                format_metric(voltage, "V"),
                format_metric(bias, "V"),
                format_metric(current, "A"),
            ));

            let hvsrc_stop = check_compliance(hvsrc, hvsrc_policy).await?;
            let vsrc_stop = check_compliance(vsrc, vsrc_policy).await?;
            if hvsrc_stop || vsrc_stop {
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
        let vsrc = instruments.vsrc()?;
        ctx.wait(ramp.waiting_time_end, Duration::from_secs(1)).await;

        let zero_check = match self.electrometer(instruments)? {
            Some(elm) => elm.set_zero_check(true).await.map_err(MeasurementError::from),
            None => Ok(()),
        };
        let hv = ramp_source_to_zero(ctx, hvsrc, ramp.voltage_step_after, ramp.waiting_time_after)
            .await;
        let bias = ramp_source_to_zero(ctx, vsrc, BIAS_RAMP_STEP, BIAS_RAMP_DELAY).await;
        ctx.instrument_state([
            ("hvsrc_voltage", Value::Null),
            ("hvsrc_current", Value::Null),
            ("hvsrc_output", Value::from(false)),
            ("vsrc_voltage", Value::Null),
            ("vsrc_current", Value::Null),
            ("vsrc_output", Value::from(false)),
        ]);
        hv.and(bias).and(zero_check)
    }

    async fn analyze(&mut self, ctx: &mut MeasurementContext) -> MeasurementResult<()> {
        analyze_series(ctx, &self.params, "voltage", self.current_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abort::AbortHandle;
    use crate::events::EventSender;
    use crate::hardware::mock::{MockElectrometer, MockSourceMeter};
    use crate::hardware::{SenseMode, Station};
    use crate::measurement::MeasurementRunner;
    use crate::parameter::ParameterValue;
    use crate::sequence::NodePath;
    use std::sync::Arc;

    fn params(extra: &[(&str, &str)]) -> ParameterMap {
        [
            ("voltage_start", "0 V"),
            ("voltage_stop", "-4 V"),
            ("voltage_step", "2 V"),
            ("waiting_time", "0 s"),
            ("waiting_time_before", "0 s"),
            ("waiting_time_after", "0 s"),
            ("bias_voltage", "2 V"),
            ("hvsrc_current_compliance", "1 uA"),
            ("vsrc_current_compliance", "1 uA"),
        ]
        .iter()
        .chain(extra)
        .map(|(k, v)| (k.to_string(), ParameterValue::from(*v)))
        .collect()
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
    async fn constant_bias_is_held_during_the_ramp() {
        let hvsrc = Arc::new(MockSourceMeter::new("hvsrc"));
        let vsrc = Arc::new(MockSourceMeter::new("vsrc"));
        let runner = MeasurementRunner::new(
            Station::new().with_hvsrc(hvsrc.clone()).with_vsrc(vsrc.clone()),
        );
        let mut m = IvRampBias::new(params(&[("vsrc_sense_mode", "remote")])).unwrap();
        let mut ctx = context();
        runner.run(&mut m, &mut ctx).await.unwrap();

        assert_eq!(ctx.data.get_series("voltage"), &[0.0, -2.0, -4.0]);
        assert_eq!(ctx.data.get_series("bias_voltage"), &[2.0, 2.0, 2.0]);
        assert!(ctx.data.get_series("current_vsrc").iter().all(|i| *i == 2e-9));
        assert_eq!(ctx.readings()["vsrc"][2], (4.0, 2e-9));
        assert_eq!(vsrc.history().await, vec![0.0, 1.0, 2.0, 2.0, 1.0, 0.0]);
        assert_eq!(vsrc.sense_mode().await, SenseMode::Remote);
        assert!(!hvsrc.output_enabled().await.unwrap());
        assert!(!vsrc.output_enabled().await.unwrap());
        assert_eq!(m.type_name(), "iv_ramp_bias");
    }

    #[tokio::test(start_paused = true)]
    async fn offset_bias_follows_the_hv_source() {
        let vsrc = Arc::new(MockSourceMeter::new("vsrc"));
        let runner = MeasurementRunner::new(
            Station::new()
                .with_hvsrc(Arc::new(MockSourceMeter::new("hvsrc")))
                .with_vsrc(vsrc.clone()),
        );
        let mut m = IvRampBias::new(params(&[("bias_mode", "offset")])).unwrap();
        let mut ctx = context();
        runner.run(&mut m, &mut ctx).await.unwrap();

        assert_eq!(ctx.data.get_series("bias_voltage"), &[2.0, 0.0, -2.0]);
        assert!(vsrc.history().await.contains(&-2.0));
        assert_eq!(vsrc.voltage_level().await.unwrap(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn electrometer_variant_reads_all_currents() {
        let elm = Arc::new(MockElectrometer::new("elm", 3e-12));
        let runner = MeasurementRunner::new(
            Station::new()
                .with_hvsrc(Arc::new(MockSourceMeter::new("hvsrc")))
                .with_vsrc(Arc::new(MockSourceMeter::new("vsrc")))
                .with_elm(elm.clone()),
        );
        let mut values = params(&[]);
        values.insert("elm_integration_rate".into(), ParameterValue::Integer(20));
        let mut m = IvRampBias::with_electrometer(values).unwrap();
        assert_eq!(m.type_name(), "iv_ramp_bias_elm");
        assert!(m.required_instruments().contains(&InstrumentRole::Electrometer));
        let mut ctx = context();
        runner.run(&mut m, &mut ctx).await.unwrap();

        assert!(ctx.data.get_series("current_elm").iter().all(|i| *i == 3e-12));
        assert_eq!(ctx.data.get_series("current_hvsrc"), &[0.0, -2e-9, -4e-9]);
        assert_eq!(ctx.readings()["elm"].len(), 3);
        assert!(elm.zero_check().await);
        assert_eq!(elm.nplc().await, 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn bias_compliance_aborts_before_the_hv_ramp() {
        let hvsrc = Arc::new(MockSourceMeter::new("hvsrc"));
        let vsrc = Arc::new(MockSourceMeter::with_resistance("vsrc", 1e3));
        let runner = MeasurementRunner::new(
            Station::new().with_hvsrc(hvsrc.clone()).with_vsrc(vsrc.clone()),
        );
        let mut values = params(&[]);
        values.insert("vsrc_current_compliance".into(), "1 mA".into());
        let mut m = IvRampBias::new(values).unwrap();
        let mut ctx = context();
        let err = runner.run(&mut m, &mut ctx).await.unwrap_err();

        assert!(matches!(err, MeasurementError::Compliance(ref name) if name == "vsrc"));
        assert_eq!(ctx.data.series_len(), 0);
        assert!(hvsrc.history().await.iter().all(|v| *v == 0.0));
        assert!(!vsrc.output_enabled().await.unwrap());
        assert_eq!(vsrc.voltage_level().await.unwrap(), 0.0);
    }

    #[test]
    fn offset_mode_tracks_distance_from_start() {
        assert_eq!(BiasMode::Constant.bias_at(5.0, -10.0, -30.0), 5.0);
        assert_eq!(BiasMode::Offset.bias_at(5.0, -10.0, -30.0), -15.0);
        assert!("shifted".parse::<BiasMode>().is_err());
    }
}
