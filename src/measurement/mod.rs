//! Measurements: single instrument-driving units of a sequence.
//!
//! # Key Concepts
//!
//! - **Measurement**: one ramp or test with lifecycle hooks (this module's trait)
//! - **MeasurementContext**: runtime data plus the event/abort link to the executor
//! - **MeasurementRunner**: drives the lifecycle with guaranteed finalize
//! - **MeasurementRegistry**: maps type names from the sequence to constructors
//!
//! # Lifecycle
//!
//! ```text
//! before_initialize → initialize → after_initialize → measure
//!     → before_finalize → finalize → after_finalize → analyze
//! ```
//!
//! Finalize runs even if initialize or measure failed. Analyze always runs last.
//!
//! # Measurement types
//!
//! | type               | instruments        | ramps                        |
//! |--------------------|--------------------|------------------------------|
//! | `iv_ramp`          | hvsrc              | HV source voltage            |
//! | `iv_ramp_elm`      | vsrc, elm          | V source voltage             |
//! | `iv_ramp_bias`     | hvsrc, vsrc        | HV source, V source as bias  |
//! | `iv_ramp_bias_elm` | hvsrc, vsrc, elm   | HV source, V source as bias  |
//! | `cv_ramp`          | lcr                | LCR bias voltage             |
//! | `cv_ramp_vsrc`     | vsrc, lcr          | V source voltage             |
//! | `frequency_scan`   | hvsrc, lcr         | LCR frequency                |

pub mod analysis;
pub mod context;
pub mod cv_ramp;
pub mod cv_ramp_vsrc;
pub mod data;
pub mod frequency_scan;
pub mod iv_ramp;
pub mod iv_ramp_bias;
pub mod iv_ramp_elm;
pub mod ramp;
pub mod runner;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;

use crate::error::{MeasurementError, MeasurementResult, ParameterError, PqcError, PqcResult};
use crate::hardware::{InstrumentRole, Instruments};
use crate::parameter::{ParameterMap, ParameterSpec, ParameterStore, ParameterValue};
use crate::sequence::SequenceTree;

use self::analysis::AnalysisFunction;

pub use context::MeasurementContext;
pub use data::MeasurementData;
pub use runner::MeasurementRunner;

// =============================================================================
// Measurement Trait
// =============================================================================

/// A single executable measurement.
///
/// Implementations hold their resolved parameters and drive instruments through the
/// handles in [`Instruments`]. Errors are typed so the executor can classify them.
#[async_trait]
pub trait Measurement: Send {
    /// Registered type name (e.g. `"iv_ramp"`).
    fn type_name(&self) -> &'static str;

    /// Registered parameters with the values supplied by the sequence.
    fn parameters(&self) -> &ParameterStore;

    /// Instruments that must be held for the whole lifecycle.
    fn required_instruments(&self) -> Vec<InstrumentRole>;

    /// Reset data, apply run meta data and report unknown parameters.
    async fn before_initialize(&mut self, ctx: &mut MeasurementContext) -> MeasurementResult<()> {
        ctx.reset_data();
        self.parameters().validate_parameters();
        record_parameters(ctx, self.parameters());
        Ok(())
    }

    /// Bring instruments into the measurement state.
    async fn initialize(
        &mut self,
        ctx: &mut MeasurementContext,
        instruments: &Instruments,
    ) -> MeasurementResult<()>;

    /// Hook after a successful initialize.
    async fn after_initialize(&mut self, _ctx: &mut MeasurementContext) -> MeasurementResult<()> {
        Ok(())
    }

    /// Acquire data.
    async fn measure(
        &mut self,
        ctx: &mut MeasurementContext,
        instruments: &Instruments,
    ) -> MeasurementResult<()>;

    /// Hook before finalize.
    async fn before_finalize(&mut self, _ctx: &mut MeasurementContext) -> MeasurementResult<()> {
        Ok(())
    }

    /// Return instruments to a safe state.
    async fn finalize(
        &mut self,
        ctx: &mut MeasurementContext,
        instruments: &Instruments,
    ) -> MeasurementResult<()>;

    /// Hook after a successful finalize.
    async fn after_finalize(&mut self, _ctx: &mut MeasurementContext) -> MeasurementResult<()> {
        Ok(())
    }

    /// Analyze collected data.
    async fn analyze(&mut self, _ctx: &mut MeasurementContext) -> MeasurementResult<()> {
        Ok(())
    }
}

/// Parameters every measurement understands.
pub fn register_common(store: &mut ParameterStore) -> Result<(), ParameterError> {
    store.register(ParameterSpec::new("matrix_enabled").default(false))?;
    store.register(ParameterSpec::new("matrix_channels").default(ParameterValue::Array(Vec::new())))?;
    store.register(
        ParameterSpec::new("analysis_functions").default(ParameterValue::Array(Vec::new())),
    )?;
    Ok(())
}

/// Copy every resolvable parameter into the meta data, unit-converted values as numbers.
pub fn record_parameters(ctx: &mut MeasurementContext, store: &ParameterStore) {
    for spec in store.specs() {
        if spec.key == "analysis_functions" {
            continue;
        }
        if let Ok(value) = store.resolve(&spec.key) {
            let value = serde_json::to_value(&value).unwrap_or(serde_json::Value::Null);
            ctx.data.set_meta(spec.key.clone(), value);
        }
    }
}

/// Run the configured analysis functions on two series and store their results.
///
/// Analysis only runs with more than one data point. Results are stored before the
/// limits are checked so an out-of-limit result is still written out.
pub fn analyze_series(
    ctx: &mut MeasurementContext,
    store: &ParameterStore,
    x_key: &str,
    y_key: &str,
) -> MeasurementResult<()> {
    if ctx.data.series_len() <= 1 {
        return Ok(());
    }
    let functions = AnalysisFunction::from_list(&store.resolve("analysis_functions")?)?;
    let x = ctx.data.get_series(x_key).to_vec();
    let y = ctx.data.get_series(y_key).to_vec();
    for function in functions {
        let result = function.call(&x, &y)?;
        ctx.data
            .set_analysis(function.type_name.clone(), analysis::result_to_value(&result));
        function.verify(&result)?;
    }
    Ok(())
}

/// Matrix channels to close, as strings.
pub fn matrix_channels(store: &ParameterStore) -> MeasurementResult<Vec<String>> {
    let value = store.resolve("matrix_channels")?;
    let items = value.as_array().ok_or(ParameterError::InvalidType {
        key: "matrix_channels".to_string(),
        expected: "list",
    })?;
    Ok(items.iter().map(ToString::to_string).collect())
}

/// How a source reacts to a compliance trip during a ramp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompliancePolicy {
    /// Fail the measurement with `Compliance`
    Fail,
    /// Stop the ramp gracefully and keep the data
    Accept,
}

impl CompliancePolicy {
    /// Policy from an `*_accept_compliance` flag.
    pub fn from_accept(accept: bool) -> Self {
        if accept {
            CompliancePolicy::Accept
        } else {
            CompliancePolicy::Fail
        }
    }
}

// =============================================================================
// Measurement Kinds and Registry
// =============================================================================

/// Built-in measurement types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeasurementKind {
    /// IV ramp on the HV source
    IvRamp,
    /// IV ramp on the V source read by the electrometer
    IvRampElm,
    /// IV ramp on the HV source with a V source bias
    IvRampBias,
    /// Bias IV ramp read by the electrometer
    IvRampBiasElm,
    /// CV ramp on the LCR bias source
    CvRamp,
    /// CV ramp biased by the V source
    CvRampVsrc,
    /// Frequency scan with HV source and LCR meter
    FrequencyScan,
}

impl MeasurementKind {
    /// All built-in kinds.
    pub const ALL: [MeasurementKind; 7] = [
        MeasurementKind::IvRamp,
        MeasurementKind::IvRampElm,
        MeasurementKind::IvRampBias,
        MeasurementKind::IvRampBiasElm,
        MeasurementKind::CvRamp,
        MeasurementKind::CvRampVsrc,
        MeasurementKind::FrequencyScan,
    ];

    /// Type name used in sequences.
    pub fn type_name(&self) -> &'static str {
        match self {
            MeasurementKind::IvRamp => iv_ramp::IvRamp::TYPE,
            MeasurementKind::IvRampElm => iv_ramp_elm::IvRampElm::TYPE,
            MeasurementKind::IvRampBias => iv_ramp_bias::IvRampBias::TYPE,
            MeasurementKind::IvRampBiasElm => iv_ramp_bias::IvRampBias::ELM_TYPE,
            MeasurementKind::CvRamp => cv_ramp::CvRamp::TYPE,
            MeasurementKind::CvRampVsrc => cv_ramp_vsrc::CvRampVsrc::TYPE,
            MeasurementKind::FrequencyScan => frequency_scan::FrequencyScan::TYPE,
        }
    }

    /// Look up a kind by type name.
    pub fn from_type_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.type_name() == name)
    }

    /// Construct a measurement of this kind.
    pub fn create(&self, parameters: ParameterMap) -> MeasurementResult<Box<dyn Measurement>> {
        Ok(match self {
            MeasurementKind::IvRamp => Box::new(iv_ramp::IvRamp::new(parameters)?),
            MeasurementKind::IvRampElm => Box::new(iv_ramp_elm::IvRampElm::new(parameters)?),
            MeasurementKind::IvRampBias => Box::new(iv_ramp_bias::IvRampBias::new(parameters)?),
            MeasurementKind::IvRampBiasElm => {
                Box::new(iv_ramp_bias::IvRampBias::with_electrometer(parameters)?)
            }
            MeasurementKind::CvRamp => Box::new(cv_ramp::CvRamp::new(parameters)?),
            MeasurementKind::CvRampVsrc => Box::new(cv_ramp_vsrc::CvRampVsrc::new(parameters)?),
            MeasurementKind::FrequencyScan => {
                Box::new(frequency_scan::FrequencyScan::new(parameters)?)
            }
        })
    }
}

impl fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

/// Constructor stored in the registry.
pub type MeasurementFactory =
    Arc<dyn Fn(ParameterMap) -> MeasurementResult<Box<dyn Measurement>> + Send + Sync>;

/// Maps type names to constructors.
#[derive(Clone, Default)]
pub struct MeasurementRegistry {
    factories: IndexMap<String, MeasurementFactory>,
}

impl MeasurementRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in kind.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        for kind in MeasurementKind::ALL {
            registry.register(kind.type_name(), move |parameters| kind.create(parameters));
        }
        registry
    }

    /// Register or replace a constructor.
    pub fn register<F>(&mut self, type_name: impl Into<String>, factory: F)
    where
        F: Fn(ParameterMap) -> MeasurementResult<Box<dyn Measurement>> + Send + Sync + 'static,
    {
        self.factories.insert(type_name.into(), Arc::new(factory));
    }

    /// True if `type_name` is registered.
    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    /// Registered type names.
    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Construct a measurement.
    pub fn create(
        &self,
        type_name: &str,
        parameters: ParameterMap,
    ) -> MeasurementResult<Box<dyn Measurement>> {
        let factory = self
            .factories
            .get(type_name)
            .ok_or_else(|| MeasurementError::UnknownType(type_name.to_string()))?;
        factory(parameters)
    }

    /// Check that every measurement type used by enabled nodes is registered.
    pub fn validate_tree(&self, tree: &SequenceTree) -> PqcResult<()> {
        let unknown: Vec<&str> = tree
            .samples
            .iter()
            .flat_map(|sample| &sample.contacts)
            .flat_map(|contact| &contact.measurements)
            .filter(|node| node.enabled && !self.contains(&node.type_name))
            .map(|node| node.type_name.as_str())
            .collect();
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(PqcError::Configuration(format!(
                "Unknown measurement types: {}",
                unknown.join(", ")
            )))
        }
    }
}
