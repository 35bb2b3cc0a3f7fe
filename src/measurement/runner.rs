//! Execution harness for a single measurement.
//!
//! The runner acquires every instrument the measurement needs, drives the lifecycle and
//! releases the instruments on all exit paths (the handles drop when `run` returns).
//!
//! # Error precedence
//!
//! Finalize runs even if initialize or measure failed, and analyze runs even if finalize
//! failed. When several stages fail, the error reported is, in order: the analyze error,
//! the finalize error, then the initialize/measure error.

use tracing::{error, info, instrument};

use crate::error::{MeasurementError, MeasurementResult};
use crate::hardware::{Instrument, InstrumentRole, Instruments, Station};
use crate::measurement::context::MeasurementContext;
use crate::measurement::{matrix_channels, Measurement};

/// Runs measurements against a station.
#[derive(Clone)]
pub struct MeasurementRunner {
    station: Station,
}

impl MeasurementRunner {
    /// Runner over `station`.
    pub fn new(station: Station) -> Self {
        Self { station }
    }

    /// Roles held for the whole lifecycle.
    pub fn roles(
        measurement: &dyn Measurement,
        use_environ: bool,
        matrix_enabled: bool,
    ) -> Vec<InstrumentRole> {
        let mut roles = measurement.required_instruments();
        if use_environ {
            roles.push(InstrumentRole::Environment);
        }
        if matrix_enabled {
            roles.push(InstrumentRole::Matrix);
        }
        let mut unique = Vec::with_capacity(roles.len());
        for role in roles {
            if !unique.contains(&role) {
                unique.push(role);
            }
        }
        unique
    }

    /// Run the full lifecycle of `measurement`.
    ///
    /// Fails with [`MeasurementError::ResourceUnavailable`] before any stage runs if an
    /// instrument is missing or busy.
    #[instrument(skip_all, fields(measurement_type = measurement.type_name()))]
    pub async fn run(
        &self,
        measurement: &mut dyn Measurement,
        ctx: &mut MeasurementContext,
    ) -> MeasurementResult<()> {
        let matrix_enabled = measurement.parameters().get_bool("matrix_enabled")?;
        let roles = Self::roles(measurement, ctx.use_environ(), matrix_enabled);
        let instruments = self.station.acquire_all(&roles)?;

        let primary = initialize_and_measure(measurement, ctx, &instruments, matrix_enabled).await;
        let finalized = finalize(measurement, ctx, &instruments, matrix_enabled).await;
        let analyzed = analyze(measurement, ctx).await;
        drop(instruments);

        analyzed?;
        finalized?;
        primary
    }
}

fn log_stage<T>(stage: &str, type_name: &str, result: MeasurementResult<T>) -> MeasurementResult<T> {
    match &result {
        Ok(_) => info!("{stage} {type_name}... done."),
        Err(err) => error!(error = %err, "{stage} {type_name}... failed."),
    }
    result
}

async fn initialize_and_measure(
    measurement: &mut dyn Measurement,
    ctx: &mut MeasurementContext,
    instruments: &Instruments,
    matrix_enabled: bool,
) -> MeasurementResult<()> {
    let type_name = measurement.type_name();

    info!("Initialize {type_name}...");
    let initialized = initialize(measurement, ctx, instruments, matrix_enabled).await;
    log_stage("Initialize", type_name, initialized)?;

    info!("Measure {type_name}...");
    let measured = measurement.measure(ctx, instruments).await;
    log_stage("Measure", type_name, measured)
}

async fn initialize(
    measurement: &mut dyn Measurement,
    ctx: &mut MeasurementContext,
    instruments: &Instruments,
    matrix_enabled: bool,
) -> MeasurementResult<()> {
    measurement.before_initialize(ctx).await?;
    if matrix_enabled {
        let channels = matrix_channels(measurement.parameters())?;
        setup_matrix(instruments, &channels).await?;
    }
    measurement.initialize(ctx, instruments).await?;
    measurement.after_initialize(ctx).await
}

async fn finalize(
    measurement: &mut dyn Measurement,
    ctx: &mut MeasurementContext,
    instruments: &Instruments,
    matrix_enabled: bool,
) -> MeasurementResult<()> {
    let type_name = measurement.type_name();
    info!("Finalize {type_name}...");
    let mut result = measurement.before_finalize(ctx).await;
    let finalized = measurement.finalize(ctx, instruments).await;
    result = result.and(finalized);
    if matrix_enabled {
        result = result.and(reset_matrix(instruments).await);
    }
    if result.is_ok() {
        result = measurement.after_finalize(ctx).await;
    }
    log_stage("Finalize", type_name, result)
}

async fn analyze(
    measurement: &mut dyn Measurement,
    ctx: &mut MeasurementContext,
) -> MeasurementResult<()> {
    let type_name = measurement.type_name();
    info!("Analyze {type_name}...");
    let result = measurement.analyze(ctx).await.map_err(|err| match err {
        MeasurementError::Analysis(_) => err,
        other => MeasurementError::Analysis(other.to_string()),
    });
    log_stage("Analyze", type_name, result)
}

/// Close the measurement's matrix channels, refusing to start from a dirty matrix.
async fn setup_matrix(instruments: &Instruments, channels: &[String]) -> MeasurementResult<()> {
    let matrix = instruments.matrix()?;
    info!(channels = ?channels, "Setup matrix...");
    let closed = matrix.closed_channels().await?;
    if !closed.is_empty() {
        return Err(MeasurementError::Failed(format!(
            "Matrix channels still closed: {}",
            closed.join(", ")
        )));
    }
    matrix.close_channels(channels).await?;
    let mut closed = matrix.closed_channels().await?;
    let mut expected = channels.to_vec();
    closed.sort();
    expected.sort();
    if closed != expected {
        return Err(MeasurementError::Failed(format!(
            "{}: mismatch in closed channels",
            matrix.name()
        )));
    }
    Ok(())
}

async fn reset_matrix(instruments: &Instruments) -> MeasurementResult<()> {
    instruments.matrix()?.open_all_channels().await?;
    Ok(())
}
