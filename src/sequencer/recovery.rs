//! Bringing the station into a safe state before and after a run.
//!
//! | step                      | initialize | finalize  |
//! |---------------------------|------------|-----------|
//! | test LED (environ only)   | fatal      | logged    |
//! | HV source ramp down       | fatal      | logged    |
//! | V source ramp down        | logged     | logged    |
//! | discharge (environ only)  | logged     | -         |
//! | open matrix channels      | fatal      | fatal     |
//!
//! Instruments missing from the station are skipped.

use tracing::{error, info};

use crate::error::{InstrumentError, InstrumentResult, PqcError, PqcResult};
use crate::events::EventSender;
use crate::hardware::{Instrument, InstrumentRole, SourceMeter, Station};
use crate::utils::ramp::{safe_ramp_step, LinearRange};

/// Ramp a source that is still on down to zero and switch it off.
///
/// The step is `|V| / 100` limited to 5..25 V, without settle time.
pub async fn ramp_down_source(source: &dyn SourceMeter) -> InstrumentResult<()> {
    if !source.output_enabled().await? {
        return Ok(());
    }
    let voltage = source.voltage_level().await?;
    info!(instrument = source.name(), voltage, "Ramping down source");
    for level in LinearRange::new(voltage, 0.0, safe_ramp_step(voltage)) {
        source.set_voltage_level(level).await?;
    }
    source.set_output_enabled(false).await
}

async fn recover_source(
    station: &Station,
    role: InstrumentRole,
    label: &str,
    events: &EventSender,
) -> InstrumentResult<()> {
    if !station.has(role) {
        return Ok(());
    }
    let source = match role {
        InstrumentRole::VSource => station.vsrc()?,
        _ => station.hvsrc()?,
    };
    events.message(format!("Ramping down {label}..."));
    ramp_down_source(&*source).await?;
    events.message(format!("Initialized {label}."));
    Ok(())
}

async fn set_test_led(station: &Station, enabled: bool) -> InstrumentResult<()> {
    if !station.has(InstrumentRole::Environment) {
        return Ok(());
    }
    station.environ()?.set_test_led(enabled).await
}

async fn discharge_decoupling(station: &Station, events: &EventSender) -> InstrumentResult<()> {
    if !station.has(InstrumentRole::Environment) {
        return Ok(());
    }
    events.message("Auto-discharging decoupling box...");
    station.environ()?.discharge().await?;
    events.message("Auto-discharged decoupling box.");
    Ok(())
}

/// Open every matrix channel and verify none stays closed.
pub async fn recover_matrix(station: &Station, events: &EventSender) -> PqcResult<()> {
    if !station.has(InstrumentRole::Matrix) {
        return Ok(());
    }
    events.message("Open all matrix channels...");
    let matrix = station.matrix()?;
    matrix.open_all_channels().await?;
    let channels = matrix.closed_channels().await?;
    info!(channels = ?channels, "Matrix channels");
    if !channels.is_empty() {
        return Err(PqcError::MatrixChannelsClosed(channels));
    }
    events.message("Opened all matrix channels.");
    Ok(())
}

fn recovery_error(instrument: &str, source: InstrumentError) -> PqcError {
    PqcError::Recovery {
        instrument: instrument.to_string(),
        source,
    }
}

/// Safe state before processing any node.
pub async fn safe_initialize(
    station: &Station,
    use_environ: bool,
    events: &EventSender,
) -> PqcResult<()> {
    if use_environ {
        set_test_led(station, true).await.map_err(|err| {
            error!(error = %err, "Unable to connect with environment box (test LED ON)");
            recovery_error("environ", err)
        })?;
    }
    recover_source(station, InstrumentRole::HvSource, "HV Source", events)
        .await
        .map_err(|err| {
            error!(error = %err, "Unable to connect with HV Source");
            recovery_error("hvsrc", err)
        })?;
    if let Err(err) = recover_source(station, InstrumentRole::VSource, "V Source", events).await {
        error!(error = %err, "Unable to connect with V Source");
    }
    if use_environ {
        if let Err(err) = discharge_decoupling(station, events).await {
            error!(error = %err, "Unable to connect with environment box (discharge decoupling)");
        }
    }
    recover_matrix(station, events).await.map_err(|err| {
        error!(error = %err, "Unable to connect with Matrix");
        err
    })
}

/// Safe state after processing, best effort except for the matrix.
pub async fn safe_finalize(
    station: &Station,
    use_environ: bool,
    events: &EventSender,
) -> PqcResult<()> {
    if let Err(err) = recover_source(station, InstrumentRole::HvSource, "HV Source", events).await {
        error!(error = %err, "Unable to connect with HV Source");
    }
    if let Err(err) = recover_source(station, InstrumentRole::VSource, "V Source", events).await {
        error!(error = %err, "Unable to connect with V Source");
    }
    let matrix = recover_matrix(station, events).await;
    if let Err(err) = &matrix {
        error!(error = %err, "Unable to connect with Matrix");
    }
    if use_environ {
        if let Err(err) = set_test_led(station, false).await {
            error!(error = %err, "Unable to connect with environment box (test LED OFF)");
        }
    }
    matrix
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockEnvironmentBox, MockSourceMeter, MockSwitchMatrix};
    use std::sync::Arc;

    #[tokio::test]
    async fn biased_source_is_ramped_down_in_safe_steps() {
        let hvsrc = Arc::new(MockSourceMeter::new("hvsrc"));
        hvsrc.force_output(-1000.0).await;
        ramp_down_source(&*hvsrc).await.unwrap();
        let history = hvsrc.history().await;
        assert_eq!(history.len(), 101);
        assert_eq!(history[1], -990.0);
        assert_eq!(history.last(), Some(&0.0));
        assert!(!hvsrc.output_enabled().await.unwrap());
    }

    #[tokio::test]
    async fn source_off_is_left_alone() {
        let vsrc = MockSourceMeter::new("vsrc");
        ramp_down_source(&vsrc).await.unwrap();
        assert!(vsrc.history().await.is_empty());
    }

    #[tokio::test]
    async fn hv_failure_is_fatal_on_initialize_only() {
        let hvsrc = Arc::new(MockSourceMeter::new("hvsrc"));
        hvsrc
            .set_failure(Some(InstrumentError::Timeout {
                instrument: "hvsrc".into(),
            }))
            .await;
        let station = Station::new().with_hvsrc(hvsrc);
        let events = EventSender::disabled();
        assert!(matches!(
            safe_initialize(&station, false, &events).await,
            Err(PqcError::Recovery { .. })
        ));
        assert!(safe_finalize(&station, false, &events).await.is_ok());
    }

    #[tokio::test]
    async fn v_source_failure_is_logged_only() {
        let vsrc = Arc::new(MockSourceMeter::new("vsrc"));
        vsrc.set_failure(Some(InstrumentError::device("vsrc", "no response")))
            .await;
        let station = Station::new()
            .with_hvsrc(Arc::new(MockSourceMeter::new("hvsrc")))
            .with_vsrc(vsrc);
        assert!(safe_initialize(&station, false, &EventSender::disabled()).await.is_ok());
    }

    #[tokio::test]
    async fn stuck_matrix_channel_is_fatal_both_ways() {
        let matrix = Arc::new(MockSwitchMatrix::new("matrix"));
        matrix.set_stuck(&["1A01"]).await;
        let station = Station::new().with_matrix(matrix);
        let events = EventSender::disabled();
        assert!(matches!(
            safe_initialize(&station, false, &events).await,
            Err(PqcError::MatrixChannelsClosed(ref c)) if c == &["1A01".to_string()]
        ));
        assert!(safe_finalize(&station, false, &events).await.is_err());
    }

    #[tokio::test]
    async fn environment_steps_follow_use_environ() {
        let environ = Arc::new(MockEnvironmentBox::new("environ"));
        let station = Station::new().with_environ(environ.clone());
        let events = EventSender::disabled();

        safe_initialize(&station, false, &events).await.unwrap();
        assert!(!environ.test_led().await);
        assert_eq!(environ.discharges().await, 0);

        safe_initialize(&station, true, &events).await.unwrap();
        assert!(environ.test_led().await);
        assert_eq!(environ.discharges().await, 1);

        safe_finalize(&station, true, &events).await.unwrap();
        assert!(!environ.test_led().await);

        environ
            .set_led_failure(Some(InstrumentError::device("environ", "offline")))
            .await;
        assert!(safe_initialize(&station, true, &events).await.is_err());
    }
}
