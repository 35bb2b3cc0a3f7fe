//! Integration tests for the sequence executor.
//!
//! Runs complete sequence trees against mock stations and checks states, retries,
//! abort handling, table moves, recovery and the files written per measurement.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rust_pqc::error::{InstrumentError, MeasurementError};
use rust_pqc::events::drain;
use rust_pqc::hardware::mock::{MockSourceMeter, MockSwitchMatrix, MockTable};
use rust_pqc::hardware::{SourceMeter, Station};
use rust_pqc::log_capture::LogSink;
use rust_pqc::measurement::{MeasurementData, MeasurementKind, MeasurementRegistry};
use rust_pqc::sequence::{Contact, MeasurementNode, Position, Sample};
use rust_pqc::{
    Config, EventSender, ExecutorEvent, ItemState, NodePath, PqcError, SequenceExecutor,
    SequenceTree,
};
use tempfile::tempdir;
use tokio_test::{assert_err, assert_ok};
use tracing_subscriber::layer::SubscriberExt;

// =============================================================================
// Fixtures
// =============================================================================

fn test_config(output_dir: &Path) -> Config {
    Config {
        output_dir: output_dir.to_path_buf(),
        operator: "Monty".to_string(),
        write_logfiles: false,
        ..Config::default()
    }
}

fn iv_ramp(id: &str) -> MeasurementNode {
    MeasurementNode::new(id, id.to_uppercase(), "iv_ramp")
        .with_parameter("voltage_start", "0 V")
        .with_parameter("voltage_stop", "10 V")
        .with_parameter("voltage_step", "2 V")
        .with_parameter("waiting_time", "0 s")
        .with_parameter("waiting_time_before", "0 s")
        .with_parameter("waiting_time_after", "0 s")
        .with_parameter("hvsrc_current_compliance", "1 uA")
}

fn flute(measurements: Vec<MeasurementNode>) -> Contact {
    measurements.into_iter().fold(
        Contact::new("flute_1", "Flute 1").with_position(Position::new(10.0, 20.0, 1.0)),
        Contact::with_measurement,
    )
}

fn single_sample(contact: Contact) -> SequenceTree {
    SequenceTree::new(vec![Sample::new("HM 01", "PQCFlutesLeft").with_contact(contact)])
}

fn hv_station() -> (Arc<MockSourceMeter>, Station) {
    let hvsrc = Arc::new(MockSourceMeter::new("hvsrc"));
    let station = Station::new().with_hvsrc(hvsrc.clone());
    (hvsrc, station)
}

fn files_with_suffix(dir: &Path, suffix: &str) -> Vec<std::path::PathBuf> {
    let mut files: Vec<_> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok().map(|entry| entry.path()))
                .filter(|path| path.to_string_lossy().ends_with(suffix))
                .collect()
        })
        .unwrap_or_default();
    files.sort();
    files
}

fn count_failed(events: &[ExecutorEvent]) -> usize {
    events
        .iter()
        .filter(|event| matches!(event, ExecutorEvent::Failed(_)))
        .count()
}

/// Registry where `type_name` counts constructions and delegates to the IV ramp.
fn counted_iv(registry: &mut MeasurementRegistry, type_name: &str, counter: Arc<AtomicUsize>) {
    registry.register(type_name, move |parameters| {
        counter.fetch_add(1, Ordering::SeqCst);
        MeasurementKind::IvRamp.create(parameters)
    });
}

// =============================================================================
// End to end
// =============================================================================

#[tokio::test(start_paused = true)]
async fn iv_ramp_end_to_end() -> Result<()> {
    let dir = tempdir()?;
    let (hvsrc, station) = hv_station();
    let table = Arc::new(MockTable::new());
    let station = station.with_table(table.clone());
    let config = Config {
        serialize_txt: true,
        move_to_contact: true,
        ..test_config(dir.path())
    };
    let mut tree = single_sample(flute(vec![iv_ramp("iv")]));
    let (events, mut rx) = EventSender::channel();
    let mut executor = SequenceExecutor::new(config, station).with_events(events);

    assert_ok!(executor.run(&mut tree, NodePath::Root).await);

    assert_eq!(tree.state, Some(ItemState::Success));
    assert_eq!(tree.samples[0].state, Some(ItemState::Success));
    assert_eq!(tree.state(NodePath::Contact(0, 0)), Some(ItemState::Success));
    assert_eq!(tree.state(NodePath::Measurement(0, 0, 0)), Some(ItemState::Success));
    assert_eq!(table.moves().await, vec![Position::new(10.0, 20.0, 1.0)]);
    assert_eq!(executor.table_position().get(), Some(Position::new(10.0, 20.0, 1.0)));
    assert!(!hvsrc.output_enabled().await?);

    let sample_dir = dir.path().join("HM_01");
    let json = files_with_suffix(&sample_dir, ".json");
    assert_eq!(json.len(), 1);
    let name = json[0].file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    assert!(name.starts_with("HM_01_PQCFlutesLeft_flute_1_iv_"));
    let data = MeasurementData::from_json(&std::fs::read_to_string(&json[0])?)?;
    assert_eq!(data.get_series("voltage"), &[0.0, 2.0, 4.0, 6.0, 8.0, 10.0]);
    assert_eq!(data.meta["sample_name"], "HM 01");
    assert_eq!(data.meta["operator"], "Monty");
    assert_eq!(data.meta["table_position"], serde_json::json!([10.0, 20.0, 1.0]));
    assert_eq!(files_with_suffix(&sample_dir, ".txt").len(), 1);

    let events = drain(&mut rx);
    assert_eq!(count_failed(&events), 0);
    assert!(matches!(events.last(), Some(ExecutorEvent::Finished)));
    let summaries: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            ExecutorEvent::Summary(record) => Some(record),
            _ => None,
        })
        .collect();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].measurement_state, ItemState::Success);
    assert_eq!(summaries[0].contact_name, "Flute 1");
    assert!(events.iter().any(|event| matches!(
        event,
        ExecutorEvent::SaveImage { filename, .. } if filename.to_string_lossy().ends_with(".png")
    )));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn after_position_is_reached_once_processing_completes() -> Result<()> {
    let dir = tempdir()?;
    let (_, station) = hv_station();
    let table = Arc::new(MockTable::new());
    let park = Position::new(0.0, 0.0, 0.0);
    let config = Config {
        move_to_contact: true,
        move_to_after_position: Some(park),
        ..test_config(dir.path())
    };
    let mut tree = single_sample(flute(vec![iv_ramp("iv")]));
    let mut executor = SequenceExecutor::new(config, station.with_table(table.clone()));

    assert_ok!(executor.run(&mut tree, NodePath::Sample(0)).await);
    assert_eq!(table.moves().await, vec![Position::new(10.0, 20.0, 1.0), park]);
    assert_eq!(executor.table_position().get(), Some(park));
    Ok(())
}

// =============================================================================
// Retries
// =============================================================================

#[tokio::test(start_paused = true)]
async fn only_failed_analysis_is_remeasured() -> Result<()> {
    let dir = tempdir()?;
    let (_, station) = hv_station();
    let good_runs = Arc::new(AtomicUsize::new(0));
    let bad_runs = Arc::new(AtomicUsize::new(0));

    let mut registry = MeasurementRegistry::with_builtin();
    counted_iv(&mut registry, "counted_iv", good_runs.clone());
    let counter = bad_runs.clone();
    registry.register("bad_fit", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(MeasurementError::Analysis("slope out of range".into()))
    });

    let mut first = iv_ramp("iv1");
    first.type_name = "counted_iv".into();
    let mut third = iv_ramp("iv3");
    third.type_name = "counted_iv".into();
    let mut tree = single_sample(flute(vec![
        first,
        MeasurementNode::new("fit", "Fit", "bad_fit"),
        third,
    ]));

    let config = Config {
        retry_measurement_count: 2,
        ..test_config(dir.path())
    };
    let (events, mut rx) = EventSender::channel();
    let mut executor = SequenceExecutor::new(config, station)
        .with_registry(registry)
        .with_events(events);
    assert_ok!(executor.run(&mut tree, NodePath::Contact(0, 0)).await);

    assert_eq!(good_runs.load(Ordering::SeqCst), 2);
    assert_eq!(bad_runs.load(Ordering::SeqCst), 3);
    let contact = &tree.samples[0].contacts[0];
    assert_eq!(contact.state, Some(ItemState::Error));
    assert_eq!(contact.recontact, 0);
    assert_eq!(contact.measurements[0].state, Some(ItemState::Success));
    assert_eq!(contact.measurements[1].state, Some(ItemState::AnalysisError));
    assert_eq!(contact.measurements[1].remeasure, 2);
    assert_eq!(contact.measurements[2].state, Some(ItemState::Success));

    let remeasures: Vec<u32> = drain(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            ExecutorEvent::ItemRemeasure { count, .. } => Some(count),
            _ => None,
        })
        .collect();
    assert_eq!(remeasures, vec![1, 2]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn recontact_with_overdrive_recovers_failed_analysis() -> Result<()> {
    let dir = tempdir()?;
    let (_, station) = hv_station();
    let table = Arc::new(MockTable::new());
    let attempts = Arc::new(AtomicUsize::new(0));
    let mut registry = MeasurementRegistry::with_builtin();
    let counter = attempts.clone();
    registry.register("flaky_fit", move |parameters| {
        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
            Err(MeasurementError::Analysis("slope out of range".into()))
        } else {
            MeasurementKind::IvRamp.create(parameters)
        }
    });
    let mut node = iv_ramp("iv");
    node.type_name = "flaky_fit".into();
    let mut tree = single_sample(flute(vec![node]));

    let config = Config {
        move_to_contact: true,
        table_contact_delay: Duration::ZERO,
        retry_contact_count: 2,
        retry_measurement_count: 0,
        retry_contact_overdrive: 0.5,
        ..test_config(dir.path())
    };
    let (events, mut rx) = EventSender::channel();
    let mut executor = SequenceExecutor::new(config, station.with_table(table.clone()))
        .with_registry(registry)
        .with_events(events);
    assert_ok!(executor.run(&mut tree, NodePath::Root).await);

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let contact = &tree.samples[0].contacts[0];
    assert_eq!(contact.state, Some(ItemState::Success));
    assert_eq!(contact.recontact, 2);
    assert_eq!(contact.measurements[0].state, Some(ItemState::Success));
    let overdriven = Position::new(10.0, 20.0, 1.5);
    assert_eq!(
        table.moves().await,
        vec![Position::new(10.0, 20.0, 1.0), overdriven, overdriven]
    );
    assert_eq!(executor.table_position().get(), Some(overdriven));

    let recontacts: Vec<u32> = drain(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            ExecutorEvent::ItemRecontact { count, .. } => Some(count),
            _ => None,
        })
        .collect();
    assert_eq!(recontacts, vec![1, 2]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn non_analysis_failures_are_not_retried() -> Result<()> {
    let dir = tempdir()?;
    let (_, station) = hv_station();
    let runs = Arc::new(AtomicUsize::new(0));
    let mut registry = MeasurementRegistry::with_builtin();
    let counter = runs.clone();
    registry.register("broken", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(MeasurementError::Compliance("hvsrc".into()))
    });
    let config = Config {
        retry_contact_count: 2,
        retry_measurement_count: 2,
        ..test_config(dir.path())
    };
    let mut tree = single_sample(flute(vec![MeasurementNode::new("b", "Broken", "broken")]));
    let mut executor = SequenceExecutor::new(config, station).with_registry(registry);

    assert_ok!(executor.run(&mut tree, NodePath::Root).await);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(tree.state(NodePath::Measurement(0, 0, 0)), Some(ItemState::Compliance));
    // A failed measurement does not fail the contact unless it is pending for retry.
    assert_eq!(tree.state(NodePath::Contact(0, 0)), Some(ItemState::Success));
    Ok(())
}

// =============================================================================
// Abort
// =============================================================================

#[tokio::test(start_paused = true)]
async fn abort_stops_remaining_siblings() -> Result<()> {
    let dir = tempdir()?;
    let (hvsrc, station) = hv_station();
    let (events, mut rx) = EventSender::channel();
    let mut executor =
        SequenceExecutor::new(test_config(dir.path()), station).with_events(events);
    let abort = executor.abort_handle();

    let mut registry = MeasurementRegistry::with_builtin();
    registry.register("aborting_iv", move |parameters| {
        abort.abort_with_reason("operator pressed stop");
        MeasurementKind::IvRamp.create(parameters)
    });
    executor = executor.with_registry(registry);

    let mut second = iv_ramp("iv2");
    second.type_name = "aborting_iv".into();
    let mut tree = SequenceTree::new(vec![
        Sample::new("HM 01", "A").with_contact(flute(vec![iv_ramp("iv1"), second, iv_ramp("iv3")])),
        Sample::new("HM 02", "A").with_contact(flute(vec![iv_ramp("iv4")])),
    ]);

    assert_ok!(executor.run(&mut tree, NodePath::Root).await);

    assert_eq!(tree.state(NodePath::Measurement(0, 0, 0)), Some(ItemState::Success));
    assert_eq!(tree.state(NodePath::Measurement(0, 0, 1)), Some(ItemState::Stopped));
    assert_eq!(tree.state(NodePath::Measurement(0, 0, 2)), Some(ItemState::Stopped));
    assert_eq!(tree.state(NodePath::Contact(0, 0)), Some(ItemState::Stopped));
    assert_eq!(tree.state(NodePath::Sample(0)), Some(ItemState::Stopped));
    assert_eq!(tree.state(NodePath::Sample(1)), Some(ItemState::Stopped));
    assert_eq!(tree.state(NodePath::Measurement(1, 0, 0)), None);
    assert_eq!(tree.state, Some(ItemState::Stopped));
    assert!(!hvsrc.output_enabled().await?);
    assert!(!executor.abort_handle().is_aborted());

    // The measurement running at abort time still writes its results; its siblings do not.
    let json = files_with_suffix(&dir.path().join("HM_01"), ".json");
    let names: Vec<String> = json
        .iter()
        .filter_map(|path| path.file_name().map(|n| n.to_string_lossy().into_owned()))
        .collect();
    assert_eq!(names.len(), 2);
    assert!(names.iter().any(|name| name.contains("_iv1_")));
    assert!(names.iter().any(|name| name.contains("_iv2_")));
    assert!(!dir.path().join("HM_02").exists());
    let stopped = MeasurementData::from_json(&std::fs::read_to_string(
        json.iter()
            .find(|path| path.to_string_lossy().contains("_iv2_"))
            .ok_or_else(|| anyhow::anyhow!("no result file for iv2"))?,
    )?)?;
    assert_eq!(stopped.meta["measurement_name"], "IV2");

    let summaries: Vec<(String, ItemState)> = drain(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            ExecutorEvent::Summary(record) => {
                Some((record.measurement_name, record.measurement_state))
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        summaries,
        vec![
            ("IV1".to_string(), ItemState::Success),
            ("IV2".to_string(), ItemState::Stopped),
        ]
    );
    Ok(())
}

// =============================================================================
// Table and positions
// =============================================================================

#[tokio::test(start_paused = true)]
async fn table_timeout_keeps_cached_position() -> Result<()> {
    let dir = tempdir()?;
    let (_, station) = hv_station();
    let table = Arc::new(MockTable::new());
    table.stall().await;
    let config = Config {
        move_to_contact: true,
        table_move_timeout: Duration::from_secs(5),
        ..test_config(dir.path())
    };
    let mut tree = single_sample(flute(vec![iv_ramp("iv")]));
    let (events, mut rx) = EventSender::channel();
    let mut executor = SequenceExecutor::new(config, station.with_table(table))
        .with_events(events);

    let err = assert_err!(executor.run(&mut tree, NodePath::Root).await);
    assert!(matches!(err, PqcError::TableMoveTimeout(d) if d == Duration::from_secs(5)));
    assert_eq!(executor.table_position().get(), None);
    assert_eq!(tree.state(NodePath::Contact(0, 0)), Some(ItemState::Error));
    assert_eq!(tree.state(NodePath::Measurement(0, 0, 0)), None);

    let events = drain(&mut rx);
    assert_eq!(count_failed(&events), 1);
    assert!(matches!(events.last(), Some(ExecutorEvent::Finished)));
    Ok(())
}

#[tokio::test]
async fn missing_position_aborts_before_measuring() -> Result<()> {
    let dir = tempdir()?;
    let (hvsrc, station) = hv_station();
    let mut tree = single_sample(
        Contact::new("flute_2", "Flute 2").with_measurement(iv_ramp("iv")),
    );
    let mut executor = SequenceExecutor::new(test_config(dir.path()), station);

    let err = assert_err!(executor.run(&mut tree, NodePath::Root).await);
    assert!(matches!(err, PqcError::MissingPosition { ref contact, .. } if contact == "Flute 2"));
    assert_eq!(tree.state(NodePath::Measurement(0, 0, 0)), None);
    assert!(hvsrc.history().await.is_empty());
    Ok(())
}

// =============================================================================
// Recovery
// =============================================================================

#[tokio::test]
async fn failed_initialize_skips_processing_but_finalizes() -> Result<()> {
    let dir = tempdir()?;
    let (hvsrc, station) = hv_station();
    hvsrc
        .set_failure(Some(InstrumentError::Timeout {
            instrument: "hvsrc".into(),
        }))
        .await;
    let matrix = Arc::new(MockSwitchMatrix::new("matrix"));
    let station = station.with_matrix(matrix.clone());
    let mut tree = single_sample(flute(vec![iv_ramp("iv")]));
    let (events, mut rx) = EventSender::channel();
    let mut executor = SequenceExecutor::new(test_config(dir.path()), station).with_events(events);

    let err = assert_err!(executor.run(&mut tree, NodePath::Root).await);
    assert!(matches!(err, PqcError::Recovery { .. }));
    assert_eq!(tree.state(NodePath::Measurement(0, 0, 0)), None);
    // Only finalize reached the matrix.
    assert_eq!(matrix.open_calls().await, 1);

    let events = drain(&mut rx);
    assert_eq!(count_failed(&events), 1);
    assert!(events
        .iter()
        .any(|event| matches!(event, ExecutorEvent::Message(m) if m == "Measurement failed.")));
    assert!(matches!(events.last(), Some(ExecutorEvent::Finished)));
    Ok(())
}

// =============================================================================
// Log files
// =============================================================================

#[tokio::test(start_paused = true)]
async fn measurement_log_file_is_written() -> Result<()> {
    let dir = tempdir()?;
    let (_, station) = hv_station();
    let sink = LogSink::new();
    let _subscriber =
        tracing::subscriber::set_default(tracing_subscriber::registry().with(sink.layer()));

    let config = Config {
        write_logfiles: true,
        ..test_config(dir.path())
    };
    let mut tree = single_sample(flute(vec![iv_ramp("iv")]));
    let mut executor = SequenceExecutor::new(config, station).with_log_sink(sink.clone());
    assert_ok!(executor.run(&mut tree, NodePath::Measurement(0, 0, 0)).await);

    let logs = files_with_suffix(&dir.path().join("HM_01"), ".log");
    assert_eq!(logs.len(), 1);
    let text = std::fs::read_to_string(&logs[0])?;
    assert!(text.contains(":INFO:"));
    assert!(text.contains("Measure iv_ramp... done."));
    assert!(text.contains("Finalize iv_ramp... done."));
    assert!(sink.current_path().is_none());
    Ok(())
}
