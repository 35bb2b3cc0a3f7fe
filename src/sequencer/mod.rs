//! Sequence executor.
//!
//! The [`SequenceExecutor`] walks a [`SequenceTree`] from any starting node, moves the
//! table between contacts, runs each measurement through the [`MeasurementRunner`] and
//! writes result files. It runs as a single task holding `&mut self`; observers receive
//! [`ExecutorEvent`]s and may only request an abort through the [`AbortHandle`].
//!
//! # Lifecycle
//!
//! ```text
//! run(target)
//!   ├─ validate measurement types
//!   ├─ initialize   safe state, clears the abort flag
//!   ├─ process      root → samples → contacts → measurements
//!   ├─ finalize     safe state, clears the abort flag
//!   └─ Failed (once, on error) + Finished (always)
//! ```
//!
//! # Retries
//!
//! A contact is processed up to `retry_contact_count + 1` times. Every attempt runs up to
//! `retry_measurement_count + 1` passes over the pending measurements; only measurements
//! whose analysis failed stay pending. Re-contact attempts raise `z` by the configured
//! overdrive.

pub mod output;
pub mod recovery;
pub mod table;

use std::path::PathBuf;

use chrono::Utc;
use indexmap::IndexMap;
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::{error, info, info_span, warn, Instrument as _};
use uuid::Uuid;

use crate::abort::AbortHandle;
use crate::config::{Config, SharedPosition};
use crate::error::{MeasurementError, MeasurementResult, PqcError, PqcResult};
use crate::events::{EventSender, ExecutorEvent};
use crate::hardware::Station;
use crate::log_capture::{LogFileGuard, LogSink};
use crate::measurement::context::MeasurementContext;
use crate::measurement::runner::MeasurementRunner;
use crate::measurement::MeasurementRegistry;
use crate::sequence::{ItemState, NodePath, SequenceTree};
use output::{iso_timestamp, write_json, write_txt, ResultLocation, SummaryRecord};
use table::{add_retry_overdrive, apply_contact_delay, safe_move_table};

/// Names of the node a measurement belongs to, copied out of the tree.
struct MeasurementLabels {
    sample_name: String,
    sample_type: String,
    sample_comment: String,
    contact_id: String,
    contact_name: String,
    measurement_id: String,
    measurement_name: String,
    type_name: String,
}

impl MeasurementLabels {
    fn lookup(tree: &SequenceTree, s: usize, c: usize, m: usize) -> Option<Self> {
        let sample = tree.sample(s)?;
        let contact = tree.contact(s, c)?;
        let node = tree.measurement(s, c, m)?;
        Some(Self {
            sample_name: sample.name(),
            sample_type: sample.sample_type().to_string(),
            sample_comment: sample.comment.clone(),
            contact_id: contact.id.clone(),
            contact_name: contact.name.clone(),
            measurement_id: node.id.clone(),
            measurement_name: node.name.clone(),
            type_name: node.type_name.clone(),
        })
    }
}

/// Executes sequence trees against a station.
pub struct SequenceExecutor {
    config: Config,
    station: Station,
    registry: MeasurementRegistry,
    runner: MeasurementRunner,
    events: EventSender,
    abort: AbortHandle,
    table_position: SharedPosition,
    log_sink: Option<LogSink>,
}

impl SequenceExecutor {
    /// Executor with the built-in measurement types and no event observer.
    pub fn new(config: Config, station: Station) -> Self {
        Self {
            runner: MeasurementRunner::new(station.clone()),
            config,
            station,
            registry: MeasurementRegistry::with_builtin(),
            events: EventSender::disabled(),
            abort: AbortHandle::new(),
            table_position: SharedPosition::new(),
            log_sink: None,
        }
    }

    /// Send events to `events`.
    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = events;
        self
    }

    /// Replace the measurement registry.
    pub fn with_registry(mut self, registry: MeasurementRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Write per-measurement log files through `sink` when `write_logfiles` is set.
    ///
    /// The sink's layer must be installed in the tracing subscriber.
    pub fn with_log_sink(mut self, sink: LogSink) -> Self {
        self.log_sink = Some(sink);
        self
    }

    /// Handle for requesting an abort from another task.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Last position reached by the table.
    pub fn table_position(&self) -> SharedPosition {
        self.table_position.clone()
    }

    /// Active configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Process `target` and everything below it.
    ///
    /// Emits exactly one [`ExecutorEvent::Failed`] if the run fails and always ends with
    /// [`ExecutorEvent::Finished`]. Finalization runs whenever initialization was attempted.
    pub async fn run(&mut self, tree: &mut SequenceTree, target: NodePath) -> PqcResult<()> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id, ?target);
        let result = self.run_inner(tree, target).instrument(span).await;
        match &result {
            Ok(()) => self.events.message("Measurement done."),
            Err(err) => {
                error!(%run_id, error = %err, "Measurement failed.");
                self.events.message("Measurement failed.");
                self.events.emit(ExecutorEvent::Failed(err.to_string()));
            }
        }
        self.events.emit(ExecutorEvent::Finished);
        result
    }

    async fn run_inner(&self, tree: &mut SequenceTree, target: NodePath) -> PqcResult<()> {
        if !tree.contains(target) {
            return Err(PqcError::Configuration(format!("No such node: {target:?}")));
        }
        self.registry.validate_tree(tree)?;

        let mut result = self.initialize().await;
        if result.is_ok() {
            result = self.process(tree, target).await;
        }
        let finalized = self.finalize().await;
        if let (Err(primary), Err(finalize)) = (&result, &finalized) {
            warn!(error = %finalize, "Finalize failed after {primary}");
        }
        result.and(finalized)
    }

    async fn initialize(&self) -> PqcResult<()> {
        self.events.message("Initialize...");
        self.abort.reset();
        match recovery::safe_initialize(&self.station, self.config.use_environ, &self.events).await
        {
            Ok(()) => {
                self.events.message("Initialize... done.");
                Ok(())
            }
            Err(err) => {
                self.events.message("Initialize... failed.");
                Err(err)
            }
        }
    }

    async fn finalize(&self) -> PqcResult<()> {
        self.events.message("Finalize...");
        let result =
            recovery::safe_finalize(&self.station, self.config.use_environ, &self.events).await;
        self.abort.reset();
        match &result {
            Ok(()) => self.events.message("Finalize... done."),
            Err(_) => self.events.message("Finalize... failed."),
        }
        result
    }

    async fn process(&self, tree: &mut SequenceTree, target: NodePath) -> PqcResult<()> {
        match target {
            NodePath::Root => self.process_root(tree).await.map(drop),
            NodePath::Sample(s) => self.process_sample(tree, s).await.map(drop),
            NodePath::Contact(s, c) => self.process_contact(tree, s, c).await.map(drop),
            NodePath::Measurement(s, c, m) => {
                self.process_measurement(tree, s, c, m).await?;
                Ok(())
            }
        }
    }

    // =========================================================================
    // Tree levels
    // =========================================================================

    async fn process_root(&self, tree: &mut SequenceTree) -> PqcResult<ItemState> {
        self.events.message("Process samples...");
        self.set_state(tree, NodePath::Root, Some(ItemState::Processing));
        for s in 0..tree.samples.len() {
            if tree.is_runnable(NodePath::Sample(s)) {
                check_positions(tree, s)?;
            }
        }

        let mut failures = 0;
        for s in 0..tree.samples.len() {
            if self.abort.is_aborted() {
                self.mark_stopped(tree, NodePath::Sample(s));
                continue;
            }
            if !tree.is_runnable(NodePath::Sample(s)) {
                continue;
            }
            if self.process_sample(tree, s).await? != ItemState::Success {
                failures += 1;
            }
        }

        let state = self.aggregate_state(failures);
        self.set_state(tree, NodePath::Root, Some(state));
        if !self.abort.is_aborted() {
            self.move_to_after_position().await?;
        }
        Ok(state)
    }

    async fn process_sample(&self, tree: &mut SequenceTree, s: usize) -> PqcResult<ItemState> {
        let Some(sample) = tree.sample(s) else {
            return Ok(ItemState::Error);
        };
        let span = info_span!("sample", sample = %sample.name());
        self.sample_contacts(tree, s).instrument(span).await
    }

    async fn sample_contacts(&self, tree: &mut SequenceTree, s: usize) -> PqcResult<ItemState> {
        self.events.message("Process sample...");
        self.set_state(tree, NodePath::Sample(s), Some(ItemState::Processing));
        check_positions(tree, s)?;

        let contact_count = tree.sample(s).map_or(0, |sample| sample.contacts.len());
        let mut failures = 0;
        for c in 0..contact_count {
            if self.abort.is_aborted() {
                self.mark_stopped(tree, NodePath::Contact(s, c));
                continue;
            }
            if !tree.is_runnable(NodePath::Contact(s, c)) {
                continue;
            }
            if self.process_contact(tree, s, c).await? != ItemState::Success {
                failures += 1;
            }
        }

        let state = self.aggregate_state(failures);
        self.set_state(tree, NodePath::Sample(s), Some(state));
        if !self.abort.is_aborted() {
            self.move_to_after_position().await?;
        }
        Ok(state)
    }

    async fn process_contact(
        &self,
        tree: &mut SequenceTree,
        s: usize,
        c: usize,
    ) -> PqcResult<ItemState> {
        let Some(contact) = tree.contact(s, c) else {
            return Ok(ItemState::Error);
        };
        let span = info_span!("contact", contact = %contact.name);
        self.contact_attempts(tree, s, c).instrument(span).await
    }

    async fn contact_attempts(
        &self,
        tree: &mut SequenceTree,
        s: usize,
        c: usize,
    ) -> PqcResult<ItemState> {
        let path = NodePath::Contact(s, c);
        let mut pending: Vec<usize> = tree
            .contact(s, c)
            .map(|contact| {
                contact
                    .measurements
                    .iter()
                    .enumerate()
                    .filter(|(_, node)| node.enabled)
                    .map(|(m, _)| m)
                    .collect()
            })
            .unwrap_or_default();
        let mut state = if pending.is_empty() {
            ItemState::Success
        } else {
            ItemState::Error
        };

        for retry_contact in 0..=self.config.retry_contact_count {
            if pending.is_empty() {
                break;
            }
            if retry_contact > 0 {
                info!(
                    "Retry contact {retry_contact}/{}...",
                    self.config.retry_contact_count
                );
                if let Some(contact) = tree.contact_mut(s, c) {
                    contact.recontact += 1;
                    self.events.emit(ExecutorEvent::ItemRecontact {
                        path,
                        count: contact.recontact,
                    });
                }
            }

            self.events.message("Process contact...");
            self.set_state(tree, path, Some(ItemState::Processing));
            if let Err(err) = self.move_to_contact(tree, s, c, retry_contact > 0).await {
                self.set_state(tree, path, Some(ItemState::Error));
                return Err(err);
            }

            for retry_measurement in 0..=self.config.retry_measurement_count {
                if retry_measurement > 0 {
                    info!(
                        "Retry measurement {retry_measurement}/{}...",
                        self.config.retry_measurement_count
                    );
                }
                self.set_state(tree, path, Some(ItemState::Processing));
                pending = self
                    .process_measurement_sequence(tree, s, c, &pending, retry_measurement > 0)
                    .await;
                state = if self.abort.is_aborted() {
                    ItemState::Stopped
                } else if pending.is_empty() {
                    ItemState::Success
                } else {
                    ItemState::Error
                };
                self.set_state(tree, path, Some(state));
                if pending.is_empty() {
                    break;
                }
            }
        }
        Ok(state)
    }

    async fn move_to_contact(
        &self,
        tree: &SequenceTree,
        s: usize,
        c: usize,
        retry: bool,
    ) -> PqcResult<()> {
        let Some(contact) = tree.contact(s, c) else {
            return Ok(());
        };
        if !(self.config.move_to_contact && contact.has_position()) {
            return Ok(());
        }
        let mut position = contact.position;
        if retry {
            position = add_retry_overdrive(position, self.config.retry_contact_overdrive);
        }
        self.events.message("Moving to contact...");
        safe_move_table(
            self.station.table().as_ref(),
            position,
            self.config.table_move_timeout,
            &self.table_position,
            &self.events,
        )
        .await?;
        apply_contact_delay(self.config.table_contact_delay, &self.events).await;
        self.events.message("Moving to contact... done.");
        Ok(())
    }

    async fn move_to_after_position(&self) -> PqcResult<()> {
        let Some(position) = self.config.move_to_after_position else {
            return Ok(());
        };
        self.events.message("Moving to after position...");
        safe_move_table(
            self.station.table().as_ref(),
            position,
            self.config.table_move_timeout,
            &self.table_position,
            &self.events,
        )
        .await?;
        self.events.message("Moving to after position... done.");
        Ok(())
    }

    /// Run `items` in order and return those whose analysis failed.
    async fn process_measurement_sequence(
        &self,
        tree: &mut SequenceTree,
        s: usize,
        c: usize,
        items: &[usize],
        remeasure: bool,
    ) -> Vec<usize> {
        let mut failed = Vec::new();
        let mut previous: Option<NodePath> = None;
        for (index, &m) in items.iter().enumerate() {
            if self.abort.is_aborted() {
                for &rest in &items[index..] {
                    self.mark_stopped(tree, NodePath::Measurement(s, c, rest));
                }
                break;
            }
            let path = NodePath::Measurement(s, c, m);
            if !tree.is_runnable(path) {
                continue;
            }
            if remeasure {
                if let Some(node) = tree.measurement_mut(s, c, m) {
                    node.remeasure += 1;
                    self.events.emit(ExecutorEvent::ItemRemeasure {
                        path,
                        count: node.remeasure,
                    });
                }
            }
            if let Some(previous) = previous.take() {
                self.events.emit(ExecutorEvent::HideItem(previous));
            }
            if let Err(err) = self.process_measurement(tree, s, c, m).await {
                if err.is_retryable() {
                    failed.push(m);
                }
            }
            previous = Some(path);
        }
        if let Some(previous) = previous {
            self.events.emit(ExecutorEvent::HideItem(previous));
        }
        failed
    }

    // =========================================================================
    // Single measurement
    // =========================================================================

    async fn process_measurement(
        &self,
        tree: &mut SequenceTree,
        s: usize,
        c: usize,
        m: usize,
    ) -> MeasurementResult<()> {
        let path = NodePath::Measurement(s, c, m);
        let labels = MeasurementLabels::lookup(tree, s, c, m)
            .ok_or_else(|| MeasurementError::Failed(format!("No such measurement: {path:?}")))?;
        let span = info_span!(
            "measurement",
            sample = %labels.sample_name,
            contact = %labels.contact_name,
            measurement = %labels.measurement_name,
            measurement_type = %labels.type_name,
        );
        self.measure_node(tree, path, &labels).instrument(span).await
    }

    async fn measure_node(
        &self,
        tree: &mut SequenceTree,
        path: NodePath,
        labels: &MeasurementLabels,
    ) -> MeasurementResult<()> {
        let NodePath::Measurement(s, c, m) = path else {
            return Err(MeasurementError::Failed(format!("Not a measurement: {path:?}")));
        };
        self.events.message("Process measurement...");
        let parameters = match tree.measurement_mut(s, c, m) {
            Some(node) => {
                node.clear_results();
                node.effective_parameters()
            }
            None => return Err(MeasurementError::Failed(format!("No such measurement: {path:?}"))),
        };
        self.set_state(tree, path, Some(ItemState::Active));
        self.events.emit(ExecutorEvent::ShowItem(path));

        if !self.config.before_measurement_delay.is_zero() {
            sleep(self.config.before_measurement_delay).await;
        }

        let timestamp = Utc::now();
        let location = ResultLocation::new(
            &self.config.output_dir,
            &labels.sample_name,
            &labels.sample_type,
            &labels.contact_id,
            &labels.measurement_id,
            timestamp,
        );

        let mut ctx = MeasurementContext::new(
            path,
            self.events.clone(),
            self.abort.clone(),
            self.config.use_environ,
        )
        .with_initial_meta(self.initial_meta(labels, timestamp));
        ctx.reset_data();

        let result = async {
            tokio::fs::create_dir_all(location.directory()).await?;
            let _log_file = self.attach_log_file(location.filename(".log"));
            let mut measurement = self.registry.create(&labels.type_name, parameters)?;
            self.runner.run(measurement.as_mut(), &mut ctx).await
        }
        .await;

        let state = match &result {
            Ok(()) => {
                self.events.message("Process measurement... done.");
                if self.abort.is_aborted() {
                    ItemState::Stopped
                } else {
                    ItemState::Success
                }
            }
            Err(err) => {
                error!(error = %err, "Process measurement failed");
                self.events.message(match err {
                    MeasurementError::Analysis(_) => "Process measurement... analysis failed.",
                    _ => "Process measurement... failed.",
                });
                err.classify()
            }
        };
        self.set_state(tree, path, Some(state));
        if let Some(node) = tree.measurement_mut(s, c, m) {
            node.series = ctx.take_readings();
            node.analysis = ctx.data.analysis.clone();
        }

        self.events.emit(ExecutorEvent::SaveImage {
            path,
            filename: location.filename(".png"),
        });
        self.events.emit(ExecutorEvent::Summary(SummaryRecord {
            timestamp,
            sample_name: labels.sample_name.clone(),
            sample_type: labels.sample_type.clone(),
            contact_name: labels.contact_name.clone(),
            measurement_name: labels.measurement_name.clone(),
            measurement_state: state,
        }));
        if self.config.serialize_json {
            if let Err(err) = write_json(&location.filename(".json"), &ctx.data).await {
                error!(error = %err, "Failed to write JSON file");
            }
        }
        if self.config.serialize_txt {
            if let Err(err) = write_txt(&location.filename(".txt"), &ctx.data).await {
                error!(error = %err, "Failed to write TXT file");
            }
        }
        result
    }

    fn initial_meta(
        &self,
        labels: &MeasurementLabels,
        timestamp: chrono::DateTime<Utc>,
    ) -> IndexMap<String, Value> {
        let table_position = self
            .table_position
            .get()
            .map_or_else(|| json!([]), |p| json!([p.x, p.y, p.z]));
        IndexMap::from([
            ("uuid".to_string(), json!(Uuid::new_v4().to_string())),
            ("sample_name".to_string(), json!(labels.sample_name)),
            ("sample_type".to_string(), json!(labels.sample_type)),
            ("sample_comment".to_string(), json!(labels.sample_comment)),
            ("contact_name".to_string(), json!(labels.contact_name)),
            ("measurement_name".to_string(), json!(labels.measurement_name)),
            ("measurement_type".to_string(), json!(labels.type_name)),
            ("table_position".to_string(), table_position),
            ("start_timestamp".to_string(), json!(iso_timestamp(timestamp))),
            ("operator".to_string(), json!(self.config.operator)),
            ("pqc_version".to_string(), json!(env!("CARGO_PKG_VERSION"))),
        ])
    }

    fn attach_log_file(&self, path: PathBuf) -> Option<LogFileGuard> {
        if !self.config.write_logfiles {
            return None;
        }
        let sink = self.log_sink.as_ref()?;
        match sink.attach(&path) {
            Ok(guard) => Some(guard),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Unable to open log file");
                None
            }
        }
    }

    // =========================================================================
    // State helpers
    // =========================================================================

    fn set_state(&self, tree: &mut SequenceTree, path: NodePath, state: Option<ItemState>) {
        tree.set_state(path, state);
        self.events.emit(ExecutorEvent::ItemState { path, state });
    }

    fn mark_stopped(&self, tree: &mut SequenceTree, path: NodePath) {
        if tree.is_runnable(path) {
            self.set_state(tree, path, Some(ItemState::Stopped));
        }
    }

    fn aggregate_state(&self, failures: usize) -> ItemState {
        if self.abort.is_aborted() {
            ItemState::Stopped
        } else if failures == 0 {
            ItemState::Success
        } else {
            ItemState::Error
        }
    }
}

/// Every enabled contact of an enabled sample needs a position.
fn check_positions(tree: &SequenceTree, s: usize) -> PqcResult<()> {
    let Some(sample) = tree.sample(s) else {
        return Ok(());
    };
    match sample
        .contacts
        .iter()
        .find(|contact| contact.enabled && !contact.has_position())
    {
        Some(contact) => Err(PqcError::MissingPosition {
            sample: sample.name(),
            contact: contact.name.clone(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::drain;
    use crate::hardware::mock::{MockSourceMeter, MockTable};
    use crate::sequence::{Contact, MeasurementNode, Position, Sample};
    use std::sync::Arc;
    use std::time::Duration;

    fn quiet_config(output_dir: &std::path::Path) -> Config {
        Config {
            output_dir: output_dir.to_path_buf(),
            serialize_json: false,
            serialize_txt: false,
            ..Config::default()
        }
    }

    fn iv_node(id: &str) -> MeasurementNode {
        MeasurementNode::new(id, id.to_uppercase(), "iv_ramp")
            .with_parameter("voltage_start", "0 V")
            .with_parameter("voltage_stop", "10 V")
            .with_parameter("voltage_step", "2 V")
            .with_parameter("waiting_time", "0 s")
            .with_parameter("waiting_time_before", "0 s")
            .with_parameter("waiting_time_after", "0 s")
            .with_parameter("hvsrc_current_compliance", "1 uA")
    }

    fn station() -> Station {
        Station::new().with_hvsrc(Arc::new(MockSourceMeter::new("hvsrc")))
    }

    #[test]
    fn missing_position_is_reported_by_name() {
        let tree = SequenceTree::new(vec![
            Sample::new("HM", "A").with_contact(Contact::new("flute_1", "Flute 1")),
        ]);
        assert!(matches!(
            check_positions(&tree, 0),
            Err(PqcError::MissingPosition { ref contact, .. }) if contact == "Flute 1"
        ));
    }

    #[tokio::test]
    async fn unknown_type_fails_before_initialize() {
        let dir = tempfile::tempdir().unwrap();
        let hvsrc = Arc::new(MockSourceMeter::new("hvsrc"));
        hvsrc.force_output(-100.0).await;
        let mut tree = SequenceTree::new(vec![Sample::new("HM", "A").with_contact(
            Contact::new("c", "C")
                .with_position(Position::new(0.0, 0.0, 0.0))
                .with_measurement(MeasurementNode::new("x", "X", "does_not_exist")),
        )]);
        let (events, mut rx) = EventSender::channel();
        let station = Station::new().with_hvsrc(hvsrc.clone());
        let mut executor =
            SequenceExecutor::new(quiet_config(dir.path()), station).with_events(events);

        assert!(executor.run(&mut tree, NodePath::Root).await.is_err());
        // Nothing was ramped, so initialize never ran.
        assert!(hvsrc.history().await.is_empty());
        let events = drain(&mut rx);
        let failed = events
            .iter()
            .filter(|e| matches!(e, ExecutorEvent::Failed(_)))
            .count();
        assert_eq!(failed, 1);
        assert!(matches!(events.last(), Some(ExecutorEvent::Finished)));
    }

    #[tokio::test(start_paused = true)]
    async fn measurement_target_records_series_and_meta() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            serialize_json: true,
            operator: "Monty".into(),
            ..quiet_config(dir.path())
        };
        let mut tree = SequenceTree::new(vec![Sample::new("HM", "A").with_contact(
            Contact::new("flute_1", "Flute 1")
                .with_position(Position::new(1.0, 2.0, 3.0))
                .with_measurement(iv_node("iv")),
        )]);
        let mut executor = SequenceExecutor::new(config, station());
        executor
            .run(&mut tree, NodePath::Measurement(0, 0, 0))
            .await
            .unwrap();

        let node = tree.measurement(0, 0, 0).unwrap();
        assert_eq!(node.state, Some(ItemState::Success));
        assert!(!node.series.is_empty());

        let sample_dir = dir.path().join("HM");
        let json = std::fs::read_dir(&sample_dir)
            .unwrap()
            .filter_map(Result::ok)
            .find(|entry| entry.path().extension().is_some_and(|ext| ext == "json"))
            .unwrap();
        let text = std::fs::read_to_string(json.path()).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["meta"]["operator"], "Monty");
        assert_eq!(value["meta"]["contact_name"], "Flute 1");
        assert_eq!(value["meta"]["measurement_type"], "iv_ramp");
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_measurements_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut disabled = iv_node("iv2");
        disabled.enabled = false;
        let mut tree = SequenceTree::new(vec![Sample::new("HM", "A").with_contact(
            Contact::new("c", "C")
                .with_position(Position::new(0.0, 0.0, 0.0))
                .with_measurement(iv_node("iv1"))
                .with_measurement(disabled),
        )]);
        let mut executor = SequenceExecutor::new(quiet_config(dir.path()), station());
        executor.run(&mut tree, NodePath::Contact(0, 0)).await.unwrap();
        assert_eq!(tree.state(NodePath::Measurement(0, 0, 0)), Some(ItemState::Success));
        assert_eq!(tree.state(NodePath::Measurement(0, 0, 1)), None);
        assert_eq!(tree.state(NodePath::Contact(0, 0)), Some(ItemState::Success));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_contact_applies_overdrive() {
        let dir = tempfile::tempdir().unwrap();
        let table = Arc::new(MockTable::new());
        let mut registry = MeasurementRegistry::with_builtin();
        registry.register("always_bad", |_| {
            Err(MeasurementError::Analysis("no fit".into()))
        });
        let config = Config {
            move_to_contact: true,
            retry_contact_count: 1,
            retry_contact_overdrive: -0.25,
            table_contact_delay: Duration::ZERO,
            ..quiet_config(dir.path())
        };
        let mut tree = SequenceTree::new(vec![Sample::new("HM", "A").with_contact(
            Contact::new("c", "C")
                .with_position(Position::new(1.0, 2.0, 3.0))
                .with_measurement(MeasurementNode::new("bad", "Bad", "always_bad")),
        )]);
        let mut executor = SequenceExecutor::new(config, Station::new().with_table(table.clone()))
            .with_registry(registry);
        executor.run(&mut tree, NodePath::Contact(0, 0)).await.unwrap();

        assert_eq!(
            table.moves().await,
            vec![Position::new(1.0, 2.0, 3.0), Position::new(1.0, 2.0, 3.25)]
        );
        let contact = tree.contact(0, 0).unwrap();
        assert_eq!(contact.recontact, 1);
        assert_eq!(contact.state, Some(ItemState::Error));
        assert_eq!(contact.measurements[0].state, Some(ItemState::AnalysisError));
    }
}
