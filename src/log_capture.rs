//! Per-measurement log files.
//!
//! [`MeasurementLogLayer`] is a `tracing_subscriber` layer that appends every event to
//! the file currently attached to its [`LogSink`]. The executor attaches a measurement's
//! `.log` file for the duration of that measurement through an RAII [`LogFileGuard`].
//! While no file is attached the layer does nothing.
//!
//! Lines use the format `2024-05-02T14:03:11:INFO:rust_pqc::sequencer:Process measurement...`.

use std::fmt::{self, Write as _};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Local;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug)]
struct OpenLog {
    path: PathBuf,
    file: File,
}

/// Shared slot for the log file of the running measurement.
#[derive(Debug, Clone, Default)]
pub struct LogSink(Arc<Mutex<Option<OpenLog>>>);

impl LogSink {
    /// Sink without an attached file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Layer writing into this sink.
    pub fn layer(&self) -> MeasurementLogLayer {
        MeasurementLogLayer { sink: self.clone() }
    }

    /// Append log records to `path` until the returned guard drops.
    ///
    /// Missing parent directories are created. A previously attached file is replaced.
    pub fn attach(&self, path: impl AsRef<Path>) -> io::Result<LogFileGuard> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        *self.slot() = Some(OpenLog {
            path: path.to_path_buf(),
            file,
        });
        Ok(LogFileGuard { sink: self.clone() })
    }

    /// Path of the attached file.
    pub fn current_path(&self) -> Option<PathBuf> {
        self.slot().as_ref().map(|log| log.path.clone())
    }

    fn slot(&self) -> MutexGuard<'_, Option<OpenLog>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_attached(&self) -> bool {
        self.slot().is_some()
    }

    fn write_line(&self, line: &str) {
        if let Some(log) = self.slot().as_mut() {
            let _ = writeln!(log.file, "{line}");
        }
    }

    fn detach(&self) {
        if let Some(mut log) = self.slot().take() {
            let _ = log.file.flush();
        }
    }
}

/// Keeps a log file attached. Dropping it closes the file.
#[must_use = "the log file is detached when the guard drops"]
#[derive(Debug)]
pub struct LogFileGuard {
    sink: LogSink,
}

impl Drop for LogFileGuard {
    fn drop(&mut self) {
        self.sink.detach();
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

/// Layer appending formatted events to a [`LogSink`].
#[derive(Debug, Clone)]
pub struct MeasurementLogLayer {
    sink: LogSink,
}

impl<S: Subscriber> Layer<S> for MeasurementLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if !self.sink.is_attached() {
            return;
        }
        let metadata = event.metadata();
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);
        let line = format!(
            "{}:{}:{}:{}{}",
            Local::now().format(DATE_FORMAT),
            metadata.level(),
            metadata.target(),
            visitor.message,
            visitor.fields
        );
        self.sink.write_line(&line);
    }
}
