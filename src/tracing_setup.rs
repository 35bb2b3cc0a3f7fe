//! Global tracing subscriber.
//!
//! One console layer (pretty, compact or JSON) filtered by `RUST_LOG`, falling back to the
//! configured level, plus an optional [`MeasurementLogLayer`](crate::log_capture::MeasurementLogLayer)
//! that writes the running measurement's `.log` file. Executor spans add `sample`,
//! `contact` and `measurement_type` fields to every event below them.
//!
//! # Example
//! ```no_run
//! use rust_pqc::{config::Config, log_capture::LogSink, tracing_setup};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_from("pqc.toml")?;
//! let sink = LogSink::new();
//! tracing_setup::init_from_config(&config, Some(sink.clone()))?;
//! tracing::info!("Station ready");
//! # Ok(())
//! # }
//! ```

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{
    filter::LevelFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    registry::Registry,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::Config;
use crate::log_capture::LogSink;

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Console output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Multi-line, colored
    Pretty,
    /// One line per event
    #[default]
    Compact,
    /// One JSON object per event
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(format!(
                "Invalid log format '{other}'. Must be one of: pretty, compact, json"
            )),
        }
    }
}

/// Subscriber settings.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Level used when `RUST_LOG` is not set; also the level of measurement log files
    pub level: Level,
    /// Console format
    pub format: OutputFormat,
    /// Log span open and close
    pub span_events: bool,
    /// Include source file and line
    pub file_and_line: bool,
    /// Colors for the pretty format
    pub ansi: bool,
    /// Sink for per-measurement log files
    pub log_sink: Option<LogSink>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::new(Level::INFO)
    }
}

impl TracingConfig {
    /// Compact console output at `level`.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            format: OutputFormat::default(),
            span_events: false,
            file_and_line: false,
            ansi: true,
            log_sink: None,
        }
    }

    /// Settings for the configured `log_level`.
    pub fn from_config(config: &Config) -> Result<Self, String> {
        Ok(Self::new(parse_log_level(&config.log_level)?))
    }

    /// Set the console format.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Log span open and close events.
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    /// Include source locations.
    pub fn with_file_and_line(mut self, enabled: bool) -> Self {
        self.file_and_line = enabled;
        self
    }

    /// Enable colors for the pretty format.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.ansi = enabled;
        self
    }

    /// Route events into per-measurement log files.
    pub fn with_log_sink(mut self, sink: LogSink) -> Self {
        self.log_sink = Some(sink);
        self
    }

    fn console_layer(&self) -> BoxedLayer {
        let filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::from_level(self.level).into())
            .from_env_lossy();
        let spans = if self.span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let located = self.file_and_line;
        match self.format {
            OutputFormat::Pretty => fmt::layer()
                .pretty()
                .with_ansi(self.ansi)
                .with_span_events(spans)
                .with_file(located)
                .with_line_number(located)
                .with_filter(filter)
                .boxed(),
            OutputFormat::Compact => fmt::layer()
                .compact()
                .with_ansi(false)
                .with_span_events(spans)
                .with_file(located)
                .with_line_number(located)
                .with_filter(filter)
                .boxed(),
            OutputFormat::Json => fmt::layer()
                .json()
                .with_span_events(spans)
                .with_file(located)
                .with_line_number(located)
                .with_filter(filter)
                .boxed(),
        }
    }

    fn layers(&self) -> Vec<BoxedLayer> {
        let mut layers = vec![self.console_layer()];
        // Log files keep the configured level even if RUST_LOG narrows the console.
        if let Some(sink) = &self.log_sink {
            layers.push(
                sink.layer()
                    .with_filter(LevelFilter::from_level(self.level))
                    .boxed(),
            );
        }
        layers
    }
}

/// Install the global subscriber for `config`.
pub fn init_from_config(config: &Config, sink: Option<LogSink>) -> Result<(), String> {
    let mut settings = TracingConfig::from_config(config)?;
    settings.log_sink = sink;
    init(settings)
}

/// Install the global subscriber.
///
/// Does nothing if a global subscriber is already set, so tests and several frontends may
/// call it freely.
pub fn init(config: TracingConfig) -> Result<(), String> {
    match tracing_subscriber::registry().with(config.layers()).try_init() {
        Ok(()) => Ok(()),
        Err(err) if err.to_string().contains("already been set") => Ok(()),
        Err(err) => Err(format!("Failed to initialize tracing: {err}")),
    }
}

/// Parse `trace`, `debug`, `info`, `warn` or `error` (any case).
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        )),
    }
}
