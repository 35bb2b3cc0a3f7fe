//! Error types for the measurement engine.
//!
//! Errors are layered to mirror where they are raised:
//!
//! - **`ParameterError`**: registration and resolution of measurement parameters.
//! - **`InstrumentError`**: failures reported by an instrument handle. Transport failures
//!   (timeouts, broken pipes) are distinguished from device-level errors so the executor
//!   can classify them as `Timeout` rather than `Error`.
//! - **`MeasurementError`**: everything that can end a single measurement. `classify()`
//!   maps each variant onto the item state recorded in the sequence tree.
//! - **`PqcError`**: run-level failures that abort a sample or the whole run (missing
//!   positions, table timeouts, stuck matrix channels, failed recovery).
//!
//! All enums use `thiserror` and convert into their parent layer with `#[from]` so the
//! `?` operator works across module boundaries.

use std::time::Duration;

use thiserror::Error;

use crate::sequence::ItemState;

/// Convenience alias for run-level results.
pub type PqcResult<T> = std::result::Result<T, PqcError>;

/// Convenience alias for results of a single measurement.
pub type MeasurementResult<T> = std::result::Result<T, MeasurementError>;

/// Convenience alias for instrument calls.
pub type InstrumentResult<T> = std::result::Result<T, InstrumentError>;

/// Errors raised while registering or resolving measurement parameters.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParameterError {
    #[error("Parameter '{0}' is already registered")]
    Duplicate(String),

    #[error("Missing required parameter: {0}")]
    Missing(String),

    #[error("Parameter '{0}' is not registered")]
    Unregistered(String),

    #[error("Invalid value for parameter '{key}': {value} (allowed: {allowed})")]
    InvalidValue {
        key: String,
        value: String,
        allowed: String,
    },

    #[error("Cannot convert parameter '{key}' from '{from}' to '{to}'")]
    UnitConversion { key: String, from: String, to: String },

    #[error("Parameter '{key}' has wrong type, expected {expected}")]
    InvalidType { key: String, expected: &'static str },
}

/// Errors reported by instrument handles.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InstrumentError {
    #[error("{instrument}: I/O timeout")]
    Timeout { instrument: String },

    #[error("{instrument}: broken pipe")]
    BrokenPipe { instrument: String },

    #[error("{instrument}: {message}")]
    Device { instrument: String, message: String },

    #[error("Instrument '{0}' is not available")]
    Unavailable(String),
}

impl InstrumentError {
    /// Create a device-level error.
    pub fn device(instrument: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Device {
            instrument: instrument.into(),
            message: message.into(),
        }
    }

    /// True for transport failures (timeouts and broken pipes).
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::BrokenPipe { .. })
    }
}

/// Errors ending a single measurement.
#[derive(Error, Debug, Clone)]
pub enum MeasurementError {
    #[error(transparent)]
    Parameter(#[from] ParameterError),

    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(InstrumentError),

    #[error(transparent)]
    Instrument(InstrumentError),

    #[error("Compliance tripped: {0}")]
    Compliance(String),

    #[error("Analysis failed: {0}")]
    Analysis(String),

    #[error("Series mismatch: expected keys [{expected}], got [{got}]")]
    Series { expected: String, got: String },

    #[error("Unknown measurement type: {0}")]
    UnknownType(String),

    #[error("{0}")]
    Failed(String),
}

impl From<InstrumentError> for MeasurementError {
    fn from(err: InstrumentError) -> Self {
        match err {
            InstrumentError::Unavailable(_) => Self::ResourceUnavailable(err),
            other => Self::Instrument(other),
        }
    }
}

impl From<std::io::Error> for MeasurementError {
    fn from(err: std::io::Error) -> Self {
        Self::Failed(err.to_string())
    }
}

impl MeasurementError {
    /// Map the error onto the state recorded for the measurement item.
    ///
    /// Transport failures count as `Timeout` whether they surface while acquiring the
    /// resource or during instrument I/O.
    pub fn classify(&self) -> ItemState {
        match self {
            Self::ResourceUnavailable(inner) | Self::Instrument(inner) => {
                if inner.is_transport_failure() {
                    ItemState::Timeout
                } else {
                    ItemState::Error
                }
            }
            Self::Compliance(_) => ItemState::Compliance,
            Self::Analysis(_) => ItemState::AnalysisError,
            Self::Parameter(_) | Self::Series { .. } | Self::UnknownType(_) | Self::Failed(_) => {
                ItemState::Error
            }
        }
    }

    /// True if the error is eligible for the contact-level measurement retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Analysis(_))
    }
}

/// Run-level errors.
#[derive(Error, Debug)]
pub enum PqcError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("No contact position assigned for {sample} -> {contact}")]
    MissingPosition { sample: String, contact: String },

    #[error("Table move timeout after {} s", .0.as_secs_f64())]
    TableMoveTimeout(Duration),

    #[error("Table move failed: {0}")]
    TableMove(String),

    #[error("Matrix channels still closed: {0:?}")]
    MatrixChannelsClosed(Vec<String>),

    #[error("Failed to recover {instrument}: {source}")]
    Recovery {
        instrument: String,
        #[source]
        source: InstrumentError,
    },

    #[error(transparent)]
    Instrument(#[from] InstrumentError),

    #[error(transparent)]
    Measurement(#[from] MeasurementError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::ser::Error),
}
