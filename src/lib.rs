//! # Rust PQC Core Library
//!
//! Measurement sequencing and execution engine for process quality control (PQC)
//! stations. A sequence tree of samples, contacts and measurements is walked by the
//! [`sequencer::SequenceExecutor`], which moves the wafer table, runs each measurement
//! against the station's instruments, keeps the hardware in a safe state and writes
//! result files. Frontends (GUI, CLI) observe the run through [`events`] and may only
//! request an abort.
//!
//! ## Crate Structure
//!
//! - **`abort`**: Cooperative stop flag shared between the executor and observers.
//! - **`config`**: Layered run configuration (defaults, TOML file, `PQC_` environment).
//! - **`error`**: `thiserror` enums for parameters, instruments, measurements and runs.
//! - **`events`**: Notifications emitted by the executor over an unbounded channel.
//! - **`hardware`**: Capability traits for the station instruments, exclusive instrument
//!   slots and mock implementations.
//! - **`log_capture`**: `tracing` layer writing per-measurement log files.
//! - **`measurement`**: The `Measurement` trait, its lifecycle runner, result data,
//!   analysis and the built-in measurement types.
//! - **`parameter`**: Declarative parameter registration, defaults and unit conversion.
//! - **`sequence`**: The sequence tree model, item states and table positions.
//! - **`sequencer`**: The executor, recovery procedures, table moves and output files.
//! - **`tracing_setup`**: Global `tracing-subscriber` initialization.
//! - **`units`**: Metric quantities (`"10 uA"`, `"1 kHz"`) and formatting.
//! - **`utils`**: Linear ramps, noise filters, estimates and benchmarks.

pub mod abort;
pub mod config;
pub mod error;
pub mod events;
pub mod hardware;
pub mod log_capture;
pub mod measurement;
pub mod parameter;
pub mod sequence;
pub mod sequencer;
pub mod tracing_setup;
pub mod units;
pub mod utils;

pub use abort::AbortHandle;
pub use config::Config;
pub use error::{PqcError, PqcResult};
pub use events::{EventSender, ExecutorEvent};
pub use sequence::{ItemState, NodePath, SequenceTree};
pub use sequencer::SequenceExecutor;
