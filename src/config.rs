//! Run configuration loaded with Figment.
//!
//! Configuration is merged from three layers, later layers overriding earlier ones:
//! 1. Built-in defaults (`Config::default()`)
//! 2. A TOML file (optional, e.g. `pqc.toml`)
//! 3. Environment variables prefixed with `PQC_` (e.g. `PQC_RETRY_CONTACT_COUNT=2`)
//!
//! The configuration is read-only for the duration of a run. The one exception is the
//! cached table position, which lives in a [`SharedPosition`] so the table-move path can
//! publish it under its own lock.
//!
//! # Example
//! ```no_run
//! use rust_pqc::config::Config;
//!
//! let config = Config::load_from("pqc.toml")?;
//! config.validate()?;
//! # Ok::<(), rust_pqc::error::PqcError>(())
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{PqcError, PqcResult};
use crate::sequence::Position;

/// Process-wide run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Pause before each measurement starts
    #[serde(with = "humantime_serde")]
    pub before_measurement_delay: Duration,
    /// Extra z offset applied on contact retry attempts (absolute value is used)
    pub retry_contact_overdrive: f64,
    /// Settle delay after a contact move
    #[serde(with = "humantime_serde")]
    pub table_contact_delay: Duration,
    /// Maximum wait for a table move to report completion
    #[serde(with = "humantime_serde")]
    pub table_move_timeout: Duration,
    /// Write `.json` results
    pub serialize_json: bool,
    /// Write `.txt` results
    pub serialize_txt: bool,
    /// Capture a `.log` file per measurement
    pub write_logfiles: bool,
    /// Move the table to each contact before measuring
    pub move_to_contact: bool,
    /// Table destination after a sample or the whole run completes
    pub move_to_after_position: Option<Position>,
    /// Run environment box steps and read environment sensors
    pub use_environ: bool,
    /// Additional contact attempts after the first
    pub retry_contact_count: u32,
    /// Additional passes over failed measurements per contact attempt
    pub retry_measurement_count: u32,
    /// Root directory for result files
    pub output_dir: PathBuf,
    /// Operator name written to measurement meta data
    pub operator: String,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            before_measurement_delay: Duration::ZERO,
            retry_contact_overdrive: 0.0,
            table_contact_delay: Duration::ZERO,
            table_move_timeout: Duration::from_secs(120),
            serialize_json: true,
            serialize_txt: false,
            write_logfiles: true,
            move_to_contact: false,
            move_to_after_position: None,
            use_environ: false,
            retry_contact_count: 0,
            retry_measurement_count: 0,
            output_dir: PathBuf::from("."),
            operator: String::new(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Build the layered figment used by the loaders.
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("PQC_"))
    }

    /// Load configuration from a TOML file and `PQC_` environment variables.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> PqcResult<Self> {
        Ok(Self::figment(path).extract()?)
    }

    /// Write the configuration as TOML, e.g. to snapshot the settings of a run.
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> PqcResult<()> {
        let text = toml::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> PqcResult<()> {
        if !self.retry_contact_overdrive.is_finite() {
            return Err(PqcError::Configuration(format!(
                "Invalid retry_contact_overdrive {}",
                self.retry_contact_overdrive
            )));
        }
        if self.table_move_timeout.is_zero() {
            return Err(PqcError::Configuration(
                "table_move_timeout must be greater than zero".to_string(),
            ));
        }
        if crate::tracing_setup::parse_log_level(&self.log_level).is_err() {
            return Err(PqcError::Configuration(format!(
                "Invalid log_level '{}'",
                self.log_level
            )));
        }
        if let Some(position) = &self.move_to_after_position {
            if !position.is_valid() {
                return Err(PqcError::Configuration(format!(
                    "Invalid move_to_after_position {position}"
                )));
            }
        }
        Ok(())
    }
}

/// Cached table position shared with the table-move path.
///
/// Reads and writes go through one mutex; the table move publishes the new position
/// while holding it, so a reader never sees the signal without the position.
#[derive(Debug, Clone, Default)]
pub struct SharedPosition(Arc<Mutex<Option<Position>>>);

impl SharedPosition {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Last known table position, if any.
    pub fn get(&self) -> Option<Position> {
        *self.lock()
    }

    /// Store a new table position.
    pub fn set(&self, position: Position) {
        *self.lock() = Some(position);
    }

    fn lock(&self) -> MutexGuard<'_, Option<Position>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.table_move_timeout, Duration::from_secs(120));
        assert!(config.serialize_json);
        assert!(!config.serialize_txt);
        assert_eq!(config.retry_contact_count, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial_test::serial]
    fn load_from_toml_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
retry_contact_count = 2
retry_contact_overdrive = 0.005
table_contact_delay = "250ms"
serialize_txt = true
operator = "Jane"

[move_to_after_position]
x = 1.0
y = 2.0
z = 0.0
"#
        )
        .unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.retry_contact_count, 2);
        assert_eq!(config.table_contact_delay, Duration::from_millis(250));
        assert!(config.serialize_txt);
        assert!(config.serialize_json);
        assert_eq!(config.operator, "Jane");
        assert_eq!(
            config.move_to_after_position,
            Some(Position::new(1.0, 2.0, 0.0))
        );
    }

    #[test]
    #[serial_test::serial]
    fn env_overrides_file() {
        std::env::set_var("PQC_RETRY_MEASUREMENT_COUNT", "3");
        let config = Config::load_from("does-not-exist.toml").unwrap();
        std::env::remove_var("PQC_RETRY_MEASUREMENT_COUNT");
        assert_eq!(config.retry_measurement_count, 3);
    }

    #[test]
    #[serial_test::serial]
    fn saved_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pqc.toml");
        let config = Config {
            retry_measurement_count: 2,
            table_contact_delay: Duration::from_millis(500),
            move_to_after_position: Some(Position::new(0.0, 0.0, 1.5)),
            operator: "Jane".into(),
            ..Config::default()
        };
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.retry_measurement_count, 2);
        assert_eq!(loaded.table_contact_delay, Duration::from_millis(500));
        assert_eq!(loaded.move_to_after_position, Some(Position::new(0.0, 0.0, 1.5)));
        assert_eq!(loaded.operator, "Jane");
    }

    #[test]
    fn rejects_invalid_after_position() {
        let config = Config {
            move_to_after_position: Some(Position::unset()),
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(PqcError::Configuration(_))
        ));
    }

    #[test]
    fn shared_position_roundtrip() {
        let shared = SharedPosition::new();
        assert_eq!(shared.get(), None);
        let clone = shared.clone();
        clone.set(Position::new(1.0, 2.0, 3.0));
        assert_eq!(shared.get(), Some(Position::new(1.0, 2.0, 3.0)));
    }

    #[test]
    fn shared_position_survives_poisoning() {
        let shared = SharedPosition::new();
        shared.set(Position::new(1.0, 2.0, 3.0));
        let poisoner = shared.clone();
        let panicked = std::thread::spawn(move || {
            let _guard = poisoner.0.lock().unwrap();
            panic!("table thread panicked");
        })
        .join();
        assert!(panicked.is_err());
        assert!(shared.0.is_poisoned());

        assert_eq!(shared.get(), Some(Position::new(1.0, 2.0, 3.0)));
        shared.set(Position::new(4.0, 5.0, 6.0));
        assert_eq!(shared.get(), Some(Position::new(4.0, 5.0, 6.0)));
    }
}
