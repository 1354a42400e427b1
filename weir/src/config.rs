//! This module controls configuration parsing from the end user, providing
//! a convenience mechanism for the rest of the program. The configuration
//! is immutable for the process lifetime once loaded; nothing here is
//! re-read after [`crate::engine::Engine::new`].

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{flush, listener, sink};

/// Errors produced by [`Config`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error reading config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// An out-of-range timer percentile.
    #[error(transparent)]
    Flush(#[from] flush::Error),
    /// An invalid sink setting.
    #[error(transparent)]
    Sink(#[from] sink::Error),
}

/// Main configuration struct for this program.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The UDP listener for inbound metric updates.
    #[serde(default)]
    pub listener: listener::Config,
    /// The flush cycle: period, retention policy, emission flags.
    #[serde(default)]
    pub flush: flush::Config,
    /// The downstream sink for flushed samples.
    #[serde(default, with = "serde_yaml::with::singleton_map")]
    pub sink: sink::Config,
}

impl Config {
    /// Parse and validate a YAML document.
    ///
    /// # Errors
    ///
    /// Function will return an error if the contents are not valid YAML
    /// for this structure or fail validation.
    pub fn from_yaml(contents: &str) -> Result<Self, Error> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the configuration from a file on disk.
    ///
    /// # Errors
    ///
    /// Function will return an error if the file cannot be read, parsed or
    /// validated.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let contents = fs::read_to_string(path).map_err(|source| Error::ReadFile {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?;
        Self::from_yaml(&contents)
    }

    /// Check cross-field constraints the type system cannot.
    ///
    /// # Errors
    ///
    /// Function will return an error for out-of-range percentiles or sink
    /// settings.
    pub fn validate(&self) -> Result<(), Error> {
        self.flush.validate()?;
        self.sink.validate()?;
        Ok(())
    }
}
