//! Runtime configuration.
//!
//! Sources, lowest to highest precedence: built-in defaults, the YAML file
//! named on the command line (or via `INTERDICT_CONFIG_PATH`), environment
//! variables prefixed `INTERDICT_`, then explicit command-line overrides.

use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::cli::Cli;
use crate::divert::FilterSpec;
use crate::engine::Mode;

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    /// Interface the capture socket binds to.
    pub interface: String,
    /// Interception policy.
    pub mode: Mode,
    /// Body of the injected HTTP response.
    pub body: String,
    /// Which captured packets the engine acts on.
    pub filter: FilterSpec,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            interface: "eth0".to_string(),
            mode: Mode::Request,
            body: "Request blocked!".to_string(),
            filter: FilterSpec::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file {0} does not exist")]
    MissingFile(String),
    #[error("configuration error: {0}")]
    Extraction(#[from] figment::Error),
}

impl Config {
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));

        if let Some(path) = &cli.config {
            if !Path::new(path).exists() {
                return Err(ConfigError::MissingFile(path.display().to_string()));
            }
            figment = figment.merge(Yaml::file(path));
        }

        figment = figment.merge(Env::prefixed("INTERDICT_"));

        if let Some(interface) = &cli.interface {
            figment = figment.merge(Serialized::default("interface", interface));
        }
        if let Some(mode) = cli.mode {
            figment = figment.merge(Serialized::default("mode", mode));
        }

        Ok(figment.extract()?)
    }
}
