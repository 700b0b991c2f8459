use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File};
use log::debug;
use serde::Deserialize;
use std::fmt;

use crate::consts::{ENV_PREFIX, ENV_SEPARATOR};
use crate::settings::Configuration;

#[derive(Debug)]
pub enum ConfigErr {
    Read(config::ConfigError),
    Invalid(String),
}

impl fmt::Display for ConfigErr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Read(e) => write!(f, "unable to read configuration: {e}"),
            Self::Invalid(e) => write!(f, "invalid configuration: {e}"),
        }
    }
}

impl std::error::Error for ConfigErr {}

impl From<config::ConfigError> for ConfigErr {
    fn from(e: config::ConfigError) -> Self {
        Self::Read(e)
    }
}

/// Layered configuration: the optional YAML file at `config_path`, overridden
/// by `RECONSTRUCTOR__*` environment variables.
pub struct ConfigCache {
    config: Config,
    config_path: String,
}

impl ConfigCache {
    pub fn new(config_path: &str) -> Result<Self, ConfigErr> {
        let config_cache = Self {
            config: Self::load_config(config_path)?,
            config_path: config_path.to_owned(),
        };

        Ok(config_cache)
    }

    fn load_config(config_path: &str) -> Result<Config, ConfigErr> {
        let base_config_builder = ConfigBuilder::<DefaultState>::default();
        base_config_builder
            .add_source(File::with_name(config_path).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator(ENV_SEPARATOR))
            .build()
            .map_err(ConfigErr::Read)
    }

    pub fn get_config<'d, T: Deserialize<'d>>(&self) -> Result<T, ConfigErr> {
        self.config
            .clone()
            .try_deserialize()
            .map_err(ConfigErr::Read)
    }

    /// The application configuration, rejected when a value is unusable.
    pub fn configuration(&self) -> Result<Configuration, ConfigErr> {
        let configuration = self.get_config::<Configuration>()?;
        configuration.validate()?;
        debug!("configuration read from '{}' and environment", self.config_path);

        Ok(configuration)
    }
}
