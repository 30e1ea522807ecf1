use std::{env, path::PathBuf, time::Duration};

use core_types::{BackfillSettings, OutputLayout, SettingsError};
use data_client::BinanceClientConfig;
use kline_backfill_engine::BackfillConfig;
use thiserror::Error;

pub const USAGE: &str = "usage: klinefill [--vnpy|--extended] [--config <path>]";
const PROXY_VARS: &[&str] = &["HTTPS_PROXY", "https_proxy"];

/// Command line flags. Everything else comes from the settings file and environment.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CliArgs {
    pub extended: bool,
    pub config_path: Option<PathBuf>,
    pub help: bool,
}

impl CliArgs {
    pub fn parse<I>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut parsed = Self::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--vnpy" | "--extended" => parsed.extended = true,
                "--config" | "-c" => {
                    let path = args
                        .next()
                        .ok_or_else(|| ConfigError::MissingValue { flag: arg.clone() })?;
                    parsed.config_path = Some(PathBuf::from(path));
                }
                "--help" | "-h" => parsed.help = true,
                other => {
                    if let Some(path) = other.strip_prefix("--config=") {
                        parsed.config_path = Some(PathBuf::from(path));
                    } else {
                        return Err(ConfigError::UnknownFlag {
                            flag: other.to_string(),
                        });
                    }
                }
            }
        }
        Ok(parsed)
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub settings: BackfillSettings,
    pub proxy: Option<String>,
}

impl AppConfig {
    pub fn load(args: &CliArgs) -> Result<Self, ConfigError> {
        let mut settings = BackfillSettings::load(args.config_path.as_deref())?;
        if args.extended {
            settings.layout = OutputLayout::Extended;
        }
        Ok(Self {
            settings,
            proxy: proxy_from_env(),
        })
    }

    pub fn backfill_config(&self) -> Result<BackfillConfig, ConfigError> {
        Ok(BackfillConfig::from_settings(&self.settings)?)
    }

    pub fn client_config(&self) -> BinanceClientConfig {
        BinanceClientConfig::new(self.settings.rest_base_url.clone())
            .with_timeout(Duration::from_secs(self.settings.request_timeout_secs))
            .with_proxy(self.proxy.clone())
    }
}

fn proxy_from_env() -> Option<String> {
    PROXY_VARS
        .iter()
        .filter_map(|key| env::var(key).ok())
        .find(|value| !value.trim().is_empty())
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown argument '{flag}'\n{USAGE}")]
    UnknownFlag { flag: String },
    #[error("{flag} requires a value\n{USAGE}")]
    MissingValue { flag: String },
    #[error(transparent)]
    Settings(#[from] SettingsError),
}
