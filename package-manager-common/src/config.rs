// Copyright 2024 Golem Cloud
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::SafeDisplay;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "PM__";

pub trait ConfigLoaderConfig:
    Default + Serialize + DeserializeOwned + SafeDisplay + Send + Sync + 'static
{
}

impl<T: Default + Serialize + DeserializeOwned + SafeDisplay + Send + Sync + 'static>
    ConfigLoaderConfig for T
{
}

pub type ConfigExample<T> = (&'static str, T);

pub trait HasConfigExamples<T> {
    fn examples() -> Vec<ConfigExample<T>>;
}

/// Layered configuration: compiled-in defaults, then the service's TOML
/// file (optional), then `PM__` prefixed environment variables.
pub struct ConfigLoader<T: ConfigLoaderConfig> {
    pub config_file_name: PathBuf,
    make_examples: Option<fn() -> Vec<ConfigExample<T>>>,
    phantom: PhantomData<T>,
}

impl<T: ConfigLoaderConfig> ConfigLoader<T> {
    pub fn new(config_file_name: &Path) -> ConfigLoader<T> {
        ConfigLoader {
            config_file_name: config_file_name.to_path_buf(),
            make_examples: None,
            phantom: PhantomData,
        }
    }

    pub fn new_with_examples(config_file_name: &Path) -> ConfigLoader<T>
    where
        T: HasConfigExamples<T>,
    {
        ConfigLoader {
            config_file_name: config_file_name.to_path_buf(),
            make_examples: Some(T::examples),
            phantom: PhantomData,
        }
    }

    pub fn figment(&self) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(T::default()))
            .merge(Toml::file(&self.config_file_name))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn load(&self) -> figment::Result<T> {
        self.figment().extract()
    }

    /// Loads the config, or dumps it when the process was started with
    /// `--dump-config` (default values) or `--dump-config-examples`.
    /// Returns `None` when the process should exit without serving.
    pub fn load_or_dump_config(&self) -> Option<T> {
        let args: Vec<String> = std::env::args().collect();
        if args.iter().any(|a| a == "--dump-config") {
            match toml::to_string(&T::default()) {
                Ok(dump) => println!("{dump}"),
                Err(err) => eprintln!("Failed to dump default config: {err}"),
            }
            None
        } else if args.iter().any(|a| a == "--dump-config-examples") {
            if let Some(make_examples) = self.make_examples {
                for (name, example) in make_examples() {
                    match toml::to_string(&example) {
                        Ok(dump) => println!("## {name}\n{dump}"),
                        Err(err) => eprintln!("Failed to dump example '{name}': {err}"),
                    }
                }
            } else {
                eprintln!("No config examples are defined for this service");
            }
            None
        } else {
            match self.load() {
                Ok(config) => Some(config),
                Err(err) => {
                    eprintln!(
                        "Failed to load config from {:?}: {err}",
                        self.config_file_name
                    );
                    None
                }
            }
        }
    }
}

/// Shared retry policy for remote calls; delays grow by `multiplier`
/// from `min_delay` up to `max_delay`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub min_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before the given 1-based retry attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = self.min_delay.mul_f64(factor);
        delay.min(self.max_delay)
    }
}

impl SafeDisplay for RetryConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "max attempts: {}, delays: {:?} .. {:?} (x{})",
            self.max_attempts, self.min_delay, self.max_delay, self.multiplier
        )
    }
}
