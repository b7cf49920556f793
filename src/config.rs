use std::path::PathBuf;

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "echoport.toml";
const ENV_PREFIX: &str = "ECHOPORT_";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// SQLite database holding targets and run records.
    pub database_path: PathBuf,
    pub runner: RunnerConfig,
    /// Use the in-process simulated runner instead of the remote API.
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Base URL of the remote job-execution API.
    pub base_url: String,
    /// Bearer token identifying this orchestrator to the runner.
    pub service_token: String,
    /// Per-request HTTP timeout, distinct from the per-target run timeout.
    pub request_timeout_secs: u64,
    /// Delay between status polls while a run is in flight.
    pub poll_interval_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("echoport.db"),
            runner: RunnerConfig {
                base_url: "http://localhost:8000".to_string(),
                service_token: String::new(),
                request_timeout_secs: 30,
                poll_interval_secs: 5,
            },
            simulation: false,
            verbose: false,
            json_logs: false,
        }
    }
}

impl AppConfig {
    /// Layered configuration: defaults, then `echoport.toml`, then
    /// `ECHOPORT_*` environment variables, then CLI arguments.
    pub fn new<A: Serialize>(cli_args: Option<&A>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        if let Some(args) = cli_args {
            figment = figment.merge(Serialized::defaults(args));
        }

        figment.extract().context("Failed to load configuration")
    }
}
