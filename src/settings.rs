use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File};
use serde::Deserialize;

use crate::extract::RetryPolicy;

/// Runtime settings. Read from an optional `enricher.toml` in the working
/// directory, then from `ENRICH_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub repair_model: String,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub db_path: PathBuf,
    pub text_column: String,
    pub id_column: Option<String>,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub repair_max_attempts: u32,
    pub rate_limit_base_secs: u64,
    pub rate_limit_step_secs: u64,
    pub checkpoint_every: usize,
    pub repair_checkpoint_every: usize,
    pub repair_pacing_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            api_key: None,
            base_url: "https://api.groq.com/openai/v1".to_string(),
            model: "llama-3.1-8b-instant".to_string(),
            repair_model: "openai/gpt-oss-20b".to_string(),
            input_path: PathBuf::from("data/final_competition_data_1cleaned.csv"),
            output_path: PathBuf::from("data/final_competition_data_enriched.csv"),
            db_path: PathBuf::from("data/enrich.sqlite"),
            text_column: "clean_text".to_string(),
            id_column: None,
            timeout_secs: 60,
            max_attempts: 3,
            repair_max_attempts: 5,
            rate_limit_base_secs: 20,
            rate_limit_step_secs: 10,
            checkpoint_every: 50,
            repair_checkpoint_every: 10,
            repair_pacing_ms: 1000,
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        let builder = Config::builder()
            .add_source(File::with_name("enricher").required(false))
            .add_source(Environment::with_prefix("ENRICH").try_parsing(true));
        Self::from_builder(builder)
    }

    fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// The configured key, else `GROQ_API_KEY`, else `API_KEY`.
    pub fn api_key(&self) -> Result<String> {
        let key = self
            .api_key
            .clone()
            .or_else(|| std::env::var("GROQ_API_KEY").ok())
            .or_else(|| std::env::var("API_KEY").ok())
            .filter(|k| !k.trim().is_empty());
        match key {
            Some(k) => Ok(k),
            None => bail!("No API key: set ENRICH_API_KEY or GROQ_API_KEY"),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn enrich_policy(&self) -> RetryPolicy {
        self.policy(self.max_attempts)
    }

    pub fn repair_policy(&self) -> RetryPolicy {
        self.policy(self.repair_max_attempts)
    }

    fn policy(&self, max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            rate_limit_base: Duration::from_secs(self.rate_limit_base_secs),
            rate_limit_step: Duration::from_secs(self.rate_limit_step_secs),
        }
    }

    pub fn repair_pacing(&self) -> Duration {
        Duration::from_millis(self.repair_pacing_ms)
    }
}
