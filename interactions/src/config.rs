use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "API_BASE_URL", default = "http://localhost:3000")]
    pub api_base_url: String,

    #[envconfig(from = "REQUEST_TIMEOUT_MS", default = "5000")]
    pub request_timeout: EnvMsDuration,

    #[envconfig(from = "STORAGE_PATH", default = ".interactions/overrides.json")]
    pub storage_path: String,

    #[envconfig(from = "API_KEY")]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}
