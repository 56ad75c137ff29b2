//! Reporter configuration.
//!
//! Configuration is an explicit [`Config`] struct. It can be built in code with
//! [`Config::new`] or loaded with [`Config::load`], which merges (later sources override
//! earlier ones):
//!
//! 1. **Defaults** - see the `Default` implementation
//! 2. **YAML file** - optional, only when a path is given
//! 3. **Environment variables** - prefixed with `LLM_REPORT_`
//!
//! ```bash
//! LLM_REPORT_API_KEY=lr-1234
//! LLM_REPORT_LOGGING_URL=https://logs.internal.example.com/api/v1/log/openai
//! LLM_REPORT_REQUEST_TIMEOUT=10s
//! ```

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};
use std::{fmt, path::Path, time::Duration};
use url::Url;

use crate::errors::Error;

/// Endpoint usage records are posted to unless configured otherwise.
pub const DEFAULT_LOGGING_URL: &str = "https://llm.report/api/v1/log/openai";

/// The only host whose traffic is observed unless configured otherwise.
pub const DEFAULT_TARGET_HOST: &str = "api.openai.com";

/// Request header carrying the end-user identity.
pub const DEFAULT_USER_ID_HEADER: &str = "X-User-Id";

const ENV_PREFIX: &str = "LLM_REPORT_";

#[derive(Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Key sent as `x-api-key` with every usage record
    pub api_key: String,
    /// Where usage records are posted
    pub logging_url: Url,
    /// Hostname of the AI API whose calls are observed. All other hosts are ignored.
    pub target_host: String,
    /// Request header read as the user id of an exchange
    pub user_id_header: String,
    /// Timeout for a single delivery to the logging endpoint
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            logging_url: Url::parse(DEFAULT_LOGGING_URL).unwrap(),
            target_host: DEFAULT_TARGET_HOST.to_string(),
            user_id_header: DEFAULT_USER_ID_HEADER.to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("api_key", &"<redacted>")
            .field("logging_url", &self.logging_url.as_str())
            .field("target_host", &self.target_host)
            .field("user_id_header", &self.user_id_header)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl Config {
    /// Default configuration with the given API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Self::default()
        }
    }

    pub fn with_logging_url(mut self, logging_url: Url) -> Self {
        self.logging_url = logging_url;
        self
    }

    pub fn with_target_host(mut self, target_host: impl Into<String>) -> Self {
        self.target_host = target_host.into();
        self
    }

    /// Load configuration from defaults, an optional YAML file and `LLM_REPORT_*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let config: Self = Self::figment(path).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX))
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.api_key.trim().is_empty() {
            return Err(Error::InvalidConfig {
                message: format!("api_key is required. Set {ENV_PREFIX}API_KEY or add api_key to the config file."),
            });
        }
        if self.target_host.trim().is_empty() {
            return Err(Error::InvalidConfig {
                message: "target_host must not be empty".to_string(),
            });
        }
        if !matches!(self.logging_url.scheme(), "http" | "https") {
            return Err(Error::InvalidConfig {
                message: format!("logging_url must be http(s), got {}", self.logging_url),
            });
        }
        Ok(())
    }
}
