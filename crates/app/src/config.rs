use std::path::{Path, PathBuf};
use std::time::Duration;

use adhikari_backend::LocalSessionProvider;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};

pub const CONFIG_DIRECTORY_NAME: &str = "adhikari";
pub const CONFIG_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "ADHIKARI_";
pub const DATABASE_FILE_NAME: &str = "chat.sqlite3";
pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_PLANNER_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    pub database_location: String,
    /// URL the outfit planner is reached at. Required.
    #[serde(default)]
    pub planner_endpoint: Option<String>,
    pub store_timeout_ms: u64,
    pub planner_timeout_ms: u64,
    /// Where the signed-in session is kept; defaults to the user data directory.
    #[serde(default)]
    pub session_file: Option<PathBuf>,
    pub log_filter: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        let database_location = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(CONFIG_DIRECTORY_NAME)
            .join(DATABASE_FILE_NAME);

        Self {
            database_location: database_location.display().to_string(),
            planner_endpoint: None,
            store_timeout_ms: DEFAULT_STORE_TIMEOUT_MS,
            planner_timeout_ms: DEFAULT_PLANNER_TIMEOUT_MS,
            session_file: None,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl AppConfig {
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(CONFIG_DIRECTORY_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Layers defaults, the JSON file at `path` (if present) and `ADHIKARI_*` variables.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            tracing::debug!(?path, "config file not found, using defaults and environment");
        }

        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .context(ExtractSnafu {
                stage: "extract-app-config",
                path: path.to_path_buf(),
            })?;

        config.validate()?;
        Ok(config)
    }

    pub fn planner_endpoint(&self) -> ConfigResult<&str> {
        self.planner_endpoint
            .as_deref()
            .map(str::trim)
            .filter(|endpoint| !endpoint.is_empty())
            .context(MissingPlannerEndpointSnafu {
                stage: "resolve-planner-endpoint",
            })
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn planner_timeout(&self) -> Duration {
        Duration::from_millis(self.planner_timeout_ms)
    }

    pub fn session_path(&self) -> PathBuf {
        self.session_file
            .clone()
            .unwrap_or_else(LocalSessionProvider::default_session_path)
    }

    fn validate(&self) -> ConfigResult<()> {
        self.planner_endpoint()?;

        if self.store_timeout_ms == 0 {
            return InvalidValueSnafu {
                stage: "validate-store-timeout",
                key: "store_timeout_ms",
                details: "must be greater than zero",
            }
            .fail();
        }

        if self.planner_timeout_ms == 0 {
            return InvalidValueSnafu {
                stage: "validate-planner-timeout",
                key: "planner_timeout_ms",
                details: "must be greater than zero",
            }
            .fail();
        }

        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("failed to read configuration from {path:?} on `{stage}`: {source}"))]
    Extract {
        stage: &'static str,
        path: PathBuf,
        #[snafu(source(from(figment::Error, Box::new)))]
        source: Box<figment::Error>,
    },
    #[snafu(display(
        "no planner endpoint configured on `{stage}`; set `planner_endpoint` or ADHIKARI_PLANNER_ENDPOINT"
    ))]
    MissingPlannerEndpoint { stage: &'static str },
    #[snafu(display("invalid `{key}` on `{stage}`: {details}"))]
    InvalidValue {
        stage: &'static str,
        key: &'static str,
        details: &'static str,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;
