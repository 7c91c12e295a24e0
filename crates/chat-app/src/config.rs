use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use murmur_llm::{DEFAULT_OLLAMA_MODEL, DEFAULT_OLLAMA_URL, OLLAMA_PROVIDER_ID, ProviderConfig};
use murmur_storage::sqlite::DEFAULT_DATABASE_FILE_NAME;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const SETTINGS_DIRECTORY_NAME: &str = "murmur";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "MURMUR_";

pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_TOP_P: f64 = 0.9;
pub const DEFAULT_TOP_K: u32 = 40;
pub const DEFAULT_MAX_TOKENS: u64 = 2048;
pub const DEFAULT_STREAM_IDLE_TIMEOUT_SECS: u64 = 120;

/// Per-model overrides. Unset fields fall back to the `ModelsSettings` defaults.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModelParameters {
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    /// Replaces the active stored system prompt for this model.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelsSettings {
    #[serde(default = "default_temperature")]
    pub default_temperature: f64,
    #[serde(default = "default_top_p")]
    pub default_top_p: f64,
    #[serde(default = "default_top_k")]
    pub default_top_k: u32,
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u64,
    #[serde(default)]
    pub overrides: BTreeMap<String, ModelParameters>,
}

impl Default for ModelsSettings {
    fn default() -> Self {
        Self {
            default_temperature: DEFAULT_TEMPERATURE,
            default_top_p: DEFAULT_TOP_P,
            default_top_k: DEFAULT_TOP_K,
            default_max_tokens: DEFAULT_MAX_TOKENS,
            overrides: BTreeMap::new(),
        }
    }
}

/// Sampling parameters after per-model overrides are applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedModelParameters {
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: u32,
    pub max_tokens: u64,
    pub system_prompt: Option<String>,
}

impl ModelsSettings {
    pub fn resolve(&self, model_id: &str) -> ResolvedModelParameters {
        let overrides = self.overrides.get(model_id);
        ResolvedModelParameters {
            temperature: overrides
                .and_then(|value| value.temperature)
                .unwrap_or(self.default_temperature),
            top_p: overrides
                .and_then(|value| value.top_p)
                .unwrap_or(self.default_top_p),
            top_k: overrides
                .and_then(|value| value.top_k)
                .unwrap_or(self.default_top_k),
            max_tokens: overrides
                .and_then(|value| value.max_tokens)
                .unwrap_or(self.default_max_tokens),
            system_prompt: overrides
                .and_then(|value| value.system_prompt.as_deref())
                .map(str::trim)
                .filter(|prompt| !prompt.is_empty())
                .map(str::to_string),
        }
    }

    fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if !(0.0..=2.0).contains(&self.default_temperature) {
            self.default_temperature = defaults.default_temperature;
        }
        if !(0.0..=1.0).contains(&self.default_top_p) {
            self.default_top_p = defaults.default_top_p;
        }
        if self.default_top_k == 0 {
            self.default_top_k = defaults.default_top_k;
        }
        if self.default_max_tokens == 0 {
            self.default_max_tokens = defaults.default_max_tokens;
        }
        self.overrides = self
            .overrides
            .into_iter()
            .map(|(model, parameters)| (model.trim().to_string(), parameters))
            .filter(|(model, _)| !model.is_empty())
            .collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
    #[serde(default = "default_ollama_api_url")]
    pub ollama_api_url: String,
    #[serde(default = "default_model")]
    pub default_model: String,
    /// Overrides the database location; `None` means the platform data directory.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default = "default_auto_save")]
    pub auto_save_chat_history: bool,
    /// Seconds without a token before a stream is failed. `0` waits forever.
    #[serde(default = "default_stream_idle_timeout_secs")]
    pub stream_idle_timeout_secs: u64,
    #[serde(default)]
    pub models: ModelsSettings,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            provider_id: default_provider_id(),
            ollama_api_url: default_ollama_api_url(),
            default_model: default_model(),
            database_path: None,
            auto_save_chat_history: default_auto_save(),
            stream_idle_timeout_secs: default_stream_idle_timeout_secs(),
            models: ModelsSettings::default(),
        }
    }
}

impl AppSettings {
    pub fn provider_config(&self) -> ProviderConfig {
        ProviderConfig::new(
            &self.provider_id,
            &self.ollama_api_url,
            Some(self.default_model.clone()),
        )
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
                .unwrap_or_else(|| PathBuf::from(".murmur"))
                .join(DEFAULT_DATABASE_FILE_NAME)
        })
    }

    pub fn stream_idle_timeout(&self) -> Option<Duration> {
        (self.stream_idle_timeout_secs > 0)
            .then(|| Duration::from_secs(self.stream_idle_timeout_secs))
    }

    pub fn normalized(mut self) -> Self {
        self.provider_id = if self.provider_id.trim().is_empty() {
            default_provider_id()
        } else {
            self.provider_id.trim().to_string()
        };
        self.ollama_api_url = if self.ollama_api_url.trim().is_empty() {
            default_ollama_api_url()
        } else {
            self.ollama_api_url.trim().trim_end_matches('/').to_string()
        };
        self.default_model = if self.default_model.trim().is_empty() {
            default_model()
        } else {
            self.default_model.trim().to_string()
        };
        self.database_path = self
            .database_path
            .filter(|path| !path.as_os_str().is_empty());
        self.models = self.models.normalized();
        self
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<AppSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".murmur"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<AppSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: AppSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    /// Layers defaults, the JSON file (when present) and `MURMUR_*` environment
    /// overrides. Nested keys use a double underscore, e.g. `MURMUR_MODELS__DEFAULT_TOP_K`.
    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(AppSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    fn load_from_disk(path: &Path) -> AppSettings {
        if !path.exists() {
            tracing::info!("settings file not found at {:?}, using defaults", path);
        }

        match Self::figment(path).extract::<AppSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                AppSettings::default()
            }
        }
    }

    fn persist(&self, settings: &AppSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!("saved settings to {:?}", self.config_path);
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn default_provider_id() -> String {
    OLLAMA_PROVIDER_ID.to_string()
}

fn default_ollama_api_url() -> String {
    DEFAULT_OLLAMA_URL.to_string()
}

fn default_model() -> String {
    DEFAULT_OLLAMA_MODEL.to_string()
}

fn default_auto_save() -> bool {
    true
}

fn default_stream_idle_timeout_secs() -> u64 {
    DEFAULT_STREAM_IDLE_TIMEOUT_SECS
}

fn default_temperature() -> f64 {
    DEFAULT_TEMPERATURE
}

fn default_top_p() -> f64 {
    DEFAULT_TOP_P
}

fn default_top_k() -> u32 {
    DEFAULT_TOP_K
}

fn default_max_tokens() -> u64 {
    DEFAULT_MAX_TOKENS
}
