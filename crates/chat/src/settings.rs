use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chatline_llm::{DEFAULT_ENDPOINT, DEFAULT_MODEL, OPENROUTER_PROVIDER_ID, ProviderConfig};
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::assembler::AssemblyOptions;
use crate::hydration::HydrationOptions;
use crate::orchestrator::ErrorPartialPolicy;

pub const SETTINGS_DIRECTORY_NAME: &str = "chatline";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "chatline.db";
pub const ENV_PREFIX: &str = "CHATLINE_";
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 250;
pub const DEFAULT_MAX_STREAMED_ATTACHMENTS: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
    pub default_model: String,
    pub request_timeout_secs: Option<u64>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            provider_id: OPENROUTER_PROVIDER_ID.to_string(),
            api_key: String::new(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            request_timeout_secs: None,
        }
    }
}

impl ProviderSettings {
    pub fn to_provider_config(&self) -> Option<ProviderConfig> {
        if self.api_key.trim().is_empty() {
            return None;
        }

        let config = ProviderConfig::new(&self.provider_id, &self.api_key, &self.endpoint);
        Some(match self.request_timeout_secs {
            Some(seconds) => config.with_request_timeout_secs(seconds),
            None => config,
        })
    }

    pub fn is_valid(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();
        self.provider_id = non_blank_or(self.provider_id, defaults.provider_id);
        self.api_key = self.api_key.trim().to_string();
        self.endpoint = non_blank_or(self.endpoint, defaults.endpoint);
        self.default_model = non_blank_or(self.default_model, defaults.default_model);
        self.request_timeout_secs = self.request_timeout_secs.filter(|seconds| *seconds > 0);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceSettings {
    pub flush_interval_ms: u64,
    pub max_streamed_attachments: usize,
    pub error_partial_policy: ErrorPartialPolicy,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            max_streamed_attachments: DEFAULT_MAX_STREAMED_ATTACHMENTS,
            error_partial_policy: ErrorPartialPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub database_path: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSettings {
    pub provider: ProviderSettings,
    pub assembly: AssemblyOptions,
    pub hydration: HydrationOptions,
    pub persistence: PersistenceSettings,
    pub storage: StorageSettings,
}

impl ChatSettings {
    pub fn normalized(mut self) -> Self {
        self.provider = self.provider.normalized();
        self.assembly.recent_window = self.assembly.recent_window.max(1);
        if self.hydration.fetch_timeout_ms == 0 {
            self.hydration.fetch_timeout_ms = HydrationOptions::default().fetch_timeout_ms;
        }
        if self.storage.database_path.as_os_str().is_empty() {
            self.storage.database_path = default_database_path();
        }
        self
    }
}

/// Current settings behind an [`ArcSwap`], persisted as pretty JSON.
///
/// Load order: built-in defaults, then the JSON file, then `CHATLINE_*` environment
/// variables (`__` separates nested keys, e.g. `CHATLINE_PROVIDER__API_KEY`).
pub struct SettingsStore {
    settings: Arc<ArcSwap<ChatSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".chatline"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        Self::with_env_prefix(config_path, ENV_PREFIX)
    }

    pub fn with_env_prefix(config_path: PathBuf, env_prefix: &str) -> Self {
        let settings = Self::load_layers(&config_path, env_prefix);
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

    pub fn settings(&self) -> Arc<ChatSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: ChatSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_layers(path: &Path, env_prefix: &str) -> ChatSettings {
        let mut figment = Figment::from(Serialized::defaults(ChatSettings::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        } else {
            tracing::info!(path = ?path, "settings file not found, using defaults");
        }
        figment = figment.merge(Env::prefixed(env_prefix).split("__"));

        match figment.extract::<ChatSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = ?path,
                    error = %error,
                    "failed to parse settings, using defaults"
                );
                ChatSettings::default()
            }
        }
    }

    fn persist(&self, settings: &ChatSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
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

        tracing::info!(path = ?self.config_path, "saved settings");
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

fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
        .unwrap_or_else(|| PathBuf::from(".chatline"))
        .join(DATABASE_FILE_NAME)
}

fn non_blank_or(value: String, fallback: String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::assembler::ImageInclusionPolicy;

    fn settings_path(dir: &TempDir) -> PathBuf {
        dir.path().join("nested").join(SETTINGS_FILE_NAME)
    }

    fn unique_prefix() -> String {
        format!("CHATLINE_TEST_{}_", uuid::Uuid::now_v7().simple())
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().expect("temp dir");

        let store = SettingsStore::with_env_prefix(settings_path(&dir), &unique_prefix());
        let settings = store.settings();

        assert_eq!(settings.assembly.max_image_inputs, 4);
        assert!(settings.assembly.dedupe_images);
        assert_eq!(settings.assembly.image_inclusion_policy, ImageInclusionPolicy::Recent);
        assert_eq!(settings.assembly.recent_window, 6);
        assert_eq!(settings.hydration.fetch_timeout_ms, 15_000);
        assert_eq!(settings.hydration.max_fetch_bytes, 20 * 1024 * 1024);
        assert_eq!(settings.persistence.flush_interval_ms, 250);
        assert_eq!(settings.persistence.max_streamed_attachments, 6);
        assert_eq!(
            settings.persistence.error_partial_policy,
            ErrorPartialPolicy::KeepNonEmpty
        );
        assert!(!settings.provider.is_valid());
    }

    #[test]
    fn file_values_merge_over_defaults_and_blanks_normalize() {
        let dir = TempDir::new().expect("temp dir");
        let path = settings_path(&dir);
        std::fs::create_dir_all(path.parent().expect("has parent")).expect("create dir");
        std::fs::write(
            &path,
            r#"{
                "provider": {"api_key": " sk-test ", "endpoint": "  ", "default_model": "vision-1"},
                "assembly": {"image_inclusion_policy": "recent-user", "recent_window": 0},
                "persistence": {"error_partial_policy": "always-keep"}
            }"#,
        )
        .expect("write settings");

        let settings = SettingsStore::with_env_prefix(path, &unique_prefix()).settings();

        assert_eq!(settings.provider.api_key, "sk-test");
        assert_eq!(settings.provider.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(settings.provider.default_model, "vision-1");
        assert_eq!(
            settings.assembly.image_inclusion_policy,
            ImageInclusionPolicy::RecentUser
        );
        assert_eq!(settings.assembly.recent_window, 1);
        assert_eq!(settings.assembly.max_image_inputs, 4);
        assert_eq!(
            settings.persistence.error_partial_policy,
            ErrorPartialPolicy::AlwaysKeep
        );
        let config = settings.provider.to_provider_config().expect("key present");
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
    }

    #[test]
    #[allow(unsafe_code)]
    fn environment_overrides_file() {
        let dir = TempDir::new().expect("temp dir");
        let prefix = unique_prefix();
        // SAFETY: the variable name is unique to this test.
        unsafe {
            std::env::set_var(format!("{prefix}PROVIDER__DEFAULT_MODEL"), "env-model");
        }

        let settings = SettingsStore::with_env_prefix(settings_path(&dir), &prefix).settings();

        assert_eq!(settings.provider.default_model, "env-model");
    }

    #[test]
    fn update_persists_and_reloads() {
        let dir = TempDir::new().expect("temp dir");
        let prefix = unique_prefix();
        let store = SettingsStore::with_env_prefix(settings_path(&dir), &prefix);

        let mut settings = (*store.settings()).clone();
        settings.persistence.flush_interval_ms = 40;
        settings.provider.api_key = "sk-live".to_string();
        store.update(settings).expect("persisted");

        let reloaded = SettingsStore::with_env_prefix(settings_path(&dir), &prefix).settings();
        assert_eq!(reloaded.persistence.flush_interval_ms, 40);
        assert_eq!(reloaded.provider.api_key, "sk-live");
        assert!(!settings_path(&dir).with_extension("json.tmp").exists());
    }
}
