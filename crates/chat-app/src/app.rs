use std::sync::Arc;

use murmur_llm::create_provider;
use murmur_storage::SqliteStorage;
use snafu::{OptionExt, ResultExt};
use tokio::sync::mpsc;

use crate::config::SettingsStore;
use crate::conversation::{ConversationController, DisplayEvent};
use crate::error::{
    CreateProviderSnafu, DatabasePathSnafu, OpenStorageSnafu, SaveSettingsSnafu, StartupError,
};

/// Wires settings, the chat history database and the model provider into a
/// controller that reports to `display`.
///
/// A settings file is written with the defaults on first run so users have
/// something to edit.
pub async fn open_controller(
    settings: Arc<SettingsStore>,
    display: mpsc::UnboundedSender<DisplayEvent>,
) -> Result<ConversationController, StartupError> {
    let current = settings.settings();
    if !settings.config_path().exists() {
        settings
            .update((*current).clone())
            .context(SaveSettingsSnafu {
                stage: "write-default-settings",
            })?;
    }

    let database_path = current.database_path();
    let location = database_path.to_str().context(DatabasePathSnafu {
        stage: "resolve-database-path",
        path: database_path.clone(),
    })?;
    let storage = SqliteStorage::open(location)
        .await
        .context(OpenStorageSnafu {
            stage: "open-chat-history",
        })?;

    let provider = create_provider(current.provider_config()).context(CreateProviderSnafu {
        stage: "create-provider",
    })?;

    tracing::info!(
        database = %database_path.display(),
        provider = %provider.name(),
        provider_id = %provider.id(),
        base_url = %current.ollama_api_url,
        model_id = %provider.default_model(),
        "murmur ready"
    );

    Ok(ConversationController::new(
        Arc::new(storage),
        provider,
        settings,
        display,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppSettings, SETTINGS_FILE_NAME};

    #[tokio::test]
    async fn first_run_writes_settings_and_opens_history() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config_path = dir.path().join("config").join(SETTINGS_FILE_NAME);
        let settings = Arc::new(SettingsStore::new(config_path.clone()));
        let mut configured = AppSettings::default();
        configured.database_path = Some(dir.path().join("data").join("chat_history.db"));
        settings.update(configured).expect("seed settings");
        // Only the in-memory copy survives; the file must be rewritten on open.
        std::fs::remove_file(&config_path).expect("remove seeded file");

        let (display_tx, _display_rx) = mpsc::unbounded_channel();
        let controller = open_controller(settings, display_tx)
            .await
            .expect("controller opens");

        assert!(config_path.exists());
        assert!(dir.path().join("data").join("chat_history.db").exists());
        assert!(controller.refresh_sessions().expect("sessions").is_empty());
    }

    #[tokio::test]
    async fn unknown_provider_is_a_startup_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = Arc::new(SettingsStore::new(dir.path().join(SETTINGS_FILE_NAME)));
        let mut configured = AppSettings::default();
        configured.provider_id = "openai".to_string();
        configured.database_path = Some(dir.path().join("chat_history.db"));
        settings.update(configured).expect("save settings");

        let (display_tx, _display_rx) = mpsc::unbounded_channel();
        let error = match open_controller(settings, display_tx).await {
            Ok(_) => panic!("openai is not a supported provider"),
            Err(error) => error,
        };
        assert!(matches!(error, StartupError::CreateProvider { .. }));
    }
}
