use std::path::{Path, PathBuf};

use super::AppConfig;
use crate::error::{AppError, Result};

/// Configuration store backed by a TOML file
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    config: AppConfig,
}

impl ConfigStore {
    /// Load the config file, writing defaults when it does not exist yet
    pub async fn open(path: &Path) -> Result<Self> {
        let config = match tokio::fs::read_to_string(path).await {
            Ok(text) => parse(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("Config file {} not found, writing defaults", path.display());
                let config = AppConfig::default();
                write(path, &config).await?;
                config
            }
            Err(e) => return Err(e.into()),
        };

        config.session.validate()?;

        Ok(Self {
            path: path.to_path_buf(),
            config,
        })
    }

    /// Current configuration
    pub fn get(&self) -> &AppConfig {
        &self.config
    }

    /// Apply a modification and persist it
    pub async fn update<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut config = self.config.clone();
        f(&mut config);
        config.session.validate()?;
        write(&self.path, &config).await?;
        self.config = config;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn parse(text: &str) -> Result<AppConfig> {
    toml::from_str(text).map_err(|e| AppError::Config(format!("Invalid config file: {}", e)))
}

async fn write(path: &Path, config: &AppConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let text = toml::to_string_pretty(config)
        .map_err(|e| AppError::Config(format!("Failed to serialize config: {}", e)))?;
    tokio::fs::write(path, text).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IceServer;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_config_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cap-webrtc.toml");

        let mut store = ConfigStore::open(&path).await.unwrap();
        assert!(path.exists());
        assert!(store.get().session.enable_background_audio);

        store
            .update(|c| {
                c.session.enable_background_audio = false;
                c.session
                    .ice_servers
                    .push(IceServer::stun("stun:stun.l.google.com:19302"));
            })
            .await
            .unwrap();

        // Reopen and verify persistence
        let store2 = ConfigStore::open(&path).await.unwrap();
        assert!(!store2.get().session.enable_background_audio);
        assert_eq!(store2.get().session.ice_servers.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_file_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        tokio::fs::write(&path, "session = 3").await.unwrap();

        assert!(matches!(
            ConfigStore::open(&path).await,
            Err(AppError::Config(_))
        ));
    }

    #[test]
    fn test_parse_toml_tables() {
        let config = parse(
            r#"
            [session]
            enableBackgroundAudio = false

            [[session.iceServers]]
            urls = "stun:stun.example.com"

            [loopback]
            channel_label = "chat"
            messages = ["a", "b"]
            "#,
        )
        .unwrap();

        assert!(!config.session.enable_background_audio);
        assert_eq!(config.loopback.channel_label, "chat");
        assert_eq!(config.loopback.messages.len(), 2);
        assert_eq!(config.loopback.open_timeout_secs, 10);
    }
}
