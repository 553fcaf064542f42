use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// CLI / host application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Loopback self-test settings
    pub loopback: LoopbackConfig,
    /// Peer connection settings used by `start`
    pub session: SessionConfig,
}

/// Options accepted by `start`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    /// Start the platform keep-alive service so audio survives backgrounding
    pub enable_background_audio: bool,
    /// STUN/TURN servers handed to the engine
    pub ice_servers: Vec<IceServer>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            enable_background_audio: true,
            ice_servers: vec![],
        }
    }
}

impl SessionConfig {
    pub fn with_ice_server(mut self, server: IceServer) -> Self {
        self.ice_servers.push(server);
        self
    }

    /// Reject server entries the engine would silently ignore
    pub fn validate(&self) -> Result<()> {
        for server in &self.ice_servers {
            let urls = server.urls.to_vec();
            if urls.iter().all(|u| u.trim().is_empty()) {
                return Err(AppError::InvalidArgument(
                    "iceServers entry has no urls".to_string(),
                ));
            }
            let is_turn = urls
                .iter()
                .any(|u| u.starts_with("turn:") || u.starts_with("turns:"));
            if is_turn && (server.username.is_none() || server.credential.is_none()) {
                return Err(AppError::InvalidArgument(format!(
                    "TURN server {} requires username and credential",
                    urls.join(",")
                )));
            }
        }
        Ok(())
    }
}

/// STUN/TURN server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// One URL or a list of URLs (e.g. UDP and TCP TURN transports)
    pub urls: IceUrls,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: IceUrls::One(url.into()),
            username: None,
            credential: None,
        }
    }

    pub fn turn(
        urls: Vec<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: IceUrls::Many(urls),
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }
}

/// `urls` may be a string or an array of strings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IceUrls {
    One(String),
    Many(Vec<String>),
}

impl IceUrls {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            IceUrls::One(url) => vec![url.clone()],
            IceUrls::Many(urls) => urls.clone(),
        }
    }
}

/// Loopback self-test configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopbackConfig {
    /// Data channel label opened by the offering side
    pub channel_label: String,
    /// Text messages sent once the channel opens
    pub messages: Vec<String>,
    /// Seconds to wait for the channel to open
    pub open_timeout_secs: u64,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            channel_label: "loopback".to_string(),
            messages: vec!["hello".to_string()],
            open_timeout_secs: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_options_defaults() {
        let config: SessionConfig = serde_json::from_str("{}").unwrap();
        assert!(config.enable_background_audio);
        assert!(config.ice_servers.is_empty());
    }

    #[test]
    fn test_ice_urls_string_or_list() {
        let config: SessionConfig = serde_json::from_str(
            r#"{
                "iceServers": [
                    {"urls": "stun:stun.l.google.com:19302"},
                    {"urls": ["turn:t.example.com:3478?transport=udp", "turn:t.example.com:3478?transport=tcp"],
                     "username": "u", "credential": "p"}
                ],
                "enableBackgroundAudio": false
            }"#,
        )
        .unwrap();

        assert!(!config.enable_background_audio);
        assert_eq!(config.ice_servers[0].urls.to_vec().len(), 1);
        assert_eq!(config.ice_servers[1].urls.to_vec().len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_turn_without_credentials_rejected() {
        let config = SessionConfig::default().with_ice_server(IceServer {
            urls: IceUrls::One("turn:t.example.com".to_string()),
            username: None,
            credential: None,
        });
        assert!(matches!(
            config.validate(),
            Err(AppError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_empty_urls_rejected() {
        let config = SessionConfig::default().with_ice_server(IceServer {
            urls: IceUrls::Many(vec![]),
            username: None,
            credential: None,
        });
        assert!(config.validate().is_err());
    }
}
