use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::watch;

/// Recognized configuration keys.
pub mod key {
    pub const FILTER_ENABLE: &str = "filter/enable";
    pub const PERMANENT_VERDICTS: &str = "filter/permanentVerdicts";
    pub const PROMPT_TIMEOUT: &str = "filter/promptTimeout";
    /// Legacy alias of [`PROMPT_TIMEOUT`].
    pub const ASK_TIMEOUT: &str = "filter/askTimeout";
    pub const ASK_WITH_SYSTEM_NOTIFICATIONS: &str = "filter/askWithSystemNotifications";
    pub const DEV_MODE: &str = "core/devMode";
    pub const API_LISTEN_ADDRESS: &str = "api/listenAddress";
}

/// Global runtime configuration of the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// When off, every verdict is Accept.
    pub filter_enabled: bool,
    /// Allow handing verdicts to the kernel permanently.
    pub permanent_verdicts: bool,
    /// How long a prompt notification stays valid.
    pub prompt_timeout: Duration,
    /// Route prompts through the OS notifier instead of the UI.
    pub ask_with_system_notifications: bool,
    /// Disables API authentication.
    pub dev_mode: bool,
    /// Where the API listens; used by the fast-track gate.
    pub api_listen_address: Option<SocketAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            filter_enabled: true,
            permanent_verdicts: true,
            prompt_timeout: Duration::from_secs(60),
            ask_with_system_notifications: true,
            dev_mode: false,
            api_listen_address: None,
        }
    }
}

impl Config {
    /// Applies a single key/value update; returns false for unknown keys.
    pub fn apply(&mut self, config_key: &str, value: &serde_json::Value) -> bool {
        match config_key {
            key::FILTER_ENABLE => {
                self.filter_enabled = value.as_bool().unwrap_or(self.filter_enabled);
            }
            key::PERMANENT_VERDICTS => {
                self.permanent_verdicts = value.as_bool().unwrap_or(self.permanent_verdicts);
            }
            key::PROMPT_TIMEOUT | key::ASK_TIMEOUT => {
                if let Some(secs) = value.as_u64() {
                    self.prompt_timeout = Duration::from_secs(secs);
                }
            }
            key::ASK_WITH_SYSTEM_NOTIFICATIONS => {
                self.ask_with_system_notifications =
                    value.as_bool().unwrap_or(self.ask_with_system_notifications);
            }
            key::DEV_MODE => {
                self.dev_mode = value.as_bool().unwrap_or(self.dev_mode);
            }
            key::API_LISTEN_ADDRESS => {
                self.api_listen_address = value.as_str().and_then(|s| s.parse().ok());
            }
            _ => return false,
        }

        true
    }
}

/// Shared handle to the live configuration.
///
/// Readers keep a [`watch::Receiver`]; updates go through [`ConfigHandle::update`]
/// and wake the reset coordinator.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    tx: watch::Sender<Config>,
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        let (tx, _) = watch::channel(config);
        Self { tx }
    }

    pub fn current(&self) -> Config {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Config> {
        self.tx.subscribe()
    }

    pub fn update(&self, f: impl FnOnce(&mut Config)) {
        self.tx.send_modify(f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn applies_known_keys() {
        let mut config = Config::default();

        assert!(config.apply(key::FILTER_ENABLE, &json!(false)));
        assert!(config.apply(key::ASK_TIMEOUT, &json!(30)));
        assert!(config.apply(key::API_LISTEN_ADDRESS, &json!("127.0.0.1:817")));

        assert!(!config.filter_enabled);
        assert_eq!(config.prompt_timeout, Duration::from_secs(30));
        assert_eq!(config.api_listen_address, Some("127.0.0.1:817".parse().unwrap()));
    }

    #[test]
    fn rejects_unknown_keys() {
        let mut config = Config::default();

        assert!(!config.apply("filter/doesNotExist", &json!(true)));
    }

    #[test]
    fn watchers_see_updates() {
        let handle = ConfigHandle::default();
        let rx = handle.subscribe();

        handle.update(|c| c.filter_enabled = false);

        assert!(!rx.borrow().filter_enabled);
    }
}
