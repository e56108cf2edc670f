// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! `init(config, groupConfig)` (§6) and its storage port, mirroring
//! `echo_app_core::config::ConfigService<S>` over a `ConfigStore`.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

/// Storage port for raw config blobs, keyed by logical name.
pub trait ConfigStore {
    /// Load a raw config blob. Returns `NotFound` when missing.
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError>;
    /// Persist a raw config blob.
    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError>;
}

/// Error type for config operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Key not present in the store.
    #[error("not found")]
    NotFound,
    /// I/O error while reading or writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization/deserialization failure.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    /// Catch-all error variant.
    #[error("other: {0}")]
    Other(String),
}

/// Thin service that serializes config values and delegates storage to a
/// [`ConfigStore`].
pub struct ConfigService<S> {
    store: S,
}

impl<S> ConfigService<S> {
    /// Create a new service using the given store.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Consume the service and return the inner store.
    pub fn into_inner(self) -> S {
        self.store
    }
}

impl<S> ConfigService<S>
where
    S: ConfigStore,
{
    /// Load and deserialize a config value for `key`. Returns `Ok(None)` if
    /// missing.
    pub fn load<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: DeserializeOwned,
    {
        match self.store.load_raw(key) {
            Ok(bytes) => {
                if bytes.is_empty() {
                    return Ok(None);
                }
                let value = serde_json::from_slice(&bytes)?;
                Ok(Some(value))
            }
            Err(ConfigError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Serialize and persist a config value for `key`.
    pub fn save<T>(&self, key: &str, value: &T) -> Result<(), ConfigError>
    where
        T: Serialize,
    {
        let data = serde_json::to_vec_pretty(value)?;
        self.store.save_raw(key, &data)
    }
}

/// Store configs as JSON files under the platform config directory.
pub struct FsConfigStore {
    base: PathBuf,
}

impl FsConfigStore {
    /// Create a store rooted at the user config directory (e.g.
    /// `~/.config/rtmfp-client`).
    pub fn new() -> Result<Self, ConfigError> {
        let proj = ProjectDirs::from("dev", "flyingrobots", "rtmfp-client")
            .ok_or_else(|| ConfigError::Other("could not resolve config dir".into()))?;
        let base = proj.config_dir().to_path_buf();
        fs::create_dir_all(&base)?;
        Ok(Self { base })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.base.join(format!("{key}.json"))
    }
}

impl ConfigStore for FsConfigStore {
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError> {
        let path = self.path_for(key);
        match fs::read(path) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(ConfigError::NotFound),
            Err(err) => Err(ConfigError::Io(err)),
        }
    }

    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, data)?;
        Ok(())
    }
}

/// Top-level library configuration (§6 `init`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Local UDP port to bind (0 = ephemeral).
    pub bind_port: u16,
    /// Whether blocking operations (`connect`, `addStream`, ...) wait for
    /// their signal by default.
    pub is_blocking: bool,
    /// Handshake retry interval before the attempt-cap backoff multiplies
    /// it (§4.2).
    #[serde(with = "duration_millis")]
    pub handshake_retry: Duration,
    /// Ceiling on `read()`'s internal wait before returning zero bytes
    /// (§5 "readAsync ... up to a small interval").
    #[serde(with = "duration_millis")]
    pub read_poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_port: 1935,
            is_blocking: true,
            handshake_retry: Duration::from_millis(1500),
            read_poll_interval: Duration::from_millis(200),
        }
    }
}

/// NetGroup-specific configuration (§6 `connect2Group`, §4.7/§4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    /// How often the fragments-map is re-advertised (§4.9.3).
    #[serde(with = "duration_millis")]
    pub availability_update_period: Duration,
    /// Rolling window kept before eviction (§4.9.7).
    #[serde(with = "duration_millis")]
    pub window_duration: Duration,
    /// Pull target offset: `now - fetch_period` (§4.9.5).
    #[serde(with = "duration_millis")]
    pub fetch_period: Duration,
    /// How long a NetGroup join waits for a single group packet before
    /// falling back to `fallbackUrl` (§3 SUPPLEMENTED "DefaultConnection").
    #[serde(with = "duration_millis")]
    pub fallback_timeout: Duration,
    /// Whether audio fragments use reliable delivery.
    pub audio_reliable: bool,
    /// Whether video fragments use reliable delivery.
    pub video_reliable: bool,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            availability_update_period: Duration::from_millis(100),
            window_duration: Duration::from_secs(8),
            fetch_period: Duration::from_millis(2500),
            fallback_timeout: Duration::from_secs(10),
            audio_reliable: false,
            video_reliable: false,
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        #[allow(clippy::cast_possible_truncation)]
        ser.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(de)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MemStore(RefCell<HashMap<String, Vec<u8>>>);

    impl ConfigStore for MemStore {
        fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError> {
            self.0.borrow().get(key).cloned().ok_or(ConfigError::NotFound)
        }

        fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError> {
            self.0.borrow_mut().insert(key.to_string(), data.to_vec());
            Ok(())
        }
    }

    #[test]
    fn missing_key_loads_as_none() {
        let service = ConfigService::new(MemStore::default());
        let loaded: Option<Config> = service.load("config").unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn round_trips_through_the_store() {
        let service = ConfigService::new(MemStore::default());
        let config = Config { bind_port: 4000, ..Config::default() };
        service.save("config", &config).unwrap();
        let loaded: Option<Config> = service.load("config").unwrap();
        assert_eq!(loaded.unwrap().bind_port, 4000);
    }

    #[test]
    fn defaults_match_protocol_literals() {
        let config = Config::default();
        assert_eq!(config.bind_port, 1935);
        let group = GroupConfig::default();
        assert_eq!(group.fallback_timeout, Duration::from_secs(10));
        assert_eq!(group.fetch_period, Duration::from_millis(2500));
    }
}
