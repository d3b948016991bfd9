// Persisted device configuration and identity.
// Numan Thabit 2025

use std::{
    fs, io,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Factory-default server address; a device still pointing here is
/// considered unprovisioned.
pub const DEFAULT_SERVER_ADDR: &str = "192.168.1.100";

/// Factory-default server port.
pub const DEFAULT_SERVER_PORT: u16 = 8080;

/// Separator between fields of the registration tuple.
pub const RECORD_SEPARATOR: u8 = 0x1E;

/// Error returned while loading, saving, or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error touching the backing file.
    #[error("failed to access config '{path}': {source}")]
    Io {
        /// Path that failed.
        path: PathBuf,
        /// Source IO error.
        #[source]
        source: io::Error,
    },
    /// Error parsing the stored contents.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// Error serialising the contents for storage.
    #[error("failed to serialise config: {0}")]
    Serialise(#[from] toml::ser::Error),
    /// The configuration did not pass validation checks.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// Persisted key/value namespace written by the provisioning portal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Wi-Fi network name.
    pub ssid: String,
    /// Wi-Fi passphrase.
    pub pass: String,
    /// Telemetry server address (hostname or IP).
    pub srv_ip: String,
    /// Telemetry server TCP port.
    pub srv_port: u16,
    /// Device token issued at registration; absent until the first
    /// successful AUTH_ACK that carries one.
    pub token: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            ssid: String::new(),
            pass: String::new(),
            srv_ip: DEFAULT_SERVER_ADDR.to_string(),
            srv_port: DEFAULT_SERVER_PORT,
            token: None,
        }
    }
}

impl DeviceConfig {
    /// Returns `true` once the provisioning portal has written a real
    /// server address and Wi-Fi credentials.
    pub fn is_provisioned(&self) -> bool {
        !self.ssid.is_empty() && !self.srv_ip.is_empty() && self.srv_ip != DEFAULT_SERVER_ADDR
    }

    /// Returns `true` when a registration token is stored.
    pub fn is_registered(&self) -> bool {
        self.token.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Validates field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.srv_ip.is_empty() {
            return Err(ConfigError::Validation("server address is empty".into()));
        }
        if self.srv_port == 0 {
            return Err(ConfigError::Validation("server port is zero".into()));
        }
        Ok(())
    }
}

impl FromStr for DeviceConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cfg: Self = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Storage seam for the persisted namespace. The session machine only
/// touches configuration through this trait.
pub trait ConfigStore {
    /// Loads the current configuration, falling back to defaults when the
    /// namespace is empty.
    fn load(&self) -> Result<DeviceConfig, ConfigError>;

    /// Replaces the stored configuration.
    fn save(&mut self, config: &DeviceConfig) -> Result<(), ConfigError>;

    /// Persists a freshly issued device token without disturbing the rest.
    fn save_token(&mut self, token: &str) -> Result<(), ConfigError>;

    /// Clears the namespace back to factory defaults.
    fn clear(&mut self) -> Result<(), ConfigError>;
}

/// TOML-file-backed store.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Creates a store rooted at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Returns the backing path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, config: &DeviceConfig) -> Result<(), ConfigError> {
        let contents = toml::to_string(config)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: self.path.clone(),
                source,
            })?;
        }
        fs::write(&self.path, contents).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

impl ConfigStore for FileStore {
    fn load(&self) -> Result<DeviceConfig, ConfigError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => DeviceConfig::from_str(&contents),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(DeviceConfig::default()),
            Err(source) => Err(ConfigError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn save(&mut self, config: &DeviceConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.write(config)
    }

    fn save_token(&mut self, token: &str) -> Result<(), ConfigError> {
        let mut config = self.load()?;
        config.token = Some(token.to_string());
        self.write(&config)
    }

    fn clear(&mut self) -> Result<(), ConfigError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ConfigError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

/// In-memory store for tests and hosts without a filesystem namespace.
#[derive(Debug, Default)]
pub struct MemoryStore {
    current: DeviceConfig,
}

impl MemoryStore {
    /// Creates a store seeded with `config`.
    pub fn new(config: DeviceConfig) -> Self {
        Self { current: config }
    }
}

impl ConfigStore for MemoryStore {
    fn load(&self) -> Result<DeviceConfig, ConfigError> {
        Ok(self.current.clone())
    }

    fn save(&mut self, config: &DeviceConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.current = config.clone();
        Ok(())
    }

    fn save_token(&mut self, token: &str) -> Result<(), ConfigError> {
        self.current.token = Some(token.to_string());
        Ok(())
    }

    fn clear(&mut self) -> Result<(), ConfigError> {
        self.current = DeviceConfig::default();
        Ok(())
    }
}

/// Static identity reported during DEVICE_REGISTER.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Hardware model string.
    pub model: String,
    /// Serial number.
    pub serial: String,
    /// Link-layer MAC address string.
    pub mac: String,
    /// Hardware revision.
    pub hw_rev: String,
    /// Firmware revision.
    pub fw_rev: String,
    /// Device class code.
    pub device_class: String,
}

impl DeviceIdentity {
    /// Builds the 0x1E-separated registration tuple
    /// `model ∥ serial ∥ mac ∥ hw_rev ∥ fw_rev ∥ device_class`.
    pub fn registration_payload(&self) -> Vec<u8> {
        let fields = [
            self.model.as_bytes(),
            self.serial.as_bytes(),
            self.mac.as_bytes(),
            self.hw_rev.as_bytes(),
            self.fw_rev.as_bytes(),
            self.device_class.as_bytes(),
        ];
        let len: usize = fields.iter().map(|f| f.len()).sum::<usize>() + fields.len() - 1;
        let mut out = Vec::with_capacity(len);
        for (index, field) in fields.iter().enumerate() {
            if index > 0 {
                out.push(RECORD_SEPARATOR);
            }
            out.extend_from_slice(field);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path() -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("goster-config-{}.toml", rand::random::<u64>()));
        path
    }

    #[test]
    fn defaults_are_unprovisioned() {
        let cfg = DeviceConfig::default();
        assert!(!cfg.is_provisioned());
        assert!(!cfg.is_registered());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn file_store_round_trip() {
        let path = temp_path();
        let mut store = FileStore::new(&path);

        let cfg = DeviceConfig {
            ssid: "lab".into(),
            pass: "hunter2".into(),
            srv_ip: "10.0.0.5".into(),
            srv_port: 9090,
            token: None,
        };
        store.save(&cfg).expect("save");
        assert_eq!(store.load().expect("load"), cfg);

        store.save_token("tok-123").expect("token");
        let loaded = store.load().expect("reload");
        assert_eq!(loaded.token.as_deref(), Some("tok-123"));
        assert!(loaded.is_registered());

        store.clear().expect("clear");
        assert_eq!(store.load().expect("fresh"), DeviceConfig::default());
        fs::remove_file(path).ok();
    }

    #[test]
    fn rejects_zero_port() {
        let input = "srv_ip = \"10.0.0.1\"\nsrv_port = 0\n";
        assert!(matches!(
            DeviceConfig::from_str(input),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn registration_tuple_layout() {
        let identity = DeviceIdentity {
            model: "GW-1".into(),
            serial: "SN123456".into(),
            mac: "AA:BB:CC:DD:EE:FF".into(),
            hw_rev: "1.0".into(),
            fw_rev: "1.0".into(),
            device_class: "1".into(),
        };
        let payload = identity.registration_payload();
        let parts: Vec<&[u8]> = payload.split(|&b| b == RECORD_SEPARATOR).collect();
        assert_eq!(parts.len(), 6);
        assert_eq!(parts[0], b"GW-1");
        assert_eq!(parts[5], b"1");
    }
}
