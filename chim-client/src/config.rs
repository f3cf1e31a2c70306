use std::{
    fs,
    net::Ipv4Addr,
    path::{Path, PathBuf},
    time::Duration,
};

use chim_core::{DEFAULT_GROUP, DEFAULT_PORT, validate_identity};
use chim_net::MessengerConfig;
use serde::{Deserialize, Serialize};

pub const MAX_CONFIG_BYTES: u64 = 16 * 1024;
const APP_DIR_NAME: &str = "Chim";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SavedClientConfig {
    pub identity: String,
    #[serde(default = "default_group")]
    pub group: Ipv4Addr,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_group() -> Ipv4Addr {
    DEFAULT_GROUP
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl SavedClientConfig {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            group: DEFAULT_GROUP,
            port: DEFAULT_PORT,
        }
    }

    pub fn messenger_config(&self) -> MessengerConfig {
        MessengerConfig::new(self.identity.trim()).with_group(self.group, self.port)
    }
}

/// Per-user directory for config and logs.
///
/// `CHIM_CONFIG_DIR` overrides the platform location.
pub fn chim_data_dir() -> PathBuf {
    let dir = if let Some(override_dir) = std::env::var_os("CHIM_CONFIG_DIR") {
        PathBuf::from(override_dir)
    } else if let Some(local_app_data) = std::env::var_os("LOCALAPPDATA") {
        PathBuf::from(local_app_data).join(APP_DIR_NAME)
    } else if let Some(home) = std::env::var_os("HOME") {
        PathBuf::from(home).join(".chim")
    } else {
        PathBuf::from(".")
    };
    let _ = fs::create_dir_all(&dir);
    dir
}

pub fn client_config_path() -> PathBuf {
    chim_data_dir().join("config.json")
}

pub fn validate_saved_config(cfg: &SavedClientConfig) -> Result<(), String> {
    let mut errors: Vec<String> = Vec::new();

    if let Err(err) = validate_identity(&cfg.identity) {
        errors.push(format!("Identity is invalid: {err}."));
    }
    if !cfg.group.is_multicast() {
        errors.push(format!(
            "Group {} is not a multicast address (224.0.0.0/4).",
            cfg.group
        ));
    }
    if cfg.port == 0 {
        errors.push("Port must not be 0.".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(format!(
            "Please fix the following:\n\n- {}",
            errors.join("\n- ")
        ))
    }
}

pub fn load_saved_config_from_path(path: &Path) -> Result<Option<SavedClientConfig>, String> {
    if !path.exists() {
        return Ok(None);
    }

    let meta = fs::metadata(path)
        .map_err(|err| format!("failed to stat config file {}: {err}", path.display()))?;
    if meta.len() > MAX_CONFIG_BYTES {
        return Err(format!(
            "config file {} is too large ({} > {} bytes)",
            path.display(),
            meta.len(),
            MAX_CONFIG_BYTES
        ));
    }

    let data = fs::read_to_string(path)
        .map_err(|err| format!("failed to read config file {}: {err}", path.display()))?;
    let cfg: SavedClientConfig = serde_json::from_str(&data)
        .map_err(|err| format!("failed to parse config file {}: {err}", path.display()))?;

    validate_saved_config(&cfg)?;
    Ok(Some(cfg))
}

pub fn load_saved_config() -> Result<Option<SavedClientConfig>, String> {
    load_saved_config_from_path(&client_config_path())
}

pub fn save_saved_config_to_path(path: &Path, cfg: &SavedClientConfig) -> Result<(), String> {
    validate_saved_config(cfg)?;

    const MAX_ATTEMPTS: u32 = 3;
    const BACKOFF_BASE_MS: u64 = 50;

    let tmp_path = path.with_extension("json.tmp");
    let payload = serde_json::to_string_pretty(cfg).map_err(|err| err.to_string())?;

    let mut attempt: u32 = 1;
    loop {
        let result: Result<(), String> = (|| {
            fs::write(&tmp_path, payload.as_bytes())
                .map_err(|err| format!("failed to write {}: {err}", tmp_path.display()))?;

            if path.exists() {
                let _ = fs::remove_file(path);
            }
            fs::rename(&tmp_path, path).map_err(|err| {
                format!("failed to move config into place {}: {err}", path.display())
            })
        })();

        match result {
            Ok(()) => return Ok(()),
            Err(err) if attempt >= MAX_ATTEMPTS => return Err(err),
            Err(_) => {
                let backoff_ms = BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1));
                std::thread::sleep(Duration::from_millis(backoff_ms));
                attempt += 1;
            }
        }
    }
}

pub fn save_saved_config(cfg: &SavedClientConfig) -> Result<(), String> {
    save_saved_config_to_path(&client_config_path(), cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_collects_every_problem() {
        let cfg = SavedClientConfig {
            identity: "bad:id".to_owned(),
            group: Ipv4Addr::new(192, 168, 0, 1),
            port: 0,
        };
        let err = validate_saved_config(&cfg).unwrap_err();
        assert!(err.contains("Identity is invalid"), "{err}");
        assert!(err.contains("not a multicast address"), "{err}");
        assert!(err.contains("Port must not be 0"), "{err}");
    }

    #[test]
    fn messenger_config_uses_saved_group() {
        let cfg = SavedClientConfig {
            identity: "  alice ".to_owned(),
            group: Ipv4Addr::new(239, 1, 2, 3),
            port: 6000,
        };
        let messenger = cfg.messenger_config();
        assert_eq!(messenger.identity, "alice");
        assert_eq!(messenger.group_addr().to_string(), "239.1.2.3:6000");
    }

    #[test]
    fn missing_group_and_port_fall_back_to_defaults() {
        let cfg: SavedClientConfig = serde_json::from_str(r#"{"identity":"bob"}"#).unwrap();
        assert_eq!(cfg, SavedClientConfig::new("bob"));
    }
}
