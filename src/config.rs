use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use log::{debug, warn};
use mac_address::MacAddress;
use secrecy::SecretString;
use serde_derive::Deserialize;
use url::Url;

use crate::error::Error;

pub const PARAM_USER: &str = "uc_user";
pub const PARAM_PASSWORD: &str = "uc_password";
pub const PARAM_HOST: &str = "uc_ip";
pub const PARAM_PORT: &str = "uc_port";
pub const PARAM_SITE: &str = "uc_site";

const DEFAULT_SITE: &str = "default";
const DEVICE_KEY_DELIMITER: char = ':';

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub poll: Option<PollConfig>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct PollConfig {
    pub short_poll_seconds: Option<u64>,
    pub long_poll_seconds: Option<u64>,
    pub request_timeout_seconds: Option<u64>,
}

impl PollConfig {
    pub fn short_interval(&self) -> Duration {
        Duration::from_secs(self.short_poll_seconds.unwrap_or(10).max(1))
    }

    pub fn long_interval(&self) -> Duration {
        Duration::from_secs(self.long_poll_seconds.unwrap_or(30).max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds.unwrap_or(10).max(1))
    }
}

/// A device named in `[params]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    pub address: MacAddress,
    pub name: String,
}

/// Controller access, fixed for the lifetime of the process.
#[derive(Debug)]
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
    pub site: String,
    pub base_url: Url,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::de::from_str(&contents)?)
    }

    pub fn poll(&self) -> PollConfig {
        self.poll.clone().unwrap_or_default()
    }

    /// Every parameter whose key contains the delimiter, in key order.
    /// Entries that do not name a valid hardware address are skipped.
    pub fn devices(&self) -> Vec<DeviceEntry> {
        self.params
            .iter()
            .filter_map(|(key, value)| match parse_device_entry(key, value)? {
                Ok(entry) => {
                    debug!("{} => {}", entry.address, entry.name);
                    Some(entry)
                }
                Err(err) => {
                    warn!("Skipping device entry: {}", err);
                    None
                }
            })
            .collect()
    }

    /// Builds controller credentials, reporting every missing or invalid
    /// parameter rather than stopping at the first.
    pub fn credentials(&self) -> Result<Credentials, Vec<Error>> {
        let mut errors = Vec::new();
        let mut required = |key: &'static str| match self.params.get(key) {
            Some(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
            _ => {
                errors.push(Error::MissingParam(key));
                None
            }
        };

        let username = required(PARAM_USER);
        let password = required(PARAM_PASSWORD);
        let host = required(PARAM_HOST);
        let port = required(PARAM_PORT);

        let port = port.and_then(|port| match port.parse::<u16>() {
            Ok(port) => Some(port),
            Err(err) => {
                errors.push(Error::InvalidParam {
                    key: PARAM_PORT.to_string(),
                    reason: err.to_string(),
                });
                None
            }
        });

        let base_url = match (host, port) {
            (Some(host), Some(port)) => match Url::parse(&format!("https://{host}:{port}")) {
                Ok(url) => Some(url),
                Err(err) => {
                    errors.push(Error::InvalidParam {
                        key: PARAM_HOST.to_string(),
                        reason: err.to_string(),
                    });
                    None
                }
            },
            _ => None,
        };

        match (username, password, base_url) {
            (Some(username), Some(password), Some(base_url)) if errors.is_empty() => {
                Ok(Credentials {
                    username,
                    password: SecretString::from(password),
                    site: self
                        .params
                        .get(PARAM_SITE)
                        .map(|site| site.trim())
                        .filter(|site| !site.is_empty())
                        .unwrap_or(DEFAULT_SITE)
                        .to_string(),
                    base_url,
                })
            }
            _ => Err(errors),
        }
    }
}

/// Interprets one `[params]` entry. Keys without the delimiter are scalar
/// settings and yield `None`.
///
/// Two layouts are accepted: `"aa:bb:cc:dd:ee:ff" = "Phone"` and
/// `"Phone:aa:bb:cc:dd:ee:ff" = ""`.
fn parse_device_entry(key: &str, value: &str) -> Option<Result<DeviceEntry, Error>> {
    if !key.contains(DEVICE_KEY_DELIMITER) {
        return None;
    }

    if let Ok(address) = key.parse::<MacAddress>() {
        let name = match value.trim() {
            "" => key.to_string(),
            name => name.to_string(),
        };
        return Some(Ok(DeviceEntry { address, name }));
    }

    let (name, address) = key.split_once(DEVICE_KEY_DELIMITER)?;
    Some(
        address
            .trim()
            .parse::<MacAddress>()
            .map(|address| DeviceEntry {
                address,
                name: name.trim().to_string(),
            })
            .map_err(|err| Error::InvalidParam {
                key: key.to_string(),
                reason: err.to_string(),
            }),
    )
}
