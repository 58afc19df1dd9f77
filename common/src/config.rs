use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_SSID_LEN: usize = 32;
pub const MAX_PASSPHRASE_LEN: usize = 64;
pub const MAX_DEVICE_ID_LEN: usize = 15;
pub const MAX_LOCATION_LEN: usize = 15;
pub const MAX_DESTINATION_LEN: usize = 31;
pub const MAX_SERVER_ADDRESS_LEN: usize = 255;
pub const MAX_AUTH_TOKEN_LEN: usize = 255;

/// Hardware address of the access point the node last joined.
///
/// All zero bytes mean the address is unknown and the next join has to scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bssid(pub [u8; 6]);

impl Bssid {
    pub const UNKNOWN: Bssid = Bssid([0; 6]);

    pub fn is_unknown(&self) -> bool {
        self.0.iter().all(|byte| *byte == 0)
    }
}

impl fmt::Display for Bssid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}-{b:02x}-{c:02x}-{d:02x}-{e:02x}-{g:02x}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid access point address `{0}`")]
pub struct ParseBssidError(pub String);

impl FromStr for Bssid {
    type Err = ParseBssidError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let mut bytes = [0_u8; 6];
        let mut parts = trimmed.split(['-', ':']);

        for byte in bytes.iter_mut() {
            let part = parts
                .next()
                .filter(|part| (1..=2).contains(&part.len()))
                .ok_or_else(|| ParseBssidError(trimmed.to_string()))?;
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| ParseBssidError(trimmed.to_string()))?;
        }

        if parts.next().is_some() {
            return Err(ParseBssidError(trimmed.to_string()));
        }

        Ok(Bssid(bytes))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSection {
    pub wifi_enabled: bool,
    pub ssid: String,
    pub passphrase: String,
    pub bssid: Bssid,
    pub channel: u8,
    pub con_delay_ms: u16,
    pub max_con_attempts: u16,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            wifi_enabled: true,
            ssid: String::new(),
            passphrase: String::new(),
            bssid: Bssid::UNKNOWN,
            channel: 0,
            con_delay_ms: 150,
            max_con_attempts: 60,
        }
    }
}

impl NetworkSection {
    /// Drops the memoized access point so the next join scans by name.
    pub fn forget_access_point(&mut self) {
        self.bssid = Bssid::UNKNOWN;
        self.channel = 0;
    }

    pub fn sanitize(&mut self) {
        truncate_utf8(&mut self.ssid, MAX_SSID_LEN);
        truncate_utf8(&mut self.passphrase, MAX_PASSPHRASE_LEN);

        if self.bssid.is_unknown() || self.channel == 0 {
            self.forget_access_point();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadSection {
    pub interval_s: u32,
    pub deadline_s: u16,
    pub device_id: String,
    pub location: String,
    pub org: String,
    pub bucket: String,
    pub measurement: String,
}

impl Default for UploadSection {
    fn default() -> Self {
        Self {
            interval_s: 180,
            deadline_s: 20,
            device_id: String::new(),
            location: String::new(),
            org: String::new(),
            bucket: String::new(),
            measurement: String::new(),
        }
    }
}

impl UploadSection {
    pub fn sanitize(&mut self) {
        truncate_utf8(&mut self.device_id, MAX_DEVICE_ID_LEN);
        truncate_utf8(&mut self.location, MAX_LOCATION_LEN);
        truncate_utf8(&mut self.org, MAX_DESTINATION_LEN);
        truncate_utf8(&mut self.bucket, MAX_DESTINATION_LEN);
        truncate_utf8(&mut self.measurement, MAX_DESTINATION_LEN);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSection {
    pub address: String,
    pub port: u16,
    pub auth_token: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: 443,
            auth_token: String::new(),
        }
    }
}

impl ServerSection {
    pub fn sanitize(&mut self) {
        truncate_utf8(&mut self.address, MAX_SERVER_ADDRESS_LEN);
        truncate_utf8(&mut self.auth_token, MAX_AUTH_TOKEN_LEN);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplaySection {
    pub contrast: u8,
    pub rotated: bool,
}

impl Default for DisplaySection {
    fn default() -> Self {
        Self {
            contrast: 137,
            rotated: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorSection {
    pub temp_correction: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatterySection {
    pub min_level: u16,
    pub max_level: u16,
}

impl Default for BatterySection {
    fn default() -> Self {
        Self {
            min_level: 508,
            max_level: 853,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("wake interval must be positive")]
    ZeroWakeInterval,
    #[error("upload deadline must be positive")]
    ZeroUploadDeadline,
}

/// The single persisted record of device settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationRecord {
    pub network: NetworkSection,
    pub upload: UploadSection,
    pub server: ServerSection,
    pub display: DisplaySection,
    pub sensor: SensorSection,
    pub battery: BatterySection,
}

impl ConfigurationRecord {
    pub fn sanitize(&mut self) {
        self.network.sanitize();
        self.upload.sanitize();
        self.server.sanitize();
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upload.interval_s == 0 {
            return Err(ConfigError::ZeroWakeInterval);
        }
        if self.upload.deadline_s == 0 {
            return Err(ConfigError::ZeroUploadDeadline);
        }
        Ok(())
    }
}

/// Shortens `value` to at most `max` bytes without splitting a character.
pub fn truncate_utf8(value: &mut String, max: usize) {
    if value.len() <= max {
        return;
    }
    let mut end = max;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value.truncate(end);
}
