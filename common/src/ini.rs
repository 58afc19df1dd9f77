//! Sectioned `key=value` text format used for the persisted configuration.

use std::fmt::Write as _;

use thiserror::Error;

use crate::config::{
    truncate_utf8, Bssid, ConfigError, ConfigurationRecord, MAX_AUTH_TOKEN_LEN,
    MAX_DESTINATION_LEN, MAX_DEVICE_ID_LEN, MAX_LOCATION_LEN, MAX_PASSPHRASE_LEN,
    MAX_SERVER_ADDRESS_LEN, MAX_SSID_LEN,
};

/// Bytes available to a single line, terminator included.
pub const LINE_BUFFER_LEN: usize = 512;

pub const SECTION_NETWORK: &str = "network";
pub const SECTION_UPLOAD: &str = "data upload";
pub const SECTION_SERVER: &str = "server config";
pub const SECTION_DISPLAY: &str = "display";
pub const SECTION_SENSOR: &str = "sensor";
pub const SECTION_BATTERY: &str = "battery";

pub const KEY_WIFI_ENABLED: &str = "wifi_enabled";
pub const KEY_WIFI_SSID: &str = "wifi_ap_ssid";
pub const KEY_WIFI_PASSPHRASE: &str = "wifi_ap_pwd";
pub const KEY_WIFI_BSSID: &str = "wifi_ap_bssid";
pub const KEY_WIFI_CHANNEL: &str = "wifi_ap_channel";
pub const KEY_WIFI_CON_DELAY: &str = "wifi_con_delay";
pub const KEY_WIFI_MAX_ATTEMPTS: &str = "wifi_max_con_attempts";
pub const KEY_UPLOAD_FREQ: &str = "upload_freq";
pub const KEY_UPLOAD_TIMEOUT: &str = "upload_timeout";
pub const KEY_DEVICE_ID: &str = "device_id";
pub const KEY_LOCATION: &str = "location";
pub const KEY_ORG: &str = "data_measurement_org";
pub const KEY_BUCKET: &str = "data_measurement_bucket";
pub const KEY_MEASUREMENT: &str = "data_measurement_name";
pub const KEY_SERVER_ADDRESS: &str = "server_address";
pub const KEY_SERVER_PORT: &str = "server_port";
pub const KEY_AUTH_TOKEN: &str = "server_auth_token";
pub const KEY_DISPLAY_CONTRAST: &str = "display_contrast";
pub const KEY_DISPLAY_ROTATION: &str = "display_rotation";
pub const KEY_TEMP_CORRECTION: &str = "sensor_temp_correction";
pub const KEY_BATTERY_MIN: &str = "battery_min_level";
pub const KEY_BATTERY_MAX: &str = "battery_max_level";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IniError {
    #[error("configuration is not valid utf-8")]
    NotUtf8,
    #[error("line {line} exceeds the {LINE_BUFFER_LEN} byte line buffer")]
    LineTooLong { line: usize },
    #[error("line {line} is neither a section header nor a key=value pair")]
    Malformed { line: usize },
    #[error("missing `{key}` in section [{section}]")]
    MissingKey {
        section: &'static str,
        key: &'static str,
    },
    #[error("invalid value for `{key}` in section [{section}]")]
    InvalidValue {
        section: &'static str,
        key: &'static str,
    },
    #[error(transparent)]
    Rejected(#[from] ConfigError),
}

#[derive(Debug, Default)]
pub struct IniDocument {
    sections: Vec<(String, Vec<(String, String)>)>,
}

impl IniDocument {
    pub fn parse(text: &str) -> Result<Self, IniError> {
        let mut document = IniDocument::default();

        for (index, raw_line) in text.split('\n').enumerate() {
            let line_no = index + 1;
            if raw_line.len() >= LINE_BUFFER_LEN {
                return Err(IniError::LineTooLong { line: line_no });
            }

            let line = raw_line.strip_suffix('\r').unwrap_or(raw_line);
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with(';') || trimmed.starts_with('#') {
                continue;
            }

            if let Some(header) = trimmed.strip_prefix('[') {
                let name = header
                    .strip_suffix(']')
                    .ok_or(IniError::Malformed { line: line_no })?;
                document
                    .sections
                    .push((name.trim().to_string(), Vec::new()));
                continue;
            }

            let (key, value) = line
                .split_once('=')
                .ok_or(IniError::Malformed { line: line_no })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(IniError::Malformed { line: line_no });
            }

            let Some((_, entries)) = document.sections.last_mut() else {
                return Err(IniError::Malformed { line: line_no });
            };
            entries.push((key.to_string(), value.to_string()));
        }

        Ok(document)
    }

    /// Raw text after `=`; the last occurrence wins.
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .iter()
            .filter(|(name, _)| name == section)
            .flat_map(|(_, entries)| entries.iter())
            .filter(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
            .last()
    }

    fn require(&self, section: &'static str, key: &'static str) -> Result<&str, IniError> {
        self.get(section, key)
            .ok_or(IniError::MissingKey { section, key })
    }

    fn string(
        &self,
        section: &'static str,
        key: &'static str,
        max: usize,
    ) -> Result<String, IniError> {
        let mut value = self.require(section, key)?.to_string();
        truncate_utf8(&mut value, max);
        Ok(value)
    }

    fn parsed<T: std::str::FromStr>(
        &self,
        section: &'static str,
        key: &'static str,
    ) -> Result<T, IniError> {
        scalar_text(self.require(section, key)?)
            .parse()
            .map_err(|_| IniError::InvalidValue { section, key })
    }

    fn flag(&self, section: &'static str, key: &'static str) -> Result<bool, IniError> {
        parse_bool(scalar_text(self.require(section, key)?))
            .ok_or(IniError::InvalidValue { section, key })
    }
}

/// Numeric and boolean values may carry a trailing comment.
fn scalar_text(value: &str) -> &str {
    let end = value.find([';', '#']).unwrap_or(value.len());
    value[..end].trim()
}

pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

impl ConfigurationRecord {
    /// Parses a complete record. Any missing or malformed key fails the whole
    /// load; a partially populated record is never returned.
    pub fn from_ini(text: &str) -> Result<Self, IniError> {
        let doc = IniDocument::parse(text)?;
        let mut record = ConfigurationRecord::default();

        let network = &mut record.network;
        network.wifi_enabled = doc.flag(SECTION_NETWORK, KEY_WIFI_ENABLED)?;
        network.ssid = doc.string(SECTION_NETWORK, KEY_WIFI_SSID, MAX_SSID_LEN)?;
        network.passphrase = doc.string(SECTION_NETWORK, KEY_WIFI_PASSPHRASE, MAX_PASSPHRASE_LEN)?;
        network.bssid = doc.parsed::<Bssid>(SECTION_NETWORK, KEY_WIFI_BSSID)?;
        network.channel = doc.parsed(SECTION_NETWORK, KEY_WIFI_CHANNEL)?;
        network.con_delay_ms = doc.parsed(SECTION_NETWORK, KEY_WIFI_CON_DELAY)?;
        network.max_con_attempts = doc.parsed(SECTION_NETWORK, KEY_WIFI_MAX_ATTEMPTS)?;

        let upload = &mut record.upload;
        upload.interval_s = doc.parsed(SECTION_UPLOAD, KEY_UPLOAD_FREQ)?;
        upload.deadline_s = doc.parsed(SECTION_UPLOAD, KEY_UPLOAD_TIMEOUT)?;
        upload.device_id = doc.string(SECTION_UPLOAD, KEY_DEVICE_ID, MAX_DEVICE_ID_LEN)?;
        upload.location = doc.string(SECTION_UPLOAD, KEY_LOCATION, MAX_LOCATION_LEN)?;
        upload.org = doc.string(SECTION_UPLOAD, KEY_ORG, MAX_DESTINATION_LEN)?;
        upload.bucket = doc.string(SECTION_UPLOAD, KEY_BUCKET, MAX_DESTINATION_LEN)?;
        upload.measurement = doc.string(SECTION_UPLOAD, KEY_MEASUREMENT, MAX_DESTINATION_LEN)?;

        let server = &mut record.server;
        server.address = doc.string(SECTION_SERVER, KEY_SERVER_ADDRESS, MAX_SERVER_ADDRESS_LEN)?;
        server.port = doc.parsed(SECTION_SERVER, KEY_SERVER_PORT)?;
        server.auth_token = doc.string(SECTION_SERVER, KEY_AUTH_TOKEN, MAX_AUTH_TOKEN_LEN)?;

        record.display.contrast = doc.parsed(SECTION_DISPLAY, KEY_DISPLAY_CONTRAST)?;
        record.display.rotated = doc.flag(SECTION_DISPLAY, KEY_DISPLAY_ROTATION)?;

        let correction: f32 = doc.parsed(SECTION_SENSOR, KEY_TEMP_CORRECTION)?;
        if !correction.is_finite() {
            return Err(IniError::InvalidValue {
                section: SECTION_SENSOR,
                key: KEY_TEMP_CORRECTION,
            });
        }
        record.sensor.temp_correction = correction;

        record.battery.min_level = doc.parsed(SECTION_BATTERY, KEY_BATTERY_MIN)?;
        record.battery.max_level = doc.parsed(SECTION_BATTERY, KEY_BATTERY_MAX)?;

        record.validate()?;
        record.sanitize();
        Ok(record)
    }

    pub fn to_ini(&self) -> String {
        let mut out = String::with_capacity(1024);
        let network = &self.network;
        let upload = &self.upload;
        let server = &self.server;

        section(&mut out, SECTION_NETWORK);
        entry(&mut out, KEY_WIFI_ENABLED, network.wifi_enabled);
        entry(&mut out, KEY_WIFI_SSID, &network.ssid);
        entry(&mut out, KEY_WIFI_PASSPHRASE, &network.passphrase);
        entry(&mut out, KEY_WIFI_BSSID, network.bssid);
        entry(&mut out, KEY_WIFI_CHANNEL, network.channel);
        entry(&mut out, KEY_WIFI_CON_DELAY, network.con_delay_ms);
        entry(&mut out, KEY_WIFI_MAX_ATTEMPTS, network.max_con_attempts);

        section(&mut out, SECTION_UPLOAD);
        entry(&mut out, KEY_UPLOAD_FREQ, upload.interval_s);
        entry(&mut out, KEY_UPLOAD_TIMEOUT, upload.deadline_s);
        entry(&mut out, KEY_DEVICE_ID, &upload.device_id);
        entry(&mut out, KEY_LOCATION, &upload.location);
        entry(&mut out, KEY_ORG, &upload.org);
        entry(&mut out, KEY_BUCKET, &upload.bucket);
        entry(&mut out, KEY_MEASUREMENT, &upload.measurement);

        section(&mut out, SECTION_SERVER);
        entry(&mut out, KEY_SERVER_ADDRESS, &server.address);
        entry(&mut out, KEY_SERVER_PORT, server.port);
        entry(&mut out, KEY_AUTH_TOKEN, &server.auth_token);

        section(&mut out, SECTION_DISPLAY);
        entry(&mut out, KEY_DISPLAY_CONTRAST, self.display.contrast);
        entry(&mut out, KEY_DISPLAY_ROTATION, self.display.rotated);

        section(&mut out, SECTION_SENSOR);
        entry(&mut out, KEY_TEMP_CORRECTION, self.sensor.temp_correction);

        section(&mut out, SECTION_BATTERY);
        entry(&mut out, KEY_BATTERY_MIN, self.battery.min_level);
        entry(&mut out, KEY_BATTERY_MAX, self.battery.max_level);

        out
    }
}

fn section(out: &mut String, name: &str) {
    if !out.is_empty() {
        out.push('\n');
    }
    let _ = writeln!(out, "[{name}]");
}

fn entry(out: &mut String, key: &str, value: impl std::fmt::Display) {
    // Newlines cannot survive a line-oriented format.
    let value = value.to_string().replace(['\r', '\n'], "");
    let _ = writeln!(out, "{key}={value}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_record() -> ConfigurationRecord {
        let mut record = ConfigurationRecord::default();
        record.network.ssid = "home net".to_string();
        record.network.passphrase = "p4ss=word;#1".to_string();
        record.network.bssid = Bssid([0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]);
        record.network.channel = 11;
        record.upload.device_id = "TS-01".to_string();
        record.upload.location = "office".to_string();
        record.upload.org = "home".to_string();
        record.upload.bucket = "ts_bucket".to_string();
        record.upload.measurement = "officeThermoSensor".to_string();
        record.server.address = "influx.local".to_string();
        record.server.port = 8086;
        record.server.auth_token = "abc==".to_string();
        record.display.rotated = true;
        record.sensor.temp_correction = -1.3;
        record
    }

    #[test]
    fn record_round_trips_through_ini() {
        let record = sample_record();
        let text = record.to_ini();
        assert_eq!(ConfigurationRecord::from_ini(&text), Ok(record));
    }

    #[test]
    fn boundary_length_strings_round_trip() {
        let mut record = sample_record();
        record.network.ssid = format!(" {}[", "s".repeat(MAX_SSID_LEN - 2));
        record.network.passphrase = "p;".repeat(MAX_PASSPHRASE_LEN / 2);
        record.upload.device_id = "d".repeat(MAX_DEVICE_ID_LEN);
        record.upload.location = format!("{} ", "l".repeat(MAX_LOCATION_LEN - 1));
        record.upload.org = "o".repeat(MAX_DESTINATION_LEN);
        record.upload.bucket = "b".repeat(MAX_DESTINATION_LEN);
        record.upload.measurement = "m".repeat(MAX_DESTINATION_LEN);
        record.server.address = "a".repeat(MAX_SERVER_ADDRESS_LEN);
        record.server.auth_token = format!("{} ", "t".repeat(MAX_AUTH_TOKEN_LEN - 1));

        let text = record.to_ini();
        assert_eq!(ConfigurationRecord::from_ini(&text), Ok(record));
    }

    #[test]
    fn writer_emits_expected_layout() {
        let text = sample_record().to_ini();
        assert!(text.starts_with("[network]\nwifi_enabled=true\nwifi_ap_ssid=home net\n"));
        assert!(text.contains("wifi_ap_bssid=de-ad-be-ef-00-01\n"));
        assert!(text.contains("\n[data upload]\nupload_freq=180\n"));
        assert!(text.contains("\n[server config]\n"));
        assert!(text.contains("sensor_temp_correction=-1.3\n"));
    }

    #[test]
    fn missing_key_fails_the_whole_load() {
        let text = sample_record()
            .to_ini()
            .replace("server_port=8086\n", "");
        assert_eq!(
            ConfigurationRecord::from_ini(&text),
            Err(IniError::MissingKey {
                section: SECTION_SERVER,
                key: KEY_SERVER_PORT,
            })
        );
    }

    #[test]
    fn malformed_number_fails_the_whole_load() {
        let text = sample_record()
            .to_ini()
            .replace("upload_timeout=20", "upload_timeout=soon");
        assert_eq!(
            ConfigurationRecord::from_ini(&text),
            Err(IniError::InvalidValue {
                section: SECTION_UPLOAD,
                key: KEY_UPLOAD_TIMEOUT,
            })
        );
    }

    #[test]
    fn zero_interval_is_rejected() {
        let text = sample_record()
            .to_ini()
            .replace("upload_freq=180", "upload_freq=0");
        assert_eq!(
            ConfigurationRecord::from_ini(&text),
            Err(IniError::Rejected(ConfigError::ZeroWakeInterval))
        );
    }

    #[test]
    fn overlong_line_is_rejected() {
        let long = "a".repeat(LINE_BUFFER_LEN);
        let text = format!("[network]\nwifi_ap_ssid={long}\n");
        assert_eq!(
            IniDocument::parse(&text).err(),
            Some(IniError::LineTooLong { line: 2 })
        );
    }

    #[test]
    fn comments_and_flexible_booleans_are_accepted() {
        let text = sample_record()
            .to_ini()
            .replace("wifi_enabled=true", "; radio switch\nwifi_enabled = off ; disabled")
            .replace("display_contrast=137", "display_contrast = 120 # dimmer")
            .replace("\r", "")
            .replace("\n", "\r\n");

        let record = ConfigurationRecord::from_ini(&text).map_err(|err| err.to_string());
        let record = record.as_ref().map(|r| (r.network.wifi_enabled, r.display.contrast));
        assert_eq!(record, Ok((false, 120)));
    }

    #[test]
    fn overlong_strings_are_truncated_on_read() {
        let text = sample_record()
            .to_ini()
            .replace("device_id=TS-01", "device_id=TS-0123456789abcdef");
        let record = ConfigurationRecord::from_ini(&text).unwrap();
        assert_eq!(record.upload.device_id, "TS-0123456789ab");
    }

    #[test]
    fn key_outside_section_is_malformed() {
        assert_eq!(
            IniDocument::parse("wifi_enabled=true\n").err(),
            Some(IniError::Malformed { line: 1 })
        );
    }
}
