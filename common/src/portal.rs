//! Maintenance portal: applies form submissions to the configuration record.

use std::{collections::HashMap, str::FromStr};

use log::{info, warn};
use serde::Serialize;

use crate::{
    config::{
        truncate_utf8, ConfigurationRecord, MAX_AUTH_TOKEN_LEN, MAX_DESTINATION_LEN,
        MAX_DEVICE_ID_LEN, MAX_LOCATION_LEN, MAX_PASSPHRASE_LEN, MAX_SERVER_ADDRESS_LEN,
        MAX_SSID_LEN,
    },
    ini::{
        KEY_AUTH_TOKEN, KEY_BATTERY_MAX, KEY_BATTERY_MIN, KEY_BUCKET, KEY_DEVICE_ID,
        KEY_DISPLAY_CONTRAST, KEY_DISPLAY_ROTATION, KEY_LOCATION, KEY_MEASUREMENT, KEY_ORG,
        KEY_SERVER_ADDRESS, KEY_SERVER_PORT, KEY_TEMP_CORRECTION, KEY_UPLOAD_FREQ,
        KEY_UPLOAD_TIMEOUT, KEY_WIFI_CON_DELAY, KEY_WIFI_ENABLED, KEY_WIFI_MAX_ATTEMPTS,
        KEY_WIFI_PASSPHRASE, KEY_WIFI_SSID,
    },
    firmware::{FirmwareRejection, FirmwareRequest, FirmwareStatus},
    prefill,
    store::{ConfigStore, Storage, StoreError},
};

pub type FormFields = HashMap<String, String>;

/// Field-level result of applying one submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FieldReport {
    pub missing: Vec<&'static str>,
    /// Present but unparseable; the stored value was kept.
    pub invalid: Vec<&'static str>,
}

impl FieldReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.invalid.is_empty()
    }

    pub fn describe(&self) -> String {
        let mut lines: Vec<String> = self
            .missing
            .iter()
            .map(|field| format!("{field} not found"))
            .collect();
        lines.extend(self.invalid.iter().map(|field| format!("{field} is invalid")));
        lines.join("\n")
    }
}

struct Ingest<'a> {
    form: &'a FormFields,
    report: FieldReport,
}

impl<'a> Ingest<'a> {
    fn text(&mut self, key: &'static str, target: &mut String, max: usize) {
        match self.form.get(key) {
            Some(value) => {
                let mut value = value.clone();
                truncate_utf8(&mut value, max);
                *target = value;
            }
            None => self.report.missing.push(key),
        }
    }

    fn number<T: FromStr>(&mut self, key: &'static str, target: &mut T) {
        self.number_where(key, target, |_| true);
    }

    fn number_where<T: FromStr>(
        &mut self,
        key: &'static str,
        target: &mut T,
        accept: impl Fn(&T) -> bool,
    ) {
        let Some(raw) = self.form.get(key) else {
            self.report.missing.push(key);
            return;
        };
        match raw.trim().parse::<T>() {
            Ok(value) if accept(&value) => *target = value,
            _ => self.report.invalid.push(key),
        }
    }

    fn checkbox(&self, key: &'static str) -> bool {
        self.form.contains_key(key)
    }
}

/// Applies every known field of `form` to `record`.
///
/// Unchecked checkboxes are absent from a form post, so a missing boolean
/// means `false` and is not an error. Submitting clears the memoized access
/// point, since new credentials may point at a different network.
pub fn apply_submission(record: &mut ConfigurationRecord, form: &FormFields) -> FieldReport {
    let mut ingest = Ingest {
        form,
        report: FieldReport::default(),
    };

    let network = &mut record.network;
    network.wifi_enabled = ingest.checkbox(KEY_WIFI_ENABLED);
    ingest.text(KEY_WIFI_SSID, &mut network.ssid, MAX_SSID_LEN);
    ingest.text(KEY_WIFI_PASSPHRASE, &mut network.passphrase, MAX_PASSPHRASE_LEN);
    network.forget_access_point();
    ingest.number(KEY_WIFI_CON_DELAY, &mut network.con_delay_ms);
    ingest.number(KEY_WIFI_MAX_ATTEMPTS, &mut network.max_con_attempts);

    let upload = &mut record.upload;
    ingest.number_where(KEY_UPLOAD_FREQ, &mut upload.interval_s, |v| *v > 0);
    ingest.number_where(KEY_UPLOAD_TIMEOUT, &mut upload.deadline_s, |v| *v > 0);
    ingest.text(KEY_DEVICE_ID, &mut upload.device_id, MAX_DEVICE_ID_LEN);
    ingest.text(KEY_LOCATION, &mut upload.location, MAX_LOCATION_LEN);
    ingest.text(KEY_ORG, &mut upload.org, MAX_DESTINATION_LEN);
    ingest.text(KEY_BUCKET, &mut upload.bucket, MAX_DESTINATION_LEN);
    ingest.text(KEY_MEASUREMENT, &mut upload.measurement, MAX_DESTINATION_LEN);

    let server = &mut record.server;
    ingest.text(KEY_SERVER_ADDRESS, &mut server.address, MAX_SERVER_ADDRESS_LEN);
    ingest.number(KEY_SERVER_PORT, &mut server.port);
    ingest.text(KEY_AUTH_TOKEN, &mut server.auth_token, MAX_AUTH_TOKEN_LEN);

    ingest.number(KEY_DISPLAY_CONTRAST, &mut record.display.contrast);
    record.display.rotated = ingest.checkbox(KEY_DISPLAY_ROTATION);

    ingest.number_where(
        KEY_TEMP_CORRECTION,
        &mut record.sensor.temp_correction,
        |v: &f32| v.is_finite(),
    );

    ingest.number(KEY_BATTERY_MIN, &mut record.battery.min_level);
    ingest.number(KEY_BATTERY_MAX, &mut record.battery.max_level);

    ingest.report
}

/// Decodes an `application/x-www-form-urlencoded` body. Later duplicates win.
pub fn parse_form(body: &str) -> FormFields {
    form_urlencoded::parse(body.as_bytes())
        .into_owned()
        .collect()
}

/// What `/api/config` exposes. Secrets are reported as set or unset only.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigView {
    pub wifi_enabled: bool,
    pub wifi_ssid: String,
    pub wifi_pass_set: bool,
    pub wifi_bssid: String,
    pub wifi_channel: u8,
    pub wifi_con_delay_ms: u16,
    pub wifi_max_con_attempts: u16,
    pub upload_interval_s: u32,
    pub upload_deadline_s: u16,
    pub device_id: String,
    pub location: String,
    pub org: String,
    pub bucket: String,
    pub measurement: String,
    pub server_address: String,
    pub server_port: u16,
    pub auth_token_set: bool,
    pub display_contrast: u8,
    pub display_rotated: bool,
    pub temp_correction: f32,
    pub battery_min_level: u16,
    pub battery_max_level: u16,
}

impl From<&ConfigurationRecord> for ConfigView {
    fn from(record: &ConfigurationRecord) -> Self {
        Self {
            wifi_enabled: record.network.wifi_enabled,
            wifi_ssid: record.network.ssid.clone(),
            wifi_pass_set: !record.network.passphrase.is_empty(),
            wifi_bssid: record.network.bssid.to_string(),
            wifi_channel: record.network.channel,
            wifi_con_delay_ms: record.network.con_delay_ms,
            wifi_max_con_attempts: record.network.max_con_attempts,
            upload_interval_s: record.upload.interval_s,
            upload_deadline_s: record.upload.deadline_s,
            device_id: record.upload.device_id.clone(),
            location: record.upload.location.clone(),
            org: record.upload.org.clone(),
            bucket: record.upload.bucket.clone(),
            measurement: record.upload.measurement.clone(),
            server_address: record.server.address.clone(),
            server_port: record.server.port,
            auth_token_set: !record.server.auth_token.is_empty(),
            display_contrast: record.display.contrast,
            display_rotated: record.display.rotated,
            temp_correction: record.sensor.temp_correction,
            battery_min_level: record.battery.min_level,
            battery_max_level: record.battery.max_level,
        }
    }
}

/// Outcome of a submission. Field problems, the prefill script and the
/// configuration file are reported independently.
#[derive(Debug)]
pub struct SubmitOutcome {
    pub fields: FieldReport,
    pub script: Result<(), StoreError>,
    pub saved: Result<(), StoreError>,
}

impl SubmitOutcome {
    pub fn is_success(&self) -> bool {
        self.fields.is_complete() && self.script.is_ok() && self.saved.is_ok()
    }

    /// Plain-text summary for the form response.
    pub fn describe(&self) -> String {
        let mut lines = Vec::new();
        if !self.fields.is_complete() {
            lines.push(self.fields.describe());
        }
        if let Err(err) = &self.script {
            lines.push(format!("prefill script: {err}"));
        }
        if let Err(err) = &self.saved {
            lines.push(format!("configuration: {err}"));
        }
        if !lines.is_empty() {
            lines.push("Error processing and saving the configuration!".to_string());
        }
        lines.join("\n")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatteryStatus {
    pub raw: u16,
    pub percent: u8,
}

/// Owns the configuration record while the node is in configuration mode.
pub struct MaintenancePortal<S> {
    store: ConfigStore<S>,
    record: ConfigurationRecord,
    battery_monitor: bool,
    firmware: FirmwareStatus,
}

impl<S: Storage> MaintenancePortal<S> {
    pub fn new(store: ConfigStore<S>, record: ConfigurationRecord) -> Self {
        Self {
            store,
            record,
            battery_monitor: false,
            firmware: FirmwareStatus::new(false),
        }
    }

    /// Enables the firmware update endpoints on builds that can write images.
    pub fn with_firmware_updates(mut self) -> Self {
        self.firmware = FirmwareStatus::new(true);
        self
    }

    pub fn record(&self) -> &ConfigurationRecord {
        &self.record
    }

    /// Applies and persists a form. Refused while a firmware image is being
    /// written.
    pub fn submit(&mut self, form: &FormFields) -> Result<SubmitOutcome, FirmwareRejection> {
        if self.firmware.in_progress {
            return Err(FirmwareRejection::Busy);
        }

        let fields = apply_submission(&mut self.record, form);
        if !fields.is_complete() {
            warn!("form submission incomplete: {}", fields.describe());
        }

        let script = prefill::write(self.store.storage_mut(), &self.record);
        if let Err(err) = &script {
            warn!("failed to regenerate prefill script: {err}");
        }

        let saved = self.store.save(&self.record);
        if let Err(err) = &saved {
            warn!("failed to save submitted configuration: {err}");
        } else {
            info!("submitted configuration saved");
        }

        Ok(SubmitOutcome {
            fields,
            script,
            saved,
        })
    }

    pub fn battery_status(&self, raw: u16) -> BatteryStatus {
        BatteryStatus {
            raw,
            percent: self.record.battery.percent(raw),
        }
    }

    pub fn battery_monitor_enabled(&self) -> bool {
        self.battery_monitor
    }

    /// Flips the periodic battery read-out used while calibrating.
    pub fn toggle_battery_monitor(&mut self) -> bool {
        self.battery_monitor = !self.battery_monitor;
        self.battery_monitor
    }

    pub fn firmware_status(&self) -> &FirmwareStatus {
        &self.firmware
    }

    pub fn begin_firmware_update(
        &mut self,
        request: &FirmwareRequest,
    ) -> Result<(), FirmwareRejection> {
        self.firmware.begin(request)?;
        info!("firmware update from {}", request.url.trim());
        Ok(())
    }

    pub fn firmware_progress(&mut self, bytes_written: u64, total_bytes: Option<u64>) {
        self.firmware.progress(bytes_written, total_bytes);
    }

    pub fn finish_firmware_update(&mut self, result: Result<String, String>) {
        if let Err(err) = &result {
            warn!("firmware update failed: {err}");
        }
        self.firmware.finish(result);
    }
}
