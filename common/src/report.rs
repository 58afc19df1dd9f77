//! Measurement line and the write request that carries it.

use std::fmt::Write as _;

use serde::Serialize;
use thiserror::Error;

use crate::config::ConfigurationRecord;

pub const WRITE_PATH: &str = "/api/v2/write?precision=s";
pub const SUCCESS_STATUS_LINE: &str = "HTTP/1.1 204 No Content";
pub const USER_AGENT: &str = "thermosensor-node";

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SensorReading {
    pub temperature_c: f32,
    pub humidity: f32,
    /// hPa; absent on sensors without a barometer.
    pub pressure_hpa: Option<f32>,
    pub battery_raw: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UploadFailure {
    #[error("could not connect to {host}:{port}: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected response `{0}`")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadReport {
    pub measurement: String,
    pub device_id: String,
    pub location: String,
    pub temperature_c: f32,
    pub humidity: f32,
    pub pressure_hpa: Option<f32>,
    pub battery_percent: u8,
    pub uptime_ms: u64,
}

impl UploadReport {
    /// Builds the report for this wake. The configured temperature correction
    /// is applied here.
    pub fn new(
        record: &ConfigurationRecord,
        reading: &SensorReading,
        battery_percent: u8,
        uptime_ms: u64,
    ) -> Self {
        Self {
            measurement: record.upload.measurement.clone(),
            device_id: record.upload.device_id.clone(),
            location: record.upload.location.clone(),
            temperature_c: reading.temperature_c + record.sensor.temp_correction,
            humidity: reading.humidity,
            pressure_hpa: reading.pressure_hpa,
            battery_percent,
            uptime_ms,
        }
    }

    pub fn line(&self) -> String {
        let mut line = String::with_capacity(160);
        line.push_str(&escape_measurement(&self.measurement));
        let _ = write!(
            line,
            ",deviceId={},location={} temperature={:.2},humidity={:.2}",
            escape_tag(&self.device_id),
            escape_tag(&self.location),
            self.temperature_c,
            self.humidity,
        );
        if let Some(pressure) = self.pressure_hpa {
            let _ = write!(line, ",pressure={pressure:.2}");
        }
        let _ = write!(
            line,
            ",battery={}i,uptime={}.{}",
            self.battery_percent,
            self.uptime_ms / 1_000,
            (self.uptime_ms % 1_000) / 100,
        );
        line
    }
}

/// Authenticated write of one report line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub token: String,
    pub body: String,
}

impl UploadRequest {
    pub fn new(record: &ConfigurationRecord, report: &UploadReport) -> Self {
        Self {
            host: record.server.address.clone(),
            port: record.server.port,
            path: format!(
                "{WRITE_PATH}&org={}&bucket={}",
                urlencoding::encode(&record.upload.org),
                urlencoding::encode(&record.upload.bucket)
            ),
            token: record.server.auth_token.clone(),
            body: report.line(),
        }
    }

    pub fn to_http(&self) -> String {
        format!(
            "POST {path} HTTP/1.1\r\n\
             Host: {host}\r\n\
             User-Agent: {USER_AGENT}\r\n\
             Connection: close\r\n\
             Authorization: Token {token}\r\n\
             Content-Type: text/plain; charset=utf-8\r\n\
             Content-Length: {len}\r\n\
             \r\n\
             {body}",
            path = self.path,
            host = self.host,
            token = self.token,
            len = self.body.len(),
            body = self.body,
        )
    }
}

/// Only the exact status line counts as an accepted write.
pub fn is_success_status(status_line: &str) -> bool {
    status_line.trim_end_matches(['\r', '\n']) == SUCCESS_STATUS_LINE
}

fn escape_measurement(value: &str) -> String {
    escape(value, &[',', ' '])
}

fn escape_tag(value: &str) -> String {
    escape(value, &[',', '=', ' '])
}

fn escape(value: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if special.contains(&ch) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}
