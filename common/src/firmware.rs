//! Firmware image updates. Only reachable from configuration mode, and the
//! configuration record is read-only while an image is being written.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FirmwareRequest {
    pub url: String,
    #[serde(default)]
    pub sha256: Option<String>,
}

impl FirmwareRequest {
    pub fn validate(&self) -> Result<(), FirmwareRejection> {
        let url = self.url.trim();
        if url.is_empty() {
            return Err(FirmwareRejection::Invalid("url cannot be empty"));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(FirmwareRejection::Invalid(
                "url must start with http:// or https://",
            ));
        }
        if let Some(sha256) = &self.sha256 {
            let digest = sha256.trim();
            if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(FirmwareRejection::Invalid(
                    "sha256 must be 64 hex characters",
                ));
            }
        }
        Ok(())
    }

    /// Expected digest in the lowercase form the downloader produces.
    pub fn expected_sha256(&self) -> Option<String> {
        self.sha256
            .as_deref()
            .map(|digest| digest.trim().to_ascii_lowercase())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FirmwareRejection {
    #[error("firmware updates are not available on this build")]
    Unsupported,
    #[error("{0}")]
    Invalid(&'static str),
    #[error("firmware update already in progress")]
    Busy,
}

impl FirmwareRejection {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Unsupported => 501,
            Self::Invalid(_) => 400,
            Self::Busy => 409,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FirmwareStatus {
    pub supported: bool,
    pub in_progress: bool,
    pub bytes_written: u64,
    pub total_bytes: Option<u64>,
    pub last_error: Option<String>,
    pub last_sha256: Option<String>,
}

impl FirmwareStatus {
    pub fn new(supported: bool) -> Self {
        Self {
            supported,
            ..Self::default()
        }
    }

    pub fn begin(&mut self, request: &FirmwareRequest) -> Result<(), FirmwareRejection> {
        if !self.supported {
            return Err(FirmwareRejection::Unsupported);
        }
        request.validate()?;
        if self.in_progress {
            return Err(FirmwareRejection::Busy);
        }
        *self = Self {
            supported: true,
            in_progress: true,
            ..Self::default()
        };
        Ok(())
    }

    pub fn progress(&mut self, bytes_written: u64, total_bytes: Option<u64>) {
        self.bytes_written = bytes_written;
        self.total_bytes = total_bytes;
    }

    /// Records the digest of a written image, or why writing it failed.
    pub fn finish(&mut self, result: Result<String, String>) {
        self.in_progress = false;
        match result {
            Ok(digest) => self.last_sha256 = Some(digest),
            Err(err) => self.last_error = Some(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn request(url: &str, sha256: Option<&str>) -> FirmwareRequest {
        FirmwareRequest {
            url: url.to_string(),
            sha256: sha256.map(str::to_string),
        }
    }

    #[test]
    fn requests_need_http_url_and_full_digest() {
        assert_eq!(
            request("", None).validate(),
            Err(FirmwareRejection::Invalid("url cannot be empty"))
        );
        assert_eq!(
            request("ftp://host/fw.bin", None).validate(),
            Err(FirmwareRejection::Invalid(
                "url must start with http:// or https://"
            ))
        );
        assert_eq!(
            request("https://host/fw.bin", Some("abc")).validate(),
            Err(FirmwareRejection::Invalid(
                "sha256 must be 64 hex characters"
            ))
        );
        let digest = "AB".repeat(32);
        let ok = request("https://host/fw.bin", Some(&digest));
        assert_eq!(ok.validate(), Ok(()));
        assert_eq!(ok.expected_sha256(), Some("ab".repeat(32)));
    }

    #[test]
    fn unsupported_builds_refuse_before_validating() {
        let mut status = FirmwareStatus::new(false);
        let err = status.begin(&request("", None)).unwrap_err();
        assert_eq!(err, FirmwareRejection::Unsupported);
        assert_eq!(err.http_status(), 501);
        assert!(!status.in_progress);
    }

    #[test]
    fn one_update_at_a_time() {
        let mut status = FirmwareStatus::new(true);
        let fw = request("https://host/fw.bin", None);

        status.begin(&fw).unwrap();
        status.progress(4096, Some(8192));
        assert_eq!(status.begin(&fw), Err(FirmwareRejection::Busy));

        status.finish(Err("sha256 mismatch".to_string()));
        assert!(!status.in_progress);
        assert_eq!(status.last_error.as_deref(), Some("sha256 mismatch"));

        status.begin(&fw).unwrap();
        assert_eq!(status.bytes_written, 0);
        assert_eq!(status.last_error, None);
        status.finish(Ok("00".repeat(32)));
        assert_eq!(status.last_sha256, Some("00".repeat(32)));
    }
}
