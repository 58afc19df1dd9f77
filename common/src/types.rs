use serde::{Deserialize, Serialize};

/// Indicator icons shown on the node's display.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusIcons {
    pub wifi: bool,
    pub internet: bool,
    pub upload: bool,
    pub ok: bool,
    pub failed: bool,
    pub sleeping: bool,
}

/// Radio state the node wakes with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeRadio {
    Default,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SleepCause {
    Completed,
    NetworkDisabled,
    SensorFault,
    JoinFailed,
    UploadFailed,
    WatchdogExpired,
}

impl SleepCause {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "COMPLETED",
            Self::NetworkDisabled => "NETWORK_DISABLED",
            Self::SensorFault => "SENSOR_FAULT",
            Self::JoinFailed => "JOIN_FAILED",
            Self::UploadFailed => "UPLOAD_FAILED",
            Self::WatchdogExpired => "WATCHDOG_EXPIRED",
        }
    }
}

/// Why stored configuration could not be used at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BootFault {
    StorageUnavailable,
    ConfigMissing,
    ConfigCorrupt,
}

impl BootFault {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StorageUnavailable => "STORAGE_UNAVAILABLE",
            Self::ConfigMissing => "CONFIG_MISSING",
            Self::ConfigCorrupt => "CONFIG_CORRUPT",
        }
    }
}

/// Why the node is serving the maintenance portal. Both are entered through
/// the config button; `Recovery` means stored configuration was unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfigReason {
    Requested,
    Recovery(BootFault),
}
