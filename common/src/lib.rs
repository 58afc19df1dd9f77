pub mod battery;
pub mod config;
pub mod cycle;
pub mod firmware;
pub mod ini;
pub mod paths;
pub mod portal;
pub mod prefill;
pub mod report;
pub mod store;
pub mod types;
pub mod watchdog;
pub mod wifi;

pub use config::{Bssid, ConfigurationRecord};
pub use cycle::{BootInputs, CycleAction, CycleEvent, DutyCycle, Phase};
pub use firmware::{FirmwareRejection, FirmwareRequest, FirmwareStatus};
pub use paths::*;
pub use portal::{
    apply_submission, parse_form, ConfigView, FormFields, MaintenancePortal, SubmitOutcome,
};
pub use report::{SensorReading, UploadFailure, UploadRequest};
pub use store::{ConfigStore, FsStorage, LoadError, Storage, StoreError, Volume};
pub use types::{BootFault, ConfigReason, SleepCause, StatusIcons, WakeRadio};
pub use watchdog::UploadWatchdog;
pub use wifi::{JoinManager, JoinTarget, LinkStatus};
