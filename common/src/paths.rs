pub const CONFIG_FILE: &str = "sensor_config.ini";
pub const CONFIG_BACKUP_FILE: &str = "sensor_config.ini.bu";

pub const PREFILL_SCRIPT_FILE: &str = "sensor_config.js";
pub const PREFILL_SCRIPT_BACKUP_FILE: &str = "sensor_config.js.bu";

pub const CONFIG_AP_SSID: &str = "ESP-ThermoSensor";
pub const CONFIG_AP_PASSWORD: &str = "11223344";

pub const SUBMIT_PATHS: [&str; 2] = ["/submit.html", "/submit_en.html"];
