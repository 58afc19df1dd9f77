//! Companion script that prefills the maintenance form with stored values.

use std::fmt::Write as _;

use crate::{
    config::ConfigurationRecord,
    ini::{
        KEY_AUTH_TOKEN, KEY_BATTERY_MAX, KEY_BATTERY_MIN, KEY_BUCKET, KEY_DEVICE_ID,
        KEY_DISPLAY_CONTRAST, KEY_DISPLAY_ROTATION, KEY_LOCATION, KEY_MEASUREMENT, KEY_ORG,
        KEY_SERVER_ADDRESS, KEY_SERVER_PORT, KEY_TEMP_CORRECTION, KEY_UPLOAD_FREQ,
        KEY_UPLOAD_TIMEOUT, KEY_WIFI_CON_DELAY, KEY_WIFI_ENABLED, KEY_WIFI_MAX_ATTEMPTS,
        KEY_WIFI_PASSPHRASE, KEY_WIFI_SSID,
    },
    paths::{PREFILL_SCRIPT_BACKUP_FILE, PREFILL_SCRIPT_FILE},
    store::{write_transactional, Storage, StoreError},
};

pub fn render(record: &ConfigurationRecord) -> String {
    let network = &record.network;
    let upload = &record.upload;
    let server = &record.server;

    let mut out = String::from("function setValues()\n{\n");

    set_property(&mut out, KEY_WIFI_ENABLED, "checked", network.wifi_enabled);
    set_property(&mut out, KEY_WIFI_ENABLED, "value", network.wifi_enabled);
    set_text(&mut out, KEY_WIFI_SSID, &network.ssid);
    set_text(&mut out, KEY_WIFI_PASSPHRASE, &network.passphrase);
    set_text(&mut out, KEY_WIFI_CON_DELAY, network.con_delay_ms);
    set_text(&mut out, KEY_WIFI_MAX_ATTEMPTS, network.max_con_attempts);

    set_text(&mut out, KEY_UPLOAD_FREQ, upload.interval_s);
    set_text(&mut out, KEY_UPLOAD_TIMEOUT, upload.deadline_s);
    set_text(&mut out, KEY_DEVICE_ID, &upload.device_id);
    set_text(&mut out, KEY_LOCATION, &upload.location);
    set_text(&mut out, KEY_ORG, &upload.org);
    set_text(&mut out, KEY_BUCKET, &upload.bucket);
    set_text(&mut out, KEY_MEASUREMENT, &upload.measurement);

    set_text(&mut out, KEY_SERVER_ADDRESS, &server.address);
    set_text(&mut out, KEY_SERVER_PORT, server.port);
    set_text(&mut out, KEY_AUTH_TOKEN, &server.auth_token);

    set_text(&mut out, KEY_DISPLAY_CONTRAST, record.display.contrast);
    set_property(&mut out, KEY_DISPLAY_ROTATION, "checked", record.display.rotated);

    set_text(&mut out, KEY_TEMP_CORRECTION, record.sensor.temp_correction);

    set_text(&mut out, KEY_BATTERY_MIN, record.battery.min_level);
    set_text(&mut out, KEY_BATTERY_MAX, record.battery.max_level);

    out.push_str("}\n");
    out
}

pub fn write<S: Storage + ?Sized>(
    storage: &mut S,
    record: &ConfigurationRecord,
) -> Result<(), StoreError> {
    write_transactional(
        storage,
        PREFILL_SCRIPT_FILE,
        PREFILL_SCRIPT_BACKUP_FILE,
        render(record).as_bytes(),
    )
}

fn set_property(out: &mut String, id: &str, property: &str, value: impl std::fmt::Display) {
    let _ = writeln!(
        out,
        "\tdocument.getElementById(\"{id}\").{property} = {value};"
    );
}

fn set_text(out: &mut String, id: &str, value: impl std::fmt::Display) {
    let literal = js_string(&value.to_string());
    set_property(out, id, "value", literal);
}

/// JSON string literal, with `<` escaped so `</script>` cannot close an
/// inline script.
fn js_string(value: &str) -> String {
    serde_json::to_string(value)
        .unwrap_or_else(|_| String::from("\"\""))
        .replace('<', "\\u003c")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::MemStorage;
    use pretty_assertions::assert_eq;

    #[test]
    fn script_prefills_every_form_field() {
        let mut record = ConfigurationRecord::default();
        record.network.ssid = "home".to_string();
        record.display.rotated = true;

        let script = render(&record);

        assert!(script.starts_with("function setValues()\n{\n"));
        assert!(script.ends_with("}\n"));
        assert!(script.contains("\tdocument.getElementById(\"wifi_enabled\").checked = true;\n"));
        assert!(script.contains("\tdocument.getElementById(\"wifi_enabled\").value = true;\n"));
        assert!(script.contains("\tdocument.getElementById(\"wifi_ap_ssid\").value = \"home\";\n"));
        assert!(script.contains("\tdocument.getElementById(\"display_rotation\").checked = true;\n"));
        assert!(script.contains("\tdocument.getElementById(\"upload_freq\").value = \"180\";\n"));
        assert!(script.contains("\tdocument.getElementById(\"battery_max_level\").value = \"853\";\n"));
        assert!(!script.contains("wifi_ap_bssid"));
        assert_eq!(script.lines().count(), 24);
    }

    #[test]
    fn string_values_cannot_break_out_of_the_literal() {
        assert_eq!(js_string("a\"b\\c"), "\"a\\\"b\\\\c\"");
        assert_eq!(js_string("</script>"), "\"\\u003c/script>\"");
        assert_eq!(js_string("line\nbreak"), "\"line\\nbreak\"");
        assert_eq!(js_string("bell\u{7}"), "\"bell\\u0007\"");
    }

    #[test]
    fn script_is_written_transactionally() {
        let mut storage = MemStorage::default();
        let record = ConfigurationRecord::default();

        write(&mut storage, &record).unwrap();
        write(&mut storage, &record).unwrap();

        assert_eq!(storage.text(PREFILL_SCRIPT_FILE), Some(render(&record)));
        assert!(!storage.exists(PREFILL_SCRIPT_BACKUP_FILE));
    }
}
