use core::convert::TryInto;
use std::{
    collections::VecDeque,
    ffi::CString,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use bme280_rs::{Bme280, Configuration as Bme280Configuration, Oversampling, SensorMode};
use embedded_svc::{
    http::{client::Client as HttpClient, Headers, Method, Status},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    adc::{
        attenuation::DB_11,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
        ADC1,
    },
    delay::FreeRtos,
    gpio::{Gpio0, Gpio34, Input, PinDriver, Pull},
    i2c::{I2cConfig, I2cDriver},
    units::Hertz,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::{
        client::{Configuration as HttpClientConfiguration, EspHttpConnection},
        server::{Configuration as HttpConfiguration, EspHttpServer},
    },
    log::EspLogger,
    nvs::EspDefaultNvsPartition,
    ota::EspOta,
    timer::{EspTaskTimerService, EspTimer},
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, info, warn};
use serde::Serialize;
use sha2::{Digest, Sha256};

use thermosensor_common::{
    parse_form, prefill, report::is_success_status, report::USER_AGENT, BootFault, BootInputs,
    Bssid, ConfigReason, ConfigStore, ConfigView, ConfigurationRecord, CycleAction, CycleEvent,
    DutyCycle, FirmwareRejection, FirmwareRequest, JoinTarget, LinkStatus, MaintenancePortal,
    SensorReading, UploadFailure, UploadRequest, Volume, WakeRadio, CONFIG_AP_PASSWORD,
    CONFIG_AP_SSID, PREFILL_SCRIPT_FILE, SUBMIT_PATHS,
};

const STORAGE_MOUNT: &str = "/spiffs";
const BME280_I2C_BAUD_HZ: u32 = 100_000;
const MAX_HTTP_BODY: usize = 4096;
const OTA_CHUNK_SIZE: usize = 4096;
const UPLOAD_IO_TIMEOUT: Duration = Duration::from_secs(10);
const BUTTON_POLL: Duration = Duration::from_millis(50);
const BATTERY_MONITOR_PERIOD: Duration = Duration::from_millis(300);

const INDEX_HTML: &str = include_str!("../web/index.html");
const SUBMIT_HTML: &str = include_str!("../web/submit.html");
const RESTART_HTML: &str = "<!doctype html><html><body><p>Restarting sensor&hellip;</p></body></html>";

type Portal = Arc<Mutex<MaintenancePortal<Volume>>>;
type BatteryChannel = AdcChannelDriver<'static, Gpio34, AdcDriver<'static, ADC1>>;

struct SensorSuite {
    bme280: Option<Bme280<I2cDriver<'static>, FreeRtos>>,
    battery: Arc<Mutex<BatteryChannel>>,
}

struct StationRadio {
    wifi: BlockingWifi<EspWifi<'static>>,
    started: bool,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let Peripherals {
        modem,
        pins,
        i2c0,
        adc1,
        ..
    } = Peripherals::take()?;

    let mut button = PinDriver::input(pins.gpio0)?;
    button.set_pull(Pull::Up)?;
    let config_button = button.is_low();

    let adc = AdcDriver::new(adc1)?;
    let battery = AdcChannelDriver::new(
        adc,
        pins.gpio34,
        &AdcChannelConfig {
            attenuation: DB_11,
            ..Default::default()
        },
    )?;
    let i2c = I2cDriver::new(
        i2c0,
        pins.gpio21,
        pins.gpio22,
        &I2cConfig::new().baudrate(Hertz(BME280_I2C_BAUD_HZ)),
    )?;
    let mut sensors = SensorSuite::new(i2c, battery);

    let mut store = ConfigStore::new(mount_storage());
    let config = if store.storage().is_mounted() {
        store.load().map_err(|err| {
            warn!("failed to load configuration: {err}");
            err.boot_fault()
        })
    } else {
        Err(BootFault::StorageUnavailable)
    };

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let timer_service = EspTaskTimerService::new()?;

    let mut cycle = DutyCycle::new();
    let mut radio: Option<StationRadio> = None;
    let mut modem = Some(modem);
    let mut failsafe: Option<EspTimer<'static>> = None;

    let mut pending: VecDeque<CycleAction> = cycle
        .boot(BootInputs {
            config,
            config_button,
            now_ms: monotonic_ms(),
        })
        .into();

    while let Some(action) = pending.pop_front() {
        match action {
            CycleAction::ConfigureDisplay(panel) => {
                info!(
                    "display contrast {} rotated {}",
                    panel.contrast, panel.rotated
                );
            }
            CycleAction::ReadSensors => {
                let event = sensors.read();
                pending.extend(cycle.handle(event, monotonic_ms()));
            }
            CycleAction::ShowReading {
                reading,
                battery_percent,
            } => {
                info!(
                    "{:.2} C, {:.2} %RH, {:?} hPa, battery {}% (raw {})",
                    reading.temperature_c,
                    reading.humidity,
                    reading.pressure_hpa,
                    battery_percent,
                    reading.battery_raw
                );
            }
            CycleAction::StartJoin { target, poll_after } => {
                if radio.is_none() {
                    let modem = modem
                        .take()
                        .ok_or_else(|| anyhow!("wifi modem already in use"))?;
                    radio = Some(StationRadio::new(
                        modem,
                        sys_loop.clone(),
                        nvs_partition.clone(),
                    )?);
                }
                let Some(station) = radio.as_mut() else {
                    continue;
                };
                if let Err(err) = station.begin(&target) {
                    warn!("failed to start join: {err:#}");
                }
                thread::sleep(poll_after);
                pending.extend(cycle.handle(CycleEvent::LinkPolled(station.poll()), monotonic_ms()));
            }
            CycleAction::PollLink { after } => {
                thread::sleep(after);
                let link = radio
                    .as_mut()
                    .map(StationRadio::poll)
                    .unwrap_or(LinkStatus::Down);
                pending.extend(cycle.handle(CycleEvent::LinkPolled(link), monotonic_ms()));
            }
            CycleAction::PersistConfig(record) => {
                if let Err(err) = store.save(&record) {
                    warn!("failed to persist learned network identity: {err}");
                }
            }
            CycleAction::StartUpload(request) => {
                if failsafe.is_none() {
                    failsafe = Some(arm_failsafe(&timer_service, &cycle)?);
                }
                let result = upload(&request);
                let mut actions = cycle.tick(monotonic_ms());
                if actions.is_empty() {
                    actions = cycle.handle(CycleEvent::UploadFinished(result), monotonic_ms());
                }
                pending.extend(actions);
            }
            CycleAction::ShowStatus(icons) => debug!("status icons {icons:?}"),
            CycleAction::Suspend {
                duration,
                radio: wake_radio,
                cause,
            } => {
                drop(failsafe.take());
                info!("wake finished: {}", cause.as_str());
                if wake_radio == WakeRadio::Disabled {
                    debug!("radio stays off until configuration re-enables it");
                }
                deep_sleep(duration);
            }
            CycleAction::Restart { after } => {
                thread::sleep(after);
                unsafe { esp_idf_svc::sys::esp_restart() };
            }
            CycleAction::EnterConfigMode { record, reason } => {
                let modem = modem
                    .take()
                    .ok_or_else(|| anyhow!("wifi modem already in use"))?;
                return run_config_mode(
                    modem,
                    sys_loop,
                    nvs_partition,
                    store,
                    record,
                    reason,
                    button,
                    sensors.battery,
                );
            }
        }
    }

    Err(anyhow!("wake cycle stopped without a terminal action"))
}

impl SensorSuite {
    fn new(i2c: I2cDriver<'static>, battery: BatteryChannel) -> Self {
        let mut bme280 = Bme280::new(i2c, FreeRtos);
        let ready = bme280.init().is_ok()
            && bme280
                .set_sampling_configuration(
                    Bme280Configuration::default()
                        .with_temperature_oversampling(Oversampling::Oversample1)
                        .with_pressure_oversampling(Oversampling::Oversample1)
                        .with_humidity_oversampling(Oversampling::Oversample1)
                        .with_sensor_mode(SensorMode::Normal),
                )
                .is_ok();
        if !ready {
            warn!("BME280 did not initialise");
        }

        Self {
            bme280: ready.then_some(bme280),
            battery: Arc::new(Mutex::new(battery)),
        }
    }

    fn read(&mut self) -> CycleEvent {
        let Some(battery_raw) = read_battery(&self.battery) else {
            return CycleEvent::SensorFault;
        };
        let Some(bme280) = self.bme280.as_mut() else {
            return CycleEvent::SensorFault;
        };

        FreeRtos::delay_ms(50);
        match bme280.read_sample() {
            Ok(sample) => match (sample.temperature, sample.humidity) {
                (Some(temperature_c), Some(humidity)) => CycleEvent::SensorsRead(SensorReading {
                    temperature_c,
                    humidity,
                    pressure_hpa: sample.pressure.map(|pa| pa / 100.0),
                    battery_raw,
                }),
                _ => {
                    warn!("BME280 sample incomplete");
                    CycleEvent::SensorFault
                }
            },
            Err(err) => {
                warn!("BME280 read failed: {err:?}");
                CycleEvent::SensorFault
            }
        }
    }
}

fn read_battery(battery: &Mutex<BatteryChannel>) -> Option<u16> {
    let mut channel = battery.lock().ok()?;
    match channel.read_raw() {
        Ok(raw) => Some(raw),
        Err(err) => {
            warn!("battery ADC read failed: {err:?}");
            None
        }
    }
}

impl StationRadio {
    fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs_partition: EspDefaultNvsPartition,
    ) -> anyhow::Result<Self> {
        let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
        Ok(Self {
            wifi: BlockingWifi::wrap(esp_wifi, sys_loop)?,
            started: false,
        })
    }

    fn begin(&mut self, target: &JoinTarget) -> anyhow::Result<()> {
        let client = match target {
            JoinTarget::Scan { ssid, passphrase } => client_configuration(ssid, passphrase)?,
            JoinTarget::Direct {
                ssid,
                passphrase,
                bssid,
                channel,
            } => ClientConfiguration {
                bssid: Some(bssid.0),
                channel: Some(*channel),
                ..client_configuration(ssid, passphrase)?
            },
        };
        self.wifi
            .set_configuration(&Configuration::Client(client))?;
        if !self.started {
            self.wifi.start()?;
            self.started = true;
        }
        self.wifi.wifi_mut().connect()?;
        Ok(())
    }

    fn poll(&mut self) -> LinkStatus {
        match self.wifi.is_up() {
            Ok(true) => match station_access_point() {
                Some((bssid, channel)) => LinkStatus::Connected { bssid, channel },
                None => LinkStatus::Down,
            },
            _ => LinkStatus::Down,
        }
    }
}

fn client_configuration(ssid: &str, passphrase: &str) -> anyhow::Result<ClientConfiguration> {
    let auth_method = if passphrase.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };
    Ok(ClientConfiguration {
        ssid: ssid.try_into().map_err(|_| anyhow!("wifi ssid too long"))?,
        password: passphrase
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    })
}

fn station_access_point() -> Option<(Bssid, u8)> {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    (rc == esp_idf_svc::sys::ESP_OK).then(|| (Bssid(ap_info.bssid), ap_info.primary))
}

fn mount_storage() -> Volume {
    let Ok(base_path) = CString::new(STORAGE_MOUNT) else {
        return Volume::Unavailable {
            reason: format!("invalid mount point {STORAGE_MOUNT}"),
        };
    };
    let conf = esp_idf_svc::sys::esp_vfs_spiffs_conf_t {
        base_path: base_path.as_ptr(),
        partition_label: core::ptr::null(),
        max_files: 4,
        format_if_mount_failed: false,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_vfs_spiffs_register(&conf) };
    if rc != esp_idf_svc::sys::ESP_OK && rc != esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        warn!("esp_vfs_spiffs_register failed with code {rc}");
        return Volume::Unavailable {
            reason: format!("SPIFFS mount failed with code {rc}"),
        };
    }
    Volume::mount(STORAGE_MOUNT)
}

/// Hardware timer that puts the node to sleep if an upload stalls inside
/// the blocking HTTP client, where the engine's tick cannot run.
fn arm_failsafe(
    timer_service: &EspTaskTimerService,
    cycle: &DutyCycle,
) -> anyhow::Result<EspTimer<'static>> {
    let deadline_ms = cycle
        .watchdog_deadline_ms()
        .ok_or_else(|| anyhow!("upload started without an armed watchdog"))?;
    let remaining = Duration::from_millis(deadline_ms.saturating_sub(monotonic_ms()));
    let sleep_for = Duration::from_secs(u64::from(cycle.record().upload.interval_s));

    let timer = timer_service.timer(move || {
        warn!("upload watchdog expired; forcing deep sleep");
        deep_sleep(sleep_for);
    })?;
    timer.after(remaining)?;
    Ok(timer)
}

fn transport_failure(err: impl core::fmt::Debug) -> UploadFailure {
    UploadFailure::Transport(format!("{err:?}"))
}

fn upload(request: &UploadRequest) -> Result<(), UploadFailure> {
    let http_conf = HttpClientConfiguration {
        timeout: Some(UPLOAD_IO_TIMEOUT),
        crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
        ..Default::default()
    };
    let connection = EspHttpConnection::new(&http_conf).map_err(|err| UploadFailure::Connect {
        host: request.host.clone(),
        port: request.port,
        reason: format!("{err:?}"),
    })?;
    let mut client = HttpClient::wrap(connection);

    let url = format!("https://{}:{}{}", request.host, request.port, request.path);
    let authorization = format!("Token {}", request.token);
    let content_length = request.body.len().to_string();
    let headers = [
        ("User-Agent", USER_AGENT),
        ("Connection", "close"),
        ("Authorization", authorization.as_str()),
        ("Content-Type", "text/plain; charset=utf-8"),
        ("Content-Length", content_length.as_str()),
    ];

    let mut http_request = client
        .request(Method::Post, &url, &headers)
        .map_err(transport_failure)?;
    http_request
        .write_all(request.body.as_bytes())
        .map_err(transport_failure)?;
    let response = http_request.submit().map_err(transport_failure)?;

    let status_line = format!(
        "HTTP/1.1 {} {}",
        response.status(),
        response.status_message().unwrap_or_default()
    );
    if is_success_status(&status_line) {
        info!("upload accepted by {}", request.host);
        Ok(())
    } else {
        Err(UploadFailure::Rejected(status_line))
    }
}

#[allow(clippy::too_many_arguments)]
fn run_config_mode(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    store: ConfigStore<Volume>,
    record: ConfigurationRecord,
    reason: ConfigReason,
    button: PinDriver<'static, Gpio0, Input>,
    battery: Arc<Mutex<BatteryChannel>>,
) -> anyhow::Result<()> {
    if !store.storage().is_mounted() {
        warn!("storage unavailable; submissions will not be saved");
    }

    let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;
    start_config_ap(&mut wifi)?;

    if let ConfigReason::Recovery(fault) = reason {
        warn!("configuration mode after boot fault {}", fault.as_str());
    }

    let portal: Portal = Arc::new(Mutex::new(
        MaintenancePortal::new(store, record).with_firmware_updates(),
    ));
    let _server = create_portal_server(portal.clone(), battery.clone())?;
    let _wifi = wifi;

    // The button toggles the battery read-out while the portal runs.
    let mut was_pressed = button.is_low();
    let mut last_report = Instant::now();
    loop {
        thread::sleep(BUTTON_POLL);

        let pressed = button.is_low();
        if pressed && !was_pressed {
            if let Ok(mut portal) = portal.lock() {
                let enabled = portal.toggle_battery_monitor();
                info!("battery monitor {}", if enabled { "on" } else { "off" });
            }
        }
        was_pressed = pressed;

        if last_report.elapsed() < BATTERY_MONITOR_PERIOD {
            continue;
        }
        last_report = Instant::now();

        let Some(raw) = read_battery(&battery) else {
            continue;
        };
        if let Ok(portal) = portal.lock() {
            if portal.battery_monitor_enabled() {
                let status = portal.battery_status(raw);
                info!("battery raw {} -> {}%", status.raw, status.percent);
            }
        }
    }
}

fn start_config_ap(wifi: &mut BlockingWifi<EspWifi<'static>>) -> anyhow::Result<()> {
    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: CONFIG_AP_SSID
            .try_into()
            .map_err(|_| anyhow!("configuration AP SSID too long"))?,
        password: CONFIG_AP_PASSWORD
            .try_into()
            .map_err(|_| anyhow!("configuration AP password too long"))?,
        auth_method: AuthMethod::WPAWPA2Personal,
        channel: 1,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    info!(
        "configuration AP started on `{}` (password: `{}`)",
        CONFIG_AP_SSID, CONFIG_AP_PASSWORD
    );
    Ok(())
}

fn create_portal_server(
    portal: Portal,
    battery: Arc<Mutex<BatteryChannel>>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
        req.into_response(200, Some("OK"), &[("Content-Type", "text/html; charset=utf-8")])?
            .write_all(INDEX_HTML.as_bytes())?;
        Ok(())
    })?;

    {
        let portal = portal.clone();
        let path = format!("/{PREFILL_SCRIPT_FILE}");
        server.fn_handler::<anyhow::Error, _>(&path, Method::Get, move |req| {
            let script = {
                let portal = portal.lock().map_err(|_| anyhow!("portal lock poisoned"))?;
                prefill::render(portal.record())
            };
            req.into_response(
                200,
                Some("OK"),
                &[("Content-Type", "application/javascript; charset=utf-8")],
            )?
            .write_all(script.as_bytes())?;
            Ok(())
        })?;
    }

    for path in SUBMIT_PATHS {
        let portal = portal.clone();
        server.fn_handler::<anyhow::Error, _>(path, Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let fields = parse_form(&String::from_utf8_lossy(&body));
            let submitted = portal
                .lock()
                .map_err(|_| anyhow!("portal lock poisoned"))?
                .submit(&fields);
            let outcome = match submitted {
                Ok(outcome) => outcome,
                Err(rejection) => return write_rejection(req, &rejection),
            };

            if outcome.is_success() {
                req.into_response(200, Some("OK"), &[("Content-Type", "text/html; charset=utf-8")])?
                    .write_all(SUBMIT_HTML.as_bytes())?;
            } else {
                let status = if outcome.saved.is_err() || outcome.script.is_err() {
                    500
                } else {
                    400
                };
                req.into_response(status, None, &[("Content-Type", "text/plain; charset=utf-8")])?
                    .write_all(outcome.describe().as_bytes())?;
            }
            Ok(())
        })?;
    }

    {
        let portal = portal.clone();
        server.fn_handler::<anyhow::Error, _>("/api/config", Method::Get, move |req| {
            let view = {
                let portal = portal.lock().map_err(|_| anyhow!("portal lock poisoned"))?;
                ConfigView::from(portal.record())
            };
            write_json(req, &view)
        })?;
    }

    {
        let portal = portal.clone();
        server.fn_handler::<anyhow::Error, _>("/api/battery", Method::Get, move |req| {
            let Some(raw) = read_battery(&battery) else {
                return write_error(req, 503, "battery reading unavailable");
            };
            let status = portal
                .lock()
                .map_err(|_| anyhow!("portal lock poisoned"))?
                .battery_status(raw);
            write_json(req, &status)
        })?;
    }

    {
        let portal = portal.clone();
        server.fn_handler::<anyhow::Error, _>("/api/battery/monitor", Method::Post, move |req| {
            let enabled = portal
                .lock()
                .map_err(|_| anyhow!("portal lock poisoned"))?
                .toggle_battery_monitor();
            write_json(req, &serde_json::json!({ "enabled": enabled }))
        })?;
    }

    {
        let portal = portal.clone();
        server.fn_handler::<anyhow::Error, _>("/api/ota/status", Method::Get, move |req| {
            let status = portal
                .lock()
                .map_err(|_| anyhow!("portal lock poisoned"))?
                .firmware_status()
                .clone();
            write_json(req, &status)
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/api/ota/apply", Method::Post, move |mut req| {
        let body = read_request_body(&mut req)?;
        let update: FirmwareRequest =
            serde_json::from_slice(&body).context("invalid firmware update payload")?;

        let begun = portal
            .lock()
            .map_err(|_| anyhow!("portal lock poisoned"))?
            .begin_firmware_update(&update);
        if let Err(rejection) = begun {
            return write_rejection(req, &rejection);
        }

        let worker_portal = portal.clone();
        thread::Builder::new()
            .name("firmware-update".into())
            .stack_size(16 * 1024)
            .spawn(move || {
                let result = write_firmware_image(&worker_portal, &update);
                let succeeded = result.is_ok();
                if let Ok(mut portal) = worker_portal.lock() {
                    portal.finish_firmware_update(result.map_err(|err| format!("{err:#}")));
                }
                if succeeded {
                    info!("firmware image written; restarting");
                    thread::sleep(Duration::from_millis(500));
                    unsafe { esp_idf_svc::sys::esp_restart() };
                }
            })?;

        write_json(req, &serde_json::json!({ "accepted": true, "inProgress": true }))
    })?;

    server.fn_handler::<anyhow::Error, _>("/restart", Method::Get, move |req| {
        thread::Builder::new()
            .name("restart-request".into())
            .spawn(|| {
                thread::sleep(Duration::from_millis(500));
                unsafe { esp_idf_svc::sys::esp_restart() };
            })?;

        req.into_response(200, Some("OK"), &[("Content-Type", "text/html; charset=utf-8")])?
            .write_all(RESTART_HTML.as_bytes())?;
        Ok(())
    })?;

    Ok(server)
}

/// Streams the image into the inactive OTA slot and returns its SHA-256.
fn write_firmware_image(portal: &Portal, update: &FirmwareRequest) -> anyhow::Result<String> {
    let http_conf = HttpClientConfiguration {
        timeout: Some(Duration::from_secs(30)),
        crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
        ..Default::default()
    };
    let mut client = HttpClient::wrap(EspHttpConnection::new(&http_conf)?);
    let request = client.request(Method::Get, update.url.trim(), &[])?;
    let mut response = request.submit().map_err(|e| anyhow!("{e:?}"))?;

    let status = response.status();
    if !(200..300).contains(&status) {
        return Err(anyhow!("firmware download failed with HTTP {status}"));
    }

    let content_length = response
        .header("Content-Length")
        .and_then(|value| value.parse::<u64>().ok());
    if let Ok(mut portal) = portal.lock() {
        portal.firmware_progress(0, content_length);
    }

    let mut ota = EspOta::new().map_err(|err| anyhow!("failed to acquire OTA: {err:?}"))?;
    let mut slot = ota
        .initiate_update()
        .map_err(|err| anyhow!("failed to initiate OTA update: {err:?}"))?;

    let mut hasher = Sha256::new();
    let mut total_written = 0_u64;
    let mut chunk = [0_u8; OTA_CHUNK_SIZE];

    loop {
        let read = response.read(&mut chunk).map_err(|e| anyhow!("{e:?}"))?;
        if read == 0 {
            break;
        }

        slot
            .write(&chunk[..read])
            .map_err(|err| anyhow!("failed writing OTA data: {err:?}"))?;
        hasher.update(&chunk[..read]);
        total_written = total_written.saturating_add(read as u64);

        if let Ok(mut portal) = portal.lock() {
            portal.firmware_progress(total_written, content_length);
        }
    }

    if total_written == 0 {
        return Err(anyhow!("firmware image is empty"));
    }

    let mut digest_hex = String::with_capacity(64);
    for byte in hasher.finalize() {
        use core::fmt::Write as _;
        let _ = write!(&mut digest_hex, "{byte:02x}");
    }

    if let Some(expected) = update.expected_sha256() {
        if digest_hex != expected {
            return Err(anyhow!("sha256 mismatch (expected {expected}, got {digest_hex})"));
        }
    }

    slot
        .complete()
        .map_err(|err| anyhow!("failed finalizing OTA image: {err:?}"))?;
    Ok(digest_hex)
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_rejection(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    rejection: &FirmwareRejection,
) -> anyhow::Result<()> {
    write_error(req, rejection.http_status(), &rejection.to_string())
}

fn write_error(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn deep_sleep(duration: Duration) -> ! {
    let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
    info!("deep sleep for {duration:?}");
    unsafe { esp_idf_svc::sys::esp_deep_sleep(micros) }
}

fn monotonic_ms() -> u64 {
    let micros = unsafe { esp_idf_svc::sys::esp_timer_get_time() };
    u64::try_from(micros / 1_000).unwrap_or(0)
}
